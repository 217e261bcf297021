//! Scopes and the permissions they grant.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Access level attached to an API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    #[serde(rename = "readonly")]
    ReadOnly,
    ReadWrite,
    ReadWriteDelete,
}

/// What a single request requires. `ManageKeys` is never granted by a
/// scope alone; it additionally requires the master key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Read,
    Write,
    Delete,
    ManageKeys,
}

impl Scope {
    pub fn allows(self, permission: Permission) -> bool {
        match permission {
            Permission::Read => true,
            Permission::Write => matches!(self, Self::ReadWrite | Self::ReadWriteDelete),
            Permission::Delete => matches!(self, Self::ReadWriteDelete),
            Permission::ManageKeys => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "readonly",
            Self::ReadWrite => "read_write",
            Self::ReadWriteDelete => "read_write_delete",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
