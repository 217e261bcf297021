//! Request envelope and the closed set of type tags.

use serde::{Deserialize, Serialize};
use tidemark_auth::Permission;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("incomplete envelope")]
    IncompleteEnvelope,
    #[error("invalid payload: {0}")]
    InvalidPayload(&'static str),
}

/// The outer frame of every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: String,
}

impl Envelope {
    /// Parse and validate an inbound text frame. All three fields are
    /// required and non-empty.
    pub fn parse(raw: &str) -> Result<Self, CodecError> {
        let envelope: Envelope = serde_json::from_str(raw)?;
        if envelope.id.is_empty() || envelope.kind.is_empty() || envelope.data.is_empty() {
            return Err(CodecError::IncompleteEnvelope);
        }
        Ok(envelope)
    }
}

/// Every request tag the dispatcher routes. The deprecated `auth` tag
/// is not part of this set; the dispatcher rejects it before routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// `ins`: insert one or more records.
    Insert,
    /// `qry`: latest record per document.
    QueryLatest,
    /// `cols`: list collection names.
    Collections,
    /// `qdoc`: range-scan one document.
    QueryDocument,
    /// `ddoc`: delete a document (empty collection means every collection).
    DeleteDocument,
    /// `dcol`: delete a collection.
    DeleteCollection,
    /// `drec`: delete one record.
    DeleteRecord,
    /// `dmrec`: delete many records.
    DeleteManyRecords,
    /// `drange`: delete a timestamp range of one document.
    DeleteRange,
    /// `sval`: set a key/value pair.
    SetValue,
    /// `gval`: get one value.
    GetValue,
    /// `gvals`: get values by literal key or `/regex/`.
    GetValues,
    /// `rval`: remove one value.
    RemoveValue,
    /// `gkeys`: list all keys.
    GetKeys,
    /// `keys`: manage API keys (master key only).
    ManageKeys,
    /// `conn`: list open connections.
    Connections,
}

impl MessageType {
    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "ins" => Self::Insert,
            "qry" => Self::QueryLatest,
            "cols" => Self::Collections,
            "qdoc" => Self::QueryDocument,
            "ddoc" => Self::DeleteDocument,
            "dcol" => Self::DeleteCollection,
            "drec" => Self::DeleteRecord,
            "dmrec" => Self::DeleteManyRecords,
            "drange" => Self::DeleteRange,
            "sval" => Self::SetValue,
            "gval" => Self::GetValue,
            "gvals" => Self::GetValues,
            "rval" => Self::RemoveValue,
            "gkeys" => Self::GetKeys,
            "keys" => Self::ManageKeys,
            "conn" => Self::Connections,
            _ => return None,
        })
    }

    pub fn tag(self) -> &'static str {
        match self {
            Self::Insert => "ins",
            Self::QueryLatest => "qry",
            Self::Collections => "cols",
            Self::QueryDocument => "qdoc",
            Self::DeleteDocument => "ddoc",
            Self::DeleteCollection => "dcol",
            Self::DeleteRecord => "drec",
            Self::DeleteManyRecords => "dmrec",
            Self::DeleteRange => "drange",
            Self::SetValue => "sval",
            Self::GetValue => "gval",
            Self::GetValues => "gvals",
            Self::RemoveValue => "rval",
            Self::GetKeys => "gkeys",
            Self::ManageKeys => "keys",
            Self::Connections => "conn",
        }
    }

    pub fn required_permission(self) -> Permission {
        match self {
            Self::Insert | Self::SetValue => Permission::Write,
            Self::QueryLatest
            | Self::Collections
            | Self::QueryDocument
            | Self::GetValue
            | Self::GetValues
            | Self::GetKeys
            | Self::Connections => Permission::Read,
            Self::DeleteDocument
            | Self::DeleteCollection
            | Self::DeleteRecord
            | Self::DeleteManyRecords
            | Self::DeleteRange
            | Self::RemoveValue => Permission::Delete,
            Self::ManageKeys => Permission::ManageKeys,
        }
    }
}
