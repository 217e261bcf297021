//! Per-connection session state.

use std::net::SocketAddr;
use tidemark_auth::Scope;
use tidemark_storage::now_ms;
use uuid::Uuid;

/// One open, authenticated client connection. The scope is resolved at
/// handshake time and refreshed by the dispatcher whenever the key is
/// re-registered.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub api_key: String,
    pub scope: Scope,
    pub addr: SocketAddr,
    pub connected_at_ms: i64,
}

impl Session {
    pub fn new(api_key: impl Into<String>, scope: Scope, addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            api_key: api_key.into(),
            scope,
            addr,
            connected_at_ms: now_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let a = Session::new("k", Scope::ReadOnly, addr);
        let b = Session::new("k", Scope::ReadOnly, addr);
        assert_ne!(a.id, b.id);
        assert!(a.connected_at_ms > 0);
    }
}
