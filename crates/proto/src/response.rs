//! Response frame builders.
//!
//! Larger query responses are assembled by the dispatcher; the helpers
//! here cover the envelopes every handler shares.

use serde_json::json;

/// Bare acknowledgement: `{"id": ...}`.
pub fn ok(id: &str) -> String {
    json!({ "id": id }).to_string()
}

/// In-band error: `{"id": ..., "error": ...}`.
pub fn error(id: &str, message: &str) -> String {
    json!({ "id": id, "error": message }).to_string()
}

/// Greeting sent once after a successful handshake.
pub fn ready() -> String {
    json!({ "type": "ready", "message": "Authentication successful" }).to_string()
}
