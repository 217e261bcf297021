//! Record format, in memory and on disk.

use serde::{Deserialize, Serialize};

/// A single timestamped record inside a document series.
///
/// `data` is an opaque UTF-8 payload; the store never inspects it.
/// `dirty` is true from insertion until a flush writes the record out.
/// It is not part of the wire or disk format, so records deserialized
/// during replay come back clean.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Record {
    /// Milliseconds since the Unix epoch. Always positive on the wire.
    pub ts: i64,
    /// Opaque payload.
    pub data: String,
    #[serde(skip)]
    pub dirty: bool,
}

impl Record {
    /// Create a freshly inserted (dirty) record.
    pub fn new(ts: i64, data: impl Into<String>) -> Self {
        Self {
            ts,
            data: data.into(),
            dirty: true,
        }
    }

    /// Create a record sourced from disk (clean).
    pub fn replayed(ts: i64, data: impl Into<String>) -> Self {
        Self {
            ts,
            data: data.into(),
            dirty: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirty_flag_excluded_from_disk_format() {
        let record = Record::new(42, "payload");
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"ts":42,"data":"payload"}"#);

        let parsed: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.ts, 42);
        assert_eq!(parsed.data, "payload");
        assert!(!parsed.dirty, "replayed records must come back clean");
    }
}
