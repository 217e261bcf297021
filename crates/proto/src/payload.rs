//! Inner payload schemas, one per type tag.
//!
//! Each `parse` mirrors the envelope contract: JSON decode followed by
//! semantic validation. A failure of either closes the connection at
//! the dispatch layer, so these return errors rather than defaults.

use crate::envelope::CodecError;
use serde::Deserialize;
use tidemark_auth::Scope;

/// One element of an `ins` payload (the payload itself is a JSON array).
#[derive(Debug, Clone, Deserialize)]
pub struct InsertItem {
    pub ts: i64,
    pub doc: String,
    pub col: String,
    pub data: String,
}

impl InsertItem {
    pub fn parse_list(data: &str) -> Result<Vec<Self>, CodecError> {
        let items: Vec<Self> = serde_json::from_str(data)?;
        for item in &items {
            if item.ts <= 0 {
                return Err(CodecError::InvalidPayload("ts must be positive"));
            }
            if item.doc.is_empty() || item.col.is_empty() || item.data.is_empty() {
                return Err(CodecError::InvalidPayload("doc, col and data are required"));
            }
        }
        Ok(items)
    }
}

/// `qry`: latest record per document at a pivot timestamp.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryLatestParams {
    pub col: String,
    pub ts: i64,
    /// Document selector: empty for all, `/regex/` for a pattern,
    /// anything else for a literal id.
    #[serde(default)]
    pub doc: String,
    /// Drop results older than this (0 disables the gate).
    #[serde(default)]
    pub from: i64,
}

impl QueryLatestParams {
    pub fn parse(data: &str) -> Result<Self, CodecError> {
        let params: Self = serde_json::from_str(data)?;
        if params.ts <= 0 {
            return Err(CodecError::InvalidPayload("ts must be positive"));
        }
        if params.col.is_empty() {
            return Err(CodecError::InvalidPayload("col is required"));
        }
        Ok(params)
    }
}

/// `qdoc`: inclusive range scan over one document.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryDocumentParams {
    pub col: String,
    pub doc: String,
    pub from: i64,
    pub to: i64,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub reverse: bool,
}

impl QueryDocumentParams {
    pub fn parse(data: &str) -> Result<Self, CodecError> {
        let params: Self = serde_json::from_str(data)?;
        if params.col.is_empty() || params.doc.is_empty() {
            return Err(CodecError::InvalidPayload("col and doc are required"));
        }
        if params.from > params.to {
            return Err(CodecError::InvalidPayload("from must not exceed to"));
        }
        Ok(params)
    }
}

/// `ddoc`: delete one document; an empty `col` walks every collection.
#[derive(Debug, Clone, Deserialize)]
pub struct DeleteDocumentParams {
    pub doc: String,
    #[serde(default)]
    pub col: String,
}

impl DeleteDocumentParams {
    pub fn parse(data: &str) -> Result<Self, CodecError> {
        let params: Self = serde_json::from_str(data)?;
        if params.doc.is_empty() {
            return Err(CodecError::InvalidPayload("doc is required"));
        }
        Ok(params)
    }
}

/// `dcol`: delete a whole collection.
#[derive(Debug, Clone, Deserialize)]
pub struct DeleteCollectionParams {
    pub col: String,
}

impl DeleteCollectionParams {
    pub fn parse(data: &str) -> Result<Self, CodecError> {
        let params: Self = serde_json::from_str(data)?;
        if params.col.is_empty() {
            return Err(CodecError::InvalidPayload("col is required"));
        }
        Ok(params)
    }
}

/// `drec`: delete one record; also the element type of `dmrec` arrays.
#[derive(Debug, Clone, Deserialize)]
pub struct DeleteRecordParams {
    pub doc: String,
    pub col: String,
    pub ts: i64,
}

impl DeleteRecordParams {
    pub fn parse(data: &str) -> Result<Self, CodecError> {
        let params: Self = serde_json::from_str(data)?;
        params.validate()?;
        Ok(params)
    }

    pub fn parse_list(data: &str) -> Result<Vec<Self>, CodecError> {
        let items: Vec<Self> = serde_json::from_str(data)?;
        for item in &items {
            item.validate()?;
        }
        Ok(items)
    }

    fn validate(&self) -> Result<(), CodecError> {
        if self.doc.is_empty() || self.col.is_empty() {
            return Err(CodecError::InvalidPayload("doc and col are required"));
        }
        if self.ts <= 0 {
            return Err(CodecError::InvalidPayload("ts must be positive"));
        }
        Ok(())
    }
}

/// `drange`: delete an inclusive timestamp range of one document.
#[derive(Debug, Clone, Deserialize)]
pub struct DeleteRangeParams {
    pub doc: String,
    pub col: String,
    #[serde(rename = "fromTs")]
    pub from_ts: i64,
    #[serde(rename = "toTs")]
    pub to_ts: i64,
}

impl DeleteRangeParams {
    pub fn parse(data: &str) -> Result<Self, CodecError> {
        let params: Self = serde_json::from_str(data)?;
        if params.doc.is_empty() || params.col.is_empty() {
            return Err(CodecError::InvalidPayload("doc and col are required"));
        }
        if params.from_ts <= 0 || params.to_ts <= 0 {
            return Err(CodecError::InvalidPayload("timestamps must be positive"));
        }
        if params.from_ts > params.to_ts {
            return Err(CodecError::InvalidPayload("fromTs must not exceed toTs"));
        }
        Ok(params)
    }
}

/// Shared shape of the key/value tags (`sval`, `gval`, `gvals`, `rval`,
/// `gkeys`). Which fields are required varies by tag, so the caller
/// states its needs via `require_key` / `require_value`.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyValueParams {
    pub col: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: String,
}

impl KeyValueParams {
    pub fn parse(data: &str, require_key: bool, require_value: bool) -> Result<Self, CodecError> {
        let params: Self = serde_json::from_str(data)?;
        if params.col.is_empty() {
            return Err(CodecError::InvalidPayload("col is required"));
        }
        if require_key && params.key.is_empty() {
            return Err(CodecError::InvalidPayload("key is required"));
        }
        if require_value && params.value.is_empty() {
            return Err(CodecError::InvalidPayload("value is required"));
        }
        Ok(params)
    }
}

/// Action of a `keys` management request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAction {
    Add,
    Remove,
}

/// `keys`: add or remove an API key. Only `add` carries a scope.
#[derive(Debug, Clone, Deserialize)]
pub struct ManageKeysParams {
    pub action: KeyAction,
    pub key: String,
    #[serde(default)]
    pub scope: Option<Scope>,
}

impl ManageKeysParams {
    pub fn parse(data: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(data)?)
    }
}
