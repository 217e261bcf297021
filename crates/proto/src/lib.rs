//! tidemark-proto: the wire protocol.
//!
//! Every frame is a UTF-8 JSON text message. Requests use a fixed
//! envelope `{"id", "type", "data"}` where `data` is a stringified
//! inner payload whose schema depends on the type tag. Responses echo
//! the request id: `{"id", ...}` on success, `{"id", "error"}` on an
//! in-band failure.

pub mod envelope;
pub mod payload;
pub mod response;

pub use envelope::{CodecError, Envelope, MessageType};
pub use payload::{
    DeleteCollectionParams, DeleteDocumentParams, DeleteRangeParams, DeleteRecordParams,
    InsertItem, KeyAction, KeyValueParams, ManageKeysParams, QueryDocumentParams,
    QueryLatestParams,
};
