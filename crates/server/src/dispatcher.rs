//! Request routing: scope gating plus store access.
//!
//! The server hands every inbound text frame to [`dispatch`] together
//! with the session that produced it. Outcomes:
//!
//! - malformed envelope: write an empty frame, close
//! - malformed payload / unknown type: close (unknown types get an
//!   error envelope first)
//! - insufficient scope: in-band `{id, error: "permission denied"}`,
//!   connection stays open
//! - everything else: a response envelope echoing the request id
//!
//! Missing collections are not errors: reads return empty results,
//! deletes succeed silently and writes create the collection.

use crate::session::Session;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use tidemark_auth::{ApiKeyRegistry, Permission, RegistryError};
use tidemark_proto::envelope::{Envelope, MessageType};
use tidemark_proto::payload::{
    DeleteCollectionParams, DeleteDocumentParams, DeleteRangeParams, DeleteRecordParams,
    InsertItem, KeyAction, KeyValueParams, ManageKeysParams, QueryDocumentParams,
    QueryLatestParams,
};
use tidemark_proto::response;
use tidemark_storage::{Collection, KeyFilter};
use uuid::Uuid;

/// What the connection task should do with the dispatch result.
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Send the frame and keep the connection open.
    Reply(String),
    /// Close the connection, optionally writing a final frame first.
    Close(Option<String>),
}

/// Everything the dispatcher mutates. The server owns exactly one of
/// these behind a mutex; collections never outlive it.
#[derive(Debug)]
pub struct ServerState {
    data_dir: Option<PathBuf>,
    collections: BTreeMap<String, Collection>,
    pub registry: ApiKeyRegistry,
    sessions: HashMap<Uuid, Session>,
}

/// Subdirectory of the data folder reserved for the key registry;
/// never treated as a collection during startup scans.
const CONFIG_DIR: &str = "config";

impl ServerState {
    pub fn new(master_key: &str, data_dir: Option<PathBuf>) -> Result<Self, RegistryError> {
        let registry =
            ApiKeyRegistry::new(master_key, data_dir.as_ref().map(|d| d.join(CONFIG_DIR)))?;
        Ok(Self {
            data_dir,
            collections: BTreeMap::new(),
            registry,
            sessions: HashMap::new(),
        })
    }

    /// Rebuild state from the data folder: the key registry first, then
    /// one collection per subdirectory.
    pub fn load_from_disk(&mut self) {
        self.registry.load();
        let Some(data_dir) = self.data_dir.clone() else {
            return;
        };
        let Ok(entries) = fs::read_dir(&data_dir) else {
            return;
        };
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name == CONFIG_DIR {
                continue;
            }
            let mut collection = Collection::new(&name, Some(data_dir.clone()));
            collection.load_from_disk();
            self.collections.insert(name, collection);
        }
        tracing::info!("loaded {} collection(s) from disk", self.collections.len());
    }

    /// Flush every collection and the key registry. Individual failures
    /// are logged by the owners and retried next time.
    pub fn flush_all(&mut self) {
        let _timer = tidemark_metrics::start_flush_timer();
        for collection in self.collections.values_mut() {
            collection.flush_to_disk();
        }
        self.registry.flush();
        tidemark_metrics::metrics().flush_runs.inc();
    }

    pub fn add_session(&mut self, session: Session) {
        self.sessions.insert(session.id, session);
    }

    pub fn remove_session(&mut self, id: &Uuid) {
        self.sessions.remove(id);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }

    pub fn collection(&self, name: &str) -> Option<&Collection> {
        self.collections.get(name)
    }

    /// Get or create a collection (writes create on demand).
    fn collection_mut(&mut self, name: &str) -> &mut Collection {
        let data_dir = self.data_dir.clone();
        self.collections
            .entry(name.to_string())
            .or_insert_with(|| Collection::new(name, data_dir))
    }

    /// Drop a collection from memory and disk if the last delete left
    /// it without documents and key/values.
    fn drop_if_empty(&mut self, name: &str) {
        let empty = self.collections.get(name).is_some_and(Collection::is_empty);
        if empty {
            if let Some(collection) = self.collections.remove(name) {
                tracing::info!("collection {} removed: nothing left in it", name);
                collection.purge_disk();
            }
        }
    }
}

/// Route one inbound frame for the given session.
pub fn dispatch(state: &mut ServerState, session_id: Uuid, raw: &str) -> DispatchOutcome {
    let m = tidemark_metrics::metrics();
    m.requests_received.inc();

    let envelope = match Envelope::parse(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            m.malformed_frames.inc();
            tracing::warn!("invalid message: {}", e);
            return DispatchOutcome::Close(Some(String::new()));
        }
    };

    // Relic of an older protocol revision; the credential travels in
    // the connection URL now.
    if envelope.kind == "auth" {
        return DispatchOutcome::Reply(response::error(
            &envelope.id,
            "authentication is handshake-only; pass api-key in the connection URL",
        ));
    }

    let Some(kind) = MessageType::from_tag(&envelope.kind) else {
        tracing::warn!("unknown message type: {}", envelope.kind);
        return DispatchOutcome::Close(Some(response::error(&envelope.id, "unknown message type")));
    };
    m.requests_by_type.with_label_values(&[kind.tag()]).inc();

    // Re-resolve the scope against the live registry so re-registered
    // keys take effect immediately and revoked keys end the session.
    let Some(api_key) = state.sessions.get(&session_id).map(|s| s.api_key.clone()) else {
        tracing::warn!("frame from untracked session {}", session_id);
        return DispatchOutcome::Close(None);
    };
    let Some(scope) = state.registry.scope_of(&api_key) else {
        tracing::warn!("API key of session {} is no longer registered", session_id);
        return DispatchOutcome::Close(None);
    };
    if let Some(session) = state.sessions.get_mut(&session_id) {
        session.scope = scope;
    }

    let permission = kind.required_permission();
    let allowed = if permission == Permission::ManageKeys {
        state.registry.is_master(&api_key)
    } else {
        scope.allows(permission)
    };
    if !allowed {
        m.permission_denials.inc();
        return DispatchOutcome::Reply(response::error(&envelope.id, "permission denied"));
    }

    match kind {
        MessageType::Insert => handle_insert(state, &envelope),
        MessageType::QueryLatest => handle_query_latest(state, &envelope),
        MessageType::Collections => handle_collections(state, &envelope),
        MessageType::QueryDocument => handle_query_document(state, &envelope),
        MessageType::DeleteDocument => handle_delete_document(state, &envelope),
        MessageType::DeleteCollection => handle_delete_collection(state, &envelope),
        MessageType::DeleteRecord => handle_delete_record(state, &envelope),
        MessageType::DeleteManyRecords => handle_delete_many_records(state, &envelope),
        MessageType::DeleteRange => handle_delete_range(state, &envelope),
        MessageType::SetValue => handle_set_value(state, &envelope),
        MessageType::GetValue => handle_get_value(state, &envelope),
        MessageType::GetValues => handle_get_values(state, &envelope),
        MessageType::RemoveValue => handle_remove_value(state, &envelope),
        MessageType::GetKeys => handle_get_keys(state, &envelope),
        MessageType::ManageKeys => handle_manage_keys(state, &envelope),
        MessageType::Connections => handle_connections(state, session_id, &envelope),
    }
}

/// A payload that fails schema validation ends the connection.
fn close_malformed(kind: MessageType, error: impl std::fmt::Display) -> DispatchOutcome {
    tidemark_metrics::metrics().malformed_frames.inc();
    tracing::warn!("invalid {} payload: {}", kind.tag(), error);
    DispatchOutcome::Close(None)
}

// ---------------------------------------------------------------------------
// Record store handlers
// ---------------------------------------------------------------------------

fn handle_insert(state: &mut ServerState, envelope: &Envelope) -> DispatchOutcome {
    let items = match InsertItem::parse_list(&envelope.data) {
        Ok(items) => items,
        Err(e) => return close_malformed(MessageType::Insert, e),
    };
    let count = items.len() as u64;
    for item in items {
        state
            .collection_mut(&item.col)
            .insert(&item.doc, item.ts, &item.data);
    }
    tidemark_metrics::metrics().records_inserted.inc_by(count);
    DispatchOutcome::Reply(response::ok(&envelope.id))
}

fn handle_query_latest(state: &mut ServerState, envelope: &Envelope) -> DispatchOutcome {
    let params = match QueryLatestParams::parse(&envelope.data) {
        Ok(params) => params,
        Err(e) => return close_malformed(MessageType::QueryLatest, e),
    };
    let records = match state.collection(&params.col) {
        Some(collection) => {
            collection.all_latest(params.ts, &KeyFilter::parse(&params.doc), params.from)
        }
        None => BTreeMap::new(),
    };
    DispatchOutcome::Reply(json!({ "id": envelope.id, "records": records }).to_string())
}

fn handle_collections(state: &mut ServerState, envelope: &Envelope) -> DispatchOutcome {
    DispatchOutcome::Reply(
        json!({ "id": envelope.id, "collections": state.collection_names() }).to_string(),
    )
}

fn handle_query_document(state: &mut ServerState, envelope: &Envelope) -> DispatchOutcome {
    let params = match QueryDocumentParams::parse(&envelope.data) {
        Ok(params) => params,
        Err(e) => return close_malformed(MessageType::QueryDocument, e),
    };
    let records = match state.collection(&params.col) {
        Some(collection) => collection.document_range(
            &params.doc,
            params.from,
            params.to,
            params.reverse,
            params.limit,
        ),
        None => Vec::new(),
    };
    DispatchOutcome::Reply(json!({ "id": envelope.id, "records": records }).to_string())
}

// ---------------------------------------------------------------------------
// Delete handlers
// ---------------------------------------------------------------------------

fn handle_delete_document(state: &mut ServerState, envelope: &Envelope) -> DispatchOutcome {
    let params = match DeleteDocumentParams::parse(&envelope.data) {
        Ok(params) => params,
        Err(e) => return close_malformed(MessageType::DeleteDocument, e),
    };

    if params.col.is_empty() {
        // Clear the document in every collection, then drop the ones
        // left with nothing.
        let names = state.collection_names();
        for name in names {
            if let Some(collection) = state.collections.get_mut(&name) {
                collection.clear_document(&params.doc);
            }
            state.drop_if_empty(&name);
        }
    } else if let Some(collection) = state.collections.get_mut(&params.col) {
        collection.clear_document(&params.doc);
        state.drop_if_empty(&params.col);
    }
    DispatchOutcome::Reply(response::ok(&envelope.id))
}

fn handle_delete_collection(state: &mut ServerState, envelope: &Envelope) -> DispatchOutcome {
    let params = match DeleteCollectionParams::parse(&envelope.data) {
        Ok(params) => params,
        Err(e) => return close_malformed(MessageType::DeleteCollection, e),
    };
    if let Some(collection) = state.collections.remove(&params.col) {
        tracing::info!("collection {} removed by request", params.col);
        collection.purge_disk();
    }
    DispatchOutcome::Reply(response::ok(&envelope.id))
}

fn handle_delete_record(state: &mut ServerState, envelope: &Envelope) -> DispatchOutcome {
    let params = match DeleteRecordParams::parse(&envelope.data) {
        Ok(params) => params,
        Err(e) => return close_malformed(MessageType::DeleteRecord, e),
    };
    if let Some(collection) = state.collections.get_mut(&params.col) {
        collection.delete_record(&params.doc, params.ts);
    }
    DispatchOutcome::Reply(response::ok(&envelope.id))
}

fn handle_delete_many_records(state: &mut ServerState, envelope: &Envelope) -> DispatchOutcome {
    let items = match DeleteRecordParams::parse_list(&envelope.data) {
        Ok(items) => items,
        Err(e) => return close_malformed(MessageType::DeleteManyRecords, e),
    };
    for item in items {
        if let Some(collection) = state.collections.get_mut(&item.col) {
            collection.delete_record(&item.doc, item.ts);
        }
    }
    DispatchOutcome::Reply(response::ok(&envelope.id))
}

fn handle_delete_range(state: &mut ServerState, envelope: &Envelope) -> DispatchOutcome {
    let params = match DeleteRangeParams::parse(&envelope.data) {
        Ok(params) => params,
        Err(e) => return close_malformed(MessageType::DeleteRange, e),
    };
    if let Some(collection) = state.collections.get_mut(&params.col) {
        collection.delete_range(&params.doc, params.from_ts, params.to_ts);
    }
    DispatchOutcome::Reply(response::ok(&envelope.id))
}

// ---------------------------------------------------------------------------
// Key/value handlers
// ---------------------------------------------------------------------------

fn handle_set_value(state: &mut ServerState, envelope: &Envelope) -> DispatchOutcome {
    let params = match KeyValueParams::parse(&envelope.data, true, true) {
        Ok(params) => params,
        Err(e) => return close_malformed(MessageType::SetValue, e),
    };
    state
        .collection_mut(&params.col)
        .set_value(&params.key, &params.value);
    DispatchOutcome::Reply(response::ok(&envelope.id))
}

fn handle_get_value(state: &mut ServerState, envelope: &Envelope) -> DispatchOutcome {
    let params = match KeyValueParams::parse(&envelope.data, true, false) {
        Ok(params) => params,
        Err(e) => return close_malformed(MessageType::GetValue, e),
    };
    let value = state
        .collection(&params.col)
        .and_then(|collection| collection.get_value(&params.key))
        .unwrap_or("");
    DispatchOutcome::Reply(json!({ "id": envelope.id, "value": value }).to_string())
}

fn handle_get_values(state: &mut ServerState, envelope: &Envelope) -> DispatchOutcome {
    let params = match KeyValueParams::parse(&envelope.data, false, false) {
        Ok(params) => params,
        Err(e) => return close_malformed(MessageType::GetValues, e),
    };
    let values = match state.collection(&params.col) {
        Some(collection) => collection.all_values(&KeyFilter::parse(&params.key)),
        None => BTreeMap::new(),
    };
    DispatchOutcome::Reply(json!({ "id": envelope.id, "values": values }).to_string())
}

fn handle_remove_value(state: &mut ServerState, envelope: &Envelope) -> DispatchOutcome {
    let params = match KeyValueParams::parse(&envelope.data, true, false) {
        Ok(params) => params,
        Err(e) => return close_malformed(MessageType::RemoveValue, e),
    };
    if let Some(collection) = state.collections.get_mut(&params.col) {
        collection.remove_value(&params.key);
    }
    DispatchOutcome::Reply(response::ok(&envelope.id))
}

fn handle_get_keys(state: &mut ServerState, envelope: &Envelope) -> DispatchOutcome {
    let params = match KeyValueParams::parse(&envelope.data, false, false) {
        Ok(params) => params,
        Err(e) => return close_malformed(MessageType::GetKeys, e),
    };
    let keys = state
        .collection(&params.col)
        .map(Collection::all_keys)
        .unwrap_or_default();
    DispatchOutcome::Reply(json!({ "id": envelope.id, "keys": keys }).to_string())
}

// ---------------------------------------------------------------------------
// Management handlers
// ---------------------------------------------------------------------------

fn handle_manage_keys(state: &mut ServerState, envelope: &Envelope) -> DispatchOutcome {
    let params = match ManageKeysParams::parse(&envelope.data) {
        Ok(params) => params,
        Err(e) => return close_malformed(MessageType::ManageKeys, e),
    };

    match params.action {
        KeyAction::Add => {
            let Some(scope) = params.scope else {
                return DispatchOutcome::Reply(response::error(
                    &envelope.id,
                    "scope is required for add",
                ));
            };
            match state.registry.register(&params.key, scope, true) {
                Ok(stored) => {
                    // Live sessions on this key pick up the new scope.
                    for session in state.sessions.values_mut() {
                        if session.api_key == params.key {
                            session.scope = stored;
                        }
                    }
                    tracing::info!("API key registered with scope {}", stored);
                    DispatchOutcome::Reply(
                        json!({ "id": envelope.id, "status": "ok", "scope": stored.as_str() })
                            .to_string(),
                    )
                }
                Err(e) => DispatchOutcome::Reply(response::error(&envelope.id, &e.to_string())),
            }
        }
        KeyAction::Remove => match state.registry.remove(&params.key) {
            Ok(()) => {
                tracing::info!("API key removed");
                DispatchOutcome::Reply(json!({ "id": envelope.id, "status": "ok" }).to_string())
            }
            Err(e) => DispatchOutcome::Reply(response::error(&envelope.id, &e.to_string())),
        },
    }
}

fn handle_connections(
    state: &mut ServerState,
    session_id: Uuid,
    envelope: &Envelope,
) -> DispatchOutcome {
    let mut sessions: Vec<&Session> = state.sessions.values().collect();
    sessions.sort_by_key(|s| (s.connected_at_ms, s.id));
    let connections: Vec<serde_json::Value> = sessions
        .into_iter()
        .map(|session| {
            json!({
                "ip": session.addr.ip().to_string(),
                "since": session.connected_at_ms,
                "self": session.id == session_id,
                "name": serde_json::Value::Null,
            })
        })
        .collect();
    DispatchOutcome::Reply(json!({ "id": envelope.id, "connections": connections }).to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
