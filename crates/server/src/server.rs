//! WebSocket listener and connection lifecycle.
//!
//! Clients connect to `ws://host:port/?api-key=KEY`. The key is checked
//! against the registry during the handshake; a missing or unknown key
//! closes the socket with a policy-violation frame. Authenticated
//! connections get one `ready` greeting, then every text frame runs
//! through the dispatcher under the shared state lock.

use crate::dispatcher::{dispatch, DispatchOutcome, ServerState};
use crate::session::Session;
use crate::ServerError;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tidemark_config::ServerConfig;

pub type SharedState = Arc<Mutex<ServerState>>;

/// The tidemark server: owns the collection map and the key registry
/// (via `ServerState`), accepts WebSocket connections and drives the
/// flush ticker.
pub struct Server {
    config: ServerConfig,
    state: SharedState,
}

impl Server {
    /// Build a server: install the master key, then replay any
    /// persisted state from the data folder.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let mut state = ServerState::new(&config.secret_key, config.data_dir.clone())?;
        match &config.data_dir {
            Some(dir) => {
                tracing::info!("running in persistent mode, data folder {}", dir.display());
                tracing::info!("flush interval set to {} seconds", config.flush_interval_secs);
                state.load_from_disk();
            }
            None => {
                tracing::info!("running in non-persistent mode (no data folder specified)");
            }
        }
        Ok(Self {
            config,
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Handle to the shared state, for the final flush at shutdown and
    /// for tests.
    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    /// Bind the listener and serve until the task is cancelled.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        tracing::info!("WebSocket server listening on port {}", self.config.port);

        if self.config.data_dir.is_some() {
            self.spawn_flush_ticker();
        }

        loop {
            let (stream, addr) = listener.accept().await?;
            let state = self.state.clone();
            tokio::spawn(async move {
                handle_connection(state, stream, addr).await;
            });
        }
    }

    fn spawn_flush_ticker(&self) {
        let state = self.state.clone();
        let period = std::time::Duration::from_secs(self.config.flush_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so the initial
            // flush happens one full interval after startup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                state.lock().await.flush_all();
            }
        });
    }
}

/// Drive one client connection from handshake to disconnect.
async fn handle_connection(state: SharedState, stream: TcpStream, addr: SocketAddr) {
    let m = tidemark_metrics::metrics();

    let mut request_uri = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        request_uri = Some(request.uri().clone());
        Ok(response)
    };
    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!("handshake with {} failed: {}", addr, e);
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();

    let api_key = request_uri
        .as_ref()
        .and_then(|uri| uri.query())
        .and_then(extract_api_key);

    let Some(api_key) = api_key else {
        m.auth_rejections.inc();
        tracing::warn!("connection from {} without an API key", addr);
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: "Missing API key parameter".into(),
            })))
            .await;
        return;
    };

    let scope = state.lock().await.registry.scope_of(&api_key);
    let Some(scope) = scope else {
        m.auth_rejections.inc();
        tracing::warn!("connection from {} with an unknown API key", addr);
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: "Unknown API key".into(),
            })))
            .await;
        return;
    };

    let session = Session::new(api_key, scope, addr);
    let session_id = session.id;
    state.lock().await.add_session(session);
    m.connections_total.inc();
    m.active_sessions.inc();
    tracing::info!("client connected: {} id {} scope {}", addr, session_id, scope);

    if sink
        .send(Message::text(tidemark_proto::response::ready()))
        .await
        .is_err()
    {
        state.lock().await.remove_session(&session_id);
        m.active_sessions.dec();
        return;
    }

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let outcome = {
                    let mut st = state.lock().await;
                    dispatch(&mut st, session_id, text.as_str())
                };
                match outcome {
                    DispatchOutcome::Reply(reply) => {
                        if sink.send(Message::text(reply)).await.is_err() {
                            break;
                        }
                    }
                    DispatchOutcome::Close(reply) => {
                        if let Some(reply) = reply {
                            let _ = sink.send(Message::text(reply)).await;
                        }
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            Ok(Message::Ping(payload)) => {
                if sink.send(Message::Pong(payload)).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::debug!("websocket error from {}: {}", addr, e);
                break;
            }
            _ => {}
        }
    }

    state.lock().await.remove_session(&session_id);
    m.active_sessions.dec();
    tracing::info!("client disconnected: {} id {}", addr, session_id);
}

/// Pull `api-key` out of the percent-encoded query string.
fn extract_api_key(query: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "api-key")
        .map(|(_, value)| value.into_owned())
}
