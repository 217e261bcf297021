//! tidemark-server: the WebSocket front end.
//!
//! Provides:
//! - `Session`: one authenticated connection
//! - `ServerState` + `dispatch`: routing, scope gating and store access
//! - `Server`: listener, handshake authentication, flush ticker
//!
//! All state mutation happens behind one async mutex, so every request
//! observes the effects of every previously dispatched request.

pub mod dispatcher;
pub mod server;
pub mod session;

pub use dispatcher::{dispatch, DispatchOutcome, ServerState};
pub use server::{Server, SharedState};
pub use session::Session;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry error: {0}")]
    Registry(#[from] tidemark_auth::RegistryError),
}
