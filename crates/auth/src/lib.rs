//! tidemark-auth: scoped API keys.
//!
//! The registry holds every key the server accepts, keyed by the raw
//! key string. The master key (supplied at startup) is always present
//! with full scope, can never be deleted, and is never written to the
//! persisted key file.

pub mod registry;
pub mod scope;

pub use registry::{ApiKeyEntry, ApiKeyRegistry, RegistryError};
pub use scope::{Permission, Scope};
