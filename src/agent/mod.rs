//! The session agent: maps proxied requests onto the login flow, the
//! session cookie and token refresh.

pub mod config;
pub mod downstream;
pub mod handler;
pub mod protocol;

pub use config::{AgentConfig, AgentConfigJson, StoreConfig};
pub use downstream::DownstreamApi;
pub use handler::{open_store, SessionAgent};
pub use protocol::{AgentRequest, AgentResponse, AuditMetadata, Decision, HeaderOp};
