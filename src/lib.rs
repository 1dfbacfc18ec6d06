//! OIDC session agent.
//!
//! Signs users in with the OpenID Connect authorization-code flow (PKCE,
//! optionally PAR), keeps their tokens in a session store behind an
//! encrypted cookie, and refreshes access tokens with a single refresh in
//! flight per session.
//!
//! # Example
//!
//! ```ignore
//! use oidc_session_agent::agent::{AgentConfig, AgentRequest, SessionAgent};
//!
//! let config = AgentConfig::load(Path::new("agent.json"))?;
//! let agent = SessionAgent::connect(config).await?;
//! let _tasks = agent.spawn_background_tasks();
//!
//! let response = agent.handle(&AgentRequest::new("GET", "/weather")).await;
//! ```

pub mod agent;
pub mod error;
pub mod flow;
pub mod oidc;
pub mod session;

#[cfg(test)]
mod testing;

pub use agent::{AgentConfig, AgentRequest, AgentResponse, DownstreamApi, SessionAgent};
pub use error::AuthError;
pub use flow::{AuthorizationFlowCoordinator, TokenRefreshManager};
pub use oidc::{ClaimSet, ClaimsProjector, OidcConfig};
pub use session::{SessionCookieCodec, TokenStore};
