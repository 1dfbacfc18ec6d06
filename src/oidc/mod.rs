//! OpenID Connect relying-party building blocks.
//!
//! Provider discovery, JWKS caching with key rotation, id_token validation,
//! PKCE, the back-channel provider client and claims projection.

pub mod claims;
pub mod client;
pub mod config;
pub mod discovery;
pub mod jwks;
pub mod pkce;
pub mod validator;

pub use claims::{ClaimSet, ClaimsProjector};
pub use client::{HttpProviderClient, ProviderClient, TokenResponse};
pub use config::{OidcConfig, OidcConfigJson, PushedAuthorization};
pub use discovery::ProviderMetadata;
pub use jwks::{spawn_jwks_refresh_task, JwksCache};
pub use validator::{IdTokenClaims, IdTokenValidator};
