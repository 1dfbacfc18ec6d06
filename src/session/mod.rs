//! Session state: token records, their stores and the session cookie.
//!
//! Token records live in a `TokenStore` keyed by session id (in memory or
//! in redb). The browser only holds an encrypted cookie naming the session,
//! optionally carrying the record itself.

pub mod cleanup;
pub mod cookie;
pub mod persistent;
pub mod store;
pub mod types;

pub use cleanup::{spawn_cleanup_task, DEFAULT_CLEANUP_INTERVAL_SECS};
pub use cookie::{CookieConfig, CookieConfigJson, SessionCookieCodec};
pub use persistent::RedbTokenStore;
pub use store::{MemoryTokenStore, TokenStore};
pub use types::{Session, SessionId, TokenRecord};
