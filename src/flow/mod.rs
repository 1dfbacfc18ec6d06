//! Login flow and token refresh.

pub mod coordinator;
pub mod events;
pub mod guard;
pub mod pending;
pub mod refresh;

pub use coordinator::{
    sanitize_return_url, AuthorizationFlowCoordinator, CallbackParams, LoginOutcome,
    LoginRedirect, LogoutOutcome,
};
pub use events::{NoopEvents, SessionEvents};
pub use guard::SessionGuard;
pub use pending::{PendingAuth, PendingAuthStore};
pub use refresh::{AccessToken, RefreshPolicy, TokenRefreshManager, ValidTokens};
