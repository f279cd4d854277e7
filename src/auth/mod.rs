pub mod jwt;
pub mod middleware;
pub mod rate_limiter;
pub mod session;
pub mod store;
pub mod types;

pub use jwt::TokenService;
pub use middleware::AuthGate;
pub use rate_limiter::{start_cleanup, RateLimiter};
pub use session::SESSION_COOKIE;
pub use store::{CredentialStore, InMemoryCredentialStore};
pub use types::{AttemptRecord, RateLimitDecision, Role};
