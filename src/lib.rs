/// Homestead auth - identity and entitlement core for the Homestead marketplace
///
/// Accounts, credentials, refresh sessions, brute-force defenses and the
/// agent trial lifecycle, served over a small JSON HTTP API.

pub mod account;
pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod context;
pub mod credentials;
pub mod crypto;
pub mod db;
pub mod error;
pub mod jobs;
pub mod lockout;
pub mod mailer;
pub mod metrics;
pub mod rate_limit;
pub mod server;
pub mod sessions;
pub mod tokens;
pub mod trial;

pub use config::ServerConfig;
pub use context::AppContext;
pub use error::{IdentityError, IdentityResult};
