#![doc = include_str!("../README.md")]

pub mod client;
pub mod config;
pub mod error;
pub mod guard;
#[cfg(feature = "relay")]
pub mod relay;
pub mod session;
pub mod store;
pub mod types;

// Re-exports for convenient access
pub use client::{AuthApi, AuthClient, AuthConfig};
pub use config::Settings;
pub use error::{Error, ErrorKind};
pub use guard::{Decision, Route, RouteGuard};
#[cfg(feature = "relay")]
pub use relay::{Attachment, FieldReport, RelayClient, RelayConfig};
pub use session::{SessionController, SessionState};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};
pub use types::{
    AccessToken, Credentials, PasswordChange, Profile, RefreshToken, RefreshedToken,
    Registration, SessionRecord, TokenPair,
};
