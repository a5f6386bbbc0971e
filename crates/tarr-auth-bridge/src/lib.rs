//! Credential handling for Microsoft Graph.
//!
//! This crate provides:
//! - `CredentialStore`, an explicit load/save handle on the on-disk token cache
//! - `CredentialBroker`, which hands out bearer tokens via silent reuse,
//!   the refresh-token grant or an interactive device-code grant
//! - `TokenSource`, the seam the HTTP layer uses to obtain and refresh tokens
//!
//! The access token only ever lives in memory. The cache file holds the
//! refresh token and the tenant/client binding it was issued for.

mod broker;
mod store;

use std::path::PathBuf;

use async_trait::async_trait;

pub use broker::{
    BrokerSettings, CredentialBroker, DeviceCodeNotifier, DevicePrompt, StderrNotifier,
    DEFAULT_AUTHORITY_HOST,
};
pub use store::{CredentialStore, TokenCache, CACHE_VERSION};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("device code flow could not be started: {0}")]
    DeviceFlowStart(String),

    #[error("device code grant failed: {0}")]
    DeviceGrant(String),

    #[error("no access token in authorization result")]
    MissingAccessToken,

    #[error("invalid authority configuration: {0}")]
    Config(String),

    #[error("credential cache {}: {source}", path.display())]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("credential cache {} could not be encoded: {source}", path.display())]
    CacheFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Source of bearer tokens for authenticated requests.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Current bearer token, acquiring one if needed.
    async fn token(&self) -> Result<String, AuthError>;

    /// Discard the current token and obtain a new one.
    ///
    /// Called after the API rejected a token with 401.
    async fn refresh(&self) -> Result<String, AuthError>;
}
