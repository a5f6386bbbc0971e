//! Token cache persistence with restrictive file permissions.
//!
//! The cache is written to a temp file created with 0600 permissions and
//! renamed over the previous file, so a crash never leaves a half-written
//! cache behind. There is no cross-process locking: one cache path per
//! running process.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::AuthError;

pub const CACHE_VERSION: u32 = 1;

/// Serialized credential state. Never contains an access token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCache {
    #[serde(default)]
    pub version: u32,
    pub tenant_id: String,
    pub client_id: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl TokenCache {
    pub fn new(tenant_id: &str, client_id: &str) -> Self {
        Self {
            version: CACHE_VERSION,
            tenant_id: tenant_id.to_string(),
            client_id: client_id.to_string(),
            ..Self::default()
        }
    }

    /// Whether this cache was issued for the given tenant and client.
    pub fn is_bound_to(&self, tenant_id: &str, client_id: &str) -> bool {
        self.tenant_id == tenant_id && self.client_id == client_id
    }
}

#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the cache file.
    ///
    /// A missing file is `None`. A file that cannot be parsed is logged and
    /// treated as missing so a fresh device-code login can replace it.
    pub fn load(&self) -> Result<Option<TokenCache>, AuthError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(AuthError::Store {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        match serde_json::from_str::<TokenCache>(&contents) {
            Ok(cache) => {
                debug!(path = %self.path.display(), "loaded credential cache");
                Ok(Some(cache))
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "ignoring unreadable credential cache");
                Ok(None)
            }
        }
    }

    /// Atomically replace the cache file.
    pub fn save(&self, cache: &TokenCache) -> Result<(), AuthError> {
        let json = serde_json::to_string_pretty(cache).map_err(|source| AuthError::CacheFormat {
            path: self.path.clone(),
            source,
        })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            ensure_private_dir(parent).map_err(|source| self.io_error(source))?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        write_private(&tmp_path, json.as_bytes()).map_err(|source| self.io_error(source))?;
        fs::rename(&tmp_path, &self.path).map_err(|source| self.io_error(source))?;

        debug!(path = %self.path.display(), "saved credential cache");
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> AuthError {
        AuthError::Store {
            path: self.path.clone(),
            source,
        }
    }
}

fn ensure_private_dir(dir: &Path) -> std::io::Result<()> {
    if dir.exists() {
        return Ok(());
    }
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
