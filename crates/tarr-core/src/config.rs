//! `config.toml` plus `TARR_*` environment overrides.
//!
//! Every section is optional; a missing file gives the defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tarr_auth_bridge::{BrokerSettings, DEFAULT_AUTHORITY_HOST};
use url::Url;

use crate::error::ConfigError;
use crate::graph::GRAPH_BASE_URL;
use crate::http::{HttpSettings, RetryPolicy};
use crate::matching::{MatchConfig, MatchMode};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub auth: AuthSection,
    pub http: HttpSection,
    pub target: TargetSection,
    pub bot: BotSection,
    pub poll: PollSection,
    pub correlation: CorrelationSection,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    pub tenant_id: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    /// Defaults to `<data dir>/auth/token_cache.json`.
    pub cache_path: Option<PathBuf>,
    pub authority_host: String,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            client_id: String::new(),
            scopes: vec!["ChannelMessage.Read.All".to_string()],
            cache_path: None,
            authority_host: DEFAULT_AUTHORITY_HOST.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub graph_base_url: String,
    pub connect_timeout_secs: f64,
    pub read_timeout_secs: f64,
    pub max_retries: u32,
    pub backoff_base_secs: f64,
    pub backoff_cap_secs: f64,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            graph_base_url: GRAPH_BASE_URL.to_string(),
            connect_timeout_secs: 10.0,
            read_timeout_secs: 30.0,
            max_retries: 5,
            backoff_base_secs: 1.0,
            backoff_cap_secs: 30.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TargetSection {
    pub team_name: String,
    pub channel_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BotSection {
    pub app_id: Option<String>,
    pub display_name: String,
    pub match_mode: MatchMode,
    pub accept_after_polls: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PollSection {
    pub interval_secs: f64,
    pub timeout_secs: f64,
}

impl Default for PollSection {
    fn default() -> Self {
        Self {
            interval_secs: 1.5,
            timeout_secs: 120.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CorrelationSection {
    pub max_checks: u32,
    pub lookback_secs: f64,
    pub retry_delay_ms: u64,
}

impl Default for CorrelationSection {
    fn default() -> Self {
        Self {
            max_checks: 3,
            lookback_secs: 30.0,
            retry_delay_ms: 800,
        }
    }
}

impl WatchConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Override fields from `lookup`; blank values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("TARR_TENANT_ID") {
            self.auth.tenant_id = v;
        }
        if let Some(v) = get("TARR_CLIENT_ID") {
            self.auth.client_id = v;
        }
        if let Some(v) = get("TARR_TEAM") {
            self.target.team_name = v;
        }
        if let Some(v) = get("TARR_CHANNEL") {
            self.target.channel_name = v;
        }
        if let Some(v) = get("TARR_BOT_APP_ID") {
            self.bot.app_id = Some(v);
        }
        if let Some(v) = get("TARR_BOT_NAME") {
            self.bot.display_name = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.tenant_id.trim().is_empty() {
            return Err(ConfigError::Invalid("auth.tenant_id is required".to_string()));
        }
        if self.auth.client_id.trim().is_empty() {
            return Err(ConfigError::Invalid("auth.client_id is required".to_string()));
        }
        if self.auth.scopes.iter().all(|s| s.trim().is_empty()) {
            return Err(ConfigError::Invalid("auth.scopes must name at least one scope".to_string()));
        }
        check_http_url("auth.authority_host", &self.auth.authority_host)?;
        check_http_url("http.graph_base_url", &self.http.graph_base_url)?;
        if self.poll_interval()?.is_zero() {
            return Err(ConfigError::Invalid("poll.interval_secs must be positive".to_string()));
        }
        self.poll_timeout()?;
        self.correlation_lookback()?;
        self.http_settings()?;
        Ok(())
    }

    pub fn match_config(&self) -> MatchConfig {
        MatchConfig {
            bot_app_id: self.bot.app_id.clone().filter(|id| !id.trim().is_empty()),
            bot_display_name: self.bot.display_name.clone(),
            match_mode: self.bot.match_mode,
            accept_after_polls: self.bot.accept_after_polls,
        }
    }

    pub fn http_settings(&self) -> Result<HttpSettings, ConfigError> {
        Ok(HttpSettings {
            connect_timeout: secs("http.connect_timeout_secs", self.http.connect_timeout_secs)?,
            request_timeout: secs("http.read_timeout_secs", self.http.read_timeout_secs)?,
            retry: RetryPolicy {
                max_retries: self.http.max_retries,
                backoff_base: secs("http.backoff_base_secs", self.http.backoff_base_secs)?,
                backoff_cap: secs("http.backoff_cap_secs", self.http.backoff_cap_secs)?,
            },
        })
    }

    /// Authority calls share the Graph connect and read timeouts.
    pub fn broker_settings(&self) -> Result<BrokerSettings, ConfigError> {
        Ok(
            BrokerSettings::new(&self.auth.tenant_id, &self.auth.client_id, self.auth.scopes.clone())
                .with_authority_host(&self.auth.authority_host)
                .with_timeouts(
                    secs("http.connect_timeout_secs", self.http.connect_timeout_secs)?,
                    secs("http.read_timeout_secs", self.http.read_timeout_secs)?,
                ),
        )
    }

    /// Configured cache path, or `default` when unset.
    pub fn cache_path_or(&self, default: &Path) -> PathBuf {
        self.auth
            .cache_path
            .clone()
            .unwrap_or_else(|| default.to_path_buf())
    }

    pub fn poll_interval(&self) -> Result<Duration, ConfigError> {
        secs("poll.interval_secs", self.poll.interval_secs)
    }

    pub fn poll_timeout(&self) -> Result<Duration, ConfigError> {
        secs("poll.timeout_secs", self.poll.timeout_secs)
    }

    pub fn correlation_lookback(&self) -> Result<Duration, ConfigError> {
        secs("correlation.lookback_secs", self.correlation.lookback_secs)
    }

    pub fn correlation_retry_delay(&self) -> Duration {
        Duration::from_millis(self.correlation.retry_delay_ms)
    }
}

fn secs(field: &str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| ConfigError::Invalid(format!("{field} must be a non-negative number of seconds, got {value}")))
}

fn check_http_url(field: &str, value: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::Invalid(format!("{field} is not a valid URL ({value}): {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::Invalid(format!("{field} must be http(s), got {other}"))),
    }
}
