pub mod bots;
pub mod login;
pub mod resolve;
pub mod watch;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tarr_auth_bridge::{CredentialBroker, CredentialStore};
use tarr_core::{DirectoryResolver, GraphEndpoints, ResilientHttpClient, TarrPaths, WatchConfig};
use tokio_util::sync::CancellationToken;

use crate::ui;

/// Config, credentials and an authenticated Graph client for one command.
pub struct Session {
    pub config: WatchConfig,
    pub broker: Arc<CredentialBroker>,
    pub client: Arc<ResilientHttpClient>,
    pub endpoints: GraphEndpoints,
    pub cancel: CancellationToken,
}

impl Session {
    pub fn open(config_path: Option<PathBuf>, cancel: CancellationToken) -> Result<Self> {
        let paths = TarrPaths::from_env();
        paths
            .ensure_dirs()
            .with_context(|| format!("Failed to create data dir: {}", paths.base_dir.display()))?;

        let config_path = config_path.unwrap_or_else(|| paths.config_path.clone());
        let mut config = WatchConfig::load(&config_path)?;
        config.apply_env();
        config
            .validate()
            .with_context(|| format!("Check {} or the TARR_* environment", config_path.display()))?;

        let store = CredentialStore::new(config.cache_path_or(&paths.cache_path));
        let broker = CredentialBroker::new(config.broker_settings()?, store)
            .context("Failed to open credential cache")?
            .with_notifier(Arc::new(ui::ConsoleNotifier));
        let broker = Arc::new(broker);

        let client = ResilientHttpClient::new(broker.clone(), &config.http_settings()?)?
            .with_cancellation(cancel.clone());

        Ok(Self {
            endpoints: GraphEndpoints::new(config.http.graph_base_url.as_str()),
            config,
            broker,
            client: Arc::new(client),
            cancel,
        })
    }

    pub fn resolver(&self) -> DirectoryResolver {
        DirectoryResolver::new(self.client.clone(), self.endpoints.clone())
    }

    /// Team and channel ids for the configured target names.
    pub async fn target_ids(&self) -> Result<(String, String)> {
        let team_name = self.config.target.team_name.trim();
        let channel_name = self.config.target.channel_name.trim();
        if team_name.is_empty() || channel_name.is_empty() {
            bail!("Set target.team_name and target.channel_name (or TARR_TEAM / TARR_CHANNEL)");
        }

        let resolver = self.resolver();
        let Some(team_id) = resolver.resolve_team_id(team_name).await? else {
            bail!("No joined team named '{team_name}'");
        };
        let Some(channel_id) = resolver.resolve_channel_id(&team_id, channel_name).await? else {
            bail!("Team '{team_name}' has no channel named '{channel_name}'");
        };
        Ok((team_id, channel_id))
    }
}
