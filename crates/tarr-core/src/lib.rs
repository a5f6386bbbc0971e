//! Correlates a UI-originated Teams message with the bot reply it triggered.
//!
//! The flow is: resolve team/channel ids ([`DirectoryResolver`]), find the
//! root message the browser just posted ([`ActionCorrelator`]), then poll its
//! replies for the configured bot ([`ReplyPoller`]). [`ReplyWatcher`] chains
//! the last two. All Graph traffic goes through [`ResilientHttpClient`].

use std::path::PathBuf;

pub mod config;
pub mod correlate;
pub mod directory;
pub mod discover;
pub mod error;
pub mod graph;
pub mod http;
pub mod matching;
pub mod paging;
pub mod poller;
pub mod watch;

mod cancel;
#[cfg(test)]
mod testing;

pub use config::WatchConfig;
pub use correlate::{ActionCorrelator, CorrelationWindow};
pub use directory::DirectoryResolver;
pub use discover::{BotDiscovery, BotIdentity};
pub use error::{ConfigError, Error, HttpError, Result};
pub use graph::{DirectoryEntry, GraphEndpoints, Reply, RootMessage};
pub use http::{HttpSettings, JsonSource, ResilientHttpClient, RetryPolicy};
pub use matching::{MatchConfig, MatchKind, MatchMode, Matcher};
pub use paging::{paged, PageRequest, Pager};
pub use poller::{PollOutcome, ReplyPoller, ReplyVerdict};
pub use watch::{ReplyWatcher, WatchOutcome, WatchRequest};

#[derive(Debug, Clone)]
pub struct TarrPaths {
    pub base_dir: PathBuf,
    pub config_path: PathBuf,
    pub cache_path: PathBuf,
}

impl TarrPaths {
    pub fn from_env() -> Self {
        if let Some(dir) = std::env::var_os("TARR_DATA_DIR") {
            return Self::from_base(PathBuf::from(dir));
        }
        if let Some(dirs) = directories::ProjectDirs::from("", "", "tarr") {
            return Self::from_base(dirs.data_dir().to_path_buf());
        }
        Self::from_base(PathBuf::from(".tarr"))
    }

    pub fn from_base(base_dir: PathBuf) -> Self {
        let config_path = base_dir.join("config.toml");
        let cache_path = base_dir.join("auth").join("token_cache.json");
        Self {
            base_dir,
            config_path,
            cache_path,
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base_dir)
    }
}
