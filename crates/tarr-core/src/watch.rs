use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::correlate::{ActionCorrelator, CorrelationWindow};
use crate::error::Result;
use crate::graph::GraphEndpoints;
use crate::http::JsonSource;
use crate::matching::MatchConfig;
use crate::poller::{PollOutcome, ReplyPoller};

/// Everything needed to confirm one UI-originated send.
#[derive(Debug, Clone)]
pub struct WatchRequest {
    pub team_id: String,
    pub channel_id: String,
    pub since_utc: DateTime<Utc>,
    pub text_hint: String,
    pub match_config: MatchConfig,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub max_checks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WatchOutcome {
    /// The sent message never showed up in the channel listing.
    RootNotFound,
    Polled { root_id: String, outcome: PollOutcome },
}

/// Correlate the root message, then wait on its replies.
pub struct ReplyWatcher {
    correlator: ActionCorrelator,
    poller: ReplyPoller,
}

impl ReplyWatcher {
    pub fn new(source: Arc<dyn JsonSource>, endpoints: GraphEndpoints) -> Self {
        Self {
            correlator: ActionCorrelator::new(source.clone(), endpoints.clone()),
            poller: ReplyPoller::new(source, endpoints),
        }
    }

    pub fn from_parts(correlator: ActionCorrelator, poller: ReplyPoller) -> Self {
        Self { correlator, poller }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.correlator = self.correlator.with_retry_delay(retry_delay);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.correlator = self.correlator.with_cancellation(cancel.clone());
        self.poller = self.poller.with_cancellation(cancel);
        self
    }

    pub async fn watch(&self, request: &WatchRequest) -> Result<WatchOutcome> {
        let window = CorrelationWindow::new(request.since_utc, request.text_hint.as_str(), request.max_checks);
        let Some(root_id) = self
            .correlator
            .find_recent_root_from_me(&request.team_id, &request.channel_id, &window)
            .await?
        else {
            return Ok(WatchOutcome::RootNotFound);
        };

        info!(root_id = %root_id, timeout = ?request.timeout, "waiting for bot reply");
        let outcome = self
            .poller
            .wait_for_reply(
                &request.team_id,
                &request.channel_id,
                &root_id,
                &request.match_config,
                request.timeout,
                request.poll_interval,
            )
            .await?;
        Ok(WatchOutcome::Polled { root_id, outcome })
    }
}
