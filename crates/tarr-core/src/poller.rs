//! Polling a root message's replies until the bot answers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cancel::{ensure_active, sleep_or_cancel};
use crate::error::Result;
use crate::graph::{ChatMessage, GraphEndpoints, Reply};
use crate::http::JsonSource;
use crate::matching::{find_match, MatchConfig, MatchKind};
use crate::paging::{paged, PageRequest};

/// Replies fetched per poll.
pub const REPLY_SCAN_LIMIT: usize = 500;
pub const MIN_TIMEOUT: Duration = Duration::from_secs(1);
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplyVerdict {
    /// A reply from the configured bot identity.
    Matched { reply: Reply, matched_by: MatchKind },
    /// Nothing matched, but `accept_after_polls` was reached with replies
    /// present. The sender is not verified.
    FallbackAccepted { reply: Reply },
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollOutcome {
    pub verdict: ReplyVerdict,
    /// Every distinct reply seen, in arrival order.
    pub replies: Vec<Reply>,
    pub polls: u32,
}

impl PollOutcome {
    /// The reply only when its author was verified.
    pub fn matched_reply(&self) -> Option<&Reply> {
        match &self.verdict {
            ReplyVerdict::Matched { reply, .. } => Some(reply),
            _ => None,
        }
    }

    pub fn best_effort_reply(&self) -> Option<&Reply> {
        match &self.verdict {
            ReplyVerdict::Matched { reply, .. } | ReplyVerdict::FallbackAccepted { reply } => Some(reply),
            ReplyVerdict::TimedOut => None,
        }
    }

    pub fn is_verified(&self) -> bool {
        matches!(self.verdict, ReplyVerdict::Matched { .. })
    }
}

/// State of one `wait_for_reply` call.
#[derive(Debug)]
struct PollSession {
    root_id: String,
    deadline: Instant,
    poll_interval: Duration,
    seen_reply_ids: HashSet<String>,
    last_reply: Option<Reply>,
    all_replies: Vec<Reply>,
    polls: u32,
}

impl PollSession {
    fn new(root_id: &str, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            root_id: root_id.to_string(),
            deadline: Instant::now() + timeout.max(MIN_TIMEOUT),
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            seen_reply_ids: HashSet::new(),
            last_reply: None,
            all_replies: Vec::new(),
            polls: 0,
        }
    }

    /// Record a fetched reply; returns false when its id was already seen.
    fn absorb(&mut self, reply: &Reply) -> bool {
        if !self.seen_reply_ids.insert(reply.id.clone()) {
            return false;
        }
        self.all_replies.push(reply.clone());
        self.last_reply = Some(reply.clone());
        true
    }

    fn finish(self, verdict: ReplyVerdict) -> PollOutcome {
        PollOutcome {
            verdict,
            replies: self.all_replies,
            polls: self.polls,
        }
    }
}

pub struct ReplyPoller {
    source: Arc<dyn JsonSource>,
    endpoints: GraphEndpoints,
    cancel: CancellationToken,
}

impl ReplyPoller {
    pub fn new(source: Arc<dyn JsonSource>, endpoints: GraphEndpoints) -> Self {
        Self {
            source,
            endpoints,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn wait_for_reply(
        &self,
        team_id: &str,
        channel_id: &str,
        root_id: &str,
        match_config: &MatchConfig,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<PollOutcome> {
        let url = self.endpoints.message_replies(team_id, channel_id, root_id);
        let matchers = match_config.matchers();
        let mut session = PollSession::new(root_id, timeout, poll_interval);

        loop {
            ensure_active(&self.cancel)?;
            session.polls += 1;

            let mut fresh = Vec::new();
            let mut pager = paged::<ChatMessage>(self.source.as_ref(), PageRequest::first(url.as_str()), REPLY_SCAN_LIMIT);
            while let Some(message) = pager.next().await? {
                if let Some(reply) = Reply::from_wire(&message) {
                    if session.absorb(&reply) {
                        fresh.push(reply);
                    }
                }
            }
            debug!(
                root_id = %session.root_id,
                poll = session.polls,
                new_replies = fresh.len(),
                total = session.all_replies.len(),
                "polled replies"
            );

            if let Some((reply, matched_by)) = find_match(&matchers, &fresh) {
                info!(root_id = %session.root_id, reply_id = %reply.id, ?matched_by, polls = session.polls, "bot reply matched");
                let reply = reply.clone();
                return Ok(session.finish(ReplyVerdict::Matched { reply, matched_by }));
            }

            let threshold = match_config.accept_after_polls;
            if threshold > 0 && session.polls >= threshold {
                if let Some(reply) = session.last_reply.clone() {
                    info!(root_id = %session.root_id, reply_id = %reply.id, polls = session.polls, "accepting latest reply unverified");
                    return Ok(session.finish(ReplyVerdict::FallbackAccepted { reply }));
                }
            }

            let now = Instant::now();
            if now >= session.deadline {
                break;
            }
            let pause = session.poll_interval.min(session.deadline - now);
            sleep_or_cancel(pause, &self.cancel).await?;
        }

        info!(root_id = %session.root_id, polls = session.polls, replies = session.all_replies.len(), "timed out waiting for bot reply");
        Ok(session.finish(ReplyVerdict::TimedOut))
    }
}
