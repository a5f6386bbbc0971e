//! Finding the root message a UI action just produced.
//!
//! The browser layer only knows roughly when it sent something and what it
//! typed. Graph is eventually consistent, so the lookup is retried a few
//! times before giving up.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cancel::{ensure_active, sleep_or_cancel};
use crate::error::Result;
use crate::graph::{strip_html, ChatMessage, GraphEndpoints, RootMessage};
use crate::http::JsonSource;
use crate::paging::{paged, PageRequest};

/// Characters of the hint that must appear in the message body.
pub const HINT_PREFIX_CHARS: usize = 60;
/// Recent channel messages scanned per attempt.
pub const MESSAGE_SCAN_LIMIT: usize = 250;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(800);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationWindow {
    pub since_utc: DateTime<Utc>,
    pub text_hint: String,
    pub max_checks: u32,
}

impl CorrelationWindow {
    pub fn new(since_utc: DateTime<Utc>, text_hint: impl Into<String>, max_checks: u32) -> Self {
        Self {
            since_utc,
            text_hint: text_hint.into(),
            max_checks,
        }
    }

    /// Window opening `lookback` before the moment the UI reported the send.
    pub fn from_sent_at(
        sent_at: DateTime<Utc>,
        lookback: Duration,
        text_hint: impl Into<String>,
        max_checks: u32,
    ) -> Self {
        let lookback = chrono::Duration::from_std(lookback).unwrap_or_else(|_| chrono::Duration::zero());
        Self::new(sent_at - lookback, text_hint, max_checks)
    }

    /// Lowercased leading slice of the trimmed hint, empty when there is none.
    pub fn hint_prefix(&self) -> String {
        self.text_hint
            .trim()
            .chars()
            .take(HINT_PREFIX_CHARS)
            .collect::<String>()
            .to_lowercase()
    }
}

pub struct ActionCorrelator {
    source: Arc<dyn JsonSource>,
    endpoints: GraphEndpoints,
    retry_delay: Duration,
    cancel: CancellationToken,
}

impl ActionCorrelator {
    pub fn new(source: Arc<dyn JsonSource>, endpoints: GraphEndpoints) -> Self {
        Self {
            source,
            endpoints,
            retry_delay: DEFAULT_RETRY_DELAY,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Id of the newest root message in the window that carries the hint.
    /// `Ok(None)` once every attempt came back empty.
    pub async fn find_recent_root_from_me(
        &self,
        team_id: &str,
        channel_id: &str,
        window: &CorrelationWindow,
    ) -> Result<Option<String>> {
        let url = self.endpoints.channel_messages(team_id, channel_id);
        let hint = window.hint_prefix();
        let attempts = window.max_checks.max(1);

        for attempt in 1..=attempts {
            ensure_active(&self.cancel)?;
            if attempt > 1 {
                sleep_or_cancel(self.retry_delay, &self.cancel).await?;
            }

            let mut candidates = Vec::new();
            let mut pager = paged::<ChatMessage>(self.source.as_ref(), PageRequest::first(url.as_str()), MESSAGE_SCAN_LIMIT);
            while let Some(message) = pager.next().await? {
                let Some(root) = RootMessage::from_wire(&message) else {
                    continue;
                };
                if is_candidate(&root, window.since_utc, &hint) {
                    candidates.push(root);
                }
            }

            if let Some(found) = select_candidate(&candidates) {
                info!(team_id, channel_id, root_id = %found.id, attempt, "correlated root message");
                return Ok(Some(found.id.clone()));
            }
            debug!(team_id, channel_id, attempt, attempts, "no matching root message yet");
        }

        info!(team_id, channel_id, attempts, "no root message found for the action");
        Ok(None)
    }
}

fn is_candidate(root: &RootMessage, since_utc: DateTime<Utc>, hint: &str) -> bool {
    if !root.is_root() {
        return false;
    }
    if root.created_at.is_some_and(|created| created < since_utc) {
        return false;
    }
    if hint.is_empty() {
        return true;
    }
    root.body_content.to_lowercase().contains(hint)
        || strip_html(&root.body_content).to_lowercase().contains(hint)
}

/// Latest `created_at` wins; on a tie the earlier message in server order is
/// kept. Missing timestamps sort below every real one.
fn select_candidate(candidates: &[RootMessage]) -> Option<&RootMessage> {
    let mut best: Option<&RootMessage> = None;
    for candidate in candidates {
        match best {
            Some(current) if candidate.created_at <= current.created_at => {}
            _ => best = Some(candidate),
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedSource;
    use chrono::TimeZone;
    use serde_json::{json, Value};

    const MESSAGES: &str = "https://graph.test/v1.0/teams/t1/channels/c1/messages";

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, secs).unwrap()
    }

    fn message(id: &str, created: &str, reply_to: Option<&str>, content: &str) -> Value {
        json!({
            "id": id,
            "createdDateTime": created,
            "replyToId": reply_to,
            "body": {"contentType": "html", "content": content}
        })
    }

    fn correlator(source: ScriptedSource) -> (Arc<ScriptedSource>, ActionCorrelator) {
        let source = Arc::new(source);
        let correlator = ActionCorrelator::new(source.clone(), GraphEndpoints::new("https://graph.test/v1.0"));
        (source, correlator)
    }

    #[test]
    fn test_hint_prefix_is_bounded_and_lowercased() {
        let window = CorrelationWindow::new(at(0), format!("  HeLLo {}", "x".repeat(100)), 3);
        let prefix = window.hint_prefix();
        assert_eq!(prefix.chars().count(), HINT_PREFIX_CHARS);
        assert!(prefix.starts_with("hello x"));
    }

    #[test]
    fn test_from_sent_at_subtracts_lookback() {
        let window = CorrelationWindow::from_sent_at(at(40), Duration::from_secs(30), "hi", 3);
        assert_eq!(window.since_utc, at(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_candidate_after_all_checks() {
        let (source, correlator) = correlator(ScriptedSource::new().respond(MESSAGES, json!({"value": []})));
        let window = CorrelationWindow::new(at(0), "ping the bot", 3);

        let started = tokio::time::Instant::now();
        let found = correlator.find_recent_root_from_me("t1", "c1", &window).await.unwrap();

        assert_eq!(found, None);
        assert_eq!(source.calls_to(MESSAGES), 3);
        assert_eq!(started.elapsed(), DEFAULT_RETRY_DELAY * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_found_on_first_check_does_not_sleep() {
        let (source, correlator) = correlator(ScriptedSource::new().respond(
            MESSAGES,
            json!({"value": [message("m1", "2024-05-01T10:00:05Z", None, "<p>Ping the bot please</p>")]}),
        ));
        let window = CorrelationWindow::new(at(0), "ping the bot", 3);

        let started = tokio::time::Instant::now();
        let found = correlator.find_recent_root_from_me("t1", "c1", &window).await.unwrap();

        assert_eq!(found.as_deref(), Some("m1"));
        assert_eq!(source.calls_to(MESSAGES), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eventual_consistency_second_check() {
        let (source, correlator) = correlator(
            ScriptedSource::new()
                .respond(MESSAGES, json!({"value": []}))
                .respond(
                    MESSAGES,
                    json!({"value": [message("m1", "2024-05-01T10:00:05Z", None, "ping the bot")]}),
                ),
        );
        let window = CorrelationWindow::new(at(0), "ping the bot", 3);

        let found = correlator.find_recent_root_from_me("t1", "c1", &window).await.unwrap();
        assert_eq!(found.as_deref(), Some("m1"));
        assert_eq!(source.calls_to(MESSAGES), 2);
    }

    #[tokio::test]
    async fn test_filters_replies_old_messages_and_other_text() {
        let (_, correlator) = correlator(ScriptedSource::new().respond(
            MESSAGES,
            json!({"value": [
                message("reply", "2024-05-01T10:00:09Z", Some("m0"), "ping the bot"),
                message("old", "2024-05-01T09:59:59Z", None, "ping the bot"),
                message("other", "2024-05-01T10:00:08Z", None, "something else"),
                message("mine", "2024-05-01T10:00:03Z", None, "<div>PING&nbsp;the bot</div>")
            ]}),
        ));
        let window = CorrelationWindow::new(at(0), "Ping the bot", 1);

        let found = correlator.find_recent_root_from_me("t1", "c1", &window).await.unwrap();
        assert_eq!(found.as_deref(), Some("mine"));
    }

    #[tokio::test]
    async fn test_latest_wins_and_ties_keep_server_order() {
        let (_, correlator) = correlator(ScriptedSource::new().respond(
            MESSAGES,
            json!({"value": [
                message("undated", "garbage", None, "hello"),
                message("early", "2024-05-01T10:00:02Z", None, "hello"),
                message("tie-first", "2024-05-01T10:00:07Z", None, "hello"),
                message("tie-second", "2024-05-01T10:00:07Z", None, "hello")
            ]}),
        ));
        let window = CorrelationWindow::new(at(0), "hello", 1);

        let found = correlator.find_recent_root_from_me("t1", "c1", &window).await.unwrap();
        assert_eq!(found.as_deref(), Some("tie-first"));
    }

    #[tokio::test]
    async fn test_undated_message_is_still_a_candidate() {
        let (_, correlator) = correlator(ScriptedSource::new().respond(
            MESSAGES,
            json!({"value": [message("undated", "garbage", None, "hello")]}),
        ));
        let window = CorrelationWindow::new(at(0), "hello", 1);

        let found = correlator.find_recent_root_from_me("t1", "c1", &window).await.unwrap();
        assert_eq!(found.as_deref(), Some("undated"));
    }

    #[tokio::test]
    async fn test_zero_max_checks_still_checks_once() {
        let (source, correlator) = correlator(ScriptedSource::new());
        let window = CorrelationWindow::new(at(0), "hello", 0);
        correlator.find_recent_root_from_me("t1", "c1", &window).await.unwrap();
        assert_eq!(source.calls_to(MESSAGES), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_retrying() {
        let cancel = CancellationToken::new();
        let (source, correlator) = correlator(ScriptedSource::new());
        let correlator = correlator
            .with_retry_delay(Duration::from_secs(10))
            .with_cancellation(cancel.clone());
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let window = CorrelationWindow::new(at(0), "hello", 5);
        let err = correlator.find_recent_root_from_me("t1", "c1", &window).await.unwrap_err();
        assert!(matches!(err, crate::Error::Cancelled));
        assert_eq!(source.calls_to(MESSAGES), 1);
    }
}
