use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tarr_core::{CorrelationWindow, MatchKind, PollOutcome, ReplyVerdict, ReplyWatcher, WatchOutcome, WatchRequest};
use tokio_util::sync::CancellationToken;

use super::Session;
use crate::ui;

pub struct WatchArgs {
    pub hint: String,
    pub sent_at: Option<String>,
    pub timeout: Option<f64>,
    pub interval: Option<f64>,
    pub accept_after: Option<u32>,
    pub json: bool,
}

pub async fn run(config: Option<PathBuf>, cancel: CancellationToken, args: WatchArgs) -> Result<()> {
    let session = Session::open(config, cancel)?;
    let sent_at = match args.sent_at.as_deref() {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .with_context(|| format!("--sent-at must be RFC 3339, got '{raw}'"))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    let timeout = match args.timeout {
        Some(secs) => seconds("--timeout", secs)?,
        None => session.config.poll_timeout()?,
    };
    let poll_interval = match args.interval {
        Some(secs) => seconds("--interval", secs)?,
        None => session.config.poll_interval()?,
    };
    let mut match_config = session.config.match_config();
    if let Some(n) = args.accept_after {
        match_config.accept_after_polls = n;
    }

    let window = CorrelationWindow::from_sent_at(
        sent_at,
        session.config.correlation_lookback()?,
        args.hint.as_str(),
        session.config.correlation.max_checks,
    );

    let (team_id, channel_id) = session.target_ids().await?;
    let request = WatchRequest {
        team_id,
        channel_id,
        since_utc: window.since_utc,
        text_hint: window.text_hint,
        match_config,
        timeout,
        poll_interval,
        max_checks: window.max_checks,
    };

    let watcher = ReplyWatcher::new(session.client.clone(), session.endpoints.clone())
        .with_retry_delay(session.config.correlation_retry_delay())
        .with_cancellation(session.cancel.clone());

    let spinner = (!args.json).then(|| ui::spinner("Waiting for the bot to reply"));
    let result = watcher.watch(&request).await;
    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }
    let outcome = result?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    match &outcome {
        WatchOutcome::RootNotFound => {
            ui::error("The sent message did not show up in the channel.");
            ui::info(&format!(
                "Checked {} time(s) for messages since {} containing the hint.",
                request.max_checks.max(1),
                request.since_utc.to_rfc3339()
            ));
        }
        WatchOutcome::Polled { root_id, outcome } => print_poll(root_id, outcome, timeout),
    }
    Ok(())
}

fn print_poll(root_id: &str, outcome: &PollOutcome, timeout: Duration) {
    match &outcome.verdict {
        ReplyVerdict::Matched { reply, matched_by } => {
            let by = match matched_by {
                MatchKind::AppId => "app id",
                MatchKind::AppName => "app name",
                MatchKind::UserName => "user name",
            };
            ui::success(&format!("Bot replied ({}, matched by {by}).", reply.author()));
            ui::quote(&reply.body_text);
        }
        ReplyVerdict::FallbackAccepted { reply } => {
            ui::warning(&format!(
                "No verified bot reply after {} polls, accepting the latest from {}.",
                outcome.polls,
                reply.author()
            ));
            ui::quote(&reply.body_text);
        }
        ReplyVerdict::TimedOut => {
            ui::error(&format!(
                "No bot reply within {}s ({} other replies seen).",
                timeout.as_secs_f64(),
                outcome.replies.len()
            ));
        }
    }
    ui::info(&format!("Root message: {root_id}"));
}

fn seconds(flag: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("{flag} must be a non-negative number of seconds"))
}
