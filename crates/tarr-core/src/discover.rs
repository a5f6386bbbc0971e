//! Listing application senders in a channel, to find the bot's app id.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::graph::{ChatMessage, GraphEndpoints};
use crate::http::JsonSource;
use crate::paging::{paged, PageRequest};

/// Replies scanned per thread.
pub const THREAD_REPLY_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BotIdentity {
    pub app_id: String,
    pub display_name: String,
    pub messages_seen: u32,
}

pub struct BotDiscovery {
    source: Arc<dyn JsonSource>,
    endpoints: GraphEndpoints,
}

impl BotDiscovery {
    pub fn new(source: Arc<dyn JsonSource>, endpoints: GraphEndpoints) -> Self {
        Self { source, endpoints }
    }

    /// Application senders across the newest `root_limit` root messages and
    /// their replies, most active first.
    pub async fn discover(&self, team_id: &str, channel_id: &str, root_limit: usize) -> Result<Vec<BotIdentity>> {
        let mut tally = Tally::default();

        let roots: Vec<ChatMessage> = paged(
            self.source.as_ref(),
            PageRequest::first(self.endpoints.channel_messages(team_id, channel_id)),
            root_limit,
        )
        .collect_all()
        .await?;

        for root in &roots {
            tally.record(root);
            let Some(root_id) = root.id.as_deref().filter(|id| !id.is_empty()) else {
                continue;
            };

            let url = self.endpoints.message_replies(team_id, channel_id, root_id);
            let replies = paged::<ChatMessage>(self.source.as_ref(), PageRequest::first(url), THREAD_REPLY_LIMIT)
                .collect_all()
                .await;
            match replies {
                Ok(replies) => replies.iter().for_each(|reply| tally.record(reply)),
                // Threads the account cannot read are skipped.
                Err(Error::Http(err)) if err.status().is_some() => {
                    warn!(root_id, error = %err, "skipping unreadable thread");
                }
                Err(err) => return Err(err),
            }
        }

        let found = tally.into_sorted();
        debug!(team_id, channel_id, roots = roots.len(), senders = found.len(), "bot discovery finished");
        Ok(found)
    }
}

#[derive(Default)]
struct Tally {
    order: Vec<String>,
    by_id: HashMap<String, BotIdentity>,
}

impl Tally {
    fn record(&mut self, message: &ChatMessage) {
        let Some(app) = message.application() else {
            return;
        };
        let Some(app_id) = app.id.as_deref().map(str::trim).filter(|id| !id.is_empty()) else {
            return;
        };
        let name = app.display_name.as_deref().map(str::trim).filter(|n| !n.is_empty());

        let entry = self.by_id.entry(app_id.to_string()).or_insert_with(|| {
            self.order.push(app_id.to_string());
            BotIdentity {
                app_id: app_id.to_string(),
                display_name: String::new(),
                messages_seen: 0,
            }
        });
        entry.messages_seen += 1;
        if entry.display_name.is_empty() {
            if let Some(name) = name {
                entry.display_name = name.to_string();
            }
        }
    }

    fn into_sorted(mut self) -> Vec<BotIdentity> {
        let mut found: Vec<BotIdentity> = self
            .order
            .iter()
            .filter_map(|id| self.by_id.remove(id))
            .map(|mut identity| {
                if identity.display_name.is_empty() {
                    identity.display_name = "Unknown App".to_string();
                }
                identity
            })
            .collect();
        found.sort_by(|a, b| b.messages_seen.cmp(&a.messages_seen).then_with(|| a.app_id.cmp(&b.app_id)));
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedSource;
    use serde_json::{json, Value};

    const MESSAGES: &str = "https://graph.test/v1.0/teams/t1/channels/c1/messages";

    fn from_app(id: &str, app_id: &str, name: Option<&str>) -> Value {
        json!({"id": id, "from": {"application": {"id": app_id, "displayName": name}}})
    }

    fn from_user(id: &str) -> Value {
        json!({"id": id, "from": {"user": {"id": "u1", "displayName": "Alice"}}})
    }

    fn discovery(source: ScriptedSource) -> (Arc<ScriptedSource>, BotDiscovery) {
        let source = Arc::new(source);
        let discovery = BotDiscovery::new(source.clone(), GraphEndpoints::new("https://graph.test/v1.0"));
        (source, discovery)
    }

    #[tokio::test]
    async fn test_collects_senders_from_roots_and_replies() {
        let (_, discovery) = discovery(
            ScriptedSource::new()
                .respond(MESSAGES, json!({"value": [from_user("m1"), from_app("m2", "app-b", Some("Beta"))]}))
                .respond(
                    &format!("{MESSAGES}/m1/replies"),
                    json!({"value": [
                        from_app("r1", "app-a", None),
                        from_app("r2", "app-a", Some("Alpha")),
                        from_app("r3", "app-a", Some("Alpha Renamed"))
                    ]}),
                )
                .respond(&format!("{MESSAGES}/m2/replies"), json!({"value": [from_app("r4", "app-c", None)]})),
        );

        let found = discovery.discover("t1", "c1", 50).await.unwrap();
        assert_eq!(
            found,
            vec![
                BotIdentity {
                    app_id: "app-a".to_string(),
                    display_name: "Alpha".to_string(),
                    messages_seen: 3
                },
                BotIdentity {
                    app_id: "app-b".to_string(),
                    display_name: "Beta".to_string(),
                    messages_seen: 1
                },
                BotIdentity {
                    app_id: "app-c".to_string(),
                    display_name: "Unknown App".to_string(),
                    messages_seen: 1
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_unreadable_thread_is_skipped() {
        let (source, discovery) = discovery(
            ScriptedSource::new()
                .respond(MESSAGES, json!({"value": [from_user("m1"), from_user("m2")]}))
                .fail(&format!("{MESSAGES}/m1/replies"), 404)
                .respond(&format!("{MESSAGES}/m2/replies"), json!({"value": [from_app("r1", "app-a", Some("Alpha"))]})),
        );

        let found = discovery.discover("t1", "c1", 50).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(source.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_root_limit_bounds_thread_scans() {
        let (source, discovery) = discovery(
            ScriptedSource::new().respond(MESSAGES, json!({"value": [from_user("m1"), from_user("m2"), from_user("m3")]})),
        );

        let found = discovery.discover("t1", "c1", 2).await.unwrap();
        assert!(found.is_empty());
        assert_eq!(source.requests().len(), 3);
    }
}
