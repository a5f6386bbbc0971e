use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::graph::{DirectoryEntry, DirectoryItem, GraphEndpoints};
use crate::http::JsonSource;
use crate::paging::{paged, PageRequest};

/// Upper bound on directory entries scanned per lookup.
pub const DIRECTORY_SCAN_LIMIT: usize = 2000;

/// Team and channel display name lookups. Nothing is cached between calls.
pub struct DirectoryResolver {
    source: Arc<dyn JsonSource>,
    endpoints: GraphEndpoints,
}

impl DirectoryResolver {
    pub fn new(source: Arc<dyn JsonSource>, endpoints: GraphEndpoints) -> Self {
        Self { source, endpoints }
    }

    pub async fn resolve_team_id(&self, team_name: &str) -> Result<Option<String>> {
        let url = self.endpoints.joined_teams();
        self.find_by_name(url, team_name).await
    }

    pub async fn resolve_channel_id(&self, team_id: &str, channel_name: &str) -> Result<Option<String>> {
        let url = self.endpoints.channels(team_id);
        self.find_by_name(url, channel_name).await
    }

    pub async fn list_teams(&self) -> Result<Vec<DirectoryEntry>> {
        self.list(self.endpoints.joined_teams()).await
    }

    pub async fn list_channels(&self, team_id: &str) -> Result<Vec<DirectoryEntry>> {
        self.list(self.endpoints.channels(team_id)).await
    }

    async fn find_by_name(&self, url: String, name: &str) -> Result<Option<String>> {
        let wanted = name.trim().to_lowercase();
        if wanted.is_empty() {
            return Ok(None);
        }

        let mut pager = paged::<DirectoryItem>(self.source.as_ref(), PageRequest::first(url), DIRECTORY_SCAN_LIMIT);
        while let Some(item) = pager.next().await? {
            let Some(entry) = DirectoryEntry::from_item(item) else {
                continue;
            };
            if entry.display_name.trim().to_lowercase() == wanted {
                debug!(name, id = %entry.id, "resolved directory entry");
                return Ok(Some(entry.id));
            }
        }
        debug!(name, pages = pager.pages_fetched(), "no directory entry with that name");
        Ok(None)
    }

    async fn list(&self, url: String) -> Result<Vec<DirectoryEntry>> {
        let items = paged::<DirectoryItem>(self.source.as_ref(), PageRequest::first(url), DIRECTORY_SCAN_LIMIT)
            .collect_all()
            .await?;
        Ok(items.into_iter().filter_map(DirectoryEntry::from_item).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedSource;
    use serde_json::json;

    const BASE: &str = "https://graph.test/v1.0";

    fn resolver(source: ScriptedSource) -> (Arc<ScriptedSource>, DirectoryResolver) {
        let source = Arc::new(source);
        let resolver = DirectoryResolver::new(source.clone(), GraphEndpoints::new(BASE));
        (source, resolver)
    }

    #[tokio::test]
    async fn test_team_lookup_is_trimmed_and_case_insensitive() {
        let (_, resolver) = resolver(ScriptedSource::new().respond(
            "https://graph.test/v1.0/me/joinedTeams",
            json!({"value": [
                {"id": "t1", "displayName": "Blue Team"},
                {"id": "t2", "displayName": "  Red Team "}
            ]}),
        ));

        assert_eq!(resolver.resolve_team_id("red team").await.unwrap().as_deref(), Some("t2"));
        assert_eq!(resolver.resolve_team_id("  BLUE TEAM").await.unwrap().as_deref(), Some("t1"));
        assert_eq!(resolver.resolve_team_id("Green Team").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_channel_lookup_follows_next_link() {
        let (source, resolver) = resolver(
            ScriptedSource::new()
                .respond(
                    "https://graph.test/v1.0/teams/t1/channels",
                    json!({
                        "value": [{"id": "c1", "displayName": "General"}],
                        "@odata.nextLink": "https://graph.test/v1.0/teams/t1/channels?$skiptoken=2"
                    }),
                )
                .respond(
                    "https://graph.test/v1.0/teams/t1/channels?$skiptoken=2",
                    json!({"value": [{"id": "c9", "displayName": "bot-testing"}]}),
                ),
        );

        let id = resolver.resolve_channel_id("t1", "Bot-Testing").await.unwrap();
        assert_eq!(id.as_deref(), Some("c9"));
        assert_eq!(source.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_first_match_stops_paging() {
        let (source, resolver) = resolver(ScriptedSource::new().respond(
            "https://graph.test/v1.0/teams/t1/channels",
            json!({
                "value": [{"id": "c1", "displayName": "General"}],
                "@odata.nextLink": "https://graph.test/v1.0/teams/t1/channels?$skiptoken=2"
            }),
        ));

        resolver.resolve_channel_id("t1", "general").await.unwrap();
        assert_eq!(source.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_blank_name_resolves_to_nothing() {
        let (source, resolver) = resolver(ScriptedSource::new());
        assert_eq!(resolver.resolve_team_id("   ").await.unwrap(), None);
        assert!(source.requests().is_empty());
    }

    #[tokio::test]
    async fn test_list_skips_entries_without_id() {
        let (_, resolver) = resolver(ScriptedSource::new().respond(
            "https://graph.test/v1.0/me/joinedTeams",
            json!({"value": [{"displayName": "ghost"}, {"id": "t1", "displayName": "Blue"}]}),
        ));
        let teams = resolver.list_teams().await.unwrap();
        assert_eq!(
            teams,
            vec![DirectoryEntry {
                id: "t1".to_string(),
                display_name: "Blue".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_http_failure_propagates() {
        let (_, resolver) = resolver(ScriptedSource::new().fail("https://graph.test/v1.0/me/joinedTeams", 403));
        let err = resolver.resolve_team_id("Blue").await.unwrap_err();
        assert!(matches!(err, crate::Error::Http(ref e) if e.status() == Some(403)));
    }
}
