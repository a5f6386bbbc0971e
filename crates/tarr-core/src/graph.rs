//! Graph endpoint paths, wire shapes and the domain records built from them.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphEndpoints {
    base: String,
}

impl Default for GraphEndpoints {
    fn default() -> Self {
        Self::new(GRAPH_BASE_URL)
    }
}

impl GraphEndpoints {
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn joined_teams(&self) -> String {
        format!("{}/me/joinedTeams", self.base)
    }

    pub fn channels(&self, team_id: &str) -> String {
        format!("{}/teams/{}/channels", self.base, team_id)
    }

    pub fn channel_messages(&self, team_id: &str, channel_id: &str) -> String {
        format!("{}/teams/{}/channels/{}/messages", self.base, team_id, channel_id)
    }

    pub fn message_replies(&self, team_id: &str, channel_id: &str, message_id: &str) -> String {
        format!(
            "{}/teams/{}/channels/{}/messages/{}/replies",
            self.base, team_id, channel_id, message_id
        )
    }
}

// Wire shapes. Graph omits or nulls most of these fields freely.

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DirectoryItem {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ChatMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub created_date_time: Option<String>,
    #[serde(default)]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub body: Option<ItemBody>,
    #[serde(default)]
    pub from: Option<MessageFrom>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ItemBody {
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct MessageFrom {
    #[serde(default)]
    pub user: Option<Identity>,
    #[serde(default)]
    pub application: Option<Identity>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Identity {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl ChatMessage {
    fn content(&self) -> &str {
        self.body
            .as_ref()
            .and_then(|b| b.content.as_deref())
            .unwrap_or_default()
    }

    fn is_html(&self) -> bool {
        self.body
            .as_ref()
            .and_then(|b| b.content_type.as_deref())
            .is_some_and(|t| t.eq_ignore_ascii_case("html"))
    }

    pub(crate) fn application(&self) -> Option<&Identity> {
        self.from.as_ref().and_then(|f| f.application.as_ref())
    }

    fn user(&self) -> Option<&Identity> {
        self.from.as_ref().and_then(|f| f.user.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryEntry {
    pub id: String,
    pub display_name: String,
}

impl DirectoryEntry {
    pub(crate) fn from_item(item: DirectoryItem) -> Option<Self> {
        let id = item.id.filter(|id| !id.is_empty())?;
        Some(Self {
            id,
            display_name: item.display_name.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootMessage {
    pub id: String,
    /// `None` when Graph sent a missing or unparsable timestamp.
    pub created_at: Option<DateTime<Utc>>,
    pub reply_to_id: String,
    pub body_content: String,
}

impl RootMessage {
    pub(crate) fn from_wire(message: &ChatMessage) -> Option<Self> {
        let id = message.id.clone().filter(|id| !id.is_empty())?;
        Some(Self {
            id,
            created_at: message.created_date_time.as_deref().and_then(parse_graph_time),
            reply_to_id: message.reply_to_id.clone().unwrap_or_default(),
            body_content: message.content().to_string(),
        })
    }

    pub fn is_root(&self) -> bool {
        self.reply_to_id.is_empty()
    }
}

/// A channel reply as seen by the poller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reply {
    pub id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub author_user_name: Option<String>,
    pub author_app_name: Option<String>,
    pub author_app_id: Option<String>,
    pub body_text: String,
    pub body_html: String,
}

impl Reply {
    pub(crate) fn from_wire(message: &ChatMessage) -> Option<Self> {
        let id = message.id.clone().filter(|id| !id.is_empty())?;
        let raw = message.content();
        let body_text = if message.is_html() {
            strip_html(raw)
        } else {
            raw.to_string()
        };
        let app = message.application();
        Some(Self {
            id,
            created_at: message.created_date_time.as_deref().and_then(parse_graph_time),
            author_user_name: message.user().and_then(|u| u.display_name.clone()),
            author_app_name: app.and_then(|a| a.display_name.clone()),
            author_app_id: app.and_then(|a| a.id.clone()),
            body_text,
            body_html: raw.to_string(),
        })
    }

    /// Best display name for the author, application first.
    pub fn author(&self) -> &str {
        self.author_app_name
            .as_deref()
            .or(self.author_user_name.as_deref())
            .unwrap_or("unknown")
    }
}

pub fn parse_graph_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn line_break_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<br\s*/?>|</p\s*>").expect("static regex"))
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]*>").expect("static regex"))
}

/// Plain text of a Teams HTML body: block breaks become newlines, tags go,
/// the common entities are decoded.
pub fn strip_html(html: &str) -> String {
    let text = line_break_re().replace_all(html, "\n");
    let text = tag_re().replace_all(&text, "");
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
        .trim()
        .to_string()
}
