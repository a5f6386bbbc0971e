//! Bot identity matchers, evaluated in a fixed priority order.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::graph::Reply;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    Exact,
    Contains,
}

impl MatchMode {
    fn accepts(self, candidate: &str, wanted: &str) -> bool {
        let candidate = candidate.trim().to_lowercase();
        match self {
            MatchMode::Exact => candidate == wanted,
            MatchMode::Contains => candidate.contains(wanted),
        }
    }
}

impl FromStr for MatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" => Ok(MatchMode::Exact),
            "contains" => Ok(MatchMode::Contains),
            other => Err(format!("unknown match mode '{other}' (expected exact or contains)")),
        }
    }
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchMode::Exact => write!(f, "exact"),
            MatchMode::Contains => write!(f, "contains"),
        }
    }
}

/// Who counts as "the bot" for one poll session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchConfig {
    pub bot_app_id: Option<String>,
    pub bot_display_name: String,
    pub match_mode: MatchMode,
    /// Accept the latest reply unverified after this many polls. 0 disables.
    pub accept_after_polls: u32,
}

impl MatchConfig {
    /// Matchers in priority order. Blank identities produce no matcher.
    pub fn matchers(&self) -> Vec<Matcher> {
        let mut matchers = Vec::with_capacity(3);
        if let Some(app_id) = self
            .bot_app_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        {
            matchers.push(Matcher::AppId(app_id.to_string()));
        }
        let name = self.bot_display_name.trim().to_lowercase();
        if !name.is_empty() {
            matchers.push(Matcher::AppName {
                name: name.clone(),
                mode: self.match_mode,
            });
            matchers.push(Matcher::UserName {
                name,
                mode: self.match_mode,
            });
        }
        matchers
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    AppId,
    AppName,
    UserName,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    AppId(String),
    /// `name` is stored trimmed and lowercased.
    AppName { name: String, mode: MatchMode },
    UserName { name: String, mode: MatchMode },
}

impl Matcher {
    pub fn kind(&self) -> MatchKind {
        match self {
            Matcher::AppId(_) => MatchKind::AppId,
            Matcher::AppName { .. } => MatchKind::AppName,
            Matcher::UserName { .. } => MatchKind::UserName,
        }
    }

    pub fn matches(&self, reply: &Reply) -> bool {
        match self {
            Matcher::AppId(id) => reply.author_app_id.as_deref().map(str::trim) == Some(id.as_str()),
            Matcher::AppName { name, mode } => reply
                .author_app_name
                .as_deref()
                .is_some_and(|candidate| mode.accepts(candidate, name)),
            Matcher::UserName { name, mode } => reply
                .author_user_name
                .as_deref()
                .is_some_and(|candidate| mode.accepts(candidate, name)),
        }
    }
}

/// First reply matched by the highest-priority matcher that matches any.
pub fn find_match<'a>(matchers: &[Matcher], replies: &'a [Reply]) -> Option<(&'a Reply, MatchKind)> {
    matchers.iter().find_map(|matcher| {
        replies
            .iter()
            .find(|reply| matcher.matches(reply))
            .map(|reply| (reply, matcher.kind()))
    })
}
