//! `@odata.nextLink` pagination.
//!
//! Teams message endpoints reject `$top` on continuation requests, so a
//! continuation page is its own request variant that has no parameters to
//! send. The server-provided link already encodes everything it needs.

use std::collections::VecDeque;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::error::{HttpError, Result};
use crate::http::JsonSource;

/// One GET against a paged Graph collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageRequest {
    /// The caller's initial request, with its own query parameters.
    First {
        url: String,
        params: Vec<(String, String)>,
    },
    /// A server-provided `@odata.nextLink`, requested verbatim.
    Continuation { url: String },
}

impl PageRequest {
    pub fn first(url: impl Into<String>) -> Self {
        PageRequest::First {
            url: url.into(),
            params: Vec::new(),
        }
    }

    pub fn first_with_params<K, V>(url: impl Into<String>, params: &[(K, V)]) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        PageRequest::First {
            url: url.into(),
            params: params
                .iter()
                .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
                .collect(),
        }
    }

    pub fn url(&self) -> &str {
        match self {
            PageRequest::First { url, .. } | PageRequest::Continuation { url } => url,
        }
    }

    /// Query parameters to attach. Always empty for continuation pages.
    pub fn params(&self) -> &[(String, String)] {
        match self {
            PageRequest::First { params, .. } => params,
            PageRequest::Continuation { .. } => &[],
        }
    }

    pub fn is_continuation(&self) -> bool {
        matches!(self, PageRequest::Continuation { .. })
    }
}

#[derive(Debug, Deserialize)]
struct GraphPage<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

/// Lazy cursor over the items of a paged collection.
///
/// Pages are fetched only when the buffered items run out, and iteration
/// stops at `limit` items even if more pages exist.
pub struct Pager<'a, T> {
    source: &'a dyn JsonSource,
    next_request: Option<PageRequest>,
    buffer: VecDeque<T>,
    remaining: usize,
    pages_fetched: usize,
    _item: PhantomData<fn() -> T>,
}

/// Start a lazy walk over a paged collection.
pub fn paged<T: DeserializeOwned>(
    source: &dyn JsonSource,
    first: PageRequest,
    limit: usize,
) -> Pager<'_, T> {
    Pager {
        source,
        next_request: Some(first),
        buffer: VecDeque::new(),
        remaining: limit,
        pages_fetched: 0,
        _item: PhantomData,
    }
}

impl<T: DeserializeOwned> Pager<'_, T> {
    pub async fn next(&mut self) -> Result<Option<T>> {
        if self.remaining == 0 {
            return Ok(None);
        }

        while self.buffer.is_empty() {
            let Some(request) = self.next_request.take() else {
                return Ok(None);
            };

            let body = self.source.get_json(&request).await?;
            let page: GraphPage<T> =
                serde_json::from_value(body).map_err(|source| HttpError::Decode {
                    url: request.url().to_string(),
                    source,
                })?;
            self.pages_fetched += 1;

            self.next_request = page
                .next_link
                .filter(|link| !link.is_empty())
                .map(|url| PageRequest::Continuation { url });
            debug!(
                url = request.url(),
                items = page.value.len(),
                has_next = self.next_request.is_some(),
                "fetched page"
            );
            self.buffer.extend(page.value);
        }

        self.remaining -= 1;
        Ok(self.buffer.pop_front())
    }

    /// Drain the cursor into a vector.
    pub async fn collect_all(mut self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }
}
