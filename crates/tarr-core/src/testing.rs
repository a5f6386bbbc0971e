//! In-memory `JsonSource` for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{HttpError, Result};
use crate::http::JsonSource;
use crate::paging::PageRequest;

#[derive(Clone)]
enum Scripted {
    Body(Value),
    Status(u16),
}

/// Serves queued responses per URL. The last queued response repeats, and
/// unknown URLs answer with an empty collection.
#[derive(Default)]
pub(crate) struct ScriptedSource {
    routes: Mutex<HashMap<String, VecDeque<Scripted>>>,
    requests: Mutex<Vec<PageRequest>>,
}

impl ScriptedSource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn respond(self, url: &str, body: Value) -> Self {
        self.push(url, Scripted::Body(body));
        self
    }

    pub(crate) fn fail(self, url: &str, status: u16) -> Self {
        self.push(url, Scripted::Status(status));
        self
    }

    fn push(&self, url: &str, response: Scripted) {
        self.routes
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(response);
    }

    pub(crate) fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn calls_to(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url() == url)
            .count()
    }
}

#[async_trait]
impl JsonSource for ScriptedSource {
    async fn get_json(&self, request: &PageRequest) -> Result<Value> {
        self.requests.lock().unwrap().push(request.clone());

        let response = {
            let mut routes = self.routes.lock().unwrap();
            match routes.get_mut(request.url()) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match response {
            Some(Scripted::Body(body)) => Ok(body),
            Some(Scripted::Status(status)) => Err(HttpError::Status {
                status,
                url: request.url().to_string(),
                body: String::new(),
            }
            .into()),
            None => Ok(json!({ "value": [] })),
        }
    }
}
