//! Remote API boundary.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use quarry_types::Row;

use crate::{
    credentials::Credential,
    error::{EngineError, EngineResult},
    paginate::{Cursor, Page, PageSource},
};

/// One remote call: `function` is dotted (`advertisers.lineItems.list`).
#[derive(Debug, Clone, PartialEq)]
pub struct ApiCall {
    pub api: String,
    pub version: String,
    pub function: String,
    pub kwargs: Row,
    /// Overrides the client's API key for this call.
    pub key: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl ApiCall {
    pub fn new(api: impl Into<String>, version: impl Into<String>, function: impl Into<String>, kwargs: Row) -> Self {
        Self {
            api: api.into(),
            version: version.into(),
            function: function.into(),
            kwargs,
            key: None,
            headers: Vec::new(),
        }
    }

    pub fn with_key(mut self, key: Option<String>) -> Self {
        self.key = key;
        self
    }

    pub fn with_headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }
}

impl fmt::Display for ApiCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.api, self.version, self.function)
    }
}

/// Executes remote calls and returns one page per call.
///
/// Implementations report the next-page token as `next_cursor`; the engine
/// never interprets it.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn call(&self, credential: &Credential, call: &ApiCall, cursor: Option<&Cursor>) -> anyhow::Result<Page>;
}

/// Page source bound to one call; every page re-issues it with the cursor.
pub struct ApiPageSource {
    remote: Arc<dyn RemoteApi>,
    credential: Credential,
    call: ApiCall,
}

impl ApiPageSource {
    pub fn new(remote: Arc<dyn RemoteApi>, credential: Credential, call: ApiCall) -> Self {
        Self { remote, credential, call }
    }
}

#[async_trait]
impl PageSource for ApiPageSource {
    async fn fetch_next(&mut self, cursor: Option<&Cursor>) -> EngineResult<Page> {
        self.remote
            .call(&self.credential, &self.call, cursor)
            .await
            .map_err(|error| EngineError::remote_api(&self.call, &error))
    }
}

/// Issue `call` once and return its first page.
pub async fn call_once(remote: &dyn RemoteApi, credential: &Credential, call: &ApiCall) -> EngineResult<Page> {
    remote
        .call(credential, call, None)
        .await
        .map_err(|error| EngineError::remote_api(call, &error))
}

type Responder = Box<dyn Fn(&ApiCall) -> anyhow::Result<Vec<Vec<Row>>> + Send + Sync>;

/// In-process [`RemoteApi`] answering from scripted responses.
///
/// Each function maps to a responder returning the pages for a call; page
/// `n` carries cursor `page-{n+1}` so paging can be exercised. Every call is
/// recorded. Used for tests and dry runs.
#[derive(Default)]
pub struct ScriptedApi {
    responders: HashMap<String, Responder>,
    calls: Mutex<Vec<(ApiCall, Option<Cursor>)>>,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `function` with the same pages on every call.
    pub fn with_pages(self, function: impl Into<String>, pages: Vec<Vec<Row>>) -> Self {
        self.with_responder(function, move |_| Ok(pages.clone()))
    }

    pub fn with_responder<F>(mut self, function: impl Into<String>, responder: F) -> Self
    where
        F: Fn(&ApiCall) -> anyhow::Result<Vec<Vec<Row>>> + Send + Sync + 'static,
    {
        self.responders.insert(function.into(), Box::new(responder));
        self
    }

    pub fn failing(self, function: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        self.with_responder(function, move |_| Err(anyhow::anyhow!(message.clone())))
    }

    pub fn calls(&self) -> Vec<(ApiCall, Option<Cursor>)> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl RemoteApi for ScriptedApi {
    async fn call(&self, _credential: &Credential, call: &ApiCall, cursor: Option<&Cursor>) -> anyhow::Result<Page> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((call.clone(), cursor.cloned()));

        let responder = self
            .responders
            .get(&call.function)
            .ok_or_else(|| anyhow::anyhow!("no scripted response for {}", call.function))?;
        let mut pages = responder(call)?;

        let index = match cursor {
            None => 0,
            Some(cursor) => cursor
                .as_str()
                .strip_prefix("page-")
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| anyhow::anyhow!("unexpected cursor {}", cursor.as_str()))?,
        };
        if index >= pages.len() {
            return Ok(Page::default());
        }
        let has_next = index + 1 < pages.len();
        let rows = pages.swap_remove(index);
        Ok(if has_next {
            Page::with_cursor(rows, format!("page-{}", index + 1))
        } else {
            Page::last(rows)
        })
    }
}

#[cfg(test)]
mod tests {
    use quarry_types::AuthKind;
    use serde_json::json;

    use super::*;
    use crate::paginate::Paginator;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn scripted_pages_chain_through_cursors() {
        let api = Arc::new(ScriptedApi::new().with_pages("items.list", vec![vec![row(json!({"id": 1}))], vec![row(json!({"id": 2}))]]));
        let source = ApiPageSource::new(
            api.clone(),
            Credential::new(AuthKind::Service, "t"),
            ApiCall::new("svc", "v1", "items.list", Row::new()),
        );
        let mut paginator = Paginator::new(source, None);
        let mut ids = Vec::new();
        while let Some(rows) = paginator.next_page().await.expect("page") {
            ids.extend(rows.into_iter().map(|r| r["id"].clone()));
        }
        assert_eq!(ids, vec![json!(1), json!(2)]);
        let cursors: Vec<_> = api.calls().into_iter().map(|(_, cursor)| cursor).collect();
        assert_eq!(cursors, vec![None, Some(Cursor::new("page-1"))]);
    }

    #[tokio::test]
    async fn failures_name_the_call() {
        let api = ScriptedApi::new().failing("items.list", "quota exceeded");
        let call = ApiCall::new("svc", "v1", "items.list", Row::new());
        let err = call_once(&api, &Credential::new(AuthKind::User, "t"), &call).await.expect_err("fails");
        assert_eq!(err.to_string(), "remote call svc.v1.items.list failed: quota exceeded");
    }
}
