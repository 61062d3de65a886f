//! REST client for `api` and `report` tasks.
//!
//! [`RestApiClient`] implements the engine's [`RemoteApi`] seam over HTTP:
//!
//! - `api.version.function` maps to `{base}/{api}/{version}/{function path}`,
//!   with the dotted function turned into path segments
//! - scalar kwargs become query parameters; a `body` kwarg is sent as JSON
//!   with `POST`
//! - the credential's token is sent as a bearer token, and an optional API
//!   key as the `key` query parameter (a call's own key wins)
//! - a configured project is billed through `x-goog-user-project`; a call's
//!   extra headers are sent as given
//! - `nextPageToken` in a response is the cursor, sent back as `pageToken`
//!
//! # Example
//!
//! ```ignore
//! use quarry_api::RestApiClient;
//!
//! let client = RestApiClient::new("https://www.googleapis.com", None)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use quarry_engine::{ApiCall, Credential, Cursor, Page, RemoteApi};
use quarry_types::Row;
use reqwest::{Client, Method, header};
use serde_json::Value;
use tracing::debug;
use url::Url;

/// Hostnames allowed over plain HTTP, for local development and fakes.
const LOCALHOST_DOMAINS: &[&str] = &["localhost", "127.0.0.1"];

const PAGE_TOKEN_PARAM: &str = "pageToken";
const USER_PROJECT_HEADER: &str = "x-goog-user-project";
const NEXT_PAGE_TOKEN_FIELD: &str = "nextPageToken";

/// Thin wrapper around a configured `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct RestApiClient {
    pub base_url: Url,
    pub http: Client,
    api_key: Option<String>,
    project: Option<String>,
}

impl RestApiClient {
    /// Build a client for `base_url`.
    ///
    /// Non-localhost hosts must use HTTPS.
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let base_url = validate_base_url(base_url)?;

        let mut default_headers = header::HeaderMap::new();
        default_headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        default_headers.insert(
            header::USER_AGENT,
            header::HeaderValue::from_str(&format!("quarry/0.1; {}", std::env::consts::OS))?,
        );

        let http = Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(60))
            .build()
            .context("build http client")?;

        Ok(Self {
            base_url,
            http,
            api_key,
            project: None,
        })
    }

    /// Bill calls to `project` unless a call sets its own user project header.
    pub fn with_project(mut self, project: Option<String>) -> Self {
        self.project = project;
        self
    }

    fn api_key_for<'a>(&'a self, call: &'a ApiCall) -> Option<&'a str> {
        call.key.as_deref().or(self.api_key.as_deref())
    }

    /// Headers for `call`: the project header first, then the call's own.
    pub fn request_headers(&self, call: &ApiCall) -> Result<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();
        if let Some(project) = &self.project {
            headers.insert(USER_PROJECT_HEADER, header::HeaderValue::from_str(project).context("project header")?);
        }
        for (name, value) in &call.headers {
            let name = header::HeaderName::from_bytes(name.as_bytes()).with_context(|| format!("header name '{name}'"))?;
            let value = header::HeaderValue::from_str(value).with_context(|| format!("value of header '{name}'"))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    /// URL for `call`, before query parameters.
    pub fn endpoint(&self, call: &ApiCall) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| anyhow!("base url '{}' cannot carry a path", self.base_url))?;
            segments.pop_if_empty();
            segments.push(&call.api).push(&call.version);
            for part in call.function.split('.').filter(|part| !part.is_empty()) {
                segments.push(part);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl RemoteApi for RestApiClient {
    async fn call(&self, credential: &Credential, call: &ApiCall, cursor: Option<&Cursor>) -> Result<Page> {
        let url = self.endpoint(call)?;
        let (params, body) = query_parameters(&call.kwargs, cursor, self.api_key_for(call));
        let headers = self.request_headers(call)?;
        let method = if body.is_some() { Method::POST } else { Method::GET };
        debug!(%url, %method, call = %call, "sending request");

        let mut request = self
            .http
            .request(method, url)
            .bearer_auth(credential.token())
            .headers(headers)
            .query(&params);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.with_context(|| format!("send {call}"))?;
        let status = response.status();
        let text = response.text().await.with_context(|| format!("read response of {call}"))?;
        if !status.is_success() {
            bail!("{status}: {}", error_message(&text));
        }
        parse_page(&text)
    }
}

/// Query parameters for a request and the JSON body, if the kwargs carry one.
fn query_parameters<'a>(kwargs: &'a Row, cursor: Option<&Cursor>, api_key: Option<&str>) -> (Vec<(String, String)>, Option<&'a Value>) {
    let mut params = Vec::new();
    let mut body = None;
    for (name, value) in kwargs {
        match value {
            Value::Null => {}
            Value::String(text) => params.push((name.clone(), text.clone())),
            Value::Bool(_) | Value::Number(_) => params.push((name.clone(), value.to_string())),
            Value::Array(items) => params.extend(items.iter().map(|item| match item {
                Value::String(text) => (name.clone(), text.clone()),
                other => (name.clone(), other.to_string()),
            })),
            Value::Object(_) if name == "body" => body = Some(value),
            Value::Object(_) => params.push((name.clone(), value.to_string())),
        }
    }
    if let Some(cursor) = cursor {
        params.push((PAGE_TOKEN_PARAM.to_string(), cursor.as_str().to_string()));
    }
    if let Some(key) = api_key {
        params.push(("key".to_string(), key.to_string()));
    }
    (params, body)
}

/// Rows of a response: the first array of objects at the top level, or the
/// whole object as a single row.
fn parse_page(text: &str) -> Result<Page> {
    if text.trim().is_empty() {
        return Ok(Page::default());
    }
    let value: Value = serde_json::from_str(text).context("response is not JSON")?;
    let Value::Object(mut object) = value else {
        bail!("response is not a JSON object");
    };
    let next_cursor = match object.remove(NEXT_PAGE_TOKEN_FIELD) {
        Some(Value::String(token)) if !token.is_empty() => Some(Cursor::new(token)),
        _ => None,
    };

    let list = object
        .values()
        .find_map(|value| value.as_array().filter(|items| items.iter().all(Value::is_object)).cloned());
    let rows = match list {
        Some(items) => items.into_iter().filter_map(|item| item.as_object().cloned()).collect(),
        None if object.is_empty() => Vec::new(),
        None => vec![object],
    };
    Ok(Page { rows, next_cursor })
}

/// `error.message` of a Google-style error body, or the raw text.
fn error_message(text: &str) -> String {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|value| value.pointer("/error/message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| text.trim().to_string())
}

fn validate_base_url(base: &str) -> Result<Url> {
    let parsed = Url::parse(base).map_err(|e| anyhow!("Invalid API base URL '{}': {}", base, e))?;
    let host_name = parsed.host_str().ok_or_else(|| anyhow!("API base URL must include a host"))?;

    if LOCALHOST_DOMAINS.iter().any(|&allowed| host_name.eq_ignore_ascii_case(allowed)) {
        return Ok(parsed);
    }
    if parsed.scheme() != "https" {
        bail!("API base URL must use https for non-localhost hosts; got '{}://'", parsed.scheme());
    }
    Ok(parsed)
}
