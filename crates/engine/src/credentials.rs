//! Credentials handed to collaborators.
//!
//! The engine never inspects a token; it only selects which configured
//! credential a task, source or destination should use.

use std::{fmt, path::Path};

use async_trait::async_trait;
use quarry_types::AuthKind;
use serde_json::Value;

use crate::error::{EngineError, EngineResult};

/// Opaque bearer credential. `Debug` never prints the token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    kind: AuthKind,
    token: String,
}

impl Credential {
    pub fn new(kind: AuthKind, token: impl Into<String>) -> Self {
        Self {
            kind,
            token: token.into(),
        }
    }

    pub fn kind(&self) -> AuthKind {
        self.kind
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("kind", &self.kind)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credential(&self, kind: AuthKind) -> EngineResult<Credential>;
}

/// Fixed user and/or service tokens.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    user: Option<Credential>,
    service: Option<Credential>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, kind: AuthKind, token: impl Into<String>) -> Self {
        let credential = Some(Credential::new(kind, token));
        match kind {
            AuthKind::User => self.user = credential,
            AuthKind::Service => self.service = credential,
        }
        self
    }

    /// Read a token file: either the raw token or JSON carrying
    /// `access_token` or `token`.
    pub async fn with_token_file(self, kind: AuthKind, path: &Path) -> EngineResult<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|error| EngineError::Credential(format!("cannot read {kind} credentials {}: {error}", path.display())))?;
        let token = parse_token(&contents)
            .ok_or_else(|| EngineError::Credential(format!("no token found in {kind} credentials {}", path.display())))?;
        Ok(self.with_token(kind, token))
    }

    /// The only configured kind, when exactly one is present.
    pub fn single_kind(&self) -> Option<AuthKind> {
        match (&self.user, &self.service) {
            (Some(_), None) => Some(AuthKind::User),
            (None, Some(_)) => Some(AuthKind::Service),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_none() && self.service.is_none()
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credential(&self, kind: AuthKind) -> EngineResult<Credential> {
        let slot = match kind {
            AuthKind::User => &self.user,
            AuthKind::Service => &self.service,
        };
        slot.clone()
            .ok_or_else(|| EngineError::Credential(format!("no {kind} credential configured")))
    }
}

fn parse_token(contents: &str) -> Option<String> {
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return None;
    }
    if !trimmed.starts_with('{') {
        return Some(trimmed.to_string());
    }
    let document: Value = serde_json::from_str(trimmed).ok()?;
    ["access_token", "token"]
        .iter()
        .find_map(|key| document.get(key).and_then(Value::as_str))
        .map(str::to_string)
}
