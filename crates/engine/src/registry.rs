//! Task dispatch: one handler per [`TaskKind`].

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use quarry_types::{AuthKind, ConfigError, Row, TaskDescriptor, TaskKind, TaskOptions};

use crate::{
    credentials::{Credential, CredentialProvider},
    error::EngineResult,
    handlers::{ApiHandler, DatasetHandler, QueryHandler, ReportHandler},
    remote::RemoteApi,
    warehouse::Warehouse,
};

/// External collaborators shared by every task of a run.
#[derive(Clone)]
pub struct Services {
    pub warehouse: Arc<dyn Warehouse>,
    pub remote: Arc<dyn RemoteApi>,
    pub credentials: Arc<dyn CredentialProvider>,
}

impl Services {
    pub fn new(warehouse: Arc<dyn Warehouse>, remote: Arc<dyn RemoteApi>, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            warehouse,
            remote,
            credentials,
        }
    }
}

/// Everything a handler may use while running one task.
#[derive(Clone)]
pub struct TaskContext {
    pub sequence: usize,
    /// Credential selected for the task itself.
    pub credential: Credential,
    /// Forces every credential lookup to one kind when set.
    pub auth_override: Option<AuthKind>,
    /// Keyword argument sets, one remote call each; empty means a single bare call.
    pub kwargs: Vec<Row>,
    pub services: Services,
}

impl TaskContext {
    /// Credential for a source or destination that may name its own `auth`.
    pub async fn credential_for(&self, auth: Option<AuthKind>) -> EngineResult<Credential> {
        let kind = self.auth_override.or(auth).unwrap_or(self.credential.kind());
        if kind == self.credential.kind() {
            return Ok(self.credential.clone());
        }
        self.services.credentials.credential(kind).await
    }

    pub fn warehouse(&self) -> &dyn Warehouse {
        self.services.warehouse.as_ref()
    }
}

/// What a finished task reports for the execution log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskOutcome {
    pub rows_written: usize,
    pub warnings: usize,
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn kind(&self) -> TaskKind;

    /// Structural checks on the options. Must not perform I/O.
    fn validate(&self, options: &TaskOptions) -> Result<(), ConfigError>;

    async fn run(&self, options: &TaskOptions, context: &TaskContext) -> EngineResult<TaskOutcome>;
}

/// Error for a handler given options of another kind.
pub(crate) fn options_mismatch(expected: TaskKind, options: &TaskOptions) -> ConfigError {
    ConfigError::Malformed(format!("{expected} handler received {} options", options.kind()))
}

/// Maps task kinds to handlers. Built once per run; handlers are stateless.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with a handler for every built-in kind.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(DatasetHandler));
        registry.register(Arc::new(ApiHandler));
        registry.register(Arc::new(QueryHandler));
        registry.register(Arc::new(ReportHandler));
        registry
    }

    /// Add or replace the handler for its kind, returning the previous one.
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.insert(handler.kind(), handler)
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn dispatch(&self, task: &TaskDescriptor) -> Result<Arc<dyn TaskHandler>, ConfigError> {
        self.get(task.kind).ok_or_else(|| ConfigError::UnknownTaskKind {
            sequence: task.sequence,
            kind: task.kind.to_string(),
        })
    }

    pub fn kinds(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}
