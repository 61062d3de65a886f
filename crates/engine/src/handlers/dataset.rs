use async_trait::async_trait;
use quarry_types::{ConfigError, TaskKind, TaskOptions};
use tracing::info;

use crate::{
    error::EngineResult,
    registry::{TaskContext, TaskHandler, TaskOutcome, options_mismatch},
    warehouse::AccessEntry,
};

/// Creates, clears or deletes a dataset and grants read access on it.
pub struct DatasetHandler;

#[async_trait]
impl TaskHandler for DatasetHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::Dataset
    }

    fn validate(&self, options: &TaskOptions) -> Result<(), ConfigError> {
        match options {
            TaskOptions::Dataset(options) => options.validate(),
            other => Err(options_mismatch(self.kind(), other)),
        }
    }

    async fn run(&self, options: &TaskOptions, context: &TaskContext) -> EngineResult<TaskOutcome> {
        let TaskOptions::Dataset(options) = options else {
            return Err(options_mismatch(self.kind(), options).into());
        };
        let warehouse = context.warehouse();
        let credential = &context.credential;

        if options.delete {
            warehouse.delete_dataset(credential, &options.dataset).await?;
            info!(task = context.sequence, dataset = %options.dataset, "deleted dataset");
            return Ok(TaskOutcome::default());
        }
        if options.clear {
            warehouse.delete_dataset(credential, &options.dataset).await?;
            info!(task = context.sequence, dataset = %options.dataset, "cleared dataset");
        }
        warehouse.create_dataset(credential, &options.dataset).await?;

        let entries: Vec<AccessEntry> = options
            .emails
            .iter()
            .cloned()
            .map(AccessEntry::User)
            .chain(options.groups.iter().cloned().map(AccessEntry::Group))
            .collect();
        if !entries.is_empty() {
            warehouse.grant_access(credential, &options.dataset, &entries).await?;
        }
        info!(
            task = context.sequence,
            dataset = %options.dataset,
            grants = entries.len(),
            "dataset ready"
        );
        Ok(TaskOutcome::default())
    }
}
