//! Writes row batches into a warehouse table under a write disposition.
//!
//! Append streams every batch straight into the target. Replace and merge
//! stage all batches into `<table>_STAGE` first and apply them with a single
//! [`Warehouse::commit_staged`], so the target never observes a partial run.

use quarry_types::{FieldSchema, Row, TableRef, TableSchema, WriteDisposition};
use tracing::{debug, info, warn};

use crate::{
    credentials::Credential,
    error::{EngineError, EngineResult},
    paginate::RowBatches,
    schema::{Coercer, infer_schema},
    warehouse::Warehouse,
};

/// Where and how rows are written.
pub struct MaterializeTarget<'a> {
    pub warehouse: &'a dyn Warehouse,
    pub credential: &'a Credential,
    pub table: TableRef,
    pub disposition: WriteDisposition,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaterializeReport {
    pub rows_written: usize,
    pub batches: usize,
    pub warnings: usize,
    /// Schema the rows were written with; `None` when nothing was written.
    pub schema: Option<TableSchema>,
}

/// Drain `batches` into `target`.
///
/// Without a declared `schema` one is inferred from the first non-empty
/// batch and then held fixed for the rest of the stream.
pub async fn materialize(
    batches: &mut dyn RowBatches,
    schema: Option<TableSchema>,
    target: &MaterializeTarget<'_>,
) -> EngineResult<MaterializeReport> {
    let first = loop {
        match batches.next_batch().await? {
            Some(batch) if batch.is_empty() => continue,
            other => break other,
        }
    };

    let Some(first) = first else {
        return write_empty(schema, target).await;
    };

    let schema = match schema {
        Some(declared) => declared,
        None => {
            let inferred = infer_schema(&first);
            debug!(table = %target.table, columns = inferred.len(), "inferred schema from first batch");
            inferred
        }
    };
    if let WriteDisposition::Merge { keys } = &target.disposition
        && let Some(missing) = keys.iter().find(|key| !schema.contains(key))
    {
        return Err(EngineError::schema_mismatch(
            &target.table,
            format!("merge key '{missing}' is not a column"),
        ));
    }

    let mut writer = BatchWriter::new(target, &schema);
    writer.begin().await?;
    let mut next = Some(first);
    while let Some(batch) = next {
        if let Err(error) = writer.write(batch).await {
            writer.abandon().await;
            return Err(error);
        }
        next = match batches.next_batch().await {
            Ok(batch) => batch,
            Err(error) => {
                writer.abandon().await;
                return Err(error);
            }
        };
    }
    let report = writer.finish().await?;
    info!(
        table = %target.table,
        disposition = %target.disposition,
        rows = report.rows_written,
        warnings = report.warnings,
        "materialized results"
    );
    Ok(report)
}

async fn write_empty(schema: Option<TableSchema>, target: &MaterializeTarget<'_>) -> EngineResult<MaterializeReport> {
    let Some(schema) = schema else {
        debug!(table = %target.table, "no rows and no schema; nothing written");
        return Ok(MaterializeReport::default());
    };
    match target.disposition {
        // An empty merge changes nothing.
        WriteDisposition::Merge { .. } => {}
        _ => {
            target
                .warehouse
                .write_table(target.credential, &target.table, &schema, &[], &target.disposition)
                .await?;
        }
    }
    Ok(MaterializeReport {
        schema: Some(schema),
        ..MaterializeReport::default()
    })
}

struct BatchWriter<'t, 'a> {
    target: &'t MaterializeTarget<'a>,
    schema: &'t TableSchema,
    coercer: Coercer<'t>,
    staging: Option<TableRef>,
    rows_written: usize,
    batches: usize,
}

impl<'t, 'a> BatchWriter<'t, 'a> {
    fn new(target: &'t MaterializeTarget<'a>, schema: &'t TableSchema) -> Self {
        let staging = match target.disposition {
            WriteDisposition::Append => None,
            _ => Some(target.table.staging()),
        };
        Self {
            target,
            schema,
            coercer: Coercer::new(schema),
            staging,
            rows_written: 0,
            batches: 0,
        }
    }

    async fn begin(&self) -> EngineResult<()> {
        if let Some(staging) = &self.staging {
            self.target.warehouse.drop_table(self.target.credential, staging).await?;
        }
        Ok(())
    }

    async fn write(&mut self, batch: Vec<Row>) -> EngineResult<()> {
        let rows: Vec<Row> = batch.into_iter().map(|row| self.coercer.coerce_row(row)).collect();
        if let WriteDisposition::Merge { keys } = &self.target.disposition
            && let Some(key) = keys.iter().find(|key| rows.iter().any(|row| row.get(*key).is_none_or(|value| value.is_null())))
        {
            return Err(EngineError::schema_mismatch(
                &self.target.table,
                format!("row without a value for merge key '{key}'"),
            ));
        }

        // Staging starts empty, so every batch appends whichever table it goes to.
        let table = self.staging.as_ref().unwrap_or(&self.target.table);
        let written = self
            .target
            .warehouse
            .write_table(self.target.credential, table, self.schema, &rows, &WriteDisposition::Append)
            .await?;
        self.rows_written += written;
        self.batches += 1;
        debug!(table = %table, batch = self.batches, rows = written, "wrote batch");
        Ok(())
    }

    async fn finish(self) -> EngineResult<MaterializeReport> {
        if let Some(staging) = &self.staging {
            let committed = self
                .target
                .warehouse
                .commit_staged(self.target.credential, staging, &self.target.table, self.schema, &self.target.disposition)
                .await;
            self.drop_staging().await;
            match committed {
                Ok(_) => {}
                Err(source) if matches!(self.target.disposition, WriteDisposition::Merge { .. }) => {
                    return Err(EngineError::MergeConsistency {
                        table: self.target.table.clone(),
                        source,
                    });
                }
                Err(source) => return Err(source.into()),
            }
        }

        let warnings = self.coercer.warnings();
        if warnings > 0 {
            let dropped: Vec<&str> = self.coercer.dropped_fields().keys().map(String::as_str).collect();
            warn!(
                table = %self.target.table,
                warnings,
                dropped = ?dropped,
                "rows adjusted to fit the schema"
            );
        }
        Ok(MaterializeReport {
            rows_written: self.rows_written,
            batches: self.batches,
            warnings,
            schema: Some(self.schema.clone()),
        })
    }

    async fn abandon(&self) {
        self.drop_staging().await;
    }

    async fn drop_staging(&self) {
        if let Some(staging) = &self.staging
            && let Err(error) = self.target.warehouse.drop_table(self.target.credential, staging).await
        {
            warn!(table = %staging, error = %error, "could not drop staging table");
        }
    }
}

/// Declared schema extended with columns copied in from call arguments.
pub fn schema_with_extra(declared: Option<&TableSchema>, extra: &[FieldSchema]) -> Option<TableSchema> {
    declared.cloned().map(|mut schema| {
        schema.extend_missing(extra);
        schema
    })
}
