//! Built-in task handlers.

mod api;
mod dataset;
mod query;
mod report;

pub use api::ApiHandler;
pub use dataset::DatasetHandler;
pub use query::QueryHandler;
pub use report::ReportHandler;
