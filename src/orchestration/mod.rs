//! Coordination of ingestion, mapping derivation, compilation and P&L queries.

use crate::compile::CompileError;
use crate::datasource::FeedError;
use thiserror::Error;

pub mod ingest;
pub mod mapping;
pub mod orchestrator;

pub use ingest::{IngestReport, Ingestor};
pub use mapping::{calibrate_condition, refresh_mappings, CalibrationReport, MappingRefresh};
pub use orchestrator::Orchestrator;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}
