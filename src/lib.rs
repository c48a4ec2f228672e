pub mod api;
pub mod compile;
pub mod config;
pub mod datasource;
pub mod db;
pub mod domain;
pub mod engine;
pub mod error;
pub mod orchestration;

pub use compile::{CompileReport, Compiler};
pub use config::Config;
pub use datasource::{FeedSource, FileFeedSource, MockFeedSource};
pub use db::{init_db, Repository};
pub use domain::{
    Address, ConditionId, Decimal, LedgerError, LedgerErrorKind, MappingSnapshot, PnlWindow,
    SettlementPolicy, TimeMs, TokenId, WalletPnL,
};
pub use error::AppError;
pub use orchestration::{Ingestor, Orchestrator, PipelineError};
