//! Domain types and determinism layer for the outcome ledger.
//!
//! This module provides:
//! - Lossless numeric handling via the Decimal wrapper
//! - Domain primitives: TimeMs, Address, ConditionId, TokenId, TxHash, Side
//! - Canonical trade and settlement events keyed by (tx_hash, log_index)
//! - Token mappings, versioned snapshots and market resolutions
//! - The structured ledger error log and P&L report types

pub mod decimal;
pub mod event;
pub mod ledger_error;
pub mod mapping;
pub mod ordering;
pub mod pnl;
pub mod primitives;
pub mod resolution;

pub use decimal::Decimal;
pub use event::{EventKey, SettlementEvent, SettlementKind, TradeEvent};
pub use ledger_error::{ErrorLog, LedgerError, LedgerErrorKind};
pub use mapping::{
    ConditionMeta, MappingSnapshot, MappingSource, MappingStatus, TokenOutcomeMapping,
};
pub use ordering::{sort_settlements_deterministic, sort_trades_deterministic, EventOrderingKey};
pub use pnl::{Coverage, MarketPnL, PnlWindow, SettlementPolicy, WalletPnL};
pub use primitives::{
    normalize_hex, Address, AddressParseError, ConditionId, OutcomeIndex, Side, TimeMs, TokenId,
    TxHash,
};
pub use resolution::{MarketResolution, ResolutionError};
