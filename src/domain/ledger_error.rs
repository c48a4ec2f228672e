//! Structured, non-fatal ledger error log.
//!
//! Every entry is local to one event, token or position. Recording an entry never aborts the
//! surrounding batch; it only lowers coverage or withholds a figure.

use crate::domain::{Address, ConditionId, EventKey, OutcomeIndex, TokenId};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerErrorKind {
    /// Ambiguous direction or a missing/invalid field. The event is skipped.
    MalformedEvent,
    /// No production mapping for a token. Counted in `total_count` only.
    UnmappedToken,
    /// A redemption has no cost basis under its outcome. Never booked as profit.
    MappingInconsistent,
    /// Open position on a condition that has not resolved yet.
    ResolutionMissing,
    /// Calibration ended above tolerance; its mapping is withheld.
    CalibrationDivergence,
    /// A sell or merge disposed of more shares than were held.
    InventoryShortfall,
}

impl LedgerErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerErrorKind::MalformedEvent => "malformed_event",
            LedgerErrorKind::UnmappedToken => "unmapped_token",
            LedgerErrorKind::MappingInconsistent => "mapping_inconsistent",
            LedgerErrorKind::ResolutionMissing => "resolution_missing",
            LedgerErrorKind::CalibrationDivergence => "calibration_divergence",
            LedgerErrorKind::InventoryShortfall => "inventory_shortfall",
        }
    }
}

impl fmt::Display for LedgerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LedgerErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "malformed_event" => Ok(LedgerErrorKind::MalformedEvent),
            "unmapped_token" => Ok(LedgerErrorKind::UnmappedToken),
            "mapping_inconsistent" => Ok(LedgerErrorKind::MappingInconsistent),
            "resolution_missing" => Ok(LedgerErrorKind::ResolutionMissing),
            "calibration_divergence" => Ok(LedgerErrorKind::CalibrationDivergence),
            "inventory_shortfall" => Ok(LedgerErrorKind::InventoryShortfall),
            other => Err(format!("unknown ledger error kind: {}", other)),
        }
    }
}

/// One entry of the structured error log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerError {
    pub kind: LedgerErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wallet: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition_id: Option<ConditionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome_index: Option<OutcomeIndex>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<TokenId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_key: Option<EventKey>,
    pub detail: String,
}

impl LedgerError {
    pub fn new(kind: LedgerErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            wallet: None,
            condition_id: None,
            outcome_index: None,
            token_id: None,
            event_key: None,
            detail: detail.into(),
        }
    }

    pub fn with_wallet(mut self, wallet: &Address) -> Self {
        self.wallet = Some(wallet.clone());
        self
    }

    pub fn with_condition(mut self, condition_id: &ConditionId) -> Self {
        self.condition_id = Some(condition_id.clone());
        self
    }

    pub fn with_outcome(mut self, outcome_index: OutcomeIndex) -> Self {
        self.outcome_index = Some(outcome_index);
        self
    }

    pub fn with_token(mut self, token_id: &TokenId) -> Self {
        self.token_id = Some(token_id.clone());
        self
    }

    pub fn with_event(mut self, key: &EventKey) -> Self {
        self.event_key = Some(key.clone());
        self
    }
}

/// Append-only collection of ledger errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorLog {
    entries: Vec<LedgerError>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, error: LedgerError) {
        tracing::warn!(
            kind = %error.kind,
            wallet = ?error.wallet.as_ref().map(|w| w.as_str()),
            condition = ?error.condition_id.as_ref().map(|c| c.as_str()),
            event = ?error.event_key.as_ref().map(|k| k.to_string()),
            "{}",
            error.detail
        );
        self.entries.push(error);
    }

    pub fn extend(&mut self, other: ErrorLog) {
        self.entries.extend(other.entries);
    }

    pub fn count(&self, kind: LedgerErrorKind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LedgerError> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_vec(self) -> Vec<LedgerError> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_log_counts_by_kind() {
        let mut log = ErrorLog::new();
        log.record(LedgerError::new(LedgerErrorKind::MalformedEvent, "bad sign"));
        log.record(LedgerError::new(LedgerErrorKind::MalformedEvent, "no tx hash"));
        log.record(
            LedgerError::new(LedgerErrorKind::UnmappedToken, "no mapping")
                .with_token(&TokenId::new("7")),
        );

        assert_eq!(log.len(), 3);
        assert_eq!(log.count(LedgerErrorKind::MalformedEvent), 2);
        assert_eq!(log.count(LedgerErrorKind::MappingInconsistent), 0);
    }

    #[test]
    fn test_kind_roundtrips_through_str() {
        for kind in [
            LedgerErrorKind::MalformedEvent,
            LedgerErrorKind::UnmappedToken,
            LedgerErrorKind::MappingInconsistent,
            LedgerErrorKind::ResolutionMissing,
            LedgerErrorKind::CalibrationDivergence,
            LedgerErrorKind::InventoryShortfall,
        ] {
            assert_eq!(kind.as_str().parse::<LedgerErrorKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_serialization_skips_empty_context() {
        let err = LedgerError::new(LedgerErrorKind::ResolutionMissing, "open")
            .with_wallet(&Address::new("0xAB"))
            .with_outcome(1);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "resolution_missing");
        assert_eq!(json["wallet"], "0xab");
        assert_eq!(json["outcome_index"], 1);
        assert!(json.get("token_id").is_none());
    }
}
