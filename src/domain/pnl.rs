//! Wallet and market P&L reports.

use crate::domain::{Address, ConditionId, Decimal, TimeMs};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Accounting policy for unredeemed positions on resolved markets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementPolicy {
    /// Cash-basis: unredeemed winner value is reported separately and excluded from the total
    /// until a REDEEM is observed. Losers are written off at resolution.
    #[default]
    Asymmetric,
    /// Mark-to-resolution: unredeemed winner value is unrealized P&L immediately.
    Symmetric,
    /// Net USDC in minus USDC out. Open inventory carries no value.
    CashFlowOnly,
}

impl SettlementPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementPolicy::Asymmetric => "asymmetric",
            SettlementPolicy::Symmetric => "symmetric",
            SettlementPolicy::CashFlowOnly => "cash_flow_only",
        }
    }
}

impl fmt::Display for SettlementPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SettlementPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asymmetric" => Ok(SettlementPolicy::Asymmetric),
            "symmetric" => Ok(SettlementPolicy::Symmetric),
            "cash_flow_only" | "cashflowonly" | "cash_flow" => Ok(SettlementPolicy::CashFlowOnly),
            other => Err(format!(
                "must be asymmetric, symmetric, or cash_flow_only, got {}",
                other
            )),
        }
    }
}

/// Inclusive time window. `None` bounds are open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PnlWindow {
    pub from_ms: Option<TimeMs>,
    pub to_ms: Option<TimeMs>,
}

impl PnlWindow {
    pub fn all_time() -> Self {
        Self::default()
    }

    pub fn between(from_ms: Option<TimeMs>, to_ms: Option<TimeMs>) -> Self {
        Self { from_ms, to_ms }
    }

    pub fn is_unbounded(&self) -> bool {
        self.from_ms.is_none() && self.to_ms.is_none()
    }

    pub fn contains(&self, t: TimeMs) -> bool {
        self.from_ms.map(|from| t >= from).unwrap_or(true)
            && self.to_ms.map(|to| t <= to).unwrap_or(true)
    }
}

/// How much of a wallet's activity the figures actually cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coverage {
    pub resolved_count: usize,
    pub total_count: usize,
    /// `100 * resolved_count / total_count`, rounded to 4 dp. Zero when there are no positions.
    pub coverage_pct: Decimal,
    /// Set when coverage is below the floor or there is nothing to cover.
    pub insufficient_coverage: bool,
}

impl Coverage {
    pub fn compute(resolved_count: usize, total_count: usize, floor_pct: Decimal) -> Self {
        let coverage_pct = if total_count == 0 {
            Decimal::zero()
        } else {
            (Decimal::from_u64(resolved_count as u64) * Decimal::hundred()
                / Decimal::from_u64(total_count as u64))
            .round_dp(4)
        };
        Self {
            resolved_count,
            total_count,
            coverage_pct,
            insufficient_coverage: total_count == 0 || coverage_pct < floor_pct,
        }
    }
}

/// Wallet-level P&L for one window. Always carries coverage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletPnL {
    pub wallet: Address,
    pub window: PnlWindow,
    pub policy: SettlementPolicy,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_pnl: Decimal,
    /// Asymmetric policy only: value of resolved-but-unredeemed winning tokens.
    pub unrealized_winner_value: Decimal,
    #[serde(flatten)]
    pub coverage: Coverage,
    pub mapping_version: i64,
}

impl WalletPnL {
    pub fn new(
        wallet: Address,
        window: PnlWindow,
        policy: SettlementPolicy,
        realized_pnl: Decimal,
        unrealized_pnl: Decimal,
        unrealized_winner_value: Decimal,
        coverage: Coverage,
        mapping_version: i64,
    ) -> Self {
        Self {
            wallet,
            window,
            policy,
            realized_pnl,
            unrealized_pnl,
            total_pnl: realized_pnl + unrealized_pnl,
            unrealized_winner_value,
            coverage,
            mapping_version,
        }
    }

    pub fn coverage_pct(&self) -> Decimal {
        self.coverage.coverage_pct
    }

    pub fn insufficient_coverage(&self) -> bool {
        self.coverage.insufficient_coverage
    }
}

/// Per-condition rollup across wallets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketPnL {
    pub condition_id: ConditionId,
    pub policy: SettlementPolicy,
    pub resolved: bool,
    pub wallet_count: usize,
    pub position_count: usize,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_pnl: Decimal,
    pub unrealized_winner_value: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coverage_floor() {
        let floor = Decimal::from_i64(2);
        let low = Coverage::compute(1, 100, floor);
        assert_eq!(low.coverage_pct, Decimal::one());
        assert!(low.insufficient_coverage);

        let ok = Coverage::compute(3, 4, floor);
        assert_eq!(ok.coverage_pct, Decimal::from_i64(75));
        assert!(!ok.insufficient_coverage);
    }

    #[test]
    fn test_empty_coverage_is_insufficient_not_zero_profit() {
        let none = Coverage::compute(0, 0, Decimal::zero());
        assert_eq!(none.coverage_pct, Decimal::zero());
        assert!(none.insufficient_coverage);
    }

    #[test]
    fn test_window_contains() {
        let w = PnlWindow::between(Some(TimeMs::new(10)), Some(TimeMs::new(20)));
        assert!(w.contains(TimeMs::new(10)));
        assert!(w.contains(TimeMs::new(20)));
        assert!(!w.contains(TimeMs::new(21)));
        assert!(PnlWindow::all_time().contains(TimeMs::new(i64::MIN)));
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!(
            "Symmetric".parse::<SettlementPolicy>().unwrap(),
            SettlementPolicy::Symmetric
        );
        assert_eq!(
            "cash_flow_only".parse::<SettlementPolicy>().unwrap(),
            SettlementPolicy::CashFlowOnly
        );
        assert!("mark".parse::<SettlementPolicy>().is_err());
        assert_eq!(SettlementPolicy::default(), SettlementPolicy::Asymmetric);
    }

    #[test]
    fn test_wallet_pnl_serializes_coverage_inline() {
        let pnl = WalletPnL::new(
            Address::new("0x1"),
            PnlWindow::all_time(),
            SettlementPolicy::Asymmetric,
            Decimal::from_i64(5),
            Decimal::from_i64(-2),
            Decimal::zero(),
            Coverage::compute(1, 2, Decimal::from_i64(2)),
            1,
        );
        assert_eq!(pnl.total_pnl, Decimal::from_i64(3));
        let json = serde_json::to_value(&pnl).unwrap();
        assert_eq!(json["coverage_pct"], 50.0);
        assert_eq!(json["insufficient_coverage"], false);
    }
}
