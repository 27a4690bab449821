use crate::model::{AccountState, OrderRequest, ParameterSet, RiskSimulation, Side, TradeRecord};
use crate::parameter_validator::{ChangeCheck, ParameterCheck, ParameterValidator, ValidationReport};
use crate::risk_policy::{PolicyHandle, SafetyLimits};
use crate::risk_simulation;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Executor state a pre-trade check is evaluated against.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SafetyMetrics {
    /// Realized P&L of the current UTC day
    pub daily_pnl: f64,
    pub open_positions: u32,
    pub drawdown_percent: f64,
    /// Spread of the order's symbol, if reported
    pub spread_points: Option<f64>,
}

impl SafetyMetrics {
    pub fn from_state(
        account: Option<&AccountState>,
        todays_trades: &[TradeRecord],
        symbol: &str,
    ) -> Self {
        Self {
            daily_pnl: todays_trades.iter().map(|t| t.profit).sum(),
            open_positions: account.map_or(0, |a| a.open_positions),
            drawdown_percent: account.map_or(0.0, |a| a.drawdown_percent()),
            spread_points: account.and_then(|a| a.spreads.get(symbol).copied()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SafetyViolation {
    EmptySymbol,
    InvalidVolume(Decimal),
    InvalidSide(Side),
    DailyLossLimitExceeded { current_loss: f64, limit: f64 },
    MaxPositionsReached { current: u32, limit: u32 },
    LotSizeExceeded { volume: f64, limit: f64 },
    DrawdownLimitExceeded { current: f64, limit: f64 },
    SpreadTooWide { current: f64, limit: f64 },
}

impl std::fmt::Display for SafetyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SafetyViolation::EmptySymbol => write!(f, "Order symbol is empty"),
            SafetyViolation::InvalidVolume(v) => write!(f, "Invalid volume {} (<= 0)", v),
            SafetyViolation::InvalidSide(s) => {
                write!(f, "Invalid side {} (expected BUY or SELL)", s)
            }
            SafetyViolation::DailyLossLimitExceeded {
                current_loss,
                limit,
            } => write!(
                f,
                "Daily loss limit hit: {:.2} >= {:.2}",
                current_loss, limit
            ),
            SafetyViolation::MaxPositionsReached { current, limit } => write!(
                f,
                "Too many open positions: {} >= Limit {}",
                current, limit
            ),
            SafetyViolation::LotSizeExceeded { volume, limit } => write!(
                f,
                "Volume {:.2} exceeds max lot size {:.2}",
                volume, limit
            ),
            SafetyViolation::DrawdownLimitExceeded { current, limit } => write!(
                f,
                "Drawdown {:.2}% >= limit {:.2}%",
                current, limit
            ),
            SafetyViolation::SpreadTooWide { current, limit } => write!(
                f,
                "Spread {:.1} points exceeds max {:.1}",
                current, limit
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SafetyCheck {
    pub violations: Vec<SafetyViolation>,
}

impl SafetyCheck {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.violations.iter().map(|v| v.to_string()).collect()
    }
}

/// Independent, cumulative pre-trade checks. Pure in its inputs.
pub fn evaluate_order(
    limits: &SafetyLimits,
    order: &OrderRequest,
    metrics: &SafetyMetrics,
) -> SafetyCheck {
    let mut violations = Vec::new();

    if order.symbol.trim().is_empty() {
        violations.push(SafetyViolation::EmptySymbol);
    }
    if order.volume <= Decimal::ZERO {
        violations.push(SafetyViolation::InvalidVolume(order.volume));
    }
    if !order.side.is_order_side() {
        violations.push(SafetyViolation::InvalidSide(order.side));
    }

    let daily_loss = (-metrics.daily_pnl).max(0.0);
    if daily_loss >= limits.max_daily_loss {
        violations.push(SafetyViolation::DailyLossLimitExceeded {
            current_loss: daily_loss,
            limit: limits.max_daily_loss,
        });
    }

    if metrics.open_positions >= limits.max_positions {
        violations.push(SafetyViolation::MaxPositionsReached {
            current: metrics.open_positions,
            limit: limits.max_positions,
        });
    }

    let volume = order.volume.to_f64().unwrap_or(f64::MAX);
    if volume > limits.max_lot_size {
        violations.push(SafetyViolation::LotSizeExceeded {
            volume,
            limit: limits.max_lot_size,
        });
    }

    if metrics.drawdown_percent >= limits.max_drawdown_percent {
        violations.push(SafetyViolation::DrawdownLimitExceeded {
            current: metrics.drawdown_percent,
            limit: limits.max_drawdown_percent,
        });
    }

    if let Some(spread) = metrics.spread_points {
        if spread > limits.max_spread_points {
            violations.push(SafetyViolation::SpreadTooWide {
                current: spread,
                limit: limits.max_spread_points,
            });
        }
    }

    SafetyCheck { violations }
}

/// Admission control for orders and parameter bundles.
pub struct SafetyGate {
    limits: PolicyHandle<SafetyLimits>,
    validator: ParameterValidator,
}

impl SafetyGate {
    pub fn new(limits: PolicyHandle<SafetyLimits>, validator: ParameterValidator) -> Self {
        info!("🛡️ SafetyGate Initialized");
        Self { limits, validator }
    }

    pub fn limits(&self) -> &PolicyHandle<SafetyLimits> {
        &self.limits
    }

    /// Reads the limits fresh, then evaluates.
    pub fn check_before_trade(&self, order: &OrderRequest, metrics: &SafetyMetrics) -> SafetyCheck {
        let check = evaluate_order(&self.limits.current(), order, metrics);
        if !check.passed() {
            warn!(
                symbol = %order.symbol,
                reasons = ?check.reasons(),
                "🛑 Pre-trade check failed"
            );
        }
        check
    }

    pub fn validate_parameter(&self, name: &str, value: f64) -> ParameterCheck {
        self.validator.validate_parameter(name, value)
    }

    pub fn validate_change(&self, name: &str, old: f64, new: f64) -> ChangeCheck {
        self.validator.validate_change(name, old, new)
    }

    pub fn validate_parameter_set(
        &self,
        current: &ParameterSet,
        proposed: &ParameterSet,
    ) -> ValidationReport {
        let max_risk = self.limits.current().max_risk_per_trade;
        self.validator
            .validate_parameter_set(current, proposed, max_risk)
    }

    pub fn simulate_risk_impact(
        &self,
        trades: &[TradeRecord],
        current: &ParameterSet,
        proposed: &ParameterSet,
    ) -> RiskSimulation {
        risk_simulation::simulate_risk_impact(trades, current, proposed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OrderType;
    use rust_decimal_macros::dec;

    fn order(symbol: &str, side: Side, volume: Decimal) -> OrderRequest {
        OrderRequest {
            symbol: symbol.into(),
            side,
            volume,
            order_type: OrderType::Market,
            price: None,
            stop_loss: None,
            take_profit: None,
            comment: None,
        }
    }

    #[test]
    fn test_clean_order_passes() {
        let check = evaluate_order(
            &SafetyLimits::default(),
            &order("EURUSD", Side::Buy, dec!(0.5)),
            &SafetyMetrics::default(),
        );
        assert!(check.passed());
    }

    #[test]
    fn test_all_failures_reported_together() {
        let metrics = SafetyMetrics {
            daily_pnl: -600.0,
            open_positions: 5,
            drawdown_percent: 25.0,
            spread_points: Some(45.0),
        };
        let check = evaluate_order(
            &SafetyLimits::default(),
            &order("", Side::Long, dec!(2.0)),
            &metrics,
        );
        assert!(!check.passed());
        assert_eq!(check.violations.len(), 7);
        assert_eq!(check.violations[0], SafetyViolation::EmptySymbol);
        assert!(matches!(check.violations[1], SafetyViolation::InvalidSide(Side::Long)));
    }

    #[test]
    fn test_zero_volume_is_malformed() {
        let check = evaluate_order(
            &SafetyLimits::default(),
            &order("EURUSD", Side::Sell, dec!(0)),
            &SafetyMetrics::default(),
        );
        assert_eq!(check.violations, vec![SafetyViolation::InvalidVolume(dec!(0))]);
    }

    #[test]
    fn test_identical_inputs_identical_outputs() {
        let limits = SafetyLimits::default();
        let o = order("GBPUSD", Side::Buy, dec!(1.5));
        let metrics = SafetyMetrics {
            daily_pnl: -100.0,
            open_positions: 2,
            drawdown_percent: 21.0,
            spread_points: None,
        };
        let first = evaluate_order(&limits, &o, &metrics);
        for _ in 0..10 {
            let again = evaluate_order(&limits, &o, &metrics);
            assert_eq!(again, first);
            assert_eq!(again.reasons(), first.reasons());
        }
    }

    #[test]
    fn test_gate_reads_limits_fresh() {
        let handle = PolicyHandle::new(SafetyLimits::default());
        let gate = SafetyGate::new(handle.clone(), ParameterValidator::default());
        let o = order("EURUSD", Side::Buy, dec!(0.8));
        assert!(gate.check_before_trade(&o, &SafetyMetrics::default()).passed());

        handle
            .update(SafetyLimits {
                max_lot_size: 0.5,
                ..SafetyLimits::default()
            })
            .unwrap();
        assert!(!gate.check_before_trade(&o, &SafetyMetrics::default()).passed());
    }

    #[test]
    fn test_metrics_from_state() {
        use crate::trade_metrics::tests::trades;
        use std::collections::HashMap;

        let account = AccountState {
            executor_id: "exec-a".into(),
            balance: 1_000.0,
            equity: 900.0,
            peak_equity: Some(1_000.0),
            open_positions: 3,
            spreads: HashMap::from([("EURUSD".to_string(), 12.0)]),
            updated_at: chrono::Utc::now(),
        };
        let metrics = SafetyMetrics::from_state(Some(&account), &trades(&[-30.0, 10.0]), "EURUSD");
        assert_eq!(metrics.daily_pnl, -20.0);
        assert_eq!(metrics.open_positions, 3);
        assert!((metrics.drawdown_percent - 10.0).abs() < 1e-9);
        assert_eq!(metrics.spread_points, Some(12.0));
    }
}
