use crate::context::ControlContext;
use crate::dispatcher::CommandDispatcher;
use crate::error::{ControlError, Result};
use crate::metrics;
use crate::model::{AccountState, AnomalyRecord, Severity, TradeRecord};
use crate::persistence::audit::AuditEntry;
use crate::persistence::redb_store::StoreError;
use crate::persistence::store::PersistenceStore;
use crate::risk_policy::{CircuitBreakerThresholds, PolicyHandle};
use crate::trade_metrics;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

const HALT_KEY: &str = "trading_halt";
const STREAK_WINDOW: usize = 10;

/// Persisted halt flags: one global, one per strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HaltState {
    #[serde(default)]
    pub global: Option<String>,
    #[serde(default)]
    pub strategies: BTreeMap<String, String>,
}

/// Trading halt registry.
/// Set by emergency stops, cleared only by an explicit operator resume.
#[derive(Clone)]
pub struct TradingHalt {
    state: Arc<RwLock<HaltState>>,
    store: Option<Arc<PersistenceStore>>,
}

impl Default for TradingHalt {
    fn default() -> Self {
        Self::new()
    }
}

impl TradingHalt {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(HaltState::default())),
            store: None,
        }
    }

    /// Restore the halt flags persisted before a restart.
    pub fn load(store: Arc<PersistenceStore>) -> std::result::Result<Self, StoreError> {
        let state = match store.load_metadata(HALT_KEY)? {
            Some(value) => serde_json::from_value::<HaltState>(value)?,
            None => HaltState::default(),
        };
        if state.global.is_some() || !state.strategies.is_empty() {
            warn!(
                global = ?state.global,
                strategies = state.strategies.len(),
                "🚨 Restored active trading halt"
            );
        }
        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            store: Some(store),
        })
    }

    pub fn snapshot(&self) -> HaltState {
        self.state.read().clone()
    }

    /// Reason trading is halted for the strategy, global halt first.
    pub fn halt_reason(&self, strategy_id: &str) -> Option<String> {
        let state = self.state.read();
        state
            .global
            .clone()
            .or_else(|| state.strategies.get(strategy_id).cloned())
    }

    pub fn is_halted(&self, strategy_id: &str) -> bool {
        self.halt_reason(strategy_id).is_some()
    }

    pub fn halt_strategy(&self, strategy_id: &str, reason: &str) -> std::result::Result<(), StoreError> {
        let changed = {
            let mut state = self.state.write();
            state
                .strategies
                .insert(strategy_id.to_string(), reason.to_string())
                .is_none()
        };
        if changed {
            warn!(strategy_id, reason, "🚨 STRATEGY HALT ACTIVATED");
        }
        self.persist(strategy_id, true, reason)
    }

    pub fn halt_all(&self, reason: &str) -> std::result::Result<(), StoreError> {
        let prev = self.state.write().global.replace(reason.to_string());
        if prev.is_none() {
            warn!("🚨 SYSTEM HALT ACTIVATED: {}", reason);
        }
        self.persist("*", true, reason)
    }

    /// Lift one strategy's halt. Returns false when it was not halted.
    pub fn resume_strategy(&self, strategy_id: &str, reason: &str) -> std::result::Result<bool, StoreError> {
        let removed = self.state.write().strategies.remove(strategy_id).is_some();
        if removed {
            info!(strategy_id, reason, "✅ STRATEGY HALT LIFTED");
            self.persist(strategy_id, false, reason)?;
        }
        Ok(removed)
    }

    /// Lift the global halt and every strategy halt.
    pub fn resume_all(&self, reason: &str) -> std::result::Result<(), StoreError> {
        {
            let mut state = self.state.write();
            state.global = None;
            state.strategies.clear();
        }
        info!("✅ SYSTEM HALT LIFTED: {}", reason);
        self.persist("*", false, reason)
    }

    fn persist(&self, scope: &str, halted: bool, reason: &str) -> std::result::Result<(), StoreError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let snapshot = serde_json::to_value(self.snapshot())?;
        store.save_metadata(HALT_KEY, snapshot)?;
        store.record(
            AuditEntry::TradingHaltChanged {
                scope: scope.to_string(),
                halted,
                reason: reason.to_string(),
            },
            Utc::now(),
        )?;
        Ok(())
    }
}

/// Outcome of one breaker evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerCheck {
    pub should_break: bool,
    pub severity: Option<Severity>,
    pub reason: Option<String>,
    /// Anomaly written when the check tripped the breaker
    pub anomaly_id: Option<String>,
}

impl BreakerCheck {
    fn clear() -> Self {
        Self {
            should_break: false,
            severity: None,
            reason: None,
            anomaly_id: None,
        }
    }

    fn trip(severity: Severity, reason: String) -> Self {
        Self {
            should_break: true,
            severity: Some(severity),
            reason: Some(reason),
            anomaly_id: None,
        }
    }
}

/// Anomaly rules over today's trades (oldest first). First match wins.
pub fn evaluate(
    thresholds: &CircuitBreakerThresholds,
    todays_trades: &[TradeRecord],
    account: Option<&AccountState>,
    now: DateTime<Utc>,
) -> BreakerCheck {
    let recent = &todays_trades[todays_trades.len().saturating_sub(STREAK_WINDOW)..];
    let streak = trade_metrics::longest_losing_streak(recent);
    if streak >= thresholds.max_consecutive_losses {
        return BreakerCheck::trip(
            Severity::Critical,
            format!("{} consecutive losses detected", streak),
        );
    }

    if let Some(account) = account {
        let daily_loss = -todays_trades.iter().map(|t| t.profit).sum::<f64>();
        let limit = account.balance * thresholds.max_daily_loss_percent / 100.0;
        if account.balance > 0.0 && daily_loss > 0.0 && daily_loss >= limit {
            return BreakerCheck::trip(
                Severity::Critical,
                format!(
                    "Daily loss {:.2} reached {:.1}% of balance {:.2} (limit {:.1}%)",
                    daily_loss,
                    daily_loss / account.balance * 100.0,
                    account.balance,
                    thresholds.max_daily_loss_percent
                ),
            );
        }

        let drawdown = account.drawdown_percent();
        if drawdown >= thresholds.max_drawdown_percent {
            return BreakerCheck::trip(
                Severity::Critical,
                format!(
                    "Drawdown {:.2}% from peak equity {:.2} (limit {:.1}%)",
                    drawdown,
                    account.effective_peak(),
                    thresholds.max_drawdown_percent
                ),
            );
        }
    }

    let last_hour = trade_metrics::closed_within(todays_trades, now, Duration::minutes(60));
    if last_hour >= thresholds.max_trades_per_hour {
        return BreakerCheck::trip(
            Severity::High,
            format!(
                "Runaway strategy: {} trades in the last 60 minutes (limit {})",
                last_hour, thresholds.max_trades_per_hour
            ),
        );
    }

    if todays_trades.len() >= thresholds.min_trades_for_win_rate {
        let stats = trade_metrics::compute(todays_trades);
        if stats.win_rate < thresholds.min_win_rate {
            return BreakerCheck::trip(
                Severity::High,
                format!(
                    "Win rate {:.1}% over {} trades below minimum {:.1}%",
                    stats.win_rate, stats.total_trades, thresholds.min_win_rate
                ),
            );
        }
    }

    BreakerCheck::clear()
}

/// Continuous anomaly detection over executor trade history.
pub struct CircuitBreaker {
    store: Arc<PersistenceStore>,
    thresholds: PolicyHandle<CircuitBreakerThresholds>,
    dispatcher: Arc<CommandDispatcher>,
    ctx: ControlContext,
}

impl CircuitBreaker {
    pub fn new(
        store: Arc<PersistenceStore>,
        thresholds: PolicyHandle<CircuitBreakerThresholds>,
        dispatcher: Arc<CommandDispatcher>,
        ctx: ControlContext,
    ) -> Self {
        info!("⚡ CircuitBreaker Initialized");
        Self {
            store,
            thresholds,
            dispatcher,
            ctx,
        }
    }

    pub fn thresholds(&self) -> &PolicyHandle<CircuitBreakerThresholds> {
        &self.thresholds
    }

    pub fn check(&self, executor_id: &str, strategy_id: &str) -> Result<BreakerCheck> {
        let now = self.ctx.time.now();
        let trades = self.store.load_trades(
            Some(executor_id),
            Some(strategy_id),
            Some(trade_metrics::start_of_day(now)),
        )?;
        let account = self.store.load_account(executor_id)?;
        Ok(evaluate(
            &self.thresholds.current(),
            &trades,
            account.as_ref(),
            now,
        ))
    }

    /// Stop the strategy and record an unresolved anomaly.
    pub fn trigger(
        &self,
        executor_id: &str,
        strategy_id: &str,
        severity: Severity,
        reason: &str,
    ) -> Result<AnomalyRecord> {
        let now = self.ctx.time.now();

        let mut executors = vec![executor_id.to_string()];
        if let Some(strategy) = self.store.load_strategy(strategy_id)? {
            for id in strategy.executor_ids {
                if !executors.contains(&id) {
                    executors.push(id);
                }
            }
        }
        let stop_reason = format!("Circuit breaker: {}", reason);
        self.dispatcher
            .emergency_stop_strategy(strategy_id, &executors, &stop_reason)?;

        let anomaly = AnomalyRecord {
            id: self.ctx.id.new_id(),
            executor_id: Some(executor_id.to_string()),
            strategy_id: Some(strategy_id.to_string()),
            severity,
            description: reason.to_string(),
            triggered_at: now,
            resolved: false,
            resolved_at: None,
            resolution: None,
        };
        self.store.save_anomaly(&anomaly)?;
        self.store.record(
            AuditEntry::AnomalyRaised {
                anomaly_id: anomaly.id.clone(),
                severity: severity.to_string(),
                description: anomaly.description.clone(),
            },
            now,
        )?;
        metrics::inc_breaker_trips();
        error!(
            executor_id,
            strategy_id,
            severity = %severity,
            anomaly_id = %anomaly.id,
            "🔥 CIRCUIT BREAKER TRIPPED: {}",
            reason
        );
        Ok(anomaly)
    }

    pub fn check_and_trigger(&self, executor_id: &str, strategy_id: &str) -> Result<BreakerCheck> {
        let mut check = self.check(executor_id, strategy_id)?;
        let (true, Some(severity), Some(reason)) =
            (check.should_break, check.severity, check.reason.clone())
        else {
            return Ok(check);
        };

        // Already tripped: the open anomaly stands until an operator resets it
        if let Some(open) = self.open_anomaly(executor_id, strategy_id)? {
            check.anomaly_id = Some(open.id);
            return Ok(check);
        }
        if self.dispatcher.halt().is_halted(strategy_id) {
            info!(executor_id, strategy_id, "Breaker condition on a halted strategy: {}", reason);
            return Ok(check);
        }

        let anomaly = self.trigger(executor_id, strategy_id, severity, &reason)?;
        check.anomaly_id = Some(anomaly.id);
        Ok(check)
    }

    fn open_anomaly(&self, executor_id: &str, strategy_id: &str) -> Result<Option<AnomalyRecord>> {
        Ok(self
            .store
            .load_anomalies(true)?
            .into_iter()
            .filter(|a| {
                a.executor_id.as_deref() == Some(executor_id)
                    && a.strategy_id.as_deref() == Some(strategy_id)
            })
            .max_by_key(|a| a.triggered_at))
    }

    /// Close an anomaly. Trading stays halted until resumed separately.
    pub fn reset(&self, anomaly_id: &str, resolution: &str) -> Result<AnomalyRecord> {
        let mut anomaly = self
            .store
            .load_anomaly(anomaly_id)?
            .ok_or_else(|| ControlError::not_found("anomaly", anomaly_id))?;
        if anomaly.resolved {
            return Err(ControlError::InvalidState(format!(
                "Anomaly {} is already resolved",
                anomaly_id
            )));
        }

        let now = self.ctx.time.now();
        anomaly.resolved = true;
        anomaly.resolved_at = Some(now);
        anomaly.resolution = Some(resolution.to_string());
        self.store.save_anomaly(&anomaly)?;
        self.store.record(
            AuditEntry::AnomalyResolved {
                anomaly_id: anomaly_id.to_string(),
                resolution: resolution.to_string(),
            },
            now,
        )?;
        info!(anomaly_id, resolution, "✅ Anomaly resolved");
        Ok(anomaly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trade_metrics::tests::{trade_at, trades};
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn account(balance: f64, equity: f64, peak: Option<f64>) -> AccountState {
        AccountState {
            executor_id: "exec-a".into(),
            balance,
            equity,
            peak_equity: peak,
            open_positions: 0,
            spreads: HashMap::new(),
            updated_at: Utc::now(),
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_halt_logic() {
        let halt = TradingHalt::new();
        assert!(!halt.is_halted("s-1"), "Should default to not halted");

        halt.halt_strategy("s-1", "Test Reason").unwrap();
        assert!(halt.is_halted("s-1"));
        assert!(!halt.is_halted("s-2"));

        halt.halt_all("Global").unwrap();
        assert_eq!(halt.halt_reason("s-2").as_deref(), Some("Global"));

        halt.resume_all("Test Resume").unwrap();
        assert!(!halt.is_halted("s-1"));
    }

    #[test]
    fn test_halt_survives_reload() {
        let store = crate::persistence::store::tests::create_test_persistence();
        let halt = TradingHalt::load(store.clone()).unwrap();
        halt.halt_strategy("s-1", "5 consecutive losses detected").unwrap();

        let reloaded = TradingHalt::load(store).unwrap();
        assert!(reloaded.is_halted("s-1"));
        assert!(reloaded.resume_strategy("s-1", "operator").unwrap());
        assert!(!reloaded.resume_strategy("s-1", "operator").unwrap());
    }

    #[test]
    fn test_five_consecutive_losses_is_critical() {
        let sample = trades(&[10.0, 5.0, -1.0, -1.0, -1.0, -1.0, -1.0]);
        let check = evaluate(&CircuitBreakerThresholds::default(), &sample, None, noon());
        assert!(check.should_break);
        assert_eq!(check.severity, Some(Severity::Critical));
        assert!(check.reason.unwrap().contains("5 consecutive losses"));
    }

    #[test]
    fn test_streak_only_counts_last_ten() {
        // Five losses, then ten wins push them out of the window
        let mut profits = vec![-1.0; 5];
        profits.extend([1.0; 10]);
        let check = evaluate(&CircuitBreakerThresholds::default(), &trades(&profits), None, noon());
        assert!(!check.should_break);
    }

    #[test]
    fn test_daily_loss_against_balance() {
        let sample = trades(&[-600.0, 100.0]);
        let check = evaluate(
            &CircuitBreakerThresholds::default(),
            &sample,
            Some(&account(5_000.0, 5_000.0, None)),
            noon(),
        );
        assert_eq!(check.severity, Some(Severity::Critical));
        assert!(check.reason.unwrap().starts_with("Daily loss 500.00"));
    }

    #[test]
    fn test_drawdown_uses_high_water_mark() {
        let check = evaluate(
            &CircuitBreakerThresholds::default(),
            &[],
            Some(&account(8_000.0, 7_900.0, Some(10_000.0))),
            noon(),
        );
        assert_eq!(check.severity, Some(Severity::Critical));
        assert!(check.reason.unwrap().contains("Drawdown 21.00%"));
    }

    #[test]
    fn test_runaway_strategy_is_high() {
        let now = noon();
        let sample: Vec<_> = (0..20)
            .map(|i| trade_at(i, if i % 2 == 0 { 1.0 } else { -1.0 }, now - Duration::minutes(50 - i as i64)))
            .collect();
        let check = evaluate(&CircuitBreakerThresholds::default(), &sample, None, now);
        assert_eq!(check.severity, Some(Severity::High));
        assert!(check.reason.unwrap().contains("20 trades in the last 60 minutes"));
    }

    #[test]
    fn test_low_win_rate_needs_enough_trades() {
        // One win in four, spread out so the hourly rule stays quiet
        let pattern = |n: usize| -> Vec<f64> {
            (0..n).map(|i| if i % 4 == 0 { 2.0 } else { -1.0 }).collect()
        };
        let spaced = |profits: Vec<f64>| -> Vec<TradeRecord> {
            let start = Utc.with_ymd_and_hms(2026, 3, 2, 0, 5, 0).unwrap();
            profits
                .into_iter()
                .enumerate()
                .map(|(i, p)| trade_at(i, p, start + Duration::minutes(i as i64 * 30)))
                .collect()
        };
        let late = Utc.with_ymd_and_hms(2026, 3, 2, 23, 0, 0).unwrap();

        let few = evaluate(&CircuitBreakerThresholds::default(), &spaced(pattern(19)), None, late);
        assert!(!few.should_break);

        let enough = evaluate(&CircuitBreakerThresholds::default(), &spaced(pattern(20)), None, late);
        assert_eq!(enough.severity, Some(Severity::High));
        assert!(enough.reason.unwrap().starts_with("Win rate 25.0%"));
    }

    #[test]
    fn test_first_match_wins() {
        let sample = trades(&[-200.0, -200.0, -200.0, -200.0, -200.0]);
        let check = evaluate(
            &CircuitBreakerThresholds::default(),
            &sample,
            Some(&account(1_000.0, 500.0, Some(1_000.0))),
            noon(),
        );
        assert!(check.reason.unwrap().contains("consecutive losses"));
    }
}
