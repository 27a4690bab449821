use crate::advisory::{AdvisoryError, OptimizationContext, ParameterAdvisor};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::OptimizationConfig;
use crate::context::ControlContext;
use crate::dispatcher::CommandDispatcher;
use crate::error::{ControlError, Result};
use crate::metrics;
use crate::model::{
    CommandPriority, OptimizationStatus, ParameterOptimization, PerformanceMetrics, StrategyRecord,
};
use crate::persistence::audit::AuditEntry;
use crate::persistence::store::PersistenceStore;
use crate::rollback::RollbackManager;
use crate::safety_gate::SafetyGate;
use crate::trade_metrics;
use chrono::Duration as ChronoDuration;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Snapshot owner when a strategy has no executors assigned yet.
const ANY_EXECUTOR: &str = "*";

/// Gating decision of one optimization run.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OptimizationOutcome {
    pub optimization_id: String,
    pub strategy_id: String,
    /// APPROVED, PENDING_APPROVAL or REJECTED
    pub status: OptimizationStatus,
    pub confidence: f64,
    pub requires_user_approval: bool,
    pub applied: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MonitorOutcome {
    NotMonitored,
    InsufficientData { trades: usize, required: usize },
    Healthy,
    Promoted,
    RolledBack { reason: String },
}

/// Drives optimizations from the advisory request to ACTIVE or ROLLED_BACK.
pub struct OptimizationSupervisor {
    store: Arc<PersistenceStore>,
    gate: Arc<SafetyGate>,
    breaker: Arc<CircuitBreaker>,
    rollback: Arc<RollbackManager>,
    dispatcher: Arc<CommandDispatcher>,
    advisor: Arc<dyn ParameterAdvisor>,
    config: OptimizationConfig,
    advisory_timeout: Duration,
    ctx: ControlContext,
}

impl OptimizationSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<PersistenceStore>,
        gate: Arc<SafetyGate>,
        breaker: Arc<CircuitBreaker>,
        rollback: Arc<RollbackManager>,
        dispatcher: Arc<CommandDispatcher>,
        advisor: Arc<dyn ParameterAdvisor>,
        config: OptimizationConfig,
        advisory_timeout: Duration,
        ctx: ControlContext,
    ) -> Self {
        Self {
            store,
            gate,
            breaker,
            rollback,
            dispatcher,
            advisor,
            config,
            advisory_timeout,
            ctx,
        }
    }

    pub fn optimization(&self, optimization_id: &str) -> Result<ParameterOptimization> {
        self.store
            .load_optimization(optimization_id)?
            .ok_or_else(|| ControlError::not_found("optimization", optimization_id))
    }

    pub fn optimizations(&self, strategy_id: Option<&str>) -> Result<Vec<ParameterOptimization>> {
        Ok(self.store.load_optimizations(strategy_id, None)?)
    }

    /// Guarded status change, persisted and audited.
    fn transition(
        &self,
        optimization: &mut ParameterOptimization,
        next: OptimizationStatus,
        reason: impl Into<String>,
    ) -> Result<()> {
        let reason = reason.into();
        let from = optimization.status;
        let now = self.ctx.time.now();
        optimization
            .transition(next, now, Some(reason.clone()))
            .map_err(ControlError::InvalidState)?;
        self.store.save_optimization(optimization)?;
        self.store.record(
            AuditEntry::OptimizationTransition {
                optimization_id: optimization.id.clone(),
                from: from.to_string(),
                to: next.to_string(),
                reason: Some(reason.clone()),
            },
            now,
        )?;
        info!(
            optimization_id = %optimization.id,
            strategy_id = %optimization.strategy_id,
            "🔄 Optimization {} → {}: {}",
            from,
            next,
            reason
        );
        Ok(())
    }

    /// Mark the run ERROR and hand the cause back.
    fn fail(&self, optimization: &mut ParameterOptimization, err: ControlError) -> ControlError {
        error!(optimization_id = %optimization.id, error = %err, "❌ Optimization failed");
        if let Err(e) = self.transition(optimization, OptimizationStatus::Error, err.to_string()) {
            error!(optimization_id = %optimization.id, error = %e, "❌ Could not record optimization error");
        }
        err
    }

    fn outcome(&self, optimization: &ParameterOptimization, message: String) -> OptimizationOutcome {
        OptimizationOutcome {
            optimization_id: optimization.id.clone(),
            strategy_id: optimization.strategy_id.clone(),
            status: optimization.status,
            confidence: optimization.confidence_score,
            requires_user_approval: optimization.requires_user_approval,
            applied: optimization.applied_at.is_some(),
            message,
        }
    }

    fn rejected(
        &self,
        optimization: &mut ParameterOptimization,
        message: String,
    ) -> Result<OptimizationOutcome> {
        self.transition(optimization, OptimizationStatus::Rejected, message.clone())?;
        warn!(optimization_id = %optimization.id, "🛑 Optimization rejected: {}", message);
        Ok(self.outcome(optimization, message))
    }

    fn affected_executors(strategy: &StrategyRecord) -> BTreeSet<String> {
        strategy.executor_ids.iter().cloned().collect()
    }

    /// One end-to-end optimization run for a strategy.
    pub async fn run_optimization(&self, strategy_id: &str, force: bool) -> Result<OptimizationOutcome> {
        let strategy = self
            .store
            .load_strategy(strategy_id)?
            .ok_or_else(|| ControlError::not_found("strategy", strategy_id))?;
        let executors = Self::affected_executors(&strategy);

        // Baseline snapshots precede the record so the first run is always rollback-able
        let mut snapshot_at = self.ctx.time.now();
        if executors.is_empty() {
            snapshot_at = self
                .rollback
                .create_snapshot(strategy_id, ANY_EXECUTOR, &strategy.parameters, "Baseline before optimization")?
                .created_at;
        }
        for executor_id in &executors {
            snapshot_at = self
                .rollback
                .create_snapshot(strategy_id, executor_id, &strategy.parameters, "Baseline before optimization")?
                .created_at;
        }
        let created_at = self
            .ctx
            .time
            .now()
            .max(snapshot_at + ChronoDuration::milliseconds(1));

        let mut optimization = ParameterOptimization::new(
            self.ctx.id.new_id(),
            strategy_id,
            strategy.parameters.clone(),
            executors.clone(),
            force,
            created_at,
        );
        self.store.save_optimization(&optimization)?;
        metrics::inc_optimizations();
        info!(
            optimization_id = %optimization.id,
            strategy_id,
            force,
            "🧠 Optimization started"
        );

        let trades = match self
            .store
            .load_recent_trades(strategy_id, self.config.max_trades)
        {
            Ok(trades) => trades,
            Err(e) => return Err(self.fail(&mut optimization, e.into())),
        };
        if trades.len() < self.config.min_trades && !force {
            return self.rejected(
                &mut optimization,
                format!(
                    "Insufficient trade history: {} trades (minimum {})",
                    trades.len(),
                    self.config.min_trades
                ),
            );
        }

        let baseline = trade_metrics::compute(&trades);
        optimization
            .set_baseline(baseline.clone())
            .map_err(ControlError::InvalidState)?;
        self.store.save_optimization(&optimization)?;

        for executor_id in &executors {
            let check = match self.breaker.check_and_trigger(executor_id, strategy_id) {
                Ok(check) => check,
                Err(e) => return Err(self.fail(&mut optimization, e)),
            };
            if check.should_break {
                let reason = check.reason.unwrap_or_default();
                self.rejected(
                    &mut optimization,
                    format!("Circuit breaker tripped on {}: {}", executor_id, reason),
                )?;
                return Err(ControlError::CircuitBreakerTrip(reason));
            }
        }

        let context = OptimizationContext::new(&strategy, &trades, baseline);
        let advice = match tokio::time::timeout(
            self.advisory_timeout,
            self.advisor.suggest_parameters(&context),
        )
        .await
        {
            Ok(Ok(advice)) => advice,
            Ok(Err(e)) => return Err(self.fail(&mut optimization, e.into())),
            Err(_) => {
                let e = AdvisoryError::Timeout(self.advisory_timeout);
                return Err(self.fail(&mut optimization, e.into()));
            }
        };

        optimization.confidence_score = advice.confidence.clamp(0.0, 1.0);
        optimization.reasoning = Some(advice.reasoning.clone());
        optimization.suggestions = advice.suggestions.clone();
        if advice.suggestions.is_empty() {
            return self.rejected(
                &mut optimization,
                "Advisory model returned no suggestions".to_string(),
            );
        }

        let mut proposed = strategy.parameters.clone();
        for suggestion in &advice.suggestions {
            proposed.insert(suggestion.parameter.clone(), suggestion.suggested_value);
        }
        optimization.proposed_parameters = proposed.clone();

        let report = self
            .gate
            .validate_parameter_set(&strategy.parameters, &proposed);
        optimization.validation_warnings = report.warnings.clone();
        if !report.valid {
            self.rejected(
                &mut optimization,
                format!("Validation failed: {}", report.errors.join("; ")),
            )?;
            return Err(ControlError::Validation(report.errors.join("; ")));
        }

        let simulation = self
            .gate
            .simulate_risk_impact(&trades, &strategy.parameters, &proposed);
        optimization.risk_simulation = Some(simulation.clone());
        if !simulation.acceptable {
            self.rejected(
                &mut optimization,
                format!("Risk simulation failed: {}", simulation.reasons.join("; ")),
            )?;
            return Err(ControlError::RiskRejection(simulation.reasons));
        }

        let confidence = optimization.confidence_score;
        let pct = confidence * 100.0;
        if confidence >= self.config.auto_apply_confidence {
            self.transition(
                &mut optimization,
                OptimizationStatus::Approved,
                format!("Auto-approved at confidence {:.1}%", pct),
            )?;
            let decision = optimization.status;
            if let Err(e) = self.apply(&mut optimization) {
                return Err(self.fail(&mut optimization, e));
            }
            let mut outcome = self.outcome(
                &optimization,
                format!(
                    "Confidence {:.1}% meets the {:.0}% auto-apply threshold; parameters pushed to {} executor(s)",
                    pct,
                    self.config.auto_apply_confidence * 100.0,
                    optimization.affected_executors.len()
                ),
            );
            outcome.status = decision;
            Ok(outcome)
        } else if confidence >= self.config.approval_confidence {
            optimization.requires_user_approval = true;
            let message = format!(
                "Confidence {:.1}% requires user approval (auto-apply at {:.0}%)",
                pct,
                self.config.auto_apply_confidence * 100.0
            );
            self.transition(&mut optimization, OptimizationStatus::PendingApproval, message.clone())?;
            Ok(self.outcome(&optimization, message))
        } else {
            self.rejected(
                &mut optimization,
                format!(
                    "Confidence {:.1}% below {:.0}% minimum threshold",
                    pct,
                    self.config.approval_confidence * 100.0
                ),
            )
        }
    }

    /// Snapshot, push and move an APPROVED optimization to TESTING.
    fn apply(&self, optimization: &mut ParameterOptimization) -> Result<()> {
        if optimization.status != OptimizationStatus::Approved {
            return Err(ControlError::InvalidState(format!(
                "Optimization {} is {}, only APPROVED can be applied",
                optimization.id, optimization.status
            )));
        }
        let reason = format!("Optimization {}", optimization.id);
        for executor_id in &optimization.affected_executors {
            self.rollback.create_snapshot(
                &optimization.strategy_id,
                executor_id,
                &optimization.current_parameters,
                &format!("Pre-apply snapshot for {}", reason),
            )?;
            self.dispatcher.push_parameters(
                &optimization.strategy_id,
                executor_id,
                &optimization.proposed_parameters,
                CommandPriority::High,
                &reason,
            )?;
        }
        let now = self.ctx.time.now();
        self.store.update_strategy_parameters(
            &optimization.strategy_id,
            &optimization.proposed_parameters,
            now,
        )?;
        optimization.applied_at = Some(now);
        self.transition(optimization, OptimizationStatus::Testing, "Parameters applied")?;
        info!(
            optimization_id = %optimization.id,
            executors = optimization.affected_executors.len(),
            "🚀 Optimization applied"
        );
        Ok(())
    }

    pub fn approve(&self, optimization_id: &str, approver: &str) -> Result<ParameterOptimization> {
        let mut optimization = self.optimization(optimization_id)?;
        if optimization.status != OptimizationStatus::PendingApproval {
            return Err(ControlError::InvalidState(format!(
                "Optimization {} is {}, only PENDING_APPROVAL can be approved",
                optimization_id, optimization.status
            )));
        }
        optimization.approved_by = Some(approver.to_string());
        self.transition(
            &mut optimization,
            OptimizationStatus::Approved,
            format!("Approved by {}", approver),
        )?;
        if let Err(e) = self.apply(&mut optimization) {
            return Err(self.fail(&mut optimization, e));
        }
        Ok(optimization)
    }

    /// Manual rejection. A TESTING optimization gets its previous parameters back.
    pub fn reject(&self, optimization_id: &str, reason: &str) -> Result<ParameterOptimization> {
        let mut optimization = self.optimization(optimization_id)?;
        match optimization.status {
            OptimizationStatus::PendingApproval => {}
            OptimizationStatus::Testing => {
                self.rollback
                    .restore(&optimization, &format!("Rejected: {}", reason))?;
                optimization.was_successful = Some(false);
            }
            other => {
                return Err(ControlError::InvalidState(format!(
                    "Optimization {} is {} and cannot be rejected",
                    optimization_id, other
                )));
            }
        }
        self.transition(
            &mut optimization,
            OptimizationStatus::Rejected,
            format!("Rejected: {}", reason),
        )?;
        Ok(optimization)
    }

    /// Post-apply evaluation. No-ops until enough trades closed since application.
    pub fn monitor_optimization(&self, optimization_id: &str) -> Result<MonitorOutcome> {
        let optimization = self.optimization(optimization_id)?;
        let Some(applied_at) = optimization.applied_at else {
            return Ok(MonitorOutcome::NotMonitored);
        };
        if !optimization.status.is_monitored() {
            return Ok(MonitorOutcome::NotMonitored);
        }

        let trades = self
            .store
            .load_trades(None, Some(&optimization.strategy_id), Some(applied_at))?;
        if trades.len() < self.config.min_post_apply_trades {
            return Ok(MonitorOutcome::InsufficientData {
                trades: trades.len(),
                required: self.config.min_post_apply_trades,
            });
        }
        let current = trade_metrics::compute(&trades);

        if let Some(reason) = self.rollback.check_and_rollback(optimization_id, &current)? {
            let mut rolled_back = self.optimization(optimization_id)?;
            if rolled_back.set_test_metrics(current).is_ok() {
                self.store.save_optimization(&rolled_back)?;
            }
            return Ok(MonitorOutcome::RolledBack { reason });
        }

        if optimization.status == OptimizationStatus::Testing {
            let mut optimization = optimization;
            if let Some(baseline) = optimization.baseline_metrics.clone() {
                if outperforms(&current, &baseline) {
                    optimization
                        .set_test_metrics(current.clone())
                        .map_err(ControlError::InvalidState)?;
                    optimization.was_successful = Some(true);
                    self.transition(
                        &mut optimization,
                        OptimizationStatus::Active,
                        format!(
                            "Win rate {:.1}% and profit factor {:.2} at or above baseline after {} trades",
                            current.win_rate, current.profit_factor, current.total_trades
                        ),
                    )?;
                    return Ok(MonitorOutcome::Promoted);
                }
            }
        }
        Ok(MonitorOutcome::Healthy)
    }

    /// Evaluate every TESTING/ACTIVE optimization. Failures are logged and skipped.
    pub fn monitor_all(&self) -> Result<Vec<(String, MonitorOutcome)>> {
        let monitored = self.store.load_optimizations(
            None,
            Some(&[OptimizationStatus::Testing, OptimizationStatus::Active]),
        )?;
        let mut outcomes = Vec::with_capacity(monitored.len());
        for optimization in monitored {
            match self.monitor_optimization(&optimization.id) {
                Ok(outcome) => outcomes.push((optimization.id, outcome)),
                Err(e) => {
                    error!(optimization_id = %optimization.id, error = %e, "❌ Optimization monitor failed")
                }
            }
        }
        Ok(outcomes)
    }

    pub async fn run_monitor(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "👀 Optimization monitor started");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.monitor_all() {
                        error!(error = %e, "❌ Optimization monitor pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("🛑 Optimization monitor stopped");
    }
}

fn outperforms(current: &PerformanceMetrics, baseline: &PerformanceMetrics) -> bool {
    current.win_rate >= baseline.win_rate && current.profit_factor >= baseline.profit_factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisory::{AdvisoryResponse, StaticAdvisor};
    use crate::circuit_breaker::CircuitBreaker;
    use crate::config::DispatcherConfig;
    use crate::context::SimulatedTimeProvider;
    use crate::dispatcher::tests::test_dispatcher;
    use crate::model::{ParameterSet, ParameterSuggestion, Side, TradeRecord};
    use crate::parameter_validator::ParameterValidator;
    use crate::persistence::store::tests::create_test_persistence;
    use crate::risk_policy::{CircuitBreakerThresholds, PolicyHandle, SafetyLimits};
    use crate::rollback::RollbackPolicy;
    use crate::transport::InMemoryTransport;
    use chrono::{DateTime, TimeZone, Utc};

    pub(crate) struct Fixture {
        pub supervisor: OptimizationSupervisor,
        pub dispatcher: Arc<CommandDispatcher>,
        pub store: Arc<PersistenceStore>,
        pub advisor: Arc<StaticAdvisor>,
        pub clock: Arc<SimulatedTimeProvider>,
    }

    pub(crate) fn base_parameters() -> ParameterSet {
        ParameterSet::from([
            ("stopLossPips".to_string(), 30.0),
            ("takeProfitPips".to_string(), 60.0),
            ("riskPerTrade".to_string(), 1.0),
        ])
    }

    pub(crate) fn advice(confidence: f64) -> AdvisoryResponse {
        AdvisoryResponse {
            suggestions: vec![ParameterSuggestion {
                parameter: "stopLossPips".into(),
                current_value: Some(30.0),
                suggested_value: 27.0,
                reason: "Losses run too far".into(),
            }],
            confidence,
            reasoning: "Tighter stops cut the average loss".into(),
        }
    }

    fn trade(i: usize, profit: f64, closed_at: DateTime<Utc>) -> TradeRecord {
        TradeRecord {
            id: format!("t-{}", i),
            executor_id: "exec-a".into(),
            strategy_id: "strat-1".into(),
            symbol: "EURUSD".into(),
            side: Side::Buy,
            volume: 0.1,
            profit,
            opened_at: closed_at - ChronoDuration::minutes(30),
            closed_at,
        }
    }

    /// Profitable history closed on previous days, so today's breaker sees nothing.
    pub(crate) fn seed_history(store: &PersistenceStore, count: usize) {
        let pattern = [60.0, -30.0, 45.0, -25.0, 80.0];
        let start = Utc.with_ymd_and_hms(2026, 2, 20, 9, 0, 0).unwrap();
        for i in 0..count {
            store
                .save_trade(&trade(i, pattern[i % pattern.len()], start + ChronoDuration::hours(i as i64 * 3)))
                .unwrap();
        }
    }

    pub(crate) fn fixture(response: AdvisoryResponse) -> Fixture {
        let store = create_test_persistence();
        let (ctx, clock) = ControlContext::new_simulated(1_772_438_400_000);
        let dispatcher = test_dispatcher(
            store.clone(),
            Arc::new(InMemoryTransport::new()),
            DispatcherConfig::default(),
            ctx.clone(),
        );
        let gate = Arc::new(SafetyGate::new(
            PolicyHandle::new(SafetyLimits::default()),
            ParameterValidator::default(),
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            store.clone(),
            PolicyHandle::new(CircuitBreakerThresholds::default()),
            dispatcher.clone(),
            ctx.clone(),
        ));
        let rollback = Arc::new(RollbackManager::new(
            store.clone(),
            dispatcher.clone(),
            RollbackPolicy::default(),
            ctx.clone(),
        ));
        let advisor = Arc::new(StaticAdvisor::new(response));

        store
            .save_strategy(&StrategyRecord {
                id: "strat-1".into(),
                name: "London breakout".into(),
                parameters: base_parameters(),
                executor_ids: vec!["exec-a".into()],
                performance: Default::default(),
                updated_at: ctx.time.now(),
            })
            .unwrap();

        let supervisor = OptimizationSupervisor::new(
            store.clone(),
            gate,
            breaker,
            rollback,
            dispatcher.clone(),
            advisor.clone(),
            OptimizationConfig::default(),
            Duration::from_secs(5),
            ctx,
        );
        Fixture {
            supervisor,
            dispatcher,
            store,
            advisor,
            clock,
        }
    }

    #[tokio::test]
    async fn test_insufficient_history_rejected_unless_forced() {
        let f = fixture(advice(0.97));
        seed_history(&f.store, 12);

        let outcome = f.supervisor.run_optimization("strat-1", false).await.unwrap();
        assert_eq!(outcome.status, OptimizationStatus::Rejected);
        assert_eq!(
            outcome.message,
            "Insufficient trade history: 12 trades (minimum 20)"
        );
        assert_eq!(f.advisor.calls(), 0);

        let forced = f.supervisor.run_optimization("strat-1", true).await.unwrap();
        assert_eq!(forced.status, OptimizationStatus::Approved);
        assert_eq!(f.advisor.calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_strategy_is_not_found() {
        let f = fixture(advice(0.97));
        assert!(matches!(
            f.supervisor.run_optimization("ghost", false).await,
            Err(ControlError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_advisory_failure_marks_error() {
        let f = fixture(advice(0.97));
        seed_history(&f.store, 25);
        let failing = OptimizationSupervisor {
            advisor: Arc::new(StaticAdvisor::failing("model offline")),
            ..f.supervisor
        };

        let err = failing.run_optimization("strat-1", false).await.unwrap_err();
        assert!(matches!(err, ControlError::Advisory(_)));
        let stored = &failing.optimizations(Some("strat-1")).unwrap()[0];
        assert_eq!(stored.status, OptimizationStatus::Error);
        assert!(stored.baseline_metrics.is_some());
    }

    #[tokio::test]
    async fn test_validation_failure_rejects() {
        let mut bad = advice(0.97);
        bad.suggestions[0] = ParameterSuggestion {
            parameter: "riskPerTrade".into(),
            current_value: Some(1.0),
            suggested_value: 4.0,
            reason: "more".into(),
        };
        let f = fixture(bad);
        seed_history(&f.store, 25);

        let err = f.supervisor.run_optimization("strat-1", false).await.unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));
        let stored = &f.supervisor.optimizations(Some("strat-1")).unwrap()[0];
        assert_eq!(stored.status, OptimizationStatus::Rejected);
        assert!(f.dispatcher.pending(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_approve_applies_and_reject_testing_restores() {
        let f = fixture(advice(0.90));
        seed_history(&f.store, 25);

        let outcome = f.supervisor.run_optimization("strat-1", false).await.unwrap();
        assert_eq!(outcome.status, OptimizationStatus::PendingApproval);
        assert!(outcome.requires_user_approval);
        assert!(f.dispatcher.pending(None).unwrap().is_empty());

        f.clock.advance(1_000);
        let approved = f
            .supervisor
            .approve(&outcome.optimization_id, "operator")
            .unwrap();
        assert_eq!(approved.status, OptimizationStatus::Testing);
        assert_eq!(approved.approved_by.as_deref(), Some("operator"));
        let strategy = f.store.load_strategy("strat-1").unwrap().unwrap();
        assert_eq!(strategy.parameters["stopLossPips"], 27.0);

        f.clock.advance(1_000);
        let rejected = f
            .supervisor
            .reject(&outcome.optimization_id, "operator changed their mind")
            .unwrap();
        assert_eq!(rejected.status, OptimizationStatus::Rejected);
        let strategy = f.store.load_strategy("strat-1").unwrap().unwrap();
        assert_eq!(strategy.parameters, base_parameters());

        let pushes = f.dispatcher.pending(Some("exec-a")).unwrap();
        assert_eq!(pushes.len(), 2);
        // Restore is URGENT and served ahead of the original HIGH push
        assert_eq!(pushes[0].priority, CommandPriority::Urgent);
        assert_eq!(pushes[0].payload.parameters, Some(base_parameters()));
    }

    #[tokio::test]
    async fn test_monitor_promotes_then_ignores_active() {
        let f = fixture(advice(0.97));
        seed_history(&f.store, 25);
        let outcome = f.supervisor.run_optimization("strat-1", false).await.unwrap();
        let id = outcome.optimization_id;

        assert_eq!(
            f.supervisor.monitor_optimization(&id).unwrap(),
            MonitorOutcome::InsufficientData {
                trades: 0,
                required: 10
            }
        );

        let applied_at = f.supervisor.optimization(&id).unwrap().applied_at.unwrap();
        for i in 0..10 {
            let profit = if i % 4 == 3 { -20.0 } else { 70.0 };
            f.store
                .save_trade(&trade(100 + i, profit, applied_at + ChronoDuration::minutes(i as i64 + 1)))
                .unwrap();
        }

        assert_eq!(
            f.supervisor.monitor_optimization(&id).unwrap(),
            MonitorOutcome::Promoted
        );
        let active = f.supervisor.optimization(&id).unwrap();
        assert_eq!(active.status, OptimizationStatus::Active);
        assert_eq!(active.was_successful, Some(true));
        assert!(active.test_metrics.is_some());

        assert_eq!(
            f.supervisor.monitor_optimization(&id).unwrap(),
            MonitorOutcome::Healthy
        );
    }

    #[tokio::test]
    async fn test_monitor_rolls_back_degraded() {
        let f = fixture(advice(0.97));
        seed_history(&f.store, 25);
        let id = f
            .supervisor
            .run_optimization("strat-1", false)
            .await
            .unwrap()
            .optimization_id;

        let applied_at = f.supervisor.optimization(&id).unwrap().applied_at.unwrap();
        for i in 0..10 {
            let profit = if i % 2 == 0 { -40.0 } else { 20.0 };
            f.store
                .save_trade(&trade(200 + i, profit, applied_at + ChronoDuration::minutes(i as i64 + 1)))
                .unwrap();
        }

        let outcome = f.supervisor.monitor_all().unwrap();
        assert!(matches!(&outcome[0].1, MonitorOutcome::RolledBack { .. }));
        let rolled = f.supervisor.optimization(&id).unwrap();
        assert_eq!(rolled.status, OptimizationStatus::RolledBack);
        assert!(rolled.test_metrics.is_some());
        let strategy = f.store.load_strategy("strat-1").unwrap().unwrap();
        assert_eq!(strategy.parameters, base_parameters());
    }

    fn losing_streak_today(store: &PersistenceStore) {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        for i in 0..5 {
            store
                .save_trade(&trade(300 + i, -25.0, now - ChronoDuration::minutes(30 - i as i64)))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_breaker_trip_rejects_before_advisory() {
        let f = fixture(advice(0.97));
        seed_history(&f.store, 25);
        losing_streak_today(&f.store);

        let err = f.supervisor.run_optimization("strat-1", false).await.unwrap_err();
        match err {
            ControlError::CircuitBreakerTrip(reason) => {
                assert!(reason.contains("5 consecutive losses"), "{reason}")
            }
            other => panic!("expected a breaker trip, got {other:?}"),
        }
        let stored = &f.supervisor.optimizations(Some("strat-1")).unwrap()[0];
        assert_eq!(stored.status, OptimizationStatus::Rejected);
        assert_eq!(f.advisor.calls(), 0);
        assert_eq!(f.store.load_anomalies(true).unwrap().len(), 1);
        assert!(f.dispatcher.halt().is_halted("strat-1"));
    }

    #[tokio::test]
    async fn test_empty_suggestions_reject() {
        let f = fixture(advice(0.97));
        seed_history(&f.store, 25);
        f.advisor.push(AdvisoryResponse {
            suggestions: Vec::new(),
            confidence: 0.97,
            reasoning: "Nothing to change".into(),
        });

        let outcome = f.supervisor.run_optimization("strat-1", false).await.unwrap();
        assert_eq!(outcome.status, OptimizationStatus::Rejected);
        assert_eq!(outcome.message, "Advisory model returned no suggestions");
        assert!(f.dispatcher.pending(None).unwrap().is_empty());
        let strategy = f.store.load_strategy("strat-1").unwrap().unwrap();
        assert_eq!(strategy.parameters, base_parameters());
    }

    #[tokio::test]
    async fn test_risky_suggestion_fails_simulation() {
        let f = fixture(advice(0.97));
        seed_history(&f.store, 25);
        // Losses grow by 40%, so does the worst drawdown
        let mut wider = advice(0.97);
        wider.suggestions[0].suggested_value = 42.0;
        f.advisor.push(wider);

        let err = f.supervisor.run_optimization("strat-1", false).await.unwrap_err();
        match err {
            ControlError::RiskRejection(reasons) => {
                assert!(reasons[0].starts_with("Projected drawdown increase 40.00%"), "{reasons:?}")
            }
            other => panic!("expected a risk rejection, got {other:?}"),
        }
        let stored = &f.supervisor.optimizations(Some("strat-1")).unwrap()[0];
        assert_eq!(stored.status, OptimizationStatus::Rejected);
        assert!(stored.risk_simulation.as_ref().is_some_and(|sim| !sim.acceptable));
        assert!(f.dispatcher.pending(None).unwrap().is_empty());
    }

    struct StalledAdvisor;

    #[async_trait::async_trait]
    impl ParameterAdvisor for StalledAdvisor {
        async fn suggest_parameters(
            &self,
            _context: &OptimizationContext,
        ) -> std::result::Result<AdvisoryResponse, AdvisoryError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(advice(0.97))
        }
    }

    #[tokio::test]
    async fn test_advisory_timeout_marks_error() {
        let f = fixture(advice(0.97));
        seed_history(&f.store, 25);
        let stalled = OptimizationSupervisor {
            advisor: Arc::new(StalledAdvisor),
            advisory_timeout: Duration::from_millis(50),
            ..f.supervisor
        };

        let err = stalled.run_optimization("strat-1", false).await.unwrap_err();
        assert!(matches!(err, ControlError::Advisory(AdvisoryError::Timeout(_))), "{err:?}");
        let stored = &stalled.optimizations(Some("strat-1")).unwrap()[0];
        assert_eq!(stored.status, OptimizationStatus::Error);
        assert!(f.dispatcher.pending(None).unwrap().is_empty());
    }
}
