use crate::context::ControlContext;
use crate::dispatcher::CommandDispatcher;
use crate::error::{ControlError, Result};
use crate::metrics;
use crate::model::{
    CommandPriority, OptimizationStatus, ParameterOptimization, ParameterSet, ParameterSnapshot,
    PerformanceMetrics,
};
use crate::persistence::audit::AuditEntry;
use crate::persistence::store::PersistenceStore;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Relative degradation that rolls a TESTING/ACTIVE optimization back.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RollbackPolicy {
    /// Relative win-rate drop against baseline, percent
    pub win_rate_drop_pct: f64,
    /// Relative max-drawdown increase against baseline, percent
    pub drawdown_increase_pct: f64,
    /// Relative profit-factor drop against baseline, percent
    pub profit_factor_drop_pct: f64,
    /// Absolute profit-factor floor
    pub min_profit_factor: f64,
}

impl Default for RollbackPolicy {
    fn default() -> Self {
        Self {
            win_rate_drop_pct: 15.0,
            drawdown_increase_pct: 30.0,
            profit_factor_drop_pct: 20.0,
            min_profit_factor: 1.0,
        }
    }
}

fn relative_change_pct(baseline: f64, current: f64) -> Option<f64> {
    (baseline > 0.0).then(|| (current - baseline) / baseline * 100.0)
}

/// Every degradation trigger `current` hits against `baseline`.
pub fn degradation_reasons(
    policy: &RollbackPolicy,
    baseline: &PerformanceMetrics,
    current: &PerformanceMetrics,
) -> Vec<String> {
    let mut reasons = Vec::new();

    if let Some(change) = relative_change_pct(baseline.win_rate, current.win_rate) {
        if -change > policy.win_rate_drop_pct {
            reasons.push(format!(
                "Win rate dropped {:.1}% ({:.1}% -> {:.1}%)",
                -change, baseline.win_rate, current.win_rate
            ));
        }
    }
    if let Some(change) = relative_change_pct(baseline.max_drawdown, current.max_drawdown) {
        if change > policy.drawdown_increase_pct {
            reasons.push(format!(
                "Drawdown increased {:.1}% ({:.2} -> {:.2})",
                change, baseline.max_drawdown, current.max_drawdown
            ));
        }
    }
    if let Some(change) = relative_change_pct(baseline.profit_factor, current.profit_factor) {
        if -change > policy.profit_factor_drop_pct {
            reasons.push(format!(
                "Profit factor dropped {:.1}% ({:.2} -> {:.2})",
                -change, baseline.profit_factor, current.profit_factor
            ));
        }
    }
    if current.profit_factor < policy.min_profit_factor {
        reasons.push(format!(
            "Profit factor {:.2} below {:.2}",
            current.profit_factor, policy.min_profit_factor
        ));
    }
    reasons
}

/// Parameter snapshot log and rollback of applied optimizations.
pub struct RollbackManager {
    store: Arc<PersistenceStore>,
    dispatcher: Arc<CommandDispatcher>,
    policy: RollbackPolicy,
    ctx: ControlContext,
}

impl RollbackManager {
    pub fn new(
        store: Arc<PersistenceStore>,
        dispatcher: Arc<CommandDispatcher>,
        policy: RollbackPolicy,
        ctx: ControlContext,
    ) -> Self {
        Self {
            store,
            dispatcher,
            policy,
            ctx,
        }
    }

    pub fn policy(&self) -> &RollbackPolicy {
        &self.policy
    }

    pub fn create_snapshot(
        &self,
        strategy_id: &str,
        executor_id: &str,
        parameters: &ParameterSet,
        reason: &str,
    ) -> Result<ParameterSnapshot> {
        let mut snapshot = ParameterSnapshot {
            id: self.ctx.id.new_id(),
            strategy_id: strategy_id.to_string(),
            executor_id: executor_id.to_string(),
            parameters: parameters.clone(),
            reason: reason.to_string(),
            created_at: self.ctx.time.now(),
            sequence: 0,
        };
        self.store.save_snapshot(&mut snapshot)?;
        info!(
            strategy_id,
            executor_id,
            snapshot_id = %snapshot.id,
            "📸 Parameter snapshot written: {}",
            reason
        );
        Ok(snapshot)
    }

    /// Most recent snapshot of the executor taken strictly before `before`.
    pub fn snapshot_before(
        &self,
        strategy_id: &str,
        executor_id: Option<&str>,
        before: DateTime<Utc>,
    ) -> Result<Option<ParameterSnapshot>> {
        Ok(self
            .store
            .load_snapshots(strategy_id)?
            .into_iter()
            .filter(|s| executor_id.is_none_or(|e| s.executor_id == e))
            .filter(|s| s.created_at < before)
            .next_back())
    }

    /// Push the pre-optimization parameters back to every affected executor.
    ///
    /// Every executor must have a qualifying snapshot; nothing is pushed otherwise.
    pub fn restore(&self, optimization: &ParameterOptimization, reason: &str) -> Result<Vec<String>> {
        let before = optimization.created_at;
        let mut restores = Vec::with_capacity(optimization.affected_executors.len());
        for executor_id in &optimization.affected_executors {
            let snapshot = self
                .snapshot_before(&optimization.strategy_id, Some(executor_id), before)?
                .ok_or_else(|| {
                    ControlError::not_found(
                        "snapshot",
                        format!("{}/{} before {}", optimization.strategy_id, executor_id, before),
                    )
                })?;
            restores.push(snapshot);
        }
        let strategy_wide = match restores.last() {
            Some(s) => s.clone(),
            None => self
                .snapshot_before(&optimization.strategy_id, None, before)?
                .ok_or_else(|| {
                    ControlError::not_found(
                        "snapshot",
                        format!("{} before {}", optimization.strategy_id, before),
                    )
                })?,
        };

        let mut pushed = Vec::with_capacity(restores.len());
        for snapshot in &restores {
            let command_id = self.dispatcher.push_parameters(
                &optimization.strategy_id,
                &snapshot.executor_id,
                &snapshot.parameters,
                CommandPriority::Urgent,
                reason,
            )?;
            pushed.push(command_id);
        }
        self.store.update_strategy_parameters(
            &optimization.strategy_id,
            &strategy_wide.parameters,
            self.ctx.time.now(),
        )?;
        Ok(pushed)
    }

    /// Restore parameters and mark the optimization ROLLED_BACK.
    pub fn rollback(&self, optimization_id: &str, reason: &str) -> Result<ParameterOptimization> {
        let mut optimization = self
            .store
            .load_optimization(optimization_id)?
            .ok_or_else(|| ControlError::not_found("optimization", optimization_id))?;
        if !optimization
            .status
            .can_transition_to(&OptimizationStatus::RolledBack)
        {
            return Err(ControlError::InvalidState(format!(
                "Optimization {} is {} and cannot be rolled back",
                optimization_id, optimization.status
            )));
        }

        let pushed = self.restore(&optimization, &format!("Rollback: {}", reason))?;

        let from = optimization.status;
        let now = self.ctx.time.now();
        optimization
            .transition(OptimizationStatus::RolledBack, now, Some(reason.to_string()))
            .map_err(ControlError::InvalidState)?;
        optimization.was_successful = Some(false);
        optimization.rollback_reason = Some(reason.to_string());
        self.store.save_optimization(&optimization)?;
        self.store.record(
            AuditEntry::OptimizationTransition {
                optimization_id: optimization_id.to_string(),
                from: from.to_string(),
                to: OptimizationStatus::RolledBack.to_string(),
                reason: Some(reason.to_string()),
            },
            now,
        )?;
        metrics::inc_rollbacks();
        warn!(
            optimization_id,
            strategy_id = %optimization.strategy_id,
            commands = ?pushed,
            "⏪ Optimization rolled back: {}",
            reason
        );
        Ok(optimization)
    }

    /// Roll back when `current` has degraded against the baseline.
    /// Returns the rollback reason when one happened.
    pub fn check_and_rollback(
        &self,
        optimization_id: &str,
        current: &PerformanceMetrics,
    ) -> Result<Option<String>> {
        let optimization = self
            .store
            .load_optimization(optimization_id)?
            .ok_or_else(|| ControlError::not_found("optimization", optimization_id))?;
        if !optimization.status.is_monitored() {
            return Ok(None);
        }
        let Some(baseline) = &optimization.baseline_metrics else {
            return Ok(None);
        };

        let reasons = degradation_reasons(&self.policy, baseline, current);
        if reasons.is_empty() {
            return Ok(None);
        }
        let reason = format!("Performance degraded: {}", reasons.join("; "));
        self.rollback(optimization_id, &reason)?;
        Ok(Some(reason))
    }

    /// Snapshots of a strategy, newest first.
    pub fn history(&self, strategy_id: &str) -> Result<Vec<ParameterSnapshot>> {
        let mut snapshots = self.store.load_snapshots(strategy_id)?;
        snapshots.reverse();
        Ok(snapshots)
    }

    pub fn rollback_history(&self, strategy_id: &str) -> Result<Vec<ParameterOptimization>> {
        Ok(self.store.load_optimizations(
            Some(strategy_id),
            Some(&[OptimizationStatus::RolledBack]),
        )?)
    }
}
