use crate::circuit_breaker::TradingHalt;
use crate::command_fsm::CommandStatus;
use crate::command_queue::{CommandQueue, Dequeued};
use crate::config::DispatcherConfig;
use crate::context::ControlContext;
use crate::error::{ControlError, Result};
use crate::metrics::{self, OutcomeWindow};
use crate::model::{
    AnomalyRecord, CommandPayload, CommandPriority, CommandResult, CommandType, DeliveryReceipt,
    OrderRequest, ParameterSet, Severity, TradeCommand,
};
use crate::persistence::audit::AuditEntry;
use crate::persistence::store::PersistenceStore;
use crate::rate_limiter::SlidingWindowLimiter;
use crate::safety_gate::{SafetyGate, SafetyMetrics};
use crate::security::{CommandEnvelope, CommandSigner};
use crate::subjects::{CMD_EMERGENCY_STOP, executor_command_subject};
use crate::trade_metrics;
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};

/// Strategy id carried by the system-wide stop broadcast.
pub const ALL_STRATEGIES: &str = "*";

const ANONYMOUS_SENDER: &str = "anonymous";
const CONTROL_PLANE_SENDER: &str = "control-plane";

/// What happened to the command a worker pulled.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Executor reported a result (success or failure)
    Completed(CommandResult),
    /// Late safety check failed; the command is FAILED
    Blocked { command_id: String, reasons: Vec<String> },
    /// Transient failure, command re-queued
    Retried { command_id: String, retry_count: u32, error: String },
    /// Retries spent or non-retryable error; the command is FAILED
    Exhausted { command_id: String, error: String },
    /// Cancelled while in flight (emergency stop) or refused by a halt
    Cancelled { command_id: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct EmergencyStopReport {
    pub stop_command_id: String,
    pub reason: String,
    pub cancelled: Vec<String>,
    pub broadcast_delivered: bool,
    pub anomaly_id: String,
}

/// Serves queued commands to executors.
///
/// One worker per executor awaits each command's result before pulling the
/// next, so each executor has at most one command in flight.
pub struct CommandDispatcher {
    queue: CommandQueue,
    store: Arc<PersistenceStore>,
    gate: Arc<SafetyGate>,
    transport: Arc<dyn Transport>,
    halt: TradingHalt,
    rate_limiter: SlidingWindowLimiter,
    signer: Option<CommandSigner>,
    config: DispatcherConfig,
    ctx: ControlContext,
    in_flight: DashMap<String, oneshot::Sender<CommandResult>>,
    outcomes: Arc<OutcomeWindow>,
}

impl CommandDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<PersistenceStore>,
        gate: Arc<SafetyGate>,
        transport: Arc<dyn Transport>,
        halt: TradingHalt,
        signer: Option<CommandSigner>,
        config: DispatcherConfig,
        outcomes: Arc<OutcomeWindow>,
        ctx: ControlContext,
    ) -> Self {
        let rate_limiter =
            SlidingWindowLimiter::new(config.rate_limit_max_requests, config.rate_limit_window());
        info!(
            transport = transport.name(),
            signed = signer.is_some(),
            "📡 CommandDispatcher Initialized"
        );
        Self {
            queue: CommandQueue::new(store.clone(), ctx.clone()),
            store,
            gate,
            transport,
            halt,
            rate_limiter,
            signer,
            config,
            ctx,
            in_flight: DashMap::new(),
            outcomes,
        }
    }

    pub fn halt(&self) -> &TradingHalt {
        &self.halt
    }

    pub fn outcomes(&self) -> Arc<OutcomeWindow> {
        self.outcomes.clone()
    }

    pub fn queue_depth(&self) -> Result<usize> {
        self.queue.depth()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn pending(&self, executor_id: Option<&str>) -> Result<Vec<TradeCommand>> {
        self.queue.pending(executor_id)
    }

    pub fn status(&self, command_id: &str) -> Result<TradeCommand> {
        self.store
            .load_command(command_id)?
            .ok_or_else(|| ControlError::not_found("command", command_id))
    }

    /// Admit a new command. Rejections are synchronous; nothing is queued.
    pub fn submit(&self, command: TradeCommand) -> Result<TradeCommand> {
        let sender = command
            .sender
            .clone()
            .unwrap_or_else(|| ANONYMOUS_SENDER.to_string());
        if !self.rate_limiter.is_allowed(&sender) {
            metrics::inc_rate_limited();
            warn!(sender = %sender, "🛑 Submission rate limited");
            return Err(ControlError::RateLimited(sender));
        }

        command.validate().map_err(ControlError::Validation)?;
        if command.status() != CommandStatus::Pending || !command.lifecycle.transitions.is_empty() {
            return Err(ControlError::Validation(format!(
                "New command {} must be PENDING without history",
                command.id
            )));
        }
        if self.store.load_command(&command.id)?.is_some() {
            return Err(ControlError::Validation(format!(
                "Duplicate command id {}",
                command.id
            )));
        }
        let now = self.ctx.time.now();
        if command.is_expired(now) {
            return Err(ControlError::Validation(format!(
                "Command {} expired before submission",
                command.id
            )));
        }

        if command.command_type != CommandType::EmergencyStop {
            if let Some(reason) = self.halt.halt_reason(&command.strategy_id) {
                return Err(ControlError::Halted {
                    strategy_id: command.strategy_id.clone(),
                    reason,
                });
            }
        }

        if command.command_type.is_order_affecting() {
            if let Some(order) = &command.payload.order {
                let reasons = self.admission_reasons(&command, order)?;
                if !reasons.is_empty() {
                    metrics::inc_safety_rejections();
                    warn!(
                        command_id = %command.id,
                        strategy_id = %command.strategy_id,
                        reasons = ?reasons,
                        "🛑 Command rejected by safety gate"
                    );
                    return Err(ControlError::SafetyViolation(reasons));
                }
            }
        }

        self.queue.enqueue(&command)?;
        self.refresh_queue_depth();
        Ok(command)
    }

    /// Gate an order against the target executor, or every executor of the strategy.
    fn admission_reasons(&self, command: &TradeCommand, order: &OrderRequest) -> Result<Vec<String>> {
        let executors: Vec<String> = match &command.target_executor {
            Some(target) => vec![target.clone()],
            None => self
                .store
                .load_strategy(&command.strategy_id)?
                .map(|s| s.executor_ids)
                .unwrap_or_default(),
        };

        if executors.is_empty() {
            return Ok(self
                .gate
                .check_before_trade(order, &SafetyMetrics::default())
                .reasons());
        }

        let mut reasons: Vec<String> = Vec::new();
        for executor_id in &executors {
            let metrics = self.safety_metrics(executor_id, order)?;
            for reason in self.gate.check_before_trade(order, &metrics).reasons() {
                let reason = if executors.len() > 1 {
                    format!("[{}] {}", executor_id, reason)
                } else {
                    reason
                };
                if !reasons.contains(&reason) {
                    reasons.push(reason);
                }
            }
        }
        Ok(reasons)
    }

    fn safety_metrics(&self, executor_id: &str, order: &OrderRequest) -> Result<SafetyMetrics> {
        let now = self.ctx.time.now();
        let account = self.store.load_account(executor_id)?;
        let todays = self.store.load_trades(
            Some(executor_id),
            None,
            Some(trade_metrics::start_of_day(now)),
        )?;
        Ok(SafetyMetrics::from_state(
            account.as_ref(),
            &todays,
            &order.symbol,
        ))
    }

    pub fn cancel(&self, command_id: &str) -> Result<TradeCommand> {
        let cancelled = self.queue.cancel(command_id, "Cancelled by operator")?;
        self.refresh_queue_depth();
        Ok(cancelled)
    }

    /// Pull and deliver the next command for `executor_id`, waiting for its result.
    pub async fn dispatch_next(&self, executor_id: &str) -> Result<Option<DispatchOutcome>> {
        let Dequeued { command, expired } = self.queue.dequeue(executor_id)?;
        for _ in &expired {
            self.outcomes.record(false);
        }
        self.refresh_queue_depth();
        let Some(command) = command else {
            return Ok(None);
        };
        let command_id = command.id.clone();

        if command.command_type != CommandType::EmergencyStop {
            if let Some(reason) = self.halt.halt_reason(&command.strategy_id) {
                self.finish(&command_id, CommandStatus::Cancelled, format!("Trading halted: {}", reason))?;
                return Ok(Some(DispatchOutcome::Cancelled { command_id }));
            }
        }

        if command.command_type.is_order_affecting() {
            if let Some(order) = &command.payload.order {
                let metrics = self.safety_metrics(executor_id, order)?;
                let check = self.gate.check_before_trade(order, &metrics);
                if !check.passed() {
                    let reasons = check.reasons();
                    metrics::inc_safety_rejections();
                    self.finish(&command_id, CommandStatus::Failed, reasons.join("; "))?;
                    return Ok(Some(DispatchOutcome::Blocked { command_id, reasons }));
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.in_flight.insert(command_id.clone(), tx);
        metrics::set_in_flight(self.in_flight.len() as i64);
        let started = Instant::now();

        let delivered = match self.send(&command, executor_id).await {
            Ok(receipt) => {
                info!(
                    command_id = %command_id,
                    executor_id,
                    "📤 Command delivered (receipt: {:?})",
                    receipt.message
                );
                match tokio::time::timeout(self.config.result_timeout(), rx).await {
                    Ok(Ok(result)) => {
                        metrics::observe_dispatch_latency(started.elapsed().as_secs_f64());
                        Ok(result)
                    }
                    Ok(Err(_)) => Err(ControlError::TransientDispatch(format!(
                        "Result channel for {} closed",
                        command_id
                    ))),
                    Err(_) => Err(ControlError::TransientDispatch(format!(
                        "No result for {} within {:?}",
                        command_id,
                        self.config.result_timeout()
                    ))),
                }
            }
            Err(e) => Err(e),
        };
        self.in_flight.remove(&command_id);
        metrics::set_in_flight(self.in_flight.len() as i64);

        let err = match delivered {
            Ok(result) => return Ok(Some(DispatchOutcome::Completed(result))),
            Err(err) => err,
        };

        // Emergency stop may have cancelled the command while we waited
        if self.status(&command_id)?.status() != CommandStatus::Executing {
            return Ok(Some(DispatchOutcome::Cancelled { command_id }));
        }

        if err.is_transient() {
            warn!(command_id = %command_id, executor_id, error = %err, "⚠️ Transient dispatch failure");
            match self.retry(&command_id, &err.to_string()) {
                Ok(retry_count) => Ok(Some(DispatchOutcome::Retried {
                    command_id,
                    retry_count,
                    error: err.to_string(),
                })),
                Err(ControlError::PermanentDispatch { reason, .. }) => {
                    Ok(Some(DispatchOutcome::Exhausted {
                        command_id,
                        error: reason,
                    }))
                }
                Err(other) => Err(other),
            }
        } else {
            error!(command_id = %command_id, executor_id, error = %err, "❌ Permanent dispatch failure");
            self.finish(&command_id, CommandStatus::Failed, err.to_string())?;
            Ok(Some(DispatchOutcome::Exhausted {
                command_id,
                error: err.to_string(),
            }))
        }
    }

    /// Deliver one command over the request/reply link.
    pub async fn send(&self, command: &TradeCommand, executor_id: &str) -> Result<DeliveryReceipt> {
        let envelope = self.envelope(command.clone())?;
        let payload = serde_json::to_vec(&envelope)?;
        let subject = executor_command_subject(executor_id);

        let reply = self
            .transport
            .request(&subject, payload, self.config.request_timeout())
            .await?;
        let receipt: DeliveryReceipt = serde_json::from_slice(&reply).map_err(|e| {
            ControlError::TransientDispatch(format!("Malformed delivery receipt: {}", e))
        })?;
        if !receipt.accepted {
            return Err(ControlError::TransientDispatch(format!(
                "Executor {} refused {}: {}",
                receipt.executor_id,
                command.id,
                receipt.message.as_deref().unwrap_or("no reason given")
            )));
        }
        Ok(receipt)
    }

    fn envelope(&self, command: TradeCommand) -> Result<CommandEnvelope> {
        let ts = self.ctx.time.now_millis();
        let nonce = self.ctx.id.new_id();
        match &self.signer {
            Some(signer) => signer
                .sign(command, ts, nonce)
                .map_err(ControlError::Config),
            None => Ok(CommandEnvelope::unsigned(command, ts, nonce)),
        }
    }

    /// Record an executor's result. Each result is consumed once.
    pub fn acknowledge(&self, command_id: &str, result: CommandResult) -> Result<TradeCommand> {
        if result.command_id != command_id {
            return Err(ControlError::Validation(format!(
                "Result for {} acknowledged as {}",
                result.command_id, command_id
            )));
        }
        if !result.is_consistent() {
            return Err(ControlError::Validation(format!(
                "Result for {} has success={} but the opposite payload",
                command_id, result.success
            )));
        }

        let mut command = self.status(command_id)?;
        if command.status() != CommandStatus::Executing {
            return Err(ControlError::InvalidState(format!(
                "Command {} is {}; result from {} ignored",
                command_id,
                command.status(),
                result.executor_id
            )));
        }

        let now = self.ctx.time.now();
        let (next, reason) = if result.success {
            (CommandStatus::Executed, None)
        } else {
            (
                CommandStatus::Failed,
                result.error_message().map(str::to_string),
            )
        };
        command
            .lifecycle
            .transition(command_id, next, now.timestamp_millis(), reason.clone())
            .map_err(ControlError::InvalidState)?;
        command.completed_at = Some(now);
        command.result = Some(result.clone());
        self.store.save_command(&command)?;
        self.store.save_result(&result)?;
        self.store.record(
            AuditEntry::CommandTransition {
                command_id: command_id.to_string(),
                from: CommandStatus::Executing.to_string(),
                to: next.to_string(),
                reason,
            },
            now,
        )?;
        self.store.record(
            AuditEntry::CommandResultRecorded {
                command_id: command_id.to_string(),
                executor_id: result.executor_id.clone(),
                success: result.success,
            },
            now,
        )?;
        self.store
            .record_strategy_execution(&command.strategy_id, result.success, now)?;

        if result.success {
            metrics::inc_commands_executed();
            info!(command_id, executor_id = %result.executor_id, "✅ Command executed");
        } else {
            metrics::inc_commands_failed();
            warn!(
                command_id,
                executor_id = %result.executor_id,
                error = ?result.error_message(),
                "❌ Command failed on executor"
            );
        }
        self.outcomes.record(result.success);

        if let Some((_, waiter)) = self.in_flight.remove(command_id) {
            let _ = waiter.send(result);
        }
        Ok(command)
    }

    /// Re-queue an EXECUTING command, or fail it once its retries are spent.
    pub fn retry(&self, command_id: &str, cause: &str) -> Result<u32> {
        let mut command = self.status(command_id)?;
        if command.status() != CommandStatus::Executing {
            return Err(ControlError::InvalidState(format!(
                "Only EXECUTING commands can be retried, {} is {}",
                command_id,
                command.status()
            )));
        }
        let now = self.ctx.time.now();

        if command.retry_count < command.max_retries {
            command.retry_count += 1;
            command.created_at = now;
            command.dispatched_at = None;
            command.executed_by = None;
            command
                .lifecycle
                .transition(
                    command_id,
                    CommandStatus::Pending,
                    now.timestamp_millis(),
                    Some(format!(
                        "Retry {}/{}: {}",
                        command.retry_count, command.max_retries, cause
                    )),
                )
                .map_err(ControlError::InvalidState)?;
            self.queue.enqueue(&command)?;
            metrics::inc_command_retries();
            info!(
                command_id,
                retry_count = command.retry_count,
                max_retries = command.max_retries,
                "🔁 Command re-queued"
            );
            return Ok(command.retry_count);
        }

        let reason = format!("Retries exhausted ({}): {}", command.max_retries, cause);
        self.finish(command_id, CommandStatus::Failed, reason.clone())?;
        Err(ControlError::PermanentDispatch {
            command_id: command_id.to_string(),
            reason,
        })
    }

    /// Move a stored command to a terminal status.
    fn finish(&self, command_id: &str, next: CommandStatus, reason: String) -> Result<TradeCommand> {
        let mut command = self.status(command_id)?;
        let from = command.status();
        let now = self.ctx.time.now();
        command
            .lifecycle
            .transition(command_id, next, now.timestamp_millis(), Some(reason.clone()))
            .map_err(ControlError::InvalidState)?;
        command.completed_at = Some(now);
        self.store.save_command(&command)?;
        self.store.record(
            AuditEntry::CommandTransition {
                command_id: command_id.to_string(),
                from: from.to_string(),
                to: next.to_string(),
                reason: Some(reason),
            },
            now,
        )?;
        match next {
            CommandStatus::Failed => {
                metrics::inc_commands_failed();
                self.outcomes.record(false);
            }
            CommandStatus::Cancelled => metrics::inc_commands_cancelled(1),
            _ => {}
        }
        Ok(command)
    }

    /// Commands left EXECUTING by a previous process are failed, never re-sent.
    pub fn recover_interrupted(&self) -> Result<Vec<String>> {
        let mut recovered = Vec::new();
        for command in self
            .store
            .load_commands_with_status(&[CommandStatus::Executing])?
        {
            self.finish(
                &command.id,
                CommandStatus::Failed,
                "Interrupted by control plane restart".to_string(),
            )?;
            recovered.push(command.id);
        }
        if !recovered.is_empty() {
            warn!(count = recovered.len(), "⚠️ Failed commands interrupted mid-flight");
        }
        Ok(recovered)
    }

    /// Flush everything and broadcast a single URGENT stop to every executor.
    pub async fn emergency_stop(&self, reason: &str, initiated_by: &str) -> Result<EmergencyStopReport> {
        let now = self.ctx.time.now();
        let stop_reason = format!("Emergency stop: {}", reason);
        error!(initiated_by, "🚨 EMERGENCY STOP: {}", reason);

        let mut cancelled: Vec<String> = self
            .queue
            .clear(&stop_reason)?
            .into_iter()
            .map(|c| c.id)
            .collect();
        for command in self
            .store
            .load_commands_with_status(&[CommandStatus::Pending, CommandStatus::Executing])?
        {
            self.finish(&command.id, CommandStatus::Cancelled, stop_reason.clone())?;
            cancelled.push(command.id);
        }
        // Dropping the waiters wakes every worker blocked on a result
        self.in_flight.clear();
        metrics::set_in_flight(0);
        self.halt.halt_all(reason)?;

        let mut stop = self.stop_command(ALL_STRATEGIES, reason, now).with_sender(initiated_by);
        stop.lifecycle
            .transition(&stop.id, CommandStatus::Executing, now.timestamp_millis(), None)
            .map_err(ControlError::InvalidState)?;
        stop.dispatched_at = Some(now);

        let published = match self.envelope(stop.clone()) {
            Ok(envelope) => {
                let payload = serde_json::to_vec(&envelope)?;
                self.transport.publish(CMD_EMERGENCY_STOP, payload).await.map_err(ControlError::from)
            }
            Err(e) => Err(e),
        };
        let broadcast_delivered = published.is_ok();
        let (next, outcome_reason) = match &published {
            Ok(()) => (CommandStatus::Executed, Some(stop_reason.clone())),
            Err(e) => {
                error!(error = %e, "❌ Emergency stop broadcast failed");
                (CommandStatus::Failed, Some(format!("Broadcast failed: {}", e)))
            }
        };
        stop.lifecycle
            .transition(&stop.id, next, now.timestamp_millis(), outcome_reason)
            .map_err(ControlError::InvalidState)?;
        stop.completed_at = Some(now);
        self.store.save_command(&stop)?;

        let anomaly = AnomalyRecord {
            id: self.ctx.id.new_id(),
            executor_id: None,
            strategy_id: None,
            severity: Severity::Critical,
            description: format!("Emergency stop by {}: {}", initiated_by, reason),
            triggered_at: now,
            resolved: false,
            resolved_at: None,
            resolution: None,
        };
        self.store.save_anomaly(&anomaly)?;
        self.store.record(
            AuditEntry::AnomalyRaised {
                anomaly_id: anomaly.id.clone(),
                severity: anomaly.severity.to_string(),
                description: anomaly.description.clone(),
            },
            now,
        )?;
        self.store.record(
            AuditEntry::EmergencyStop {
                reason: reason.to_string(),
                initiated_by: initiated_by.to_string(),
                cancelled_commands: cancelled.len(),
            },
            now,
        )?;
        metrics::inc_emergency_stops();
        self.refresh_queue_depth();

        Ok(EmergencyStopReport {
            stop_command_id: stop.id,
            reason: reason.to_string(),
            cancelled,
            broadcast_delivered,
            anomaly_id: anomaly.id,
        })
    }

    /// Halt one strategy, drop its queued work and queue URGENT stops for its executors.
    pub fn emergency_stop_strategy(
        &self,
        strategy_id: &str,
        executor_ids: &[String],
        reason: &str,
    ) -> Result<Vec<String>> {
        let now = self.ctx.time.now();
        self.halt.halt_strategy(strategy_id, reason)?;

        for queued in self.queue.pending(None)? {
            if queued.strategy_id != strategy_id {
                continue;
            }
            match self.queue.cancel(&queued.id, reason) {
                Ok(_) | Err(ControlError::InvalidState(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let mut stop_ids = Vec::with_capacity(executor_ids.len());
        for executor_id in executor_ids {
            let stop = self
                .stop_command(strategy_id, reason, now)
                .with_target(executor_id.clone())
                .with_sender(CONTROL_PLANE_SENDER);
            self.queue.enqueue(&stop)?;
            stop_ids.push(stop.id);
        }
        metrics::inc_emergency_stops();
        self.refresh_queue_depth();
        error!(strategy_id, executors = ?executor_ids, "🚨 STRATEGY EMERGENCY STOP: {}", reason);
        Ok(stop_ids)
    }

    fn stop_command(&self, strategy_id: &str, reason: &str, now: DateTime<Utc>) -> TradeCommand {
        TradeCommand::new(
            self.ctx.id.new_id(),
            strategy_id,
            CommandType::EmergencyStop,
            CommandPriority::Urgent,
            CommandPayload {
                action: "EMERGENCY_STOP".to_string(),
                order: None,
                parameters: None,
                reason: Some(reason.to_string()),
            },
            now,
        )
    }

    /// Queue an UPDATE_PARAMETERS command for one executor. Returns its id.
    pub fn push_parameters(
        &self,
        strategy_id: &str,
        executor_id: &str,
        parameters: &ParameterSet,
        priority: CommandPriority,
        reason: &str,
    ) -> Result<String> {
        let command = TradeCommand::new(
            self.ctx.id.new_id(),
            strategy_id,
            CommandType::UpdateParameters,
            priority,
            CommandPayload {
                action: "UPDATE_PARAMETERS".to_string(),
                order: None,
                parameters: Some(parameters.clone()),
                reason: Some(reason.to_string()),
            },
            self.ctx.time.now(),
        )
        .with_target(executor_id)
        .with_sender(CONTROL_PLANE_SENDER);
        command.validate().map_err(ControlError::Validation)?;
        self.queue.enqueue(&command)?;
        self.refresh_queue_depth();
        Ok(command.id)
    }

    fn refresh_queue_depth(&self) {
        if let Ok(depth) = self.queue.depth() {
            metrics::set_queue_depth(depth as i64);
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self
            .config
            .retry_initial_delay_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.config.retry_max_delay_ms);
        let jitter = rand::thread_rng().gen_range(0..=base / 4);
        Duration::from_millis(base + jitter)
    }

    /// Dispatch loop for one executor until `shutdown` flips to true.
    pub async fn run_worker(self: Arc<Self>, executor_id: String, mut shutdown: watch::Receiver<bool>) {
        info!(executor_id = %executor_id, "🚀 Dispatch worker started");
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.dispatch_next(&executor_id).await {
                Ok(Some(DispatchOutcome::Retried { .. })) => {
                    let delay = self.backoff_delay(attempt);
                    attempt = attempt.saturating_add(1);
                    Some(delay)
                }
                Ok(Some(_)) => {
                    attempt = 0;
                    None
                }
                Ok(None) => {
                    attempt = 0;
                    Some(self.config.poll_interval())
                }
                Err(e) => {
                    error!(executor_id = %executor_id, error = %e, "❌ Dispatch loop error");
                    Some(self.config.poll_interval())
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        info!(executor_id = %executor_id, "🛑 Dispatch worker stopped");
    }
}
