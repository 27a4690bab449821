use crate::command_fsm::{CommandLifecycle, CommandStatus};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Strategy parameters by name. Ordered so snapshots serialize deterministically.
pub type ParameterSet = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
}

impl Side {
    /// Executors only accept plain buy/sell orders.
    pub fn is_order_side(&self) -> bool {
        matches!(self, Side::Buy | Side::Sell)
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
            Side::Long => "LONG",
            Side::Short => "SHORT",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum OrderType {
    #[default]
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "LIMIT")]
    Limit,
    #[serde(rename = "STOP")]
    Stop,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    TradeSignal,
    RiskUpdate,
    EmergencyStop,
    StatusRequest,
    UpdateParameters,
}

impl CommandType {
    /// Commands that can open or change exposure and therefore pass the safety gate.
    pub fn is_order_affecting(&self) -> bool {
        matches!(self, CommandType::TradeSignal)
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandType::TradeSignal => "TRADE_SIGNAL",
            CommandType::RiskUpdate => "RISK_UPDATE",
            CommandType::EmergencyStop => "EMERGENCY_STOP",
            CommandType::StatusRequest => "STATUS_REQUEST",
            CommandType::UpdateParameters => "UPDATE_PARAMETERS",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl CommandPriority {
    /// Queue rank; lower ranks are served first.
    pub fn rank(&self) -> u8 {
        match self {
            CommandPriority::Urgent => 1,
            CommandPriority::High => 2,
            CommandPriority::Normal => 3,
            CommandPriority::Low => 4,
        }
    }
}

impl fmt::Display for CommandPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub volume: Decimal,
    #[serde(default)]
    pub order_type: OrderType,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CommandPayload {
    pub action: String,
    #[serde(default)]
    pub order: Option<OrderRequest>,
    #[serde(default)]
    pub parameters: Option<ParameterSet>,
    #[serde(default)]
    pub reason: Option<String>,
}

pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Longest expiry a command may carry: 7 days.
pub const MAX_EXPIRY_MS: i64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeCommand {
    pub id: String,
    pub strategy_id: String,
    #[serde(default)]
    pub target_executor: Option<String>,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    #[serde(default)]
    pub priority: CommandPriority,
    pub payload: CommandPayload,
    pub created_at: DateTime<Utc>,
    /// Milliseconds after `created_at` at which a queued command expires.
    #[serde(default)]
    pub expiry_ms: Option<i64>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub lifecycle: CommandLifecycle,
    #[serde(default)]
    pub dispatched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub executed_by: Option<String>,
    #[serde(default)]
    pub result: Option<CommandResult>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl TradeCommand {
    pub fn new(
        id: impl Into<String>,
        strategy_id: impl Into<String>,
        command_type: CommandType,
        priority: CommandPriority,
        payload: CommandPayload,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            strategy_id: strategy_id.into(),
            target_executor: None,
            command_type,
            priority,
            payload,
            created_at,
            expiry_ms: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            sender: None,
            lifecycle: CommandLifecycle::default(),
            dispatched_at: None,
            completed_at: None,
            executed_by: None,
            result: None,
        }
    }

    pub fn with_target(mut self, executor_id: impl Into<String>) -> Self {
        self.target_executor = Some(executor_id.into());
        self
    }

    pub fn with_expiry_ms(mut self, expiry_ms: i64) -> Self {
        self.expiry_ms = Some(expiry_ms);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn status(&self) -> CommandStatus {
        self.lifecycle.state
    }

    pub fn rank(&self) -> u8 {
        self.priority.rank()
    }

    /// Whether this command may be served to `executor_id`.
    pub fn is_addressed_to(&self, executor_id: &str) -> bool {
        self.target_executor
            .as_deref()
            .is_none_or(|target| target == executor_id)
    }

    /// Deadline after which a queued command is failed instead of served.
    /// `None` when the command never expires or the deadline is unrepresentable.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ms = self.expiry_ms?;
        self.created_at
            .checked_add_signed(Duration::try_milliseconds(ms)?)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|deadline| now >= deadline)
    }

    /// Structural checks applied before a command is admitted.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("Command id must not be empty".into());
        }
        if self.strategy_id.trim().is_empty() {
            return Err("Strategy id must not be empty".into());
        }
        if self.payload.action.trim().is_empty() {
            return Err("Command action must not be empty".into());
        }
        if let Some(ms) = self.expiry_ms {
            if ms < 0 {
                return Err(format!("Expiry must be non-negative, got {}ms", ms));
            }
            if ms > MAX_EXPIRY_MS {
                return Err(format!(
                    "Expiry {}ms exceeds the {}ms maximum",
                    ms, MAX_EXPIRY_MS
                ));
            }
        }
        if self.retry_count > self.max_retries {
            return Err(format!(
                "Retry count {} exceeds max retries {}",
                self.retry_count, self.max_retries
            ));
        }
        match self.command_type {
            CommandType::TradeSignal if self.payload.order.is_none() => {
                Err("TRADE_SIGNAL requires an order".into())
            }
            CommandType::UpdateParameters
                if self.payload.parameters.as_ref().is_none_or(|p| p.is_empty()) =>
            {
                Err("UPDATE_PARAMETERS requires a non-empty parameter set".into())
            }
            _ => Ok(()),
        }
    }
}

/// Exactly one of a result payload or an error payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CommandOutcome {
    Result(serde_json::Value),
    Error(CommandFailure),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandFailure {
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResult {
    pub command_id: String,
    pub executor_id: String,
    pub success: bool,
    pub outcome: CommandOutcome,
    pub timestamp: DateTime<Utc>,
}

impl CommandResult {
    pub fn success(
        command_id: impl Into<String>,
        executor_id: impl Into<String>,
        result: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            executor_id: executor_id.into(),
            success: true,
            outcome: CommandOutcome::Result(result),
            timestamp,
        }
    }

    pub fn failure(
        command_id: impl Into<String>,
        executor_id: impl Into<String>,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            executor_id: executor_id.into(),
            success: false,
            outcome: CommandOutcome::Error(CommandFailure {
                code: None,
                message: message.into(),
            }),
            timestamp,
        }
    }

    /// `success` must agree with the outcome variant.
    pub fn is_consistent(&self) -> bool {
        self.success == matches!(self.outcome, CommandOutcome::Result(_))
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.outcome {
            CommandOutcome::Error(failure) => Some(failure.message.as_str()),
            CommandOutcome::Result(_) => None,
        }
    }
}

/// Synchronous reply of an executor to a delivered command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub command_id: String,
    pub executor_id: String,
    pub accepted: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeRecord {
    pub id: String,
    pub executor_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub profit: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountState {
    pub executor_id: String,
    pub balance: f64,
    pub equity: f64,
    /// Equity high-water mark, maintained by the store.
    #[serde(default)]
    pub peak_equity: Option<f64>,
    #[serde(default)]
    pub open_positions: u32,
    /// Latest spread in points per symbol.
    #[serde(default)]
    pub spreads: HashMap<String, f64>,
    pub updated_at: DateTime<Utc>,
}

impl AccountState {
    pub fn effective_peak(&self) -> f64 {
        let reported = self.balance.max(self.equity);
        self.peak_equity.map_or(reported, |peak| peak.max(reported))
    }

    /// Current drawdown from peak equity in percent.
    pub fn drawdown_percent(&self) -> f64 {
        let peak = self.effective_peak();
        if peak <= 0.0 {
            return 0.0;
        }
        ((peak - self.equity) / peak * 100.0).max(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StrategyPerformance {
    pub commands_executed: u64,
    pub commands_failed: u64,
    #[serde(default)]
    pub last_executed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrategyRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parameters: ParameterSet,
    #[serde(default)]
    pub executor_ids: Vec<String>,
    #[serde(default)]
    pub performance: StrategyPerformance,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterSnapshot {
    pub id: String,
    pub strategy_id: String,
    pub executor_id: String,
    pub parameters: ParameterSet,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    /// Write order, assigned by the store. Breaks ties between equal timestamps.
    #[serde(default)]
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnomalyRecord {
    pub id: String,
    #[serde(default)]
    pub executor_id: Option<String>,
    #[serde(default)]
    pub strategy_id: Option<String>,
    pub severity: Severity,
    pub description: String,
    pub triggered_at: DateTime<Utc>,
    pub resolved: bool,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolution: Option<String>,
}

/// Aggregate statistics over a trade sample. Win rate is in percent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PerformanceMetrics {
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub net_profit: f64,
    pub profit_factor: f64,
    pub expectancy: f64,
    pub max_drawdown: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RiskSimulation {
    pub sample_size: usize,
    pub stop_loss_ratio: f64,
    pub take_profit_ratio: f64,
    pub lot_size_ratio: f64,
    pub baseline_drawdown: f64,
    pub projected_drawdown: f64,
    /// Relative drawdown increase in percent.
    pub drawdown_increase_pct: f64,
    pub baseline_profit_factor: f64,
    pub projected_profit_factor: f64,
    /// Projected profit factor as percent of baseline.
    pub profit_factor_ratio_pct: f64,
    pub acceptable: bool,
    #[serde(default)]
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterSuggestion {
    pub parameter: String,
    #[serde(default)]
    pub current_value: Option<f64>,
    pub suggested_value: f64,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OptimizationStatus {
    Created,
    PendingApproval,
    Approved,
    Testing,
    Active,
    RolledBack,
    Rejected,
    Error,
}

impl OptimizationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RolledBack | Self::Rejected | Self::Error)
    }

    pub fn valid_transitions(&self) -> &'static [OptimizationStatus] {
        use OptimizationStatus::*;
        match self {
            Created => &[Rejected, PendingApproval, Approved, Error],
            PendingApproval => &[Approved, Rejected, Error],
            Approved => &[Testing, Error],
            Testing => &[Active, RolledBack, Rejected, Error],
            Active => &[RolledBack, Error],
            RolledBack => &[],
            Rejected => &[],
            Error => &[],
        }
    }

    pub fn can_transition_to(&self, next: &OptimizationStatus) -> bool {
        self.valid_transitions().contains(next)
    }

    /// Statuses under continuous post-apply monitoring.
    pub fn is_monitored(&self) -> bool {
        matches!(self, Self::Testing | Self::Active)
    }
}

impl fmt::Display for OptimizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::PendingApproval => "PENDING_APPROVAL",
            Self::Approved => "APPROVED",
            Self::Testing => "TESTING",
            Self::Active => "ACTIVE",
            Self::RolledBack => "ROLLED_BACK",
            Self::Rejected => "REJECTED",
            Self::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimizationTransition {
    pub from: OptimizationStatus,
    pub to: OptimizationStatus,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterOptimization {
    pub id: String,
    pub strategy_id: String,
    pub current_parameters: ParameterSet,
    #[serde(default)]
    pub proposed_parameters: ParameterSet,
    #[serde(default)]
    pub confidence_score: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub suggestions: Vec<ParameterSuggestion>,
    pub status: OptimizationStatus,
    #[serde(default)]
    pub status_reason: Option<String>,
    #[serde(default)]
    pub baseline_metrics: Option<PerformanceMetrics>,
    #[serde(default)]
    pub test_metrics: Option<PerformanceMetrics>,
    #[serde(default)]
    pub risk_simulation: Option<RiskSimulation>,
    #[serde(default)]
    pub validation_warnings: Vec<String>,
    #[serde(default)]
    pub affected_executors: BTreeSet<String>,
    #[serde(default)]
    pub forced: bool,
    #[serde(default)]
    pub requires_user_approval: bool,
    #[serde(default)]
    pub was_successful: Option<bool>,
    #[serde(default)]
    pub approved_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rollback_reason: Option<String>,
    #[serde(default)]
    pub transitions: Vec<OptimizationTransition>,
}

impl ParameterOptimization {
    pub fn new(
        id: impl Into<String>,
        strategy_id: impl Into<String>,
        current_parameters: ParameterSet,
        affected_executors: BTreeSet<String>,
        forced: bool,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            strategy_id: strategy_id.into(),
            current_parameters,
            proposed_parameters: ParameterSet::new(),
            confidence_score: 0.0,
            reasoning: None,
            suggestions: Vec::new(),
            status: OptimizationStatus::Created,
            status_reason: None,
            baseline_metrics: None,
            test_metrics: None,
            risk_simulation: None,
            validation_warnings: Vec::new(),
            affected_executors,
            forced,
            requires_user_approval: false,
            was_successful: None,
            approved_by: None,
            created_at,
            updated_at: created_at,
            applied_at: None,
            completed_at: None,
            rollback_reason: None,
            transitions: Vec::new(),
        }
    }

    /// Guarded status change. Illegal transitions leave the record untouched.
    pub fn transition(
        &mut self,
        next: OptimizationStatus,
        at: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.status.can_transition_to(&next) {
            return Err(format!(
                "Illegal optimization transition for {}: {} → {}",
                self.id, self.status, next
            ));
        }
        self.transitions.push(OptimizationTransition {
            from: self.status,
            to: next,
            at,
            reason: reason.clone(),
        });
        self.status = next;
        self.status_reason = reason;
        self.updated_at = at;
        if next.is_terminal() {
            self.completed_at = Some(at);
        }
        Ok(())
    }

    /// Baseline is captured once and never replaced.
    pub fn set_baseline(&mut self, metrics: PerformanceMetrics) -> Result<(), String> {
        if self.baseline_metrics.is_some() {
            return Err(format!("Baseline metrics already captured for {}", self.id));
        }
        self.baseline_metrics = Some(metrics);
        Ok(())
    }

    /// Test metrics are written once, when post-apply evaluation completes.
    pub fn set_test_metrics(&mut self, metrics: PerformanceMetrics) -> Result<(), String> {
        if self.test_metrics.is_some() {
            return Err(format!("Test metrics already recorded for {}", self.id));
        }
        self.test_metrics = Some(metrics);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).single().unwrap()
    }

    fn signal(id: &str) -> TradeCommand {
        TradeCommand::new(
            id,
            "strat-1",
            CommandType::TradeSignal,
            CommandPriority::Normal,
            CommandPayload {
                action: "OPEN".into(),
                order: Some(OrderRequest {
                    symbol: "EURUSD".into(),
                    side: Side::Buy,
                    volume: dec!(0.1),
                    order_type: OrderType::Market,
                    price: None,
                    stop_loss: None,
                    take_profit: None,
                    comment: None,
                }),
                parameters: None,
                reason: None,
            },
            at(1_000),
        )
    }

    #[test]
    fn test_priority_ranks() {
        assert_eq!(CommandPriority::Urgent.rank(), 1);
        assert_eq!(CommandPriority::High.rank(), 2);
        assert_eq!(CommandPriority::Normal.rank(), 3);
        assert_eq!(CommandPriority::Low.rank(), 4);
    }

    #[test]
    fn test_expiry_boundary() {
        let cmd = signal("c-1").with_expiry_ms(0);
        assert!(cmd.is_expired(at(1_000)));

        let cmd = signal("c-2").with_expiry_ms(500);
        assert!(!cmd.is_expired(at(1_499)));
        assert!(cmd.is_expired(at(1_500)));

        assert!(!signal("c-3").is_expired(at(i64::from(i32::MAX))));
    }

    #[test]
    fn test_oversized_expiry_never_overflows() {
        let huge = signal("c-1").with_expiry_ms(i64::MAX / 2);
        assert!(huge.expires_at().is_none());
        assert!(!huge.is_expired(at(1_000)));
        assert!(huge.validate().unwrap_err().contains("exceeds"));

        let week = signal("c-2").with_expiry_ms(MAX_EXPIRY_MS);
        assert!(week.validate().is_ok());
        assert!(week.is_expired(at(1_000 + MAX_EXPIRY_MS)));
    }

    #[test]
    fn test_addressing() {
        let any = signal("c-1");
        assert!(any.is_addressed_to("exec-a"));
        let targeted = signal("c-2").with_target("exec-a");
        assert!(targeted.is_addressed_to("exec-a"));
        assert!(!targeted.is_addressed_to("exec-b"));
    }

    #[test]
    fn test_trade_signal_requires_order() {
        let mut cmd = signal("c-1");
        assert!(cmd.validate().is_ok());
        cmd.payload.order = None;
        assert!(cmd.validate().is_err());
    }

    #[test]
    fn test_result_outcome_consistency() {
        let ok = CommandResult::success("c-1", "exec-a", serde_json::json!({"ticket": 7}), at(0));
        assert!(ok.is_consistent());

        let mut bad = CommandResult::failure("c-1", "exec-a", "rejected", at(0));
        assert!(bad.is_consistent());
        bad.success = true;
        assert!(!bad.is_consistent());
    }

    #[test]
    fn test_command_wire_format() {
        let json = serde_json::to_value(signal("c-1")).unwrap();
        assert_eq!(json["type"], "TRADE_SIGNAL");
        assert_eq!(json["priority"], "NORMAL");
        assert_eq!(json["payload"]["order"]["side"], "BUY");
    }

    #[test]
    fn test_account_peak_prefers_high_water_mark() {
        let account = AccountState {
            executor_id: "exec-a".into(),
            balance: 10_000.0,
            equity: 8_000.0,
            peak_equity: Some(12_000.0),
            open_positions: 0,
            spreads: HashMap::new(),
            updated_at: at(0),
        };
        assert_eq!(account.effective_peak(), 12_000.0);
        assert!((account.drawdown_percent() - 33.333333).abs() < 1e-4);

        let fallback = AccountState {
            peak_equity: None,
            ..account
        };
        assert_eq!(fallback.effective_peak(), 10_000.0);
        assert!((fallback.drawdown_percent() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_optimization_transitions_are_guarded() {
        let mut opt = ParameterOptimization::new(
            "opt-1",
            "strat-1",
            ParameterSet::new(),
            BTreeSet::new(),
            false,
            at(0),
        );
        assert!(
            opt.transition(OptimizationStatus::Testing, at(1), None)
                .is_err()
        );
        assert_eq!(opt.status, OptimizationStatus::Created);

        assert!(
            opt.transition(OptimizationStatus::Approved, at(1), None)
                .is_ok()
        );
        assert!(
            opt.transition(OptimizationStatus::Testing, at(2), None)
                .is_ok()
        );
        assert!(
            opt.transition(OptimizationStatus::RolledBack, at(3), Some("pf < 1".into()))
                .is_ok()
        );
        assert!(opt.status.is_terminal());
        assert_eq!(opt.completed_at, Some(at(3)));
        assert_eq!(opt.transitions.len(), 3);
    }

    #[test]
    fn test_baseline_is_write_once() {
        let mut opt = ParameterOptimization::new(
            "opt-1",
            "strat-1",
            ParameterSet::new(),
            BTreeSet::new(),
            false,
            at(0),
        );
        assert!(opt.set_baseline(PerformanceMetrics::default()).is_ok());
        assert!(opt.set_baseline(PerformanceMetrics::default()).is_err());
    }
}
