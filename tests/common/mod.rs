#![allow(dead_code)]

use brain_control_rs::advisory::{AdvisoryResponse, StaticAdvisor};
use brain_control_rs::circuit_breaker::{CircuitBreaker, TradingHalt};
use brain_control_rs::config::{DispatcherConfig, OptimizationConfig};
use brain_control_rs::context::{ControlContext, SimulatedTimeProvider};
use brain_control_rs::dispatcher::CommandDispatcher;
use brain_control_rs::metrics::OutcomeWindow;
use brain_control_rs::model::{
    CommandPayload, CommandPriority, CommandType, OrderRequest, OrderType, ParameterSet,
    ParameterSuggestion, Side, StrategyRecord, TradeCommand, TradeRecord,
};
use brain_control_rs::optimization::OptimizationSupervisor;
use brain_control_rs::parameter_validator::ParameterValidator;
use brain_control_rs::persistence::store::PersistenceStore;
use brain_control_rs::risk_policy::{CircuitBreakerThresholds, PolicyHandle, SafetyLimits};
use brain_control_rs::rollback::{RollbackManager, RollbackPolicy};
use brain_control_rs::safety_gate::SafetyGate;
use brain_control_rs::transport::InMemoryTransport;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

/// 2026-03-02 08:00 UTC
pub const START_MS: i64 = 1_772_438_400_000;

pub struct ControlPlane {
    pub store: Arc<PersistenceStore>,
    pub transport: Arc<InMemoryTransport>,
    pub ctx: ControlContext,
    pub clock: Arc<SimulatedTimeProvider>,
    pub gate: Arc<SafetyGate>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub breaker: Arc<CircuitBreaker>,
    pub rollback: Arc<RollbackManager>,
    pub supervisor: OptimizationSupervisor,
    pub advisor: Arc<StaticAdvisor>,
}

pub fn temp_store() -> Arc<PersistenceStore> {
    let path = format!("/tmp/brain_control_it_{}.redb", uuid::Uuid::new_v4());
    Arc::new(PersistenceStore::open(path).unwrap())
}

pub fn fast_dispatch() -> DispatcherConfig {
    DispatcherConfig {
        request_timeout_ms: 100,
        result_timeout_ms: 100,
        poll_interval_ms: 10,
        retry_initial_delay_ms: 1,
        retry_max_delay_ms: 5,
        ..DispatcherConfig::default()
    }
}

pub fn control_plane(advice: AdvisoryResponse) -> ControlPlane {
    let store = temp_store();
    let transport = Arc::new(InMemoryTransport::new());
    let (ctx, clock) = ControlContext::new_simulated(START_MS);

    let gate = Arc::new(SafetyGate::new(
        PolicyHandle::new(SafetyLimits::default()),
        ParameterValidator::default(),
    ));
    let dispatcher = Arc::new(CommandDispatcher::new(
        store.clone(),
        gate.clone(),
        transport.clone(),
        TradingHalt::new(),
        None,
        fast_dispatch(),
        Arc::new(OutcomeWindow::new(Duration::from_secs(60))),
        ctx.clone(),
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
    let advisor = Arc::new(StaticAdvisor::new(advice));
    let supervisor = OptimizationSupervisor::new(
        store.clone(),
        gate.clone(),
        breaker.clone(),
        rollback.clone(),
        dispatcher.clone(),
        advisor.clone(),
        OptimizationConfig::default(),
        Duration::from_secs(5),
        ctx.clone(),
    );

    ControlPlane {
        store,
        transport,
        ctx,
        clock,
        gate,
        dispatcher,
        breaker,
        rollback,
        supervisor,
        advisor,
    }
}

pub fn base_parameters() -> ParameterSet {
    ParameterSet::from([
        ("stopLossPips".to_string(), 30.0),
        ("takeProfitPips".to_string(), 60.0),
        ("riskPerTrade".to_string(), 1.0),
    ])
}

pub fn advice(confidence: f64) -> AdvisoryResponse {
    AdvisoryResponse {
        suggestions: vec![ParameterSuggestion {
            parameter: "stopLossPips".into(),
            current_value: Some(30.0),
            suggested_value: 27.0,
            reason: "Average loss too large".into(),
        }],
        confidence,
        reasoning: "Tighter stop".into(),
    }
}

pub fn register_strategy(plane: &ControlPlane, executors: &[&str]) {
    plane
        .store
        .save_strategy(&StrategyRecord {
            id: "strat-1".into(),
            name: "London breakout".into(),
            parameters: base_parameters(),
            executor_ids: executors.iter().map(|e| e.to_string()).collect(),
            performance: Default::default(),
            updated_at: plane.ctx.time.now(),
        })
        .unwrap();
}

pub fn trade(i: usize, profit: f64, closed_at: DateTime<Utc>) -> TradeRecord {
    TradeRecord {
        id: format!("t-{}", i),
        executor_id: "exec-a".into(),
        strategy_id: "strat-1".into(),
        symbol: "EURUSD".into(),
        side: Side::Buy,
        volume: 0.1,
        profit,
        opened_at: closed_at - ChronoDuration::minutes(20),
        closed_at,
    }
}

/// Profitable trades closed on earlier days.
pub fn seed_history(store: &PersistenceStore, count: usize) {
    let pattern = [60.0, -30.0, 45.0, -25.0, 80.0];
    let start = Utc.with_ymd_and_hms(2026, 2, 20, 9, 0, 0).unwrap();
    for i in 0..count {
        store
            .save_trade(&trade(
                i,
                pattern[i % pattern.len()],
                start + ChronoDuration::hours(i as i64 * 3),
            ))
            .unwrap();
    }
}

pub fn order(volume: Decimal) -> OrderRequest {
    OrderRequest {
        symbol: "EURUSD".into(),
        side: Side::Buy,
        volume,
        order_type: OrderType::Market,
        price: None,
        stop_loss: None,
        take_profit: None,
        comment: None,
    }
}

pub fn status_command(id: &str, priority: CommandPriority, at: DateTime<Utc>) -> TradeCommand {
    TradeCommand::new(
        id,
        "strat-1",
        CommandType::StatusRequest,
        priority,
        CommandPayload {
            action: "STATUS".into(),
            ..Default::default()
        },
        at,
    )
    .with_target("exec-a")
    .with_sender(format!("sender-{}", id))
}
