use crate::circuit_breaker::CircuitBreaker;
use crate::dispatcher::CommandDispatcher;
use crate::error::{ControlError, Result};
use crate::model::{AccountState, CommandResult, TradeRecord};
use crate::persistence::store::PersistenceStore;
use crate::subjects::{EVT_ACCOUNT_UPDATE, EVT_COMMAND_RESULT, EVT_HEARTBEAT, EVT_TRADE_CLOSED, EVT_WILDCARD};
use crate::transport::{Transport, TransportMessage};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// What a single broadcast message turned into.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    CommandResult { command_id: String, success: bool },
    TradeClosed { trade_id: String, breaker_tripped: bool },
    AccountUpdate { executor_id: String },
    Ignored,
}

/// Routes executor events from the broadcast channel into the control plane.
pub struct EventIngestor {
    transport: Arc<dyn Transport>,
    store: Arc<PersistenceStore>,
    dispatcher: Arc<CommandDispatcher>,
    breaker: Arc<CircuitBreaker>,
}

impl EventIngestor {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<PersistenceStore>,
        dispatcher: Arc<CommandDispatcher>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            transport,
            store,
            dispatcher,
            breaker,
        }
    }

    pub fn handle(&self, message: &TransportMessage) -> Result<Ingested> {
        match message.subject.as_str() {
            EVT_COMMAND_RESULT => {
                let result: CommandResult = serde_json::from_slice(&message.payload)?;
                let command_id = result.command_id.clone();
                let success = result.success;
                self.dispatcher.acknowledge(&command_id, result)?;
                Ok(Ingested::CommandResult {
                    command_id,
                    success,
                })
            }
            EVT_TRADE_CLOSED => {
                let trade: TradeRecord = serde_json::from_slice(&message.payload)?;
                if trade.strategy_id.trim().is_empty() || trade.executor_id.trim().is_empty() {
                    return Err(ControlError::Validation(format!(
                        "Trade {} has no strategy or executor",
                        trade.id
                    )));
                }
                self.store.save_trade(&trade)?;
                debug!(
                    trade_id = %trade.id,
                    executor_id = %trade.executor_id,
                    profit = trade.profit,
                    "📥 Trade closed"
                );
                let check = self
                    .breaker
                    .check_and_trigger(&trade.executor_id, &trade.strategy_id)?;
                Ok(Ingested::TradeClosed {
                    trade_id: trade.id,
                    breaker_tripped: check.should_break,
                })
            }
            EVT_ACCOUNT_UPDATE => {
                let report: AccountState = serde_json::from_slice(&message.payload)?;
                let merged = self.store.save_account(&report)?;
                debug!(
                    executor_id = %merged.executor_id,
                    equity = merged.equity,
                    peak = ?merged.peak_equity,
                    "📥 Account update"
                );
                Ok(Ingested::AccountUpdate {
                    executor_id: merged.executor_id,
                })
            }
            // our own heartbeat comes back on the wildcard
            EVT_HEARTBEAT => Ok(Ingested::Ignored),
            other => {
                debug!(subject = other, "Ignoring event on unknown subject");
                Ok(Ingested::Ignored)
            }
        }
    }

    /// Consume events until `shutdown` flips to true, resubscribing if the stream ends.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(subject = EVT_WILDCARD, "👂 Event ingestor listening");
        'outer: loop {
            let mut stream = match self.transport.subscribe(EVT_WILDCARD).await {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "❌ Failed to subscribe to executor events");
                    tokio::select! {
                        _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => continue 'outer,
                        _ = shutdown.changed() => break 'outer,
                    }
                }
            };

            loop {
                tokio::select! {
                    next = stream.next() => {
                        let Some(message) = next else {
                            warn!("⚠️ Event stream ended, resubscribing");
                            break;
                        };
                        match self.handle(&message) {
                            Ok(Ingested::TradeClosed { trade_id, breaker_tripped: true }) => {
                                warn!(trade_id = %trade_id, "Trade tripped the circuit breaker");
                            }
                            Ok(_) => {}
                            Err(ControlError::Serialization(e)) => {
                                warn!(subject = %message.subject, error = %e, "Malformed event payload");
                            }
                            Err(e) => {
                                warn!(subject = %message.subject, error = %e, "Event rejected");
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break 'outer;
                        }
                    }
                }
            }

            if *shutdown.borrow() {
                break;
            }
            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
        }
        info!("🛑 Event ingestor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_fsm::CommandStatus;
    use crate::config::DispatcherConfig;
    use crate::context::ControlContext;
    use crate::dispatcher::DispatchOutcome;
    use crate::dispatcher::tests::test_dispatcher;
    use crate::model::{
        CommandPayload, CommandPriority, CommandType, DeliveryReceipt, Severity, Side, TradeCommand,
    };
    use crate::persistence::store::tests::create_test_persistence;
    use crate::risk_policy::{CircuitBreakerThresholds, PolicyHandle};
    use crate::security::CommandEnvelope;
    use crate::subjects::executor_command_subject;
    use crate::transport::InMemoryTransport;
    use chrono::{DateTime, Utc};
    use std::collections::HashMap;

    struct Harness {
        ingestor: Arc<EventIngestor>,
        dispatcher: Arc<CommandDispatcher>,
        transport: Arc<InMemoryTransport>,
        store: Arc<PersistenceStore>,
        ctx: ControlContext,
    }

    fn harness() -> Harness {
        let store = create_test_persistence();
        let transport = Arc::new(InMemoryTransport::new());
        // 2026-03-02 12:00 UTC
        let (ctx, _) = ControlContext::new_simulated(1_772_452_800_000);
        let dispatcher = test_dispatcher(
            store.clone(),
            transport.clone(),
            DispatcherConfig {
                result_timeout_ms: 2_000,
                ..DispatcherConfig::default()
            },
            ctx.clone(),
        );
        let breaker = Arc::new(CircuitBreaker::new(
            store.clone(),
            PolicyHandle::new(CircuitBreakerThresholds::default()),
            dispatcher.clone(),
            ctx.clone(),
        ));
        let ingestor = Arc::new(EventIngestor::new(
            transport.clone(),
            store.clone(),
            dispatcher.clone(),
            breaker,
        ));
        Harness {
            ingestor,
            dispatcher,
            transport,
            store,
            ctx,
        }
    }

    fn message<T: serde::Serialize>(subject: &str, body: &T) -> TransportMessage {
        TransportMessage {
            subject: subject.to_string(),
            payload: serde_json::to_vec(body).unwrap(),
        }
    }

    fn losing_trade(i: usize, closed_at: DateTime<Utc>) -> TradeRecord {
        TradeRecord {
            id: format!("t-{}", i),
            executor_id: "exec-a".into(),
            strategy_id: "strat-1".into(),
            symbol: "EURUSD".into(),
            side: Side::Sell,
            volume: 0.1,
            profit: -12.5,
            opened_at: closed_at - chrono::Duration::minutes(10),
            closed_at,
        }
    }

    #[tokio::test]
    async fn test_result_event_completes_in_flight_command() {
        let h = harness();
        let command = TradeCommand::new(
            "c-1",
            "strat-1",
            CommandType::StatusRequest,
            CommandPriority::Normal,
            CommandPayload {
                action: "STATUS".into(),
                ..Default::default()
            },
            h.ctx.time.now(),
        )
        .with_target("exec-a");
        h.dispatcher.submit(command).unwrap();

        let mut requests = h.transport.register_responder(&executor_command_subject("exec-a"));
        let ingestor = h.ingestor.clone();
        tokio::spawn(async move {
            let request = requests.recv().await.unwrap();
            let envelope: CommandEnvelope = serde_json::from_slice(&request.payload).unwrap();
            request.respond(
                serde_json::to_vec(&DeliveryReceipt {
                    command_id: envelope.command.id.clone(),
                    executor_id: "exec-a".into(),
                    accepted: true,
                    message: None,
                })
                .unwrap(),
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
            let result = CommandResult::success(
                envelope.command.id,
                "exec-a",
                serde_json::json!({"balance": 10_000}),
                Utc::now(),
            );
            let ingested = ingestor
                .handle(&message(EVT_COMMAND_RESULT, &result))
                .unwrap();
            assert_eq!(
                ingested,
                Ingested::CommandResult {
                    command_id: "c-1".into(),
                    success: true
                }
            );
        });

        let outcome = h.dispatcher.dispatch_next("exec-a").await.unwrap().unwrap();
        assert!(matches!(outcome, DispatchOutcome::Completed(ref r) if r.success));
        assert_eq!(h.dispatcher.status("c-1").unwrap().status(), CommandStatus::Executed);
    }

    #[tokio::test]
    async fn test_losing_streak_trips_breaker() {
        let h = harness();
        let now = h.ctx.time.now();

        for i in 0..4 {
            let trade = losing_trade(i, now - chrono::Duration::minutes(50 - i as i64));
            let ingested = h.ingestor.handle(&message(EVT_TRADE_CLOSED, &trade)).unwrap();
            assert_eq!(
                ingested,
                Ingested::TradeClosed {
                    trade_id: trade.id.clone(),
                    breaker_tripped: false
                }
            );
        }
        assert!(!h.dispatcher.halt().is_halted("strat-1"));

        let fifth = losing_trade(4, now - chrono::Duration::minutes(1));
        let ingested = h.ingestor.handle(&message(EVT_TRADE_CLOSED, &fifth)).unwrap();
        assert!(matches!(ingested, Ingested::TradeClosed { breaker_tripped: true, .. }));
        assert!(h.dispatcher.halt().is_halted("strat-1"));

        let anomalies = h.store.load_anomalies(true).unwrap();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].severity, Severity::Critical);
        assert!(anomalies[0].description.contains("5 consecutive losses"));
        assert_eq!(h.store.load_trades(Some("exec-a"), None, None).unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_account_update_keeps_peak() {
        let h = harness();
        let report = |equity: f64| AccountState {
            executor_id: "exec-a".into(),
            balance: 10_000.0,
            equity,
            peak_equity: None,
            open_positions: 1,
            spreads: HashMap::new(),
            updated_at: Utc::now(),
        };
        h.ingestor
            .handle(&message(EVT_ACCOUNT_UPDATE, &report(10_800.0)))
            .unwrap();
        h.ingestor
            .handle(&message(EVT_ACCOUNT_UPDATE, &report(9_900.0)))
            .unwrap();

        let stored = h.store.load_account("exec-a").unwrap().unwrap();
        assert_eq!(stored.equity, 9_900.0);
        assert_eq!(stored.peak_equity, Some(10_800.0));
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_events() {
        let h = harness();
        let garbage = TransportMessage {
            subject: EVT_TRADE_CLOSED.to_string(),
            payload: b"not json".to_vec(),
        };
        assert!(matches!(
            h.ingestor.handle(&garbage),
            Err(ControlError::Serialization(_))
        ));

        let unknown = TransportMessage {
            subject: "brain.evt.something_else".to_string(),
            payload: b"{}".to_vec(),
        };
        assert_eq!(h.ingestor.handle(&unknown).unwrap(), Ingested::Ignored);
    }

    #[tokio::test]
    async fn test_run_consumes_published_events() {
        let h = harness();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(h.ingestor.clone().run(rx));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let trade = losing_trade(1, h.ctx.time.now() - chrono::Duration::minutes(5));
        h.transport
            .publish(EVT_TRADE_CLOSED, serde_json::to_vec(&trade).unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.store.load_trades(None, Some("strat-1"), None).unwrap().len(), 1);

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
