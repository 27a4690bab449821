use crate::command_fsm::CommandStatus;
use crate::context::ControlContext;
use crate::error::{ControlError, Result};
use crate::metrics;
use crate::model::TradeCommand;
use crate::persistence::audit::AuditEntry;
use crate::persistence::redb_store::StoreError;
use crate::persistence::store::{COMMANDS_TABLE, METADATA_TABLE, PersistenceStore, QUEUE_TABLE};
use chrono::{DateTime, Utc};
use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

const SEQUENCE_KEY: &str = "queue.sequence";

/// Index row of the durable queue. Keys sort as `rank:sequence`, so a
/// forward scan yields service order.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueEntry {
    command_id: String,
    rank: u8,
    sequence: u64,
    target_executor: Option<String>,
    enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    fn key(&self) -> String {
        format!("{}:{:020}", self.rank, self.sequence)
    }

    fn serves(&self, executor_id: &str) -> bool {
        self.target_executor
            .as_deref()
            .is_none_or(|target| target == executor_id)
    }
}

/// Outcome of one dequeue call.
#[derive(Debug, Default)]
pub struct Dequeued {
    pub command: Option<TradeCommand>,
    /// Entries popped past their expiry and failed along the way.
    pub expired: Vec<TradeCommand>,
}

/// Durable priority queue of commands.
///
/// Lower rank first, FIFO within a rank by a persisted sequence number.
/// Every mutation is a single redb write transaction.
pub struct CommandQueue {
    store: Arc<PersistenceStore>,
    ctx: ControlContext,
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| ControlError::Store(StoreError::Serialization(e)))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| ControlError::Store(StoreError::Serialization(e)))
}

fn store_err<E: Into<StoreError>>(e: E) -> ControlError {
    ControlError::Store(e.into())
}

impl CommandQueue {
    pub fn new(store: Arc<PersistenceStore>, ctx: ControlContext) -> Self {
        Self { store, ctx }
    }

    /// Persist a PENDING command and index it. Returns its sequence number.
    pub fn enqueue(&self, command: &TradeCommand) -> Result<u64> {
        if command.status() != CommandStatus::Pending {
            return Err(ControlError::InvalidState(format!(
                "Only PENDING commands can be queued, {} is {}",
                command.id,
                command.status()
            )));
        }

        let now = self.ctx.time.now();
        let txn = self.store.redb().begin_write()?;
        let sequence = {
            let mut meta = txn.open_table(METADATA_TABLE).map_err(store_err)?;
            let last: u64 = {
                let guard = meta.get(SEQUENCE_KEY).map_err(store_err)?;
                match guard {
                    Some(v) => decode(&v.value())?,
                    None => 0,
                }
            };
            let sequence = last + 1;
            meta.insert(SEQUENCE_KEY, encode(&sequence)?)
                .map_err(store_err)?;

            let entry = QueueEntry {
                command_id: command.id.clone(),
                rank: command.rank(),
                sequence,
                target_executor: command.target_executor.clone(),
                enqueued_at: now,
            };
            let mut queue = txn.open_table(QUEUE_TABLE).map_err(store_err)?;
            queue
                .insert(entry.key().as_str(), encode(&entry)?)
                .map_err(store_err)?;

            let mut commands = txn.open_table(COMMANDS_TABLE).map_err(store_err)?;
            commands
                .insert(command.id.as_str(), encode(command)?)
                .map_err(store_err)?;
            sequence
        };
        txn.commit().map_err(store_err)?;

        self.store.record(
            AuditEntry::CommandQueued {
                command_id: command.id.clone(),
                strategy_id: command.strategy_id.clone(),
                priority: command.priority.to_string(),
                target_executor: command.target_executor.clone(),
            },
            now,
        )?;
        metrics::inc_commands_enqueued();
        info!(
            command_id = %command.id,
            priority = %command.priority,
            sequence,
            "📥 Command queued"
        );
        Ok(sequence)
    }

    /// Pop the next command this executor may serve and mark it EXECUTING.
    ///
    /// Expired entries met on the way are marked FAILED and skipped.
    pub fn dequeue(&self, executor_id: &str) -> Result<Dequeued> {
        let now = self.ctx.time.now();
        let now_ms = now.timestamp_millis();
        let mut expired = Vec::new();

        let txn = self.store.redb().begin_write()?;
        let popped = {
            let mut queue = txn.open_table(QUEUE_TABLE).map_err(store_err)?;
            let mut commands = txn.open_table(COMMANDS_TABLE).map_err(store_err)?;

            loop {
                let next: Option<QueueEntry> = {
                    let mut next = None;
                    for res in queue.range::<&str>(..).map_err(store_err)? {
                        let (_, v) = res.map_err(store_err)?;
                        let entry: QueueEntry = decode(&v.value())?;
                        if entry.serves(executor_id) {
                            next = Some(entry);
                            break;
                        }
                    }
                    next
                };
                let Some(entry) = next else {
                    break None;
                };
                queue.remove(entry.key().as_str()).map_err(store_err)?;

                let stored: Option<TradeCommand> = {
                    let guard = commands
                        .get(entry.command_id.as_str())
                        .map_err(store_err)?;
                    match guard {
                        Some(v) => Some(decode(&v.value())?),
                        None => None,
                    }
                };
                let Some(mut command) = stored else {
                    warn!(command_id = %entry.command_id, "⚠️ Dropping orphan queue entry");
                    continue;
                };
                if command.status() != CommandStatus::Pending {
                    warn!(
                        command_id = %command.id,
                        status = %command.status(),
                        "⚠️ Dropping stale queue entry"
                    );
                    continue;
                }

                if command.is_expired(now) {
                    command
                        .lifecycle
                        .transition(
                            &command.id,
                            CommandStatus::Failed,
                            now_ms,
                            Some("Command expired".to_string()),
                        )
                        .map_err(ControlError::InvalidState)?;
                    command.completed_at = Some(now);
                    commands
                        .insert(command.id.as_str(), encode(&command)?)
                        .map_err(store_err)?;
                    expired.push(command);
                    continue;
                }

                command
                    .lifecycle
                    .transition(
                        &command.id,
                        CommandStatus::Executing,
                        now_ms,
                        Some(format!("Dispatched to {}", executor_id)),
                    )
                    .map_err(ControlError::InvalidState)?;
                command.dispatched_at = Some(now);
                command.executed_by = Some(executor_id.to_string());
                commands
                    .insert(command.id.as_str(), encode(&command)?)
                    .map_err(store_err)?;
                break Some(command);
            }
        };
        txn.commit().map_err(store_err)?;

        for command in &expired {
            metrics::inc_commands_expired();
            metrics::inc_commands_failed();
            warn!(command_id = %command.id, "⌛ Command expired before dispatch");
            self.record_transition(command, CommandStatus::Pending, now)?;
        }
        if let Some(command) = &popped {
            self.record_transition(command, CommandStatus::Pending, now)?;
        }

        Ok(Dequeued {
            command: popped,
            expired,
        })
    }

    /// Cancel a command that is still queued.
    pub fn cancel(&self, command_id: &str, reason: &str) -> Result<TradeCommand> {
        let now = self.ctx.time.now();
        let txn = self.store.redb().begin_write()?;
        let cancelled = {
            let mut queue = txn.open_table(QUEUE_TABLE).map_err(store_err)?;
            let mut commands = txn.open_table(COMMANDS_TABLE).map_err(store_err)?;

            let entry_key: Option<String> = {
                let mut found = None;
                for res in queue.range::<&str>(..).map_err(store_err)? {
                    let (k, v) = res.map_err(store_err)?;
                    let entry: QueueEntry = decode(&v.value())?;
                    if entry.command_id == command_id {
                        found = Some(k.value().to_string());
                        break;
                    }
                }
                found
            };

            let stored: Option<TradeCommand> = {
                let guard = commands.get(command_id).map_err(store_err)?;
                match guard {
                    Some(v) => Some(decode(&v.value())?),
                    None => None,
                }
            };
            let Some(mut command) = stored else {
                return Err(ControlError::not_found("command", command_id));
            };

            let Some(key) = entry_key else {
                return Err(ControlError::InvalidState(format!(
                    "Command {} is {} and no longer queued; it cannot be cancelled",
                    command_id,
                    command.status()
                )));
            };

            queue.remove(key.as_str()).map_err(store_err)?;
            command
                .lifecycle
                .transition(
                    command_id,
                    CommandStatus::Cancelled,
                    now.timestamp_millis(),
                    Some(reason.to_string()),
                )
                .map_err(ControlError::InvalidState)?;
            command.completed_at = Some(now);
            commands
                .insert(command_id, encode(&command)?)
                .map_err(store_err)?;
            command
        };
        txn.commit().map_err(store_err)?;

        self.record_transition(&cancelled, CommandStatus::Pending, now)?;
        metrics::inc_commands_cancelled(1);
        info!(command_id, reason, "🚫 Command cancelled");
        Ok(cancelled)
    }

    /// Remove every queued entry and cancel the commands behind them.
    pub fn clear(&self, reason: &str) -> Result<Vec<TradeCommand>> {
        let now = self.ctx.time.now();
        let now_ms = now.timestamp_millis();
        let txn = self.store.redb().begin_write()?;
        let cancelled = {
            let mut queue = txn.open_table(QUEUE_TABLE).map_err(store_err)?;
            let mut commands = txn.open_table(COMMANDS_TABLE).map_err(store_err)?;

            let entries: Vec<(String, QueueEntry)> = {
                let mut entries = Vec::new();
                for res in queue.range::<&str>(..).map_err(store_err)? {
                    let (k, v) = res.map_err(store_err)?;
                    entries.push((k.value().to_string(), decode(&v.value())?));
                }
                entries
            };

            let mut cancelled = Vec::new();
            for (key, entry) in entries {
                queue.remove(key.as_str()).map_err(store_err)?;
                let stored: Option<TradeCommand> = {
                    let guard = commands
                        .get(entry.command_id.as_str())
                        .map_err(store_err)?;
                    match guard {
                        Some(v) => Some(decode(&v.value())?),
                        None => None,
                    }
                };
                let Some(mut command) = stored else {
                    continue;
                };
                if command
                    .lifecycle
                    .transition(
                        &entry.command_id,
                        CommandStatus::Cancelled,
                        now_ms,
                        Some(reason.to_string()),
                    )
                    .is_ok()
                {
                    command.completed_at = Some(now);
                    commands
                        .insert(entry.command_id.as_str(), encode(&command)?)
                        .map_err(store_err)?;
                    cancelled.push(command);
                }
            }
            cancelled
        };
        txn.commit().map_err(store_err)?;

        for command in &cancelled {
            self.record_transition(command, CommandStatus::Pending, now)?;
        }
        metrics::inc_commands_cancelled(cancelled.len() as u64);
        metrics::set_queue_depth(0);
        Ok(cancelled)
    }

    /// Queued commands in service order, optionally only those an executor may serve.
    pub fn pending(&self, executor_id: Option<&str>) -> Result<Vec<TradeCommand>> {
        let txn = self.store.redb().begin_read()?;
        let queue = txn.open_table(QUEUE_TABLE).map_err(store_err)?;
        let commands = txn.open_table(COMMANDS_TABLE).map_err(store_err)?;

        let mut items = Vec::new();
        for res in queue.range::<&str>(..).map_err(store_err)? {
            let (_, v) = res.map_err(store_err)?;
            let entry: QueueEntry = decode(&v.value())?;
            if executor_id.is_some_and(|e| !entry.serves(e)) {
                continue;
            }
            let guard = commands
                .get(entry.command_id.as_str())
                .map_err(store_err)?;
            if let Some(v) = guard {
                items.push(decode::<TradeCommand>(&v.value())?);
            }
        }
        Ok(items)
    }

    pub fn depth(&self) -> Result<usize> {
        let txn = self.store.redb().begin_read()?;
        let queue = txn.open_table(QUEUE_TABLE).map_err(store_err)?;
        let mut depth = 0;
        for res in queue.range::<&str>(..).map_err(store_err)? {
            res.map_err(store_err)?;
            depth += 1;
        }
        Ok(depth)
    }

    fn record_transition(
        &self,
        command: &TradeCommand,
        from: CommandStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.store.record(
            AuditEntry::CommandTransition {
                command_id: command.id.clone(),
                from: from.to_string(),
                to: command.status().to_string(),
                reason: command.lifecycle.reason.clone(),
            },
            at,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CommandPayload, CommandPriority, CommandType};
    use crate::persistence::store::tests::create_test_persistence;

    fn queue() -> (CommandQueue, Arc<crate::context::SimulatedTimeProvider>) {
        let (ctx, clock) = ControlContext::new_simulated(1_700_000_000_000);
        (CommandQueue::new(create_test_persistence(), ctx), clock)
    }

    fn status_cmd(id: &str, priority: CommandPriority, clock_ms: i64) -> TradeCommand {
        use chrono::TimeZone;
        TradeCommand::new(
            id,
            "strat-1",
            CommandType::StatusRequest,
            priority,
            CommandPayload {
                action: "STATUS".into(),
                ..Default::default()
            },
            Utc.timestamp_millis_opt(clock_ms).single().unwrap(),
        )
    }

    #[test]
    fn test_priority_then_fifo_order() {
        let (q, _) = queue();
        let t = 1_700_000_000_000;
        q.enqueue(&status_cmd("low", CommandPriority::Low, t)).unwrap();
        q.enqueue(&status_cmd("urgent", CommandPriority::Urgent, t)).unwrap();
        q.enqueue(&status_cmd("normal-a", CommandPriority::Normal, t)).unwrap();
        q.enqueue(&status_cmd("normal-b", CommandPriority::Normal, t)).unwrap();

        let order: Vec<String> = (0..4)
            .map(|_| q.dequeue("exec-a").unwrap().command.unwrap().id)
            .collect();
        assert_eq!(order, vec!["urgent", "normal-a", "normal-b", "low"]);
        assert!(q.dequeue("exec-a").unwrap().command.is_none());
    }

    #[test]
    fn test_dequeue_marks_executing() {
        let (q, _) = queue();
        q.enqueue(&status_cmd("c-1", CommandPriority::High, 1_700_000_000_000))
            .unwrap();
        let popped = q.dequeue("exec-a").unwrap().command.unwrap();
        assert_eq!(popped.status(), CommandStatus::Executing);
        assert_eq!(popped.executed_by.as_deref(), Some("exec-a"));
        assert_eq!(
            q.store.load_command("c-1").unwrap().unwrap().status(),
            CommandStatus::Executing
        );
    }

    #[test]
    fn test_addressee_filtering() {
        let (q, _) = queue();
        let t = 1_700_000_000_000;
        q.enqueue(&status_cmd("for-b", CommandPriority::Urgent, t).with_target("exec-b"))
            .unwrap();
        q.enqueue(&status_cmd("anyone", CommandPriority::Low, t)).unwrap();

        assert_eq!(q.pending(Some("exec-a")).unwrap().len(), 1);
        assert_eq!(q.dequeue("exec-a").unwrap().command.unwrap().id, "anyone");
        assert!(q.dequeue("exec-a").unwrap().command.is_none());
        assert_eq!(q.dequeue("exec-b").unwrap().command.unwrap().id, "for-b");
    }

    #[test]
    fn test_expired_command_is_failed_and_skipped() {
        let (q, clock) = queue();
        let t = 1_700_000_000_000;
        q.enqueue(&status_cmd("stale", CommandPriority::Urgent, t).with_expiry_ms(0))
            .unwrap();
        q.enqueue(&status_cmd("fresh", CommandPriority::Low, t)).unwrap();
        clock.advance(1);

        let out = q.dequeue("exec-a").unwrap();
        assert_eq!(out.command.unwrap().id, "fresh");
        assert_eq!(out.expired.len(), 1);

        let stale = q.store.load_command("stale").unwrap().unwrap();
        assert_eq!(stale.status(), CommandStatus::Failed);
        assert_eq!(stale.lifecycle.reason.as_deref(), Some("Command expired"));
        assert!(stale.dispatched_at.is_none());
    }

    #[test]
    fn test_cancel_only_while_queued() {
        let (q, _) = queue();
        let t = 1_700_000_000_000;
        q.enqueue(&status_cmd("c-1", CommandPriority::Normal, t)).unwrap();
        q.enqueue(&status_cmd("c-2", CommandPriority::Normal, t)).unwrap();

        let cancelled = q.cancel("c-1", "operator request").unwrap();
        assert_eq!(cancelled.status(), CommandStatus::Cancelled);

        let dispatched = q.dequeue("exec-a").unwrap().command.unwrap();
        assert_eq!(dispatched.id, "c-2");
        assert!(matches!(
            q.cancel("c-2", "too late"),
            Err(ControlError::InvalidState(_))
        ));
        assert!(matches!(
            q.cancel("missing", "nope"),
            Err(ControlError::NotFound { .. })
        ));
    }

    #[test]
    fn test_clear_cancels_everything() {
        let (q, _) = queue();
        let t = 1_700_000_000_000;
        for id in ["a", "b", "c"] {
            q.enqueue(&status_cmd(id, CommandPriority::Normal, t)).unwrap();
        }
        let cancelled = q.clear("Emergency stop").unwrap();
        assert_eq!(cancelled.len(), 3);
        assert_eq!(q.depth().unwrap(), 0);
        for id in ["a", "b", "c"] {
            assert_eq!(
                q.store.load_command(id).unwrap().unwrap().status(),
                CommandStatus::Cancelled
            );
        }
    }

    #[test]
    fn test_sequence_survives_reopen() {
        let path = format!("/tmp/test_queue_{}.redb", uuid::Uuid::new_v4());
        let (ctx, _) = ControlContext::new_simulated(1_700_000_000_000);
        {
            let q = CommandQueue::new(Arc::new(PersistenceStore::open(&path).unwrap()), ctx.clone());
            q.enqueue(&status_cmd("first", CommandPriority::Normal, 0)).unwrap();
        }
        let q = CommandQueue::new(Arc::new(PersistenceStore::open(&path).unwrap()), ctx);
        let seq = q
            .enqueue(&status_cmd("second", CommandPriority::Normal, 0))
            .unwrap();
        assert_eq!(seq, 2);
        assert_eq!(q.dequeue("exec-a").unwrap().command.unwrap().id, "first");
        let _ = std::fs::remove_file(path);
    }
}
