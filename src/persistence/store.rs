use crate::command_fsm::CommandStatus;
use crate::model::{
    AccountState, AnomalyRecord, CommandResult, OptimizationStatus, ParameterOptimization,
    ParameterSet, ParameterSnapshot, StrategyRecord, TradeCommand, TradeRecord,
};
use crate::persistence::audit::{AuditEntry, AuditLog, AuditRecord};
use crate::persistence::redb_store::{RedbStore, StoreError};
use chrono::{DateTime, Utc};
use redb::{ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;

pub(crate) type JsonTable = TableDefinition<'static, &'static str, Vec<u8>>;

// Tables
pub(crate) const COMMANDS_TABLE: JsonTable = TableDefinition::new("commands");
pub(crate) const QUEUE_TABLE: JsonTable = TableDefinition::new("command_queue");
pub(crate) const METADATA_TABLE: JsonTable = TableDefinition::new("metadata");
const RESULTS_TABLE: JsonTable = TableDefinition::new("command_results");
const TRADES_TABLE: JsonTable = TableDefinition::new("trades");
const ACCOUNTS_TABLE: JsonTable = TableDefinition::new("accounts");
const STRATEGIES_TABLE: JsonTable = TableDefinition::new("strategies");
const SNAPSHOTS_TABLE: JsonTable = TableDefinition::new("parameter_snapshots");
const OPTIMIZATIONS_TABLE: JsonTable = TableDefinition::new("optimizations");
const ANOMALIES_TABLE: JsonTable = TableDefinition::new("anomalies");

const SNAPSHOT_SEQUENCE_KEY: &str = "snapshots.sequence";

const ALL_TABLES: [JsonTable; 10] = [
    COMMANDS_TABLE,
    QUEUE_TABLE,
    METADATA_TABLE,
    RESULTS_TABLE,
    TRADES_TABLE,
    ACCOUNTS_TABLE,
    STRATEGIES_TABLE,
    SNAPSHOTS_TABLE,
    OPTIMIZATIONS_TABLE,
    ANOMALIES_TABLE,
];

/// Durable state of the control plane. Every mutation is one redb write
/// transaction keyed by id; redb serializes writers.
pub struct PersistenceStore {
    store: Arc<RedbStore>,
    audit: Arc<AuditLog>,
}

impl PersistenceStore {
    pub fn new(store: Arc<RedbStore>, audit: Arc<AuditLog>) -> Self {
        Self { store, audit }
    }

    /// Open (or create) the database at `path` with every table initialized.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let store = Arc::new(RedbStore::new(path)?);
        let audit = Arc::new(AuditLog::new(store.clone()));
        let persistence = Self::new(store, audit);
        persistence.initialize()?;
        Ok(persistence)
    }

    /// Tables must exist before any read transaction opens them.
    pub fn initialize(&self) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            for table in ALL_TABLES {
                let _ = txn.open_table(table)?;
            }
        }
        txn.commit()?;
        self.audit.initialize()
    }

    pub(crate) fn redb(&self) -> &RedbStore {
        &self.store
    }

    pub fn record(&self, entry: AuditEntry, at: DateTime<Utc>) -> Result<u64, StoreError> {
        self.audit.append(entry, at)
    }

    pub fn audit_trail(&self, start_seq: u64) -> Result<Vec<(u64, AuditRecord)>, StoreError> {
        self.audit.read_from(start_seq)
    }

    // --- Generic JSON table access ---

    fn put<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut table = txn.open_table(table)?;
            let data = serde_json::to_vec(value)?;
            table.insert(key, data)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> Result<Option<T>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(table)?;
        let maybe_guard = table.get(key)?;
        let maybe_item = maybe_guard
            .map(|v| serde_json::from_slice::<T>(&v.value()))
            .transpose()?;
        Ok(maybe_item)
    }

    fn scan<T: DeserializeOwned>(&self, table: JsonTable) -> Result<Vec<T>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(table)?;
        let mut items = Vec::new();
        for res in table.range::<&str>(..)? {
            let (_, v) = res?;
            let item: T = serde_json::from_slice(&v.value())?;
            items.push(item);
        }
        Ok(items)
    }

    /// Read-modify-write of one row inside a single write transaction.
    fn update<T, F>(&self, table: JsonTable, key: &str, apply: F) -> Result<Option<T>, StoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T),
    {
        let txn = self.store.begin_write()?;
        let updated = {
            let mut table = txn.open_table(table)?;
            let current: Option<T> = {
                let guard = table.get(key)?;
                guard
                    .map(|v| serde_json::from_slice::<T>(&v.value()))
                    .transpose()?
            };
            match current {
                Some(mut item) => {
                    apply(&mut item);
                    let data = serde_json::to_vec(&item)?;
                    table.insert(key, data)?;
                    Some(item)
                }
                None => None,
            }
        };
        txn.commit()?;
        Ok(updated)
    }

    // --- Commands ---

    pub fn save_command(&self, command: &TradeCommand) -> Result<(), StoreError> {
        self.put(COMMANDS_TABLE, &command.id, command)
    }

    pub fn load_command(&self, command_id: &str) -> Result<Option<TradeCommand>, StoreError> {
        self.get(COMMANDS_TABLE, command_id)
    }

    pub fn load_commands(&self) -> Result<Vec<TradeCommand>, StoreError> {
        let mut commands: Vec<TradeCommand> = self.scan(COMMANDS_TABLE)?;
        commands.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(commands)
    }

    pub fn load_commands_with_status(
        &self,
        statuses: &[CommandStatus],
    ) -> Result<Vec<TradeCommand>, StoreError> {
        Ok(self
            .load_commands()?
            .into_iter()
            .filter(|c| statuses.contains(&c.status()))
            .collect())
    }

    pub fn save_result(&self, result: &CommandResult) -> Result<(), StoreError> {
        self.put(RESULTS_TABLE, &result.command_id, result)
    }

    pub fn load_result(&self, command_id: &str) -> Result<Option<CommandResult>, StoreError> {
        self.get(RESULTS_TABLE, command_id)
    }

    // --- Trades & accounts ---

    pub fn save_trade(&self, trade: &TradeRecord) -> Result<(), StoreError> {
        self.put(TRADES_TABLE, &trade.id, trade)
    }

    /// Trades matching the filters, oldest close first.
    pub fn load_trades(
        &self,
        executor_id: Option<&str>,
        strategy_id: Option<&str>,
        closed_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<TradeRecord>, StoreError> {
        let mut items: Vec<TradeRecord> = self
            .scan::<TradeRecord>(TRADES_TABLE)?
            .into_iter()
            .filter(|t| executor_id.is_none_or(|e| t.executor_id == e))
            .filter(|t| strategy_id.is_none_or(|s| t.strategy_id == s))
            .filter(|t| closed_since.is_none_or(|since| t.closed_at >= since))
            .collect();
        items.sort_by(|a, b| a.closed_at.cmp(&b.closed_at));
        Ok(items)
    }

    /// The `limit` most recent trades of a strategy, returned oldest first.
    pub fn load_recent_trades(
        &self,
        strategy_id: &str,
        limit: usize,
    ) -> Result<Vec<TradeRecord>, StoreError> {
        let mut items = self.load_trades(None, Some(strategy_id), None)?;
        if items.len() > limit {
            items.drain(..items.len() - limit);
        }
        Ok(items)
    }

    /// Upsert an account report, carrying the equity high-water mark forward.
    pub fn save_account(&self, report: &AccountState) -> Result<AccountState, StoreError> {
        let txn = self.store.begin_write()?;
        let merged = {
            let mut table = txn.open_table(ACCOUNTS_TABLE)?;
            let previous: Option<AccountState> = {
                let guard = table.get(report.executor_id.as_str())?;
                guard
                    .map(|v| serde_json::from_slice::<AccountState>(&v.value()))
                    .transpose()?
            };
            let mut merged = report.clone();
            let mut peak = report.balance.max(report.equity);
            if let Some(reported) = report.peak_equity {
                peak = peak.max(reported);
            }
            if let Some(prev_peak) = previous.and_then(|p| p.peak_equity) {
                peak = peak.max(prev_peak);
            }
            merged.peak_equity = Some(peak);
            let data = serde_json::to_vec(&merged)?;
            table.insert(report.executor_id.as_str(), data)?;
            merged
        };
        txn.commit()?;
        Ok(merged)
    }

    pub fn load_account(&self, executor_id: &str) -> Result<Option<AccountState>, StoreError> {
        self.get(ACCOUNTS_TABLE, executor_id)
    }

    // --- Strategies ---

    pub fn save_strategy(&self, strategy: &StrategyRecord) -> Result<(), StoreError> {
        self.put(STRATEGIES_TABLE, &strategy.id, strategy)
    }

    pub fn load_strategy(&self, strategy_id: &str) -> Result<Option<StrategyRecord>, StoreError> {
        self.get(STRATEGIES_TABLE, strategy_id)
    }

    pub fn load_strategies(&self) -> Result<Vec<StrategyRecord>, StoreError> {
        self.scan(STRATEGIES_TABLE)
    }

    pub fn update_strategy_parameters(
        &self,
        strategy_id: &str,
        parameters: &ParameterSet,
        at: DateTime<Utc>,
    ) -> Result<Option<StrategyRecord>, StoreError> {
        self.update(STRATEGIES_TABLE, strategy_id, |s: &mut StrategyRecord| {
            s.parameters = parameters.clone();
            s.updated_at = at;
        })
    }

    /// Performance bookkeeping fed by command acknowledgements.
    pub fn record_strategy_execution(
        &self,
        strategy_id: &str,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<Option<StrategyRecord>, StoreError> {
        self.update(STRATEGIES_TABLE, strategy_id, |s: &mut StrategyRecord| {
            if success {
                s.performance.commands_executed += 1;
                s.performance.last_executed_at = Some(at);
            } else {
                s.performance.commands_failed += 1;
            }
            s.updated_at = at;
        })
    }

    // --- Snapshots ---

    /// Append a snapshot, stamping it with the next snapshot sequence number.
    pub fn save_snapshot(&self, snapshot: &mut ParameterSnapshot) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut meta = txn.open_table(METADATA_TABLE)?;
            let last: u64 = match meta.get(SNAPSHOT_SEQUENCE_KEY)? {
                Some(v) => serde_json::from_slice(&v.value())?,
                None => 0,
            };
            snapshot.sequence = last + 1;
            meta.insert(SNAPSHOT_SEQUENCE_KEY, serde_json::to_vec(&snapshot.sequence)?)?;

            let mut table = txn.open_table(SNAPSHOTS_TABLE)?;
            table.insert(snapshot.id.as_str(), serde_json::to_vec(&*snapshot)?)?;
        }
        txn.commit()?;

        self.record(
            AuditEntry::SnapshotWritten {
                snapshot_id: snapshot.id.clone(),
                strategy_id: snapshot.strategy_id.clone(),
                executor_id: snapshot.executor_id.clone(),
                reason: snapshot.reason.clone(),
            },
            snapshot.created_at,
        )?;
        Ok(())
    }

    /// Snapshots of a strategy, oldest first, in write order within a timestamp.
    pub fn load_snapshots(&self, strategy_id: &str) -> Result<Vec<ParameterSnapshot>, StoreError> {
        let mut items: Vec<ParameterSnapshot> = self
            .scan::<ParameterSnapshot>(SNAPSHOTS_TABLE)?
            .into_iter()
            .filter(|s| s.strategy_id == strategy_id)
            .collect();
        items.sort_by_key(|s| (s.created_at, s.sequence));
        Ok(items)
    }

    // --- Optimizations ---

    pub fn save_optimization(&self, optimization: &ParameterOptimization) -> Result<(), StoreError> {
        self.put(OPTIMIZATIONS_TABLE, &optimization.id, optimization)
    }

    pub fn load_optimization(
        &self,
        optimization_id: &str,
    ) -> Result<Option<ParameterOptimization>, StoreError> {
        self.get(OPTIMIZATIONS_TABLE, optimization_id)
    }

    /// Optimizations matching the filters, newest first.
    pub fn load_optimizations(
        &self,
        strategy_id: Option<&str>,
        statuses: Option<&[OptimizationStatus]>,
    ) -> Result<Vec<ParameterOptimization>, StoreError> {
        let mut items: Vec<ParameterOptimization> = self
            .scan::<ParameterOptimization>(OPTIMIZATIONS_TABLE)?
            .into_iter()
            .filter(|o| strategy_id.is_none_or(|s| o.strategy_id == s))
            .filter(|o| statuses.is_none_or(|st| st.contains(&o.status)))
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(items)
    }

    // --- Anomalies ---

    pub fn save_anomaly(&self, anomaly: &AnomalyRecord) -> Result<(), StoreError> {
        self.put(ANOMALIES_TABLE, &anomaly.id, anomaly)
    }

    pub fn load_anomaly(&self, anomaly_id: &str) -> Result<Option<AnomalyRecord>, StoreError> {
        self.get(ANOMALIES_TABLE, anomaly_id)
    }

    /// Anomalies newest first.
    pub fn load_anomalies(&self, unresolved_only: bool) -> Result<Vec<AnomalyRecord>, StoreError> {
        let mut items: Vec<AnomalyRecord> = self
            .scan::<AnomalyRecord>(ANOMALIES_TABLE)?
            .into_iter()
            .filter(|a| !unresolved_only || !a.resolved)
            .collect();
        items.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at));
        Ok(items)
    }

    // --- Metadata ---

    pub fn save_metadata(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
        self.put(METADATA_TABLE, key, &value)
    }

    pub fn load_metadata(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        self.get(METADATA_TABLE, key)
    }
}
