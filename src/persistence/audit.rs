use crate::persistence::redb_store::{RedbStore, StoreError};
use chrono::{DateTime, Utc};
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const AUDIT_TABLE: TableDefinition<u64, Vec<u8>> = TableDefinition::new("audit_log");

/// State-changing events recorded in the append-only audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEntry {
    CommandQueued {
        command_id: String,
        strategy_id: String,
        priority: String,
        target_executor: Option<String>,
    },
    CommandTransition {
        command_id: String,
        from: String,
        to: String,
        reason: Option<String>,
    },
    CommandResultRecorded {
        command_id: String,
        executor_id: String,
        success: bool,
    },
    SnapshotWritten {
        snapshot_id: String,
        strategy_id: String,
        executor_id: String,
        reason: String,
    },
    OptimizationTransition {
        optimization_id: String,
        from: String,
        to: String,
        reason: Option<String>,
    },
    AnomalyRaised {
        anomaly_id: String,
        severity: String,
        description: String,
    },
    AnomalyResolved {
        anomaly_id: String,
        resolution: String,
    },
    PolicyUpdated {
        key: String,
        payload: serde_json::Value,
    },
    TradingHaltChanged {
        scope: String,
        halted: bool,
        reason: String,
    },
    EmergencyStop {
        reason: String,
        initiated_by: String,
        cancelled_commands: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub entry: AuditEntry,
}

pub struct AuditLog {
    store: Arc<RedbStore>,
}

impl AuditLog {
    pub fn new(store: Arc<RedbStore>) -> Self {
        Self { store }
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let _ = txn.open_table(AUDIT_TABLE)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn append(&self, entry: AuditEntry, at: DateTime<Utc>) -> Result<u64, StoreError> {
        let record = AuditRecord {
            recorded_at: at,
            entry,
        };
        let txn = self.store.begin_write()?;
        let sequence_id = {
            let mut table = txn.open_table(AUDIT_TABLE)?;
            let last_id = table.last()?.map(|(k, _)| k.value()).unwrap_or(0);
            let new_id = last_id + 1;

            let data = serde_json::to_vec(&record)?;
            table.insert(new_id, data)?;
            new_id
        };
        txn.commit()?;

        debug!("📝 Audit Append: Seq {}", sequence_id);
        Ok(sequence_id)
    }

    pub fn read_from(&self, start_seq: u64) -> Result<Vec<(u64, AuditRecord)>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(AUDIT_TABLE)?;

        let mut entries = Vec::new();
        for result in table.range(start_seq..)? {
            let (k, v) = result?;
            let record: AuditRecord = serde_json::from_slice(&v.value())?;
            entries.push((k.value(), record));
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_sequences_are_monotonic() {
        let path = format!("/tmp/test_audit_{}.redb", Uuid::new_v4());
        let store = Arc::new(RedbStore::new(&path).unwrap());
        let audit = AuditLog::new(store);
        audit.initialize().unwrap();

        let now = Utc::now();
        let first = audit
            .append(
                AuditEntry::AnomalyResolved {
                    anomaly_id: "a-1".into(),
                    resolution: "reviewed".into(),
                },
                now,
            )
            .unwrap();
        let second = audit
            .append(
                AuditEntry::EmergencyStop {
                    reason: "manual".into(),
                    initiated_by: "ops".into(),
                    cancelled_commands: 2,
                },
                now,
            )
            .unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);

        let tail = audit.read_from(2).unwrap();
        assert_eq!(tail.len(), 1);
        assert!(matches!(
            tail[0].1.entry,
            AuditEntry::EmergencyStop {
                cancelled_commands: 2,
                ..
            }
        ));

        let _ = std::fs::remove_file(path);
    }
}
