use crate::persistence::audit::AuditEntry;
use crate::persistence::redb_store::StoreError;
use crate::persistence::store::PersistenceStore;
use chrono::Utc;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Static pre-trade limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyLimits {
    /// Maximum realized loss per UTC day, in account currency (positive number)
    pub max_daily_loss: f64,
    /// Maximum concurrently open positions per executor
    pub max_positions: u32,
    /// Maximum volume of a single order in lots
    pub max_lot_size: f64,
    /// Maximum drawdown from peak equity, in percent
    pub max_drawdown_percent: f64,
    /// Maximum spread at submission, in points
    pub max_spread_points: f64,
    /// Maximum `riskPerTrade` parameter an optimization may propose, in percent
    pub max_risk_per_trade: f64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_daily_loss: 500.0,
            max_positions: 5,
            max_lot_size: 1.0,
            max_drawdown_percent: 20.0,
            max_spread_points: 30.0,
            max_risk_per_trade: 2.0,
        }
    }
}

/// Anomaly thresholds evaluated by the circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerThresholds {
    pub max_consecutive_losses: usize,
    /// Daily loss as percent of account balance
    pub max_daily_loss_percent: f64,
    pub max_drawdown_percent: f64,
    pub max_trades_per_hour: usize,
    /// Minimum win rate in percent, enforced once `min_trades_for_win_rate` exist
    pub min_win_rate: f64,
    pub min_trades_for_win_rate: usize,
}

impl Default for CircuitBreakerThresholds {
    fn default() -> Self {
        Self {
            max_consecutive_losses: 5,
            max_daily_loss_percent: 10.0,
            max_drawdown_percent: 20.0,
            max_trades_per_hour: 20,
            min_win_rate: 30.0,
            min_trades_for_win_rate: 20,
        }
    }
}

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Invalid policy {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("Policy persistence failed: {0}")]
    Store(#[from] StoreError),
    #[error("Policy serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A configuration document that can be administered at runtime.
pub trait PolicyDocument:
    Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Metadata key under which admin overrides are persisted.
    const KEY: &'static str;

    fn validate(&self) -> Result<(), String>;
}

fn require_positive(name: &str, value: f64) -> Result<(), String> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(format!("{} must be a positive number, got {}", name, value))
    }
}

impl PolicyDocument for SafetyLimits {
    const KEY: &'static str = "policy.safety_limits";

    fn validate(&self) -> Result<(), String> {
        require_positive("max_daily_loss", self.max_daily_loss)?;
        require_positive("max_lot_size", self.max_lot_size)?;
        require_positive("max_drawdown_percent", self.max_drawdown_percent)?;
        require_positive("max_spread_points", self.max_spread_points)?;
        require_positive("max_risk_per_trade", self.max_risk_per_trade)?;
        if self.max_positions == 0 {
            return Err("max_positions must be at least 1".into());
        }
        if self.max_drawdown_percent > 100.0 {
            return Err("max_drawdown_percent cannot exceed 100".into());
        }
        Ok(())
    }
}

impl PolicyDocument for CircuitBreakerThresholds {
    const KEY: &'static str = "policy.circuit_breaker";

    fn validate(&self) -> Result<(), String> {
        require_positive("max_daily_loss_percent", self.max_daily_loss_percent)?;
        require_positive("max_drawdown_percent", self.max_drawdown_percent)?;
        if self.max_consecutive_losses == 0 {
            return Err("max_consecutive_losses must be at least 1".into());
        }
        if self.max_trades_per_hour == 0 {
            return Err("max_trades_per_hour must be at least 1".into());
        }
        if !(0.0..=100.0).contains(&self.min_win_rate) {
            return Err(format!(
                "min_win_rate must be within 0..=100, got {}",
                self.min_win_rate
            ));
        }
        Ok(())
    }
}

/// Injectable handle to a live policy document.
///
/// Loaded at startup from configuration and then from persisted admin
/// overrides, changed only through `update`, read by value on every check.
#[derive(Clone)]
pub struct PolicyHandle<T: PolicyDocument> {
    inner: Arc<RwLock<T>>,
    store: Option<Arc<PersistenceStore>>,
}

impl<T: PolicyDocument> PolicyHandle<T> {
    /// In-memory handle without persistence.
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
            store: None,
        }
    }

    /// Persisted override wins over the configured value.
    pub fn load(configured: T, store: Arc<PersistenceStore>) -> Result<Self, PolicyError> {
        configured.validate().map_err(|reason| PolicyError::Invalid {
            key: T::KEY,
            reason,
        })?;

        let current = match store.load_metadata(T::KEY)? {
            Some(value) => match serde_json::from_value::<T>(value) {
                Ok(persisted) => {
                    info!(key = T::KEY, "🛡️ Loaded persisted policy override");
                    persisted
                }
                Err(e) => {
                    warn!(key = T::KEY, error = %e, "⚠️ Ignoring unreadable policy override");
                    configured
                }
            },
            None => configured,
        };

        Ok(Self {
            inner: Arc::new(RwLock::new(current)),
            store: Some(store),
        })
    }

    /// Snapshot by value.
    pub fn current(&self) -> T {
        self.inner.read().clone()
    }

    /// Admin update: validate, persist, then swap.
    pub fn update(&self, next: T) -> Result<T, PolicyError> {
        next.validate().map_err(|reason| PolicyError::Invalid {
            key: T::KEY,
            reason,
        })?;

        if let Some(store) = &self.store {
            let payload = serde_json::to_value(&next)?;
            store.save_metadata(T::KEY, payload.clone())?;
            store.record(
                AuditEntry::PolicyUpdated {
                    key: T::KEY.to_string(),
                    payload,
                },
                Utc::now(),
            )?;
        }

        let previous = std::mem::replace(&mut *self.inner.write(), next.clone());
        info!(key = T::KEY, ?previous, current = ?next, "🛡️ Policy updated");
        Ok(next)
    }
}
