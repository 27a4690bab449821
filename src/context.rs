use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use uuid::Uuid;

/// Trait for providing the current time.
/// Decouples queue expiry, trade windows and snapshot ordering from `Utc::now()`.
pub trait TimeProvider: Send + Sync {
    fn now_millis(&self) -> i64;
    fn now(&self) -> DateTime<Utc>;
}

/// Trait for generating unique IDs for commands, snapshots and anomalies.
pub trait IdProvider: Send + Sync {
    fn new_id(&self) -> String;
}

/// Providers shared by every component of the control plane.
#[derive(Clone)]
pub struct ControlContext {
    pub time: Arc<dyn TimeProvider>,
    pub id: Arc<dyn IdProvider>,
}

impl ControlContext {
    pub fn new_system() -> Self {
        Self {
            time: Arc::new(SystemTimeProvider),
            id: Arc::new(RandomIdProvider),
        }
    }

    /// Simulated clock plus sequential ids. Returns the clock so tests can drive it.
    pub fn new_simulated(start_time_ms: i64) -> (Self, Arc<SimulatedTimeProvider>) {
        let clock = Arc::new(SimulatedTimeProvider::new(start_time_ms));
        let ctx = Self {
            time: clock.clone(),
            id: Arc::new(DeterministicIdProvider::new()),
        };
        (ctx, clock)
    }
}

// --- Live Implementations ---

pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct RandomIdProvider;

impl IdProvider for RandomIdProvider {
    fn new_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

// --- Simulated Implementations ---

pub struct SimulatedTimeProvider {
    current_time_ms: AtomicI64,
}

impl SimulatedTimeProvider {
    pub fn new(start_time_ms: i64) -> Self {
        Self {
            current_time_ms: AtomicI64::new(start_time_ms),
        }
    }

    pub fn set_time(&self, time_ms: i64) {
        self.current_time_ms.store(time_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, duration_ms: i64) {
        self.current_time_ms.fetch_add(duration_ms, Ordering::SeqCst);
    }
}

impl TimeProvider for SimulatedTimeProvider {
    fn now_millis(&self) -> i64 {
        self.current_time_ms.load(Ordering::SeqCst)
    }

    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.now_millis())
            .single()
            .unwrap_or_default()
    }
}

#[derive(Default)]
pub struct DeterministicIdProvider {
    counter: AtomicU64,
}

impl DeterministicIdProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdProvider for DeterministicIdProvider {
    fn new_id(&self) -> String {
        let num = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("00000000-0000-0000-0000-{:012x}", num)
    }
}
