use once_cell::sync::Lazy;
use parking_lot::Mutex;
use prometheus::{
    Histogram, IntCounter, IntGauge, register_histogram, register_int_counter, register_int_gauge,
};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

// --- Command Dispatch ---

pub static DISPATCH_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "brain_control_dispatch_latency_seconds",
        "Command delivery to result latency",
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("dispatch_latency histogram")
});

pub static COMMANDS_ENQUEUED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "brain_control_commands_enqueued_total",
        "Total commands admitted to the queue"
    )
    .expect("commands_enqueued counter")
});

pub static COMMANDS_EXECUTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "brain_control_commands_executed_total",
        "Total commands acknowledged as executed"
    )
    .expect("commands_executed counter")
});

pub static COMMANDS_FAILED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "brain_control_commands_failed_total",
        "Total commands that ended FAILED"
    )
    .expect("commands_failed counter")
});

pub static COMMANDS_EXPIRED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "brain_control_commands_expired_total",
        "Total commands that expired in the queue"
    )
    .expect("commands_expired counter")
});

pub static COMMANDS_CANCELLED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "brain_control_commands_cancelled_total",
        "Total commands cancelled"
    )
    .expect("commands_cancelled counter")
});

pub static COMMAND_RETRIES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "brain_control_command_retries_total",
        "Total transient dispatch failures re-enqueued"
    )
    .expect("command_retries counter")
});

pub static SAFETY_REJECTIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "brain_control_safety_rejections_total",
        "Total commands blocked by the safety gate"
    )
    .expect("safety_rejections counter")
});

pub static RATE_LIMITED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "brain_control_rate_limited_total",
        "Total submissions refused by the sender rate limiter"
    )
    .expect("rate_limited counter")
});

pub static QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("brain_control_queue_depth", "Commands waiting in the queue")
        .expect("queue_depth gauge")
});

pub static IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "brain_control_in_flight",
        "Commands delivered and awaiting a result"
    )
    .expect("in_flight gauge")
});

// --- Safety & Optimization ---

pub static BREAKER_TRIPS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "brain_control_circuit_breaker_trips_total",
        "Total circuit breaker trips"
    )
    .expect("breaker_trips counter")
});

pub static EMERGENCY_STOPS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "brain_control_emergency_stops_total",
        "Total emergency stops issued"
    )
    .expect("emergency_stops counter")
});

pub static ROLLBACKS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "brain_control_rollbacks_total",
        "Total parameter rollbacks"
    )
    .expect("rollbacks counter")
});

pub static OPTIMIZATIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "brain_control_optimizations_total",
        "Total optimization runs"
    )
    .expect("optimizations counter")
});

// --- Link Health ---

pub static MISSED_HEARTBEATS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "brain_control_missed_heartbeats",
        "Consecutive heartbeats that failed to publish"
    )
    .expect("missed_heartbeats gauge")
});

pub static LINK_DEGRADED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "brain_control_link_degraded",
        "1 when the executor link is marked degraded"
    )
    .expect("link_degraded gauge")
});

pub fn observe_dispatch_latency(duration_sec: f64) {
    DISPATCH_LATENCY.observe(duration_sec);
}

pub fn inc_commands_enqueued() {
    COMMANDS_ENQUEUED.inc();
}

pub fn inc_commands_executed() {
    COMMANDS_EXECUTED.inc();
}

pub fn inc_commands_failed() {
    COMMANDS_FAILED.inc();
}

pub fn inc_commands_expired() {
    COMMANDS_EXPIRED.inc();
}

pub fn inc_commands_cancelled(count: u64) {
    COMMANDS_CANCELLED.inc_by(count);
}

pub fn inc_command_retries() {
    COMMAND_RETRIES.inc();
}

pub fn inc_safety_rejections() {
    SAFETY_REJECTIONS.inc();
}

pub fn inc_rate_limited() {
    RATE_LIMITED.inc();
}

pub fn set_queue_depth(depth: i64) {
    QUEUE_DEPTH.set(depth);
}

pub fn set_in_flight(count: i64) {
    IN_FLIGHT.set(count);
}

pub fn inc_breaker_trips() {
    BREAKER_TRIPS.inc();
}

pub fn inc_emergency_stops() {
    EMERGENCY_STOPS.inc();
}

pub fn inc_rollbacks() {
    ROLLBACKS.inc();
}

pub fn inc_optimizations() {
    OPTIMIZATIONS.inc();
}

pub fn set_missed_heartbeats(count: i64) {
    MISSED_HEARTBEATS.set(count);
}

pub fn set_link_degraded(degraded: bool) {
    LINK_DEGRADED.set(i64::from(degraded));
}

/// Text exposition of the default registry.
pub fn render() -> String {
    let encoder = prometheus::TextEncoder::new();
    encoder
        .encode_to_string(&prometheus::gather())
        .unwrap_or_default()
}

/// Success/failure outcomes over a trailing window, for the health report.
pub struct OutcomeWindow {
    window: Duration,
    outcomes: Mutex<VecDeque<(Instant, bool)>>,
}

impl OutcomeWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            outcomes: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, success: bool) {
        let now = Instant::now();
        let mut outcomes = self.outcomes.lock();
        outcomes.push_back((now, success));
        Self::evict(&mut outcomes, now, self.window);
    }

    /// Failure fraction in [0, 1]; 0 with no recent outcomes.
    pub fn error_rate(&self) -> f64 {
        let now = Instant::now();
        let mut outcomes = self.outcomes.lock();
        Self::evict(&mut outcomes, now, self.window);
        if outcomes.is_empty() {
            return 0.0;
        }
        let failures = outcomes.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / outcomes.len() as f64
    }

    fn evict(outcomes: &mut VecDeque<(Instant, bool)>, now: Instant, window: Duration) {
        while let Some((at, _)) = outcomes.front() {
            if now.duration_since(*at) > window {
                outcomes.pop_front();
            } else {
                break;
            }
        }
    }
}
