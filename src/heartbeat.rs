use crate::config::HeartbeatConfig;
use crate::context::ControlContext;
use crate::dispatcher::CommandDispatcher;
use crate::metrics;
use crate::subjects::EVT_HEARTBEAT;
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Published on every tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatMessage {
    pub source: String,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub error_rate: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub transport: &'static str,
    pub connected: bool,
    pub link_degraded: bool,
    pub missed_heartbeats: u32,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub error_rate: f64,
    pub issues: Vec<String>,
}

/// Liveness probing of the broadcast link plus health aggregation.
pub struct HeartbeatMonitor {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<CommandDispatcher>,
    config: HeartbeatConfig,
    ctx: ControlContext,
    missed: AtomicU32,
    degraded: AtomicBool,
}

impl HeartbeatMonitor {
    pub fn new(
        transport: Arc<dyn Transport>,
        dispatcher: Arc<CommandDispatcher>,
        config: HeartbeatConfig,
        ctx: ControlContext,
    ) -> Self {
        Self {
            transport,
            dispatcher,
            config,
            ctx,
            missed: AtomicU32::new(0),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn missed_heartbeats(&self) -> u32 {
        self.missed.load(Ordering::SeqCst)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Publish one heartbeat. Returns whether it went out.
    pub async fn tick(&self) -> bool {
        let message = HeartbeatMessage {
            source: "brain-control".to_string(),
            queue_depth: self.dispatcher.queue_depth().unwrap_or(0),
            in_flight: self.dispatcher.in_flight_count(),
            error_rate: self.dispatcher.outcomes().error_rate(),
            timestamp: self.ctx.time.now_millis(),
        };
        let payload = match serde_json::to_vec(&message) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to serialize heartbeat: {}", e);
                return false;
            }
        };

        match self.transport.publish(EVT_HEARTBEAT, payload).await {
            Ok(()) => {
                let previous = self.missed.swap(0, Ordering::SeqCst);
                metrics::set_missed_heartbeats(0);
                if self.degraded.swap(false, Ordering::SeqCst) {
                    metrics::set_link_degraded(false);
                    info!(previous_missed = previous, "✅ Heartbeat link recovered");
                }
                debug!(queue_depth = message.queue_depth, "💓 Heartbeat");
                true
            }
            Err(e) => {
                let missed = self.missed.fetch_add(1, Ordering::SeqCst) + 1;
                metrics::set_missed_heartbeats(missed as i64);
                warn!(missed, error = %e, "⚠️ Heartbeat send failed");
                if missed > self.config.missed_threshold {
                    if !self.degraded.swap(true, Ordering::SeqCst) {
                        metrics::set_link_degraded(true);
                        error!(missed, "🚨 Transport link degraded, forcing reconnect");
                    }
                    if let Err(e) = self.transport.reconnect().await {
                        error!(error = %e, "❌ Transport reconnect failed");
                    }
                }
                false
            }
        }
    }

    pub async fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.interval_secs.max(1));
        info!(interval_secs = interval.as_secs(), "💓 Heartbeat monitor started");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("🛑 Heartbeat monitor stopped");
    }

    pub fn get_health_status(&self) -> HealthReport {
        let connected = self.transport.is_connected();
        let link_degraded = self.is_degraded();
        let missed = self.missed_heartbeats();
        let queue_depth = self.dispatcher.queue_depth().unwrap_or(0);
        let error_rate = self.dispatcher.outcomes().error_rate();
        let c = &self.config;

        let mut unhealthy = Vec::new();
        if !connected {
            unhealthy.push("Transport disconnected".to_string());
        }
        if link_degraded {
            unhealthy.push(format!("Link degraded after {} missed heartbeats", missed));
        }
        if error_rate >= c.error_rate_unhealthy {
            unhealthy.push(format!("Error rate {:.1}%", error_rate * 100.0));
        }
        if queue_depth >= c.backlog_unhealthy {
            unhealthy.push(format!("Queue backlog {}", queue_depth));
        }

        let mut degraded = Vec::new();
        if !link_degraded && missed > 0 {
            degraded.push(format!("{} missed heartbeats", missed));
        }
        if error_rate >= c.error_rate_degraded && error_rate < c.error_rate_unhealthy {
            degraded.push(format!("Error rate {:.1}%", error_rate * 100.0));
        }
        if queue_depth >= c.backlog_degraded && queue_depth < c.backlog_unhealthy {
            degraded.push(format!("Queue backlog {}", queue_depth));
        }

        let status = if !unhealthy.is_empty() {
            HealthStatus::Unhealthy
        } else if !degraded.is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        unhealthy.extend(degraded);

        HealthReport {
            status,
            transport: self.transport.name(),
            connected,
            link_degraded,
            missed_heartbeats: missed,
            queue_depth,
            in_flight: self.dispatcher.in_flight_count(),
            error_rate,
            issues: unhealthy,
        }
    }
}
