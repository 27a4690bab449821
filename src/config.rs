use crate::risk_policy::{CircuitBreakerThresholds, SafetyLimits};
use crate::rollback::RollbackPolicy;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub storage: StorageConfig,
    pub transport: TransportConfig,
    pub dispatcher: DispatcherConfig,
    pub limits: SafetyLimits,
    pub breaker: CircuitBreakerThresholds,
    pub heartbeat: HeartbeatConfig,
    pub advisory: AdvisoryConfig,
    pub optimization: OptimizationConfig,
    pub rollback: RollbackPolicy,
    pub api: ApiConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "data/brain-control.redb".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TransportConfig {
    /// Pub/sub link carrying results, trades, account reports and heartbeats
    pub broadcast_url: String,
    /// Request/reply link to the terminal agents
    pub rpc_url: String,
    /// One dispatch worker is spawned per executor
    pub executor_ids: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            broadcast_url: "nats://localhost:4222".to_string(),
            rpc_url: "nats://localhost:4222".to_string(),
            executor_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DispatcherConfig {
    pub request_timeout_ms: u64,
    /// How long a worker waits for the result event after delivery
    pub result_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub rate_limit_max_requests: usize,
    pub rate_limit_window_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            result_timeout_ms: 30_000,
            poll_interval_ms: 250,
            retry_initial_delay_ms: 500,
            retry_max_delay_ms: 10_000,
            rate_limit_max_requests: 60,
            rate_limit_window_secs: 60,
        }
    }
}

impl DispatcherConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_millis(self.result_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    /// Consecutive failed sends tolerated before the link is marked degraded
    pub missed_threshold: u32,
    pub backlog_degraded: usize,
    pub backlog_unhealthy: usize,
    pub error_rate_degraded: f64,
    pub error_rate_unhealthy: f64,
    pub error_window_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            missed_threshold: 3,
            backlog_degraded: 100,
            backlog_unhealthy: 500,
            error_rate_degraded: 0.1,
            error_rate_unhealthy: 0.5,
            error_window_secs: 300,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AdvisoryConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.1,
            max_tokens: 2_000,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OptimizationConfig {
    pub min_trades: usize,
    pub max_trades: usize,
    /// At or above: approve and apply without a human
    pub auto_apply_confidence: f64,
    /// At or above (and below auto-apply): hold for approval
    pub approval_confidence: f64,
    pub min_post_apply_trades: usize,
    pub monitor_interval_secs: u64,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            min_trades: 20,
            max_trades: 100,
            auto_apply_confidence: 0.95,
            approval_confidence: 0.85,
            min_post_apply_trades: 10,
            monitor_interval_secs: 300,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
    /// Operator API key. Requests are refused when unset.
    pub api_key: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3002".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SecurityConfig {
    /// Envelopes are signed when set
    pub hmac_secret: Option<String>,
    pub timestamp_tolerance_secs: i64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            hmac_secret: None,
            timestamp_tolerance_secs: 30,
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let home = env::var("HOME").unwrap_or_else(|_| ".".into());

        let s = Config::builder()
            // 1. Global config from ~/.brain-control/config.{toml,json}
            .add_source(File::with_name(&format!("{}/.brain-control/config", home)).required(false))
            // 2. Project config
            .add_source(File::with_name("config/config").required(false))
            // 3. Local overrides (not checked in)
            .add_source(File::with_name("config/local").required(false))
            // 4. Environment, e.g. CONTROL__TRANSPORT__RPC_URL
            .add_source(Environment::with_prefix("CONTROL").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
