pub mod advisory;
pub mod api;
pub mod auth_middleware;
pub mod circuit_breaker;
pub mod command_fsm;
pub mod command_queue;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod event_ingestor;
pub mod heartbeat;
pub mod metrics;
pub mod model;
pub mod optimization;
pub mod parameter_validator;
pub mod persistence;
pub mod rate_limiter;
pub mod risk_policy;
pub mod risk_simulation;
pub mod rollback;
pub mod safety_gate;
pub mod security;
pub mod subjects;
pub mod trade_metrics;
pub mod transport;
