use crate::advisory::AdvisoryError;
use crate::persistence::redb_store::StoreError;
use crate::risk_policy::PolicyError;
use crate::transport::TransportError;
use thiserror::Error;

/// Error taxonomy of the control plane.
///
/// `Validation`, `SafetyViolation` and `RiskRejection` surface synchronously
/// and are never queued. `TransientDispatch` is retried until the command's
/// retry budget is spent, after which it becomes `PermanentDispatch`.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Safety violation: {}", .0.join("; "))]
    SafetyViolation(Vec<String>),

    #[error("Risk rejection: {}", .0.join("; "))]
    RiskRejection(Vec<String>),

    #[error("Transient dispatch error: {0}")]
    TransientDispatch(String),

    #[error("Permanent dispatch error for {command_id}: {reason}")]
    PermanentDispatch { command_id: String, reason: String },

    #[error("Circuit breaker trip: {0}")]
    CircuitBreakerTrip(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Rate limit exceeded for sender {0}")]
    RateLimited(String),

    #[error("Trading halted for strategy {strategy_id}: {reason}")]
    Halted { strategy_id: String, reason: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Advisory error: {0}")]
    Advisory(#[from] AdvisoryError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ControlError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Errors the dispatcher may retry against the command's retry budget.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientDispatch(_) | Self::Transport(_))
    }

    /// Stable machine-readable code used by the operator API.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::SafetyViolation(_) => "SAFETY_VIOLATION",
            Self::RiskRejection(_) => "RISK_REJECTION",
            Self::TransientDispatch(_) => "TRANSIENT_DISPATCH_ERROR",
            Self::PermanentDispatch { .. } => "PERMANENT_DISPATCH_ERROR",
            Self::CircuitBreakerTrip(_) => "CIRCUIT_BREAKER_TRIP",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::RateLimited(_) => "RATE_LIMITED",
            Self::Halted { .. } => "TRADING_HALTED",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::Store(_) => "STORE_ERROR",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Advisory(_) => "ADVISORY_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

impl From<PolicyError> for ControlError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::Invalid { key, reason } => {
                Self::Validation(format!("{}: {}", key, reason))
            }
            PolicyError::Store(e) => Self::Store(e),
            PolicyError::Serialization(e) => Self::Serialization(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;
