/// Command Lifecycle FSM
///
/// Every command passes through a guarded set of states. Illegal transitions
/// are logged and rejected, leaving the command untouched.
///
/// State Diagram:
/// ```text
///   Pending → Executing → Executed
///      ↓   ↖     ↓
///      ↓   (retry) → Failed
///      ↓         ↓
///   Cancelled  Cancelled (emergency stop)
///
///   Pending → Failed (expired before dispatch)
///
///   Terminal states: Executed, Failed, Cancelled
/// ```
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    /// Admitted and waiting in the queue
    #[default]
    Pending,
    /// Popped by a worker, delivered or about to be delivered
    Executing,
    /// Executor reported success. Terminal.
    Executed,
    /// Executor failure, expiry, late safety failure or retries exhausted. Terminal.
    Failed,
    /// Cancelled before dispatch or flushed by an emergency stop. Terminal.
    Cancelled,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Executed | Self::Failed | Self::Cancelled)
    }

    pub fn valid_transitions(&self) -> &'static [CommandStatus] {
        use CommandStatus::*;
        match self {
            Pending => &[Executing, Cancelled, Failed],
            Executing => &[Executed, Failed, Cancelled, Pending],
            Executed => &[],
            Failed => &[],
            Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, next: &CommandStatus) -> bool {
        self.valid_transitions().contains(next)
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Executing => "EXECUTING",
            Self::Executed => "EXECUTED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{}", s)
    }
}

/// Current state of a command plus its transition history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CommandLifecycle {
    pub state: CommandStatus,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub transitions: Vec<StatusTransition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: CommandStatus,
    pub to: CommandStatus,
    pub timestamp_ms: i64,
    pub reason: Option<String>,
}

impl CommandLifecycle {
    /// Attempt a state transition. Returns Ok(()) if valid, Err with reason if not.
    pub fn transition(
        &mut self,
        command_id: &str,
        next: CommandStatus,
        timestamp_ms: i64,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.state.can_transition_to(&next) {
            let msg = format!(
                "Illegal command transition for {}: {} → {} (reason: {:?})",
                command_id, self.state, next, reason
            );
            error!("{}", msg);
            return Err(msg);
        }

        debug!(
            command_id = %command_id,
            from = %self.state,
            to = %next,
            "Command transition"
        );

        self.transitions.push(StatusTransition {
            from: self.state,
            to: next,
            timestamp_ms,
            reason: reason.clone(),
        });
        self.state = next;
        self.reason = reason;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Number of times the command went back to the queue.
    pub fn requeue_count(&self) -> usize {
        self.transitions
            .iter()
            .filter(|t| t.from == CommandStatus::Executing && t.to == CommandStatus::Pending)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_lifecycle() {
        let mut lc = CommandLifecycle::default();
        assert!(
            lc.transition("c-1", CommandStatus::Executing, 1, None)
                .is_ok()
        );
        assert!(
            lc.transition("c-1", CommandStatus::Executed, 2, None)
                .is_ok()
        );
        assert!(lc.is_terminal());
        assert_eq!(lc.transitions.len(), 2);
    }

    #[test]
    fn test_retry_returns_to_pending() {
        let mut lc = CommandLifecycle::default();
        assert!(
            lc.transition("c-2", CommandStatus::Executing, 1, None)
                .is_ok()
        );
        assert!(
            lc.transition("c-2", CommandStatus::Pending, 2, Some("retry 1/3".into()))
                .is_ok()
        );
        assert_eq!(lc.requeue_count(), 1);
        assert_eq!(lc.reason.as_deref(), Some("retry 1/3"));
    }

    #[test]
    fn test_illegal_transition_fails() {
        let mut lc = CommandLifecycle::default();
        // Cannot complete a command that was never dispatched
        assert!(
            lc.transition("c-3", CommandStatus::Executed, 1, None)
                .is_err()
        );
        assert_eq!(lc.state, CommandStatus::Pending);
    }

    #[test]
    fn test_terminal_states_cannot_transition() {
        let mut lc = CommandLifecycle::default();
        assert!(
            lc.transition("c-4", CommandStatus::Cancelled, 1, Some("operator".into()))
                .is_ok()
        );
        assert!(
            lc.transition("c-4", CommandStatus::Executing, 2, None)
                .is_err()
        );
    }
}
