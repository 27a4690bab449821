// Canonical Subject Catalog for the Brain/Executor control plane.
// Executors subscribe to the command subjects, publish on the event subjects.

// -----------------------------------------------------------------------------
// COMMANDS
// -----------------------------------------------------------------------------

// Request/reply delivery to one executor: brain.cmd.executor.<executor_id>
pub const CMD_EXECUTOR_PREFIX: &str = "brain.cmd.executor";

// Broadcast stop, every executor listens
pub const CMD_EMERGENCY_STOP: &str = "brain.cmd.emergency_stop";

// -----------------------------------------------------------------------------
// EVENTS
// -----------------------------------------------------------------------------

pub const EVT_COMMAND_RESULT: &str = "brain.evt.command.result";
pub const EVT_TRADE_CLOSED: &str = "brain.evt.trade.closed";
pub const EVT_ACCOUNT_UPDATE: &str = "brain.evt.account.update";
pub const EVT_HEARTBEAT: &str = "brain.evt.heartbeat";

// -----------------------------------------------------------------------------
// SUBSCRIPTION PATTERNS (WILDCARDS)
// -----------------------------------------------------------------------------

pub const EVT_WILDCARD: &str = "brain.evt.>";
pub const CMD_EXECUTOR_WILDCARD: &str = "brain.cmd.executor.*";

pub fn executor_command_subject(executor_id: &str) -> String {
    format!("{}.{}", CMD_EXECUTOR_PREFIX, executor_id)
}
