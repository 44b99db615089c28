use std::time::Duration;

use warden_process::{ExitInfo, Stream};

/// Why a game's run loop ended without restarting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// An operator stopped it.
    Killed,
    /// The manager is shutting down.
    Shutdown,
    /// The workload exited with a non-zero code.
    ExitCode,
    /// Restarting is disabled for this game.
    RestartDisabled,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StopReason::Killed => "stopped by operator",
            StopReason::Shutdown => "shutting down",
            StopReason::ExitCode => "exited with an error",
            StopReason::RestartDisabled => "restart disabled",
        })
    }
}

/// Decisions the run loop reports to its bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameEvent {
    Started,
    StartFailed(String),
    Exited(ExitInfo),
    Restarting(Duration),
    Stopped(StopReason),
    /// Supervision was released while the workload may still be running.
    Detached,
    /// The run failed after starting, e.g. the agent became unreachable.
    Failed(String),
}

/// Where a game's output goes. Matching lines against patterns and relaying
/// them to chat is the implementor's business.
pub trait OutputBridge: Send + Sync {
    fn on_line(&self, game: &str, line: &str, stream: Stream);

    fn on_event(&self, _game: &str, _event: &GameEvent) {}
}
