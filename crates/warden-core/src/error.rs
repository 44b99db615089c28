use warden_process::ProcessError;
use warden_proto::{RpcError, rpc_error};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("workload is already running")]
    AlreadyRunning,
    #[error("workload is not running")]
    NotRunning,
    #[error("invalid transport config: {0}")]
    Config(String),
    /// Could not reach the agent, including after self-hosting one.
    #[error("connect to agent at {addr}: {message}")]
    Connect { addr: String, message: String },
    /// The call was sent but the connection failed under it or it timed out.
    #[error("agent call {method}: {message}")]
    Rpc {
        method: &'static str,
        message: String,
    },
    /// The agent answered with an application error.
    #[error("agent: {0}")]
    Remote(RpcError),
    #[error(transparent)]
    Process(ProcessError),
}

impl TransportError {
    pub fn is_already_running(&self) -> bool {
        matches!(self, TransportError::AlreadyRunning)
    }

    pub fn is_not_running(&self) -> bool {
        matches!(self, TransportError::NotRunning)
    }

    /// Errors that mean the agent session is unusable and must be re-dialed.
    pub fn is_connection(&self) -> bool {
        matches!(self, TransportError::Connect { .. } | TransportError::Rpc { .. })
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        TransportError::Config(msg.into())
    }
}

impl From<ProcessError> for TransportError {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::AlreadyRunning => TransportError::AlreadyRunning,
            ProcessError::NotRunning => TransportError::NotRunning,
            other => TransportError::Process(other),
        }
    }
}

impl From<RpcError> for TransportError {
    fn from(e: RpcError) -> Self {
        match e.code.as_str() {
            rpc_error::ALREADY_RUNNING => TransportError::AlreadyRunning,
            rpc_error::NOT_RUNNING => TransportError::NotRunning,
            _ => TransportError::Remote(e),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GameError {
    #[error("game is already running")]
    AlreadyRunning,
    #[error("game is not running")]
    NotRunning,
    #[error("manager is shutting down")]
    ShuttingDown,
    #[error("invalid game config: {0}")]
    Config(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl GameError {
    pub fn is_already_running(&self) -> bool {
        matches!(self, GameError::AlreadyRunning)
            || matches!(self, GameError::Transport(e) if e.is_already_running())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("a game named {0:?} already exists")]
    DuplicateGame(String),
    #[error("no game named {0:?}")]
    UnknownGame(String),
    #[error("{name}: {source}")]
    Game {
        name: String,
        #[source]
        source: GameError,
    },
}

impl ManagerError {
    pub(crate) fn game(name: &str, source: GameError) -> Self {
        ManagerError::Game {
            name: name.to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_rebuild_contract_errors() {
        let e: TransportError = RpcError::new(rpc_error::ALREADY_RUNNING, "busy").into();
        assert!(e.is_already_running());
        let e: TransportError = RpcError::new(rpc_error::NOT_RUNNING, "gone").into();
        assert!(e.is_not_running());
        let e: TransportError = RpcError::new(rpc_error::SPAWN_FAILED, "no such file").into();
        assert!(matches!(e, TransportError::Remote(ref r) if r.code == rpc_error::SPAWN_FAILED));
        assert!(!e.is_connection());
    }

    #[test]
    fn process_errors_keep_their_contract_meaning() {
        let e: TransportError = ProcessError::AlreadyRunning.into();
        assert!(e.is_already_running());
        let g: GameError = e.into();
        assert!(g.is_already_running());
    }
}
