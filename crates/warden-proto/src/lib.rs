// Agent wire protocol shared by the agent server and the remote transport.
//
// Messages are prost-encoded and carried base64 inside JSON text frames over a
// WebSocket, one request frame and one response frame per call. Calls are
// matched by id, so any number of calls may be in flight on one connection.

pub mod frame;
pub mod rpc_error;

pub mod warden {
    pub mod agent {
        pub mod v1;
    }
}

pub use frame::{AgentFrame, ClientFrame, PayloadError, decode_payload, encode_payload};
pub use rpc_error::RpcError;
pub use warden::agent::v1 as agent_v1;

/// Fully qualified method names understood by the agent dispatcher.
pub mod method {
    pub const START: &str = "/warden.agent.v1.Agent/Start";
    pub const WRITE: &str = "/warden.agent.v1.Agent/Write";
    pub const STOP_OR_KILL: &str = "/warden.agent.v1.Agent/StopOrKillTimeout";
    pub const WAIT: &str = "/warden.agent.v1.Agent/Wait";
    pub const GET_STDOUT: &str = "/warden.agent.v1.Agent/GetStdout";
    pub const GET_STDERR: &str = "/warden.agent.v1.Agent/GetStderr";
    pub const GET_STATUS: &str = "/warden.agent.v1.Agent/GetStatus";
    pub const GET_HUMAN_STATUS: &str = "/warden.agent.v1.Agent/GetHumanStatus";
    pub const PING: &str = "/warden.agent.v1.Agent/Ping";
}

/// WebSocket path the agent accepts upgrades on.
pub const AGENT_WS_PATH: &str = "/agent/v1";

/// Environment an agent process reads its configuration from. The remote
/// transport sets these when it self-hosts an agent.
pub mod agent_env {
    pub const LISTEN: &str = "WARDEN_AGENT_LISTEN";
    pub const UNIX: &str = "WARDEN_AGENT_UNIX";
    pub const PROCESS: &str = "WARDEN_AGENT_PROCESS";
    pub const STDIO_LINES: &str = "WARDEN_AGENT_STDIO_LINES";
    pub const LONG_POLL_MS: &str = "WARDEN_AGENT_LONG_POLL_MS";
    pub const LOG_DIR: &str = "WARDEN_AGENT_LOG_DIR";
}
