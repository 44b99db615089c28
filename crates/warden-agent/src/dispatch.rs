use std::{sync::Arc, time::Duration};

use prost::Message;
use warden_process::{ProcessError, ProcessState as LocalState, Stream};
use warden_proto::agent_v1::{
    GetHumanStatusRequest, GetHumanStatusResponse, GetStatusRequest, GetStatusResponse,
    GetStdioRequest, GetStdioResponse, PingRequest, PingResponse, ProcessState, StartRequest,
    StartResponse, StdioLine, StopOrKillRequest, StopOrKillResponse, WaitRequest, WaitResponse,
    WriteRequest, WriteResponse,
};
use warden_proto::{RpcError, decode_payload, method, rpc_error};

use crate::agent::Agent;

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

fn to_rpc_error(err: &ProcessError) -> RpcError {
    let code = match err {
        ProcessError::AlreadyRunning => rpc_error::ALREADY_RUNNING,
        ProcessError::NotRunning => rpc_error::NOT_RUNNING,
        ProcessError::NotStarted => rpc_error::NOT_STARTED,
        ProcessError::Spawn { .. } => rpc_error::SPAWN_FAILED,
        ProcessError::Signal { .. } | ProcessError::Io(_) => rpc_error::INTERNAL,
    };
    RpcError::new(code, err.to_string())
}

fn map_state(s: LocalState) -> ProcessState {
    match s {
        LocalState::NotStarted => ProcessState::NotStarted,
        LocalState::Running => ProcessState::Running,
        LocalState::Exited => ProcessState::Exited,
    }
}

/// Routes decoded request frames to the agent.
#[derive(Debug, Clone)]
pub struct AgentRpc {
    agent: Arc<Agent>,
}

impl AgentRpc {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    fn decode_req<T: Message + Default>(&self, payload_b64: &str) -> Result<T, String> {
        decode_payload(payload_b64).map_err(|e| e.to_string())
    }

    /// `Err` is a frame-level failure. Process errors are encoded into the
    /// response payload.
    pub async fn dispatch(&self, method: &str, payload_b64: &str) -> Result<Vec<u8>, String> {
        match method {
            method::START => {
                let _: StartRequest = self.decode_req(payload_b64)?;
                let error = self.agent.start().await.err().map(|e| to_rpc_error(&e));
                Ok(StartResponse { error }.encode_to_vec())
            }
            method::WRITE => {
                let req: WriteRequest = self.decode_req(payload_b64)?;
                let error = self.agent.write(&req.data).await.err().map(|e| to_rpc_error(&e));
                Ok(WriteResponse { error }.encode_to_vec())
            }
            method::STOP_OR_KILL => {
                let req: StopOrKillRequest = self.decode_req(payload_b64)?;
                let timeout = if req.timeout_ms == 0 {
                    DEFAULT_STOP_TIMEOUT
                } else {
                    Duration::from_millis(req.timeout_ms)
                };
                let error = self
                    .agent
                    .stop_or_kill_timeout(timeout)
                    .await
                    .err()
                    .map(|e| to_rpc_error(&e));
                Ok(StopOrKillResponse { error }.encode_to_vec())
            }
            method::WAIT => {
                let _: WaitRequest = self.decode_req(payload_b64)?;
                let resp = match self.agent.wait().await {
                    Ok(exit) => WaitResponse {
                        exit_code: exit.code_or_negative(),
                        exit_string: exit.to_string(),
                        error: None,
                        signal: exit.signal.unwrap_or_default(),
                        has_signal: exit.signal.is_some(),
                    },
                    Err(e) => WaitResponse {
                        exit_code: -1,
                        exit_string: String::new(),
                        error: Some(to_rpc_error(&e)),
                        signal: 0,
                        has_signal: false,
                    },
                };
                Ok(resp.encode_to_vec())
            }
            method::GET_STDOUT | method::GET_STDERR => {
                let req: GetStdioRequest = self.decode_req(payload_b64)?;
                let stream = if method == method::GET_STDOUT {
                    Stream::Stdout
                } else {
                    Stream::Stderr
                };
                let chunk = self.agent.stdio_since(stream, req.since_seq).await;
                let resp = GetStdioResponse {
                    lines: chunk
                        .lines
                        .into_iter()
                        .map(|l| StdioLine {
                            seq: l.seq,
                            text: l.text,
                        })
                        .collect(),
                    finished: chunk.finished,
                    error: None,
                };
                Ok(resp.encode_to_vec())
            }
            method::GET_STATUS => {
                let _: GetStatusRequest = self.decode_req(payload_b64)?;
                let st = self.agent.status();
                let exit_code = st.exit.and_then(|e| e.code);
                let resp = GetStatusResponse {
                    state: map_state(st.state) as i32,
                    pid: st.pid.unwrap_or_default(),
                    has_pid: st.pid.is_some(),
                    exit_code: exit_code.unwrap_or_default(),
                    has_exit_code: exit_code.is_some(),
                    started_at_unix_ms: st.started_at.map(|t| t.timestamp_millis()).unwrap_or_default(),
                };
                Ok(resp.encode_to_vec())
            }
            method::GET_HUMAN_STATUS => {
                let _: GetHumanStatusRequest = self.decode_req(payload_b64)?;
                Ok(GetHumanStatusResponse {
                    status: self.agent.human_status(),
                }
                .encode_to_vec())
            }
            method::PING => {
                let req: PingRequest = self.decode_req(payload_b64)?;
                Ok(PingResponse {
                    timestamp_unix_nanos: req.timestamp_unix_nanos,
                }
                .encode_to_vec())
            }
            _ => Err(format!("unknown method: {method}")),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use warden_process::ProcessSpec;
    use warden_proto::encode_payload;

    use super::*;
    use crate::config::{AgentConfig, ListenAddr};

    fn rpc(script: &str) -> AgentRpc {
        let spec = ProcessSpec::new("/bin/sh").arg("-c").arg(script);
        let mut cfg = AgentConfig::new(ListenAddr::Tcp("127.0.0.1:0".to_string()), spec);
        cfg.long_poll = Duration::from_millis(200);
        AgentRpc::new(Agent::new(&cfg))
    }

    async fn call<Req: Message, Res: Message + Default>(rpc: &AgentRpc, m: &str, req: Req) -> Res {
        let bytes = rpc.dispatch(m, &encode_payload(&req)).await.unwrap();
        Res::decode(bytes.as_slice()).unwrap()
    }

    #[tokio::test]
    async fn ping_echoes_timestamp() {
        let r = rpc("true");
        let resp: PingResponse = call(
            &r,
            method::PING,
            PingRequest {
                timestamp_unix_nanos: 1_700_000_000_123,
            },
        )
        .await;
        assert_eq!(resp.timestamp_unix_nanos, 1_700_000_000_123);
    }

    #[tokio::test]
    async fn unknown_method_is_a_frame_error() {
        let r = rpc("true");
        let err = r.dispatch("/warden.agent.v1.Agent/Nope", "").await.unwrap_err();
        assert!(err.contains("unknown method"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_start_reports_already_running_code() {
        let r = rpc("sleep 30");
        let first: StartResponse = call(&r, method::START, StartRequest {}).await;
        assert!(RpcError::check(first.error).is_ok());

        let second: StartResponse = call(&r, method::START, StartRequest {}).await;
        let err = RpcError::check(second.error).unwrap_err();
        assert_eq!(err.code, rpc_error::ALREADY_RUNNING);

        let status: GetStatusResponse = call(&r, method::GET_STATUS, GetStatusRequest {}).await;
        assert_eq!(status.state(), ProcessState::Running);
        assert!(status.has_pid);

        let stop: StopOrKillResponse = call(
            &r,
            method::STOP_OR_KILL,
            StopOrKillRequest { timeout_ms: 2000 },
        )
        .await;
        assert!(RpcError::check(stop.error).is_ok());

        let wait: WaitResponse = call(&r, method::WAIT, WaitRequest {}).await;
        assert!(RpcError::check(wait.error).is_ok());
        assert!(wait.has_signal);
        assert_eq!(wait.exit_code, -1);
    }

    #[tokio::test]
    async fn write_to_stopped_process_reports_not_running() {
        let r = rpc("true");
        let resp: WriteResponse = call(
            &r,
            method::WRITE,
            WriteRequest {
                data: b"say hello".to_vec(),
            },
        )
        .await;
        let err = RpcError::check(resp.error).unwrap_err();
        assert_eq!(err.code, rpc_error::NOT_RUNNING);
    }
}
