use std::{
    collections::HashMap,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use futures_util::{SinkExt, StreamExt};
use prost::Message;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::UnixStream,
    sync::{Mutex, mpsc, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Message as WsMessage, client::IntoClientRequest},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use warden_proto::{AGENT_WS_PATH, AgentFrame, ClientFrame, decode_payload, encode_payload};

use crate::error::TransportError;

#[derive(Debug)]
struct CallResponse {
    ok: bool,
    payload_b64: Option<String>,
    status_message: Option<String>,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<CallResponse>>>>;

/// One WebSocket connection to an agent. Calls are multiplexed by id; any
/// number may be in flight.
///
/// When the connection breaks, every pending call fails at once and the
/// client stays closed. Reconnecting means building a new client.
#[derive(Debug)]
pub struct AgentClient {
    addr: String,
    agent_version: String,
    agent_pid: u32,
    tx: mpsc::Sender<WsMessage>,
    pending: Pending,
    next_id: AtomicU64,
    closed: CancellationToken,
    log_rpc: bool,
    tasks: [JoinHandle<()>; 2],
}

impl AgentClient {
    pub async fn connect_tcp(
        addr: &str,
        timeout: Duration,
        log_rpc: bool,
    ) -> Result<Arc<Self>, TransportError> {
        let connect_err = |message: String| TransportError::Connect {
            addr: addr.to_string(),
            message,
        };
        let req = format!("ws://{addr}{AGENT_WS_PATH}")
            .into_client_request()
            .map_err(|e| connect_err(e.to_string()))?;
        let (ws, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(req))
            .await
            .map_err(|_| connect_err("timed out".to_string()))?
            .map_err(|e| connect_err(e.to_string()))?;
        Self::handshake(addr.to_string(), ws, timeout, log_rpc).await
    }

    pub async fn connect_unix(
        path: &Path,
        timeout: Duration,
        log_rpc: bool,
    ) -> Result<Arc<Self>, TransportError> {
        let addr = format!("unix://{}", path.display());
        let connect_err = |message: String| TransportError::Connect {
            addr: addr.clone(),
            message,
        };
        let dial = async {
            let stream = UnixStream::connect(path)
                .await
                .map_err(|e| connect_err(e.to_string()))?;
            let (ws, _) = tokio_tungstenite::client_async(format!("ws://localhost{AGENT_WS_PATH}"), stream)
                .await
                .map_err(|e| connect_err(e.to_string()))?;
            Ok::<_, TransportError>(ws)
        };
        let ws = tokio::time::timeout(timeout, dial)
            .await
            .map_err(|_| connect_err("timed out".to_string()))??;
        Self::handshake(addr.clone(), ws, timeout, log_rpc).await
    }

    async fn handshake<S>(
        addr: String,
        ws: WebSocketStream<S>,
        timeout: Duration,
        log_rpc: bool,
    ) -> Result<Arc<Self>, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let connect_err = |message: &str| TransportError::Connect {
            addr: addr.clone(),
            message: message.to_string(),
        };

        let first = tokio::time::timeout(timeout, stream.next())
            .await
            .map_err(|_| connect_err("no hello from agent"))?;
        let (agent_version, agent_pid) = match first {
            Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<AgentFrame>(&text) {
                Ok(AgentFrame::Hello { agent_version, pid }) => (agent_version, pid),
                _ => return Err(connect_err("expected hello frame")),
            },
            _ => return Err(connect_err("connection closed before hello")),
        };

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel::<WsMessage>(64);

        let span = tracing::debug_span!("agent_client", addr = %addr);

        let writer = {
            let closed = closed.clone();
            tokio::spawn(
                async move {
                    loop {
                        let msg = tokio::select! {
                            _ = closed.cancelled() => break,
                            msg = rx.recv() => msg,
                        };
                        let Some(msg) = msg else { break };
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    let _ = sink.send(WsMessage::Close(None)).await;
                    closed.cancel();
                }
                .instrument(span.clone()),
            )
        };

        let reader = {
            let closed = closed.clone();
            let pending = pending.clone();
            tokio::spawn(
                async move {
                    loop {
                        let msg = tokio::select! {
                            _ = closed.cancelled() => break,
                            msg = stream.next() => msg,
                        };
                        let Some(Ok(msg)) = msg else { break };
                        match msg {
                            WsMessage::Text(text) => {
                                let Ok(AgentFrame::Resp {
                                    id,
                                    ok,
                                    payload_b64,
                                    status_message,
                                }) = serde_json::from_str::<AgentFrame>(&text)
                                else {
                                    continue;
                                };
                                if let Some(tx) = pending.lock().await.remove(&id) {
                                    let _ = tx.send(CallResponse {
                                        ok,
                                        payload_b64,
                                        status_message,
                                    });
                                }
                            }
                            WsMessage::Close(_) => break,
                            _ => {}
                        }
                    }
                    closed.cancel();
                    // Dropping the senders fails every waiting call.
                    pending.lock().await.clear();
                    tracing::debug!("agent connection closed");
                }
                .instrument(span),
            )
        };

        tracing::debug!(%addr, %agent_version, agent_pid, "connected to agent");
        Ok(Arc::new(Self {
            addr,
            agent_version,
            agent_pid,
            tx,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            log_rpc,
            tasks: [writer, reader],
        }))
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn agent_version(&self) -> &str {
        &self.agent_version
    }

    pub fn agent_pid(&self) -> u32 {
        self.agent_pid
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Issue one call. `timeout` of `None` waits as long as the connection
    /// lives.
    pub async fn call<Req, Res>(
        &self,
        method: &'static str,
        req: &Req,
        timeout: Option<Duration>,
    ) -> Result<Res, TransportError>
    where
        Req: Message,
        Res: Message + Default,
    {
        let rpc_err = |message: String| TransportError::Rpc { method, message };
        if self.is_closed() {
            return Err(rpc_err("connection closed".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel::<CallResponse>();
        self.pending.lock().await.insert(id, tx);
        // The reader cancels before it clears; re-check so a call registered
        // after the clear cannot wait forever.
        if self.is_closed() {
            let _ = self.pending.lock().await.remove(&id);
            return Err(rpc_err("connection closed".to_string()));
        }

        let frame = ClientFrame::Req {
            id,
            method: method.to_string(),
            payload_b64: encode_payload(req),
        };
        let text = serde_json::to_string(&frame).map_err(|e| rpc_err(format!("encode request: {e}")))?;

        let began = Instant::now();
        if self.tx.send(WsMessage::Text(text.into())).await.is_err() {
            let _ = self.pending.lock().await.remove(&id);
            return Err(rpc_err("connection closed".to_string()));
        }

        let resp = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(r) => r,
                Err(_) => {
                    let _ = self.pending.lock().await.remove(&id);
                    return Err(rpc_err(format!("timed out after {}ms", limit.as_millis())));
                }
            },
            None => rx.await,
        };
        let Ok(resp) = resp else {
            return Err(rpc_err("connection closed".to_string()));
        };

        if self.log_rpc {
            tracing::debug!(
                method,
                id,
                ok = resp.ok,
                elapsed_ms = began.elapsed().as_millis() as u64,
                "agent call"
            );
        }

        if !resp.ok {
            return Err(rpc_err(
                resp.status_message
                    .unwrap_or_else(|| "agent error".to_string()),
            ));
        }
        let payload = resp
            .payload_b64
            .ok_or_else(|| rpc_err("missing response payload".to_string()))?;
        decode_payload(&payload).map_err(|e| rpc_err(e.to_string()))
    }
}

impl Drop for AgentClient {
    fn drop(&mut self) {
        self.closed.cancel();
        for t in &self.tasks {
            t.abort();
        }
    }
}

/// Dial an agent at `addr`: a socket path when `unix`, else `host:port`.
pub async fn dial(
    addr: &str,
    unix: bool,
    timeout: Duration,
    log_rpc: bool,
) -> Result<Arc<AgentClient>, TransportError> {
    if unix {
        AgentClient::connect_unix(Path::new(addr), timeout, log_rpc).await
    } else {
        // Accept a scheme-qualified address the same way the agent prints it.
        let addr = addr.strip_prefix("tcp://").unwrap_or(addr);
        AgentClient::connect_tcp(addr, timeout, log_rpc).await
    }
}
