use std::path::PathBuf;

use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, UnixListener},
    sync::mpsc,
};
use tokio_tungstenite::tungstenite::{
    Message as WsMessage,
    handshake::server::{ErrorResponse, Request, Response},
    http::StatusCode,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span};
use warden_proto::{AGENT_WS_PATH, AgentFrame, ClientFrame, method};

use crate::{config::ListenAddr, dispatch::AgentRpc};

pub enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    pub async fn bind(addr: &ListenAddr) -> anyhow::Result<Self> {
        match addr {
            ListenAddr::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr).await?)),
            ListenAddr::Unix(path) => {
                // A previous agent that died without cleanup leaves its socket behind.
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
        }
    }

    /// Address a client should dial, with an ephemeral TCP port resolved.
    pub fn local_addr(&self) -> anyhow::Result<ListenAddr> {
        match self {
            Listener::Tcp(l) => Ok(ListenAddr::Tcp(l.local_addr()?.to_string())),
            Listener::Unix { path, .. } => Ok(ListenAddr::Unix(path.clone())),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Accept connections until `shutdown` fires. Each connection is served on
/// its own task; open connections are dropped when this returns.
pub async fn serve(
    listener: Listener,
    rpc: AgentRpc,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let conns = shutdown.child_token();
    let mut tasks = tokio::task::JoinSet::new();

    loop {
        while tasks.try_join_next().is_some() {}

        match &listener {
            Listener::Tcp(l) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    res = l.accept() => match res {
                        Ok((stream, peer)) => {
                            let _ = stream.set_nodelay(true);
                            tasks.spawn(handle_connection(stream, peer.to_string(), rpc.clone(), conns.clone()));
                        }
                        Err(e) => tracing::warn!(error = %e, "accept failed"),
                    },
                }
            }
            Listener::Unix { listener: l, .. } => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    res = l.accept() => match res {
                        Ok((stream, _)) => {
                            tasks.spawn(handle_connection(stream, "unix".to_string(), rpc.clone(), conns.clone()));
                        }
                        Err(e) => tracing::warn!(error = %e, "accept failed"),
                    },
                }
            }
        }
    }

    conns.cancel();
    tasks.shutdown().await;
    Ok(())
}

fn check_path(req: &Request, resp: Response) -> Result<Response, ErrorResponse> {
    if req.uri().path() == AGENT_WS_PATH {
        return Ok(resp);
    }
    let mut err = ErrorResponse::new(Some(format!("unknown path {}", req.uri().path())));
    *err.status_mut() = StatusCode::NOT_FOUND;
    Err(err)
}

/// Read-only calls that may block for a long time. They are dropped with the
/// connection; everything else runs to completion even if the caller is gone.
fn abandon_on_disconnect(m: &str) -> bool {
    matches!(m, method::WAIT | method::GET_STDOUT | method::GET_STDERR)
}

async fn handle_connection<S>(stream: S, peer: String, rpc: AgentRpc, shutdown: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let span = info_span!("agent_conn", peer = %peer);
    async move {
        let ws = match tokio_tungstenite::accept_hdr_async(stream, check_path).await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::debug!(error = %e, "handshake failed");
                return;
            }
        };
        let (mut sink, mut source) = ws.split();

        let hello = AgentFrame::Hello {
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            pid: std::process::id(),
        };
        let Ok(text) = serde_json::to_string(&hello) else {
            return;
        };
        if sink.send(WsMessage::Text(text.into())).await.is_err() {
            return;
        }
        tracing::info!("controller connected");

        let (tx, mut rx) = mpsc::channel::<WsMessage>(64);
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let gone = shutdown.child_token();
        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = source.next() => msg,
            };
            let Some(Ok(msg)) = msg else { break };
            match msg {
                WsMessage::Text(text) => {
                    let frame = serde_json::from_str::<ClientFrame>(&text).unwrap_or(ClientFrame::Unknown);
                    let ClientFrame::Req { id, method, payload_b64 } = frame else {
                        continue;
                    };
                    let rpc = rpc.clone();
                    let tx = tx.clone();
                    let gone = gone.clone();
                    tokio::spawn(async move {
                        let call = rpc.dispatch(&method, &payload_b64);
                        let result = if abandon_on_disconnect(&method) {
                            tokio::select! {
                                _ = gone.cancelled() => return,
                                r = call => r,
                            }
                        } else {
                            call.await
                        };
                        let out = match result {
                            Ok(bytes) => AgentFrame::ok(id, &bytes),
                            Err(message) => {
                                tracing::debug!(%method, %message, "request rejected");
                                AgentFrame::failed(id, message)
                            }
                        };
                        if let Ok(text) = serde_json::to_string(&out) {
                            let _ = tx.send(WsMessage::Text(text.into())).await;
                        }
                    });
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }

        gone.cancel();
        drop(tx);
        writer.abort();
        tracing::info!("controller disconnected");
    }
    .instrument(span)
    .await
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use prost::Message;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use warden_process::ProcessSpec;
    use warden_proto::{
        agent_v1::{PingRequest, PingResponse},
        decode_payload, encode_payload,
    };

    use super::*;
    use crate::{Agent, AgentConfig};

    async fn spawn_server() -> (String, CancellationToken) {
        let spec = ProcessSpec::new("/bin/sh").arg("-c").arg("true");
        let cfg = AgentConfig::new(ListenAddr::Tcp("127.0.0.1:0".to_string()), spec);
        let listener = Listener::bind(&cfg.listen).await.unwrap();
        let ListenAddr::Tcp(addr) = listener.local_addr().unwrap() else {
            unreachable!()
        };
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(listener, AgentRpc::new(Agent::new(&cfg)), shutdown.clone()));
        (addr, shutdown)
    }

    #[tokio::test]
    async fn hello_then_ping_over_websocket() {
        let (addr, shutdown) = spawn_server().await;
        let req = format!("ws://{addr}{AGENT_WS_PATH}").into_client_request().unwrap();
        let (mut ws, _) = tokio_tungstenite::connect_async(req).await.unwrap();

        let first = ws.next().await.unwrap().unwrap();
        let hello: AgentFrame = serde_json::from_str(first.to_text().unwrap()).unwrap();
        assert!(matches!(hello, AgentFrame::Hello { .. }));

        let req = ClientFrame::Req {
            id: 42,
            method: method::PING.to_string(),
            payload_b64: encode_payload(&PingRequest {
                timestamp_unix_nanos: 9,
            }),
        };
        ws.send(WsMessage::Text(serde_json::to_string(&req).unwrap().into()))
            .await
            .unwrap();

        let resp = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let AgentFrame::Resp { id, ok, payload_b64, .. } = serde_json::from_str(resp.to_text().unwrap()).unwrap() else {
            panic!("expected resp");
        };
        assert_eq!(id, 42);
        assert!(ok);
        let pong: PingResponse = decode_payload(&payload_b64.unwrap()).unwrap();
        assert_eq!(pong.encode_to_vec(), PingResponse { timestamp_unix_nanos: 9 }.encode_to_vec());

        shutdown.cancel();
    }

    #[tokio::test]
    async fn wrong_path_is_refused() {
        let (addr, shutdown) = spawn_server().await;
        let req = format!("ws://{addr}/other").into_client_request().unwrap();
        assert!(tokio_tungstenite::connect_async(req).await.is_err());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn unix_socket_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        std::fs::write(&path, b"stale").unwrap();

        let listener = Listener::bind(&ListenAddr::Unix(path.clone())).await.unwrap();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }
}
