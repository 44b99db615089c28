use std::time::Duration;

use async_trait::async_trait;
use tokio::{io::AsyncRead, sync::mpsc, sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use warden_process::{LineReader, Process, ProcessSpec, ProcessStatus, Stream};

use crate::{
    config::TransportConfig,
    error::TransportError,
    transport::{RunOutcome, StdioSender, Transport},
};

// Pipes stay open while anything the workload forked still holds them.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A workload forked directly by this process.
#[derive(Debug)]
pub struct LocalTransport {
    process: Process,
}

impl LocalTransport {
    pub fn new(spec: ProcessSpec) -> Self {
        Self {
            process: Process::new(spec),
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn status(&self) -> Result<ProcessStatus, TransportError> {
        Ok(self.process.status())
    }

    async fn human_status(&self) -> String {
        self.process.status().human()
    }

    fn update(&self, config: &toml::Value) -> Result<(), TransportError> {
        match TransportConfig::from_value(config)? {
            TransportConfig::Local(spec) => Ok(self.process.set_spec(spec)?),
            TransportConfig::Remote(_) => Err(TransportError::config(
                "cannot change a local transport into a remote one",
            )),
        }
    }

    async fn run(
        &self,
        io: StdioSender,
        started: oneshot::Sender<()>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, TransportError> {
        self.process.reset()?;
        let pid = self.process.start().await?;
        let _ = started.send(());
        tracing::info!(pid, cmd = %self.process.spec().command_line(), "local workload started");

        let release = cancel.child_token();
        let out = spawn_pump(Stream::Stdout, self.process.take_stdout(), io.stdout, release.clone());
        let err = spawn_pump(Stream::Stderr, self.process.take_stderr(), io.stderr, release.clone());

        let exit = tokio::select! {
            res = self.process.wait_for_completion() => res?,
            _ = cancel.cancelled() => {
                // The pumps keep reading to EOF so the child never writes
                // into a closed pipe.
                tracing::info!(pid, "local run cancelled; leaving workload running");
                return Ok(RunOutcome::Unknown);
            }
        };

        let drained = tokio::time::timeout(PUMP_DRAIN_TIMEOUT, async {
            let _ = tokio::join!(out, err);
        })
        .await;
        if drained.is_err() {
            tracing::warn!(pid, "output still open after exit; no longer forwarding it");
            release.cancel();
        }

        Ok(RunOutcome::Exited(exit))
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        Ok(self.process.write(data).await?)
    }

    async fn stop_or_kill_timeout(&self, timeout: Duration) -> Result<(), TransportError> {
        Ok(self.process.stop_or_kill_timeout(timeout).await?)
    }

    fn is_running(&self) -> bool {
        self.process.is_running()
    }
}

/// Forward lines from `reader` until EOF. Once `detached` fires the sender
/// is dropped but the pipe is still drained.
fn spawn_pump<R>(
    stream: Stream,
    reader: Option<R>,
    tx: mpsc::Sender<String>,
    detached: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(reader) = reader else { return };
        let mut lines = LineReader::new(reader);
        let mut tx = Some(tx);
        loop {
            let next = tokio::select! {
                _ = detached.cancelled(), if tx.is_some() => {
                    tx = None;
                    continue;
                }
                next = lines.next_line() => next,
            };
            match next {
                Ok(Some(line)) => {
                    let Some(sender) = &tx else { continue };
                    let delivered = tokio::select! {
                        _ = detached.cancelled() => false,
                        res = sender.send(line) => res.is_ok(),
                    };
                    if !delivered {
                        tx = None;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(%stream, error = %e, "read failed");
                    break;
                }
            }
        }
    })
}
