use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use warden_process::{ExitInfo, ProcessStatus};

use crate::{
    config::TransportConfig, error::TransportError, local::LocalTransport, remote::RemoteTransport,
};

/// Output channels for one run. Each line is sent without its newline; the
/// senders are dropped when the run is over.
#[derive(Debug, Clone)]
pub struct StdioSender {
    pub stdout: mpsc::Sender<String>,
    pub stderr: mpsc::Sender<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Exited(ExitInfo),
    /// The run was cancelled before the workload's exit was observed.
    Unknown,
}

/// Start, feed, observe and stop one workload, wherever it runs.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn status(&self) -> Result<ProcessStatus, TransportError>;

    async fn human_status(&self) -> String;

    /// Swap in new settings. Allowed before the first run and between runs.
    fn update(&self, config: &toml::Value) -> Result<(), TransportError>;

    /// Start the workload and supervise it until it exits.
    ///
    /// `started` fires once the workload is up; it is dropped unsent when
    /// starting fails. Cancelling `cancel` returns `RunOutcome::Unknown`
    /// without stopping the workload.
    async fn run(
        &self,
        io: StdioSender,
        started: oneshot::Sender<()>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, TransportError>;

    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Ask the workload to stop, then force it after `timeout`.
    async fn stop_or_kill_timeout(&self, timeout: Duration) -> Result<(), TransportError>;

    fn is_running(&self) -> bool;
}

pub fn transport_from_config(value: &toml::Value) -> Result<Arc<dyn Transport>, TransportError> {
    Ok(match TransportConfig::from_value(value)? {
        TransportConfig::Local(spec) => Arc::new(LocalTransport::new(spec)),
        TransportConfig::Remote(cfg) => Arc::new(RemoteTransport::new(cfg)),
    })
}
