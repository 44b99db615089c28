use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prost::Message;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use warden_process::{ExitInfo, ProcessState, ProcessStatus, Stream};
use warden_proto::{
    RpcError,
    agent_env,
    agent_v1::{
        self, GetHumanStatusRequest, GetHumanStatusResponse, GetStatusRequest, GetStatusResponse,
        GetStdioRequest, GetStdioResponse, PingRequest, PingResponse, StartRequest,
        StartResponse, StopOrKillRequest, StopOrKillResponse, WaitRequest, WaitResponse,
        WriteRequest, WriteResponse,
    },
    method, rpc_error,
};

use crate::{
    client::{AgentClient, dial},
    config::{RemoteConfig, TransportConfig},
    error::TransportError,
    transport::{RunOutcome, StdioSender, Transport},
};

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(250);
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const SELF_HOST_DEADLINE: Duration = Duration::from_secs(10);
const SELF_HOST_POLL: Duration = Duration::from_millis(100);
const PING_INTERVAL: Duration = Duration::from_secs(5);
const RTT_WINDOW: usize = 8;
const CATCH_UP_RETRY: Duration = Duration::from_millis(500);
const CATCH_UP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retry {
    /// Reconnect and resend after a connection failure.
    Idempotent,
    /// Reconnect only before the request went out.
    NotAfterSend,
}

#[derive(Debug)]
struct Session {
    client: Arc<AgentClient>,
    generation: u64,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A workload owned by an agent reached over the network or a unix socket.
///
/// The agent connection is dialed lazily and dropped on any call failure;
/// the next call dials again. Output is pulled with cursor-based stdio reads,
/// so a reconnect resumes after the last line delivered.
#[derive(Debug)]
pub struct RemoteTransport {
    config: RwLock<RemoteConfig>,
    // Bumped by `update` so a session to the old address is not reused.
    generation: AtomicU64,
    session: tokio::sync::Mutex<Option<Session>>,
    connects: AtomicU64,
    rtt: Mutex<VecDeque<Duration>>,
    running: AtomicBool,
}

impl RemoteTransport {
    pub fn new(config: RemoteConfig) -> Self {
        Self {
            config: RwLock::new(config),
            generation: AtomicU64::new(0),
            session: tokio::sync::Mutex::new(None),
            connects: AtomicU64::new(0),
            rtt: Mutex::new(VecDeque::with_capacity(RTT_WINDOW)),
            running: AtomicBool::new(false),
        }
    }

    fn config(&self) -> RemoteConfig {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Times the connection was re-established after the first dial.
    pub fn reconnects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed).saturating_sub(1)
    }

    /// Mean of the most recent ping round trips.
    pub fn average_rtt(&self) -> Option<Duration> {
        let samples = self.rtt.lock().unwrap_or_else(|e| e.into_inner());
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<Duration>() / samples.len() as u32)
    }

    fn record_rtt(&self, rtt: Duration) {
        let mut samples = self.rtt.lock().unwrap_or_else(|e| e.into_inner());
        samples.push_back(rtt);
        while samples.len() > RTT_WINDOW {
            samples.pop_front();
        }
    }

    /// Drop the agent connection. In-flight calls fail and the next call
    /// dials again.
    pub async fn disconnect(&self) {
        if let Some(s) = self.session.lock().await.take() {
            tracing::info!(addr = %s.client.addr(), "disconnecting from agent");
            s.client.close();
        }
    }

    async fn current_client(&self) -> Option<Arc<AgentClient>> {
        self.session
            .lock()
            .await
            .as_ref()
            .filter(|s| !s.client.is_closed())
            .map(|s| s.client.clone())
    }

    async fn drop_session(&self, client: &Arc<AgentClient>) {
        client.close();
        let mut session = self.session.lock().await;
        if session
            .as_ref()
            .is_some_and(|s| Arc::ptr_eq(&s.client, client))
        {
            *session = None;
        }
    }

    async fn connection(&self) -> Result<Arc<AgentClient>, TransportError> {
        let mut session = self.session.lock().await;
        let generation = self.generation.load(Ordering::Acquire);
        if let Some(s) = session.as_ref() {
            if !s.client.is_closed() && s.generation == generation {
                return Ok(s.client.clone());
            }
        }
        if let Some(old) = session.take() {
            old.client.close();
        }

        let cfg = self.config();
        let client = dial_or_spawn(&cfg).await?;
        if self.connects.fetch_add(1, Ordering::Relaxed) > 0 {
            tracing::info!(addr = %cfg.address, "reconnected to agent");
        }
        *session = Some(Session {
            client: client.clone(),
            generation,
        });
        Ok(client)
    }

    async fn call<Req, Res>(
        &self,
        method: &'static str,
        req: &Req,
        timeout: Option<Duration>,
        retry: Retry,
    ) -> Result<Res, TransportError>
    where
        Req: Message,
        Res: Message + Default,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let client = match self.connection().await {
                Ok(c) => c,
                Err(e) if attempt < MAX_ATTEMPTS => {
                    tracing::debug!(method, attempt, error = %e, "agent dial failed; retrying");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match client.call(method, req, timeout).await {
                Ok(res) => return Ok(res),
                Err(e) if e.is_connection() => {
                    self.drop_session(&client).await;
                    if retry == Retry::NotAfterSend || attempt >= MAX_ATTEMPTS {
                        return Err(e);
                    }
                    tracing::warn!(method, attempt, error = %e, "agent call failed; reconnecting");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn monitor_latency(&self, stop: &CancellationToken) {
        let mut tick = tokio::time::interval(PING_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tick.tick() => {}
            }
            let Some(client) = self.current_client().await else {
                continue;
            };

            let sent = Utc::now().timestamp_nanos_opt().unwrap_or_default();
            let ping = PingRequest {
                timestamp_unix_nanos: sent,
            };
            let began = Instant::now();
            let timeout = self.config().call_timeout();
            let res = tokio::select! {
                _ = stop.cancelled() => return,
                r = client.call::<_, PingResponse>(method::PING, &ping, Some(timeout)) => r,
            };
            match res {
                Ok(resp) if resp.timestamp_unix_nanos == sent => self.record_rtt(began.elapsed()),
                Ok(resp) => {
                    tracing::warn!(sent, echoed = resp.timestamp_unix_nanos, "agent echoed a different ping");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "agent ping failed; dropping connection");
                    self.drop_session(&client).await;
                }
            }
        }
    }

    /// Pull one stream from the agent and forward it until the agent reports
    /// the stream finished or `stop` fires.
    async fn follow(&self, stream: Stream, tx: mpsc::Sender<String>, stop: &CancellationToken) {
        let method = match stream {
            Stream::Stdout => method::GET_STDOUT,
            Stream::Stderr => method::GET_STDERR,
        };
        let cfg = self.config();
        let timeout = Some(cfg.call_timeout() + cfg.long_poll());
        let mut cursor = 0u64;

        loop {
            let req = GetStdioRequest { since_seq: cursor };
            let res = tokio::select! {
                _ = stop.cancelled() => return,
                r = self.call::<_, GetStdioResponse>(method, &req, timeout, Retry::Idempotent) => r,
            };
            let chunk = match res.and_then(|c| {
                RpcError::check(c.error.clone())?;
                Ok(c)
            }) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(%stream, cursor, error = %e, "output catch-up failed; retrying");
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        _ = tokio::time::sleep(CATCH_UP_RETRY) => {}
                    }
                    continue;
                }
            };

            let fresh: Vec<agent_v1::StdioLine> =
                chunk.lines.into_iter().filter(|l| l.seq > cursor).collect();
            if let Some(first) = fresh.first() {
                if first.seq > cursor + 1 {
                    tracing::warn!(
                        %stream,
                        missed = first.seq - cursor - 1,
                        "output lines aged out of the agent cache"
                    );
                }
            }

            let got_lines = !fresh.is_empty();
            for line in fresh {
                cursor = line.seq;
                if tx.send(line.text).await.is_err() {
                    return;
                }
            }
            if chunk.finished && !got_lines {
                return;
            }
        }
    }

    async fn wait_exit(&self, cancel: &CancellationToken) -> Result<RunOutcome, TransportError> {
        let req = WaitRequest {};
        let resp: WaitResponse = tokio::select! {
            _ = cancel.cancelled() => return Ok(RunOutcome::Unknown),
            r = self.call(method::WAIT, &req, None, Retry::Idempotent) => r?,
        };
        RpcError::check(resp.error.clone())?;
        Ok(RunOutcome::Exited(exit_from_wait(&resp)))
    }
}

#[async_trait]
impl Transport for RemoteTransport {
    async fn status(&self) -> Result<ProcessStatus, TransportError> {
        let timeout = self.config().call_timeout();
        let resp: GetStatusResponse = self
            .call(method::GET_STATUS, &GetStatusRequest {}, Some(timeout), Retry::Idempotent)
            .await?;
        Ok(status_from_wire(&resp))
    }

    async fn human_status(&self) -> String {
        let cfg = self.config();
        // A status query reuses the live session or dials once; it never
        // spawns an agent.
        let (client, borrowed) = match self.current_client().await {
            Some(c) => (c, true),
            None => match dial(&cfg.address, cfg.unix, DIAL_TIMEOUT, cfg.log_rpc).await {
                Ok(c) => (c, false),
                Err(e) => return format!("agent unreachable at {}: {e}", cfg.address),
            },
        };
        let res = client
            .call::<_, GetHumanStatusResponse>(
                method::GET_HUMAN_STATUS,
                &GetHumanStatusRequest {},
                Some(cfg.call_timeout()),
            )
            .await;
        if !borrowed {
            client.close();
        }
        let status = match res {
            Ok(r) => r.status,
            Err(e) => return format!("agent unreachable at {}: {e}", cfg.address),
        };
        let agent = format!(
            "agent {} pid {} at {}",
            client.agent_version(),
            client.agent_pid(),
            client.addr()
        );
        let rtt = self
            .average_rtt()
            .map(|d| format!("{}ms", d.as_millis()))
            .unwrap_or_else(|| "n/a".to_string());
        format!("{status} ({agent}, rtt {rtt}, reconnects {})", self.reconnects())
    }

    fn update(&self, config: &toml::Value) -> Result<(), TransportError> {
        match TransportConfig::from_value(config)? {
            TransportConfig::Remote(cfg) => {
                if self.is_running() {
                    return Err(TransportError::AlreadyRunning);
                }
                *self.config.write().unwrap_or_else(|e| e.into_inner()) = cfg;
                self.generation.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            TransportConfig::Local(_) => Err(TransportError::config(
                "cannot change a remote transport into a local one",
            )),
        }
    }

    async fn run(
        &self,
        io: StdioSender,
        started: oneshot::Sender<()>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, TransportError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadyRunning);
        }
        let _running = RunningGuard(&self.running);
        let cfg = self.config();

        let start: StartResponse = self
            .call(
                method::START,
                &StartRequest {},
                Some(cfg.call_timeout()),
                Retry::NotAfterSend,
            )
            .await?;
        match RpcError::check(start.error) {
            Ok(()) => tracing::info!(addr = %cfg.address, "remote workload started"),
            Err(e) if e.code == rpc_error::ALREADY_RUNNING && cfg.attach_existing => {
                tracing::info!(addr = %cfg.address, "workload already running; attaching");
            }
            Err(e) => return Err(e.into()),
        }
        let _ = started.send(());

        let aux = cancel.child_token();
        let caught_up = CancellationToken::new();
        let StdioSender { stdout, stderr } = io;

        let catch_up = async {
            tokio::join!(
                self.follow(Stream::Stdout, stdout, &aux),
                self.follow(Stream::Stderr, stderr, &aux),
            );
            caught_up.cancel();
        };
        let supervise = async {
            let outcome = self.wait_exit(&cancel).await;
            if matches!(outcome, Ok(RunOutcome::Exited(_)))
                && tokio::time::timeout(CATCH_UP_DRAIN_TIMEOUT, caught_up.cancelled())
                    .await
                    .is_err()
            {
                tracing::warn!(addr = %cfg.address, "output catch-up did not finish after exit");
            }
            aux.cancel();
            outcome
        };

        let (outcome, (), ()) = tokio::join!(supervise, catch_up, self.monitor_latency(&aux));
        outcome
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let timeout = self.config().call_timeout();
        let resp: WriteResponse = self
            .call(
                method::WRITE,
                &WriteRequest {
                    data: data.to_vec(),
                },
                Some(timeout),
                Retry::Idempotent,
            )
            .await?;
        Ok(RpcError::check(resp.error)?)
    }

    async fn stop_or_kill_timeout(&self, timeout: Duration) -> Result<(), TransportError> {
        let call_timeout = self.config().call_timeout() + timeout;
        let resp: StopOrKillResponse = self
            .call(
                method::STOP_OR_KILL,
                &StopOrKillRequest {
                    timeout_ms: (timeout.as_millis() as u64).max(1),
                },
                Some(call_timeout),
                Retry::Idempotent,
            )
            .await?;
        Ok(RpcError::check(resp.error)?)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

fn exit_from_wait(resp: &WaitResponse) -> ExitInfo {
    ExitInfo {
        code: (!resp.has_signal).then_some(resp.exit_code),
        signal: resp.has_signal.then_some(resp.signal),
    }
}

fn status_from_wire(resp: &GetStatusResponse) -> ProcessStatus {
    let state = match resp.state() {
        agent_v1::ProcessState::Running => ProcessState::Running,
        agent_v1::ProcessState::Exited => ProcessState::Exited,
        agent_v1::ProcessState::NotStarted | agent_v1::ProcessState::Unspecified => {
            ProcessState::NotStarted
        }
    };
    ProcessStatus {
        state,
        pid: resp.has_pid.then_some(resp.pid),
        exit: (state == ProcessState::Exited).then(|| ExitInfo {
            code: resp.has_exit_code.then_some(resp.exit_code),
            signal: None,
        }),
        started_at: (resp.started_at_unix_ms != 0)
            .then(|| DateTime::<Utc>::from_timestamp_millis(resp.started_at_unix_ms))
            .flatten(),
    }
}

async fn dial_or_spawn(cfg: &RemoteConfig) -> Result<Arc<AgentClient>, TransportError> {
    let first = match dial(&cfg.address, cfg.unix, DIAL_TIMEOUT, cfg.log_rpc).await {
        Ok(c) => return Ok(c),
        Err(e) => e,
    };
    if !cfg.self_host {
        return Err(first);
    }

    tracing::info!(addr = %cfg.address, error = %first, "agent unreachable; spawning one");
    spawn_agent(cfg)?;

    let deadline = Instant::now() + SELF_HOST_DEADLINE;
    loop {
        tokio::time::sleep(SELF_HOST_POLL).await;
        match dial(&cfg.address, cfg.unix, DIAL_TIMEOUT, cfg.log_rpc).await {
            Ok(c) => return Ok(c),
            Err(e) if Instant::now() >= deadline => return Err(e),
            Err(_) => {}
        }
    }
}

fn default_agent_binary() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|d| d.join("warden-agent")))
        .filter(|p| p.exists())
        .unwrap_or_else(|| PathBuf::from("warden-agent"))
}

/// Start an agent in its own session so signals aimed at this process
/// group leave it alone.
fn spawn_agent(cfg: &RemoteConfig) -> Result<(), TransportError> {
    let process = cfg
        .process
        .as_ref()
        .ok_or_else(|| TransportError::config("remote: self_host requires a [process] table"))?;
    let process_json =
        serde_json::to_string(process).map_err(|e| TransportError::config(e.to_string()))?;
    let binary = cfg.agent_binary.clone().unwrap_or_else(default_agent_binary);

    let mut cmd = tokio::process::Command::new(&binary);
    cmd.env(agent_env::LISTEN, &cfg.address)
        .env(agent_env::PROCESS, process_json)
        .env(
            agent_env::LONG_POLL_MS,
            cfg.long_poll().as_millis().to_string(),
        )
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(false);
    if cfg.unix {
        cmd.env(agent_env::UNIX, "1");
    }
    if let Some(lines) = cfg.stdio_cache_lines {
        cmd.env(agent_env::STDIO_LINES, lines.to_string());
    }
    if let Some(dir) = &cfg.agent_log_dir {
        cmd.env(agent_env::LOG_DIR, dir);
    }

    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut child = cmd.spawn().map_err(|e| TransportError::Connect {
        addr: cfg.address.clone(),
        message: format!("spawn agent {}: {e}", binary.display()),
    })?;
    let pid = child.id();
    tracing::info!(?pid, binary = %binary.display(), "spawned agent");

    // Reap it if it exits while we are still around.
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => tracing::info!(?pid, %status, "self-hosted agent exited"),
            Err(e) => tracing::warn!(?pid, error = %e, "wait on self-hosted agent failed"),
        }
    });
    Ok(())
}
