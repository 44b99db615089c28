use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{
    io::AsyncWriteExt,
    process::{ChildStderr, ChildStdin, ChildStdout, Command},
    sync::watch,
};

/// What to run. Immutable while the process is running.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProcessSpec {
    pub binary: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Applied on top of the inherited environment (or on an empty one when
    /// `copy_host_env` is false).
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_copy_host_env")]
    pub copy_host_env: bool,
}

fn default_copy_host_env() -> bool {
    true
}

impl ProcessSpec {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            copy_host_env: true,
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn command_line(&self) -> String {
        let mut out = self.binary.display().to_string();
        for a in &self.args {
            out.push(' ');
            out.push_str(a);
        }
        out
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("process is already running")]
    AlreadyRunning,
    #[error("process is not running")]
    NotRunning,
    #[error("process was never started")]
    NotStarted,
    #[error("spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("send signal {signal} to pid {pid}: {source}")]
    Signal {
        pid: u32,
        signal: i32,
        #[source]
        source: std::io::Error,
    },
    #[error("process i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// How a child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Exit code for interfaces that need a plain integer; -1 when the
    /// process died without one.
    pub fn code_or_negative(&self) -> i32 {
        self.code.unwrap_or(-1)
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(c), _) => write!(f, "exit status {c}"),
            (None, Some(s)) => write!(f, "killed by signal {s}"),
            (None, None) => f.write_str("exited with unknown status"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ProcessState {
    NotStarted,
    Running,
    Exited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStatus {
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub exit: Option<ExitInfo>,
    pub started_at: Option<DateTime<Utc>>,
}

impl ProcessStatus {
    pub fn human(&self) -> String {
        match self.state {
            ProcessState::NotStarted => "not started".to_string(),
            ProcessState::Running => {
                let pid = self
                    .pid
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "?".to_string());
                match self.started_at {
                    Some(at) => {
                        let up = Utc::now().signed_duration_since(at).num_seconds().max(0);
                        format!("running (pid {pid}, up {})", format_uptime(up))
                    }
                    None => format!("running (pid {pid})"),
                }
            }
            ProcessState::Exited => match self.exit {
                Some(e) => format!("stopped ({e})"),
                None => "stopped".to_string(),
            },
        }
    }
}

fn format_uptime(secs: i64) -> String {
    let (d, h, m, s) = (secs / 86_400, secs / 3600 % 24, secs / 60 % 60, secs % 60);
    if d > 0 {
        format!("{d}d{h}h{m}m")
    } else if h > 0 {
        format!("{h}h{m}m")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}

#[derive(Debug)]
struct Lifecycle {
    started: bool,
    exited: bool,
    pid: Option<u32>,
    exit: Option<ExitInfo>,
    started_at: Option<DateTime<Utc>>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    // Flips from None to Some exactly once per lifetime.
    done: watch::Receiver<Option<ExitInfo>>,
}

impl Lifecycle {
    fn fresh() -> Self {
        Self {
            started: false,
            exited: false,
            pid: None,
            exit: None,
            started_at: None,
            stdout: None,
            stderr: None,
            done: watch::channel(None).1,
        }
    }

    fn running(&self) -> bool {
        self.started && !self.exited
    }
}

#[derive(Debug)]
struct Inner {
    spec: ProcessSpec,
    life: Lifecycle,
}

/// One supervised OS child.
///
/// Lifecycle: `reset` -> `start` -> running -> exited -> `reset` -> ...
/// The child runs in its own session so signals reach its whole process
/// group.
#[derive(Debug)]
pub struct Process {
    inner: Arc<Mutex<Inner>>,
    // Serialises writers so partial lines never interleave.
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
}

impl Process {
    pub fn new(spec: ProcessSpec) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                spec,
                life: Lifecycle::fresh(),
            })),
            stdin: tokio::sync::Mutex::new(None),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn spec(&self) -> ProcessSpec {
        self.lock().spec.clone()
    }

    /// Replace the command line. Takes effect on the next `start`.
    pub fn set_spec(&self, spec: ProcessSpec) -> Result<(), ProcessError> {
        let mut inner = self.lock();
        if inner.life.running() {
            return Err(ProcessError::AlreadyRunning);
        }
        inner.spec = spec;
        Ok(())
    }

    /// Prepare a new lifetime. Clears exit state and the completion signal.
    pub fn reset(&self) -> Result<(), ProcessError> {
        let mut inner = self.lock();
        if inner.life.running() {
            return Err(ProcessError::AlreadyRunning);
        }
        inner.life = Lifecycle::fresh();
        Ok(())
    }

    fn build_command(spec: &ProcessSpec) -> Command {
        let mut cmd = Command::new(&spec.binary);
        cmd.args(&spec.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);
        if !spec.copy_host_env {
            cmd.env_clear();
        }
        cmd.envs(&spec.env);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    // Own session: StopOrKill signals the whole tree via -pgid.
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        cmd
    }

    /// Spawn the child. Fails with `AlreadyRunning` if this lifetime was
    /// already started; call `reset` first.
    pub async fn start(&self) -> Result<u32, ProcessError> {
        let (mut child, pid, spec, done_tx) = {
            let mut inner = self.lock();
            if inner.life.started {
                return Err(ProcessError::AlreadyRunning);
            }

            let spec = inner.spec.clone();
            let mut child = Self::build_command(&spec)
                .spawn()
                .map_err(|source| ProcessError::Spawn {
                    binary: spec.binary.display().to_string(),
                    source,
                })?;

            let pid = child.id().unwrap_or_default();
            let (done_tx, done_rx) = watch::channel(None);
            inner.life = Lifecycle {
                started: true,
                exited: false,
                pid: Some(pid),
                exit: None,
                started_at: Some(Utc::now()),
                stdout: child.stdout.take(),
                stderr: child.stderr.take(),
                done: done_rx,
            };
            (child, pid, spec, done_tx)
        };

        *self.stdin.lock().await = child.stdin.take();

        tracing::debug!(pid, cmd = %spec.command_line(), "process started");

        let state = self.inner.clone();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ExitInfo::from_status(status),
                Err(err) => {
                    tracing::warn!(pid, error = %err, "wait on child failed");
                    ExitInfo {
                        code: None,
                        signal: None,
                    }
                }
            };
            {
                let mut inner = state.lock().unwrap_or_else(|e| e.into_inner());
                // A reset cannot happen while running, so this is still our
                // lifetime.
                inner.life.exited = true;
                inner.life.exit = Some(exit);
            }
            tracing::debug!(pid, %exit, "process exited");
            let _ = done_tx.send(Some(exit));
        });

        Ok(pid)
    }

    pub fn take_stdout(&self) -> Option<ChildStdout> {
        self.lock().life.stdout.take()
    }

    pub fn take_stderr(&self) -> Option<ChildStderr> {
        self.lock().life.stderr.take()
    }

    pub fn is_running(&self) -> bool {
        self.lock().life.running()
    }

    pub fn pid(&self) -> Option<u32> {
        let inner = self.lock();
        inner.life.running().then_some(inner.life.pid).flatten()
    }

    pub fn status(&self) -> ProcessStatus {
        let inner = self.lock();
        let life = &inner.life;
        let state = if !life.started {
            ProcessState::NotStarted
        } else if life.exited {
            ProcessState::Exited
        } else {
            ProcessState::Running
        };
        ProcessStatus {
            state,
            pid: life.pid,
            exit: life.exit,
            started_at: life.started_at,
        }
    }

    /// Write one line to the child's stdin, adding the trailing newline if
    /// missing.
    pub async fn write(&self, data: &[u8]) -> Result<(), ProcessError> {
        if !self.is_running() {
            return Err(ProcessError::NotRunning);
        }
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(ProcessError::NotRunning);
        };

        let res = async {
            stdin.write_all(data).await?;
            if data.last() != Some(&b'\n') {
                stdin.write_all(b"\n").await?;
            }
            stdin.flush().await
        }
        .await;

        match res {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                *guard = None;
                Err(ProcessError::NotRunning)
            }
            Err(e) => Err(ProcessError::Io(e)),
        }
    }

    /// Block until the current lifetime's child exits.
    pub async fn wait_for_completion(&self) -> Result<ExitInfo, ProcessError> {
        let mut done = {
            let inner = self.lock();
            if !inner.life.started {
                return Err(ProcessError::NotStarted);
            }
            if let Some(exit) = inner.life.exit {
                return Ok(exit);
            }
            inner.life.done.clone()
        };

        let exit = match done.wait_for(|v| v.is_some()).await {
            Ok(v) => *v,
            // The waiter task owns the sender and always sends before
            // dropping it; fall back to the recorded state.
            Err(_) => self.lock().life.exit,
        };
        exit.ok_or(ProcessError::NotRunning)
    }

    /// SIGTERM the process group, then SIGKILL it if it is still alive after
    /// `timeout`. Returns once the child is gone.
    pub async fn stop_or_kill_timeout(&self, timeout: Duration) -> Result<(), ProcessError> {
        let Some(pid) = self.pid() else {
            return Ok(());
        };

        signal_group(pid, Signal::Term)?;

        let graceful = tokio::time::timeout(timeout, self.wait_for_completion()).await;
        if let Ok(res) = graceful {
            res?;
            return Ok(());
        }

        tracing::info!(pid, timeout_ms = timeout.as_millis() as u64, "process ignored SIGTERM; sending SIGKILL");
        signal_group(pid, Signal::Kill)?;
        self.wait_for_completion().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, sig: Signal) -> Result<(), ProcessError> {
    let signal = match sig {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let rc = unsafe { libc::kill(-(pid as i32), signal) };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        // The group is already gone: the exit is observed by the waiter.
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(ProcessError::Signal {
            pid,
            signal,
            source: err,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn signal_group(pid: u32, sig: Signal) -> Result<(), ProcessError> {
    Err(ProcessError::Signal {
        pid,
        signal: sig as i32,
        source: std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "process group signals require unix",
        ),
    })
}

#[cfg(target_os = "linux")]
fn set_parent_death_signal() -> std::io::Result<()> {
    // If the supervisor dies, take the child down with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}
