use std::{sync::Arc, time::Duration};

use tokio::io::AsyncRead;
use warden_process::{
    ExitInfo, LineReader, Process, ProcessError, ProcessSpec, ProcessStatus, StdioCache,
    StdioChunk, Stream,
};

use crate::config::AgentConfig;

/// Owns one supervised process on behalf of a remote controller and keeps
/// its recent output so a reconnecting controller can resume where it left
/// off.
#[derive(Debug)]
pub struct Agent {
    process: Process,
    stdout: Arc<StdioCache>,
    stderr: Arc<StdioCache>,
    long_poll: Duration,
    // Start is reset + spawn + pump setup; two concurrent starts must not
    // interleave those steps.
    start_lock: tokio::sync::Mutex<()>,
}

impl Agent {
    pub fn new(config: &AgentConfig) -> Arc<Self> {
        Arc::new(Self {
            process: Process::new(config.process.clone()),
            stdout: Arc::new(StdioCache::new(config.stdio_cache_lines)),
            stderr: Arc::new(StdioCache::new(config.stdio_cache_lines)),
            long_poll: config.long_poll,
            start_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn spec(&self) -> ProcessSpec {
        self.process.spec()
    }

    /// Start a new lifetime of the process. Rejected with `AlreadyRunning`
    /// while the previous one is alive; never restarts silently.
    pub async fn start(&self) -> Result<u32, ProcessError> {
        let _guard = self.start_lock.lock().await;

        self.process.reset()?;
        // Pumps of an earlier lifetime may still be draining a pipe held
        // open by a grandchild; the epochs keep them out of this one.
        let out_epoch = self.stdout.reset();
        let err_epoch = self.stderr.reset();

        let pid = match self.process.start().await {
            Ok(pid) => pid,
            Err(err) => {
                self.stdout.finish_in(out_epoch);
                self.stderr.finish_in(err_epoch);
                return Err(err);
            }
        };

        spawn_pump(Stream::Stdout, self.process.take_stdout(), self.stdout.clone(), out_epoch);
        spawn_pump(Stream::Stderr, self.process.take_stderr(), self.stderr.clone(), err_epoch);

        tracing::info!(pid, cmd = %self.process.spec().command_line(), "workload started");
        Ok(pid)
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), ProcessError> {
        self.process.write(data).await
    }

    pub async fn stop_or_kill_timeout(&self, timeout: Duration) -> Result<(), ProcessError> {
        tracing::info!(timeout_ms = timeout.as_millis() as u64, "stop requested");
        self.process.stop_or_kill_timeout(timeout).await
    }

    pub async fn wait(&self) -> Result<ExitInfo, ProcessError> {
        self.process.wait_for_completion().await
    }

    /// Lines after `since`, blocking at most the configured long-poll window.
    pub async fn stdio_since(&self, stream: Stream, since: u64) -> StdioChunk {
        let cache = match stream {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        };
        cache.read_timeout(since, self.long_poll).await
    }

    pub fn status(&self) -> ProcessStatus {
        self.process.status()
    }

    pub fn human_status(&self) -> String {
        self.process.status().human()
    }

    pub fn is_running(&self) -> bool {
        self.process.is_running()
    }
}

fn spawn_pump<R>(stream: Stream, reader: Option<R>, cache: Arc<StdioCache>, epoch: u64)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(reader) = reader else {
        cache.finish_in(epoch);
        return;
    };
    tokio::spawn(async move {
        let mut lines = LineReader::new(reader);
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if cache.append_in(epoch, line).is_none() {
                        tracing::debug!(%stream, "dropping output of a previous lifetime");
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(%stream, error = %err, "stdio read failed");
                    break;
                }
            }
        }
        cache.finish_in(epoch);
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ListenAddr;

    fn agent(script: &str) -> Arc<Agent> {
        let spec = ProcessSpec::new("/bin/sh").arg("-c").arg(script);
        let mut cfg = AgentConfig::new(ListenAddr::Tcp("127.0.0.1:0".to_string()), spec);
        cfg.long_poll = Duration::from_millis(200);
        Agent::new(&cfg)
    }

    async fn drain(agent: &Agent, stream: Stream) -> Vec<String> {
        let mut since = 0;
        let mut out = Vec::new();
        loop {
            let chunk = agent.stdio_since(stream, since).await;
            for l in &chunk.lines {
                out.push(l.text.clone());
            }
            since = chunk.last_seq().unwrap_or(since);
            if chunk.finished && chunk.lines.is_empty() {
                return out;
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_caches_both_streams() {
        let a = agent("echo one; echo two; echo err >&2");
        a.start().await.unwrap();
        let exit = a.wait().await.unwrap();
        assert!(exit.success());
        assert_eq!(drain(&a, Stream::Stdout).await, vec!["one", "two"]);
        assert_eq!(drain(&a, Stream::Stderr).await, vec!["err"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_while_running_is_rejected_and_keeps_output() {
        let a = agent("echo up; sleep 30");
        a.start().await.unwrap();
        let first = loop {
            let chunk = a.stdio_since(Stream::Stdout, 0).await;
            if !chunk.lines.is_empty() {
                break chunk;
            }
        };
        assert_eq!(first.lines[0].text, "up");

        let err = a.start().await.unwrap_err();
        assert!(matches!(err, ProcessError::AlreadyRunning));
        // The rejected start must not have reset the cache.
        assert_eq!(a.stdio_since(Stream::Stdout, 0).await.lines.len(), 1);

        a.stop_or_kill_timeout(Duration::from_secs(2)).await.unwrap();
        assert!(!a.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restart_resets_sequence_numbers() {
        let a = agent("echo again");
        a.start().await.unwrap();
        a.wait().await.unwrap();
        assert_eq!(drain(&a, Stream::Stdout).await, vec!["again"]);

        a.start().await.unwrap();
        a.wait().await.unwrap();
        let chunk = a.stdio_since(Stream::Stdout, 0).await;
        assert_eq!(chunk.lines.len(), 1);
        assert_eq!(chunk.lines[0].seq, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn leftover_output_stays_out_of_the_next_lifetime() {
        let dir = tempfile::tempdir().unwrap();
        let mark = dir.path().join("started-once");
        // The first lifetime exits at once but leaves a grandchild holding
        // its stdout open.
        let a = agent(&format!(
            "if [ -e {m} ]; then echo second; sleep 30; \
             else touch {m}; (sleep 1; echo stale) & echo first; fi",
            m = mark.display()
        ));
        a.start().await.unwrap();
        a.wait().await.unwrap();

        a.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let chunk = a.stdio_since(Stream::Stdout, 0).await;
        let texts: Vec<&str> = chunk.lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["second"]);
        assert_eq!(chunk.lines[0].seq, 1);
        assert!(!chunk.finished);
        assert!(!a.stdio_since(Stream::Stderr, 0).await.finished);

        a.stop_or_kill_timeout(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn read_before_any_start_does_not_block() {
        let a = agent("true");
        let chunk = a.stdio_since(Stream::Stdout, 0).await;
        assert!(chunk.finished);
        assert!(matches!(a.wait().await.unwrap_err(), ProcessError::NotStarted));
    }
}
