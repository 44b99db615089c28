use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use warden_process::ProcessSpec;
use warden_proto::agent_env;

const DEFAULT_STDIO_LINES: usize = 1000;
const DEFAULT_LONG_POLL_MS: u64 = 20_000;
const DEFAULT_LISTEN: &str = "127.0.0.1:50061";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Tcp(String),
    Unix(PathBuf),
}

impl std::fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => write!(f, "tcp://{addr}"),
            ListenAddr::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub listen: ListenAddr,
    pub process: ProcessSpec,
    pub stdio_cache_lines: usize,
    /// Upper bound on how long a stdio read blocks before answering empty.
    pub long_poll: Duration,
    pub log_dir: Option<PathBuf>,
}

impl AgentConfig {
    pub fn new(listen: ListenAddr, process: ProcessSpec) -> Self {
        Self {
            listen,
            process,
            stdio_cache_lines: DEFAULT_STDIO_LINES,
            long_poll: Duration::from_millis(DEFAULT_LONG_POLL_MS),
            log_dir: None,
        }
    }

    /// Read the agent's configuration from `WARDEN_AGENT_*`.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |k: &str| get(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let raw_listen = get(agent_env::LISTEN).unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let unix = get(agent_env::UNIX).is_some_and(|v| {
            matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
        });
        let listen = if unix {
            ListenAddr::Unix(PathBuf::from(raw_listen))
        } else {
            ListenAddr::Tcp(raw_listen)
        };

        let raw_process = get(agent_env::PROCESS)
            .with_context(|| format!("{} is required", agent_env::PROCESS))?;
        let process: ProcessSpec = serde_json::from_str(&raw_process)
            .with_context(|| format!("parse {}", agent_env::PROCESS))?;
        if process.binary.as_os_str().is_empty() {
            anyhow::bail!("{}: binary must be non-empty", agent_env::PROCESS);
        }

        let stdio_cache_lines = get(agent_env::STDIO_LINES)
            .and_then(|v| v.parse::<usize>().ok())
            .map(|v| v.clamp(100, 50_000))
            .unwrap_or(DEFAULT_STDIO_LINES);
        let long_poll = Duration::from_millis(
            get(agent_env::LONG_POLL_MS)
                .and_then(|v| v.parse::<u64>().ok())
                .map(|v| v.clamp(100, 120_000))
                .unwrap_or(DEFAULT_LONG_POLL_MS),
        );

        Ok(Self {
            listen,
            process,
            stdio_cache_lines,
            long_poll,
            log_dir: get(agent_env::LOG_DIR).map(PathBuf::from),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn process_is_required() {
        let err = AgentConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(err.to_string().contains("WARDEN_AGENT_PROCESS"));
    }

    #[test]
    fn defaults_apply() {
        let cfg = AgentConfig::from_lookup(lookup(&[(
            agent_env::PROCESS,
            r#"{"binary":"/usr/bin/java","args":["-jar","server.jar"]}"#,
        )]))
        .unwrap();
        assert_eq!(cfg.listen, ListenAddr::Tcp(DEFAULT_LISTEN.to_string()));
        assert_eq!(cfg.process.args, vec!["-jar", "server.jar"]);
        assert!(cfg.process.copy_host_env);
        assert_eq!(cfg.stdio_cache_lines, DEFAULT_STDIO_LINES);
        assert_eq!(cfg.long_poll, Duration::from_millis(DEFAULT_LONG_POLL_MS));
    }

    #[test]
    fn unix_flag_and_clamps() {
        let cfg = AgentConfig::from_lookup(lookup(&[
            (agent_env::PROCESS, r#"{"binary":"/bin/cat"}"#),
            (agent_env::LISTEN, "/run/warden/survival.sock"),
            (agent_env::UNIX, "true"),
            (agent_env::STDIO_LINES, "5"),
            (agent_env::LONG_POLL_MS, "999999"),
        ]))
        .unwrap();
        assert_eq!(
            cfg.listen,
            ListenAddr::Unix(PathBuf::from("/run/warden/survival.sock"))
        );
        assert_eq!(cfg.stdio_cache_lines, 100);
        assert_eq!(cfg.long_poll, Duration::from_millis(120_000));
    }

    #[test]
    fn malformed_process_json_is_a_config_error() {
        let err = AgentConfig::from_lookup(lookup(&[(agent_env::PROCESS, "{not json")])).unwrap_err();
        assert!(format!("{err:#}").contains("parse WARDEN_AGENT_PROCESS"));
    }
}
