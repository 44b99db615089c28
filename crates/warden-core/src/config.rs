use std::{path::PathBuf, time::Duration};

use serde::Deserialize;
use warden_process::ProcessSpec;

use crate::error::TransportError;

const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_LONG_POLL_MS: u64 = 20_000;

/// One `[[game]]` entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GameConfig {
    pub name: String,
    /// Seconds to wait before restarting after a clean exit. Negative
    /// disables restarting.
    #[serde(default = "default_auto_restart")]
    pub auto_restart: i64,
    #[serde(default)]
    pub autostart: bool,
    /// Opaque transport settings; see [`TransportConfig`].
    pub transport: toml::Value,
    /// Settings for the output bridge. Not interpreted here.
    #[serde(default)]
    pub bridge: toml::Table,
}

fn default_auto_restart() -> i64 {
    -1
}

impl GameConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("game name must be non-empty".to_string());
        }
        TransportConfig::from_value(&self.transport).map_err(|e| e.to_string())?;
        Ok(())
    }

    pub fn restart_delay(&self) -> Option<Duration> {
        u64::try_from(self.auto_restart)
            .ok()
            .map(Duration::from_secs)
    }
}

/// Parsed form of a game's `transport` table, selected by `kind`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    Local(ProcessSpec),
    Remote(RemoteConfig),
}

impl TransportConfig {
    pub fn from_value(value: &toml::Value) -> Result<Self, TransportError> {
        let cfg: TransportConfig = value
            .clone()
            .try_into()
            .map_err(|e: toml::de::Error| TransportError::config(e.message().to_string()))?;
        match &cfg {
            TransportConfig::Local(spec) => {
                if spec.binary.as_os_str().is_empty() {
                    return Err(TransportError::config("local: binary must be non-empty"));
                }
            }
            TransportConfig::Remote(remote) => remote.validate()?,
        }
        Ok(cfg)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteConfig {
    /// `host:port`, or a socket path when `unix` is set.
    pub address: String,
    #[serde(default)]
    pub unix: bool,
    /// Spawn a local agent when dialing fails.
    #[serde(default)]
    pub self_host: bool,
    /// Agent executable for `self_host`. Defaults to `warden-agent` next to
    /// the current executable.
    #[serde(default)]
    pub agent_binary: Option<PathBuf>,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Passed to a self-hosted agent.
    #[serde(default)]
    pub stdio_cache_lines: Option<usize>,
    #[serde(default = "default_long_poll_ms")]
    pub long_poll_ms: u64,
    #[serde(default)]
    pub agent_log_dir: Option<PathBuf>,
    /// Log every agent call at debug level.
    #[serde(default)]
    pub log_rpc: bool,
    /// Follow a workload the agent is already running instead of failing
    /// the start.
    #[serde(default = "default_true")]
    pub attach_existing: bool,
    /// Workload for a self-hosted agent.
    #[serde(default)]
    pub process: Option<ProcessSpec>,
}

fn default_call_timeout_ms() -> u64 {
    DEFAULT_CALL_TIMEOUT_MS
}

fn default_long_poll_ms() -> u64 {
    DEFAULT_LONG_POLL_MS
}

fn default_true() -> bool {
    true
}

impl RemoteConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            unix: false,
            self_host: false,
            agent_binary: None,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            stdio_cache_lines: None,
            long_poll_ms: DEFAULT_LONG_POLL_MS,
            agent_log_dir: None,
            log_rpc: false,
            attach_existing: true,
            process: None,
        }
    }

    fn validate(&self) -> Result<(), TransportError> {
        if self.address.trim().is_empty() {
            return Err(TransportError::config("remote: address must be non-empty"));
        }
        if !self.unix && !self.address.contains(':') {
            return Err(TransportError::config(format!(
                "remote: address {:?} is not host:port",
                self.address
            )));
        }
        if self.self_host && self.process.is_none() {
            return Err(TransportError::config(
                "remote: self_host requires a [process] table",
            ));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms.clamp(1000, 10 * 60_000))
    }

    pub fn long_poll(&self) -> Duration {
        Duration::from_millis(self.long_poll_ms.clamp(100, 120_000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Result<TransportConfig, TransportError> {
        let v: toml::Value = toml::from_str(src).unwrap();
        TransportConfig::from_value(&v)
    }

    #[test]
    fn local_transport_is_a_process_spec() {
        let cfg = parse(
            r#"
            kind = "local"
            binary = "/usr/bin/java"
            args = ["-jar", "server.jar", "nogui"]
            working_dir = "/srv/survival"
            env = { JAVA_OPTS = "-Xmx2G" }
            "#,
        )
        .unwrap();
        let TransportConfig::Local(spec) = cfg else {
            panic!("expected local");
        };
        assert_eq!(spec.args, vec!["-jar", "server.jar", "nogui"]);
        assert_eq!(spec.env.get("JAVA_OPTS").map(String::as_str), Some("-Xmx2G"));
        assert!(spec.copy_host_env);
    }

    #[test]
    fn remote_defaults() {
        let cfg = parse(
            r#"
            kind = "remote"
            address = "10.0.0.5:50061"
            "#,
        )
        .unwrap();
        let TransportConfig::Remote(r) = cfg else {
            panic!("expected remote");
        };
        assert!(r.attach_existing);
        assert!(!r.self_host);
        assert_eq!(r.call_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn self_host_needs_a_process() {
        let err = parse(
            r#"
            kind = "remote"
            address = "/run/warden/a.sock"
            unix = true
            self_host = true
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("self_host"));
    }

    #[test]
    fn unknown_kind_is_a_config_error() {
        let err = parse(r#"kind = "docker""#).unwrap_err();
        assert!(matches!(err, TransportError::Config(_)));
    }

    #[test]
    fn game_defaults_disable_restart() {
        let cfg: GameConfig = toml::from_str(
            r#"
            name = "creative"
            [transport]
            kind = "local"
            binary = "/bin/true"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.restart_delay(), None);
        assert!(!cfg.autostart);
        assert!(cfg.bridge.is_empty());
        assert!(cfg.validate().is_ok());
    }
}
