use std::{collections::HashMap, sync::RwLock};

use serde::Deserialize;
use warden_core::{GameConfig, GameEvent, OutputBridge, Stream};

/// Per-game `[game.bridge]` settings understood by [`LogBridge`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Prepended to every relayed line.
    pub prefix: String,
    /// Drop stdout lines; stderr and events are still logged.
    pub quiet: bool,
    /// Log stderr lines at warn instead of info.
    pub stderr_as_warn: bool,
}

impl BridgeSettings {
    fn from_config(cfg: &GameConfig) -> Self {
        match toml::Value::Table(cfg.bridge.clone()).try_into() {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(game = %cfg.name, error = %e, "ignoring invalid bridge settings");
                Self::default()
            }
        }
    }
}

/// Relays game output and lifecycle events to the log.
#[derive(Debug, Default)]
pub struct LogBridge {
    settings: RwLock<HashMap<String, BridgeSettings>>,
}

impl LogBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the per-game settings with those in `games`.
    pub fn refresh(&self, games: &[GameConfig]) {
        let next = games
            .iter()
            .map(|g| (g.name.clone(), BridgeSettings::from_config(g)))
            .collect();
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = next;
    }

    pub fn settings(&self, game: &str) -> BridgeSettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(game)
            .cloned()
            .unwrap_or_default()
    }
}

impl OutputBridge for LogBridge {
    fn on_line(&self, game: &str, line: &str, stream: Stream) {
        let s = self.settings(game);
        match stream {
            Stream::Stdout if s.quiet => {}
            Stream::Stdout => {
                tracing::info!(target: "game_output", game, "{}{line}", s.prefix);
            }
            Stream::Stderr if s.stderr_as_warn => {
                tracing::warn!(target: "game_output", game, stream = "stderr", "{}{line}", s.prefix);
            }
            Stream::Stderr => {
                tracing::info!(target: "game_output", game, stream = "stderr", "{}{line}", s.prefix);
            }
        }
    }

    fn on_event(&self, game: &str, event: &GameEvent) {
        match event {
            GameEvent::Started => tracing::info!(game, "game started"),
            GameEvent::Exited(exit) => tracing::info!(game, %exit, "game exited"),
            GameEvent::Restarting(delay) => {
                tracing::info!(game, delay_secs = delay.as_secs(), "game restarting")
            }
            GameEvent::Stopped(reason) => tracing::info!(game, %reason, "game stopped"),
            GameEvent::Detached => tracing::info!(game, "game detached"),
            GameEvent::StartFailed(error) => tracing::error!(game, %error, "game failed to start"),
            GameEvent::Failed(error) => tracing::error!(game, %error, "game failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game(src: &str) -> GameConfig {
        toml::from_str(src).unwrap()
    }

    #[test]
    fn settings_follow_refresh() {
        let bridge = LogBridge::new();
        assert_eq!(bridge.settings("survival"), BridgeSettings::default());

        bridge.refresh(&[game(
            r#"
            name = "survival"
            transport = { kind = "local", binary = "/bin/true" }
            bridge = { prefix = "[mc] ", stderr_as_warn = true }
            "#,
        )]);
        let s = bridge.settings("survival");
        assert_eq!(s.prefix, "[mc] ");
        assert!(s.stderr_as_warn);
        assert!(!s.quiet);

        bridge.refresh(&[]);
        assert_eq!(bridge.settings("survival"), BridgeSettings::default());
    }

    #[test]
    fn invalid_settings_fall_back_to_defaults() {
        let bridge = LogBridge::new();
        bridge.refresh(&[game(
            r#"
            name = "odd"
            transport = { kind = "local", binary = "/bin/true" }
            bridge = { quiet = "very" }
            "#,
        )]);
        assert_eq!(bridge.settings("odd"), BridgeSettings::default());
        // Unknown keys belong to other bridges and are ignored.
        bridge.refresh(&[game(
            r##"
            name = "chat"
            transport = { kind = "local", binary = "/bin/true" }
            bridge = { channel = "#lobby", quiet = true }
            "##,
        )]);
        assert!(bridge.settings("chat").quiet);
    }
}
