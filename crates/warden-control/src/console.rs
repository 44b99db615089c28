use std::{path::PathBuf, sync::Arc, time::Duration};

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use warden_core::Manager;

use crate::{bridge::LogBridge, config::ControlConfig};

const HELP: &str = "commands: start <game> | stop <game> | restart <game> | \
write <game> <text> | status [game] | reload | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start(String),
    Stop(String),
    Restart(String),
    Write { game: String, text: String },
    Status(Option<String>),
    Reload,
    Quit,
    Help,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        let game = || {
            if rest.is_empty() || rest.contains(char::is_whitespace) {
                Err(format!("usage: {verb} <game>"))
            } else {
                Ok(rest.to_string())
            }
        };
        match verb {
            "start" => game().map(Command::Start),
            "stop" => game().map(Command::Stop),
            "restart" => game().map(Command::Restart),
            "write" => {
                let Some((game, text)) = rest.split_once(char::is_whitespace) else {
                    return Err("usage: write <game> <text>".to_string());
                };
                Ok(Command::Write {
                    game: game.to_string(),
                    text: text.trim_start().to_string(),
                })
            }
            "status" => Ok(Command::Status((!rest.is_empty()).then(|| rest.to_string()))),
            "reload" => Ok(Command::Reload),
            "quit" | "exit" => Ok(Command::Quit),
            "help" | "?" => Ok(Command::Help),
            other => Err(format!("unknown command {other:?}; try help")),
        }
    }
}

/// Operator commands against a running manager.
pub struct Console {
    manager: Arc<Manager>,
    bridge: Arc<LogBridge>,
    config_path: PathBuf,
    stop_timeout: Duration,
}

impl Console {
    pub fn new(
        manager: Arc<Manager>,
        bridge: Arc<LogBridge>,
        config_path: PathBuf,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            manager,
            bridge,
            config_path,
            stop_timeout,
        }
    }

    /// Run one command and return the reply for the operator.
    pub async fn execute(&self, cmd: Command) -> anyhow::Result<String> {
        match cmd {
            Command::Start(game) => {
                self.manager.start_game(&game).await?;
                Ok(format!("{game}: starting"))
            }
            Command::Stop(game) => {
                self.manager.stop_game(&game, self.stop_timeout).await?;
                Ok(format!("{game}: stopped"))
            }
            Command::Restart(game) => {
                self.manager.restart_game(&game, self.stop_timeout).await?;
                Ok(format!("{game}: restarting"))
            }
            Command::Write { game, text } => {
                self.manager.write_game(&game, text.as_bytes()).await?;
                Ok(format!("{game}: sent"))
            }
            Command::Status(Some(game)) => {
                let g = self
                    .manager
                    .get_game(&game)
                    .await
                    .ok_or_else(|| anyhow::anyhow!("no game named {game:?}"))?;
                Ok(format!("{game}: {}", g.human_status().await))
            }
            Command::Status(None) => {
                let mut lines = Vec::new();
                for name in self.manager.game_names().await {
                    if let Some(g) = self.manager.get_game(&name).await {
                        lines.push(format!("{name}: {}", g.human_status().await));
                    }
                }
                if lines.is_empty() {
                    return Ok("no games configured".to_string());
                }
                Ok(lines.join("\n"))
            }
            Command::Reload => self.reload().await,
            Command::Quit => Ok("shutting down".to_string()),
            Command::Help => Ok(HELP.to_string()),
        }
    }

    async fn reload(&self) -> anyhow::Result<String> {
        let cfg = ControlConfig::load(&self.config_path)?;
        self.bridge.refresh(&cfg.game);
        let autostart: Vec<String> = cfg
            .game
            .iter()
            .filter(|g| g.autostart)
            .map(|g| g.name.clone())
            .collect();

        let summary = self.manager.reload_games(cfg.game, self.stop_timeout).await;
        // Newly added autostart games come up right away.
        for name in summary.added.iter().filter(|n| autostart.contains(n)) {
            if let Err(e) = self.manager.start_game(name).await {
                tracing::warn!(game = %name, error = %e, "autostart after reload failed");
            }
        }

        let mut reply = format!(
            "reloaded: {} added, {} updated, {} removed",
            summary.added.len(),
            summary.updated.len(),
            summary.removed.len()
        );
        for (name, err) in &summary.failed {
            reply.push_str(&format!("\n{name}: {err}"));
        }
        Ok(reply)
    }

    /// Read commands from `input` until EOF, `quit`, or `shutdown`. Cancels
    /// `shutdown` on quit.
    pub async fn run<R>(&self, input: R, shutdown: CancellationToken)
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => return,
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(l)) => l,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "console read failed");
                    return;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let cmd = match Command::parse(&line) {
                Ok(c) => c,
                Err(msg) => {
                    println!("{msg}");
                    continue;
                }
            };
            let quit = cmd == Command::Quit;
            match self.execute(cmd).await {
                Ok(reply) => println!("{reply}"),
                Err(e) => println!("error: {e:#}"),
            }
            if quit {
                shutdown.cancel();
                return;
            }
        }
    }
}
