use std::{
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use warden_process::{ProcessStatus, Stream};

use crate::{
    bridge::{GameEvent, OutputBridge, StopReason},
    config::GameConfig,
    error::{GameError, TransportError},
    transport::{RunOutcome, StdioSender, Transport, transport_from_config},
};

const STDIO_CHANNEL_CAPACITY: usize = 256;
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const LATE_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameStatus {
    Normal,
    /// An operator asked for the stop; the loop must not restart.
    Killed,
    /// The manager is tearing everything down.
    Shutdown,
}

impl GameStatus {
    fn stop_reason(self) -> Option<StopReason> {
        match self {
            GameStatus::Normal => None,
            GameStatus::Killed => Some(StopReason::Killed),
            GameStatus::Shutdown => Some(StopReason::Shutdown),
        }
    }
}

/// A named workload with a restart policy.
///
/// The game owns one transport for its whole life. `start` spawns the run
/// loop, which restarts the workload after clean exits according to
/// `auto_restart` until it is stopped, fails or is detached.
pub struct Game {
    name: String,
    config: RwLock<GameConfig>,
    transport: Arc<dyn Transport>,
    bridge: Arc<dyn OutputBridge>,
    status: watch::Sender<GameStatus>,
    // True while a run loop owns this game.
    active: watch::Sender<bool>,
    detach: Mutex<CancellationToken>,
}

impl std::fmt::Debug for Game {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Game")
            .field("name", &self.name)
            .field("status", &*self.status.borrow())
            .field("active", &*self.active.borrow())
            .field("transport", &self.transport)
            .finish()
    }
}

struct ActiveGuard<'a>(&'a watch::Sender<bool>);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

impl Game {
    pub fn new(config: GameConfig, bridge: Arc<dyn OutputBridge>) -> Result<Arc<Self>, GameError> {
        config.validate().map_err(GameError::Config)?;
        let transport = transport_from_config(&config.transport)?;
        Ok(Self::with_transport(config, transport, bridge))
    }

    pub fn with_transport(
        config: GameConfig,
        transport: Arc<dyn Transport>,
        bridge: Arc<dyn OutputBridge>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: config.name.clone(),
            config: RwLock::new(config),
            transport,
            bridge,
            status: watch::channel(GameStatus::Normal).0,
            active: watch::channel(false).0,
            detach: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> GameConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn game_status(&self) -> GameStatus {
        *self.status.borrow()
    }

    /// A run loop is active (running, or waiting to restart).
    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.transport.is_running()
    }

    pub async fn status(&self) -> Result<ProcessStatus, GameError> {
        Ok(self.transport.status().await?)
    }

    pub async fn human_status(&self) -> String {
        let loop_state = match (self.is_active(), self.game_status()) {
            (true, _) if !self.is_running() => " [restart pending]",
            (_, GameStatus::Killed) => " [stopped by operator]",
            (_, GameStatus::Shutdown) => " [shutting down]",
            _ => "",
        };
        format!("{}{loop_state}", self.transport.human_status().await)
    }

    /// Apply a new config without recreating the game. The transport kind
    /// cannot change, and transport settings only change while stopped.
    pub fn update_from_config(&self, config: GameConfig) -> Result<(), GameError> {
        if config.name != self.name {
            return Err(GameError::Config(format!(
                "cannot rename game {:?} to {:?}",
                self.name, config.name
            )));
        }
        config.validate().map_err(GameError::Config)?;

        let mut current = self.config.write().unwrap_or_else(|e| e.into_inner());
        if current.transport != config.transport {
            self.transport.update(&config.transport)?;
        }
        *current = config;
        Ok(())
    }

    fn claim(&self) -> Result<(), GameError> {
        if self.game_status() == GameStatus::Shutdown {
            return Err(GameError::ShuttingDown);
        }
        if self.transport.is_running() {
            return Err(GameError::AlreadyRunning);
        }
        let claimed = self.active.send_if_modified(|active| {
            if *active {
                false
            } else {
                *active = true;
                true
            }
        });
        if !claimed {
            return Err(GameError::AlreadyRunning);
        }
        // Whatever stopped the previous loop no longer applies.
        self.status.send_if_modified(|s| {
            if *s == GameStatus::Killed {
                *s = GameStatus::Normal;
                true
            } else {
                false
            }
        });
        Ok(())
    }

    /// Run the loop in the background. Fails without side effects when the
    /// game is already running.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<Result<(), GameError>>, GameError> {
        self.claim()?;
        let game = self.clone();
        Ok(tokio::spawn(async move { game.run_claimed().await }))
    }

    /// Run the loop in the calling task until it ends.
    pub async fn run(&self) -> Result<(), GameError> {
        self.claim()?;
        self.run_claimed().await
    }

    async fn run_claimed(&self) -> Result<(), GameError> {
        let _active = ActiveGuard(&self.active);

        loop {
            let cancel = CancellationToken::new();
            *self.detach.lock().unwrap_or_else(|e| e.into_inner()) = cancel.clone();

            let (started, result) = self.run_once(cancel.clone()).await;
            let exit = match result {
                Err(e) if !started => {
                    tracing::warn!(game = %self.name, error = %e, "start failed");
                    self.emit(GameEvent::StartFailed(e.to_string()));
                    return Err(e.into());
                }
                Err(e) => {
                    tracing::warn!(game = %self.name, error = %e, "run failed");
                    self.emit(GameEvent::Failed(e.to_string()));
                    return Err(e.into());
                }
                Ok(RunOutcome::Unknown) => {
                    tracing::info!(game = %self.name, "detached");
                    self.emit(GameEvent::Detached);
                    return Ok(());
                }
                Ok(RunOutcome::Exited(exit)) => exit,
            };

            tracing::info!(game = %self.name, %exit, "workload exited");
            self.emit(GameEvent::Exited(exit));

            if let Some(reason) = self.game_status().stop_reason() {
                self.emit(GameEvent::Stopped(reason));
                return Ok(());
            }
            let Some(delay) = self.config().restart_delay() else {
                self.emit(GameEvent::Stopped(StopReason::RestartDisabled));
                return Ok(());
            };
            if !exit.success() {
                self.emit(GameEvent::Stopped(StopReason::ExitCode));
                return Ok(());
            }

            tracing::info!(game = %self.name, delay_secs = delay.as_secs(), "restarting");
            self.emit(GameEvent::Restarting(delay));
            let mut status = self.status.subscribe();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                s = status.wait_for(|s| *s != GameStatus::Normal) => {
                    let reason = s
                        .ok()
                        .and_then(|s| s.stop_reason())
                        .unwrap_or(StopReason::Killed);
                    self.emit(GameEvent::Stopped(reason));
                    return Ok(());
                }
                _ = cancel.cancelled() => {
                    self.emit(GameEvent::Detached);
                    return Ok(());
                }
            }
            if let Some(reason) = self.game_status().stop_reason() {
                self.emit(GameEvent::Stopped(reason));
                return Ok(());
            }
        }
    }

    /// One transport run with its output forwarded to the bridge. The flag
    /// tells whether the workload got as far as starting.
    async fn run_once(&self, cancel: CancellationToken) -> (bool, Result<RunOutcome, TransportError>) {
        let (out_tx, mut out_rx) = mpsc::channel::<String>(STDIO_CHANNEL_CAPACITY);
        let (err_tx, mut err_rx) = mpsc::channel::<String>(STDIO_CHANNEL_CAPACITY);
        let (started_tx, mut started_rx) = oneshot::channel::<()>();
        let io = StdioSender {
            stdout: out_tx,
            stderr: err_tx,
        };

        let run = self.transport.run(io, started_tx, cancel);
        tokio::pin!(run);

        let mut started = false;
        let mut waiting_start = true;
        let (mut out_open, mut err_open) = (true, true);
        let result = loop {
            tokio::select! {
                res = &mut run => break res,
                s = &mut started_rx, if waiting_start => {
                    waiting_start = false;
                    if s.is_ok() {
                        started = true;
                        self.emit(GameEvent::Started);
                        self.stop_if_unwanted();
                    }
                }
                line = out_rx.recv(), if out_open => match line {
                    Some(l) => self.bridge.on_line(&self.name, &l, Stream::Stdout),
                    None => out_open = false,
                },
                line = err_rx.recv(), if err_open => match line {
                    Some(l) => self.bridge.on_line(&self.name, &l, Stream::Stderr),
                    None => err_open = false,
                },
            }
        };

        // The run may finish before its started signal was polled.
        if waiting_start && started_rx.try_recv().is_ok() {
            started = true;
            self.emit(GameEvent::Started);
        }

        let deadline = tokio::time::sleep(OUTPUT_DRAIN_TIMEOUT);
        tokio::pin!(deadline);
        while out_open || err_open {
            tokio::select! {
                line = out_rx.recv(), if out_open => match line {
                    Some(l) => self.bridge.on_line(&self.name, &l, Stream::Stdout),
                    None => out_open = false,
                },
                line = err_rx.recv(), if err_open => match line {
                    Some(l) => self.bridge.on_line(&self.name, &l, Stream::Stderr),
                    None => err_open = false,
                },
                _ = &mut deadline => {
                    tracing::warn!(game = %self.name, "output still open after run ended");
                    break;
                }
            }
        }

        (started, result)
    }

    /// A stop that arrived while the workload was still starting found
    /// nothing to stop; deliver it now.
    fn stop_if_unwanted(&self) {
        if self.game_status() == GameStatus::Normal {
            return;
        }
        tracing::info!(game = %self.name, "stop arrived during start; stopping");
        let transport = self.transport.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.stop_or_kill_timeout(LATE_STOP_TIMEOUT).await {
                if !e.is_not_running() {
                    tracing::warn!(game = %name, error = %e, "late stop failed");
                }
            }
        });
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), GameError> {
        Ok(self.transport.write(data).await?)
    }

    /// Stop the workload and keep it stopped. Also cancels a pending
    /// restart. Reports `NotRunning` when there is nothing to stop.
    pub async fn stop_or_kill_timeout(&self, timeout: Duration) -> Result<(), GameError> {
        let shutting_down = self.game_status() == GameStatus::Shutdown;
        if !self.transport.is_running() && !shutting_down {
            if self.is_active() {
                tracing::info!(game = %self.name, "pending restart cancelled");
                self.status.send_replace(GameStatus::Killed);
                return Ok(());
            }
            return Err(GameError::NotRunning);
        }
        if !shutting_down {
            self.status.send_replace(GameStatus::Killed);
        }
        tracing::info!(game = %self.name, timeout_secs = timeout.as_secs(), "stopping");
        match self.transport.stop_or_kill_timeout(timeout).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_running() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Mark the game as part of a manager shutdown; it will not restart.
    pub fn begin_shutdown(&self) {
        self.status.send_replace(GameStatus::Shutdown);
    }

    /// Stop supervising without stopping the workload.
    pub fn detach(&self) {
        self.detach
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
    }

    /// Resolve once no run loop is active.
    pub async fn wait_stopped(&self) {
        let mut active = self.active.subscribe();
        let _ = active.wait_for(|a| !*a).await;
    }

    fn emit(&self, event: GameEvent) {
        self.bridge.on_event(&self.name, &event);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        lines: StdMutex<Vec<(Stream, String)>>,
        events: StdMutex<Vec<GameEvent>>,
    }

    impl Recorder {
        fn stdout(&self) -> Vec<String> {
            self.lines
                .lock()
                .unwrap()
                .iter()
                .filter(|(s, _)| *s == Stream::Stdout)
                .map(|(_, l)| l.clone())
                .collect()
        }

        fn events(&self) -> Vec<GameEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl OutputBridge for Recorder {
        fn on_line(&self, _game: &str, line: &str, stream: Stream) {
            self.lines.lock().unwrap().push((stream, line.to_string()));
        }

        fn on_event(&self, _game: &str, event: &GameEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn config(name: &str, script: &str, auto_restart: i64) -> GameConfig {
        let src = format!(
            r#"
            name = "{name}"
            auto_restart = {auto_restart}
            [transport]
            kind = "local"
            binary = "/bin/sh"
            args = ["-c", {script:?}]
            "#
        );
        toml::from_str(&src).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disabled_restart_stops_after_clean_exit() {
        let rec = Arc::new(Recorder::default());
        let game = Game::new(config("lobby", "echo hello", -1), rec.clone()).unwrap();

        game.run().await.unwrap();
        assert_eq!(rec.stdout(), vec!["hello"]);
        let events = rec.events();
        assert_eq!(events.first(), Some(&GameEvent::Started));
        assert_eq!(
            events.last(),
            Some(&GameEvent::Stopped(StopReason::RestartDisabled))
        );
        assert!(!game.is_active());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn nonzero_exit_is_not_restarted() {
        let rec = Arc::new(Recorder::default());
        let game = Game::new(config("crashy", "exit 2", 0), rec.clone()).unwrap();

        game.run().await.unwrap();
        assert_eq!(
            rec.events().last(),
            Some(&GameEvent::Stopped(StopReason::ExitCode))
        );
    }

    #[tokio::test]
    async fn start_failure_ends_the_loop() {
        let rec = Arc::new(Recorder::default());
        let mut cfg = config("broken", "true", 0);
        cfg.transport = toml::from_str("kind = \"local\"\nbinary = \"/nonexistent/warden-game\"").unwrap();
        let game = Game::new(cfg, rec.clone()).unwrap();

        let err = game.run().await.unwrap_err();
        assert!(matches!(err, GameError::Transport(_)));
        assert!(matches!(rec.events().as_slice(), [GameEvent::StartFailed(_)]));
        assert!(!game.is_active());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_start_is_rejected_and_stop_prevents_restart() {
        let rec = Arc::new(Recorder::default());
        let game = Game::new(config("survival", "echo up; sleep 30", 0), rec.clone()).unwrap();

        let handle = game.start().unwrap();
        assert!(game.start().unwrap_err().is_already_running());

        while rec.stdout().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        game.stop_or_kill_timeout(Duration::from_secs(2)).await.unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(game.game_status(), GameStatus::Killed);
        assert_eq!(
            rec.events().last(),
            Some(&GameEvent::Stopped(StopReason::Killed))
        );
        assert!(matches!(
            game.stop_or_kill_timeout(Duration::from_secs(1)).await,
            Err(GameError::NotRunning)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_during_restart_delay_cancels_restart() {
        let rec = Arc::new(Recorder::default());
        let game = Game::new(config("pending", "true", 30), rec.clone()).unwrap();

        let handle = game.start().unwrap();
        while !rec.events().contains(&GameEvent::Restarting(Duration::from_secs(30))) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(game.is_active());
        assert!(game.human_status().await.contains("restart pending"));

        game.stop_or_kill_timeout(Duration::from_secs(1)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            rec.events().last(),
            Some(&GameEvent::Stopped(StopReason::Killed))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn detach_leaves_local_workload_running() {
        let rec = Arc::new(Recorder::default());
        let game = Game::new(config("detached", "sleep 30", 0), rec.clone()).unwrap();

        let handle = game.start().unwrap();
        while !rec.events().contains(&GameEvent::Started) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        game.detach();
        handle.await.unwrap().unwrap();

        assert_eq!(rec.events().last(), Some(&GameEvent::Detached));
        assert!(game.is_running());
        game.stop_or_kill_timeout(Duration::from_secs(2)).await.unwrap();
        assert!(!game.is_running());
    }

    #[tokio::test]
    async fn update_keeps_identity_and_rejects_rename() {
        let rec = Arc::new(Recorder::default());
        let game = Game::new(config("creative", "true", -1), rec).unwrap();

        game.update_from_config(config("creative", "echo v2", 10)).unwrap();
        assert_eq!(game.config().auto_restart, 10);

        let err = game.update_from_config(config("other", "true", 0)).unwrap_err();
        assert!(matches!(err, GameError::Config(_)));
    }
}
