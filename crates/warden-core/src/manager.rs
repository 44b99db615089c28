use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    time::Duration,
};

use tokio::{sync::RwLock, task::JoinSet};

use crate::{
    bridge::OutputBridge,
    config::GameConfig,
    error::{GameError, ManagerError},
    game::Game,
};

/// What `reload_games` did.
#[derive(Debug, Default)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub failed: Vec<(String, GameError)>,
}

/// The set of supervised games. The list only changes under the write lock;
/// lookups and iteration share the read lock.
pub struct Manager {
    games: RwLock<Vec<Arc<Game>>>,
    bridge: Arc<dyn OutputBridge>,
}

impl Manager {
    pub fn new(bridge: Arc<dyn OutputBridge>) -> Self {
        Self {
            games: RwLock::new(Vec::new()),
            bridge,
        }
    }

    pub async fn add_game(&self, config: GameConfig) -> Result<Arc<Game>, ManagerError> {
        let name = config.name.clone();
        let game = Game::new(config, self.bridge.clone()).map_err(|e| ManagerError::game(&name, e))?;
        self.insert(game.clone()).await?;
        Ok(game)
    }

    /// Add a game built elsewhere, e.g. with a custom transport.
    pub async fn insert(&self, game: Arc<Game>) -> Result<(), ManagerError> {
        let mut games = self.games.write().await;
        if games.iter().any(|g| g.name() == game.name()) {
            return Err(ManagerError::DuplicateGame(game.name().to_string()));
        }
        tracing::debug!(game = %game.name(), "game added");
        games.push(game);
        Ok(())
    }

    pub async fn get_game(&self, name: &str) -> Option<Arc<Game>> {
        self.games
            .read()
            .await
            .iter()
            .find(|g| g.name() == name)
            .cloned()
    }

    pub async fn game_names(&self) -> Vec<String> {
        self.games
            .read()
            .await
            .iter()
            .map(|g| g.name().to_string())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.games.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.games.read().await.is_empty()
    }

    /// Call `f` for every game not named in `skip`, under the read lock. A
    /// panicking callback is logged and iteration continues.
    pub async fn for_each_game<F>(&self, mut f: F, skip: &[&str])
    where
        F: FnMut(&Arc<Game>),
    {
        let games = self.games.read().await;
        for game in games.iter() {
            if skip.contains(&game.name()) {
                continue;
            }
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| f(game))) {
                tracing::error!(
                    game = %game.name(),
                    panic = %panic_message(panic.as_ref()),
                    "game callback panicked"
                );
            }
        }
    }

    async fn require(&self, name: &str) -> Result<Arc<Game>, ManagerError> {
        self.get_game(name)
            .await
            .ok_or_else(|| ManagerError::UnknownGame(name.to_string()))
    }

    pub async fn start_game(&self, name: &str) -> Result<(), ManagerError> {
        let game = self.require(name).await?;
        game.start().map_err(|e| ManagerError::game(name, e))?;
        Ok(())
    }

    pub async fn stop_game(&self, name: &str, timeout: Duration) -> Result<(), ManagerError> {
        let game = self.require(name).await?;
        game.stop_or_kill_timeout(timeout)
            .await
            .map_err(|e| ManagerError::game(name, e))
    }

    /// Stop (if running), wait for the loop to end, and start again.
    pub async fn restart_game(&self, name: &str, timeout: Duration) -> Result<(), ManagerError> {
        let game = self.require(name).await?;
        match game.stop_or_kill_timeout(timeout).await {
            Ok(()) | Err(GameError::NotRunning) => {}
            Err(e) => return Err(ManagerError::game(name, e)),
        }
        game.wait_stopped().await;
        game.start().map_err(|e| ManagerError::game(name, e))?;
        Ok(())
    }

    pub async fn write_game(&self, name: &str, data: &[u8]) -> Result<(), ManagerError> {
        let game = self.require(name).await?;
        game.write(data)
            .await
            .map_err(|e| ManagerError::game(name, e))
    }

    /// Bring the game list in line with `configs`: update games that exist,
    /// add new ones, stop and drop the rest.
    pub async fn reload_games(&self, configs: Vec<GameConfig>, stop_timeout: Duration) -> ReloadSummary {
        let mut summary = ReloadSummary::default();
        let removed: Vec<Arc<Game>> = {
            let mut games = self.games.write().await;
            for cfg in configs.iter() {
                let name = cfg.name.clone();
                let existing = games.iter().find(|g| g.name() == name).cloned();
                match existing {
                    Some(game) => {
                        if game.config() == *cfg {
                            continue;
                        }
                        match game.update_from_config(cfg.clone()) {
                            Ok(()) => summary.updated.push(name),
                            Err(e) => summary.failed.push((name, e)),
                        }
                    }
                    None => match Game::new(cfg.clone(), self.bridge.clone()) {
                        Ok(game) => {
                            games.push(game);
                            summary.added.push(name);
                        }
                        Err(e) => summary.failed.push((name, e)),
                    },
                }
            }

            let (keep, dropped): (Vec<_>, Vec<_>) = games
                .drain(..)
                .partition(|g| configs.iter().any(|c| c.name == g.name()));
            *games = keep;
            dropped
        };

        let mut stops = JoinSet::new();
        for game in removed {
            summary.removed.push(game.name().to_string());
            stops.spawn(async move {
                match game.stop_or_kill_timeout(stop_timeout).await {
                    Ok(()) | Err(GameError::NotRunning) => {}
                    Err(e) => tracing::warn!(game = %game.name(), error = %e, "stop of removed game failed"),
                }
                game.wait_stopped().await;
            });
        }
        while stops.join_next().await.is_some() {}

        tracing::info!(
            added = summary.added.len(),
            updated = summary.updated.len(),
            removed = summary.removed.len(),
            failed = summary.failed.len(),
            "games reloaded"
        );
        summary
    }

    /// Stop every game concurrently and return once all of them are down.
    /// Games will not restart afterwards.
    pub async fn stop_all_games(&self, timeout: Duration) {
        let games: Vec<Arc<Game>> = self.games.read().await.clone();
        tracing::info!(count = games.len(), "stopping all games");

        let mut stops = JoinSet::new();
        for game in games {
            game.begin_shutdown();
            stops.spawn(async move {
                if let Err(e) = game.stop_or_kill_timeout(timeout).await {
                    tracing::warn!(game = %game.name(), error = %e, "stop failed");
                }
                game.wait_stopped().await;
            });
        }
        while let Some(res) = stops.join_next().await {
            if let Err(e) = res {
                tracing::error!(error = %e, "stop task failed");
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic".to_string()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use warden_process::Stream;

    use super::*;

    struct Quiet;

    impl OutputBridge for Quiet {
        fn on_line(&self, _game: &str, _line: &str, _stream: Stream) {}
    }

    fn config(name: &str, script: &str) -> GameConfig {
        toml::from_str(&format!(
            r#"
            name = "{name}"
            [transport]
            kind = "local"
            binary = "/bin/sh"
            args = ["-c", {script:?}]
            "#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let m = Manager::new(Arc::new(Quiet));
        m.add_game(config("survival", "true")).await.unwrap();
        let err = m.add_game(config("survival", "true")).await.unwrap_err();
        assert!(matches!(err, ManagerError::DuplicateGame(ref n) if n == "survival"));
        assert_eq!(m.len().await, 1);
    }

    #[tokio::test]
    async fn lookup_of_missing_game_is_none() {
        let m = Manager::new(Arc::new(Quiet));
        assert!(m.get_game("nope").await.is_none());
        assert!(matches!(
            m.start_game("nope").await,
            Err(ManagerError::UnknownGame(_))
        ));
    }

    #[tokio::test]
    async fn for_each_survives_panics_and_honours_skip() {
        let m = Manager::new(Arc::new(Quiet));
        for name in ["a", "b", "c"] {
            m.add_game(config(name, "true")).await.unwrap();
        }
        let visited = AtomicUsize::new(0);
        m.for_each_game(
            |g| {
                visited.fetch_add(1, Ordering::SeqCst);
                if g.name() == "a" {
                    panic!("bad callback");
                }
            },
            &["c"],
        )
        .await;
        assert_eq!(visited.load(Ordering::SeqCst), 2);
        // The manager is still usable after the panic.
        assert_eq!(m.game_names().await, vec!["a", "b", "c"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reload_adds_updates_and_removes() {
        let m = Manager::new(Arc::new(Quiet));
        m.add_game(config("keep", "true")).await.unwrap();
        m.add_game(config("gone", "sleep 30")).await.unwrap();
        m.start_game("gone").await.unwrap();
        let gone = m.get_game("gone").await.unwrap();
        while !gone.is_running() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let summary = m
            .reload_games(
                vec![config("keep", "echo changed"), config("fresh", "true")],
                Duration::from_secs(2),
            )
            .await;
        assert_eq!(summary.added, vec!["fresh"]);
        assert_eq!(summary.updated, vec!["keep"]);
        assert_eq!(summary.removed, vec!["gone"]);
        assert!(summary.failed.is_empty());
        assert!(!gone.is_running());
        assert_eq!(m.game_names().await, vec!["keep", "fresh"]);
    }
}
