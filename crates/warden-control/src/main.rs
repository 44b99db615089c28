use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use warden_control::{Console, ControlConfig, LogBridge};
use warden_core::Manager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = ControlConfig::path_from_env();
    let cfg = ControlConfig::load(&config_path)?;
    let stop_timeout = cfg.shutdown_timeout();

    let bridge = Arc::new(LogBridge::new());
    bridge.refresh(&cfg.game);
    let manager = Arc::new(Manager::new(bridge.clone()));

    for game in &cfg.game {
        manager
            .add_game(game.clone())
            .await
            .with_context(|| format!("add game {:?}", game.name))?;
    }
    for game in cfg.game.iter().filter(|g| g.autostart) {
        if let Err(e) = manager.start_game(&game.name).await {
            tracing::error!(game = %game.name, error = %e, "autostart failed");
        }
    }
    tracing::info!(
        config = %config_path.display(),
        games = cfg.game.len(),
        "warden-control running"
    );

    let shutdown = CancellationToken::new();
    let console = Console::new(manager.clone(), bridge, config_path, stop_timeout);
    let console_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            console.run(stdin, shutdown).await;
        })
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("listen for ctrl-c")?;
            tracing::info!("interrupt received");
        }
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();

    manager.stop_all_games(stop_timeout).await;
    console_task.abort();
    tracing::info!("all games stopped");
    Ok(())
}
