use std::{path::Path, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use warden_agent::{Agent, AgentConfig, AgentRpc, server};

const SHUTDOWN_STOP_TIMEOUT: Duration = Duration::from_secs(30);

fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "warden-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AgentConfig::from_env()?;
    let _guard = init_tracing(config.log_dir.as_deref());

    let listener = server::Listener::bind(&config.listen).await?;
    tracing::info!(
        listen = %listener.local_addr()?,
        cmd = %config.process.command_line(),
        "warden-agent listening"
    );

    let agent = Agent::new(&config);
    let shutdown = CancellationToken::new();
    let serving = tokio::spawn(server::serve(
        listener,
        AgentRpc::new(agent.clone()),
        shutdown.clone(),
    ));

    shutdown_signal().await;
    tracing::info!("shutting down");
    shutdown.cancel();

    if agent.is_running() {
        if let Err(e) = agent.stop_or_kill_timeout(SHUTDOWN_STOP_TIMEOUT).await {
            tracing::warn!(error = %e, "failed to stop workload");
        }
    }
    serving.await??;
    Ok(())
}
