#![cfg(unix)]

use std::{path::PathBuf, sync::Arc, time::Duration};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use warden_core::{
    ExitInfo, ProcessSpec, RemoteConfig, RemoteTransport, RunOutcome, StdioSender, Transport,
};

/// Sends SIGTERM to a spawned agent when the test ends, pass or fail.
struct AgentPid(Option<u32>);

impl Drop for AgentPid {
    fn drop(&mut self) {
        if let Some(pid) = self.0 {
            let _ = std::process::Command::new("kill")
                .arg(pid.to_string())
                .status();
        }
    }
}

fn agent_pid(human: &str) -> Option<u32> {
    let (_, rest) = human.split_once(" pid ")?;
    rest.split_whitespace().next()?.parse().ok()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_agent_is_spawned_and_runs_the_workload() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = RemoteConfig::new(dir.path().join("hosted.sock").display().to_string());
    cfg.unix = true;
    cfg.self_host = true;
    cfg.agent_binary = Some(PathBuf::from(env!("CARGO_BIN_EXE_warden-agent")));
    cfg.agent_log_dir = Some(dir.path().to_path_buf());
    cfg.process = Some(
        ProcessSpec::new("/bin/sh")
            .arg("-c")
            .arg("echo hosted; echo oops >&2; exit 3"),
    );
    let t = Arc::new(RemoteTransport::new(cfg));

    let (out_tx, mut out_rx) = mpsc::channel(16);
    let (err_tx, mut err_rx) = mpsc::channel(16);
    let (started_tx, started_rx) = oneshot::channel();
    let run = {
        let t = t.clone();
        tokio::spawn(async move {
            t.run(
                StdioSender {
                    stdout: out_tx,
                    stderr: err_tx,
                },
                started_tx,
                CancellationToken::new(),
            )
            .await
        })
    };

    let outcome = tokio::time::timeout(Duration::from_secs(20), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let human = t.human_status().await;
    let _agent = AgentPid(agent_pid(&human));

    assert!(started_rx.await.is_ok());
    assert_eq!(
        outcome,
        RunOutcome::Exited(ExitInfo {
            code: Some(3),
            signal: None
        })
    );
    assert_eq!(out_rx.recv().await.as_deref(), Some("hosted"));
    assert_eq!(err_rx.recv().await.as_deref(), Some("oops"));
    assert!(human.starts_with("stopped (exit status 3)"), "{human}");
    assert!(agent_pid(&human).is_some_and(|pid| pid != std::process::id()));
}
