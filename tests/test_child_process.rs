//! Child process supervisor tests
//!
//! Each test writes a small shell script standing in for the external
//! runtime. Unix only.
#![cfg(unix)]

use async_trait::async_trait;
use livehub::hub::{HubContext, HubController};
use livehub::process::{
    ChildProcessSupervisor, ConsoleLine, ConsoleStream, LaunchOptions, StopHandler,
};
use livehub::task::TaskState;
use livehub::{init_test_tracing, HubConfig, ParticipantConfig, Result};
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

fn fake_runtime(dir: &TempDir, body: &str) -> PathBuf {
    init_test_tracing();
    let path = dir.path().join("runtime.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

const ANNOUNCING: &str = "\
echo \"booting\"
echo \"opts=$JAVA_OPTS\"
echo \"args=$*\"
echo \"Listening at : 51000\"
sleep 30";

fn options(executable: &Path) -> LaunchOptions {
    LaunchOptions::new(executable).with_timeout(Duration::from_secs(5))
}

async fn collect(console: &mut mpsc::Receiver<ConsoleLine>, count: usize) -> Vec<String> {
    let mut lines = Vec::new();
    while lines.len() < count {
        match tokio::time::timeout(Duration::from_secs(5), console.recv()).await {
            Ok(Some(line)) => {
                assert_eq!(line.stream, ConsoleStream::Stdout);
                lines.push(line.text);
            }
            _ => break,
        }
    }
    lines
}

/// The handshake line resolves to the loopback endpoint; other lines reach the console
#[tokio::test]
async fn test_handshake_resolves_endpoint() {
    let dir = TempDir::new().unwrap();
    let exe = fake_runtime(&dir, ANNOUNCING);
    let mut supervisor = ChildProcessSupervisor::launch(
        options(&exe)
            .with_java_option("-Xmx1g")
            .with_java_option("-Dlabel=two words")
            .with_argument("--project=demo"),
    );
    let mut console = supervisor.take_console().unwrap();

    let info = supervisor.info().await.unwrap();
    assert_eq!(info.address, "127.0.0.1:51000".parse::<SocketAddr>().unwrap());
    assert!(info.process.id().is_some());

    let lines = collect(&mut console, 4).await;
    assert_eq!(
        lines,
        vec![
            "booting".to_string(),
            "opts=-Xmx1g \"-Dlabel=two words\"".to_string(),
            "args=--port auto --interactive --project=demo".to_string(),
            "Listening at : 51000".to_string(),
        ]
    );

    info.process.kill().await.unwrap();
}

/// The embedded launcher variant passes --no-autorun
#[tokio::test]
async fn test_no_autorun_flag() {
    let dir = TempDir::new().unwrap();
    let exe = fake_runtime(&dir, ANNOUNCING);
    let mut supervisor = ChildProcessSupervisor::launch(options(&exe).with_autorun(false));
    let mut console = supervisor.take_console().unwrap();

    let info = supervisor.info().await.unwrap();
    let lines = collect(&mut console, 3).await;
    assert_eq!(lines[2], "args=--port auto --interactive --no-autorun");

    info.process.kill().await.unwrap();
}

/// Without a handshake the wait times out and the process keeps running
#[tokio::test]
async fn test_handshake_timeout_leaves_process_running() {
    let dir = TempDir::new().unwrap();
    let exe = fake_runtime(&dir, "echo \"still booting\"\nsleep 30");
    let mut supervisor = ChildProcessSupervisor::launch(
        LaunchOptions::new(&exe).with_timeout(Duration::from_millis(300)),
    );

    let err = supervisor.info().await.unwrap_err();
    assert_eq!(err.category(), "timeout");

    let process = supervisor.process().await.unwrap();
    assert!(process.try_wait().await.unwrap().is_none());
    process.kill().await.unwrap();
}

/// kill() on one handle is not held up by another handle waiting for the exit
#[tokio::test]
async fn test_kill_while_another_handle_waits() {
    let dir = TempDir::new().unwrap();
    let exe = fake_runtime(&dir, "exec sleep 30");
    let mut supervisor = ChildProcessSupervisor::launch(options(&exe));
    let process = supervisor.process().await.unwrap();

    let waiter = process.clone();
    let waiting = tokio::spawn(async move { waiter.wait().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(2), process.kill())
        .await
        .expect("kill blocked behind wait")
        .unwrap();

    let status = tokio::time::timeout(Duration::from_secs(2), waiting)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!status.success());
    assert_eq!(process.try_wait().await.unwrap(), Some(status));
}

/// A malformed port fails the resolution
#[tokio::test]
async fn test_malformed_handshake_fails() {
    let dir = TempDir::new().unwrap();
    let exe = fake_runtime(&dir, "echo \"Listening at : abc\"\nsleep 30");
    let mut supervisor = ChildProcessSupervisor::launch(options(&exe));

    let err = supervisor.address().await.unwrap_err();
    assert_eq!(err.category(), "handshake");

    supervisor.process().await.unwrap().kill().await.unwrap();
}

/// A child that exits before announcing fails the resolution
#[tokio::test]
async fn test_exit_before_handshake() {
    let dir = TempDir::new().unwrap();
    let exe = fake_runtime(&dir, "echo \"bye\"\nexit 3");
    let mut supervisor = ChildProcessSupervisor::launch(options(&exe));

    let err = supervisor.address().await.unwrap_err();
    assert_eq!(err.category(), "process");

    let status = supervisor.process().await.unwrap().wait().await.unwrap();
    assert_eq!(status.code(), Some(3));
}

/// A missing executable fails the process wait
#[tokio::test]
async fn test_spawn_failure() {
    let mut supervisor =
        ChildProcessSupervisor::launch(options(Path::new("/nonexistent/livehub-runtime")));
    let err = supervisor.process().await.unwrap_err();
    assert_eq!(err.category(), "process");
}

struct CountingStop(AtomicUsize);

#[async_trait]
impl StopHandler for CountingStop {
    async fn stop(&self) -> Result<TaskState> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(TaskState::Completed)
    }
}

/// Stop requests go to the registered handler, not to the process
#[tokio::test]
async fn test_stop_routes_to_handler() {
    let dir = TempDir::new().unwrap();
    let exe = fake_runtime(&dir, ANNOUNCING);

    let bare = ChildProcessSupervisor::launch(options(&exe));
    assert!(bare.request_stop().await.is_err());
    let mut bare = bare;
    bare.process().await.unwrap().kill().await.unwrap();

    let handler = Arc::new(CountingStop(AtomicUsize::new(0)));
    let mut supervisor =
        ChildProcessSupervisor::launch(options(&exe)).with_stop_handler(handler.clone());
    let info = supervisor.info().await.unwrap();

    assert_eq!(supervisor.request_stop().await.unwrap(), TaskState::Completed);
    assert_eq!(handler.0.load(Ordering::SeqCst), 1);
    assert!(info.process.try_wait().await.unwrap().is_none());

    info.process.kill().await.unwrap();
}

/// Declared participants are launched at startup and terminated at shutdown
#[tokio::test]
async fn test_hub_participants_lifecycle() {
    let dir = TempDir::new().unwrap();
    let exe = fake_runtime(&dir, ANNOUNCING);
    let config = HubConfig::builder()
        .handshake_timeout(Duration::from_secs(5))
        .participant(ParticipantConfig {
            id: "worker-1".into(),
            executable: exe,
            java_options: vec!["-Xss4m".into()],
            arguments: Vec::new(),
            autorun: false,
        })
        .build()
        .unwrap();
    let hub = HubController::new(HubContext::local(config));

    assert_eq!(hub.ensure_running().await, TaskState::Completed);
    let info = hub
        .context()
        .participants
        .get("worker-1")
        .map(|entry| entry.value().clone())
        .expect("participant registered");
    assert_eq!(info.address.port(), 51000);

    assert_eq!(hub.ensure_stopped().await, TaskState::Completed);
    assert!(hub.context().participants.is_empty());
    assert!(info.process.try_wait().await.unwrap().is_some());
}

/// A participant that never announces is skipped; the hub still starts
#[tokio::test]
async fn test_silent_participant_is_not_fatal() {
    let dir = TempDir::new().unwrap();
    let exe = fake_runtime(&dir, "sleep 30");
    let config = HubConfig::builder()
        .handshake_timeout(Duration::from_millis(300))
        .participant(ParticipantConfig {
            id: "silent".into(),
            executable: exe,
            java_options: Vec::new(),
            arguments: Vec::new(),
            autorun: true,
        })
        .build()
        .unwrap();
    let hub = HubController::new(HubContext::local(config));

    assert_eq!(hub.ensure_running().await, TaskState::Completed);
    assert!(hub.context().participants.is_empty());
    hub.ensure_stopped().await;
}
