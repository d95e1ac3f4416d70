//! Supervisor lifecycle tests using shell one-liners as stand-in workers.

#![cfg(unix)]
#![allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use vigil_core::config::{Config, ConfigStore};
use vigil_core::control::RelayAddress;

use super::{
    NotifyExhaustedPolicy, Supervisor, SupervisorCommand, SupervisorConfig, SupervisorError,
};
use crate::link::LinkEvent;

/// Write an executable stand-in worker script.
fn write_worker(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("worker.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn write_store(dir: &Path) -> ConfigStore {
    let path = dir.join("vigil.json");
    std::fs::write(
        &path,
        r##"{"server": "irc.example.net", "channels": ["#ops"], "widget": {"limit": 3}}"##,
    )
    .unwrap();
    ConfigStore::new(path)
}

struct Harness {
    link_tx: mpsc::Sender<LinkEvent>,
    cmd_tx: mpsc::Sender<SupervisorCommand>,
    handle: JoinHandle<Result<(), SupervisorError>>,
}

fn fast_config(worker_bin: PathBuf) -> SupervisorConfig {
    SupervisorConfig {
        worker_bin,
        respawn_delay: Duration::from_millis(150),
        notify_interval: Duration::from_millis(20),
        notify_max_attempts: 3,
        on_notify_exhausted: NotifyExhaustedPolicy::Respawn,
    }
}

fn start(config: SupervisorConfig, store: ConfigStore) -> Harness {
    let bot_config: Config = store.load().unwrap();
    let (link_tx, link_rx) = mpsc::channel(16);
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let supervisor = Supervisor::new(
        config,
        store,
        bot_config,
        RelayAddress::Port(1),
        link_rx,
        cmd_rx,
    );
    let handle = tokio::spawn(supervisor.run());
    Harness {
        link_tx,
        cmd_tx,
        handle,
    }
}

/// Poll until `check` passes or the deadline expires.
async fn wait_for(deadline: Duration, check: impl Fn() -> bool) -> bool {
    let end = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < end {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    check()
}

fn line_count(path: &Path) -> usize {
    std::fs::read_to_string(path).map_or(0, |s| s.lines().count())
}

#[tokio::test]
async fn clean_exit_does_not_respawn() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("spawns");
    let worker = write_worker(
        dir.path(),
        &format!("echo spawned >> {}\nexit 0", marker.display()),
    );
    let harness = start(fast_config(worker), write_store(dir.path()));

    assert!(wait_for(Duration::from_secs(2), || line_count(&marker) == 1).await);
    // Well past the respawn delay: still exactly one generation.
    sleep(Duration::from_millis(500)).await;
    assert_eq!(line_count(&marker), 1);
    harness.handle.abort();
}

#[tokio::test]
async fn crash_respawns_after_delay_with_fresh_init() {
    let dir = tempfile::tempdir().unwrap();
    let inits = dir.path().join("inits");
    // Record the init message each generation receives, then crash.
    let worker = write_worker(
        dir.path(),
        &format!("read line\necho \"$line\" >> {}\nexit 1", inits.display()),
    );
    let harness = start(fast_config(worker), write_store(dir.path()));

    assert!(wait_for(Duration::from_secs(5), || line_count(&inits) >= 2).await);

    let content = std::fs::read_to_string(&inits).unwrap();
    let mut relays = Vec::new();
    for line in content.lines().take(2) {
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(value["init"], serde_json::json!(true));
        assert_eq!(value["config"]["server"], serde_json::json!("irc.example.net"));
        relays.push(value["relay"].clone());
    }
    // The relay address never changes across generations.
    assert_eq!(relays[0], relays[1]);
    harness.handle.abort();
}

#[tokio::test]
async fn crash_respawn_waits_for_the_delay() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("spawns");
    let worker = write_worker(
        dir.path(),
        &format!("echo spawned >> {}\nexit 1", marker.display()),
    );
    let mut config = fast_config(worker);
    config.respawn_delay = Duration::from_millis(400);
    let harness = start(config, write_store(dir.path()));

    assert!(wait_for(Duration::from_secs(2), || line_count(&marker) == 1).await);
    // Shortly after the crash the respawn must not have happened yet.
    sleep(Duration::from_millis(150)).await;
    assert_eq!(line_count(&marker), 1);
    assert!(wait_for(Duration::from_secs(2), || line_count(&marker) >= 2).await);
    harness.handle.abort();
}

#[tokio::test]
async fn operator_reload_replaces_the_generation() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("spawns");
    let worker = write_worker(
        dir.path(),
        &format!("echo spawned >> {}\nsleep 30", marker.display()),
    );
    let harness = start(fast_config(worker), write_store(dir.path()));

    assert!(wait_for(Duration::from_secs(2), || line_count(&marker) == 1).await);
    harness.cmd_tx.send(SupervisorCommand::Reload).await.unwrap();
    assert!(wait_for(Duration::from_secs(2), || line_count(&marker) == 2).await);
    harness.handle.abort();
}

#[tokio::test]
async fn worker_reload_message_replaces_the_generation() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("spawns");
    let worker = write_worker(
        dir.path(),
        &format!(
            "echo spawned >> {}\necho '{{\"ready\":true}}'\necho '{{\"reload\":true}}'\nsleep 30",
            marker.display()
        ),
    );
    let harness = start(fast_config(worker), write_store(dir.path()));

    assert!(wait_for(Duration::from_secs(2), || line_count(&marker) >= 2).await);
    harness.handle.abort();
}

#[tokio::test]
async fn save_request_reaches_the_store_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let store = write_store(dir.path());
    let saved = r##"{"server":"changed.example.net","channels":["#new"],"widget":{"limit":9}}"##;
    let worker = write_worker(
        dir.path(),
        &format!("echo '{{\"save\":{saved}}}'\nsleep 30"),
    );
    let store_path = store.path().to_path_buf();
    let harness = start(fast_config(worker), store);

    assert!(
        wait_for(Duration::from_secs(2), || {
            std::fs::read_to_string(&store_path)
                .ok()
                .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
                .is_some_and(|v| v["server"] == serde_json::json!("changed.example.net"))
        })
        .await
    );

    let value: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&store_path).unwrap()).unwrap();
    assert_eq!(value["channels"], serde_json::json!(["#new"]));
    assert_eq!(value["widget"]["limit"], serde_json::json!(9));
    harness.handle.abort();
}

#[tokio::test]
async fn link_connect_notifies_the_worker() {
    let dir = tempfile::tempdir().unwrap();
    let received = dir.path().join("received");
    let worker = write_worker(
        dir.path(),
        &format!(
            "echo '{{\"ready\":true}}'\nwhile read line; do echo \"$line\" >> {}; done",
            received.display()
        ),
    );
    let harness = start(fast_config(worker), write_store(dir.path()));

    sleep(Duration::from_millis(100)).await;
    harness.link_tx.send(LinkEvent::Connected).await.unwrap();

    assert!(
        wait_for(Duration::from_secs(2), || {
            std::fs::read_to_string(&received)
                .is_ok_and(|s| s.lines().any(|l| l == r#"{"connection":true}"#))
        })
        .await
    );
    harness.handle.abort();
}

#[tokio::test]
async fn notify_exhaustion_respawns_under_default_policy() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("spawns");
    // Exits cleanly, so no crash-respawn: only notify exhaustion can
    // produce a second generation.
    let worker = write_worker(
        dir.path(),
        &format!("echo spawned >> {}\nexit 0", marker.display()),
    );
    let harness = start(fast_config(worker), write_store(dir.path()));

    assert!(wait_for(Duration::from_secs(2), || line_count(&marker) == 1).await);
    sleep(Duration::from_millis(200)).await;
    harness.link_tx.send(LinkEvent::Connected).await.unwrap();

    assert!(wait_for(Duration::from_secs(3), || line_count(&marker) >= 2).await);
    harness.handle.abort();
}

#[tokio::test]
async fn notify_exhaustion_is_fatal_under_fatal_policy() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("spawns");
    let worker = write_worker(
        dir.path(),
        &format!("echo spawned >> {}\nexit 0", marker.display()),
    );
    let mut config = fast_config(worker);
    config.on_notify_exhausted = NotifyExhaustedPolicy::Fatal;
    let harness = start(config, write_store(dir.path()));

    assert!(wait_for(Duration::from_secs(2), || line_count(&marker) == 1).await);
    sleep(Duration::from_millis(200)).await;
    harness.link_tx.send(LinkEvent::Connected).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(3), harness.handle)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        result,
        Err(SupervisorError::NotifyExhausted { attempts: 3 })
    ));
}
