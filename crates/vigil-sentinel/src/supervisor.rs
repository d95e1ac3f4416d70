//! Worker process lifecycle supervisor.
//!
//! Keeps exactly one worker generation alive, synchronized with link
//! connectivity, and supports hot reload. The control channel is NDJSON
//! over the worker's piped stdin/stdout, distinct from the relay data
//! channel; worker stderr is inherited so worker logs land next to ours.
//!
//! Per-generation state machine: Spawning -> (worker signals ready) ->
//! awaiting link connect -> (link reports connect) -> notifying worker
//! (bounded retries) -> Operational -> exit or reload -> next generation.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use vigil_core::config::{Config, ConfigStore};
use vigil_core::control::{RelayAddress, SentinelMessage, WorkerMessage};

use crate::link::LinkEvent;

/// Delay before respawning a crashed worker.
const DEFAULT_RESPAWN_DELAY: Duration = Duration::from_secs(2);

/// Spacing between connection-notification retries.
const DEFAULT_NOTIFY_INTERVAL: Duration = Duration::from_millis(500);

/// Bounded retry count for the connection notification.
const DEFAULT_NOTIFY_MAX_ATTEMPTS: u32 = 10;

/// What to do when the connection-notification retries are exhausted.
///
/// Two behavioral variants exist in the wild; the policy is an explicit
/// configuration choice rather than a hard-coded behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotifyExhaustedPolicy {
    /// Force a fresh worker generation (the defensive default).
    #[default]
    Respawn,
    /// Treat an unreachable worker as unrecoverable and stop the sentinel.
    Fatal,
}

/// Supervisor timing and policy knobs.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Worker executable to spawn each generation.
    pub worker_bin: PathBuf,
    pub respawn_delay: Duration,
    pub notify_interval: Duration,
    pub notify_max_attempts: u32,
    pub on_notify_exhausted: NotifyExhaustedPolicy,
}

impl SupervisorConfig {
    pub fn new(worker_bin: PathBuf) -> Self {
        Self {
            worker_bin,
            respawn_delay: DEFAULT_RESPAWN_DELAY,
            notify_interval: DEFAULT_NOTIFY_INTERVAL,
            notify_max_attempts: DEFAULT_NOTIFY_MAX_ATTEMPTS,
            on_notify_exhausted: NotifyExhaustedPolicy::default(),
        }
    }
}

/// Commands from the composition root (operator signals).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorCommand {
    Reload,
}

/// Worker generation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Spawning,
    Ready,
    Operational,
    /// Exited cleanly; kept around only so a later notify cannot target it.
    Dead,
}

/// Errors that stop the supervisor (and with it the sentinel).
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Worker unreachable after {attempts} connection notifications")]
    NotifyExhausted { attempts: u32 },

    #[error(transparent)]
    Encode(#[from] vigil_core::Error),
}

/// Handle to the single live worker generation.
struct WorkerHandle {
    generation: Uuid,
    child: Child,
    status: WorkerStatus,
    /// Control lines towards the worker's stdin.
    control_tx: mpsc::Sender<String>,
}

struct NotifyState {
    attempts: u32,
    next_at: Instant,
}

/// The worker supervisor task.
pub struct Supervisor {
    config: SupervisorConfig,
    store: ConfigStore,
    /// The single authoritative config copy; crosses to workers by value.
    bot_config: Config,
    relay_address: RelayAddress,
    link_events: mpsc::Receiver<LinkEvent>,
    commands: mpsc::Receiver<SupervisorCommand>,
    worker_msgs_tx: mpsc::Sender<(Uuid, WorkerMessage)>,
    worker_msgs_rx: mpsc::Receiver<(Uuid, WorkerMessage)>,
    worker: Option<WorkerHandle>,
    link_connected: bool,
    notify: Option<NotifyState>,
    respawn_at: Option<Instant>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        store: ConfigStore,
        bot_config: Config,
        relay_address: RelayAddress,
        link_events: mpsc::Receiver<LinkEvent>,
        commands: mpsc::Receiver<SupervisorCommand>,
    ) -> Self {
        let (worker_msgs_tx, worker_msgs_rx) = mpsc::channel(64);
        Self {
            config,
            store,
            bot_config,
            relay_address,
            link_events,
            commands,
            worker_msgs_tx,
            worker_msgs_rx,
            worker: None,
            link_connected: false,
            notify: None,
            respawn_at: None,
        }
    }

    /// Run the supervisor: spawn the first generation and react to link
    /// events, worker messages, worker exits and operator commands.
    ///
    /// Returns `Err` only for conditions the sentinel cannot recover from
    /// (spawn failure, notify exhaustion under the `Fatal` policy).
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        self.spawn_worker()?;

        loop {
            tokio::select! {
                event = self.link_events.recv() => match event {
                    Some(LinkEvent::Connected) => {
                        debug!("Link connected, starting worker notification");
                        self.link_connected = true;
                        self.begin_notify();
                    }
                    None => {
                        debug!("Link task gone, supervisor stopping");
                        return Ok(());
                    }
                },
                command = self.commands.recv() => match command {
                    Some(SupervisorCommand::Reload) => {
                        info!("Reload requested by operator");
                        self.reload().await?;
                    }
                    None => {
                        debug!("Command source gone, supervisor stopping");
                        return Ok(());
                    }
                },
                msg = self.worker_msgs_rx.recv() => {
                    // A sender half lives in `self`, so this never yields None.
                    if let Some((generation, msg)) = msg {
                        self.handle_worker_message(generation, msg).await?;
                    }
                },
                exited = wait_exit(self.worker.as_mut()),
                    if self.worker.as_ref().is_some_and(|w| w.status != WorkerStatus::Dead) =>
                {
                    self.handle_worker_exit(&exited);
                },
                () = sleep_until(self.respawn_at.unwrap_or_else(far_future)),
                    if self.respawn_at.is_some() =>
                {
                    self.respawn_at = None;
                    info!("Respawning worker");
                    self.reload().await?;
                },
                () = sleep_until(self.notify.as_ref().map_or_else(far_future, |n| n.next_at)),
                    if self.notify.is_some() =>
                {
                    self.attempt_notify().await?;
                },
            }
        }
    }

    fn handle_worker_exit(&mut self, result: &std::io::Result<std::process::ExitStatus>) {
        let Some(handle) = self.worker.as_mut() else {
            return;
        };
        match result {
            Ok(status) if status.success() => {
                info!(
                    generation = %handle.generation,
                    "Worker exited cleanly, not respawning"
                );
                handle.status = WorkerStatus::Dead;
            }
            Ok(status) => {
                warn!(
                    generation = %handle.generation,
                    code = status.code(),
                    delay_ms = self.config.respawn_delay.as_millis(),
                    "Worker died, scheduling respawn"
                );
                self.worker = None;
                self.respawn_at = Some(Instant::now() + self.config.respawn_delay);
            }
            Err(e) => {
                warn!(error = %e, "Failed to await worker, scheduling respawn");
                self.worker = None;
                self.respawn_at = Some(Instant::now() + self.config.respawn_delay);
            }
        }
    }

    async fn handle_worker_message(
        &mut self,
        generation: Uuid,
        msg: WorkerMessage,
    ) -> Result<(), SupervisorError> {
        if self.worker.as_ref().map(|w| w.generation) != Some(generation) {
            debug!(%generation, ?msg, "Message from stale worker generation, ignoring");
            return Ok(());
        }
        match msg {
            WorkerMessage::Ready => {
                info!(%generation, "Worker ready");
                if let Some(handle) = self.worker.as_mut() {
                    handle.status = WorkerStatus::Ready;
                }
                // The link may have connected before this generation came
                // up; resume the handshake for it.
                if self.link_connected && self.notify.is_none() {
                    self.begin_notify();
                }
            }
            WorkerMessage::Reload => {
                info!(%generation, "Worker requested reload");
                self.reload().await?;
            }
            WorkerMessage::Save(config) => {
                info!(%generation, "Worker requested config save");
                if let Err(e) = self.store.save(&config) {
                    warn!(error = %e, "Failed to save configuration");
                }
            }
        }
        Ok(())
    }

    fn begin_notify(&mut self) {
        self.notify = Some(NotifyState {
            attempts: 0,
            next_at: Instant::now(),
        });
    }

    /// One connection-notification attempt against the current worker.
    async fn attempt_notify(&mut self) -> Result<(), SupervisorError> {
        if self.notify.is_none() {
            return Ok(());
        }
        let line = SentinelMessage::Connection.to_line()?;
        let sent = match &self.worker {
            Some(handle) if handle.status != WorkerStatus::Dead => {
                handle.control_tx.send(line).await.is_ok()
            }
            _ => false,
        };

        if sent {
            if let Some(handle) = self.worker.as_mut() {
                debug!(generation = %handle.generation, "Worker notified of connection");
                handle.status = WorkerStatus::Operational;
            }
            self.notify = None;
            return Ok(());
        }

        let Some(state) = self.notify.as_mut() else {
            return Ok(());
        };
        state.attempts += 1;
        if state.attempts < self.config.notify_max_attempts {
            warn!(attempt = state.attempts, "Failed to notify worker, retrying");
            state.next_at = Instant::now() + self.config.notify_interval;
            return Ok(());
        }

        let attempts = state.attempts;
        self.notify = None;
        warn!(attempts, "Worker unreachable, notification retries exhausted");
        match self.config.on_notify_exhausted {
            NotifyExhaustedPolicy::Respawn => {
                warn!("Forcing worker respawn");
                self.reload().await
            }
            NotifyExhaustedPolicy::Fatal => Err(SupervisorError::NotifyExhausted { attempts }),
        }
    }

    /// Tear down the current generation and start the next one.
    ///
    /// Config is re-read best-effort: a load failure keeps the previous
    /// in-memory copy. Teardown is abrupt; the relay re-accepts afterwards.
    async fn reload(&mut self) -> Result<(), SupervisorError> {
        match self.store.load() {
            Ok(config) => self.bot_config = config,
            Err(e) => warn!(error = %e, "Failed to reload configuration, keeping previous"),
        }

        self.notify = None;
        self.respawn_at = None;

        if let Some(mut handle) = self.worker.take() {
            debug!(generation = %handle.generation, "Killing worker");
            if let Err(e) = handle.child.kill().await {
                warn!(error = %e, "Failed to kill worker");
            }
        }

        self.spawn_worker()
    }

    /// Spawn a fresh worker generation and send its init message.
    fn spawn_worker(&mut self) -> Result<(), SupervisorError> {
        let generation = Uuid::new_v4();
        info!(
            %generation,
            worker_bin = %self.config.worker_bin.display(),
            "Spawning worker"
        );

        let mut child = Command::new(&self.config.worker_bin)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Spawn(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SupervisorError::Spawn("Failed to capture stdin".to_string()))?;
        let (control_tx, mut control_rx) = mpsc::channel::<String>(32);

        // Stdin writer task: one control line per message.
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = control_rx.recv().await {
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    error!(error = %e, "Failed to write control message to worker");
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() || stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // Stdout reader task: NDJSON control lines from the worker, tagged
        // with the generation so stale messages can be ignored.
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::Spawn("Failed to capture stdout".to_string()))?;
        let msgs = self.worker_msgs_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match WorkerMessage::parse(&line) {
                    Ok(msg) => {
                        if msgs.send((generation, msg)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(%generation, error = %e, "Unparseable control line from worker");
                    }
                }
            }
            debug!(%generation, "Worker control channel closed");
        });

        // Init goes out immediately; the channel is fresh so this cannot
        // be full.
        let init = SentinelMessage::Init {
            config: Box::new(self.bot_config.clone()),
            relay: self.relay_address.clone(),
        }
        .to_line()?;
        if control_tx.try_send(init).is_err() {
            warn!(%generation, "Failed to queue init message");
        }

        self.worker = Some(WorkerHandle {
            generation,
            child,
            status: WorkerStatus::Spawning,
            control_tx,
        });
        Ok(())
    }
}

/// Await the current worker's exit, or never when there is none.
async fn wait_exit(
    worker: Option<&mut WorkerHandle>,
) -> std::io::Result<std::process::ExitStatus> {
    match worker {
        Some(handle) => handle.child.wait().await,
        None => std::future::pending().await,
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400)
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
