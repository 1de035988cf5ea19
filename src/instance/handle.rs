use std::{collections::HashSet, process::Stdio, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{
    io::BufWriter,
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    sync::{Mutex, RwLock, broadcast, watch},
};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{config::ServerConfig, error::SpawnError};

use super::types::{Listeners, ServerStatus};

const CONSOLE_CHANNEL_CAPACITY: usize = 2048;

/// Runtime record for one server profile. Created fresh on each successful
/// start call; the supervisor's registry holds the only long-lived reference.
#[derive(Debug)]
pub struct ServerInstance {
    profile_id: String,
    config: ServerConfig,
    status: RwLock<ServerStatus>,
    start_time: RwLock<Option<DateTime<Utc>>>,
    players: RwLock<HashSet<String>>,
    stdin: RwLock<Option<Arc<Mutex<BufWriter<ChildStdin>>>>>,
    console_tx: broadcast::Sender<String>,
    pub(crate) shutdown: CancellationToken,
    kill_request: CancellationToken,
    exited_tx: watch::Sender<bool>,
    exited_rx: watch::Receiver<bool>,
}

impl ServerInstance {
    pub fn new<S: Into<String>>(profile_id: S, config: ServerConfig) -> Self {
        let (exited_tx, exited_rx) = watch::channel(false);
        Self {
            profile_id: profile_id.into(),
            config,
            status: RwLock::new(ServerStatus::Stopped),
            start_time: RwLock::new(None),
            players: RwLock::new(HashSet::new()),
            stdin: RwLock::new(None),
            console_tx: broadcast::Sender::new(CONSOLE_CHANNEL_CAPACITY),
            shutdown: CancellationToken::new(),
            kill_request: CancellationToken::new(),
            exited_tx,
            exited_rx,
        }
    }

    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn status(&self) -> ServerStatus {
        *self.status.read().await
    }

    pub async fn is_running(&self) -> bool {
        self.status.read().await.is_active()
    }

    pub async fn player_count(&self) -> usize {
        self.players.read().await.len()
    }

    pub async fn players(&self) -> Vec<String> {
        let mut players: Vec<String> = self.players.read().await.iter().cloned().collect();
        players.sort();
        players
    }

    pub async fn uptime(&self) -> Option<Duration> {
        let started = (*self.start_time.read().await)?;
        (Utc::now() - started).to_std().ok()
    }

    pub fn subscribe_console(&self) -> BroadcastStream<String> {
        BroadcastStream::new(self.console_tx.subscribe())
    }

    fn build_command(&self) -> Command {
        let mut command = Command::new(&self.config.runtime_path);
        command
            .args(self.config.build_args())
            .current_dir(&self.config.server_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Spawns the external process and takes ownership of its pipes. The
    /// returned child is handed to the exit-waiter task, which becomes its
    /// single owner.
    pub(crate) async fn spawn_process(&self) -> Result<(Child, ChildStdout, ChildStderr), SpawnError> {
        let mut child = self.build_command().spawn()?;
        let stdout = child.stdout.take().ok_or(SpawnError::NoStdoutPipe)?;
        let stderr = child.stderr.take().ok_or(SpawnError::NoStderrPipe)?;
        let stdin = child.stdin.take().ok_or(SpawnError::NoStdinPipe)?;

        *self.stdin.write().await = Some(Arc::new(Mutex::new(BufWriter::new(stdin))));
        *self.start_time.write().await = Some(Utc::now());
        Ok((child, stdout, stderr))
    }

    /// Moves status to `to` only when the current status is in `from`, under
    /// the instance's status lock, so reader and waiter transitions cannot
    /// interleave inconsistently. Listeners fire only on an actual change.
    pub(crate) async fn transition_if(
        &self,
        from: &[ServerStatus],
        to: ServerStatus,
        listeners: &Listeners,
    ) -> bool {
        let old = {
            let mut guard = self.status.write().await;
            if !from.contains(&*guard) || *guard == to {
                return false;
            }
            let old = *guard;
            *guard = to;
            old
        };
        debug!(profile = %self.profile_id, %old, new = %to, "status transition");
        listeners.status(to);
        true
    }

    pub(crate) fn broadcast_console(&self, line: &str) {
        let _ = self.console_tx.send(line.to_string());
    }

    /// Idempotent join: re-joining an already-present name is a no-op.
    pub(crate) async fn player_joined(&self, name: &str) -> bool {
        self.players.write().await.insert(name.to_string())
    }

    /// Idempotent leave: a name that never joined is a no-op.
    pub(crate) async fn player_left(&self, name: &str) -> bool {
        self.players.write().await.remove(name)
    }

    pub(crate) async fn stdin_handle(&self) -> Option<Arc<Mutex<BufWriter<ChildStdin>>>> {
        self.stdin.read().await.clone()
    }

    /// Clears player/start-time/stdin state on terminal transitions.
    pub(crate) async fn clear_runtime_state(&self) {
        self.players.write().await.clear();
        *self.start_time.write().await = None;
        *self.stdin.write().await = None;
    }

    pub(crate) fn exited(&self) -> watch::Receiver<bool> {
        self.exited_rx.clone()
    }

    pub(crate) fn mark_exited(&self) {
        let _ = self.exited_tx.send(true);
    }

    pub(crate) fn request_kill(&self) {
        self.kill_request.cancel();
    }

    pub(crate) fn kill_requested(&self) -> CancellationToken {
        self.kill_request.clone()
    }
}
