use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStderr, ChildStdout},
    sync::RwLock,
    time::timeout,
};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

use crate::{
    auth::{AuthCoordinator, auth_coordinator},
    command::{self, STOP_COMMAND},
    config::ServerConfig,
    error::ConfigError,
    instance::{InstanceStats, Listeners, ServerInstance, ServerStatus},
    parser, platform,
};

/// Ceiling for a cooperative stop before termination is forced.
const GRACEFUL_STOP_WINDOW: Duration = Duration::from_secs(30);

/// Additional ceiling after forced termination before giving up.
const FORCED_STOP_WINDOW: Duration = Duration::from_secs(10);

/// Compressed graceful ceiling used by `dispose`.
const DISPOSE_STOP_WINDOW: Duration = Duration::from_secs(5);

/// Owns the registry of server instances keyed by profile id, enforces port
/// uniqueness across running instances, and routes every console line through
/// the classifier to update player state and feed the auth coordinator.
pub struct Supervisor {
    instances: RwLock<HashMap<String, Arc<ServerInstance>>>,
    auth: Arc<AuthCoordinator>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::with_auth(auth_coordinator())
    }

    pub fn with_auth(auth: Arc<AuthCoordinator>) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            auth,
        }
    }

    pub fn auth(&self) -> Arc<AuthCoordinator> {
        self.auth.clone()
    }

    /// Launches the profile's server process. Returns false without side
    /// effects when the profile is already running or another running profile
    /// is bound to the same port; otherwise returns true once the process has
    /// been launched (readiness is reported later through the status
    /// listener).
    pub async fn start(&self, profile_id: &str, config: ServerConfig, listeners: Listeners) -> bool {
        let instance = {
            let mut registry = self.instances.write().await;

            if let Some(existing) = registry.get(profile_id) {
                if existing.is_running().await {
                    warn!(profile = %profile_id, "Start rejected: already running");
                    listeners.log(&format!("Server '{profile_id}' is already running"));
                    return false;
                }
            }
            for (id, other) in registry.iter() {
                if id != profile_id
                    && other.is_running().await
                    && other.config().port == config.port
                {
                    warn!(profile = %profile_id, port = config.port, "Start rejected: port in use by '{id}'");
                    listeners.log(&format!(
                        "Port {} is already in use by server '{id}'",
                        config.port
                    ));
                    return false;
                }
            }

            let instance = Arc::new(ServerInstance::new(profile_id, config));
            registry.insert(profile_id.to_string(), instance.clone());
            // claim the slot before the registry lock drops, so a racing
            // start call sees this profile as active
            instance
                .transition_if(&[ServerStatus::Stopped], ServerStatus::Starting, &listeners)
                .await;
            instance
        };

        listeners.log(&format!("Starting server '{profile_id}'"));

        let (child, stdout, stderr) = match instance.spawn_process().await {
            Ok(spawned) => spawned,
            Err(e) => {
                error!(profile = %profile_id, "Spawn failed: {e}");
                listeners.log(&format!("Failed to start server '{profile_id}': {e}"));
                instance
                    .transition_if(&[ServerStatus::Starting], ServerStatus::Error, &listeners)
                    .await;
                return false;
            }
        };

        self.spawn_reader(instance.clone(), stdout, stderr, listeners.clone());
        spawn_waiter(instance, child, listeners);
        true
    }

    /// Cooperative stop with escalation. Not safe to call concurrently for
    /// the same profile id; callers are the single writer per instance.
    pub async fn stop(&self, profile_id: &str, listeners: Listeners) -> bool {
        let Some(instance) = self.instances.read().await.get(profile_id).cloned() else {
            return false;
        };
        if !instance.is_running().await {
            return false;
        }
        stop_instance(instance, listeners, GRACEFUL_STOP_WINDOW).await
    }

    /// Stops every running instance and waits for all of them to reach
    /// `Stopped`.
    pub async fn stop_all(&self, listeners: Listeners) {
        let running = {
            let registry = self.instances.read().await;
            let mut running = Vec::new();
            for instance in registry.values() {
                if instance.is_running().await {
                    running.push(instance.clone());
                }
            }
            running
        };

        let mut handles = Vec::new();
        for instance in running {
            let listeners = listeners.clone();
            handles.push(tokio::spawn(stop_instance(
                instance,
                listeners,
                GRACEFUL_STOP_WINDOW,
            )));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub async fn send_command(&self, profile_id: &str, text: &str) -> bool {
        let Some(instance) = self.instances.read().await.get(profile_id).cloned() else {
            return false;
        };
        if !instance.is_running().await {
            return false;
        }
        command::send(&instance, text).await
    }

    pub async fn status(&self, profile_id: &str) -> Option<ServerStatus> {
        let instance = self.instances.read().await.get(profile_id).cloned()?;
        Some(instance.status().await)
    }

    pub async fn is_running(&self, profile_id: &str) -> bool {
        match self.instances.read().await.get(profile_id).cloned() {
            Some(instance) => instance.is_running().await,
            None => false,
        }
    }

    pub async fn player_count(&self, profile_id: &str) -> usize {
        match self.instances.read().await.get(profile_id).cloned() {
            Some(instance) => instance.player_count().await,
            None => 0,
        }
    }

    pub async fn players(&self, profile_id: &str) -> Vec<String> {
        match self.instances.read().await.get(profile_id).cloned() {
            Some(instance) => instance.players().await,
            None => Vec::new(),
        }
    }

    pub async fn uptime(&self, profile_id: &str) -> Option<Duration> {
        let instance = self.instances.read().await.get(profile_id).cloned()?;
        instance.uptime().await
    }

    pub async fn stats(&self, profile_id: &str) -> Option<InstanceStats> {
        let instance = self.instances.read().await.get(profile_id).cloned()?;
        Some(InstanceStats {
            profile_id: instance.profile_id().to_string(),
            status: instance.status().await,
            port: instance.config().port,
            player_count: instance.player_count().await,
            players: instance.players().await,
            uptime_secs: instance.uptime().await.map(|uptime| uptime.as_secs()),
        })
    }

    pub async fn subscribe_console(&self, profile_id: &str) -> Option<BroadcastStream<String>> {
        let instance = self.instances.read().await.get(profile_id).cloned()?;
        Some(instance.subscribe_console())
    }

    /// Checks that the profile's server directory holds the files a launch
    /// needs, before anything is spawned.
    pub async fn validate_server_files(&self, config: &ServerConfig) -> Result<(), ConfigError> {
        platform::validate_server_files(&config.server_dir).await
    }

    /// Unregisters a profile. Refused while the instance is running.
    pub async fn remove_server(&self, profile_id: &str) -> bool {
        let mut registry = self.instances.write().await;
        match registry.get(profile_id) {
            Some(instance) if !instance.is_running().await => {
                instance.shutdown.cancel();
                registry.remove(profile_id);
                true
            }
            _ => false,
        }
    }

    /// Best-effort stop of every registered instance with a compressed
    /// graceful window, then releases all background tasks. Idempotent.
    pub async fn dispose(&self) {
        let all: Vec<Arc<ServerInstance>> =
            self.instances.read().await.values().cloned().collect();

        let mut handles = Vec::new();
        for instance in all.iter() {
            if instance.is_running().await {
                handles.push(tokio::spawn(stop_instance(
                    instance.clone(),
                    Listeners::none(),
                    DISPOSE_STOP_WINDOW,
                )));
            }
        }
        for handle in handles {
            let _ = handle.await;
        }

        for instance in all {
            instance.shutdown.cancel();
        }
    }

    /// Merges the child's stdout and stderr into one line-ordered routing
    /// path; the single reader preserves emission order per stream.
    fn spawn_reader(
        &self,
        instance: Arc<ServerInstance>,
        stdout: ChildStdout,
        stderr: ChildStderr,
        listeners: Listeners,
    ) {
        let auth = self.auth.clone();
        let shutdown = instance.shutdown.clone();
        tokio::spawn(async move {
            let mut out_lines = BufReader::new(stdout).lines();
            let mut err_lines = BufReader::new(stderr).lines();
            let mut out_open = true;
            let mut err_open = true;

            while out_open || err_open {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    line = out_lines.next_line(), if out_open => match line {
                        Ok(Some(line)) => route_line(&auth, &instance, &line, &listeners).await,
                        Ok(None) => out_open = false,
                        Err(e) => {
                            report_stream_error(&instance, &e, &listeners).await;
                            out_open = false;
                        }
                    },
                    line = err_lines.next_line(), if err_open => match line {
                        Ok(Some(line)) => route_line(&auth, &instance, &line, &listeners).await,
                        Ok(None) => err_open = false,
                        Err(e) => {
                            report_stream_error(&instance, &e, &listeners).await;
                            err_open = false;
                        }
                    },
                }
            }
            debug!(profile = %instance.profile_id(), "Log reader finished");
        });
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Classifies and applies one console line: auth patterns first (first match
/// wins within the auth set), then the boot marker, then join/leave patterns
/// with idempotent player-set semantics.
async fn route_line(
    auth: &Arc<AuthCoordinator>,
    instance: &Arc<ServerInstance>,
    line: &str,
    listeners: &Listeners,
) {
    instance.broadcast_console(line);
    listeners.log(line);

    auth.parse_server_log_line(line, instance).await;

    if parser::is_boot_ready(line)
        && instance
            .transition_if(&[ServerStatus::Starting], ServerStatus::Running, listeners)
            .await
    {
        info!(profile = %instance.profile_id(), "Server is ready");
    }

    if let Some(name) = parser::extract_join(line) {
        if instance.player_joined(&name).await {
            debug!(profile = %instance.profile_id(), player = %name, "Player joined");
        }
    } else if let Some(name) = parser::extract_leave(line) {
        if instance.player_left(&name).await {
            debug!(profile = %instance.profile_id(), player = %name, "Player left");
        }
    }
}

/// A read error is expected once the process is gone; while the instance
/// still counts as running it is surfaced as a log line, but the exit waiter
/// stays authoritative for terminal transitions.
async fn report_stream_error(instance: &Arc<ServerInstance>, err: &std::io::Error, listeners: &Listeners) {
    if instance.is_running().await {
        warn!(profile = %instance.profile_id(), "Log stream error: {err}");
        listeners.log(&format!(
            "Log stream error on '{}': {err}",
            instance.profile_id()
        ));
    }
}

/// Exit waiter: single owner of the child handle. Waits for the process to
/// finish, or terminates it when the kill token fires, then performs the
/// terminal status transition and clears runtime state.
fn spawn_waiter(instance: Arc<ServerInstance>, mut child: Child, listeners: Listeners) {
    let kill = instance.kill_requested();
    tokio::spawn(async move {
        let outcome = tokio::select! {
            status = child.wait() => status,
            _ = kill.cancelled() => {
                if let Err(e) = child.kill().await {
                    error!(profile = %instance.profile_id(), "Failed to terminate process: {e}");
                    listeners.log(&format!(
                        "Failed to terminate server '{}': {e}",
                        instance.profile_id()
                    ));
                }
                child.wait().await
            }
        };

        match outcome {
            Ok(status) => {
                info!(profile = %instance.profile_id(), %status, "Server process exited");
                listeners.log(&format!(
                    "Server '{}' exited with {status}",
                    instance.profile_id()
                ));
                instance
                    .transition_if(
                        &[ServerStatus::Starting, ServerStatus::Running, ServerStatus::Stopping],
                        ServerStatus::Stopped,
                        &listeners,
                    )
                    .await;
            }
            Err(e) => {
                error!(profile = %instance.profile_id(), "Waiting on the server process failed: {e}");
                listeners.log(&format!(
                    "Waiting on server '{}' failed: {e}",
                    instance.profile_id()
                ));
                instance
                    .transition_if(
                        &[ServerStatus::Starting, ServerStatus::Running],
                        ServerStatus::Error,
                        &listeners,
                    )
                    .await;
                // a stop in flight still ends in Stopped
                instance
                    .transition_if(&[ServerStatus::Stopping], ServerStatus::Stopped, &listeners)
                    .await;
            }
        }

        instance.clear_runtime_state().await;
        instance.mark_exited();
    });
}

async fn stop_instance(
    instance: Arc<ServerInstance>,
    listeners: Listeners,
    graceful: Duration,
) -> bool {
    if !instance
        .transition_if(
            &[ServerStatus::Starting, ServerStatus::Running],
            ServerStatus::Stopping,
            &listeners,
        )
        .await
    {
        return false;
    }
    listeners.log(&format!("Stopping server '{}'", instance.profile_id()));
    command::send(&instance, STOP_COMMAND).await;

    let mut exited = instance.exited();
    let already_exited = *exited.borrow_and_update();
    if !already_exited && timeout(graceful, exited.changed()).await.is_err() {
        warn!(profile = %instance.profile_id(), "Graceful stop window elapsed; terminating");
        listeners.log(&format!(
            "Server '{}' ignored the stop request; terminating",
            instance.profile_id()
        ));
        instance.request_kill();

        if timeout(FORCED_STOP_WINDOW, exited.changed()).await.is_err() {
            error!(profile = %instance.profile_id(), "Server survived forced termination");
            listeners.log(&format!(
                "Server '{}' could not be terminated; marking it stopped",
                instance.profile_id()
            ));
            // do not leak a stuck record
            instance
                .transition_if(&[ServerStatus::Stopping], ServerStatus::Stopped, &listeners)
                .await;
            instance.clear_runtime_state().await;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::platform::{LogNotifier, LogOnlyBrowser};

    use super::*;

    fn quiet_auth() -> Arc<AuthCoordinator> {
        Arc::new(AuthCoordinator::new(
            Arc::new(LogOnlyBrowser),
            Arc::new(LogNotifier),
        ))
    }

    fn test_config() -> ServerConfig {
        ServerConfig::new(PathBuf::from("."), PathBuf::from("java"))
    }

    #[tokio::test]
    async fn route_line_player_tracking_is_idempotent() {
        let auth = quiet_auth();
        let instance = Arc::new(ServerInstance::new("dev", test_config()));
        let listeners = Listeners::none();

        let join = "[12:00:05] [Server thread/INFO]: Nova_7 joined the game";
        route_line(&auth, &instance, join, &listeners).await;
        route_line(&auth, &instance, join, &listeners).await;
        assert_eq!(instance.player_count().await, 1);

        let stranger_leave = "[12:00:06] [Server thread/INFO]: Stranger left the game";
        route_line(&auth, &instance, stranger_leave, &listeners).await;
        assert_eq!(instance.player_count().await, 1);

        let leave = "[12:00:07] [Server thread/INFO]: Nova_7 left the game";
        route_line(&auth, &instance, leave, &listeners).await;
        assert_eq!(instance.player_count().await, 0);
        assert!(instance.players().await.is_empty());
    }

    #[tokio::test]
    async fn route_line_boot_marker_promotes_only_starting_instances() {
        let auth = quiet_auth();
        let instance = Arc::new(ServerInstance::new("dev", test_config()));
        let boot = "[12:00:01] [Server thread/INFO] [HytaleServer]: Hytale Server Booted!";

        // boot text against a stopped record is ignored
        route_line(&auth, &instance, boot, &Listeners::none()).await;
        assert_eq!(instance.status().await, ServerStatus::Stopped);

        instance
            .transition_if(&[ServerStatus::Stopped], ServerStatus::Starting, &Listeners::none())
            .await;
        route_line(&auth, &instance, boot, &Listeners::none()).await;
        assert_eq!(instance.status().await, ServerStatus::Running);
    }

    #[tokio::test]
    async fn start_with_broken_runtime_marks_error() {
        let supervisor = Supervisor::with_auth(quiet_auth());
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::new(
            dir.path().to_path_buf(),
            PathBuf::from("/definitely/not/a/runtime"),
        );

        assert!(!supervisor.start("dev", config, Listeners::none()).await);
        assert_eq!(supervisor.status("dev").await, Some(ServerStatus::Error));
        assert!(!supervisor.is_running("dev").await);
    }

    #[tokio::test]
    async fn send_command_to_unknown_profile_is_rejected() {
        let supervisor = Supervisor::with_auth(quiet_auth());
        assert!(!supervisor.send_command("ghost", "stop").await);
        assert!(!supervisor.stop("ghost", Listeners::none()).await);
        assert_eq!(supervisor.status("ghost").await, None);
    }

    #[tokio::test]
    async fn remove_server_only_when_not_running() {
        let supervisor = Supervisor::with_auth(quiet_auth());
        assert!(!supervisor.remove_server("ghost").await);

        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::new(
            dir.path().to_path_buf(),
            PathBuf::from("/definitely/not/a/runtime"),
        );
        supervisor.start("dev", config, Listeners::none()).await;
        assert!(supervisor.remove_server("dev").await);
        assert_eq!(supervisor.status("dev").await, None);
    }
}
