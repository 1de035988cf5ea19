use std::fmt::{self, Display};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl ServerStatus {
    /// Whether a process is expected to be alive in this state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ServerStatus::Starting | ServerStatus::Running | ServerStatus::Stopping
        )
    }
}

impl Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerStatus::Stopped => write!(f, "stopped"),
            ServerStatus::Starting => write!(f, "starting"),
            ServerStatus::Running => write!(f, "running"),
            ServerStatus::Stopping => write!(f, "stopping"),
            ServerStatus::Error => write!(f, "error"),
        }
    }
}

pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;
pub type StatusSink = Arc<dyn Fn(ServerStatus) + Send + Sync>;

/// Listener pair supplied fresh on each start/stop call. Invoked on every
/// observable transition; never stored beyond the tasks of that call.
#[derive(Clone, Default)]
pub struct Listeners {
    log: Option<LogSink>,
    status: Option<StatusSink>,
}

impl Listeners {
    pub fn new(log: LogSink, status: StatusSink) -> Self {
        Self {
            log: Some(log),
            status: Some(status),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn log(&self, line: &str) {
        if let Some(sink) = &self.log {
            sink(line);
        }
    }

    pub fn status(&self, status: ServerStatus) {
        if let Some(sink) = &self.status {
            sink(status);
        }
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("log", &self.log.is_some())
            .field("status", &self.status.is_some())
            .finish()
    }
}

/// Point-in-time snapshot of one supervised instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStats {
    pub profile_id: String,
    pub status: ServerStatus,
    pub port: u16,
    pub player_count: usize,
    pub players: Vec<String>,
    pub uptime_secs: Option<u64>,
}
