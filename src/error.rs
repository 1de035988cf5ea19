use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Invalid server root directory: {0}")]
    InvalidDirectory(String),

    #[error("Missing server archive: {0}")]
    MissingServerJar(String),
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Server is already running")]
    AlreadyRunning,

    #[error("Port {port} is already bound by profile '{profile}'")]
    PortInUse { port: u16, profile: String },

    #[error("Failed to spawn server process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Failed to access child stdout pipe")]
    NoStdoutPipe,

    #[error("Failed to access child stderr pipe")]
    NoStderrPipe,

    #[error("Failed to access child stdin pipe")]
    NoStdinPipe,
}
