use std::{
    fmt::{self, Display},
    path::PathBuf,
};

use serde::{Deserialize, Serialize};

/// File name of the server archive expected in every server directory.
pub const SERVER_JAR: &str = "HytaleServer.jar";

/// Client asset bundle, passed to the server only when present next to the jar.
pub const ASSETS_BUNDLE: &str = "Assets.zip";

/// Address the server binds on.
pub const BIND_HOST: &str = "0.0.0.0";

pub const DEFAULT_MEMORY_MIN: &str = "2G";
pub const DEFAULT_MEMORY_MAX: &str = "4G";
pub const DEFAULT_PORT: u16 = 5520;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Authenticated,
    Offline,
}

impl AuthMode {
    pub fn flag_value(&self) -> &'static str {
        match self {
            AuthMode::Authenticated => "authenticated",
            AuthMode::Offline => "offline",
        }
    }
}

impl Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.flag_value())
    }
}

/// Launch configuration for one server profile. Immutable once handed to the
/// supervisor; a new start call takes a fresh copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server_dir: PathBuf,
    pub runtime_path: PathBuf,
    pub memory_min: String,
    pub memory_max: String,
    pub port: u16,
    pub auth_mode: AuthMode,
    pub allow_op: bool,
    pub accept_early_plugins: bool,
    pub runtime_args: Vec<String>,
    pub server_args: Vec<String>,
}

impl ServerConfig {
    pub fn new(server_dir: PathBuf, runtime_path: PathBuf) -> Self {
        Self {
            server_dir,
            runtime_path,
            memory_min: DEFAULT_MEMORY_MIN.to_string(),
            memory_max: DEFAULT_MEMORY_MAX.to_string(),
            port: DEFAULT_PORT,
            auth_mode: AuthMode::Authenticated,
            allow_op: false,
            accept_early_plugins: false,
            runtime_args: Vec::new(),
            server_args: Vec::new(),
        }
    }

    /// Argument vector in the order the Hytale runtime expects: heap flags,
    /// extra runtime flags, jar selector, optional assets bundle, bind
    /// address, auth mode, optional boolean flags, trailing server args.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("-Xms{}", self.memory_min),
            format!("-Xmx{}", self.memory_max),
        ];
        args.extend(self.runtime_args.iter().cloned());
        args.push("-jar".to_string());
        args.push(SERVER_JAR.to_string());

        if self.server_dir.join(ASSETS_BUNDLE).is_file() {
            args.push("--assets".to_string());
            args.push(ASSETS_BUNDLE.to_string());
        }

        args.push("--bind".to_string());
        args.push(format!("{}:{}", BIND_HOST, self.port));
        args.push("--auth-mode".to_string());
        args.push(self.auth_mode.flag_value().to_string());

        if self.allow_op {
            args.push("--allow-op".to_string());
        }
        if self.accept_early_plugins {
            args.push("--accept-early-plugins".to_string());
        }

        args.extend(self.server_args.iter().cloned());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_args_keeps_runtime_order() {
        let mut config = ServerConfig::new(PathBuf::from("/srv/hytale"), PathBuf::from("java"));
        config.runtime_args = vec!["-XX:+UseG1GC".to_string()];
        config.server_args = vec!["--verbose".to_string()];
        config.allow_op = true;

        let args = config.build_args();
        assert_eq!(
            args,
            vec![
                "-Xms2G",
                "-Xmx4G",
                "-XX:+UseG1GC",
                "-jar",
                "HytaleServer.jar",
                "--bind",
                "0.0.0.0:5520",
                "--auth-mode",
                "authenticated",
                "--allow-op",
                "--verbose",
            ]
        );
    }

    #[test]
    fn build_args_includes_assets_only_when_bundle_exists() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig::new(dir.path().to_path_buf(), PathBuf::from("java"));
        config.auth_mode = AuthMode::Offline;

        let args = config.build_args();
        assert!(!args.contains(&"--assets".to_string()));
        assert!(args.contains(&"offline".to_string()));

        std::fs::write(dir.path().join(ASSETS_BUNDLE), b"").unwrap();
        let args = config.build_args();
        let idx = args.iter().position(|a| a == "--assets").unwrap();
        assert_eq!(args[idx + 1], ASSETS_BUNDLE);
        // assets selector sits between the jar and the bind address
        assert!(idx > args.iter().position(|a| a == "-jar").unwrap());
        assert!(idx < args.iter().position(|a| a == "--bind").unwrap());
    }
}
