use std::path::Path;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::SERVER_JAR;
use crate::error::ConfigError;

/// Opens verification URLs on the user's machine.
pub trait BrowserOpener: Send + Sync {
    /// Returns false when the page could not be opened; the caller falls back
    /// to reporting the URL instead.
    fn open(&self, url: &str) -> bool;
}

#[cfg(feature = "browser")]
pub struct SystemBrowser;

#[cfg(feature = "browser")]
impl BrowserOpener for SystemBrowser {
    fn open(&self, url: &str) -> bool {
        match open::that(url) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to open browser for {url}: {e}");
                false
            }
        }
    }
}

/// Opener that only reports the URL. Used when the `browser` feature is off
/// and in headless environments.
pub struct LogOnlyBrowser;

impl BrowserOpener for LogOnlyBrowser {
    fn open(&self, url: &str) -> bool {
        info!("Open {url} to continue authentication");
        true
    }
}

/// Sink for user-facing notifications raised by the auth flow.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, title: &str, message: &str);
}

pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, title: &str, message: &str) {
        info!("{title}: {message}");
    }
}

/// Checks that a server directory holds everything a launch needs.
pub async fn validate_server_files(dir: &Path) -> Result<(), ConfigError> {
    match tokio::fs::metadata(dir).await {
        Ok(meta) if meta.is_dir() => {}
        _ => return Err(ConfigError::InvalidDirectory(dir.display().to_string())),
    }

    let jar = dir.join(SERVER_JAR);
    match tokio::fs::metadata(&jar).await {
        Ok(meta) if meta.is_file() => Ok(()),
        _ => Err(ConfigError::MissingServerJar(jar.display().to_string())),
    }
}
