use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::instance::ServerInstance;

/// Console command that asks the server to shut down cooperatively.
pub const STOP_COMMAND: &str = "stop";

/// Writes one line of text to a running process's stdin and flushes it. The
/// only mutation surface for talking to a live process. Returns false when
/// the instance is not running, the stdin handle is gone, or the write fails;
/// each failure is reported exactly once, to the caller and the log.
pub async fn send(instance: &ServerInstance, text: &str) -> bool {
    if !instance.is_running().await {
        warn!(
            profile = %instance.profile_id(),
            "Dropping command {text:?}: server is not running"
        );
        return false;
    }

    let Some(stdin) = instance.stdin_handle().await else {
        warn!(
            profile = %instance.profile_id(),
            "Dropping command {text:?}: stdin is not connected"
        );
        return false;
    };

    let mut line = text.to_string();
    if !line.ends_with('\n') {
        line.push('\n');
    }

    let mut writer = stdin.lock().await;
    if let Err(e) = writer.write_all(line.as_bytes()).await {
        warn!(profile = %instance.profile_id(), "Failed to write command {text:?}: {e}");
        return false;
    }
    if let Err(e) = writer.flush().await {
        warn!(profile = %instance.profile_id(), "Failed to flush command {text:?}: {e}");
        return false;
    }
    true
}
