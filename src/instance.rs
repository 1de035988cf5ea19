pub mod handle;
pub mod types;

pub use handle::ServerInstance;
pub use types::{InstanceStats, Listeners, LogSink, ServerStatus, StatusSink};
