pub mod coordinator;
pub mod types;

pub use coordinator::{AuthCallback, AuthCoordinator, auth_coordinator};
pub use types::{AuthSession, AuthSource, AuthState};
