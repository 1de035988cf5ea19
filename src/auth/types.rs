use chrono::{DateTime, Utc};

/// Which subsystem raised the authentication conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthSource {
    Server,
    Downloader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Idle,
    AwaitingCode,
    CodeDisplayed,
    Authenticating,
    Success,
    Failed,
}

impl AuthState {
    /// States in which the session may not be replaced by a new one.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            AuthState::AwaitingCode | AuthState::CodeDisplayed | AuthState::Authenticating
        )
    }
}

/// The single cross-process authentication conversation. `Idle` means no
/// conversation is under way; the device code may be empty before one is
/// known.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub source: AuthSource,
    pub device_code: String,
    pub verification_url: String,
    pub state: AuthState,
    pub created_at: DateTime<Utc>,
    pub message: Option<String>,
}

impl AuthSession {
    pub(crate) fn begin(source: AuthSource, state: AuthState) -> Self {
        Self {
            source,
            device_code: String::new(),
            verification_url: String::new(),
            state,
            created_at: Utc::now(),
            message: None,
        }
    }

    pub fn idle() -> Self {
        Self::begin(AuthSource::Server, AuthState::Idle)
    }
}
