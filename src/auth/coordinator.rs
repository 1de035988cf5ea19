use std::{
    collections::{HashMap, HashSet},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, LazyLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    sync::{Mutex, RwLock},
    time::{Instant, sleep},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    command,
    instance::ServerInstance,
    parser,
    platform::{BrowserOpener, LogNotifier, NotificationSink},
};

use super::types::{AuthSession, AuthSource, AuthState};

/// Fallback device-login page when only a bare code was printed.
const DEFAULT_VERIFICATION_URL: &str = "https://accounts.hytale.com/device";

const AUTH_LOGIN_COMMAND: &str = "/auth login device";
const AUTH_PERSISTENCE_COMMAND: &str = "/auth persistence Encrypted";

/// Repeated identical codes inside this window are dropped.
const CODE_DEBOUNCE: Duration = Duration::from_millis(5000);

/// Delay before auto-triggering the login command after the token warning,
/// so the server finishes booting first.
const AUTO_TRIGGER_DELAY: Duration = Duration::from_millis(1500);

const PERSISTENCE_DELAY: Duration = Duration::from_secs(1);
const SUCCESS_CLEAR_DELAY: Duration = Duration::from_secs(3);
const FAILURE_CLEAR_DELAY: Duration = Duration::from_secs(5);

pub type AuthCallback = Arc<dyn Fn(AuthSession) + Send + Sync>;

static COORDINATOR: LazyLock<Arc<AuthCoordinator>> =
    LazyLock::new(|| Arc::new(AuthCoordinator::with_defaults()));

/// The process-wide coordinator. Every server instance and the auxiliary
/// downloader feed the same conversation.
pub fn auth_coordinator() -> Arc<AuthCoordinator> {
    COORDINATOR.clone()
}

/// Owns the single authentication conversation: consumes classified auth
/// events from any server instance or the downloader tool, debounces repeated
/// codes, drives browser opening, notifies subscribers, and sends the
/// persistence command back into the originating server once authenticated.
pub struct AuthCoordinator {
    session: RwLock<AuthSession>,
    /// Bumped whenever the session is replaced; stale timers check it before
    /// clearing.
    generation: AtomicU64,
    callbacks: RwLock<HashMap<Uuid, AuthCallback>>,
    last_code: Mutex<Option<(String, Instant)>>,
    opened_codes: Mutex<HashSet<String>>,
    browser: Arc<dyn BrowserOpener>,
    notifier: Arc<dyn NotificationSink>,
}

impl AuthCoordinator {
    pub fn new(browser: Arc<dyn BrowserOpener>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self {
            session: RwLock::new(AuthSession::idle()),
            generation: AtomicU64::new(0),
            callbacks: RwLock::new(HashMap::new()),
            last_code: Mutex::new(None),
            opened_codes: Mutex::new(HashSet::new()),
            browser,
            notifier,
        }
    }

    pub fn with_defaults() -> Self {
        #[cfg(feature = "browser")]
        let browser: Arc<dyn BrowserOpener> = Arc::new(crate::platform::SystemBrowser);
        #[cfg(not(feature = "browser"))]
        let browser: Arc<dyn BrowserOpener> = Arc::new(crate::platform::LogOnlyBrowser);
        Self::new(browser, Arc::new(LogNotifier))
    }

    /// Inspects one line of server console output for authentication
    /// patterns, in priority order; the first match wins and short-circuits
    /// the rest. Returns true when the line was recognized.
    pub async fn parse_server_log_line(
        self: &Arc<Self>,
        line: &str,
        instance: &Arc<ServerInstance>,
    ) -> bool {
        if parser::is_no_tokens_warning(line) {
            return self.handle_token_warning(instance).await;
        }
        if let Some((url, code)) = parser::extract_url_code(line) {
            return self.handle_code(AuthSource::Server, code, Some(url)).await;
        }
        if let Some(code) = parser::extract_bare_code(line) {
            return self.handle_code(AuthSource::Server, code, None).await;
        }
        if parser::is_auth_success(line) {
            return self.handle_success(Some(instance)).await;
        }
        if parser::is_auth_failure(line) {
            return self.handle_failure(line).await;
        }
        false
    }

    /// Narrower pattern set for the auxiliary downloader CLI. Same session,
    /// `Downloader` source, no command-backs into a server process.
    pub async fn parse_downloader_line(self: &Arc<Self>, line: &str) -> bool {
        if let Some((url, code)) = parser::extract_url_code(line) {
            return self.handle_code(AuthSource::Downloader, code, Some(url)).await;
        }
        if let Some(code) = parser::extract_bare_code(line) {
            return self.handle_code(AuthSource::Downloader, code, None).await;
        }
        if parser::is_auth_success(line) {
            return self.handle_success(None).await;
        }
        if parser::is_auth_failure(line) {
            return self.handle_failure(line).await;
        }
        false
    }

    pub async fn register_callback(&self, callback: AuthCallback) -> Uuid {
        let id = Uuid::new_v4();
        self.callbacks.write().await.insert(id, callback);
        id
    }

    pub async fn unregister_callback(&self, id: Uuid) -> bool {
        self.callbacks.write().await.remove(&id).is_some()
    }

    /// Starts a session and issues the login command, but only when the
    /// target server is running.
    pub async fn trigger_server_auth(self: &Arc<Self>, instance: &Arc<ServerInstance>) -> bool {
        if !instance.is_running().await {
            return false;
        }
        {
            let session = self.session.read().await;
            if session.state.is_active() && session.state != AuthState::AwaitingCode {
                debug!("Auth trigger ignored: a login conversation is already under way");
                return false;
            }
        }
        let snapshot = {
            let mut session = self.session.write().await;
            if !session.state.is_active() {
                self.generation.fetch_add(1, Ordering::SeqCst);
                *session = AuthSession::begin(AuthSource::Server, AuthState::AwaitingCode);
                Some(session.clone())
            } else {
                None
            }
        };
        if let Some(snapshot) = snapshot {
            self.dispatch(snapshot);
        }
        self.send_login_command(instance).await
    }

    /// Clears the session unconditionally.
    pub async fn reset_session(self: &Arc<Self>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let snapshot = {
            let mut session = self.session.write().await;
            *session = AuthSession::idle();
            session.clone()
        };
        self.last_code.lock().await.take();
        self.opened_codes.lock().await.clear();
        self.dispatch(snapshot);
    }

    pub async fn session(&self) -> AuthSession {
        self.session.read().await.clone()
    }

    async fn handle_token_warning(self: &Arc<Self>, instance: &Arc<ServerInstance>) -> bool {
        {
            let session = self.session.read().await;
            if session.state.is_active() {
                debug!("Token warning ignored: session already active");
                return true;
            }
        }

        self.generation.fetch_add(1, Ordering::SeqCst);
        let generation = self.current_generation();
        let snapshot = {
            let mut session = self.session.write().await;
            *session = AuthSession::begin(AuthSource::Server, AuthState::AwaitingCode);
            session.clone()
        };
        info!(profile = %instance.profile_id(), "Server has no stored tokens; starting device login");
        self.dispatch(snapshot);

        let this = self.clone();
        let instance = instance.clone();
        tokio::spawn(async move {
            sleep(AUTO_TRIGGER_DELAY).await;
            let still_waiting = {
                let session = this.session.read().await;
                session.state == AuthState::AwaitingCode && session.device_code.is_empty()
            };
            if still_waiting && this.current_generation() == generation {
                this.send_login_command(&instance).await;
            }
        });
        true
    }

    async fn handle_code(
        self: &Arc<Self>,
        source: AuthSource,
        code: String,
        url: Option<String>,
    ) -> bool {
        {
            let mut last = self.last_code.lock().await;
            if let Some((previous, seen_at)) = &*last {
                if *previous == code && seen_at.elapsed() < CODE_DEBOUNCE {
                    debug!("Debounced repeated device code");
                    return true;
                }
            }
            *last = Some((code.clone(), Instant::now()));
        }

        let url = url.unwrap_or_else(|| DEFAULT_VERIFICATION_URL.to_string());
        let snapshot = {
            let mut session = self.session.write().await;
            if !session.state.is_active() {
                // A code can show up without the token warning, e.g. an
                // operator ran the login command by hand.
                self.generation.fetch_add(1, Ordering::SeqCst);
                *session = AuthSession::begin(source, AuthState::AwaitingCode);
            }
            session.device_code = code.clone();
            session.verification_url = url.clone();
            session.state = AuthState::CodeDisplayed;
            session.clone()
        };
        self.dispatch(snapshot);

        let first_sighting = self.opened_codes.lock().await.insert(code.clone());
        if first_sighting {
            if !self.browser.open(&url) {
                warn!("Could not open the verification page; visit {url} and enter {code}");
            }
            self.notify_async(
                "Device authentication",
                format!("Enter code {code} at {url}"),
            );
        }
        true
    }

    async fn handle_success(self: &Arc<Self>, instance: Option<&Arc<ServerInstance>>) -> bool {
        let snapshot = {
            let mut session = self.session.write().await;
            if !session.state.is_active() {
                // unrelated boot text; nobody was authenticating
                return false;
            }
            session.state = AuthState::Success;
            session.message = Some("Authentication successful".to_string());
            session.clone()
        };
        info!("Device authentication succeeded");
        self.dispatch(snapshot.clone());
        self.notify_async("Authentication", "Server authenticated successfully".to_string());

        if snapshot.source == AuthSource::Server {
            if let Some(instance) = instance {
                let instance = instance.clone();
                tokio::spawn(async move {
                    sleep(PERSISTENCE_DELAY).await;
                    if instance.is_running().await {
                        // persist credentials so the next launch skips the flow
                        command::send(&instance, AUTH_PERSISTENCE_COMMAND).await;
                    }
                });
            }
        }
        self.schedule_clear(AuthState::Success, SUCCESS_CLEAR_DELAY);
        true
    }

    async fn handle_failure(self: &Arc<Self>, line: &str) -> bool {
        let snapshot = {
            let mut session = self.session.write().await;
            if !session.state.is_active() {
                return false;
            }
            session.state = AuthState::Failed;
            session.message = Some(line.trim().to_string());
            session.clone()
        };
        warn!("Device authentication failed: {line}");
        self.dispatch(snapshot);
        self.notify_async("Authentication failed", line.trim().to_string());
        self.schedule_clear(AuthState::Failed, FAILURE_CLEAR_DELAY);
        true
    }

    async fn send_login_command(self: &Arc<Self>, instance: &Arc<ServerInstance>) -> bool {
        let sent = command::send(instance, AUTH_LOGIN_COMMAND).await;
        if sent {
            let snapshot = {
                let mut session = self.session.write().await;
                if session.state == AuthState::CodeDisplayed {
                    // re-trigger with a code already on screen
                    session.state = AuthState::Authenticating;
                    Some(session.clone())
                } else {
                    None
                }
            };
            if let Some(snapshot) = snapshot {
                self.dispatch(snapshot);
            }
        }
        sent
    }

    /// Auto-clears a terminal state back to idle after `delay`, unless a
    /// newer session superseded it first.
    fn schedule_clear(self: &Arc<Self>, expected: AuthState, delay: Duration) {
        let this = self.clone();
        let generation = self.current_generation();
        tokio::spawn(async move {
            sleep(delay).await;
            if this.current_generation() != generation {
                return;
            }
            let snapshot = {
                let mut session = this.session.write().await;
                if session.state != expected {
                    return;
                }
                *session = AuthSession::idle();
                session.clone()
            };
            this.dispatch(snapshot);
        });
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Dispatches a session snapshot to every subscriber off the caller's
    /// task. A panicking subscriber is logged and skipped so it cannot break
    /// delivery to the others.
    fn dispatch(self: &Arc<Self>, snapshot: AuthSession) {
        let this = self.clone();
        tokio::spawn(async move {
            let callbacks: Vec<(Uuid, AuthCallback)> = this
                .callbacks
                .read()
                .await
                .iter()
                .map(|(id, callback)| (*id, callback.clone()))
                .collect();
            for (id, callback) in callbacks {
                let session = snapshot.clone();
                if catch_unwind(AssertUnwindSafe(|| callback(session))).is_err() {
                    warn!(callback = %id, "Auth callback panicked; continuing delivery");
                }
            }
        });
    }

    fn notify_async(self: &Arc<Self>, title: &'static str, message: String) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            notifier.notify(title, &message).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use crate::config::ServerConfig;

    use super::*;

    struct RecordingBrowser {
        opened: StdMutex<Vec<String>>,
    }

    impl BrowserOpener for RecordingBrowser {
        fn open(&self, url: &str) -> bool {
            self.opened.lock().unwrap().push(url.to_string());
            true
        }
    }

    struct RecordingNotifier {
        messages: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingNotifier {
        async fn notify(&self, _title: &str, message: &str) {
            self.messages.lock().unwrap().push(message.to_string());
        }
    }

    fn coordinator() -> (
        Arc<AuthCoordinator>,
        Arc<RecordingBrowser>,
        Arc<RecordingNotifier>,
    ) {
        let browser = Arc::new(RecordingBrowser {
            opened: StdMutex::new(Vec::new()),
        });
        let notifier = Arc::new(RecordingNotifier {
            messages: StdMutex::new(Vec::new()),
        });
        let coordinator = Arc::new(AuthCoordinator::new(browser.clone(), notifier.clone()));
        (coordinator, browser, notifier)
    }

    fn stopped_instance() -> Arc<ServerInstance> {
        let config = ServerConfig::new(PathBuf::from("."), PathBuf::from("java"));
        Arc::new(ServerInstance::new("dev", config))
    }

    const WARNING_LINE: &str =
        "[12:00:00] [main/WARN] [HytaleServer]: No server tokens configured, starting device login";
    const URL_LINE: &str =
        "[12:00:02] [auth/INFO]: Visit https://accounts.hytale.com/device?user_code=AB12CD to log in";

    #[tokio::test(start_paused = true)]
    async fn token_warning_opens_session() {
        let (coordinator, _, _) = coordinator();
        let instance = stopped_instance();

        assert!(coordinator.parse_server_log_line(WARNING_LINE, &instance).await);
        let session = coordinator.session().await;
        assert_eq!(session.state, AuthState::AwaitingCode);
        assert_eq!(session.source, AuthSource::Server);
        assert!(session.device_code.is_empty());

        // the delayed trigger fires against a stopped server and is dropped
        sleep(Duration::from_secs(2)).await;
        assert_eq!(coordinator.session().await.state, AuthState::AwaitingCode);
    }

    #[tokio::test(start_paused = true)]
    async fn token_warning_ignored_while_session_active() {
        let (coordinator, _, _) = coordinator();
        let instance = stopped_instance();

        coordinator.parse_server_log_line(WARNING_LINE, &instance).await;
        let first = coordinator.session().await;

        assert!(coordinator.parse_server_log_line(WARNING_LINE, &instance).await);
        let second = coordinator.session().await;
        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test(start_paused = true)]
    async fn code_detection_opens_browser_once() {
        let (coordinator, browser, notifier) = coordinator();
        let instance = stopped_instance();

        assert!(coordinator.parse_server_log_line(URL_LINE, &instance).await);
        let session = coordinator.session().await;
        assert_eq!(session.state, AuthState::CodeDisplayed);
        assert_eq!(session.device_code, "AB12CD");
        assert!(session.verification_url.contains("user_code=AB12CD"));

        // identical code inside the debounce window: dropped
        assert!(coordinator.parse_server_log_line(URL_LINE, &instance).await);
        assert_eq!(browser.opened.lock().unwrap().len(), 1);

        sleep(Duration::from_millis(50)).await;
        assert_eq!(notifier.messages.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_code_after_window_opens_browser_again() {
        let (coordinator, browser, _) = coordinator();
        let instance = stopped_instance();

        coordinator.parse_server_log_line(URL_LINE, &instance).await;
        tokio::time::advance(Duration::from_millis(5100)).await;

        let other = "Visit https://accounts.hytale.com/device?user_code=ZZ99XX to log in";
        assert!(coordinator.parse_server_log_line(other, &instance).await);
        assert_eq!(browser.opened.lock().unwrap().len(), 2);
        assert_eq!(coordinator.session().await.device_code, "ZZ99XX");
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_code_after_window_does_not_reopen_browser() {
        let (coordinator, browser, _) = coordinator();
        let instance = stopped_instance();

        coordinator.parse_server_log_line(URL_LINE, &instance).await;
        tokio::time::advance(Duration::from_millis(5100)).await;

        assert!(coordinator.parse_server_log_line(URL_LINE, &instance).await);
        assert_eq!(browser.opened.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_requires_active_session() {
        let (coordinator, _, _) = coordinator();
        let instance = stopped_instance();

        let success = "[12:01:00] [auth/INFO]: Authentication successful";
        assert!(!coordinator.parse_server_log_line(success, &instance).await);
        assert_eq!(coordinator.session().await.state, AuthState::Idle);

        coordinator.parse_server_log_line(URL_LINE, &instance).await;
        assert!(coordinator.parse_server_log_line(success, &instance).await);
        assert_eq!(coordinator.session().await.state, AuthState::Success);

        // auto-clears back to idle after the success delay
        sleep(Duration::from_secs(4)).await;
        assert_eq!(coordinator.session().await.state, AuthState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_sets_message_and_clears_later() {
        let (coordinator, _, _) = coordinator();
        let instance = stopped_instance();

        coordinator.parse_server_log_line(URL_LINE, &instance).await;
        let failure = "[12:01:00] [auth/ERROR]: Authentication failed: access denied";
        assert!(coordinator.parse_server_log_line(failure, &instance).await);

        let session = coordinator.session().await;
        assert_eq!(session.state, AuthState::Failed);
        assert!(session.message.unwrap().contains("access denied"));

        sleep(Duration::from_secs(4)).await;
        assert_eq!(coordinator.session().await.state, AuthState::Failed);
        sleep(Duration::from_secs(2)).await;
        assert_eq!(coordinator.session().await.state, AuthState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn new_session_survives_stale_clear_timer() {
        let (coordinator, _, _) = coordinator();
        let instance = stopped_instance();

        coordinator.parse_server_log_line(URL_LINE, &instance).await;
        coordinator
            .parse_server_log_line("Authentication successful", &instance)
            .await;

        // a fresh conversation starts before the 3 s clear fires
        coordinator.parse_server_log_line(WARNING_LINE, &instance).await;
        sleep(Duration::from_secs(4)).await;
        assert_eq!(coordinator.session().await.state, AuthState::AwaitingCode);
    }

    #[tokio::test(start_paused = true)]
    async fn callbacks_observe_transitions_with_fault_isolation() {
        let (coordinator, _, _) = coordinator();
        let instance = stopped_instance();

        let seen: Arc<StdMutex<Vec<AuthState>>> = Arc::new(StdMutex::new(Vec::new()));
        let recorder = seen.clone();
        coordinator
            .register_callback(Arc::new(|_| panic!("bad subscriber")))
            .await;
        let id = coordinator
            .register_callback(Arc::new(move |session| {
                recorder.lock().unwrap().push(session.state);
            }))
            .await;

        coordinator.parse_server_log_line(WARNING_LINE, &instance).await;
        coordinator.parse_server_log_line(URL_LINE, &instance).await;
        sleep(Duration::from_millis(50)).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![AuthState::AwaitingCode, AuthState::CodeDisplayed]
        );

        assert!(coordinator.unregister_callback(id).await);
        coordinator.reset_session().await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_requires_running_server() {
        let (coordinator, _, _) = coordinator();
        let instance = stopped_instance();
        assert!(!coordinator.trigger_server_auth(&instance).await);
        assert_eq!(coordinator.session().await.state, AuthState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_session_allows_browser_reopen() {
        let (coordinator, browser, _) = coordinator();
        let instance = stopped_instance();

        coordinator.parse_server_log_line(URL_LINE, &instance).await;
        coordinator.reset_session().await;
        assert_eq!(coordinator.session().await.state, AuthState::Idle);

        coordinator.parse_server_log_line(URL_LINE, &instance).await;
        assert_eq!(browser.opened.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn downloader_lines_mark_source() {
        let (coordinator, _, _) = coordinator();

        assert!(
            coordinator
                .parse_downloader_line("Enter the code QX77PLM2 at the verification page")
                .await
        );
        let session = coordinator.session().await;
        assert_eq!(session.source, AuthSource::Downloader);
        assert_eq!(session.state, AuthState::CodeDisplayed);
        assert_eq!(session.device_code, "QX77PLM2");
        assert_eq!(session.verification_url, DEFAULT_VERIFICATION_URL);
    }
}
