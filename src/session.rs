use crate::event::uuid_v7;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::Instant;

const MAX_SESSION_IDLE_TIMEOUT_SECONDS: u64 = 30 * 60;
const MIN_SESSION_IDLE_TIMEOUT_SECONDS: u64 = 60;
const SESSION_LENGTH_LIMIT: Duration = Duration::from_secs(24 * 3600);

/// Invoked with the new session and window ids whenever the session rotates.
pub type SessionIdChangedCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Default)]
struct SessionState {
    session_id: Option<String>,
    window_id: Option<String>,
    session_start: Option<Instant>,
    last_activity: Option<Instant>,
}

/// Hands out the session and window identifiers attached to every event.
///
/// A session rotates after the configured idle timeout or once it has run
/// for 24 hours, whichever comes first. Ids are UUIDv7 so sessions sort by
/// start time.
pub struct SessionManager {
    session_timeout: Duration,
    state: Mutex<SessionState>,
    handlers: Mutex<Vec<SessionIdChangedCallback>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("session_timeout", &self.session_timeout)
            .finish()
    }
}

impl SessionManager {
    pub(crate) fn new(session_idle_timeout_seconds: u64) -> Self {
        if session_idle_timeout_seconds > MAX_SESSION_IDLE_TIMEOUT_SECONDS {
            tracing::warn!(
                configured = session_idle_timeout_seconds,
                "session idle timeout above the 30 minute maximum, clamping"
            );
        } else if session_idle_timeout_seconds < MIN_SESSION_IDLE_TIMEOUT_SECONDS {
            tracing::warn!(
                configured = session_idle_timeout_seconds,
                "session idle timeout below the 60 second minimum, clamping"
            );
        }
        let clamped = session_idle_timeout_seconds
            .clamp(MIN_SESSION_IDLE_TIMEOUT_SECONDS, MAX_SESSION_IDLE_TIMEOUT_SECONDS);
        Self {
            session_timeout: Duration::from_secs(clamped),
            state: Mutex::new(SessionState::default()),
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Return the current session and window ids, rotating them first when
    /// the session expired. Activity is recorded unless `read_only`.
    pub fn check_and_get_session_and_window_id(&self, read_only: bool) -> (String, String) {
        let now = Instant::now();
        let (session_id, window_id, changed) = {
            let mut state = self.state.lock().expect("session lock poisoned");
            let idle_expired = state
                .last_activity
                .is_some_and(|last| now.duration_since(last) > self.session_timeout);
            let length_expired = state
                .session_start
                .is_some_and(|start| now.duration_since(start) > SESSION_LENGTH_LIMIT);
            let changed = state.session_id.is_none() || idle_expired || length_expired;
            if changed {
                state.session_id = Some(uuid_v7());
                state.window_id = Some(uuid_v7());
                state.session_start = Some(now);
            }
            if !read_only {
                state.last_activity = Some(now);
            }
            (
                state.session_id.clone().expect("session id set above"),
                state.window_id.clone().expect("window id set above"),
                changed,
            )
        };

        if changed {
            let handlers = self.handlers.lock().expect("session lock poisoned").clone();
            for handler in handlers {
                handler(&session_id, &window_id);
            }
        }
        (session_id, window_id)
    }

    /// Register a callback for session rotations. It fires immediately when a
    /// session already exists.
    pub fn on_session_id(&self, callback: SessionIdChangedCallback) {
        let current = {
            let state = self.state.lock().expect("session lock poisoned");
            state.session_id.clone().zip(state.window_id.clone())
        };
        if let Some((session_id, window_id)) = current {
            callback(&session_id, &window_id);
        }
        self.handlers
            .lock()
            .expect("session lock poisoned")
            .push(callback);
    }
}
