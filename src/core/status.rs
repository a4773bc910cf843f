//! Connection Status
//!
//! The four-valued connection status, the error codes that accompany it,
//! and [`StatusCell`], the single place status is mutated. The cell only
//! publishes when the value actually changes.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::sync::Mutex;

use super::bus::{EventBus, Subscription};
use super::lock;

/// Lifecycle status of the backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No connection and no attempt in flight.
    #[default]
    Disconnected,
    /// A connect sequence is running.
    Connecting,
    /// Authenticated, healthy and holding an open socket.
    Connected,
    /// The last attempt or the live connection failed.
    Error,
}

impl ConnectionStatus {
    /// Lowercase name, as used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        }
    }

    /// True for the two resting states a reconnect starts from.
    pub const fn is_down(self) -> bool {
        matches!(self, ConnectionStatus::Disconnected | ConnectionStatus::Error)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Short machine-readable reason for the last failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(Cow<'static, str>);

impl ErrorCode {
    /// The transport client could not be built from settings. Not retried.
    pub const CLIENT_CREATE_FAILED: ErrorCode = ErrorCode(Cow::Borrowed("client_create_failed"));
    /// Device authentication failed without an HTTP status.
    pub const AUTH_EXCEPTION: ErrorCode = ErrorCode(Cow::Borrowed("auth_exception"));
    /// Healthcheck during connect did not report `ok`.
    pub const HEALTHCHECK_FAILED: ErrorCode = ErrorCode(Cow::Borrowed("healthcheck_failed"));
    /// Periodic healthcheck failed on a live connection.
    pub const HEARTBEAT_FAILED: ErrorCode = ErrorCode(Cow::Borrowed("heartbeat_failed"));
    /// Socket open failed without a status code.
    pub const SOCKET_EXCEPTION: ErrorCode = ErrorCode(Cow::Borrowed("socket_exception"));
    /// The server or network closed the socket.
    pub const SOCKET_CLOSED: ErrorCode = ErrorCode(Cow::Borrowed("socket_closed"));
    /// The socket reported an error.
    pub const SOCKET_ERROR: ErrorCode = ErrorCode(Cow::Borrowed("socket_error"));

    /// Build a code from an arbitrary string.
    pub fn new(code: impl Into<String>) -> Self {
        ErrorCode(Cow::Owned(code.into()))
    }

    /// `<stage>_api_<status>`, e.g. `auth_api_401`.
    pub fn api(stage: &str, status: i64) -> Self {
        ErrorCode::new(format!("{stage}_api_{status}"))
    }

    /// The code as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fatal codes are not retried without new settings.
    pub fn is_fatal(&self) -> bool {
        *self == ErrorCode::CLIENT_CREATE_FAILED
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Published whenever the status changes.
///
/// A fresh subscription first receives the current value with
/// `previous == status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChanged {
    /// Status before the change.
    pub previous: ConnectionStatus,
    /// Status after the change.
    pub status: ConnectionStatus,
    /// Error code in effect after the change.
    pub error_code: Option<ErrorCode>,
}

impl StatusChanged {
    /// True for the replayed value handed to a new subscriber.
    pub fn is_replay(&self) -> bool {
        self.previous == self.status
    }
}

#[derive(Debug, Default)]
struct StatusState {
    status: ConnectionStatus,
    error_code: Option<ErrorCode>,
}

/// Owner of the current [`ConnectionStatus`].
#[derive(Debug, Default)]
pub struct StatusCell {
    state: Mutex<StatusState>,
    bus: EventBus<StatusChanged>,
}

impl StatusCell {
    /// A cell starting at `Disconnected` with no error code.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current status.
    pub fn get(&self) -> ConnectionStatus {
        lock(&self.state).status
    }

    /// Error code of the last failure, cleared on `Connected`.
    pub fn error_code(&self) -> Option<ErrorCode> {
        lock(&self.state).error_code.clone()
    }

    /// Move to `status`. Entering `Connected` clears the error code.
    ///
    /// Returns true when the status changed and a notification went out.
    pub fn set(&self, status: ConnectionStatus) -> bool {
        let mut state = lock(&self.state);
        if status == ConnectionStatus::Connected {
            state.error_code = None;
        }
        self.apply(&mut state, status)
    }

    /// Record `code` and move to `status`.
    pub fn fail(&self, status: ConnectionStatus, code: ErrorCode) -> bool {
        let mut state = lock(&self.state);
        state.error_code = Some(code);
        self.apply(&mut state, status)
    }

    /// Like [`fail`](Self::fail), but only if the status is still `expected`.
    pub fn fail_if(&self, expected: ConnectionStatus, status: ConnectionStatus, code: ErrorCode) -> bool {
        let mut state = lock(&self.state);
        if state.status != expected {
            return false;
        }
        state.error_code = Some(code);
        self.apply(&mut state, status)
    }

    /// Subscribe to changes, starting with the current value.
    pub fn subscribe(&self) -> Subscription<StatusChanged> {
        let state = lock(&self.state);
        self.bus.subscribe_with(Some(StatusChanged {
            previous: state.status,
            status: state.status,
            error_code: state.error_code.clone(),
        }))
    }

    /// Number of live status subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.bus.subscriber_count()
    }

    /// Drop all subscribers.
    pub fn clear_subscribers(&self) {
        self.bus.clear();
    }

    fn apply(&self, state: &mut StatusState, status: ConnectionStatus) -> bool {
        if state.status == status {
            return false;
        }
        let previous = state.status;
        state.status = status;
        tracing::debug!(from = %previous, to = %status, code = ?state.error_code, "status changed");
        self.bus.publish(StatusChanged {
            previous,
            status,
            error_code: state.error_code.clone(),
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_disconnected() {
        let cell = StatusCell::new();
        assert_eq!(cell.get(), ConnectionStatus::Disconnected);
        assert!(cell.error_code().is_none());
    }

    #[test]
    fn test_notifies_only_on_change() {
        let cell = StatusCell::new();
        let mut sub = cell.subscribe();
        // Replay of current value.
        assert!(sub.try_recv().unwrap().is_replay());

        assert!(cell.set(ConnectionStatus::Connecting));
        assert!(!cell.set(ConnectionStatus::Connecting));
        assert!(cell.set(ConnectionStatus::Connected));

        let statuses: Vec<_> = sub.drain().into_iter().map(|c| c.status).collect();
        assert_eq!(statuses, vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]);
    }

    #[test]
    fn test_connected_clears_error_code() {
        let cell = StatusCell::new();
        cell.fail(ConnectionStatus::Error, ErrorCode::AUTH_EXCEPTION);
        assert_eq!(cell.error_code(), Some(ErrorCode::AUTH_EXCEPTION));

        cell.set(ConnectionStatus::Connecting);
        assert_eq!(cell.error_code(), Some(ErrorCode::AUTH_EXCEPTION));

        cell.set(ConnectionStatus::Connected);
        assert!(cell.error_code().is_none());
    }

    #[test]
    fn test_fail_updates_code_without_duplicate_notification() {
        let cell = StatusCell::new();
        cell.fail(ConnectionStatus::Error, ErrorCode::AUTH_EXCEPTION);
        let mut sub = cell.subscribe();
        sub.drain();

        assert!(!cell.fail(ConnectionStatus::Error, ErrorCode::SOCKET_ERROR));
        assert!(sub.try_recv().is_none());
        assert_eq!(cell.error_code(), Some(ErrorCode::SOCKET_ERROR));
    }

    #[test]
    fn test_fail_if_respects_expected_status() {
        let cell = StatusCell::new();
        assert!(!cell.fail_if(
            ConnectionStatus::Connected,
            ConnectionStatus::Error,
            ErrorCode::HEARTBEAT_FAILED
        ));
        assert_eq!(cell.get(), ConnectionStatus::Disconnected);
        assert!(cell.error_code().is_none());

        cell.set(ConnectionStatus::Connected);
        assert!(cell.fail_if(
            ConnectionStatus::Connected,
            ConnectionStatus::Error,
            ErrorCode::HEARTBEAT_FAILED
        ));
        assert_eq!(cell.get(), ConnectionStatus::Error);
    }

    #[test]
    fn test_change_carries_previous_status() {
        let cell = StatusCell::new();
        let mut sub = cell.subscribe();
        sub.drain();

        cell.set(ConnectionStatus::Connecting);
        cell.fail(ConnectionStatus::Disconnected, ErrorCode::HEALTHCHECK_FAILED);

        let changes = sub.drain();
        assert_eq!(changes[1].previous, ConnectionStatus::Connecting);
        assert_eq!(changes[1].status, ConnectionStatus::Disconnected);
        assert_eq!(changes[1].error_code, Some(ErrorCode::HEALTHCHECK_FAILED));
    }

    #[test]
    fn test_api_error_code_format() {
        assert_eq!(ErrorCode::api("auth", 401).as_str(), "auth_api_401");
        assert!(ErrorCode::CLIENT_CREATE_FAILED.is_fatal());
        assert!(!ErrorCode::SOCKET_CLOSED.is_fatal());
    }

    #[test]
    fn test_exception_fallback_tags() {
        assert_eq!(ErrorCode::AUTH_EXCEPTION.as_str(), "auth_exception");
        assert_eq!(ErrorCode::SOCKET_EXCEPTION.as_str(), "socket_exception");
        assert_eq!(ErrorCode::api("socket", 502).as_str(), "socket_api_502");
    }
}
