//! Transport Abstraction
//!
//! The seams between the connection state machine and a concrete backend:
//! a [`Connector`] builds a [`TransportClient`] from settings, the client
//! authenticates and calls RPCs over HTTP, and opens a [`RealtimeSocket`]
//! whose events arrive on a channel.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use super::http::HttpTransport;
use super::offline::OfflineTransport;
use super::protocol::{MatchDataInfo, MatchmakerMatchedInfo, RealtimeEnvelope, UserPresence};
use super::session::Session;
use super::settings::{BackendKind, Settings};

/// Result alias for transport calls.
pub type TransportResult<T> = Result<T, TransportError>;

/// Transport errors.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Settings cannot produce a client.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    /// The HTTP API answered with a non-success status.
    #[error("api error {status}: {message}")]
    Api {
        /// HTTP status.
        status: u16,
        /// Server message.
        message: String,
    },
    /// The socket answered a request with an error.
    #[error("server error {code}: {message}")]
    Server {
        /// Server error code.
        code: i64,
        /// Server message.
        message: String,
    },
    /// The call did not finish in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Network-level failure.
    #[error("request failed: {0}")]
    Request(String),
    /// WebSocket failure.
    #[error("websocket error: {0}")]
    WebSocket(String),
    /// Malformed reply.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The socket is closed.
    #[error("socket is not connected")]
    NotConnected,
    /// The backend does not offer this operation.
    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),
}

impl TransportError {
    /// Status or server code, when the failure carried one.
    pub fn status_code(&self) -> Option<i64> {
        match self {
            TransportError::Api { status, .. } => Some(i64::from(*status)),
            TransportError::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}

// =============================================================================
// SOCKET EVENTS
// =============================================================================

/// A matched user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchmakerUser {
    /// User id.
    pub user_id: String,
    /// Username.
    pub username: Option<String>,
}

/// The matchmaker paired us with opponents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchmakerMatched {
    /// Ticket that matched.
    pub ticket: String,
    /// Match id, for relayed matches.
    pub match_id: Option<String>,
    /// Join token, for authoritative matches.
    pub token: Option<String>,
    /// Every matched user, including us.
    pub users: Vec<MatchmakerUser>,
    /// Our own user id as the matchmaker saw it.
    pub self_user_id: Option<String>,
}

/// Match data received on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchData {
    /// Source match.
    pub match_id: String,
    /// Sender, absent for server-originated data.
    pub sender_user_id: Option<String>,
    /// Opcode and payload.
    pub envelope: RealtimeEnvelope,
}

/// Events relevant to the game layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeEvent {
    /// Matchmaking completed.
    MatchmakerMatched(MatchmakerMatched),
    /// Match data arrived.
    MatchData(MatchData),
}

/// Everything a socket can report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// Game-level event.
    Realtime(RealtimeEvent),
    /// The socket closed.
    Closed {
        /// Close reason, if any.
        reason: Option<String>,
    },
    /// The socket failed.
    Error {
        /// Error description.
        message: String,
    },
}

/// Ticket returned by the matchmaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchmakerTicket {
    /// Ticket id.
    pub ticket: String,
}

/// A joined match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedMatch {
    /// Match id.
    pub match_id: String,
    /// Participants at join time.
    pub presences: Vec<MatchmakerUser>,
}

impl From<UserPresence> for MatchmakerUser {
    fn from(presence: UserPresence) -> Self {
        Self {
            user_id: presence.user_id,
            username: presence.username.filter(|name| !name.is_empty()),
        }
    }
}

impl From<MatchmakerMatchedInfo> for MatchmakerMatched {
    fn from(info: MatchmakerMatchedInfo) -> Self {
        Self {
            ticket: info.ticket,
            match_id: info.match_id.filter(|id| !id.is_empty()),
            token: info.token.filter(|token| !token.is_empty()),
            users: info.users.into_iter().map(|user| user.presence.into()).collect(),
            self_user_id: info.self_user.map(|user| user.presence.user_id),
        }
    }
}

impl From<MatchDataInfo> for MatchData {
    fn from(info: MatchDataInfo) -> Self {
        Self {
            match_id: info.match_id,
            sender_user_id: info.presence.map(|p| p.user_id),
            envelope: RealtimeEnvelope {
                opcode: info.op_code,
                payload: info.data,
            },
        }
    }
}

// =============================================================================
// TRAITS
// =============================================================================

/// An open realtime socket.
#[async_trait]
pub trait RealtimeSocket: Send + Sync {
    /// Whether the socket is still open.
    fn is_connected(&self) -> bool;

    /// Join the matchmaker pool.
    async fn add_matchmaker(&self, query: &str, min_count: u32, max_count: u32) -> TransportResult<MatchmakerTicket>;

    /// Leave the matchmaker pool.
    async fn remove_matchmaker(&self, ticket: &str) -> TransportResult<()>;

    /// Join the match the matchmaker produced.
    async fn join_match(&self, matched: &MatchmakerMatched) -> TransportResult<JoinedMatch>;

    /// Leave a match.
    async fn leave_match(&self, match_id: &str) -> TransportResult<()>;

    /// Send match state to the other participants.
    async fn send_match_state(&self, match_id: &str, envelope: &RealtimeEnvelope) -> TransportResult<()>;

    /// Close the socket.
    async fn close(&self) -> TransportResult<()>;
}

/// A freshly opened socket and its event stream.
pub struct SocketConnection {
    /// The socket.
    pub socket: Arc<dyn RealtimeSocket>,
    /// Events in arrival order. Ends when the socket is gone.
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

/// HTTP side of a backend.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Human-readable endpoint, for logs.
    fn endpoint(&self) -> String;

    /// Authenticate by device id, creating the account if needed.
    async fn authenticate_device(&self, device_id: &str) -> TransportResult<Session>;

    /// Call a server RPC. `None` means an empty reply.
    async fn rpc(&self, session: &Session, id: &str, payload: Option<&str>) -> TransportResult<Option<String>>;

    /// Open the realtime socket.
    async fn connect_socket(&self, session: &Session, timeout: Duration) -> TransportResult<SocketConnection>;
}

/// Builds transport clients from settings.
pub trait Connector: Send + Sync {
    /// Build a client, or fail if the settings are unusable.
    fn create_client(&self, settings: &Settings) -> TransportResult<Arc<dyn TransportClient>>;
}

/// Picks the HTTP or offline backend from [`Settings::backend`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConnector;

impl Connector for DefaultConnector {
    fn create_client(&self, settings: &Settings) -> TransportResult<Arc<dyn TransportClient>> {
        match settings.backend {
            BackendKind::Remote => Ok(Arc::new(HttpTransport::new(settings)?)),
            BackendKind::Offline => Ok(Arc::new(OfflineTransport::new())),
        }
    }
}
