//! In-Memory Backend
//!
//! A scriptable [`Connector`] for tests. Every knob lives on a shared
//! [`MockBackend`] handle: tests configure replies before connecting,
//! push socket events while connected and inspect what the client sent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use super::protocol::{RealtimeEnvelope, HEALTHCHECK_RPC_ID};
use super::session::Session;
use super::settings::Settings;
use super::transport::{
    Connector, JoinedMatch, MatchmakerMatched, MatchmakerTicket, MatchmakerUser, RealtimeEvent,
    RealtimeSocket, SocketConnection, SocketEvent, TransportClient, TransportError, TransportResult,
};
use crate::core::lock;

/// User id the mock authenticates as.
pub const MOCK_USER_ID: &str = "user-local";
/// Healthy healthcheck payload.
pub const HEALTHY: &str = r#"{"status":"ok"}"#;

type Hook = Arc<dyn Fn() + Send + Sync>;

struct LiveSocket {
    events: mpsc::UnboundedSender<SocketEvent>,
    connected: Arc<AtomicBool>,
}

struct MockState {
    reject_settings: bool,
    auth_error: Option<TransportError>,
    auth_delay: Option<Duration>,
    healthchecks: VecDeque<TransportResult<Option<String>>>,
    default_health: TransportResult<Option<String>>,
    rpc_replies: BTreeMap<String, Option<String>>,
    socket_error: Option<TransportError>,
    matchmaker_error: Option<TransportError>,
    on_healthcheck: Option<Hook>,

    clients_created: usize,
    auth_calls: usize,
    healthcheck_calls: usize,
    rpc_calls: Vec<(String, Option<String>)>,
    sockets_opened: usize,
    socket_closes: usize,
    matchmaker_adds: Vec<(String, u32, u32)>,
    matchmaker_removes: Vec<String>,
    joins: Vec<MatchmakerMatched>,
    leaves: Vec<String>,
    sent: Vec<(String, RealtimeEnvelope)>,
    live: Option<LiveSocket>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            reject_settings: false,
            auth_error: None,
            auth_delay: None,
            healthchecks: VecDeque::new(),
            default_health: Ok(Some(HEALTHY.into())),
            rpc_replies: BTreeMap::new(),
            socket_error: None,
            matchmaker_error: None,
            on_healthcheck: None,
            clients_created: 0,
            auth_calls: 0,
            healthcheck_calls: 0,
            rpc_calls: Vec::new(),
            sockets_opened: 0,
            socket_closes: 0,
            matchmaker_adds: Vec::new(),
            matchmaker_removes: Vec::new(),
            joins: Vec::new(),
            leaves: Vec::new(),
            sent: Vec::new(),
            live: None,
        }
    }
}

/// Shared handle onto the scripted backend.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    /// A backend where everything succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector that builds clients against this backend.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            backend: self.clone(),
        })
    }

    // -------------------------------------------------------------------------
    // Scripting
    // -------------------------------------------------------------------------

    /// Make client creation fail.
    pub fn reject_settings(&self, reject: bool) {
        lock(&self.state).reject_settings = reject;
    }

    /// Make device authentication fail with `error`.
    pub fn fail_auth(&self, error: Option<TransportError>) {
        lock(&self.state).auth_error = error;
    }

    /// Delay every authentication.
    pub fn delay_auth(&self, delay: Duration) {
        lock(&self.state).auth_delay = Some(delay);
    }

    /// Reply used for healthchecks once the queue is empty.
    pub fn set_health(&self, reply: TransportResult<Option<String>>) {
        lock(&self.state).default_health = reply;
    }

    /// Queue a one-off healthcheck reply.
    pub fn push_health(&self, reply: TransportResult<Option<String>>) {
        lock(&self.state).healthchecks.push_back(reply);
    }

    /// Run `hook` on every healthcheck call, before replying.
    pub fn on_healthcheck(&self, hook: impl Fn() + Send + Sync + 'static) {
        lock(&self.state).on_healthcheck = Some(Arc::new(hook));
    }

    /// Reply for a non-healthcheck RPC.
    pub fn set_rpc_reply(&self, id: &str, payload: Option<&str>) {
        lock(&self.state)
            .rpc_replies
            .insert(id.to_string(), payload.map(str::to_string));
    }

    /// Make socket connects fail with `error`.
    pub fn fail_socket(&self, error: Option<TransportError>) {
        lock(&self.state).socket_error = error;
    }

    /// Make matchmaker adds fail with `error`.
    pub fn fail_matchmaker(&self, error: Option<TransportError>) {
        lock(&self.state).matchmaker_error = error;
    }

    // -------------------------------------------------------------------------
    // Socket injection
    // -------------------------------------------------------------------------

    /// Push an event into the latest socket. False if there is none.
    pub fn emit(&self, event: SocketEvent) -> bool {
        match &lock(&self.state).live {
            Some(live) => live.events.send(event).is_ok(),
            None => false,
        }
    }

    /// Push a realtime event into the latest socket.
    pub fn emit_realtime(&self, event: RealtimeEvent) -> bool {
        self.emit(SocketEvent::Realtime(event))
    }

    /// Close the latest socket from the server side.
    pub fn drop_socket(&self, reason: &str) -> bool {
        if let Some(live) = &lock(&self.state).live {
            live.connected.store(false, Ordering::SeqCst);
        }
        self.emit(SocketEvent::Closed {
            reason: Some(reason.to_string()),
        })
    }

    /// Build a matchmaker result for `users` (user id, username).
    pub fn matched(match_id: &str, users: &[(&str, &str)]) -> MatchmakerMatched {
        MatchmakerMatched {
            ticket: "ticket-1".into(),
            match_id: Some(match_id.to_string()),
            token: None,
            users: users
                .iter()
                .map(|(id, name)| MatchmakerUser {
                    user_id: id.to_string(),
                    username: Some(name.to_string()),
                })
                .collect(),
            self_user_id: Some(MOCK_USER_ID.into()),
        }
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// Clients built so far.
    pub fn clients_created(&self) -> usize {
        lock(&self.state).clients_created
    }

    /// Authentication calls so far.
    pub fn auth_calls(&self) -> usize {
        lock(&self.state).auth_calls
    }

    /// Healthcheck RPCs so far.
    pub fn healthcheck_calls(&self) -> usize {
        lock(&self.state).healthcheck_calls
    }

    /// Other RPCs so far, with their payloads.
    pub fn rpc_calls(&self) -> Vec<(String, Option<String>)> {
        lock(&self.state).rpc_calls.clone()
    }

    /// Sockets opened so far.
    pub fn sockets_opened(&self) -> usize {
        lock(&self.state).sockets_opened
    }

    /// Explicit socket closes so far.
    pub fn socket_closes(&self) -> usize {
        lock(&self.state).socket_closes
    }

    /// Matchmaker add requests (query, min, max).
    pub fn matchmaker_adds(&self) -> Vec<(String, u32, u32)> {
        lock(&self.state).matchmaker_adds.clone()
    }

    /// Tickets removed from the matchmaker.
    pub fn matchmaker_removes(&self) -> Vec<String> {
        lock(&self.state).matchmaker_removes.clone()
    }

    /// Matches joined.
    pub fn joins(&self) -> Vec<MatchmakerMatched> {
        lock(&self.state).joins.clone()
    }

    /// Matches left.
    pub fn leaves(&self) -> Vec<String> {
        lock(&self.state).leaves.clone()
    }

    /// Match state sent, in order.
    pub fn sent(&self) -> Vec<(String, RealtimeEnvelope)> {
        lock(&self.state).sent.clone()
    }
}

/// [`Connector`] backed by a [`MockBackend`].
pub struct MockConnector {
    backend: MockBackend,
}

impl Connector for MockConnector {
    fn create_client(&self, settings: &Settings) -> TransportResult<Arc<dyn TransportClient>> {
        settings
            .validate()
            .map_err(|e| TransportError::InvalidSettings(e.to_string()))?;

        let mut state = lock(&self.backend.state);
        if state.reject_settings {
            return Err(TransportError::InvalidSettings("rejected by mock".into()));
        }
        state.clients_created += 1;
        Ok(Arc::new(MockClient {
            backend: self.backend.clone(),
        }))
    }
}

struct MockClient {
    backend: MockBackend,
}

#[async_trait]
impl TransportClient for MockClient {
    fn endpoint(&self) -> String {
        "mock".into()
    }

    async fn authenticate_device(&self, _device_id: &str) -> TransportResult<Session> {
        let (delay, error) = {
            let mut state = lock(&self.backend.state);
            state.auth_calls += 1;
            (state.auth_delay, state.auth_error.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match error {
            Some(error) => Err(error),
            None => Ok(Session::new(
                MOCK_USER_ID,
                Some("local".into()),
                "mock-token",
                DateTime::<Utc>::MAX_UTC,
            )),
        }
    }

    async fn rpc(&self, _session: &Session, id: &str, payload: Option<&str>) -> TransportResult<Option<String>> {
        if id != HEALTHCHECK_RPC_ID {
            let mut state = lock(&self.backend.state);
            state.rpc_calls.push((id.to_string(), payload.map(str::to_string)));
            return Ok(state.rpc_replies.get(id).cloned().flatten());
        }

        let hook = lock(&self.backend.state).on_healthcheck.clone();
        if let Some(hook) = hook {
            hook();
        }
        let mut state = lock(&self.backend.state);
        state.healthcheck_calls += 1;
        match state.healthchecks.pop_front() {
            Some(reply) => reply,
            None => state.default_health.clone(),
        }
    }

    async fn connect_socket(&self, _session: &Session, _timeout: Duration) -> TransportResult<SocketConnection> {
        let mut state = lock(&self.backend.state);
        if let Some(error) = state.socket_error.clone() {
            return Err(error);
        }

        let (events_tx, events) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        state.sockets_opened += 1;
        state.live = Some(LiveSocket {
            events: events_tx,
            connected: connected.clone(),
        });

        Ok(SocketConnection {
            socket: Arc::new(MockSocket {
                backend: self.backend.clone(),
                connected,
            }),
            events,
        })
    }
}

struct MockSocket {
    backend: MockBackend,
    connected: Arc<AtomicBool>,
}

impl MockSocket {
    fn ensure_open(&self) -> TransportResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

#[async_trait]
impl RealtimeSocket for MockSocket {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn add_matchmaker(&self, query: &str, min_count: u32, max_count: u32) -> TransportResult<MatchmakerTicket> {
        self.ensure_open()?;
        let mut state = lock(&self.backend.state);
        state.matchmaker_adds.push((query.to_string(), min_count, max_count));
        if let Some(error) = state.matchmaker_error.clone() {
            return Err(error);
        }
        Ok(MatchmakerTicket {
            ticket: format!("ticket-{}", state.matchmaker_adds.len()),
        })
    }

    async fn remove_matchmaker(&self, ticket: &str) -> TransportResult<()> {
        self.ensure_open()?;
        lock(&self.backend.state).matchmaker_removes.push(ticket.to_string());
        Ok(())
    }

    async fn join_match(&self, matched: &MatchmakerMatched) -> TransportResult<JoinedMatch> {
        self.ensure_open()?;
        lock(&self.backend.state).joins.push(matched.clone());
        Ok(JoinedMatch {
            match_id: matched.match_id.clone().unwrap_or_else(|| "match-1".into()),
            presences: matched.users.clone(),
        })
    }

    async fn leave_match(&self, match_id: &str) -> TransportResult<()> {
        self.ensure_open()?;
        lock(&self.backend.state).leaves.push(match_id.to_string());
        Ok(())
    }

    async fn send_match_state(&self, match_id: &str, envelope: &RealtimeEnvelope) -> TransportResult<()> {
        self.ensure_open()?;
        lock(&self.backend.state)
            .sent
            .push((match_id.to_string(), envelope.clone()));
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.backend.state).socket_closes += 1;
        Ok(())
    }
}
