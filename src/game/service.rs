//! Match Service
//!
//! Turns opcode-tagged socket traffic into [`MatchEvent`]s and exposes the
//! outbound commands: join the matchmaker, submit an action, cancel, leave.
//!
//! A dispatcher task consumes the connection's realtime events in arrival
//! order. The socket is looked up on every call, never cached, so a
//! reconnect is picked up transparently.

use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::match_session::{MatchSession, MatchmakingTicket};
use super::payloads::{MatchEvent, MatchReadyServerPayload, PickPayload, RoundResolved, RoundResultPayload};
use crate::connection::ConnectionManager;
use crate::core::bus::{EventBus, Subscription};
use crate::core::lock;
use crate::core::status::{ConnectionStatus, StatusChanged};
use crate::network::{MatchData, MatchmakerMatched, Opcode, RealtimeEnvelope, RealtimeEvent, RealtimeSocket, TransportError};

/// Matchmaker query: any opponent.
pub const MATCHMAKER_QUERY: &str = "*";
/// Players per match.
pub const MATCH_PLAYERS: u32 = 2;

/// Errors returned by match commands.
#[derive(Debug, Error)]
pub enum MatchError {
    /// The connection is not up.
    #[error("not connected")]
    NotConnected,
    /// No match is active.
    #[error("no active match")]
    NotMatched,
    /// Connected but no socket to talk to.
    #[error("matchmaking unavailable: no realtime socket")]
    MatchmakingUnavailable,
    /// The socket call failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The payload could not be encoded.
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result of [`MatchService::start_matchmaking`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchmakeOutcome {
    /// Request accepted with this ticket.
    Queued(String),
    /// A ticket or match already exists; nothing was sent.
    AlreadyActive,
}

#[derive(Debug, Clone, Default)]
enum MatchState {
    #[default]
    Idle,
    Searching(MatchmakingTicket),
    InMatch(MatchSession),
}

struct Shared {
    manager: Arc<ConnectionManager>,
    state: Mutex<MatchState>,
    events: EventBus<MatchEvent>,
}

struct Dispatcher {
    handle: JoinHandle<()>,
    stop_tx: broadcast::Sender<()>,
}

/// Realtime protocol adapter for one connection.
pub struct MatchService {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl MatchService {
    /// Create a detached service.
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            shared: Arc::new(Shared {
                manager,
                state: Mutex::new(MatchState::Idle),
                events: EventBus::new(),
            }),
            dispatcher: Mutex::new(None),
        }
    }

    /// Start consuming realtime events. No-op if already attached.
    pub fn attach(&self) -> bool {
        let mut dispatcher = lock(&self.dispatcher);
        if dispatcher.as_ref().is_some_and(|d| !d.handle.is_finished()) {
            return false;
        }

        // Subscribe before spawning so nothing published in between is lost.
        let realtime = self.shared.manager.subscribe_realtime();
        let status = self.shared.manager.subscribe_status();
        let (stop_tx, stop_rx) = broadcast::channel(1);
        let handle = tokio::spawn(dispatch(self.shared.clone(), realtime, status, stop_rx));
        *dispatcher = Some(Dispatcher { handle, stop_tx });
        debug!("match dispatcher attached");
        true
    }

    /// Stop consuming realtime events.
    pub fn detach(&self) {
        if let Some(dispatcher) = lock(&self.dispatcher).take() {
            let _ = dispatcher.stop_tx.send(());
            dispatcher.handle.abort();
            debug!("match dispatcher detached");
        }
    }

    /// Whether the dispatcher is running.
    pub fn is_attached(&self) -> bool {
        lock(&self.dispatcher)
            .as_ref()
            .is_some_and(|d| !d.handle.is_finished())
    }

    /// Subscribe to match events.
    pub fn subscribe(&self) -> Subscription<MatchEvent> {
        self.shared.events.subscribe()
    }

    /// The active match, if any.
    pub fn match_session(&self) -> Option<MatchSession> {
        match &*lock(&self.shared.state) {
            MatchState::InMatch(session) => Some(session.clone()),
            _ => None,
        }
    }

    /// Whether a matchmaker ticket is pending.
    pub fn is_searching(&self) -> bool {
        matches!(*lock(&self.shared.state), MatchState::Searching(_))
    }

    /// Ask the matchmaker for an opponent.
    pub async fn start_matchmaking(&self) -> Result<MatchmakeOutcome, MatchError> {
        let socket = self.live_socket()?;

        {
            let mut state = lock(&self.shared.state);
            if !matches!(*state, MatchState::Idle) {
                debug!("matchmaking already active");
                return Ok(MatchmakeOutcome::AlreadyActive);
            }
            *state = MatchState::Searching(MatchmakingTicket::default());
        }

        match socket.add_matchmaker(MATCHMAKER_QUERY, MATCH_PLAYERS, MATCH_PLAYERS).await {
            Ok(ticket) => {
                if let MatchState::Searching(pending) = &mut *lock(&self.shared.state) {
                    pending.ticket.get_or_insert_with(|| ticket.ticket.clone());
                }
                info!(ticket = %ticket.ticket, "matchmaking started");
                Ok(MatchmakeOutcome::Queued(ticket.ticket))
            }
            Err(err) => {
                warn!(code = ?err.status_code(), "matchmaker add failed: {}", err);
                let mut state = lock(&self.shared.state);
                if matches!(*state, MatchState::Searching(_)) {
                    *state = MatchState::Idle;
                }
                Err(err.into())
            }
        }
    }

    /// Drop the pending ticket. Returns whether one was pending.
    pub async fn cancel_matchmaking(&self) -> Result<bool, MatchError> {
        let ticket = {
            let mut state = lock(&self.shared.state);
            match std::mem::take(&mut *state) {
                MatchState::Searching(pending) => pending.ticket,
                other => {
                    *state = other;
                    return Ok(false);
                }
            }
        };

        if let (Some(ticket), Some(socket)) = (ticket, self.shared.manager.socket()) {
            socket.remove_matchmaker(&ticket).await?;
            info!(ticket = %ticket, "matchmaking cancelled");
        }
        Ok(true)
    }

    /// Send an action for the current round.
    ///
    /// Returns as soon as the action is sent; the outcome arrives later as
    /// [`MatchEvent::RoundResolved`].
    pub async fn submit_action(&self, action: &str) -> Result<(), MatchError> {
        let match_id = match &*lock(&self.shared.state) {
            MatchState::InMatch(session) => session.match_id().to_string(),
            _ => return Err(MatchError::NotMatched),
        };
        let socket = self.live_socket()?;

        let envelope = RealtimeEnvelope::encode(
            Opcode::Pick,
            &PickPayload {
                action: action.to_string(),
            },
        )?;
        socket.send_match_state(&match_id, &envelope).await?;
        debug!(match_id = %match_id, action, "action submitted");
        Ok(())
    }

    /// Leave the active match and discard it. Returns whether one was active.
    pub async fn leave_match(&self) -> Result<bool, MatchError> {
        let session = {
            let mut state = lock(&self.shared.state);
            match std::mem::take(&mut *state) {
                MatchState::InMatch(session) => session,
                other => {
                    *state = other;
                    return Ok(false);
                }
            }
        };

        if let Some(socket) = self.shared.manager.socket().filter(|s| s.is_connected()) {
            socket.leave_match(session.match_id()).await?;
        }
        info!(match_id = %session.match_id(), "left match");
        Ok(true)
    }

    fn live_socket(&self) -> Result<Arc<dyn RealtimeSocket>, MatchError> {
        if !self.shared.manager.is_connected() {
            return Err(MatchError::NotConnected);
        }
        self.shared
            .manager
            .socket()
            .ok_or(MatchError::MatchmakingUnavailable)
    }
}

impl Drop for MatchService {
    fn drop(&mut self) {
        self.detach();
    }
}

// =============================================================================
// DISPATCH
// =============================================================================

async fn dispatch(
    shared: Arc<Shared>,
    mut realtime: Subscription<RealtimeEvent>,
    mut status: Subscription<StatusChanged>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            event = realtime.recv() => match event {
                Some(RealtimeEvent::MatchmakerMatched(matched)) => on_matched(&shared, matched).await,
                Some(RealtimeEvent::MatchData(data)) => on_match_data(&shared, data),
                None => break,
            },
            change = status.recv() => match change {
                // Changes queue up behind realtime events; only a link that is
                // down right now takes the ticket with it.
                Some(change) if !change.is_replay() && shared.manager.status() != ConnectionStatus::Connected => {
                    let mut state = lock(&shared.state);
                    if matches!(*state, MatchState::Searching(_)) {
                        debug!(status = %change.status, "dropping pending ticket");
                        *state = MatchState::Idle;
                    }
                }
                Some(_) => {}
                None => break,
            },
        }
    }
    debug!("match dispatcher finished");
}

async fn on_matched(shared: &Shared, matched: MatchmakerMatched) {
    if !matches!(*lock(&shared.state), MatchState::Searching(_)) {
        debug!(ticket = %matched.ticket, "ignoring match without pending ticket");
        return;
    }

    let Some(socket) = shared.manager.socket() else {
        warn!("matched without a socket");
        reset_search(shared);
        return;
    };

    let joined = match socket.join_match(&matched).await {
        Ok(joined) => joined,
        Err(err) => {
            warn!(code = ?err.status_code(), "match join failed: {}", err);
            reset_search(shared);
            return;
        }
    };

    let local_user_id = shared
        .manager
        .session()
        .map(|session| session.user_id().to_string())
        .or(matched.self_user_id.clone());
    let session = MatchSession::from_matchmaker(joined.match_id, local_user_id, &matched.users);

    {
        let mut state = lock(&shared.state);
        if !matches!(*state, MatchState::Searching(_)) {
            debug!("matchmaking cancelled during join");
            return;
        }
        *state = MatchState::InMatch(session.clone());
    }

    info!(
        match_id = %session.match_id(),
        opponent = ?session.opponent_user_id(),
        "match ready"
    );
    shared.events.publish(MatchEvent::MatchReady(session.to_ready_event()));
}

fn on_match_data(shared: &Shared, data: MatchData) {
    match data.envelope.known_opcode() {
        Some(Opcode::RoundResult) => {
            let payload: RoundResultPayload = match data.envelope.decode() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(opcode = data.envelope.opcode, "bad round result: {}", e);
                    return;
                }
            };
            let resolved = RoundResolved::from(payload);

            {
                let mut state = lock(&shared.state);
                match &mut *state {
                    MatchState::InMatch(session) if session.match_id() == data.match_id => {
                        session.apply_round(&resolved);
                    }
                    _ => {
                        debug!(match_id = %data.match_id, "round result for unknown match");
                        return;
                    }
                }
            }

            debug!(round = resolved.round, next_round = resolved.next_round, "round resolved");
            shared.events.publish(MatchEvent::RoundResolved(resolved));
        }
        Some(Opcode::MatchReady) => {
            let payload: MatchReadyServerPayload = match data.envelope.decode() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(opcode = data.envelope.opcode, "bad match ready: {}", e);
                    return;
                }
            };
            let local_user_id = shared
                .manager
                .session()
                .map(|session| session.user_id().to_string());
            let session = MatchSession::from_ready_payload(payload, local_user_id);

            {
                let mut state = lock(&shared.state);
                if matches!(*state, MatchState::InMatch(_)) {
                    trace!("already matched");
                    return;
                }
                *state = MatchState::InMatch(session.clone());
            }

            info!(match_id = %session.match_id(), "match ready from server");
            shared.events.publish(MatchEvent::MatchReady(session.to_ready_event()));
        }
        Some(Opcode::Pick) | None => {
            trace!(opcode = data.envelope.opcode, "ignoring match data");
        }
    }
}

fn reset_search(shared: &Shared) {
    let mut state = lock(&shared.state);
    if matches!(*state, MatchState::Searching(_)) {
        *state = MatchState::Idle;
    }
}
