//! Connection State Machine
//!
//! Owns the transport client, the session and the realtime socket, and
//! runs the connect sequence:
//!
//! ```text
//!   create client ─► authenticate device ─► healthcheck ─► open socket
//!        │                   │                   │              │
//!      Error               Error           Disconnected       Error
//! ```
//!
//! Only one sequence runs at a time. `disconnect` never waits for it: it
//! bumps a generation counter and signals teardown, and a sequence whose
//! generation is stale discards its results instead of committing them.

use serde::Deserialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::core::bus::{EventBus, Subscription};
use crate::core::status::{ConnectionStatus, ErrorCode, StatusCell, StatusChanged};
use crate::core::{lock, read, write};
use crate::network::protocol::HEALTHCHECK_RPC_ID;
use crate::network::{
    Connector, RealtimeEvent, RealtimeSocket, Session, Settings, SocketConnection, SocketEvent,
    TransportClient, TransportError, TransportResult,
};

/// Why a connect attempt failed.
#[derive(Debug, Clone, Error)]
pub enum ConnectError {
    /// Settings could not produce a client. Not retried.
    #[error("failed to create client: {0}")]
    ClientCreation(String),
    /// Device authentication failed.
    #[error("authentication failed: {source}")]
    Auth {
        /// Transport failure.
        #[source]
        source: TransportError,
    },
    /// The healthcheck RPC failed or did not report `ok`.
    #[error("healthcheck failed: {0}")]
    Healthcheck(String),
    /// The realtime socket did not open.
    #[error("socket connect failed: {source}")]
    Socket {
        /// Transport failure.
        #[source]
        source: TransportError,
    },
    /// A disconnect superseded the attempt.
    #[error("connect cancelled")]
    Cancelled,
}

impl ConnectError {
    /// Error code recorded for this failure.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            ConnectError::ClientCreation(_) => Some(ErrorCode::CLIENT_CREATE_FAILED),
            ConnectError::Auth { source } => Some(
                source
                    .status_code()
                    .map_or(ErrorCode::AUTH_EXCEPTION, |status| ErrorCode::api("auth", status)),
            ),
            ConnectError::Healthcheck(_) => Some(ErrorCode::HEALTHCHECK_FAILED),
            ConnectError::Socket { source } => Some(
                source
                    .status_code()
                    .map_or(ErrorCode::SOCKET_EXCEPTION, |status| ErrorCode::api("socket", status)),
            ),
            ConnectError::Cancelled => None,
        }
    }

    /// Status the state machine settles in after this failure.
    pub fn resulting_status(&self) -> ConnectionStatus {
        match self {
            ConnectError::Healthcheck(_) | ConnectError::Cancelled => ConnectionStatus::Disconnected,
            _ => ConnectionStatus::Error,
        }
    }

    /// Whether trying again with the same settings can help.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ConnectError::ClientCreation(_))
    }
}

struct Link {
    client: Arc<dyn TransportClient>,
    session: Session,
    socket: Option<Arc<dyn RealtimeSocket>>,
}

/// The connection state machine.
pub struct ConnectionManager {
    settings: Settings,
    connector: Arc<dyn Connector>,
    device_id: String,
    status: Arc<StatusCell>,
    link: Arc<RwLock<Option<Link>>>,
    realtime: EventBus<RealtimeEvent>,
    generation: Arc<AtomicU64>,
    connect_lock: AsyncMutex<()>,
    teardown_tx: broadcast::Sender<()>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a manager in `Disconnected`.
    pub fn new(settings: Settings, connector: Arc<dyn Connector>, device_id: impl Into<String>) -> Self {
        let (teardown_tx, _) = broadcast::channel(4);
        Self {
            settings,
            connector,
            device_id: device_id.into(),
            status: Arc::new(StatusCell::new()),
            link: Arc::new(RwLock::new(None)),
            realtime: EventBus::new(),
            generation: Arc::new(AtomicU64::new(0)),
            connect_lock: AsyncMutex::new(()),
            teardown_tx,
            pump: Mutex::new(None),
        }
    }

    // =========================================================================
    // STATE
    // =========================================================================

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    /// Code of the last failure, cleared on `Connected`.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.status.error_code()
    }

    /// True while `Connected`.
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Status changes, starting with the current value.
    pub fn subscribe_status(&self) -> Subscription<StatusChanged> {
        self.status.subscribe()
    }

    /// Realtime events from the live socket.
    pub fn subscribe_realtime(&self) -> Subscription<RealtimeEvent> {
        self.realtime.subscribe()
    }

    /// The session, while connected or connecting.
    pub fn session(&self) -> Option<Session> {
        read(&self.link).as_ref().map(|link| link.session.clone())
    }

    /// The transport client, while connected or connecting.
    pub fn client(&self) -> Option<Arc<dyn TransportClient>> {
        read(&self.link).as_ref().map(|link| link.client.clone())
    }

    /// The realtime socket, while connected.
    pub fn socket(&self) -> Option<Arc<dyn RealtimeSocket>> {
        read(&self.link).as_ref().and_then(|link| link.socket.clone())
    }

    /// Settings this manager connects with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Device id used for authentication.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    // =========================================================================
    // CONNECT / DISCONNECT
    // =========================================================================

    /// Run the connect sequence and return the status it settled in.
    pub async fn connect(&self) -> ConnectionStatus {
        let _ = self.try_connect().await;
        self.status()
    }

    /// Run the connect sequence, reporting why it failed.
    #[instrument(skip(self), fields(device_id = %self.device_id))]
    pub async fn try_connect(&self) -> Result<(), ConnectError> {
        let _serial = self.connect_lock.lock().await;
        if self.is_connected() && self.socket().is_some() {
            debug!("already connected");
            return Ok(());
        }

        let mut teardown = self.teardown_tx.subscribe();
        let generation = {
            // Disconnect bumps the generation under this lock, so a teardown
            // queued before we hold it belongs to an older attempt.
            let _link = write(&self.link);
            loop {
                match teardown.try_recv() {
                    Ok(()) | Err(TryRecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
            self.status.set(ConnectionStatus::Connecting);
            self.generation.load(Ordering::SeqCst)
        };
        info!("connecting");

        match self.run_sequence(generation, &mut teardown).await {
            Ok(()) => {
                info!("connected");
                Ok(())
            }
            Err(err) => Err(self.settle_failure(generation, err)),
        }
    }

    /// Tear everything down and move to `Disconnected`.
    ///
    /// Cancels an in-flight connect. Close errors are ignored.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) {
        let (link, changed) = {
            let mut guard = write(&self.link);
            self.generation.fetch_add(1, Ordering::SeqCst);
            let _ = self.teardown_tx.send(());
            if let Some(pump) = lock(&self.pump).take() {
                pump.abort();
            }
            (guard.take(), self.status.set(ConnectionStatus::Disconnected))
        };
        if changed {
            info!("disconnected");
        }

        if let Some(socket) = link.and_then(|link| link.socket) {
            match tokio::time::timeout(self.settings.request_timeout(), socket.close()).await {
                Ok(Ok(())) => debug!("socket closed"),
                Ok(Err(e)) => debug!("ignoring socket close error: {}", e),
                Err(_) => debug!("socket close timed out"),
            }
        }
    }

    /// Disconnect and drop every subscriber.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.realtime.clear();
        self.status.clear_subscribers();
    }

    /// One healthcheck RPC against the live session.
    pub async fn healthcheck(&self) -> Result<(), ConnectError> {
        let (client, session) = {
            let link = read(&self.link);
            match link.as_ref() {
                Some(link) => (link.client.clone(), link.session.clone()),
                None => return Err(ConnectError::Healthcheck("no session".into())),
            }
        };

        let limit = self.settings.request_timeout();
        let reply = tokio::time::timeout(limit, client.rpc(&session, HEALTHCHECK_RPC_ID, None))
            .await
            .map_err(|_| ConnectError::Healthcheck(format!("timed out after {:?}", limit)))?
            .map_err(|e| ConnectError::Healthcheck(e.to_string()))?;
        check_health_payload(reply.as_deref()).map_err(ConnectError::Healthcheck)
    }

    /// Demote a live connection after a failed heartbeat.
    pub(crate) fn report_heartbeat_failure(&self) -> bool {
        self.status.fail_if(
            ConnectionStatus::Connected,
            ConnectionStatus::Error,
            ErrorCode::HEARTBEAT_FAILED,
        )
    }

    async fn run_sequence(
        &self,
        generation: u64,
        teardown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ConnectError> {
        let limit = self.settings.request_timeout();

        let client = self
            .connector
            .create_client(&self.settings)
            .map_err(|e| ConnectError::ClientCreation(e.to_string()))?;
        debug!(endpoint = %client.endpoint(), "client created");

        let session = stage(teardown, limit, client.authenticate_device(&self.device_id), |source| {
            ConnectError::Auth { source }
        })
        .await?;
        info!(user_id = %session.user_id(), token = %session.token_fingerprint(), "authenticated");
        self.stash_link(generation, client.clone(), session.clone())?;

        let reply = stage(teardown, limit, client.rpc(&session, HEALTHCHECK_RPC_ID, None), |e| {
            ConnectError::Healthcheck(e.to_string())
        })
        .await?;
        check_health_payload(reply.as_deref()).map_err(ConnectError::Healthcheck)?;
        debug!("healthcheck ok");

        let socket_timeout = self.settings.socket_timeout();
        let connection = stage(teardown, socket_timeout, client.connect_socket(&session, socket_timeout), |source| {
            ConnectError::Socket { source }
        })
        .await?;

        self.commit(generation, connection).await
    }

    fn stash_link(&self, generation: u64, client: Arc<dyn TransportClient>, session: Session) -> Result<(), ConnectError> {
        let mut link = write(&self.link);
        if self.generation.load(Ordering::SeqCst) != generation {
            return Err(ConnectError::Cancelled);
        }
        *link = Some(Link {
            client,
            session,
            socket: None,
        });
        Ok(())
    }

    async fn commit(&self, generation: u64, connection: SocketConnection) -> Result<(), ConnectError> {
        let SocketConnection { socket, events } = connection;
        {
            let mut guard = write(&self.link);
            if self.generation.load(Ordering::SeqCst) == generation {
                if let Some(link) = guard.as_mut() {
                    link.socket = Some(socket.clone());
                    let pump = self.spawn_pump(generation, events);
                    if let Some(stale) = lock(&self.pump).replace(pump) {
                        stale.abort();
                    }
                    self.status.set(ConnectionStatus::Connected);
                    return Ok(());
                }
            }
        }

        let _ = socket.close().await;
        Err(ConnectError::Cancelled)
    }

    /// Record a failed attempt unless a disconnect already superseded it.
    fn settle_failure(&self, generation: u64, err: ConnectError) -> ConnectError {
        let mut link = write(&self.link);
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("connect superseded: {}", err);
            return ConnectError::Cancelled;
        }
        *link = None;

        warn!(code = ?err.error_code(), "connect failed: {}", err);
        match err.error_code() {
            Some(code) => self.status.fail(err.resulting_status(), code),
            None => self.status.set(err.resulting_status()),
        };
        err
    }

    fn spawn_pump(&self, generation: u64, mut events: mpsc::UnboundedReceiver<SocketEvent>) -> JoinHandle<()> {
        let link = self.link.clone();
        let status = self.status.clone();
        let realtime = self.realtime.clone();
        let current = self.generation.clone();

        tokio::spawn(async move {
            let (next, code) = loop {
                match events.recv().await {
                    Some(SocketEvent::Realtime(event)) => {
                        realtime.publish(event);
                    }
                    Some(SocketEvent::Closed { reason }) => {
                        info!(reason = ?reason, "socket closed by peer");
                        break (ConnectionStatus::Disconnected, ErrorCode::SOCKET_CLOSED);
                    }
                    Some(SocketEvent::Error { message }) => {
                        warn!("socket error: {}", message);
                        break (ConnectionStatus::Error, ErrorCode::SOCKET_ERROR);
                    }
                    None => {
                        debug!("socket event stream ended");
                        break (ConnectionStatus::Disconnected, ErrorCode::SOCKET_CLOSED);
                    }
                }
            };

            let mut link = write(&link);
            if current.load(Ordering::SeqCst) == generation {
                *link = None;
                status.fail_if(ConnectionStatus::Connected, next, code);
            }
        })
    }
}

/// Race `fut` against teardown and a deadline.
async fn stage<T, F, M>(
    teardown: &mut broadcast::Receiver<()>,
    limit: Duration,
    fut: F,
    map_err: M,
) -> Result<T, ConnectError>
where
    F: Future<Output = TransportResult<T>>,
    M: FnOnce(TransportError) -> ConnectError,
{
    tokio::select! {
        _ = teardown.recv() => Err(ConnectError::Cancelled),
        outcome = tokio::time::timeout(limit, fut) => match outcome {
            Ok(result) => result.map_err(map_err),
            Err(_) => Err(map_err(TransportError::Timeout(limit))),
        },
    }
}

#[derive(Deserialize)]
struct HealthReply {
    #[serde(default)]
    status: Option<String>,
}

/// Accept a healthcheck reply whose `status` is `ok`, in any case.
fn check_health_payload(payload: Option<&str>) -> Result<(), String> {
    let payload = payload
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| "empty healthcheck reply".to_string())?;
    let reply: HealthReply =
        serde_json::from_str(payload).map_err(|e| format!("malformed healthcheck reply: {}", e))?;

    match reply.status {
        Some(status) if status.trim().eq_ignore_ascii_case("ok") => Ok(()),
        Some(status) => Err(format!("server reported status {:?}", status)),
        None => Err("healthcheck reply has no status".into()),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_util::{changes, wait_for_status};
    use crate::network::mock::{MockBackend, HEALTHY, MOCK_USER_ID};
    use crate::network::{MatchData, Opcode, RealtimeEnvelope};
    use proptest::prelude::*;

    fn manager(backend: &MockBackend) -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager::new(
            Settings::default(),
            backend.connector(),
            "device-test",
        ))
    }

    #[test]
    fn test_health_payload_checks() {
        assert!(check_health_payload(Some(r#"{"status":"ok"}"#)).is_ok());
        assert!(check_health_payload(Some(r#"{"status":"OK"}"#)).is_ok());
        assert!(check_health_payload(Some(r#"{"status":"degraded"}"#)).is_err());
        assert!(check_health_payload(Some(r#"{"uptime":5}"#)).is_err());
        assert!(check_health_payload(Some("not json")).is_err());
        assert!(check_health_payload(Some("  ")).is_err());
        assert!(check_health_payload(None).is_err());
    }

    #[tokio::test]
    async fn test_connect_reaches_connected() {
        let backend = MockBackend::new();
        let manager = manager(&backend);
        let mut sub = manager.subscribe_status();

        assert_eq!(manager.connect().await, ConnectionStatus::Connected);

        let session = manager.session().unwrap();
        assert_eq!(session.user_id(), MOCK_USER_ID);
        assert!(manager.socket().is_some());
        assert!(manager.error_code().is_none());
        assert_eq!(
            changes(&mut sub),
            vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
        );
        assert_eq!(backend.auth_calls(), 1);
        assert_eq!(backend.healthcheck_calls(), 1);
        assert_eq!(backend.sockets_opened(), 1);
    }

    #[tokio::test]
    async fn test_degraded_healthcheck_ends_disconnected() {
        let backend = MockBackend::new();
        backend.set_health(Ok(Some(r#"{"status":"degraded"}"#.into())));
        let manager = manager(&backend);
        let mut sub = manager.subscribe_status();

        let result = manager.try_connect().await;

        assert!(matches!(result, Err(ConnectError::Healthcheck(_))));
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(manager.error_code(), Some(ErrorCode::HEALTHCHECK_FAILED));
        assert!(manager.session().is_none());
        assert_eq!(backend.sockets_opened(), 0);
        assert_eq!(
            changes(&mut sub),
            vec![ConnectionStatus::Connecting, ConnectionStatus::Disconnected]
        );
    }

    #[tokio::test]
    async fn test_auth_failure_codes() {
        let backend = MockBackend::new();
        backend.fail_auth(Some(TransportError::Api {
            status: 401,
            message: "bad key".into(),
        }));
        let manager = manager(&backend);

        assert_eq!(manager.connect().await, ConnectionStatus::Error);
        assert_eq!(manager.error_code(), Some(ErrorCode::api("auth", 401)));
        assert_eq!(backend.healthcheck_calls(), 0);

        backend.fail_auth(Some(TransportError::Request("connection refused".into())));
        assert_eq!(manager.connect().await, ConnectionStatus::Error);
        assert_eq!(manager.error_code(), Some(ErrorCode::AUTH_EXCEPTION));
    }

    #[tokio::test]
    async fn test_invalid_settings_fail_client_creation() {
        let backend = MockBackend::new();
        let settings = Settings {
            host: String::new(),
            ..Default::default()
        };
        let manager = ConnectionManager::new(settings, backend.connector(), "device-test");

        let err = manager.try_connect().await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(manager.status(), ConnectionStatus::Error);
        assert_eq!(manager.error_code(), Some(ErrorCode::CLIENT_CREATE_FAILED));
        assert_eq!(backend.auth_calls(), 0);
    }

    #[tokio::test]
    async fn test_socket_failure_is_error() {
        let backend = MockBackend::new();
        backend.fail_socket(Some(TransportError::WebSocket("refused".into())));
        let manager = manager(&backend);

        assert_eq!(manager.connect().await, ConnectionStatus::Error);
        assert_eq!(manager.error_code(), Some(ErrorCode::SOCKET_EXCEPTION));
        assert!(manager.session().is_none());
    }

    #[tokio::test]
    async fn test_error_code_cleared_on_reconnect() {
        let backend = MockBackend::new();
        backend.fail_socket(Some(TransportError::WebSocket("refused".into())));
        let manager = manager(&backend);
        manager.connect().await;
        assert!(manager.error_code().is_some());

        backend.fail_socket(None);
        assert_eq!(manager.connect().await, ConnectionStatus::Connected);
        assert!(manager.error_code().is_none());
    }

    #[tokio::test]
    async fn test_connect_when_connected_is_noop() {
        let backend = MockBackend::new();
        let manager = manager(&backend);
        manager.connect().await;
        manager.connect().await;
        assert_eq!(backend.auth_calls(), 1);
        assert_eq!(backend.sockets_opened(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_closes_socket() {
        let backend = MockBackend::new();
        let manager = manager(&backend);
        manager.connect().await;
        let mut sub = manager.subscribe_status();

        manager.disconnect().await;
        manager.disconnect().await;

        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert!(manager.session().is_none());
        assert!(manager.socket().is_none());
        assert_eq!(backend.socket_closes(), 1);
        assert_eq!(changes(&mut sub), vec![ConnectionStatus::Disconnected]);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_inflight_connect() {
        let backend = MockBackend::new();
        backend.delay_auth(Duration::from_secs(5));
        let manager = manager(&backend);
        let mut sub = manager.subscribe_status();

        let task = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.try_connect().await })
        };
        wait_for_status(&mut sub, ConnectionStatus::Connecting).await;

        manager.disconnect().await;
        let result = task.await.unwrap();

        assert!(matches!(result, Err(ConnectError::Cancelled)));
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert!(manager.session().is_none());
        assert_eq!(backend.sockets_opened(), 0);
    }

    #[tokio::test]
    async fn test_peer_close_moves_to_disconnected() {
        let backend = MockBackend::new();
        let manager = manager(&backend);
        manager.connect().await;
        let mut sub = manager.subscribe_status();

        assert!(backend.drop_socket("server restart"));
        let change = wait_for_status(&mut sub, ConnectionStatus::Disconnected).await;

        assert_eq!(change.error_code, Some(ErrorCode::SOCKET_CLOSED));
        assert!(manager.session().is_none());
    }

    #[tokio::test]
    async fn test_socket_error_moves_to_error() {
        let backend = MockBackend::new();
        let manager = manager(&backend);
        manager.connect().await;
        let mut sub = manager.subscribe_status();

        backend.emit(SocketEvent::Error {
            message: "reset by peer".into(),
        });
        let change = wait_for_status(&mut sub, ConnectionStatus::Error).await;
        assert_eq!(change.error_code, Some(ErrorCode::SOCKET_ERROR));
    }

    #[tokio::test]
    async fn test_realtime_events_are_forwarded_in_order() {
        let backend = MockBackend::new();
        let manager = manager(&backend);
        let mut events = manager.subscribe_realtime();
        manager.connect().await;

        for round in 1..=3u8 {
            backend.emit_realtime(RealtimeEvent::MatchData(MatchData {
                match_id: "m1".into(),
                sender_user_id: None,
                envelope: RealtimeEnvelope::new(Opcode::RoundResult, vec![round]),
            }));
        }

        for round in 1..=3u8 {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            match event {
                RealtimeEvent::MatchData(data) => assert_eq!(data.envelope.payload, vec![round]),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_healthcheck_uses_live_session() {
        let backend = MockBackend::new();
        let manager = manager(&backend);
        assert!(manager.healthcheck().await.is_err());

        manager.connect().await;
        assert!(manager.healthcheck().await.is_ok());

        backend.push_health(Err(TransportError::Timeout(Duration::from_secs(1))));
        assert!(matches!(
            manager.healthcheck().await,
            Err(ConnectError::Healthcheck(_))
        ));
        assert_eq!(backend.healthcheck_calls(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_ends_subscriptions() {
        let backend = MockBackend::new();
        let manager = manager(&backend);
        manager.connect().await;
        let mut sub = manager.subscribe_status();
        sub.drain();

        manager.shutdown().await;

        assert_eq!(sub.recv().await.map(|c| c.status), Some(ConnectionStatus::Disconnected));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_disconnect_never_strands_connecting() {
        let backend = MockBackend::new();
        let manager = manager(&backend);

        for _ in 0..200 {
            let connect = {
                let manager = manager.clone();
                tokio::spawn(async move { manager.connect().await })
            };
            let disconnect = {
                let manager = manager.clone();
                tokio::spawn(async move { manager.disconnect().await })
            };
            connect.await.unwrap();
            disconnect.await.unwrap();

            let status = manager.status();
            assert_ne!(status, ConnectionStatus::Connecting);
            assert_eq!(status == ConnectionStatus::Connected, manager.socket().is_some());
            manager.disconnect().await;
        }
    }

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Connect,
        Disconnect,
        PeerClose,
        PeerError,
        Degraded(bool),
        ConnectRacingDisconnect,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            Just(Step::Connect),
            Just(Step::Disconnect),
            Just(Step::PeerClose),
            Just(Step::PeerError),
            any::<bool>().prop_map(Step::Degraded),
            Just(Step::ConnectRacingDisconnect),
        ]
    }

    async fn run_steps(steps: Vec<Step>) -> Vec<StatusChanged> {
        let backend = MockBackend::new();
        let manager = manager(&backend);
        let mut sub = manager.subscribe_status();

        for step in steps {
            match step {
                Step::Connect => {
                    manager.connect().await;
                }
                Step::Disconnect => manager.disconnect().await,
                Step::PeerClose => {
                    backend.drop_socket("peer went away");
                }
                Step::PeerError => {
                    backend.emit(SocketEvent::Error {
                        message: "reset by peer".into(),
                    });
                }
                Step::Degraded(degraded) => {
                    let reply = if degraded { r#"{"status":"degraded"}"# } else { HEALTHY };
                    backend.set_health(Ok(Some(reply.into())));
                }
                Step::ConnectRacingDisconnect => {
                    tokio::join!(manager.connect(), manager.disconnect());
                }
            }
            // Let the socket pump observe injected events.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        manager.disconnect().await;
        sub.drain()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_connected_is_always_entered_from_connecting(
            steps in proptest::collection::vec(step(), 1..24),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let history = runtime.block_on(run_steps(steps));

            prop_assert!(history.first().is_some_and(StatusChanged::is_replay));
            for change in history.iter().skip(1) {
                prop_assert_ne!(change.previous, change.status);
                if change.status == ConnectionStatus::Connected {
                    prop_assert_eq!(change.previous, ConnectionStatus::Connecting);
                }
            }
            prop_assert_eq!(
                history.last().map(|c| c.status),
                Some(ConnectionStatus::Disconnected)
            );
        }
    }
}
