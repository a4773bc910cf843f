//! Network Service
//!
//! The application-facing entry point. Owns one [`ConnectionManager`] and
//! wires the heartbeat, reconnect supervisor and match service to it. A
//! watchdog task follows status changes: entering `Connected` starts the
//! heartbeat and stops any reconnect loop, leaving it stops the heartbeat
//! and (when enabled) starts the reconnect loop.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionManager, HeartbeatMonitor, ReconnectPolicy, ReconnectSupervisor};
use crate::core::bus::Subscription;
use crate::core::lock;
use crate::core::status::{ConnectionStatus, ErrorCode, StatusChanged};
use crate::game::{MatchError, MatchEvent, MatchService, MatchmakeOutcome};
use crate::network::{resolve_device_id, Connector, DefaultConnector, DeviceIdError, Settings};

struct Watchdog {
    handle: JoinHandle<()>,
    stop_tx: broadcast::Sender<()>,
}

/// Connection, liveness, recovery and matches behind one handle.
pub struct NetworkService {
    manager: Arc<ConnectionManager>,
    heartbeat: Arc<HeartbeatMonitor>,
    supervisor: Arc<ReconnectSupervisor>,
    matches: MatchService,
    auto_reconnect: bool,
    running: Arc<AtomicBool>,
    watchdog: Mutex<Option<Watchdog>>,
}

impl NetworkService {
    /// Build against the backend named in `settings`.
    pub fn new(settings: Settings) -> Result<Self, DeviceIdError> {
        let device_id = resolve_device_id(&settings)?;
        Ok(Self::with_connector(settings, Arc::new(DefaultConnector), device_id))
    }

    /// Build against an explicit connector.
    pub fn with_connector(settings: Settings, connector: Arc<dyn Connector>, device_id: impl Into<String>) -> Self {
        let policy = ReconnectPolicy::from_settings(&settings);
        let interval = settings.heartbeat_interval();
        let auto_reconnect = settings.auto_reconnect;

        let manager = Arc::new(ConnectionManager::new(settings, connector, device_id));
        Self {
            heartbeat: Arc::new(HeartbeatMonitor::new(manager.clone(), interval)),
            supervisor: Arc::new(ReconnectSupervisor::new(manager.clone(), policy)),
            matches: MatchService::new(manager.clone()),
            manager,
            auto_reconnect,
            running: Arc::new(AtomicBool::new(false)),
            watchdog: Mutex::new(None),
        }
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Start the watchdog and the match dispatcher, then connect.
    ///
    /// A failed first connect is retried in the background when
    /// auto-reconnect is on. Returns the status the first attempt settled in.
    pub async fn start(&self) -> ConnectionStatus {
        self.running.store(true, Ordering::SeqCst);
        self.spawn_watchdog();
        self.matches.attach();

        let status = self.manager.connect().await;
        info!(status = %status, "initial connect finished");
        status
    }

    /// Stop recovery and drop the connection. [`start`](Self::start) may be
    /// called again.
    pub async fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.supervisor.stop();
        self.heartbeat.stop();
        self.manager.disconnect().await;
    }

    /// Disconnect, stop every task and drop every subscriber.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.stop_watchdog();
        self.matches.detach();
        self.manager.shutdown().await;
        info!("network service shut down");
    }

    fn spawn_watchdog(&self) {
        let mut watchdog = lock(&self.watchdog);
        if watchdog.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return;
        }

        // Subscribe before spawning so the first connect is observed.
        let status = self.manager.subscribe_status();
        let (stop_tx, stop_rx) = broadcast::channel(1);
        let handle = tokio::spawn(watch(
            status,
            self.heartbeat.clone(),
            self.supervisor.clone(),
            self.running.clone(),
            self.auto_reconnect,
            stop_rx,
        ));
        *watchdog = Some(Watchdog { handle, stop_tx });
    }

    fn stop_watchdog(&self) {
        if let Some(watchdog) = lock(&self.watchdog).take() {
            let _ = watchdog.stop_tx.send(());
            watchdog.handle.abort();
        }
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.manager.status()
    }

    /// Error code of the last failure, cleared on connect.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.manager.error_code()
    }

    /// Subscribe to status changes. The current status is delivered first.
    pub fn subscribe_status(&self) -> Subscription<StatusChanged> {
        self.manager.subscribe_status()
    }

    /// Subscribe to match events.
    pub fn subscribe_matches(&self) -> Subscription<MatchEvent> {
        self.matches.subscribe()
    }

    /// The connection state machine.
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// The heartbeat monitor.
    pub fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.heartbeat
    }

    /// The reconnect supervisor.
    pub fn supervisor(&self) -> &ReconnectSupervisor {
        &self.supervisor
    }

    /// The match service.
    pub fn matches(&self) -> &MatchService {
        &self.matches
    }

    // =========================================================================
    // RPC
    // =========================================================================

    /// Call a server RPC with a raw JSON payload.
    ///
    /// `None` when not connected, on any transport failure, or when the
    /// server replied with nothing.
    pub async fn call_rpc(&self, id: &str, payload: Option<&str>) -> Option<String> {
        if !self.manager.is_connected() {
            warn!(rpc = id, "rpc while {}", self.manager.status());
            return None;
        }
        let client = self.manager.client()?;
        let session = self.manager.session()?;

        let limit = self.manager.settings().request_timeout();
        match tokio::time::timeout(limit, client.rpc(&session, id, payload)).await {
            Ok(Ok(Some(reply))) if !reply.trim().is_empty() => Some(reply),
            Ok(Ok(_)) => {
                debug!(rpc = id, "empty rpc reply");
                None
            }
            Ok(Err(e)) => {
                warn!(rpc = id, code = ?e.status_code(), "rpc failed: {}", e);
                None
            }
            Err(_) => {
                warn!(rpc = id, timeout_ms = limit.as_millis() as u64, "rpc timed out");
                None
            }
        }
    }

    /// Call a server RPC with typed request and response bodies.
    ///
    /// A missing request is sent as `{}`. `None` on any failure, including
    /// a reply that does not decode as `Resp`.
    pub async fn call_rpc_typed<Req, Resp>(&self, id: &str, request: Option<&Req>) -> Option<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = match request {
            Some(request) => match serde_json::to_string(request) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(rpc = id, "failed to encode rpc request: {}", e);
                    return None;
                }
            },
            None => "{}".to_string(),
        };

        let reply = self.call_rpc(id, Some(&payload)).await?;
        match serde_json::from_str(&reply) {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(rpc = id, "failed to decode rpc reply: {}", e);
                None
            }
        }
    }

    // =========================================================================
    // MATCHES
    // =========================================================================

    /// Join the matchmaker.
    pub async fn matchmake(&self) -> Result<MatchmakeOutcome, MatchError> {
        self.matches.start_matchmaking().await
    }

    /// Submit an action in the active match.
    pub async fn send_pick(&self, action: &str) -> Result<(), MatchError> {
        self.matches.submit_action(action).await
    }
}

impl Drop for NetworkService {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop_watchdog();
    }
}

async fn watch(
    mut status: Subscription<StatusChanged>,
    heartbeat: Arc<HeartbeatMonitor>,
    supervisor: Arc<ReconnectSupervisor>,
    running: Arc<AtomicBool>,
    auto_reconnect: bool,
    mut stop_rx: broadcast::Receiver<()>,
) {
    loop {
        let change = tokio::select! {
            _ = stop_rx.recv() => break,
            change = status.recv() => match change {
                Some(change) => change,
                None => break,
            },
        };
        if change.is_replay() {
            continue;
        }

        match change.status {
            ConnectionStatus::Connected => {
                supervisor.stop();
                heartbeat.start();
            }
            ConnectionStatus::Connecting => {}
            ConnectionStatus::Disconnected | ConnectionStatus::Error => {
                heartbeat.stop();

                if !running.load(Ordering::SeqCst) || !auto_reconnect {
                    continue;
                }
                if change.error_code.as_ref().is_some_and(ErrorCode::is_fatal) {
                    warn!(code = ?change.error_code, "not reconnecting after fatal error");
                    continue;
                }
                if supervisor.start() {
                    info!(status = %change.status, code = ?change.error_code, "reconnect scheduled");
                }
            }
        }
    }
    debug!("watchdog finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_util::wait_for_status;
    use crate::network::mock::{MockBackend, MOCK_USER_ID};
    use serde::Deserialize;
    use std::time::Duration;

    fn settings() -> Settings {
        Settings {
            host: "test".into(),
            port: 7350,
            scheme: "http".into(),
            reconnect_delays_ms: vec![60_000],
            ..Default::default()
        }
    }

    fn service(backend: &MockBackend, settings: Settings) -> NetworkService {
        NetworkService::with_connector(settings, backend.connector(), "device-test")
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_start_connects_and_runs_heartbeat() {
        let backend = MockBackend::new();
        let service = service(&backend, settings());

        assert_eq!(service.start().await, ConnectionStatus::Connected);
        let session = service.manager().session().unwrap();
        assert!(!session.user_id().is_empty());

        settle().await;
        assert!(service.heartbeat().is_running());
        assert!(!service.supervisor().is_active());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_degraded_healthcheck_schedules_reconnect() {
        let backend = MockBackend::new();
        backend.set_health(Ok(Some(r#"{"status":"degraded"}"#.into())));
        let service = service(&backend, settings());
        let mut sub = service.subscribe_status();

        assert_eq!(service.start().await, ConnectionStatus::Disconnected);
        let statuses: Vec<_> = sub
            .drain()
            .into_iter()
            .filter(|c| !c.is_replay())
            .map(|c| c.status)
            .collect();
        assert_eq!(statuses, vec![ConnectionStatus::Connecting, ConnectionStatus::Disconnected]);
        assert_eq!(service.error_code(), Some(ErrorCode::HEALTHCHECK_FAILED));

        settle().await;
        assert!(service.supervisor().is_active());
        assert!(!service.heartbeat().is_running());
        service.shutdown().await;
        assert!(!service.supervisor().is_active());
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let backend = MockBackend::new();
        backend.reject_settings(true);
        let service = service(&backend, settings());

        assert_eq!(service.start().await, ConnectionStatus::Error);
        settle().await;
        assert!(!service.supervisor().is_active());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_auto_reconnect_off() {
        let backend = MockBackend::new();
        backend.fail_auth(Some(crate::network::TransportError::Api {
            status: 401,
            message: "nope".into(),
        }));
        let service = service(
            &backend,
            Settings {
                auto_reconnect: false,
                ..settings()
            },
        );

        assert_eq!(service.start().await, ConnectionStatus::Error);
        settle().await;
        assert!(!service.supervisor().is_active());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_socket_drop_recovers() {
        let backend = MockBackend::new();
        let service = service(
            &backend,
            Settings {
                reconnect_delays_ms: vec![10],
                ..settings()
            },
        );
        assert_eq!(service.start().await, ConnectionStatus::Connected);
        let mut sub = service.subscribe_status();

        backend.drop_socket("server restart");
        wait_for_status(&mut sub, ConnectionStatus::Disconnected).await;
        wait_for_status(&mut sub, ConnectionStatus::Connected).await;

        assert_eq!(backend.sockets_opened(), 2);
        settle().await;
        assert!(!service.supervisor().is_active());
        assert!(service.heartbeat().is_running());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_explicit_disconnect_does_not_reconnect() {
        let backend = MockBackend::new();
        let service = service(&backend, settings());
        service.start().await;

        service.disconnect().await;
        settle().await;

        assert_eq!(service.status(), ConnectionStatus::Disconnected);
        assert!(!service.supervisor().is_active());
        assert!(!service.heartbeat().is_running());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_call_rpc() {
        let backend = MockBackend::new();
        backend.set_rpc_reply("echo", Some(r#"{"value":7}"#));
        backend.set_rpc_reply("blank", Some("  "));
        let service = service(&backend, settings());

        assert_eq!(service.call_rpc("echo", None).await, None);
        service.start().await;

        assert_eq!(service.call_rpc("echo", Some("{}")).await.as_deref(), Some(r#"{"value":7}"#));
        assert_eq!(service.call_rpc("blank", None).await, None);
        assert_eq!(service.call_rpc("missing", None).await, None);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_call_rpc_typed() {
        #[derive(Serialize)]
        struct Request {
            name: String,
        }
        #[derive(Debug, Deserialize, PartialEq)]
        struct Reply {
            value: u32,
        }

        let backend = MockBackend::new();
        backend.set_rpc_reply("echo", Some(r#"{"value":7}"#));
        backend.set_rpc_reply("garbage", Some("not json"));
        let service = service(&backend, settings());
        service.start().await;

        let reply: Option<Reply> = service
            .call_rpc_typed("echo", Some(&Request { name: "x".into() }))
            .await;
        assert_eq!(reply, Some(Reply { value: 7 }));

        let reply: Option<Reply> = service.call_rpc_typed::<Request, _>("garbage", None).await;
        assert_eq!(reply, None);

        let calls = backend.rpc_calls();
        assert_eq!(calls[0], ("echo".to_string(), Some(r#"{"name":"x"}"#.to_string())));
        assert_eq!(calls[1], ("garbage".to_string(), Some("{}".to_string())));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_matchmake_and_pick() {
        let backend = MockBackend::new();
        let service = service(&backend, settings());
        service.start().await;
        let mut events = service.subscribe_matches();

        assert!(matches!(service.send_pick("rock").await, Err(MatchError::NotMatched)));
        assert!(matches!(service.matchmake().await, Ok(MatchmakeOutcome::Queued(_))));
        backend.emit_realtime(crate::network::RealtimeEvent::MatchmakerMatched(MockBackend::matched(
            "m1",
            &[(MOCK_USER_ID, "local"), ("user-b", "bob")],
        )));
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, MatchEvent::MatchReady(_)));

        service.send_pick("rock").await.unwrap();
        assert_eq!(backend.sent().len(), 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_ticket_outlives_startup_status_changes() {
        let backend = MockBackend::new();
        let service = service(&backend, settings());
        assert_eq!(service.start().await, ConnectionStatus::Connected);

        // The dispatcher still has Connecting and Connected queued here.
        assert!(matches!(service.matchmake().await, Ok(MatchmakeOutcome::Queued(_))));
        settle().await;
        assert!(service.matches().is_searching());
        assert_eq!(backend.matchmaker_adds().len(), 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_clears_subscribers() {
        let backend = MockBackend::new();
        let service = service(&backend, settings());
        service.start().await;
        let mut sub = service.subscribe_status();

        service.shutdown().await;
        let mut seen = Vec::new();
        while let Some(change) = sub.recv().await {
            seen.push(change.status);
        }
        assert_eq!(seen.last(), Some(&ConnectionStatus::Disconnected));
    }
}
