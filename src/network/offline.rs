//! Offline Backend
//!
//! Lets the client run without a server: authentication always succeeds,
//! the healthcheck reports `ok`, other RPCs return nothing and the socket
//! stays open but never produces events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use super::protocol::{RealtimeEnvelope, HEALTHCHECK_RPC_ID};
use super::session::Session;
use super::transport::{
    JoinedMatch, MatchmakerMatched, MatchmakerTicket, RealtimeSocket, SocketConnection, SocketEvent,
    TransportClient, TransportError, TransportResult,
};
use crate::core::lock;

const HEALTHY: &str = r#"{"status":"ok"}"#;

/// Transport that never leaves the process.
#[derive(Debug, Default)]
pub struct OfflineTransport;

impl OfflineTransport {
    /// Create an offline transport.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportClient for OfflineTransport {
    fn endpoint(&self) -> String {
        "offline".into()
    }

    async fn authenticate_device(&self, device_id: &str) -> TransportResult<Session> {
        Ok(Session::new(
            format!("offline-{}", device_id),
            Some("offline".into()),
            "offline",
            DateTime::<Utc>::MAX_UTC,
        ))
    }

    async fn rpc(&self, _session: &Session, id: &str, _payload: Option<&str>) -> TransportResult<Option<String>> {
        if id == HEALTHCHECK_RPC_ID {
            Ok(Some(HEALTHY.into()))
        } else {
            debug!(rpc = id, "offline backend has no rpc handlers");
            Ok(None)
        }
    }

    async fn connect_socket(&self, _session: &Session, _timeout: Duration) -> TransportResult<SocketConnection> {
        let (events_tx, events) = mpsc::unbounded_channel();
        Ok(SocketConnection {
            socket: Arc::new(OfflineSocket {
                connected: AtomicBool::new(true),
                events: Mutex::new(Some(events_tx)),
            }),
            events,
        })
    }
}

/// Socket that accepts sends and never receives.
struct OfflineSocket {
    connected: AtomicBool,
    events: Mutex<Option<mpsc::UnboundedSender<SocketEvent>>>,
}

#[async_trait]
impl RealtimeSocket for OfflineSocket {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn add_matchmaker(&self, _query: &str, _min: u32, _max: u32) -> TransportResult<MatchmakerTicket> {
        Err(TransportError::Unsupported("matchmaking"))
    }

    async fn remove_matchmaker(&self, _ticket: &str) -> TransportResult<()> {
        Ok(())
    }

    async fn join_match(&self, _matched: &MatchmakerMatched) -> TransportResult<JoinedMatch> {
        Err(TransportError::Unsupported("matchmaking"))
    }

    async fn leave_match(&self, _match_id: &str) -> TransportResult<()> {
        Ok(())
    }

    async fn send_match_state(&self, _match_id: &str, _envelope: &RealtimeEnvelope) -> TransportResult<()> {
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        // Ends the event stream.
        lock(&self.events).take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::Opcode;

    #[tokio::test]
    async fn test_offline_session_and_healthcheck() {
        let transport = OfflineTransport::new();
        let session = transport.authenticate_device("dev-1").await.unwrap();
        assert_eq!(session.user_id(), "offline-dev-1");
        assert!(!session.is_expired());

        let health = transport.rpc(&session, HEALTHCHECK_RPC_ID, None).await.unwrap();
        assert_eq!(health.as_deref(), Some(HEALTHY));
        assert_eq!(transport.rpc(&session, "leaderboard", Some("{}")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_offline_socket_accepts_sends_and_refuses_matchmaking() {
        let transport = OfflineTransport::new();
        let session = transport.authenticate_device("dev-1").await.unwrap();
        let mut connection = transport
            .connect_socket(&session, Duration::from_secs(1))
            .await
            .unwrap();

        let envelope = RealtimeEnvelope::new(Opcode::Pick, b"{}".to_vec());
        assert!(connection.socket.send_match_state("m", &envelope).await.is_ok());
        assert!(matches!(
            connection.socket.add_matchmaker("*", 2, 2).await,
            Err(TransportError::Unsupported(_))
        ));
        assert!(connection.events.try_recv().is_err());

        connection.socket.close().await.unwrap();
        assert!(!connection.socket.is_connected());
        assert!(connection.events.recv().await.is_none());
    }
}
