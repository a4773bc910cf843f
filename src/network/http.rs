//! HTTP + WebSocket Backend
//!
//! Device authentication and RPCs go over HTTP; the realtime socket is a
//! WebSocket split into a reader task and a writer task. Requests that
//! expect a reply carry a `cid` and park a oneshot until the reader sees
//! the matching frame.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use super::protocol::{
    ClientEnvelope, ClientMessage, MatchDataSend, MatchJoin, MatchmakerAdd, RealtimeEnvelope,
    ServerEnvelope, ServerMessage,
};
use super::session::Session;
use super::settings::Settings;
use super::transport::{
    JoinedMatch, MatchmakerMatched, MatchmakerTicket, RealtimeEvent, RealtimeSocket, SocketConnection,
    SocketEvent, TransportClient, TransportError, TransportResult,
};
use crate::core::lock;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingReply = oneshot::Sender<TransportResult<Option<ServerMessage>>>;
type PendingMap = Arc<Mutex<BTreeMap<String, PendingReply>>>;

#[derive(Serialize)]
struct DeviceAuthRequest<'a> {
    id: &'a str,
}

#[derive(Deserialize)]
struct SessionResponse {
    token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    created: bool,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    payload: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

/// HTTP client plus socket factory for a remote server.
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
    socket_url: String,
    server_key: String,
    request_timeout: Duration,
}

impl HttpTransport {
    /// Build a transport for `settings`.
    pub fn new(settings: &Settings) -> TransportResult<Self> {
        settings
            .validate()
            .map_err(|e| TransportError::InvalidSettings(e.to_string()))?;

        let request_timeout = settings.request_timeout();
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::InvalidSettings(e.to_string()))?;

        Ok(Self {
            http,
            base_url: settings.http_base_url(),
            socket_url: settings.socket_url(),
            server_key: settings.effective_server_key(),
            request_timeout,
        })
    }

    fn request_error(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.request_timeout)
        } else {
            TransportError::Request(err.to_string())
        }
    }

    async fn api_error(response: reqwest::Response) -> TransportError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .map(|parsed| parsed.message)
            .unwrap_or(body);
        TransportError::Api { status, message }
    }
}

#[async_trait]
impl TransportClient for HttpTransport {
    fn endpoint(&self) -> String {
        self.base_url.clone()
    }

    async fn authenticate_device(&self, device_id: &str) -> TransportResult<Session> {
        let url = format!("{}/v2/account/authenticate/device", self.base_url);
        let response = self
            .http
            .post(&url)
            .query(&[("create", "true")])
            .basic_auth(&self.server_key, Some(""))
            .json(&DeviceAuthRequest { id: device_id })
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let body: SessionResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let session = Session::from_token(&body.token, body.refresh_token, body.created)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        debug!(user_id = %session.user_id(), created = session.created(), "device authenticated");
        Ok(session)
    }

    async fn rpc(&self, session: &Session, id: &str, payload: Option<&str>) -> TransportResult<Option<String>> {
        let url = format!("{}/v2/rpc/{}", self.base_url, id);
        let mut request = self.http.post(&url).bearer_auth(session.auth_token());
        if let Some(payload) = payload {
            // The RPC body is the payload encoded as a JSON string.
            let body = serde_json::to_string(payload).map_err(|e| TransportError::Protocol(e.to_string()))?;
            request = request.header(CONTENT_TYPE, "application/json").body(body);
        }

        let response = request.send().await.map_err(|e| self.request_error(e))?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let text = response.text().await.map_err(|e| self.request_error(e))?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        let body: RpcResponse = serde_json::from_str(&text).map_err(|e| TransportError::Protocol(e.to_string()))?;
        Ok(body.payload.filter(|p| !p.is_empty()))
    }

    async fn connect_socket(&self, session: &Session, timeout: Duration) -> TransportResult<SocketConnection> {
        let url = format!(
            "{}?lang=en&status=true&token={}",
            self.socket_url,
            session.auth_token()
        );

        let stream = match tokio::time::timeout(timeout, connect_async(url.as_str())).await {
            Err(_) => return Err(TransportError::Timeout(timeout)),
            Ok(Err(WsError::Http(response))) => {
                return Err(TransportError::Api {
                    status: response.status().as_u16(),
                    message: "socket upgrade rejected".into(),
                })
            }
            Ok(Err(e)) => return Err(TransportError::WebSocket(e.to_string())),
            Ok(Ok((stream, _response))) => stream,
        };

        info!(url = %self.socket_url, token = %session.token_fingerprint(), "socket connected");
        let (socket, events) = WsSocket::spawn(stream, self.request_timeout);
        Ok(SocketConnection {
            socket: Arc::new(socket),
            events,
        })
    }
}

// =============================================================================
// SOCKET
// =============================================================================

/// Realtime socket over a WebSocket stream.
pub struct WsSocket {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: PendingMap,
    next_cid: AtomicU64,
    connected: Arc<AtomicBool>,
    request_timeout: Duration,
    reader: JoinHandle<()>,
}

impl WsSocket {
    fn spawn(stream: WsStream, request_timeout: Duration) -> (Self, mpsc::UnboundedReceiver<SocketEvent>) {
        let (sink, source) = stream.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(BTreeMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(write_loop(sink, out_rx));
        let reader = tokio::spawn(read_loop(source, pending.clone(), connected.clone(), event_tx));

        let socket = Self {
            outgoing: out_tx,
            pending,
            next_cid: AtomicU64::new(1),
            connected,
            request_timeout,
            reader,
        };
        (socket, event_rx)
    }

    async fn request(&self, message: ClientMessage) -> TransportResult<Option<ServerMessage>> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let cid = self.next_cid.fetch_add(1, Ordering::Relaxed).to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.pending).insert(cid.clone(), reply_tx);

        let sent = ClientEnvelope::request(cid.clone(), message)
            .to_json()
            .map_err(|e| TransportError::Protocol(e.to_string()))
            .and_then(|text| {
                self.outgoing
                    .send(Message::Text(text))
                    .map_err(|_| TransportError::NotConnected)
            });
        if let Err(e) = sent {
            lock(&self.pending).remove(&cid);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(TransportError::NotConnected),
            Err(_) => {
                lock(&self.pending).remove(&cid);
                Err(TransportError::Timeout(self.request_timeout))
            }
        }
    }

    fn notify(&self, message: ClientMessage) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let text = ClientEnvelope::notify(message)
            .to_json()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.outgoing
            .send(Message::Text(text))
            .map_err(|_| TransportError::NotConnected)
    }
}

fn unexpected(request: &str, reply: Option<ServerMessage>) -> TransportError {
    TransportError::Protocol(format!("unexpected reply to {}: {:?}", request, reply))
}

#[async_trait]
impl RealtimeSocket for WsSocket {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn add_matchmaker(&self, query: &str, min_count: u32, max_count: u32) -> TransportResult<MatchmakerTicket> {
        let reply = self
            .request(ClientMessage::MatchmakerAdd(MatchmakerAdd {
                query: query.into(),
                min_count,
                max_count,
            }))
            .await?;
        match reply {
            Some(ServerMessage::MatchmakerTicket(info)) => Ok(MatchmakerTicket { ticket: info.ticket }),
            other => Err(unexpected("matchmaker_add", other)),
        }
    }

    async fn remove_matchmaker(&self, ticket: &str) -> TransportResult<()> {
        self.request(ClientMessage::MatchmakerRemove { ticket: ticket.into() })
            .await
            .map(|_| ())
    }

    async fn join_match(&self, matched: &MatchmakerMatched) -> TransportResult<JoinedMatch> {
        // Authoritative matches join by token, relayed ones by id.
        let join = match &matched.token {
            Some(token) => MatchJoin {
                match_id: None,
                token: Some(token.clone()),
            },
            None => MatchJoin {
                match_id: matched.match_id.clone(),
                token: None,
            },
        };

        match self.request(ClientMessage::MatchJoin(join)).await? {
            Some(ServerMessage::Match(info)) => Ok(JoinedMatch {
                match_id: info.match_id,
                presences: info.presences.into_iter().map(Into::into).collect(),
            }),
            other => Err(unexpected("match_join", other)),
        }
    }

    async fn leave_match(&self, match_id: &str) -> TransportResult<()> {
        self.request(ClientMessage::MatchLeave {
            match_id: match_id.into(),
        })
        .await
        .map(|_| ())
    }

    async fn send_match_state(&self, match_id: &str, envelope: &RealtimeEnvelope) -> TransportResult<()> {
        self.notify(ClientMessage::MatchDataSend(MatchDataSend {
            match_id: match_id.into(),
            op_code: envelope.opcode,
            data: envelope.payload.clone(),
        }))
    }

    async fn close(&self) -> TransportResult<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.outgoing.send(Message::Close(None));
        }
        Ok(())
    }
}

impl Drop for WsSocket {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut outgoing: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = outgoing.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            debug!("socket write failed: {}", e);
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut source: SplitStream<WsStream>,
    pending: PendingMap,
    connected: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<SocketEvent>,
) {
    let ending = loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => dispatch_frame(&text, &pending, &events),
            Some(Ok(Message::Close(frame))) => {
                break SocketEvent::Closed {
                    reason: frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty()),
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                break SocketEvent::Error {
                    message: e.to_string(),
                }
            }
            None => break SocketEvent::Closed { reason: None },
        }
    };

    connected.store(false, Ordering::SeqCst);
    // Dropping the parked senders fails every in-flight request.
    lock(&pending).clear();
    debug!(event = ?ending, "socket reader finished");
    let _ = events.send(ending);
}

fn dispatch_frame(text: &str, pending: &PendingMap, events: &mpsc::UnboundedSender<SocketEvent>) {
    let envelope = match ServerEnvelope::from_json(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("ignoring malformed frame: {}", e);
            return;
        }
    };

    if let Some(cid) = envelope.cid.as_deref() {
        if let Some(reply) = lock(pending).remove(cid) {
            let result = match envelope.message {
                Some(ServerMessage::Error(err)) => Err(TransportError::Server {
                    code: err.code,
                    message: err.message,
                }),
                other => Ok(other),
            };
            let _ = reply.send(result);
            return;
        }
    }

    let event = match envelope.message {
        Some(ServerMessage::MatchmakerMatched(info)) => RealtimeEvent::MatchmakerMatched(info.into()),
        Some(ServerMessage::MatchData(info)) => RealtimeEvent::MatchData(info.into()),
        Some(ServerMessage::Error(err)) => {
            warn!(code = err.code, "server error: {}", err.message);
            return;
        }
        other => {
            trace!(message = ?other, "ignoring frame");
            return;
        }
    };
    let _ = events.send(SocketEvent::Realtime(event));
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use tokio::net::TcpListener;

    fn parked(pending: &PendingMap, cid: &str) -> oneshot::Receiver<TransportResult<Option<ServerMessage>>> {
        let (tx, rx) = oneshot::channel();
        lock(pending).insert(cid.to_string(), tx);
        rx
    }

    #[test]
    fn test_dispatch_resolves_pending_request() {
        let pending: PendingMap = Arc::default();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut reply = parked(&pending, "5");

        dispatch_frame(r#"{"cid":"5","matchmaker_ticket":{"ticket":"abc"}}"#, &pending, &events_tx);

        match reply.try_recv().unwrap() {
            Ok(Some(ServerMessage::MatchmakerTicket(info))) => assert_eq!(info.ticket, "abc"),
            other => panic!("unexpected reply: {:?}", other),
        }
        assert!(lock(&pending).is_empty());
        assert!(events_rx.try_recv().is_err());
    }

    #[test]
    fn test_dispatch_maps_error_reply() {
        let pending: PendingMap = Arc::default();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let mut reply = parked(&pending, "9");

        dispatch_frame(r#"{"cid":"9","error":{"code":3,"message":"bad query"}}"#, &pending, &events_tx);

        assert!(matches!(
            reply.try_recv().unwrap(),
            Err(TransportError::Server { code: 3, .. })
        ));
    }

    #[test]
    fn test_dispatch_forwards_match_data() {
        let pending: PendingMap = Arc::default();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let frame = json!({
            "match_data": {"match_id": "m1", "op_code": "2", "data": "e30="}
        });

        dispatch_frame(&frame.to_string(), &pending, &events_tx);

        match events_rx.try_recv().unwrap() {
            SocketEvent::Realtime(RealtimeEvent::MatchData(data)) => {
                assert_eq!(data.match_id, "m1");
                assert_eq!(data.envelope.opcode, 2);
                assert_eq!(data.envelope.payload, b"{}".to_vec());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_dispatch_ignores_garbage() {
        let pending: PendingMap = Arc::default();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        dispatch_frame("not json", &pending, &events_tx);
        dispatch_frame(r#"{"status_presence_event":{}}"#, &pending, &events_tx);
        assert!(events_rx.try_recv().is_err());
    }

    #[test]
    fn test_new_rejects_invalid_settings() {
        let settings = Settings {
            scheme: "gopher".into(),
            ..Default::default()
        };
        assert!(matches!(
            HttpTransport::new(&settings),
            Err(TransportError::InvalidSettings(_))
        ));
    }

    #[tokio::test]
    async fn test_socket_request_reply_and_events() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let text = loop {
                if let Message::Text(text) = ws.next().await.unwrap().unwrap() {
                    break text;
                }
            };
            let request: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(request["matchmaker_add"]["query"], "*");
            let cid = request["cid"].as_str().unwrap().to_string();

            ws.send(Message::Text(
                json!({"cid": cid, "matchmaker_ticket": {"ticket": "t-1"}}).to_string(),
            ))
            .await
            .unwrap();
            ws.send(Message::Text(
                json!({"matchmaker_matched": {"ticket": "t-1", "match_id": "m-1", "users": []}}).to_string(),
            ))
            .await
            .unwrap();
            ws.close(None).await.unwrap();
        });

        let settings = Settings {
            host: "127.0.0.1".into(),
            port,
            ..Default::default()
        };
        let transport = HttpTransport::new(&settings).unwrap();
        let session = Session::new("user-1", None, "token", DateTime::<Utc>::MAX_UTC);
        let mut connection = transport
            .connect_socket(&session, Duration::from_secs(5))
            .await
            .unwrap();

        let ticket = connection.socket.add_matchmaker("*", 2, 2).await.unwrap();
        assert_eq!(ticket.ticket, "t-1");

        match connection.events.recv().await.unwrap() {
            SocketEvent::Realtime(RealtimeEvent::MatchmakerMatched(matched)) => {
                assert_eq!(matched.match_id.as_deref(), Some("m-1"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            connection.events.recv().await.unwrap(),
            SocketEvent::Closed { .. }
        ));
        assert!(!connection.socket.is_connected());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_socket_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let settings = Settings {
            host: "127.0.0.1".into(),
            port,
            ..Default::default()
        };
        let transport = HttpTransport::new(&settings).unwrap();
        let session = Session::new("user-1", None, "token", DateTime::<Utc>::MAX_UTC);
        let result = transport.connect_socket(&session, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(TransportError::WebSocket(_))));
    }
}
