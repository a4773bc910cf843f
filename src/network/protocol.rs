//! Protocol Messages
//!
//! Wire format for the realtime socket. Every frame is a JSON object with
//! an optional `cid` (request correlation id) and exactly one message key,
//! e.g. `{"cid":"1","matchmaker_add":{...}}`. Match data travels as base64
//! inside `match_data_send` / `match_data`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// RPC used for connect-time and periodic health checks.
pub const HEALTHCHECK_RPC_ID: &str = "healthcheck";

// =============================================================================
// REALTIME ENVELOPE
// =============================================================================

/// Opcodes understood by the realtime game layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Client submits an action.
    Pick,
    /// Server resolves a round.
    RoundResult,
    /// Server announces a ready match.
    MatchReady,
}

impl Opcode {
    /// Numeric wire code.
    pub const fn code(self) -> i64 {
        match self {
            Opcode::Pick => 1,
            Opcode::RoundResult => 2,
            Opcode::MatchReady => 3,
        }
    }

    /// Map a wire code back to an opcode.
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Opcode::Pick),
            2 => Some(Opcode::RoundResult),
            3 => Some(Opcode::MatchReady),
            _ => None,
        }
    }
}

/// Opcode plus UTF-8 JSON payload bytes.
///
/// The raw code is kept so unknown opcodes survive until the dispatcher
/// decides to ignore them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeEnvelope {
    /// Raw opcode.
    pub opcode: i64,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl RealtimeEnvelope {
    /// Wrap already-encoded bytes.
    pub fn new(opcode: Opcode, payload: Vec<u8>) -> Self {
        Self {
            opcode: opcode.code(),
            payload,
        }
    }

    /// Serialize `value` as JSON under `opcode`.
    pub fn encode<T: Serialize>(opcode: Opcode, value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(opcode, serde_json::to_vec(value)?))
    }

    /// Parse the payload as JSON.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// The opcode, if it is one we know.
    pub fn known_opcode(&self) -> Option<Opcode> {
        Opcode::from_code(self.opcode)
    }
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Outgoing frame.
#[derive(Debug, Clone, Serialize)]
pub struct ClientEnvelope {
    /// Correlation id; set when a reply is expected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    /// The message.
    #[serde(flatten)]
    pub message: ClientMessage,
}

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join the matchmaker pool.
    MatchmakerAdd(MatchmakerAdd),
    /// Leave the matchmaker pool.
    MatchmakerRemove {
        /// Ticket from the add reply.
        ticket: String,
    },
    /// Join a match by id or matchmaker token.
    MatchJoin(MatchJoin),
    /// Leave a match.
    MatchLeave {
        /// Match to leave.
        match_id: String,
    },
    /// Send match state to other participants.
    MatchDataSend(MatchDataSend),
    /// Liveness ping.
    Ping {},
}

/// Matchmaker request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchmakerAdd {
    /// Matchmaker query, `*` for anyone.
    pub query: String,
    /// Minimum players.
    pub min_count: u32,
    /// Maximum players.
    pub max_count: u32,
}

/// Match join request. Exactly one of the fields is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchJoin {
    /// Known match id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_id: Option<String>,
    /// Matchmaker token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Outgoing match data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchDataSend {
    /// Target match.
    pub match_id: String,
    /// Opcode.
    #[serde(with = "opcode_string")]
    pub op_code: i64,
    /// Payload, base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Incoming frame.
///
/// `message` is `None` for bare acknowledgements (`{"cid":"4"}`) and for
/// message kinds this client does not handle.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEnvelope {
    /// Correlation id echoed from the request.
    #[serde(default)]
    pub cid: Option<String>,
    /// The message.
    #[serde(flatten)]
    pub message: Option<ServerMessage>,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to `matchmaker_add`.
    MatchmakerTicket(MatchmakerTicketInfo),
    /// The matchmaker found opponents.
    MatchmakerMatched(MatchmakerMatchedInfo),
    /// Reply to `match_join`.
    Match(MatchInfo),
    /// Match data from another participant or the server.
    MatchData(MatchDataInfo),
    /// Reply to `ping`.
    Pong {},
    /// Request failed.
    Error(ServerError),
}

/// Matchmaker ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchmakerTicketInfo {
    /// Ticket id.
    pub ticket: String,
}

/// A user's presence on the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPresence {
    /// User id.
    pub user_id: String,
    /// Socket session id.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Username.
    #[serde(default)]
    pub username: Option<String>,
}

/// One matched user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedUser {
    /// The user's presence.
    pub presence: UserPresence,
}

/// Matchmaker result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchmakerMatchedInfo {
    /// Ticket that matched.
    pub ticket: String,
    /// Match id for relayed matches.
    #[serde(default)]
    pub match_id: Option<String>,
    /// Join token for authoritative matches.
    #[serde(default)]
    pub token: Option<String>,
    /// Everyone in the match, including us.
    #[serde(default)]
    pub users: Vec<MatchedUser>,
    /// Our own entry.
    #[serde(rename = "self", default)]
    pub self_user: Option<MatchedUser>,
}

/// Joined match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchInfo {
    /// Match id.
    pub match_id: String,
    /// Whether the server runs the match.
    #[serde(default)]
    pub authoritative: bool,
    /// Current participants.
    #[serde(default)]
    pub presences: Vec<UserPresence>,
}

/// Incoming match data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchDataInfo {
    /// Source match.
    pub match_id: String,
    /// Sender, absent for server-originated data.
    #[serde(default)]
    pub presence: Option<UserPresence>,
    /// Opcode.
    #[serde(with = "opcode_string")]
    pub op_code: i64,
    /// Payload, base64 on the wire.
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Socket-level error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    #[serde(default)]
    pub code: i64,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientEnvelope {
    /// Frame without a correlation id.
    pub fn notify(message: ClientMessage) -> Self {
        Self { cid: None, message }
    }

    /// Frame expecting a reply under `cid`.
    pub fn request(cid: impl Into<String>, message: ClientMessage) -> Self {
        Self {
            cid: Some(cid.into()),
            message,
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerEnvelope {
    /// Deserialize from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Opcodes are int64 on the server and arrive as JSON strings.
mod opcode_string {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(n),
            Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
        }
    }
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// TESTS
// =============================================================================
