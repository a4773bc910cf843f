//! Network Layer
//!
//! Settings, session tokens, the transport traits and their backends.

pub mod device;
pub mod http;
pub mod offline;
pub mod protocol;
pub mod session;
pub mod settings;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod mock;

pub use device::{resolve_device_id, DeviceIdError};
pub use http::HttpTransport;
pub use offline::OfflineTransport;
pub use protocol::{Opcode, RealtimeEnvelope, HEALTHCHECK_RPC_ID};
pub use session::{Session, SessionError};
pub use settings::{BackendKind, Settings, SettingsError};
pub use transport::{
    Connector, DefaultConnector, JoinedMatch, MatchData, MatchmakerMatched, MatchmakerTicket, MatchmakerUser,
    RealtimeEvent, RealtimeSocket, SocketConnection, SocketEvent, TransportClient, TransportError,
    TransportResult,
};
