//! # Matchlink
//!
//! Client-side realtime connection manager for matchmade two-player games.
//! Keeps one authenticated session and socket alive against a game backend,
//! recovers from drops on a bounded backoff and speaks the opcode-tagged
//! round protocol on top.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         MATCHLINK                             │
//! ├──────────────────────────────────────────────────────────────┤
//! │  core/               - Shared primitives                      │
//! │  ├── bus.rs          - Typed event bus                        │
//! │  └── status.rs       - Connection status and error codes      │
//! │                                                               │
//! │  network/            - Transport                              │
//! │  ├── settings.rs     - Endpoint and timing configuration      │
//! │  ├── session.rs      - Authenticated session (JWT claims)     │
//! │  ├── device.rs       - Device id resolution                   │
//! │  ├── transport.rs    - Client/socket traits                   │
//! │  ├── protocol.rs     - Socket wire format                     │
//! │  ├── http.rs         - HTTP RPC + WebSocket backend           │
//! │  └── offline.rs      - Serverless backend                     │
//! │                                                               │
//! │  connection/         - Lifecycle                              │
//! │  ├── manager.rs      - Connect sequence / state machine       │
//! │  ├── heartbeat.rs    - Periodic healthcheck                   │
//! │  └── reconnect.rs    - Backoff supervisor                     │
//! │                                                               │
//! │  game/               - Realtime protocol                      │
//! │  ├── payloads.rs     - Opcode payloads and events             │
//! │  ├── match_session.rs- Active match state                     │
//! │  └── service.rs      - Matchmaking and round dispatch         │
//! │                                                               │
//! │  service.rs          - Everything wired together              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Connect sequence
//!
//! `Disconnected -> Connecting -> Connected`, with each stage able to stop
//! the sequence:
//! - client creation fails: `Error` / `client_create_failed` (not retried)
//! - authentication fails: `Error` / `auth_api_<status>` or `auth_exception`
//! - healthcheck is not `{"status":"ok"}`: `Disconnected` / `healthcheck_failed`
//! - socket fails: `Error` / `socket_api_<status>` or `socket_exception`

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod connection;
pub mod core;
pub mod game;
pub mod network;
pub mod service;

// Re-export commonly used types
pub use crate::core::bus::{EventBus, Subscription};
pub use crate::core::status::{ConnectionStatus, ErrorCode, StatusChanged};
pub use connection::{ConnectError, ConnectionManager, ExhaustionPolicy, ReconnectPolicy};
pub use game::{MatchError, MatchEvent, MatchReady, MatchSession, MatchmakeOutcome, RoundResolved};
pub use network::{Settings, SettingsError};
pub use service::NetworkService;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
