//! Connection Lifecycle
//!
//! The state machine plus the two loops that keep it healthy: the
//! heartbeat while connected and the reconnect supervisor after a drop.

pub mod heartbeat;
pub mod manager;
pub mod reconnect;

pub use heartbeat::HeartbeatMonitor;
pub use manager::{ConnectError, ConnectionManager};
pub use reconnect::{ExhaustionPolicy, ReconnectPolicy, ReconnectSupervisor, DEFAULT_RECONNECT_DELAYS_MS};
