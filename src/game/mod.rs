//! Game Layer
//!
//! Matchmaking and the realtime round protocol on top of a live connection.

pub mod match_session;
pub mod payloads;
pub mod service;

pub use match_session::{MatchSession, MatchmakingTicket};
pub use payloads::{
    MatchEvent, MatchReady, MatchReadyServerPayload, PickPayload, ReadyPlayer, RoundResolved, RoundResultPayload,
    Scores,
};
pub use service::{MatchError, MatchService, MatchmakeOutcome, MATCHMAKER_QUERY, MATCH_PLAYERS};
