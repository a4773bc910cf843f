//! Realtime Payloads
//!
//! JSON bodies carried inside realtime envelopes, and the two events the
//! game layer publishes to the application.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Scores keyed by user id.
pub type Scores = BTreeMap<String, i32>;

// =============================================================================
// CLIENT -> SERVER
// =============================================================================

/// Body of a `pick` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickPayload {
    /// Opaque action string.
    pub action: String,
}

// =============================================================================
// SERVER -> CLIENT
// =============================================================================

/// Body of a `roundResult` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundResultPayload {
    /// Round that was resolved.
    pub round: i32,
    /// Each player's action.
    #[serde(default)]
    pub picks: BTreeMap<String, String>,
    /// Winner, absent on a draw.
    #[serde(default)]
    pub winner_user_id: Option<String>,
    /// Scores after this round.
    #[serde(default)]
    pub scores: Scores,
    /// Round to play next.
    pub next_round: i32,
}

/// A player entry in a `matchReady` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadyPlayer {
    /// Display name.
    #[serde(default)]
    pub username: Option<String>,
}

/// Body of a `matchReady` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchReadyServerPayload {
    /// Message discriminator sent by the server.
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Match id.
    pub match_id: String,
    /// Players keyed by user id.
    pub players: BTreeMap<String, ReadyPlayer>,
    /// Starting scores.
    #[serde(default)]
    pub scores: Scores,
    /// Starting round.
    #[serde(default = "first_round")]
    pub round: i32,
}

fn first_round() -> i32 {
    1
}

// =============================================================================
// EVENTS
// =============================================================================

/// A match is ready to play.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchReady {
    /// Match id.
    pub match_id: String,
    /// Our user id.
    pub local_user_id: Option<String>,
    /// Opponent's user id.
    pub opponent_user_id: Option<String>,
    /// Opponent's display name.
    pub opponent_username: Option<String>,
    /// Current round.
    pub round: i32,
    /// Current scores.
    pub scores: Scores,
}

/// The server resolved a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundResolved {
    /// Round that was resolved.
    pub round: i32,
    /// Each player's action.
    pub picks: BTreeMap<String, String>,
    /// Winner, absent on a draw.
    pub winner_user_id: Option<String>,
    /// Scores after this round.
    pub scores: Scores,
    /// Round to play next.
    pub next_round: i32,
}

impl From<RoundResultPayload> for RoundResolved {
    fn from(payload: RoundResultPayload) -> Self {
        Self {
            round: payload.round,
            picks: payload.picks,
            winner_user_id: payload.winner_user_id.filter(|id| !id.is_empty()),
            scores: payload.scores,
            next_round: payload.next_round,
        }
    }
}

/// Events published by the match service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MatchEvent {
    /// A match is ready.
    MatchReady(MatchReady),
    /// A round was resolved.
    RoundResolved(RoundResolved),
}
