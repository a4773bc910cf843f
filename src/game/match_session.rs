//! Match Session
//!
//! Client-side view of one two-player match: who we are, who we play
//! against, the current round and the running scores. Created when a match
//! becomes ready and advanced only by resolved rounds.

use super::payloads::{MatchReady, MatchReadyServerPayload, RoundResolved, Scores};
use crate::network::MatchmakerUser;

/// A pending matchmaker request.
///
/// The ticket is `None` between sending the request and the server's reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchmakingTicket {
    /// Ticket id once assigned.
    pub ticket: Option<String>,
}

/// State of an active match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchSession {
    match_id: String,
    local_user_id: Option<String>,
    opponent_user_id: Option<String>,
    opponent_username: Option<String>,
    round: i32,
    scores: Scores,
}

impl MatchSession {
    /// Build from a matchmaker result.
    ///
    /// The opponent is the first matched user that is not us. Both players
    /// start at zero in round 1.
    pub fn from_matchmaker(
        match_id: impl Into<String>,
        local_user_id: Option<String>,
        users: &[MatchmakerUser],
    ) -> Self {
        let opponent = users
            .iter()
            .find(|user| Some(user.user_id.as_str()) != local_user_id.as_deref());

        let mut scores = Scores::new();
        if let Some(local) = &local_user_id {
            scores.insert(local.clone(), 0);
        }
        if let Some(opponent) = opponent {
            scores.insert(opponent.user_id.clone(), 0);
        }

        Self {
            match_id: match_id.into(),
            opponent_user_id: opponent.map(|user| user.user_id.clone()),
            opponent_username: opponent.and_then(|user| user.username.clone()),
            local_user_id,
            round: 1,
            scores,
        }
    }

    /// Build from a server `matchReady` payload.
    pub fn from_ready_payload(payload: MatchReadyServerPayload, local_user_id: Option<String>) -> Self {
        let opponent = payload
            .players
            .iter()
            .find(|(id, _)| Some(id.as_str()) != local_user_id.as_deref());

        Self {
            opponent_user_id: opponent.map(|(id, _)| id.clone()),
            opponent_username: opponent.and_then(|(_, player)| player.username.clone()),
            match_id: payload.match_id,
            local_user_id,
            round: payload.round,
            scores: payload.scores,
        }
    }

    /// Advance to the next round and merge the reported scores.
    pub fn apply_round(&mut self, resolved: &RoundResolved) {
        self.round = resolved.next_round;
        for (user_id, score) in &resolved.scores {
            self.scores.insert(user_id.clone(), *score);
        }
    }

    /// Snapshot as a ready event.
    pub fn to_ready_event(&self) -> MatchReady {
        MatchReady {
            match_id: self.match_id.clone(),
            local_user_id: self.local_user_id.clone(),
            opponent_user_id: self.opponent_user_id.clone(),
            opponent_username: self.opponent_username.clone(),
            round: self.round,
            scores: self.scores.clone(),
        }
    }

    /// Match id.
    pub fn match_id(&self) -> &str {
        &self.match_id
    }

    /// Our user id.
    pub fn local_user_id(&self) -> Option<&str> {
        self.local_user_id.as_deref()
    }

    /// Opponent's user id.
    pub fn opponent_user_id(&self) -> Option<&str> {
        self.opponent_user_id.as_deref()
    }

    /// Opponent's display name.
    pub fn opponent_username(&self) -> Option<&str> {
        self.opponent_username.as_deref()
    }

    /// Round currently being played.
    pub fn round(&self) -> i32 {
        self.round
    }

    /// Scores by user id.
    pub fn scores(&self) -> &Scores {
        &self.scores
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::payloads::ReadyPlayer;
    use std::collections::BTreeMap;

    fn user(id: &str, name: &str) -> MatchmakerUser {
        MatchmakerUser {
            user_id: id.into(),
            username: Some(name.into()),
        }
    }

    #[test]
    fn test_matchmaker_picks_first_other_user() {
        let users = [user("me", "alice"), user("them", "bob"), user("third", "carol")];
        let session = MatchSession::from_matchmaker("m1", Some("me".into()), &users);

        assert_eq!(session.opponent_user_id(), Some("them"));
        assert_eq!(session.opponent_username(), Some("bob"));
        assert_eq!(session.round(), 1);
        assert_eq!(session.scores().len(), 2);
        assert!(session.scores().values().all(|score| *score == 0));
    }

    #[test]
    fn test_matchmaker_without_opponent() {
        let session = MatchSession::from_matchmaker("m1", Some("me".into()), &[user("me", "alice")]);
        assert_eq!(session.opponent_user_id(), None);
        assert_eq!(session.scores().len(), 1);
    }

    #[test]
    fn test_ready_payload_keeps_server_scores() {
        let mut players = BTreeMap::new();
        players.insert("a".to_string(), ReadyPlayer { username: Some("alice".into()) });
        players.insert("b".to_string(), ReadyPlayer { username: Some("bob".into()) });
        let payload = MatchReadyServerPayload {
            kind: None,
            match_id: "m2".into(),
            players,
            scores: [("a".to_string(), 2), ("b".to_string(), 1)].into_iter().collect(),
            round: 4,
        };

        let session = MatchSession::from_ready_payload(payload, Some("b".into()));
        assert_eq!(session.opponent_user_id(), Some("a"));
        assert_eq!(session.opponent_username(), Some("alice"));
        assert_eq!(session.round(), 4);
        assert_eq!(session.scores()["a"], 2);
    }

    #[test]
    fn test_apply_round_merges_scores() {
        let users = [user("A", "a"), user("B", "b")];
        let mut session = MatchSession::from_matchmaker("m1", Some("A".into()), &users);

        session.apply_round(&RoundResolved {
            round: 1,
            picks: BTreeMap::new(),
            winner_user_id: Some("A".into()),
            scores: [("A".to_string(), 1)].into_iter().collect(),
            next_round: 2,
        });

        assert_eq!(session.round(), 2);
        assert_eq!(session.scores()["A"], 1);
        assert_eq!(session.scores()["B"], 0);
        assert_eq!(session.to_ready_event().round, 2);
    }
}
