// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Session lifecycle states.

use core::fmt;
use serde::{Deserialize, Serialize};

/// Lifecycle state of one accumulation window.
///
/// States only ever move forward along
/// `Active → Claiming → Claimed → Proving → Settled`, or jump to `Expired`
/// from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Active,
    Claiming,
    Claimed,
    Proving,
    Settled,
    Expired,
}

impl SessionState {
    pub const ALL: [SessionState; 6] = [
        SessionState::Active,
        SessionState::Claiming,
        SessionState::Claimed,
        SessionState::Proving,
        SessionState::Settled,
        SessionState::Expired,
    ];

    pub const NON_TERMINAL: [SessionState; 4] = [
        SessionState::Active,
        SessionState::Claiming,
        SessionState::Claimed,
        SessionState::Proving,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Active => "active",
            SessionState::Claiming => "claiming",
            SessionState::Claimed => "claimed",
            SessionState::Proving => "proving",
            SessionState::Settled => "settled",
            SessionState::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Settled | SessionState::Expired)
    }

    fn rank(&self) -> u8 {
        match self {
            SessionState::Active => 0,
            SessionState::Claiming => 1,
            SessionState::Claimed => 2,
            SessionState::Proving => 3,
            SessionState::Settled | SessionState::Expired => 4,
        }
    }

    /// Whether moving from `self` to `next` keeps the state sequence monotone.
    /// Staying in the same state is always allowed.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        if *self == next {
            return true;
        }
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn parse(s: &str) -> Option<SessionState> {
        SessionState::ALL.iter().copied().find(|state| state.as_str() == s)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
