use serde::{Deserialize, Serialize};
use std::fmt;

pub mod error;
pub mod framing;
pub mod message;
pub mod transport;

pub use error::{Error, ProtocolError, Result, StateError, TransportError};
pub use message::{ClientInfo, Message, Method, Response, Status, VoteStatus};

pub const MIN_PLAYERS: usize = 6;
pub const MAX_PLAYERS: usize = 8;
pub const MAX_WEREWOLVES: usize = 2;
pub const DEFAULT_RETRY_BUDGET: u32 = 2;

/// Slot index of a player inside the session roster
pub type PlayerId = u32;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Civilian,
    Werewolf,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Civilian => write!(f, "civilian"),
            Role::Werewolf => write!(f, "werewolf"),
        }
    }
}

/// Day or night half of a game turn
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Time {
    Day,
    Night,
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Time::Day => write!(f, "day"),
            Time::Night => write!(f, "night"),
        }
    }
}

/// Election proposal number: `(sequence_number, proposer_id)`.
///
/// The derived ordering is lexicographic, so two proposers can never produce
/// equal ids and ties on the sequence number are broken by proposer id.
/// Serialized as a two-element JSON array.
#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub struct ProposalId(pub u64, pub PlayerId);

impl ProposalId {
    pub fn new(sequence: u64, proposer: PlayerId) -> Self {
        Self(sequence, proposer)
    }

    pub fn sequence(&self) -> u64 {
        self.0
    }

    pub fn proposer(&self) -> PlayerId {
        self.1
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.0, self.1)
    }
}

/// Rules of a single game, shared by the server and the peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameConfig {
    pub min_players: usize,
    pub max_players: usize,
    pub max_werewolves: usize,
    /// Undecided day votes tolerated before the phase is forced forward
    pub retry_budget: u32,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            min_players: MIN_PLAYERS,
            max_players: MAX_PLAYERS,
            max_werewolves: MAX_WEREWOLVES,
            retry_budget: DEFAULT_RETRY_BUDGET,
        }
    }
}

impl GameConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_players > self.max_players {
            return Err(Error::Config(format!(
                "min players ({}) exceeds max players ({})",
                self.min_players, self.max_players
            )));
        }
        if self.max_werewolves == 0 {
            return Err(Error::Config("at least one werewolf is required".into()));
        }
        // Werewolves must start as a strict minority or the game is over at once
        if self.max_werewolves * 2 >= self.min_players {
            return Err(Error::Config(format!(
                "{} werewolves cannot start a game of {} players",
                self.max_werewolves, self.min_players
            )));
        }
        Ok(())
    }
}
