//! Error taxonomy shared by the server and the peers
//!
//! Errors are split by blast radius:
//! - [`ProtocolError`]: a single frame was unusable. The frame is dropped and
//!   the connection keeps going.
//! - [`StateError`]: a well-formed request was refused by the session. It is
//!   reported back to the caller as a `fail` reply.
//! - [`TransportError`]: the socket itself failed. Fatal to that connection
//!   only.
//! - [`Error::ConsensusTimeout`]: an election or vote round did not gather a
//!   quorum in time. Callers retry, it never escapes the protocol loop.

use std::time::Duration;
use thiserror::Error;

use crate::PlayerId;

pub type Result<T> = std::result::Result<T, Error>;

/// A frame that could not be turned into a [`crate::message::Message`]
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("message has neither a `method` nor a `status` field")]
    MissingDiscriminator,

    #[error("unknown method '{0}'")]
    UnknownMethod(String),

    #[error("incomplete frame exceeds buffer limit of {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("unexpected message: {0}")]
    Unexpected(String),
}

/// A request the session refused in its current state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("already joined")]
    AlreadyJoined,

    #[error("not joined")]
    NotJoined,

    #[error("game is currently running")]
    GameInProgress,

    #[error("server is full")]
    ServerFull,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("username already taken")]
    UsernameTaken,

    #[error("username must not be blank")]
    UsernameBlank,

    #[error("already ready")]
    AlreadyReady,

    #[error("game is not running")]
    NotPlaying,

    #[error("request does not match the current phase")]
    PhaseMismatch,

    #[error("only the elected coordinator may report votes")]
    NotCoordinator,

    #[error("no player with id {0}")]
    UnknownPlayer(PlayerId),

    #[error("player {0} is already dead")]
    PlayerDead(PlayerId),
}

/// Socket-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("peer accepted zero bytes, connection considered closed")]
    ZeroWrite,

    #[error("connection is closed")]
    ConnectionDead,

    #[error("failed to encode message: {0}")]
    Encode(#[from] ProtocolError),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("quorum not reached within {0:?}")]
    ConsensusTimeout(Duration),

    #[error("invalid configuration: {0}")]
    Config(String),
}
