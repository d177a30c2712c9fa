//! # Werewolf Game Server Library
//!
//! Authoritative server for the werewolf social-deduction game. It owns the
//! roster and the day/night state machine, relays phase changes to every
//! player over reliable connections, and learns the outcome of the elections
//! and votes the players run among themselves over the datagram channel.
//!
//! ## Core Responsibilities
//!
//! ### Roster and Lobby
//! Players join with a unique username and the address of their datagram
//! socket. Each gets the lowest free slot as its player id. Once every
//! joined player is ready and the minimum player count is reached the game
//! starts: werewolves are drawn at random and each player privately learns
//! its role (werewolves also learn each other's usernames).
//!
//! ### Phases and Win Detection
//! Day and Night alternate until either every werewolf is dead (civilians
//! win) or living werewolves match the living civilians (werewolves win).
//! The roster is re-broadcast before every phase announcement so peers
//! always know who is alive and where to reach them.
//!
//! ### Learning Election and Vote Outcomes
//! The server takes no part in choosing the coordinator. Acceptors forward
//! their accept notices; once a majority of living players accepted the
//! same proposal the coordinator is fixed and the day vote is opened. Only
//! that coordinator may report vote results.
//!
//! ## Module Organization
//!
//! ### Session Module (`session`)
//! Pure state machine with no I/O. Every operation queues its outgoing
//! messages in an outbox.
//!
//! ### Network Module (`network`)
//! TCP listener, one worker task per connection holding the session lock
//! while it applies a request, and a single sender task that writes queued
//! messages in order.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::Server;
//! use shared::GameConfig;
//!
//! #[tokio::main]
//! async fn main() -> shared::Result<()> {
//!     let mut server = Server::new("127.0.0.1:9999", GameConfig::default(), None).await?;
//!
//!     // Runs until the keep-running flag is cleared
//!     server.run().await
//! }
//! ```

pub mod network;
pub mod session;
