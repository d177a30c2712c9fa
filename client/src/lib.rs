//! # Werewolf Game Client Library
//!
//! Player-side implementation of the werewolf protocol. The server only
//! announces phases and records outcomes; the players themselves choose a
//! coordinator for each day and vote through it.
//!
//! ## Architecture Overview
//!
//! ### Reliable Channel
//! One TCP connection to the server carries requests (join, ready, leave,
//! roster lookups) and the server's broadcasts. At most one request is in
//! flight at a time and its reply is matched to the waiting caller.
//!
//! ### Datagram Channel
//! Players talk to each other over a single UDP socket. Outgoing datagrams
//! pass through a loss simulator so the peer protocols are always exercised
//! against dropped messages.
//!
//! ### Coordinator Election
//! At every day start the two highest living player ids compete with a
//! single-decree Paxos. Every living player is an acceptor and forwards what
//! it accepts to the server, which learns the winner from a majority.
//!
//! ### Quorum Voting
//! Once the coordinator is known each voter sends its ballot to it and keeps
//! resending until the vote closes. The coordinator reports the tally to the
//! server as soon as the quorum is complete.
//!
//! ## Module Organization
//!
//! ### Election Module (`election`)
//! Acceptor and proposer state machines, quorum sizes and candidate choice.
//!
//! ### Voting Module (`voting`)
//! Ballot box, day and night quorums, ballot validation.
//!
//! ### Game Module (`game`)
//! The peer's view of roster and phase, and the pluggable vote policy.
//!
//! ### Network Module (`network`)
//! Connection handling and the workers that drive the protocols.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::{Client, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> shared::Result<()> {
//!     let client = Client::connect("127.0.0.1:9999", ClientConfig::default()).await?;
//!
//!     if client.join("alice").await?.map_or(false, |reply| reply.is_ok()) {
//!         client.ready().await?;
//!         let winner = client.run().await?;
//!         println!("winner: {:?}", winner);
//!     }
//!     Ok(())
//! }
//! ```

pub mod election;
pub mod game;
pub mod network;
pub mod voting;
