//! Authoritative game session: roster, readiness quorum, day/night phases,
//! coordinator learning and win detection
//!
//! The session performs no I/O. Every operation mutates state and queues the
//! resulting messages in an outbox as [`Outbound`] entries; the network layer
//! drains the outbox while still holding the session lock, so messages leave
//! in exactly the order the mutations happened.
//!
//! Callers are identified by the address of their reliable connection.

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use shared::{
    ClientInfo, GameConfig, Message, Method, PlayerId, ProposalId, Response, Role, StateError,
    Time, VoteStatus,
};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};

/// A player holding one roster slot
#[derive(Debug, Clone)]
pub struct Player {
    /// Slot index, doubles as the public player id
    pub id: PlayerId,
    pub username: String,
    /// Address of the reliable connection
    pub address: SocketAddr,
    /// Address peers use to reach this player on the datagram channel
    pub peer_address: SocketAddr,
    pub is_alive: bool,
    pub role: Role,
    /// Only meaningful in the lobby
    pub is_ready: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Lobby,
    Day,
    Night,
    GameOver(Role),
}

impl Phase {
    pub fn time(&self) -> Option<Time> {
        match self {
            Phase::Day => Some(Time::Day),
            Phase::Night => Some(Time::Night),
            _ => None,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.time().is_some()
    }
}

/// A message addressed to one reliable connection
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub addr: SocketAddr,
    pub message: Message,
}

/// Accept notices collected for one proposal
#[derive(Debug)]
struct AcceptedProposal {
    kpu_id: PlayerId,
    acceptors: HashSet<PlayerId>,
}

pub struct Session {
    config: GameConfig,
    phase: Phase,
    day_counter: u32,
    slots: Vec<Option<Player>>,
    retry_budget: u32,
    last_killed: Option<PlayerId>,
    kpu_id: Option<PlayerId>,
    accepted: HashMap<ProposalId, AcceptedProposal>,
    outbox: Vec<Outbound>,
    rng: StdRng,
}

impl Session {
    pub fn new(config: GameConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Session with reproducible werewolf assignment
    pub fn with_seed(config: GameConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: GameConfig, rng: StdRng) -> Self {
        let slots = vec![None; config.max_players];
        let retry_budget = config.retry_budget;
        Self {
            config,
            phase: Phase::Lobby,
            day_counter: 0,
            slots,
            retry_budget,
            last_killed: None,
            kpu_id: None,
            accepted: HashMap::new(),
            outbox: Vec::new(),
            rng,
        }
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn day_counter(&self) -> u32 {
        self.day_counter
    }

    pub fn kpu_id(&self) -> Option<PlayerId> {
        self.kpu_id
    }

    pub fn retry_budget(&self) -> u32 {
        self.retry_budget
    }

    pub fn last_killed(&self) -> Option<PlayerId> {
        self.last_killed
    }

    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.slots.iter().flatten()
    }

    pub fn player(&self, id: PlayerId) -> Option<&Player> {
        self.slots.get(id as usize).and_then(|slot| slot.as_ref())
    }

    pub fn player_count(&self) -> usize {
        self.players().count()
    }

    pub fn find_by_address(&self, addr: SocketAddr) -> Option<&Player> {
        self.players().find(|player| player.address == addr)
    }

    /// Messages queued since the last call
    pub fn take_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    /// Dispatches one request from the connection at `caller`.
    ///
    /// Returns the reply for the caller, or `None` for one-way notifications.
    pub fn handle(&mut self, caller: SocketAddr, method: Method) -> Option<Response> {
        match method {
            Method::Join {
                username,
                udp_address,
                udp_port,
            } => Some(match self.join(caller, username, udp_address, udp_port) {
                Ok(player_id) => Response::ok().with_player_id(player_id),
                Err(e) => Response::fail(e.to_string()),
            }),
            Method::Leave => Some(reply(self.leave(caller))),
            Method::Ready => Some(reply(self.ready(caller))),
            Method::ClientAddress => Some(Response::ok().with_clients(self.roster_snapshot())),
            Method::AcceptProposal {
                proposal_id,
                kpu_id,
                ..
            } => {
                if let Err(e) = self.learn_accepted(caller, proposal_id, kpu_id) {
                    warn!("Ignoring accept notice from {}: {}", caller, e);
                }
                None
            }
            Method::VoteResult {
                time,
                vote_status,
                vote_result,
                player_killed,
            } => {
                if let Err(e) =
                    self.apply_vote_result(caller, time, vote_status, &vote_result, player_killed)
                {
                    warn!("Ignoring vote result from {}: {}", caller, e);
                }
                None
            }
            other => Some(Response::error(format!(
                "method '{}' is not accepted by the server",
                other.name()
            ))),
        }
    }

    pub fn join(
        &mut self,
        caller: SocketAddr,
        username: Option<String>,
        udp_address: Option<String>,
        udp_port: Option<u16>,
    ) -> Result<PlayerId, StateError> {
        if self.find_by_address(caller).is_some() {
            return Err(StateError::AlreadyJoined);
        }
        if self.phase != Phase::Lobby {
            return Err(StateError::GameInProgress);
        }
        let slot = self
            .slots
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(StateError::ServerFull)?;

        let username =
            username.ok_or_else(|| StateError::InvalidRequest("missing username".into()))?;
        let ip: IpAddr = udp_address
            .ok_or_else(|| StateError::InvalidRequest("missing udp_address".into()))?
            .parse()
            .map_err(|_| StateError::InvalidRequest("udp_address is not an IP address".into()))?;
        let port = match udp_port {
            Some(0) | None => {
                return Err(StateError::InvalidRequest("missing udp_port".into()));
            }
            Some(port) => port,
        };

        let username = username.trim().to_string();
        if username.is_empty() {
            return Err(StateError::UsernameBlank);
        }
        if self.players().any(|player| player.username == username) {
            return Err(StateError::UsernameTaken);
        }

        let id = slot as PlayerId;
        info!("Player {} '{}' joined from {}", id, username, caller);
        self.slots[slot] = Some(Player {
            id,
            username,
            address: caller,
            peer_address: SocketAddr::new(ip, port),
            is_alive: true,
            role: Role::Civilian,
            is_ready: false,
        });
        self.broadcast_roster();

        Ok(id)
    }

    pub fn leave(&mut self, caller: SocketAddr) -> Result<(), StateError> {
        let id = self
            .find_by_address(caller)
            .map(|player| player.id)
            .ok_or(StateError::NotJoined)?;
        self.remove_player(id);
        Ok(())
    }

    /// Same as [`leave`](Self::leave) for a connection that went away,
    /// silently ignoring connections that never joined
    pub fn disconnect(&mut self, caller: SocketAddr) {
        if self.leave(caller).is_ok() {
            debug!("Freed slot of disconnected client {}", caller);
        }
    }

    pub fn ready(&mut self, caller: SocketAddr) -> Result<(), StateError> {
        let phase = self.phase;
        let player = self
            .slots
            .iter_mut()
            .flatten()
            .find(|player| player.address == caller)
            .ok_or(StateError::NotJoined)?;

        if phase != Phase::Lobby {
            return Err(StateError::GameInProgress);
        }
        if player.is_ready {
            return Err(StateError::AlreadyReady);
        }

        player.is_ready = true;
        info!("Player {} '{}' is ready", player.id, player.username);
        self.start_if_quorum();
        Ok(())
    }

    fn start_if_quorum(&mut self) {
        let joined = self.player_count();
        let ready = self.players().filter(|player| player.is_ready).count();
        if ready == joined && joined >= self.config.min_players {
            self.start_game();
        }
    }

    /// Assigns roles and opens day 1. No-op outside the lobby or below the
    /// minimum player count.
    pub fn start_game(&mut self) {
        let joined = self.player_count();
        if self.phase != Phase::Lobby || joined < self.config.min_players {
            debug!("Not starting: phase {:?}, {} players", self.phase, joined);
            return;
        }

        let ids: Vec<PlayerId> = self.players().map(|player| player.id).collect();
        let werewolves: HashSet<PlayerId> = sample(&mut self.rng, ids.len(), self.config.max_werewolves)
            .into_iter()
            .map(|index| ids[index])
            .collect();

        for player in self.slots.iter_mut().flatten() {
            player.role = if werewolves.contains(&player.id) {
                Role::Werewolf
            } else {
                Role::Civilian
            };
            player.is_alive = true;
            player.is_ready = false;
        }

        self.phase = Phase::Day;
        self.day_counter = 1;
        self.retry_budget = self.config.retry_budget;
        self.last_killed = None;
        self.kpu_id = None;
        self.accepted.clear();
        info!("Game started with {} players", joined);

        self.broadcast_roster();

        let pack: Vec<(PlayerId, String)> = self
            .players()
            .filter(|player| player.role == Role::Werewolf)
            .map(|player| (player.id, player.username.clone()))
            .collect();
        let starts: Vec<(SocketAddr, Method)> = self
            .players()
            .map(|player| {
                let friend = match player.role {
                    Role::Werewolf => pack
                        .iter()
                        .filter(|(id, _)| *id != player.id)
                        .map(|(_, username)| username.clone())
                        .collect(),
                    Role::Civilian => Vec::new(),
                };
                let description = match player.role {
                    Role::Werewolf => "game is started, you are a werewolf",
                    Role::Civilian => "game is started, you are a civilian",
                };
                let start = Method::Start {
                    time: Time::Day,
                    role: player.role,
                    friend,
                    description: description.to_string(),
                };
                (player.address, start)
            })
            .collect();
        for (addr, start) in starts {
            self.send(addr, start);
        }
    }

    /// Snapshot used by peers to find each other. Dead players (and everyone
    /// once the game is over) reveal their role.
    pub fn roster_snapshot(&self) -> Vec<ClientInfo> {
        let reveal_all = matches!(self.phase, Phase::GameOver(_));
        self.players()
            .map(|player| ClientInfo {
                player_id: player.id,
                is_alive: player.is_alive,
                address: player.peer_address.ip().to_string(),
                port: player.peer_address.port(),
                username: player.username.clone(),
                role: (reveal_all || !player.is_alive).then_some(player.role),
            })
            .collect()
    }

    /// Runs win detection, then flips day and night
    pub fn change_phase(&mut self) {
        if !self.phase.is_playing() || self.check_winner() {
            return;
        }

        let time = match self.phase {
            Phase::Day => {
                self.phase = Phase::Night;
                Time::Night
            }
            _ => {
                self.phase = Phase::Day;
                self.day_counter += 1;
                self.kpu_id = None;
                self.accepted.clear();
                Time::Day
            }
        };
        self.retry_budget = self.config.retry_budget;

        let description = match self.last_killed.take().and_then(|id| self.player(id)) {
            Some(player) => format!("player {} was found dead", player.username),
            None => format!("{} {} begins, nobody died", time, self.day_counter),
        };
        info!("Phase changed to {} {}: {}", time, self.day_counter, description);

        self.broadcast_roster();
        self.broadcast(Method::ChangePhase {
            time,
            days: self.day_counter,
            description,
        });

        if time == Time::Night {
            if self.kpu_id.is_some() {
                self.broadcast_vote_now(Time::Night);
            } else {
                // Nobody can tally the werewolves' votes tonight
                warn!("No coordinator for night {}, skipping to day", self.day_counter);
                self.change_phase();
            }
        }
    }

    /// Marks a player dead after a decided vote
    pub fn record_elimination(&mut self, player_id: PlayerId) -> Result<(), StateError> {
        let player = self
            .slots
            .get_mut(player_id as usize)
            .and_then(|slot| slot.as_mut())
            .ok_or(StateError::UnknownPlayer(player_id))?;
        if !player.is_alive {
            return Err(StateError::PlayerDead(player_id));
        }

        player.is_alive = false;
        info!("Player {} '{}' was eliminated", player.id, player.username);
        self.last_killed = Some(player_id);
        Ok(())
    }

    /// Learner side of the election: counts accept notices per proposal and
    /// fixes the coordinator once a majority of living players accepted the
    /// same proposal.
    pub fn learn_accepted(
        &mut self,
        caller: SocketAddr,
        proposal_id: ProposalId,
        kpu_id: PlayerId,
    ) -> Result<(), StateError> {
        match self.phase {
            Phase::Day => {}
            Phase::Night => return Err(StateError::PhaseMismatch),
            _ => return Err(StateError::NotPlaying),
        }
        let acceptor = self.find_by_address(caller).ok_or(StateError::NotJoined)?;
        if !acceptor.is_alive {
            return Err(StateError::PlayerDead(acceptor.id));
        }
        let acceptor_id = acceptor.id;

        if let Some(kpu_id) = self.kpu_id {
            debug!("Coordinator {} already chosen, notice is late", kpu_id);
            return Ok(());
        }
        match self.player(kpu_id) {
            Some(candidate) if candidate.is_alive => {}
            Some(_) => return Err(StateError::PlayerDead(kpu_id)),
            None => return Err(StateError::UnknownPlayer(kpu_id)),
        }

        let entry = self
            .accepted
            .entry(proposal_id)
            .or_insert_with(|| AcceptedProposal {
                kpu_id,
                acceptors: HashSet::new(),
            });
        if entry.kpu_id != kpu_id {
            return Err(StateError::InvalidRequest(format!(
                "proposal {} already carries coordinator {}",
                proposal_id, entry.kpu_id
            )));
        }
        entry.acceptors.insert(acceptor_id);

        let accepted_by = entry.acceptors.len();
        let majority = self.alive_count() / 2 + 1;
        debug!(
            "Proposal {} accepted by {}/{} needed",
            proposal_id, accepted_by, majority
        );
        if accepted_by >= majority {
            self.kpu_id = Some(kpu_id);
            self.accepted.clear();
            info!("Player {} elected coordinator under proposal {}", kpu_id, proposal_id);
            self.broadcast(Method::KpuSelected { kpu_id });
            self.broadcast_vote_now(Time::Day);
        }
        Ok(())
    }

    /// Applies the coordinator's tally for the current phase
    pub fn apply_vote_result(
        &mut self,
        caller: SocketAddr,
        time: Time,
        vote_status: VoteStatus,
        vote_result: &[(PlayerId, usize)],
        player_killed: Option<PlayerId>,
    ) -> Result<(), StateError> {
        let current = self.phase.time().ok_or(StateError::NotPlaying)?;
        if current != time {
            return Err(StateError::PhaseMismatch);
        }
        let caller_id = self.find_by_address(caller).map(|player| player.id);
        if caller_id.is_none() || caller_id != self.kpu_id {
            return Err(StateError::NotCoordinator);
        }
        info!("{} vote {:?}, tally {:?}", time, vote_status, vote_result);

        match (vote_status, player_killed) {
            (VoteStatus::Decided, Some(target)) => {
                if time == Time::Night
                    && self.player(target).map(|player| player.role) == Some(Role::Werewolf)
                {
                    return Err(StateError::InvalidRequest(
                        "werewolves cannot kill a werewolf".into(),
                    ));
                }
                self.record_elimination(target)?;
                self.change_phase();
            }
            (VoteStatus::Decided, None) => {
                return Err(StateError::InvalidRequest(
                    "decided vote without a target".into(),
                ));
            }
            (VoteStatus::Undecided, _) => match time {
                Time::Day if self.retry_budget > 0 => {
                    self.retry_budget -= 1;
                    info!("Day vote undecided, {} retries left", self.retry_budget);
                    self.broadcast_vote_now(Time::Day);
                }
                Time::Day => {
                    info!("Day vote deadlocked, moving on without a kill");
                    self.change_phase();
                }
                Time::Night => self.broadcast_vote_now(Time::Night),
            },
        }
        Ok(())
    }

    /// Returns a finished game to the lobby, keeping the roster
    pub fn reset(&mut self) {
        self.phase = Phase::Lobby;
        self.day_counter = 0;
        self.retry_budget = self.config.retry_budget;
        self.last_killed = None;
        self.kpu_id = None;
        self.accepted.clear();
        for player in self.slots.iter_mut().flatten() {
            player.is_alive = true;
            player.is_ready = false;
            player.role = Role::Civilian;
        }
        info!("Session reset to lobby");
        self.broadcast_roster();
    }

    fn alive_count(&self) -> usize {
        self.players().filter(|player| player.is_alive).count()
    }

    /// Ballots needed to close the vote of `time`: every living player by
    /// day, every living werewolf by night
    pub fn vote_quorum(&self, time: Time) -> usize {
        match time {
            Time::Day => self.alive_count(),
            Time::Night => self
                .players()
                .filter(|player| player.is_alive && player.role == Role::Werewolf)
                .count(),
        }
    }

    fn remove_player(&mut self, id: PlayerId) {
        let Some(player) = self.slots.get_mut(id as usize).and_then(Option::take) else {
            return;
        };
        info!("Player {} '{}' left", player.id, player.username);
        self.broadcast_roster();

        match self.phase {
            Phase::Lobby => self.start_if_quorum(),
            Phase::Day | Phase::Night => {
                if player.is_alive && self.check_winner() {
                    return;
                }
                // A coordinator killed by day still tallies the night vote
                if self.kpu_id == Some(id) {
                    self.kpu_id = None;
                    self.accepted.clear();
                    self.restart_election();
                } else if let (true, Some(_), Some(time)) =
                    (player.is_alive, self.kpu_id, self.phase.time())
                {
                    // The open ballot box counted the departed player
                    self.broadcast_vote_now(time);
                }
            }
            Phase::GameOver(_) => {
                if self.player_count() == 0 {
                    self.reset();
                }
            }
        }
    }

    fn restart_election(&mut self) {
        match self.phase {
            Phase::Day => {
                info!("Coordinator left, re-running the day {} election", self.day_counter);
                self.broadcast(Method::ChangePhase {
                    time: Time::Day,
                    days: self.day_counter,
                    description: "the coordinator left, electing a new one".into(),
                });
            }
            Phase::Night => self.change_phase(),
            _ => {}
        }
    }

    /// Ends the game if either side has won
    fn check_winner(&mut self) -> bool {
        let alive = self.players().filter(|player| player.is_alive);
        let (werewolves, civilians) = alive.fold((0, 0), |(w, c), player| match player.role {
            Role::Werewolf => (w + 1, c),
            Role::Civilian => (w, c + 1),
        });

        let winner = if werewolves == 0 {
            Role::Civilian
        } else if werewolves >= civilians {
            Role::Werewolf
        } else {
            return false;
        };

        self.phase = Phase::GameOver(winner);
        self.kpu_id = None;
        let description = match winner {
            Role::Civilian => "all werewolves are dead, civilians win",
            Role::Werewolf => "werewolves outnumber the village, werewolves win",
        };
        info!("Game over: {}", description);
        self.broadcast_roster();
        self.broadcast(Method::GameOver {
            winner,
            description: description.to_string(),
        });
        true
    }

    fn send(&mut self, addr: SocketAddr, method: Method) {
        self.outbox.push(Outbound {
            addr,
            message: method.into(),
        });
    }

    fn broadcast(&mut self, method: Method) {
        let addrs: Vec<SocketAddr> = self.players().map(|player| player.address).collect();
        for addr in addrs {
            self.send(addr, method.clone());
        }
    }

    fn broadcast_vote_now(&mut self, time: Time) {
        let quorum = self.vote_quorum(time);
        self.broadcast(Method::VoteNow {
            phase: time,
            quorum: Some(quorum),
        });
    }

    fn broadcast_roster(&mut self) {
        let clients = self.roster_snapshot();
        self.broadcast(Method::Roster { clients });
    }
}

fn reply(result: Result<(), StateError>) -> Response {
    match result {
        Ok(()) => Response::ok(),
        Err(e) => Response::fail(e.to_string()),
    }
}
