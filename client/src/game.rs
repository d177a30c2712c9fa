//! Peer-side view of the game and the choice of ballots

use log::debug;
use rand::seq::SliceRandom;
use shared::{ClientInfo, PlayerId, Role, Time};
use std::net::{IpAddr, SocketAddr};

/// What this peer knows about the game, built from server broadcasts
#[derive(Debug, Clone, Default)]
pub struct PeerState {
    pub player_id: Option<PlayerId>,
    pub username: String,
    pub role: Option<Role>,
    /// Usernames of the other werewolves; empty for civilians
    pub friends: Vec<String>,
    pub roster: Vec<ClientInfo>,
    pub time: Option<Time>,
    pub days: u32,
    pub kpu_id: Option<PlayerId>,
    pub winner: Option<Role>,
}

/// Datagram address a roster entry advertises
pub fn peer_addr(info: &ClientInfo) -> Option<SocketAddr> {
    info.address
        .parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, info.port))
}

impl PeerState {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Self::default()
        }
    }

    pub fn apply_start(&mut self, time: Time, role: Role, friend: Vec<String>) {
        self.role = Some(role);
        self.friends = friend;
        self.time = Some(time);
        self.days = 1;
        self.kpu_id = None;
        self.winner = None;
    }

    pub fn apply_change_phase(&mut self, time: Time, days: u32) {
        if time == Time::Day {
            self.kpu_id = None;
        }
        self.time = Some(time);
        self.days = days;
    }

    pub fn player(&self, id: PlayerId) -> Option<&ClientInfo> {
        self.roster.iter().find(|info| info.player_id == id)
    }

    pub fn living(&self) -> impl Iterator<Item = &ClientInfo> {
        self.roster.iter().filter(|info| info.is_alive)
    }

    pub fn alive_count(&self) -> usize {
        self.living().count()
    }

    pub fn is_alive(&self) -> bool {
        self.player_id
            .and_then(|id| self.player(id))
            .map_or(false, |info| info.is_alive)
    }

    pub fn is_kpu(&self) -> bool {
        self.player_id.is_some() && self.player_id == self.kpu_id
    }

    /// Living player sending from `addr`, if any
    pub fn living_by_addr(&self, addr: SocketAddr) -> Option<&ClientInfo> {
        self.living().find(|info| peer_addr(info) == Some(addr))
    }

    /// Every other living player and where to reach it
    pub fn living_peers(&self) -> Vec<(PlayerId, SocketAddr)> {
        self.living()
            .filter(|info| Some(info.player_id) != self.player_id)
            .filter_map(|info| peer_addr(info).map(|addr| (info.player_id, addr)))
            .collect()
    }

    pub fn kpu_addr(&self) -> Option<SocketAddr> {
        self.kpu_id
            .and_then(|id| self.player(id))
            .and_then(peer_addr)
    }

    pub fn is_friend(&self, info: &ClientInfo) -> bool {
        self.friends.iter().any(|name| *name == info.username)
    }

    /// Werewolves revealed by death
    pub fn dead_werewolves(&self) -> usize {
        self.roster
            .iter()
            .filter(|info| !info.is_alive && info.role == Some(Role::Werewolf))
            .count()
    }

    /// Whether this peer takes part in the vote of `time`
    pub fn votes_in(&self, time: Time) -> bool {
        self.is_alive() && (time == Time::Day || self.role == Some(Role::Werewolf))
    }

    /// Players this peer may vote against
    pub fn eligible_targets(&self, time: Time) -> Vec<PlayerId> {
        self.living()
            .filter(|info| Some(info.player_id) != self.player_id)
            .filter(|info| time == Time::Day || !self.is_friend(info))
            .map(|info| info.player_id)
            .collect()
    }
}

/// Chooses the ballot a peer casts when a vote opens
pub trait VotePolicy: Send + Sync {
    fn choose(&self, state: &PeerState, time: Time) -> Option<PlayerId>;
}

/// Votes for a uniformly random eligible target
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomVotePolicy;

impl VotePolicy for RandomVotePolicy {
    fn choose(&self, state: &PeerState, time: Time) -> Option<PlayerId> {
        if !state.votes_in(time) {
            return None;
        }
        let targets = state.eligible_targets(time);
        let choice = targets.choose(&mut rand::thread_rng()).copied();
        debug!("{} vote: {:?} out of {:?}", time, choice, targets);
        choice
    }
}
