//! Ballot collection on the coordinator
//!
//! Ballots are keyed by voter: a repeated ballot replaces the earlier one,
//! which makes retransmissions harmless. Once as many distinct voters as the
//! quorum have voted the box closes with either a decided target (strict
//! majority of the quorum) or an undecided result.

use crate::game::PeerState;
use log::debug;
use shared::{Method, PlayerId, StateError, Time, VoteStatus};
use std::collections::{BTreeMap, HashMap};

/// Every living player votes by day
pub fn day_quorum(alive: usize) -> usize {
    alive
}

/// Living werewolves vote by night; never below one while any is alive
pub fn night_quorum(max_werewolves: usize, dead_werewolves: usize) -> usize {
    max_werewolves.saturating_sub(dead_werewolves).max(1)
}

pub fn is_majority(count: usize, quorum: usize) -> bool {
    count * 2 > quorum
}

/// Quorum for the vote of `time` as seen from `state`. Departed werewolves
/// are not in the roster, so at night this can overestimate; the server's
/// count in `vote_now` takes precedence.
pub fn quorum_for(state: &PeerState, time: Time, max_werewolves: usize) -> usize {
    match time {
        Time::Day => day_quorum(state.alive_count()),
        Time::Night => night_quorum(max_werewolves, state.dead_werewolves()),
    }
}

/// Checks a ballot against the roster
pub fn validate_ballot(
    state: &PeerState,
    voter: PlayerId,
    target: PlayerId,
    time: Time,
) -> Result<(), StateError> {
    for id in [voter, target] {
        match state.player(id) {
            None => return Err(StateError::UnknownPlayer(id)),
            Some(info) if !info.is_alive => return Err(StateError::PlayerDead(id)),
            Some(_) => {}
        }
    }
    if time == Time::Night && voter == target {
        return Err(StateError::InvalidRequest("werewolves cannot vote for themselves".into()));
    }
    Ok(())
}

/// Final result of one ballot box
#[derive(Debug, Clone, PartialEq)]
pub struct VoteOutcome {
    pub time: Time,
    pub status: VoteStatus,
    /// `(target, votes)`, most votes first
    pub tally: Vec<(PlayerId, usize)>,
    pub killed: Option<PlayerId>,
}

impl VoteOutcome {
    pub fn into_method(self) -> Method {
        Method::VoteResult {
            time: self.time,
            vote_status: self.status,
            vote_result: self.tally,
            player_killed: self.killed,
        }
    }
}

#[derive(Debug)]
pub struct BallotBox {
    time: Time,
    quorum: usize,
    ballots: BTreeMap<PlayerId, PlayerId>,
    closed: bool,
}

impl BallotBox {
    pub fn new(time: Time, quorum: usize) -> Self {
        Self {
            time,
            quorum: quorum.max(1),
            ballots: BTreeMap::new(),
            closed: false,
        }
    }

    pub fn time(&self) -> Time {
        self.time
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn ballots_cast(&self) -> usize {
        self.ballots.len()
    }

    /// Records a ballot. Returns the outcome when this ballot completes the
    /// quorum; ballots after that are ignored.
    pub fn cast(&mut self, voter: PlayerId, target: PlayerId) -> Option<VoteOutcome> {
        if self.closed {
            debug!("Ballot box closed, ignoring vote of {}", voter);
            return None;
        }
        self.ballots.insert(voter, target);
        if self.ballots.len() < self.quorum {
            return None;
        }

        self.closed = true;
        let tally = self.tally();
        let killed = tally
            .first()
            .filter(|(_, votes)| is_majority(*votes, self.quorum))
            .map(|(target, _)| *target);
        let status = if killed.is_some() {
            VoteStatus::Decided
        } else {
            VoteStatus::Undecided
        };

        Some(VoteOutcome {
            time: self.time,
            status,
            tally,
            killed,
        })
    }

    pub fn tally(&self) -> Vec<(PlayerId, usize)> {
        let mut counts: HashMap<PlayerId, usize> = HashMap::new();
        for target in self.ballots.values() {
            *counts.entry(*target).or_default() += 1;
        }
        let mut tally: Vec<(PlayerId, usize)> = counts.into_iter().collect();
        tally.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        tally
    }
}
