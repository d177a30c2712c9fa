//! Single-decree Paxos for choosing the day's coordinator (KPU)
//!
//! Every living player is an acceptor. The two highest living ids also run a
//! proposer, which talks to the other acceptors over the lossy datagram
//! channel and to its own acceptor directly. A round needs the local
//! acceptor plus [`remote_quorum`] remote replies, which together form a
//! strict majority of the living players, so any two successful rounds share
//! at least one acceptor.
//!
//! The server acts as the learner; see `server::session`.

use shared::{PlayerId, ProposalId, Response};
use std::collections::HashSet;

/// Description carried by a successful prepare reply
pub const PROMISED: &str = "promised";
/// Description carried by a successful accept reply
pub const ACCEPTED: &str = "accepted";

/// Remote OK replies a proposer needs in each phase, on top of its own
/// acceptor's
pub fn remote_quorum(alive: usize) -> usize {
    if alive <= 1 {
        0
    } else {
        (alive - 1) / 2 + 1
    }
}

/// The two highest living player ids, highest first
pub fn candidates(living: impl IntoIterator<Item = PlayerId>) -> Vec<PlayerId> {
    let mut ids: Vec<PlayerId> = living.into_iter().collect();
    ids.sort_unstable_by(|a, b| b.cmp(a));
    ids.dedup();
    ids.truncate(2);
    ids
}

/// Acceptor memory. Both fields are updated before any reply leaves.
#[derive(Debug, Default, Clone)]
pub struct Acceptor {
    promised: Option<ProposalId>,
    accepted: Option<(ProposalId, PlayerId)>,
}

impl Acceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn promised(&self) -> Option<ProposalId> {
        self.promised
    }

    pub fn accepted(&self) -> Option<(ProposalId, PlayerId)> {
        self.accepted
    }

    fn admits(&self, proposal: ProposalId) -> bool {
        self.promised.map_or(true, |promised| proposal >= promised)
    }

    /// Phase 1: promise to ignore anything lower than `proposal`
    pub fn on_prepare(&mut self, proposal: ProposalId) -> Response {
        if !self.admits(proposal) {
            return self.reject(proposal);
        }
        self.promised = Some(proposal);
        Response::ok()
            .with_description(PROMISED)
            .with_proposal(proposal)
            .with_previous_accepted(self.accepted)
    }

    /// Phase 2: accept `kpu_id` under `proposal` unless a higher promise
    /// was made in the meantime
    pub fn on_accept(&mut self, proposal: ProposalId, kpu_id: PlayerId) -> Response {
        if !self.admits(proposal) {
            return self.reject(proposal);
        }
        self.promised = Some(proposal);
        self.accepted = Some((proposal, kpu_id));
        Response::ok()
            .with_description(ACCEPTED)
            .with_proposal(proposal)
    }

    fn reject(&self, proposal: ProposalId) -> Response {
        let promised = self.promised.unwrap_or_default();
        Response::fail(format!("already promised {}", promised)).with_proposal(proposal)
    }
}

/// Generates strictly increasing proposal ids for one player
#[derive(Debug, Clone)]
pub struct Proposer {
    player_id: PlayerId,
    sequence: u64,
}

impl Proposer {
    pub fn new(player_id: PlayerId) -> Self {
        Self {
            player_id,
            sequence: 0,
        }
    }

    pub fn player_id(&self) -> PlayerId {
        self.player_id
    }

    pub fn set_player_id(&mut self, player_id: PlayerId) {
        self.player_id = player_id;
    }

    pub fn reset(&mut self) {
        self.sequence = 0;
    }

    pub fn next_proposal(&mut self) -> ProposalId {
        self.sequence += 1;
        ProposalId::new(self.sequence, self.player_id)
    }

    /// Makes sure the next proposal outranks one seen from another proposer
    pub fn observe(&mut self, seen: ProposalId) {
        self.sequence = self.sequence.max(seen.sequence());
    }
}

fn answers(reply: &Response, proposal: ProposalId, description: &str) -> bool {
    reply.is_ok()
        && reply.proposal_id == Some(proposal)
        && reply.description.as_deref() == Some(description)
}

/// Promises gathered for one proposal
#[derive(Debug)]
pub struct PrepareRound {
    proposal: ProposalId,
    needed: usize,
    local_ok: bool,
    promises: HashSet<PlayerId>,
    highest_accepted: Option<(ProposalId, PlayerId)>,
}

impl PrepareRound {
    pub fn new(proposal: ProposalId, needed: usize) -> Self {
        Self {
            proposal,
            needed,
            local_ok: false,
            promises: HashSet::new(),
            highest_accepted: None,
        }
    }

    pub fn proposal(&self) -> ProposalId {
        self.proposal
    }

    pub fn record_local(&mut self, reply: &Response) -> bool {
        if answers(reply, self.proposal, PROMISED) {
            self.local_ok = true;
            self.merge(reply);
        }
        self.is_won()
    }

    /// Records a remote reply; stale or negative replies are ignored.
    /// Returns whether the round is won.
    pub fn record(&mut self, from: PlayerId, reply: &Response) -> bool {
        if answers(reply, self.proposal, PROMISED) && self.promises.insert(from) {
            self.merge(reply);
        }
        self.is_won()
    }

    fn merge(&mut self, reply: &Response) {
        if let (Some(proposal), Some(kpu_id)) = (reply.accepted_proposal, reply.previous_accepted) {
            if self.highest_accepted.map_or(true, |(highest, _)| proposal > highest) {
                self.highest_accepted = Some((proposal, kpu_id));
            }
        }
    }

    pub fn is_won(&self) -> bool {
        self.local_ok && self.promises.len() >= self.needed
    }

    /// Value to propose: the one accepted under the highest proposal any
    /// promising acceptor reported, or our own choice
    pub fn value(&self, own_choice: PlayerId) -> PlayerId {
        self.highest_accepted
            .map_or(own_choice, |(_, kpu_id)| kpu_id)
    }
}

/// Accept replies gathered for one proposal
#[derive(Debug)]
pub struct AcceptRound {
    proposal: ProposalId,
    kpu_id: PlayerId,
    needed: usize,
    local_ok: bool,
    accepted: HashSet<PlayerId>,
}

impl AcceptRound {
    pub fn new(proposal: ProposalId, kpu_id: PlayerId, needed: usize) -> Self {
        Self {
            proposal,
            kpu_id,
            needed,
            local_ok: false,
            accepted: HashSet::new(),
        }
    }

    pub fn proposal(&self) -> ProposalId {
        self.proposal
    }

    pub fn kpu_id(&self) -> PlayerId {
        self.kpu_id
    }

    pub fn record_local(&mut self, reply: &Response) -> bool {
        if answers(reply, self.proposal, ACCEPTED) {
            self.local_ok = true;
        }
        self.is_won()
    }

    pub fn record(&mut self, from: PlayerId, reply: &Response) -> bool {
        if answers(reply, self.proposal, ACCEPTED) {
            self.accepted.insert(from);
        }
        self.is_won()
    }

    pub fn is_won(&self) -> bool {
        self.local_ok && self.accepted.len() >= self.needed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    #[test]
    fn test_remote_quorum_forms_majority_with_local_acceptor() {
        assert_eq!(remote_quorum(1), 0);
        assert_eq!(remote_quorum(3), 2);
        assert_eq!(remote_quorum(5), 3);
        assert_eq!(remote_quorum(6), 3);
        assert_eq!(remote_quorum(8), 4);

        for alive in 2..=8 {
            // Two rounds of local + remote acceptors always overlap
            assert!(2 * (remote_quorum(alive) + 1) > alive, "alive = {}", alive);
        }
    }

    #[test]
    fn test_candidates_are_two_highest() {
        assert_eq!(candidates([0, 5, 3, 7, 1]), vec![7, 5]);
        assert_eq!(candidates([2]), vec![2]);
        assert!(candidates(Vec::new()).is_empty());
    }

    #[test]
    fn test_acceptor_promises_monotonically() {
        let mut acceptor = Acceptor::new();

        assert!(acceptor.on_prepare(ProposalId::new(2, 1)).is_ok());
        assert!(!acceptor.on_prepare(ProposalId::new(1, 7)).is_ok());
        // Equal proposal is re-admitted
        assert!(acceptor.on_prepare(ProposalId::new(2, 1)).is_ok());
        assert!(acceptor.on_prepare(ProposalId::new(2, 3)).is_ok());
        assert_eq!(acceptor.promised(), Some(ProposalId::new(2, 3)));
    }

    #[test]
    fn test_accept_respects_promise() {
        let mut acceptor = Acceptor::new();
        acceptor.on_prepare(ProposalId::new(3, 0));

        let reply = acceptor.on_accept(ProposalId::new(2, 5), 5);
        assert!(!reply.is_ok());
        assert_eq!(reply.proposal_id, Some(ProposalId::new(2, 5)));
        assert_eq!(acceptor.accepted(), None);

        let reply = acceptor.on_accept(ProposalId::new(3, 0), 4);
        assert!(reply.is_ok());
        assert_eq!(acceptor.accepted(), Some((ProposalId::new(3, 0), 4)));
    }

    #[test]
    fn test_promise_reports_previous_acceptance() {
        let mut acceptor = Acceptor::new();
        acceptor.on_accept(ProposalId::new(1, 4), 4);

        let reply = acceptor.on_prepare(ProposalId::new(2, 5));
        assert_eq!(reply.previous_accepted, Some(4));
        assert_eq!(reply.accepted_proposal, Some(ProposalId::new(1, 4)));
    }

    #[test]
    fn test_proposer_jumps_past_observed() {
        let mut proposer = Proposer::new(4);
        assert_eq!(proposer.next_proposal(), ProposalId::new(1, 4));

        proposer.observe(ProposalId::new(9, 5));
        let next = proposer.next_proposal();
        assert_eq!(next, ProposalId::new(10, 4));
        assert!(next > ProposalId::new(9, 5));

        proposer.reset();
        assert_eq!(proposer.next_proposal(), ProposalId::new(1, 4));
    }

    #[test]
    fn test_prepare_round_needs_local_and_remote() {
        let proposal = ProposalId::new(1, 5);
        let mut round = PrepareRound::new(proposal, 2);
        let mut remote = Acceptor::new();

        assert!(!round.record(1, &remote.on_prepare(proposal)));
        assert!(!round.record(1, &remote.on_prepare(proposal)), "duplicates count once");
        assert!(!round.record(2, &Acceptor::new().on_prepare(proposal)));

        let mut local = Acceptor::new();
        assert!(round.record_local(&local.on_prepare(proposal)));
    }

    #[test]
    fn test_prepare_round_ignores_stale_replies() {
        let proposal = ProposalId::new(2, 5);
        let mut round = PrepareRound::new(proposal, 1);
        round.record_local(&Acceptor::new().on_prepare(proposal));

        // Reply to an older proposal
        assert!(!round.record(1, &Acceptor::new().on_prepare(ProposalId::new(1, 5))));
        // Accept reply for the same proposal
        assert!(!round.record(1, &Acceptor::new().on_accept(proposal, 5)));
        assert!(round.record(1, &Acceptor::new().on_prepare(proposal)));
    }

    #[test]
    fn test_prepare_round_adopts_highest_accepted_value() {
        let proposal = ProposalId::new(5, 5);
        let mut round = PrepareRound::new(proposal, 2);

        let mut a = Acceptor::new();
        a.on_accept(ProposalId::new(2, 4), 4);
        let mut b = Acceptor::new();
        b.on_accept(ProposalId::new(3, 5), 5);

        round.record(1, &a.on_prepare(proposal));
        round.record(2, &b.on_prepare(proposal));
        assert_eq!(round.value(7), 5);

        let empty = PrepareRound::new(proposal, 2);
        assert_eq!(empty.value(7), 7);
    }

    #[test]
    fn test_accept_round() {
        let proposal = ProposalId::new(1, 5);
        let mut round = AcceptRound::new(proposal, 5, 1);
        assert!(!round.record_local(&Acceptor::new().on_accept(proposal, 5)));
        assert!(!round.record(2, &Acceptor::new().on_prepare(proposal)));
        assert!(round.record(2, &Acceptor::new().on_accept(proposal, 5)));
        assert_eq!(round.kpu_id(), 5);
    }

    enum InFlight {
        Prepare { to: PlayerId, from: PlayerId, proposal: ProposalId },
        Promise { to: PlayerId, from: PlayerId, reply: Response },
        Accept { to: PlayerId, from: PlayerId, proposal: ProposalId, kpu_id: PlayerId },
        Accepted { to: PlayerId, from: PlayerId, reply: Response },
    }

    struct SimProposer {
        proposer: Proposer,
        prepare: Option<PrepareRound>,
        accept: Option<AcceptRound>,
    }

    /// Learner that records every value reaching a majority
    #[derive(Default)]
    struct Learner {
        accepted: HashMap<ProposalId, (PlayerId, HashSet<PlayerId>)>,
        chosen: HashSet<PlayerId>,
    }

    impl Learner {
        fn learn(&mut self, acceptor: PlayerId, proposal: ProposalId, kpu_id: PlayerId, alive: usize) {
            let entry = self
                .accepted
                .entry(proposal)
                .or_insert_with(|| (kpu_id, HashSet::new()));
            assert_eq!(entry.0, kpu_id, "one value per proposal");
            entry.1.insert(acceptor);
            if entry.1.len() > alive / 2 {
                self.chosen.insert(kpu_id);
            }
        }
    }

    /// Two competing proposers, 25% loss, random reordering and restarts:
    /// the learner never sees two different values chosen.
    fn simulate(seed: u64) -> HashSet<PlayerId> {
        let alive: Vec<PlayerId> = (0..6).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut acceptors: HashMap<PlayerId, Acceptor> =
            alive.iter().map(|id| (*id, Acceptor::new())).collect();
        let mut proposers: HashMap<PlayerId, SimProposer> = candidates(alive.clone())
            .into_iter()
            .map(|id| {
                let sim = SimProposer {
                    proposer: Proposer::new(id),
                    prepare: None,
                    accept: None,
                };
                (id, sim)
            })
            .collect();
        let proposer_ids: Vec<PlayerId> = proposers.keys().copied().collect();
        let needed = remote_quorum(alive.len());
        let mut learner = Learner::default();
        let mut in_flight: Vec<InFlight> = Vec::new();

        for _ in 0..3000 {
            if in_flight.is_empty() || rng.gen_bool(0.02) {
                let id = proposer_ids[rng.gen_range(0..proposer_ids.len())];
                let sim = proposers.get_mut(&id).unwrap();
                let proposal = sim.proposer.next_proposal();
                let mut round = PrepareRound::new(proposal, needed);
                let local = acceptors.get_mut(&id).unwrap().on_prepare(proposal);
                round.record_local(&local);
                sim.prepare = Some(round);
                sim.accept = None;
                for to in alive.iter().copied().filter(|to| *to != id) {
                    in_flight.push(InFlight::Prepare { to, from: id, proposal });
                }
                continue;
            }

            let message = in_flight.swap_remove(rng.gen_range(0..in_flight.len()));
            if !rng.gen_bool(0.75) {
                continue;
            }

            match message {
                InFlight::Prepare { to, from, proposal } => {
                    if let Some(sim) = proposers.get_mut(&to) {
                        sim.proposer.observe(proposal);
                    }
                    let reply = acceptors.get_mut(&to).unwrap().on_prepare(proposal);
                    in_flight.push(InFlight::Promise { to: from, from: to, reply });
                }
                InFlight::Promise { to, from, reply } => {
                    let sim = proposers.get_mut(&to).unwrap();
                    let Some(round) = sim.prepare.as_mut() else { continue };
                    if !round.record(from, &reply) {
                        continue;
                    }
                    let proposal = round.proposal();
                    let kpu_id = round.value(to);
                    sim.prepare = None;

                    let local = acceptors.get_mut(&to).unwrap().on_accept(proposal, kpu_id);
                    if local.is_ok() {
                        learner.learn(to, proposal, kpu_id, alive.len());
                    }
                    let mut accept = AcceptRound::new(proposal, kpu_id, needed);
                    accept.record_local(&local);
                    sim.accept = Some(accept);
                    for peer in alive.iter().copied().filter(|peer| *peer != to) {
                        in_flight.push(InFlight::Accept { to: peer, from: to, proposal, kpu_id });
                    }
                }
                InFlight::Accept { to, from, proposal, kpu_id } => {
                    let reply = acceptors.get_mut(&to).unwrap().on_accept(proposal, kpu_id);
                    if reply.is_ok() {
                        learner.learn(to, proposal, kpu_id, alive.len());
                    }
                    in_flight.push(InFlight::Accepted { to: from, from: to, reply });
                }
                InFlight::Accepted { to, from, reply } => {
                    if let Some(round) = proposers.get_mut(&to).unwrap().accept.as_mut() {
                        round.record(from, &reply);
                    }
                }
            }
        }

        learner.chosen
    }

    #[test]
    fn test_lossy_competing_proposers_agree() {
        let mut decided_runs = 0;
        for seed in 0..40 {
            let chosen = simulate(seed);
            assert!(chosen.len() <= 1, "seed {} chose {:?}", seed, chosen);
            if chosen.len() == 1 {
                decided_runs += 1;
            }
        }
        assert!(decided_runs > 0, "no run ever reached a decision");
    }
}
