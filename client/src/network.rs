//! Client orchestration
//!
//! A [`Client`] owns the reliable connection to the server and one datagram
//! socket for the other players. Two dispatcher tasks feed incoming traffic
//! into the shared state:
//!
//! - server messages drive the game view, open ballot boxes and start the
//!   proposer when this player is an election candidate;
//! - peer datagrams reach the local acceptor, the running proposer or, on
//!   the coordinator, the ballot box.
//!
//! Every phase-relevant announcement bumps a generation counter; proposer
//! and ballot retransmission workers stop as soon as it moves on.

use crate::election::{self, AcceptRound, Acceptor, PrepareRound, Proposer, ACCEPTED};
use crate::game::{PeerState, RandomVotePolicy, VotePolicy};
use crate::voting::{self, BallotBox, VoteOutcome};
use log::{debug, info, warn};
use rand::Rng;
use shared::transport::{
    run_datagram_reader, run_stream_reader, ConnectionEvent, DatagramChannel, KeepRunning,
    LossSimulator, TcpSender, DEFAULT_DELIVERY_PROBABILITY, POLL_INTERVAL,
};
use shared::{
    ClientInfo, Error, Message, Method, PlayerId, ProposalId, Response, Result, Role, Time,
    TransportError, MAX_WEREWOLVES,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{interval, sleep, timeout, timeout_at, Instant};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Share of datagrams actually sent
    pub delivery_probability: f64,
    /// How long a proposer waits for the replies of one phase
    pub election_timeout: Duration,
    /// Pause before a failed proposer retries, plus up to `election_jitter`
    pub election_backoff: Duration,
    pub election_jitter: Duration,
    pub vote_resend_interval: Duration,
    /// Wait for a server reply before giving up with `None`
    pub request_timeout: Duration,
    /// Only used to estimate the night quorum when `vote_now` carries none
    pub max_werewolves: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            delivery_probability: DEFAULT_DELIVERY_PROBABILITY,
            election_timeout: Duration::from_secs(1),
            election_backoff: Duration::from_millis(250),
            election_jitter: Duration::from_millis(250),
            vote_resend_interval: Duration::from_millis(500),
            request_timeout: Duration::from_secs(5),
            max_werewolves: MAX_WEREWOLVES,
        }
    }
}

/// Slot for the reply to the one outstanding server request
#[derive(Default)]
struct PendingReply {
    request_lock: Mutex<()>,
    slot: Mutex<Option<oneshot::Sender<Response>>>,
}

impl PendingReply {
    async fn complete(&self, response: Response) -> bool {
        match self.slot.lock().await.take() {
            Some(waiter) => waiter.send(response).is_ok(),
            None => false,
        }
    }

    async fn abandon(&self) {
        self.slot.lock().await.take();
    }
}

struct Shared {
    config: ClientConfig,
    server: TcpSender,
    peers: DatagramChannel,
    local_ip: IpAddr,
    keep_running: KeepRunning,
    pending: PendingReply,
    state: Mutex<PeerState>,
    acceptor: Mutex<Acceptor>,
    proposer: Mutex<Proposer>,
    ballots: Mutex<Option<BallotBox>>,
    proposal_replies: Mutex<Option<mpsc::UnboundedSender<(PlayerId, Response)>>>,
    generation: AtomicU64,
    policy: Box<dyn VotePolicy>,
}

impl Shared {
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.keep_running.is_running() && self.generation.load(Ordering::SeqCst) == generation
    }

    /// Sends a request and waits for the server's reply. `Ok(None)` means
    /// no reply arrived within the request timeout.
    async fn request(&self, method: Method) -> Result<Option<Response>> {
        let _guard = self.pending.request_lock.lock().await;
        let (waiter, reply) = oneshot::channel();
        *self.pending.slot.lock().await = Some(waiter);

        if let Err(e) = self.server.send(&method.into()).await {
            self.pending.abandon().await;
            return Err(e.into());
        }

        match timeout(self.config.request_timeout, reply).await {
            Ok(Ok(response)) => Ok(Some(response)),
            Ok(Err(_)) => Err(TransportError::ConnectionDead.into()),
            Err(_) => {
                self.pending.abandon().await;
                Ok(None)
            }
        }
    }

    async fn notify_server(&self, method: Method) {
        let name = method.name();
        if let Err(e) = self.server.send(&method.into()).await {
            warn!("Failed to send {} to server: {}", name, e);
        }
    }

    async fn send_to_peers(&self, peers: &[(PlayerId, SocketAddr)], method: Method) {
        let message = Message::from(method);
        for (id, addr) in peers {
            if let Err(e) = self.peers.send_unreliable(&message, *addr).await {
                debug!("Datagram to player {} failed: {}", id, e);
            }
        }
    }
}

pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    pub async fn connect(server_addr: &str, config: ClientConfig) -> Result<Self> {
        Self::connect_with_policy(server_addr, config, Box::new(RandomVotePolicy)).await
    }

    /// Connects to the server and binds the datagram socket on the local
    /// address of that connection
    pub async fn connect_with_policy(
        server_addr: &str,
        config: ClientConfig,
        policy: Box<dyn VotePolicy>,
    ) -> Result<Self> {
        let stream = TcpStream::connect(server_addr).await?;
        stream.set_nodelay(true)?;
        let server = stream.peer_addr()?;
        let local_ip = stream.local_addr()?.ip();

        let loss = LossSimulator::new(config.delivery_probability);
        let peers = DatagramChannel::bind(SocketAddr::new(local_ip, 0), loss).await?;
        info!("Connected to {}, peers reach us at {}", server, peers.local_addr()?);

        let (reader, writer) = stream.into_split();
        let keep_running = KeepRunning::new();
        let shared = Arc::new(Shared {
            config,
            server: TcpSender::new(server, writer),
            peers,
            local_ip,
            keep_running: keep_running.clone(),
            pending: PendingReply::default(),
            state: Mutex::new(PeerState::default()),
            acceptor: Mutex::new(Acceptor::new()),
            proposer: Mutex::new(Proposer::new(0)),
            ballots: Mutex::new(None),
            proposal_replies: Mutex::new(None),
            generation: AtomicU64::new(0),
            policy,
        });

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_stream_reader(reader, keep_running.clone(), server_tx));
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_datagram_reader(shared.peers.socket(), keep_running, peer_tx));

        spawn_server_dispatcher(Arc::clone(&shared), server_rx);
        spawn_peer_dispatcher(Arc::clone(&shared), peer_rx);

        Ok(Client { shared })
    }

    /// Address other players use to reach this client
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.shared.peers.local_addr()
    }

    pub fn keep_running(&self) -> KeepRunning {
        self.shared.keep_running.clone()
    }

    pub async fn player_id(&self) -> Option<PlayerId> {
        self.shared.state.lock().await.player_id
    }

    /// Snapshot of the game as this client sees it
    pub async fn state(&self) -> PeerState {
        self.shared.state.lock().await.clone()
    }

    pub async fn join(&self, username: &str) -> Result<Option<Response>> {
        let udp_port = self.peer_addr()?.port();
        let reply = self
            .shared
            .request(Method::Join {
                username: Some(username.to_string()),
                udp_address: Some(self.shared.local_ip.to_string()),
                udp_port: Some(udp_port),
            })
            .await?;

        if let Some(Response {
            player_id: Some(player_id),
            ..
        }) = reply.as_ref().filter(|reply| reply.is_ok())
        {
            info!("Joined as player {} '{}'", player_id, username);
            let mut state = self.shared.state.lock().await;
            state.player_id = Some(*player_id);
            state.username = username.to_string();
            self.shared.proposer.lock().await.set_player_id(*player_id);
        }
        Ok(reply)
    }

    pub async fn ready(&self) -> Result<Option<Response>> {
        self.shared.request(Method::Ready).await
    }

    pub async fn leave(&self) -> Result<Option<Response>> {
        self.shared.request(Method::Leave).await
    }

    /// Fetches the roster and adopts it as the current view
    pub async fn client_address(&self) -> Result<Option<Vec<ClientInfo>>> {
        let Some(reply) = self.shared.request(Method::ClientAddress).await? else {
            return Ok(None);
        };
        let clients = reply.clients.unwrap_or_default();
        self.shared.state.lock().await.roster = clients.clone();
        Ok(Some(clients))
    }

    /// Waits until the game ends, the server goes away or [`stop`](Self::stop)
    /// is called. Returns the winning side if the game finished.
    pub async fn run(&self) -> Result<Option<Role>> {
        let mut ticker = interval(POLL_INTERVAL);
        while self.shared.keep_running.is_running() {
            ticker.tick().await;
        }
        Ok(self.shared.state.lock().await.winner)
    }

    pub async fn stop(&self) {
        self.shared.keep_running.stop();
        self.shared.pending.abandon().await;
        self.shared.server.shutdown().await;
    }
}

fn spawn_server_dispatcher(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Message(Message::Response(response)) => {
                    if !shared.pending.complete(response).await {
                        debug!("Dropping reply nobody waits for");
                    }
                }
                ConnectionEvent::Message(Message::Method(method)) => {
                    handle_server_method(&shared, method).await;
                }
                ConnectionEvent::Malformed(e) => warn!("Malformed frame from server: {}", e),
                ConnectionEvent::Closed => {
                    info!("Server closed the connection");
                    break;
                }
            }
        }

        shared.keep_running.stop();
        shared.pending.abandon().await;
    });
}

async fn handle_server_method(shared: &Arc<Shared>, method: Method) {
    match method {
        Method::Start {
            time,
            role,
            friend,
            description,
        } => {
            info!("{}", description);
            if !friend.is_empty() {
                info!("Fellow werewolves: {}", friend.join(", "));
            }
            let generation = shared.next_generation();
            shared.state.lock().await.apply_start(time, role, friend);
            *shared.ballots.lock().await = None;
            start_day(shared, generation).await;
        }
        Method::ChangePhase {
            time,
            days,
            description,
        } => {
            info!("{} {}: {}", time, days, description);
            let generation = shared.next_generation();
            shared.state.lock().await.apply_change_phase(time, days);
            *shared.ballots.lock().await = None;
            if time == Time::Day {
                start_day(shared, generation).await;
            }
        }
        Method::Roster { clients } => {
            debug!("Roster of {} players", clients.len());
            shared.state.lock().await.roster = clients;
        }
        Method::KpuSelected { kpu_id } => {
            info!("Player {} is the coordinator", kpu_id);
            shared.next_generation();
            shared.state.lock().await.kpu_id = Some(kpu_id);
        }
        Method::VoteNow { phase, quorum } => {
            let generation = shared.next_generation();
            open_vote(shared, phase, quorum, generation).await;
        }
        Method::GameOver {
            winner,
            description,
        } => {
            info!("Game over, {} side wins: {}", winner, description);
            shared.next_generation();
            shared.state.lock().await.winner = Some(winner);
            shared.keep_running.stop();
        }
        other => warn!("Unexpected {} from server", other.name()),
    }
}

/// Fresh election state for a new day; candidates start proposing
async fn start_day(shared: &Arc<Shared>, generation: u64) {
    shared.acceptor.lock().await.reset();
    shared.proposer.lock().await.reset();

    let candidate = {
        let state = shared.state.lock().await;
        let candidates = election::candidates(state.living().map(|info| info.player_id));
        state.is_alive() && state.player_id.map_or(false, |id| candidates.contains(&id))
    };
    if candidate {
        tokio::spawn(run_proposer(Arc::clone(shared), generation));
    }
}

async fn run_proposer(shared: Arc<Shared>, generation: u64) {
    let (reply_tx, mut replies) = mpsc::unbounded_channel();
    *shared.proposal_replies.lock().await = Some(reply_tx);
    info!("Standing for coordinator");

    while shared.is_current(generation) {
        let (my_id, peers, alive) = {
            let state = shared.state.lock().await;
            match state.player_id {
                Some(id) if state.is_alive() => (id, state.living_peers(), state.alive_count()),
                _ => break,
            }
        };
        let needed = election::remote_quorum(alive);
        let proposal = shared.proposer.lock().await.next_proposal();

        let prepared =
            prepare_phase(&shared, generation, &mut replies, proposal, my_id, &peers, needed).await;
        let outcome = match prepared {
            Ok(Some(kpu_id)) => {
                accept_phase(&shared, generation, &mut replies, proposal, kpu_id, &peers, needed)
                    .await
                    .map(|won| won.then_some(kpu_id))
            }
            other => other,
        };

        match outcome {
            Ok(Some(kpu_id)) => {
                info!("Proposal {} for coordinator {} reached a quorum", proposal, kpu_id);
                wait_for_next_generation(&shared, generation, shared.config.election_timeout).await;
                continue;
            }
            Ok(None) => debug!("Proposal {} refused", proposal),
            Err(e) => debug!("Proposal {}: {}", proposal, e),
        }

        let jitter_ms = shared.config.election_jitter.as_millis() as u64;
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        sleep(shared.config.election_backoff + jitter).await;
    }

    debug!("Proposer of generation {} finished", generation);
}

/// Phase 1. Returns the value to propose when a quorum promised, `None`
/// when the round was refused or abandoned.
async fn prepare_phase(
    shared: &Shared,
    generation: u64,
    replies: &mut mpsc::UnboundedReceiver<(PlayerId, Response)>,
    proposal: ProposalId,
    my_id: PlayerId,
    peers: &[(PlayerId, SocketAddr)],
    needed: usize,
) -> Result<Option<PlayerId>> {
    let mut round = PrepareRound::new(proposal, needed);
    let local = shared.acceptor.lock().await.on_prepare(proposal);
    if !local.is_ok() {
        debug!("Own acceptor refused {}", proposal);
        return Ok(None);
    }
    if round.record_local(&local) {
        return Ok(Some(round.value(my_id)));
    }

    shared
        .send_to_peers(peers, Method::PrepareProposal { proposal_id: proposal })
        .await;
    let won = collect_replies(shared, generation, replies, |from, reply| round.record(from, reply)).await?;
    Ok(won.then(|| round.value(my_id)))
}

/// Phase 2. Returns whether a quorum accepted.
async fn accept_phase(
    shared: &Shared,
    generation: u64,
    replies: &mut mpsc::UnboundedReceiver<(PlayerId, Response)>,
    proposal: ProposalId,
    kpu_id: PlayerId,
    peers: &[(PlayerId, SocketAddr)],
    needed: usize,
) -> Result<bool> {
    let mut round = AcceptRound::new(proposal, kpu_id, needed);
    let local = shared.acceptor.lock().await.on_accept(proposal, kpu_id);
    if !local.is_ok() {
        debug!("Own acceptor refused to accept {}", proposal);
        return Ok(false);
    }
    notify_learner(shared, proposal, kpu_id).await;
    if round.record_local(&local) {
        return Ok(true);
    }

    shared
        .send_to_peers(
            peers,
            Method::AcceptProposal {
                proposal_id: proposal,
                kpu_id,
                description: None,
            },
        )
        .await;
    collect_replies(shared, generation, replies, |from, reply| round.record(from, reply)).await
}

/// Feeds replies to `record` until it reports a quorum. Fails with
/// [`Error::ConsensusTimeout`] when the election timeout runs out first;
/// `Ok(false)` means the generation moved on.
async fn collect_replies(
    shared: &Shared,
    generation: u64,
    replies: &mut mpsc::UnboundedReceiver<(PlayerId, Response)>,
    mut record: impl FnMut(PlayerId, &Response) -> bool,
) -> Result<bool> {
    let limit = shared.config.election_timeout;
    let deadline = Instant::now() + limit;
    while shared.is_current(generation) {
        match timeout_at(deadline, replies.recv()).await {
            Ok(Some((from, reply))) => {
                if record(from, &reply) {
                    return Ok(true);
                }
            }
            Ok(None) => return Ok(false),
            Err(_) => return Err(Error::ConsensusTimeout(limit)),
        }
    }
    Ok(false)
}

async fn wait_for_next_generation(shared: &Shared, generation: u64, limit: Duration) {
    let deadline = Instant::now() + limit;
    while shared.is_current(generation) && Instant::now() < deadline {
        sleep(Duration::from_millis(50)).await;
    }
}

/// Tells the server (the learner) that this acceptor accepted a proposal
async fn notify_learner(shared: &Shared, proposal_id: ProposalId, kpu_id: PlayerId) {
    shared
        .notify_server(Method::AcceptProposal {
            proposal_id,
            kpu_id,
            description: Some(ACCEPTED.to_string()),
        })
        .await;
}

/// Opens the ballot box on the coordinator and casts this player's ballot.
/// The server's quorum wins over the one estimated from the roster.
async fn open_vote(shared: &Arc<Shared>, time: Time, quorum: Option<usize>, generation: u64) {
    let (choice, is_kpu, my_id, kpu_addr) = {
        let state = shared.state.lock().await;
        if state.is_kpu() {
            let quorum = quorum.unwrap_or_else(|| {
                voting::quorum_for(&state, time, shared.config.max_werewolves)
            });
            info!("Collecting {} votes, quorum {}", time, quorum);
            *shared.ballots.lock().await = Some(BallotBox::new(time, quorum));
        }
        (
            shared.policy.choose(&state, time),
            state.is_kpu(),
            state.player_id,
            state.kpu_addr(),
        )
    };

    let Some(target) = choice else {
        return;
    };
    info!("Voting against player {} this {}", target, time);

    if is_kpu {
        if let Some(me) = my_id {
            receive_ballot(shared, me, target, time).await;
        }
        return;
    }
    match kpu_addr {
        Some(kpu_addr) => {
            tokio::spawn(resend_ballot(Arc::clone(shared), generation, kpu_addr, time, target));
        }
        None => warn!("Vote opened without a known coordinator"),
    }
}

/// Retransmits a ballot until the vote is over
async fn resend_ballot(
    shared: Arc<Shared>,
    generation: u64,
    kpu_addr: SocketAddr,
    time: Time,
    target: PlayerId,
) {
    let ballot: Message = match time {
        Time::Day => Method::VoteCivilian { player_id: target },
        Time::Night => Method::VoteWerewolf { player_id: target },
    }
    .into();

    while shared.is_current(generation) {
        if let Err(e) = shared.peers.send_unreliable(&ballot, kpu_addr).await {
            debug!("Ballot to coordinator failed: {}", e);
        }
        sleep(shared.config.vote_resend_interval).await;
    }
}

/// Coordinator side: records a validated ballot and reports a complete
/// result to the server
async fn receive_ballot(shared: &Shared, voter: PlayerId, target: PlayerId, time: Time) {
    let outcome = {
        let state = shared.state.lock().await;
        if !state.is_kpu() {
            debug!("Ballot from {} but this player is not the coordinator", voter);
            return;
        }
        if let Err(e) = voting::validate_ballot(&state, voter, target, time) {
            debug!("Rejected ballot of player {}: {}", voter, e);
            return;
        }
        let mut ballots = shared.ballots.lock().await;
        match ballots.as_mut() {
            Some(ballot_box) if ballot_box.time() == time => ballot_box.cast(voter, target),
            _ => {
                debug!("No {} ballot box open for player {}", time, voter);
                return;
            }
        }
    };

    if let Some(outcome) = outcome {
        report_outcome(shared, outcome).await;
    }
}

async fn report_outcome(shared: &Shared, outcome: VoteOutcome) {
    info!(
        "{} vote {:?}: tally {:?}, killed {:?}",
        outcome.time, outcome.status, outcome.tally, outcome.killed
    );
    shared.notify_server(outcome.into_method()).await;
}

fn spawn_peer_dispatcher(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<(SocketAddr, ConnectionEvent)>,
) {
    tokio::spawn(async move {
        while let Some((addr, event)) = events.recv().await {
            match event {
                ConnectionEvent::Message(message) => handle_peer_message(&shared, addr, message).await,
                ConnectionEvent::Malformed(e) => debug!("Malformed datagram from {}: {}", addr, e),
                ConnectionEvent::Closed => {}
            }
        }
    });
}

async fn handle_peer_message(shared: &Shared, addr: SocketAddr, message: Message) {
    let (sender, accepting) = {
        let state = shared.state.lock().await;
        let sender = state.living_by_addr(addr).map(|info| info.player_id);
        (sender, state.is_alive() && state.time == Some(Time::Day))
    };
    let Some(sender) = sender else {
        debug!("Ignoring datagram from {} outside the living roster", addr);
        return;
    };

    match message {
        Message::Method(Method::PrepareProposal { proposal_id }) if accepting => {
            shared.proposer.lock().await.observe(proposal_id);
            let reply = shared.acceptor.lock().await.on_prepare(proposal_id);
            reply_to_peer(shared, addr, reply).await;
        }
        Message::Method(Method::AcceptProposal {
            proposal_id,
            kpu_id,
            ..
        }) if accepting => {
            shared.proposer.lock().await.observe(proposal_id);
            let reply = shared.acceptor.lock().await.on_accept(proposal_id, kpu_id);
            if reply.is_ok() {
                notify_learner(shared, proposal_id, kpu_id).await;
            }
            reply_to_peer(shared, addr, reply).await;
        }
        Message::Method(Method::VoteCivilian { player_id }) => {
            receive_ballot(shared, sender, player_id, Time::Day).await;
        }
        Message::Method(Method::VoteWerewolf { player_id }) => {
            receive_ballot(shared, sender, player_id, Time::Night).await;
        }
        Message::Method(other) => debug!("Ignoring {} from player {}", other.name(), sender),
        Message::Response(reply) => {
            if let Some(proposer) = shared.proposal_replies.lock().await.as_ref() {
                let _ = proposer.send((sender, reply));
            }
        }
    }
}

async fn reply_to_peer(shared: &Shared, addr: SocketAddr, reply: Response) {
    if let Err(e) = shared.peers.send_unreliable(&reply.into(), addr).await {
        debug!("Reply to {} failed: {}", addr, e);
    }
}
