//! Wire vocabulary for the reliable (client↔server) and unreliable
//! (peer↔peer) channels
//!
//! Every frame is one JSON object discriminated by either a `method` field
//! (requests, broadcasts and peer protocol messages, see [`Method`]) or a
//! `status` field (replies, see [`Response`]). The set of methods is closed:
//! an unrecognised method name is a [`ProtocolError::UnknownMethod`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::{PlayerId, ProposalId, Role, Time};

/// One row of the roster snapshot. Dead players also reveal their role.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub player_id: PlayerId,
    pub is_alive: bool,
    pub address: String,
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VoteStatus {
    Decided,
    Undecided,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Method {
    // Client to server
    Join {
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        udp_address: Option<String>,
        #[serde(default)]
        udp_port: Option<u16>,
    },
    Leave,
    Ready,
    ClientAddress,

    // Server to client
    Start {
        time: Time,
        role: Role,
        #[serde(default)]
        friend: Vec<String>,
        description: String,
    },
    ChangePhase {
        time: Time,
        days: u32,
        description: String,
    },
    Roster {
        clients: Vec<ClientInfo>,
    },
    KpuSelected {
        kpu_id: PlayerId,
    },
    VoteNow {
        phase: Time,
        /// Distinct ballots that close this vote, counted by the server
        #[serde(default, skip_serializing_if = "Option::is_none")]
        quorum: Option<usize>,
    },
    GameOver {
        winner: Role,
        description: String,
    },

    // Peer to peer, and acceptor to server for learner notifications
    PrepareProposal {
        proposal_id: ProposalId,
    },
    AcceptProposal {
        proposal_id: ProposalId,
        kpu_id: PlayerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    VoteCivilian {
        player_id: PlayerId,
    },
    VoteWerewolf {
        player_id: PlayerId,
    },

    // Coordinator to server
    VoteResult {
        time: Time,
        vote_status: VoteStatus,
        vote_result: Vec<(PlayerId, usize)>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        player_killed: Option<PlayerId>,
    },
}

impl Method {
    /// Every value the `method` field may take
    pub const NAMES: [&'static str; 15] = [
        "join",
        "leave",
        "ready",
        "client_address",
        "start",
        "change_phase",
        "roster",
        "kpu_selected",
        "vote_now",
        "game_over",
        "prepare_proposal",
        "accept_proposal",
        "vote_civilian",
        "vote_werewolf",
        "vote_result",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Method::Join { .. } => "join",
            Method::Leave => "leave",
            Method::Ready => "ready",
            Method::ClientAddress => "client_address",
            Method::Start { .. } => "start",
            Method::ChangePhase { .. } => "change_phase",
            Method::Roster { .. } => "roster",
            Method::KpuSelected { .. } => "kpu_selected",
            Method::VoteNow { .. } => "vote_now",
            Method::GameOver { .. } => "game_over",
            Method::PrepareProposal { .. } => "prepare_proposal",
            Method::AcceptProposal { .. } => "accept_proposal",
            Method::VoteCivilian { .. } => "vote_civilian",
            Method::VoteWerewolf { .. } => "vote_werewolf",
            Method::VoteResult { .. } => "vote_result",
        }
    }

    fn is_known(name: &str) -> bool {
        Self::NAMES.contains(&name)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Fail,
    Error,
}

/// Reply to a request on either channel
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<PlayerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clients: Option<Vec<ClientInfo>>,
    /// Echo of the proposal a peer reply answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal_id: Option<ProposalId>,
    /// Coordinator an acceptor already accepted, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_accepted: Option<PlayerId>,
    /// Proposal under which `previous_accepted` was accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_proposal: Option<ProposalId>,
}

impl Response {
    fn with_status(status: Status) -> Self {
        Self {
            status,
            description: None,
            player_id: None,
            clients: None,
            proposal_id: None,
            previous_accepted: None,
            accepted_proposal: None,
        }
    }

    pub fn ok() -> Self {
        Self::with_status(Status::Ok)
    }

    pub fn fail(description: impl Into<String>) -> Self {
        Self::with_status(Status::Fail).with_description(description)
    }

    pub fn error(description: impl Into<String>) -> Self {
        Self::with_status(Status::Error).with_description(description)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_player_id(mut self, player_id: PlayerId) -> Self {
        self.player_id = Some(player_id);
        self
    }

    pub fn with_clients(mut self, clients: Vec<ClientInfo>) -> Self {
        self.clients = Some(clients);
        self
    }

    pub fn with_proposal(mut self, proposal_id: ProposalId) -> Self {
        self.proposal_id = Some(proposal_id);
        self
    }

    pub fn with_previous_accepted(mut self, accepted: Option<(ProposalId, PlayerId)>) -> Self {
        if let Some((proposal, kpu_id)) = accepted {
            self.accepted_proposal = Some(proposal);
            self.previous_accepted = Some(kpu_id);
        }
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// Any frame on either channel
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum Message {
    Method(Method),
    Response(Response),
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(bytes)?;

        if let Some(method) = value.get("method") {
            let name = method
                .as_str()
                .ok_or_else(|| ProtocolError::Unexpected("`method` must be a string".into()))?;
            if !Method::is_known(name) {
                return Err(ProtocolError::UnknownMethod(name.to_string()));
            }
            return Ok(Message::Method(serde_json::from_value(value)?));
        }

        if value.get("status").is_some() {
            return Ok(Message::Response(serde_json::from_value(value)?));
        }

        Err(ProtocolError::MissingDiscriminator)
    }
}

impl From<Method> for Message {
    fn from(method: Method) -> Self {
        Message::Method(method)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_clients() -> Vec<ClientInfo> {
        vec![
            ClientInfo {
                player_id: 0,
                is_alive: true,
                address: "127.0.0.1".into(),
                port: 40001,
                username: "alice".into(),
                role: None,
            },
            ClientInfo {
                player_id: 3,
                is_alive: false,
                address: "127.0.0.1".into(),
                port: 40004,
                username: "dave".into(),
                role: Some(Role::Werewolf),
            },
        ]
    }

    fn every_shape() -> Vec<Message> {
        vec![
            Method::Join {
                username: Some("alice".into()),
                udp_address: Some("127.0.0.1".into()),
                udp_port: Some(40001),
            }
            .into(),
            Method::Leave.into(),
            Method::Ready.into(),
            Method::ClientAddress.into(),
            Method::Start {
                time: Time::Day,
                role: Role::Werewolf,
                friend: vec!["bob".into(), "carol".into()],
                description: "game is started".into(),
            }
            .into(),
            Method::ChangePhase {
                time: Time::Night,
                days: 2,
                description: "bob was found dead".into(),
            }
            .into(),
            Method::Roster {
                clients: sample_clients(),
            }
            .into(),
            Method::KpuSelected { kpu_id: 5 }.into(),
            Method::VoteNow {
                phase: Time::Night,
                quorum: Some(1),
            }
            .into(),
            Method::GameOver {
                winner: Role::Civilian,
                description: "all werewolves are dead".into(),
            }
            .into(),
            Method::PrepareProposal {
                proposal_id: ProposalId::new(3, 5),
            }
            .into(),
            Method::AcceptProposal {
                proposal_id: ProposalId::new(3, 5),
                kpu_id: 5,
                description: Some("accepted".into()),
            }
            .into(),
            Method::VoteCivilian { player_id: 2 }.into(),
            Method::VoteWerewolf { player_id: 1 }.into(),
            Method::VoteResult {
                time: Time::Day,
                vote_status: VoteStatus::Decided,
                vote_result: vec![(1, 4), (2, 2)],
                player_killed: Some(1),
            }
            .into(),
            Response::ok().with_player_id(4).into(),
            Response::fail("username already taken").into(),
            Response::ok().with_clients(sample_clients()).into(),
            Response::ok()
                .with_proposal(ProposalId::new(7, 5))
                .with_previous_accepted(Some((ProposalId::new(6, 4), 4)))
                .into(),
        ]
    }

    #[test]
    fn test_every_shape_survives_encoding() {
        for message in every_shape() {
            let bytes = message.encode().unwrap();
            let decoded = Message::decode(&bytes).unwrap();
            assert_eq!(decoded, message, "mismatch for {}", String::from_utf8_lossy(&bytes));
        }
    }

    #[test]
    fn test_names_cover_every_variant() {
        for message in every_shape() {
            if let Message::Method(method) = message {
                assert!(Method::is_known(method.name()), "{} missing", method.name());
            }
        }
    }

    #[test]
    fn test_wire_field_names() {
        let bytes = Message::from(Method::Join {
            username: Some("alice".into()),
            udp_address: Some("10.0.0.2".into()),
            udp_port: Some(9000),
        })
        .encode()
        .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["method"], "join");
        assert_eq!(value["username"], "alice");
        assert_eq!(value["udp_address"], "10.0.0.2");
        assert_eq!(value["udp_port"], 9000);

        let bytes = Message::from(Response::fail("server is full")).encode().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["status"], "fail");
        assert_eq!(value["description"], "server is full");
        assert!(value.get("player_id").is_none());
    }

    #[test]
    fn test_join_fields_are_optional_on_the_wire() {
        let decoded = Message::decode(br#"{"method":"join"}"#).unwrap();
        assert_eq!(
            decoded,
            Message::Method(Method::Join {
                username: None,
                udp_address: None,
                udp_port: None,
            })
        );
    }

    #[test]
    fn test_vote_now_quorum_is_optional() {
        let decoded = Message::decode(br#"{"method":"vote_now","phase":"night"}"#).unwrap();
        assert_eq!(
            decoded,
            Message::Method(Method::VoteNow {
                phase: Time::Night,
                quorum: None,
            })
        );

        let decoded =
            Message::decode(br#"{"method":"vote_now","phase":"night","quorum":1}"#).unwrap();
        assert_eq!(
            decoded,
            Message::Method(Method::VoteNow {
                phase: Time::Night,
                quorum: Some(1),
            })
        );
    }

    #[test]
    fn test_unknown_method_is_protocol_error() {
        let err = Message::decode(br#"{"method":"teleport"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMethod(name) if name == "teleport"));
    }

    #[test]
    fn test_missing_discriminator() {
        let err = Message::decode(br#"{"username":"alice"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingDiscriminator));

        let err = Message::decode(b"[1,2,3]").unwrap_err();
        assert!(matches!(err, ProtocolError::MissingDiscriminator));
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(
            Message::decode(br#"{"method":"vote_now","phase":"dusk"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            Message::decode(br#"{"method":42}"#),
            Err(ProtocolError::Unexpected(_))
        ));
        assert!(matches!(
            Message::decode(b"{not json"),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
