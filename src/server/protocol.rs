//! Wire protocol
//!
//! Every frame is a UTF-8 text frame holding one JSON object. Inbound frames
//! carry a `type` naming the command; outbound frames use the small fixed set
//! of envelopes clients already understand (`{"voted":..}`,
//! `{"curr_question":..}`, `{"type":"error",..}` and so on).

use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::polls::{SessionSnapshot, Tally};
use crate::registry::{Role, VoterId};

/// Message type of the join request.
pub const JOIN_TYPE: &str = "join";

/// Reply text sent after a successful join.
pub const JOINED_MESSAGE: &str = "You have successfully joined the game";

/// First frame on every connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JoinRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub attendee: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
}

/// A decoded command, before authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ResetVote,
    UpdateQuestion(String),
    NextQuestionReset,
    SetVotingAllowed(bool),
    Replay,
    Vote { decision: String, weight: i64 },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::ResetVote => "reset_vote",
            Command::UpdateQuestion(_) => "update_question",
            Command::NextQuestionReset => "next_question_reset",
            Command::SetVotingAllowed(_) => "set_voting_allowed",
            Command::Replay => "replay",
            Command::Vote { .. } => "vote",
        }
    }

    /// The registered role allowed to issue this command.
    pub fn required_role(&self) -> Role {
        match self {
            Command::Vote { .. } => Role::Voter,
            _ => Role::Admin,
        }
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The `is_admin` claim from the payload. Never used for authorization.
    pub claimed_admin: Option<bool>,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unknown command '{0}'")]
    Unknown(String),
}

/// Decode a post-join frame.
pub fn decode_frame(raw: &str) -> Result<Frame, DecodeError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|err| DecodeError::Malformed(err.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| DecodeError::Malformed("frame is not a JSON object".to_string()))?;
    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::Malformed("missing string field 'type'".to_string()))?;
    let claimed_admin = obj.get("is_admin").and_then(Value::as_bool);

    let command = match kind {
        "reset_vote" => Command::ResetVote,
        "update_question" | "update_curr_question" => {
            Command::UpdateQuestion(required_str(obj, "update_question")?)
        }
        "next_question_reset" => Command::NextQuestionReset,
        "set_voting_allowed" => Command::SetVotingAllowed(required_bool(obj, "vote_allowed")?),
        "vote_allowed" => Command::SetVotingAllowed(true),
        "no_vote_allowed" => Command::SetVotingAllowed(false),
        "replay" => Command::Replay,
        "vote" => Command::Vote {
            decision: required_str(obj, "vote_decision")?,
            weight: required_i64(obj, "vote_weight")?,
        },
        other => return Err(DecodeError::Unknown(other.to_string())),
    };

    Ok(Frame {
        claimed_admin,
        command,
    })
}

/// Decode the join request that opens a connection.
pub fn decode_join(raw: &str) -> Result<JoinRequest, DecodeError> {
    let request: JoinRequest =
        serde_json::from_str(raw).map_err(|err| DecodeError::Malformed(err.to_string()))?;
    if request.kind != JOIN_TYPE {
        return Err(DecodeError::Malformed(format!(
            "expected a '{}' frame, got '{}'",
            JOIN_TYPE, request.kind
        )));
    }
    Ok(request)
}

fn required_str(obj: &Map<String, Value>, key: &str) -> Result<String, DecodeError> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DecodeError::Malformed(format!("missing string field '{}'", key)))
}

fn required_bool(obj: &Map<String, Value>, key: &str) -> Result<bool, DecodeError> {
    obj.get(key)
        .and_then(Value::as_bool)
        .ok_or_else(|| DecodeError::Malformed(format!("missing boolean field '{}'", key)))
}

fn required_i64(obj: &Map<String, Value>, key: &str) -> Result<i64, DecodeError> {
    obj.get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| DecodeError::Malformed(format!("missing integer field '{}'", key)))
}

/// Outbound envelopes.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Error { message: String },
    Joined { role: Role, attendee: VoterId },
    Voted(bool),
    VoteAllowed(bool),
    CurrQuestion(String),
    CanNextVote(bool),
    Replay(SessionSnapshot),
    Tally { tally: Tally, round: u64 },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ServerEvent::Error { message } => json!({ "type": "error", "message": message }),
            ServerEvent::Joined { role, attendee } => json!({
                "type": "joined",
                "message": JOINED_MESSAGE,
                "role": role.as_str(),
                "attendee": attendee.as_str(),
            }),
            ServerEvent::Voted(voted) => json!({ "voted": voted }),
            ServerEvent::VoteAllowed(allowed) => json!({ "vote_allowed": allowed }),
            ServerEvent::CurrQuestion(question) => json!({ "curr_question": question }),
            ServerEvent::CanNextVote(ready) => json!({ "can_next_vote": ready }),
            ServerEvent::Replay(snapshot) => json!({
                "type": "replay",
                "curr_question": snapshot.curr_question,
                "vote_allowed": snapshot.vote_allowed,
                "started": snapshot.started,
                "tally": snapshot.tally,
                "round": snapshot.round,
                "question_set_at": snapshot.question_set_at,
            }),
            ServerEvent::Tally { tally, round } => json!({
                "type": "tally",
                "tally": tally,
                "round": round,
            }),
        }
    }

    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }
}
