//! Dispatch router
//!
//! Classifies a decoded frame by the connection's registered role and the
//! command type, applies it to the session and says who hears about it.
//! Authorization always reads the registration, never the payload.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::*;
use crate::polls::VoteError;
use crate::server::broadcast::Audience;
use crate::server::protocol::{decode_frame, Command, DecodeError};

/// A frame that could not be dispatched. Logged, never sent to the client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unknown command '{command}' for role {role}")]
    UnknownCommand { role: Role, command: String },
}

/// What a command produced: frames for the sender, then fan-outs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    pub reply: Vec<ServerEvent>,
    pub broadcasts: Vec<(Audience, ServerEvent)>,
}

impl Outcome {
    fn reply(event: ServerEvent) -> Self {
        Self {
            reply: vec![event],
            broadcasts: Vec::new(),
        }
    }

    fn broadcast_all(events: impl IntoIterator<Item = ServerEvent>) -> Self {
        Self {
            reply: Vec::new(),
            broadcasts: events
                .into_iter()
                .map(|event| (Audience::All, event))
                .collect(),
        }
    }
}

fn check_role(registration: &Registration, command: &Command) -> Result<(), DispatchError> {
    if registration.role() == command.required_role() {
        Ok(())
    } else {
        Err(DispatchError::UnknownCommand {
            role: registration.role(),
            command: command.name().to_string(),
        })
    }
}

/// Apply one command on behalf of `registration`.
pub fn route(
    state: &AppState,
    registration: &Registration,
    command: Command,
) -> Result<Outcome, DispatchError> {
    check_role(registration, &command)?;

    let outcome = match command {
        Command::UpdateQuestion(text) => handle_update_question(state, text),
        Command::SetVotingAllowed(allowed) => handle_set_voting_allowed(state, allowed),
        Command::NextQuestionReset => handle_next_question_reset(state),
        Command::ResetVote => handle_reset_vote(state),
        Command::Replay => Outcome::reply(ServerEvent::Replay(state.session.snapshot())),
        Command::Vote { decision, weight } => handle_vote(state, registration, &decision, weight),
    };
    Ok(outcome)
}

fn handle_update_question(state: &AppState, text: String) -> Outcome {
    let question = state.session.set_question(text);
    Outcome::broadcast_all([
        ServerEvent::CurrQuestion(question),
        ServerEvent::VoteAllowed(false),
        ServerEvent::Voted(false),
    ])
}

fn handle_set_voting_allowed(state: &AppState, allowed: bool) -> Outcome {
    state.session.set_voting_allowed(allowed);
    Outcome::broadcast_all([ServerEvent::VoteAllowed(allowed)])
}

fn handle_next_question_reset(state: &AppState) -> Outcome {
    state.session.next_question_reset();
    let mut outcome =
        Outcome::broadcast_all([ServerEvent::VoteAllowed(false), ServerEvent::Voted(false)]);
    outcome.reply.push(ServerEvent::CanNextVote(true));
    outcome
}

fn handle_reset_vote(state: &AppState) -> Outcome {
    state.session.reset_votes();
    Outcome::broadcast_all([ServerEvent::Voted(false)])
}

fn handle_vote(
    state: &AppState,
    registration: &Registration,
    decision: &str,
    weight: i64,
) -> Outcome {
    match state.session.cast_vote(registration.voter(), decision, weight) {
        Ok(receipt) => {
            info!(
                voter = %registration.voter(),
                option = %receipt.record.option,
                weight = receipt.record.weight,
                round = receipt.round,
                "vote accepted"
            );
            let mut outcome = Outcome::reply(ServerEvent::Voted(true));
            if state.config.poll.broadcast_tally_to_admins {
                outcome.broadcasts.push((
                    Audience::Admins,
                    ServerEvent::Tally {
                        tally: receipt.tally,
                        round: receipt.round,
                    },
                ));
            }
            outcome
        }
        // Closed voting and repeat votes are ordinary traffic
        Err(err @ (VoteError::VotingClosed | VoteError::DuplicateVote)) => {
            info!(voter = %registration.voter(), error = %err, "vote rejected");
            Outcome::reply(ServerEvent::error(err.to_string()))
        }
        Err(err) => {
            warn!(voter = %registration.voter(), error = %err, "vote rejected");
            Outcome::reply(ServerEvent::error(err.to_string()))
        }
    }
}

/// Decode, route and deliver one inbound text frame.
///
/// The session change and the frames announcing it are queued under the
/// broadcaster's sequence guard, so every client sees changes in the order
/// they were applied.
pub fn handle_frame(state: &AppState, registration: &Arc<Registration>, raw: &str) {
    let frame = match decode_frame(raw) {
        Ok(frame) => frame,
        Err(DecodeError::Malformed(message)) => {
            let err = DispatchError::Malformed(message);
            warn!(voter = %registration.voter(), error = %err, "frame dropped");
            return;
        }
        Err(DecodeError::Unknown(command)) => {
            let err = DispatchError::UnknownCommand {
                role: registration.role(),
                command,
            };
            warn!(voter = %registration.voter(), error = %err, "frame ignored");
            return;
        }
    };

    if let Some(claimed) = frame.claimed_admin {
        if claimed != registration.is_admin() {
            debug!(
                voter = %registration.voter(),
                role = %registration.role(),
                claimed_admin = claimed,
                "payload role claim ignored"
            );
        }
    }

    let command = frame.command.name();
    debug!(voter = %registration.voter(), command, "dispatching");
    let _sequence = state.broadcaster.sequence();
    match route(state, registration, frame.command) {
        Ok(outcome) => deliver(state, registration, outcome),
        Err(err) => warn!(voter = %registration.voter(), command, error = %err, "command ignored"),
    }
}

fn deliver(state: &AppState, registration: &Arc<Registration>, outcome: Outcome) {
    for event in &outcome.reply {
        if !state.broadcaster.send_to(registration, event) {
            break;
        }
    }
    for (audience, event) in &outcome.broadcasts {
        state.broadcaster.broadcast(*audience, event);
    }
}
