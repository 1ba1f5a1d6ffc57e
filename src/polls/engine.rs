//! Session State
//!
//! The single authoritative record of the current question, the voting flag,
//! the tally and the set of voters already counted this round. Every mutation
//! runs under one mutex, so the "has this voter voted?" check and the tally
//! increment are atomic as a unit.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

use super::config::{SessionSnapshot, Tally, VoteOptions, VoteRecord};
use crate::registry::{ClientRegistry, Registration, VoterId};

/// Why a vote was rejected. A rejected vote never touches the tally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VoteError {
    #[error("invalid state: voting is not currently allowed")]
    VotingClosed,

    #[error("unknown vote option '{0}'")]
    UnknownOption(String),

    #[error("duplicate vote: already voted in this round")]
    DuplicateVote,

    #[error("invalid vote weight {0}: must be a positive integer")]
    InvalidWeight(i64),
}

/// Result of an accepted vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteReceipt {
    pub record: VoteRecord,
    pub tally: Tally,
    pub round: u64,
}

#[derive(Debug)]
struct RoundState {
    question: String,
    voting_allowed: bool,
    started: bool,
    tally: Tally,
    voted: HashSet<VoterId>,
    round: u64,
    question_set_at: Option<DateTime<Utc>>,
}

impl RoundState {
    /// Zero the tally, forget who voted and open a new round number.
    fn clear_ballots(&mut self) {
        self.tally.zero();
        self.voted.clear();
        self.round += 1;
    }
}

/// Shared polling session. Constructed once per process and handed to every
/// connection task behind an `Arc`.
#[derive(Debug)]
pub struct SessionState {
    options: VoteOptions,
    registry: Arc<ClientRegistry>,
    state: Mutex<RoundState>,
}

impl SessionState {
    pub fn new(options: VoteOptions, registry: Arc<ClientRegistry>) -> Self {
        let tally = options.empty_tally();
        Self {
            options,
            registry,
            state: Mutex::new(RoundState {
                question: String::new(),
                voting_allowed: false,
                started: false,
                tally,
                voted: HashSet::new(),
                round: 0,
                question_set_at: None,
            }),
        }
    }

    pub fn options(&self) -> &VoteOptions {
        &self.options
    }

    /// Advance to a new question: zero the tally, close voting and let
    /// everyone vote again. Returns the question for echo-back.
    pub fn set_question(&self, text: impl Into<String>) -> String {
        let mut state = self.state.lock();
        state.question = text.into();
        state.question_set_at = Some(Utc::now());
        state.started = true;
        state.voting_allowed = false;
        state.clear_ballots();
        self.registry.reset_all_voted();
        tracing::info!(round = state.round, question = %state.question, "question updated");
        state.question.clone()
    }

    /// Clear the round but keep the question, with voting closed.
    pub fn next_question_reset(&self) -> u64 {
        let mut state = self.state.lock();
        state.voting_allowed = false;
        state.clear_ballots();
        self.registry.reset_all_voted();
        tracing::info!(round = state.round, "round reset for next question");
        state.round
    }

    /// Re-run the vote on the current question. The voting flag is kept.
    pub fn reset_votes(&self) -> u64 {
        let mut state = self.state.lock();
        state.clear_ballots();
        self.registry.reset_all_voted();
        tracing::info!(round = state.round, "votes reset");
        state.round
    }

    pub fn set_voting_allowed(&self, allowed: bool) {
        let mut state = self.state.lock();
        state.voting_allowed = allowed;
        tracing::info!(round = state.round, allowed, "voting flag changed");
    }

    pub fn voting_allowed(&self) -> bool {
        self.state.lock().voting_allowed
    }

    /// Count one ballot.
    ///
    /// Checks run in a fixed order (voting open, known option, not yet voted,
    /// positive weight) and nothing is mutated unless all of them pass.
    pub fn cast_vote(
        &self,
        voter: &VoterId,
        option: &str,
        weight: i64,
    ) -> Result<VoteReceipt, VoteError> {
        let mut state = self.state.lock();
        if !state.voting_allowed {
            return Err(VoteError::VotingClosed);
        }
        let option = self
            .options
            .resolve(option)
            .ok_or_else(|| VoteError::UnknownOption(option.to_string()))?;
        if state.voted.contains(voter) {
            return Err(VoteError::DuplicateVote);
        }
        let weight_units = u64::try_from(weight)
            .ok()
            .filter(|w| *w > 0)
            .ok_or(VoteError::InvalidWeight(weight))?;
        state
            .tally
            .checked_add(option, weight_units)
            .ok_or(VoteError::InvalidWeight(weight))?;
        state.voted.insert(voter.clone());
        self.registry.mark_voted(voter);

        Ok(VoteReceipt {
            record: VoteRecord {
                voter: voter.clone(),
                option: option.to_string(),
                weight: weight_units,
            },
            tally: state.tally.clone(),
            round: state.round,
        })
    }

    pub fn has_voted(&self, voter: &VoterId) -> bool {
        self.state.lock().voted.contains(voter)
    }

    /// Bring a fresh registration's `has_voted` flag in line with the round,
    /// so a reconnecting voter keeps their "already voted" status.
    pub fn sync_voted(&self, registration: &Registration) -> bool {
        let state = self.state.lock();
        let voted = state.voted.contains(registration.voter());
        if voted {
            self.registry.mark_voted(registration.voter());
        } else {
            self.registry.reset_voted(registration.voter());
        }
        voted
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();
        SessionSnapshot {
            curr_question: state.question.clone(),
            vote_allowed: state.voting_allowed,
            started: state.started,
            tally: state.tally.clone(),
            round: state.round,
            question_set_at: state.question_set_at,
        }
    }
}
