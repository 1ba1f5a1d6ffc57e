//! Polling Module
//!
//! Session state for a single live poll: the current question, whether
//! voting is open, and the weighted tally for the round.

pub mod config;
pub mod engine;

pub use config::{normalize_option, SessionSnapshot, Tally, VoteOptions, VoteRecord};
pub use engine::{SessionState, VoteError, VoteReceipt};
