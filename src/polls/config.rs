//! Vote options, tallies and session snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::registry::VoterId;

/// Canonical form of an option name: trimmed and lowercased.
pub fn normalize_option(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// The fixed set of answers voters may pick from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteOptions {
    options: Vec<String>,
}

impl VoteOptions {
    /// Build an option set, rejecting empty sets, blank names and
    /// names that collide after normalization.
    pub fn new<I, S>(options: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = Vec::new();
        for option in options {
            let option = normalize_option(option.as_ref());
            if option.is_empty() {
                return Err("vote options must not be blank".to_string());
            }
            if normalized.contains(&option) {
                return Err(format!("duplicate vote option '{}'", option));
            }
            normalized.push(option);
        }
        if normalized.is_empty() {
            return Err("at least one vote option is required".to_string());
        }
        Ok(Self {
            options: normalized,
        })
    }

    pub fn yes_no() -> Self {
        Self {
            options: vec!["yes".to_string(), "no".to_string()],
        }
    }

    /// Map a raw decision onto its configured option.
    pub fn resolve(&self, raw: &str) -> Option<&str> {
        let wanted = normalize_option(raw);
        self.options
            .iter()
            .find(|option| **option == wanted)
            .map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.options.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// A tally with every option present at zero.
    pub fn empty_tally(&self) -> Tally {
        Tally(self.iter().map(|option| (option.to_string(), 0)).collect())
    }
}

impl Default for VoteOptions {
    fn default() -> Self {
        Self::yes_no()
    }
}

/// Accumulated weight per option for the current round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tally(BTreeMap<String, u64>);

impl Tally {
    pub fn get(&self, option: &str) -> u64 {
        self.0.get(option).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(option, count)| (option.as_str(), *count))
    }

    /// Add `weight` to an existing option. Leaves the tally untouched and
    /// returns `None` if the option is unknown or the count would overflow.
    pub(crate) fn checked_add(&mut self, option: &str, weight: u64) -> Option<u64> {
        let count = self.0.get_mut(option)?;
        let next = count.checked_add(weight)?;
        *count = next;
        Some(next)
    }

    pub(crate) fn zero(&mut self) {
        for count in self.0.values_mut() {
            *count = 0;
        }
    }
}

/// A ballot that passed validation and was folded into the tally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteRecord {
    pub voter: VoterId,
    pub option: String,
    pub weight: u64,
}

/// Immutable copy of the session state, used for replay.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub curr_question: String,
    pub vote_allowed: bool,
    pub started: bool,
    pub tally: Tally,
    pub round: u64,
    pub question_set_at: Option<DateTime<Utc>>,
}
