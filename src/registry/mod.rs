//! Client Registry
//!
//! Tracks every joined connection together with its role, its stable voter
//! identity and the capability used to write frames back to it. The registry
//! never owns the socket: a registration only holds the sending half of the
//! connection's outbound queue.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Identifier of a single transport connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(format!("conn_{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable identity of a voter, carried across reconnects.
///
/// Duplicate-vote checks are keyed on this value, not on the connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VoterId(String);

impl VoterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint an identity for a client that did not name itself.
    pub fn generate() -> Self {
        Self(format!("anon_{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VoterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role bound to a connection at join time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Voter,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Voter => "voter",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure to hand a frame to a client's write path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("connection closed")]
    Closed,

    #[error("outbound queue full")]
    Full,
}

/// Write path to a single client.
///
/// Never blocks: a frame is either queued for the client right away or
/// refused, so senders can hold locks while queueing.
pub trait ClientSink: Send + Sync {
    fn try_send(&self, payload: Arc<str>) -> Result<(), SendError>;
}

/// Server-side record of a joined connection.
pub struct Registration {
    conn_id: ConnectionId,
    voter: VoterId,
    role: Role,
    sink: Arc<dyn ClientSink>,
    has_voted: AtomicBool,
    closed: CancellationToken,
}

impl Registration {
    pub fn conn_id(&self) -> &ConnectionId {
        &self.conn_id
    }

    pub fn voter(&self) -> &VoterId {
        &self.voter
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Whether this voter has a ballot counted in the current round.
    pub fn has_voted(&self) -> bool {
        self.has_voted.load(Ordering::Acquire)
    }

    pub(crate) fn set_voted(&self, voted: bool) {
        self.has_voted.store(voted, Ordering::Release);
    }

    pub fn try_send(&self, payload: Arc<str>) -> Result<(), SendError> {
        self.sink.try_send(payload)
    }

    /// Cancelled once the registration leaves the registry.
    pub fn close_signal(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("conn_id", &self.conn_id)
            .field("voter", &self.voter)
            .field("role", &self.role)
            .field("has_voted", &self.has_voted())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Live set of joined connections.
///
/// Iteration always works on a snapshot of the membership, so a fan-out in
/// progress is unaffected by concurrent register/unregister calls.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<ConnectionId, Arc<Registration>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and return its handle.
    pub fn register(
        &self,
        conn_id: ConnectionId,
        voter: VoterId,
        role: Role,
        sink: Arc<dyn ClientSink>,
        closed: CancellationToken,
    ) -> Arc<Registration> {
        let registration = Arc::new(Registration {
            conn_id: conn_id.clone(),
            voter,
            role,
            sink,
            has_voted: AtomicBool::new(false),
            closed,
        });
        let replaced = self
            .clients
            .write()
            .insert(conn_id, Arc::clone(&registration));
        if let Some(old) = replaced {
            old.closed.cancel();
        }
        registration
    }

    /// Remove a connection. Safe to call for an identity that is already gone.
    pub fn unregister(&self, conn_id: &ConnectionId) -> Option<Arc<Registration>> {
        let removed = self.clients.write().remove(conn_id);
        if let Some(registration) = &removed {
            registration.closed.cancel();
        }
        removed
    }

    pub fn get(&self, conn_id: &ConnectionId) -> Option<Arc<Registration>> {
        self.clients.read().get(conn_id).cloned()
    }

    pub fn contains(&self, conn_id: &ConnectionId) -> bool {
        self.clients.read().contains_key(conn_id)
    }

    /// Snapshot of the registrations matching `predicate`.
    pub fn matching<P>(&self, predicate: P) -> Vec<Arc<Registration>>
    where
        P: Fn(&Registration) -> bool,
    {
        self.clients
            .read()
            .values()
            .filter(|registration| predicate(registration))
            .cloned()
            .collect()
    }

    /// Apply `action` to every registration matching `predicate`.
    pub fn for_each<P, A>(&self, predicate: P, mut action: A)
    where
        P: Fn(&Registration) -> bool,
        A: FnMut(&Arc<Registration>),
    {
        for registration in self.matching(predicate) {
            action(&registration);
        }
    }

    /// Flag every connection of `voter` as having voted. Returns how many
    /// connections were updated.
    pub fn mark_voted(&self, voter: &VoterId) -> usize {
        self.set_voted_for(voter, true)
    }

    /// Clear the flag on every connection of `voter`. Used when a rejoining
    /// voter has no ballot in the current round.
    pub fn reset_voted(&self, voter: &VoterId) -> usize {
        self.set_voted_for(voter, false)
    }

    pub fn reset_all_voted(&self) {
        self.for_each(|_| true, |registration| registration.set_voted(false));
    }

    fn set_voted_for(&self, voter: &VoterId, voted: bool) -> usize {
        let clients = self.clients.read();
        let mut updated = 0;
        for registration in clients.values().filter(|r| &r.voter == voter) {
            registration.set_voted(voted);
            updated += 1;
        }
        updated
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    pub fn count_role(&self, role: Role) -> usize {
        self.clients
            .read()
            .values()
            .filter(|registration| registration.role == role)
            .count()
    }
}
