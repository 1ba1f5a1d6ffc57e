//! Broadcast fan-out
//!
//! Hands one payload to every matching registration. Each hand-off is a
//! non-blocking push into the client's bounded queue, so a stalled client
//! costs nothing: when its queue is full it is dropped from the registry and
//! the fan-out moves on.
//!
//! Callers that change session state and then announce it do both inside
//! [`Broadcaster::sequence`], which makes the order of queued frames match
//! the order of the changes for every client.

use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tracing::{debug, warn};

use super::protocol::ServerEvent;
use crate::registry::{ClientRegistry, Registration, Role, SendError};

/// Which registrations a broadcast is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    All,
    Admins,
    Voters,
}

impl Audience {
    pub fn includes(self, registration: &Registration) -> bool {
        match self {
            Audience::All => true,
            Audience::Admins => registration.role() == Role::Admin,
            Audience::Voters => registration.role() == Role::Voter,
        }
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub targeted: usize,
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<ClientRegistry>,
    order: Arc<Mutex<()>>,
}

/// Held while a state change and its frames are being queued.
pub type Sequence<'a> = MutexGuard<'a, ()>;

impl Broadcaster {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self {
            registry,
            order: Arc::new(Mutex::new(())),
        }
    }

    /// Serialize publishers. Nothing queued by another holder can land
    /// between a change made under this guard and the frames announcing it.
    pub fn sequence(&self) -> Sequence<'_> {
        self.order.lock()
    }

    pub fn broadcast(&self, audience: Audience, event: &ServerEvent) -> BroadcastReport {
        let report = self.broadcast_where(|registration| audience.includes(registration), event);
        debug!(
            ?audience,
            targeted = report.targeted,
            delivered = report.delivered,
            failed = report.failed,
            "broadcast complete"
        );
        report
    }

    /// Queue `event` for every registration matching `predicate`.
    ///
    /// Never fails: delivery errors are logged and the failing clients are
    /// unregistered.
    pub fn broadcast_where<P>(&self, predicate: P, event: &ServerEvent) -> BroadcastReport
    where
        P: Fn(&Registration) -> bool,
    {
        let payload: Arc<str> = Arc::from(event.to_json());
        let targets = self.registry.matching(predicate);

        let mut report = BroadcastReport {
            targeted: targets.len(),
            ..BroadcastReport::default()
        };
        for target in targets {
            match target.try_send(Arc::clone(&payload)) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    report.failed += 1;
                    self.drop_client(&target, &err);
                }
            }
        }
        report
    }

    /// Queue `event` for a single registration. Returns whether it was
    /// accepted by the client's write path.
    pub fn send_to(&self, target: &Registration, event: &ServerEvent) -> bool {
        match target.try_send(Arc::from(event.to_json())) {
            Ok(()) => true,
            Err(err) => {
                self.drop_client(target, &err);
                false
            }
        }
    }

    fn drop_client(&self, target: &Registration, err: &SendError) {
        warn!(
            conn_id = %target.conn_id(),
            voter = %target.voter(),
            role = %target.role(),
            error = %err,
            "delivery failed, removing client"
        );
        self.registry.unregister(target.conn_id());
    }
}
