//! Single-use subscription tickets.
//!
//! A ticket is issued over authenticated HTTP and later presented, once,
//! on the stream upgrade. It is bound to the host that asked for it; the
//! port may differ since browsers open a fresh connection for the socket.

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    time::Duration,
};

use {
    tokio::{sync::Mutex, time::Instant},
    tracing::{debug, warn},
    uuid::Uuid,
};

use crate::{auth::Principal, error::GatewayError};

#[derive(Debug)]
struct PendingTicket {
    channel: String,
    requester: SocketAddr,
    principal: Principal,
    issued_at: Instant,
}

/// What a successfully consumed ticket grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redeemed {
    pub channel: String,
    pub principal: Principal,
}

#[derive(Default)]
struct Pending {
    tickets: HashMap<Uuid, PendingTicket>,
    /// Issue order, oldest first. Only kept when a TTL is set. Entries for
    /// tickets already consumed are skipped when they reach the front.
    order: VecDeque<(Instant, Uuid)>,
}

pub struct TicketBroker {
    pending: Mutex<Pending>,
    ttl: Option<Duration>,
}

impl TicketBroker {
    /// `ttl_secs == 0` keeps tickets until they are consumed.
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            pending: Mutex::new(Pending::default()),
            ttl: (ttl_secs > 0).then(|| Duration::from_secs(ttl_secs)),
        }
    }

    fn expired(&self, issued_at: Instant) -> bool {
        self.ttl.is_some_and(|ttl| issued_at.elapsed() > ttl)
    }

    /// Pop expired entries off the front of the issue order.
    fn sweep(&self, pending: &mut Pending) -> usize {
        let mut swept = 0;
        while let Some(&(issued_at, id)) = pending.order.front() {
            if !self.expired(issued_at) {
                break;
            }
            pending.order.pop_front();
            if pending.tickets.remove(&id).is_some() {
                swept += 1;
            }
        }
        swept
    }

    pub async fn issue(
        &self,
        channel: impl Into<String>,
        requester: SocketAddr,
        principal: Principal,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let issued_at = Instant::now();
        let ticket = PendingTicket {
            channel: channel.into(),
            requester,
            principal,
            issued_at,
        };
        let mut pending = self.pending.lock().await;
        if self.ttl.is_some() {
            let swept = self.sweep(&mut pending);
            if swept > 0 {
                debug!(swept, "dropped expired tickets");
            }
            pending.order.push_back((issued_at, id));
        }
        debug!(ticket = %id, channel = %ticket.channel, addr = %requester, principal = %ticket.principal, "ticket issued");
        pending.tickets.insert(id, ticket);
        id
    }

    /// Take the ticket out of the table and check it was issued to
    /// `peer`'s host. The ticket is gone whatever the outcome.
    pub async fn consume(&self, id: Uuid, peer: SocketAddr) -> Result<Redeemed, GatewayError> {
        let ticket = self
            .pending
            .lock()
            .await
            .tickets
            .remove(&id)
            .ok_or(GatewayError::UnknownTicket)?;

        if self.expired(ticket.issued_at) {
            debug!(ticket = %id, "ticket expired");
            return Err(GatewayError::UnknownTicket);
        }
        if ticket.requester.ip().to_canonical() != peer.ip().to_canonical() {
            warn!(ticket = %id, requester = %ticket.requester, addr = %peer, "ticket presented from another host");
            return Err(GatewayError::AddressMismatch {
                requester: ticket.requester,
                peer,
            });
        }
        Ok(Redeemed {
            channel: ticket.channel,
            principal: ticket.principal,
        })
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.tickets.len()
    }
}
