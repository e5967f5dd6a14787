//! Connection admission limiting.
//!
//! # Responsibilities
//! - Gate every accept behind a bounded pool of admission slots
//! - Return a slot immediately when the inner accept fails
//! - Hand each admitted connection its slot, released on first close
//! - Wake blocked acceptors when the listener closes
//!
//! # Design Decisions
//! - The pool is a semaphore raced against a close signal, so closing never
//!   has to touch the semaphore and slot accounting stays exact afterwards
//! - No fairness beyond what the semaphore provides

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::lifecycle::CloseSignal;
use crate::net::connection::{AdmissionSlot, ConnectionId, LimitedConnection};
use crate::net::listener::{Listener, ListenerError};
use crate::observability::metrics;

/// A listener decorator that admits at most `limit` connections at a time.
///
/// Once the limit is reached, `accept` waits until an admitted connection
/// is closed (or dropped) before accepting from the inner listener again.
pub struct ConnectionLimiter<L> {
    inner: L,
    slots: Arc<Semaphore>,
    limit: usize,
    closed: CloseSignal,
}

impl<L: Listener> ConnectionLimiter<L> {
    pub fn new(inner: L, limit: usize) -> Result<Self, ListenerError> {
        if limit == 0 || limit > Semaphore::MAX_PERMITS {
            return Err(ListenerError::InvalidLimit(limit));
        }

        tracing::debug!(limit, "Connection limiter created");

        Ok(Self {
            inner,
            slots: Arc::new(Semaphore::new(limit)),
            limit,
            closed: CloseSignal::new(),
        })
    }

    /// Configured maximum of concurrently admitted connections.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Slots not currently held by an admitted connection.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_triggered()
    }

    pub fn get_ref(&self) -> &L {
        &self.inner
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, ListenerError> {
        if self.closed.is_triggered() {
            return Err(ListenerError::Closed);
        }

        tokio::select! {
            biased;
            _ = self.closed.triggered() => Err(ListenerError::Closed),
            permit = Arc::clone(&self.slots).acquire_owned() => {
                permit.map_err(|_| ListenerError::Closed)
            }
        }
    }
}

#[async_trait]
impl<L: Listener> Listener for ConnectionLimiter<L> {
    type Conn = LimitedConnection<L::Conn>;

    async fn accept(&self) -> Result<(Self::Conn, SocketAddr), ListenerError> {
        let permit = self.acquire().await?;

        match self.inner.accept().await {
            Ok((conn, peer)) => {
                let id = ConnectionId::new();
                metrics::record_connection_admitted();
                tracing::debug!(
                    connection_id = %id,
                    peer_addr = %peer,
                    available_slots = self.slots.available_permits(),
                    "Connection admitted"
                );
                Ok((LimitedConnection::new(conn, AdmissionSlot::new(id, permit)), peer))
            }
            Err(err) => {
                drop(permit);
                tracing::debug!(error = %err, "Inner accept failed, admission slot returned");
                Err(err)
            }
        }
    }

    async fn close(&self) -> Result<(), ListenerError> {
        let result = self.inner.close().await;
        if self.closed.trigger() {
            tracing::info!(
                held_slots = self.limit - self.slots.available_permits(),
                "Connection limiter closed"
            );
        }
        result
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
