//! Admitted connections and their admission slots.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Hold one admission slot per admitted connection
//! - Release that slot exactly once, on first close or on drop

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::OwnedSemaphorePermit;

use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One slot of a [`ConnectionLimiter`](crate::net::ConnectionLimiter) pool.
///
/// Owned by exactly one [`LimitedConnection`]. The permit is taken out of
/// the mutex by whichever close gets there first; every other finds `None`.
/// Dropping the slot releases it too, so a connection dropped without an
/// explicit close never leaks.
#[derive(Debug)]
pub struct AdmissionSlot {
    id: ConnectionId,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl AdmissionSlot {
    pub(crate) fn new(id: ConnectionId, permit: OwnedSemaphorePermit) -> Self {
        Self {
            id,
            permit: Mutex::new(Some(permit)),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Return the slot to the pool.
    ///
    /// Returns `true` for the single call that actually released it.
    pub(crate) fn release(&self) -> bool {
        let permit = self
            .permit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match permit {
            Some(permit) => {
                drop(permit);
                metrics::record_slot_released();
                tracing::trace!(connection_id = %self.id, "Admission slot released");
                true
            }
            None => false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.permit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.release();
    }
}

/// A connection admitted by a [`ConnectionLimiter`](crate::net::ConnectionLimiter).
///
/// Reads and writes pass straight through. The first completed shutdown
/// releases the admission slot.
#[derive(Debug)]
pub struct LimitedConnection<C> {
    inner: C,
    slot: AdmissionSlot,
}

impl<C> LimitedConnection<C> {
    pub(crate) fn new(inner: C, slot: AdmissionSlot) -> Self {
        Self { inner, slot }
    }

    pub fn id(&self) -> ConnectionId {
        self.slot.id()
    }

    /// Whether this connection has already handed its slot back.
    pub fn is_released(&self) -> bool {
        self.slot.is_released()
    }

    pub fn get_ref(&self) -> &C {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut C {
        &mut self.inner
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for LimitedConnection<C> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for LimitedConnection<C> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let result = ready!(Pin::new(&mut self.inner).poll_shutdown(cx));
        self.slot.release();
        Poll::Ready(result)
    }
}
