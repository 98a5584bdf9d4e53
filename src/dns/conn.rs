//! In-memory, half-duplex DNS connection.
//!
//! Every write is answered by the [`Responder`] and the answer becomes the
//! payload of the next read on the same connection. Writers serialize among
//! themselves and readers among themselves, but a read and a write may be
//! in flight at the same time. At most one unread answer exists: a write
//! holds the single slot until its answer has been read to the last byte.

use std::time::Instant;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tracing::trace;

use super::deadline::Deadline;
use super::handler::{Mode, Responder};

/// Errors returned by [`MemConn`] I/O
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConnError {
    #[error("use of closed in-memory connection")]
    Closed,

    #[error("i/o deadline exceeded")]
    Timeout,
}

impl ConnError {
    /// Timeouts are retriable after re-arming the deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl From<ConnError> for std::io::Error {
    fn from(err: ConnError) -> Self {
        let kind = match err {
            ConnError::Closed => std::io::ErrorKind::BrokenPipe,
            ConnError::Timeout => std::io::ErrorKind::TimedOut,
        };
        std::io::Error::new(kind, err)
    }
}

struct ReadHalf {
    responses: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

/// Virtual stream or datagram connection backed by a [`Responder`]
pub struct MemConn {
    write_lock: Mutex<()>,
    read_half: Mutex<ReadHalf>,
    responses: mpsc::Sender<Vec<u8>>,
    /// One permit, taken by a write and returned once its answer is drained
    slot: Semaphore,
    closed: watch::Sender<bool>,
    read_deadline: Deadline,
    write_deadline: Deadline,
    responder: Responder,
}

impl MemConn {
    pub fn new(responder: Responder) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let (closed, _) = watch::channel(false);

        Self {
            write_lock: Mutex::new(()),
            read_half: Mutex::new(ReadHalf {
                responses: rx,
                pending: Vec::new(),
            }),
            responses: tx,
            slot: Semaphore::new(1),
            closed,
            read_deadline: Deadline::new(),
            write_deadline: Deadline::new(),
            responder,
        }
    }

    pub fn mode(&self) -> Mode {
        self.responder.mode()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Submit one query. Returns the number of bytes accepted, not the
    /// size of the answer.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, ConnError> {
        self.ensure_open()?;
        if self.write_deadline.is_expired() {
            return Err(ConnError::Timeout);
        }

        let _guard = self.write_lock.lock().await;

        // The caller owns `buf` again as soon as we return, the answer must
        // be computed from our own copy.
        let request = buf.to_vec();
        let deliver = async {
            let permit = self.slot.acquire().await.map_err(|_| ConnError::Closed)?;
            let response = self.responder.respond(&request).await;
            self.responses
                .send(response)
                .await
                .map_err(|_| ConnError::Closed)?;
            // Released by the read that drains this answer
            permit.forget();
            Ok(buf.len())
        };

        tokio::select! {
            biased;
            _ = self.wait_closed() => Err(ConnError::Closed),
            _ = self.write_deadline.expired() => Err(ConnError::Timeout),
            written = deliver => written,
        }
    }

    /// Read (part of) the pending answer, waiting for one if needed
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, ConnError> {
        let mut half = self.read_half.lock().await;

        self.ensure_open()?;
        if buf.is_empty() {
            return Ok(0);
        }
        if self.read_deadline.is_expired() {
            return Err(ConnError::Timeout);
        }

        if half.pending.is_empty() {
            let ReadHalf { responses, pending } = &mut *half;
            tokio::select! {
                biased;
                _ = self.wait_closed() => return Err(ConnError::Closed),
                _ = self.read_deadline.expired() => return Err(ConnError::Timeout),
                response = responses.recv() => match response {
                    Some(response) => *pending = response,
                    None => return Err(ConnError::Closed),
                },
            }
        }

        let n = buf.len().min(half.pending.len());
        buf[..n].copy_from_slice(&half.pending[..n]);
        half.pending.drain(..n);
        if half.pending.is_empty() {
            self.slot.add_permits(1);
        }
        Ok(n)
    }

    /// Set both read and write deadlines
    pub fn set_deadline(&self, at: Option<Instant>) -> Result<(), ConnError> {
        self.ensure_open()?;
        self.read_deadline.set(at);
        self.write_deadline.set(at);
        Ok(())
    }

    pub fn set_read_deadline(&self, at: Option<Instant>) -> Result<(), ConnError> {
        self.ensure_open()?;
        self.read_deadline.set(at);
        Ok(())
    }

    pub fn set_write_deadline(&self, at: Option<Instant>) -> Result<(), ConnError> {
        self.ensure_open()?;
        self.write_deadline.set(at);
        Ok(())
    }

    /// Close the connection. Idempotent; pending reads and writes return
    /// [`ConnError::Closed`].
    pub fn close(&self) {
        let first = self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });
        if first {
            trace!("In-memory {:?} connection closed", self.mode());
        }
    }

    fn ensure_open(&self) -> Result<(), ConnError> {
        if self.is_closed() {
            Err(ConnError::Closed)
        } else {
            Ok(())
        }
    }

    async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl std::fmt::Debug for MemConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemConn")
            .field("mode", &self.mode())
            .field("closed", &self.is_closed())
            .finish()
    }
}
