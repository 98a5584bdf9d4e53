//! Dialer producing in-memory DNS connections.

use tracing::trace;

use super::conn::MemConn;
use super::handler::{AnswerFn, Mode, Responder};

/// Creates [`MemConn`]s answered by a shared [`AnswerFn`]
#[derive(Clone, Default)]
pub struct MemDialer {
    answer: Option<AnswerFn>,
}

impl MemDialer {
    pub fn new(answer: AnswerFn) -> Self {
        Self {
            answer: Some(answer),
        }
    }

    /// Dialer whose connections answer every query with NOTIMP
    pub fn without_answer() -> Self {
        Self::default()
    }

    /// Open a new connection. The address is ignored, nothing leaves the
    /// process; the network only selects stream or datagram semantics.
    pub fn dial(&self, network: &str, address: &str) -> MemConn {
        let mode = Mode::from_network(network);
        trace!("Dialing in-memory DNS {:?} connection (requested {} {})", mode, network, address);
        MemConn::new(Responder::new(self.answer.clone(), mode))
    }
}

impl std::fmt::Debug for MemDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemDialer")
            .field("has_answer", &self.answer.is_some())
            .finish()
    }
}
