//! DNS Request Handler
//!
//! Turns one raw query into one raw response. The actual answer comes from
//! a pluggable [`AnswerFn`]; this module only enforces the wire rules
//! around it (single question, datagram size limit, truncation).

use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, trace};

use super::message::{
    decode_header, decode_questions, peek_id, Header, Message, Question, Rcode,
    MAX_DATAGRAM_SIZE,
};

/// Computes the raw response bytes for `(query id, question)`
pub type AnswerFn = Arc<dyn Fn(u16, Question) -> BoxFuture<'static, Vec<u8>> + Send + Sync>;

/// Connection semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// No size cap, no truncation
    Stream,
    /// Legacy 512 byte limit with truncation
    Datagram,
}

impl Mode {
    /// Networks containing "tcp" are streams, everything else is datagram
    pub fn from_network(network: &str) -> Self {
        if network.contains("tcp") {
            Self::Stream
        } else {
            Self::Datagram
        }
    }

    fn size_limit(self) -> Option<usize> {
        match self {
            Self::Stream => None,
            Self::Datagram => Some(MAX_DATAGRAM_SIZE),
        }
    }
}

/// Answers raw DNS queries
#[derive(Clone)]
pub struct Responder {
    answer: Option<AnswerFn>,
    mode: Mode,
}

impl Responder {
    pub fn new(answer: Option<AnswerFn>, mode: Mode) -> Self {
        Self { answer, mode }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Process one query and return the encoded response
    pub async fn respond(&self, request: &[u8]) -> Vec<u8> {
        if tracing::enabled!(tracing::Level::TRACE) {
            match Message::decode(request) {
                Ok(msg) => trace!("Received DNS packet: {:?}", msg),
                Err(e) => trace!("Can't parse DNS packet: {}", e),
            }
        }

        let (Header { id, .. }, counts) = match decode_header(request) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("Malformed DNS header: {}", e);
                return error_response(peek_id(request), Rcode::FormatError);
            }
        };

        let mut questions = match decode_questions(request, counts.questions) {
            Ok((questions, _)) => questions,
            Err(e) => {
                debug!("Malformed DNS question: {}", e);
                return error_response(id, Rcode::FormatError);
            }
        };

        let answer = match &self.answer {
            Some(answer) => answer,
            None => return error_response(id, Rcode::NotImplemented),
        };

        // RFC 1035 max 512 bytes for UDP
        if matches!(self.mode.size_limit(), Some(limit) if request.len() > limit) {
            return error_response(id, Rcode::FormatError);
        }

        // Multiple questions are legal on the wire but no server answers
        // them; only ever handle exactly one.
        if questions.len() > 1 {
            return error_response(id, Rcode::NotImplemented);
        }
        let question = match questions.pop() {
            Some(question) => question,
            None => return error_response(id, Rcode::FormatError),
        };

        let mut response = answer(id, question.clone()).await;

        if matches!(self.mode.size_limit(), Some(limit) if response.len() > limit) {
            debug!(
                "DNS answer of {} bytes exceeds datagram limit, truncating",
                response.len()
            );
            response = truncated_response(id, question);
        }

        if tracing::enabled!(tracing::Level::TRACE) {
            match Message::decode(&response) {
                Ok(msg) => trace!("Sending DNS packet: {:?}", msg),
                Err(e) => trace!("Can't parse DNS packet: {}", e),
            }
        }

        response
    }
}

/// Authoritative error response with no question section
pub fn error_response(id: u16, rcode: Rcode) -> Vec<u8> {
    Message::encode_header_only(&Header {
        id,
        response: true,
        authoritative: true,
        rcode,
        ..Header::default()
    })
}

/// Authoritative, truncated FORMERR response echoing `question`
pub fn truncated_response(id: u16, question: Question) -> Vec<u8> {
    let header = Header {
        id,
        response: true,
        authoritative: true,
        truncated: true,
        rcode: Rcode::FormatError,
        ..Header::default()
    };
    let msg = Message {
        header: header.clone(),
        questions: vec![question],
        answers: Vec::new(),
    };
    msg.encode()
        .unwrap_or_else(|_| Message::encode_header_only(&header))
}
