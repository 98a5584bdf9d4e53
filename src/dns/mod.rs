//! In-memory DNS
//!
//! A DNS server that never touches the network: queries written to a
//! [`MemConn`] are parsed, answered by an [`AnswerFn`] and handed back as
//! the next read. [`VirtualResolver`] closes the loop by speaking DNS to
//! such connections.

pub mod conn;
pub mod deadline;
pub mod dialer;
pub mod handler;
pub mod message;
pub mod stub;

pub use conn::{ConnError, MemConn};
pub use deadline::Deadline;
pub use dialer::MemDialer;
pub use handler::{error_response, truncated_response, AnswerFn, Mode, Responder};
pub use message::{Header, Message, Question, RData, Rcode, Record, RecordType, WireError};
pub use stub::{answer_from_lookup, StubError, VirtualResolver};
