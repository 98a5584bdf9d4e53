//! Virtual stub resolver
//!
//! Glue between the [`LookupIp`] world and the DNS wire world:
//!
//! - [`answer_from_lookup`] builds an [`AnswerFn`] that serves A/AAAA
//!   questions from any [`LookupIp`] (typically the address cache).
//! - [`VirtualResolver`] is a [`LookupIp`] that resolves by dialing a
//!   [`MemDialer`] and speaking DNS to it: datagram first, then stream
//!   when the answer comes back truncated.

use async_trait::async_trait;
use futures::FutureExt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::conn::ConnError;
use super::dialer::MemDialer;
use super::handler::{error_response, AnswerFn};
use super::message::{Header, Message, Question, RData, Rcode, Record, RecordType, WireError, CLASS_IN};
use crate::lookup::{IpFamily, LookupError, LookupIp};

/// Largest possible DNS message
const MAX_MESSAGE_SIZE: usize = 65535;

/// Errors of a single virtual query exchange
#[derive(Debug, thiserror::Error)]
pub enum StubError {
    #[error("connection error: {0}")]
    Conn(#[from] ConnError),

    #[error("invalid DNS message: {0}")]
    Wire(#[from] WireError),

    #[error("response id {got} does not match query id {expected}")]
    IdMismatch { expected: u16, got: u16 },

    #[error("server answered {0:?}")]
    Rcode(Rcode),
}

/// Serve A/AAAA questions from `lookup`. Other record types get an empty
/// NOERROR answer, lookup failures map to NXDOMAIN or SERVFAIL.
pub fn answer_from_lookup(lookup: Arc<dyn LookupIp>, ttl: u32) -> AnswerFn {
    Arc::new(move |id, question: Question| {
        let lookup = lookup.clone();
        async move {
            if question.qclass != CLASS_IN {
                return encode_or_servfail(id, with_rcode(id, question, Rcode::Refused));
            }
            let family = match question.qtype {
                RecordType::A => IpFamily::V4,
                RecordType::AAAA => IpFamily::V6,
                _ => return encode_or_servfail(id, Message::answer(id, question, Vec::new())),
            };

            let host = question.name.trim_end_matches('.').to_string();
            match lookup.lookup_ip(family, &host).await {
                Ok(ips) => {
                    let answers = ips
                        .into_iter()
                        .filter_map(|ip| match ip {
                            IpAddr::V4(v4) if family == IpFamily::V4 => {
                                Some(Record::a(&question.name, ttl, v4))
                            }
                            IpAddr::V6(v6) if family == IpFamily::V6 => {
                                Some(Record::aaaa(&question.name, ttl, v6))
                            }
                            _ => None,
                        })
                        .collect();
                    encode_or_servfail(id, Message::answer(id, question, answers))
                }
                Err(LookupError::NotFound { .. }) => {
                    encode_or_servfail(id, with_rcode(id, question, Rcode::NameError))
                }
                Err(e) => {
                    debug!("Lookup behind virtual DNS failed: {}", e);
                    encode_or_servfail(id, with_rcode(id, question, Rcode::ServerFailure))
                }
            }
        }
        .boxed()
    })
}

fn with_rcode(id: u16, question: Question, rcode: Rcode) -> Message {
    Message {
        header: Header {
            id,
            response: true,
            authoritative: true,
            rcode,
            ..Header::default()
        },
        questions: vec![question],
        answers: Vec::new(),
    }
}

fn encode_or_servfail(id: u16, msg: Message) -> Vec<u8> {
    msg.encode()
        .unwrap_or_else(|_| error_response(id, Rcode::ServerFailure))
}

/// [`LookupIp`] implementation speaking DNS over in-memory connections
#[derive(Debug)]
pub struct VirtualResolver {
    dialer: MemDialer,
    timeout: Duration,
    next_id: AtomicU16,
}

impl VirtualResolver {
    pub fn new(dialer: MemDialer, timeout: Duration) -> Self {
        Self {
            dialer,
            timeout,
            next_id: AtomicU16::new(1),
        }
    }

    /// One query/response exchange over a fresh connection
    pub async fn exchange(
        &self,
        network: &str,
        name: &str,
        qtype: RecordType,
    ) -> Result<Message, StubError> {
        let conn = self.dialer.dial(network, "");
        conn.set_deadline(Some(Instant::now() + self.timeout))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let query = Message::query(id, name, qtype).encode()?;

        let result = async {
            conn.write(&query).await?;
            let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
            let n = conn.read(&mut buf).await?;
            Ok::<_, StubError>(Message::decode(&buf[..n])?)
        }
        .await;
        conn.close();

        let msg = result?;
        if msg.header.id != id {
            return Err(StubError::IdMismatch {
                expected: id,
                got: msg.header.id,
            });
        }
        Ok(msg)
    }

    /// Query over datagram, retrying over stream when truncated
    pub async fn query(&self, name: &str, qtype: RecordType) -> Result<Message, StubError> {
        let msg = self.exchange("udp", name, qtype).await?;
        if !msg.header.truncated {
            return Ok(msg);
        }
        debug!("Truncated answer for {} {}, retrying over stream", name, qtype);
        self.exchange("tcp", name, qtype).await
    }

    async fn lookup_type(&self, host: &str, qtype: RecordType) -> Result<Vec<IpAddr>, LookupError> {
        let msg = self.query(host, qtype).await.map_err(|e| LookupError::Resolve {
            host: host.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e),
        })?;

        match msg.header.rcode {
            Rcode::NoError => {}
            Rcode::NameError => {
                return Err(LookupError::NotFound {
                    host: host.to_string(),
                })
            }
            other => {
                return Err(LookupError::Resolve {
                    host: host.to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::Other,
                        StubError::Rcode(other),
                    ),
                })
            }
        }

        Ok(msg
            .answers
            .into_iter()
            .filter_map(|record| match record.data {
                RData::A(v4) => Some(IpAddr::V4(v4)),
                RData::Aaaa(v6) => Some(IpAddr::V6(v6)),
                _ => None,
            })
            .collect())
    }
}

#[async_trait]
impl LookupIp for VirtualResolver {
    async fn lookup_ip(&self, family: IpFamily, host: &str) -> Result<Vec<IpAddr>, LookupError> {
        let qtypes: &[RecordType] = match family {
            IpFamily::V4 => &[RecordType::A],
            IpFamily::V6 => &[RecordType::AAAA],
            IpFamily::Any => &[RecordType::A, RecordType::AAAA],
        };

        let mut ips = Vec::new();
        let mut first_err = None;
        for qtype in qtypes {
            match self.lookup_type(host, *qtype).await {
                Ok(found) => ips.extend(found),
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        if ips.is_empty() {
            return Err(first_err.unwrap_or_else(|| LookupError::NotFound {
                host: host.to_string(),
            }));
        }
        Ok(ips)
    }
}
