//! DNS Wire Format
//!
//! Encoder and decoder for the slice of RFC 1035 the in-memory responder
//! speaks: the header, the question section and A/AAAA/TXT answers.
//! Authority and additional sections are never produced and are ignored
//! when decoding.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// DNS packet constants
pub const HEADER_SIZE: usize = 12;
pub const MAX_DATAGRAM_SIZE: usize = 512;

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;
const MAX_POINTER_HOPS: usize = 32;

/// DNS flags
const FLAG_QR: u16 = 0x8000; // Query/Response
const FLAG_AA: u16 = 0x0400; // Authoritative Answer
const FLAG_TC: u16 = 0x0200; // Truncated
const FLAG_RD: u16 = 0x0100; // Recursion Desired
const FLAG_RA: u16 = 0x0080; // Recursion Available

/// Internet class
pub const CLASS_IN: u16 = 1;

/// Errors raised while decoding or encoding a packet
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("packet truncated at offset {0}")]
    Truncated(usize),

    #[error("label of {0} bytes exceeds the 63 byte limit")]
    LabelTooLong(usize),

    #[error("name exceeds 255 bytes")]
    NameTooLong,

    #[error("empty label in name {0:?}")]
    EmptyLabel(String),

    #[error("invalid compression pointer at offset {0}")]
    BadPointer(usize),

    #[error("label is not valid UTF-8")]
    InvalidLabel,

    #[error("TXT string of {0} bytes exceeds the 255 byte limit")]
    TxtTooLong(usize),

    #[error("section holds more than 65535 entries")]
    TooManyEntries,
}

/// Resource record type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordType(pub u16);

impl RecordType {
    pub const A: Self = Self(1);
    pub const NS: Self = Self(2);
    pub const CNAME: Self = Self(5);
    pub const TXT: Self = Self(16);
    pub const AAAA: Self = Self(28);
    pub const ANY: Self = Self(255);
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::A => f.write_str("A"),
            Self::NS => f.write_str("NS"),
            Self::CNAME => f.write_str("CNAME"),
            Self::TXT => f.write_str("TXT"),
            Self::AAAA => f.write_str("AAAA"),
            Self::ANY => f.write_str("ANY"),
            Self(other) => write!(f, "TYPE{}", other),
        }
    }
}

/// Response code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rcode {
    #[default]
    NoError,
    FormatError,
    ServerFailure,
    NameError,
    NotImplemented,
    Refused,
    Other(u8),
}

impl Rcode {
    pub fn from_u8(value: u8) -> Self {
        match value & 0x0F {
            0 => Self::NoError,
            1 => Self::FormatError,
            2 => Self::ServerFailure,
            3 => Self::NameError,
            4 => Self::NotImplemented,
            5 => Self::Refused,
            other => Self::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::NoError => 0,
            Self::FormatError => 1,
            Self::ServerFailure => 2,
            Self::NameError => 3,
            Self::NotImplemented => 4,
            Self::Refused => 5,
            Self::Other(value) => value & 0x0F,
        }
    }
}

/// Packet header (without the section counts, which are derived)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub response: bool,
    pub opcode: u8,
    pub authoritative: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub rcode: Rcode,
}

impl Header {
    fn flags(&self) -> u16 {
        let mut flags = (u16::from(self.opcode & 0x0F) << 11) | u16::from(self.rcode.to_u8());
        if self.response {
            flags |= FLAG_QR;
        }
        if self.authoritative {
            flags |= FLAG_AA;
        }
        if self.truncated {
            flags |= FLAG_TC;
        }
        if self.recursion_desired {
            flags |= FLAG_RD;
        }
        if self.recursion_available {
            flags |= FLAG_RA;
        }
        flags
    }

    fn from_flags(id: u16, flags: u16) -> Self {
        Self {
            id,
            response: flags & FLAG_QR != 0,
            opcode: ((flags >> 11) & 0x0F) as u8,
            authoritative: flags & FLAG_AA != 0,
            truncated: flags & FLAG_TC != 0,
            recursion_desired: flags & FLAG_RD != 0,
            recursion_available: flags & FLAG_RA != 0,
            rcode: Rcode::from_u8((flags & 0x0F) as u8),
        }
    }
}

/// Section counts carried in the header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionCounts {
    pub questions: u16,
    pub answers: u16,
    pub authorities: u16,
    pub additionals: u16,
}

/// A single question
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Fully qualified name, always ending in '.'
    pub name: String,
    pub qtype: RecordType,
    pub qclass: u16,
}

impl Question {
    pub fn new(name: &str, qtype: RecordType) -> Self {
        Self {
            name: fqdn(name),
            qtype,
            qclass: CLASS_IN,
        }
    }
}

/// Record payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Txt(Vec<String>),
    Raw(Vec<u8>),
}

/// Resource record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub rtype: RecordType,
    pub class: u16,
    pub ttl: u32,
    pub data: RData,
}

impl Record {
    pub fn a(name: &str, ttl: u32, ip: Ipv4Addr) -> Self {
        Self {
            name: fqdn(name),
            rtype: RecordType::A,
            class: CLASS_IN,
            ttl,
            data: RData::A(ip),
        }
    }

    pub fn aaaa(name: &str, ttl: u32, ip: Ipv6Addr) -> Self {
        Self {
            name: fqdn(name),
            rtype: RecordType::AAAA,
            class: CLASS_IN,
            ttl,
            data: RData::Aaaa(ip),
        }
    }

    pub fn txt(name: &str, ttl: u32, strings: Vec<String>) -> Self {
        Self {
            name: fqdn(name),
            rtype: RecordType::TXT,
            class: CLASS_IN,
            ttl,
            data: RData::Txt(strings),
        }
    }
}

/// A decoded or to-be-encoded packet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
}

impl Message {
    /// Build a recursive query for a single name
    pub fn query(id: u16, name: &str, qtype: RecordType) -> Self {
        Self {
            header: Header {
                id,
                recursion_desired: true,
                ..Header::default()
            },
            questions: vec![Question::new(name, qtype)],
            answers: Vec::new(),
        }
    }

    /// Build a successful response echoing `question`
    pub fn answer(id: u16, question: Question, answers: Vec<Record>) -> Self {
        Self {
            header: Header {
                id,
                response: true,
                authoritative: true,
                ..Header::default()
            },
            questions: vec![question],
            answers,
        }
    }

    /// Encode the packet. Answers whose name matches the first question
    /// are compressed into a pointer to it.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let qdcount = u16::try_from(self.questions.len()).map_err(|_| WireError::TooManyEntries)?;
        let ancount = u16::try_from(self.answers.len()).map_err(|_| WireError::TooManyEntries)?;

        let mut out = Vec::with_capacity(MAX_DATAGRAM_SIZE);
        encode_header(&mut out, &self.header, qdcount, ancount);

        let mut first_name: Option<(&str, u16)> = None;
        for question in &self.questions {
            let offset = out.len() as u16;
            write_name(&mut out, &question.name)?;
            out.extend_from_slice(&question.qtype.0.to_be_bytes());
            out.extend_from_slice(&question.qclass.to_be_bytes());
            if first_name.is_none() {
                first_name = Some((question.name.as_str(), offset));
            }
        }

        for record in &self.answers {
            match first_name {
                Some((name, offset)) if names_equal(name, &record.name) => {
                    out.extend_from_slice(&(0xC000 | offset).to_be_bytes());
                }
                _ => write_name(&mut out, &record.name)?,
            }
            out.extend_from_slice(&record.rtype.0.to_be_bytes());
            out.extend_from_slice(&record.class.to_be_bytes());
            out.extend_from_slice(&record.ttl.to_be_bytes());

            let rdata = encode_rdata(&record.data)?;
            let rdlength = u16::try_from(rdata.len()).map_err(|_| WireError::TooManyEntries)?;
            out.extend_from_slice(&rdlength.to_be_bytes());
            out.extend_from_slice(&rdata);
        }

        Ok(out)
    }

    /// Encode only the header, with empty sections. Cannot fail.
    pub fn encode_header_only(header: &Header) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE);
        encode_header(&mut out, header, 0, 0);
        out
    }

    /// Decode header, questions and answers
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let (header, counts) = decode_header(buf)?;
        let (questions, mut pos) = decode_questions(buf, counts.questions)?;

        let mut answers = Vec::with_capacity(counts.answers as usize);
        for _ in 0..counts.answers {
            let (record, next) = decode_record(buf, pos)?;
            answers.push(record);
            pos = next;
        }

        Ok(Self {
            header,
            questions,
            answers,
        })
    }
}

/// Decode the fixed 12-byte header
pub fn decode_header(buf: &[u8]) -> Result<(Header, SectionCounts), WireError> {
    if buf.len() < HEADER_SIZE {
        return Err(WireError::Truncated(buf.len()));
    }

    let id = read_u16(buf, 0)?;
    let flags = read_u16(buf, 2)?;
    let counts = SectionCounts {
        questions: read_u16(buf, 4)?,
        answers: read_u16(buf, 6)?,
        authorities: read_u16(buf, 8)?,
        additionals: read_u16(buf, 10)?,
    };

    Ok((Header::from_flags(id, flags), counts))
}

/// Decode `count` questions following the header.
/// Returns the questions and the offset just past them.
pub fn decode_questions(buf: &[u8], count: u16) -> Result<(Vec<Question>, usize), WireError> {
    let mut pos = HEADER_SIZE;
    let mut questions = Vec::with_capacity(usize::from(count).min(8));

    for _ in 0..count {
        let (name, next) = read_name(buf, pos)?;
        let qtype = read_u16(buf, next)?;
        let qclass = read_u16(buf, next + 2)?;
        pos = next + 4;

        questions.push(Question {
            name,
            qtype: RecordType(qtype),
            qclass,
        });
    }

    Ok((questions, pos))
}

/// Best-effort query ID of a packet too short or broken to decode
pub fn peek_id(buf: &[u8]) -> u16 {
    match buf {
        [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
        _ => 0,
    }
}

/// Normalize a name to its fully qualified form
pub fn fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    }
}

fn names_equal(a: &str, b: &str) -> bool {
    a.trim_end_matches('.')
        .eq_ignore_ascii_case(b.trim_end_matches('.'))
}

fn encode_header(out: &mut Vec<u8>, header: &Header, qdcount: u16, ancount: u16) {
    out.extend_from_slice(&header.id.to_be_bytes());
    out.extend_from_slice(&header.flags().to_be_bytes());
    out.extend_from_slice(&qdcount.to_be_bytes());
    out.extend_from_slice(&ancount.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // nscount
    out.extend_from_slice(&0u16.to_be_bytes()); // arcount
}

fn write_name(out: &mut Vec<u8>, name: &str) -> Result<(), WireError> {
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    if trimmed.is_empty() {
        out.push(0);
        return Ok(());
    }

    let mut written = 1;
    for label in trimmed.split('.') {
        if label.is_empty() {
            return Err(WireError::EmptyLabel(name.to_string()));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(WireError::LabelTooLong(label.len()));
        }
        written += label.len() + 1;
        if written > MAX_NAME_LEN {
            return Err(WireError::NameTooLong);
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0); // End of name

    Ok(())
}

fn read_name(buf: &[u8], start: usize) -> Result<(String, usize), WireError> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = start;
    let mut resume: Option<usize> = None;
    let mut hops = 0;
    let mut total = 1;

    loop {
        let len = *buf.get(pos).ok_or(WireError::Truncated(pos))? as usize;

        match len & 0xC0 {
            0x00 => {
                if len == 0 {
                    pos += 1;
                    break;
                }
                let end = pos + 1 + len;
                let bytes = buf.get(pos + 1..end).ok_or(WireError::Truncated(pos))?;
                total += len + 1;
                if total > MAX_NAME_LEN {
                    return Err(WireError::NameTooLong);
                }
                let label = std::str::from_utf8(bytes).map_err(|_| WireError::InvalidLabel)?;
                labels.push(label.to_string());
                pos = end;
            }
            0xC0 => {
                let target = (read_u16(buf, pos)? & 0x3FFF) as usize;
                hops += 1;
                if hops > MAX_POINTER_HOPS || target >= buf.len() {
                    return Err(WireError::BadPointer(pos));
                }
                if resume.is_none() {
                    resume = Some(pos + 2);
                }
                pos = target;
            }
            _ => return Err(WireError::LabelTooLong(len)),
        }
    }

    let name = if labels.is_empty() {
        ".".to_string()
    } else {
        let mut name = labels.join(".");
        name.push('.');
        name
    };

    Ok((name, resume.unwrap_or(pos)))
}

fn encode_rdata(data: &RData) -> Result<Vec<u8>, WireError> {
    match data {
        RData::A(ip) => Ok(ip.octets().to_vec()),
        RData::Aaaa(ip) => Ok(ip.octets().to_vec()),
        RData::Txt(strings) => {
            let mut out = Vec::new();
            for s in strings {
                if s.len() > 255 {
                    return Err(WireError::TxtTooLong(s.len()));
                }
                out.push(s.len() as u8);
                out.extend_from_slice(s.as_bytes());
            }
            Ok(out)
        }
        RData::Raw(bytes) => Ok(bytes.clone()),
    }
}

fn decode_record(buf: &[u8], start: usize) -> Result<(Record, usize), WireError> {
    let (name, pos) = read_name(buf, start)?;
    let rtype = RecordType(read_u16(buf, pos)?);
    let class = read_u16(buf, pos + 2)?;
    let ttl = read_u32(buf, pos + 4)?;
    let rdlength = read_u16(buf, pos + 8)? as usize;
    let rdata_start = pos + 10;
    let rdata = buf
        .get(rdata_start..rdata_start + rdlength)
        .ok_or(WireError::Truncated(rdata_start))?;

    let data = match rtype {
        RecordType::A if rdlength == 4 => {
            RData::A(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]))
        }
        RecordType::AAAA if rdlength == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(rdata);
            RData::Aaaa(Ipv6Addr::from(octets))
        }
        RecordType::TXT => RData::Txt(decode_txt(rdata)?),
        _ => RData::Raw(rdata.to_vec()),
    };

    Ok((
        Record {
            name,
            rtype,
            class,
            ttl,
            data,
        },
        rdata_start + rdlength,
    ))
}

fn decode_txt(mut rdata: &[u8]) -> Result<Vec<String>, WireError> {
    let mut strings = Vec::new();
    while let Some((&len, rest)) = rdata.split_first() {
        let len = len as usize;
        let bytes = rest.get(..len).ok_or(WireError::Truncated(len))?;
        strings.push(String::from_utf8_lossy(bytes).into_owned());
        rdata = &rest[len..];
    }
    Ok(strings)
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16, WireError> {
    match buf.get(pos..pos + 2) {
        Some(bytes) => Ok(u16::from_be_bytes([bytes[0], bytes[1]])),
        None => Err(WireError::Truncated(pos)),
    }
}

fn read_u32(buf: &[u8], pos: usize) -> Result<u32, WireError> {
    match buf.get(pos..pos + 4) {
        Some(bytes) => Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        None => Err(WireError::Truncated(pos)),
    }
}
