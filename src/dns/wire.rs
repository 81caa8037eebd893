//! Minimal RFC 1035 wire handling - hand-parsed from `&[u8]`, no DNS library.
//!
//! The forwarder never rewrites upstream answers, so only the header and the
//! question section are parsed structurally. Everything after the questions
//! travels through the process as opaque bytes.

use std::fmt;

use anyhow::bail;

use crate::dns::types::{DnsClass, Rcode, RecordType};

pub const HEADER_LEN: usize = 12;

/// Jump budget for compression pointers; real packets chain two or three at
/// most, anything deeper is a loop.
const MAX_POINTER_JUMPS: usize = 10;

#[derive(Debug, Clone)]
pub struct Header {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl Header {
    pub fn rcode(&self) -> Rcode {
        Rcode::from((self.flags & 0x000F) as u8)
    }

    pub fn is_response(&self) -> bool {
        self.flags & 0x8000 != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: RecordType,
    pub qclass: DnsClass,
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.qtype.name())
    }
}

/// A decoded message: header plus questions. Record sections are left on the
/// wire.
#[derive(Debug, Clone)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.questions.first() {
            Some(q) => write!(f, "{}", q),
            None => write!(f, "(no questions)"),
        }
    }
}

impl Message {
    /// Re-encode this request as a SERVFAIL response: same id, same flag bits
    /// except the rcode, same question section, zeroed record counts.
    pub fn to_servfail(&self) -> Vec<u8> {
        let flags = (self.header.flags & !0x000F) | Rcode::ServFail.to_u8() as u16;
        let mut out = Vec::with_capacity(HEADER_LEN + 32 * self.questions.len());
        out.extend_from_slice(&self.header.id.to_be_bytes());
        out.extend_from_slice(&flags.to_be_bytes());
        out.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        for q in &self.questions {
            write_name(&mut out, &q.name);
            out.extend_from_slice(&q.qtype.to_u16().to_be_bytes());
            out.extend_from_slice(&q.qclass.to_u16().to_be_bytes());
        }
        out
    }
}

/// Decode the header and question section of a DNS message.
pub fn decode(data: &[u8]) -> anyhow::Result<Message> {
    if data.len() < HEADER_LEN {
        bail!("message too short: {} bytes", data.len());
    }

    let header = Header {
        id: u16::from_be_bytes([data[0], data[1]]),
        flags: u16::from_be_bytes([data[2], data[3]]),
        qdcount: u16::from_be_bytes([data[4], data[5]]),
        ancount: u16::from_be_bytes([data[6], data[7]]),
        nscount: u16::from_be_bytes([data[8], data[9]]),
        arcount: u16::from_be_bytes([data[10], data[11]]),
    };

    let mut pos = HEADER_LEN;
    let mut questions = Vec::with_capacity(header.qdcount as usize);
    for _ in 0..header.qdcount {
        let name = read_name(data, &mut pos)?;
        if pos + 4 > data.len() {
            bail!("question section truncated at offset {}", pos);
        }
        let qtype = RecordType::from(u16::from_be_bytes([data[pos], data[pos + 1]]));
        let qclass = DnsClass::from(u16::from_be_bytes([data[pos + 2], data[pos + 3]]));
        pos += 4;
        questions.push(Question { name, qtype, qclass });
    }

    Ok(Message { header, questions })
}

/// Read a possibly-compressed name starting at `*pos`, advancing `*pos` past
/// the name as it appears in the stream (RFC 1035 section 4.1.4).
fn read_name(data: &[u8], pos: &mut usize) -> anyhow::Result<String> {
    let mut labels: Vec<String> = Vec::new();
    let mut cursor = *pos;
    let mut jumps = 0usize;
    let mut resume: Option<usize> = None;

    loop {
        let Some(&len) = data.get(cursor) else {
            bail!("name runs past end of message at offset {}", cursor);
        };

        if len & 0xC0 == 0xC0 {
            let Some(&low) = data.get(cursor + 1) else {
                bail!("truncated compression pointer at offset {}", cursor);
            };
            if resume.is_none() {
                resume = Some(cursor + 2);
            }
            cursor = (((len as usize) & 0x3F) << 8) | low as usize;
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                bail!("compression pointer loop");
            }
            continue;
        }

        if len == 0 {
            cursor += 1;
            break;
        }

        let start = cursor + 1;
        let end = start + len as usize;
        if end > data.len() {
            bail!("label runs past end of message at offset {}", cursor);
        }
        labels.push(String::from_utf8_lossy(&data[start..end]).into_owned());
        cursor = end;
    }

    *pos = resume.unwrap_or(cursor);
    Ok(labels.join("."))
}

/// Write a name in uncompressed label form.
pub fn write_name(out: &mut Vec<u8>, name: &str) {
    if !name.is_empty() {
        for label in name.split('.') {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
    }
    out.push(0);
}

/// Build a single-question query, RD set. Used by tooling and tests; client
/// queries normally arrive off the wire.
pub fn encode_query(id: u16, name: &str, qtype: RecordType) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + name.len() + 6);
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&0x0100u16.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    write_name(&mut out, name);
    out.extend_from_slice(&qtype.to_u16().to_be_bytes());
    out.extend_from_slice(&DnsClass::In.to_u16().to_be_bytes());
    out
}
