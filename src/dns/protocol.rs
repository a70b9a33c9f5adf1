// Minimal DNS message codec
//
// Implements just enough of RFC 1035 to:
// - Build A / NS queries
// - Parse incoming queries and answer them with one A record
// - Parse A / NS answers during server resolution (with name compression)

use super::{DnsError, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::io::Cursor;
use std::net::Ipv4Addr;

const FLAG_QR: u16 = 0x8000;
const FLAG_AA: u16 = 0x0400;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;
const OPCODE_MASK: u16 = 0x7800;

/// Compression pointers followed before a name is rejected
const MAX_POINTER_HOPS: usize = 16;

/// DNS message header (12 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,      // Transaction ID
    pub flags: u16,   // Flags
    pub qdcount: u16, // Question count
    pub ancount: u16, // Answer count
    pub nscount: u16, // Authority count
    pub arcount: u16, // Additional count
}

impl DnsHeader {
    /// Create a new query header
    pub fn new_query(id: u16) -> Self {
        Self {
            id,
            flags: FLAG_RD, // Standard query, recursion desired
            qdcount: 1,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        }
    }

    /// Create an authoritative response header mirroring `query`
    pub fn response_to(query: &DnsHeader, qdcount: u16, ancount: u16) -> Self {
        Self {
            id: query.id,
            flags: FLAG_QR | FLAG_AA | FLAG_RA | (query.flags & (OPCODE_MASK | FLAG_RD)),
            qdcount,
            ancount,
            nscount: 0,
            arcount: 0,
        }
    }

    /// Parse header from bytes
    pub fn parse(buf: &mut Cursor<&[u8]>) -> Result<Self> {
        if buf.remaining() < 12 {
            return Err(DnsError::InvalidMessage("Header too short".into()));
        }

        Ok(Self {
            id: buf.get_u16(),
            flags: buf.get_u16(),
            qdcount: buf.get_u16(),
            ancount: buf.get_u16(),
            nscount: buf.get_u16(),
            arcount: buf.get_u16(),
        })
    }

    /// Write header to buffer
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u16(self.id);
        buf.put_u16(self.flags);
        buf.put_u16(self.qdcount);
        buf.put_u16(self.ancount);
        buf.put_u16(self.nscount);
        buf.put_u16(self.arcount);
    }

    /// Check if this is a response
    pub fn is_response(&self) -> bool {
        (self.flags & FLAG_QR) != 0
    }

    /// Response code (low four bits)
    pub fn rcode(&self) -> u8 {
        (self.flags & 0x000f) as u8
    }
}

/// DNS record type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsQType {
    A,
    NS,
    Other(u16),
}

impl DnsQType {
    pub fn code(self) -> u16 {
        match self {
            DnsQType::A => 1,
            DnsQType::NS => 2,
            DnsQType::Other(code) => code,
        }
    }
}

impl From<u16> for DnsQType {
    fn from(code: u16) -> Self {
        match code {
            1 => DnsQType::A,
            2 => DnsQType::NS,
            other => DnsQType::Other(other),
        }
    }
}

/// Class IN
pub const CLASS_IN: u16 = 1;

/// DNS question
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub qname: String,
    pub qtype: DnsQType,
    pub qclass: u16,
}

impl DnsQuestion {
    pub fn new(domain: &str, qtype: DnsQType) -> Self {
        Self {
            qname: domain.trim_end_matches('.').to_string(),
            qtype,
            qclass: CLASS_IN,
        }
    }

    /// Parse question from bytes
    pub fn parse(buf: &mut Cursor<&[u8]>) -> Result<Self> {
        let qname = read_domain_name(buf)?;

        if buf.remaining() < 4 {
            return Err(DnsError::InvalidMessage("Question too short".into()));
        }

        let qtype = DnsQType::from(buf.get_u16());
        let qclass = buf.get_u16();

        Ok(Self { qname, qtype, qclass })
    }

    /// Write question to buffer
    pub fn write(&self, buf: &mut BytesMut) {
        write_domain_name(&self.qname, buf);
        buf.put_u16(self.qtype.code());
        buf.put_u16(self.qclass);
    }
}

/// Record data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    Ns(String),
    Raw(Vec<u8>),
}

/// DNS resource record (answer)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: DnsQType,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: RData,
}

impl DnsRecord {
    /// Create a new A record
    pub fn new_a(domain: &str, addr: Ipv4Addr, ttl: u32) -> Self {
        Self {
            name: domain.to_string(),
            rtype: DnsQType::A,
            rclass: CLASS_IN,
            ttl,
            rdata: RData::A(addr),
        }
    }

    /// Parse record from bytes
    pub fn parse(buf: &mut Cursor<&[u8]>) -> Result<Self> {
        let name = read_domain_name(buf)?;

        if buf.remaining() < 10 {
            return Err(DnsError::InvalidMessage("Record too short".into()));
        }

        let rtype = DnsQType::from(buf.get_u16());
        let rclass = buf.get_u16();
        let ttl = buf.get_u32();
        let rdlen = buf.get_u16() as usize;

        if buf.remaining() < rdlen {
            return Err(DnsError::InvalidMessage("Truncated record data".into()));
        }

        let rdata_end = buf.position() + rdlen as u64;
        let rdata = match rtype {
            DnsQType::A if rdlen == 4 => {
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                RData::A(Ipv4Addr::from(octets))
            }
            // NS targets are usually compressed against the whole message
            DnsQType::NS => RData::Ns(read_domain_name(buf)?),
            _ => {
                let mut raw = vec![0u8; rdlen];
                buf.copy_to_slice(&mut raw);
                RData::Raw(raw)
            }
        };
        buf.set_position(rdata_end);

        Ok(Self { name, rtype, rclass, ttl, rdata })
    }

    /// Write record to buffer
    pub fn write(&self, buf: &mut BytesMut) {
        write_domain_name(&self.name, buf);
        buf.put_u16(self.rtype.code());
        buf.put_u16(self.rclass);
        buf.put_u32(self.ttl);

        match &self.rdata {
            RData::A(addr) => {
                buf.put_u16(4);
                buf.put_slice(&addr.octets());
            }
            RData::Ns(target) => {
                let mut name = BytesMut::new();
                write_domain_name(target, &mut name);
                buf.put_u16(name.len() as u16);
                buf.put_slice(&name);
            }
            RData::Raw(raw) => {
                buf.put_u16(raw.len() as u16);
                buf.put_slice(raw);
            }
        }
    }
}

/// DNS message (complete query or response)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsMessage {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
}

impl DnsMessage {
    /// Create a new query
    pub fn new_query(domain: &str, qtype: DnsQType, id: u16) -> Self {
        Self {
            header: DnsHeader::new_query(id),
            questions: vec![DnsQuestion::new(domain, qtype)],
            answers: Vec::new(),
        }
    }

    /// Create a response echoing the questions of `query`
    pub fn response_to(query: &DnsMessage, answers: Vec<DnsRecord>) -> Self {
        Self {
            header: DnsHeader::response_to(
                &query.header,
                query.questions.len() as u16,
                answers.len() as u16,
            ),
            questions: query.questions.clone(),
            answers,
        }
    }

    /// Parse DNS message from bytes
    ///
    /// Authority and additional sections are not read.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let header = DnsHeader::parse(&mut cursor)?;

        let mut questions = Vec::new();
        for _ in 0..header.qdcount {
            questions.push(DnsQuestion::parse(&mut cursor)?);
        }

        let mut answers = Vec::new();
        for _ in 0..header.ancount {
            answers.push(DnsRecord::parse(&mut cursor)?);
        }

        Ok(Self { header, questions, answers })
    }

    /// Serialize DNS message to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(512);

        self.header.write(&mut buf);

        for q in &self.questions {
            q.write(&mut buf);
        }

        for a in &self.answers {
            a.write(&mut buf);
        }

        buf.to_vec()
    }

    /// Get the domain name from the first question
    pub fn question_domain(&self) -> Result<&str> {
        self.questions
            .first()
            .map(|q| q.qname.as_str())
            .ok_or_else(|| DnsError::InvalidMessage("No questions in message".into()))
    }

    /// First A address in the answer section
    pub fn first_a(&self) -> Option<Ipv4Addr> {
        self.answers.iter().find_map(|rr| match rr.rdata {
            RData::A(addr) => Some(addr),
            _ => None,
        })
    }

    /// First NS target in the answer section
    pub fn first_ns(&self) -> Option<&str> {
        self.answers.iter().find_map(|rr| match &rr.rdata {
            RData::Ns(target) => Some(target.as_str()),
            _ => None,
        })
    }
}

/// Read a domain name, following compression pointers
fn read_domain_name(buf: &mut Cursor<&[u8]>) -> Result<String> {
    let message: &[u8] = *buf.get_ref();
    let mut pos = buf.position() as usize;
    let mut labels = Vec::new();
    let mut resume: Option<usize> = None;
    let mut hops = 0;

    loop {
        let len = *message
            .get(pos)
            .ok_or_else(|| DnsError::InvalidMessage("Truncated domain name".into()))?;

        // Compression pointer
        if (len & 0xC0) == 0xC0 {
            let low = *message
                .get(pos + 1)
                .ok_or_else(|| DnsError::InvalidMessage("Truncated pointer".into()))?;

            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return Err(DnsError::InvalidMessage("Compression loop".into()));
            }

            resume.get_or_insert(pos + 2);
            pos = (((len & 0x3F) as usize) << 8) | low as usize;
            continue;
        }

        if len & 0xC0 != 0 {
            return Err(DnsError::InvalidMessage("Unsupported label type".into()));
        }

        // End of name
        if len == 0 {
            pos += 1;
            break;
        }

        let start = pos + 1;
        let end = start + len as usize;
        let label = message
            .get(start..end)
            .ok_or_else(|| DnsError::InvalidMessage("Truncated label".into()))?;

        labels.push(
            std::str::from_utf8(label)
                .map_err(|_| DnsError::InvalidMessage("Invalid UTF-8 in domain name".into()))?
                .to_string(),
        );
        pos = end;
    }

    buf.set_position(resume.unwrap_or(pos) as u64);
    Ok(labels.join("."))
}

/// Write a domain name to DNS message
fn write_domain_name(domain: &str, buf: &mut BytesMut) {
    for label in domain.split('.').filter(|l| !l.is_empty()) {
        let bytes = label.as_bytes();
        buf.put_u8(bytes.len() as u8);
        buf.put_slice(bytes);
    }
    buf.put_u8(0); // End of name
}
