//! Wildcard DNS answers for the access-point captive portal. Every A query is
//! resolved to the device itself so any hostname opens the control page.

use std::net::Ipv4Addr;

const HEADER_LEN: usize = 12;
const TYPE_A: u16 = 1;
const TYPE_ANY: u16 = 255;
const CLASS_IN: u16 = 1;
const MAX_NAME_LEN: usize = 255;
pub const CAPTIVE_TTL_SECS: u32 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub id: u16,
    pub name: String,
    pub qtype: u16,
    recursion_desired: bool,
    question_end: usize,
}

pub fn parse_query(packet: &[u8]) -> Option<DnsQuery> {
    if packet.len() < HEADER_LEN {
        return None;
    }

    let id = u16::from_be_bytes([packet[0], packet[1]]);
    let flags = u16::from_be_bytes([packet[2], packet[3]]);
    if flags & 0x8000 != 0 {
        // Response, not a query.
        return None;
    }
    if (flags >> 11) & 0xF != 0 {
        // Only standard queries.
        return None;
    }

    let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
    if qdcount == 0 {
        return None;
    }

    let (name, offset) = decode_name(packet, HEADER_LEN)?;
    if offset + 4 > packet.len() {
        return None;
    }
    let qtype = u16::from_be_bytes([packet[offset], packet[offset + 1]]);
    let qclass = u16::from_be_bytes([packet[offset + 2], packet[offset + 3]]) & 0x7FFF;
    if qclass != CLASS_IN {
        return None;
    }

    Some(DnsQuery {
        id,
        name,
        qtype,
        recursion_desired: flags & 0x0100 != 0,
        question_end: offset + 4,
    })
}

/// Writes the reply to `packet` into `buf`, answering with `ip` for A and ANY
/// queries and with an empty answer section otherwise. Returns the length.
pub fn build_captive_response(packet: &[u8], ip: Ipv4Addr, buf: &mut [u8]) -> Option<usize> {
    let query = parse_query(packet)?;
    let question = &packet[HEADER_LEN..query.question_end];
    let answers = u16::from(matches!(query.qtype, TYPE_A | TYPE_ANY));

    let mut offset = HEADER_LEN + question.len();
    if offset > buf.len() {
        return None;
    }

    buf[0..2].copy_from_slice(&query.id.to_be_bytes());
    buf[2] = 0x84 | u8::from(query.recursion_desired); // QR=1, AA=1
    buf[3] = 0x80; // RA=1, RCODE=0
    buf[4..6].copy_from_slice(&1u16.to_be_bytes());
    buf[6..8].copy_from_slice(&answers.to_be_bytes());
    buf[8..12].fill(0);
    buf[HEADER_LEN..offset].copy_from_slice(question);

    if answers == 0 {
        return Some(offset);
    }

    let end = offset + 16;
    if end > buf.len() {
        return None;
    }
    // Name pointer back to the question at 0x000c.
    buf[offset] = 0xC0;
    buf[offset + 1] = 0x0C;
    offset += 2;
    buf[offset..offset + 2].copy_from_slice(&TYPE_A.to_be_bytes());
    buf[offset + 2..offset + 4].copy_from_slice(&CLASS_IN.to_be_bytes());
    buf[offset + 4..offset + 8].copy_from_slice(&CAPTIVE_TTL_SECS.to_be_bytes());
    buf[offset + 8..offset + 10].copy_from_slice(&4u16.to_be_bytes());
    buf[offset + 10..end].copy_from_slice(&ip.octets());
    Some(end)
}

fn decode_name(packet: &[u8], mut offset: usize) -> Option<(String, usize)> {
    let mut name = String::new();
    loop {
        let len = usize::from(*packet.get(offset)?);
        offset += 1;
        if len == 0 {
            break;
        }
        // Compression pointers never appear in a well-formed question.
        if len & 0xC0 != 0 {
            return None;
        }
        let label = packet.get(offset..offset + len)?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label));
        if name.len() > MAX_NAME_LEN {
            return None;
        }
        offset += len;
    }
    Some((name, offset))
}
