//! Minimal DNS wire codec
//!
//! Parses incoming query datagrams into `{id, type, qname}` and builds the
//! answer datagrams that carry downstream tunnel data. Names are kept as raw
//! byte strings in dotted presentation form: Base128 payloads put bytes in
//! the 0xBC..0xFD range inside labels, so qnames are not UTF-8 and never go
//! through `String`.

use std::net::Ipv4Addr;

use crate::encoder::{b32_char, NameEncoder};
use crate::error::{Error, Result};

/// DNS header length
pub const DNS_HDR_LEN: usize = 12;

/// Longest wire-format name we will emit (RFC 1035 limit).
const NAME_WIRE_MAX: usize = 255;

/// Encoded characters per hostname-encoded chunk. One prefix character,
/// up to four labels and the two-character collision counter stay within
/// [`NAME_WIRE_MAX`] once label length bytes are added.
const HOSTNAME_ENC_CHARS: usize = 242;

/// Compression pointer to the question name at offset 12.
const QNAME_PTR: [u8; 2] = [0xC0, 0x0C];

/// Record types the tunnel deals with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    A,
    Ns,
    Cname,
    Null,
    Mx,
    Txt,
    Aaaa,
    Srv,
    Opt,
    /// Experimental private-use type carrying raw bytes, like NULL.
    Private,
    Other(u16),
}

/// Wire value of the private-use record type.
pub const TYPE_PRIVATE: u16 = 65399;

impl QueryType {
    pub fn from_u16(v: u16) -> Self {
        match v {
            1 => QueryType::A,
            2 => QueryType::Ns,
            5 => QueryType::Cname,
            10 => QueryType::Null,
            15 => QueryType::Mx,
            16 => QueryType::Txt,
            28 => QueryType::Aaaa,
            33 => QueryType::Srv,
            41 => QueryType::Opt,
            TYPE_PRIVATE => QueryType::Private,
            other => QueryType::Other(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            QueryType::A => 1,
            QueryType::Ns => 2,
            QueryType::Cname => 5,
            QueryType::Null => 10,
            QueryType::Mx => 15,
            QueryType::Txt => 16,
            QueryType::Aaaa => 28,
            QueryType::Srv => 33,
            QueryType::Opt => 41,
            QueryType::Private => TYPE_PRIVATE,
            QueryType::Other(v) => v,
        }
    }

    /// True for the types whose answer carries raw bytes verbatim.
    pub fn is_raw(self) -> bool {
        matches!(self, QueryType::Null | QueryType::Private)
    }
}

/// A parsed DNS question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub id: u16,
    pub qtype: QueryType,
    /// Dotted presentation form, original byte case preserved.
    pub name: Vec<u8>,
}

impl DnsQuery {
    /// Lossy name rendering for log output.
    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Extract the transaction id without a full parse (forwarder reply path).
pub fn query_id(packet: &[u8]) -> Option<u16> {
    if packet.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([packet[0], packet[1]]))
}

/// Parse a query datagram: header sanity, then the first question.
pub fn decode_query(packet: &[u8]) -> Result<DnsQuery> {
    if packet.len() < DNS_HDR_LEN {
        return Err(Error::PacketTooShort {
            expected: DNS_HDR_LEN,
            actual: packet.len(),
        });
    }

    let id = u16::from_be_bytes([packet[0], packet[1]]);
    if packet[2] & 0x80 != 0 {
        return Err(Error::MalformedDns("not a query (QR set)".into()));
    }
    let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
    if qdcount == 0 {
        return Err(Error::MalformedDns("no question section".into()));
    }

    let mut name = Vec::with_capacity(64);
    let mut pos = DNS_HDR_LEN;
    loop {
        let len = *packet
            .get(pos)
            .ok_or_else(|| Error::MalformedDns("truncated qname".into()))? as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        if len & 0xC0 != 0 {
            return Err(Error::MalformedDns("compressed qname in question".into()));
        }
        if pos + 1 + len > packet.len() {
            return Err(Error::MalformedDns("qname label overruns packet".into()));
        }
        if !name.is_empty() {
            name.push(b'.');
        }
        name.extend_from_slice(&packet[pos + 1..pos + 1 + len]);
        if name.len() > NAME_WIRE_MAX {
            return Err(Error::MalformedDns("qname too long".into()));
        }
        pos += 1 + len;
    }

    if pos + 4 > packet.len() {
        return Err(Error::MalformedDns("truncated question".into()));
    }
    let qtype = QueryType::from_u16(u16::from_be_bytes([packet[pos], packet[pos + 1]]));

    Ok(DnsQuery { id, qtype, name })
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

/// Write a presentation-form name as length-prefixed wire labels.
fn push_name(out: &mut Vec<u8>, name: &[u8]) {
    for label in name.split(|&b| b == b'.') {
        if label.is_empty() {
            continue;
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label);
    }
    out.push(0);
}

fn wire_name(name: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + 2);
    push_name(&mut out, name);
    out
}

/// Response header plus an echo of the question section.
fn response_prelude(q: &DnsQuery, ancount: u16, arcount: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(512);
    put_u16(&mut out, q.id);
    // QR | AA | RD | RA, no error
    out.extend_from_slice(&[0x85, 0x80]);
    put_u16(&mut out, 1);
    put_u16(&mut out, ancount);
    put_u16(&mut out, 0);
    put_u16(&mut out, arcount);
    push_name(&mut out, &q.name);
    put_u16(&mut out, q.qtype.to_u16());
    put_u16(&mut out, 1);
    out
}

/// Resource record whose name is a pointer to the question. TTL is zero so
/// resolvers do not hold on to tunnel answers.
fn push_rr(out: &mut Vec<u8>, rtype: u16, rdata: &[u8]) {
    out.extend_from_slice(&QNAME_PTR);
    put_u16(out, rtype);
    put_u16(out, 1);
    put_u32(out, 0);
    put_u16(out, rdata.len() as u16);
    out.extend_from_slice(rdata);
}

/// Resource record with an explicit owner name (additional section).
fn push_rr_named(out: &mut Vec<u8>, name: &[u8], rtype: u16, rdata: &[u8]) {
    push_name(out, name);
    put_u16(out, rtype);
    put_u16(out, 1);
    put_u32(out, 0);
    put_u16(out, rdata.len() as u16);
    out.extend_from_slice(rdata);
}

/// Encode one hostname-shaped chunk of downstream data.
///
/// The first character names the encoding (`h`/`i`/`j`/`k` for
/// Base32/64/64u/128), the payload is split into labels of at most 63
/// characters, and the final label is a rotating two-character 10-bit
/// collision counter so middleboxes never see the same name twice.
/// Returns the presentation-form name and the number of payload bytes
/// consumed.
fn encode_hostname(downenc: u8, data: &[u8], cmc: &mut u16) -> (Vec<u8>, usize) {
    let (prefix, enc) = match downenc {
        b'S' => (b'i', NameEncoder::Base64),
        b'U' => (b'j', NameEncoder::Base64u),
        b'V' => (b'k', NameEncoder::Base128),
        _ => (b'h', NameEncoder::Base32),
    };

    let take = enc.raw_length(HOSTNAME_ENC_CHARS).min(data.len());
    let encoded = enc.encode(&data[..take]);

    let mut stream = Vec::with_capacity(encoded.len() + 1);
    stream.push(prefix);
    stream.extend_from_slice(&encoded);

    let mut name = Vec::with_capacity(stream.len() + 8);
    for (i, chunk) in stream.chunks(63).enumerate() {
        if i > 0 {
            name.push(b'.');
        }
        name.extend_from_slice(chunk);
    }
    name.push(b'.');
    name.push(b32_char((*cmc & 0x1F) as u8));
    name.push(b32_char((*cmc >> 5) as u8));
    *cmc = (*cmc + 1) & 0x3FF;

    (name, take)
}

/// Build the answer datagram carrying `data`, shaped by the query type.
///
/// * `CNAME`/`A` answer with one CNAME record holding a hostname-encoded
///   chunk (whatever fits in one name).
/// * `MX`/`SRV` chain as many records as the payload needs, preference and
///   priority ascending in tens.
/// * `TXT` holds one record: an encoding tag (`t`/`s`/`u`/`v`/`r`) followed
///   by the payload, split into 255-byte character-strings.
/// * `NULL`/`PRIVATE` carry the payload verbatim.
pub fn encode_data_answer(
    q: &DnsQuery,
    data: &[u8],
    downenc: u8,
    cmc: &mut u16,
) -> Result<Vec<u8>> {
    match q.qtype {
        QueryType::Cname | QueryType::A => {
            let (host, _) = encode_hostname(downenc, data, cmc);
            let mut out = response_prelude(q, 1, 0);
            push_rr(&mut out, QueryType::Cname.to_u16(), &wire_name(&host));
            Ok(out)
        }
        QueryType::Mx | QueryType::Srv => {
            let mut chunks = Vec::new();
            let mut offset = 0;
            loop {
                let (host, used) = encode_hostname(downenc, &data[offset..], cmc);
                chunks.push(host);
                offset += used;
                if used == 0 || offset >= data.len() {
                    break;
                }
            }

            let mut out = response_prelude(q, chunks.len() as u16, 0);
            for (i, host) in chunks.iter().enumerate() {
                let pref = 10 * (i as u16 + 1);
                let mut rdata = Vec::with_capacity(host.len() + 8);
                put_u16(&mut rdata, pref);
                if q.qtype == QueryType::Srv {
                    // priority reuses the MX preference slot; weight and
                    // port are unused by the tunnel client
                    put_u16(&mut rdata, 0);
                    put_u16(&mut rdata, 0);
                }
                push_name(&mut rdata, host);
                push_rr(&mut out, q.qtype.to_u16(), &rdata);
            }
            Ok(out)
        }
        QueryType::Txt => {
            let (tag, payload): (u8, Vec<u8>) = match downenc {
                b'S' => (b's', NameEncoder::Base64.encode(data)),
                b'U' => (b'u', NameEncoder::Base64u.encode(data)),
                b'V' => (b'v', NameEncoder::Base128.encode(data)),
                b'R' => (b'r', data.to_vec()),
                _ => (b't', NameEncoder::Base32.encode(data)),
            };
            let mut stream = Vec::with_capacity(payload.len() + 1);
            stream.push(tag);
            stream.extend_from_slice(&payload);

            let mut rdata = Vec::with_capacity(stream.len() + 4);
            for chunk in stream.chunks(255) {
                rdata.push(chunk.len() as u8);
                rdata.extend_from_slice(chunk);
            }
            let mut out = response_prelude(q, 1, 0);
            push_rr(&mut out, QueryType::Txt.to_u16(), &rdata);
            Ok(out)
        }
        QueryType::Null | QueryType::Private => {
            let mut out = response_prelude(q, 1, 0);
            push_rr(&mut out, q.qtype.to_u16(), data);
            Ok(out)
        }
        other => Err(Error::UnsupportedRecordType(other.to_u16())),
    }
}

/// NS answer: delegate the topdomain to `ns.<topdomain>` and hand out its
/// address in the additional section.
pub fn encode_ns_answer(q: &DnsQuery, topdomain: &[u8], ip: Ipv4Addr) -> Vec<u8> {
    let mut ns_name = Vec::with_capacity(topdomain.len() + 3);
    ns_name.extend_from_slice(b"ns.");
    ns_name.extend_from_slice(topdomain);

    let mut out = response_prelude(q, 1, 1);
    push_rr(&mut out, QueryType::Ns.to_u16(), &wire_name(&ns_name));
    push_rr_named(&mut out, &ns_name, QueryType::A.to_u16(), &ip.octets());
    out
}

/// Plain A answer for the `ns.`/`www.` convenience names.
pub fn encode_a_answer(q: &DnsQuery, ip: Ipv4Addr) -> Vec<u8> {
    let mut out = response_prelude(q, 1, 0);
    push_rr(&mut out, QueryType::A.to_u16(), &ip.octets());
    out
}

/// Build a query datagram (recursion desired). The server itself only ever
/// answers; this is the client-shaped half used by tools and tests.
pub fn encode_query(id: u16, qtype: QueryType, name: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(DNS_HDR_LEN + name.len() + 6);
    put_u16(&mut out, id);
    out.extend_from_slice(&[0x01, 0x00]);
    put_u16(&mut out, 1);
    put_u16(&mut out, 0);
    put_u16(&mut out, 0);
    put_u16(&mut out, 0);
    push_name(&mut out, name);
    put_u16(&mut out, qtype.to_u16());
    put_u16(&mut out, 1);
    out
}
