//! DNS wire codec: question decoding and response synthesis.
//!
//! Only the header and the first question are decoded; EDNS/OPT records in
//! the additional section are left untouched and forwarded verbatim.

use thiserror::Error;

pub const DNS_PORT: u16 = 53;

const HEADER_LEN: usize = 12;
const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 253;

const FLAG_QR: u16 = 0x8000;
const FLAG_OPCODE: u16 = 0x7800;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;
const RCODE_NXDOMAIN: u16 = 3;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DnsError {
    #[error("truncated message")]
    Truncated,

    #[error("unsupported question count {0}")]
    BadQuestionCount(u16),

    #[error("bad label")]
    BadLabel,

    #[error("name too long")]
    NameTooLong,
}

/// Header fields plus the first (and only) question of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub id: u16,
    pub flags: u16,
    /// Lowercased, no trailing dot.
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
    question_len: usize,
}

/// Decode the header and the question section of a DNS query.
///
/// Rejects truncated headers, QDCOUNT != 1, and label-length overflows
/// (including compression pointers, which never appear in a question).
pub fn parse_question(data: &[u8]) -> Result<DnsQuestion, DnsError> {
    if data.len() < HEADER_LEN {
        return Err(DnsError::Truncated);
    }
    let id = u16::from_be_bytes([data[0], data[1]]);
    let flags = u16::from_be_bytes([data[2], data[3]]);
    let qdcount = u16::from_be_bytes([data[4], data[5]]);
    if qdcount != 1 {
        return Err(DnsError::BadQuestionCount(qdcount));
    }

    let mut pos = HEADER_LEN;
    let mut name = String::new();
    loop {
        let len = *data.get(pos).ok_or(DnsError::Truncated)? as usize;
        pos += 1;
        if len == 0 {
            break;
        }
        if len > MAX_LABEL_LEN {
            return Err(DnsError::BadLabel);
        }
        if pos + len > data.len() {
            return Err(DnsError::Truncated);
        }
        if !name.is_empty() {
            name.push('.');
        }
        if name.len() + len > MAX_NAME_LEN {
            return Err(DnsError::NameTooLong);
        }
        for &b in &data[pos..pos + len] {
            name.push(b.to_ascii_lowercase() as char);
        }
        pos += len;
    }

    if pos + 4 > data.len() {
        return Err(DnsError::Truncated);
    }
    let qtype = u16::from_be_bytes([data[pos], data[pos + 1]]);
    let qclass = u16::from_be_bytes([data[pos + 2], data[pos + 3]]);

    Ok(DnsQuestion {
        id,
        flags,
        name,
        qtype,
        qclass,
        question_len: pos + 4 - HEADER_LEN,
    })
}

/// Synthesize the negative answer for a denied query.
///
/// QR=1, RA=1, opcode and RD echoed, RCODE=NXDOMAIN, the original question
/// echoed byte-for-byte, no answer/authority/additional records.
pub fn build_nxdomain(query: &[u8], question: &DnsQuestion) -> Vec<u8> {
    let flags =
        FLAG_QR | (question.flags & FLAG_OPCODE) | (question.flags & FLAG_RD) | FLAG_RA
            | RCODE_NXDOMAIN;

    let mut response = Vec::with_capacity(HEADER_LEN + question.question_len);
    response.extend_from_slice(&question.id.to_be_bytes());
    response.extend_from_slice(&flags.to_be_bytes());
    response.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    response.extend_from_slice(&[0, 0, 0, 0, 0, 0]); // ANCOUNT, NSCOUNT, ARCOUNT
    response.extend_from_slice(&query[HEADER_LEN..HEADER_LEN + question.question_len]);
    response
}

/// Overwrite the transaction id of a raw DNS message in place.
pub fn rewrite_id(message: &mut [u8], id: u16) -> bool {
    if message.len() < 2 {
        return false;
    }
    message[..2].copy_from_slice(&id.to_be_bytes());
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&id.to_be_bytes());
        data.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        for label in name.split('.').filter(|l| !l.is_empty()) {
            data.push(label.len() as u8);
            data.extend_from_slice(label.as_bytes());
        }
        data.push(0);
        data.extend_from_slice(&qtype.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes()); // IN
        data
    }

    #[test]
    fn test_parse_query() {
        let data = encode_query(0x1234, "www.example.com", 1);
        let q = parse_question(&data).unwrap();
        assert_eq!(q.id, 0x1234);
        assert_eq!(q.name, "www.example.com");
        assert_eq!(q.qtype, 1);
        assert_eq!(q.qclass, 1);
        assert_eq!(q.flags & FLAG_RD, FLAG_RD);
    }

    #[test]
    fn test_parse_lowercases_name() {
        let data = encode_query(1, "WWW.Example.COM", 28);
        let q = parse_question(&data).unwrap();
        assert_eq!(q.name, "www.example.com");
    }

    #[test]
    fn test_truncated_header_rejected() {
        assert_eq!(parse_question(&[0x12, 0x34]).unwrap_err(), DnsError::Truncated);
    }

    #[test]
    fn test_truncated_question_rejected() {
        let mut data = encode_query(1, "example.com", 1);
        data.truncate(data.len() - 3);
        assert_eq!(parse_question(&data).unwrap_err(), DnsError::Truncated);
    }

    #[test]
    fn test_bad_question_count_rejected() {
        let mut data = encode_query(1, "example.com", 1);
        data[5] = 2;
        assert_eq!(
            parse_question(&data).unwrap_err(),
            DnsError::BadQuestionCount(2)
        );
        data[5] = 0;
        assert_eq!(
            parse_question(&data).unwrap_err(),
            DnsError::BadQuestionCount(0)
        );
    }

    #[test]
    fn test_compression_pointer_in_question_rejected() {
        let mut data = encode_query(1, "example.com", 1);
        data[HEADER_LEN] = 0xc0; // pointer marker where a label length belongs
        assert_eq!(parse_question(&data).unwrap_err(), DnsError::BadLabel);
    }

    #[test]
    fn test_label_running_past_end_rejected() {
        let mut data = vec![0, 1, 1, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        data.push(40); // label claims 40 bytes, only 2 follow
        data.extend_from_slice(b"ab");
        assert_eq!(parse_question(&data).unwrap_err(), DnsError::Truncated);
    }

    #[test]
    fn test_nxdomain_shape() {
        let query = encode_query(0x1234, "ads.example.com", 1);
        let q = parse_question(&query).unwrap();
        let resp = build_nxdomain(&query, &q);

        assert_eq!(u16::from_be_bytes([resp[0], resp[1]]), 0x1234);
        let flags = u16::from_be_bytes([resp[2], resp[3]]);
        assert_ne!(flags & FLAG_QR, 0, "QR must be set");
        assert_ne!(flags & FLAG_RA, 0, "RA must be set");
        assert_ne!(flags & FLAG_RD, 0, "RD echoed");
        assert_eq!(flags & 0x000f, RCODE_NXDOMAIN);
        assert_eq!(u16::from_be_bytes([resp[4], resp[5]]), 1); // QDCOUNT
        assert_eq!(u16::from_be_bytes([resp[6], resp[7]]), 0); // ANCOUNT
        assert_eq!(u16::from_be_bytes([resp[8], resp[9]]), 0); // NSCOUNT
        assert_eq!(u16::from_be_bytes([resp[10], resp[11]]), 0); // ARCOUNT
        assert_eq!(&resp[HEADER_LEN..], &query[HEADER_LEN..]);

        // The echoed question must itself parse back to the same name.
        let round = parse_question(&resp).unwrap();
        assert_eq!(round.name, q.name);
    }

    #[test]
    fn test_rewrite_id() {
        let mut data = encode_query(0x1111, "example.com", 1);
        assert!(rewrite_id(&mut data, 0xbeef));
        assert_eq!(parse_question(&data).unwrap().id, 0xbeef);
        assert!(!rewrite_id(&mut [0u8; 1], 1));
    }
}
