//! IP and UDP packet codec for the tunnel side.
//!
//! Parses raw tun frames into borrowed datagram descriptors and emits reply
//! packets with recomputed checksums. Fragmented datagrams are rejected:
//! DNS-over-UDP traffic handled here never legitimately fragments.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

pub const IP_PROTO_UDP: u8 = 17;

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const UDP_HEADER_LEN: usize = 8;
const IPV6_NEXT_FRAGMENT: u8 = 44;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PacketError {
    #[error("truncated packet")]
    Truncated,

    #[error("unsupported ip version {0}")]
    UnsupportedVersion(u8),

    #[error("fragmented datagram")]
    Fragmented,

    #[error("bad length field")]
    BadLength,

    #[error("address family mismatch")]
    AddressFamily,

    #[error("payload too large")]
    TooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

/// A parsed IP datagram: addresses, transport protocol, payload slice.
#[derive(Debug, PartialEq, Eq)]
pub struct IpDatagram<'a> {
    pub version: IpVersion,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: u8,
    pub payload: &'a [u8],
}

/// A parsed UDP datagram inside an IP payload.
#[derive(Debug, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

/// Peek at the IP version nibble without a full parse.
pub fn ip_version(buf: &[u8]) -> Option<u8> {
    buf.first().map(|b| b >> 4)
}

pub fn parse_ip(buf: &[u8]) -> Result<IpDatagram<'_>, PacketError> {
    match ip_version(buf) {
        Some(4) => parse_ipv4(buf),
        Some(6) => parse_ipv6(buf),
        Some(v) => Err(PacketError::UnsupportedVersion(v)),
        None => Err(PacketError::Truncated),
    }
}

fn parse_ipv4(buf: &[u8]) -> Result<IpDatagram<'_>, PacketError> {
    if buf.len() < IPV4_HEADER_LEN {
        return Err(PacketError::Truncated);
    }
    let ihl = (buf[0] & 0x0f) as usize * 4;
    if ihl < IPV4_HEADER_LEN || buf.len() < ihl {
        return Err(PacketError::Truncated);
    }
    let total_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if total_len < ihl || total_len > buf.len() {
        return Err(PacketError::BadLength);
    }
    // MF flag or non-zero fragment offset.
    let frag = u16::from_be_bytes([buf[6], buf[7]]);
    if frag & 0x3fff != 0 {
        return Err(PacketError::Fragmented);
    }
    Ok(IpDatagram {
        version: IpVersion::V4,
        src: IpAddr::V4(Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15])),
        dst: IpAddr::V4(Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19])),
        protocol: buf[9],
        payload: &buf[ihl..total_len],
    })
}

fn parse_ipv6(buf: &[u8]) -> Result<IpDatagram<'_>, PacketError> {
    if buf.len() < IPV6_HEADER_LEN {
        return Err(PacketError::Truncated);
    }
    let payload_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    let next_header = buf[6];
    if next_header == IPV6_NEXT_FRAGMENT {
        return Err(PacketError::Fragmented);
    }
    let end = IPV6_HEADER_LEN + payload_len;
    if end > buf.len() {
        return Err(PacketError::BadLength);
    }
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&buf[8..24]);
    dst.copy_from_slice(&buf[24..40]);
    Ok(IpDatagram {
        version: IpVersion::V6,
        src: IpAddr::V6(Ipv6Addr::from(src)),
        dst: IpAddr::V6(Ipv6Addr::from(dst)),
        // Extension headers are not walked; anything other than plain UDP
        // is dropped by the caller's protocol check.
        protocol: next_header,
        payload: &buf[IPV6_HEADER_LEN..end],
    })
}

pub fn parse_udp(payload: &[u8]) -> Result<UdpDatagram<'_>, PacketError> {
    if payload.len() < UDP_HEADER_LEN {
        return Err(PacketError::Truncated);
    }
    let length = u16::from_be_bytes([payload[4], payload[5]]) as usize;
    if length < UDP_HEADER_LEN || length > payload.len() {
        return Err(PacketError::BadLength);
    }
    Ok(UdpDatagram {
        src_port: u16::from_be_bytes([payload[0], payload[1]]),
        dst_port: u16::from_be_bytes([payload[2], payload[3]]),
        payload: &payload[UDP_HEADER_LEN..length],
    })
}

/// Build a complete IP+UDP packet from `src` to `dst` carrying `payload`.
///
/// Both checksums are recomputed; the UDP checksum covers the standard
/// pseudo-header for the address family.
pub fn build_udp_packet(
    src: SocketAddr,
    dst: SocketAddr,
    payload: &[u8],
) -> Result<Vec<u8>, PacketError> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    if udp_len > u16::MAX as usize {
        return Err(PacketError::TooLarge);
    }
    match (src.ip(), dst.ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            if IPV4_HEADER_LEN + udp_len > u16::MAX as usize {
                return Err(PacketError::TooLarge);
            }
            let mut pkt = Vec::with_capacity(IPV4_HEADER_LEN + udp_len);
            pkt.extend_from_slice(&build_ipv4_header(s, d, IP_PROTO_UDP, udp_len));
            push_udp(&mut pkt, src.port(), dst.port(), payload);
            let cksum = udp_checksum_v4(s, d, &pkt[IPV4_HEADER_LEN..]);
            pkt[IPV4_HEADER_LEN + 6..IPV4_HEADER_LEN + 8].copy_from_slice(&cksum.to_be_bytes());
            Ok(pkt)
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            let mut pkt = Vec::with_capacity(IPV6_HEADER_LEN + udp_len);
            pkt.extend_from_slice(&build_ipv6_header(s, d, IP_PROTO_UDP, udp_len));
            push_udp(&mut pkt, src.port(), dst.port(), payload);
            let cksum = udp_checksum_v6(s, d, &pkt[IPV6_HEADER_LEN..]);
            pkt[IPV6_HEADER_LEN + 6..IPV6_HEADER_LEN + 8].copy_from_slice(&cksum.to_be_bytes());
            Ok(pkt)
        }
        _ => Err(PacketError::AddressFamily),
    }
}

fn build_ipv4_header(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, payload_len: usize) -> [u8; 20] {
    let total_len = (IPV4_HEADER_LEN + payload_len) as u16;
    let mut hdr = [0u8; 20];
    hdr[0] = 0x45; // version + IHL
    hdr[2..4].copy_from_slice(&total_len.to_be_bytes());
    hdr[6..8].copy_from_slice(&[0x40, 0]); // don't fragment
    hdr[8] = 64; // TTL
    hdr[9] = proto;
    hdr[12..16].copy_from_slice(&src.octets());
    hdr[16..20].copy_from_slice(&dst.octets());
    let cksum = checksum(&hdr);
    hdr[10..12].copy_from_slice(&cksum.to_be_bytes());
    hdr
}

fn build_ipv6_header(src: Ipv6Addr, dst: Ipv6Addr, next: u8, payload_len: usize) -> [u8; 40] {
    let mut hdr = [0u8; 40];
    hdr[0] = 0x60; // version, no traffic class / flow label
    hdr[4..6].copy_from_slice(&(payload_len as u16).to_be_bytes());
    hdr[6] = next;
    hdr[7] = 64; // hop limit
    hdr[8..24].copy_from_slice(&src.octets());
    hdr[24..40].copy_from_slice(&dst.octets());
    hdr
}

fn push_udp(pkt: &mut Vec<u8>, src_port: u16, dst_port: u16, payload: &[u8]) {
    let udp_len = (UDP_HEADER_LEN + payload.len()) as u16;
    pkt.extend_from_slice(&src_port.to_be_bytes());
    pkt.extend_from_slice(&dst_port.to_be_bytes());
    pkt.extend_from_slice(&udp_len.to_be_bytes());
    pkt.extend_from_slice(&[0, 0]); // checksum placeholder
    pkt.extend_from_slice(payload);
}

/// RFC 1071 ones-complement sum over `data`.
pub fn checksum(data: &[u8]) -> u16 {
    finalize_checksum(sum_be_words(data))
}

fn udp_checksum_v4(src: Ipv4Addr, dst: Ipv4Addr, udp: &[u8]) -> u16 {
    let mut sum = 0u32;
    sum += sum_be_words(&src.octets());
    sum += sum_be_words(&dst.octets());
    sum += IP_PROTO_UDP as u32;
    sum += udp.len() as u32;
    sum += sum_be_words(udp);
    nonzero(finalize_checksum(sum))
}

fn udp_checksum_v6(src: Ipv6Addr, dst: Ipv6Addr, udp: &[u8]) -> u16 {
    let mut sum = 0u32;
    sum += sum_be_words(&src.octets());
    sum += sum_be_words(&dst.octets());
    sum += udp.len() as u32;
    sum += IP_PROTO_UDP as u32;
    sum += sum_be_words(udp);
    nonzero(finalize_checksum(sum))
}

// A computed checksum of zero is transmitted as all-ones (RFC 768).
fn nonzero(cksum: u16) -> u16 {
    if cksum == 0 {
        0xffff
    } else {
        cksum
    }
}

fn finalize_checksum(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn sum_be_words(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let Some(&last) = chunks.remainder().first() {
        sum += u16::from_be_bytes([last, 0]) as u32;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(addr: &str) -> SocketAddr {
        addr.parse().unwrap()
    }

    #[test]
    fn test_checksum_rfc1071_example() {
        // 0x0001 + 0xf203 + 0xf4f5 + 0xf6f7 = 0x2ddf0 -> fold -> 0xddf2
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&data), !0xddf2);
    }

    #[test]
    fn test_ipv4_udp_round_trip() {
        let payload = b"\x12\x34\x01\x00dns-ish";
        let pkt = build_udp_packet(v4("10.0.0.1:53"), v4("10.0.0.2:50000"), payload).unwrap();

        let ip = parse_ip(&pkt).unwrap();
        assert_eq!(ip.version, IpVersion::V4);
        assert_eq!(ip.src, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(ip.dst, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(ip.protocol, IP_PROTO_UDP);

        let udp = parse_udp(ip.payload).unwrap();
        assert_eq!(udp.src_port, 53);
        assert_eq!(udp.dst_port, 50000);
        assert_eq!(udp.payload, payload);
    }

    #[test]
    fn test_ipv4_header_checksum_verifies() {
        let pkt = build_udp_packet(v4("10.0.0.1:53"), v4("10.0.0.2:50000"), b"abc").unwrap();
        // Summing a header including its own checksum folds to zero.
        assert_eq!(checksum(&pkt[..20]), 0);
    }

    #[test]
    fn test_udp_checksum_verifies_over_pseudo_header() {
        let pkt = build_udp_packet(v4("10.0.0.1:53"), v4("10.0.0.2:50000"), b"payload").unwrap();
        let mut sum = 0u32;
        sum += sum_be_words(&[10, 0, 0, 1]);
        sum += sum_be_words(&[10, 0, 0, 2]);
        sum += IP_PROTO_UDP as u32;
        sum += (pkt.len() - 20) as u32;
        sum += sum_be_words(&pkt[20..]);
        assert_eq!(finalize_checksum(sum), 0);
    }

    #[test]
    fn test_ipv6_udp_round_trip() {
        let src: SocketAddr = "[fd00:6f6e::1]:53".parse().unwrap();
        let dst: SocketAddr = "[fd00:6f6e::2]:40000".parse().unwrap();
        let pkt = build_udp_packet(src, dst, b"query").unwrap();

        let ip = parse_ip(&pkt).unwrap();
        assert_eq!(ip.version, IpVersion::V6);
        assert_eq!(ip.src, src.ip());
        assert_eq!(ip.dst, dst.ip());
        assert_eq!(ip.protocol, IP_PROTO_UDP);

        let udp = parse_udp(ip.payload).unwrap();
        assert_eq!(udp.src_port, 53);
        assert_eq!(udp.dst_port, 40000);
        assert_eq!(udp.payload, b"query");
    }

    #[test]
    fn test_family_mismatch_rejected() {
        let err = build_udp_packet(
            v4("10.0.0.1:53"),
            "[fd00:6f6e::2]:40000".parse().unwrap(),
            b"x",
        )
        .unwrap_err();
        assert_eq!(err, PacketError::AddressFamily);
    }

    #[test]
    fn test_fragmented_ipv4_rejected() {
        let mut pkt = build_udp_packet(v4("10.0.0.1:53"), v4("10.0.0.2:50000"), b"x").unwrap();
        pkt[6] = 0x20; // more-fragments
        assert_eq!(parse_ip(&pkt).unwrap_err(), PacketError::Fragmented);

        let mut pkt2 = build_udp_packet(v4("10.0.0.1:53"), v4("10.0.0.2:50000"), b"x").unwrap();
        pkt2[6] = 0x00;
        pkt2[7] = 0x01; // fragment offset 1
        assert_eq!(parse_ip(&pkt2).unwrap_err(), PacketError::Fragmented);
    }

    #[test]
    fn test_truncated_inputs_rejected() {
        assert_eq!(parse_ip(&[]).unwrap_err(), PacketError::Truncated);
        assert_eq!(parse_ip(&[0x45, 0, 0]).unwrap_err(), PacketError::Truncated);
        assert_eq!(parse_udp(&[0, 53, 0, 53]).unwrap_err(), PacketError::Truncated);
        assert_eq!(
            parse_ip(&[0x35; 20]).unwrap_err(),
            PacketError::UnsupportedVersion(3)
        );
    }

    #[test]
    fn test_udp_length_field_bounds() {
        // UDP length longer than the carried bytes.
        let bad = [0x00, 0x35, 0xc3, 0x50, 0x00, 0x40, 0x00, 0x00];
        assert_eq!(parse_udp(&bad).unwrap_err(), PacketError::BadLength);
        // UDP length shorter than the header.
        let bad = [0x00, 0x35, 0xc3, 0x50, 0x00, 0x04, 0x00, 0x00];
        assert_eq!(parse_udp(&bad).unwrap_err(), PacketError::BadLength);
    }

    #[test]
    fn test_ipv4_total_length_bounds_payload() {
        let mut pkt = build_udp_packet(v4("10.0.0.1:53"), v4("10.0.0.2:50000"), b"abcd").unwrap();
        // Trailing garbage beyond total_len is not part of the payload.
        pkt.extend_from_slice(&[0xaa; 7]);
        let ip = parse_ip(&pkt).unwrap();
        let udp = parse_udp(ip.payload).unwrap();
        assert_eq!(udp.payload, b"abcd");
    }
}
