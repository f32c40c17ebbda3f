//! UDP datagram envelope codec
//!
//! Every datagram crossing a SOCKS5 UDP relay carries a small header in
//! front of the payload:
//!
//! ```text
//! +----+------+------+----------+----------+----------+
//! |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +----+------+------+----------+----------+----------+
//! | 2  |  1   |  1   | Variable |    2     | Variable |
//! +----+------+------+----------+----------+----------+
//! ```
//!
//! The RSV field is written as received (all construction paths set it to
//! zero) and is not validated on parse. FRAG is transported; reassembly is
//! not implemented and the relay drops fragmented datagrams.

use crate::consts::*;
use crate::error::Socks5Error;
use crate::types::TargetAddr;
use bytes::{Buf, Bytes};
use std::net::{Ipv4Addr, Ipv6Addr};

/// A SOCKS5 UDP datagram: envelope header plus payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    /// Reserved field, zero on anything this crate builds
    pub rsv: u16,
    /// Fragment number (0 for standalone datagrams)
    pub frag: u8,
    /// Source/destination address carried by the envelope
    pub addr: TargetAddr,
    /// Payload bytes
    pub data: Bytes,
}

impl UdpPacket {
    /// Create a standalone (FRAG=0) datagram
    pub fn new(addr: TargetAddr, data: Bytes) -> Self {
        UdpPacket {
            rsv: 0,
            frag: 0,
            addr,
            data,
        }
    }

    /// Create a datagram with an explicit fragment number
    pub fn with_frag(frag: u8, addr: TargetAddr, data: Bytes) -> Self {
        UdpPacket {
            rsv: 0,
            frag,
            addr,
            data,
        }
    }

    /// Check if this is a fragmented datagram
    pub fn is_fragmented(&self) -> bool {
        self.frag != 0
    }

    /// Parse a datagram from raw bytes.
    ///
    /// The header is consumed exactly per its ATYP; a datagram shorter than
    /// its header demands is [`Socks5Error::Truncated`]. Everything after
    /// the port is the payload.
    pub fn parse(data: &[u8]) -> Result<Self, Socks5Error> {
        if data.len() < 4 {
            return Err(Socks5Error::Truncated);
        }

        let mut buf = data;
        let rsv = buf.get_u16();
        let frag = buf.get_u8();
        let atyp = buf.get_u8();

        let (addr, payload) = parse_address(atyp, buf)?;

        Ok(UdpPacket {
            rsv,
            frag,
            addr,
            data: Bytes::copy_from_slice(payload),
        })
    }

    /// Number of bytes the encoded datagram occupies
    pub fn encoded_len(&self) -> usize {
        let host_size = match &self.addr {
            TargetAddr::Ip(addr) if addr.is_ipv4() => 4,
            TargetAddr::Ip(_) => 16,
            TargetAddr::Domain(domain, _) => 1 + domain.len(),
        };
        4 + host_size + 2 + self.data.len()
    }

    /// Encode the datagram into `buf`.
    ///
    /// Returns the number of bytes written. When `buf` cannot hold the
    /// encoding, nothing is written and the error carries the required
    /// size.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize, Socks5Error> {
        if let TargetAddr::Domain(domain, _) = &self.addr {
            if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
                return Err(Socks5Error::InvalidDomain(domain.clone()));
            }
        }

        let required = self.encoded_len();
        if buf.len() < required {
            return Err(Socks5Error::BufferTooSmall { required });
        }

        buf[0..2].copy_from_slice(&self.rsv.to_be_bytes());
        buf[2] = self.frag;

        let addr_bytes = self.addr.to_bytes();
        buf[3..3 + addr_bytes.len()].copy_from_slice(&addr_bytes);

        let payload_at = 3 + addr_bytes.len();
        buf[payload_at..payload_at + self.data.len()].copy_from_slice(&self.data);

        Ok(required)
    }

    /// Encode the datagram into a fresh buffer
    pub fn to_bytes(&self) -> Result<Vec<u8>, Socks5Error> {
        let mut buf = vec![0u8; self.encoded_len()];
        let n = self.encode_into(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}

/// Parse the ATYP-selected address; returns the address and the remaining
/// payload bytes.
fn parse_address(atyp: u8, mut buf: &[u8]) -> Result<(TargetAddr, &[u8]), Socks5Error> {
    match atyp {
        SOCKS5_ADDR_TYPE_IPV4 => {
            if buf.len() < 6 {
                return Err(Socks5Error::Truncated);
            }
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            buf = &buf[4..];
            let port = buf.get_u16();
            Ok((TargetAddr::ipv4(ip, port), buf))
        }

        SOCKS5_ADDR_TYPE_DOMAIN => {
            if buf.is_empty() {
                return Err(Socks5Error::Truncated);
            }
            let len = buf[0] as usize;
            buf = &buf[1..];

            if len == 0 {
                return Err(Socks5Error::InvalidDomain("empty domain".to_string()));
            }
            if buf.len() < len + 2 {
                return Err(Socks5Error::Truncated);
            }
            let domain = String::from_utf8(buf[..len].to_vec())
                .map_err(|e| Socks5Error::InvalidDomain(e.to_string()))?;
            buf = &buf[len..];
            let port = buf.get_u16();
            Ok((TargetAddr::domain(domain, port), buf))
        }

        SOCKS5_ADDR_TYPE_IPV6 => {
            if buf.len() < 18 {
                return Err(Socks5Error::Truncated);
            }
            let mut ip_bytes = [0u8; 16];
            ip_bytes.copy_from_slice(&buf[..16]);
            let ip = Ipv6Addr::from(ip_bytes);
            buf = &buf[16..];
            let port = buf.get_u16();
            Ok((TargetAddr::ipv6(ip, port), buf))
        }

        other => Err(Socks5Error::UnsupportedAddressType(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    #[test]
    fn test_new_is_standalone() {
        let packet = UdpPacket::new(
            TargetAddr::ipv4(Ipv4Addr::new(192, 168, 1, 1), 8080),
            Bytes::from_static(b"hello"),
        );

        assert_eq!(packet.rsv, 0);
        assert_eq!(packet.frag, 0);
        assert!(!packet.is_fragmented());
    }

    #[test]
    fn test_with_frag() {
        let packet = UdpPacket::with_frag(
            1,
            TargetAddr::ipv4(Ipv4Addr::new(127, 0, 0, 1), 1234),
            Bytes::from_static(b"data"),
        );

        assert_eq!(packet.frag, 1);
        assert!(packet.is_fragmented());
    }

    #[test]
    fn test_encode_ipv4() {
        let packet = UdpPacket::new(
            TargetAddr::ipv4(Ipv4Addr::new(10, 0, 0, 1), 80),
            Bytes::from_static(b"test"),
        );

        let encoded = packet.to_bytes().unwrap();

        // RSV (2) + FRAG (1) + ATYP (1) + IPv4 (4) + PORT (2) + DATA (4)
        assert_eq!(encoded.len(), 2 + 1 + 1 + 4 + 2 + 4);
        assert_eq!(&encoded[0..2], &[0, 0]);
        assert_eq!(encoded[2], 0);
        assert_eq!(encoded[3], SOCKS5_ADDR_TYPE_IPV4);
        assert_eq!(&encoded[4..8], &[10, 0, 0, 1]);
        assert_eq!(&encoded[8..10], &80u16.to_be_bytes());
        assert_eq!(&encoded[10..], b"test");
    }

    #[test]
    fn test_encode_domain() {
        let packet = UdpPacket::new(
            TargetAddr::domain("test.com".to_string(), 443),
            Bytes::from_static(b"hi"),
        );

        let encoded = packet.to_bytes().unwrap();

        assert_eq!(encoded.len(), 2 + 1 + 1 + 1 + 8 + 2 + 2);
        assert_eq!(encoded[3], SOCKS5_ADDR_TYPE_DOMAIN);
        assert_eq!(encoded[4], 8);
        assert_eq!(&encoded[5..13], b"test.com");
    }

    #[test]
    fn test_round_trip_all_address_types() {
        let addrs = [
            TargetAddr::ipv4(Ipv4Addr::new(192, 168, 1, 100), 9999),
            TargetAddr::ipv6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 7), 53),
            TargetAddr::domain("example.org".to_string(), 8080),
        ];

        for addr in addrs {
            let original = UdpPacket::new(addr, Bytes::from_static(b"payload"));
            let encoded = original.to_bytes().unwrap();
            let parsed = UdpPacket::parse(&encoded).unwrap();
            assert_eq!(parsed, original);
        }
    }

    #[test]
    fn test_encode_into_reports_required_size() {
        let packet = UdpPacket::new(
            TargetAddr::ipv4(Ipv4Addr::new(1, 1, 1, 1), 53),
            Bytes::from_static(b"query"),
        );

        let mut small = [0u8; 4];
        let before = small;
        match packet.encode_into(&mut small) {
            Err(Socks5Error::BufferTooSmall { required }) => {
                assert_eq!(required, packet.encoded_len());
            }
            other => panic!("expected BufferTooSmall, got {:?}", other),
        }
        // Nothing was written.
        assert_eq!(small, before);

        let mut big = vec![0u8; 128];
        let n = packet.encode_into(&mut big).unwrap();
        assert_eq!(n, packet.encoded_len());
    }

    #[test]
    fn test_auto_selection_matches_explicit() {
        // An address built from a string picks the same ATYP bytes as one
        // built with the explicit constructor.
        let auto = TargetAddr::from_host_auto("1.2.3.4", 80);
        let explicit = TargetAddr::ipv4(Ipv4Addr::new(1, 2, 3, 4), 80);
        assert_eq!(
            UdpPacket::new(auto, Bytes::new()).to_bytes().unwrap(),
            UdpPacket::new(explicit, Bytes::new()).to_bytes().unwrap()
        );

        // IPv4-mapped IPv6 reduces to the 4-byte form.
        let mapped: SocketAddr = "[::ffff:1.2.3.4]:80".parse().unwrap();
        let reduced: TargetAddr = mapped.into();
        assert_eq!(reduced.addr_type(), SOCKS5_ADDR_TYPE_IPV4);

        let auto6 = TargetAddr::from_host_auto("2001:db8::1", 443);
        assert_eq!(auto6.addr_type(), SOCKS5_ADDR_TYPE_IPV6);

        let auto_domain = TargetAddr::from_host_auto("example.com", 443);
        assert_eq!(auto_domain.addr_type(), SOCKS5_ADDR_TYPE_DOMAIN);
    }

    #[test]
    fn test_parse_too_short() {
        assert!(matches!(
            UdpPacket::parse(&[0, 0, 0]),
            Err(Socks5Error::Truncated)
        ));
    }

    #[test]
    fn test_parse_rsv_not_validated() {
        let mut encoded = UdpPacket::new(
            TargetAddr::ipv4(Ipv4Addr::new(0, 0, 0, 0), 0),
            Bytes::new(),
        )
        .to_bytes()
        .unwrap();
        encoded[0] = 0xAB;
        encoded[1] = 0xCD;

        let parsed = UdpPacket::parse(&encoded).unwrap();
        assert_eq!(parsed.rsv, 0xABCD);
    }

    #[test]
    fn test_parse_unknown_atyp() {
        let data = [0, 0, 0, 0x05, 1, 2, 3, 4, 0, 80];
        assert!(matches!(
            UdpPacket::parse(&data),
            Err(Socks5Error::UnsupportedAddressType(0x05))
        ));
    }

    #[test]
    fn test_truncations_rejected() {
        let packet = UdpPacket::new(
            TargetAddr::domain("host.example".to_string(), 4444),
            Bytes::from_static(b"x"),
        );
        let full = packet.to_bytes().unwrap();
        let header_len = full.len() - packet.data.len();

        // Any cut inside the header must fail; cuts inside the payload just
        // shorten the payload.
        for cut in 0..header_len {
            assert!(
                UdpPacket::parse(&full[..cut]).is_err(),
                "header prefix of {} bytes parsed",
                cut
            );
        }
    }

    #[test]
    fn test_empty_payload() {
        let packet = UdpPacket::new(TargetAddr::ipv4(Ipv4Addr::new(8, 8, 8, 8), 53), Bytes::new());
        let encoded = packet.to_bytes().unwrap();
        let parsed = UdpPacket::parse(&encoded).unwrap();
        assert!(parsed.data.is_empty());
        assert_eq!(parsed, packet);
    }
}
