use super::Ipv4Address;

enum_with_unknown! {
    /// IP datagram encapsulated protocol.
    pub enum Protocol(u8) {
        Icmp = 0x01,
        Tcp  = 0x06,
        Udp  = 0x11
    }
}

impl core::fmt::Display for Protocol {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match *self {
            Protocol::Icmp => write!(f, "ICMP"),
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Unknown(id) => write!(f, "0x{id:02x}"),
        }
    }
}

/// The Internet checksum (RFC 1071), as used by IPv4, ICMP, and TCP.
pub mod checksum {
    use byteorder::{ByteOrder, NetworkEndian};

    use super::Protocol;
    use crate::wire::Ipv4Address;

    const fn propagate_carries(word: u32) -> u16 {
        let sum = (word >> 16) + (word & 0xffff);
        ((sum >> 16) as u16) + (sum as u16)
    }

    /// Compute an RFC 1071 compliant checksum (without the final complement).
    pub fn data(mut data: &[u8]) -> u16 {
        let mut accum: u32 = 0;

        const CHUNK_SIZE: usize = 32;
        while data.len() >= CHUNK_SIZE {
            let mut d = &data[..CHUNK_SIZE];
            while d.len() >= 2 {
                accum += NetworkEndian::read_u16(d) as u32;
                d = &d[2..];
            }
            data = &data[CHUNK_SIZE..];
        }

        while data.len() >= 2 {
            accum += NetworkEndian::read_u16(data) as u32;
            data = &data[2..];
        }

        // Odd trailing byte counts as if it were the high byte of a
        // 16-bit word with a zero low byte.
        if let Some(&value) = data.first() {
            accum += (value as u32) << 8;
        }

        propagate_carries(accum)
    }

    /// Combine several RFC 1071 compliant checksums.
    pub fn combine(checksums: &[u16]) -> u16 {
        let mut accum: u32 = 0;
        for &word in checksums {
            accum += word as u32;
        }
        propagate_carries(accum)
    }

    /// The TCP/UDP pseudo-header checksum contribution.
    pub fn pseudo_header_v4(
        src_addr: &Ipv4Address,
        dst_addr: &Ipv4Address,
        next_header: Protocol,
        length: u32,
    ) -> u16 {
        let mut proto_len = [0u8; 4];
        proto_len[1] = next_header.into();
        NetworkEndian::write_u16(&mut proto_len[2..4], length as u16);

        combine(&[
            data(&src_addr.octets()),
            data(&dst_addr.octets()),
            data(&proto_len[..]),
        ])
    }

    /// Full Internet checksum over a TCP segment or ICMP message, seeded
    /// with the pseudo-header when `is_tcp` is set.
    ///
    /// A zero-length, non-TCP range returns `!0` unconditionally; this
    /// mirrors a quirk of the reference checksum routine rather than a
    /// deliberate design choice, and is preserved for wire compatibility.
    pub fn combined(
        src_addr: &Ipv4Address,
        dst_addr: &Ipv4Address,
        next_header: Protocol,
        payload: &[u8],
        is_tcp: bool,
    ) -> u16 {
        if payload.is_empty() && !is_tcp {
            return !0;
        }
        let pseudo = if is_tcp {
            pseudo_header_v4(src_addr, dst_addr, next_header, payload.len() as u32)
        } else {
            0
        };
        !combine(&[pseudo, data(payload)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_length_non_tcp_quirk() {
        let zero = Ipv4Address::new(0, 0, 0, 0);
        assert_eq!(
            checksum::combined(&zero, &zero, Protocol::Icmp, &[], false),
            !0
        );
    }

    #[test]
    fn known_checksum() {
        // A canonical all-zero 20-byte IPv4 header (minus checksum field)
        // folds to 0xffff before complementing.
        let buf = [0u8; 18];
        assert_eq!(checksum::data(&buf), 0);
    }
}
