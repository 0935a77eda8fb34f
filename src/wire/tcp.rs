use byteorder::{ByteOrder, NetworkEndian};
use core::{cmp, fmt, ops};

use super::ip::checksum;
use super::{Error, Ipv4Address, Result};

#[allow(unused)]
mod field {
    use crate::wire::field::*;

    pub const SRC_PORT: Field = 0..2;
    pub const DST_PORT: Field = 2..4;
    pub const SEQ_NUM: Field = 4..8;
    pub const ACK_NUM: Field = 8..12;
    pub const FLAGS: Field = 12..14;
    pub const WINDOW: Field = 14..16;
    pub const CHECKSUM: Field = 16..18;
    pub const URGENT: Field = 18..20;

    pub const OPT_MSS_KIND: usize = 20;
    pub const OPT_MSS: Field = 22..24;
}

/// Header length with no options: ports, sequence/ack numbers, the
/// data-offset/flags word, window, checksum, urgent pointer.
pub const HEADER_LEN: usize = field::URGENT.end;
/// This stack never emits more than a single MSS option.
pub const MAX_OPTION_LEN: usize = 4;

pub(crate) const FLAG_FIN: u16 = 0x01;
pub(crate) const FLAG_SYN: u16 = 0x02;
pub(crate) const FLAG_RST: u16 = 0x04;
pub(crate) const FLAG_ACK: u16 = 0x10;

const OPT_KIND_MSS: u8 = 2;
const OPT_LEN_MSS: u8 = 4;

/// Which of the three mutually-exclusive control bits (if any) is set on a
/// segment. `ACK` is tracked separately via [`Repr::ack_number`] being
/// `Some`, since every state but the very first SYN also carries an ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    None,
    Syn,
    Fin,
    Rst,
}

impl Control {
    const fn flag_bit(self) -> u16 {
        match self {
            Control::None => 0,
            Control::Syn => FLAG_SYN,
            Control::Fin => FLAG_FIN,
            Control::Rst => FLAG_RST,
        }
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Control::None => write!(f, "NONE"),
            Control::Syn => write!(f, "SYN"),
            Control::Fin => write!(f, "FIN"),
            Control::Rst => write!(f, "RST"),
        }
    }
}

/// A TCP sequence number.
///
/// Comparisons wrap around at 2^32 per RFC 793 §3.3: the sign of the
/// signed 32-bit difference between two sequence numbers determines their
/// order, rather than a plain unsigned comparison, which breaks the
/// instant either number wraps.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeqNumber(pub i32);

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0 as u32)
    }
}

impl ops::Add<usize> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: usize) -> SeqNumber {
        SeqNumber(self.0.wrapping_add(rhs as i32))
    }
}

impl ops::Sub<usize> for SeqNumber {
    type Output = SeqNumber;

    fn sub(self, rhs: usize) -> SeqNumber {
        SeqNumber(self.0.wrapping_sub(rhs as i32))
    }
}

impl ops::Sub for SeqNumber {
    type Output = usize;

    fn sub(self, rhs: SeqNumber) -> usize {
        let diff = self.0.wrapping_sub(rhs.0);
        debug_assert!(diff >= 0);
        diff as usize
    }
}

impl cmp::PartialOrd for SeqNumber {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        self.0.wrapping_sub(other.0).partial_cmp(&0)
    }
}

impl From<u32> for SeqNumber {
    fn from(value: u32) -> SeqNumber {
        SeqNumber(value as i32)
    }
}

impl From<SeqNumber> for u32 {
    fn from(value: SeqNumber) -> u32 {
        value.0 as u32
    }
}

/// A read/write wrapper around a TCP segment buffer.
#[derive(Debug, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Packet<T> {
    pub const fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < HEADER_LEN {
            return Err(Error);
        }
        if len < self.header_len() as usize {
            return Err(Error);
        }
        Ok(())
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    pub fn src_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::SRC_PORT])
    }

    pub fn dst_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::DST_PORT])
    }

    pub fn seq_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_i32(&self.buffer.as_ref()[field::SEQ_NUM]))
    }

    pub fn ack_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_i32(&self.buffer.as_ref()[field::ACK_NUM]))
    }

    fn flags_word(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::FLAGS])
    }

    /// Header length in octets, decoded from the top nibble of the
    /// data-offset/flags word.
    pub fn header_len(&self) -> u16 {
        ((self.flags_word() >> 12) & 0xf) * 4
    }

    pub fn fin(&self) -> bool {
        self.flags_word() & FLAG_FIN != 0
    }

    pub fn syn(&self) -> bool {
        self.flags_word() & FLAG_SYN != 0
    }

    pub fn rst(&self) -> bool {
        self.flags_word() & FLAG_RST != 0
    }

    pub fn ack(&self) -> bool {
        self.flags_word() & FLAG_ACK != 0
    }

    pub fn window_len(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::WINDOW])
    }

    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::CHECKSUM])
    }

    /// The MSS advertised in the options, if a SYN segment carries one.
    pub fn max_seg_size(&self) -> Option<u16> {
        let data = self.buffer.as_ref();
        if self.header_len() as usize >= field::OPT_MSS.end
            && data[field::OPT_MSS_KIND] == OPT_KIND_MSS
        {
            Some(NetworkEndian::read_u16(&data[field::OPT_MSS]))
        } else {
            None
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_ref()[self.header_len() as usize..]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    pub fn set_src_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::SRC_PORT], value);
    }

    pub fn set_dst_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::DST_PORT], value);
    }

    pub fn set_seq_number(&mut self, value: SeqNumber) {
        NetworkEndian::write_i32(&mut self.buffer.as_mut()[field::SEQ_NUM], value.0);
    }

    pub fn set_ack_number(&mut self, value: SeqNumber) {
        NetworkEndian::write_i32(&mut self.buffer.as_mut()[field::ACK_NUM], value.0);
    }

    /// Set the data-offset nibble (in octets, rounded to a 32-bit unit)
    /// and the control flags in a single write, matching how the
    /// reference implementation builds the word.
    pub fn set_header_len_and_flags(&mut self, header_len: u16, flags: u16) {
        let word = ((header_len / 4) << 12) | flags;
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::FLAGS], word);
    }

    pub fn set_window_len(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::WINDOW], value);
    }

    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::CHECKSUM], value);
    }

    pub fn clear_urgent(&mut self) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::URGENT], 0);
    }

    pub fn set_max_seg_size(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        data[field::OPT_MSS_KIND] = OPT_KIND_MSS;
        data[field::OPT_MSS_KIND + 1] = OPT_LEN_MSS;
        NetworkEndian::write_u16(&mut data[field::OPT_MSS], value);
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let offset = self.header_len() as usize;
        &mut self.buffer.as_mut()[offset..]
    }

    pub fn fill_checksum(&mut self, src_addr: &Ipv4Address, dst_addr: &Ipv4Address) {
        self.set_checksum(0);
        let header_len = self.header_len() as usize;
        let total_len = header_len + self.payload().len();
        let data = self.buffer.as_ref();
        let pseudo = checksum::pseudo_header_v4(
            src_addr,
            dst_addr,
            super::IpProtocol::Tcp,
            total_len as u32,
        );
        let sum = !checksum::combine(&[pseudo, checksum::data(&data[..total_len])]);
        self.set_checksum(sum);
    }
}

/// A high-level representation of a TCP segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Repr {
    pub src_port: u16,
    pub dst_port: u16,
    pub control: Control,
    pub seq_number: SeqNumber,
    /// `Some` whenever the ACK bit is set; `None` only on a bare initial SYN.
    pub ack_number: Option<SeqNumber>,
    pub window_len: u16,
    pub max_seg_size: Option<u16>,
    pub payload_len: usize,
}

impl Repr {
    /// Parse a TCP segment header. The checksum is read but, per the
    /// receive-path trust model used throughout this crate, never
    /// verified here.
    pub fn parse<T: AsRef<[u8]> + ?Sized>(packet: &Packet<&T>) -> Result<Repr> {
        let control = match (packet.syn(), packet.fin(), packet.rst()) {
            (true, _, _) => Control::Syn,
            (_, true, _) => Control::Fin,
            (_, _, true) => Control::Rst,
            _ => Control::None,
        };
        let ack_number = if packet.ack() {
            Some(packet.ack_number())
        } else {
            None
        };
        Ok(Repr {
            src_port: packet.src_port(),
            dst_port: packet.dst_port(),
            control,
            seq_number: packet.seq_number(),
            ack_number,
            window_len: packet.window_len(),
            max_seg_size: packet.max_seg_size(),
            payload_len: packet.payload().len(),
        })
    }

    pub const fn header_len(&self) -> usize {
        if self.max_seg_size.is_some() {
            HEADER_LEN + MAX_OPTION_LEN
        } else {
            HEADER_LEN
        }
    }

    pub const fn buffer_len(&self) -> usize {
        self.header_len() + self.payload_len
    }

    pub fn emit<T: AsRef<[u8]> + AsMut<[u8]>>(
        &self,
        packet: &mut Packet<T>,
        src_addr: &Ipv4Address,
        dst_addr: &Ipv4Address,
        payload: &[u8],
    ) {
        packet.set_src_port(self.src_port);
        packet.set_dst_port(self.dst_port);
        packet.set_seq_number(self.seq_number);
        packet.set_ack_number(self.ack_number.unwrap_or(SeqNumber(0)));

        let mut flags = self.control.flag_bit();
        if self.ack_number.is_some() {
            flags |= FLAG_ACK;
        }
        packet.set_header_len_and_flags(self.header_len() as u16, flags);

        packet.set_window_len(self.window_len);
        packet.clear_urgent();
        if let Some(mss) = self.max_seg_size {
            packet.set_max_seg_size(mss);
        }
        // header_len is now set, so payload_mut() resolves to the right
        // offset; the payload must land before fill_checksum walks the
        // whole segment.
        packet.payload_mut().copy_from_slice(payload);
        packet.fill_checksum(src_addr, dst_addr);
    }
}

impl fmt::Display for Repr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "TCP {}->{} {} seq={}",
            self.src_port, self.dst_port, self.control, self.seq_number
        )?;
        if let Some(ack) = self.ack_number {
            write!(f, " ack={ack}")?;
        }
        write!(f, " win={} len={}", self.window_len, self.payload_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs() -> (Ipv4Address, Ipv4Address) {
        (
            Ipv4Address::new(192, 168, 1, 2),
            Ipv4Address::new(192, 168, 1, 1),
        )
    }

    #[test]
    fn syn_with_mss_round_trips() {
        let (src, dst) = addrs();
        let repr = Repr {
            src_port: 1025,
            dst_port: 80,
            control: Control::Syn,
            seq_number: SeqNumber(1000),
            ack_number: None,
            window_len: 512,
            max_seg_size: Some(512),
            payload_len: 0,
        };
        let mut buffer = vec![0u8; repr.buffer_len()];
        let mut packet = Packet::new_unchecked(&mut buffer[..]);
        repr.emit(&mut packet, &src, &dst, &[]);

        let packet = Packet::new_checked(&buffer[..]).unwrap();
        assert_eq!(packet.header_len(), 24);
        assert!(packet.syn());
        assert!(!packet.ack());
        assert_eq!(packet.max_seg_size(), Some(512));

        let parsed = Repr::parse(&packet).unwrap();
        assert_eq!(parsed.control, Control::Syn);
        assert_eq!(parsed.ack_number, None);
        assert_eq!(parsed.max_seg_size, Some(512));
    }

    #[test]
    fn fin_ack_has_twenty_byte_header() {
        let (src, dst) = addrs();
        let repr = Repr {
            src_port: 80,
            dst_port: 1025,
            control: Control::Fin,
            seq_number: SeqNumber(50),
            ack_number: Some(SeqNumber(1001)),
            window_len: 512,
            max_seg_size: None,
            payload_len: 0,
        };
        let mut buffer = vec![0u8; repr.buffer_len()];
        let mut packet = Packet::new_unchecked(&mut buffer[..]);
        repr.emit(&mut packet, &src, &dst, &[]);

        assert_eq!(buffer.len(), 20);
        let packet = Packet::new_checked(&buffer[..]).unwrap();
        assert!(packet.fin());
        assert!(packet.ack());
        assert_eq!(packet.ack_number(), SeqNumber(1001));
    }

    #[test]
    fn data_segment_carries_payload_under_the_checksum() {
        let (src, dst) = addrs();
        let payload = b"echo";
        let repr = Repr {
            src_port: 1025,
            dst_port: 80,
            control: Control::None,
            seq_number: SeqNumber(2000),
            ack_number: Some(SeqNumber(50)),
            window_len: 512,
            max_seg_size: None,
            payload_len: payload.len(),
        };
        let mut buffer = vec![0u8; repr.buffer_len()];
        let mut packet = Packet::new_unchecked(&mut buffer[..]);
        repr.emit(&mut packet, &src, &dst, payload);

        let packet = Packet::new_checked(&buffer[..]).unwrap();
        assert_eq!(packet.payload(), payload);
        let sum = checksum::pseudo_header_v4(&src, &dst, super::super::IpProtocol::Tcp, buffer.len() as u32);
        assert_eq!(checksum::combine(&[sum, checksum::data(&buffer)]), 0);
    }

    #[test]
    fn seq_number_ordering_survives_wraparound() {
        let near_wrap = SeqNumber(i32::MAX);
        let wrapped = near_wrap + 10usize;
        assert!(wrapped > near_wrap);
    }
}
