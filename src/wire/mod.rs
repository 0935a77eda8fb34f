/*! Low-level packet access and construction.

The `wire` module deals with packet *representation*. It provides two levels
of functionality:

 * First, functions to extract fields from sequences of octets, and to
   insert fields into sequences of octets. This is the `Packet` family of
   structures, e.g. [`EthernetFrame`] or [`Ipv4Packet`].
 * Second, a compact, high-level representation of packet data that can be
   parsed from and emitted into a sequence of octets: the `Repr` family of
   structs and enums, e.g. [`ArpRepr`] or [`Ipv4Repr`].

The `Packet` family guarantees that, once `Packet::new_checked` has
succeeded, no accessor or setter will panic. `Repr::parse` never panics as
long as `Packet::new_checked` succeeded; `Repr::emit` never panics as long
as the underlying buffer is exactly `Repr::buffer_len()` octets long.

Unlike a general-purpose stack, this crate speaks exactly one medium
(Ethernet) and one network layer (IPv4), so there is no `HardwareAddress` or
`IpAddress` sum type here — every address is concretely `EthernetAddress` or
`Ipv4Address`.
*/

use core::fmt;

mod field {
    pub type Field = ::core::ops::Range<usize>;
    pub type Rest = ::core::ops::RangeFrom<usize>;
}

mod ethernet;
pub use self::ethernet::{
    Address as EthernetAddress, EtherType as EthernetProtocol, Frame as EthernetFrame,
    Repr as EthernetRepr, HEADER_LEN as ETHERNET_HEADER_LEN,
};

mod arp;
pub use self::arp::{
    Hardware as ArpHardware, Operation as ArpOperation, Packet as ArpPacket, Repr as ArpRepr,
};

pub(crate) mod ip;
pub use self::ip::{checksum, Protocol as IpProtocol};

pub(crate) mod ipv4;
pub(crate) use self::ipv4::AddressExt as Ipv4AddressExt;
pub use self::ipv4::{
    Address as Ipv4Address, Packet as Ipv4Packet, Repr as Ipv4Repr, HEADER_LEN as IPV4_HEADER_LEN,
};

mod icmpv4;
pub use self::icmpv4::{
    Packet as Icmpv4Packet, Repr as Icmpv4Repr, HEADER_LEN as ICMPV4_HEADER_LEN,
};

pub(crate) mod tcp;
pub use self::tcp::{
    Control as TcpControl, Packet as TcpPacket, Repr as TcpRepr, SeqNumber as TcpSeqNumber,
    HEADER_LEN as TCP_HEADER_LEN, MAX_OPTION_LEN as TCP_MAX_OPTION_LEN,
};

/// Parsing a packet failed: either it is malformed, truncated, or not
/// supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wire::Error")
    }
}

pub type Result<T> = core::result::Result<T, Error>;
