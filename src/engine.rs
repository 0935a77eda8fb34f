//! The TCP engine: connection state, frame dispatch, retransmission.
//!
//! This is where everything else in the crate gets used. `Engine` owns a
//! single TCP connection end-to-end — the state machine, the two transmit
//! buffers, the one-segment receive buffer, and the retry/FIN timers — and
//! drives all of it from one entry point, [`Engine::poll`]. There is
//! deliberately no connection table: the reference design is a single
//! socket, so `Engine` *is* the socket.

use heapless::Vec as HVec;
use log::{debug, trace, warn};

use crate::clock::Clock;
use crate::phy::{Nic, RxEvent};
use crate::time::Ticks;
use crate::wire::tcp::{FLAG_ACK, FLAG_FIN, FLAG_RST, FLAG_SYN};
use crate::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, Icmpv4Packet, Icmpv4Repr, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr,
    TcpControl, TcpPacket, TcpRepr, TcpSeqNumber, ETHERNET_HEADER_LEN, ICMPV4_HEADER_LEN,
    IPV4_HEADER_LEN, TCP_HEADER_LEN, TCP_MAX_OPTION_LEN,
};
use crate::Config;

/// RFC 793 connection state, restricted to the subset this engine speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Closed,
    Listening,
    SynSent,
    SynRecd,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    LastAck,
    TimeWait,
    CloseWait,
}

/// Which builder produced the frame currently occupying a retry slot, so a
/// timeout can rebuild the exact same frame from current state rather than
/// replay raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastFrameSent {
    ArpRequest,
    TcpSyn,
    TcpSynAck,
    TcpFin,
    TcpData,
}

/// Internal bookkeeping flags. Not part of the user-visible socket status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u8);

impl Flags {
    pub const ACTIVE_OPEN: Flags = Flags(0x01);
    pub const IP_ADDR_RESOLVED: Flags = Flags(0x02);
    pub const TIMER_RUNNING: Flags = Flags(0x04);
    pub const TIMER_IS_RETRY: Flags = Flags(0x08);
    pub const CLOSE_REQUESTED: Flags = Flags(0x10);

    pub const fn empty() -> Flags {
        Flags(0)
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }
}

impl core::ops::BitOr for Flags {
    type Output = Flags;
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// User-visible connection status, polled after every [`Engine::poll`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SocketStatus(u16);

impl SocketStatus {
    pub const ACTIVE: SocketStatus = SocketStatus(0x0001);
    pub const CONNECTED: SocketStatus = SocketStatus(0x0002);
    pub const DATA_AVAILABLE: SocketStatus = SocketStatus(0x0004);
    pub const TX_BUF_RELEASED: SocketStatus = SocketStatus(0x0008);
    pub const ERR_ETHERNET: SocketStatus = SocketStatus(0x0010);
    pub const ERR_CONN_RESET: SocketStatus = SocketStatus(0x0020);
    pub const ERR_REMOTE: SocketStatus = SocketStatus(0x0040);
    pub const ERR_ARP_TIMEOUT: SocketStatus = SocketStatus(0x0080);
    pub const ERR_TCP_TIMEOUT: SocketStatus = SocketStatus(0x0100);

    pub const fn empty() -> SocketStatus {
        SocketStatus(0)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: SocketStatus) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn insert(&mut self, other: SocketStatus) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: SocketStatus) {
        self.0 &= !other.0;
    }
}

impl core::ops::BitOr for SocketStatus {
    type Output = SocketStatus;
    fn bitor(self, rhs: SocketStatus) -> SocketStatus {
        SocketStatus(self.0 | rhs.0)
    }
}

impl core::ops::BitAnd for SocketStatus {
    type Output = SocketStatus;
    fn bitand(self, rhs: SocketStatus) -> SocketStatus {
        SocketStatus(self.0 & rhs.0)
    }
}

/// The TCP engine: one connection, two NIC-backed transmit buffers, one
/// receive buffer.
///
/// `RX_CAP`, `TX1_CAP`, `TX2_CAP` must agree with the buffer-size fields
/// carried in `Config`; [`Engine::new`] checks this with `debug_assert!`
/// since the relationship can't be expressed as a const-generic bound on
/// stable Rust.
pub struct Engine<Ni: Nic, Cl: Clock, const RX_CAP: usize, const TX1_CAP: usize, const TX2_CAP: usize>
{
    nic: Ni,
    clock: Cl,
    config: Config,

    state: State,
    flags: Flags,
    socket_status: SocketStatus,
    last_frame_sent: LastFrameSent,

    snd_nxt: TcpSeqNumber,
    snd_una: TcpSeqNumber,
    rcv_nxt: TcpSeqNumber,

    remote_mac: EthernetAddress,
    remote_ip: Ipv4Address,
    remote_port: u16,

    retry_counter: u8,
    timer_ticks: Ticks,

    isn_high: u16,

    tx1: HVec<u8, TX1_CAP>,
    tx2: HVec<u8, TX2_CAP>,
    tx1_pending: bool,
    tx2_pending: bool,
    tx_payload: HVec<u8, TX1_CAP>,
    tcp_tx_data_count: usize,

    rx_tcp: HVec<u8, RX_CAP>,
    tcp_rx_data_count: usize,
}

impl<Ni: Nic, Cl: Clock, const RX_CAP: usize, const TX1_CAP: usize, const TX2_CAP: usize>
    Engine<Ni, Cl, RX_CAP, TX1_CAP, TX2_CAP>
{
    pub fn new(nic: Ni, clock: Cl, config: Config) -> Self {
        debug_assert_eq!(
            RX_CAP, config.max_tcp_rx_data_size,
            "RX_CAP must match Config::max_tcp_rx_data_size"
        );
        debug_assert_eq!(
            TX1_CAP,
            ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + TCP_HEADER_LEN + config.max_tcp_tx_data_size,
            "TX1_CAP must fit exactly one TCP data frame"
        );
        debug_assert!(
            TX2_CAP >= ETHERNET_HEADER_LEN + config.max_eth_tx_data_size,
            "TX2_CAP must fit the largest ICMP echo reply"
        );
        debug_assert!(
            TX2_CAP >= ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + TCP_HEADER_LEN + TCP_MAX_OPTION_LEN,
            "TX2_CAP must fit a TCP control frame with the MSS option"
        );

        let mut tx_payload = HVec::new();
        tx_payload
            .resize(config.max_tcp_tx_data_size, 0)
            .expect("tx_payload sized from Config, capacity checked above");

        Engine {
            nic,
            clock,
            config,
            state: State::Closed,
            flags: Flags::empty(),
            socket_status: SocketStatus::empty(),
            last_frame_sent: LastFrameSent::ArpRequest,
            snd_nxt: TcpSeqNumber(0),
            snd_una: TcpSeqNumber(0),
            rcv_nxt: TcpSeqNumber(0),
            remote_mac: EthernetAddress::default(),
            remote_ip: Ipv4Address::UNSPECIFIED,
            remote_port: 0,
            retry_counter: 0,
            timer_ticks: Ticks::ZERO,
            isn_high: 0,
            tx1: HVec::new(),
            tx2: HVec::new(),
            tx1_pending: false,
            tx2_pending: false,
            tx_payload,
            tcp_tx_data_count: 0,
            rx_tcp: HVec::new(),
            tcp_rx_data_count: 0,
        }
    }

    // ---- Socket API -----------------------------------------------------

    pub fn low_level_init(&mut self) {
        self.state = State::Closed;
        self.flags = Flags::empty();
        self.socket_status = SocketStatus::empty();
        self.last_frame_sent = LastFrameSent::ArpRequest;
        self.snd_nxt = TcpSeqNumber(0);
        self.snd_una = TcpSeqNumber(0);
        self.rcv_nxt = TcpSeqNumber(0);
        self.retry_counter = 0;
        self.timer_ticks = Ticks::ZERO;
        self.tx1_pending = false;
        self.tx2_pending = false;
        self.tcp_tx_data_count = 0;
        self.tcp_rx_data_count = 0;
        debug!("low_level_init: state -> CLOSED");
    }

    pub fn passive_open(&mut self) {
        if self.state != State::Closed {
            return;
        }
        self.flags.remove(Flags::ACTIVE_OPEN);
        self.state = State::Listening;
        self.socket_status = SocketStatus::ACTIVE;
        debug!("passive_open: CLOSED -> LISTENING");
    }

    /// The caller must have already set `remote_ip`/`remote_port` via
    /// [`Engine::set_remote`].
    pub fn active_open(&mut self) {
        if !matches!(self.state, State::Closed | State::Listening) {
            return;
        }
        self.flags.insert(Flags::ACTIVE_OPEN);
        self.flags.remove(Flags::IP_ADDR_RESOLVED);
        self.socket_status = SocketStatus::ACTIVE;
        self.build_arp_request();
        self.last_frame_sent = LastFrameSent::ArpRequest;
        self.start_retry_timer();
        debug!("active_open: ARP request queued for {}", self.remote_ip);
    }

    /// Pin the peer this connection will attempt to reach. Must be called
    /// before [`Engine::active_open`].
    pub fn set_remote(&mut self, remote_ip: Ipv4Address, remote_port: u16) {
        self.remote_ip = remote_ip;
        self.remote_port = remote_port;
    }

    pub fn close(&mut self) {
        match self.state {
            State::Listening | State::SynSent => {
                self.state = State::Closed;
                self.flags = Flags::empty();
                self.socket_status = SocketStatus::empty();
                debug!("close: {:?} -> CLOSED (silent)", self.state);
            }
            State::SynRecd | State::Established => {
                self.flags.insert(Flags::CLOSE_REQUESTED);
                debug!("close: CLOSE_REQUESTED set");
            }
            _ => {}
        }
    }

    pub fn release_rx_buffer(&mut self) {
        self.socket_status.remove(SocketStatus::DATA_AVAILABLE);
    }

    /// The scratch region the application fills before calling
    /// [`Engine::transmit_tx_buffer`], available only while
    /// `TX_BUF_RELEASED` is set.
    pub fn tx_payload_mut(&mut self) -> Option<&mut [u8]> {
        if self.socket_status.contains(SocketStatus::TX_BUF_RELEASED) {
            Some(&mut self.tx_payload[..])
        } else {
            None
        }
    }

    pub fn transmit_tx_buffer(&mut self, len: usize) {
        if !matches!(self.state, State::Established | State::CloseWait) {
            return;
        }
        if !self.socket_status.contains(SocketStatus::TX_BUF_RELEASED) {
            return;
        }
        self.socket_status.remove(SocketStatus::TX_BUF_RELEASED);
        self.tcp_tx_data_count = len;
        self.snd_una = self.snd_una + len;
        self.tx1_pending = true;
        self.last_frame_sent = LastFrameSent::TcpData;
        self.start_retry_timer();
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn socket_status(&self) -> SocketStatus {
        self.socket_status
    }

    /// The most recently received, not-yet-released segment payload.
    pub fn rx_data(&self) -> &[u8] {
        &self.rx_tcp[..self.tcp_rx_data_count]
    }

    /// Drives one iteration: RX dispatch, timer evaluation, state-driven
    /// emission, TX flush (`tx2` before `tx1`). Must be called far more
    /// often than the tick period.
    pub fn poll(&mut self) {
        let elapsed = self.clock.take_elapsed_ticks();
        self.timer_ticks += Ticks::new(elapsed);
        self.isn_high = self.isn_high.wrapping_add(elapsed);

        let event = self.nic.rx_event();
        if event.contains(RxEvent::RX_OK) {
            if event.contains(RxEvent::RX_IA) {
                self.process_ia_frame();
            }
            if event.contains(RxEvent::RX_BROADCAST) {
                self.process_broadcast_frame();
            }
        }

        self.evaluate_timer();
        self.emit_state_driven_frame();
        self.flush_tx();
    }

    // ---- RX dispatch ------------------------------------------------------

    fn process_ia_frame(&mut self) {
        self.nic.dummy_read_frame(6); // destination MAC, already known to be ours
        let mut src_mac = [0u8; 6];
        self.nic.copy_from_frame(&mut src_mac);
        let recd_mac = EthernetAddress(src_mac);

        match self.nic.read_frame_word_be() {
            0x0806 => self.process_arp_reply(),
            0x0800 => self.process_ip_frame(recd_mac),
            other => trace!("process_ia_frame: dropping unknown ethertype 0x{other:04x}"),
        }
    }

    fn process_broadcast_frame(&mut self) {
        self.nic.dummy_read_frame(6); // destination MAC, already known broadcast
        self.nic.dummy_read_frame(6); // Ethernet source MAC, the ARP payload carries it again

        if self.nic.read_frame_word_be() != 0x0806 {
            return; // only ARP requests are answered on the broadcast path
        }
        let hardware_type = self.nic.read_frame_word_be();
        let protocol_type = self.nic.read_frame_word_be();
        let hlen_plen = self.nic.read_frame_word_be();
        let operation = self.nic.read_frame_word_be();
        if hardware_type != 1 || protocol_type != 0x0800 || hlen_plen != 0x0604 || operation != 1 {
            return;
        }

        let mut sender_mac = [0u8; 6];
        self.nic.copy_from_frame(&mut sender_mac);
        let mut sender_ip = [0u8; 4];
        self.nic.copy_from_frame(&mut sender_ip);
        self.nic.dummy_read_frame(6); // target hardware address, unknown/zero in a request
        let mut target_ip = [0u8; 4];
        self.nic.copy_from_frame(&mut target_ip);

        if Ipv4Address::from(target_ip) != self.config.local_ip {
            return;
        }
        trace!("process_broadcast_frame: answering ARP request from {}", Ipv4Address::from(sender_ip));
        self.build_arp_answer(EthernetAddress(sender_mac), Ipv4Address::from(sender_ip));
    }

    fn process_arp_reply(&mut self) {
        if !(self.flags.contains(Flags::ACTIVE_OPEN) && !self.flags.contains(Flags::IP_ADDR_RESOLVED)) {
            return;
        }
        let hardware_type = self.nic.read_frame_word_be();
        let protocol_type = self.nic.read_frame_word_be();
        let hlen_plen = self.nic.read_frame_word_be();
        let operation = self.nic.read_frame_word_be();
        if hardware_type != 1 || protocol_type != 0x0800 || hlen_plen != 0x0604 || operation != 2 {
            return;
        }
        let mut mac = [0u8; 6];
        self.nic.copy_from_frame(&mut mac);
        self.remote_mac = EthernetAddress(mac);
        self.flags.insert(Flags::IP_ADDR_RESOLVED);
        self.stop_timer();
        debug!("process_arp_reply: resolved {} -> {}", self.remote_ip, self.remote_mac);
    }

    fn process_ip_frame(&mut self, recd_mac: EthernetAddress) {
        let ver_ihl_tos = self.nic.read_frame_word_be();
        if (ver_ihl_tos >> 8) != 0x45 {
            trace!("process_ip_frame: dropping non-IPv4/no-options header");
            return;
        }
        let total_len = self.nic.read_frame_word_be();
        let _ident = self.nic.read_frame_word_be();
        let flags_frag = self.nic.read_frame_word_be();
        if flags_frag & 0x3fff != 0 {
            trace!("process_ip_frame: dropping fragmented datagram");
            return;
        }
        let ttl_proto = self.nic.read_frame_word_be();
        let protocol = (ttl_proto & 0xff) as u8;
        let _checksum = self.nic.read_frame_word_be();
        let mut src_ip = [0u8; 4];
        self.nic.copy_from_frame(&mut src_ip);
        let mut dst_ip = [0u8; 4];
        self.nic.copy_from_frame(&mut dst_ip);

        let recd_ip = Ipv4Address::from(src_ip);
        if Ipv4Address::from(dst_ip) != self.config.local_ip {
            return;
        }
        let ip_payload_len = (total_len as usize).saturating_sub(IPV4_HEADER_LEN);
        match protocol {
            0x01 => self.process_icmp_frame(recd_mac, recd_ip, ip_payload_len),
            0x06 => self.process_tcp_frame(recd_mac, recd_ip, ip_payload_len),
            other => trace!("process_ip_frame: dropping unsupported protocol {other}"),
        }
    }

    fn process_icmp_frame(&mut self, recd_mac: EthernetAddress, recd_ip: Ipv4Address, ip_payload_len: usize) {
        let type_code = self.nic.read_frame_word_be();
        let _checksum = self.nic.read_frame_word_be();
        if (type_code >> 8) as u8 != 8 {
            return; // only echo request is answered
        }
        let ident = self.nic.read_frame_word_be();
        let seq_no = self.nic.read_frame_word_be();

        let remaining = ip_payload_len.saturating_sub(ICMPV4_HEADER_LEN);
        let max_icmp_payload = self
            .config
            .max_eth_tx_data_size
            .saturating_sub(IPV4_HEADER_LEN + ICMPV4_HEADER_LEN);
        let data_len = remaining.min(max_icmp_payload);

        let mut payload: HVec<u8, TX2_CAP> = HVec::new();
        payload
            .resize(data_len, 0)
            .expect("data_len bounded by TX2_CAP via max_eth_tx_data_size invariant");
        self.nic.copy_from_frame(&mut payload[..]);

        self.build_icmp_echo_reply(recd_mac, recd_ip, ident, seq_no, &payload);
    }

    fn process_tcp_frame(&mut self, recd_mac: EthernetAddress, recd_ip: Ipv4Address, ip_payload_len: usize) {
        let src_port = self.nic.read_frame_word_be();
        let dst_port = self.nic.read_frame_word_be();
        if dst_port != self.config.local_port {
            return;
        }
        let seq = ((self.nic.read_frame_word_be() as u32) << 16) | self.nic.read_frame_word_be() as u32;
        let ack = ((self.nic.read_frame_word_be() as u32) << 16) | self.nic.read_frame_word_be() as u32;
        let tcp_code = self.nic.read_frame_word_be();
        let tcp_header_len = ((tcp_code & 0xf000) >> 10) as usize;
        let data_len = ip_payload_len.saturating_sub(tcp_header_len);
        if data_len > self.config.max_tcp_rx_data_size {
            trace!("process_tcp_frame: dropping oversized segment ({data_len} bytes)");
            return;
        }
        if tcp_header_len > TCP_HEADER_LEN {
            self.nic.dummy_read_frame(tcp_header_len - TCP_HEADER_LEN);
        }

        let seq_num = TcpSeqNumber::from(seq);
        let ack_num = TcpSeqNumber::from(ack);
        let rst = tcp_code & FLAG_RST != 0;
        let syn = tcp_code & FLAG_SYN != 0;
        let fin = tcp_code & FLAG_FIN != 0;
        let has_ack = tcp_code & FLAG_ACK != 0;

        match self.state {
            State::Closed => {
                if rst {
                    return;
                }
                self.remote_mac = recd_mac;
                self.remote_ip = recd_ip;
                self.remote_port = src_port;
                if has_ack {
                    self.build_tcp_control(ack_num, None, TcpControl::Rst, None);
                } else {
                    let mut reset_ack = seq_num + data_len;
                    if syn || fin {
                        reset_ack = reset_ack + 1;
                    }
                    self.build_tcp_control(TcpSeqNumber(0), Some(reset_ack), TcpControl::Rst, None);
                }
            }
            State::Listening => {
                if rst {
                    return;
                }
                self.remote_mac = recd_mac;
                self.remote_ip = recd_ip;
                self.remote_port = src_port;
                if has_ack {
                    self.build_tcp_control(ack_num, None, TcpControl::Rst, None);
                } else if syn {
                    self.rcv_nxt = seq_num + 1;
                    let isn = self.select_isn();
                    self.snd_nxt = isn;
                    self.snd_una = isn + 1;
                    self.build_tcp_control(
                        self.snd_nxt,
                        Some(self.rcv_nxt),
                        TcpControl::Syn,
                        Some(self.config.max_tcp_rx_data_size as u16),
                    );
                    self.last_frame_sent = LastFrameSent::TcpSynAck;
                    self.start_retry_timer();
                    self.state = State::SynRecd;
                    debug!("process_tcp_frame: LISTENING -> SYN_RECD");
                }
            }
            State::SynSent => {
                if recd_ip != self.remote_ip || src_port != self.remote_port {
                    return;
                }
                if has_ack && ack_num != self.snd_una {
                    if !rst {
                        self.build_tcp_control(ack_num, None, TcpControl::Rst, None);
                    }
                    return;
                }
                if rst {
                    if has_ack {
                        self.force_closed(SocketStatus::ERR_CONN_RESET);
                        warn!("process_tcp_frame: RST in SYN_SENT, ERR_CONN_RESET");
                    }
                    return;
                }
                if syn {
                    self.rcv_nxt = seq_num + 1;
                    if has_ack {
                        self.stop_timer();
                        self.snd_nxt = self.snd_una;
                        self.build_tcp_control(self.snd_nxt, Some(self.rcv_nxt), TcpControl::None, None);
                        self.state = State::Established;
                        self.socket_status
                            .insert(SocketStatus::CONNECTED | SocketStatus::TX_BUF_RELEASED);
                        debug!("process_tcp_frame: SYN_SENT -> ESTABLISHED");
                    } else {
                        self.stop_timer();
                        self.build_tcp_control(
                            self.snd_nxt,
                            Some(self.rcv_nxt),
                            TcpControl::Syn,
                            Some(self.config.max_tcp_rx_data_size as u16),
                        );
                        self.last_frame_sent = LastFrameSent::TcpSynAck;
                        self.start_retry_timer();
                        self.state = State::SynRecd;
                        debug!("process_tcp_frame: simultaneous open, SYN_SENT -> SYN_RECD");
                    }
                }
            }
            _ => self.process_tcp_frame_established(recd_ip, src_port, seq_num, ack_num, data_len, rst, syn, fin, has_ack),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_tcp_frame_established(
        &mut self,
        recd_ip: Ipv4Address,
        src_port: u16,
        seq_num: TcpSeqNumber,
        ack_num: TcpSeqNumber,
        data_len: usize,
        rst: bool,
        syn: bool,
        fin: bool,
        has_ack: bool,
    ) {
        if recd_ip != self.remote_ip || src_port != self.remote_port {
            return;
        }
        if seq_num < self.rcv_nxt || seq_num >= self.rcv_nxt + self.config.max_tcp_rx_data_size {
            trace!("process_tcp_frame: dropping out-of-window segment");
            return;
        }
        if rst {
            self.force_closed(SocketStatus::ERR_CONN_RESET);
            warn!("process_tcp_frame: RST in {:?}, ERR_CONN_RESET", self.state);
            return;
        }
        if syn {
            self.build_tcp_control(ack_num, None, TcpControl::Rst, None);
            self.force_closed(SocketStatus::ERR_REMOTE);
            warn!("process_tcp_frame: unexpected SYN in {:?}, ERR_REMOTE", self.state);
            return;
        }
        if seq_num != self.rcv_nxt {
            self.build_tcp_control(self.snd_una, Some(self.rcv_nxt), TcpControl::None, None);
            return;
        }
        if !has_ack {
            return;
        }

        if ack_num == self.snd_una {
            self.stop_timer();
            self.snd_nxt = self.snd_una;
            match self.state {
                State::SynRecd => {
                    self.state = State::Established;
                    self.socket_status
                        .insert(SocketStatus::CONNECTED | SocketStatus::TX_BUF_RELEASED);
                    debug!("process_tcp_frame: SYN_RECD -> ESTABLISHED");
                }
                State::Established => {
                    self.socket_status.insert(SocketStatus::TX_BUF_RELEASED);
                }
                State::FinWait1 => {
                    self.state = State::FinWait2;
                    self.start_fin_timer();
                    debug!("process_tcp_frame: FIN_WAIT_1 -> FIN_WAIT_2");
                }
                State::Closing => {
                    self.state = State::TimeWait;
                    self.start_fin_timer();
                    debug!("process_tcp_frame: CLOSING -> TIME_WAIT");
                }
                State::LastAck => {
                    let preserved = self.socket_status & SocketStatus::DATA_AVAILABLE;
                    self.state = State::Closed;
                    self.flags = Flags::empty();
                    self.socket_status = preserved;
                    debug!("process_tcp_frame: LAST_ACK -> CLOSED");
                }
                State::TimeWait => {
                    self.build_tcp_control(self.snd_una, Some(self.rcv_nxt), TcpControl::None, None);
                    self.restart_timer();
                }
                _ => {}
            }
        }

        if matches!(self.state, State::Established | State::FinWait1 | State::FinWait2) && data_len > 0 {
            if self.socket_status.contains(SocketStatus::DATA_AVAILABLE) {
                trace!("process_tcp_frame: backpressure, dropping in-window payload");
                return;
            }
            self.rx_tcp.clear();
            self.rx_tcp
                .resize(data_len, 0)
                .expect("data_len bounded by MAX_TCP_RX_DATA_SIZE check above");
            self.nic.copy_from_frame(&mut self.rx_tcp[..]);
            self.tcp_rx_data_count = data_len;
            self.rcv_nxt = self.rcv_nxt + data_len;
            self.socket_status.insert(SocketStatus::DATA_AVAILABLE);
            self.build_tcp_control(self.snd_una, Some(self.rcv_nxt), TcpControl::None, None);
        }

        if fin {
            self.rcv_nxt = self.rcv_nxt + 1;
            match self.state {
                State::SynRecd | State::Established => {
                    self.state = State::CloseWait;
                    debug!("process_tcp_frame: -> CLOSE_WAIT");
                }
                State::FinWait1 => {
                    self.state = State::Closing;
                    self.socket_status.remove(SocketStatus::CONNECTED);
                    debug!("process_tcp_frame: FIN_WAIT_1 -> CLOSING");
                }
                State::FinWait2 => {
                    self.state = State::TimeWait;
                    self.socket_status.remove(SocketStatus::CONNECTED);
                    self.start_fin_timer();
                    debug!("process_tcp_frame: FIN_WAIT_2 -> TIME_WAIT");
                }
                State::TimeWait => self.restart_timer(),
                _ => {}
            }
            self.build_tcp_control(self.snd_una, Some(self.rcv_nxt), TcpControl::None, None);
        }
    }

    fn select_isn(&mut self) -> TcpSeqNumber {
        let isn = ((self.isn_high as u32) << 16) | self.clock.isn_low() as u32;
        TcpSeqNumber::from(isn)
    }

    // ---- Frame builders -----------------------------------------------

    fn build_arp_request(&mut self) {
        let target_ip = if self.config.needs_gateway(self.remote_ip) {
            self.config.gateway_ip
        } else {
            self.remote_ip
        };
        let eth_repr = EthernetRepr {
            src_addr: self.config.local_mac,
            dst_addr: EthernetAddress::BROADCAST,
            ethertype: EthernetProtocol::Arp,
        };
        let arp_repr = ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Request,
            source_hardware_addr: self.config.local_mac,
            source_protocol_addr: self.config.local_ip,
            target_hardware_addr: EthernetAddress::default(),
            target_protocol_addr: target_ip,
        };
        let total = ETHERNET_HEADER_LEN + arp_repr.buffer_len();
        self.tx2.clear();
        self.tx2.resize(total, 0).expect("ARP frame fits TX2_CAP");
        {
            let mut frame = EthernetFrame::new_unchecked(&mut self.tx2[..]);
            eth_repr.emit(&mut frame);
        }
        {
            let mut packet = ArpPacket::new_unchecked(&mut self.tx2[ETHERNET_HEADER_LEN..]);
            arp_repr.emit(&mut packet);
        }
        self.tx2_pending = true;
    }

    fn build_arp_answer(&mut self, peer_mac: EthernetAddress, peer_ip: Ipv4Address) {
        let eth_repr = EthernetRepr {
            src_addr: self.config.local_mac,
            dst_addr: peer_mac,
            ethertype: EthernetProtocol::Arp,
        };
        let arp_repr = ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Reply,
            source_hardware_addr: self.config.local_mac,
            source_protocol_addr: self.config.local_ip,
            target_hardware_addr: peer_mac,
            target_protocol_addr: peer_ip,
        };
        let total = ETHERNET_HEADER_LEN + arp_repr.buffer_len();
        self.tx2.clear();
        self.tx2.resize(total, 0).expect("ARP frame fits TX2_CAP");
        {
            let mut frame = EthernetFrame::new_unchecked(&mut self.tx2[..]);
            eth_repr.emit(&mut frame);
        }
        {
            let mut packet = ArpPacket::new_unchecked(&mut self.tx2[ETHERNET_HEADER_LEN..]);
            arp_repr.emit(&mut packet);
        }
        self.tx2_pending = true;
    }

    fn build_icmp_echo_reply(
        &mut self,
        recd_mac: EthernetAddress,
        recd_ip: Ipv4Address,
        ident: u16,
        seq_no: u16,
        payload: &[u8],
    ) {
        let icmp_repr = Icmpv4Repr::EchoReply { ident, seq_no, data: payload };
        let ip_repr = Ipv4Repr {
            src_addr: self.config.local_ip,
            dst_addr: recd_ip,
            protocol: IpProtocol::Icmp,
            payload_len: icmp_repr.buffer_len(),
            ttl: self.config.default_ttl,
        };
        let eth_repr = EthernetRepr {
            src_addr: self.config.local_mac,
            dst_addr: recd_mac,
            ethertype: EthernetProtocol::Ipv4,
        };
        let total = ETHERNET_HEADER_LEN + ip_repr.buffer_len();
        self.tx2.clear();
        self.tx2.resize(total, 0).expect("ICMP reply fits TX2_CAP, checked in new()");
        {
            let mut frame = EthernetFrame::new_unchecked(&mut self.tx2[..]);
            eth_repr.emit(&mut frame);
        }
        {
            let mut ip_packet = Ipv4Packet::new_unchecked(&mut self.tx2[ETHERNET_HEADER_LEN..]);
            ip_repr.emit(&mut ip_packet);
        }
        {
            let icmp_start = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN;
            let mut icmp_packet = Icmpv4Packet::new_unchecked(&mut self.tx2[icmp_start..]);
            icmp_repr.emit(&mut icmp_packet);
        }
        self.tx2_pending = true;
    }

    fn build_tcp_control(
        &mut self,
        seq: TcpSeqNumber,
        ack: Option<TcpSeqNumber>,
        control: TcpControl,
        mss: Option<u16>,
    ) {
        let tcp_repr = TcpRepr {
            src_port: self.config.local_port,
            dst_port: self.remote_port,
            control,
            seq_number: seq,
            ack_number: ack,
            window_len: self.config.max_tcp_rx_data_size as u16,
            max_seg_size: mss,
            payload_len: 0,
        };
        let ip_repr = Ipv4Repr {
            src_addr: self.config.local_ip,
            dst_addr: self.remote_ip,
            protocol: IpProtocol::Tcp,
            payload_len: tcp_repr.buffer_len(),
            ttl: self.config.default_ttl,
        };
        let eth_repr = EthernetRepr {
            src_addr: self.config.local_mac,
            dst_addr: self.remote_mac,
            ethertype: EthernetProtocol::Ipv4,
        };
        let total = ETHERNET_HEADER_LEN + ip_repr.buffer_len();
        self.tx2.clear();
        self.tx2.resize(total, 0).expect("TCP control frame fits TX2_CAP, checked in new()");
        {
            let mut frame = EthernetFrame::new_unchecked(&mut self.tx2[..]);
            eth_repr.emit(&mut frame);
        }
        {
            let mut ip_packet = Ipv4Packet::new_unchecked(&mut self.tx2[ETHERNET_HEADER_LEN..]);
            ip_repr.emit(&mut ip_packet);
        }
        {
            let tcp_start = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN;
            let mut tcp_packet = TcpPacket::new_unchecked(&mut self.tx2[tcp_start..]);
            tcp_repr.emit(&mut tcp_packet, &self.config.local_ip, &self.remote_ip, &[]);
        }
        self.tx2_pending = true;
    }

    /// Rebuilt fresh on every send attempt (initial send and every retry)
    /// so sequence number and checksum always reflect current state.
    fn build_tcp_data_frame(&mut self) {
        let data_len = self.tcp_tx_data_count;
        let tcp_repr = TcpRepr {
            src_port: self.config.local_port,
            dst_port: self.remote_port,
            control: TcpControl::None,
            seq_number: self.snd_nxt,
            ack_number: Some(self.rcv_nxt),
            window_len: self.config.max_tcp_rx_data_size as u16,
            max_seg_size: None,
            payload_len: data_len,
        };
        let ip_repr = Ipv4Repr {
            src_addr: self.config.local_ip,
            dst_addr: self.remote_ip,
            protocol: IpProtocol::Tcp,
            payload_len: tcp_repr.buffer_len(),
            ttl: self.config.default_ttl,
        };
        let eth_repr = EthernetRepr {
            src_addr: self.config.local_mac,
            dst_addr: self.remote_mac,
            ethertype: EthernetProtocol::Ipv4,
        };
        let total = ETHERNET_HEADER_LEN + ip_repr.buffer_len();
        self.tx1.clear();
        self.tx1.resize(total, 0).expect("TX1_CAP sized exactly for one data frame, checked in new()");
        {
            let mut frame = EthernetFrame::new_unchecked(&mut self.tx1[..]);
            eth_repr.emit(&mut frame);
        }
        {
            let mut ip_packet = Ipv4Packet::new_unchecked(&mut self.tx1[ETHERNET_HEADER_LEN..]);
            ip_repr.emit(&mut ip_packet);
        }
        {
            let tcp_start = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN;
            let mut tcp_packet = TcpPacket::new_unchecked(&mut self.tx1[tcp_start..]);
            tcp_repr.emit(
                &mut tcp_packet,
                &self.config.local_ip,
                &self.remote_ip,
                &self.tx_payload[..data_len],
            );
        }
    }

    // ---- Timers ---------------------------------------------------------

    fn start_retry_timer(&mut self) {
        self.timer_ticks = Ticks::ZERO;
        self.retry_counter = self.config.max_retrys;
        self.flags.insert(Flags::TIMER_RUNNING | Flags::TIMER_IS_RETRY);
    }

    fn start_fin_timer(&mut self) {
        self.timer_ticks = Ticks::ZERO;
        self.flags.insert(Flags::TIMER_RUNNING);
        self.flags.remove(Flags::TIMER_IS_RETRY);
    }

    fn restart_timer(&mut self) {
        self.timer_ticks = Ticks::ZERO;
    }

    fn stop_timer(&mut self) {
        self.flags.remove(Flags::TIMER_RUNNING);
    }

    fn force_closed(&mut self, err: SocketStatus) {
        self.state = State::Closed;
        self.flags = Flags::empty();
        self.socket_status = err;
    }

    fn evaluate_timer(&mut self) {
        if !self.flags.contains(Flags::TIMER_RUNNING) {
            return;
        }
        if self.flags.contains(Flags::TIMER_IS_RETRY) {
            if !self.timer_ticks.exceeds(Ticks::new(self.config.retry_timeout)) {
                return;
            }
            if self.retry_counter > 0 {
                self.retry_counter -= 1;
                self.timer_ticks = Ticks::ZERO;
                trace!("evaluate_timer: retransmitting {:?}, {} retries left", self.last_frame_sent, self.retry_counter);
                self.handle_retransmission();
            } else {
                self.handle_timeout();
            }
        } else if self.timer_ticks.exceeds(Ticks::new(self.config.fin_timeout)) {
            let preserved = self.socket_status & SocketStatus::DATA_AVAILABLE;
            self.state = State::Closed;
            self.flags = Flags::empty();
            self.socket_status = preserved;
            debug!("evaluate_timer: FIN/TIME_WAIT timer expired -> CLOSED");
        }
    }

    fn handle_retransmission(&mut self) {
        match self.last_frame_sent {
            LastFrameSent::ArpRequest => self.build_arp_request(),
            LastFrameSent::TcpSyn => {
                self.build_tcp_control(self.snd_nxt, None, TcpControl::Syn, Some(self.config.max_tcp_rx_data_size as u16));
            }
            LastFrameSent::TcpSynAck => self.build_tcp_control(
                self.snd_nxt,
                Some(self.rcv_nxt),
                TcpControl::Syn,
                Some(self.config.max_tcp_rx_data_size as u16),
            ),
            LastFrameSent::TcpFin => {
                self.build_tcp_control(self.snd_nxt, Some(self.rcv_nxt), TcpControl::Fin, None);
            }
            LastFrameSent::TcpData => self.tx1_pending = true,
        }
    }

    fn handle_timeout(&mut self) {
        let err = if self.flags.contains(Flags::ACTIVE_OPEN) && !self.flags.contains(Flags::IP_ADDR_RESOLVED) {
            SocketStatus::ERR_ARP_TIMEOUT
        } else {
            SocketStatus::ERR_TCP_TIMEOUT
        };
        warn!("handle_timeout: retries exhausted, forcing CLOSED with {err:?}");
        self.force_closed(err);
    }

    // ---- State-driven emission and flush ---------------------------------

    fn emit_state_driven_frame(&mut self) {
        match self.state {
            State::Closed | State::Listening => {
                if self.flags.contains(Flags::ACTIVE_OPEN)
                    && self.flags.contains(Flags::IP_ADDR_RESOLVED)
                    && !self.tx2_pending
                {
                    let isn = self.select_isn();
                    self.snd_nxt = isn;
                    self.snd_una = isn + 1;
                    self.rcv_nxt = TcpSeqNumber(0);
                    self.build_tcp_control(
                        self.snd_nxt,
                        None,
                        TcpControl::Syn,
                        Some(self.config.max_tcp_rx_data_size as u16),
                    );
                    self.last_frame_sent = LastFrameSent::TcpSyn;
                    self.start_retry_timer();
                    self.state = State::SynSent;
                    debug!("emit_state_driven_frame: -> SYN_SENT");
                }
            }
            State::SynRecd | State::Established => {
                if self.flags.contains(Flags::CLOSE_REQUESTED)
                    && !self.tx1_pending
                    && !self.tx2_pending
                    && self.snd_nxt == self.snd_una
                {
                    self.snd_una = self.snd_una + 1;
                    self.build_tcp_control(self.snd_nxt, Some(self.rcv_nxt), TcpControl::Fin, None);
                    self.last_frame_sent = LastFrameSent::TcpFin;
                    self.start_retry_timer();
                    self.state = State::FinWait1;
                    debug!("emit_state_driven_frame: -> FIN_WAIT_1");
                }
            }
            State::CloseWait => {
                if !self.tx1_pending && !self.tx2_pending && self.snd_nxt == self.snd_una {
                    self.snd_una = self.snd_una + 1;
                    self.build_tcp_control(self.snd_nxt, Some(self.rcv_nxt), TcpControl::Fin, None);
                    self.last_frame_sent = LastFrameSent::TcpFin;
                    self.start_retry_timer();
                    self.state = State::LastAck;
                    debug!("emit_state_driven_frame: CLOSE_WAIT -> LAST_ACK");
                }
            }
            _ => {}
        }
    }

    fn flush_tx(&mut self) {
        if self.tx2_pending {
            if self.nic.rdy_for_tx() {
                self.nic.copy_to_frame(&self.tx2);
                self.nic.request_send(self.tx2.len());
            } else {
                self.force_closed(SocketStatus::ERR_ETHERNET);
                warn!("flush_tx: NIC refused tx2, forcing CLOSED");
            }
            self.tx2_pending = false;
        }
        if self.tx1_pending {
            self.build_tcp_data_frame();
            if self.nic.rdy_for_tx() {
                self.nic.copy_to_frame(&self.tx1);
                self.nic.request_send(self.tx1.len());
            } else {
                self.force_closed(SocketStatus::ERR_ETHERNET);
                warn!("flush_tx: NIC refused tx1, forcing CLOSED");
            }
            self.tx1_pending = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::phy::TestNic;
    use crate::wire::{EthernetProtocol as EthProto, Ipv4Address as Addr, Ipv4AddressExt};

    const RX_CAP: usize = 64;
    const TX1_CAP: usize = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + TCP_HEADER_LEN + 64;
    const TX2_CAP: usize = 64;

    type TestEngine = Engine<TestNic, TestClock, RX_CAP, TX1_CAP, TX2_CAP>;

    fn config() -> Config {
        Config::new(
            EthernetAddress([0x02, 0, 0, 0, 0, 1]),
            Addr::new(192, 168, 1, 2),
            Addr::new(255, 255, 255, 0),
            Addr::new(192, 168, 1, 1),
            80,
            RX_CAP,
            64,
            TX2_CAP - ETHERNET_HEADER_LEN,
        )
    }

    fn engine() -> TestEngine {
        Engine::new(TestNic::new(), TestClock::new(), config())
    }

    fn arp_request_frame(sender_mac: EthernetAddress, sender_ip: Addr, target_ip: Addr) -> Vec<u8> {
        let eth_repr = EthernetRepr {
            src_addr: sender_mac,
            dst_addr: EthernetAddress::BROADCAST,
            ethertype: EthProto::Arp,
        };
        let arp_repr = ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Request,
            source_hardware_addr: sender_mac,
            source_protocol_addr: sender_ip,
            target_hardware_addr: EthernetAddress::default(),
            target_protocol_addr: target_ip,
        };
        let mut buf = vec![0u8; ETHERNET_HEADER_LEN + arp_repr.buffer_len()];
        {
            let mut frame = EthernetFrame::new_unchecked(&mut buf[..]);
            eth_repr.emit(&mut frame);
        }
        let mut packet = ArpPacket::new_unchecked(&mut buf[ETHERNET_HEADER_LEN..]);
        arp_repr.emit(&mut packet);
        buf
    }

    #[allow(clippy::too_many_arguments)]
    fn tcp_frame(
        src_mac: EthernetAddress,
        dst_mac: EthernetAddress,
        src_ip: Addr,
        dst_ip: Addr,
        src_port: u16,
        dst_port: u16,
        control: TcpControl,
        seq: i32,
        ack: Option<i32>,
        payload: &[u8],
    ) -> Vec<u8> {
        let tcp_repr = TcpRepr {
            src_port,
            dst_port,
            control,
            seq_number: TcpSeqNumber(seq),
            ack_number: ack.map(TcpSeqNumber),
            window_len: 1024,
            max_seg_size: None,
            payload_len: payload.len(),
        };
        let ip_repr = Ipv4Repr {
            src_addr: src_ip,
            dst_addr: dst_ip,
            protocol: IpProtocol::Tcp,
            payload_len: tcp_repr.buffer_len(),
            ttl: 64,
        };
        let eth_repr = EthernetRepr {
            src_addr: src_mac,
            dst_addr: dst_mac,
            ethertype: EthProto::Ipv4,
        };
        let mut buf = vec![0u8; ETHERNET_HEADER_LEN + ip_repr.buffer_len()];
        {
            let mut frame = EthernetFrame::new_unchecked(&mut buf[..]);
            eth_repr.emit(&mut frame);
        }
        {
            let mut ip_packet = Ipv4Packet::new_unchecked(&mut buf[ETHERNET_HEADER_LEN..]);
            ip_repr.emit(&mut ip_packet);
        }
        let mut tcp_packet = TcpPacket::new_unchecked(&mut buf[ETHERNET_HEADER_LEN + IPV4_HEADER_LEN..]);
        tcp_repr.emit(&mut tcp_packet, &src_ip, &dst_ip, payload);
        buf
    }

    fn parse_tcp(frame: &[u8]) -> TcpRepr {
        let ip_packet = Ipv4Packet::new_checked(&frame[ETHERNET_HEADER_LEN..]).unwrap();
        let total_len = ip_packet.total_len() as usize;
        let tcp_bytes = &frame[ETHERNET_HEADER_LEN + IPV4_HEADER_LEN..ETHERNET_HEADER_LEN + total_len];
        let tcp_packet = TcpPacket::new_checked(tcp_bytes).unwrap();
        TcpRepr::parse(&tcp_packet).unwrap()
    }

    fn icmp_echo_request_frame(
        src_mac: EthernetAddress,
        dst_mac: EthernetAddress,
        src_ip: Addr,
        dst_ip: Addr,
        ident: u16,
        seq_no: u16,
        data: &[u8],
    ) -> Vec<u8> {
        let icmp_repr = Icmpv4Repr::EchoRequest { ident, seq_no, data };
        let ip_repr = Ipv4Repr {
            src_addr: src_ip,
            dst_addr: dst_ip,
            protocol: IpProtocol::Icmp,
            payload_len: icmp_repr.buffer_len(),
            ttl: 64,
        };
        let eth_repr = EthernetRepr {
            src_addr: src_mac,
            dst_addr: dst_mac,
            ethertype: EthProto::Ipv4,
        };
        let mut buf = vec![0u8; ETHERNET_HEADER_LEN + ip_repr.buffer_len()];
        {
            let mut frame = EthernetFrame::new_unchecked(&mut buf[..]);
            eth_repr.emit(&mut frame);
        }
        {
            let mut ip_packet = Ipv4Packet::new_unchecked(&mut buf[ETHERNET_HEADER_LEN..]);
            ip_repr.emit(&mut ip_packet);
        }
        let mut icmp_packet =
            Icmpv4Packet::new_unchecked(&mut buf[ETHERNET_HEADER_LEN + IPV4_HEADER_LEN..]);
        icmp_repr.emit(&mut icmp_packet);
        buf
    }

    const PEER_MAC: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 2]);

    fn peer_ip() -> Addr {
        Addr::new(192, 168, 1, 3)
    }

    fn local_mac() -> EthernetAddress {
        EthernetAddress([0x02, 0, 0, 0, 0, 1])
    }

    fn local_ip() -> Addr {
        Addr::new(192, 168, 1, 2)
    }

    /// Drives scenario 1 through ESTABLISHED, returning the engine with one
    /// byte `'A'` already delivered and un-released.
    fn established_with_one_byte(e: &mut TestEngine) {
        e.passive_open();

        e.nic.push_rx(RxEvent::RX_BROADCAST, arp_request_frame(PEER_MAC, peer_ip(), local_ip()));
        e.poll();
        assert_eq!(e.nic.tx_log.len(), 1);

        e.nic.push_rx(
            RxEvent::RX_IA,
            tcp_frame(PEER_MAC, local_mac(), peer_ip(), local_ip(), 1025, 80, TcpControl::Syn, 1000, None, &[]),
        );
        e.poll();
        let syn_ack = parse_tcp(e.nic.tx_log.last().unwrap());
        assert_eq!(syn_ack.control, TcpControl::Syn);
        assert_eq!(syn_ack.ack_number, Some(TcpSeqNumber(1001)));
        assert_eq!(syn_ack.max_seg_size, Some(e.config.max_tcp_rx_data_size as u16));

        let isn = syn_ack.seq_number;
        e.nic.push_rx(
            RxEvent::RX_IA,
            tcp_frame(
                PEER_MAC, local_mac(), peer_ip(), local_ip(), 1025, 80,
                TcpControl::None, 1001, Some((isn + 1usize).0), &[],
            ),
        );
        e.poll();
        assert_eq!(e.state(), State::Established);
        assert!(e.socket_status().contains(SocketStatus::CONNECTED));
        assert!(e.socket_status().contains(SocketStatus::TX_BUF_RELEASED));

        e.nic.push_rx(
            RxEvent::RX_IA,
            tcp_frame(PEER_MAC, local_mac(), peer_ip(), local_ip(), 1025, 80, TcpControl::None, 1001, Some((isn + 1usize).0), b"A"),
        );
        e.poll();
        assert!(e.socket_status().contains(SocketStatus::DATA_AVAILABLE));
        assert_eq!(e.rx_data(), b"A");
    }

    #[test]
    fn passive_accept_and_echo() {
        let mut e = engine();
        established_with_one_byte(&mut e);
        let ack = parse_tcp(e.nic.tx_log.last().unwrap());
        assert_eq!(ack.ack_number, Some(TcpSeqNumber(1002)));
    }

    #[test]
    fn backpressure_withholds_ack_until_released() {
        let mut e = engine();
        established_with_one_byte(&mut e);
        let tx_before = e.nic.tx_log.len();

        e.nic.push_rx(
            RxEvent::RX_IA,
            tcp_frame(PEER_MAC, local_mac(), peer_ip(), local_ip(), 1025, 80, TcpControl::None, 1002, Some(0), b"B"),
        );
        e.poll();
        assert_eq!(e.nic.tx_log.len(), tx_before, "backpressured segment must not be ACKed");
        assert_eq!(e.rx_data(), b"A");

        e.release_rx_buffer();
        e.nic.push_rx(
            RxEvent::RX_IA,
            tcp_frame(PEER_MAC, local_mac(), peer_ip(), local_ip(), 1025, 80, TcpControl::None, 1002, Some(0), b"B"),
        );
        e.poll();
        assert_eq!(e.rx_data(), b"B");
        let ack = parse_tcp(e.nic.tx_log.last().unwrap());
        assert_eq!(ack.ack_number, Some(TcpSeqNumber(1003)));
    }

    #[test]
    fn active_open_arp_timeout_forces_closed() {
        let mut e = engine();
        e.set_remote(Addr::new(192, 168, 1, 99), 7);
        e.active_open();

        for _ in 0..(e.config.max_retrys as u16 + 1) {
            e.clock.advance(e.config.retry_timeout + 1);
            e.poll();
        }
        assert_eq!(e.state(), State::Closed);
        assert!(e.socket_status().contains(SocketStatus::ERR_ARP_TIMEOUT));
    }

    #[test]
    fn gateway_is_targeted_for_off_subnet_peer() {
        let mut e = engine();
        e.set_remote(Addr::new(10, 0, 0, 5), 7);
        e.active_open();
        e.poll();

        let frame = &e.nic.tx_log[0];
        let packet = ArpPacket::new_checked(&frame[ETHERNET_HEADER_LEN..]).unwrap();
        let target = Addr::from_bytes(packet.target_protocol_addr());
        assert_eq!(target, Addr::new(192, 168, 1, 1));
    }

    #[test]
    fn icmp_echo_request_gets_matching_reply() {
        let mut e = engine();
        let ident = 0x1234;
        let seq_no = 7;
        let payload = b"ping";

        e.nic.push_rx(
            RxEvent::RX_IA,
            icmp_echo_request_frame(PEER_MAC, local_mac(), peer_ip(), local_ip(), ident, seq_no, payload),
        );
        e.poll();

        let frame = e.nic.tx_log.last().unwrap();
        let eth_frame = EthernetFrame::new_checked(&frame[..]).unwrap();
        assert_eq!(eth_frame.src_addr(), local_mac());
        assert_eq!(eth_frame.dst_addr(), PEER_MAC);

        let ip_packet = Ipv4Packet::new_checked(&frame[ETHERNET_HEADER_LEN..]).unwrap();
        assert_eq!(ip_packet.src_addr(), local_ip());
        assert_eq!(ip_packet.dst_addr(), peer_ip());
        assert!(ip_packet.verify_checksum());

        let total_len = ip_packet.total_len() as usize;
        let icmp_bytes = &frame[ETHERNET_HEADER_LEN + IPV4_HEADER_LEN..ETHERNET_HEADER_LEN + total_len];
        let icmp_packet = Icmpv4Packet::new_checked(icmp_bytes).unwrap();
        assert!(icmp_packet.verify_checksum());
        match Icmpv4Repr::parse(&icmp_packet).unwrap() {
            Icmpv4Repr::EchoReply { ident: got_ident, seq_no: got_seq, data } => {
                assert_eq!(got_ident, ident);
                assert_eq!(got_seq, seq_no);
                assert_eq!(data, payload);
            }
            Icmpv4Repr::EchoRequest { .. } => panic!("expected echo reply"),
        }
    }

    #[test]
    fn rst_in_established_forces_closed_with_no_reply() {
        let mut e = engine();
        established_with_one_byte(&mut e);
        e.release_rx_buffer();
        let tx_before = e.nic.tx_log.len();

        e.nic.push_rx(
            RxEvent::RX_IA,
            tcp_frame(PEER_MAC, local_mac(), peer_ip(), local_ip(), 1025, 80, TcpControl::Rst, 1002, Some(0), &[]),
        );
        e.poll();
        assert_eq!(e.state(), State::Closed);
        assert!(e.socket_status().contains(SocketStatus::ERR_CONN_RESET));
        assert_eq!(e.nic.tx_log.len(), tx_before);
    }

    #[test]
    fn graceful_passive_close() {
        let mut e = engine();
        established_with_one_byte(&mut e);
        e.release_rx_buffer();

        e.nic.push_rx(
            RxEvent::RX_IA,
            tcp_frame(PEER_MAC, local_mac(), peer_ip(), local_ip(), 1025, 80, TcpControl::Fin, 1002, Some(0), &[]),
        );
        e.poll();
        let ack = parse_tcp(e.nic.tx_log.last().unwrap());
        assert_eq!(ack.ack_number, Some(TcpSeqNumber(1003)));
        assert_eq!(e.state(), State::CloseWait);

        e.close();
        e.poll();
        let fin_ack = parse_tcp(e.nic.tx_log.last().unwrap());
        assert_eq!(fin_ack.control, TcpControl::Fin);
        assert_eq!(e.state(), State::LastAck);

        e.nic.push_rx(
            RxEvent::RX_IA,
            tcp_frame(PEER_MAC, local_mac(), peer_ip(), local_ip(), 1025, 80, TcpControl::None, 1003, Some((fin_ack.seq_number + 1usize).0), &[]),
        );
        e.poll();
        assert_eq!(e.state(), State::Closed);
    }
}
