//! The hardware boundary.
//!
//! Everything below this trait is a real CS8900A-class Ethernet
//! controller wired to an 8/16-bit external bus: two I/O ports (an
//! address-select port and a data port), an on-chip RX/TX frame buffer
//! reached through the data port, and a handful of status registers. The
//! engine never touches a register directly — it only calls [`Nic`], so a
//! host build can substitute [`TestNic`] and a real build can wire these
//! calls straight onto `Write8900`/`Read8900`/... in the field.

use core::ops::{BitAnd, BitOr};

/// Register-level and frame-buffer access to the Ethernet controller.
///
/// Every method here corresponds to exactly one primitive the reference
/// driver performs against the chip's two I/O ports; the engine composes
/// them, it never assumes anything about the bus width or timing
/// underneath.
pub trait Nic {
    /// Write a 16-bit value to an on-chip register.
    fn write_reg(&mut self, address: u8, data: u16);

    /// Read a 16-bit register, low byte first.
    fn read_reg(&mut self, address: u8) -> u16;

    /// Read a 16-bit register, high byte first (used for registers whose
    /// byte order differs from the data port default).
    fn read_reg_hb_first(&mut self, address: u8) -> u16;

    /// Copy `size` bytes from `src` into the chip's TX frame buffer.
    fn copy_to_frame(&mut self, src: &[u8]);

    /// Copy `size` bytes out of the chip's RX frame buffer into `dst`.
    fn copy_from_frame(&mut self, dst: &mut [u8]);

    /// Read one little-endian 16-bit word from the RX frame buffer.
    fn read_frame_word_le(&mut self) -> u16;

    /// Read one big-endian 16-bit word from the RX frame buffer (the
    /// protocol headers are network-byte-order, so this avoids
    /// byte-swapping every field while parsing).
    fn read_frame_word_be(&mut self) -> u16;

    /// Discard `size` bytes from the RX frame buffer without storing them.
    fn dummy_read_frame(&mut self, size: usize);

    /// Tell the chip to transmit the frame most recently written with
    /// [`copy_to_frame`], which must be exactly `frame_size` bytes.
    fn request_send(&mut self, frame_size: usize);

    /// `true` once the chip's TX buffer has room for a new frame.
    fn rdy_for_tx(&mut self) -> bool;

    /// Read and clear the chip's receive-event register.
    fn rx_event(&mut self) -> RxEvent;
}

/// Receive-event status bits, mirroring the CS8900A `RxEvent` register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxEvent(pub u16);

impl RxEvent {
    pub const NONE: RxEvent = RxEvent(0);
    /// A frame was received without error.
    pub const RX_OK: RxEvent = RxEvent(0x0100);
    /// The frame's destination matched our individual address.
    pub const RX_IA: RxEvent = RxEvent(0x0400);
    /// The frame's destination was the broadcast address.
    pub const RX_BROADCAST: RxEvent = RxEvent(0x0800);

    pub const fn contains(self, other: RxEvent) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl BitOr for RxEvent {
    type Output = RxEvent;
    fn bitor(self, rhs: RxEvent) -> RxEvent {
        RxEvent(self.0 | rhs.0)
    }
}

impl BitAnd for RxEvent {
    type Output = RxEvent;
    fn bitand(self, rhs: RxEvent) -> RxEvent {
        RxEvent(self.0 & rhs.0)
    }
}

#[cfg(test)]
pub use test_nic::TestNic;

#[cfg(test)]
mod test_nic {
    use super::RxEvent;
    use std::collections::VecDeque;

    /// An in-memory stand-in for a CS8900A, for host-side tests.
    ///
    /// `rx_queue` holds whole frames waiting to be "received"; `tx_log`
    /// records whole frames handed to [`request_send`](super::Nic::request_send),
    /// in order, so tests can assert on exactly what the engine emitted.
    #[derive(Debug)]
    pub struct TestNic {
        rx_queue: VecDeque<(RxEvent, Vec<u8>)>,
        cursor: Vec<u8>,
        tx_staging: Vec<u8>,
        pub tx_log: Vec<Vec<u8>>,
        tx_ready: bool,
    }

    impl TestNic {
        pub fn new() -> TestNic {
            TestNic {
                rx_queue: VecDeque::new(),
                cursor: Vec::new(),
                tx_staging: Vec::new(),
                tx_log: Vec::new(),
                tx_ready: true,
            }
        }

        /// Queue a frame for the engine to receive on its next `rx_event`
        /// poll, tagged with the event bits it should be reported under.
        pub fn push_rx(&mut self, event: RxEvent, frame: Vec<u8>) {
            self.rx_queue.push_back((event, frame));
        }

        pub fn set_tx_ready(&mut self, ready: bool) {
            self.tx_ready = ready;
        }
    }

    impl super::Nic for TestNic {
        fn write_reg(&mut self, _address: u8, _data: u16) {}

        fn read_reg(&mut self, _address: u8) -> u16 {
            0
        }

        fn read_reg_hb_first(&mut self, _address: u8) -> u16 {
            0
        }

        fn copy_to_frame(&mut self, src: &[u8]) {
            self.tx_staging.extend_from_slice(src);
        }

        fn copy_from_frame(&mut self, dst: &mut [u8]) {
            let n = dst.len();
            let take: Vec<u8> = self.cursor.drain(..n).collect();
            dst.copy_from_slice(&take);
        }

        fn read_frame_word_le(&mut self) -> u16 {
            let lo = self.cursor.remove(0) as u16;
            let hi = self.cursor.remove(0) as u16;
            lo | (hi << 8)
        }

        fn read_frame_word_be(&mut self) -> u16 {
            let hi = self.cursor.remove(0) as u16;
            let lo = self.cursor.remove(0) as u16;
            (hi << 8) | lo
        }

        fn dummy_read_frame(&mut self, size: usize) {
            self.cursor.drain(..size);
        }

        fn request_send(&mut self, frame_size: usize) {
            let frame: Vec<u8> = self.tx_staging.drain(..frame_size).collect();
            self.tx_log.push(frame);
        }

        fn rdy_for_tx(&mut self) -> bool {
            self.tx_ready
        }

        fn rx_event(&mut self) -> RxEvent {
            match self.rx_queue.pop_front() {
                Some((event, frame)) => {
                    self.cursor = frame;
                    event | RxEvent::RX_OK
                }
                None => RxEvent::NONE,
            }
        }
    }
}
