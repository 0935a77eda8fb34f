//! `easyweb-core`: a minimal embedded TCP/IP protocol stack.
//!
//! This crate implements a useful subset of RFC 793 (connection
//! establishment, teardown, retransmission, ordered delivery with a single
//! in-flight segment) plus an ARP resolver, an Ethernet/ARP/ICMP/TCP frame
//! dispatcher, and the Internet checksum. It is built around a single
//! outstanding connection, matching the constraints of a resource-limited
//! microcontroller driving a simple Ethernet MAC.
//!
//! The hardware itself — register I/O, on-chip frame memory, RX/TX event
//! polling — and the periodic tick source are external collaborators,
//! represented here by the [`phy::Nic`] and [`clock::Clock`] traits. Callers
//! supply implementations of both and drive the stack by calling
//! [`engine::Engine::poll`] far more often than the tick period.

#[macro_use]
mod macros; // must precede `wire`: macro_rules! visibility is textual order

pub mod clock;
pub mod config;
pub mod engine;
pub mod phy;
pub mod time;
pub mod wire;

pub use clock::Clock;
pub use config::Config;
pub use engine::{Engine, SocketStatus, State};
pub use phy::Nic;
