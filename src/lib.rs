//! A point-to-point command and telemetry link between a ground station and a vehicle, over a
//!  transport that may lose, corrupt or split data (serial line, UDP).
//!
//! Several streams are multiplexed over the link, each with its own sequence counters. Packets
//!  are either *unreliable* (fire and forget) or *reliable*, in which case the receiver answers
//!  with a receipt and the sender repeats the packet until it gets one. The firmware stream
//!  carries a resumable blob transfer on top of unreliable packets.
//!
//! Every packet travels in a frame:
//!
//! ```ascii
//! +-----------+--------+-------------------------------------------------+---------+----------+
//! | 0x9c 0x3e | length | src dest direction kind stream counter timestamp | payload | checksum |
//! +-----------+--------+-------------------------------------------------+---------+----------+
//!    2 bytes    u16 LE    varints, except counter (u16 LE)                             CRC-16
//! ```
//!
//! There are two endpoint implementations: [link::ground::GroundLink] runs as a set of tokio
//!  tasks, [link::onboard::OnboardLink] is single threaded, tick driven and allocation free
//!  after construction.

pub mod blob;
pub mod buffers;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod interval_set;
pub mod link;
pub mod packet;
pub mod safe_converter;
pub mod stream;
pub mod test_util;
pub mod transport;
