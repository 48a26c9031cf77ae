//! Real-time I/O and timing core for media servers.
//!
//! Two cooperating subsystems:
//!
//! - [`net`]: a single-threaded [`EventLoop`](net::EventLoop) multiplexing
//!   one UDP socket, a cross-thread task queue, a timer table and a bounded
//!   outbound send queue on one dedicated worker thread.
//! - [`rtp`]: a per-stream [`MediaFrameBridge`](rtp::MediaFrameBridge)
//!   converting codec-level frames into RTP packets with continuous sequence
//!   numbers and timestamps, fanned out to listener sinks.
//!
//! The bridge is typically driven on the loop thread (from an I/O callback
//! or a dispatched task); the loop is the only component touching the
//! socket.
//!
//! # Example
//!
//! ```rust,no_run
//! use media_loop::net::EventLoop;
//! use media_loop::Packet;
//! use std::net::UdpSocket;
//! use std::time::Duration;
//!
//! let socket = UdpSocket::bind("0.0.0.0:5004").unwrap();
//! let event_loop = EventLoop::new();
//! event_loop.start(socket).unwrap();
//!
//! // From any thread: queue a datagram and schedule work on the loop
//! event_loop.send(0x7f000001, 9999, Packet::from(vec![0u8; 100]));
//! let done = event_loop.dispatch(|now_ms| {
//!     println!("running on the loop at {now_ms}");
//! });
//! done.wait();
//!
//! let tick = event_loop.schedule_repeating(
//!     Duration::from_millis(100),
//!     Duration::from_millis(100),
//!     |_| { /* periodic upkeep */ },
//! );
//! tick.cancel();
//! event_loop.stop().unwrap();
//! ```

pub mod error;
pub mod net;
pub mod packet;
pub mod rtp;

pub use error::{Error, Result};
pub use packet::{Packet, MTU};

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the system epoch; the clock every loop and bridge
/// timestamp is expressed in.
pub(crate) fn epoch_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
