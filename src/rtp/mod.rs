//! The **rtp** module is the media-frame-to-RTP packetization bridge: a
//! per-stream [`MediaFrameBridge`] that consumes codec-level frames plus
//! their packetization descriptors and emits RTP packets with a stable SSRC,
//! strictly increasing extended sequence numbers and timestamps that stay
//! continuous across explicit resets.
//!
//! The bridge never touches sockets: produced packets are handed
//! synchronously to registered [`RtpListener`] sinks, which typically
//! serialize them and queue them on the event loop for transmission.
//!
//! ## Key Components
//!
//! - [`MediaFrameBridge`]: segment/timestamp state machine and fan-out
//! - [`MediaFrame`] / [`RtpPacketization`]: the codec-side input model
//! - [`RtpPacket`]: header fields, payload assembly, wire serialization
//! - `RateAccumulator`: sliding-window byte-rate estimator behind the
//!   bridge's bitrate statistic

pub mod accumulator;
pub mod bridge;
pub mod frame;
pub mod packet;

pub use accumulator::RateAccumulator;
pub use bridge::{MediaFrameBridge, RtpListener, AUDIO_CLOCK_KHZ, VIDEO_CLOCK_KHZ};
pub use frame::{MediaFrame, MediaKind, RtpPacketization};
pub use packet::{LayerInfo, LayerSelector, RtpPacket, MAX_MEDIA_SIZE, RTP_HEADER_SIZE};
