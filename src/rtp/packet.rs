// src/rtp/packet.rs - RTP packet assembly and wire serialization
//
// Fixed header per RFC 3550 §5.1:
//
//  0                   1                   2                   3
//  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                           Timestamp                           |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                             SSRC                              |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
// The sequence number carried on the wire is the low 16 bits of a 32-bit
// extended counter owned by the producing bridge. Version is always 2;
// padding, extension and CSRC count are always 0.

use bytes::{BufMut, Bytes, BytesMut};

use crate::packet::{Packet, MTU};
use crate::rtp::frame::MediaKind;

pub const RTP_VERSION: u8 = 2;
pub const RTP_HEADER_SIZE: usize = 12;

/// Largest prefix-plus-slice payload that still fits one datagram.
pub const MAX_MEDIA_SIZE: usize = MTU - RTP_HEADER_SIZE;

const DEFAULT_PAYLOAD_TYPE: u8 = 96;

/// Scalability layer a video payload belongs to, filled in by a codec-aware
/// [`LayerSelector`] when one is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerInfo {
    pub spatial: u8,
    pub temporal: u8,
}

/// Codec-aware hook that inspects a video payload and reports which
/// scalability layer it carries. Runs on the loop thread; must not block.
pub trait LayerSelector: Send + Sync {
    fn layer_of(&self, payload: &[u8]) -> Option<LayerInfo>;
}

/// One RTP packet produced by the bridge, shared read-only with every
/// listener.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    kind: MediaKind,
    codec: u32,
    ssrc: u32,
    ext_seq: u32,
    timestamp: u32,
    mark: bool,
    payload_type: u8,
    payload: Bytes,
    layer: Option<LayerInfo>,
}

impl RtpPacket {
    pub fn new(kind: MediaKind, codec: u32) -> Self {
        Self {
            kind,
            codec,
            ssrc: 0,
            ext_seq: 0,
            timestamp: 0,
            mark: false,
            payload_type: DEFAULT_PAYLOAD_TYPE,
            payload: Bytes::new(),
            layer: None,
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn codec(&self) -> u32 {
        self.codec
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn set_ssrc(&mut self, ssrc: u32) {
        self.ssrc = ssrc;
    }

    /// Full 32-bit producer-side sequence counter.
    pub fn ext_seq(&self) -> u32 {
        self.ext_seq
    }

    pub fn set_ext_seq(&mut self, ext_seq: u32) {
        self.ext_seq = ext_seq;
    }

    /// The 16 bits that go on the wire.
    pub fn seq_num(&self) -> u16 {
        self.ext_seq as u16
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: u32) {
        self.timestamp = timestamp;
    }

    pub fn mark(&self) -> bool {
        self.mark
    }

    pub fn set_mark(&mut self, mark: bool) {
        self.mark = mark;
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn set_payload_type(&mut self, payload_type: u8) {
        self.payload_type = payload_type & 0x7f;
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Assemble the payload as prefix ∥ slice. Returns `false` without
    /// touching the packet when the result would not fit one datagram.
    pub fn set_payload(&mut self, prefix: &[u8], slice: &[u8]) -> bool {
        if prefix.len() + slice.len() > MAX_MEDIA_SIZE {
            return false;
        }
        let mut buf = BytesMut::with_capacity(prefix.len() + slice.len());
        buf.put_slice(prefix);
        buf.put_slice(slice);
        self.payload = buf.freeze();
        true
    }

    pub fn layer(&self) -> Option<LayerInfo> {
        self.layer
    }

    pub fn set_layer(&mut self, layer: Option<LayerInfo>) {
        self.layer = layer;
    }

    /// Serialize header and payload into one outbound datagram buffer.
    pub fn serialize(&self) -> Packet {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_SIZE + self.payload.len());
        buf.put_u8(RTP_VERSION << 6);
        buf.put_u8(((self.mark as u8) << 7) | self.payload_type);
        buf.put_u16(self.seq_num());
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        buf.put_slice(&self.payload);
        Packet::new(buf.freeze())
    }
}
