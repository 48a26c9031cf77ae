use bytes::Bytes;

/// Media class of a frame. Anything but audio or video is ignored by the
/// bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
    Unknown,
}

/// One slice of a media frame that becomes one RTP payload: `size` bytes at
/// `pos`, optionally preceded by codec-specific prefix bytes (e.g. a
/// fragmentation header).
#[derive(Debug, Clone)]
pub struct RtpPacketization {
    pub pos: usize,
    pub size: usize,
    pub prefix: Bytes,
}

impl RtpPacketization {
    pub fn new(pos: usize, size: usize) -> Self {
        Self {
            pos,
            size,
            prefix: Bytes::new(),
        }
    }

    pub fn with_prefix(pos: usize, size: usize, prefix: Bytes) -> Self {
        Self { pos, size, prefix }
    }

    /// Bytes this descriptor contributes to the wire: prefix plus slice.
    pub fn total_len(&self) -> usize {
        self.prefix.len() + self.size
    }
}

/// A codec-level frame plus the instructions for splitting it into RTP
/// payloads. `timestamp` is in codec-specific units and monotonic within a
/// segment; a frame with no packetization descriptors is dropped by the
/// bridge.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub kind: MediaKind,
    pub codec: u32,
    pub data: Bytes,
    pub timestamp: u64,
    pub packetization: Vec<RtpPacketization>,
}

impl MediaFrame {
    pub fn new(kind: MediaKind, codec: u32, data: Bytes, timestamp: u64) -> Self {
        Self {
            kind,
            codec,
            data,
            timestamp,
            packetization: Vec::new(),
        }
    }

    pub fn add_packetization(&mut self, info: RtpPacketization) {
        self.packetization.push(info);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
