// src/rtp/bridge.rs - Media-frame-to-RTP packetization bridge
//
// Per-stream stateful converter: codec-level frames in, RTP packets out to a
// set of listener sinks. Guarantees across the whole stream lifetime:
// - extended sequence numbers increase by exactly 1 per emitted packet
// - RTP timestamps never move backwards, including across an explicit
//   reset(): the first post-reset timestamp advances by the wall-clock gap
//   scaled to the stream clock, plus one
//
// Malformed input never raises an error: frames without packetization info,
// unsupported kinds and oversized slices are dropped individually, visible
// only through the stats counters.

use log::debug;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::epoch_now_ms;
use crate::rtp::accumulator::RateAccumulator;
use crate::rtp::frame::{MediaFrame, MediaKind};
use crate::rtp::packet::{LayerSelector, RtpPacket, MAX_MEDIA_SIZE};

/// Default stream clocks in kHz: 48 for audio (Opus), 90 for video.
pub const AUDIO_CLOCK_KHZ: u64 = 48;
pub const VIDEO_CLOCK_KHZ: u64 = 90;

/// Sink receiving every RTP packet the bridge produces. Invoked
/// synchronously on the thread feeding the bridge; must not block.
pub trait RtpListener: Send + Sync {
    fn on_rtp(&self, packet: &Arc<RtpPacket>);
}

/// Timestamp continuity state for the current segment. A segment starts at
/// the first frame after construction or after a reset; `first_timestamp`
/// of 0 means no segment has started yet.
struct Timeline {
    ext_seq: u32,
    first_timestamp: u64,
    base_timestamp: u64,
    last_timestamp: u64,
    last_time_ms: u64,
    accumulator: RateAccumulator,
}

/// Converts media frames into a continuous RTP packet stream and fans the
/// packets out to any number of listeners.
///
/// Typically driven from the event loop thread (an I/O callback or a
/// dispatched task); listener registration and `reset` are safe from any
/// thread.
pub struct MediaFrameBridge {
    ssrc: u32,
    audio_clock_khz: u64,
    video_clock_khz: u64,
    reset: AtomicBool,
    timeline: Mutex<Timeline>,
    payload_types: Mutex<HashMap<u32, u8>>,
    layer_selector: Mutex<Option<Arc<dyn LayerSelector>>>,
    listeners: Mutex<Vec<Arc<dyn RtpListener>>>,
    num_frames: AtomicU64,
    num_packets: AtomicU64,
    total_bytes: AtomicU64,
    bitrate_bps: AtomicU64,
}

impl MediaFrameBridge {
    pub fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            audio_clock_khz: AUDIO_CLOCK_KHZ,
            video_clock_khz: VIDEO_CLOCK_KHZ,
            reset: AtomicBool::new(false),
            timeline: Mutex::new(Timeline {
                ext_seq: 0,
                first_timestamp: 0,
                base_timestamp: 0,
                last_timestamp: 0,
                last_time_ms: 0,
                accumulator: RateAccumulator::default(),
            }),
            payload_types: Mutex::new(HashMap::new()),
            layer_selector: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            num_frames: AtomicU64::new(0),
            num_packets: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            bitrate_bps: AtomicU64::new(0),
        }
    }

    /// New bridge with a randomly chosen SSRC (RFC 3550 §8.1).
    pub fn with_random_ssrc() -> Self {
        Self::new(rand::rng().random::<u32>())
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Override the audio stream clock. 48 kHz is correct for Opus but not
    /// universal.
    pub fn set_audio_clock_khz(&mut self, khz: u64) {
        self.audio_clock_khz = khz.max(1);
    }

    /// Override the video stream clock.
    pub fn set_video_clock_khz(&mut self, khz: u64) {
        self.video_clock_khz = khz.max(1);
    }

    /// Register the wire payload type to stamp on packets of `codec`.
    /// Unmapped codecs fall back to dynamic type 96.
    pub fn map_payload_type(&self, codec: u32, payload_type: u8) {
        self.payload_types
            .lock()
            .unwrap()
            .insert(codec, payload_type & 0x7f);
    }

    /// Install the codec-aware hook that annotates video packets with their
    /// scalability layer.
    pub fn set_layer_selector(&self, selector: Arc<dyn LayerSelector>) {
        *self.layer_selector.lock().unwrap() = Some(selector);
    }

    pub fn add_listener(&self, listener: Arc<dyn RtpListener>) {
        debug!("bridge {:#010x}: listener added", self.ssrc);
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn RtpListener>) {
        debug!("bridge {:#010x}: listener removed", self.ssrc);
        self.listeners
            .lock()
            .unwrap()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Arm the reset latch: the next incoming frame starts a new segment
    /// whose timestamps continue strictly after the current ones.
    pub fn reset(&self) {
        self.reset.store(true, Ordering::Release);
    }

    /// Feed one frame, stamping packets against the wall clock.
    pub fn on_media_frame(&self, frame: &MediaFrame) {
        self.on_media_frame_at(frame, epoch_now_ms());
    }

    /// Feed one frame at an explicit time. Packets are handed to every
    /// listener before this returns.
    pub fn on_media_frame_at(&self, frame: &MediaFrame, now_ms: u64) {
        if frame.packetization.is_empty() {
            return;
        }

        // Consume the reset latch: restart the segment, carrying the base
        // forward so timestamps keep increasing
        if self.reset.swap(false, Ordering::AcqRel) {
            let mut timeline = self.timeline.lock().unwrap();
            timeline.first_timestamp = 0;
            timeline.base_timestamp = timeline.last_timestamp;
        }

        let rate = match frame.kind {
            MediaKind::Audio => self.audio_clock_khz,
            MediaKind::Video => self.video_clock_khz,
            MediaKind::Unknown => return,
        };

        self.num_frames.fetch_add(1, Ordering::Relaxed);
        self.total_bytes
            .fetch_add(frame.data.len() as u64, Ordering::Relaxed);

        let payload_type = self
            .payload_types
            .lock()
            .unwrap()
            .get(&frame.codec)
            .copied()
            .unwrap_or(96);
        let layer_selector = self.layer_selector.lock().unwrap().clone();

        let mut packets = Vec::with_capacity(frame.packetization.len());
        {
            let mut timeline = self.timeline.lock().unwrap();

            timeline.accumulator.update(now_ms, frame.data.len() as u64);
            self.bitrate_bps
                .store(timeline.accumulator.instant() * 8, Ordering::Relaxed);

            if timeline.first_timestamp == 0 {
                // Starting a new segment: advance the base by the wall-clock
                // gap since the last produced packet, plus one so progress is
                // strict even at zero elapsed time
                if timeline.last_time_ms > 0 {
                    let elapsed = now_ms.saturating_sub(timeline.last_time_ms);
                    timeline.base_timestamp =
                        timeline.last_timestamp + elapsed * rate / 1000 + 1;
                }
                timeline.first_timestamp = frame.timestamp;
            }

            let total = frame.packetization.len();
            for (i, info) in frame.packetization.iter().enumerate() {
                // Oversized slice: skip this descriptor, keep the rest of
                // the frame
                if info.total_len() > MAX_MEDIA_SIZE {
                    debug!(
                        "bridge {:#010x}: descriptor of {} bytes exceeds datagram capacity, skipped",
                        self.ssrc,
                        info.total_len()
                    );
                    continue;
                }
                let Some(slice) = info
                    .pos
                    .checked_add(info.size)
                    .and_then(|end| frame.data.get(info.pos..end))
                else {
                    debug!(
                        "bridge {:#010x}: descriptor at {} of {} bytes outside frame of {} bytes, skipped",
                        self.ssrc,
                        info.pos,
                        info.size,
                        frame.data.len()
                    );
                    continue;
                };

                let ext_seq = timeline.ext_seq;
                timeline.ext_seq = timeline.ext_seq.wrapping_add(1);

                timeline.last_timestamp = timeline
                    .base_timestamp
                    .wrapping_add(frame.timestamp.wrapping_sub(timeline.first_timestamp));

                let mut packet = RtpPacket::new(frame.kind, frame.codec);
                packet.set_ssrc(self.ssrc);
                packet.set_ext_seq(ext_seq);
                packet.set_payload_type(payload_type);
                packet.set_timestamp(timeline.last_timestamp.wrapping_mul(rate) as u32);
                packet.set_mark(i + 1 == total);
                if !packet.set_payload(&info.prefix, slice) {
                    continue;
                }

                if frame.kind == MediaKind::Video {
                    if let Some(selector) = layer_selector.as_ref() {
                        packet.set_layer(selector.layer_of(packet.payload()));
                    }
                }

                self.num_packets.fetch_add(1, Ordering::Relaxed);
                packets.push(Arc::new(packet));
            }

            if !packets.is_empty() {
                timeline.last_time_ms = now_ms;
            }
        }

        let listeners = self.listeners.lock().unwrap();
        for packet in &packets {
            for listener in listeners.iter() {
                listener.on_rtp(packet);
            }
        }
    }

    /// Recompute the bitrate estimate against the wall clock without
    /// emitting packets.
    pub fn update(&self) {
        self.update_at(epoch_now_ms());
    }

    /// Recompute the bitrate estimate at an explicit time.
    pub fn update_at(&self, now_ms: u64) {
        let mut timeline = self.timeline.lock().unwrap();
        timeline.accumulator.update(now_ms, 0);
        self.bitrate_bps
            .store(timeline.accumulator.instant() * 8, Ordering::Relaxed);
    }

    pub fn num_frames(&self) -> u64 {
        self.num_frames.load(Ordering::Relaxed)
    }

    pub fn num_packets(&self) -> u64 {
        self.num_packets.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Windowed instant bitrate in bits per second.
    pub fn bitrate_bps(&self) -> u64 {
        self.bitrate_bps.load(Ordering::Relaxed)
    }
}
