// src/net/send_queue.rs - Outbound datagram queue with tiered backpressure
//
// Multi-producer single-consumer: any thread enqueues, only the loop thread
// dequeues. Classification is debounced on the producer side from the
// approximate queue length:
// - Normal:    below half the limit
// - Lagging:   above half the limit (enqueue still succeeds, logged once)
// - Overflown: above the limit (entries are dropped until drained)
//
// Dropped packets never surface an error to the caller: the producer is an
// RTP sender whose correct behavior under overload is to skip, not block.

use crossbeam_channel::{Receiver, Sender};
use log::{error, info};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::packet::Packet;

/// Default cap on queued outbound datagrams.
pub const DEFAULT_MAX_PENDING: usize = 16 * 1024;

/// Debounced classification of the outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Normal,
    Lagging,
    Overflown,
}

const STATE_NORMAL: u8 = 0;
const STATE_LAGGING: u8 = 1;
const STATE_OVERFLOWN: u8 = 2;

/// One queued datagram: destination in host byte order plus the payload.
#[derive(Debug)]
pub struct SendEntry {
    pub ip: u32,
    pub port: u16,
    pub packet: Packet,
}

pub(crate) struct SendQueue {
    tx: Sender<SendEntry>,
    rx: Receiver<SendEntry>,
    state: AtomicU8,
    max_pending: usize,
    dropped: AtomicU64,
}

impl SendQueue {
    pub fn new(max_pending: usize) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            state: AtomicU8::new(STATE_NORMAL),
            max_pending: max_pending.max(4),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue one datagram, applying the backpressure policy.
    ///
    /// Returns `false` when the entry was dropped because the queue is over
    /// its limit. Concurrent producers may each observe a threshold crossing;
    /// the duplicate log line is harmless.
    pub fn push(&self, entry: SendEntry) -> bool {
        let approx = self.rx.len();

        if approx > self.max_pending {
            if self.state.swap(STATE_OVERFLOWN, Ordering::AcqRel) != STATE_OVERFLOWN {
                error!("send queue overflown, dropping [approx:{}]", approx);
            }
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        } else if approx > self.max_pending / 2 {
            if self
                .state
                .compare_exchange(
                    STATE_NORMAL,
                    STATE_LAGGING,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                error!("send queue lagging behind [approx:{}]", approx);
            }
        } else if approx < self.max_pending / 4
            && self.state.load(Ordering::Acquire) != STATE_NORMAL
        {
            self.state.store(STATE_NORMAL, Ordering::Release);
            info!("send queue back to normal [approx:{}]", approx);
        }

        // Receiver is owned by the queue itself, so send cannot fail
        let _ = self.tx.send(entry);
        true
    }

    /// Dequeue the next datagram (loop thread only).
    pub fn try_pop(&self) -> Option<SendEntry> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn state(&self) -> QueueState {
        match self.state.load(Ordering::Acquire) {
            STATE_LAGGING => QueueState::Lagging,
            STATE_OVERFLOWN => QueueState::Overflown,
            _ => QueueState::Normal,
        }
    }

    /// Total datagrams dropped by the overflow policy since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
