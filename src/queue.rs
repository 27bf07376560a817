//! Lock-free single-producer/single-consumer command ring buffer.
//!
//! The buffer holds a byte stream of `(length_byte, record_bytes)` tuples.
//! A length byte of zero is a skip marker: padding written at the physical
//! end of the buffer when the next record would not fit contiguously. A
//! record is never split across the wrap point.
//!
//! Ownership of the two sides is split at the type level: `split` yields
//! exactly one [`QueueProducer`] (main loop) and one [`QueueConsumer`]
//! (movement ISR). Publication protocol: the producer writes the record
//! body, then the length byte, then stores the tail index with release
//! ordering; the consumer acquires the tail before reading any length byte
//! or body, so a record is only ever observed fully written.
//!
//! `flush` is consumer-side only. It snaps head to tail and bumps a flush
//! epoch; a producer holding an uncommitted reservation notices the epoch
//! change at `commit` and aborts.

use core::ptr::NonNull;
use core::slice;
use core::sync::atomic::{AtomicU16, AtomicU8, AtomicUsize, Ordering};

use crate::protocol::QueueInfo;

/// Nominal record size used to report "remaining slots" to the host.
const QUEUE_SLOT_SIZE: usize = 20;

/// Control block. Lives in a static next to the storage it indexes.
pub struct QueueState {
    head: AtomicUsize,
    tail: AtomicUsize,
    current_count: AtomicU16,
    attempted_total: AtomicU16,
    in_progress_length: AtomicU8,
    flush_epoch: AtomicU16,
}

impl QueueState {
    pub const fn new() -> Self {
        Self {
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            current_count: AtomicU16::new(0),
            attempted_total: AtomicU16::new(0),
            in_progress_length: AtomicU8::new(0),
            flush_epoch: AtomicU16::new(0),
        }
    }

    /// Single-byte read; safe from any context.
    pub fn is_command_executing(&self) -> bool {
        self.in_progress_length.load(Ordering::Relaxed) != 0
    }
}

impl Default for QueueState {
    fn default() -> Self {
        Self::new()
    }
}

/// Split `storage` into the two queue endpoints.
///
/// `state` must be freshly constructed (or drained); the indices start at
/// zero.
pub fn split<'a>(
    state: &'a QueueState,
    storage: &'a mut [u8],
) -> (QueueProducer<'a>, QueueConsumer<'a>) {
    let cap = storage.len();
    // Safety: this is a &mut, it cannot be null.
    let buf = unsafe { NonNull::new_unchecked(storage.as_mut_ptr()) };
    (
        QueueProducer {
            state,
            buf,
            cap,
            pending: None,
        },
        QueueConsumer { state, buf, cap },
    )
}

struct Pending {
    pos: usize,
    len: u8,
    epoch: u16,
}

pub struct QueueProducer<'a> {
    state: &'a QueueState,
    buf: NonNull<u8>,
    cap: usize,
    pending: Option<Pending>,
}

// The endpoints guard disjoint regions of the shared storage.
unsafe impl Send for QueueProducer<'_> {}

impl<'a> QueueProducer<'a> {
    /// Reserve a writable slot for a record of `len` bytes (excluding the
    /// length byte). Returns `None` if the ring cannot currently hold it.
    ///
    /// The slot is exclusively the producer's until [`commit`]; an
    /// unpublished reservation is simply abandoned by the next `reserve`.
    ///
    /// [`commit`]: Self::commit
    pub fn reserve(&mut self, len: u8) -> Option<&mut [u8]> {
        debug_assert!(len > 0);
        let total = len as usize + 1;
        if total >= self.cap {
            return None;
        }

        let epoch = self.state.flush_epoch.load(Ordering::Acquire);
        let head = self.state.head.load(Ordering::Acquire);
        let tail = self.state.tail.load(Ordering::Relaxed);

        // The consumer parks head at `cap` briefly before wrapping; for
        // space accounting that is position 0.
        let eff_head = if head == self.cap { 0 } else { head };

        let pos = if tail >= eff_head {
            // Free space: tail..cap, then 0..eff_head (one byte kept as a
            // gap so a full ring is never mistaken for an empty one).
            let to_end = self.cap - tail;
            if to_end >= total && !(tail + total == self.cap && eff_head == 0) {
                tail
            } else if total < eff_head {
                // Wrap: pad the end region with a skip marker and place
                // the record at the buffer start.
                unsafe { self.buf.as_ptr().add(tail).write(0) };
                0
            } else {
                return None;
            }
        } else {
            // Already wrapped: contiguous free region is tail..eff_head-1.
            if eff_head - tail > total {
                tail
            } else {
                return None;
            }
        };

        self.pending = Some(Pending { pos, len, epoch });
        // Safety: pos+1..pos+1+len is inside the buffer and outside the
        // consumer's head..tail window.
        let slot = unsafe { slice::from_raw_parts_mut(self.buf.as_ptr().add(pos + 1), len as usize) };
        Some(slot)
    }

    /// Publish the reserved slot. Returns `false` (nothing published) when
    /// there is no reservation or a consumer flush intervened.
    pub fn commit(&mut self) -> bool {
        let Some(p) = self.pending.take() else {
            return false;
        };
        if self.state.flush_epoch.load(Ordering::Acquire) != p.epoch {
            return false;
        }
        // Length byte last within the slot, then the tail publish makes
        // skip marker, body and length visible together.
        unsafe { self.buf.as_ptr().add(p.pos).write(p.len) };
        let new_tail = (p.pos + p.len as usize + 1) % self.cap;
        self.state.tail.store(new_tail, Ordering::Release);
        self.state.current_count.fetch_add(1, Ordering::Relaxed);
        self.state.attempted_total.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Free bytes currently available to `reserve` (ignoring contiguity).
    pub fn free_bytes(&self) -> usize {
        let head = self.state.head.load(Ordering::Acquire);
        let tail = self.state.tail.load(Ordering::Relaxed);
        let eff_head = if head == self.cap { 0 } else { head };
        if tail >= eff_head {
            (self.cap - tail + eff_head).saturating_sub(1)
        } else {
            eff_head - tail - 1
        }
    }

    pub fn info(&self) -> QueueInfo {
        QueueInfo {
            remaining_slots: (self.free_bytes() / QUEUE_SLOT_SIZE) as u16,
            current_count: self.state.current_count.load(Ordering::Relaxed),
            total_count: self.state.attempted_total.load(Ordering::Relaxed),
        }
    }

    pub fn current_count(&self) -> u16 {
        self.state.current_count.load(Ordering::Relaxed)
    }
}

pub struct QueueConsumer<'a> {
    state: &'a QueueState,
    buf: NonNull<u8>,
    cap: usize,
}

unsafe impl Send for QueueConsumer<'_> {}

impl<'a> QueueConsumer<'a> {
    pub fn is_empty(&self) -> bool {
        self.state.head.load(Ordering::Relaxed) == self.state.tail.load(Ordering::Acquire)
    }

    /// Bytes of the next unconsumed record, skipping wrap padding. Records
    /// `in_progress_length` as a side effect. `None` when the queue is
    /// empty.
    pub fn peek_record(&mut self) -> Option<&[u8]> {
        loop {
            let tail = self.state.tail.load(Ordering::Acquire);
            let head = self.state.head.load(Ordering::Relaxed);
            if head == tail {
                return None;
            }
            if head >= self.cap {
                // ran off the physical end
                self.state.head.store(0, Ordering::Release);
                continue;
            }
            let len = unsafe { self.buf.as_ptr().add(head).read() };
            if len == 0 {
                // skip marker: the next record is at the buffer start
                // (tail ahead of head here would mean a flush raced us;
                // resynchronize to it)
                let next = if tail > head { tail } else { 0 };
                self.state.head.store(next, Ordering::Release);
                continue;
            }
            self.state.in_progress_length.store(len, Ordering::Relaxed);
            let body = unsafe { slice::from_raw_parts(self.buf.as_ptr().add(head + 1), len as usize) };
            return Some(body);
        }
    }

    /// Advance past the record most recently returned by `peek_record`.
    pub fn pop_finished(&mut self) {
        let len = self.state.in_progress_length.load(Ordering::Relaxed) as usize;
        let head = self.state.head.load(Ordering::Relaxed);
        self.state.head.store(head + len + 1, Ordering::Release);
        let _ = self
            .state
            .current_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                Some(c.saturating_sub(1))
            });
    }

    pub fn clear_in_progress(&mut self) {
        self.state.in_progress_length.store(0, Ordering::Relaxed);
    }

    /// Defensive count reset when the queue drains to empty.
    pub fn reset_count(&mut self) {
        self.state.current_count.store(0, Ordering::Relaxed);
    }

    pub fn current_count(&self) -> u16 {
        self.state.current_count.load(Ordering::Relaxed)
    }

    /// Drop everything still queued. A producer with an open reservation
    /// will observe the epoch change and abort its commit.
    pub fn flush(&mut self) {
        let tail = self.state.tail.load(Ordering::Acquire);
        self.state.head.store(tail, Ordering::Release);
        self.state.current_count.store(0, Ordering::Relaxed);
        self.state.in_progress_length.store(0, Ordering::Relaxed);
        self.state.flush_epoch.fetch_add(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(p: &mut QueueProducer, bytes: &[u8]) -> bool {
        match p.reserve(bytes.len() as u8) {
            Some(slot) => {
                slot.copy_from_slice(bytes);
                p.commit()
            }
            None => false,
        }
    }

    fn pop(c: &mut QueueConsumer) -> Option<Vec<u8>> {
        let out = c.peek_record().map(|b| b.to_vec());
        if out.is_some() {
            c.pop_finished();
        }
        out
    }

    #[test]
    fn round_trip_in_order() {
        let state = QueueState::new();
        let mut storage = [0u8; 64];
        let (mut p, mut c) = split(&state, &mut storage);

        assert!(c.is_empty());
        assert!(push(&mut p, &[1, 2, 3]));
        assert!(push(&mut p, &[4]));
        assert!(push(&mut p, &[5, 6]));
        assert_eq!(p.current_count(), 3);

        assert_eq!(pop(&mut c).unwrap(), vec![1, 2, 3]);
        assert_eq!(pop(&mut c).unwrap(), vec![4]);
        assert_eq!(pop(&mut c).unwrap(), vec![5, 6]);
        assert!(c.is_empty());
        assert_eq!(c.current_count(), 0);
    }

    #[test]
    fn full_reserve_fails_without_mutation() {
        let state = QueueState::new();
        let mut storage = [0u8; 16];
        let (mut p, mut c) = split(&state, &mut storage);

        assert!(push(&mut p, &[9; 10])); // 11 bytes used
        let info_before = p.info();
        assert!(p.reserve(10).is_none());
        assert_eq!(p.info(), info_before);
        assert_eq!(pop(&mut c).unwrap(), vec![9; 10]);
    }

    #[test]
    fn wrap_uses_skip_marker() {
        let state = QueueState::new();
        let mut storage = [0u8; 32];
        let (mut p, mut c) = split(&state, &mut storage);

        // Fill to byte 24, drain, then force a record past the end.
        assert!(push(&mut p, &[1; 11]));
        assert!(push(&mut p, &[2; 11]));
        assert_eq!(pop(&mut c).unwrap(), vec![1; 11]);
        assert_eq!(pop(&mut c).unwrap(), vec![2; 11]);
        // tail at 24: 8 bytes to the end, record needs 11.
        assert!(push(&mut p, &[3; 10]));
        assert_eq!(pop(&mut c).unwrap(), vec![3; 10]);
        assert!(c.is_empty());
    }

    #[test]
    fn flush_aborts_open_reservation() {
        let state = QueueState::new();
        let mut storage = [0u8; 64];
        let (mut p, mut c) = split(&state, &mut storage);

        assert!(push(&mut p, &[1, 1]));
        let slot = p.reserve(4).unwrap();
        slot.copy_from_slice(&[7; 4]);
        c.flush();
        assert!(!p.commit());
        assert!(c.is_empty());
        assert_eq!(c.current_count(), 0);
    }

    #[test]
    fn record_never_crosses_the_end() {
        let state = QueueState::new();
        let mut storage = [0u8; 24];
        let (mut p, mut c) = split(&state, &mut storage);

        // Interleave producer and consumer so the ring wraps repeatedly;
        // every record must come back byte-identical.
        let mut seq = 0u8;
        let mut expect = 0u8;
        for _ in 0..200 {
            let len = 1 + (seq % 7);
            let payload: Vec<u8> = (0..len).map(|_| seq).collect();
            if push(&mut p, &payload) {
                seq = seq.wrapping_add(1);
            }
            if let Some(got) = pop(&mut c) {
                assert!(got.iter().all(|&b| b == expect));
                expect = expect.wrapping_add(1);
            }
        }
        while let Some(got) = pop(&mut c) {
            assert!(got.iter().all(|&b| b == expect));
            expect = expect.wrapping_add(1);
        }
        assert_eq!(expect, seq);
    }
}
