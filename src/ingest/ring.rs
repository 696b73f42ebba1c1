use std::ops::Range;

use parking_lot::{RwLock, RwLockWriteGuard};

use crate::clock::TimeStamp;

/// Split `[begin, end)` on a ring of `len` slots into at most two
/// contiguous slot ranges; the second is empty unless the span wraps.
///
/// Spans longer than the ring are clamped to one full revolution.
pub fn split_span(begin: TimeStamp, end: TimeStamp, len: usize) -> [Range<usize>; 2] {
    let count = (end - begin).clamp(0, len as i64) as usize;
    let start = begin.ring_index(len);

    if start + count <= len {
        [start..start + count, 0..0]
    } else {
        [start..len, 0..start + count - len]
    }
}

pub struct RingBuffer {
    data: RwLock<Vec<u8>>,
    nr_receivers: usize,
    nr_slots: usize,
    bytes_per_sample: usize,
}

impl RingBuffer {
    pub fn new(nr_receivers: usize, nr_slots: usize, bytes_per_sample: usize) -> Self {
        Self {
            data: RwLock::new(vec![0u8; nr_receivers * nr_slots * bytes_per_sample]),
            nr_receivers,
            nr_slots,
            bytes_per_sample,
        }
    }

    pub fn nr_slots(&self) -> usize {
        self.nr_slots
    }

    pub fn nr_receivers(&self) -> usize {
        self.nr_receivers
    }

    /// Exclusive access for storing a run of samples.
    pub fn writer(&self) -> RingWriter<'_> {
        RingWriter {
            data: self.data.write(),
            ring: self,
        }
    }

    fn offset(&self, receiver: usize, slot: usize) -> usize {
        (receiver * self.nr_slots + slot) * self.bytes_per_sample
    }

    /// Zero every receiver's samples in `[begin, end)`.
    pub fn zero(&self, begin: TimeStamp, end: TimeStamp) {
        let mut data = self.data.write();

        for receiver in 0..self.nr_receivers {
            for slots in split_span(begin, end, self.nr_slots) {
                if slots.is_empty() {
                    continue;
                }
                let from = self.offset(receiver, slots.start);
                let to = self.offset(receiver, slots.end);
                data[from..to].fill(0);
            }
        }
    }

    /// Append one receiver's samples for `[begin, end)` to `out`.
    pub fn copy_out(&self, receiver: usize, begin: TimeStamp, end: TimeStamp, out: &mut Vec<u8>) {
        let data = self.data.read();

        for slots in split_span(begin, end, self.nr_slots) {
            if slots.is_empty() {
                continue;
            }
            let from = self.offset(receiver, slots.start);
            let to = self.offset(receiver, slots.end);
            out.extend_from_slice(&data[from..to]);
        }
    }
}

/// Write guard over a [`RingBuffer`].
pub struct RingWriter<'a> {
    data: RwLockWriteGuard<'a, Vec<u8>>,
    ring: &'a RingBuffer,
}

impl RingWriter<'_> {
    /// Store one time sample; `block` holds one sample per receiver.
    pub fn store(&mut self, time: TimeStamp, block: &[u8]) {
        let slot = time.ring_index(self.ring.nr_slots);
        let bps = self.ring.bytes_per_sample;

        for (receiver, sample) in block.chunks_exact(bps).enumerate() {
            if receiver >= self.ring.nr_receivers {
                break;
            }
            let from = self.ring.offset(receiver, slot);
            self.data[from..from + bps].copy_from_slice(sample);
        }
    }
}
