//! Single-producer/single-consumer framed byte ring.
//!
//! The RT boundary runs on two of these: `to_rt` (host → audio thread) and
//! `from_rt` (audio thread → host). Each message is a fixed 32-bit tag, a
//! 32-bit length, then `length` payload bytes. Capacity is a power of two,
//! fixed at open; neither side allocates afterwards.
//!
//! A message never wraps around the end of the buffer, so the consumer can
//! hand out each payload as one contiguous slice. When the space before the
//! wrap point cannot hold a whole frame, the producer either writes a
//! padding frame (tag [`TAG_WRAP_PADDING`]) covering the dead bytes, or - if
//! fewer than one header fits - leaves the residue unframed; both sides
//! share the rule that a residue shorter than a header is padding.
//!
//! Synchronization is two monotonically increasing indices: the producer
//! publishes with a release store of the write index, the consumer with a
//! release store of the read index; each reads the other's index with an
//! acquire load. There is no other synchronization.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Frame tag reserved for wrap padding; never delivered to consumers.
pub const TAG_WRAP_PADDING: u32 = u32::MAX;

/// Tag + length prefix, in bytes.
pub const HEADER_BYTES: usize = 8;

/// The producer could not enqueue: not enough free space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("ring buffer full")]
pub struct RingFull;

struct Shared {
    buf: Box<[UnsafeCell<u8>]>,
    mask: usize,
    /// Total bytes ever written (monotonic). Owned by the producer.
    head: AtomicUsize,
    /// Total bytes ever consumed (monotonic). Owned by the consumer.
    tail: AtomicUsize,
}

// The byte cells are only written in [head, ...) by the single producer and
// only read in [tail, head) by the single consumer; the atomic indices
// order those accesses.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    #[inline]
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    unsafe fn write_bytes(&self, at: usize, bytes: &[u8]) {
        debug_assert!((at & self.mask) + bytes.len() <= self.capacity());
        for (i, &b) in bytes.iter().enumerate() {
            *self.buf[(at & self.mask) + i].get() = b;
        }
    }

    #[inline]
    unsafe fn read_slice(&self, at: usize, len: usize) -> &[u8] {
        let start = at & self.mask;
        debug_assert!(start + len <= self.capacity());
        std::slice::from_raw_parts(self.buf[start].get(), len)
    }
}

/// Producing end of a ring. `Send`, not `Sync`.
pub struct RingWriter {
    shared: Arc<Shared>,
    /// Cached copy of `head`; only this side advances it.
    head: usize,
}

/// Consuming end of a ring. `Send`, not `Sync`.
pub struct RingReader {
    shared: Arc<Shared>,
    /// Cached copy of `tail`; only this side advances it.
    tail: usize,
}

/// Open a ring with at least `capacity` bytes (rounded up to a power of two).
pub fn ring(capacity: usize) -> (RingWriter, RingReader) {
    let capacity = capacity.max(64).next_power_of_two();
    let buf = (0..capacity).map(|_| UnsafeCell::new(0)).collect();
    let shared = Arc::new(Shared {
        buf,
        mask: capacity - 1,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    });
    (
        RingWriter {
            shared: Arc::clone(&shared),
            head: 0,
        },
        RingReader { shared, tail: 0 },
    )
}

impl RingWriter {
    /// Bytes currently free for writing.
    pub fn free(&self) -> usize {
        let tail = self.shared.tail.load(Ordering::Acquire);
        self.shared.capacity() - (self.head - tail)
    }

    /// True when a frame with `payload_len` bytes would fit right now,
    /// including any wrap padding it would need.
    pub fn fits(&self, payload_len: usize) -> bool {
        self.required(payload_len)
            .is_some_and(|needed| needed <= self.free())
    }

    /// Total bytes `payload_len` needs from the current head position, or
    /// None when the frame can never fit.
    ///
    /// Frames are capped at half the capacity: a larger frame could land at
    /// a position where its wrap padding never fits, wedging the ring.
    fn required(&self, payload_len: usize) -> Option<usize> {
        let need = HEADER_BYTES + payload_len;
        if need > self.shared.capacity() / 2 {
            return None;
        }
        let contiguous = self.shared.capacity() - (self.head & self.shared.mask);
        if contiguous >= need {
            Some(need)
        } else {
            Some(contiguous + need)
        }
    }

    /// Enqueue one frame. Fails without blocking when space is short.
    pub fn write(&mut self, tag: u32, payload: &[u8]) -> Result<(), RingFull> {
        debug_assert_ne!(tag, TAG_WRAP_PADDING);
        let needed = self.required(payload.len()).ok_or(RingFull)?;
        let tail = self.shared.tail.load(Ordering::Acquire);
        if self.shared.capacity() - (self.head - tail) < needed {
            return Err(RingFull);
        }

        let need = HEADER_BYTES + payload.len();
        let contiguous = self.shared.capacity() - (self.head & self.shared.mask);
        if contiguous < need {
            if contiguous >= HEADER_BYTES {
                let pad_len = (contiguous - HEADER_BYTES) as u32;
                unsafe {
                    self.shared
                        .write_bytes(self.head, &TAG_WRAP_PADDING.to_le_bytes());
                    self.shared
                        .write_bytes(self.head + 4, &pad_len.to_le_bytes());
                }
            }
            // A residue under one header is skipped by rule on both sides.
            self.head += contiguous;
        }

        unsafe {
            self.shared.write_bytes(self.head, &tag.to_le_bytes());
            self.shared
                .write_bytes(self.head + 4, &(payload.len() as u32).to_le_bytes());
            self.shared.write_bytes(self.head + HEADER_BYTES, payload);
        }
        self.head += need;
        self.shared.head.store(self.head, Ordering::Release);
        Ok(())
    }
}

impl RingReader {
    /// Bytes currently readable.
    pub fn available(&self) -> usize {
        self.shared.head.load(Ordering::Acquire) - self.tail
    }

    /// Dequeue one frame, handing `(tag, payload)` to `f`.
    ///
    /// Returns `None` when the ring is empty. The payload slice is only
    /// valid inside `f`; the frame is consumed when `f` returns.
    pub fn read<R>(&mut self, f: impl FnOnce(u32, &[u8]) -> R) -> Option<R> {
        loop {
            let head = self.shared.head.load(Ordering::Acquire);
            if head == self.tail {
                return None;
            }

            let contiguous = self.shared.capacity() - (self.tail & self.shared.mask);
            if contiguous < HEADER_BYTES {
                self.tail += contiguous;
                self.shared.tail.store(self.tail, Ordering::Release);
                continue;
            }

            let header = unsafe { self.shared.read_slice(self.tail, HEADER_BYTES) };
            let tag = u32::from_le_bytes(header[0..4].try_into().unwrap());
            let len = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;

            if tag == TAG_WRAP_PADDING {
                self.tail += HEADER_BYTES + len;
                self.shared.tail.store(self.tail, Ordering::Release);
                continue;
            }

            let payload = unsafe { self.shared.read_slice(self.tail + HEADER_BYTES, len) };
            let result = f(tag, payload);
            self.tail += HEADER_BYTES + len;
            self.shared.tail.store(self.tail, Ordering::Release);
            return Some(result);
        }
    }

    /// Drain every queued frame into `f`, returning how many were consumed.
    pub fn drain(&mut self, mut f: impl FnMut(u32, &[u8])) -> usize {
        let mut count = 0;
        while self.read(|tag, payload| f(tag, payload)).is_some() {
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip_in_order() {
        let (mut writer, mut reader) = ring(256);
        writer.write(1, b"alpha").unwrap();
        writer.write(2, b"").unwrap();
        writer.write(3, b"gamma").unwrap();

        let mut seen = Vec::new();
        reader.drain(|tag, payload| seen.push((tag, payload.to_vec())));
        assert_eq!(
            seen,
            vec![
                (1, b"alpha".to_vec()),
                (2, Vec::new()),
                (3, b"gamma".to_vec()),
            ]
        );
        assert_eq!(reader.available(), 0);
    }

    #[test]
    fn full_ring_refuses_without_blocking() {
        let (mut writer, mut reader) = ring(64);
        let payload = [0u8; 24];
        writer.write(1, &payload).unwrap();
        assert!(writer.write(2, &payload).is_ok());
        // 64 bytes exactly used; anything more must fail.
        assert_eq!(writer.write(3, &payload), Err(RingFull));
        assert!(!writer.fits(24));

        reader.read(|_, _| ()).unwrap();
        assert!(writer.fits(24));
        writer.write(3, &payload).unwrap();
    }

    #[test]
    fn oversized_frame_is_refused() {
        let (mut writer, _reader) = ring(64);
        // Above half the capacity the frame could wedge the ring.
        assert_eq!(writer.write(1, &[0u8; 25]), Err(RingFull));
        assert_eq!(writer.write(1, &[0u8; 100]), Err(RingFull));
    }

    #[test]
    fn messages_cross_the_wrap_boundary_intact() {
        let (mut writer, mut reader) = ring(64);
        // Advance positions so that frames land near the wrap point with
        // many different residues.
        for i in 0..200u32 {
            let len = (i % 13) as usize;
            let payload: Vec<u8> = (0..len).map(|j| (i as u8).wrapping_add(j as u8)).collect();
            writer.write(i + 1, &payload).unwrap();
            let got = reader
                .read(|tag, bytes| (tag, bytes.to_vec()))
                .expect("frame must be readable");
            assert_eq!(got, (i + 1, payload));
        }
    }

    #[test]
    fn interleaved_producer_consumer_keeps_fifo() {
        let (mut writer, mut reader) = ring(128);
        let mut expected = std::collections::VecDeque::new();
        let mut next: u32 = 1;
        for round in 0..500 {
            // Push until full, then pop a few.
            let payload = vec![round as u8; (round % 17) as usize];
            if writer.fits(payload.len()) {
                writer.write(next, &payload).unwrap();
                expected.push_back((next, payload));
                next += 1;
            } else {
                for _ in 0..3 {
                    if let Some(got) = reader.read(|tag, bytes| (tag, bytes.to_vec())) {
                        assert_eq!(got, expected.pop_front().unwrap());
                    }
                }
            }
        }
        while let Some(got) = reader.read(|tag, bytes| (tag, bytes.to_vec())) {
            assert_eq!(got, expected.pop_front().unwrap());
        }
        assert!(expected.is_empty());
    }

    #[test]
    fn cross_thread_transfer() {
        let (mut writer, mut reader) = ring(4096);
        let producer = std::thread::spawn(move || {
            for i in 0..10_000u32 {
                let payload = i.to_le_bytes();
                loop {
                    if writer.write(7, &payload).is_ok() {
                        break;
                    }
                    std::thread::yield_now();
                }
            }
        });

        let mut received = 0u32;
        while received < 10_000 {
            let got = reader.read(|tag, payload| {
                assert_eq!(tag, 7);
                u32::from_le_bytes(payload.try_into().unwrap())
            });
            match got {
                Some(value) => {
                    assert_eq!(value, received);
                    received += 1;
                }
                None => std::thread::yield_now(),
            }
        }
        producer.join().unwrap();
    }
}
