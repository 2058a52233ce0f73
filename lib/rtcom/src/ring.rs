//! Bounded character rings with a mirrored tail region.
//!
//! The backing store is `2 * capacity` bytes. The writer always has a
//! contiguous window of at least `capacity / 5` bytes at its cursor: a
//! write that runs past `capacity` lands in the mirror region and is copied
//! back to the front before the cursor wraps. Readers own their cursors;
//! the writer never waits for them. A reader that falls more than
//! `capacity - overrun margin` behind has been lapped and must resynchronise.
//!
//! Two flavours share the layout: [`CharRing`] is single-threaded (inbound
//! command staging, where `linearize` supports string scanning), and
//! [`SampleRing`] carries the producer-to-session sample stream across the
//! thread boundary with a release/acquire published write cursor.

use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Largest single write, as a divisor of capacity. Writers must stay under
/// this so a reader can never be starved by one step.
pub const MAX_WRITE_DIV: usize = 5;

/// Reader lag beyond `capacity - capacity / OVERRUN_DIV` counts as overrun.
pub const OVERRUN_DIV: usize = 16;

#[inline]
fn overrun_margin(capacity: usize) -> usize {
    (capacity / OVERRUN_DIV).max(64)
}

/// Single-threaded mirrored ring. One writer cursor inside, any number of
/// externally owned reader cursors.
pub struct CharRing {
    buf: Box<[u8]>,
    capacity: usize,
    wpos: usize,
}

impl CharRing {
    pub fn with_capacity(capacity: usize) -> CharRing {
        assert!(capacity > 0, "ring capacity must be non-zero");

        CharRing {
            buf: vec![0u8; 2 * capacity].into_boxed_slice(),
            capacity,
            wpos: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current writer cursor, `[0, capacity)`. New reader cursors start here.
    #[inline]
    pub fn write_pos(&self) -> usize {
        self.wpos
    }

    /// Bytes between the reader cursor and the writer cursor.
    #[inline]
    pub fn available(&self, rpos: usize) -> usize {
        (self.capacity + self.wpos - rpos) % self.capacity
    }

    /// True once the reader has been left so far behind that the writer is
    /// about to lap it (or already has).
    #[inline]
    pub fn is_overrun(&self, rpos: usize) -> bool {
        self.available(rpos) > self.capacity - overrun_margin(self.capacity)
    }

    /// Free contiguous window at the writer cursor, before overrun of the
    /// slowest reader becomes possible within a single write.
    #[inline]
    pub fn max_write(&self) -> usize {
        self.capacity / MAX_WRITE_DIV
    }

    /// Copies `src` to the writer cursor and advances it.
    pub fn write(&mut self, src: &[u8]) {
        debug_assert!(src.len() <= self.max_write(), "single write exceeds capacity / 5");

        self.write_slice(src.len()).copy_from_slice(src);
        self.advance(src.len());
    }

    /// Contiguous writable window of `n` bytes at the writer cursor, for
    /// in-place formatting. Must be paired with `advance(n)`.
    #[inline]
    pub fn write_slice(&mut self, n: usize) -> &mut [u8] {
        debug_assert!(n <= self.max_write(), "single write exceeds capacity / 5");
        &mut self.buf[self.wpos..self.wpos + n]
    }

    /// Advances the writer cursor over bytes already placed via
    /// `write_slice`. Copies the mirror overhang back to the front when the
    /// write straddled the capacity boundary.
    pub fn advance(&mut self, n: usize) {
        let next = self.wpos + n;

        if next >= self.capacity {
            let overhang = next - self.capacity;
            let (front, mirror) = self.buf.split_at_mut(self.capacity);
            front[..overhang].copy_from_slice(&mirror[..overhang]);
            self.wpos = overhang;
        } else {
            self.wpos = next;
        }
    }

    /// Copies up to `dst.len()` available bytes into `dst`, advancing the
    /// reader cursor. Returns the number of bytes copied.
    pub fn read(&self, rpos: &mut usize, dst: &mut [u8]) -> usize {
        let count = self.available(*rpos).min(dst.len());

        if count == 0 {
            return 0;
        }

        let first = count.min(self.capacity - *rpos);
        dst[..first].copy_from_slice(&self.buf[*rpos..*rpos + first]);

        if first < count {
            dst[first..count].copy_from_slice(&self.buf[..count - first]);
        }

        *rpos = (*rpos + count) % self.capacity;
        count
    }

    /// Advances a reader cursor without copying.
    #[inline]
    pub fn consume(&self, rpos: &mut usize, n: usize) {
        debug_assert!(n <= self.available(*rpos));
        *rpos = (*rpos + n) % self.capacity;
    }

    /// Makes the unread bytes contiguous at the reader cursor and returns
    /// them as one slice, zero-terminated at the writer cursor.
    ///
    /// When the reader cursor sits above the writer cursor the front
    /// `[0, w)` is copied into the mirror region; nothing in `[0, w)` is
    /// modified. Single-threaded rings only.
    pub fn linearize(&mut self, rpos: usize) -> &[u8] {
        let avail = self.available(rpos);
        let w = self.wpos;
        let c = self.capacity;

        self.buf[w] = 0;

        if rpos > w {
            let (front, mirror) = self.buf.split_at_mut(c);
            mirror[..w].copy_from_slice(&front[..w]);
            mirror[w] = 0;
        }

        &self.buf[rpos..rpos + avail]
    }
}

/// Mirrored ring shared between the producer thread (single writer) and the
/// dispatcher thread (any number of reader cursors). The write cursor is
/// published with a release store after the payload bytes are in place;
/// readers load it with acquire before touching the payload.
///
/// Cursors are unbounded byte sequences rather than wrapped positions, so
/// a reader that has been lapped several times over still measures its
/// true lag; the physical position is `sequence % capacity`. Wrap-around
/// of the u64 itself is not a practical concern.
pub struct SampleRing {
    buf: UnsafeCell<Box<[u8]>>,
    capacity: usize,
    wseq: CachePadded<AtomicU64>,
}

// The single-writer discipline is enforced by SampleWriter being the only
// path that mutates the buffer, and there is exactly one per ring.
unsafe impl Send for SampleRing {}
unsafe impl Sync for SampleRing {}

impl SampleRing {
    pub fn new(capacity: usize) -> Arc<SampleRing> {
        assert!(capacity > 0, "ring capacity must be non-zero");

        Arc::new(SampleRing {
            buf: UnsafeCell::new(vec![0u8; 2 * capacity].into_boxed_slice()),
            capacity,
            wseq: CachePadded::new(AtomicU64::new(0)),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Published writer sequence. New reader cursors start here, and an
    /// overrun reader snaps back here.
    #[inline]
    pub fn write_pos(&self) -> u64 {
        self.wseq.load(Ordering::Acquire)
    }

    /// Bytes between the reader and the writer. Exceeds the capacity when
    /// the reader has been lapped.
    #[inline]
    pub fn available(&self, rseq: u64) -> usize {
        (self.write_pos() - rseq) as usize
    }

    #[inline]
    pub fn is_overrun(&self, rseq: u64) -> bool {
        self.available(rseq) > self.capacity - overrun_margin(self.capacity)
    }

    /// Copies exactly `dst.len()` bytes from the reader cursor, which must
    /// be available, and advances the cursor.
    ///
    /// The copy can race with the writer only if the reader has been
    /// lapped; callers detect that by re-checking `is_overrun` after the
    /// read and discarding what they copied.
    pub fn read_into(&self, rseq: &mut u64, dst: &mut [u8]) {
        debug_assert!(dst.len() <= self.available(*rseq));

        let base = self.buf.get() as *const u8;
        let position = (*rseq % self.capacity as u64) as usize;
        let first = dst.len().min(self.capacity - position);

        unsafe {
            std::ptr::copy_nonoverlapping(base.add(position), dst.as_mut_ptr(), first);

            if first < dst.len() {
                std::ptr::copy_nonoverlapping(
                    base,
                    dst.as_mut_ptr().add(first),
                    dst.len() - first,
                );
            }
        }

        *rseq += dst.len() as u64;
    }
}

/// The producer's exclusive write handle. Bytes staged with `write` become
/// visible to readers only after `publish`, so readers always observe whole
/// records.
pub struct SampleWriter {
    ring: Arc<SampleRing>,
    shadow: u64,
}

impl SampleWriter {
    pub fn new(ring: Arc<SampleRing>) -> SampleWriter {
        let shadow = ring.write_pos();
        SampleWriter { ring, shadow }
    }

    #[inline]
    pub fn ring(&self) -> &Arc<SampleRing> {
        &self.ring
    }

    /// Stages `src` at the shadow cursor. Panics the process on cursor
    /// corruption; continuing with a bad shared buffer is not an option.
    pub fn write(&mut self, src: &[u8]) {
        let c = self.ring.capacity;

        if self.shadow < self.ring.write_pos() || src.len() > c / MAX_WRITE_DIV {
            eprintln!(
                "sample ring corruption: cursor {} published {} write {}",
                self.shadow,
                self.ring.write_pos(),
                src.len()
            );
            std::process::abort();
        }

        let base = unsafe { (*self.ring.buf.get()).as_mut_ptr() };
        let position = (self.shadow % c as u64) as usize;

        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), base.add(position), src.len());
        }

        // Copy the mirror overhang back to the front when the write
        // straddled the capacity boundary.
        let end = position + src.len();
        if end > c {
            unsafe {
                std::ptr::copy_nonoverlapping(base.add(c), base, end - c);
            }
        }

        self.shadow += src.len() as u64;
    }

    /// Publishes everything staged so far with a release store.
    #[inline]
    pub fn publish(&mut self) {
        self.ring.wseq.store(self.shadow, Ordering::Release);
    }
}
