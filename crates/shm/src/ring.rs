//! Lock-free SPSC byte ring.
//!
//! One producer, one consumer, never more. `write_idx` and `read_idx` are
//! monotonic 64-bit byte counters; the ring address of an index is
//! `idx % capacity`. `write_idx` is the single source of truth for what is
//! publishable: the producer's release store pairs with the consumer's
//! acquire load, so a length prefix and its payload are always visible
//! before the index that covers them.
//!
//! Each record is `[len: u32][payload]`, padded to 4-byte alignment so the
//! tail of the ring always has room for a length prefix. Records never
//! straddle the wrap boundary: when the remaining contiguous space cannot
//! hold a record, the producer stamps a `0xFFFF_FFFF` skip sentinel over
//! the remainder and restarts at offset zero.
//!
//! The header mutex/condvar serve one purpose: letting a consumer sleep
//! while the ring is empty. No index transition ever happens under the
//! lock.

use crate::{
    Error,
    sync::{SharedCondvar, SharedMutex},
};

use std::{
    ptr,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// Skip record marker for the wrap boundary.
const SKIP: u32 = 0xFFFF_FFFF;

const LEN_PREFIX: usize = 4;

#[repr(C)]
struct RingHeader {
    capacity: u64,
    write_idx: AtomicU64,
    read_idx: AtomicU64,
    mutex: SharedMutex,
    condvar: SharedCondvar,
}

/// Ring header footprint inside a segment, padded to a cache line.
pub const fn header_size() -> usize {
    (size_of::<RingHeader>() + 63) & !63
}

/// Total segment bytes needed for a ring with `capacity` payload bytes.
pub const fn total_size(capacity: usize) -> usize {
    header_size() + capacity
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// One ring inside a mapped segment. The struct itself is just pointers;
/// the segment keeps the mapping alive.
pub struct Ring {
    header: *mut RingHeader,
    data: *mut u8,
    capacity: usize,
}

unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    /// Attach to ring memory at `base`. With `init`, the header is written
    /// from scratch (segment creator only); otherwise it is validated
    /// against the mapping size.
    ///
    /// # Safety
    ///
    /// `base` must be the start of a mapping of at least `total` bytes
    /// that outlives the returned ring.
    pub unsafe fn attach(base: *mut u8, total: usize, init: bool) -> Result<Self, Error> {
        if total <= header_size() {
            return Err(Error::BadSegment);
        }

        let header = base as *mut RingHeader;
        // Capacity is kept 4-aligned so wrap arithmetic stays aligned too.
        let capacity = (total - header_size()) & !3;

        if init {
            unsafe {
                (*header).capacity = capacity as u64;
                (*header).write_idx = AtomicU64::new(0);
                (*header).read_idx = AtomicU64::new(0);
                SharedMutex::init(&mut (*header).mutex)?;
                SharedCondvar::init(&mut (*header).condvar)?;
            }
        } else if unsafe { (*header).capacity } != capacity as u64 {
            return Err(Error::BadSegment);
        }

        Ok(Self {
            header,
            data: unsafe { base.add(header_size()) },
            capacity,
        })
    }

    fn header(&self) -> &RingHeader {
        unsafe { &*self.header }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Published, unconsumed bytes (including framing and padding).
    pub fn len(&self) -> usize {
        let write = self.header().write_idx.load(Ordering::Acquire);
        let read = self.header().read_idx.load(Ordering::Acquire);

        (write - read) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_len_at(&self, offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        unsafe {
            ptr::copy_nonoverlapping(self.data.add(offset), bytes.as_mut_ptr(), 4);
        }

        u32::from_le_bytes(bytes)
    }

    fn write_len_at(&self, offset: usize, len: u32) {
        unsafe {
            ptr::copy_nonoverlapping(len.to_le_bytes().as_ptr(), self.data.add(offset), 4);
        }
    }

    /// Reserve a contiguous writable region for a message of at most
    /// `max` payload bytes. Nothing is visible to the consumer until
    /// [`WriteReservation::commit`].
    pub fn try_reserve_write(&self, max: usize) -> Result<WriteReservation<'_>, Error> {
        let record = align4(LEN_PREFIX + max);
        if record > self.capacity {
            return Err(Error::MessageTooLarge);
        }

        // The producer owns write_idx; only read_idx needs acquire.
        let write = self.header().write_idx.load(Ordering::Relaxed);
        let read = self.header().read_idx.load(Ordering::Acquire);
        let free = self.capacity - (write - read) as usize;

        let offset = (write % self.capacity as u64) as usize;
        let contiguous = self.capacity - offset;

        let (base, needed) = if contiguous >= record {
            (write, record)
        } else {
            // The record will not fit before the wrap; burn the remainder
            // with a skip sentinel and start over at offset zero.
            (write + contiguous as u64, contiguous + record)
        };

        if free < needed {
            return Err(Error::BufferFull);
        }

        if base != write {
            self.write_len_at(offset, SKIP);
        }

        Ok(WriteReservation {
            ring: self,
            base,
            max,
        })
    }

    /// Reserve, copy, commit.
    pub fn try_write(&self, data: &[u8]) -> Result<(), Error> {
        let mut reservation = self.try_reserve_write(data.len())?;
        reservation.payload_mut()[..data.len()].copy_from_slice(data);
        reservation.commit(data.len());

        Ok(())
    }

    /// View the next published record without copying, or `None` when the
    /// ring is empty. The view commits on drop.
    pub fn try_read_view(&self) -> Option<ReadView<'_>> {
        // The consumer owns read_idx; write_idx needs acquire to pair with
        // the producer's publication.
        let mut read = self.header().read_idx.load(Ordering::Relaxed);

        loop {
            let write = self.header().write_idx.load(Ordering::Acquire);
            if read == write {
                return None;
            }

            let offset = (read % self.capacity as u64) as usize;
            let len = self.read_len_at(offset);

            if len == SKIP {
                read += (self.capacity - offset) as u64;
                self.header().read_idx.store(read, Ordering::Release);
                continue;
            }

            return Some(ReadView {
                ring: self,
                base: read,
                payload: unsafe { self.data.add(offset + LEN_PREFIX) },
                size: len as usize,
                committed: false,
            });
        }
    }

    /// Copy the next record into `buf`, or `None` when empty.
    pub fn try_read(&self, buf: &mut [u8]) -> Result<Option<usize>, Error> {
        match self.try_read_view() {
            None => Ok(None),
            Some(view) => {
                if view.len() > buf.len() {
                    // Leave the record unconsumed for a larger buffer.
                    view.abandon();
                    return Err(Error::MessageTooLarge);
                }

                let size = view.len();
                buf[..size].copy_from_slice(view.as_slice());

                Ok(Some(size))
            }
        }
    }

    /// Sleep until the ring is non-empty or `timeout` elapses. Returns
    /// whether data is available. The wait parks on the header condvar;
    /// [`WriteReservation::commit`] signals it.
    pub fn wait_readable(&self, timeout: Duration) -> bool {
        if !self.is_empty() {
            return true;
        }

        let header = self.header();
        header.mutex.lock();
        let mut readable = !self.is_empty();
        if !readable {
            // A single bounded wait; the caller loops if it wants a longer
            // deadline. Spurious wakeups just re-check.
            header.condvar.wait_timeout(&header.mutex, timeout);
            readable = !self.is_empty();
        }
        header.mutex.unlock();

        readable
    }

    /// Blocking copy-read with a deadline.
    pub fn read_with_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error> {
        if !self.wait_readable(timeout) {
            return Err(Error::Timeout);
        }

        match self.try_read(buf)? {
            Some(size) => Ok(size),
            // Lost a race with our own earlier view; treat as timeout.
            None => Err(Error::Timeout),
        }
    }

    /// Serialise producers on a rendezvous ring. Per-connection rings are
    /// strict SPSC and never use this; the accept ring has one writer per
    /// connecting client, so the header mutex arbitrates them.
    pub fn locked_write(&self, data: &[u8]) -> Result<(), Error> {
        self.header().mutex.with(|| self.try_write(data))
    }
}

/// A promise of a contiguous writable region. Dropping without commit
/// abandons the reservation; nothing was published.
pub struct WriteReservation<'a> {
    ring: &'a Ring,
    base: u64,
    max: usize,
}

impl WriteReservation<'_> {
    pub fn max_size(&self) -> usize {
        self.max
    }

    pub fn payload_ptr(&self) -> *mut u8 {
        let offset = (self.base % self.ring.capacity as u64) as usize;
        unsafe { self.ring.data.add(offset + LEN_PREFIX) }
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.payload_ptr(), self.max) }
    }

    /// Publish `actual` payload bytes: stamp the length prefix, advance
    /// `write_idx` with release ordering, wake a sleeping consumer.
    pub fn commit(self, actual: usize) {
        debug_assert!(actual <= self.max);

        let offset = (self.base % self.ring.capacity as u64) as usize;
        self.ring.write_len_at(offset, actual as u32);

        let next = self.base + align4(LEN_PREFIX + actual) as u64;
        self.ring
            .header()
            .write_idx
            .store(next, Ordering::Release);

        let header = self.ring.header();
        header.mutex.with(|| ());
        header.condvar.signal();
    }
}

/// A zero-copy slice of one published record. Valid until commit; commits
/// on drop, or explicitly via [`ReadView::commit`]. [`ReadView::abandon`]
/// leaves the record in the ring for a later read.
pub struct ReadView<'a> {
    ring: &'a Ring,
    base: u64,
    payload: *mut u8,
    size: usize,
    committed: bool,
}

impl ReadView<'_> {
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.payload, self.size) }
    }

    pub fn payload_ptr(&self) -> *mut u8 {
        self.payload
    }

    /// Advance `read_idx` past this record.
    pub fn commit(mut self) {
        self.commit_in_place();
    }

    /// Leave the record unconsumed.
    pub fn abandon(mut self) {
        self.committed = true;
    }

    fn commit_in_place(&mut self) {
        if !self.committed {
            self.committed = true;
            let next = self.base + align4(LEN_PREFIX + self.size) as u64;
            self.ring.header().read_idx.store(next, Ordering::Release);
        }
    }
}

impl Drop for ReadView<'_> {
    fn drop(&mut self) {
        self.commit_in_place();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Rings are plain memory plus atomics, so the tests run them over an
    // aligned heap allocation instead of a real segment.
    struct HeapRing {
        mem: Vec<u64>,
        total: usize,
    }

    impl HeapRing {
        fn new(capacity: usize) -> (Self, Ring) {
            let total = total_size(capacity);
            let mut mem = vec![0u64; total.div_ceil(8)];
            let ring = unsafe { Ring::attach(mem.as_mut_ptr() as *mut u8, total, true) }.unwrap();

            (Self { mem, total }, ring)
        }
    }

    #[test]
    fn fifo_order() {
        let (_mem, ring) = HeapRing::new(4096);

        for i in 0..10u32 {
            ring.try_write(&i.to_le_bytes()).unwrap();
        }

        let mut buf = [0u8; 16];
        for i in 0..10u32 {
            let size = ring.try_read(&mut buf).unwrap().unwrap();
            assert_eq!(size, 4);
            assert_eq!(u32::from_le_bytes(buf[..4].try_into().unwrap()), i);
        }

        assert!(ring.try_read_view().is_none());
    }

    #[test]
    fn full_ring_rejects() {
        let (_mem, ring) = HeapRing::new(64);

        // 8-byte payloads occupy 12 bytes framed; five do not fit in 64.
        let payload = [0xAAu8; 8];
        let mut written = 0;
        while ring.try_write(&payload).is_ok() {
            written += 1;
        }

        assert!(written >= 4);
        assert!(matches!(ring.try_write(&payload), Err(Error::BufferFull)));

        // Draining one record frees space again.
        let mut buf = [0u8; 8];
        ring.try_read(&mut buf).unwrap().unwrap();
        ring.try_write(&payload).unwrap();
    }

    #[test]
    fn oversize_rejected_up_front() {
        let (_mem, ring) = HeapRing::new(64);
        assert!(matches!(
            ring.try_reserve_write(64),
            Err(Error::MessageTooLarge)
        ));
    }

    #[test]
    fn wraparound_skips_cleanly() {
        let (_mem, ring) = HeapRing::new(64);
        let mut buf = [0u8; 64];

        // Walk the cursors to offset 60, leaving 4 contiguous bytes before
        // the wrap; the next record must go through a skip sentinel.
        ring.try_write(&[1u8; 20]).unwrap();
        assert_eq!(ring.try_read(&mut buf).unwrap().unwrap(), 20);
        ring.try_write(&[2u8; 32]).unwrap();
        assert_eq!(ring.try_read(&mut buf).unwrap().unwrap(), 32);

        ring.try_write(&[3u8; 32]).unwrap();
        let size = ring.try_read(&mut buf).unwrap().unwrap();
        assert_eq!(size, 32);
        assert!(buf[..32].iter().all(|b| *b == 3));
        assert!(ring.is_empty());
    }

    #[test]
    fn reservation_drop_publishes_nothing() {
        let (_mem, ring) = HeapRing::new(256);

        {
            let mut reservation = ring.try_reserve_write(16).unwrap();
            reservation.payload_mut().fill(0xFF);
        }

        assert!(ring.is_empty());
        assert!(ring.try_read_view().is_none());
    }

    #[test]
    fn view_commit_advances_abandon_does_not() {
        let (_mem, ring) = HeapRing::new(256);
        ring.try_write(b"first").unwrap();

        let view = ring.try_read_view().unwrap();
        assert_eq!(view.as_slice(), b"first");
        view.abandon();

        let view = ring.try_read_view().unwrap();
        assert_eq!(view.as_slice(), b"first");
        view.commit();

        assert!(ring.try_read_view().is_none());
    }

    #[test]
    fn contended_stream_is_not_corrupted() {
        use rand::Rng;

        let capacity = 4 * 1024;
        let (mem, ring) = HeapRing::new(capacity);
        let _ = (&mem.mem, mem.total);

        let ring = std::sync::Arc::new(ring);

        // Total traffic well above 10x capacity.
        let sizes: Vec<usize> = {
            let mut rng = rand::rng();
            (0..4000).map(|_| rng.random_range(1..96)).collect()
        };

        let writer = {
            let ring = ring.clone();
            let sizes = sizes.clone();
            std::thread::spawn(move || {
                for (seq, size) in sizes.iter().enumerate() {
                    let mut message = vec![(seq % 251) as u8; *size];
                    message[0] = (seq % 256) as u8;
                    loop {
                        match ring.try_write(&message) {
                            Ok(()) => break,
                            Err(Error::BufferFull) => std::thread::yield_now(),
                            Err(err) => panic!("write failed: {err}"),
                        }
                    }
                }
            })
        };

        let mut buf = vec![0u8; 128];
        for (seq, size) in sizes.iter().enumerate() {
            let got = loop {
                match ring.try_read(&mut buf).unwrap() {
                    Some(got) => break got,
                    None => std::thread::yield_now(),
                }
            };

            assert_eq!(got, *size);
            assert_eq!(buf[0], (seq % 256) as u8);
            assert!(buf[1..got].iter().all(|b| *b == (seq % 251) as u8));
        }

        writer.join().unwrap();
        assert!(ring.is_empty());
    }
}
