//! A connected pair of rings.
//!
//! Every channel id names two segments, `/nprpc_<id>_s2c` and
//! `/nprpc_<id>_c2s`. The server writes s2c and reads c2s; the client
//! mirrors. The receiving side runs a dedicated reader thread that parks
//! on the recv ring with a short deadline, so flipping `running` off
//! terminates it promptly.

use crate::{Error, ReadView, Ring, Segment, WriteReservation, ring, ring_name};

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

/// Which half of the channel this process holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Server,
    Client,
}

/// Reader thread poll deadline; teardown latency is bounded by it.
const READ_DEADLINE: Duration = Duration::from_millis(100);

pub struct ShmChannel {
    id: String,
    side: Side,
    send_ring: Ring,
    recv_ring: Ring,
    // Mappings must outlive the rings pointing into them.
    _send_segment: Segment,
    _recv_segment: Segment,
    running: AtomicBool,
}

impl ShmChannel {
    /// Create both segments and attach. The creating side owns the
    /// segment names and unlinks them on drop.
    pub fn create(id: &str, side: Side, capacity: usize) -> Result<Self, Error> {
        let total = ring::total_size(capacity);
        let s2c = Segment::create(&ring_name(id, true), total)?;
        let c2s = Segment::create(&ring_name(id, false), total)?;

        let s2c_ring = unsafe { Ring::attach(s2c.as_ptr(), total, true) }?;
        let c2s_ring = unsafe { Ring::attach(c2s.as_ptr(), total, true) }?;

        Ok(Self::assemble(id, side, s2c, c2s, s2c_ring, c2s_ring))
    }

    /// Attach to segments somebody else created.
    pub fn open(id: &str, side: Side) -> Result<Self, Error> {
        let s2c = Segment::open(&ring_name(id, true))?;
        let c2s = Segment::open(&ring_name(id, false))?;

        let s2c_ring = unsafe { Ring::attach(s2c.as_ptr(), s2c.len(), false) }?;
        let c2s_ring = unsafe { Ring::attach(c2s.as_ptr(), c2s.len(), false) }?;

        Ok(Self::assemble(id, side, s2c, c2s, s2c_ring, c2s_ring))
    }

    fn assemble(
        id: &str,
        side: Side,
        s2c: Segment,
        c2s: Segment,
        s2c_ring: Ring,
        c2s_ring: Ring,
    ) -> Self {
        let (send_ring, recv_ring, send_segment, recv_segment) = match side {
            Side::Server => (s2c_ring, c2s_ring, s2c, c2s),
            Side::Client => (c2s_ring, s2c_ring, c2s, s2c),
        };

        Self {
            id: id.to_string(),
            side,
            send_ring,
            recv_ring,
            _send_segment: send_segment,
            _recv_segment: recv_segment,
            running: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Copying send.
    pub fn send(&self, frame: &[u8]) -> Result<(), Error> {
        self.send_ring.try_write(frame)
    }

    /// Zero-copy send: marshal straight into ring memory, then commit the
    /// returned reservation.
    pub fn reserve_write(&self, max: usize) -> Result<WriteReservation<'_>, Error> {
        self.send_ring.try_reserve_write(max)
    }

    /// Zero-copy receive for callers that poll instead of running the
    /// reader thread.
    pub fn try_read_view(&self) -> Option<ReadView<'_>> {
        self.recv_ring.try_read_view()
    }

    /// Blocking copy-receive.
    pub fn read_with_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error> {
        self.recv_ring.read_with_timeout(buf, timeout)
    }

    /// Spawn the reader thread. `on_frame` sees each frame as a ring view
    /// valid for the duration of the call; the record is committed when it
    /// returns, so the peer's space is only reclaimed after dispatch.
    ///
    /// The thread holds a weak handle: it exits when the channel is
    /// dropped or [`ShmChannel::stop`] flips the running flag.
    pub fn start_reader<F>(self: &Arc<Self>, mut on_frame: F) -> JoinHandle<()>
    where
        F: FnMut(&ReadView<'_>) + Send + 'static,
    {
        let weak = Arc::downgrade(self);
        let id = self.id.clone();

        std::thread::Builder::new()
            .name(format!("shm-read-{}", self.id))
            .spawn(move || {
                while let Some(this) = weak.upgrade() {
                    if !this.running.load(Ordering::Relaxed) {
                        break;
                    }

                    if this.recv_ring.wait_readable(READ_DEADLINE) {
                        while let Some(view) = this.recv_ring.try_read_view() {
                            on_frame(&view);
                        }
                    }
                }

                log::debug!("shm channel reader exit: id={}", id);
            })
            .expect("spawn shm reader thread")
    }

    /// Ask the reader thread to exit; it notices within the poll deadline.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

impl Drop for ShmChannel {
    fn drop(&mut self) {
        self.stop();
    }
}
