//! Rendezvous listener.
//!
//! The listener owns one well-known accept ring. A connecting client
//! drops a handshake record into it (serialised by the ring's header
//! mutex, since many clients may race) and then poll-opens the
//! per-connection segments the listener creates in response. The listener
//! never deletes segments it did not create.

use crate::{
    ACCEPT_RING_CAPACITY, Error, HANDSHAKE_SIZE, Handshake, Ring, Segment, ShmChannel, Side,
    accept_ring_name, ring,
};

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

/// Cadence of the client's poll-open loop.
const CONNECT_RETRY: Duration = Duration::from_millis(50);

/// How long a client keeps polling before giving up on the listener.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const ACCEPT_DEADLINE: Duration = Duration::from_millis(100);

pub struct ShmListener {
    name: String,
    accept_ring: Ring,
    _accept_segment: Segment,
    running: AtomicBool,
}

impl ShmListener {
    /// Create the accept ring under the listener name.
    pub fn bind(name: &str) -> Result<Self, Error> {
        let total = ring::total_size(ACCEPT_RING_CAPACITY);
        let segment = Segment::create(&accept_ring_name(name), total)?;
        let accept_ring = unsafe { Ring::attach(segment.as_ptr(), total, true) }?;

        log::info!("shm listener bound: name={}", name);

        Ok(Self {
            name: name.to_string(),
            accept_ring,
            _accept_segment: segment,
            running: AtomicBool::new(true),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the accept thread. For each valid handshake it creates the
    /// per-connection channel as the ring creator and hands it to
    /// `on_accept`. Records failing validation are dropped.
    pub fn start<F>(self: &Arc<Self>, ring_capacity: usize, mut on_accept: F) -> JoinHandle<()>
    where
        F: FnMut(ShmChannel) + Send + 'static,
    {
        let weak = Arc::downgrade(self);
        let name = self.name.clone();

        std::thread::Builder::new()
            .name(format!("shm-accept-{}", self.name))
            .spawn(move || {
                let mut record = [0u8; HANDSHAKE_SIZE];

                while let Some(this) = weak.upgrade() {
                    if !this.running.load(Ordering::Relaxed) {
                        break;
                    }

                    if !this.accept_ring.wait_readable(ACCEPT_DEADLINE) {
                        continue;
                    }

                    match this.accept_ring.try_read(&mut record) {
                        Ok(Some(size)) => match Handshake::decode(&record[..size]) {
                            Ok(handshake) => {
                                log::info!(
                                    "shm accept: listener={}, channel={}",
                                    this.name,
                                    handshake.channel_id
                                );

                                match ShmChannel::create(
                                    &handshake.channel_id,
                                    Side::Server,
                                    ring_capacity,
                                ) {
                                    Ok(channel) => on_accept(channel),
                                    Err(err) => log::warn!(
                                        "shm channel create failed: channel={}, err={}",
                                        handshake.channel_id,
                                        err
                                    ),
                                }
                            }
                            Err(err) => {
                                log::warn!(
                                    "shm handshake rejected: listener={}, err={}",
                                    this.name,
                                    err
                                );
                            }
                        },
                        Ok(None) => {}
                        Err(err) => {
                            // An over-long record cannot be a handshake;
                            // consume and drop it so the ring keeps moving.
                            if let Some(view) = this.accept_ring.try_read_view() {
                                view.commit();
                            }

                            log::warn!(
                                "shm accept ring read failed: listener={}, err={}",
                                this.name,
                                err
                            );
                        }
                    }
                }

                log::debug!("shm accept thread exit: listener={}", name);
            })
            .expect("spawn shm accept thread")
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Client-side connect: write a handshake with a fresh channel id,
    /// then poll-open the rings the listener creates for us.
    pub fn connect(listener: &str) -> Result<ShmChannel, Error> {
        let channel_id = uuid::Uuid::new_v4().simple().to_string();

        {
            let segment = Segment::open(&accept_ring_name(listener))?;
            let accept_ring = unsafe { Ring::attach(segment.as_ptr(), segment.len(), false) }?;

            let handshake = Handshake {
                channel_id: channel_id.clone(),
            };
            accept_ring.locked_write(&handshake.encode())?;
        }

        let deadline = Instant::now() + CONNECT_TIMEOUT;
        loop {
            match ShmChannel::open(&channel_id, Side::Client) {
                Ok(channel) => {
                    log::info!("shm connect: listener={}, channel={}", listener, channel_id);
                    return Ok(channel);
                }
                Err(Error::Io(_)) if Instant::now() < deadline => {
                    std::thread::sleep(CONNECT_RETRY);
                }
                Err(Error::Io(_)) => return Err(Error::Timeout),
                Err(err) => return Err(err),
            }
        }
    }
}

impl Drop for ShmListener {
    fn drop(&mut self) {
        self.stop();
    }
}
