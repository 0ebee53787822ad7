//! ## Shared-memory IPC channel
//!
//! Two processes on the same machine talk through pairs of lock-free
//! single-producer/single-consumer byte rings living in POSIX shared
//! memory. The fast path is purely atomic; an interprocess mutex/condvar
//! pair in the ring header exists only so an idle reader can sleep until
//! data arrives.
//!
//! Connection establishment is a rendezvous: a listener owns a well-known
//! accept ring, clients drop a handshake record into it and then poll-open
//! the per-connection rings the listener creates in response.

pub mod channel;
pub mod listener;
pub mod ring;
pub mod segment;
pub mod sync;

pub use self::{
    channel::{ShmChannel, Side},
    listener::ShmListener,
    ring::{ReadView, Ring, WriteReservation},
    segment::Segment,
};

use std::io;

/// Segment name prefix. Fixed by the wire protocol; peers in any language
/// derive the same names.
pub const SHM_PREFIX: &str = "/nprpc_";

/// Rendezvous handshake magic, `"NPRC"` little-endian.
pub const HANDSHAKE_MAGIC: u32 = 0x4E50_5243;
pub const HANDSHAKE_VERSION: u16 = 1;

/// `{magic: u32, version: u16, channel_id: [u8; 64]}`.
pub const HANDSHAKE_SIZE: usize = 70;

/// Default capacity of each per-connection ring.
pub const DEFAULT_RING_CAPACITY: usize = 16 * 1024 * 1024;

/// The accept ring only ever carries small handshake records.
pub const ACCEPT_RING_CAPACITY: usize = 16 * 1024;

#[derive(Debug)]
pub enum Error {
    /// Not enough free ring space for the message.
    BufferFull,
    /// Message exceeds what the ring can ever hold.
    MessageTooLarge,
    /// Blocking read or connect deadline expired.
    Timeout,
    /// Handshake record failed validation.
    BadHandshake,
    /// Ring or segment layout is not what the header claims.
    BadSegment,
    Io(io::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Name of one direction of a channel's ring pair.
///
/// # Test
///
/// ```
/// use flatwire_shm::ring_name;
///
/// assert_eq!(ring_name("ab12", true), "/nprpc_ab12_s2c");
/// assert_eq!(ring_name("ab12", false), "/nprpc_ab12_c2s");
/// ```
pub fn ring_name(channel_id: &str, server_to_client: bool) -> String {
    format!(
        "{}{}_{}",
        SHM_PREFIX,
        channel_id,
        if server_to_client { "s2c" } else { "c2s" }
    )
}

/// Name of a listener's rendezvous ring.
pub fn accept_ring_name(listener: &str) -> String {
    format!("{}{}_accept", SHM_PREFIX, listener)
}

/// Rendezvous record a client writes into the accept ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub channel_id: String,
}

impl Handshake {
    pub fn encode(&self) -> [u8; HANDSHAKE_SIZE] {
        let mut bytes = [0u8; HANDSHAKE_SIZE];
        bytes[..4].copy_from_slice(&HANDSHAKE_MAGIC.to_le_bytes());
        bytes[4..6].copy_from_slice(&HANDSHAKE_VERSION.to_le_bytes());

        let id = self.channel_id.as_bytes();
        let n = id.len().min(64);
        bytes[6..6 + n].copy_from_slice(&id[..n]);

        bytes
    }

    /// # Test
    ///
    /// ```
    /// use flatwire_shm::Handshake;
    ///
    /// let hs = Handshake { channel_id: "3f2e".to_string() };
    /// assert_eq!(Handshake::decode(&hs.encode()).unwrap(), hs);
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < HANDSHAKE_SIZE {
            return Err(Error::BadHandshake);
        }

        let magic = u32::from_le_bytes(bytes[..4].try_into().unwrap());
        let version = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
        if magic != HANDSHAKE_MAGIC || version != HANDSHAKE_VERSION {
            return Err(Error::BadHandshake);
        }

        let id = &bytes[6..6 + 64];
        let end = id.iter().position(|b| *b == 0).unwrap_or(64);
        let channel_id = std::str::from_utf8(&id[..end])
            .map_err(|_| Error::BadHandshake)?
            .to_string();
        if channel_id.is_empty() {
            return Err(Error::BadHandshake);
        }

        Ok(Self { channel_id })
    }
}
