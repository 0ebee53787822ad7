//! Object references.

use crate::{
    Error, FlatBuffer,
    endpoint::{ENDPOINT_SIZE, EndPoint},
    flat,
};

/// Flag bits carried inside an [`ObjectId`].
pub mod flags {
    /// The reference carries a class id string.
    pub const HAS_CLASS_ID: u8 = 1;
    /// The endpoint is only valid over the session the reference arrived
    /// on.
    pub const TETHERED: u8 = 2;
}

/// A serialisable reference to a servant somewhere.
///
/// The `(poa_idx, object_id)` pair uniquely identifies the servant within
/// its process for the servant's lifespan; everything else is routing
/// metadata for the caller.
///
/// ```text
/// 0  object_id      u64
/// 8  poa_idx        u16
/// 10 flags          u8
/// 11 interface_idx  u8
/// 12 class_id       {offset, count}
/// 20 hostname       {offset, count}
/// 28 endpoint       (flat EndPoint)
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectId {
    pub object_id: u64,
    pub poa_idx: u16,
    pub flags: u8,
    pub interface_idx: u8,
    pub class_id: String,
    pub hostname: String,
    pub endpoint: EndPoint,
}

pub const OBJECT_ID_SIZE: usize = 28 + ENDPOINT_SIZE;

impl ObjectId {
    pub fn has_class_id(&self) -> bool {
        self.flags & flags::HAS_CLASS_ID != 0
    }

    pub fn is_tethered(&self) -> bool {
        self.flags & flags::TETHERED != 0 || self.endpoint.is_tethered()
    }

    /// Append the flat form at the write cursor, returning its base.
    ///
    /// # Test
    ///
    /// ```
    /// use flatwire_codec::{FlatBuffer, endpoint::EndPoint, oid::{self, ObjectId}};
    ///
    /// let id = ObjectId {
    ///     object_id: 3,
    ///     poa_idx: 0,
    ///     flags: oid::flags::HAS_CLASS_ID,
    ///     interface_idx: 0,
    ///     class_id: "flatwire/nameserver".to_string(),
    ///     hostname: "node-1".to_string(),
    ///     endpoint: EndPoint::tcp([127, 0, 0, 1].into(), 15000),
    /// };
    ///
    /// let mut buf = FlatBuffer::new();
    /// let base = id.encode(&mut buf).unwrap();
    ///
    /// assert_eq!(ObjectId::decode(&buf, base).unwrap(), id);
    /// ```
    pub fn encode(&self, buf: &mut FlatBuffer) -> Result<usize, Error> {
        let base = flat::reserve_struct(buf, OBJECT_ID_SIZE)?;
        self.encode_into(buf, base)?;

        Ok(base)
    }

    /// Fill an [`OBJECT_ID_SIZE`] block reserved inside a larger argument
    /// struct. String payloads append at the write cursor.
    pub fn encode_into(&self, buf: &mut FlatBuffer, base: usize) -> Result<(), Error> {
        flat::put(buf, base, self.object_id)?;
        flat::put(buf, base + 8, self.poa_idx)?;
        flat::put(buf, base + 10, self.flags)?;
        flat::put(buf, base + 11, self.interface_idx)?;
        flat::alloc_str(buf, base + 12, &self.class_id)?;
        flat::alloc_str(buf, base + 20, &self.hostname)?;
        self.endpoint.encode(buf, base + 28)
    }

    pub fn decode(buf: &FlatBuffer, base: usize) -> Result<Self, Error> {
        buf.get(base, OBJECT_ID_SIZE)?;

        Ok(Self {
            object_id: flat::get(buf, base)?,
            poa_idx: flat::get(buf, base + 8)?,
            flags: flat::get(buf, base + 10)?,
            interface_idx: flat::get(buf, base + 11)?,
            class_id: flat::get_str(buf, base + 12)?.to_string(),
            hostname: flat::get_str(buf, base + 20)?.to_string(),
            endpoint: EndPoint::decode(buf, base + 28)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sample() -> ObjectId {
        ObjectId {
            object_id: (9u64 << 32) | 4,
            poa_idx: 1,
            flags: flags::HAS_CLASS_ID | flags::TETHERED,
            interface_idx: 2,
            class_id: "demo/echo".to_string(),
            hostname: "localhost".to_string(),
            endpoint: EndPoint::shared_memory("0b9ce14d"),
        }
    }

    #[test]
    fn roundtrip_at_nonzero_base() {
        let mut buf = FlatBuffer::new();

        // Something else sits in front of the reference.
        flat::reserve_struct(&mut buf, 24).unwrap();

        let base = sample().encode(&mut buf).unwrap();
        assert_eq!(base, 24);
        assert_eq!(ObjectId::decode(&buf, base).unwrap(), sample());
    }

    #[test]
    fn tethered_flag_and_endpoint_agree() {
        let mut id = sample();
        assert!(id.is_tethered());

        id.flags = flags::HAS_CLASS_ID;
        id.endpoint = EndPoint::tcp(Ipv4Addr::LOCALHOST, 1).tethered();
        assert!(id.is_tethered());

        id.endpoint = EndPoint::tcp(Ipv4Addr::LOCALHOST, 1);
        assert!(!id.is_tethered());
    }

    #[test]
    fn truncated_reference_rejected() {
        let mut buf = FlatBuffer::new();
        sample().encode(&mut buf).unwrap();

        let short = FlatBuffer::from_bytes(&buf.data()[..OBJECT_ID_SIZE - 1]);
        assert!(ObjectId::decode(&short, 0).is_err());
    }
}
