//! In-place field access.
//!
//! A flat struct is a fixed block of scalars reserved with
//! [`reserve_struct`], addressed by absolute byte offset. Variable-length
//! fields occupy eight bytes in the fixed block — `{relative_offset: u32,
//! count: u32}` — and their payload is appended past the write cursor with
//! [`alloc`]. The relative offset is measured from the field's own
//! location, so a finished buffer can be relocated or viewed in place.
//!
//! Optional fields occupy a single `u32`; zero means absent.

use crate::{Error, FlatBuffer};

/// Scalar types with a fixed little-endian wire layout.
pub trait Pod: Copy {
    const SIZE: usize;

    fn read(bytes: &[u8]) -> Self;
    fn write(self, bytes: &mut [u8]);
}

macro_rules! impl_pod {
    ($($ty:ty),*) => {
        $(impl Pod for $ty {
            const SIZE: usize = size_of::<$ty>();

            fn read(bytes: &[u8]) -> Self {
                <$ty>::from_le_bytes(bytes.try_into().unwrap())
            }

            fn write(self, bytes: &mut [u8]) {
                bytes.copy_from_slice(&self.to_le_bytes());
            }
        })*
    };
}

impl_pod!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl Pod for bool {
    const SIZE: usize = 1;

    fn read(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    fn write(self, bytes: &mut [u8]) {
        bytes[0] = self as u8;
    }
}

/// Read a scalar at an absolute offset.
pub fn get<T: Pod>(buf: &FlatBuffer, offset: usize) -> Result<T, Error> {
    Ok(T::read(buf.get(offset, T::SIZE)?))
}

/// Write a scalar at an absolute offset inside the committed region.
pub fn put<T: Pod>(buf: &mut FlatBuffer, offset: usize, value: T) -> Result<(), Error> {
    value.write(buf.get_mut(offset, T::SIZE)?);
    Ok(())
}

/// Reserve a zeroed fixed block at the write cursor and return its base
/// offset. Scalars are then patched in with [`put`] and variable fields
/// with [`alloc`].
///
/// # Test
///
/// ```
/// use flatwire_codec::{FlatBuffer, flat};
///
/// let mut buf = FlatBuffer::new();
/// let base = flat::reserve_struct(&mut buf, 12).unwrap();
///
/// flat::put(&mut buf, base, 7u64).unwrap();
/// flat::put(&mut buf, base + 8, 3u32).unwrap();
///
/// assert_eq!(flat::get::<u64>(&buf, base).unwrap(), 7);
/// assert_eq!(flat::get::<u32>(&buf, base + 8).unwrap(), 3);
/// ```
pub fn reserve_struct(buf: &mut FlatBuffer, size: usize) -> Result<usize, Error> {
    let base = buf.write_pos();
    buf.prepare(size)?.fill(0);
    buf.commit(size);

    Ok(base)
}

/// Append `count * elem_size` zeroed payload bytes and record them in the
/// `{relative_offset, count}` slot at `field`. Returns the absolute payload
/// offset.
pub fn alloc(
    buf: &mut FlatBuffer,
    field: usize,
    count: usize,
    elem_size: usize,
) -> Result<usize, Error> {
    let payload = buf.write_pos();
    let size = count.checked_mul(elem_size).ok_or(Error::LengthLimit)?;
    buf.prepare(size)?.fill(0);
    buf.commit(size);

    // The payload always lands past the fixed block, so the relative
    // offset is positive and fits the unsigned slot.
    put(buf, field, (payload - field) as u32)?;
    put(buf, field + 4, count as u32)?;

    Ok(payload)
}

/// Resolve a `{relative_offset, count}` slot to `(payload_offset, count)`,
/// bounds-checking the payload against the readable window.
pub fn get_indirect(
    buf: &FlatBuffer,
    field: usize,
    elem_size: usize,
) -> Result<(usize, usize), Error> {
    let rel = get::<u32>(buf, field)? as usize;
    let count = get::<u32>(buf, field + 4)? as usize;

    let payload = field.checked_add(rel).ok_or(Error::OutOfBounds)?;
    let size = count.checked_mul(elem_size).ok_or(Error::OutOfBounds)?;

    // Zero-length fields need no readable payload.
    if size > 0 {
        buf.get(payload, size)?;
    }

    Ok((payload, count))
}

/// # Test
///
/// ```
/// use flatwire_codec::{FlatBuffer, flat};
///
/// let mut buf = FlatBuffer::new();
/// let base = flat::reserve_struct(&mut buf, 8).unwrap();
///
/// flat::alloc_str(&mut buf, base, "panda").unwrap();
///
/// assert_eq!(flat::get_str(&buf, base).unwrap(), "panda");
/// ```
pub fn alloc_str(buf: &mut FlatBuffer, field: usize, value: &str) -> Result<(), Error> {
    alloc_bytes(buf, field, value.as_bytes())
}

pub fn get_str(buf: &FlatBuffer, field: usize) -> Result<&str, Error> {
    Ok(std::str::from_utf8(get_bytes(buf, field)?)?)
}

pub fn alloc_bytes(buf: &mut FlatBuffer, field: usize, value: &[u8]) -> Result<(), Error> {
    let payload = alloc(buf, field, value.len(), 1)?;
    buf.get_mut(payload, value.len())?.copy_from_slice(value);

    Ok(())
}

/// Zero-copy borrow of a byte vector's payload.
pub fn get_bytes(buf: &FlatBuffer, field: usize) -> Result<&[u8], Error> {
    let (payload, count) = get_indirect(buf, field, 1)?;
    buf.get(payload, count)
}

pub fn alloc_vec<T: Pod>(buf: &mut FlatBuffer, field: usize, items: &[T]) -> Result<(), Error> {
    let payload = alloc(buf, field, items.len(), T::SIZE)?;
    for (index, item) in items.iter().enumerate() {
        put(buf, payload + index * T::SIZE, *item)?;
    }

    Ok(())
}

pub fn get_vec<T: Pod>(buf: &FlatBuffer, field: usize) -> Result<Vec<T>, Error> {
    let (payload, count) = get_indirect(buf, field, T::SIZE)?;

    let mut items = Vec::with_capacity(count);
    for index in 0..count {
        items.push(get(buf, payload + index * T::SIZE)?);
    }

    Ok(items)
}

/// Materialise an optional field with a `size`-byte payload and return the
/// payload offset.
pub fn alloc_opt(buf: &mut FlatBuffer, field: usize, size: usize) -> Result<usize, Error> {
    let payload = buf.write_pos();
    buf.prepare(size)?.fill(0);
    buf.commit(size);
    put(buf, field, (payload - field) as u32)?;

    Ok(payload)
}

/// Leave an optional field absent. The fixed block is zeroed on reserve,
/// so this is only needed when overwriting.
pub fn set_none(buf: &mut FlatBuffer, field: usize) -> Result<(), Error> {
    put(buf, field, 0u32)
}

/// Resolve an optional field to the payload offset of its value, if any.
pub fn get_opt(buf: &FlatBuffer, field: usize) -> Result<Option<usize>, Error> {
    let rel = get::<u32>(buf, field)? as usize;
    if rel == 0 {
        return Ok(None);
    }

    Ok(Some(field.checked_add(rel).ok_or(Error::OutOfBounds)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_roundtrip() {
        let mut buf = FlatBuffer::new();
        let base = reserve_struct(&mut buf, 16).unwrap();

        alloc_vec::<u32>(&mut buf, base, &[1, 2, 3]).unwrap();
        alloc_vec::<u64>(&mut buf, base + 8, &[u64::MAX]).unwrap();

        assert_eq!(get_vec::<u32>(&buf, base).unwrap(), vec![1, 2, 3]);
        assert_eq!(get_vec::<u64>(&buf, base + 8).unwrap(), vec![u64::MAX]);
    }

    #[test]
    fn empty_vector_roundtrip() {
        let mut buf = FlatBuffer::new();
        let base = reserve_struct(&mut buf, 8).unwrap();

        alloc_vec::<u16>(&mut buf, base, &[]).unwrap();
        assert_eq!(get_vec::<u16>(&buf, base).unwrap(), Vec::<u16>::new());
    }

    #[test]
    fn optional_roundtrip() {
        let mut buf = FlatBuffer::new();
        let base = reserve_struct(&mut buf, 8).unwrap();

        assert_eq!(get_opt(&buf, base).unwrap(), None);

        let payload = alloc_opt(&mut buf, base, 4).unwrap();
        put(&mut buf, payload, 42u32).unwrap();

        let resolved = get_opt(&buf, base).unwrap().unwrap();
        assert_eq!(get::<u32>(&buf, resolved).unwrap(), 42);

        set_none(&mut buf, base + 4).unwrap();
        assert_eq!(get_opt(&buf, base + 4).unwrap(), None);
    }

    #[test]
    fn relative_offsets_survive_relocation() {
        let mut buf = FlatBuffer::new();
        let base = reserve_struct(&mut buf, 8).unwrap();
        alloc_str(&mut buf, base, "relocate me").unwrap();

        // Parse the same bytes from a different base address.
        let mut copy = Vec::from(buf.data());
        let moved = unsafe {
            FlatBuffer::view(copy.as_mut_ptr(), copy.len(), copy.len())
        };

        assert_eq!(get_str(&moved, 0).unwrap(), "relocate me");
    }

    #[test]
    fn truncated_payload_rejected() {
        let mut buf = FlatBuffer::new();
        let base = reserve_struct(&mut buf, 8).unwrap();
        put(&mut buf, base, 4u32).unwrap();
        put(&mut buf, base + 4, 1024u32).unwrap();

        assert!(matches!(get_bytes(&buf, base), Err(Error::OutOfBounds)));
    }
}
