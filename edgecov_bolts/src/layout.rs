//! Explicit binary layouts over mapped byte regions.
//!
//! A [`Layout`] names every field of a region (name, byte offset, width), so
//! readers never cast raw pointers into `#[repr(C)]` structs. All accesses go
//! through bounds-checked slices of the mapping.

use crate::Error;

/// One named field of a binary [`Layout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    /// Name of this field, used in error messages
    pub name: &'static str,
    /// Byte offset from the start of the region
    pub offset: usize,
    /// Width in bytes
    pub width: usize,
}

impl Field {
    /// Creates a new [`Field`]
    #[must_use]
    pub const fn new(name: &'static str, offset: usize, width: usize) -> Self {
        Self {
            name,
            offset,
            width,
        }
    }

    /// The first byte offset after this field
    #[must_use]
    pub const fn end(&self) -> usize {
        self.offset + self.width
    }

    /// The bytes of this field inside `region`.
    pub fn bytes<'a>(&self, region: &'a [u8]) -> Result<&'a [u8], Error> {
        region.get(self.offset..self.end()).ok_or_else(|| {
            Error::illegal_argument(format!(
                "Field {} ({}..{}) is out of bounds for a region of {} bytes",
                self.name,
                self.offset,
                self.end(),
                region.len()
            ))
        })
    }

    /// The bytes of this field inside `region`, mutable.
    pub fn bytes_mut<'a>(&self, region: &'a mut [u8]) -> Result<&'a mut [u8], Error> {
        let len = region.len();
        region.get_mut(self.offset..self.end()).ok_or_else(|| {
            Error::illegal_argument(format!(
                "Field {} ({}..{}) is out of bounds for a region of {len} bytes",
                self.name,
                self.offset,
                self.end(),
            ))
        })
    }

    /// Reads this field as a native-endian `u32`.
    pub fn read_u32(&self, region: &[u8]) -> Result<u32, Error> {
        self.expect_width(4)?;
        Ok(u32::from_ne_bytes(self.bytes(region)?.try_into()?))
    }

    /// Writes `value` into this field as a native-endian `u32`.
    pub fn write_u32(&self, region: &mut [u8], value: u32) -> Result<(), Error> {
        self.expect_width(4)?;
        self.bytes_mut(region)?
            .copy_from_slice(&value.to_ne_bytes());
        Ok(())
    }

    fn expect_width(&self, width: usize) -> Result<(), Error> {
        if self.width == width {
            Ok(())
        } else {
            Err(Error::illegal_argument(format!(
                "Field {} is {} bytes wide, not {width}",
                self.name, self.width
            )))
        }
    }
}

/// The layout of a whole mapped region: an ordered, non-overlapping list of [`Field`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Name of the region
    pub name: &'static str,
    /// All fields, sorted by offset
    pub fields: &'static [Field],
}

impl Layout {
    /// Creates a new [`Layout`]
    #[must_use]
    pub const fn new(name: &'static str, fields: &'static [Field]) -> Self {
        Self { name, fields }
    }

    /// The number of bytes a region needs to hold every field
    #[must_use]
    pub fn size(&self) -> usize {
        self.fields.iter().map(Field::end).max().unwrap_or(0)
    }

    /// Checks that the fields do not overlap and that `region_len` bytes can hold all of them.
    pub fn validate(&self, region_len: usize) -> Result<(), Error> {
        for pair in self.fields.windows(2) {
            if pair[0].end() > pair[1].offset {
                return Err(Error::illegal_state(format!(
                    "Layout {}: field {} overlaps field {}",
                    self.name, pair[0].name, pair[1].name
                )));
            }
        }
        if self.size() > region_len {
            return Err(Error::illegal_argument(format!(
                "Layout {} needs {} bytes, region only has {region_len}",
                self.name,
                self.size()
            )));
        }
        Ok(())
    }
}

/// Returns `true` if bit `index` is set. Bit `i` lives in byte `i / 8`, bit `i % 8`.
///
/// Indices past the end of `bits` read as unset.
#[inline]
#[must_use]
pub fn bit(bits: &[u8], index: usize) -> bool {
    bits.get(index / 8)
        .is_some_and(|byte| (byte >> (index % 8)) & 1 == 1)
}

/// Sets bit `index`.
///
/// # Panics
/// Panics if `index / 8` is out of bounds.
#[inline]
pub fn set_bit(bits: &mut [u8], index: usize) {
    bits[index / 8] |= 1 << (index % 8);
}

/// Clears bit `index`.
///
/// # Panics
/// Panics if `index / 8` is out of bounds.
#[inline]
pub fn clear_bit(bits: &mut [u8], index: usize) {
    bits[index / 8] &= !(1 << (index % 8));
}

/// Iterates over `bytes` in little-endian 64 bit words.
///
/// Bit `k` of word `w` is bit index `w * 64 + k` in the byte addressing used by [`bit`].
/// A trailing partial word is ignored, so callers keep their bitmaps 8-byte aligned.
pub fn words(bytes: &[u8]) -> impl Iterator<Item = u64> + '_ {
    bytes
        .chunks_exact(8)
        .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap_or_default()))
}

/// Reads slot `index` of an array of native-endian `i32`s.
#[inline]
#[must_use]
pub fn i32_slot(bytes: &[u8], index: usize) -> Option<i32> {
    let start = index.checked_mul(4)?;
    let slot = bytes.get(start..start.checked_add(4)?)?;
    slot.try_into().ok().map(i32::from_ne_bytes)
}
