//! per-group inode bitmaps
//!
//! bit `b` of group `g` stands for inode `g * inodes_per_group + b + 1`,
//! bit 0 is the least-significant bit of the first byte. 1 = allocated, 0 = free.
use bitvec::prelude::*;

/// bit-level access to one group's bitmap block, already resident in memory
///
/// no I/O happens here, callers enqueue the block for write-back after mutating it.
pub trait BitmapStore: Send {
    /// whether `bit` is set, bits beyond the bitmap read as set
    fn test(&self, bit: u32) -> bool;

    /// set `bit`, returning its previous value
    fn set(&mut self, bit: u32) -> bool;

    /// clear `bit`, returning its previous value
    fn clear(&mut self, bit: u32) -> bool;

    /// index of the first zero bit below `limit`, or `limit` if there is none
    fn find_first_zero(&self, limit: u32) -> u32;

    /// number of zero bits below `limit`
    fn count_zeros(&self, limit: u32) -> u32;

    /// raw on-disk bytes
    fn as_bytes(&self) -> &[u8];
}

/// [BitmapStore] over a [BitVec] with [Lsb0] ordering
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InodeBitmap {
    bits: BitVec<u8, Lsb0>,
}

impl InodeBitmap {
    /// an all-free bitmap of `len` bits
    pub fn new(len: u32) -> Self {
        Self {
            bits: bitvec![u8, Lsb0; 0; len as usize],
        }
    }

    /// rebuild a bitmap of `len` bits from on-disk bytes,
    /// trailing padding in `raw` is dropped
    pub fn from_bytes(raw: &[u8], len: u32) -> Self {
        let mut bits = BitVec::<u8, Lsb0>::from_slice(raw);
        bits.resize(len as usize, false);
        Self { bits }
    }

    pub fn len(&self) -> u32 {
        self.bits.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }
}

impl BitmapStore for InodeBitmap {
    fn test(&self, bit: u32) -> bool {
        self.bits.get(bit as usize).as_deref().copied().unwrap_or(true)
    }

    fn set(&mut self, bit: u32) -> bool {
        match self.bits.get_mut(bit as usize) {
            Some(mut b) => std::mem::replace(&mut *b, true),
            None => true,
        }
    }

    fn clear(&mut self, bit: u32) -> bool {
        match self.bits.get_mut(bit as usize) {
            Some(mut b) => std::mem::replace(&mut *b, false),
            None => false,
        }
    }

    fn find_first_zero(&self, limit: u32) -> u32 {
        let end = (limit as usize).min(self.bits.len());
        self.bits[..end]
            .first_zero()
            .map_or(limit, |idx| idx as u32)
    }

    fn count_zeros(&self, limit: u32) -> u32 {
        let end = (limit as usize).min(self.bits.len());
        self.bits[..end].count_zeros() as u32
    }

    fn as_bytes(&self) -> &[u8] {
        self.bits.as_raw_slice()
    }
}
