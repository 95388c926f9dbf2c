//! Shard-subset bitmap over the cells of one redundancy group, e.g. which
//! shards of an EC stripe a partial update actually touches.

use std::fmt;

use crate::utils::{ErrCode, ShardTxError};

use fixedbitset::FixedBitSet;

/// Bitmap indexed by shard offset within a redundancy group.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap(FixedBitSet);

impl Bitmap {
    /// Bitmap over `size` shards, all set when `ones` is true.
    pub fn new(size: u16, ones: bool) -> Self {
        let mut bitset = FixedBitSet::with_capacity(size as usize);
        if ones {
            bitset.set_range(.., true);
        }
        Bitmap(bitset)
    }

    /// Bitmap over `size` shards with exactly the listed offsets set.
    pub fn from_ones(
        size: u16,
        ones: impl IntoIterator<Item = u16>,
    ) -> Result<Self, ShardTxError> {
        let mut bitmap = Self::new(size, false);
        for idx in ones {
            bitmap.set(idx, true)?;
        }
        Ok(bitmap)
    }

    #[inline]
    pub fn set(&mut self, idx: u16, flag: bool) -> Result<(), ShardTxError> {
        if idx >= self.size() {
            return Err(ShardTxError::code(
                ErrCode::Inval,
                format!("shard {} beyond group of {}", idx, self.size()),
            ));
        }
        self.0.set(idx as usize, flag);
        Ok(())
    }

    /// Out-of-range offsets read as unset.
    #[inline]
    pub fn get(&self, idx: u16) -> bool {
        self.0.contains(idx as usize)
    }

    #[inline]
    pub fn size(&self) -> u16 {
        self.0.len() as u16
    }

    /// Number of shards set.
    #[inline]
    pub fn count(&self) -> u16 {
        self.0.count_ones(..) as u16
    }

    /// True when every shard of the group is covered.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.count() == self.size()
    }

    /// Offsets of the set shards in ascending order.
    pub fn ones(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.ones().map(|i| i as u16)
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.count(), self.size())?;
        f.debug_list().entries(self.ones()).finish()
    }
}

#[cfg(test)]
mod bitmap_tests {
    use super::*;

    #[test]
    fn partial_stripe() -> Result<(), ShardTxError> {
        let mut map = Bitmap::from_ones(6, [0, 4, 5])?;
        assert_eq!(map.count(), 3);
        assert!(!map.is_full());
        assert!(map.get(4) && !map.get(1) && !map.get(6));
        assert!(map.set(6, true).is_err());
        map.set(4, false)?;
        assert_eq!(map.ones().collect::<Vec<_>>(), vec![0, 5]);
        assert_eq!(format!("{:?}", map), "2/6[0, 5]");
        Ok(())
    }

    #[test]
    fn full_stripe() {
        let map = Bitmap::new(4, true);
        assert!(map.is_full());
        assert_eq!(map.ones().count(), 4);
        assert!(Bitmap::from_ones(2, [5]).is_err());
    }
}
