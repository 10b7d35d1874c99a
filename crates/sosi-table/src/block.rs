//! Block-paged table storage.
//!
//! Entries are grouped in blocks of [`BLOCK_SIZE`]. A block is allocated the first
//! time an index inside it is written, filled with the table's fill value, and only
//! released when the whole table is cleared.

use sosi_common::{Result, SosiError};

/// Number of entries per block.
pub const BLOCK_SIZE: usize = 64;

/// Lazily allocated table of `T` indexed by `u32`.
#[derive(Debug, Clone)]
pub struct BlockTable<T: Clone> {
    blocks: Vec<Option<Box<[T; BLOCK_SIZE]>>>,
    fill: T,
    name: &'static str,
}

impl<T: Clone> BlockTable<T> {
    /// Creates an empty table. `name` is reported in errors.
    pub fn new(name: &'static str, fill: T) -> Self {
        Self {
            blocks: Vec::new(),
            fill,
            name,
        }
    }

    #[inline]
    fn split(index: u32) -> (usize, usize) {
        let index = index as usize;
        (index / BLOCK_SIZE, index % BLOCK_SIZE)
    }

    fn not_allocated(&self, index: u32) -> SosiError {
        SosiError::BlockNotAllocated {
            table: self.name,
            index: index as u64,
        }
    }

    /// Returns the entry at `index`.
    pub fn get(&self, index: u32) -> Result<&T> {
        let (block, slot) = Self::split(index);
        match self.blocks.get(block) {
            Some(Some(b)) => Ok(&b[slot]),
            _ => Err(self.not_allocated(index)),
        }
    }

    /// Returns the entry at `index` for modification.
    pub fn get_mut(&mut self, index: u32) -> Result<&mut T> {
        let (block, slot) = Self::split(index);
        match self.blocks.get_mut(block) {
            Some(Some(b)) => Ok(&mut b[slot]),
            _ => Err(SosiError::BlockNotAllocated {
                table: self.name,
                index: index as u64,
            }),
        }
    }

    /// Returns the entry at `index`, allocating its block if needed.
    pub fn get_mut_or_create(&mut self, index: u32) -> &mut T {
        let (block, slot) = Self::split(index);
        if block >= self.blocks.len() {
            self.blocks.resize_with(block + 1, || None);
        }
        let fill = &self.fill;
        let b = self.blocks[block].get_or_insert_with(|| Box::new(std::array::from_fn(|_| fill.clone())));
        &mut b[slot]
    }

    /// Returns true if the block holding `index` is allocated.
    pub fn is_allocated(&self, index: u32) -> bool {
        let (block, _) = Self::split(index);
        matches!(self.blocks.get(block), Some(Some(_)))
    }

    /// Releases every block.
    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    /// Number of allocated blocks.
    pub fn allocated_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_some()).count()
    }

    /// Fill value of fresh entries.
    pub fn fill(&self) -> &T {
        &self.fill
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::collections::HashMap;

    #[test]
    fn test_unallocated_get_errors() {
        let table: BlockTable<i32> = BlockTable::new("serial", -1);
        let err = table.get(0).unwrap_err();
        assert!(matches!(
            err,
            SosiError::BlockNotAllocated {
                table: "serial",
                index: 0
            }
        ));
    }

    #[test]
    fn test_fill_value_inside_block() {
        let mut table: BlockTable<i32> = BlockTable::new("serial", -1);
        *table.get_mut_or_create(5) = 42;
        assert_eq!(*table.get(5).unwrap(), 42);
        assert_eq!(*table.get(6).unwrap(), -1);
        assert_eq!(*table.get(63).unwrap(), -1);
        assert!(table.get(64).is_err());
    }

    #[test]
    fn test_laziness() {
        let mut table: BlockTable<u32> = BlockTable::new("bits", 0);
        assert_eq!(table.allocated_blocks(), 0);

        *table.get_mut_or_create(1000) = 1;
        assert_eq!(table.allocated_blocks(), 1);
        assert!(table.is_allocated(1000));
        assert!(!table.is_allocated(0));
        assert!(table.get(0).is_err());

        // Same block again
        *table.get_mut_or_create(1001) = 2;
        assert_eq!(table.allocated_blocks(), 1);

        table.clear();
        assert_eq!(table.allocated_blocks(), 0);
        assert!(table.get(1000).is_err());
    }

    #[test]
    fn test_get_mut() {
        let mut table: BlockTable<u32> = BlockTable::new("bits", 0);
        assert!(table.get_mut(3).is_err());
        table.get_mut_or_create(3);
        *table.get_mut(3).unwrap() = 9;
        assert_eq!(*table.get(3).unwrap(), 9);
    }

    #[test]
    fn test_random_against_map() {
        let mut rng = rand::rng();
        let mut table: BlockTable<u64> = BlockTable::new("groups", 0);
        let mut reference: HashMap<u32, u64> = HashMap::new();

        for _ in 0..2000 {
            let index = rng.random_range(0..10_000u32);
            let value = rng.random_range(1..u64::MAX);
            *table.get_mut_or_create(index) = value;
            reference.insert(index, value);
        }

        for (index, value) in &reference {
            assert_eq!(table.get(*index).unwrap(), value);
        }
        let blocks: std::collections::HashSet<u32> =
            reference.keys().map(|i| i / BLOCK_SIZE as u32).collect();
        assert_eq!(table.allocated_blocks(), blocks.len());
    }
}
