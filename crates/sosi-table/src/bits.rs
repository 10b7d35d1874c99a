//! Used-bit table: one 32-bit word of column flags per group.
//!
//! Column 0 and columns 27..=31 belong to the engine. Columns 1..=26 are free for
//! callers to mark groups with.

use crate::block::BlockTable;
use sosi_common::{GroupNo, Result, SosiError};

/// Group has been written since the cache was last saved.
pub const BT_SKRKO: i32 = 0;
/// Lowest user column.
pub const BT_MIN_USER: i32 = 1;
/// Highest user column.
pub const BT_MAX_USER: i32 = 26;
/// Group is inside the current reference box.
pub const BT_REFBOX: i32 = 27;
/// Scratch column.
pub const BT_X: i32 = 28;
/// Hit in the last serial search.
pub const BT_SNRSOK: i32 = 29;
/// Hit in the last attribute search.
pub const BT_GISOK: i32 = 30;
/// Hit in the last geographic search.
pub const BT_GEOSOK: i32 = 31;
/// Highest column.
pub const BT_MAX_BT: i32 = 31;

/// Logical operation between two columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnOp {
    /// dst = src
    Copy,
    /// dst = src & dst
    And,
    /// dst = src | dst
    Or,
    /// dst = !src
    Invert,
    /// Swap src and dst.
    Exchange,
}

/// Per-group column flags for one file.
#[derive(Debug, Clone)]
pub struct UsedBitTable {
    words: BlockTable<u32>,
    len: u32,
}

impl Default for UsedBitTable {
    fn default() -> Self {
        Self::new()
    }
}

impl UsedBitTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            words: BlockTable::new("bits", 0),
            len: 0,
        }
    }

    /// Number of groups covered.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Returns true if the table covers no groups.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sets the number of groups covered. New groups start with every bit clear.
    pub fn set_len(&mut self, len: u32) {
        for g in len..self.len {
            if let Ok(w) = self.words.get_mut(g) {
                *w = 0;
            }
        }
        self.len = len;
    }

    /// Releases every block and forgets every group.
    pub fn reset(&mut self) {
        self.words.clear();
        self.len = 0;
    }

    fn check_group(&self, group: GroupNo) -> Result<()> {
        if group >= self.len {
            return Err(SosiError::IllegalGroup(group as i64));
        }
        Ok(())
    }

    fn check_user(col: i32) -> Result<()> {
        if !(BT_MIN_USER..=BT_MAX_USER).contains(&col) {
            return Err(SosiError::IllegalColumn(col));
        }
        Ok(())
    }

    fn check_any(col: i32) -> Result<()> {
        if !(0..=BT_MAX_BT).contains(&col) {
            return Err(SosiError::IllegalColumn(col));
        }
        Ok(())
    }

    /// Returns the whole word of a group.
    pub fn word(&self, group: GroupNo) -> Result<u32> {
        self.check_group(group)?;
        if !self.words.is_allocated(group) {
            return Ok(0);
        }
        self.words.get(group).copied()
    }

    /// Replaces the whole word of a group.
    pub fn set_word(&mut self, group: GroupNo, word: u32) -> Result<()> {
        self.check_group(group)?;
        if word == 0 && !self.words.is_allocated(group) {
            return Ok(());
        }
        *self.words.get_mut_or_create(group) = word;
        Ok(())
    }

    fn write_bit(&mut self, group: GroupNo, col: i32, on: bool) -> Result<()> {
        let mask = 1u32 << col;
        let word = self.word(group)?;
        let new = if on { word | mask } else { word & !mask };
        if new != word {
            self.set_word(group, new)?;
        }
        Ok(())
    }

    /// Sets a user column.
    pub fn set(&mut self, group: GroupNo, col: i32) -> Result<()> {
        Self::check_user(col)?;
        self.write_bit(group, col, true)
    }

    /// Clears a user column.
    pub fn clear(&mut self, group: GroupNo, col: i32) -> Result<()> {
        Self::check_user(col)?;
        self.write_bit(group, col, false)
    }

    /// Reads any column.
    pub fn get(&self, group: GroupNo, col: i32) -> Result<bool> {
        Self::check_any(col)?;
        Ok(self.word(group)? & (1u32 << col) != 0)
    }

    /// Sets any column, system columns included. Engine use.
    pub fn set_system(&mut self, group: GroupNo, col: i32) -> Result<()> {
        Self::check_any(col)?;
        self.write_bit(group, col, true)
    }

    /// Clears any column, system columns included. Engine use.
    pub fn clear_system(&mut self, group: GroupNo, col: i32) -> Result<()> {
        Self::check_any(col)?;
        self.write_bit(group, col, false)
    }

    /// Clears one column, system columns included, for every group.
    pub fn clear_column(&mut self, col: i32) -> Result<()> {
        Self::check_any(col)?;
        let mask = !(1u32 << col);
        for g in 0..self.len {
            if let Ok(w) = self.words.get_mut(g) {
                *w &= mask;
            }
        }
        Ok(())
    }

    /// Clears user columns `from..=to` for every group.
    ///
    /// The range is clamped to the user columns.
    pub fn erase_range(&mut self, from: i32, to: i32) {
        let from = from.clamp(BT_MIN_USER, BT_MAX_USER);
        let to = to.clamp(BT_MIN_USER, BT_MAX_USER);
        if from > to {
            return;
        }
        let mask: u32 = (from..=to).fold(0, |m, c| m | (1u32 << c));
        for g in 0..self.len {
            if let Ok(w) = self.words.get_mut(g) {
                *w &= !mask;
            }
        }
    }

    /// Combines column `src` into column `dst` for every group but the file header.
    ///
    /// `src` is clamped to 0..=31 and `dst` to 0..=26.
    pub fn copy_column(&mut self, src: i32, dst: i32, op: ColumnOp) {
        let src = src.clamp(0, BT_MAX_BT);
        let dst = dst.clamp(0, BT_MAX_USER);
        let src_mask = 1u32 << src;
        let dst_mask = 1u32 << dst;

        for g in 1..self.len {
            let word = if self.words.is_allocated(g) {
                self.words.get(g).copied().unwrap_or(0)
            } else {
                0
            };
            let s = word & src_mask != 0;
            let d = word & dst_mask != 0;

            let (new_d, new_s) = match op {
                ColumnOp::Copy => (s, s),
                ColumnOp::And => (s && d, s),
                ColumnOp::Or => (s || d, s),
                ColumnOp::Invert => (!s, s),
                ColumnOp::Exchange => (s, d),
            };

            let mut new = word;
            new = if new_d { new | dst_mask } else { new & !dst_mask };
            if src != dst {
                new = if new_s { new | src_mask } else { new & !src_mask };
            }
            if new != word {
                *self.words.get_mut_or_create(g) = new;
            }
        }
    }

    /// Number of allocated blocks.
    pub fn allocated_blocks(&self) -> usize {
        self.words.allocated_blocks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(len: u32) -> UsedBitTable {
        let mut t = UsedBitTable::new();
        t.set_len(len);
        t
    }

    #[test]
    fn test_set_get_clear() {
        let mut t = table(10);
        t.set(3, 5).unwrap();
        assert!(t.get(3, 5).unwrap());
        assert!(!t.get(3, 6).unwrap());
        assert!(!t.get(4, 5).unwrap());
        t.clear(3, 5).unwrap();
        assert!(!t.get(3, 5).unwrap());
    }

    #[test]
    fn test_column_ranges() {
        let mut t = table(2);
        assert!(matches!(t.set(0, 0), Err(SosiError::IllegalColumn(0))));
        assert!(matches!(t.set(0, 27), Err(SosiError::IllegalColumn(27))));
        assert!(matches!(t.clear(0, -1), Err(SosiError::IllegalColumn(-1))));
        assert!(t.get(0, 31).is_ok());
        assert!(matches!(t.get(0, 32), Err(SosiError::IllegalColumn(32))));
        assert!(t.set_system(0, BT_GEOSOK).is_ok());
        assert!(t.get(0, BT_GEOSOK).unwrap());
    }

    #[test]
    fn test_illegal_group() {
        let mut t = table(2);
        assert!(matches!(t.set(2, 1), Err(SosiError::IllegalGroup(2))));
        assert!(matches!(t.get(5, 1), Err(SosiError::IllegalGroup(5))));
    }

    #[test]
    fn test_reads_do_not_allocate() {
        let t = table(1000);
        for g in 0..1000 {
            assert!(!t.get(g, 1).unwrap());
        }
        assert_eq!(t.allocated_blocks(), 0);
    }

    #[test]
    fn test_erase_range_clamps() {
        let mut t = table(3);
        for col in 1..=26 {
            t.set(1, col).unwrap();
        }
        t.set_system(1, BT_SKRKO).unwrap();
        t.set_system(1, BT_X).unwrap();

        t.erase_range(-5, 3);
        assert!(!t.get(1, 1).unwrap());
        assert!(!t.get(1, 3).unwrap());
        assert!(t.get(1, 4).unwrap());

        t.erase_range(20, 99);
        assert!(t.get(1, 19).unwrap());
        assert!(!t.get(1, 26).unwrap());

        // System columns survive
        assert!(t.get(1, BT_SKRKO).unwrap());
        assert!(t.get(1, BT_X).unwrap());
    }

    #[test]
    fn test_exchange() {
        let mut t = table(5);
        // (src, dst) patterns per group: (1,0) (0,1) (1,1) (0,0)
        t.set(1, 1).unwrap();
        t.set(2, 2).unwrap();
        t.set(3, 1).unwrap();
        t.set(3, 2).unwrap();

        t.copy_column(1, 2, ColumnOp::Exchange);

        assert_eq!((t.get(1, 1).unwrap(), t.get(1, 2).unwrap()), (false, true));
        assert_eq!((t.get(2, 1).unwrap(), t.get(2, 2).unwrap()), (true, false));
        assert_eq!((t.get(3, 1).unwrap(), t.get(3, 2).unwrap()), (true, true));
        assert_eq!((t.get(4, 1).unwrap(), t.get(4, 2).unwrap()), (false, false));
    }

    #[test]
    fn test_copy_and_or_invert() {
        let mut t = table(5);
        t.set(1, 1).unwrap();
        t.set(2, 2).unwrap();
        t.set(3, 1).unwrap();
        t.set(3, 2).unwrap();

        let mut and = t.clone();
        and.copy_column(1, 2, ColumnOp::And);
        let dst: Vec<bool> = (1..5).map(|g| and.get(g, 2).unwrap()).collect();
        assert_eq!(dst, vec![false, false, true, false]);

        let mut or = t.clone();
        or.copy_column(1, 2, ColumnOp::Or);
        let dst: Vec<bool> = (1..5).map(|g| or.get(g, 2).unwrap()).collect();
        assert_eq!(dst, vec![true, true, true, false]);

        let mut inv = t.clone();
        inv.copy_column(1, 2, ColumnOp::Invert);
        let dst: Vec<bool> = (1..5).map(|g| inv.get(g, 2).unwrap()).collect();
        assert_eq!(dst, vec![false, true, false, true]);

        let mut copy = t.clone();
        copy.copy_column(1, 2, ColumnOp::Copy);
        let dst: Vec<bool> = (1..5).map(|g| copy.get(g, 2).unwrap()).collect();
        assert_eq!(dst, vec![true, false, true, false]);
        // Source column untouched
        let src: Vec<bool> = (1..5).map(|g| copy.get(g, 1).unwrap()).collect();
        assert_eq!(src, vec![true, false, true, false]);
    }

    #[test]
    fn test_copy_skips_header_and_clamps() {
        let mut t = table(3);
        t.set_system(0, BT_GEOSOK).unwrap();
        t.set_system(1, BT_GEOSOK).unwrap();

        t.copy_column(40, 30, ColumnOp::Copy);
        assert!(!t.get(0, BT_MAX_USER).unwrap());
        assert!(t.get(1, BT_MAX_USER).unwrap());
        assert!(!t.get(2, BT_MAX_USER).unwrap());
    }

    #[test]
    fn test_clear_column() {
        let mut t = table(3);
        t.set_system(0, BT_GEOSOK).unwrap();
        t.set_system(2, BT_GEOSOK).unwrap();
        t.set(2, 4).unwrap();
        t.clear_column(BT_GEOSOK).unwrap();
        assert!(!t.get(0, BT_GEOSOK).unwrap());
        assert!(!t.get(2, BT_GEOSOK).unwrap());
        assert!(t.get(2, 4).unwrap());
    }

    #[test]
    fn test_shrink_resets_words() {
        let mut t = table(4);
        t.set(3, 1).unwrap();
        t.set_len(3);
        t.set_len(4);
        assert!(!t.get(3, 1).unwrap());
    }
}
