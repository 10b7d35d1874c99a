//! Serial-number table: serial number to group number.

use crate::block::BlockTable;
use sosi_common::{GroupNo, Result, SerialNo, SosiError, INGEN_GRUPPE, MAX_SERIAL};

/// Maps serial numbers to group numbers. Unassigned serials hold [`INGEN_GRUPPE`].
#[derive(Debug, Clone)]
pub struct SerialTable {
    groups: BlockTable<i32>,
}

impl Default for SerialTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            groups: BlockTable::new("serial", INGEN_GRUPPE),
        }
    }

    fn check(serial: SerialNo) -> Result<()> {
        if serial > MAX_SERIAL {
            return Err(SosiError::IllegalSerial(serial as i64));
        }
        Ok(())
    }

    /// Assigns a serial number to a group.
    pub fn set(&mut self, serial: SerialNo, group: GroupNo) -> Result<()> {
        Self::check(serial)?;
        *self.groups.get_mut_or_create(serial) = group as i32;
        Ok(())
    }

    /// Marks a serial number as unassigned.
    pub fn remove(&mut self, serial: SerialNo) {
        if let Ok(g) = self.groups.get_mut(serial) {
            *g = INGEN_GRUPPE;
        }
    }

    /// Looks up the group of a serial number.
    pub fn get(&self, serial: SerialNo) -> Option<GroupNo> {
        match self.groups.get(serial) {
            Ok(&g) if g != INGEN_GRUPPE => Some(g as GroupNo),
            _ => None,
        }
    }

    /// Returns the raw stored value, [`INGEN_GRUPPE`] when unassigned.
    pub fn raw(&self, serial: SerialNo) -> i32 {
        self.groups.get(serial).copied().unwrap_or(INGEN_GRUPPE)
    }

    /// Releases every block.
    pub fn clear(&mut self) {
        self.groups.clear();
    }

    /// Number of allocated blocks.
    pub fn allocated_blocks(&self) -> usize {
        self.groups.allocated_blocks()
    }
}
