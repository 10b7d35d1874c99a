//! Group table: one fixed-size entry per group, plus priority columns.

use crate::block::BlockTable;
use sosi_common::{GroupName, GroupNo, InfoFlags, Result, SosiError, NY_RB_ST, NY_SOSI_ST};
use sosi_geo::LeafHandle;

/// Number of priority columns per group.
pub const PRIORITY_COLUMNS: i32 = 128;

/// Maximum stored length of the object type.
pub const OBJTYPE_LEN: usize = 32;

/// Per-group bookkeeping kept in the group table.
///
/// Layout (116 bytes):
/// - name_code: 2 bytes
/// - info: 2 bytes
/// - line_count: 4 bytes
/// - coord_count: 4 bytes
/// - priority: 16 bytes
/// - source_offset: 8 bytes
/// - ring_offset: 8 bytes
/// - ring_prev: 4 bytes (-1 for none)
/// - ring_next: 4 bytes (-1 for none)
/// - attr_len: 4 bytes
/// - point_attr_len: 4 bytes
/// - unit: 8 bytes
/// - unit_height: 8 bytes
/// - unit_depth: 8 bytes
/// - objtype: 32 bytes (NUL padded)
///
/// The geo handle is not persisted. It is recreated when the tree is rebuilt on load.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupEntry {
    /// Group-start name code, see [`GroupName`].
    pub name_code: u16,
    /// Number of attribute lines (`ngi`). Zero marks a dead slot.
    pub line_count: u32,
    /// Number of coordinates (`nko`).
    pub coord_count: u32,
    /// Info flags.
    pub info: InfoFlags,
    /// Priority columns.
    pub priority: [u32; 4],
    /// Start of the group in the source file, [`NY_SOSI_ST`] for new groups.
    pub source_offset: u64,
    /// Start of the group body in the record cache, [`NY_RB_ST`] if never written.
    pub ring_offset: u64,
    /// Previous group in record-cache order.
    pub ring_prev: Option<GroupNo>,
    /// Next group in record-cache order.
    pub ring_next: Option<GroupNo>,
    /// Length of the attribute text including NUL terminators.
    pub attr_len: u32,
    /// Length of the point-attribute text.
    pub point_attr_len: u32,
    /// Plane unit.
    pub unit: f64,
    /// Height unit.
    pub unit_height: f64,
    /// Depth unit.
    pub unit_depth: f64,
    /// Object type, at most [`OBJTYPE_LEN`] bytes.
    pub objtype: String,
    /// Leaf in the geo tree.
    pub geo: Option<LeafHandle>,
}

impl Default for GroupEntry {
    fn default() -> Self {
        Self {
            name_code: GroupName::Slutt.code(),
            line_count: 0,
            coord_count: 0,
            info: InfoFlags::empty(),
            priority: [0; 4],
            source_offset: NY_SOSI_ST,
            ring_offset: NY_RB_ST,
            ring_prev: None,
            ring_next: None,
            attr_len: 0,
            point_attr_len: 0,
            unit: 1.0,
            unit_height: 1.0,
            unit_depth: 1.0,
            objtype: String::new(),
            geo: None,
        }
    }
}

fn opt_to_i32(g: Option<GroupNo>) -> i32 {
    g.map(|g| g as i32).unwrap_or(-1)
}

fn i32_to_opt(v: i32) -> Option<GroupNo> {
    (v >= 0).then_some(v as GroupNo)
}

impl GroupEntry {
    /// Size of a serialized entry in bytes.
    pub const SIZE: usize = 116;

    /// Returns the group name, if the code is known.
    pub fn name(&self) -> Option<GroupName> {
        GroupName::from_code(self.name_code)
    }

    /// Returns true if the slot holds a group.
    pub fn is_live(&self) -> bool {
        self.line_count > 0
    }

    /// Returns true if the body has never been written to the record cache.
    pub fn is_new_in_ring(&self) -> bool {
        self.ring_offset == NY_RB_ST
    }

    /// Stores an object type, truncated to [`OBJTYPE_LEN`] bytes on a char boundary.
    pub fn set_objtype(&mut self, objtype: &str) {
        let mut end = objtype.len().min(OBJTYPE_LEN);
        while !objtype.is_char_boundary(end) {
            end -= 1;
        }
        self.objtype = objtype[..end].to_string();
    }

    /// Serializes the entry to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.name_code.to_le_bytes());
        buf[2..4].copy_from_slice(&self.info.bits().to_le_bytes());
        buf[4..8].copy_from_slice(&self.line_count.to_le_bytes());
        buf[8..12].copy_from_slice(&self.coord_count.to_le_bytes());
        for (i, word) in self.priority.iter().enumerate() {
            buf[12 + i * 4..16 + i * 4].copy_from_slice(&word.to_le_bytes());
        }
        buf[28..36].copy_from_slice(&self.source_offset.to_le_bytes());
        buf[36..44].copy_from_slice(&self.ring_offset.to_le_bytes());
        buf[44..48].copy_from_slice(&opt_to_i32(self.ring_prev).to_le_bytes());
        buf[48..52].copy_from_slice(&opt_to_i32(self.ring_next).to_le_bytes());
        buf[52..56].copy_from_slice(&self.attr_len.to_le_bytes());
        buf[56..60].copy_from_slice(&self.point_attr_len.to_le_bytes());
        buf[60..68].copy_from_slice(&self.unit.to_le_bytes());
        buf[68..76].copy_from_slice(&self.unit_height.to_le_bytes());
        buf[76..84].copy_from_slice(&self.unit_depth.to_le_bytes());
        let objtype = self.objtype.as_bytes();
        let n = objtype.len().min(OBJTYPE_LEN);
        buf[84..84 + n].copy_from_slice(&objtype[..n]);
        buf
    }

    /// Deserializes an entry from bytes.
    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        let u16_at = |o: usize| u16::from_le_bytes([buf[o], buf[o + 1]]);
        let u32_at = |o: usize| u32::from_le_bytes([buf[o], buf[o + 1], buf[o + 2], buf[o + 3]]);
        let u64_at = |o: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[o..o + 8]);
            u64::from_le_bytes(b)
        };

        let raw = &buf[84..84 + OBJTYPE_LEN];
        let end = raw.iter().position(|b| *b == 0).unwrap_or(OBJTYPE_LEN);

        Self {
            name_code: u16_at(0),
            info: InfoFlags(u16_at(2)),
            line_count: u32_at(4),
            coord_count: u32_at(8),
            priority: [u32_at(12), u32_at(16), u32_at(20), u32_at(24)],
            source_offset: u64_at(28),
            ring_offset: u64_at(36),
            ring_prev: i32_to_opt(u32_at(44) as i32),
            ring_next: i32_to_opt(u32_at(48) as i32),
            attr_len: u32_at(52),
            point_attr_len: u32_at(56),
            unit: f64::from_bits(u64_at(60)),
            unit_height: f64::from_bits(u64_at(68)),
            unit_depth: f64::from_bits(u64_at(76)),
            objtype: String::from_utf8_lossy(&raw[..end]).into_owned(),
            geo: None,
        }
    }
}

/// Dense table of [`GroupEntry`] indexed by group number.
#[derive(Debug, Clone)]
pub struct GroupTable {
    entries: BlockTable<GroupEntry>,
    len: u32,
}

impl Default for GroupTable {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            entries: BlockTable::new("group", GroupEntry::default()),
            len: 0,
        }
    }

    /// Number of groups, dead slots included.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Returns true if the table has no groups.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends an entry and returns its group number.
    pub fn push(&mut self, entry: GroupEntry) -> GroupNo {
        let group = self.len;
        *self.entries.get_mut_or_create(group) = entry;
        self.len += 1;
        group
    }

    /// Returns the entry of a group.
    pub fn get(&self, group: GroupNo) -> Result<&GroupEntry> {
        if group >= self.len {
            return Err(SosiError::IllegalGroup(group as i64));
        }
        self.entries.get(group)
    }

    /// Returns the entry of a group for modification.
    pub fn get_mut(&mut self, group: GroupNo) -> Result<&mut GroupEntry> {
        if group >= self.len {
            return Err(SosiError::IllegalGroup(group as i64));
        }
        self.entries.get_mut(group)
    }

    /// Iterates over `(group, entry)` in group order.
    pub fn iter(&self) -> impl Iterator<Item = (GroupNo, &GroupEntry)> + '_ {
        (0..self.len).filter_map(move |g| self.entries.get(g).ok().map(|e| (g, e)))
    }

    /// Releases every block.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.len = 0;
    }

    /// Number of allocated blocks.
    pub fn allocated_blocks(&self) -> usize {
        self.entries.allocated_blocks()
    }

    fn check_priority(col: i32) -> Result<(usize, u32)> {
        if !(0..PRIORITY_COLUMNS).contains(&col) {
            return Err(SosiError::IllegalColumn(col));
        }
        Ok(((col / 32) as usize, 1u32 << (col % 32)))
    }

    /// Sets a priority column on a group.
    pub fn set_priority(&mut self, group: GroupNo, col: i32) -> Result<()> {
        let (word, mask) = Self::check_priority(col)?;
        self.get_mut(group)?.priority[word] |= mask;
        Ok(())
    }

    /// Clears a priority column on a group.
    pub fn clear_priority(&mut self, group: GroupNo, col: i32) -> Result<()> {
        let (word, mask) = Self::check_priority(col)?;
        self.get_mut(group)?.priority[word] &= !mask;
        Ok(())
    }

    /// Reads a priority column of a group.
    pub fn priority(&self, group: GroupNo, col: i32) -> Result<bool> {
        let (word, mask) = Self::check_priority(col)?;
        Ok(self.get(group)?.priority[word] & mask != 0)
    }

    /// Clears one priority column on every group.
    pub fn erase_priority(&mut self, col: i32) -> Result<()> {
        let (word, mask) = Self::check_priority(col)?;
        for g in 0..self.len {
            self.entries.get_mut(g)?.priority[word] &= !mask;
        }
        Ok(())
    }

    /// Clears every priority column on every group.
    pub fn erase_all_priority(&mut self) -> Result<()> {
        for g in 0..self.len {
            self.entries.get_mut(g)?.priority = [0; 4];
        }
        Ok(())
    }
}
