//! One open SOSI source file with its tables, geo tree and cache bookkeeping.

use crate::header::FileHeader;
use crate::lines::{outer_references, parse_references, AttributeLineBuffer};
use crate::persist;
use crate::ring::{compute_length, GroupBody, RecordCache, RecordLens};
use crate::scan::{ScannedGroup, Scanner};
use sosi_common::{
    AdminRecord, BoundingBox, Fingerprint, GroupName, GroupNo, IndexConfig, InfoFlags, Layer, Result,
    SerialNo, SosiError,
};
use sosi_geo::GeoTree;
use sosi_table::{GroupEntry, GroupTable, SerialTable, UsedBitTable, BT_SKRKO};
use std::path::{Path, PathBuf};

/// Lifecycle of a file's index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Unloaded,
    Validating,
    Rebuilding,
    Loaded,
}

/// What happens to the cache when a file is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Persist every table.
    Save,
    /// Delete the cache directory's files.
    Discard,
}

/// An open source file.
pub struct FileHandle {
    path: PathBuf,
    cache_dir: PathBuf,
    ring_path: PathBuf,
    layer: Layer,
    admin: AdminRecord,
    header: FileHeader,
    pub(crate) groups: GroupTable,
    pub(crate) serials: SerialTable,
    pub(crate) bits: UsedBitTable,
    pub(crate) geo: GeoTree,
    state: IndexState,
    history: Vec<IndexState>,
    override_active: bool,
    fsync_enabled: bool,
    max_groups: u32,
}

/// Bounding box of a coordinate list widened by one unit, `None` without coordinates.
pub fn group_box(east: &[f64], north: &[f64], unit: f64) -> Option<BoundingBox> {
    if east.is_empty() {
        return None;
    }
    let mut b = BoundingBox::empty();
    for (e, n) in east.iter().zip(north) {
        b.extend(*e, *n);
    }
    Some(b.expanded(unit))
}

impl FileHandle {
    /// Opens a source file, loading its cache or rebuilding it from the source.
    pub fn open(path: &Path, layer: Layer, config: &IndexConfig, cache: &RecordCache) -> Result<Self> {
        let live = Fingerprint::of(path)?;
        let cache_dir = config.cache_dir(path);
        let ring_path = persist::cache_file(&cache_dir, persist::RB_FILE);

        let mut file = Self {
            path: path.to_path_buf(),
            cache_dir,
            ring_path,
            layer,
            admin: AdminRecord::new(live, layer.flags()),
            header: FileHeader::default(),
            groups: GroupTable::new(),
            serials: SerialTable::new(),
            bits: UsedBitTable::new(),
            geo: GeoTree::new(),
            state: IndexState::Unloaded,
            history: vec![IndexState::Unloaded],
            override_active: config.has_override(),
            fsync_enabled: config.fsync_enabled,
            max_groups: config.max_groups,
        };

        file.transition(IndexState::Validating);
        let stored = if file.override_active {
            tracing::info!(path = %path.display(), "Index path override active, cache not trusted");
            None
        } else {
            match persist::validate(&file.cache_dir, &live) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::info!(path = %path.display(), reason = %e, "Cache invalid");
                    None
                }
            }
        };

        let loaded = match stored {
            Some(record) => match file.load(record, cache) {
                Ok(()) => true,
                Err(e) if e.is_consistency() || matches!(e, SosiError::FileError { .. }) => {
                    tracing::warn!(path = %path.display(), error = %e, "Cache unreadable");
                    false
                }
                Err(e) => return Err(e),
            },
            None => false,
        };
        if !loaded {
            file.rebuild(live, cache)?;
        }

        file.admin.idx_open = true;
        file.admin.pid = std::process::id();
        file.admin.seal();
        persist::write_admin(&file.cache_dir, &file.admin, file.fsync_enabled)?;

        file.transition(IndexState::Loaded);
        Ok(file)
    }

    fn transition(&mut self, state: IndexState) {
        tracing::info!(path = %self.path.display(), from = ?self.state, to = ?state, "Index state");
        self.state = state;
        self.history.push(state);
    }

    fn reset_tables(&mut self) {
        self.groups.clear();
        self.serials.clear();
        self.bits.reset();
        self.geo.clear();
    }

    fn load(&mut self, record: AdminRecord, cache: &RecordCache) -> Result<()> {
        let ring_len = std::fs::metadata(&self.ring_path)?.len();
        if ring_len < record.next_free_rb {
            return Err(SosiError::ShortTransfer {
                offset: 0,
                expected: record.next_free_rb as usize,
                actual: ring_len as usize,
            });
        }

        let count = record.group_count;
        self.groups = persist::read_groups(&self.cache_dir, count)?;
        self.serials = persist::read_serials(&self.cache_dir, record.max_serial)?;
        self.bits = persist::read_bits(&self.cache_dir, count)?;
        let boxes = persist::read_boxes(&self.cache_dir, count)?;

        self.geo.clear();
        for (g, b) in boxes.into_iter().enumerate() {
            if let Some(b) = b {
                let handle = self.geo.insert(g as GroupNo, b);
                self.groups.get_mut(g as GroupNo)?.geo = Some(handle);
            }
        }

        self.admin = record;
        self.admin.layer_flags = self.layer.flags();
        self.refresh_header(cache)?;
        tracing::info!(path = %self.path.display(), groups = count, "Cache loaded");
        Ok(())
    }

    fn rebuild(&mut self, live: Fingerprint, cache: &RecordCache) -> Result<()> {
        self.transition(IndexState::Rebuilding);
        std::fs::create_dir_all(&self.cache_dir)?;
        self.reset_tables();
        self.admin = AdminRecord::new(live, self.layer.flags());
        cache.reset(&self.ring_path)?;

        let data = std::fs::read(&self.path).map_err(|e| SosiError::FileError {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut scanner = Scanner::new(&data);

        let head = scanner
            .next_group(&FileHeader::default())
            .filter(|g| g.name == GroupName::Hode)
            .ok_or_else(|| SosiError::Parse {
                line: 1,
                reason: "source does not start with .HODE".to_string(),
            })?;
        self.header = FileHeader::from_lines(head.lines.iter().map(String::as_str));
        self.append_scanned(&head, cache)?;

        // Polygon boxes need every referenced group indexed first
        let header = self.header.clone();
        let mut with_refs = Vec::new();
        while let Some(scanned) = scanner.next_group(&header) {
            let group = self.append_scanned(&scanned, cache)?;
            if scanned.info.has(InfoFlags::REF) {
                with_refs.push((group, parse_references(scanned.lines.iter().map(String::as_str))));
            }
        }
        for (group, refs) in with_refs {
            self.widen_for_refs(group, &refs)?;
        }

        self.save_tables()?;
        tracing::info!(
            path = %self.path.display(),
            groups = self.groups.len(),
            max_serial = self.admin.max_serial,
            "Rebuild complete"
        );
        Ok(())
    }

    fn append_scanned(&mut self, scanned: &ScannedGroup, cache: &RecordCache) -> Result<GroupNo> {
        if self.groups.len() >= self.max_groups {
            return Err(SosiError::TooManyGroups(self.max_groups));
        }
        let body = scanned.body();
        let lens = body.lens();

        let mut entry = GroupEntry {
            name_code: scanned.name.code(),
            line_count: scanned.lines.len() as u32,
            coord_count: lens.coord_count,
            info: scanned.info,
            source_offset: scanned.source_offset,
            attr_len: lens.attr_len,
            point_attr_len: lens.point_attr_len,
            unit: scanned.unit,
            unit_height: scanned.unit_height,
            unit_depth: scanned.unit_depth,
            ..Default::default()
        };
        entry.set_objtype(&scanned.objtype);

        let group = self.groups.push(entry);
        self.bits.set_len(self.groups.len());
        self.place_at_end(group, lens)?;
        let offset = self.groups.get(group)?.ring_offset;
        cache.write(&self.ring_path, offset, &body)?;

        if let Some(snr) = scanned.serial {
            if let Some(other) = self.serials.get(snr) {
                tracing::warn!(serial = snr, first = other, second = group, "Duplicate serial number");
            }
            self.assign_serial(snr, group)?;
        }
        self.update_geo(group, &body.east, &body.north)?;
        Ok(group)
    }

    /// Re-reads the file header from group 0.
    pub(crate) fn refresh_header(&mut self, cache: &RecordCache) -> Result<()> {
        if self.groups.is_empty() {
            self.header = FileHeader::default();
            return Ok(());
        }
        let body = self.read_body(0, cache)?;
        let lines = AttributeLineBuffer::from_text(body.attr_text);
        self.header = FileHeader::from_lines(lines.lines());
        Ok(())
    }

    /// Reads the stored body of a group.
    pub(crate) fn read_body(&self, group: GroupNo, cache: &RecordCache) -> Result<GroupBody> {
        let entry = self.groups.get(group)?;
        if entry.is_new_in_ring() {
            return Ok(GroupBody::default());
        }
        let lens = RecordLens {
            attr_len: entry.attr_len,
            coord_count: entry.coord_count,
            point_attr_len: entry.point_attr_len,
        };
        cache.read(&self.ring_path, entry.ring_offset, lens)
    }

    /// Links a group after the last one in record-cache order and reserves its space.
    pub(crate) fn place_at_end(&mut self, group: GroupNo, lens: RecordLens) -> Result<()> {
        let offset = self.admin.next_free_rb;
        let last = self.admin.last_rb_group;
        if let Some(last) = last {
            self.groups.get_mut(last)?.ring_next = Some(group);
        }
        let entry = self.groups.get_mut(group)?;
        entry.ring_offset = offset;
        entry.ring_prev = last;
        entry.ring_next = None;
        self.admin.last_rb_group = Some(group);
        self.admin.next_free_rb = offset + lens.total();
        Ok(())
    }

    /// Removes a group from the record-cache order.
    pub(crate) fn unlink(&mut self, group: GroupNo) -> Result<()> {
        let (prev, next) = {
            let e = self.groups.get(group)?;
            (e.ring_prev, e.ring_next)
        };
        if let Some(p) = prev {
            self.groups.get_mut(p)?.ring_next = next;
        }
        match next {
            Some(n) => self.groups.get_mut(n)?.ring_prev = prev,
            None => self.admin.last_rb_group = prev,
        }
        let e = self.groups.get_mut(group)?;
        e.ring_prev = None;
        e.ring_next = None;
        Ok(())
    }

    /// Chooses where a group body of `lens` goes and returns the offset.
    ///
    /// New groups are appended. The last group in record-cache order is rewritten
    /// in place and may grow. Any other group stays in place unless it would
    /// overrun the next body, in which case it is moved to the end.
    pub(crate) fn place_body(&mut self, group: GroupNo, lens: RecordLens) -> Result<u64> {
        let len = compute_length(lens.attr_len, lens.coord_count, lens.point_attr_len);
        let (offset, next, is_new) = {
            let e = self.groups.get(group)?;
            (e.ring_offset, e.ring_next, e.is_new_in_ring())
        };

        if is_new {
            self.place_at_end(group, lens)?;
        } else {
            match next {
                None => self.admin.next_free_rb = offset + len,
                Some(n) => {
                    let next_offset = self.groups.get(n)?.ring_offset;
                    if offset + len > next_offset {
                        tracing::debug!(group, from = offset, "Moving group to end of record cache");
                        self.unlink(group)?;
                        self.place_at_end(group, lens)?;
                    }
                }
            }
        }
        Ok(self.groups.get(group)?.ring_offset)
    }

    /// Maps a serial to a group and tracks the highest serial.
    pub(crate) fn assign_serial(&mut self, serial: SerialNo, group: GroupNo) -> Result<()> {
        self.serials.set(serial, group)?;
        self.admin.max_serial = self.admin.max_serial.max(serial);
        Ok(())
    }

    /// Recomputes a group's box and moves its geo leaf if the box changed.
    pub(crate) fn update_geo(&mut self, group: GroupNo, east: &[f64], north: &[f64]) -> Result<()> {
        let unit = self.groups.get(group)?.unit;
        let new_box = group_box(east, north, unit);
        let old = self.groups.get(group)?.geo;

        let current = old.and_then(|h| self.geo.get(h)).map(|(_, b)| b);
        if current == new_box && (old.is_some() == new_box.is_some()) {
            return Ok(());
        }
        if let Some(h) = old {
            self.geo.remove(h);
        }
        let handle = new_box.map(|b| self.geo.insert(group, b));
        self.groups.get_mut(group)?.geo = handle;
        Ok(())
    }

    /// Widens a group's box to cover the groups of its outer boundary.
    pub(crate) fn widen_for_refs(&mut self, group: GroupNo, refs: &[i64]) -> Result<()> {
        let old = self.groups.get(group)?.geo;
        let own = old.and_then(|h| self.geo.get(h)).map(|(_, b)| b);
        let mut widened = own;
        for r in outer_references(refs) {
            let Ok(serial) = SerialNo::try_from(r.unsigned_abs()) else {
                continue;
            };
            let Some(other) = self.serials.get(serial).filter(|g| *g != group) else {
                continue;
            };
            let Some(b) = self.groups.get(other)?.geo.and_then(|h| self.geo.get(h)).map(|(_, b)| b) else {
                continue;
            };
            match widened.as_mut() {
                Some(w) => w.union(&b),
                None => widened = Some(b),
            }
        }
        if widened == own {
            return Ok(());
        }
        if let Some(h) = old {
            self.geo.remove(h);
        }
        let handle = widened.map(|b| self.geo.insert(group, b));
        self.groups.get_mut(group)?.geo = handle;
        Ok(())
    }

    /// Removes a group's geo leaf.
    pub(crate) fn remove_geo(&mut self, group: GroupNo) -> Result<()> {
        if let Some(h) = self.groups.get_mut(group)?.geo.take() {
            self.geo.remove(h);
        }
        Ok(())
    }

    fn save_tables(&mut self) -> Result<()> {
        let dir = &self.cache_dir;
        let fsync = self.fsync_enabled;
        persist::write_groups(dir, &self.groups, fsync)?;
        persist::write_serials(dir, &self.serials, self.admin.max_serial, fsync)?;
        persist::write_bits(dir, &self.bits, fsync)?;
        let boxes = self
            .groups
            .iter()
            .map(|(_, e)| e.geo.and_then(|h| self.geo.get(h)).map(|(_, b)| b));
        persist::write_boxes(dir, boxes, fsync)?;

        self.admin.group_count = self.groups.len();
        self.admin.seal();
        persist::write_admin(dir, &self.admin, fsync)
    }

    /// Refreshes the stored source fingerprint after the source was rewritten.
    pub(crate) fn refresh_fingerprint(&mut self) -> Result<()> {
        self.admin.fingerprint = Fingerprint::of(&self.path)?;
        self.admin.seal();
        Ok(())
    }

    /// Replaces every table, used by compaction.
    pub(crate) fn replace_tables(&mut self, groups: GroupTable, serials: SerialTable, bits: UsedBitTable, geo: GeoTree) {
        self.groups = groups;
        self.serials = serials;
        self.bits = bits;
        self.geo = geo;
    }

    pub(crate) fn admin_mut(&mut self) -> &mut AdminRecord {
        &mut self.admin
    }

    /// Writes every table and the admin record without closing.
    pub fn flush(&mut self) -> Result<()> {
        if self.override_active {
            return Ok(());
        }
        self.save_tables()
    }

    /// Closes the file, persisting or discarding its cache.
    pub fn close(mut self, mode: CloseMode, cache: &RecordCache) -> Result<()> {
        cache.close_path(&self.ring_path);
        match mode {
            CloseMode::Save if !self.override_active => {
                self.admin.idx_open = false;
                self.save_tables()?;
                tracing::info!(path = %self.path.display(), "Cache saved");
            }
            _ => {
                persist::delete_cache(&self.cache_dir)?;
                tracing::info!(path = %self.path.display(), "Cache discarded");
            }
        }
        self.transition(IndexState::Unloaded);
        Ok(())
    }

    /// Path of the source file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the cache files.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Path of the record-cache file.
    pub fn ring_path(&self) -> &Path {
        &self.ring_path
    }

    pub fn layer(&self) -> Layer {
        self.layer
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub(crate) fn set_header(&mut self, header: FileHeader) {
        self.header = header;
    }

    /// Current index state.
    pub fn state(&self) -> IndexState {
        self.state
    }

    /// Every state the index has passed through since open.
    pub fn state_history(&self) -> &[IndexState] {
        &self.history
    }

    /// Returns true if the last open rebuilt the cache from the source.
    pub fn was_rebuilt(&self) -> bool {
        self.history.contains(&IndexState::Rebuilding)
    }

    /// Number of groups, dead slots included.
    pub fn group_count(&self) -> u32 {
        self.groups.len()
    }

    /// Highest serial number in use.
    pub fn max_serial(&self) -> SerialNo {
        self.admin.max_serial
    }

    /// Group-table entry of a group.
    pub fn entry(&self, group: GroupNo) -> Result<&GroupEntry> {
        self.groups.get(group)
    }

    /// Group of a serial number.
    pub fn group_of(&self, serial: SerialNo) -> Option<GroupNo> {
        self.serials.get(serial)
    }

    /// Number of groups changed since the source was last written.
    pub fn pending_writes(&self) -> u32 {
        (0..self.groups.len())
            .filter(|&g| self.bits.get(g, BT_SKRKO).unwrap_or(false))
            .count() as u32
    }

    pub fn bits(&self) -> &UsedBitTable {
        &self.bits
    }

    pub fn geo(&self) -> &GeoTree {
        &self.geo
    }

    pub fn admin(&self) -> &AdminRecord {
        &self.admin
    }

    pub(crate) fn fsync_enabled(&self) -> bool {
        self.fsync_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_box() {
        assert_eq!(group_box(&[], &[], 1.0), None);
        let b = group_box(&[10.0, 20.0], &[100.0, 50.0], 0.5).unwrap();
        assert_eq!(b, BoundingBox::new(9.5, 49.5, 20.5, 100.5));
    }
}
