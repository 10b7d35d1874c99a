//! The session: open files, the shared record cache and the group cursor.
//!
//! Attribute and coordinate operations act on the selected group. Edits are kept
//! in the cursor until the group is written, which happens explicitly through
//! [`Session::write_group`] or implicitly when another group is selected.

use crate::file::{CloseMode, FileHandle};
use crate::header::FileHeader;
use crate::lines::{canonicalize, parse_references, AttributeLineBuffer};
use crate::ring::{GroupBody, PointInfo, RecordCache};
use crate::scan::{first_line, parse_serial};
use sosi_common::names::split_name;
use sosi_common::{
    BoundingBox, GroupName, GroupNo, IndexConfig, InfoFlags, Layer, NgisMode, Result, SerialNo,
    SosiError, SosiName, HOYDE_MANGLER, MAX_SERIAL, NY_SOSI_ST, SLUTT_OY, START_OY,
};
use sosi_table::{ColumnOp, GroupEntry, BT_GEOSOK, BT_MAX_BT, BT_SKRKO};
use std::collections::HashSet;
use std::path::Path;

/// Index of an open file within a session.
pub type FileId = usize;

/// A group in one of the session's files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupRef {
    pub file: FileId,
    pub group: GroupNo,
}

impl GroupRef {
    pub fn new(file: FileId, group: GroupNo) -> Self {
        Self { file, group }
    }
}

/// Cursor position saved by [`Session::save_cursor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedCursor(Option<GroupRef>);

impl SavedCursor {
    /// The saved group, if any.
    pub fn group(&self) -> Option<GroupRef> {
        self.0
    }

    pub(crate) fn remapped(self, f: impl Fn(GroupRef) -> Option<GroupRef>) -> Self {
        Self(self.0.and_then(f))
    }
}

/// Working copy of the selected group.
pub(crate) struct CurrentGroup {
    pub(crate) at: GroupRef,
    pub(crate) entry: GroupEntry,
    pub(crate) lines: AttributeLineBuffer,
    pub(crate) east: Vec<f64>,
    pub(crate) north: Vec<f64>,
    pub(crate) point_info: Vec<PointInfo>,
    pub(crate) point_attr: Vec<u8>,
    /// Serial the group was selected with.
    pub(crate) serial: Option<SerialNo>,
    pub(crate) dirty: bool,
}

impl CurrentGroup {
    fn body(&self) -> GroupBody {
        GroupBody {
            attr_text: self.lines.as_bytes().to_vec(),
            east: self.east.clone(),
            north: self.north.clone(),
            point_info: self.point_info.clone(),
            point_attr: self.point_attr.clone(),
        }
    }

    fn line_serial(&self) -> Option<SerialNo> {
        self.lines.line(1).ok().and_then(|l| parse_serial(split_name(l).1))
    }

    fn check_point(&self, n: usize) -> Result<usize> {
        if n == 0 || n > self.east.len() {
            return Err(SosiError::IllegalPoint(n));
        }
        Ok(n - 1)
    }

    /// Recomputes the info flags and object type from the lines and points.
    fn derive(&mut self) {
        let mut reference = false;
        let mut island = false;
        for line in self.lines.lines() {
            if matches!(
                split_name(line).0.and_then(SosiName::lookup),
                Some(SosiName::Ref1 | SosiName::Ref2)
            ) {
                reference = true;
                island |= line.contains('(');
            }
        }

        let info = &mut self.entry.info;
        info.set(InfoFlags::REF, reference);
        info.set(InfoFlags::OY_REF, island);
        info.set(InfoFlags::NGIS, self.lines.find_name("..NGIS-FLAGG", 2).is_some());
        info.set(InfoFlags::KP, self.point_info.iter().any(|p| p.kp != 0));
        info.set(InfoFlags::PINFO, self.point_info.iter().any(PointInfo::has_pinfo));
        if !self.point_info.iter().any(PointInfo::has_height) {
            info.set(InfoFlags::NAH, false);
            info.set(InfoFlags::NAD, false);
        } else if !info.has(InfoFlags::NAD) {
            info.set(InfoFlags::NAH, true);
        }

        let objtype = self
            .lines
            .value_of("..OBJTYPE")
            .and_then(|v| v.split_whitespace().next())
            .unwrap_or_default()
            .to_string();
        self.entry.set_objtype(&objtype);

        if let Some(name) = self.lines.group_name() {
            self.entry.name_code = name.code();
        }
        self.entry.line_count = self.lines.len() as u32;
        self.entry.coord_count = self.east.len() as u32;
    }
}

/// Open files, the shared record cache and the cursor.
pub struct Session {
    pub(crate) config: IndexConfig,
    pub(crate) files: Vec<Option<FileHandle>>,
    pub(crate) cache: RecordCache,
    pub(crate) current: Option<CurrentGroup>,
}

impl Session {
    /// Creates a session with no files open.
    pub fn new(config: IndexConfig) -> Self {
        let cache = RecordCache::new(config.fsync_enabled);
        Self {
            config,
            files: Vec::new(),
            cache,
            current: None,
        }
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Opens a source file and returns its id.
    pub fn open_file(&mut self, path: impl AsRef<Path>, layer: Layer) -> Result<FileId> {
        let handle = FileHandle::open(path.as_ref(), layer, &self.config, &self.cache)?;
        self.files.push(Some(handle));
        Ok(self.files.len() - 1)
    }

    /// Closes a file.
    ///
    /// When saving, a dirty cursor in that file is written first and groups queued
    /// in [`BT_SKRKO`] are written to the source.
    pub fn close_file(&mut self, file: FileId, mode: CloseMode) -> Result<()> {
        let selected_here = self.current.as_ref().is_some_and(|c| c.at.file == file);
        if mode == CloseMode::Save {
            if selected_here {
                self.write_back()?;
            }
            let f = self.file(file)?;
            let queued = f.pending_writes();
            if f.layer().is_writable() && queued > 0 {
                tracing::debug!(file, queued, "Writing queued groups to source");
                self.export(file)?;
            }
        }
        if selected_here {
            self.current = None;
        }
        let handle = self
            .files
            .get_mut(file)
            .and_then(Option::take)
            .ok_or(SosiError::UnknownFile(file))?;
        handle.close(mode, &self.cache)
    }

    /// Closes every open file.
    pub fn close_all(&mut self, mode: CloseMode) -> Result<()> {
        for id in 0..self.files.len() {
            if self.files[id].is_some() {
                self.close_file(id, mode)?;
            }
        }
        Ok(())
    }

    /// Returns an open file.
    pub fn file(&self, file: FileId) -> Result<&FileHandle> {
        self.files
            .get(file)
            .and_then(Option::as_ref)
            .ok_or(SosiError::UnknownFile(file))
    }

    pub(crate) fn file_mut(&mut self, file: FileId) -> Result<&mut FileHandle> {
        self.files
            .get_mut(file)
            .and_then(Option::as_mut)
            .ok_or(SosiError::UnknownFile(file))
    }

    /// Ids of the open files.
    pub fn file_ids(&self) -> impl Iterator<Item = FileId> + '_ {
        self.files
            .iter()
            .enumerate()
            .filter_map(|(id, f)| f.as_ref().map(|_| id))
    }

    /// The selected group.
    pub fn current(&self) -> Option<GroupRef> {
        self.current.as_ref().map(|c| c.at)
    }

    /// Returns true if the selected group has unwritten edits.
    pub fn is_dirty(&self) -> bool {
        self.current.as_ref().is_some_and(|c| c.dirty)
    }

    fn cursor(&self) -> Result<&CurrentGroup> {
        self.current.as_ref().ok_or(SosiError::NoCurrentGroup)
    }

    /// Cursor for editing; refused on background files and read-only groups.
    fn cursor_edit(&mut self) -> Result<&mut CurrentGroup> {
        let at = self.cursor()?.at;
        if !self.file(at.file)?.layer().is_writable() {
            return Err(SosiError::ReadOnly);
        }
        let cur = self.current.as_mut().ok_or(SosiError::NoCurrentGroup)?;
        if cur.entry.info.has(InfoFlags::READ_ONLY) {
            return Err(SosiError::ReadOnly);
        }
        Ok(cur)
    }

    fn write_back(&mut self) -> Result<()> {
        if self.is_dirty() {
            self.write_group()?;
        }
        Ok(())
    }

    /// Selects a group, writing back a dirty cursor first.
    ///
    /// Returns the group name, or `None` for a deleted group or a flag-deleted NGIS
    /// group in normal NGIS mode. The cursor is cleared in that case.
    pub fn select(&mut self, at: GroupRef) -> Result<Option<GroupName>> {
        self.write_back()?;

        let file = self.file(at.file)?;
        let entry = file.entry(at.group)?.clone();
        let hidden = !entry.is_live()
            || (self.config.ngis_mode == NgisMode::Normal
                && entry.info.has(InfoFlags::NGIS | InfoFlags::SLETTA));
        if hidden {
            self.current = None;
            return Ok(None);
        }

        let body = file.read_body(at.group, &self.cache)?;
        let lines = AttributeLineBuffer::from_text(body.attr_text);
        let name = entry.name();
        let mut cur = CurrentGroup {
            at,
            entry,
            lines,
            east: body.east,
            north: body.north,
            point_info: body.point_info,
            point_attr: body.point_attr,
            serial: None,
            dirty: false,
        };
        cur.serial = cur.line_serial();
        self.current = Some(cur);
        Ok(name)
    }

    /// Writes the selected group to the record cache and updates every table.
    pub fn write_group(&mut self) -> Result<()> {
        let Session {
            files,
            cache,
            current,
            ..
        } = self;
        let cur = current.as_mut().ok_or(SosiError::NoCurrentGroup)?;
        let at = cur.at;
        let file = files
            .get_mut(at.file)
            .and_then(Option::as_mut)
            .ok_or(SosiError::UnknownFile(at.file))?;
        if !file.layer().is_writable() {
            return Err(SosiError::ReadOnly);
        }
        if cur.lines.group_name().is_none() {
            return Err(SosiError::InvalidName(cur.lines.line(1).unwrap_or_default().to_string()));
        }

        cur.derive();
        let body = cur.body();
        let lens = body.lens();
        cur.entry.attr_len = lens.attr_len;
        cur.entry.point_attr_len = lens.point_attr_len;

        // Ring links, geo leaf and priority belong to the table
        {
            let stored = file.groups.get(at.group)?;
            let mut entry = cur.entry.clone();
            entry.ring_offset = stored.ring_offset;
            entry.ring_prev = stored.ring_prev;
            entry.ring_next = stored.ring_next;
            entry.geo = stored.geo;
            entry.priority = stored.priority;
            *file.groups.get_mut(at.group)? = entry;
        }
        let offset = file.place_body(at.group, lens)?;
        cache.write(file.ring_path(), offset, &body)?;

        let serial = cur.line_serial();
        if let Some(old) = cur.serial.filter(|old| Some(*old) != serial) {
            if file.serials.get(old) == Some(at.group) {
                file.serials.remove(old);
            }
        }
        if let Some(snr) = serial {
            file.assign_serial(snr, at.group)?;
        }

        file.update_geo(at.group, &cur.east, &cur.north)?;
        if cur.entry.info.has(InfoFlags::REF) {
            file.widen_for_refs(at.group, &parse_references(cur.lines.lines()))?;
        }
        file.bits.set_system(at.group, BT_SKRKO)?;
        if at.group == 0 {
            file.set_header(FileHeader::from_lines(cur.lines.lines()));
        }

        cur.entry = file.groups.get(at.group)?.clone();
        cur.serial = serial;
        cur.dirty = false;
        tracing::debug!(file = at.file, group = at.group, offset, "Group written");
        Ok(())
    }

    /// Creates a group at the end of a file and selects it.
    ///
    /// Unknown names fall back to `.LINJE`. The group gets serial `max_serial + 1`.
    pub fn new_group(&mut self, file: FileId, name: &str) -> Result<GroupRef> {
        self.write_back()?;
        let max_groups = self.config.max_groups;
        let f = self.file_mut(file)?;
        if !f.layer().is_writable() {
            return Err(SosiError::ReadOnly);
        }
        if f.group_count() >= max_groups {
            return Err(SosiError::TooManyGroups(max_groups));
        }

        let name = GroupName::from_name(&canonicalize(name))
            .filter(|g| !matches!(g, GroupName::Hode | GroupName::Slutt))
            .unwrap_or(GroupName::Linje);
        let serial = f.max_serial() + 1;
        if serial > MAX_SERIAL {
            return Err(SosiError::IllegalSerial(serial as i64));
        }

        let header = f.header().clone();
        let mut lines = vec![first_line(name, Some(serial))];
        let mut info = InfoFlags::empty();
        if let Some(layer) = &header.ngis_layer {
            lines.push(format!("..NGIS-FLAGG N {}", layer));
            info.set(InfoFlags::NGIS, true);
        }

        let entry = GroupEntry {
            name_code: name.code(),
            line_count: lines.len() as u32,
            info,
            source_offset: NY_SOSI_ST,
            unit: header.unit,
            unit_height: header.unit_height,
            unit_depth: header.unit_depth,
            ..Default::default()
        };
        let group = f.groups.push(entry.clone());
        f.bits.set_len(f.groups.len());
        f.assign_serial(serial, group)?;

        let at = GroupRef::new(file, group);
        self.current = Some(CurrentGroup {
            at,
            entry,
            lines: AttributeLineBuffer::from_lines(&lines),
            east: Vec::new(),
            north: Vec::new(),
            point_info: Vec::new(),
            point_attr: Vec::new(),
            serial: Some(serial),
            dirty: true,
        });
        tracing::debug!(file, group, serial, name = %name, "New group");
        Ok(at)
    }

    /// Deletes the selected group and clears the cursor.
    ///
    /// Groups with no NGIS flag, flag `N`, or never saved to the source are removed
    /// outright. Flags `V`, `E` and `S` keep the group marked as deleted, with its
    /// flag set to `S` so the deletion is reported in the source.
    pub fn delete_group(&mut self) -> Result<()> {
        let cur = self.cursor_edit()?;
        let at = cur.at;
        if at.group == 0 {
            return Err(SosiError::IllegalGroup(0));
        }
        if cur.entry.info.has(InfoFlags::SLETTA) {
            return Ok(());
        }

        let flag = cur
            .lines
            .value_of("..NGIS-FLAGG")
            .and_then(|v| v.chars().next())
            .map(|c| c.to_ascii_uppercase());
        let is_new = cur.entry.source_offset == NY_SOSI_ST;
        let permanent = is_new || matches!(flag, None | Some('N'));
        if !permanent && !matches!(flag, Some('V' | 'E' | 'S')) {
            return Err(SosiError::ReadOnly);
        }

        let is_line = cur.entry.name().is_some_and(GroupName::is_line);
        if is_line && !cur.east.is_empty() && self.is_referenced()? {
            return Err(SosiError::Referenced);
        }

        let serial = self.cursor()?.line_serial();
        if !permanent {
            if let Some(cur) = self.current.as_mut() {
                if let Some(n) = cur.lines.find_name("..NGIS-FLAGG", 2) {
                    let layer: Vec<&str> = split_name(cur.lines.line(n)?).1.split_whitespace().skip(1).collect();
                    let text = if layer.is_empty() {
                        "..NGIS-FLAGG S".to_string()
                    } else {
                        format!("..NGIS-FLAGG S {}", layer.join(" "))
                    };
                    cur.lines.replace_line(n, &text)?;
                }
                cur.entry.info.set(InfoFlags::SLETTA, true);
            }
            self.write_group()?;
        }

        let f = self.file_mut(at.file)?;
        if let Some(snr) = serial {
            if f.serials.get(snr) == Some(at.group) {
                f.serials.remove(snr);
            }
        }
        f.remove_geo(at.group)?;
        f.bits.set_word(at.group, 0)?;
        f.bits.set_system(at.group, BT_SKRKO)?;
        let entry = f.groups.get_mut(at.group)?;
        if permanent {
            entry.line_count = 0;
            entry.coord_count = 0;
        }
        entry.info.set(InfoFlags::SLETTA, true);

        self.current = None;
        tracing::debug!(file = at.file, group = at.group, permanent, "Group deleted");
        Ok(())
    }

    /// Returns true if a polygon in the same file refers to the selected group.
    ///
    /// Candidates are the `.FLATE` groups whose box covers the group's first point.
    fn is_referenced(&mut self) -> Result<bool> {
        let cur = self.cursor()?;
        let at = cur.at;
        let (Some(serial), Some(&east), Some(&north)) = (cur.serial, cur.east.first(), cur.north.first()) else {
            return Ok(false);
        };

        let region = BoundingBox::new(east - 0.1, north - 0.1, east + 0.1, north + 0.1);
        let file = self.file(at.file)?;
        let candidates: Vec<GroupNo> = file
            .geo()
            .query(region)
            .filter(|&g| g != at.group)
            .filter(|&g| {
                file.entry(g).is_ok_and(|e| {
                    e.name() == Some(GroupName::Flate) && e.info.has(InfoFlags::REF)
                })
            })
            .collect();
        if candidates.is_empty() {
            return Ok(false);
        }

        self.with_cursor_kept(|s| {
            for g in candidates {
                if s.select(GroupRef::new(at.file, g))?.is_none() {
                    continue;
                }
                let refs = s.references()?;
                if refs
                    .iter()
                    .any(|r| *r != START_OY && *r != SLUTT_OY && r.unsigned_abs() == serial as u64)
                {
                    return Ok(true);
                }
            }
            Ok(false)
        })
    }

    /// Writes back a dirty cursor and remembers the selection.
    pub fn save_cursor(&mut self) -> Result<SavedCursor> {
        self.write_back()?;
        Ok(SavedCursor(self.current()))
    }

    /// Returns to a saved selection.
    pub fn restore_cursor(&mut self, saved: SavedCursor) -> Result<()> {
        match saved.0 {
            Some(at) if self.current() == Some(at) => Ok(()),
            Some(at) => self.select(at).map(|_| ()),
            None => {
                self.write_back()?;
                self.current = None;
                Ok(())
            }
        }
    }

    /// Runs `body` and returns to the current selection afterwards, also when
    /// `body` fails. The body's error wins over a failed restore.
    pub(crate) fn with_cursor_kept<T>(&mut self, body: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let saved = self.save_cursor()?;
        let result = body(self);
        let restored = self.restore_cursor(saved);
        let value = result?;
        restored?;
        Ok(value)
    }

    /// Group number of a serial, without moving the cursor.
    pub fn find_serial(&self, file: FileId, serial: SerialNo) -> Result<Option<GroupNo>> {
        Ok(self.file(file)?.group_of(serial))
    }

    // Attribute lines

    /// The selected group's attribute lines.
    pub fn lines(&self) -> Result<&AttributeLineBuffer> {
        Ok(&self.cursor()?.lines)
    }

    /// Number of attribute lines.
    pub fn line_count(&self) -> Result<usize> {
        Ok(self.cursor()?.lines.len())
    }

    /// Attribute line `n`, 1-based.
    pub fn line(&self, n: usize) -> Result<&str> {
        self.cursor()?.lines.line(n)
    }

    /// Replaces attribute line `n`.
    ///
    /// Line 1 keeps the group's serial number whatever text is given.
    pub fn set_line(&mut self, n: usize, text: &str) -> Result<()> {
        let at = self.cursor()?.at;
        let header = {
            let file = self.file(at.file)?;
            (at.group == 0 && file.group_count() > 1).then(|| file.header().clone())
        };
        let cur = self.cursor_edit()?;

        let change = if n == 1 {
            let line = canonicalize(text);
            let name = split_name(&line).0.and_then(GroupName::from_name);
            match name {
                Some(name) => {
                    let serial = if name == GroupName::Hode { None } else { cur.line_serial() };
                    cur.lines.set_line(1, &first_line(name, serial), None)?
                }
                None => return Err(SosiError::InvalidName(line)),
            }
        } else {
            cur.lines.set_line(n, text, header.as_ref())?
        };

        if let Some(objtype) = change.objtype {
            cur.entry.set_objtype(&objtype);
        }
        if change.reference {
            cur.entry.info.set(InfoFlags::REF, true);
            if change.island {
                cur.entry.info.set(InfoFlags::OY_REF, true);
            }
        }
        cur.dirty = true;
        Ok(())
    }

    /// Appends an empty attribute line and returns its number.
    pub fn append_line(&mut self) -> Result<usize> {
        let cur = self.cursor_edit()?;
        cur.dirty = true;
        Ok(cur.lines.append_line())
    }

    /// Inserts `count` empty attribute lines before line `at`.
    pub fn insert_lines(&mut self, at: usize, count: usize) -> Result<()> {
        let cur = self.cursor_edit()?;
        cur.lines.insert_lines(at, count)?;
        cur.dirty = true;
        Ok(())
    }

    /// Deletes attribute lines. Line 1 is kept. Returns the number removed.
    pub fn delete_lines(&mut self, from: usize, count: usize) -> Result<usize> {
        let cur = self.cursor_edit()?;
        let removed = cur.lines.delete_lines(from, count)?;
        cur.dirty = true;
        Ok(removed)
    }

    /// Serial number of the selected group.
    pub fn serial(&self) -> Result<Option<SerialNo>> {
        Ok(self.cursor()?.line_serial())
    }

    /// Changes the serial number of the selected group.
    pub fn set_serial(&mut self, serial: SerialNo) -> Result<()> {
        if serial > MAX_SERIAL {
            return Err(SosiError::IllegalSerial(serial as i64));
        }
        let cur = self.cursor_edit()?;
        if cur.at.group == 0 {
            return Err(SosiError::IllegalGroup(0));
        }
        let name = cur
            .lines
            .group_name()
            .ok_or_else(|| SosiError::InvalidName(cur.lines.line(1).unwrap_or_default().to_string()))?;
        cur.lines.replace_line(1, &first_line(name, Some(serial)))?;
        cur.dirty = true;
        Ok(())
    }

    /// Serial numbers referenced by the selected group.
    ///
    /// Island starts and ends appear as [`START_OY`] and [`SLUTT_OY`].
    pub fn references(&self) -> Result<Vec<i64>> {
        Ok(parse_references(self.cursor()?.lines.lines()))
    }

    // Coordinates

    /// Number of coordinates of the selected group.
    pub fn coord_count(&self) -> Result<usize> {
        Ok(self.cursor()?.east.len())
    }

    /// Point `n` (1-based) as `(east, north)`.
    pub fn coord(&self, n: usize) -> Result<(f64, f64)> {
        let cur = self.cursor()?;
        let i = cur.check_point(n)?;
        Ok((cur.east[i], cur.north[i]))
    }

    pub fn set_coord(&mut self, n: usize, east: f64, north: f64) -> Result<()> {
        let cur = self.cursor_edit()?;
        let i = cur.check_point(n)?;
        cur.east[i] = east;
        cur.north[i] = north;
        cur.dirty = true;
        Ok(())
    }

    /// Height or depth of point `n`.
    pub fn height(&self, n: usize) -> Result<Option<f64>> {
        let cur = self.cursor()?;
        let p = cur.point_info[cur.check_point(n)?];
        Ok(p.has_height().then_some(p.height))
    }

    pub fn set_height(&mut self, n: usize, height: Option<f64>) -> Result<()> {
        let cur = self.cursor_edit()?;
        let i = cur.check_point(n)?;
        cur.point_info[i].height = height.unwrap_or(HOYDE_MANGLER);
        cur.dirty = true;
        Ok(())
    }

    /// Knot marker of point `n`, 0 for none.
    pub fn knot(&self, n: usize) -> Result<i16> {
        let cur = self.cursor()?;
        Ok(cur.point_info[cur.check_point(n)?].kp)
    }

    pub fn set_knot(&mut self, n: usize, kp: i16) -> Result<()> {
        let cur = self.cursor_edit()?;
        let i = cur.check_point(n)?;
        cur.point_info[i].kp = kp;
        cur.dirty = true;
        Ok(())
    }

    /// Point-attribute text of point `n`.
    pub fn point_info_text(&self, n: usize) -> Result<Option<&str>> {
        let cur = self.cursor()?;
        Ok(cur.point_info[cur.check_point(n)?].text(&cur.point_attr))
    }

    /// Appends an empty point and returns its number.
    pub fn append_coord(&mut self) -> Result<usize> {
        let cur = self.cursor_edit()?;
        cur.east.push(0.0);
        cur.north.push(0.0);
        cur.point_info.push(PointInfo::default());
        cur.dirty = true;
        Ok(cur.east.len())
    }

    /// Inserts `count` empty points before point `at`. `at == count + 1` appends.
    pub fn insert_coords(&mut self, at: usize, count: usize) -> Result<()> {
        let cur = self.cursor_edit()?;
        if at == 0 || at > cur.east.len() + 1 {
            return Err(SosiError::IllegalPoint(at));
        }
        let i = at - 1;
        cur.east.splice(i..i, std::iter::repeat(0.0).take(count));
        cur.north.splice(i..i, std::iter::repeat(0.0).take(count));
        cur.point_info.splice(i..i, std::iter::repeat(PointInfo::default()).take(count));
        cur.dirty = true;
        Ok(())
    }

    /// Deletes up to `count` points from point `from`. Returns the number removed.
    pub fn delete_coords(&mut self, from: usize, count: usize) -> Result<usize> {
        let cur = self.cursor_edit()?;
        let i = cur.check_point(from)?;
        let end = (i + count).min(cur.east.len());
        cur.east.drain(i..end);
        cur.north.drain(i..end);
        cur.point_info.drain(i..end);
        cur.dirty = true;
        Ok(end - i)
    }

    // Used bits and priorities

    pub fn set_bit(&mut self, at: GroupRef, col: i32) -> Result<()> {
        self.file_mut(at.file)?.bits.set(at.group, col)
    }

    pub fn clear_bit(&mut self, at: GroupRef, col: i32) -> Result<()> {
        self.file_mut(at.file)?.bits.clear(at.group, col)
    }

    pub fn bit(&self, at: GroupRef, col: i32) -> Result<bool> {
        self.file(at.file)?.bits.get(at.group, col)
    }

    /// Combines two columns for every group of every open file.
    pub fn copy_column(&mut self, src: i32, dst: i32, op: ColumnOp) {
        for file in self.files.iter_mut().flatten() {
            file.bits.copy_column(src, dst, op);
        }
    }

    /// Clears user columns `from..=to` in every open file.
    pub fn erase_bits(&mut self, from: i32, to: i32) {
        for file in self.files.iter_mut().flatten() {
            file.bits.erase_range(from, to);
        }
    }

    pub fn set_priority(&mut self, at: GroupRef, col: i32) -> Result<()> {
        self.file_mut(at.file)?.groups.set_priority(at.group, col)
    }

    pub fn clear_priority(&mut self, at: GroupRef, col: i32) -> Result<()> {
        self.file_mut(at.file)?.groups.clear_priority(at.group, col)
    }

    pub fn priority(&self, at: GroupRef, col: i32) -> Result<bool> {
        self.file(at.file)?.groups.priority(at.group, col)
    }

    /// Clears one priority column in every open file.
    pub fn erase_priority(&mut self, col: i32) -> Result<()> {
        for file in self.files.iter_mut().flatten() {
            file.groups.erase_priority(col)?;
        }
        Ok(())
    }

    /// Clears every priority column in every open file.
    pub fn erase_all_priority(&mut self) -> Result<()> {
        for file in self.files.iter_mut().flatten() {
            file.groups.erase_all_priority()?;
        }
        Ok(())
    }

    /// Sets or clears column `col` on the selected group.
    ///
    /// With `mark_referenced` enabled, groups it references are marked too, and so
    /// on recursively. The selection is restored afterwards. Returns the number of
    /// groups marked.
    pub fn mark_group(&mut self, col: i32, on: bool) -> Result<usize> {
        if !(0..=BT_MAX_BT).contains(&col) {
            return Err(SosiError::IllegalColumn(col));
        }
        let at = self.cursor()?.at;
        self.with_cursor_kept(|s| {
            let mut visited = HashSet::new();
            s.mark_recursive(at, col, on, &mut visited)
        })
    }

    fn mark_recursive(&mut self, at: GroupRef, col: i32, on: bool, visited: &mut HashSet<GroupRef>) -> Result<usize> {
        if !visited.insert(at) {
            return Ok(0);
        }
        let file = self.file_mut(at.file)?;
        if on {
            file.bits.set_system(at.group, col)?;
        } else {
            file.bits.clear_system(at.group, col)?;
        }
        let mut count = 1;

        let has_refs = file.entry(at.group)?.info.has(InfoFlags::REF);
        if !(self.config.mark_referenced && has_refs) {
            return Ok(count);
        }
        if self.current() != Some(at) && self.select(at)?.is_none() {
            return Ok(count);
        }
        for r in self.references()? {
            if r == START_OY || r == SLUTT_OY {
                continue;
            }
            let Ok(serial) = SerialNo::try_from(r.unsigned_abs()) else {
                continue;
            };
            if let Some(group) = self.find_serial(at.file, serial)? {
                count += self.mark_recursive(GroupRef::new(at.file, group), col, on, visited)?;
            }
        }
        Ok(count)
    }

    /// Marks every group whose box overlaps `region` in [`BT_GEOSOK`].
    ///
    /// The column is cleared first. Returns the number of groups marked.
    pub fn mark_region(&mut self, file: FileId, region: BoundingBox) -> Result<usize> {
        let f = self.file_mut(file)?;
        f.bits.clear_column(BT_GEOSOK)?;
        let hits: Vec<GroupNo> = f.geo.query(region).collect();
        for g in &hits {
            f.bits.set_system(*g, BT_GEOSOK)?;
        }
        Ok(hits.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const SOURCE: &str = "\
.HODE
..TRANSPAR
...ORIGO-NØ 0 0
...ENHET 1
.KURVE 1:
..OBJTYPE Veg
..NØ
0 0
10 10
.FLATE 2:
..OBJTYPE Bygning
..REF :1 (:3)
..NØ
5 5
.KURVE 3:
..NØ
20 20
.SLUTT
";

    fn open(dir: &Path) -> (Session, FileId) {
        let path = dir.join("test.sos");
        fs::write(&path, SOURCE).unwrap();
        let mut session = Session::new(IndexConfig::default());
        let id = session.open_file(&path, Layer::Foreground).unwrap();
        (session, id)
    }

    #[test]
    fn test_select_and_lines() {
        let dir = tempfile::tempdir().unwrap();
        let (mut s, f) = open(dir.path());
        assert_eq!(s.file(f).unwrap().group_count(), 4);
        assert_eq!(s.select(GroupRef::new(f, 1)).unwrap(), Some(GroupName::Kurve));
        assert_eq!(s.line(1).unwrap(), ".KURVE 1:");
        assert_eq!(s.serial().unwrap(), Some(1));
        assert_eq!(s.coord_count().unwrap(), 2);
        assert_eq!(s.coord(2).unwrap(), (10.0, 10.0));
        assert!(matches!(s.coord(3), Err(SosiError::IllegalPoint(3))));
    }

    #[test]
    fn test_no_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let (mut s, _) = open(dir.path());
        assert!(matches!(s.line(1), Err(SosiError::NoCurrentGroup)));
        assert!(matches!(s.write_group(), Err(SosiError::NoCurrentGroup)));
        assert!(matches!(s.file(9), Err(SosiError::UnknownFile(9))));
    }

    #[test]
    fn test_references() {
        let dir = tempfile::tempdir().unwrap();
        let (mut s, f) = open(dir.path());
        s.select(GroupRef::new(f, 2)).unwrap();
        assert_eq!(s.references().unwrap(), vec![1, START_OY, 3, SLUTT_OY]);
    }

    #[test]
    fn test_set_line_keeps_serial() {
        let dir = tempfile::tempdir().unwrap();
        let (mut s, f) = open(dir.path());
        s.select(GroupRef::new(f, 1)).unwrap();
        s.set_line(1, ".linje 99:").unwrap();
        assert_eq!(s.line(1).unwrap(), ".LINJE 1:");
        assert!(s.is_dirty());
    }

    #[test]
    fn test_set_serial_moves_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let (mut s, f) = open(dir.path());
        s.select(GroupRef::new(f, 3)).unwrap();
        s.set_serial(40).unwrap();
        s.write_group().unwrap();
        assert_eq!(s.find_serial(f, 3).unwrap(), None);
        assert_eq!(s.find_serial(f, 40).unwrap(), Some(3));
        assert_eq!(s.file(f).unwrap().max_serial(), 40);
    }

    #[test]
    fn test_new_group() {
        let dir = tempfile::tempdir().unwrap();
        let (mut s, f) = open(dir.path());
        let at = s.new_group(f, ".ukjent").unwrap();
        assert_eq!(at.group, 4);
        assert_eq!(s.line(1).unwrap(), ".LINJE 4:");
        assert_eq!(s.find_serial(f, 4).unwrap(), Some(4));

        let n = s.append_coord().unwrap();
        s.set_coord(n, 100.0, 200.0).unwrap();
        assert_eq!(s.height(n).unwrap(), None);
        s.write_group().unwrap();

        s.select(GroupRef::new(f, 1)).unwrap();
        s.select(at).unwrap();
        assert_eq!(s.coord(1).unwrap(), (100.0, 200.0));
        assert!(s.file(f).unwrap().entry(4).unwrap().geo.is_some());
    }

    #[test]
    fn test_coordinate_edits() {
        let dir = tempfile::tempdir().unwrap();
        let (mut s, f) = open(dir.path());
        s.select(GroupRef::new(f, 1)).unwrap();

        s.insert_coords(2, 2).unwrap();
        assert_eq!(s.coord_count().unwrap(), 4);
        assert_eq!(s.coord(2).unwrap(), (0.0, 0.0));
        assert_eq!(s.coord(4).unwrap(), (10.0, 10.0));
        assert_eq!(s.height(2).unwrap(), None);
        assert_eq!(s.knot(2).unwrap(), 0);
        assert_eq!(s.point_info_text(2).unwrap(), None);

        s.set_height(2, Some(12.5)).unwrap();
        s.set_knot(3, 1).unwrap();
        assert_eq!(s.height(2).unwrap(), Some(12.5));
        assert_eq!(s.knot(3).unwrap(), 1);

        assert_eq!(s.delete_coords(2, 10).unwrap(), 3);
        assert_eq!(s.coord_count().unwrap(), 1);
        assert!(matches!(s.insert_coords(3, 1), Err(SosiError::IllegalPoint(3))));
    }

    #[test]
    fn test_delete_group_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let (mut s, f) = open(dir.path());
        s.select(GroupRef::new(f, 3)).unwrap();
        s.set_bit(GroupRef::new(f, 3), 5).unwrap();
        // .KURVE 3 is referenced by the polygon, but its first point is outside it
        s.delete_group().unwrap();

        assert!(s.current().is_none());
        assert_eq!(s.find_serial(f, 3).unwrap(), None);
        let e = s.file(f).unwrap().entry(3).unwrap();
        assert!(!e.is_live());
        assert!(e.info.has(InfoFlags::SLETTA));
        assert!(e.geo.is_none());
        assert!(!s.bit(GroupRef::new(f, 3), 5).unwrap());
        assert_eq!(s.select(GroupRef::new(f, 3)).unwrap(), None);
    }

    #[test]
    fn test_delete_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (mut s, f) = open(dir.path());
        s.select(GroupRef::new(f, 0)).unwrap();
        assert!(matches!(s.delete_group(), Err(SosiError::IllegalGroup(0))));

        // .KURVE 1 starts inside the polygon that references it
        s.select(GroupRef::new(f, 1)).unwrap();
        assert!(matches!(s.delete_group(), Err(SosiError::Referenced)));
        assert_eq!(s.current(), Some(GroupRef::new(f, 1)));
    }

    #[test]
    fn test_delete_refused_for_reversed_reference() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rev.sos");
        fs::write(
            &path,
            ".HODE\n...ENHET 1\n.KURVE 1:\n..NØ\n0 0\n10 10\n.FLATE 2:\n..REF -:1\n..NØ\n5 5\n.SLUTT\n",
        )
        .unwrap();
        let mut s = Session::new(IndexConfig::default());
        let f = s.open_file(&path, Layer::Foreground).unwrap();

        s.select(GroupRef::new(f, 2)).unwrap();
        assert_eq!(s.references().unwrap(), vec![-1]);
        s.select(GroupRef::new(f, 1)).unwrap();
        assert!(matches!(s.delete_group(), Err(SosiError::Referenced)));
        assert_eq!(s.current(), Some(GroupRef::new(f, 1)));
    }

    #[test]
    fn test_cursor_kept_when_body_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (mut s, f) = open(dir.path());
        s.select(GroupRef::new(f, 1)).unwrap();

        let result: Result<()> = s.with_cursor_kept(|s| {
            s.select(GroupRef::new(f, 2))?;
            Err(SosiError::Internal("stop".to_string()))
        });
        assert!(matches!(result, Err(SosiError::Internal(_))));
        assert_eq!(s.current(), Some(GroupRef::new(f, 1)));
    }

    #[test]
    fn test_background_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bak.sos");
        fs::write(&path, SOURCE).unwrap();
        let mut s = Session::new(IndexConfig::default());
        let f = s.open_file(&path, Layer::Background).unwrap();
        s.select(GroupRef::new(f, 1)).unwrap();
        assert!(matches!(s.set_line(2, "..OBJTYPE X"), Err(SosiError::ReadOnly)));
        assert!(matches!(s.new_group(f, ".PUNKT"), Err(SosiError::ReadOnly)));
    }

    #[test]
    fn test_mark_group_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let (mut s, f) = open(dir.path());
        s.select(GroupRef::new(f, 2)).unwrap();
        assert_eq!(s.mark_group(7, true).unwrap(), 3);
        assert_eq!(s.current(), Some(GroupRef::new(f, 2)));
        for g in 1..=3 {
            assert!(s.bit(GroupRef::new(f, g), 7).unwrap());
        }
        assert!(!s.bit(GroupRef::new(f, 0), 7).unwrap());
        assert!(matches!(s.mark_group(32, true), Err(SosiError::IllegalColumn(32))));
    }

    #[test]
    fn test_mark_region() {
        let dir = tempfile::tempdir().unwrap();
        let (mut s, f) = open(dir.path());
        let n = s.mark_region(f, BoundingBox::new(15.0, 15.0, 30.0, 30.0)).unwrap();
        assert_eq!(n, 1);
        assert!(s.bit(GroupRef::new(f, 3), BT_GEOSOK).unwrap());
        let n = s.mark_region(f, BoundingBox::new(-1.0, -1.0, 6.0, 6.0)).unwrap();
        assert_eq!(n, 2);
        assert!(!s.bit(GroupRef::new(f, 3), BT_GEOSOK).unwrap());
    }

    #[test]
    fn test_priority_survives_write() {
        let dir = tempfile::tempdir().unwrap();
        let (mut s, f) = open(dir.path());
        let at = GroupRef::new(f, 1);
        s.select(at).unwrap();
        s.set_priority(at, 100).unwrap();
        s.set_line(2, "..OBJTYPE Sti").unwrap();
        s.write_group().unwrap();
        assert!(s.priority(at, 100).unwrap());
        assert_eq!(s.file(f).unwrap().entry(1).unwrap().objtype, "Sti");
    }
}
