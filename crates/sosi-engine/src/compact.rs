//! Compaction of one file's tables and record cache.

use crate::file::FileHandle;
use crate::persist::RB_FILE;
use crate::ring::RecordCache;
use crate::session::{FileId, GroupRef, Session};
use sosi_common::{GroupNo, Result, SosiError};
use sosi_geo::GeoTree;
use sosi_table::{GroupTable, SerialTable, UsedBitTable, BT_SKRKO};
use std::path::Path;

/// Outcome of a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactStats {
    /// Groups kept.
    pub groups: u32,
    /// Dead slots dropped.
    pub dropped: u32,
    /// Record-cache size after compaction.
    pub ring_bytes: u64,
}

/// Tables built from the live groups, not yet installed.
struct Compacted {
    groups: GroupTable,
    serials: SerialTable,
    bits: UsedBitTable,
    geo: GeoTree,
    remap: Vec<Option<GroupNo>>,
    ring_bytes: u64,
    last: Option<GroupNo>,
}

/// Copies the live groups of `file` densely into `tmp_path`.
///
/// A dropped group still queued for the source leaves the header group queued,
/// so the deletion reaches the source on the next save.
fn copy_live(file: &FileHandle, cache: &RecordCache, tmp_path: &Path) -> Result<Compacted> {
    cache.reset(tmp_path)?;

    let mut remap: Vec<Option<GroupNo>> = vec![None; file.group_count() as usize];
    let mut groups = GroupTable::new();
    let mut bits = UsedBitTable::new();
    let mut geo = GeoTree::new();
    let mut offset = 0u64;
    let mut last: Option<GroupNo> = None;
    let mut queued_drop = false;

    for (old, entry) in file.groups.iter() {
        if !entry.is_live() {
            queued_drop |= file.bits.get(old, BT_SKRKO)?;
            continue;
        }
        let body = file.read_body(old, cache)?;
        let lens = body.lens();
        let bbox = entry.geo.and_then(|h| file.geo.get(h)).map(|(_, b)| b);

        let mut moved = entry.clone();
        moved.ring_offset = offset;
        moved.ring_prev = last;
        moved.ring_next = None;
        moved.geo = None;
        let new = groups.push(moved);
        if let Some(prev) = last {
            groups.get_mut(prev)?.ring_next = Some(new);
        }
        if let Some(b) = bbox {
            groups.get_mut(new)?.geo = Some(geo.insert(new, b));
        }
        bits.set_len(groups.len());
        bits.set_word(new, file.bits.word(old)?)?;

        cache.write(tmp_path, offset, &body)?;
        offset += lens.total();
        last = Some(new);
        remap[old as usize] = Some(new);
    }
    if queued_drop && !groups.is_empty() {
        bits.set_system(0, BT_SKRKO)?;
    }

    let mut serials = SerialTable::new();
    for snr in 0..=file.max_serial() {
        if let Some(new) = file.serials.get(snr).and_then(|g| remap.get(g as usize).copied().flatten()) {
            serials.set(snr, new)?;
        }
    }

    Ok(Compacted {
        groups,
        serials,
        bits,
        geo,
        remap,
        ring_bytes: offset,
        last,
    })
}

impl Session {
    /// Drops dead group slots and rewrites the record cache contiguously.
    ///
    /// Live groups are renumbered densely in their old order. Serial numbers, used
    /// bits, priorities and boxes follow their groups. The selection is kept,
    /// renumbered, unless it pointed at a dropped slot. When compaction fails the
    /// file keeps its old tables and the selection is restored unchanged.
    pub fn compact(&mut self, file_id: FileId) -> Result<CompactStats> {
        let saved = self.save_cursor()?;
        let kept = self.current.take();

        let (stats, remap) = match self.compact_tables(file_id) {
            Ok(done) => done,
            Err(e) => {
                self.current = kept;
                return Err(e);
            }
        };
        let saved = saved.remapped(|at| {
            if at.file != file_id {
                return Some(at);
            }
            remap
                .get(at.group as usize)
                .copied()
                .flatten()
                .map(|group| GroupRef::new(file_id, group))
        });
        self.restore_cursor(saved)?;
        Ok(stats)
    }

    fn compact_tables(&mut self, file_id: FileId) -> Result<(CompactStats, Vec<Option<GroupNo>>)> {
        let Session { files, cache, .. } = self;
        let file = files
            .get_mut(file_id)
            .and_then(Option::as_mut)
            .ok_or(SosiError::UnknownFile(file_id))?;

        let tmp_path = file.cache_dir().join(format!("{}.tmp", RB_FILE));
        let compacted = match copy_live(file, cache, &tmp_path) {
            Ok(c) => c,
            Err(e) => {
                cache.close_path(&tmp_path);
                if let Err(rm) = std::fs::remove_file(&tmp_path) {
                    tracing::warn!(path = %tmp_path.display(), error = %rm, "Could not remove partial record cache");
                }
                return Err(e);
            }
        };

        cache.close();
        std::fs::rename(&tmp_path, file.ring_path())?;

        let Compacted {
            groups,
            serials,
            bits,
            geo,
            remap,
            ring_bytes,
            last,
        } = compacted;
        let stats = CompactStats {
            groups: groups.len(),
            dropped: file.group_count() - groups.len(),
            ring_bytes,
        };
        file.replace_tables(groups, serials, bits, geo);
        let admin = file.admin_mut();
        admin.next_free_rb = ring_bytes;
        admin.last_rb_group = last;
        file.flush()?;

        tracing::info!(
            path = %file.path().display(),
            groups = stats.groups,
            dropped = stats.dropped,
            ring_bytes = stats.ring_bytes,
            "Compaction complete"
        );
        Ok((stats, remap))
    }
}
