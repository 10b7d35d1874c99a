//! Writing a file's groups back to its SOSI source.

use crate::file::FileHandle;
use crate::header::FileHeader;
use crate::lines::AttributeLineBuffer;
use crate::ring::{GroupBody, RecordCache};
use crate::session::{FileId, Session};
use sosi_common::{GroupNo, InfoFlags, Result, SosiError};
use sosi_table::{GroupEntry, BT_SKRKO};
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Renders one group as SOSI text.
///
/// Coordinates are written in whole units relative to the header origin. Runs of
/// points with and without height get their own `..NØH`/`..NØD` and `..NØ` blocks.
fn render_group(entry: &GroupEntry, body: &GroupBody, header: &FileHeader) -> String {
    let mut out = String::new();
    for line in AttributeLineBuffer::from_text(body.attr_text.clone()).lines() {
        out.push_str(line);
        out.push('\n');
    }

    let depth = entry.info.has(InfoFlags::NAD);
    let unit_z = if depth { entry.unit_depth } else { entry.unit_height };
    let mut block: Option<bool> = None;
    for (i, point) in body.point_info.iter().enumerate() {
        let with_z = point.has_height();
        if block != Some(with_z) {
            out.push_str(match (with_z, depth) {
                (false, _) => "..NØ\n",
                (true, false) => "..NØH\n",
                (true, true) => "..NØD\n",
            });
            block = Some(with_z);
        }

        let n = ((body.north[i] - header.origin_north) / entry.unit).round() as i64;
        let e = ((body.east[i] - header.origin_east) / entry.unit).round() as i64;
        out.push_str(&format!("{} {}", n, e));
        if with_z {
            out.push_str(&format!(" {}", (point.height / unit_z).round() as i64));
        }
        if point.kp != 0 {
            out.push_str(&format!(" ...KP {}", point.kp));
        }
        if let Some(text) = point.text(&body.point_attr) {
            out.push(' ');
            out.push_str(text);
        }
        out.push('\n');
    }
    out
}

impl Session {
    /// Rewrites the source file from the record cache.
    ///
    /// The header comes first, then every live group in group order, then `.SLUTT`.
    /// Deleted groups are left out. Flag-deleted NGIS groups stay, carrying flag `S`.
    /// The new source replaces the old one by rename, the write queue is emptied and
    /// the stored fingerprint is refreshed so the next open loads the cache. Returns
    /// the number of groups written.
    pub fn export(&mut self, file_id: FileId) -> Result<u32> {
        self.with_cursor_kept(|s| s.export_groups(file_id))
    }

    fn export_groups(&mut self, file_id: FileId) -> Result<u32> {
        let Session { files, cache, .. } = self;
        let file = files
            .get_mut(file_id)
            .and_then(Option::as_mut)
            .ok_or(SosiError::UnknownFile(file_id))?;
        if !file.layer().is_writable() {
            return Err(SosiError::ReadOnly);
        }

        let mut tmp: OsString = file.path().as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp_path = PathBuf::from(tmp);

        let offsets = match write_source(file, cache, &tmp_path) {
            Ok(offsets) => offsets,
            Err(e) => {
                if let Err(rm) = std::fs::remove_file(&tmp_path) {
                    tracing::warn!(path = %tmp_path.display(), error = %rm, "Could not remove partial export");
                }
                return Err(e);
            }
        };
        std::fs::rename(&tmp_path, file.path())?;

        let written = offsets.len() as u32;
        for (group, offset) in offsets {
            file.groups.get_mut(group)?.source_offset = offset;
        }
        file.bits.clear_column(BT_SKRKO)?;
        file.refresh_fingerprint()?;
        file.flush()?;
        tracing::info!(path = %file.path().display(), groups = written, "Source exported");
        Ok(written)
    }
}

/// Writes the live groups to `path` and returns each group's source offset.
fn write_source(file: &FileHandle, cache: &RecordCache, path: &Path) -> Result<Vec<(GroupNo, u64)>> {
    let header = file.header().clone();
    let mut writer = BufWriter::new(File::create(path).map_err(|e| SosiError::FileError {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?);
    let mut offsets: Vec<(GroupNo, u64)> = Vec::new();
    let mut pos = 0u64;

    for (group, entry) in file.groups.iter() {
        if !entry.is_live() {
            continue;
        }
        let body = file.read_body(group, cache)?;
        let text = render_group(entry, &body, &header);
        writer.write_all(text.as_bytes())?;
        offsets.push((group, pos));
        pos += text.len() as u64;
    }
    writer.write_all(b".SLUTT\n")?;
    let out = writer.into_inner().map_err(|e| SosiError::Io(e.into_error()))?;
    if file.fsync_enabled() {
        out.sync_all()?;
    }
    Ok(offsets)
}
