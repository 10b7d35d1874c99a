//! Record cache: group bodies stored at byte offsets in a side file.
//!
//! Body layout at `ring_offset`:
//! +--------------------------------------+
//! | attribute text (NUL-terminated lines) |  attr_len bytes
//! | east:  f64 x coord_count             |
//! | north: f64 x coord_count             |
//! | point info x coord_count             |  PointInfo::SIZE each
//! | point-attribute text                  |  point_attr_len bytes
//! +--------------------------------------+

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use sosi_common::{Result, SosiError, HOYDE_MANGLER, LC_INGEN_PINFO};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Per-point data stored next to the coordinates.
///
/// Layout (16 bytes):
/// - height: 8 bytes (height or depth, [`HOYDE_MANGLER`] when absent)
/// - kp: 2 bytes (knot marker, 0 for none)
/// - reserved: 2 bytes
/// - pinfo_offset: 4 bytes (offset into the point-attribute text)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointInfo {
    pub height: f64,
    pub kp: i16,
    pub pinfo_offset: u32,
}

impl Default for PointInfo {
    fn default() -> Self {
        Self {
            height: HOYDE_MANGLER,
            kp: 0,
            pinfo_offset: LC_INGEN_PINFO,
        }
    }
}

impl PointInfo {
    /// Size of a serialized point info in bytes.
    pub const SIZE: usize = 16;

    /// Returns true if the point carries a height or depth.
    pub fn has_height(&self) -> bool {
        self.height != HOYDE_MANGLER
    }

    /// Returns true if the point has point-attribute text.
    pub fn has_pinfo(&self) -> bool {
        self.pinfo_offset != LC_INGEN_PINFO
    }

    /// Point-attribute text of this point within a group's `point_attr` buffer.
    pub fn text<'a>(&self, point_attr: &'a [u8]) -> Option<&'a str> {
        if !self.has_pinfo() {
            return None;
        }
        let tail = point_attr.get(self.pinfo_offset as usize..)?;
        let end = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
        std::str::from_utf8(&tail[..end]).ok()
    }
}

/// Lengths needed to read one body back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordLens {
    pub attr_len: u32,
    pub coord_count: u32,
    pub point_attr_len: u32,
}

impl RecordLens {
    /// Total size of the body in bytes.
    pub fn total(&self) -> u64 {
        compute_length(self.attr_len, self.coord_count, self.point_attr_len)
    }
}

/// Size of a body in the record cache.
pub fn compute_length(attr_len: u32, coord_count: u32, point_attr_len: u32) -> u64 {
    attr_len as u64
        + 2 * 8 * coord_count as u64
        + coord_count as u64 * PointInfo::SIZE as u64
        + point_attr_len as u64
}

/// One group body as stored in the record cache.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupBody {
    pub attr_text: Vec<u8>,
    pub east: Vec<f64>,
    pub north: Vec<f64>,
    pub point_info: Vec<PointInfo>,
    pub point_attr: Vec<u8>,
}

impl GroupBody {
    /// Lengths describing this body.
    pub fn lens(&self) -> RecordLens {
        RecordLens {
            attr_len: self.attr_text.len() as u32,
            coord_count: self.east.len() as u32,
            point_attr_len: self.point_attr.len() as u32,
        }
    }

    fn encode(&self) -> BytesMut {
        let lens = self.lens();
        let mut buf = BytesMut::with_capacity(lens.total() as usize);
        buf.put_slice(&self.attr_text);
        for e in &self.east {
            buf.put_f64_le(*e);
        }
        for n in &self.north {
            buf.put_f64_le(*n);
        }
        for p in &self.point_info {
            buf.put_f64_le(p.height);
            buf.put_i16_le(p.kp);
            buf.put_u16_le(0);
            buf.put_u32_le(p.pinfo_offset);
        }
        buf.put_slice(&self.point_attr);
        buf
    }

    fn decode_coords(mut data: &[u8], count: usize) -> (Vec<f64>, Vec<f64>) {
        let east = (0..count).map(|_| data.get_f64_le()).collect();
        let north = (0..count).map(|_| data.get_f64_le()).collect();
        (east, north)
    }

    fn decode(data: &[u8], lens: RecordLens) -> Self {
        let attr_len = lens.attr_len as usize;
        let count = lens.coord_count as usize;
        let attr_text = data[..attr_len].to_vec();

        let (east, north) = Self::decode_coords(&data[attr_len..], count);

        let mut rest = &data[attr_len + 16 * count..];
        let point_info = (0..count)
            .map(|_| {
                let height = rest.get_f64_le();
                let kp = rest.get_i16_le();
                rest.advance(2);
                let pinfo_offset = rest.get_u32_le();
                PointInfo {
                    height,
                    kp,
                    pinfo_offset,
                }
            })
            .collect();
        let point_attr = rest[..lens.point_attr_len as usize].to_vec();

        Self {
            attr_text,
            east,
            north,
            point_info,
            point_attr,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

/// The one open record-cache file.
struct ActiveHandle {
    path: PathBuf,
    file: File,
    /// Where the OS file position is known to be.
    position: Option<u64>,
    mode: Mode,
}

impl ActiveHandle {
    fn position_at(&mut self, offset: u64, mode: Mode) -> Result<()> {
        if self.position != Some(offset) || self.mode != mode {
            self.file.seek(SeekFrom::Start(offset))?;
            self.position = Some(offset);
            self.mode = mode;
        }
        Ok(())
    }
}

/// Record-cache I/O shared by every file of a session.
///
/// Only one record-cache file is open at a time. Touching a different path closes
/// the previous handle first.
pub struct RecordCache {
    active: Mutex<Option<ActiveHandle>>,
    fsync_enabled: bool,
}

impl RecordCache {
    /// Creates a record cache with no file open.
    pub fn new(fsync_enabled: bool) -> Self {
        Self {
            active: Mutex::new(None),
            fsync_enabled,
        }
    }

    fn with_handle<R>(&self, path: &Path, f: impl FnOnce(&mut ActiveHandle) -> Result<R>) -> Result<R> {
        let mut active = self.active.lock();
        let reuse = matches!(active.as_ref(), Some(h) if h.path == path);
        if !reuse {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .map_err(|e| SosiError::FileError {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
            *active = Some(ActiveHandle {
                path: path.to_path_buf(),
                file,
                position: None,
                mode: Mode::Read,
            });
        }
        match active.as_mut() {
            Some(handle) => f(handle),
            None => Err(SosiError::Internal("record cache handle missing".to_string())),
        }
    }

    /// Path of the currently open record-cache file.
    pub fn active_path(&self) -> Option<PathBuf> {
        self.active.lock().as_ref().map(|h| h.path.clone())
    }

    /// Creates or truncates a record-cache file.
    pub fn reset(&self, path: &Path) -> Result<()> {
        self.close_path(path);
        File::create(path)?;
        Ok(())
    }

    /// Closes the handle if it points at `path`.
    pub fn close_path(&self, path: &Path) {
        let mut active = self.active.lock();
        if matches!(active.as_ref(), Some(h) if h.path == path) {
            *active = None;
        }
    }

    /// Closes the active handle.
    pub fn close(&self) {
        *self.active.lock() = None;
    }

    /// Writes a body at `offset`.
    pub fn write(&self, path: &Path, offset: u64, body: &GroupBody) -> Result<()> {
        let buf = body.encode();
        let fsync = self.fsync_enabled;
        self.with_handle(path, |h| {
            h.position_at(offset, Mode::Write)?;
            let mut written = 0;
            while written < buf.len() {
                match h.file.write(&buf[written..]) {
                    Ok(0) => break,
                    Ok(n) => written += n,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        h.position = None;
                        return Err(e.into());
                    }
                }
            }
            if written < buf.len() {
                h.position = None;
                return Err(SosiError::ShortTransfer {
                    offset,
                    expected: buf.len(),
                    actual: written,
                });
            }
            h.position = Some(offset + written as u64);
            if fsync {
                h.file.sync_data()?;
            }
            Ok(())
        })
    }

    fn read_raw(&self, path: &Path, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.with_handle(path, |h| {
            h.position_at(offset, Mode::Read)?;
            let mut buf = vec![0u8; len];
            let mut filled = 0;
            while filled < len {
                match h.file.read(&mut buf[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        h.position = None;
                        return Err(e.into());
                    }
                }
            }
            h.position = Some(offset + filled as u64);
            if filled < len {
                return Err(SosiError::ShortTransfer {
                    offset,
                    expected: len,
                    actual: filled,
                });
            }
            Ok(buf)
        })
    }

    /// Reads a whole body from `offset`.
    pub fn read(&self, path: &Path, offset: u64, lens: RecordLens) -> Result<GroupBody> {
        let data = self.read_raw(path, offset, lens.total() as usize)?;
        Ok(GroupBody::decode(&data, lens))
    }

    /// Reads only the coordinates of a body, skipping the attribute text.
    pub fn read_coords_only(
        &self,
        path: &Path,
        offset: u64,
        attr_len: u32,
        coord_count: u32,
    ) -> Result<(Vec<f64>, Vec<f64>)> {
        let count = coord_count as usize;
        let data = self.read_raw(path, offset + attr_len as u64, 16 * count)?;
        Ok(GroupBody::decode_coords(&data, count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body() -> GroupBody {
        GroupBody {
            attr_text: b".KURVE 1:\0..OBJTYPE Veg\0".to_vec(),
            east: vec![100.0, 200.5, 300.25],
            north: vec![6_600_000.0, 6_600_001.0, 6_600_002.0],
            point_info: vec![
                PointInfo::default(),
                PointInfo {
                    height: 12.5,
                    kp: 1,
                    pinfo_offset: 0,
                },
                PointInfo::default(),
            ],
            point_attr: b"...TEST 1\0".to_vec(),
        }
    }

    #[test]
    fn test_compute_length() {
        assert_eq!(compute_length(10, 0, 0), 10);
        assert_eq!(compute_length(10, 2, 5), 10 + 32 + 32 + 5);
        let b = body();
        assert_eq!(b.encode().len() as u64, b.lens().total());
    }

    #[test]
    fn test_write_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Rb.idx");
        let cache = RecordCache::new(false);
        cache.reset(&path).unwrap();

        let b = body();
        cache.write(&path, 0, &b).unwrap();
        let second_offset = b.lens().total();
        let mut b2 = body();
        b2.east[0] = -1.0;
        cache.write(&path, second_offset, &b2).unwrap();

        assert_eq!(cache.read(&path, 0, b.lens()).unwrap(), b);
        assert_eq!(cache.read(&path, second_offset, b2.lens()).unwrap(), b2);

        let (east, north) = cache
            .read_coords_only(&path, second_offset, b2.lens().attr_len, 3)
            .unwrap();
        assert_eq!(east, b2.east);
        assert_eq!(north, b2.north);
    }

    #[test]
    fn test_short_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Rb.idx");
        let cache = RecordCache::new(false);
        cache.reset(&path).unwrap();
        let b = body();
        cache.write(&path, 0, &b).unwrap();

        let mut lens = b.lens();
        lens.coord_count += 10;
        let err = cache.read(&path, 0, lens).unwrap_err();
        assert!(matches!(err, SosiError::ShortTransfer { offset: 0, .. }));
    }

    #[test]
    fn test_single_active_handle() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.idx");
        let b = dir.path().join("b.idx");
        let cache = RecordCache::new(false);
        cache.reset(&a).unwrap();
        cache.reset(&b).unwrap();

        cache.write(&a, 0, &body()).unwrap();
        assert_eq!(cache.active_path().as_deref(), Some(a.as_path()));
        cache.write(&b, 0, &body()).unwrap();
        assert_eq!(cache.active_path().as_deref(), Some(b.as_path()));

        // Switching back still reads the right file
        assert_eq!(cache.read(&a, 0, body().lens()).unwrap(), body());

        cache.close_path(&b);
        assert_eq!(cache.active_path().as_deref(), Some(a.as_path()));
        cache.close();
        assert!(cache.active_path().is_none());
    }

    #[test]
    fn test_point_info_default() {
        let p = PointInfo::default();
        assert!(!p.has_height());
        assert!(!p.has_pinfo());
        assert_eq!(p.kp, 0);
    }
}
