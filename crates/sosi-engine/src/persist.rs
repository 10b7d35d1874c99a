//! Cache-file persistence.
//!
//! One cache directory holds six files:
//! - `Adm.idx`: the admin record
//! - `Grt.idx`: group-table entries
//! - `Snr.idx`: i32 group number per serial `0..=max_serial`
//! - `Bt.idx`: u32 used-bit word per group
//! - `Geo.idx`: bounding box per group, the "none" sentinel for groups without geometry
//! - `Rb.idx`: the record cache

use bytes::{Buf, BufMut, BytesMut};
use sosi_common::{AdminRecord, BoundingBox, Fingerprint, Result, SerialNo, SosiError};
use sosi_table::{GroupEntry, GroupTable, SerialTable, UsedBitTable};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const ADM_FILE: &str = "Adm.idx";
pub const GRT_FILE: &str = "Grt.idx";
pub const SNR_FILE: &str = "Snr.idx";
pub const BT_FILE: &str = "Bt.idx";
pub const GEO_FILE: &str = "Geo.idx";
pub const RB_FILE: &str = "Rb.idx";

/// Every file of a cache directory.
pub const CACHE_FILES: [&str; 6] = [ADM_FILE, GRT_FILE, SNR_FILE, BT_FILE, GEO_FILE, RB_FILE];

/// Path of one cache file.
pub fn cache_file(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}

/// Returns the first missing cache file, if any.
pub fn missing_file(dir: &Path) -> Option<&'static str> {
    CACHE_FILES.into_iter().find(|name| !dir.join(name).is_file())
}

fn write_file(path: &Path, data: &[u8], fsync: bool) -> Result<()> {
    let mut file = File::create(path).map_err(|e| SosiError::FileError {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    file.write_all(data)?;
    if fsync {
        file.sync_all()?;
    }
    Ok(())
}

fn read_exact_file(path: &Path, expected: usize) -> Result<Vec<u8>> {
    let data = fs::read(path).map_err(|e| SosiError::FileError {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    if data.len() != expected {
        return Err(SosiError::ShortTransfer {
            offset: 0,
            expected,
            actual: data.len(),
        });
    }
    Ok(data)
}

/// Reads and validates the admin record.
pub fn read_admin(dir: &Path) -> Result<AdminRecord> {
    let data = read_exact_file(&dir.join(ADM_FILE), AdminRecord::SIZE)?;
    let mut buf = [0u8; AdminRecord::SIZE];
    buf.copy_from_slice(&data);
    let record = AdminRecord::from_bytes(&buf);
    record.validate()?;
    Ok(record)
}

/// Writes the admin record.
pub fn write_admin(dir: &Path, record: &AdminRecord, fsync: bool) -> Result<()> {
    write_file(&dir.join(ADM_FILE), &record.to_bytes(), fsync)
}

/// Checks that a cache directory can be trusted for the live source file.
///
/// Returns the stored admin record, or the reason the cache must be rebuilt.
pub fn validate(dir: &Path, live: &Fingerprint) -> Result<AdminRecord> {
    if let Some(name) = missing_file(dir) {
        return Err(SosiError::FileError {
            path: dir.join(name).display().to_string(),
            reason: "cache file missing".to_string(),
        });
    }
    let record = read_admin(dir)?;
    if record.idx_open {
        tracing::warn!(dir = %dir.display(), pid = record.pid, "Index was not closed cleanly");
        return Err(SosiError::AdminCorrupted("index left open by an earlier session".to_string()));
    }
    record.check_fingerprint(live)?;
    Ok(record)
}

/// Writes the group table.
pub fn write_groups(dir: &Path, groups: &GroupTable, fsync: bool) -> Result<()> {
    let mut buf = BytesMut::with_capacity(groups.len() as usize * GroupEntry::SIZE);
    for (_, entry) in groups.iter() {
        buf.put_slice(&entry.to_bytes());
    }
    write_file(&dir.join(GRT_FILE), &buf, fsync)
}

/// Reads `count` group-table entries.
pub fn read_groups(dir: &Path, count: u32) -> Result<GroupTable> {
    let data = read_exact_file(&dir.join(GRT_FILE), count as usize * GroupEntry::SIZE)?;
    let mut table = GroupTable::new();
    for chunk in data.chunks_exact(GroupEntry::SIZE) {
        let mut buf = [0u8; GroupEntry::SIZE];
        buf.copy_from_slice(chunk);
        table.push(GroupEntry::from_bytes(&buf));
    }
    Ok(table)
}

/// Writes the serial table for serials `0..=max_serial`.
pub fn write_serials(dir: &Path, serials: &SerialTable, max_serial: SerialNo, fsync: bool) -> Result<()> {
    let mut buf = BytesMut::with_capacity((max_serial as usize + 1) * 4);
    for snr in 0..=max_serial {
        buf.put_i32_le(serials.raw(snr));
    }
    write_file(&dir.join(SNR_FILE), &buf, fsync)
}

/// Reads the serial table, skipping unassigned serials.
pub fn read_serials(dir: &Path, max_serial: SerialNo) -> Result<SerialTable> {
    let data = read_exact_file(&dir.join(SNR_FILE), (max_serial as usize + 1) * 4)?;
    let mut table = SerialTable::new();
    let mut buf = &data[..];
    for snr in 0..=max_serial {
        let group = buf.get_i32_le();
        if group >= 0 {
            table.set(snr, group as u32)?;
        }
    }
    Ok(table)
}

/// Writes the used-bit words.
pub fn write_bits(dir: &Path, bits: &UsedBitTable, fsync: bool) -> Result<()> {
    let mut buf = BytesMut::with_capacity(bits.len() as usize * 4);
    for g in 0..bits.len() {
        buf.put_u32_le(bits.word(g)?);
    }
    write_file(&dir.join(BT_FILE), &buf, fsync)
}

/// Reads `count` used-bit words.
pub fn read_bits(dir: &Path, count: u32) -> Result<UsedBitTable> {
    let data = read_exact_file(&dir.join(BT_FILE), count as usize * 4)?;
    let mut table = UsedBitTable::new();
    table.set_len(count);
    let mut buf = &data[..];
    for g in 0..count {
        table.set_word(g, buf.get_u32_le())?;
    }
    Ok(table)
}

/// Writes one box per group, the sentinel for groups without geometry.
pub fn write_boxes(dir: &Path, boxes: impl Iterator<Item = Option<BoundingBox>>, fsync: bool) -> Result<()> {
    let mut buf = BytesMut::new();
    for b in boxes {
        buf.put_slice(&b.unwrap_or_else(BoundingBox::none_sentinel).to_bytes());
    }
    write_file(&dir.join(GEO_FILE), &buf, fsync)
}

/// Reads `count` boxes.
pub fn read_boxes(dir: &Path, count: u32) -> Result<Vec<Option<BoundingBox>>> {
    let data = read_exact_file(&dir.join(GEO_FILE), count as usize * BoundingBox::SIZE)?;
    Ok(data
        .chunks_exact(BoundingBox::SIZE)
        .map(|chunk| {
            let mut buf = [0u8; BoundingBox::SIZE];
            buf.copy_from_slice(chunk);
            let b = BoundingBox::from_bytes(&buf);
            (!b.is_none_sentinel()).then_some(b)
        })
        .collect())
}

/// Deletes every cache file and the directory if it is left empty.
pub fn delete_cache(dir: &Path) -> Result<()> {
    for name in CACHE_FILES {
        let path = dir.join(name);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    // Leave directories holding foreign files alone
    let _ = fs::remove_dir(dir);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sosi_common::{InfoFlags, LC_FRAMGR};

    fn fingerprint() -> Fingerprint {
        Fingerprint {
            size: 1000,
            mtime_nanos: 42,
        }
    }

    fn touch_all(dir: &Path) {
        for name in CACHE_FILES {
            File::create(dir.join(name)).unwrap();
        }
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(missing_file(dir.path()), Some(ADM_FILE));
        touch_all(dir.path());
        assert_eq!(missing_file(dir.path()), None);
        fs::remove_file(dir.path().join(GEO_FILE)).unwrap();
        assert_eq!(missing_file(dir.path()), Some(GEO_FILE));
        assert!(validate(dir.path(), &fingerprint()).is_err());
    }

    #[test]
    fn test_validate() {
        let dir = tempfile::tempdir().unwrap();
        touch_all(dir.path());
        let record = AdminRecord::new(fingerprint(), LC_FRAMGR);
        write_admin(dir.path(), &record, false).unwrap();
        assert_eq!(validate(dir.path(), &fingerprint()).unwrap(), record);

        let mut changed = fingerprint();
        changed.size += 1;
        let err = validate(dir.path(), &changed).unwrap_err();
        assert!(matches!(err, SosiError::FingerprintMismatch(_)));
    }

    #[test]
    fn test_validate_open_flag() {
        let dir = tempfile::tempdir().unwrap();
        touch_all(dir.path());
        let mut record = AdminRecord::new(fingerprint(), LC_FRAMGR);
        record.idx_open = true;
        record.seal();
        write_admin(dir.path(), &record, false).unwrap();
        assert!(validate(dir.path(), &fingerprint()).is_err());
    }

    #[test]
    fn test_truncated_admin() {
        let dir = tempfile::tempdir().unwrap();
        touch_all(dir.path());
        fs::write(dir.path().join(ADM_FILE), [0u8; 10]).unwrap();
        let err = read_admin(dir.path()).unwrap_err();
        assert!(matches!(err, SosiError::ShortTransfer { expected: 56, actual: 10, .. }));
    }

    #[test]
    fn test_tables() {
        let dir = tempfile::tempdir().unwrap();

        let mut groups = GroupTable::new();
        groups.push(GroupEntry::default());
        let mut e = GroupEntry {
            line_count: 3,
            coord_count: 2,
            info: InfoFlags(InfoFlags::REF),
            ..Default::default()
        };
        e.set_objtype("Veg");
        groups.push(e);
        write_groups(dir.path(), &groups, false).unwrap();
        let loaded = read_groups(dir.path(), 2).unwrap();
        assert_eq!(loaded.get(1).unwrap(), groups.get(1).unwrap());
        assert!(read_groups(dir.path(), 3).is_err());

        let mut serials = SerialTable::new();
        serials.set(1, 1).unwrap();
        serials.set(7, 0).unwrap();
        write_serials(dir.path(), &serials, 7, false).unwrap();
        let loaded = read_serials(dir.path(), 7).unwrap();
        assert_eq!(loaded.get(1), Some(1));
        assert_eq!(loaded.get(7), Some(0));
        assert_eq!(loaded.get(3), None);

        let mut bits = UsedBitTable::new();
        bits.set_len(2);
        bits.set(1, 4).unwrap();
        write_bits(dir.path(), &bits, false).unwrap();
        let loaded = read_bits(dir.path(), 2).unwrap();
        assert!(loaded.get(1, 4).unwrap());

        let b = BoundingBox::new(1.0, 2.0, 3.0, 4.0);
        write_boxes(dir.path(), [None, Some(b)].into_iter(), false).unwrap();
        assert_eq!(read_boxes(dir.path(), 2).unwrap(), vec![None, Some(b)]);
    }

    #[test]
    fn test_delete_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("kart");
        fs::create_dir(&cache).unwrap();
        touch_all(&cache);
        delete_cache(&cache).unwrap();
        assert!(!cache.exists());
        // Deleting twice is fine
        delete_cache(&cache).unwrap();
    }
}
