//! Source fingerprint and the persisted admin record.

use crate::error::{Result, SosiError};
use crate::types::SerialNo;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Layer flag for sequential files.
pub const LC_SEKV: u16 = 0x0001;
/// Layer flag for background (read-only) files.
pub const LC_BAKGR: u16 = 0x0002;
/// Layer flag for foreground (writable) files.
pub const LC_FRAMGR: u16 = 0x0004;

/// Layer a file is opened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Layer {
    /// Writable file.
    #[default]
    Foreground,
    /// Read-only file.
    Background,
}

impl Layer {
    /// Returns the layer flag bits.
    pub fn flags(self) -> u16 {
        match self {
            Layer::Foreground => LC_FRAMGR,
            Layer::Background => LC_BAKGR,
        }
    }

    /// Returns true if groups in this layer may be modified.
    pub fn is_writable(self) -> bool {
        self == Layer::Foreground
    }
}

/// Identity of a source file at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// File size in bytes.
    pub size: u64,
    /// Modification time in nanoseconds since the Unix epoch.
    pub mtime_nanos: u64,
}

impl Fingerprint {
    /// Reads the fingerprint of a file from its metadata.
    pub fn of(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path).map_err(|e| SosiError::FileError {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mtime_nanos = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Ok(Self {
            size: meta.len(),
            mtime_nanos,
        })
    }
}

/// Persisted administration record of one cache directory.
///
/// Layout (56 bytes):
/// - magic: 4 bytes ("SADM")
/// - version: 4 bytes
/// - source_size: 8 bytes
/// - source_mtime: 8 bytes
/// - layer_flags: 2 bytes
/// - idx_open: 1 byte
/// - reserved: 1 byte
/// - group_count: 4 bytes
/// - max_serial: 4 bytes
/// - next_free_rb: 8 bytes
/// - last_rb_group: 4 bytes (-1 for none)
/// - pid: 4 bytes
/// - checksum: 4 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminRecord {
    /// Magic bytes for identification.
    pub magic: [u8; 4],
    /// Index format version.
    pub version: u32,
    /// Fingerprint of the source file the cache was built from.
    pub fingerprint: Fingerprint,
    /// Layer flags of the file.
    pub layer_flags: u16,
    /// Set while a session has the index open.
    pub idx_open: bool,
    /// Number of groups in the group table.
    pub group_count: u32,
    /// Highest serial number in use.
    pub max_serial: SerialNo,
    /// First free byte in the record cache.
    pub next_free_rb: u64,
    /// Last group in record-cache order.
    pub last_rb_group: Option<u32>,
    /// Process id of the writer.
    pub pid: u32,
    /// Record checksum.
    pub checksum: u32,
}

impl AdminRecord {
    /// Magic bytes identifying an admin record.
    pub const MAGIC: [u8; 4] = *b"SADM";
    /// Current index format version.
    pub const VERSION: u32 = 3;
    /// Size of the record in bytes.
    pub const SIZE: usize = 56;

    /// Creates a new admin record with a fresh checksum.
    pub fn new(fingerprint: Fingerprint, layer_flags: u16) -> Self {
        let mut record = Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            fingerprint,
            layer_flags,
            idx_open: false,
            group_count: 0,
            max_serial: 0,
            next_free_rb: 0,
            last_rb_group: None,
            pid: std::process::id(),
            checksum: 0,
        };
        record.checksum = record.compute_checksum();
        record
    }

    /// Recomputes the checksum after fields were changed.
    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    fn compute_checksum(&self) -> u32 {
        let bytes = self.body_bytes();
        crc32fast::hash(&bytes[..Self::SIZE - 4])
    }

    fn body_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.fingerprint.size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.fingerprint.mtime_nanos.to_le_bytes());
        buf[24..26].copy_from_slice(&self.layer_flags.to_le_bytes());
        buf[26] = self.idx_open as u8;
        // byte 27 is reserved
        buf[28..32].copy_from_slice(&self.group_count.to_le_bytes());
        buf[32..36].copy_from_slice(&self.max_serial.to_le_bytes());
        buf[36..44].copy_from_slice(&self.next_free_rb.to_le_bytes());
        let last = self.last_rb_group.map(|g| g as i32).unwrap_or(-1);
        buf[44..48].copy_from_slice(&last.to_le_bytes());
        buf[48..52].copy_from_slice(&self.pid.to_le_bytes());
        buf
    }

    /// Validates magic, version and checksum.
    pub fn validate(&self) -> Result<()> {
        if self.magic != Self::MAGIC {
            return Err(SosiError::AdminCorrupted("invalid magic bytes".to_string()));
        }
        if self.version != Self::VERSION {
            return Err(SosiError::VersionMismatch {
                expected: Self::VERSION.to_string(),
                found: self.version.to_string(),
            });
        }
        if self.checksum != self.compute_checksum() {
            return Err(SosiError::AdminCorrupted("checksum mismatch".to_string()));
        }
        Ok(())
    }

    /// Checks the stored fingerprint against the live source file.
    pub fn check_fingerprint(&self, live: &Fingerprint) -> Result<()> {
        if self.fingerprint.size != live.size {
            return Err(SosiError::FingerprintMismatch(format!(
                "size {} != {}",
                self.fingerprint.size, live.size
            )));
        }
        if self.fingerprint.mtime_nanos != live.mtime_nanos {
            return Err(SosiError::FingerprintMismatch(format!(
                "mtime {} != {}",
                self.fingerprint.mtime_nanos, live.mtime_nanos
            )));
        }
        Ok(())
    }

    /// Serializes the record to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = self.body_bytes();
        buf[52..56].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Deserializes the record from bytes without validating it.
    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        let u32_at = |o: usize| u32::from_le_bytes([buf[o], buf[o + 1], buf[o + 2], buf[o + 3]]);
        let u64_at = |o: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[o..o + 8]);
            u64::from_le_bytes(b)
        };
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[0..4]);
        let last = u32_at(44) as i32;

        Self {
            magic,
            version: u32_at(4),
            fingerprint: Fingerprint {
                size: u64_at(8),
                mtime_nanos: u64_at(16),
            },
            layer_flags: u16::from_le_bytes([buf[24], buf[25]]),
            idx_open: buf[26] != 0,
            group_count: u32_at(28),
            max_serial: u32_at(32),
            next_free_rb: u64_at(36),
            last_rb_group: (last >= 0).then_some(last as u32),
            pid: u32_at(48),
            checksum: u32_at(52),
        }
    }
}
