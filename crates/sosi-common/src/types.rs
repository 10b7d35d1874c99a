//! Core identifiers, sentinels and small value types.

use serde::{Deserialize, Serialize};

/// Dense index of a group within one file.
pub type GroupNo = u32;

/// Stable serial number of a group.
pub type SerialNo = u32;

/// Marks an unassigned serial number in the serial table.
pub const INGEN_GRUPPE: i32 = -1;

/// Maximum number of groups in one file.
pub const LC_MAX_GRU: u32 = 10_000_000;

/// Highest serial number the serial table accepts.
pub const MAX_SERIAL: SerialNo = 99_999_999;

/// Height value meaning "no height on this point".
pub const HOYDE_MANGLER: f64 = -9999.999;

/// Point-attribute offset meaning "no point attributes".
pub const LC_INGEN_PINFO: u32 = u32::MAX;

/// Reference marker for the start of an island.
pub const START_OY: i64 = 9_999_999;

/// Reference marker for the end of an island.
pub const SLUTT_OY: i64 = -9_999_999;

/// Source offset of a group that has never been written to the source file.
pub const NY_SOSI_ST: u64 = u64::MAX;

/// Record-cache offset of a group that has never been written to the cache.
pub const NY_RB_ST: u64 = u64::MAX;

/// Axis-aligned bounding box in ground coordinates.
///
/// Layout (32 bytes):
/// - min_east: 8 bytes
/// - min_north: 8 bytes
/// - max_east: 8 bytes
/// - max_north: 8 bytes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_east: f64,
    pub min_north: f64,
    pub max_east: f64,
    pub max_north: f64,
}

impl BoundingBox {
    /// Size of a serialized box in bytes.
    pub const SIZE: usize = 32;

    /// Creates a box from its corners.
    pub fn new(min_east: f64, min_north: f64, max_east: f64, max_north: f64) -> Self {
        Self {
            min_east,
            min_north,
            max_east,
            max_north,
        }
    }

    /// An inverted box that any union will replace.
    pub fn empty() -> Self {
        Self {
            min_east: f64::MAX,
            min_north: f64::MAX,
            max_east: f64::MIN,
            max_north: f64::MIN,
        }
    }

    /// Sentinel written for groups without geometry.
    pub fn none_sentinel() -> Self {
        Self {
            min_east: 0.0,
            min_north: 0.0,
            max_east: f64::MAX,
            max_north: 0.0,
        }
    }

    /// Returns true if this is the "no geometry" sentinel.
    pub fn is_none_sentinel(&self) -> bool {
        self.max_east == f64::MAX
    }

    /// Returns true if the box has been extended by at least one point.
    pub fn is_valid(&self) -> bool {
        self.min_east <= self.max_east && self.min_north <= self.max_north
    }

    /// Returns true if the two boxes overlap or touch.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.max_north >= other.min_north
            && self.max_east >= other.min_east
            && self.min_north <= other.max_north
            && self.min_east <= other.max_east
    }

    /// Returns true if the point lies inside or on the edge of the box.
    pub fn contains_point(&self, east: f64, north: f64) -> bool {
        east >= self.min_east && east <= self.max_east && north >= self.min_north && north <= self.max_north
    }

    /// Grows this box to cover `other`.
    pub fn union(&mut self, other: &BoundingBox) {
        self.min_east = self.min_east.min(other.min_east);
        self.min_north = self.min_north.min(other.min_north);
        self.max_east = self.max_east.max(other.max_east);
        self.max_north = self.max_north.max(other.max_north);
    }

    /// Grows this box to cover a point.
    pub fn extend(&mut self, east: f64, north: f64) {
        self.min_east = self.min_east.min(east);
        self.min_north = self.min_north.min(north);
        self.max_east = self.max_east.max(east);
        self.max_north = self.max_north.max(north);
    }

    /// Widens the box by `margin` on every side.
    pub fn expanded(&self, margin: f64) -> Self {
        Self {
            min_east: self.min_east - margin,
            min_north: self.min_north - margin,
            max_east: self.max_east + margin,
            max_north: self.max_north + margin,
        }
    }

    /// Area of the union of the two boxes.
    pub fn union_area(&self, other: &BoundingBox) -> f64 {
        (self.max_east.max(other.max_east) - self.min_east.min(other.min_east))
            * (self.max_north.max(other.max_north) - self.min_north.min(other.min_north))
    }

    /// Serializes the box to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.min_east.to_le_bytes());
        buf[8..16].copy_from_slice(&self.min_north.to_le_bytes());
        buf[16..24].copy_from_slice(&self.max_east.to_le_bytes());
        buf[24..32].copy_from_slice(&self.max_north.to_le_bytes());
        buf
    }

    /// Deserializes the box from bytes.
    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        let f = |r: std::ops::Range<usize>| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[r]);
            f64::from_le_bytes(b)
        };
        Self {
            min_east: f(0..8),
            min_north: f(8..16),
            max_east: f(16..24),
            max_north: f(24..32),
        }
    }
}

/// Per-group info flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoFlags(pub u16);

impl InfoFlags {
    /// Group has point attributes.
    pub const PINFO: u16 = 0x0001;
    /// Group has heights (`..NØH`).
    pub const NAH: u16 = 0x0002;
    /// Group has knot points (`...KP`).
    pub const KP: u16 = 0x0004;
    /// Group has references.
    pub const REF: u16 = 0x0008;
    /// Group references contain islands.
    pub const OY_REF: u16 = 0x0010;
    /// Group is flagged as deleted.
    pub const SLETTA: u16 = 0x0020;
    /// Group carries an NGIS update flag.
    pub const NGIS: u16 = 0x0040;
    /// Group has depths (`..NØD`).
    pub const NAD: u16 = 0x0080;
    /// Group must not be updated.
    pub const READ_ONLY: u16 = 0x0100;

    /// No flags set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns true if every bit of `flag` is set.
    pub fn has(&self, flag: u16) -> bool {
        self.0 & flag == flag
    }

    /// Sets or clears `flag`.
    pub fn set(&mut self, flag: u16, on: bool) {
        if on {
            self.0 |= flag;
        } else {
            self.0 &= !flag;
        }
    }

    /// Returns the raw bits.
    pub fn bits(&self) -> u16 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels() {
        assert_eq!(INGEN_GRUPPE, -1);
        assert_eq!(START_OY, -SLUTT_OY);
        assert_eq!(LC_INGEN_PINFO, u32::MAX);
    }

    #[test]
    fn test_box_intersects() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        assert!(a.intersects(&BoundingBox::new(5.0, 5.0, 15.0, 15.0)));
        assert!(a.intersects(&BoundingBox::new(10.0, 10.0, 12.0, 12.0)));
        assert!(!a.intersects(&BoundingBox::new(20.0, 20.0, 30.0, 30.0)));
        assert!(!a.intersects(&BoundingBox::new(0.0, 11.0, 10.0, 12.0)));
    }

    #[test]
    fn test_box_union_and_extend() {
        let mut b = BoundingBox::empty();
        assert!(!b.is_valid());
        b.extend(3.0, 4.0);
        b.extend(-1.0, 8.0);
        assert!(b.is_valid());
        assert_eq!(b, BoundingBox::new(-1.0, 4.0, 3.0, 8.0));

        b.union(&BoundingBox::new(0.0, 0.0, 10.0, 5.0));
        assert_eq!(b, BoundingBox::new(-1.0, 0.0, 10.0, 8.0));
    }

    #[test]
    fn test_box_expanded_and_area() {
        let b = BoundingBox::new(0.0, 0.0, 2.0, 2.0).expanded(1.0);
        assert_eq!(b, BoundingBox::new(-1.0, -1.0, 3.0, 3.0));
        let other = BoundingBox::new(3.0, 3.0, 5.0, 4.0);
        assert_eq!(b.union_area(&other), 6.0 * 5.0);
    }

    #[test]
    fn test_box_bytes() {
        let b = BoundingBox::new(1.5, -2.25, 1e7, 6.5e6);
        assert_eq!(BoundingBox::from_bytes(&b.to_bytes()), b);
        let none = BoundingBox::none_sentinel();
        assert!(BoundingBox::from_bytes(&none.to_bytes()).is_none_sentinel());
        assert!(!b.is_none_sentinel());
    }

    #[test]
    fn test_info_flags() {
        let mut f = InfoFlags::empty();
        f.set(InfoFlags::REF, true);
        f.set(InfoFlags::OY_REF, true);
        assert!(f.has(InfoFlags::REF));
        assert!(f.has(InfoFlags::REF | InfoFlags::OY_REF));
        f.set(InfoFlags::REF, false);
        assert!(!f.has(InfoFlags::REF));
        assert_eq!(f.bits(), InfoFlags::OY_REF);
    }
}
