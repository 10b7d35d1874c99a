//! Serial-number range search.
//!
//! A search walks the serial table of one file in ascending order between two
//! bounds. It never selects the groups it finds.

use crate::session::{FileId, GroupRef, Session};
use sosi_common::{Result, SerialNo};

/// Ascending walk over the serials `min..=max` of one file.
#[derive(Debug, Clone)]
pub struct SerialSearch {
    file: FileId,
    min: SerialNo,
    max: SerialNo,
    current: Option<SerialNo>,
}

impl SerialSearch {
    pub fn new(file: FileId, min: SerialNo, max: SerialNo) -> Self {
        Self {
            file,
            min,
            max,
            current: None,
        }
    }

    /// Serial of the last hit.
    pub fn current(&self) -> Option<SerialNo> {
        self.current
    }

    fn scan(
        &mut self,
        session: &Session,
        from: SerialNo,
        keep: impl Fn(GroupRef) -> Result<bool>,
    ) -> Result<Option<GroupRef>> {
        let file = session.file(self.file)?;
        let last = self.max.min(file.max_serial());
        for serial in from..=last {
            if let Some(group) = file.group_of(serial) {
                let at = GroupRef::new(self.file, group);
                if keep(at)? {
                    self.current = Some(serial);
                    return Ok(Some(at));
                }
            }
        }
        Ok(None)
    }

    fn after_current(&self) -> Option<SerialNo> {
        match self.current {
            Some(s) => s.checked_add(1),
            None => Some(self.min),
        }
    }

    /// First group in the range.
    pub fn first(&mut self, session: &Session) -> Result<Option<GroupRef>> {
        self.scan(session, self.min, |_| Ok(true))
    }

    /// Next group after the last hit.
    pub fn next(&mut self, session: &Session) -> Result<Option<GroupRef>> {
        match self.after_current() {
            Some(from) => self.scan(session, from, |_| Ok(true)),
            None => Ok(None),
        }
    }

    /// First group in the range with used-bit column `col` set.
    pub fn first_marked(&mut self, session: &Session, col: i32) -> Result<Option<GroupRef>> {
        self.scan(session, self.min, |at| session.bit(at, col))
    }

    /// Next group with used-bit column `col` set.
    pub fn next_marked(&mut self, session: &Session, col: i32) -> Result<Option<GroupRef>> {
        match self.after_current() {
            Some(from) => self.scan(session, from, |at| session.bit(at, col)),
            None => Ok(None),
        }
    }

    /// Positions the search on `serial` if it is in use.
    pub fn move_to(&mut self, session: &Session, serial: SerialNo) -> Result<Option<GroupRef>> {
        let found = session.find_serial(self.file, serial)?;
        if found.is_some() {
            self.current = Some(serial);
        }
        Ok(found.map(|group| GroupRef::new(self.file, group)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sosi_common::{IndexConfig, Layer};
    use std::fs;

    const SOURCE: &str = "\
.HODE
...ENHET 1
.PUNKT 3:
..NØ
1 1
.PUNKT 5:
..NØ
2 2
.PUNKT 9:
..NØ
3 3
.SLUTT
";

    fn open() -> (tempfile::TempDir, Session, FileId) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkt.sos");
        fs::write(&path, SOURCE).unwrap();
        let mut session = Session::new(IndexConfig::default());
        let id = session.open_file(&path, Layer::Foreground).unwrap();
        (dir, session, id)
    }

    #[test]
    fn test_walk_range() {
        let (_dir, s, f) = open();
        let mut search = SerialSearch::new(f, 0, 100);
        assert_eq!(search.first(&s).unwrap(), Some(GroupRef::new(f, 1)));
        assert_eq!(search.current(), Some(3));
        assert_eq!(search.next(&s).unwrap(), Some(GroupRef::new(f, 2)));
        assert_eq!(search.next(&s).unwrap(), Some(GroupRef::new(f, 3)));
        assert_eq!(search.next(&s).unwrap(), None);
        assert_eq!(search.current(), Some(9));
        assert!(s.current().is_none());
    }

    #[test]
    fn test_bounds() {
        let (_dir, s, f) = open();
        let mut search = SerialSearch::new(f, 4, 8);
        assert_eq!(search.first(&s).unwrap(), Some(GroupRef::new(f, 2)));
        assert_eq!(search.next(&s).unwrap(), None);

        let mut empty = SerialSearch::new(f, 6, 8);
        assert_eq!(empty.next(&s).unwrap(), None);
        assert_eq!(empty.current(), None);
    }

    #[test]
    fn test_marked() {
        let (_dir, mut s, f) = open();
        s.set_bit(GroupRef::new(f, 3), 2).unwrap();
        let mut search = SerialSearch::new(f, 0, 100);
        assert_eq!(search.first_marked(&s, 2).unwrap(), Some(GroupRef::new(f, 3)));
        assert_eq!(search.next_marked(&s, 2).unwrap(), None);
    }

    #[test]
    fn test_move_to() {
        let (_dir, s, f) = open();
        let mut search = SerialSearch::new(f, 0, 100);
        assert_eq!(search.move_to(&s, 4).unwrap(), None);
        assert_eq!(search.current(), None);
        assert_eq!(search.move_to(&s, 5).unwrap(), Some(GroupRef::new(f, 2)));
        assert_eq!(search.next(&s).unwrap(), Some(GroupRef::new(f, 3)));
    }
}
