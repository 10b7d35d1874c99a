//! Index and record-cache engine for SOSI vector files.
//!
//! A [`Session`] opens SOSI source files and keeps, per file, a cache directory with
//! the group table, serial table, used bits, bounding boxes and a record cache of
//! group bodies. Caches are validated against the source fingerprint on open and
//! rebuilt from the source when they cannot be trusted.
//!
//! Group contents are edited through the session cursor: select a group, change
//! its attribute lines or coordinates, then write it back.

pub mod compact;
pub mod export;
pub mod file;
pub mod header;
pub mod lines;
pub mod persist;
pub mod ring;
pub mod scan;
pub mod search;
pub mod session;

pub use compact::CompactStats;
pub use file::{group_box, CloseMode, FileHandle, IndexState};
pub use header::FileHeader;
pub use lines::{canonicalize, outer_references, parse_references, AttributeLineBuffer, LineChange};
pub use ring::{GroupBody, PointInfo, RecordCache, RecordLens};
pub use search::SerialSearch;
pub use session::{FileId, GroupRef, SavedCursor, Session};
