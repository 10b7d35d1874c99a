//! Block-paged tables for the SOSI index engine.
//!
//! This crate provides:
//! - The generic lazily allocated block table
//! - The group table with priority columns
//! - The serial-number table
//! - The used-bit table and its column operators

pub mod bits;
pub mod block;
pub mod group;
pub mod serial;

pub use bits::{
    ColumnOp, UsedBitTable, BT_GEOSOK, BT_GISOK, BT_MAX_BT, BT_MAX_USER, BT_MIN_USER, BT_REFBOX,
    BT_SKRKO, BT_SNRSOK, BT_X,
};
pub use block::{BlockTable, BLOCK_SIZE};
pub use group::{GroupEntry, GroupTable, OBJTYPE_LEN, PRIORITY_COLUMNS};
pub use serial::SerialTable;
