//! Shared types, errors and configuration for the SOSI index engine.
//!
//! This crate provides:
//! - The engine-wide error type
//! - Index configuration
//! - Group, serial and bounding-box types with their sentinels
//! - The SOSI name dictionary
//! - The source fingerprint and persisted admin record

pub mod admin;
pub mod config;
pub mod error;
pub mod names;
pub mod types;

pub use admin::{AdminRecord, Fingerprint, Layer, LC_BAKGR, LC_FRAMGR, LC_SEKV};
pub use config::{IndexConfig, NgisMode};
pub use error::{Result, SosiError};
pub use names::{GroupName, SosiName};
pub use types::{
    BoundingBox, GroupNo, InfoFlags, SerialNo, HOYDE_MANGLER, INGEN_GRUPPE, LC_INGEN_PINFO,
    LC_MAX_GRU, MAX_SERIAL, NY_RB_ST, NY_SOSI_ST, SLUTT_OY, START_OY,
};
