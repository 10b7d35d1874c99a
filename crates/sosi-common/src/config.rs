//! Configuration for the index engine.

use crate::types::LC_MAX_GRU;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Engine configuration shared by every file opened in a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Redirects cache directories away from the source files.
    ///
    /// When set, a cache is never trusted on open and never kept on close.
    pub index_path: Option<PathBuf>,
    /// Sync cache files to disk when they are saved.
    pub fsync_enabled: bool,
    /// Follow references when marking a group.
    pub mark_referenced: bool,
    /// Visibility of groups flagged as deleted in NGIS files.
    pub ngis_mode: NgisMode,
    /// Maximum number of groups per file.
    pub max_groups: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            index_path: None,
            fsync_enabled: false,
            mark_referenced: true,
            ngis_mode: NgisMode::Normal,
            max_groups: LC_MAX_GRU,
        }
    }
}

impl IndexConfig {
    /// Returns the cache directory for a source file.
    ///
    /// The directory is named after the file stem and sits next to the source,
    /// or below `index_path` when an override is configured. When that name is the
    /// source itself, as for a source without an extension, `.idx` is appended.
    pub fn cache_dir(&self, source: &Path) -> PathBuf {
        let stem = source
            .file_stem()
            .map(|s| s.to_os_string())
            .unwrap_or_default();
        let dir = match &self.index_path {
            Some(root) => root.join(&stem),
            None => source
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default()
                .join(&stem),
        };
        if dir != source {
            return dir;
        }
        let mut name = stem;
        name.push(".idx");
        dir.with_file_name(name)
    }

    /// Returns true if an explicit index-path override is active.
    pub fn has_override(&self) -> bool {
        self.index_path.is_some()
    }
}

/// How groups flagged as deleted in NGIS files are treated on select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NgisMode {
    /// Flag-deleted NGIS groups are hidden.
    #[default]
    Normal,
    /// Flag-deleted NGIS groups stay selectable.
    Special,
}
