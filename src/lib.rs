//! archivekeeper maintains an on-disk archive per PostgreSQL cluster:
//! physical base backups taken over the streaming-replication protocol,
//! a continuous WAL archive received live from the server, and a local
//! catalog recording inventory, retention policy, worker processes and
//! streaming positions.

use std::path::PathBuf;

pub mod basebackup;
pub mod catalog;
pub mod commands;
pub mod config;
pub mod error;
pub mod retention;
pub mod stream;
pub mod streamer;
pub mod vectored_io;
pub mod wal;
pub mod worker;

/// Marker file identifying a directory tree as an archive.
pub const ARCHIVE_MARKER_FILE: &str = "ARCHIVEKEEPER_MAGIC";
pub const ARCHIVE_MARKER_CONTENT: &str = "archivekeeper archive\nformat 1\n";

/// Subdirectory of an archive holding received WAL segments.
pub const WAL_SUBDIR: &str = "wal";

pub mod defaults {
    /// Catalog database file, relative to the workdir.
    pub const CATALOG_FILE_NAME: &str = "archivekeeper.db";
}

#[derive(Debug, Clone)]
pub struct ArchiveKeeperConf {
    /// Base directory for the catalog database. Archives live wherever
    /// their registered directory points.
    pub workdir: PathBuf,
}

impl ArchiveKeeperConf {
    pub fn catalog_path(&self) -> PathBuf {
        self.workdir.join(defaults::CATALOG_FILE_NAME)
    }
}

impl Default for ArchiveKeeperConf {
    fn default() -> Self {
        ArchiveKeeperConf {
            workdir: PathBuf::from("./"),
        }
    }
}
