//! In-memory records for everything the catalog tracks: archives and their
//! connections, backup profiles, base backups and tablespaces, retention
//! policies, pin operations, stream identifications, worker processes and
//! cleanup plans.
//!
//! Each record carries an affected-attribute set: the column tags an
//! operation intends to read or write. The catalog assembles its SQL from
//! exactly that set, so an update touches only the columns the caller named.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::VarValue;
use crate::error::{ArchiveError, Result};
use crate::wal::{Lsn, TimeLineId};

/// Stable column numbering. These values are part of the catalog interface:
/// affected-attribute sets reference them and the schema column order
/// follows them.
pub mod attno {
    pub const ARCHIVE_ID: usize = 0;
    pub const ARCHIVE_NAME: usize = 1;
    pub const ARCHIVE_DIRECTORY: usize = 2;
    pub const ARCHIVE_COMPRESSION: usize = 3;
    pub const ARCHIVE_PGHOST: usize = 4;
    pub const ARCHIVE_PGPORT: usize = 5;
    pub const ARCHIVE_PGUSER: usize = 6;
    pub const ARCHIVE_PGDATABASE: usize = 7;

    pub const BACKUP_ID: usize = 0;
    pub const BACKUP_ARCHIVE_ID: usize = 1;
    pub const BACKUP_FSENTRY: usize = 2;
    pub const BACKUP_LABEL: usize = 3;
    pub const BACKUP_STARTED: usize = 4;
    pub const BACKUP_STOPPED: usize = 5;
    pub const BACKUP_PINNED: usize = 6;

    pub const CON_ARCHIVE_ID: usize = 0;
    pub const CON_TYPE: usize = 1;
    pub const CON_DSN: usize = 2;
    pub const CON_PGHOST: usize = 3;
    pub const CON_PGPORT: usize = 4;
    pub const CON_PGUSER: usize = 5;
    pub const CON_PGDATABASE: usize = 6;

    pub const PROF_ID: usize = 0;
    pub const PROF_NAME: usize = 1;
    pub const PROF_COMPRESS_TYPE: usize = 2;
    pub const PROF_MAX_RATE: usize = 3;
    pub const PROF_LABEL: usize = 4;
    pub const PROF_FAST_CHKPT: usize = 5;
    pub const PROF_INCL_WAL: usize = 6;
    pub const PROF_WAIT_FOR_WAL: usize = 7;
    pub const PROF_NOVERIFY: usize = 8;
}

/// Ordered set of column tags an operation reads or writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttrSet(Vec<usize>);

impl AttrSet {
    pub fn new() -> Self {
        AttrSet(Vec::new())
    }

    pub fn of(cols: &[usize]) -> Self {
        let mut set = AttrSet::new();
        for &col in cols {
            set.push(col);
        }
        set
    }

    pub fn push(&mut self, col: usize) {
        if !self.0.contains(&col) {
            self.0.push(col);
        }
    }

    pub fn contains(&self, col: usize) -> bool {
        self.0.contains(&col)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Action requested by a command descriptor. One tag per CLI command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTag {
    CreateArchive,
    CreateBackupProfile,
    CreateConnection,
    DropArchive,
    DropBackupProfile,
    DropConnection,
    DropBasebackup,
    ExecCommand,
    AlterArchive,
    VerifyArchive,
    StartBasebackup,
    ListArchive,
    ListBackupProfile,
    ListBackupProfileDetail,
    ListBackupCatalog,
    ListConnection,
    PinBasebackup,
    UnpinBasebackup,
    StartLauncher,
    StartStreamingForArchive,
    StopStreamingForArchive,
    ShowWorkers,
    BackgroundWorkerCommand,
    CreateRetentionPolicy,
    ListRetentionPolicies,
    ListRetentionPolicy,
    DropRetentionPolicy,
    ApplyRetentionPolicy,
    ShowVariables,
    ShowVariable,
    SetVariable,
    ResetVariable,
}

impl CommandTag {
    pub fn name(self) -> &'static str {
        match self {
            CommandTag::CreateArchive => "CREATE ARCHIVE",
            CommandTag::CreateBackupProfile => "CREATE BACKUP PROFILE",
            CommandTag::CreateConnection => "CREATE CONNECTION",
            CommandTag::DropArchive => "DROP ARCHIVE",
            CommandTag::DropBackupProfile => "DROP BACKUP PROFILE",
            CommandTag::DropConnection => "DROP CONNECTION",
            CommandTag::DropBasebackup => "DROP BASEBACKUP",
            CommandTag::ExecCommand => "EXEC",
            CommandTag::AlterArchive => "ALTER ARCHIVE",
            CommandTag::VerifyArchive => "VERIFY ARCHIVE",
            CommandTag::StartBasebackup => "START BASEBACKUP",
            CommandTag::ListArchive => "LIST ARCHIVE",
            CommandTag::ListBackupProfile => "LIST BACKUP PROFILE",
            CommandTag::ListBackupProfileDetail => "LIST BACKUP PROFILE DETAIL",
            CommandTag::ListBackupCatalog => "LIST BACKUP CATALOG",
            CommandTag::ListConnection => "LIST CONNECTION",
            CommandTag::PinBasebackup => "PIN BASEBACKUP",
            CommandTag::UnpinBasebackup => "UNPIN BASEBACKUP",
            CommandTag::StartLauncher => "START LAUNCHER",
            CommandTag::StartStreamingForArchive => "START STREAMING FOR ARCHIVE",
            CommandTag::StopStreamingForArchive => "STOP STREAMING FOR ARCHIVE",
            CommandTag::ShowWorkers => "SHOW WORKERS",
            CommandTag::BackgroundWorkerCommand => "BACKGROUND WORKER COMMAND",
            CommandTag::CreateRetentionPolicy => "CREATE RETENTION POLICY",
            CommandTag::ListRetentionPolicies => "LIST RETENTION POLICIES",
            CommandTag::ListRetentionPolicy => "LIST RETENTION POLICY",
            CommandTag::DropRetentionPolicy => "DROP RETENTION POLICY",
            CommandTag::ApplyRetentionPolicy => "APPLY RETENTION POLICY",
            CommandTag::ShowVariables => "SHOW VARIABLES",
            CommandTag::ShowVariable => "SHOW VARIABLE",
            CommandTag::SetVariable => "SET VARIABLE",
            CommandTag::ResetVariable => "RESET VARIABLE",
        }
    }
}

/// Compression applied by the sink a backup profile selects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum CompressionKind {
    #[default]
    None = 0,
    Gzip = 1,
    Zstd = 2,
    Pbzip = 3,
    Plain = 4,
}

impl CompressionKind {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Result<Self> {
        Ok(match code {
            0 => CompressionKind::None,
            1 => CompressionKind::Gzip,
            2 => CompressionKind::Zstd,
            3 => CompressionKind::Pbzip,
            4 => CompressionKind::Plain,
            other => {
                return Err(ArchiveError::invalid(
                    "compression",
                    format!("unknown compression code {other}"),
                ))
            }
        })
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "none" => CompressionKind::None,
            "gzip" => CompressionKind::Gzip,
            "zstd" => CompressionKind::Zstd,
            "pbzip" => CompressionKind::Pbzip,
            "plain" => CompressionKind::Plain,
            other => {
                return Err(ArchiveError::invalid(
                    "compression",
                    format!("unknown compression type \"{other}\""),
                ))
            }
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompressionKind::None => "none",
            CompressionKind::Gzip => "gzip",
            CompressionKind::Zstd => "zstd",
            CompressionKind::Pbzip => "pbzip",
            CompressionKind::Plain => "plain",
        }
    }
}

/// An archive: the on-disk root plus catalog rows for one cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ArchiveDescr {
    pub id: i64,
    pub name: String,
    pub directory: String,
    pub compression: bool,
    pub pghost: String,
    pub pgport: i64,
    pub pguser: String,
    pub pgdatabase: String,
    #[serde(skip)]
    pub attrs: AttrSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionKind {
    Basebackup,
    Streamer,
}

impl ConnectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionKind::Basebackup => "basebackup",
            ConnectionKind::Streamer => "streamer",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "basebackup" => ConnectionKind::Basebackup,
            "streamer" => ConnectionKind::Streamer,
            other => {
                return Err(ArchiveError::invalid(
                    "connection type",
                    format!("unknown connection type \"{other}\""),
                ))
            }
        })
    }
}

/// An upstream connection definition, unique per `(archive, kind)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionDescr {
    pub archive_id: i64,
    pub kind: ConnectionKind,
    pub pghost: String,
    pub pgport: i64,
    pub pguser: String,
    pub pgdatabase: String,
    pub dsn: String,
    #[serde(skip)]
    pub attrs: AttrSet,
}

impl Default for ConnectionDescr {
    fn default() -> Self {
        ConnectionDescr {
            archive_id: -1,
            kind: ConnectionKind::Basebackup,
            pghost: String::new(),
            pgport: 5432,
            pguser: String::new(),
            pgdatabase: String::new(),
            dsn: String::new(),
            attrs: AttrSet::new(),
        }
    }
}

pub const DEFAULT_BACKUP_LABEL: &str = "ARCHIVEKEEPER BASEBACKUP";

/// Named, reusable parameter set for initiating a base backup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupProfileDescr {
    pub id: i64,
    pub name: String,
    pub compress_type: CompressionKind,
    pub max_rate: u32,
    pub label: String,
    pub fast_checkpoint: bool,
    pub include_wal: bool,
    pub wait_for_wal: bool,
    pub noverify_checksums: bool,
    #[serde(skip)]
    pub attrs: AttrSet,
}

impl Default for BackupProfileDescr {
    fn default() -> Self {
        BackupProfileDescr {
            id: -1,
            name: String::new(),
            compress_type: CompressionKind::None,
            max_rate: 0,
            label: DEFAULT_BACKUP_LABEL.to_string(),
            fast_checkpoint: false,
            include_wal: false,
            wait_for_wal: true,
            noverify_checksums: false,
            attrs: AttrSet::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BackupStatus {
    InProgress,
    Aborted,
    Ready,
}

impl BackupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupStatus::InProgress => "in progress",
            BackupStatus::Aborted => "aborted",
            BackupStatus::Ready => "ready",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "in progress" => BackupStatus::InProgress,
            "aborted" => BackupStatus::Aborted,
            "ready" => BackupStatus::Ready,
            other => {
                return Err(ArchiveError::Integrity(format!(
                    "unknown basebackup status \"{other}\""
                )))
            }
        })
    }
}

/// Catalog entry for a running or finalized base backup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BaseBackupDescr {
    pub id: i64,
    pub archive_id: i64,
    pub xlogpos: Lsn,
    pub xlogposend: Lsn,
    pub timeline: TimeLineId,
    pub label: String,
    /// On-disk directory of this backup, below the archive base directory.
    pub fsentry: String,
    pub started: Option<DateTime<Utc>>,
    pub stopped: Option<DateTime<Utc>>,
    pub pinned: i64,
    pub status: BackupStatus,
    pub systemid: String,
    pub wal_segment_size: u64,
    pub used_profile: i64,
    pub tablespaces: Vec<TablespaceDescr>,
    #[serde(skip)]
    pub attrs: AttrSet,
}

impl Default for BaseBackupDescr {
    fn default() -> Self {
        BaseBackupDescr {
            id: -1,
            archive_id: -1,
            xlogpos: Lsn::INVALID,
            xlogposend: Lsn::INVALID,
            timeline: 0,
            label: String::new(),
            fsentry: String::new(),
            started: None,
            stopped: None,
            pinned: 0,
            status: BackupStatus::InProgress,
            systemid: String::new(),
            wal_segment_size: 0,
            used_profile: -1,
            tablespaces: Vec::new(),
            attrs: AttrSet::new(),
        }
    }
}

/// Tablespace meta information recorded before its bytes are streamed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TablespaceDescr {
    pub id: i64,
    pub backup_id: i64,
    pub spcoid: u32,
    pub spclocation: String,
    pub spcsize: i64,
}

/// Retention rule classes. The numeric codes are the catalog representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RetentionRuleKind {
    KeepWithLabel = 200,
    DropWithLabel = 201,
    KeepNum = 300,
    DropNum = 301,
    KeepNewerByDatetime = 400,
    KeepOlderByDatetime = 401,
    DropNewerByDatetime = 402,
    DropOlderByDatetime = 403,
    Pin = 500,
    Unpin = 600,
    Cleanup = 700,
}

impl RetentionRuleKind {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Result<Self> {
        Ok(match code {
            200 => RetentionRuleKind::KeepWithLabel,
            201 => RetentionRuleKind::DropWithLabel,
            300 => RetentionRuleKind::KeepNum,
            301 => RetentionRuleKind::DropNum,
            400 => RetentionRuleKind::KeepNewerByDatetime,
            401 => RetentionRuleKind::KeepOlderByDatetime,
            402 => RetentionRuleKind::DropNewerByDatetime,
            403 => RetentionRuleKind::DropOlderByDatetime,
            500 => RetentionRuleKind::Pin,
            600 => RetentionRuleKind::Unpin,
            700 => RetentionRuleKind::Cleanup,
            other => {
                return Err(ArchiveError::invalid(
                    "retention rule",
                    format!("unknown rule code {other}"),
                ))
            }
        })
    }
}

/// One rule of a retention policy; `value` holds a label, a count or a
/// compiled interval expression depending on the kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetentionRuleDescr {
    pub id: i64,
    pub kind: RetentionRuleKind,
    pub value: String,
}

/// A named, ordered list of retention rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetentionDescr {
    pub id: i64,
    pub name: String,
    pub created: Option<DateTime<Utc>>,
    pub rules: Vec<RetentionRuleDescr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinTag {
    Pin,
    Unpin,
}

/// What a PIN/UNPIN command operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOperation {
    /// A basebackup referenced by its catalog id.
    Id(i64),
    /// The N oldest basebackups, ascending by creation date.
    Count(u32),
    Newest,
    Oldest,
    /// All currently pinned basebackups; valid for unpin only.
    Pinned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinDescr {
    pub tag: PinTag,
    pub operation: PinOperation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamStatus {
    Identified,
    Streaming,
    Shutdown,
    Failed,
}

impl StreamStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamStatus::Identified => "identified",
            StreamStatus::Streaming => "streaming",
            StreamStatus::Shutdown => "shutdown",
            StreamStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "identified" => StreamStatus::Identified,
            "streaming" => StreamStatus::Streaming,
            "shutdown" => StreamStatus::Shutdown,
            "failed" => StreamStatus::Failed,
            other => {
                return Err(ArchiveError::Integrity(format!(
                    "unknown stream status \"{other}\""
                )))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Ok,
    Exists,
    Error,
}

/// A physical replication slot on the upstream server.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationSlot {
    pub slot_name: String,
    pub consistent_point: Lsn,
    pub existing_ok: bool,
    pub status: SlotStatus,
}

/// Per-session streaming state: one per live streamer process.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamIdent {
    pub id: i64,
    pub archive_id: i64,
    pub slot_name: String,
    pub systemid: String,
    pub timeline: TimeLineId,
    pub xlogpos: Lsn,
    pub status: StreamStatus,
    pub create_date: Option<DateTime<Utc>>,
    /// Populated on connect from the server's `wal_segment_size`.
    pub wal_segment_size: u64,
    pub write_position: Lsn,
    pub flush_position: Lsn,
    pub apply_position: Lsn,
    pub server_position: Lsn,
    pub slot: Option<ReplicationSlot>,
}

impl Default for StreamIdent {
    fn default() -> Self {
        StreamIdent {
            id: -1,
            archive_id: -1,
            slot_name: String::new(),
            systemid: String::new(),
            timeline: 0,
            xlogpos: Lsn::INVALID,
            status: StreamStatus::Identified,
            create_date: None,
            wal_segment_size: 0,
            write_position: Lsn::INVALID,
            flush_position: Lsn::INVALID,
            apply_position: Lsn::INVALID,
            server_position: Lsn::INVALID,
            slot: None,
        }
    }
}

impl StreamIdent {
    /// Advance the server-reported end position. Never moves backwards.
    pub fn update_server_position(&mut self, pos: Lsn) {
        if pos > self.server_position {
            self.server_position = pos;
        }
    }

    /// Advance the write position. Positions only move forward and never
    /// overtake what the server has sent.
    pub fn update_write_position(&mut self, pos: Lsn) -> Result<()> {
        if pos < self.write_position {
            return Err(ArchiveError::Integrity(format!(
                "write position would move backwards: {} -> {}",
                self.write_position, pos
            )));
        }
        if self.server_position.is_valid() && pos > self.server_position {
            return Err(ArchiveError::Integrity(format!(
                "write position {} ahead of server position {}",
                pos, self.server_position
            )));
        }
        self.write_position = pos;
        Ok(())
    }

    /// Advance the flush position; must stay at or below the write position.
    pub fn update_flush_position(&mut self, pos: Lsn) -> Result<()> {
        if pos < self.flush_position {
            return Err(ArchiveError::Integrity(format!(
                "flush position would move backwards: {} -> {}",
                self.flush_position, pos
            )));
        }
        if pos > self.write_position {
            return Err(ArchiveError::Integrity(format!(
                "flush position {} ahead of write position {}",
                pos, self.write_position
            )));
        }
        self.flush_position = pos;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerKind {
    Launcher,
    Streamer,
    Worker,
}

impl WorkerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerKind::Launcher => "launcher",
            WorkerKind::Streamer => "streamer",
            WorkerKind::Worker => "worker",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "launcher" => WorkerKind::Launcher,
            "streamer" => WorkerKind::Streamer,
            "worker" => WorkerKind::Worker,
            other => {
                return Err(ArchiveError::Integrity(format!(
                    "unknown worker type \"{other}\""
                )))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    Running,
    Shutdown,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Running => "running",
            WorkerState::Shutdown => "shutdown",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "running" => WorkerState::Running,
            "shutdown" => WorkerState::Shutdown,
            other => {
                return Err(ArchiveError::Integrity(format!(
                    "unknown worker state \"{other}\""
                )))
            }
        })
    }
}

/// Catalog row for a background process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerDescr {
    pub pid: i64,
    pub archive_id: i64,
    pub kind: WorkerKind,
    pub state: WorkerState,
    pub started: Option<DateTime<Utc>>,
    pub shm_key: i64,
    pub shm_id: i64,
}

/// How much of the WAL archive a cleanup plan releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalCleanupMode {
    /// Delete segments between per-timeline start and end boundaries.
    Range,
    /// Delete segments below a per-timeline offset.
    Offset,
    /// No basebackup remains; the whole WAL archive may go.
    All,
    /// Nothing to delete.
    None,
}

/// Per-timeline WAL boundaries that are safe to delete.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanupOffset {
    pub timeline: TimeLineId,
    pub wal_segment_size: u64,
    pub start: Lsn,
    pub end: Lsn,
}

/// Output of retention evaluation: basebackups newest-first, each tagged
/// keep or delete, plus the WAL ranges released by the decision.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanupDescr {
    /// `(descriptor, keep)`; `keep == false` means elected for deletion.
    pub basebackups: Vec<(BaseBackupDescr, bool)>,
    pub mode: WalCleanupMode,
    pub offsets: Vec<CleanupOffset>,
}

/// Aggregate view over one archive, for `list backup catalog`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatCatalogArchive {
    pub archive_id: i64,
    pub archive_name: String,
    pub archive_directory: String,
    pub archive_host: String,
    pub number_of_backups: i64,
    pub backups_failed: i64,
    pub backups_running: i64,
    pub estimated_total_size: u64,
    pub avg_backup_duration_secs: i64,
    pub latest_finished: String,
}

/// A fully parsed command, ready for the executor. The parser (CLI) fills
/// exactly the fields the tag needs; nested descriptors are immutable
/// snapshots once the command is materialized.
#[derive(Debug, Clone)]
pub struct CommandDescr {
    pub tag: CommandTag,
    /// Original tag of a command wrapped for background execution.
    pub sub_tag: Option<CommandTag>,
    pub archive_name: String,
    pub directory: String,
    pub compression: bool,
    pub connection: ConnectionDescr,
    pub profile: Option<BackupProfileDescr>,
    pub retention: Option<RetentionDescr>,
    pub retention_name: String,
    pub pin: Option<PinDescr>,
    pub basebackup_id: Option<i64>,
    pub slot_name: Option<String>,
    pub var_name: String,
    pub var_value: Option<VarValue>,
    pub exec_string: String,
    pub check_connection: bool,
    /// Detach background workers from the controlling terminal.
    pub detach: bool,
    pub verbose: bool,
    /// Render list output as JSON instead of tables.
    pub json: bool,
    pub attrs: AttrSet,
}

impl CommandDescr {
    pub fn new(tag: CommandTag) -> Self {
        CommandDescr {
            tag,
            sub_tag: None,
            archive_name: String::new(),
            directory: String::new(),
            compression: false,
            connection: ConnectionDescr::default(),
            profile: None,
            retention: None,
            retention_name: String::new(),
            pin: None,
            basebackup_id: None,
            slot_name: None,
            var_name: String::new(),
            var_value: None,
            exec_string: String::new(),
            check_connection: false,
            detach: true,
            verbose: false,
            json: false,
            attrs: AttrSet::new(),
        }
    }

    /// Wrap this command for background execution: the wrapper takes over
    /// the tag, the original is preserved in `sub_tag`.
    pub fn into_background(mut self) -> Self {
        self.sub_tag = Some(self.tag);
        self.tag = CommandTag::BackgroundWorkerCommand;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_set_dedups_and_keeps_order() {
        let mut attrs = AttrSet::new();
        attrs.push(attno::ARCHIVE_NAME);
        attrs.push(attno::ARCHIVE_PGHOST);
        attrs.push(attno::ARCHIVE_NAME);
        assert_eq!(attrs.len(), 2);
        assert_eq!(
            attrs.iter().collect::<Vec<_>>(),
            vec![attno::ARCHIVE_NAME, attno::ARCHIVE_PGHOST]
        );
        assert!(attrs.contains(attno::ARCHIVE_PGHOST));
        assert!(!attrs.contains(attno::ARCHIVE_DIRECTORY));
    }

    #[test]
    fn descriptor_copy_preserves_observable_fields() {
        let mut descr = BaseBackupDescr {
            id: 7,
            archive_id: 1,
            xlogpos: "0/16B3748".parse().unwrap(),
            timeline: 3,
            label: "nightly".into(),
            pinned: 2,
            status: BackupStatus::Ready,
            ..Default::default()
        };
        descr.attrs.push(attno::BACKUP_PINNED);
        let copy = descr.clone();
        assert_eq!(copy, descr);
    }

    #[test]
    fn background_wrap_preserves_tag() {
        let descr = CommandDescr::new(CommandTag::StartBasebackup).into_background();
        assert_eq!(descr.tag, CommandTag::BackgroundWorkerCommand);
        assert_eq!(descr.sub_tag, Some(CommandTag::StartBasebackup));
    }

    #[test]
    fn stream_positions_are_monotonic() {
        let mut ident = StreamIdent {
            wal_segment_size: 16 * 1024 * 1024,
            ..Default::default()
        };
        ident.update_server_position(Lsn(0x300));

        ident.update_write_position(Lsn(0x100)).unwrap();
        ident.update_flush_position(Lsn(0x100)).unwrap();
        ident.update_write_position(Lsn(0x200)).unwrap();

        // Lowering either position is rejected.
        assert!(ident.update_write_position(Lsn(0x80)).is_err());
        assert!(ident.update_flush_position(Lsn(0x80)).is_err());
        // Flush may not overtake write, write may not overtake the server.
        assert!(ident.update_flush_position(Lsn(0x280)).is_err());
        assert!(ident.update_write_position(Lsn(0x400)).is_err());

        ident.update_flush_position(Lsn(0x200)).unwrap();
        assert_eq!(ident.flush_position, Lsn(0x200));

        // A stale server keepalive never pulls the horizon back.
        ident.update_server_position(Lsn(0x250));
        assert_eq!(ident.server_position, Lsn(0x300));
    }

    #[test]
    fn status_texts_round_trip() {
        for status in [
            BackupStatus::InProgress,
            BackupStatus::Aborted,
            BackupStatus::Ready,
        ] {
            assert_eq!(BackupStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(BackupStatus::parse("paused").is_err());
        for kind in [
            RetentionRuleKind::KeepWithLabel,
            RetentionRuleKind::DropNum,
            RetentionRuleKind::Cleanup,
        ] {
            assert_eq!(RetentionRuleKind::from_code(kind.code()).unwrap(), kind);
        }
    }
}
