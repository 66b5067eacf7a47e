//! The backup catalog: a transactional store over SQLite recording archives,
//! connections, backup profiles, base backups, tablespaces, retention
//! policies, worker processes and streaming positions.
//!
//! The catalog is the only resource shared between commands and worker
//! processes. Writers serialize through explicit transactions on the handle;
//! a write transaction holds the database lock until commit or rollback.
//!
//! Lookups return `Option`: an absent row is not an error at this boundary,
//! the caller decides whether it is fatal.

pub mod descr;

use std::cell::Cell;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::error::{ArchiveError, Entity, Result};
use crate::retention::IntervalExpr;
use crate::wal::Lsn;
use descr::*;

/// Bumped whenever the schema changes incompatibly.
const SCHEMA_VERSION: i32 = 1;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn ts_to_text(ts: &Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|t| t.format(TIMESTAMP_FORMAT).to_string())
}

fn text_to_ts(text: Option<String>) -> Result<Option<DateTime<Utc>>> {
    match text {
        None => Ok(None),
        Some(s) => {
            let naive = NaiveDateTime::parse_from_str(&s, TIMESTAMP_FORMAT)
                .map_err(|e| ArchiveError::Integrity(format!("bad catalog timestamp: {e}")))?;
            Ok(Some(naive.and_utc()))
        }
    }
}

fn lsn_to_text(lsn: Lsn) -> Option<String> {
    lsn.is_valid().then(|| lsn.to_string())
}

fn text_to_lsn(text: Option<String>) -> Result<Lsn> {
    match text {
        None => Ok(Lsn::INVALID),
        Some(s) => s
            .parse()
            .map_err(|_| ArchiveError::Integrity(format!("bad LSN in catalog: \"{s}\""))),
    }
}

/// Which end of the backup list a single-row lookup wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrieveMode {
    Newest,
    Oldest,
}

/// Handle to the catalog database of one archive directory tree.
pub struct BackupCatalog {
    path: PathBuf,
    conn: Option<Connection>,
    tx_in_progress: Cell<bool>,
}

impl BackupCatalog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        BackupCatalog {
            path: path.as_ref().to_path_buf(),
            conn: None,
            tx_in_progress: Cell::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn available(&self) -> bool {
        self.conn.is_some()
    }

    /// Open the catalog read/write, creating and seeding the schema on
    /// first use. Re-opening an open handle is a no-op.
    pub fn open_rw(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "foreign_keys", "on")?;

        let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if version == 0 {
            conn.execute_batch(SCHEMA_SQL)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            debug!("initialized catalog schema at {}", self.path.display());
        } else if version != SCHEMA_VERSION {
            return Err(ArchiveError::Integrity(format!(
                "catalog schema version {version}, expected {SCHEMA_VERSION}"
            )));
        }

        self.conn = Some(conn);
        self.ensure_default_profile()?;
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.close();
        }
        self.tx_in_progress.set(false);
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn.as_ref().ok_or(ArchiveError::CatalogUnavailable)
    }

    /* ---------------- transactions ---------------- */

    /// Begin a write transaction. Transactions are non-reentrant per handle.
    pub fn start_transaction(&self) -> Result<()> {
        if self.tx_in_progress.get() {
            return Err(ArchiveError::Integrity(
                "transaction already in progress".into(),
            ));
        }
        self.conn()?.execute_batch("BEGIN IMMEDIATE")?;
        self.tx_in_progress.set(true);
        Ok(())
    }

    pub fn commit_transaction(&self) -> Result<()> {
        if !self.tx_in_progress.get() {
            return Err(ArchiveError::Integrity("no transaction in progress".into()));
        }
        self.conn()?.execute_batch("COMMIT")?;
        self.tx_in_progress.set(false);
        Ok(())
    }

    pub fn rollback_transaction(&self) -> Result<()> {
        if !self.tx_in_progress.get() {
            return Err(ArchiveError::Integrity("no transaction in progress".into()));
        }
        self.conn()?.execute_batch("ROLLBACK")?;
        self.tx_in_progress.set(false);
        Ok(())
    }

    pub fn transaction_in_progress(&self) -> bool {
        self.tx_in_progress.get()
    }

    /// Run `body` inside a transaction, committing on success. On any error
    /// the transaction is rolled back and the original error is returned;
    /// a rollback failure never shadows it.
    pub fn within_transaction<T>(&self, body: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        self.start_transaction()?;
        match body(self) {
            Ok(value) => {
                self.commit_transaction()?;
                Ok(value)
            }
            Err(e) => {
                let _ = self.rollback_transaction();
                Err(e)
            }
        }
    }

    /* ---------------- archives ---------------- */

    /// Register a new archive. The caller provides name, directory,
    /// compression and the connection columns; the fresh id is written back.
    pub fn create_archive(&self, descr: &mut ArchiveDescr) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO archive(name, directory, compression, pghost, pgport, pguser, pgdatabase)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                descr.name,
                descr.directory,
                descr.compression,
                descr.pghost,
                descr.pgport,
                descr.pguser,
                descr.pgdatabase,
            ],
        )?;
        descr.id = conn.last_insert_rowid();
        Ok(())
    }

    fn archive_from_row(row: &Row<'_>) -> rusqlite::Result<ArchiveDescr> {
        Ok(ArchiveDescr {
            id: row.get(0)?,
            name: row.get(1)?,
            directory: row.get(2)?,
            compression: row.get(3)?,
            pghost: row.get(4)?,
            pgport: row.get(5)?,
            pguser: row.get(6)?,
            pgdatabase: row.get(7)?,
            attrs: AttrSet::new(),
        })
    }

    const ARCHIVE_COLS: &'static str =
        "id, name, directory, compression, pghost, pgport, pguser, pgdatabase";

    pub fn exists_by_name(&self, name: &str) -> Result<Option<ArchiveDescr>> {
        let sql = format!("SELECT {} FROM archive WHERE name = ?1", Self::ARCHIVE_COLS);
        Ok(self
            .conn()?
            .query_row(&sql, params![name], Self::archive_from_row)
            .optional()?)
    }

    pub fn exists_by_directory(&self, directory: &str) -> Result<Option<ArchiveDescr>> {
        let sql = format!(
            "SELECT {} FROM archive WHERE directory = ?1",
            Self::ARCHIVE_COLS
        );
        Ok(self
            .conn()?
            .query_row(&sql, params![directory], Self::archive_from_row)
            .optional()?)
    }

    /// Drop an archive and everything hanging off it (connections, backups,
    /// tablespaces, streams) via foreign-key cascade.
    pub fn drop_archive(&self, name: &str) -> Result<()> {
        let dropped = self
            .conn()?
            .execute("DELETE FROM archive WHERE name = ?1", params![name])?;
        if dropped == 0 {
            return Err(ArchiveError::not_found(Entity::Archive, name));
        }
        Ok(())
    }

    fn archive_column(col: usize) -> Result<&'static str> {
        Ok(match col {
            attno::ARCHIVE_ID => "id",
            attno::ARCHIVE_NAME => "name",
            attno::ARCHIVE_DIRECTORY => "directory",
            attno::ARCHIVE_COMPRESSION => "compression",
            attno::ARCHIVE_PGHOST => "pghost",
            attno::ARCHIVE_PGPORT => "pgport",
            attno::ARCHIVE_PGUSER => "pguser",
            attno::ARCHIVE_PGDATABASE => "pgdatabase",
            other => {
                return Err(ArchiveError::invalid(
                    "attribute",
                    format!("unknown archive column tag {other}"),
                ))
            }
        })
    }

    fn archive_value(descr: &ArchiveDescr, col: usize) -> Result<Value> {
        Ok(match col {
            attno::ARCHIVE_ID => Value::Integer(descr.id),
            attno::ARCHIVE_NAME => Value::Text(descr.name.clone()),
            attno::ARCHIVE_DIRECTORY => Value::Text(descr.directory.clone()),
            attno::ARCHIVE_COMPRESSION => Value::Integer(descr.compression as i64),
            attno::ARCHIVE_PGHOST => Value::Text(descr.pghost.clone()),
            attno::ARCHIVE_PGPORT => Value::Integer(descr.pgport),
            attno::ARCHIVE_PGUSER => Value::Text(descr.pguser.clone()),
            attno::ARCHIVE_PGDATABASE => Value::Text(descr.pgdatabase.clone()),
            other => {
                return Err(ArchiveError::invalid(
                    "attribute",
                    format!("unknown archive column tag {other}"),
                ))
            }
        })
    }

    /// Update exactly the columns named in `attrs`; all others keep their
    /// stored value.
    pub fn update_archive_attributes(&self, descr: &ArchiveDescr, attrs: &AttrSet) -> Result<()> {
        if attrs.is_empty() {
            return Ok(());
        }
        let mut assignments = Vec::with_capacity(attrs.len());
        let mut values: Vec<Value> = Vec::with_capacity(attrs.len() + 1);
        for (i, col) in attrs.iter().enumerate() {
            assignments.push(format!("{} = ?{}", Self::archive_column(col)?, i + 1));
            values.push(Self::archive_value(descr, col)?);
        }
        values.push(Value::Integer(descr.id));
        let sql = format!(
            "UPDATE archive SET {} WHERE id = ?{}",
            assignments.join(", "),
            values.len()
        );
        self.conn()?.execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    /// List archives; with a filter descriptor, the columns named in its
    /// attribute set become equality conditions.
    pub fn get_archive_list(&self, filter: Option<&ArchiveDescr>) -> Result<Vec<ArchiveDescr>> {
        let mut sql = format!("SELECT {} FROM archive", Self::ARCHIVE_COLS);
        let mut values: Vec<Value> = Vec::new();
        if let Some(filter) = filter {
            let mut conditions = Vec::new();
            for (i, col) in filter.attrs.iter().enumerate() {
                conditions.push(format!("{} = ?{}", Self::archive_column(col)?, i + 1));
                values.push(Self::archive_value(filter, col)?);
            }
            if !conditions.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&conditions.join(" AND "));
            }
        }
        sql.push_str(" ORDER BY name");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), Self::archive_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /* ---------------- connections ---------------- */

    pub fn create_connection(&self, con: &ConnectionDescr) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO connections(archive_id, type, dsn, pghost, pgport, pguser, pgdatabase)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                con.archive_id,
                con.kind.as_str(),
                con.dsn,
                con.pghost,
                con.pgport,
                con.pguser,
                con.pgdatabase,
            ],
        )?;
        Ok(())
    }

    fn connection_from_row(row: &Row<'_>) -> rusqlite::Result<(ConnectionDescr, String)> {
        let kind: String = row.get(1)?;
        Ok((
            ConnectionDescr {
                archive_id: row.get(0)?,
                kind: ConnectionKind::Basebackup,
                dsn: row.get(2)?,
                pghost: row.get(3)?,
                pgport: row.get(4)?,
                pguser: row.get(5)?,
                pgdatabase: row.get(6)?,
                attrs: AttrSet::new(),
            },
            kind,
        ))
    }

    pub fn get_connection(
        &self,
        archive_id: i64,
        kind: ConnectionKind,
    ) -> Result<Option<ConnectionDescr>> {
        let raw = self
            .conn()?
            .query_row(
                "SELECT archive_id, type, dsn, pghost, pgport, pguser, pgdatabase
                 FROM connections WHERE archive_id = ?1 AND type = ?2",
                params![archive_id, kind.as_str()],
                Self::connection_from_row,
            )
            .optional()?;
        match raw {
            None => Ok(None),
            Some((mut con, kind_text)) => {
                con.kind = ConnectionKind::parse(&kind_text)?;
                Ok(Some(con))
            }
        }
    }

    pub fn get_connections(&self, archive_id: i64) -> Result<Vec<ConnectionDescr>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT archive_id, type, dsn, pghost, pgport, pguser, pgdatabase
             FROM connections WHERE archive_id = ?1 ORDER BY type",
        )?;
        let raw: Vec<(ConnectionDescr, String)> = stmt
            .query_map(params![archive_id], Self::connection_from_row)?
            .collect::<rusqlite::Result<_>>()?;
        raw.into_iter()
            .map(|(mut con, kind_text)| {
                con.kind = ConnectionKind::parse(&kind_text)?;
                Ok(con)
            })
            .collect()
    }

    pub fn drop_connection(&self, archive_id: i64, kind: ConnectionKind) -> Result<()> {
        let dropped = self.conn()?.execute(
            "DELETE FROM connections WHERE archive_id = ?1 AND type = ?2",
            params![archive_id, kind.as_str()],
        )?;
        if dropped == 0 {
            return Err(ArchiveError::not_found(Entity::Connection, kind.as_str()));
        }
        Ok(())
    }

    /* ---------------- backup profiles ---------------- */

    /// The profile named `default` must exist after catalog initialization;
    /// commands without an explicit PROFILE fall back to it.
    fn ensure_default_profile(&self) -> Result<()> {
        if self.get_backup_profile("default")?.is_none() {
            let profile = BackupProfileDescr {
                name: "default".to_string(),
                ..Default::default()
            };
            self.create_backup_profile(&profile)?;
        }
        Ok(())
    }

    pub fn create_backup_profile(&self, profile: &BackupProfileDescr) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO backup_profiles(name, compress_type, max_rate, label,
                                         fast_checkpoint, include_wal, wait_for_wal, noverify_checksums)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                profile.name,
                profile.compress_type.code(),
                profile.max_rate,
                profile.label,
                profile.fast_checkpoint,
                profile.include_wal,
                profile.wait_for_wal,
                profile.noverify_checksums,
            ],
        )?;
        Ok(())
    }

    fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<(BackupProfileDescr, i64)> {
        let compress_code: i64 = row.get(2)?;
        Ok((
            BackupProfileDescr {
                id: row.get(0)?,
                name: row.get(1)?,
                compress_type: CompressionKind::None,
                max_rate: row.get(3)?,
                label: row.get(4)?,
                fast_checkpoint: row.get(5)?,
                include_wal: row.get(6)?,
                wait_for_wal: row.get(7)?,
                noverify_checksums: row.get(8)?,
                attrs: AttrSet::new(),
            },
            compress_code,
        ))
    }

    const PROFILE_COLS: &'static str = "id, name, compress_type, max_rate, label, \
         fast_checkpoint, include_wal, wait_for_wal, noverify_checksums";

    pub fn get_backup_profile(&self, name: &str) -> Result<Option<BackupProfileDescr>> {
        let sql = format!(
            "SELECT {} FROM backup_profiles WHERE name = ?1",
            Self::PROFILE_COLS
        );
        let raw = self
            .conn()?
            .query_row(&sql, params![name], Self::profile_from_row)
            .optional()?;
        match raw {
            None => Ok(None),
            Some((mut profile, code)) => {
                profile.compress_type = CompressionKind::from_code(code)?;
                Ok(Some(profile))
            }
        }
    }

    pub fn get_backup_profiles(&self) -> Result<Vec<BackupProfileDescr>> {
        let sql = format!(
            "SELECT {} FROM backup_profiles ORDER BY name",
            Self::PROFILE_COLS
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let raw: Vec<(BackupProfileDescr, i64)> = stmt
            .query_map([], Self::profile_from_row)?
            .collect::<rusqlite::Result<_>>()?;
        raw.into_iter()
            .map(|(mut profile, code)| {
                profile.compress_type = CompressionKind::from_code(code)?;
                Ok(profile)
            })
            .collect()
    }

    pub fn drop_backup_profile(&self, name: &str) -> Result<()> {
        let dropped = self
            .conn()?
            .execute("DELETE FROM backup_profiles WHERE name = ?1", params![name])?;
        if dropped == 0 {
            return Err(ArchiveError::not_found(Entity::Profile, name));
        }
        Ok(())
    }

    /* ---------------- base backups ---------------- */

    /// Register a base backup entering the `in progress` state. `started`
    /// defaults to now; the fresh id is written back into the descriptor.
    pub fn register_basebackup(&self, archive_id: i64, descr: &mut BaseBackupDescr) -> Result<()> {
        descr.archive_id = archive_id;
        descr.status = BackupStatus::InProgress;
        if descr.started.is_none() {
            descr.started = Some(Utc::now());
        }
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO backup(archive_id, fsentry, label, started, stopped, pinned, status,
                                xlogpos, xlogposend, timeline, systemid, wal_segment_size, used_profile)
             VALUES (?1, ?2, ?3, ?4, NULL, 0, ?5, ?6, NULL, ?7, ?8, ?9, ?10)",
            params![
                descr.archive_id,
                descr.fsentry,
                descr.label,
                ts_to_text(&descr.started),
                BackupStatus::InProgress.as_str(),
                lsn_to_text(descr.xlogpos),
                descr.timeline,
                descr.systemid,
                descr.wal_segment_size as i64,
                descr.used_profile,
            ],
        )?;
        descr.id = conn.last_insert_rowid();
        Ok(())
    }

    fn backup_status(&self, backup_id: i64) -> Result<BackupStatus> {
        let status: Option<String> = self
            .conn()?
            .query_row(
                "SELECT status FROM backup WHERE id = ?1",
                params![backup_id],
                |row| row.get(0),
            )
            .optional()?;
        match status {
            None => Err(ArchiveError::not_found(
                Entity::Basebackup,
                backup_id.to_string(),
            )),
            Some(s) => BackupStatus::parse(&s),
        }
    }

    /// Mark a running base backup as aborted. Only legal while the backup
    /// is `in progress`.
    pub fn abort_basebackup(&self, descr: &mut BaseBackupDescr) -> Result<()> {
        if self.backup_status(descr.id)? != BackupStatus::InProgress {
            return Err(ArchiveError::Integrity(format!(
                "cannot abort basebackup {}: not in progress",
                descr.id
            )));
        }
        descr.status = BackupStatus::Aborted;
        descr.stopped = Some(Utc::now());
        self.conn()?.execute(
            "UPDATE backup SET status = ?1, stopped = ?2 WHERE id = ?3",
            params![
                BackupStatus::Aborted.as_str(),
                ts_to_text(&descr.stopped),
                descr.id
            ],
        )?;
        Ok(())
    }

    /// Transition a running base backup to `ready`, recording its end
    /// position. Requires `xlogposend >= xlogpos`.
    pub fn finalize_basebackup(&self, descr: &mut BaseBackupDescr) -> Result<()> {
        if self.backup_status(descr.id)? != BackupStatus::InProgress {
            return Err(ArchiveError::Integrity(format!(
                "cannot finalize basebackup {}: not in progress",
                descr.id
            )));
        }
        if descr.xlogposend < descr.xlogpos {
            return Err(ArchiveError::Integrity(format!(
                "basebackup {} end position {} below start position {}",
                descr.id, descr.xlogposend, descr.xlogpos
            )));
        }
        descr.status = BackupStatus::Ready;
        descr.stopped = Some(Utc::now());
        self.conn()?.execute(
            "UPDATE backup SET status = ?1, stopped = ?2, xlogposend = ?3 WHERE id = ?4",
            params![
                BackupStatus::Ready.as_str(),
                ts_to_text(&descr.stopped),
                lsn_to_text(descr.xlogposend),
                descr.id
            ],
        )?;
        Ok(())
    }

    const BACKUP_COLS: &'static str = "id, archive_id, fsentry, label, started, stopped, pinned, \
         status, xlogpos, xlogposend, timeline, systemid, wal_segment_size, used_profile";

    #[allow(clippy::type_complexity)]
    fn backup_from_row(
        row: &Row<'_>,
    ) -> rusqlite::Result<(
        BaseBackupDescr,
        Option<String>,
        Option<String>,
        String,
        Option<String>,
        Option<String>,
    )> {
        let started: Option<String> = row.get(4)?;
        let stopped: Option<String> = row.get(5)?;
        let status: String = row.get(7)?;
        let xlogpos: Option<String> = row.get(8)?;
        let xlogposend: Option<String> = row.get(9)?;
        Ok((
            BaseBackupDescr {
                id: row.get(0)?,
                archive_id: row.get(1)?,
                fsentry: row.get(2)?,
                label: row.get(3)?,
                pinned: row.get(6)?,
                timeline: row.get(10)?,
                systemid: row.get::<_, Option<String>>(11)?.unwrap_or_default(),
                wal_segment_size: row.get::<_, i64>(12)? as u64,
                used_profile: row.get(13)?,
                ..Default::default()
            },
            started,
            stopped,
            status,
            xlogpos,
            xlogposend,
        ))
    }

    #[allow(clippy::type_complexity)]
    fn finish_backup_row(
        raw: (
            BaseBackupDescr,
            Option<String>,
            Option<String>,
            String,
            Option<String>,
            Option<String>,
        ),
    ) -> Result<BaseBackupDescr> {
        let (mut descr, started, stopped, status, xlogpos, xlogposend) = raw;
        descr.started = text_to_ts(started)?;
        descr.stopped = text_to_ts(stopped)?;
        descr.status = BackupStatus::parse(&status)?;
        descr.xlogpos = text_to_lsn(xlogpos)?;
        descr.xlogposend = text_to_lsn(xlogposend)?;
        Ok(descr)
    }

    /// All base backups of an archive, newest first (by `started`, id as
    /// tie-break), with their tablespaces attached.
    pub fn get_backup_list(&self, archive_id: i64) -> Result<Vec<BaseBackupDescr>> {
        let sql = format!(
            "SELECT {} FROM backup WHERE archive_id = ?1 ORDER BY started DESC, id DESC",
            Self::BACKUP_COLS
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let raw: Vec<_> = stmt
            .query_map(params![archive_id], Self::backup_from_row)?
            .collect::<rusqlite::Result<_>>()?;
        let mut backups = raw
            .into_iter()
            .map(Self::finish_backup_row)
            .collect::<Result<Vec<_>>>()?;
        for backup in &mut backups {
            backup.tablespaces = self.get_tablespaces_for_backup(backup.id)?;
        }
        Ok(backups)
    }

    pub fn get_basebackup_by_id(&self, backup_id: i64) -> Result<Option<BaseBackupDescr>> {
        let sql = format!("SELECT {} FROM backup WHERE id = ?1", Self::BACKUP_COLS);
        let raw = self
            .conn()?
            .query_row(&sql, params![backup_id], Self::backup_from_row)
            .optional()?;
        raw.map(Self::finish_backup_row).transpose()
    }

    /// Newest or oldest `ready` base backup of an archive.
    pub fn get_basebackup(
        &self,
        archive_id: i64,
        mode: RetrieveMode,
    ) -> Result<Option<BaseBackupDescr>> {
        let order = match mode {
            RetrieveMode::Newest => "DESC",
            RetrieveMode::Oldest => "ASC",
        };
        let sql = format!(
            "SELECT {} FROM backup WHERE archive_id = ?1 AND status = ?2
             ORDER BY started {order}, id {order} LIMIT 1",
            Self::BACKUP_COLS
        );
        let raw = self
            .conn()?
            .query_row(
                &sql,
                params![archive_id, BackupStatus::Ready.as_str()],
                Self::backup_from_row,
            )
            .optional()?;
        raw.map(Self::finish_backup_row).transpose()
    }

    /// Adjust the pin counter of the given base backups. Unpinning never
    /// drops the counter below zero.
    pub fn pin_basebackups(&self, backup_ids: &[i64], pin: bool) -> Result<()> {
        let conn = self.conn()?;
        for &id in backup_ids {
            if pin {
                conn.execute(
                    "UPDATE backup SET pinned = pinned + 1 WHERE id = ?1",
                    params![id],
                )?;
            } else {
                conn.execute(
                    "UPDATE backup SET pinned = MAX(pinned - 1, 0) WHERE id = ?1",
                    params![id],
                )?;
            }
        }
        Ok(())
    }

    /// Ids of all basebackups with a pin count above zero, oldest first.
    pub fn pinned_basebackups(&self, archive_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM backup WHERE archive_id = ?1 AND pinned > 0 ORDER BY started, id",
        )?;
        let ids = stmt.query_map(params![archive_id], |row| row.get(0))?;
        Ok(ids.collect::<rusqlite::Result<_>>()?)
    }

    pub fn drop_basebackup(&self, backup_id: i64) -> Result<()> {
        let dropped = self
            .conn()?
            .execute("DELETE FROM backup WHERE id = ?1", params![backup_id])?;
        if dropped == 0 {
            return Err(ArchiveError::not_found(
                Entity::Basebackup,
                backup_id.to_string(),
            ));
        }
        Ok(())
    }

    /// Ids of basebackups whose `started` lies beyond `now() - interval`
    /// (older) or within it (newer). The interval operands are bound
    /// separately; nothing user-supplied enters the statement text.
    pub fn backups_exceeding_datetime(
        &self,
        archive_id: i64,
        interval: &IntervalExpr,
        older: bool,
    ) -> Result<Vec<i64>> {
        let (expr, operands) = interval.sqlite_datetime_expr(2);
        let cmp = if older { "<" } else { ">=" };
        let sql = format!(
            "SELECT id FROM backup WHERE archive_id = ?1 AND started {cmp} {expr}
             ORDER BY started DESC, id DESC"
        );
        let mut values: Vec<Value> = vec![Value::Integer(archive_id)];
        values.extend(operands.into_iter().map(Value::Text));
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt.query_map(params_from_iter(values), |row| row.get(0))?;
        Ok(ids.collect::<rusqlite::Result<_>>()?)
    }

    /* ---------------- tablespaces ---------------- */

    /// Record tablespace meta information for a backup. Happens before the
    /// tablespace bytes are streamed.
    pub fn register_tablespace_for_backup(&self, descr: &mut TablespaceDescr) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO backup_tablespaces(backup_id, spcoid, spclocation, spcsize)
             VALUES (?1, ?2, ?3, ?4)",
            params![descr.backup_id, descr.spcoid, descr.spclocation, descr.spcsize],
        )?;
        descr.id = conn.last_insert_rowid();
        Ok(())
    }

    pub fn get_tablespaces_for_backup(&self, backup_id: i64) -> Result<Vec<TablespaceDescr>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, backup_id, spcoid, spclocation, spcsize
             FROM backup_tablespaces WHERE backup_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![backup_id], |row| {
            Ok(TablespaceDescr {
                id: row.get(0)?,
                backup_id: row.get(1)?,
                spcoid: row.get(2)?,
                spclocation: row.get(3)?,
                spcsize: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /* ---------------- retention policies ---------------- */

    pub fn create_retention_policy(&self, descr: &mut RetentionDescr) -> Result<()> {
        if descr.created.is_none() {
            descr.created = Some(Utc::now());
        }
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO retention(name, created) VALUES (?1, ?2)",
            params![descr.name, ts_to_text(&descr.created)],
        )?;
        descr.id = conn.last_insert_rowid();
        for rule in &mut descr.rules {
            conn.execute(
                "INSERT INTO retention_rules(retention_id, type, value) VALUES (?1, ?2, ?3)",
                params![descr.id, rule.kind.code(), rule.value],
            )?;
            rule.id = conn.last_insert_rowid();
        }
        Ok(())
    }

    fn load_rules(&self, retention_id: i64) -> Result<Vec<RetentionRuleDescr>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, type, value FROM retention_rules WHERE retention_id = ?1 ORDER BY id",
        )?;
        let raw: Vec<(i64, i64, String)> = stmt
            .query_map(params![retention_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<_>>()?;
        raw.into_iter()
            .map(|(id, code, value)| {
                Ok(RetentionRuleDescr {
                    id,
                    kind: RetentionRuleKind::from_code(code)?,
                    value,
                })
            })
            .collect()
    }

    pub fn get_retention_policy(&self, name: &str) -> Result<Option<RetentionDescr>> {
        let raw: Option<(i64, String, Option<String>)> = self
            .conn()?
            .query_row(
                "SELECT id, name, created FROM retention WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        match raw {
            None => Ok(None),
            Some((id, name, created)) => Ok(Some(RetentionDescr {
                id,
                name,
                created: text_to_ts(created)?,
                rules: self.load_rules(id)?,
            })),
        }
    }

    pub fn get_retention_policies(&self) -> Result<Vec<RetentionDescr>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, name, created FROM retention ORDER BY name")?;
        let raw: Vec<(i64, String, Option<String>)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<rusqlite::Result<_>>()?;
        raw.into_iter()
            .map(|(id, name, created)| {
                Ok(RetentionDescr {
                    id,
                    name,
                    created: text_to_ts(created)?,
                    rules: self.load_rules(id)?,
                })
            })
            .collect()
    }

    pub fn drop_retention_policy(&self, name: &str) -> Result<()> {
        let dropped = self
            .conn()?
            .execute("DELETE FROM retention WHERE name = ?1", params![name])?;
        if dropped == 0 {
            return Err(ArchiveError::not_found(Entity::RetentionPolicy, name));
        }
        Ok(())
    }

    /* ---------------- streams ---------------- */

    pub fn register_stream(&self, ident: &mut StreamIdent) -> Result<()> {
        if ident.create_date.is_none() {
            ident.create_date = Some(Utc::now());
        }
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO streams(archive_id, slot_name, systemid, timeline, xlogpos, status, create_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                ident.archive_id,
                ident.slot_name,
                ident.systemid,
                ident.timeline,
                lsn_to_text(ident.xlogpos),
                ident.status.as_str(),
                ts_to_text(&ident.create_date),
            ],
        )?;
        ident.id = conn.last_insert_rowid();
        Ok(())
    }

    pub fn update_stream_status(&self, stream_id: i64, status: StreamStatus) -> Result<()> {
        self.conn()?.execute(
            "UPDATE streams SET status = ?1 WHERE id = ?2",
            params![status.as_str(), stream_id],
        )?;
        Ok(())
    }

    /// Persist the stream's restart position, typically after a segment
    /// has been flushed.
    pub fn update_stream_position(&self, stream_id: i64, xlogpos: Lsn) -> Result<()> {
        self.conn()?.execute(
            "UPDATE streams SET xlogpos = ?1 WHERE id = ?2",
            params![lsn_to_text(xlogpos), stream_id],
        )?;
        Ok(())
    }

    pub fn get_streams(&self, archive_id: i64) -> Result<Vec<StreamIdent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, archive_id, slot_name, systemid, timeline, xlogpos, status, create_date
             FROM streams WHERE archive_id = ?1 ORDER BY id",
        )?;
        #[allow(clippy::type_complexity)]
        let raw: Vec<(
            i64,
            i64,
            String,
            String,
            u32,
            Option<String>,
            String,
            Option<String>,
        )> = stmt
            .query_map(params![archive_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;
        raw.into_iter()
            .map(
                |(id, archive_id, slot_name, systemid, timeline, xlogpos, status, create_date)| {
                    Ok(StreamIdent {
                        id,
                        archive_id,
                        slot_name,
                        systemid,
                        timeline,
                        xlogpos: text_to_lsn(xlogpos)?,
                        status: StreamStatus::parse(&status)?,
                        create_date: text_to_ts(create_date)?,
                        ..Default::default()
                    })
                },
            )
            .collect()
    }

    /* ---------------- worker processes ---------------- */

    /// Register a worker process. At most one launcher may be registered at
    /// a time; the partial unique index rejects a second one.
    pub fn register_worker(&self, worker: &WorkerDescr) -> Result<()> {
        let result = self.conn()?.execute(
            "INSERT INTO procs(pid, archive_id, type, state, started, shm_key, shm_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                worker.pid,
                worker.archive_id,
                worker.kind.as_str(),
                worker.state.as_str(),
                ts_to_text(&worker.started),
                worker.shm_key,
                worker.shm_id,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
                    && worker.kind == WorkerKind::Launcher =>
            {
                Err(ArchiveError::already_exists(Entity::Worker, "launcher"))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn update_worker_state(&self, pid: i64, state: WorkerState) -> Result<()> {
        self.conn()?.execute(
            "UPDATE procs SET state = ?1 WHERE pid = ?2",
            params![state.as_str(), pid],
        )?;
        Ok(())
    }

    pub fn unregister_worker(&self, pid: i64) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM procs WHERE pid = ?1", params![pid])?;
        Ok(())
    }

    pub fn get_workers(&self) -> Result<Vec<WorkerDescr>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT pid, archive_id, type, state, started, shm_key, shm_id
             FROM procs ORDER BY started, pid",
        )?;
        #[allow(clippy::type_complexity)]
        let raw: Vec<(i64, i64, String, String, Option<String>, i64, i64)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;
        raw.into_iter()
            .map(|(pid, archive_id, kind, state, started, shm_key, shm_id)| {
                Ok(WorkerDescr {
                    pid,
                    archive_id,
                    kind: WorkerKind::parse(&kind)?,
                    state: WorkerState::parse(&state)?,
                    started: text_to_ts(started)?,
                    shm_key,
                    shm_id,
                })
            })
            .collect()
    }

    /* ---------------- stats ---------------- */

    /// Aggregate counts and durations for one archive, for display.
    pub fn stat_catalog(&self, archive_name: &str) -> Result<StatCatalogArchive> {
        let archive = self
            .exists_by_name(archive_name)?
            .ok_or_else(|| ArchiveError::not_found(Entity::Archive, archive_name))?;
        let conn = self.conn()?;
        let (total, failed, running, avg_duration, latest_finished): (
            i64,
            i64,
            i64,
            Option<f64>,
            Option<String>,
        ) = conn.query_row(
            "SELECT COUNT(*),
                    COUNT(*) FILTER (WHERE status = 'aborted'),
                    COUNT(*) FILTER (WHERE status = 'in progress'),
                    AVG(strftime('%s', stopped) - strftime('%s', started))
                        FILTER (WHERE status = 'ready'),
                    MAX(stopped) FILTER (WHERE status = 'ready')
             FROM backup WHERE archive_id = ?1",
            params![archive.id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            },
        )?;
        let estimated_total_size: i64 = conn.query_row(
            "SELECT COALESCE(SUM(t.spcsize), 0)
             FROM backup_tablespaces t JOIN backup b ON b.id = t.backup_id
             WHERE b.archive_id = ?1 AND b.status = 'ready'",
            params![archive.id],
            |row| row.get(0),
        )?;
        Ok(StatCatalogArchive {
            archive_id: archive.id,
            archive_name: archive.name,
            archive_directory: archive.directory,
            archive_host: archive.pghost,
            number_of_backups: total,
            backups_failed: failed,
            backups_running: running,
            estimated_total_size: estimated_total_size.max(0) as u64,
            avg_backup_duration_secs: avg_duration.unwrap_or(0.0) as i64,
            latest_finished: latest_finished.unwrap_or_else(|| "N/A".to_string()),
        })
    }
}

const SCHEMA_SQL: &str = "
CREATE TABLE archive(
    id          INTEGER PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    directory   TEXT NOT NULL UNIQUE,
    compression INTEGER NOT NULL DEFAULT 0,
    pghost      TEXT NOT NULL DEFAULT '',
    pgport      INTEGER NOT NULL DEFAULT 5432,
    pguser      TEXT NOT NULL DEFAULT '',
    pgdatabase  TEXT NOT NULL DEFAULT ''
);

CREATE TABLE connections(
    archive_id  INTEGER NOT NULL REFERENCES archive(id) ON DELETE CASCADE,
    type        TEXT NOT NULL,
    dsn         TEXT NOT NULL DEFAULT '',
    pghost      TEXT NOT NULL DEFAULT '',
    pgport      INTEGER NOT NULL DEFAULT 5432,
    pguser      TEXT NOT NULL DEFAULT '',
    pgdatabase  TEXT NOT NULL DEFAULT '',
    PRIMARY KEY(archive_id, type)
);

CREATE TABLE backup_profiles(
    id                  INTEGER PRIMARY KEY,
    name                TEXT NOT NULL UNIQUE,
    compress_type       INTEGER NOT NULL DEFAULT 0,
    max_rate            INTEGER NOT NULL DEFAULT 0,
    label               TEXT NOT NULL,
    fast_checkpoint     INTEGER NOT NULL DEFAULT 0,
    include_wal         INTEGER NOT NULL DEFAULT 0,
    wait_for_wal        INTEGER NOT NULL DEFAULT 1,
    noverify_checksums  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE backup(
    id                INTEGER PRIMARY KEY,
    archive_id        INTEGER NOT NULL REFERENCES archive(id) ON DELETE CASCADE,
    fsentry           TEXT NOT NULL,
    label             TEXT NOT NULL DEFAULT '',
    started           TEXT,
    stopped           TEXT,
    pinned            INTEGER NOT NULL DEFAULT 0,
    status            TEXT NOT NULL DEFAULT 'in progress',
    xlogpos           TEXT,
    xlogposend        TEXT,
    timeline          INTEGER NOT NULL DEFAULT 0,
    systemid          TEXT,
    wal_segment_size  INTEGER NOT NULL DEFAULT 0,
    used_profile      INTEGER NOT NULL DEFAULT -1
);

CREATE TABLE backup_tablespaces(
    id          INTEGER PRIMARY KEY,
    backup_id   INTEGER NOT NULL REFERENCES backup(id) ON DELETE CASCADE,
    spcoid      INTEGER NOT NULL,
    spclocation TEXT NOT NULL DEFAULT '',
    spcsize     INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE retention(
    id      INTEGER PRIMARY KEY,
    name    TEXT NOT NULL UNIQUE,
    created TEXT
);

CREATE TABLE retention_rules(
    id           INTEGER PRIMARY KEY,
    retention_id INTEGER NOT NULL REFERENCES retention(id) ON DELETE CASCADE,
    type         INTEGER NOT NULL,
    value        TEXT NOT NULL DEFAULT ''
);

CREATE TABLE streams(
    id          INTEGER PRIMARY KEY,
    archive_id  INTEGER NOT NULL REFERENCES archive(id) ON DELETE CASCADE,
    slot_name   TEXT NOT NULL DEFAULT '',
    systemid    TEXT NOT NULL DEFAULT '',
    timeline    INTEGER NOT NULL DEFAULT 0,
    xlogpos     TEXT,
    status      TEXT NOT NULL DEFAULT 'identified',
    create_date TEXT
);

CREATE TABLE procs(
    pid        INTEGER PRIMARY KEY,
    archive_id INTEGER NOT NULL DEFAULT -1,
    type       TEXT NOT NULL,
    state      TEXT NOT NULL DEFAULT 'running',
    started    TEXT,
    shm_key    INTEGER NOT NULL DEFAULT 0,
    shm_id     INTEGER NOT NULL DEFAULT 0
);

CREATE UNIQUE INDEX procs_single_launcher ON procs(type) WHERE type = 'launcher';
";

#[cfg(test)]
mod tests {
    use super::*;

    fn open_catalog() -> (tempfile::TempDir, BackupCatalog) {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = BackupCatalog::new(dir.path().join("catalog.db"));
        catalog.open_rw().unwrap();
        (dir, catalog)
    }

    fn sample_archive() -> ArchiveDescr {
        ArchiveDescr {
            name: "a1".into(),
            directory: "/tmp/a1".into(),
            pghost: "h".into(),
            pgport: 5432,
            pguser: "u".into(),
            pgdatabase: "d".into(),
            ..Default::default()
        }
    }

    #[test]
    fn default_profile_is_seeded() {
        let (_dir, catalog) = open_catalog();
        let profile = catalog.get_backup_profile("default").unwrap().unwrap();
        assert_eq!(profile.name, "default");
        assert!(profile.wait_for_wal);
    }

    #[test]
    fn transactions_are_non_reentrant() {
        let (_dir, catalog) = open_catalog();
        catalog.start_transaction().unwrap();
        assert!(catalog.start_transaction().is_err());
        catalog.commit_transaction().unwrap();
        assert!(catalog.commit_transaction().is_err());
        assert!(catalog.rollback_transaction().is_err());
    }

    #[test]
    fn archive_crud_round_trip() {
        let (_dir, catalog) = open_catalog();
        let mut archive = sample_archive();
        catalog.create_archive(&mut archive).unwrap();
        assert!(archive.id > 0);

        let found = catalog.exists_by_name("a1").unwrap().unwrap();
        assert_eq!(found.directory, "/tmp/a1");
        assert!(catalog.exists_by_name("nope").unwrap().is_none());
        assert!(catalog.exists_by_directory("/tmp/a1").unwrap().is_some());

        catalog.drop_archive("a1").unwrap();
        assert!(catalog.exists_by_name("a1").unwrap().is_none());
        assert!(matches!(
            catalog.drop_archive("a1"),
            Err(ArchiveError::NotFound { .. })
        ));
    }

    #[test]
    fn update_touches_only_affected_attributes() {
        let (_dir, catalog) = open_catalog();
        let mut archive = sample_archive();
        catalog.create_archive(&mut archive).unwrap();
        let before = catalog.exists_by_name("a1").unwrap().unwrap();

        let mut patch = ArchiveDescr {
            id: archive.id,
            pghost: "h2".into(),
            // Divergent values in columns that are not flagged must be
            // ignored by the update.
            pguser: "someone-else".into(),
            directory: "/tmp/other".into(),
            ..Default::default()
        };
        patch.attrs.push(attno::ARCHIVE_PGHOST);
        let attrs = patch.attrs.clone();
        catalog.update_archive_attributes(&patch, &attrs).unwrap();

        let after = catalog.exists_by_name("a1").unwrap().unwrap();
        assert_eq!(after.pghost, "h2");
        assert_eq!(after.pguser, before.pguser);
        assert_eq!(after.directory, before.directory);
        assert_eq!(after.compression, before.compression);
    }

    #[test]
    fn connection_uniqueness_per_type() {
        let (_dir, catalog) = open_catalog();
        let mut archive = sample_archive();
        catalog.create_archive(&mut archive).unwrap();

        let con = ConnectionDescr {
            archive_id: archive.id,
            kind: ConnectionKind::Basebackup,
            pghost: "h".into(),
            ..Default::default()
        };
        catalog.create_connection(&con).unwrap();
        assert!(catalog.create_connection(&con).is_err());

        let got = catalog
            .get_connection(archive.id, ConnectionKind::Basebackup)
            .unwrap()
            .unwrap();
        assert_eq!(got.pghost, "h");
        assert!(catalog
            .get_connection(archive.id, ConnectionKind::Streamer)
            .unwrap()
            .is_none());
    }

    #[test]
    fn basebackup_lifecycle() {
        let (_dir, catalog) = open_catalog();
        let mut archive = sample_archive();
        catalog.create_archive(&mut archive).unwrap();

        let mut backup = BaseBackupDescr {
            fsentry: "/tmp/a1/basebackup-1".into(),
            label: "test".into(),
            xlogpos: "0/1000000".parse().unwrap(),
            timeline: 1,
            ..Default::default()
        };
        catalog.register_basebackup(archive.id, &mut backup).unwrap();
        assert!(backup.id > 0);
        assert_eq!(backup.status, BackupStatus::InProgress);

        backup.xlogposend = "0/2000000".parse().unwrap();
        catalog.finalize_basebackup(&mut backup).unwrap();
        let stored = catalog.get_basebackup_by_id(backup.id).unwrap().unwrap();
        assert_eq!(stored.status, BackupStatus::Ready);
        assert!(stored.stopped.is_some());
        assert!(stored.xlogposend >= stored.xlogpos);

        // ready -> aborted is not a legal transition
        assert!(catalog.abort_basebackup(&mut backup.clone()).is_err());
        // and neither is finalizing twice
        assert!(catalog.finalize_basebackup(&mut backup.clone()).is_err());
    }

    #[test]
    fn finalize_rejects_end_before_start() {
        let (_dir, catalog) = open_catalog();
        let mut archive = sample_archive();
        catalog.create_archive(&mut archive).unwrap();

        let mut backup = BaseBackupDescr {
            fsentry: "/tmp/a1/bb".into(),
            xlogpos: "0/2000000".parse().unwrap(),
            ..Default::default()
        };
        catalog.register_basebackup(archive.id, &mut backup).unwrap();
        backup.xlogposend = "0/1000000".parse().unwrap();
        assert!(matches!(
            catalog.finalize_basebackup(&mut backup),
            Err(ArchiveError::Integrity(_))
        ));
    }

    #[test]
    fn datetime_selection_binds_interval_operands() {
        let (_dir, catalog) = open_catalog();
        let mut archive = sample_archive();
        catalog.create_archive(&mut archive).unwrap();

        for age_days in [1i64, 5, 10] {
            let mut backup = BaseBackupDescr {
                fsentry: format!("/tmp/a1/bb{age_days}"),
                started: Some(Utc::now() - chrono::Duration::days(age_days)),
                xlogpos: Lsn(0x100_0000),
                ..Default::default()
            };
            catalog.register_basebackup(archive.id, &mut backup).unwrap();
        }

        let interval = IntervalExpr::parse("3 days").unwrap();
        let older = catalog
            .backups_exceeding_datetime(archive.id, &interval, true)
            .unwrap();
        assert_eq!(older.len(), 2);
        let newer = catalog
            .backups_exceeding_datetime(archive.id, &interval, false)
            .unwrap();
        assert_eq!(newer.len(), 1);
    }

    #[test]
    fn launcher_row_is_unique() {
        let (_dir, catalog) = open_catalog();
        let launcher = WorkerDescr {
            pid: 100,
            archive_id: -1,
            kind: WorkerKind::Launcher,
            state: WorkerState::Running,
            started: Some(Utc::now()),
            shm_key: 0,
            shm_id: 0,
        };
        catalog.register_worker(&launcher).unwrap();
        let second = WorkerDescr {
            pid: 101,
            ..launcher.clone()
        };
        assert!(matches!(
            catalog.register_worker(&second),
            Err(ArchiveError::AlreadyExists { .. })
        ));
        // other worker kinds are not limited
        let streamer = WorkerDescr {
            pid: 102,
            kind: WorkerKind::Streamer,
            ..launcher
        };
        catalog.register_worker(&streamer).unwrap();
        assert_eq!(catalog.get_workers().unwrap().len(), 2);
    }

    #[test]
    fn stat_catalog_aggregates() {
        let (_dir, catalog) = open_catalog();
        let mut archive = sample_archive();
        catalog.create_archive(&mut archive).unwrap();

        for i in 0..3 {
            let mut backup = BaseBackupDescr {
                fsentry: format!("/tmp/a1/bb{i}"),
                xlogpos: Lsn(0x100_0000),
                ..Default::default()
            };
            catalog.register_basebackup(archive.id, &mut backup).unwrap();
            if i == 0 {
                catalog.abort_basebackup(&mut backup).unwrap();
            } else if i == 1 {
                backup.xlogposend = Lsn(0x200_0000);
                catalog.finalize_basebackup(&mut backup).unwrap();
            }
        }

        let stat = catalog.stat_catalog("a1").unwrap();
        assert_eq!(stat.number_of_backups, 3);
        assert_eq!(stat.backups_failed, 1);
        assert_eq!(stat.backups_running, 1);
        assert_ne!(stat.latest_finished, "N/A");
    }
}
