//! The base-backup pipeline: streams every tablespace the server
//! enumerates into the archive and keeps the catalog honest about the
//! backup's lifecycle.
//!
//! One session walks the states
//!
//! ```text
//! identified -> tablespaces_requested -> registering <-> streaming_tablespace
//!            -> ending -> ready        (any error: -> aborted)
//! ```
//!
//! Registration, per-tablespace recording and finalization each run in
//! their own catalog transaction; the streaming loop itself is never held
//! under one. After an error past registration, a dedicated transaction
//! marks the backup `aborted`, and if that fails too, the original error
//! is the one that surfaces. A backup is never left `in progress` by a
//! cleanly terminating process.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use tokio_postgres::CopyOutStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::descr::{
    ArchiveDescr, BackupProfileDescr, BaseBackupDescr, TablespaceDescr,
};
use crate::catalog::BackupCatalog;
use crate::error::{ArchiveError, Result};
use crate::stream::ReplicationSession;
use crate::vectored_io::{IoEngine, VectoredBuffer};
use crate::wal::{Lsn, TimeLineId};

/// Start position and timeline the server reported for a backup.
#[derive(Debug, Clone, Copy)]
pub struct StartedBackup {
    pub xlogpos: Lsn,
    pub timeline: TimeLineId,
}

/// Seam to the server side of a base-backup session. The production
/// implementation speaks the replication protocol; tests script it.
#[async_trait]
pub trait BackupSource: Send {
    /// Negotiate the backup on an identified session.
    async fn start_backup(&mut self, profile: &BackupProfileDescr) -> Result<StartedBackup>;

    /// The tablespaces the server will send, in streaming order.
    async fn tablespaces(&mut self) -> Result<Vec<TablespaceDescr>>;

    /// Position the source on the given tablespace's data.
    async fn open_tablespace(&mut self, spc: &TablespaceDescr) -> Result<()>;

    /// Next chunk of the current tablespace; `None` ends it.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;

    /// End the stream and report the backup end position.
    async fn finish(&mut self) -> Result<Lsn>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackupPhase {
    TablespacesRequested,
    Registering,
    StreamingTablespace,
    Ending,
}

/* ---------------- on-disk sink ---------------- */

fn fsync_dir(path: &Path) -> Result<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}

/// Directory name for a fresh base backup, derived from the start time.
pub fn basebackup_dirname(now: chrono::DateTime<Utc>) -> String {
    format!("basebackup-{}", now.format("%Y%m%dT%H%M%S"))
}

/// Writes tablespace streams below one backup directory, moving bytes
/// through the vectored engine. Files are fsynced on close, the backup
/// directory once at the end.
pub struct StreamBackupSink {
    archive_dir: PathBuf,
    backup_dir: Option<PathBuf>,
    engine: IoEngine,
    buffer: VectoredBuffer,
    file: Option<File>,
    file_pos: u64,
}

impl StreamBackupSink {
    pub fn new(archive_dir: impl Into<PathBuf>, queue_depth: u32, block_size: usize) -> Result<Self> {
        Ok(StreamBackupSink {
            archive_dir: archive_dir.into(),
            backup_dir: None,
            engine: IoEngine::create(queue_depth, block_size),
            buffer: VectoredBuffer::new(block_size, queue_depth as usize)?,
            file: None,
            file_pos: 0,
        })
    }

    /// Create the backup directory. It must not exist yet: the fresh
    /// directory is what fences concurrent sessions off one archive.
    pub fn prepare(&mut self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.archive_dir)?;
        let dir = self.archive_dir.join(basebackup_dirname(Utc::now()));
        std::fs::create_dir(&dir)?;
        fsync_dir(&self.archive_dir)?;
        self.backup_dir = Some(dir.clone());
        Ok(dir)
    }

    pub fn backup_dir(&self) -> Option<&Path> {
        self.backup_dir.as_deref()
    }

    fn tablespace_file_name(spcoid: u32) -> String {
        if spcoid == 0 {
            "base.tar".to_string()
        } else {
            format!("spc-{spcoid}.tar")
        }
    }

    pub fn begin_tablespace(&mut self, spcoid: u32) -> Result<()> {
        let dir = self
            .backup_dir
            .as_ref()
            .ok_or_else(|| ArchiveError::protocol("basebackup", "sink not prepared"))?;
        let path = dir.join(Self::tablespace_file_name(spcoid));
        let file = File::options().create_new(true).write(true).read(true).open(path)?;
        self.file = Some(file);
        self.file_pos = 0;
        self.buffer.clear();
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if self.buffer.effective_size() == 0 {
            return Ok(());
        }
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| ArchiveError::protocol("basebackup", "no tablespace open"))?;
        let staged = self.buffer.effective_size();
        let written = self.engine.write_at(file, &mut self.buffer, self.file_pos)?;
        if written != staged {
            return Err(ArchiveError::Io {
                reason: format!("short write: {written} of {staged} bytes"),
                os_code: None,
            });
        }
        self.file_pos += written as u64;
        self.buffer.clear();
        Ok(())
    }

    pub fn write_chunk(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let copied = self.buffer.fill(data);
            data = &data[copied..];
            if self.buffer.effective_size() == self.buffer.total_size() {
                self.flush_buffer()?;
            }
        }
        Ok(())
    }

    /// Flush what is staged, fsync the file and close it. Returns the
    /// tablespace's byte count on disk.
    pub fn end_tablespace(&mut self) -> Result<u64> {
        self.flush_buffer()?;
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(self.file_pos)
    }

    /// Settle the directory entries of the finished backup.
    pub fn close(&mut self) -> Result<()> {
        if let Some(dir) = &self.backup_dir {
            fsync_dir(dir)?;
        }
        Ok(())
    }
}

/* ---------------- session driver ---------------- */

/// Drives one base-backup session against an identified upstream server.
pub struct BaseBackupDriver<'a> {
    catalog: &'a BackupCatalog,
    archive: &'a ArchiveDescr,
    profile: &'a BackupProfileDescr,
    cancel: CancellationToken,
}

impl<'a> BaseBackupDriver<'a> {
    pub fn new(
        catalog: &'a BackupCatalog,
        archive: &'a ArchiveDescr,
        profile: &'a BackupProfileDescr,
        cancel: CancellationToken,
    ) -> Self {
        BaseBackupDriver {
            catalog,
            archive,
            profile,
            cancel,
        }
    }

    /// Run the whole pipeline: negotiate, register, stream every
    /// tablespace, finalize. On any error after registration the backup is
    /// marked aborted in its own transaction before the error propagates.
    pub async fn run(
        &self,
        systemid: &str,
        wal_segment_size: u64,
        source: &mut dyn BackupSource,
        sink: &mut StreamBackupSink,
    ) -> Result<BaseBackupDescr> {
        let started = source.start_backup(self.profile).await?;
        debug!(
            "basebackup negotiated at {} on timeline {}",
            started.xlogpos, started.timeline
        );

        let mut descr = BaseBackupDescr {
            xlogpos: started.xlogpos,
            timeline: started.timeline,
            label: self.profile.label.clone(),
            systemid: systemid.to_string(),
            wal_segment_size,
            used_profile: self.profile.id,
            ..Default::default()
        };

        // Registration transaction: the backup directory is created here
        // so a registered row always points at an existing fsentry.
        self.catalog.within_transaction(|catalog| {
            let dir = sink.prepare()?;
            descr.fsentry = dir.to_string_lossy().into_owned();
            catalog.register_basebackup(self.archive.id, &mut descr)
        })?;
        info!(
            "registered basebackup {} under {}",
            descr.id, descr.fsentry
        );

        match self.stream_tablespaces(&mut descr, source, sink).await {
            Ok(end_pos) => {
                descr.xlogposend = end_pos;
                self.catalog
                    .within_transaction(|catalog| catalog.finalize_basebackup(&mut descr))?;
                info!("basebackup {} ready, end position {}", descr.id, end_pos);
                Ok(descr)
            }
            Err(e) => {
                // Mark the registered backup aborted; a failure doing so
                // must not shadow the error we are already propagating.
                if let Err(abort_err) = self
                    .catalog
                    .within_transaction(|catalog| catalog.abort_basebackup(&mut descr))
                {
                    warn!(
                        "could not mark basebackup {} aborted: {abort_err}",
                        descr.id
                    );
                }
                Err(e)
            }
        }
    }

    fn enter(&self, backup_id: i64, phase: BackupPhase) {
        debug!("basebackup {backup_id}: entering {phase:?}");
    }

    async fn stream_tablespaces(
        &self,
        descr: &mut BaseBackupDescr,
        source: &mut dyn BackupSource,
        sink: &mut StreamBackupSink,
    ) -> Result<Lsn> {
        self.enter(descr.id, BackupPhase::TablespacesRequested);
        let tablespaces = source.tablespaces().await?;
        debug!("server enumerated {} tablespace(s)", tablespaces.len());

        for spc in tablespaces {
            self.enter(descr.id, BackupPhase::Registering);
            // A command is cancellable between tablespaces, not inside one.
            if self.cancel.is_cancelled() {
                return Err(ArchiveError::protocol("basebackup", "cancelled"));
            }

            let mut spc = TablespaceDescr {
                backup_id: descr.id,
                ..spc
            };
            self.catalog
                .within_transaction(|catalog| catalog.register_tablespace_for_backup(&mut spc))?;

            self.enter(descr.id, BackupPhase::StreamingTablespace);
            debug!(
                "streaming tablespace oid {} ({} bytes expected)",
                spc.spcoid, spc.spcsize
            );
            sink.begin_tablespace(spc.spcoid)?;
            source.open_tablespace(&spc).await?;
            while let Some(chunk) = source.next_chunk().await? {
                sink.write_chunk(&chunk)?;
            }
            sink.end_tablespace()?;
            descr.tablespaces.push(spc);
        }

        self.enter(descr.id, BackupPhase::Ending);
        let end_pos = source.finish().await?;
        sink.close()?;
        Ok(end_pos)
    }
}

/* ---------------- production source ---------------- */

/// Assemble the BASE_BACKUP replication command for a profile.
pub fn basebackup_command(profile: &BackupProfileDescr) -> String {
    let mut cmd = format!("BASE_BACKUP LABEL '{}'", profile.label.replace('\'', "''"));
    cmd.push_str(" PROGRESS");
    if profile.fast_checkpoint {
        cmd.push_str(" FAST");
    }
    if profile.include_wal {
        cmd.push_str(" WAL");
    }
    if !profile.wait_for_wal {
        cmd.push_str(" NOWAIT");
    }
    if profile.max_rate > 0 {
        cmd.push_str(&format!(" MAX_RATE {}", profile.max_rate));
    }
    if profile.noverify_checksums {
        cmd.push_str(" NOVERIFY_CHECKSUMS");
    }
    cmd.push_str(" TABLESPACE_MAP");
    cmd
}

/// Base-backup source over a live replication session. The server ships
/// the whole backup as one tar stream on the session; secondary
/// tablespaces travel inside it via the tablespace map, so the source
/// reports a single base entry.
pub struct PgBackupSource {
    session: ReplicationSession,
    archive_id: i64,
    start: StartedBackup,
    stream: Option<Pin<Box<CopyOutStream>>>,
}

impl PgBackupSource {
    pub fn new(session: ReplicationSession, archive_id: i64, start: StartedBackup) -> Self {
        PgBackupSource {
            session,
            archive_id,
            start,
            stream: None,
        }
    }

    pub fn into_session(self) -> ReplicationSession {
        self.session
    }
}

#[async_trait]
impl BackupSource for PgBackupSource {
    async fn start_backup(&mut self, profile: &BackupProfileDescr) -> Result<StartedBackup> {
        let command = basebackup_command(profile);
        debug!("issuing {command}");
        let stream = self.session.client().copy_out(&command).await?;
        self.stream = Some(Box::pin(stream));
        Ok(self.start)
    }

    async fn tablespaces(&mut self) -> Result<Vec<TablespaceDescr>> {
        Ok(vec![TablespaceDescr {
            spcoid: 0,
            spclocation: String::new(),
            spcsize: -1,
            ..Default::default()
        }])
    }

    async fn open_tablespace(&mut self, _spc: &TablespaceDescr) -> Result<()> {
        if self.stream.is_none() {
            return Err(ArchiveError::protocol("basebackup", "stream not started"));
        }
        Ok(())
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ArchiveError::protocol("basebackup", "stream not started"))?;
        match stream.next().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    async fn finish(&mut self) -> Result<Lsn> {
        self.stream = None;
        // The copy stream carries no end-of-backup position; ask the
        // server where it stands now.
        let ident = self.session.identify(self.archive_id).await?;
        Ok(ident.xlogpos.max(self.start.xlogpos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::descr::BackupStatus;
    use crate::vectored_io::{DEFAULT_BLOCK_SIZE, DEFAULT_QUEUE_DEPTH};
    use std::collections::VecDeque;

    struct ScriptedSource {
        tablespaces: Vec<TablespaceDescr>,
        data: Vec<Vec<Bytes>>,
        current: VecDeque<Bytes>,
        opened: usize,
        /// Fail while streaming the tablespace with this index.
        fail_in_tablespace: Option<usize>,
        end_pos: Lsn,
    }

    impl ScriptedSource {
        fn new(layout: Vec<(u32, Vec<&'static [u8]>)>) -> Self {
            let tablespaces = layout
                .iter()
                .map(|(oid, chunks)| TablespaceDescr {
                    spcoid: *oid,
                    spclocation: format!("/spc/{oid}"),
                    spcsize: chunks.iter().map(|c| c.len() as i64).sum(),
                    ..Default::default()
                })
                .collect();
            let data = layout
                .into_iter()
                .map(|(_, chunks)| chunks.into_iter().map(Bytes::from_static).collect())
                .collect();
            ScriptedSource {
                tablespaces,
                data,
                current: VecDeque::new(),
                opened: 0,
                fail_in_tablespace: None,
                end_pos: Lsn(0x200_0000),
            }
        }
    }

    #[async_trait]
    impl BackupSource for ScriptedSource {
        async fn start_backup(&mut self, _profile: &BackupProfileDescr) -> Result<StartedBackup> {
            Ok(StartedBackup {
                xlogpos: Lsn(0x100_0000),
                timeline: 1,
            })
        }

        async fn tablespaces(&mut self) -> Result<Vec<TablespaceDescr>> {
            Ok(self.tablespaces.clone())
        }

        async fn open_tablespace(&mut self, spc: &TablespaceDescr) -> Result<()> {
            let index = self
                .tablespaces
                .iter()
                .position(|t| t.spcoid == spc.spcoid)
                .unwrap();
            self.opened = index;
            self.current = self.data[index].iter().cloned().collect();
            Ok(())
        }

        async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
            if self.fail_in_tablespace == Some(self.opened) && self.current.len() <= 1 {
                return Err(ArchiveError::protocol("basebackup", "connection lost"));
            }
            Ok(self.current.pop_front())
        }

        async fn finish(&mut self) -> Result<Lsn> {
            Ok(self.end_pos)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        catalog: BackupCatalog,
        archive: ArchiveDescr,
        profile: BackupProfileDescr,
        archive_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = BackupCatalog::new(dir.path().join("catalog.db"));
        catalog.open_rw().unwrap();
        let archive_dir = dir.path().join("archive");
        let mut archive = ArchiveDescr {
            name: "a1".into(),
            directory: archive_dir.to_string_lossy().into_owned(),
            ..Default::default()
        };
        catalog.create_archive(&mut archive).unwrap();
        let profile = catalog.get_backup_profile("default").unwrap().unwrap();
        Fixture {
            _dir: dir,
            catalog,
            archive,
            profile,
            archive_dir,
        }
    }

    fn driver(fx: &Fixture) -> BaseBackupDriver<'_> {
        BaseBackupDriver::new(
            &fx.catalog,
            &fx.archive,
            &fx.profile,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn successful_backup_lands_ready() {
        let fx = fixture();
        let mut source = ScriptedSource::new(vec![
            (0, vec![b"base tablespace bytes".as_slice(), b", more"]),
            (16400, vec![b"secondary tablespace".as_slice()]),
        ]);
        let mut sink =
            StreamBackupSink::new(&fx.archive_dir, DEFAULT_QUEUE_DEPTH, DEFAULT_BLOCK_SIZE)
                .unwrap();

        let descr = driver(&fx)
            .run("4711", 16 * 1024 * 1024, &mut source, &mut sink)
            .await
            .unwrap();

        assert_eq!(descr.status, BackupStatus::Ready);
        assert_eq!(descr.xlogposend, Lsn(0x200_0000));

        let stored = fx.catalog.get_basebackup_by_id(descr.id).unwrap().unwrap();
        assert_eq!(stored.status, BackupStatus::Ready);
        assert!(stored.stopped.is_some());
        assert!(stored.xlogposend >= stored.xlogpos);
        assert_eq!(stored.tablespaces.len(), 2);
        assert_eq!(stored.tablespaces[1].spcoid, 16400);

        let base = std::fs::read(Path::new(&stored.fsentry).join("base.tar")).unwrap();
        assert_eq!(base, b"base tablespace bytes, more");
        let spc = std::fs::read(Path::new(&stored.fsentry).join("spc-16400.tar")).unwrap();
        assert_eq!(spc, b"secondary tablespace");
    }

    #[tokio::test]
    async fn mid_stream_failure_marks_backup_aborted() {
        let fx = fixture();
        let mut source = ScriptedSource::new(vec![
            (0, vec![b"first".as_slice()]),
            (16400, vec![b"second-a".as_slice(), b"second-b"]),
        ]);
        source.fail_in_tablespace = Some(1);
        let mut sink =
            StreamBackupSink::new(&fx.archive_dir, DEFAULT_QUEUE_DEPTH, DEFAULT_BLOCK_SIZE)
                .unwrap();

        let err = driver(&fx)
            .run("4711", 16 * 1024 * 1024, &mut source, &mut sink)
            .await
            .unwrap_err();
        // the original streaming error surfaces, not the abort bookkeeping
        assert!(matches!(err, ArchiveError::Protocol { .. }));

        let backups = fx.catalog.get_backup_list(fx.archive.id).unwrap();
        assert_eq!(backups.len(), 1);
        let backup = &backups[0];
        assert_eq!(backup.status, BackupStatus::Aborted);
        assert!(backup.stopped.is_some());
        // the on-disk entry survives for inspection
        assert!(Path::new(&backup.fsentry).is_dir());
        // the first tablespace had been recorded before the failure
        assert_eq!(backup.tablespaces.len(), 2);
    }

    #[tokio::test]
    async fn cancellation_stops_between_tablespaces() {
        let fx = fixture();
        let mut source = ScriptedSource::new(vec![(0, vec![b"data".as_slice()])]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let driver = BaseBackupDriver::new(&fx.catalog, &fx.archive, &fx.profile, cancel);
        let mut sink =
            StreamBackupSink::new(&fx.archive_dir, DEFAULT_QUEUE_DEPTH, DEFAULT_BLOCK_SIZE)
                .unwrap();

        let err = driver
            .run("4711", 16 * 1024 * 1024, &mut source, &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Protocol { .. }));
        let backups = fx.catalog.get_backup_list(fx.archive.id).unwrap();
        assert_eq!(backups[0].status, BackupStatus::Aborted);
    }

    #[test]
    fn command_assembly_follows_profile() {
        let profile = BackupProfileDescr {
            label: "nightly".into(),
            fast_checkpoint: true,
            include_wal: true,
            wait_for_wal: false,
            max_rate: 2048,
            noverify_checksums: true,
            ..Default::default()
        };
        let cmd = basebackup_command(&profile);
        assert_eq!(
            cmd,
            "BASE_BACKUP LABEL 'nightly' PROGRESS FAST WAL NOWAIT MAX_RATE 2048 \
             NOVERIFY_CHECKSUMS TABLESPACE_MAP"
        );

        let quiet = BackupProfileDescr::default();
        let cmd = basebackup_command(&quiet);
        assert!(!cmd.contains("FAST"));
        assert!(!cmd.contains("NOWAIT"));
        assert!(!cmd.contains("MAX_RATE"));
        assert!(cmd.contains("LABEL 'ARCHIVEKEEPER BASEBACKUP'"));
    }

    #[test]
    fn label_quotes_are_escaped() {
        let profile = BackupProfileDescr {
            label: "it's nightly".into(),
            ..Default::default()
        };
        assert!(basebackup_command(&profile).contains("'it''s nightly'"));
    }
}
