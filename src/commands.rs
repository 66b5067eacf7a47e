//! Command execution.
//!
//! The parser hands over a typed command descriptor; the executor
//! materializes it against the shared catalog handle. Every command body
//! runs under a catalog transaction: commit on success, rollback and
//! rethrow on any error. With the idempotence flag set, creating something
//! that exists or dropping something that doesn't becomes a no-op instead
//! of an error.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::basebackup::{BaseBackupDriver, PgBackupSource, StartedBackup, StreamBackupSink};
use crate::catalog::descr::*;
use crate::catalog::{BackupCatalog, RetrieveMode};
use crate::config::RuntimeConfig;
use crate::error::{ArchiveError, Entity, Result};
use crate::retention;
use crate::stream::ReplicationSession;
use crate::streamer::WalReceiver;
use crate::wal::{is_segment_file_name, segment_from_file_name, Lsn};
use crate::worker::{self, JobInfo};
use crate::{ARCHIVE_MARKER_CONTENT, ARCHIVE_MARKER_FILE, WAL_SUBDIR};

pub struct CommandExecutor {
    pub catalog: BackupCatalog,
    pub config: RuntimeConfig,
    cancel: CancellationToken,
}

impl CommandExecutor {
    pub fn new(catalog: BackupCatalog, cancel: CancellationToken) -> Self {
        CommandExecutor {
            catalog,
            config: RuntimeConfig::default(),
            cancel,
        }
    }

    /// Dispatch one command. `exists_ok` turns already-exists / not-found
    /// conditions of create/drop commands into no-ops.
    pub async fn execute(&mut self, descr: CommandDescr, exists_ok: bool) -> Result<()> {
        if !self.catalog.available() {
            self.catalog.open_rw()?;
        }
        info!("executing {}", descr.tag.name());

        match descr.tag {
            CommandTag::CreateArchive => self.create_archive(&descr, exists_ok),
            CommandTag::DropArchive => self.drop_archive(&descr, exists_ok),
            CommandTag::AlterArchive => self.alter_archive(&descr, exists_ok),
            CommandTag::VerifyArchive => self.verify_archive(&descr).await,
            CommandTag::ListArchive => self.list_archives(&descr),
            CommandTag::CreateBackupProfile => self.create_backup_profile(&descr, exists_ok),
            CommandTag::DropBackupProfile => self.drop_backup_profile(&descr, exists_ok),
            CommandTag::ListBackupProfile | CommandTag::ListBackupProfileDetail => {
                self.list_backup_profiles(&descr)
            }
            CommandTag::CreateConnection => self.create_connection(&descr, exists_ok),
            CommandTag::DropConnection => self.drop_connection(&descr, exists_ok),
            CommandTag::ListConnection => self.list_connections(&descr),
            CommandTag::StartBasebackup => self.start_basebackup(&descr).await,
            CommandTag::ListBackupCatalog => self.list_backup_catalog(&descr),
            CommandTag::DropBasebackup => self.drop_basebackup(&descr, exists_ok),
            CommandTag::PinBasebackup | CommandTag::UnpinBasebackup => self.pin_basebackups(&descr),
            CommandTag::CreateRetentionPolicy => self.create_retention_policy(&descr, exists_ok),
            CommandTag::DropRetentionPolicy => self.drop_retention_policy(&descr, exists_ok),
            CommandTag::ListRetentionPolicies | CommandTag::ListRetentionPolicy => {
                self.list_retention_policies(&descr)
            }
            CommandTag::ApplyRetentionPolicy => self.apply_retention_policy(&descr),
            CommandTag::StartStreamingForArchive => self.start_streaming(&descr).await,
            CommandTag::StopStreamingForArchive => self.stop_streaming(&descr),
            CommandTag::StartLauncher => self.run_launcher().await,
            CommandTag::ShowWorkers => self.show_workers(&descr),
            CommandTag::BackgroundWorkerCommand => self.launch_background(&descr),
            CommandTag::ShowVariables => {
                for (name, value) in self.config.iter() {
                    println!("{name:<32}\t{value}");
                }
                Ok(())
            }
            CommandTag::ShowVariable => {
                let value = self.config.get(&descr.var_name)?;
                println!("{:<32}\t{value}", descr.var_name);
                Ok(())
            }
            CommandTag::SetVariable => {
                let value = descr
                    .var_value
                    .clone()
                    .ok_or_else(|| ArchiveError::invalid(&descr.var_name, "missing value"))?;
                self.config.set(&descr.var_name, value)
            }
            CommandTag::ResetVariable => self.config.reset(&descr.var_name),
            CommandTag::ExecCommand => self.exec_command(&descr),
        }
    }

    /* ---------------- archives ---------------- */

    fn archive_from_command(descr: &CommandDescr) -> ArchiveDescr {
        ArchiveDescr {
            id: -1,
            name: descr.archive_name.clone(),
            directory: descr.directory.clone(),
            compression: descr.compression,
            pghost: descr.connection.pghost.clone(),
            pgport: descr.connection.pgport,
            pguser: descr.connection.pguser.clone(),
            pgdatabase: descr.connection.pgdatabase.clone(),
            attrs: descr.attrs.clone(),
        }
    }

    fn require_archive(catalog: &BackupCatalog, name: &str) -> Result<ArchiveDescr> {
        catalog
            .exists_by_name(name)?
            .ok_or_else(|| ArchiveError::not_found(Entity::Archive, name))
    }

    fn create_archive(&mut self, descr: &CommandDescr, exists_ok: bool) -> Result<()> {
        let mut archive = Self::archive_from_command(descr);
        self.catalog.within_transaction(|catalog| {
            match catalog.exists_by_directory(&archive.directory)? {
                None => {
                    catalog.create_archive(&mut archive)?;
                    // Every archive carries a basebackup connection from the
                    // start; both rows come or go together.
                    let con = ConnectionDescr {
                        archive_id: archive.id,
                        kind: ConnectionKind::Basebackup,
                        pghost: archive.pghost.clone(),
                        pgport: archive.pgport,
                        pguser: archive.pguser.clone(),
                        pgdatabase: archive.pgdatabase.clone(),
                        dsn: descr.connection.dsn.clone(),
                        attrs: AttrSet::new(),
                    };
                    catalog.create_connection(&con)?;
                    init_archive_dir(&archive.directory)?;
                    Ok(())
                }
                Some(existing) => {
                    if !exists_ok {
                        return Err(ArchiveError::already_exists(
                            Entity::Archive,
                            &archive.directory,
                        ));
                    }
                    archive.id = existing.id;
                    catalog.update_archive_attributes(&archive, &archive.attrs.clone())
                }
            }
        })?;
        println!("archive {} registered", descr.archive_name);
        Ok(())
    }

    fn drop_archive(&mut self, descr: &CommandDescr, exists_ok: bool) -> Result<()> {
        self.catalog.within_transaction(|catalog| {
            match catalog.exists_by_name(&descr.archive_name)? {
                Some(_) => catalog.drop_archive(&descr.archive_name),
                None if exists_ok => Ok(()),
                None => Err(ArchiveError::not_found(
                    Entity::Archive,
                    &descr.archive_name,
                )),
            }
        })?;
        println!("archive {} dropped", descr.archive_name);
        Ok(())
    }

    fn alter_archive(&mut self, descr: &CommandDescr, exists_ok: bool) -> Result<()> {
        let mut archive = Self::archive_from_command(descr);
        self.catalog.within_transaction(|catalog| {
            match catalog.exists_by_name(&descr.archive_name)? {
                Some(existing) => {
                    archive.id = existing.id;
                    catalog.update_archive_attributes(&archive, &descr.attrs)
                }
                None if exists_ok => Ok(()),
                None => Err(ArchiveError::not_found(
                    Entity::Archive,
                    &descr.archive_name,
                )),
            }
        })
    }

    async fn verify_archive(&mut self, descr: &CommandDescr) -> Result<()> {
        let archive = self.catalog.within_transaction(|catalog| {
            let archive = Self::require_archive(catalog, &descr.archive_name)?;
            verify_archive_dir(&archive.directory)?;
            Ok(archive)
        })?;
        if descr.check_connection {
            let con = self
                .catalog
                .get_connection(archive.id, ConnectionKind::Basebackup)?
                .ok_or_else(|| ArchiveError::not_found(Entity::Connection, "basebackup"))?;
            let session = ReplicationSession::connect(&con).await?;
            let ident = session.identify(archive.id).await?;
            session.disconnect().await;
            println!(
                "connection ok: system {} timeline {} at {}",
                ident.systemid, ident.timeline, ident.xlogpos
            );
        }
        println!("archive {} verified", descr.archive_name);
        Ok(())
    }

    fn list_archives(&mut self, descr: &CommandDescr) -> Result<()> {
        let filter = if descr.archive_name.is_empty() {
            None
        } else {
            let mut filter = ArchiveDescr {
                name: descr.archive_name.clone(),
                ..Default::default()
            };
            filter.attrs.push(attno::ARCHIVE_NAME);
            Some(filter)
        };
        let archives = self
            .catalog
            .within_transaction(|catalog| catalog.get_archive_list(filter.as_ref()))?;

        if descr.json {
            println!("{}", to_json(&archives)?);
        } else if descr.verbose {
            for archive in &archives {
                print_header(&format!("archive {}", archive.name));
                println!("{:<20}\t{}", "NAME", archive.name);
                println!("{:<20}\t{}", "DIRECTORY", archive.directory);
                println!("{:<20}\t{}", "PGHOST", archive.pghost);
                println!("{:<20}\t{}", "PGPORT", archive.pgport);
                println!("{:<20}\t{}", "PGUSER", archive.pguser);
                println!("{:<20}\t{}", "PGDATABASE", archive.pgdatabase);
                println!("{:<20}\t{}", "COMPRESSION", archive.compression);
            }
        } else {
            print_header("List of archives");
            println!("{:<15}\t{:<30}", "Name", "Directory");
            for archive in &archives {
                println!("{:<15}\t{:<30}", archive.name, archive.directory);
            }
        }
        Ok(())
    }

    /* ---------------- backup profiles ---------------- */

    fn create_backup_profile(&mut self, descr: &CommandDescr, exists_ok: bool) -> Result<()> {
        let profile = descr
            .profile
            .clone()
            .ok_or_else(|| ArchiveError::invalid("profile", "no profile given"))?;
        self.catalog.within_transaction(|catalog| {
            match catalog.get_backup_profile(&profile.name)? {
                None => catalog.create_backup_profile(&profile),
                Some(_) if exists_ok => Ok(()),
                Some(_) => Err(ArchiveError::already_exists(Entity::Profile, &profile.name)),
            }
        })
    }

    fn drop_backup_profile(&mut self, descr: &CommandDescr, exists_ok: bool) -> Result<()> {
        let name = descr
            .profile
            .as_ref()
            .map(|p| p.name.clone())
            .unwrap_or_default();
        self.catalog
            .within_transaction(|catalog| match catalog.get_backup_profile(&name)? {
                Some(_) => catalog.drop_backup_profile(&name),
                None if exists_ok => Ok(()),
                None => Err(ArchiveError::not_found(Entity::Profile, &name)),
            })
    }

    fn list_backup_profiles(&mut self, descr: &CommandDescr) -> Result<()> {
        if descr.tag == CommandTag::ListBackupProfileDetail {
            let name = descr
                .profile
                .as_ref()
                .map(|p| p.name.clone())
                .unwrap_or_default();
            let profile = self
                .catalog
                .within_transaction(|catalog| catalog.get_backup_profile(&name))?
                .ok_or_else(|| ArchiveError::not_found(Entity::Profile, &name))?;
            print_header(&format!("Details for backup profile {}", profile.name));
            println!("{:<25}\t{}", "NAME", profile.name);
            println!("{:<25}\t{}", "COMPRESSION", profile.compress_type.as_str());
            println!("{:<25}\t{}", "MAX RATE (kbps)", profile.max_rate);
            println!("{:<25}\t{}", "LABEL", profile.label);
            println!("{:<25}\t{}", "FAST CHECKPOINT", profile.fast_checkpoint);
            println!("{:<25}\t{}", "WAL INCLUDED", profile.include_wal);
            println!("{:<25}\t{}", "WAIT FOR WAL", profile.wait_for_wal);
            println!("{:<25}\t{}", "VERIFY CHECKSUMS", !profile.noverify_checksums);
        } else {
            let profiles = self
                .catalog
                .within_transaction(|catalog| catalog.get_backup_profiles())?;
            print_header("List of backup profiles");
            println!("{:<25}\t{:<15}", "Name", "Backup Label");
            for profile in profiles {
                println!("{:<25}\t{:<15}", profile.name, profile.label);
            }
        }
        Ok(())
    }

    /* ---------------- connections ---------------- */

    fn create_connection(&mut self, descr: &CommandDescr, exists_ok: bool) -> Result<()> {
        self.catalog.within_transaction(|catalog| {
            let archive = Self::require_archive(catalog, &descr.archive_name)?;
            let mut con = descr.connection.clone();
            con.archive_id = archive.id;
            match catalog.get_connection(archive.id, con.kind)? {
                None => catalog.create_connection(&con),
                Some(_) if exists_ok => Ok(()),
                Some(_) => Err(ArchiveError::already_exists(
                    Entity::Connection,
                    con.kind.as_str(),
                )),
            }
        })
    }

    fn drop_connection(&mut self, descr: &CommandDescr, exists_ok: bool) -> Result<()> {
        if descr.connection.kind == ConnectionKind::Basebackup {
            // The basebackup connection is what makes an archive usable;
            // it only goes away with the archive itself.
            return Err(ArchiveError::invalid(
                "connection type",
                "the basebackup connection cannot be dropped",
            ));
        }
        self.catalog.within_transaction(|catalog| {
            let archive = Self::require_archive(catalog, &descr.archive_name)?;
            match catalog.get_connection(archive.id, descr.connection.kind)? {
                Some(_) => catalog.drop_connection(archive.id, descr.connection.kind),
                None if exists_ok => Ok(()),
                None => Err(ArchiveError::not_found(
                    Entity::Connection,
                    descr.connection.kind.as_str(),
                )),
            }
        })
    }

    fn list_connections(&mut self, descr: &CommandDescr) -> Result<()> {
        let connections = self.catalog.within_transaction(|catalog| {
            let archive = Self::require_archive(catalog, &descr.archive_name)?;
            catalog.get_connections(archive.id)
        })?;
        println!(
            "List of connections for archive \"{}\"",
            descr.archive_name
        );
        for con in connections {
            print_header(&format!("connection type {}", con.kind.as_str()));
            println!("{:<15}\t{}", "DSN", con.dsn);
            println!("{:<15}\t{}", "PGHOST", con.pghost);
            println!("{:<15}\t{}", "PGDATABASE", con.pgdatabase);
            println!("{:<15}\t{}", "PGUSER", con.pguser);
            println!("{:<15}\t{}", "PGPORT", con.pgport);
        }
        Ok(())
    }

    /* ---------------- base backups ---------------- */

    /// Resolve the backup profile for a START BASEBACKUP command: a named
    /// profile must exist, and without one the `default` profile must.
    fn resolve_profile(&self, descr: &CommandDescr) -> Result<BackupProfileDescr> {
        self.catalog.within_transaction(|catalog| {
            match descr.profile.as_ref().filter(|p| !p.name.is_empty()) {
                Some(wanted) => catalog
                    .get_backup_profile(&wanted.name)?
                    .ok_or_else(|| ArchiveError::not_found(Entity::Profile, &wanted.name)),
                None => catalog
                    .get_backup_profile("default")?
                    .ok_or_else(|| ArchiveError::not_found(Entity::Profile, "default")),
            }
        })
    }

    async fn start_basebackup(&mut self, descr: &CommandDescr) -> Result<()> {
        let (archive, con) = self.catalog.within_transaction(|catalog| {
            let archive = Self::require_archive(catalog, &descr.archive_name)?;
            let con = catalog
                .get_connection(archive.id, ConnectionKind::Basebackup)?
                .ok_or_else(|| ArchiveError::not_found(Entity::Connection, "basebackup"))?;
            Ok((archive, con))
        })?;
        let profile = self.resolve_profile(descr)?;

        let session = ReplicationSession::connect(&con).await?;
        let ident = session.identify(archive.id).await?;
        let start = StartedBackup {
            xlogpos: ident.xlogpos,
            timeline: ident.timeline,
        };
        let mut source = PgBackupSource::new(session, archive.id, start);
        let mut sink = StreamBackupSink::new(
            &archive.directory,
            self.config.get_int("basebackup.queue_depth")? as u32,
            self.config.get_int("basebackup.block_size")? as usize,
        )?;

        let driver = BaseBackupDriver::new(&self.catalog, &archive, &profile, self.cancel.clone());
        let result = driver
            .run(&ident.systemid, ident.wal_segment_size, &mut source, &mut sink)
            .await;
        source.into_session().disconnect().await;
        let backup = result?;
        println!(
            "basebackup {} ready, {} tablespace(s), {}",
            backup.id,
            backup.tablespaces.len(),
            backup.fsentry
        );
        Ok(())
    }

    fn list_backup_catalog(&mut self, descr: &CommandDescr) -> Result<()> {
        let (stat, backups) = self.catalog.within_transaction(|catalog| {
            let stat = catalog.stat_catalog(&descr.archive_name)?;
            let backups = catalog.get_backup_list(stat.archive_id)?;
            Ok((stat, backups))
        })?;
        if descr.json {
            let rendered = serde_json::json!({ "stat": stat, "backups": backups });
            println!("{}", to_json(&rendered)?);
            return Ok(());
        }
        print_header(&format!("Backup catalog for archive {}", stat.archive_name));
        println!("{:<25}\t{}", "DIRECTORY", stat.archive_directory);
        println!("{:<25}\t{}", "BACKUPS", stat.number_of_backups);
        println!("{:<25}\t{}", "FAILED", stat.backups_failed);
        println!("{:<25}\t{}", "RUNNING", stat.backups_running);
        println!(
            "{:<25}\t{}",
            "TOTAL SIZE",
            pretty_size(stat.estimated_total_size)
        );
        println!(
            "{:<25}\t{}s",
            "AVG DURATION", stat.avg_backup_duration_secs
        );
        println!("{:<25}\t{}", "LATEST FINISHED", stat.latest_finished);
        if descr.verbose {
            println!();
            println!(
                "{:<6}\t{:<12}\t{:<20}\t{:<8}\t{:<6}",
                "ID", "STATUS", "STARTED", "PINNED", "TLI"
            );
            for backup in backups {
                println!(
                    "{:<6}\t{:<12}\t{:<20}\t{:<8}\t{:<6}",
                    backup.id,
                    backup.status.as_str(),
                    backup
                        .started
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_default(),
                    backup.pinned,
                    backup.timeline,
                );
            }
        }
        Ok(())
    }

    fn drop_basebackup(&mut self, descr: &CommandDescr, exists_ok: bool) -> Result<()> {
        let backup_id = descr
            .basebackup_id
            .ok_or_else(|| ArchiveError::invalid("basebackup", "no backup id given"))?;
        let dropped = self.catalog.within_transaction(|catalog| {
            match catalog.get_basebackup_by_id(backup_id)? {
                Some(backup) => {
                    if backup.pinned > 0 {
                        return Err(ArchiveError::Integrity(format!(
                            "basebackup {backup_id} is pinned"
                        )));
                    }
                    catalog.drop_basebackup(backup_id)?;
                    Ok(Some(backup))
                }
                None if exists_ok => Ok(None),
                None => Err(ArchiveError::not_found(
                    Entity::Basebackup,
                    backup_id.to_string(),
                )),
            }
        })?;
        if let Some(backup) = dropped {
            remove_backup_files(&backup);
            println!("basebackup {backup_id} dropped");
        }
        Ok(())
    }

    /// Resolve the ids a PIN/UNPIN operates on. Count selections walk the
    /// ready backups oldest first; `pinned` is only meaningful for unpin.
    fn resolve_pin_targets(
        catalog: &BackupCatalog,
        archive_id: i64,
        pin: &PinDescr,
    ) -> Result<Vec<i64>> {
        match pin.operation {
            PinOperation::Id(id) => {
                let backup = catalog.get_basebackup_by_id(id)?.ok_or_else(|| {
                    ArchiveError::not_found(Entity::Basebackup, id.to_string())
                })?;
                if backup.status != BackupStatus::Ready {
                    return Err(ArchiveError::invalid(
                        "basebackup",
                        format!("basebackup {id} is not ready"),
                    ));
                }
                Ok(vec![id])
            }
            PinOperation::Count(n) => {
                let mut ready: Vec<i64> = catalog
                    .get_backup_list(archive_id)?
                    .into_iter()
                    .filter(|b| b.status == BackupStatus::Ready)
                    .map(|b| b.id)
                    .collect();
                ready.reverse(); // oldest first
                ready.truncate(n as usize);
                Ok(ready)
            }
            PinOperation::Newest => Ok(catalog
                .get_basebackup(archive_id, RetrieveMode::Newest)?
                .map(|b| vec![b.id])
                .unwrap_or_default()),
            PinOperation::Oldest => Ok(catalog
                .get_basebackup(archive_id, RetrieveMode::Oldest)?
                .map(|b| vec![b.id])
                .unwrap_or_default()),
            PinOperation::Pinned => {
                if pin.tag == PinTag::Pin {
                    return Err(ArchiveError::invalid(
                        "pin",
                        "PINNED can only be used with UNPIN",
                    ));
                }
                catalog.pinned_basebackups(archive_id)
            }
        }
    }

    fn pin_basebackups(&mut self, descr: &CommandDescr) -> Result<()> {
        let pin = descr
            .pin
            .ok_or_else(|| ArchiveError::invalid("pin", "no pin operation given"))?;
        let count = self.catalog.within_transaction(|catalog| {
            let archive = Self::require_archive(catalog, &descr.archive_name)?;
            let targets = Self::resolve_pin_targets(catalog, archive.id, &pin)?;
            catalog.pin_basebackups(&targets, pin.tag == PinTag::Pin)?;
            Ok(targets.len())
        })?;
        println!(
            "{} {count} basebackup(s)",
            if pin.tag == PinTag::Pin {
                "pinned"
            } else {
                "unpinned"
            }
        );
        Ok(())
    }

    /* ---------------- retention ---------------- */

    fn create_retention_policy(&mut self, descr: &CommandDescr, exists_ok: bool) -> Result<()> {
        let mut policy = descr
            .retention
            .clone()
            .ok_or_else(|| ArchiveError::invalid("retention", "no policy given"))?;
        if policy.rules.is_empty() {
            return Err(ArchiveError::invalid("retention", "policy has no rules"));
        }
        self.catalog.within_transaction(|catalog| {
            match catalog.get_retention_policy(&policy.name)? {
                None => catalog.create_retention_policy(&mut policy),
                Some(_) if exists_ok => Ok(()),
                Some(_) => Err(ArchiveError::already_exists(
                    Entity::RetentionPolicy,
                    &policy.name,
                )),
            }
        })
    }

    fn drop_retention_policy(&mut self, descr: &CommandDescr, exists_ok: bool) -> Result<()> {
        self.catalog.within_transaction(|catalog| {
            match catalog.get_retention_policy(&descr.retention_name)? {
                Some(_) => catalog.drop_retention_policy(&descr.retention_name),
                None if exists_ok => Ok(()),
                None => Err(ArchiveError::not_found(
                    Entity::RetentionPolicy,
                    &descr.retention_name,
                )),
            }
        })
    }

    fn list_retention_policies(&mut self, descr: &CommandDescr) -> Result<()> {
        if descr.tag == CommandTag::ListRetentionPolicy {
            let policy = self
                .catalog
                .within_transaction(|catalog| {
                    catalog.get_retention_policy(&descr.retention_name)
                })?
                .ok_or_else(|| {
                    ArchiveError::not_found(Entity::RetentionPolicy, &descr.retention_name)
                })?;
            print_header(&format!("retention policy {}", policy.name));
            for rule in &policy.rules {
                println!("{:<6}\t{:<28?}\t{}", rule.id, rule.kind, rule.value);
            }
        } else {
            let policies = self
                .catalog
                .within_transaction(|catalog| catalog.get_retention_policies())?;
            print_header("List of retention policies");
            println!("{:<25}\t{:<8}\t{}", "Name", "Rules", "Created");
            for policy in policies {
                println!(
                    "{:<25}\t{:<8}\t{}",
                    policy.name,
                    policy.rules.len(),
                    policy
                        .created
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_default()
                );
            }
        }
        Ok(())
    }

    fn apply_retention_policy(&mut self, descr: &CommandDescr) -> Result<()> {
        // One transaction covers the whole read-decide-write body, so the
        // plan acts on exactly the inventory it was computed from.
        let (archive, policy_name, cleanup, deleted) =
            self.catalog.within_transaction(|catalog| {
                let archive = Self::require_archive(catalog, &descr.archive_name)?;
                let policy = catalog
                    .get_retention_policy(&descr.retention_name)?
                    .ok_or_else(|| {
                        ArchiveError::not_found(Entity::RetentionPolicy, &descr.retention_name)
                    })?;
                let inventory = catalog.get_backup_list(archive.id)?;

                let plan = retention::evaluate(&policy, &inventory, Utc::now())?;
                for (backup_id, pin) in &plan.pins {
                    catalog.pin_basebackups(&[*backup_id], *pin)?;
                }
                let deleted: Vec<BaseBackupDescr> = plan
                    .cleanup
                    .basebackups
                    .iter()
                    .filter(|(_, keep)| !keep)
                    .map(|(b, _)| b.clone())
                    .collect();
                for backup in &deleted {
                    catalog.drop_basebackup(backup.id)?;
                }
                Ok((archive, policy.name, plan.cleanup, deleted))
            })?;

        // The catalog decision is durable; file removal is best-effort and
        // repairable by a later run.
        for backup in &deleted {
            remove_backup_files(backup);
        }
        let wal_dir = Path::new(&archive.directory).join(WAL_SUBDIR);
        let segments_removed = match cleanup_wal_segments(&wal_dir, &cleanup) {
            Ok(n) => n,
            Err(e) => {
                warn!("WAL cleanup failed: {e}");
                0
            }
        };

        println!(
            "retention policy {policy_name} applied: {} basebackup(s) dropped, \
             {} WAL segment(s) removed",
            deleted.len(),
            segments_removed
        );
        Ok(())
    }

    /* ---------------- streaming ---------------- */

    async fn start_streaming(&mut self, descr: &CommandDescr) -> Result<()> {
        let (archive, con) = self.catalog.within_transaction(|catalog| {
            let archive = Self::require_archive(catalog, &descr.archive_name)?;
            // A dedicated streamer connection wins; otherwise the
            // basebackup connection serves both.
            let con = match catalog.get_connection(archive.id, ConnectionKind::Streamer)? {
                Some(con) => con,
                None => catalog
                    .get_connection(archive.id, ConnectionKind::Basebackup)?
                    .ok_or_else(|| ArchiveError::not_found(Entity::Connection, "basebackup"))?,
            };
            Ok((archive, con))
        })?;

        worker::register_self(&self.catalog, WorkerKind::Streamer, archive.id)?;
        let result = self.run_stream(descr, &archive, &con).await;
        if let Err(e) = worker::mark_self_shutdown(&self.catalog) {
            warn!("could not mark streamer shutdown: {e}");
        }
        result
    }

    async fn run_stream(
        &mut self,
        descr: &CommandDescr,
        archive: &ArchiveDescr,
        con: &ConnectionDescr,
    ) -> Result<()> {
        let session = ReplicationSession::connect(con).await?;
        let mut ident = session.identify(archive.id).await?;

        let slot_name = descr
            .slot_name
            .clone()
            .unwrap_or_else(|| format!("archivekeeper_{}", archive.name));
        let slot = session.create_physical_slot(&slot_name, true).await?;
        ident.slot_name = slot_name;
        ident.slot = Some(slot);

        // Resume from the last durable position this archive reached,
        // unless there is none yet.
        if let Some(prior) = self
            .catalog
            .get_streams(archive.id)?
            .into_iter()
            .filter(|s| s.xlogpos.is_valid())
            .last()
        {
            if prior.xlogpos > ident.xlogpos {
                return Err(ArchiveError::Integrity(format!(
                    "catalog restart position {} ahead of server position {}",
                    prior.xlogpos, ident.xlogpos
                )));
            }
            ident.xlogpos = prior.xlogpos;
        }

        self.catalog
            .within_transaction(|catalog| catalog.register_stream(&mut ident))?;

        let status_interval =
            Duration::from_secs(self.config.get_int("streamer.status_interval")? as u64);
        let wal_dir = Path::new(&archive.directory).join(WAL_SUBDIR);
        let stream_id = ident.id;
        let mut receiver = WalReceiver::new(
            &self.catalog,
            &mut ident,
            self.cancel.clone(),
            status_interval,
        );
        if let Err(e) = receiver.run(&session, &wal_dir).await {
            if let Err(update_err) = self
                .catalog
                .update_stream_status(stream_id, StreamStatus::Failed)
            {
                warn!("could not mark stream failed: {update_err}");
            }
            return Err(e);
        }
        session.disconnect().await;
        Ok(())
    }

    fn stop_streaming(&mut self, descr: &CommandDescr) -> Result<()> {
        let streamers = self.catalog.within_transaction(|catalog| {
            let archive = Self::require_archive(catalog, &descr.archive_name)?;
            Ok(catalog
                .get_workers()?
                .into_iter()
                .filter(|w| w.kind == WorkerKind::Streamer && w.archive_id == archive.id)
                .filter(|w| w.state == WorkerState::Running)
                .collect::<Vec<_>>())
        })?;
        if streamers.is_empty() {
            println!("no running streamer for archive {}", descr.archive_name);
            return Ok(());
        }
        for streamer in streamers {
            match worker::signal_shutdown(streamer.pid) {
                Ok(true) => println!("signalled streamer at pid {}", streamer.pid),
                _ => warn!("could not signal streamer at pid {}", streamer.pid),
            }
        }
        Ok(())
    }

    /* ---------------- workers ---------------- */

    /// Body of the launcher worker process: hold the single launcher slot
    /// and idle until shutdown. Streamers and backup workers are spawned
    /// by their commands; the launcher keeps the registry tidy.
    async fn run_launcher(&mut self) -> Result<()> {
        worker::register_self(&self.catalog, WorkerKind::Launcher, -1)?;
        info!("launcher running at pid {}", std::process::id());
        self.cancel.cancelled().await;
        worker::mark_self_shutdown(&self.catalog)
    }

    fn show_workers(&mut self, descr: &CommandDescr) -> Result<()> {
        let workers = self
            .catalog
            .within_transaction(|catalog| catalog.get_workers())?;
        if descr.json {
            println!("{}", to_json(&workers)?);
            return Ok(());
        }
        print_header("Registered workers");
        println!(
            "{:<8}\t{:<10}\t{:<10}\t{:<10}\t{}",
            "PID", "TYPE", "STATE", "ARCHIVE", "STARTED"
        );
        for w in workers {
            println!(
                "{:<8}\t{:<10}\t{:<10}\t{:<10}\t{}",
                w.pid,
                w.kind.as_str(),
                w.state.as_str(),
                w.archive_id,
                w.started
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default()
            );
        }
        Ok(())
    }

    /// Spawn the wrapped command as a background process. Only commands
    /// with a long-running body can be wrapped.
    fn launch_background(&mut self, descr: &CommandDescr) -> Result<()> {
        let args = Self::background_args(descr)?;
        let pid = worker::launch(&JobInfo {
            detach: descr.detach,
            args,
        })?;
        println!("background worker launched at pid {pid}");
        Ok(())
    }

    fn background_args(descr: &CommandDescr) -> Result<Vec<String>> {
        let mut args: Vec<String> = Vec::new();
        match descr.sub_tag {
            Some(CommandTag::StartBasebackup) => {
                args.extend(["basebackup".into(), "start".into()]);
                args.extend(["--archive".into(), descr.archive_name.clone()]);
                if let Some(profile) = descr.profile.as_ref().filter(|p| !p.name.is_empty()) {
                    args.extend(["--profile".into(), profile.name.clone()]);
                }
                args.push("--foreground".into());
            }
            Some(CommandTag::StartStreamingForArchive) => {
                args.extend(["streaming".into(), "start".into()]);
                args.extend(["--archive".into(), descr.archive_name.clone()]);
                if let Some(slot) = &descr.slot_name {
                    args.extend(["--slot".into(), slot.clone()]);
                }
                args.push("--foreground".into());
            }
            Some(CommandTag::StartLauncher) => {
                args.extend(["launcher".into(), "start".into(), "--foreground".into()]);
            }
            other => {
                return Err(ArchiveError::invalid(
                    "command",
                    format!("{other:?} cannot run as a background worker"),
                ))
            }
        }
        Ok(args)
    }

    /* ---------------- misc ---------------- */

    fn exec_command(&mut self, descr: &CommandDescr) -> Result<()> {
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(&descr.exec_string)
            .status()?;
        if !status.success() {
            return Err(ArchiveError::Io {
                reason: format!("command exited with {status}"),
                os_code: status.code(),
            });
        }
        Ok(())
    }
}

/* ---------------- filesystem side ---------------- */

/// Create the on-disk layout of a fresh archive: base directory, WAL
/// subdirectory and the marker file identifying the tree.
fn init_archive_dir(directory: &str) -> Result<()> {
    let base = Path::new(directory);
    std::fs::create_dir_all(base)?;
    std::fs::create_dir_all(base.join(WAL_SUBDIR))?;
    let marker = base.join(ARCHIVE_MARKER_FILE);
    std::fs::write(&marker, ARCHIVE_MARKER_CONTENT)?;
    std::fs::File::open(base)?.sync_all()?;
    Ok(())
}

/// Structural check of an archive directory tree.
fn verify_archive_dir(directory: &str) -> Result<()> {
    let base = Path::new(directory);
    if !base.is_dir() {
        return Err(ArchiveError::Io {
            reason: format!("archive directory {directory} does not exist"),
            os_code: None,
        });
    }
    if !base.join(ARCHIVE_MARKER_FILE).is_file() {
        return Err(ArchiveError::Integrity(format!(
            "{directory} is not an archive: marker file missing"
        )));
    }
    if !base.join(WAL_SUBDIR).is_dir() {
        return Err(ArchiveError::Integrity(format!(
            "{directory} has no WAL directory"
        )));
    }
    Ok(())
}

fn remove_backup_files(backup: &BaseBackupDescr) {
    if backup.fsentry.is_empty() {
        return;
    }
    if let Err(e) = std::fs::remove_dir_all(&backup.fsentry) {
        warn!("could not remove {}: {e}", backup.fsentry);
    }
}

/// Delete WAL segment files released by a cleanup plan. Only completed
/// segments are touched; a `.partial` segment is still being written.
fn cleanup_wal_segments(wal_dir: &Path, cleanup: &CleanupDescr) -> Result<usize> {
    if cleanup.mode == WalCleanupMode::None || !wal_dir.is_dir() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in std::fs::read_dir(wal_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !is_segment_file_name(name) {
            continue;
        }
        let delete = match cleanup.mode {
            WalCleanupMode::All => true,
            WalCleanupMode::Range | WalCleanupMode::Offset => {
                cleanup.offsets.iter().any(|off| {
                    let Some((segno, tli)) = segment_from_file_name(name, off.wal_segment_size)
                    else {
                        return false;
                    };
                    if tli != off.timeline {
                        return false;
                    }
                    let start_segno = if off.start == Lsn::INVALID {
                        0
                    } else {
                        off.start.segment_number(off.wal_segment_size)
                    };
                    segno >= start_segno && segno < off.end.segment_number(off.wal_segment_size)
                })
            }
            WalCleanupMode::None => false,
        };
        if delete {
            std::fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn print_header(caption: &str) {
    println!("{caption}");
    println!("{}", "-".repeat(60));
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| ArchiveError::Io {
        reason: format!("could not render JSON output: {e}"),
        os_code: None,
    })
}

/// Format a byte count the way humans read archive sizes.
pub fn pretty_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if size >= GB {
        format!("{:.1} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.1} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.1} kB", size as f64 / KB as f64)
    } else {
        format!("{size} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::segment_file_name;
    use crate::catalog::descr::CleanupOffset;

    #[test]
    fn size_formatting() {
        assert_eq!(pretty_size(512), "512 B");
        assert_eq!(pretty_size(2048), "2.0 kB");
        assert_eq!(pretty_size(3 * 1024 * 1024), "3.0 MB");
        assert_eq!(pretty_size(5 * 1024 * 1024 * 1024), "5.0 GB");
    }

    #[test]
    fn background_args_cover_wrappable_commands() {
        let mut descr = CommandDescr::new(CommandTag::StartStreamingForArchive);
        descr.archive_name = "a1".into();
        let descr = descr.into_background();
        let args = CommandExecutor::background_args(&descr).unwrap();
        assert_eq!(
            args,
            vec!["streaming", "start", "--archive", "a1", "--foreground"]
        );

        let descr = CommandDescr::new(CommandTag::ListArchive).into_background();
        assert!(CommandExecutor::background_args(&descr).is_err());
    }

    #[test]
    fn wal_cleanup_respects_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let seg_size = crate::wal::DEFAULT_WAL_SEGMENT_SIZE;
        for segno in 0..6u64 {
            std::fs::write(dir.path().join(segment_file_name(1, segno, seg_size)), b"x").unwrap();
        }
        // a partial segment and an unrelated file must survive any mode
        std::fs::write(
            dir.path()
                .join(format!("{}.partial", segment_file_name(1, 6, seg_size))),
            b"x",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let cleanup = CleanupDescr {
            basebackups: Vec::new(),
            mode: WalCleanupMode::Range,
            offsets: vec![CleanupOffset {
                timeline: 1,
                wal_segment_size: seg_size,
                start: Lsn(seg_size),     // segment 1
                end: Lsn(4 * seg_size),   // segment 4 stays
            }],
        };
        let removed = cleanup_wal_segments(dir.path(), &cleanup).unwrap();
        assert_eq!(removed, 3); // segments 1, 2, 3
        assert!(dir.path().join(segment_file_name(1, 0, seg_size)).exists());
        assert!(dir.path().join(segment_file_name(1, 4, seg_size)).exists());
        assert!(!dir.path().join(segment_file_name(1, 2, seg_size)).exists());

        let cleanup_all = CleanupDescr {
            basebackups: Vec::new(),
            mode: WalCleanupMode::All,
            offsets: Vec::new(),
        };
        let removed = cleanup_wal_segments(dir.path(), &cleanup_all).unwrap();
        assert_eq!(removed, 3); // the remaining completed segments
        assert!(dir
            .path()
            .join(format!("{}.partial", segment_file_name(1, 6, seg_size)))
            .exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn archive_dir_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let archive_dir = dir.path().join("a1");
        let archive_str = archive_dir.to_string_lossy();

        assert!(verify_archive_dir(&archive_str).is_err());
        init_archive_dir(&archive_str).unwrap();
        verify_archive_dir(&archive_str).unwrap();

        std::fs::remove_file(archive_dir.join(ARCHIVE_MARKER_FILE)).unwrap();
        assert!(matches!(
            verify_archive_dir(&archive_str),
            Err(ArchiveError::Integrity(_))
        ));
    }
}
