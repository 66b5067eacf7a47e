//
// Main entry point for the archivekeeper executable.
//
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use archivekeeper::catalog::descr::{
    attno, AttrSet, BackupProfileDescr, CommandDescr, CommandTag, CompressionKind, ConnectionKind,
    PinDescr, PinOperation, PinTag, RetentionDescr,
};
use archivekeeper::catalog::BackupCatalog;
use archivekeeper::commands::CommandExecutor;
use archivekeeper::config::VarValue;
use archivekeeper::error::ArchiveError;
use archivekeeper::retention;
use archivekeeper::ArchiveKeeperConf;

const ABOUT: &str = r#"
archivekeeper maintains physical base backups and a continuous WAL
archive for PostgreSQL clusters, driven by a local backup catalog.
"#;

#[derive(Parser)]
#[command(name = "archivekeeper", about = ABOUT, long_about = None)]
struct Args {
    /// Directory holding the backup catalog database.
    #[arg(short = 'D', long, default_value = "./")]
    workdir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage archives.
    Archive {
        #[command(subcommand)]
        cmd: ArchiveCmd,
    },
    /// Manage backup profiles.
    Profile {
        #[command(subcommand)]
        cmd: ProfileCmd,
    },
    /// Manage upstream connections of an archive.
    Connection {
        #[command(subcommand)]
        cmd: ConnectionCmd,
    },
    /// Take and manage base backups.
    Basebackup {
        #[command(subcommand)]
        cmd: BasebackupCmd,
    },
    /// Manage and apply retention policies.
    Retention {
        #[command(subcommand)]
        cmd: RetentionCmd,
    },
    /// Control WAL streaming.
    Streaming {
        #[command(subcommand)]
        cmd: StreamingCmd,
    },
    /// Control the background launcher.
    Launcher {
        #[command(subcommand)]
        cmd: LauncherCmd,
    },
    /// Show registered worker processes.
    Workers {
        #[arg(long)]
        json: bool,
    },
    /// Show, set or reset runtime variables.
    Var {
        #[command(subcommand)]
        cmd: VarCmd,
    },
    /// Run a shell command.
    Exec {
        #[arg(long)]
        command: String,
    },
}

#[derive(Subcommand)]
enum ArchiveCmd {
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        directory: String,
        #[arg(long, default_value = "")]
        pghost: String,
        #[arg(long, default_value_t = 5432)]
        pgport: i64,
        #[arg(long, default_value = "")]
        pguser: String,
        #[arg(long, default_value = "")]
        pgdatabase: String,
        #[arg(long, default_value = "")]
        dsn: String,
        #[arg(long)]
        compression: bool,
        /// Succeed if the archive already exists.
        #[arg(long)]
        exists_ok: bool,
    },
    Drop {
        #[arg(long)]
        name: String,
        #[arg(long)]
        if_exists: bool,
    },
    Alter {
        #[arg(long)]
        name: String,
        #[arg(long)]
        directory: Option<String>,
        #[arg(long)]
        pghost: Option<String>,
        #[arg(long)]
        pgport: Option<i64>,
        #[arg(long)]
        pguser: Option<String>,
        #[arg(long)]
        pgdatabase: Option<String>,
        #[arg(long)]
        if_exists: bool,
    },
    Verify {
        #[arg(long)]
        name: String,
        /// Also open a replication connection to the upstream server.
        #[arg(long)]
        check_connection: bool,
    },
    List {
        #[arg(long)]
        name: Option<String>,
        #[arg(long, short)]
        verbose: bool,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ProfileCmd {
    Create {
        #[arg(long)]
        name: String,
        /// none, gzip, zstd, pbzip or plain.
        #[arg(long, default_value = "none")]
        compression: String,
        #[arg(long, default_value_t = 0)]
        max_rate: u32,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        fast_checkpoint: bool,
        #[arg(long)]
        include_wal: bool,
        #[arg(long)]
        no_wait_for_wal: bool,
        #[arg(long)]
        noverify_checksums: bool,
        #[arg(long)]
        exists_ok: bool,
    },
    Drop {
        #[arg(long)]
        name: String,
        #[arg(long)]
        if_exists: bool,
    },
    List {
        /// Show the details of one profile instead of the overview.
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConnectionCmd {
    Create {
        #[arg(long)]
        archive: String,
        /// basebackup or streamer.
        #[arg(long = "type")]
        kind: String,
        #[arg(long, default_value = "")]
        pghost: String,
        #[arg(long, default_value_t = 5432)]
        pgport: i64,
        #[arg(long, default_value = "")]
        pguser: String,
        #[arg(long, default_value = "")]
        pgdatabase: String,
        #[arg(long, default_value = "")]
        dsn: String,
        #[arg(long)]
        exists_ok: bool,
    },
    Drop {
        #[arg(long)]
        archive: String,
        #[arg(long = "type")]
        kind: String,
        #[arg(long)]
        if_exists: bool,
    },
    List {
        #[arg(long)]
        archive: String,
    },
}

#[derive(Subcommand)]
enum BasebackupCmd {
    Start {
        #[arg(long)]
        archive: String,
        #[arg(long)]
        profile: Option<String>,
        /// Run as a detached background worker.
        #[arg(long)]
        background: bool,
        /// Run in the foreground (set by the background wrapper).
        #[arg(long, hide = true)]
        foreground: bool,
    },
    List {
        #[arg(long)]
        archive: String,
        #[arg(long, short)]
        verbose: bool,
        #[arg(long)]
        json: bool,
    },
    Drop {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        if_exists: bool,
    },
    Pin {
        #[arg(long)]
        archive: String,
        #[arg(long)]
        id: Option<i64>,
        #[arg(long)]
        count: Option<u32>,
        #[arg(long)]
        newest: bool,
        #[arg(long)]
        oldest: bool,
    },
    Unpin {
        #[arg(long)]
        archive: String,
        #[arg(long)]
        id: Option<i64>,
        #[arg(long)]
        count: Option<u32>,
        #[arg(long)]
        newest: bool,
        #[arg(long)]
        oldest: bool,
        /// Unpin everything currently pinned.
        #[arg(long)]
        pinned: bool,
    },
}

#[derive(Subcommand)]
enum RetentionCmd {
    Create {
        #[arg(long)]
        name: String,
        /// Rule like "keep num 3" or "drop older 3 days"; repeatable,
        /// applied in the given order.
        #[arg(long = "rule")]
        rules: Vec<String>,
        #[arg(long)]
        exists_ok: bool,
    },
    Drop {
        #[arg(long)]
        name: String,
        #[arg(long)]
        if_exists: bool,
    },
    List {
        #[arg(long)]
        name: Option<String>,
    },
    Apply {
        #[arg(long)]
        name: String,
        #[arg(long)]
        archive: String,
    },
}

#[derive(Subcommand)]
enum StreamingCmd {
    Start {
        #[arg(long)]
        archive: String,
        #[arg(long)]
        slot: Option<String>,
        /// Stay attached to the terminal instead of detaching.
        #[arg(long)]
        foreground: bool,
    },
    Stop {
        #[arg(long)]
        archive: String,
    },
}

#[derive(Subcommand)]
enum LauncherCmd {
    Start {
        #[arg(long)]
        foreground: bool,
    },
}

#[derive(Subcommand)]
enum VarCmd {
    Show {
        name: Option<String>,
    },
    Set {
        name: String,
        value: String,
    },
    Reset {
        name: String,
    },
}

/// Translate a parsed value into the variable system's typed form.
fn parse_var_value(value: &str) -> VarValue {
    if let Ok(b) = value.parse::<bool>() {
        VarValue::Bool(b)
    } else if let Ok(i) = value.parse::<i64>() {
        VarValue::Int(i)
    } else {
        VarValue::Str(value.to_string())
    }
}

fn pin_descr(
    tag: PinTag,
    id: Option<i64>,
    count: Option<u32>,
    newest: bool,
    oldest: bool,
    pinned: bool,
) -> Result<PinDescr, ArchiveError> {
    let mut ops: Vec<PinOperation> = Vec::new();
    if let Some(id) = id {
        ops.push(PinOperation::Id(id));
    }
    if let Some(count) = count {
        ops.push(PinOperation::Count(count));
    }
    if newest {
        ops.push(PinOperation::Newest);
    }
    if oldest {
        ops.push(PinOperation::Oldest);
    }
    if pinned {
        ops.push(PinOperation::Pinned);
    }
    match ops.as_slice() {
        [op] => Ok(PinDescr { tag, operation: *op }),
        _ => Err(ArchiveError::invalid(
            "pin",
            "exactly one of --id, --count, --newest, --oldest (or --pinned) is required",
        )),
    }
}

/// Build the command descriptor for one CLI invocation. Returns the
/// descriptor and the idempotence flag handed to the executor.
fn build_descr(command: Command) -> Result<(CommandDescr, bool), ArchiveError> {
    let built = match command {
        Command::Archive { cmd } => match cmd {
            ArchiveCmd::Create {
                name,
                directory,
                pghost,
                pgport,
                pguser,
                pgdatabase,
                dsn,
                compression,
                exists_ok,
            } => {
                let mut descr = CommandDescr::new(CommandTag::CreateArchive);
                descr.archive_name = name;
                descr.directory = directory;
                descr.compression = compression;
                descr.connection.pghost = pghost;
                descr.connection.pgport = pgport;
                descr.connection.pguser = pguser;
                descr.connection.pgdatabase = pgdatabase;
                descr.connection.dsn = dsn;
                descr.attrs = AttrSet::of(&[
                    attno::ARCHIVE_NAME,
                    attno::ARCHIVE_DIRECTORY,
                    attno::ARCHIVE_COMPRESSION,
                    attno::ARCHIVE_PGHOST,
                    attno::ARCHIVE_PGPORT,
                    attno::ARCHIVE_PGUSER,
                    attno::ARCHIVE_PGDATABASE,
                ]);
                (descr, exists_ok)
            }
            ArchiveCmd::Drop { name, if_exists } => {
                let mut descr = CommandDescr::new(CommandTag::DropArchive);
                descr.archive_name = name;
                (descr, if_exists)
            }
            ArchiveCmd::Alter {
                name,
                directory,
                pghost,
                pgport,
                pguser,
                pgdatabase,
                if_exists,
            } => {
                let mut descr = CommandDescr::new(CommandTag::AlterArchive);
                descr.archive_name = name;
                if let Some(directory) = directory {
                    descr.directory = directory;
                    descr.attrs.push(attno::ARCHIVE_DIRECTORY);
                }
                if let Some(pghost) = pghost {
                    descr.connection.pghost = pghost;
                    descr.attrs.push(attno::ARCHIVE_PGHOST);
                }
                if let Some(pgport) = pgport {
                    descr.connection.pgport = pgport;
                    descr.attrs.push(attno::ARCHIVE_PGPORT);
                }
                if let Some(pguser) = pguser {
                    descr.connection.pguser = pguser;
                    descr.attrs.push(attno::ARCHIVE_PGUSER);
                }
                if let Some(pgdatabase) = pgdatabase {
                    descr.connection.pgdatabase = pgdatabase;
                    descr.attrs.push(attno::ARCHIVE_PGDATABASE);
                }
                if descr.attrs.is_empty() {
                    return Err(ArchiveError::invalid("alter archive", "nothing to alter"));
                }
                (descr, if_exists)
            }
            ArchiveCmd::Verify {
                name,
                check_connection,
            } => {
                let mut descr = CommandDescr::new(CommandTag::VerifyArchive);
                descr.archive_name = name;
                descr.check_connection = check_connection;
                (descr, false)
            }
            ArchiveCmd::List {
                name,
                verbose,
                json,
            } => {
                let mut descr = CommandDescr::new(CommandTag::ListArchive);
                descr.archive_name = name.unwrap_or_default();
                descr.verbose = verbose || !descr.archive_name.is_empty();
                descr.json = json;
                (descr, false)
            }
        },
        Command::Profile { cmd } => match cmd {
            ProfileCmd::Create {
                name,
                compression,
                max_rate,
                label,
                fast_checkpoint,
                include_wal,
                no_wait_for_wal,
                noverify_checksums,
                exists_ok,
            } => {
                let mut profile = BackupProfileDescr {
                    name,
                    compress_type: CompressionKind::parse(&compression)?,
                    max_rate,
                    fast_checkpoint,
                    include_wal,
                    wait_for_wal: !no_wait_for_wal,
                    noverify_checksums,
                    ..Default::default()
                };
                if let Some(label) = label {
                    profile.label = label;
                }
                profile.attrs = AttrSet::of(&[
                    attno::PROF_NAME,
                    attno::PROF_COMPRESS_TYPE,
                    attno::PROF_MAX_RATE,
                    attno::PROF_LABEL,
                    attno::PROF_FAST_CHKPT,
                    attno::PROF_INCL_WAL,
                    attno::PROF_WAIT_FOR_WAL,
                    attno::PROF_NOVERIFY,
                ]);
                let mut descr = CommandDescr::new(CommandTag::CreateBackupProfile);
                descr.profile = Some(profile);
                (descr, exists_ok)
            }
            ProfileCmd::Drop { name, if_exists } => {
                let mut descr = CommandDescr::new(CommandTag::DropBackupProfile);
                descr.profile = Some(BackupProfileDescr {
                    name,
                    ..Default::default()
                });
                (descr, if_exists)
            }
            ProfileCmd::List { name } => match name {
                Some(name) => {
                    let mut descr = CommandDescr::new(CommandTag::ListBackupProfileDetail);
                    descr.profile = Some(BackupProfileDescr {
                        name,
                        ..Default::default()
                    });
                    (descr, false)
                }
                None => (CommandDescr::new(CommandTag::ListBackupProfile), false),
            },
        },
        Command::Connection { cmd } => match cmd {
            ConnectionCmd::Create {
                archive,
                kind,
                pghost,
                pgport,
                pguser,
                pgdatabase,
                dsn,
                exists_ok,
            } => {
                let mut descr = CommandDescr::new(CommandTag::CreateConnection);
                descr.archive_name = archive;
                descr.connection.kind = ConnectionKind::parse(&kind)?;
                descr.connection.pghost = pghost;
                descr.connection.pgport = pgport;
                descr.connection.pguser = pguser;
                descr.connection.pgdatabase = pgdatabase;
                descr.connection.dsn = dsn;
                (descr, exists_ok)
            }
            ConnectionCmd::Drop {
                archive,
                kind,
                if_exists,
            } => {
                let mut descr = CommandDescr::new(CommandTag::DropConnection);
                descr.archive_name = archive;
                descr.connection.kind = ConnectionKind::parse(&kind)?;
                (descr, if_exists)
            }
            ConnectionCmd::List { archive } => {
                let mut descr = CommandDescr::new(CommandTag::ListConnection);
                descr.archive_name = archive;
                (descr, false)
            }
        },
        Command::Basebackup { cmd } => match cmd {
            BasebackupCmd::Start {
                archive,
                profile,
                background,
                foreground: _,
            } => {
                let mut descr = CommandDescr::new(CommandTag::StartBasebackup);
                descr.archive_name = archive;
                if let Some(profile) = profile {
                    descr.profile = Some(BackupProfileDescr {
                        name: profile,
                        ..Default::default()
                    });
                }
                if background {
                    descr = descr.into_background();
                }
                (descr, false)
            }
            BasebackupCmd::List {
                archive,
                verbose,
                json,
            } => {
                let mut descr = CommandDescr::new(CommandTag::ListBackupCatalog);
                descr.archive_name = archive;
                descr.verbose = verbose;
                descr.json = json;
                (descr, false)
            }
            BasebackupCmd::Drop { id, if_exists } => {
                let mut descr = CommandDescr::new(CommandTag::DropBasebackup);
                descr.basebackup_id = Some(id);
                (descr, if_exists)
            }
            BasebackupCmd::Pin {
                archive,
                id,
                count,
                newest,
                oldest,
            } => {
                let mut descr = CommandDescr::new(CommandTag::PinBasebackup);
                descr.archive_name = archive;
                descr.pin = Some(pin_descr(PinTag::Pin, id, count, newest, oldest, false)?);
                (descr, false)
            }
            BasebackupCmd::Unpin {
                archive,
                id,
                count,
                newest,
                oldest,
                pinned,
            } => {
                let mut descr = CommandDescr::new(CommandTag::UnpinBasebackup);
                descr.archive_name = archive;
                descr.pin = Some(pin_descr(PinTag::Unpin, id, count, newest, oldest, pinned)?);
                (descr, false)
            }
        },
        Command::Retention { cmd } => match cmd {
            RetentionCmd::Create {
                name,
                rules,
                exists_ok,
            } => {
                let mut policy = RetentionDescr {
                    name,
                    ..Default::default()
                };
                for rule in &rules {
                    policy.rules.push(retention::parse_rule(rule)?);
                }
                let mut descr = CommandDescr::new(CommandTag::CreateRetentionPolicy);
                descr.retention_name = policy.name.clone();
                descr.retention = Some(policy);
                (descr, exists_ok)
            }
            RetentionCmd::Drop { name, if_exists } => {
                let mut descr = CommandDescr::new(CommandTag::DropRetentionPolicy);
                descr.retention_name = name;
                (descr, if_exists)
            }
            RetentionCmd::List { name } => match name {
                Some(name) => {
                    let mut descr = CommandDescr::new(CommandTag::ListRetentionPolicy);
                    descr.retention_name = name;
                    (descr, false)
                }
                None => (CommandDescr::new(CommandTag::ListRetentionPolicies), false),
            },
            RetentionCmd::Apply { name, archive } => {
                let mut descr = CommandDescr::new(CommandTag::ApplyRetentionPolicy);
                descr.retention_name = name;
                descr.archive_name = archive;
                (descr, false)
            }
        },
        Command::Streaming { cmd } => match cmd {
            StreamingCmd::Start {
                archive,
                slot,
                foreground,
            } => {
                let mut descr = CommandDescr::new(CommandTag::StartStreamingForArchive);
                descr.archive_name = archive;
                descr.slot_name = slot;
                if !foreground {
                    descr = descr.into_background();
                }
                (descr, false)
            }
            StreamingCmd::Stop { archive } => {
                let mut descr = CommandDescr::new(CommandTag::StopStreamingForArchive);
                descr.archive_name = archive;
                (descr, false)
            }
        },
        Command::Launcher { cmd } => match cmd {
            LauncherCmd::Start { foreground } => {
                let mut descr = CommandDescr::new(CommandTag::StartLauncher);
                if !foreground {
                    descr = descr.into_background();
                }
                (descr, false)
            }
        },
        Command::Workers { json } => {
            let mut descr = CommandDescr::new(CommandTag::ShowWorkers);
            descr.json = json;
            (descr, false)
        }
        Command::Var { cmd } => match cmd {
            VarCmd::Show { name } => match name {
                Some(name) => {
                    let mut descr = CommandDescr::new(CommandTag::ShowVariable);
                    descr.var_name = name;
                    (descr, false)
                }
                None => (CommandDescr::new(CommandTag::ShowVariables), false),
            },
            VarCmd::Set { name, value } => {
                let mut descr = CommandDescr::new(CommandTag::SetVariable);
                descr.var_name = name;
                descr.var_value = Some(parse_var_value(&value));
                (descr, false)
            }
            VarCmd::Reset { name } => {
                let mut descr = CommandDescr::new(CommandTag::ResetVariable);
                descr.var_name = name;
                (descr, false)
            }
        },
        Command::Exec { command } => {
            let mut descr = CommandDescr::new(CommandTag::ExecCommand);
            descr.exec_string = command;
            (descr, false)
        }
    };
    Ok(built)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let conf = ArchiveKeeperConf {
        workdir: args.workdir,
    };

    // Long-running commands stop at their next cancellation point when
    // the process is asked to terminate.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
            debug!("termination requested");
            cancel.cancel();
        });
    }

    let (descr, exists_ok) = build_descr(args.command)?;
    let catalog = BackupCatalog::new(conf.catalog_path());
    let mut executor = CommandExecutor::new(catalog, cancel);
    executor.execute(descr, exists_ok).await?;
    Ok(())
}
