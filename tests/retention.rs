//! End-to-end retention scenarios: policies stored in the catalog,
//! applied through the executor, with basebackup rows and archive files
//! going away together.

use chrono::{Duration, Utc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use archivekeeper::catalog::descr::{
    attno, AttrSet, BackupStatus, BaseBackupDescr, CommandDescr, CommandTag, PinDescr,
    PinOperation, PinTag, RetentionRuleKind,
};
use archivekeeper::catalog::BackupCatalog;
use archivekeeper::commands::CommandExecutor;
use archivekeeper::retention;
use archivekeeper::wal::{segment_file_name, Lsn, DEFAULT_WAL_SEGMENT_SIZE};
use archivekeeper::WAL_SUBDIR;

struct Fixture {
    _dir: TempDir,
    exec: CommandExecutor,
    archive_id: i64,
    archive_dir: std::path::PathBuf,
}

/// Catalog with one archive and five ready basebackups aged just short of
/// 1..5 days, so a backup "aged k days" stays on the young side of a
/// `k days` threshold while the test runs. Backup aged `k` days starts at
/// WAL segment `6 - k`; its directory and the corresponding WAL segments
/// exist on disk.
async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let catalog = BackupCatalog::new(dir.path().join("catalog.db"));
    let mut exec = CommandExecutor::new(catalog, CancellationToken::new());

    let mut create = CommandDescr::new(CommandTag::CreateArchive);
    create.archive_name = "a1".into();
    create.directory = dir.path().join("a1").to_string_lossy().into_owned();
    create.attrs = AttrSet::of(&[
        attno::ARCHIVE_NAME,
        attno::ARCHIVE_DIRECTORY,
        attno::ARCHIVE_COMPRESSION,
    ]);
    exec.execute(create, false).await.unwrap();
    let archive = exec.catalog.exists_by_name("a1").unwrap().unwrap();
    let archive_dir = dir.path().join("a1");

    let now = Utc::now();
    for age_days in (1..=5).rev() {
        let seg = (6 - age_days) as u64;
        let fsentry = archive_dir.join(format!("basebackup-{age_days}d"));
        std::fs::create_dir_all(&fsentry).unwrap();
        let mut backup = BaseBackupDescr {
            label: format!("age-{age_days}"),
            fsentry: fsentry.to_string_lossy().into_owned(),
            started: Some(now - Duration::days(age_days) + Duration::minutes(5)),
            xlogpos: Lsn(seg * DEFAULT_WAL_SEGMENT_SIZE),
            timeline: 1,
            wal_segment_size: DEFAULT_WAL_SEGMENT_SIZE,
            ..Default::default()
        };
        exec.catalog
            .register_basebackup(archive.id, &mut backup)
            .unwrap();
        backup.xlogposend = backup.xlogpos + 0x1000;
        exec.catalog.finalize_basebackup(&mut backup).unwrap();
    }

    let wal_dir = archive_dir.join(WAL_SUBDIR);
    for seg in 0..7u64 {
        std::fs::write(
            wal_dir.join(segment_file_name(1, seg, DEFAULT_WAL_SEGMENT_SIZE)),
            b"wal",
        )
        .unwrap();
    }

    Fixture {
        _dir: dir,
        exec,
        archive_id: archive.id,
        archive_dir,
    }
}

async fn create_policy(fx: &mut Fixture, name: &str, rules: &[&str]) {
    let mut descr = CommandDescr::new(CommandTag::CreateRetentionPolicy);
    descr.retention_name = name.to_string();
    let mut policy = archivekeeper::catalog::descr::RetentionDescr {
        name: name.to_string(),
        ..Default::default()
    };
    for rule in rules {
        policy.rules.push(retention::parse_rule(rule).unwrap());
    }
    descr.retention = Some(policy);
    fx.exec.execute(descr, false).await.unwrap();
}

async fn apply_policy(fx: &mut Fixture, name: &str) {
    let mut descr = CommandDescr::new(CommandTag::ApplyRetentionPolicy);
    descr.retention_name = name.to_string();
    descr.archive_name = "a1".into();
    fx.exec.execute(descr, false).await.unwrap();
}

#[tokio::test]
async fn keep_num_wins_over_drop_older() {
    let mut fx = fixture().await;
    create_policy(
        &mut fx,
        "keep2",
        &["keep num 2", "drop older 3 days", "cleanup"],
    )
    .await;

    // the stored datetime rule carries the canonical interval form
    let policy = fx
        .exec
        .catalog
        .get_retention_policy("keep2")
        .unwrap()
        .unwrap();
    let datetime_rule = policy
        .rules
        .iter()
        .find(|r| r.kind == RetentionRuleKind::DropOlderByDatetime)
        .unwrap();
    assert_eq!(datetime_rule.value, "3 days");

    apply_policy(&mut fx, "keep2").await;

    let remaining = fx.exec.catalog.get_backup_list(fx.archive_id).unwrap();
    let labels: Vec<&str> = remaining.iter().map(|b| b.label.as_str()).collect();
    // newest two via keep num, the 3-day-old one is not older than 3 days
    assert_eq!(labels, vec!["age-1", "age-2", "age-3"]);

    // dropped backup directories went with their rows
    assert!(!fx.archive_dir.join("basebackup-4d").exists());
    assert!(!fx.archive_dir.join("basebackup-5d").exists());
    assert!(fx.archive_dir.join("basebackup-3d").exists());

    // WAL below the oldest retained backup (segment 3) is gone, from the
    // oldest dropped backup's segment (1) upward; segment 0 predates the
    // released range
    let wal_dir = fx.archive_dir.join(WAL_SUBDIR);
    let seg = |n| wal_dir.join(segment_file_name(1, n, DEFAULT_WAL_SEGMENT_SIZE));
    assert!(seg(0).exists());
    assert!(!seg(1).exists());
    assert!(!seg(2).exists());
    assert!(seg(3).exists());
    assert!(seg(6).exists());
}

#[tokio::test]
async fn pinned_basebackup_survives_policy() {
    let mut fx = fixture().await;

    // pin the 3-day-old backup
    let target = fx
        .exec
        .catalog
        .get_backup_list(fx.archive_id)
        .unwrap()
        .into_iter()
        .find(|b| b.label == "age-3")
        .unwrap();
    let mut pin = CommandDescr::new(CommandTag::PinBasebackup);
    pin.archive_name = "a1".into();
    pin.pin = Some(PinDescr {
        tag: PinTag::Pin,
        operation: PinOperation::Id(target.id),
    });
    fx.exec.execute(pin, false).await.unwrap();

    // a policy that would drop everything older than 2 days
    create_policy(&mut fx, "harsh", &["drop older 2 days"]).await;
    apply_policy(&mut fx, "harsh").await;

    let remaining = fx.exec.catalog.get_backup_list(fx.archive_id).unwrap();
    let labels: Vec<&str> = remaining.iter().map(|b| b.label.as_str()).collect();
    // age-3 .. age-5 are older than 2 days, but age-3 is pinned
    assert_eq!(labels, vec!["age-1", "age-2", "age-3"]);
    let kept = remaining.iter().find(|b| b.label == "age-3").unwrap();
    assert_eq!(kept.pinned, 1);
    assert!(fx.archive_dir.join("basebackup-3d").exists());

    // unpinning by id and re-applying drops it
    let mut unpin = CommandDescr::new(CommandTag::UnpinBasebackup);
    unpin.archive_name = "a1".into();
    unpin.pin = Some(PinDescr {
        tag: PinTag::Unpin,
        operation: PinOperation::Id(kept.id),
    });
    fx.exec.execute(unpin, false).await.unwrap();
    apply_policy(&mut fx, "harsh").await;

    let remaining = fx.exec.catalog.get_backup_list(fx.archive_id).unwrap();
    let labels: Vec<&str> = remaining.iter().map(|b| b.label.as_str()).collect();
    assert_eq!(labels, vec!["age-1", "age-2"]);
}

#[tokio::test]
async fn keep_label_protects_and_policies_list() {
    let mut fx = fixture().await;
    create_policy(
        &mut fx,
        "labelled",
        &["keep label age-5", "drop num 5"],
    )
    .await;
    apply_policy(&mut fx, "labelled").await;

    let remaining = fx.exec.catalog.get_backup_list(fx.archive_id).unwrap();
    let labels: Vec<&str> = remaining.iter().map(|b| b.label.as_str()).collect();
    assert_eq!(labels, vec!["age-5"]);
    assert_eq!(remaining[0].status, BackupStatus::Ready);

    // drop and recreate under the same name round-trips
    let mut drop = CommandDescr::new(CommandTag::DropRetentionPolicy);
    drop.retention_name = "labelled".into();
    fx.exec.execute(drop, false).await.unwrap();
    assert!(fx
        .exec
        .catalog
        .get_retention_policy("labelled")
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn pin_count_operates_oldest_first() {
    let mut fx = fixture().await;

    let mut pin = CommandDescr::new(CommandTag::PinBasebackup);
    pin.archive_name = "a1".into();
    pin.pin = Some(PinDescr {
        tag: PinTag::Pin,
        operation: PinOperation::Count(2),
    });
    fx.exec.execute(pin, false).await.unwrap();

    let backups = fx.exec.catalog.get_backup_list(fx.archive_id).unwrap();
    for backup in &backups {
        let expect_pinned = backup.label == "age-4" || backup.label == "age-5";
        assert_eq!(backup.pinned > 0, expect_pinned, "backup {}", backup.label);
    }

    // unpin everything pinned at once
    let mut unpin = CommandDescr::new(CommandTag::UnpinBasebackup);
    unpin.archive_name = "a1".into();
    unpin.pin = Some(PinDescr {
        tag: PinTag::Unpin,
        operation: PinOperation::Pinned,
    });
    fx.exec.execute(unpin, false).await.unwrap();
    let backups = fx.exec.catalog.get_backup_list(fx.archive_id).unwrap();
    assert!(backups.iter().all(|b| b.pinned == 0));
}
