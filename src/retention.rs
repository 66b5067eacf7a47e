//! Retention policies: interval expressions, rule evaluation and the
//! resulting cleanup plan.
//!
//! A policy is an ordered rule list. Rules are applied in list order over
//! the archive's backup inventory (newest first); the first mark wins, so a
//! backup kept by one rule cannot be demoted by a later drop rule. Pinned
//! backups are implicitly kept. After all backup decisions, the WAL cleanup
//! boundaries are deduced from the oldest retained backup per timeline.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Months, Utc};

use crate::catalog::descr::{
    BaseBackupDescr, BackupStatus, CleanupDescr, CleanupOffset, RetentionDescr, RetentionRuleKind,
    WalCleanupMode,
};
use crate::error::{ArchiveError, Result};
use crate::wal::{Lsn, TimeLineId, DEFAULT_WAL_SEGMENT_SIZE};

/* ---------------- interval expressions ---------------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalUnit {
    Years,
    Months,
    Days,
    Hours,
    Minutes,
}

impl IntervalUnit {
    fn as_str(self) -> &'static str {
        match self {
            IntervalUnit::Years => "years",
            IntervalUnit::Months => "months",
            IntervalUnit::Days => "days",
            IntervalUnit::Hours => "hours",
            IntervalUnit::Minutes => "minutes",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "years" => IntervalUnit::Years,
            "months" => IntervalUnit::Months,
            "days" => IntervalUnit::Days,
            "hours" => IntervalUnit::Hours,
            "minutes" => IntervalUnit::Minutes,
            other => {
                return Err(ArchiveError::invalid(
                    "interval",
                    format!("unknown interval unit \"{other}\""),
                ))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalOperand {
    /// False for operands introduced by `-`.
    pub positive: bool,
    pub count: u32,
    pub unit: IntervalUnit,
}

/// A compiled interval expression: an ordered list of additive operands.
///
/// The accepted grammar is
///
/// ```text
/// expr    := operand (('+' | '-') operand)*
/// operand := COUNT UNIT
/// UNIT    := years | months | days | hours | minutes
/// ```
///
/// with whitespace between all tokens and an implicit `+` on the leading
/// operand. Anything else is rejected; the grammar is deliberately strict
/// so the stored canonical form reparses to the identical expression.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalExpr {
    pub operands: Vec<IntervalOperand>,
}

impl IntervalExpr {
    pub fn parse(expression: &str) -> Result<Self> {
        let tokens: Vec<&str> = expression.split_whitespace().collect();
        if tokens.is_empty() {
            return Err(ArchiveError::invalid("interval", "empty expression"));
        }
        let mut operands = Vec::new();
        let mut i = 0;
        let mut positive = true;
        loop {
            if i + 1 >= tokens.len() {
                return Err(ArchiveError::invalid(
                    "interval",
                    format!("incomplete operand at \"{}\"", tokens[i..].join(" ")),
                ));
            }
            let count: u32 = tokens[i].parse().map_err(|_| {
                ArchiveError::invalid("interval", format!("bad operand count \"{}\"", tokens[i]))
            })?;
            let unit = IntervalUnit::parse(tokens[i + 1])?;
            operands.push(IntervalOperand {
                positive,
                count,
                unit,
            });
            i += 2;
            if i == tokens.len() {
                break;
            }
            positive = match tokens[i] {
                "+" => true,
                "-" => false,
                other => {
                    return Err(ArchiveError::invalid(
                        "interval",
                        format!("expected + or - before \"{other}\""),
                    ))
                }
            };
            i += 1;
        }
        Ok(IntervalExpr { operands })
    }

    /// Canonical text form, stored verbatim in the retention-rule value
    /// column. `parse(compile(i)) == i` for every well-formed interval.
    pub fn compile(&self) -> String {
        let mut out = String::new();
        for (i, op) in self.operands.iter().enumerate() {
            if i == 0 {
                if !op.positive {
                    // A leading negative operand cannot be reparsed; it is
                    // not producible by parse() either.
                    out.push_str("0 minutes - ");
                }
            } else if op.positive {
                out.push_str(" + ");
            } else {
                out.push_str(" - ");
            }
            out.push_str(&format!("{} {}", op.count, op.unit.as_str()));
        }
        out
    }

    /// SQLite `datetime('now', …)` expression evaluating to `now - self`,
    /// with one placeholder per operand starting at `?first_param`. The
    /// operand values are returned for separate binding; no user input
    /// enters the statement text.
    pub fn sqlite_datetime_expr(&self, first_param: usize) -> (String, Vec<String>) {
        let mut placeholders = Vec::with_capacity(self.operands.len());
        let mut values = Vec::with_capacity(self.operands.len());
        for (i, op) in self.operands.iter().enumerate() {
            placeholders.push(format!("?{}", first_param + i));
            // Subtracting the interval flips each operand's sign.
            let sign = if op.positive { '-' } else { '+' };
            values.push(format!("{sign}{} {}", op.count, op.unit.as_str()));
        }
        (
            format!("datetime('now', {})", placeholders.join(", ")),
            values,
        )
    }

    /// `now - self`, evaluated with calendar-aware month/year arithmetic.
    pub fn threshold(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut result = now;
        for op in &self.operands {
            // The interval as a whole is subtracted, so positive operands
            // move the threshold into the past.
            let backwards = op.positive;
            result = match op.unit {
                IntervalUnit::Years | IntervalUnit::Months => {
                    let months = match op.unit {
                        IntervalUnit::Years => op.count.saturating_mul(12),
                        _ => op.count,
                    };
                    let months = Months::new(months);
                    if backwards {
                        result.checked_sub_months(months)
                    } else {
                        result.checked_add_months(months)
                    }
                    .unwrap_or(result)
                }
                IntervalUnit::Days | IntervalUnit::Hours | IntervalUnit::Minutes => {
                    let duration = match op.unit {
                        IntervalUnit::Days => Duration::days(op.count as i64),
                        IntervalUnit::Hours => Duration::hours(op.count as i64),
                        _ => Duration::minutes(op.count as i64),
                    };
                    if backwards {
                        result - duration
                    } else {
                        result + duration
                    }
                }
            };
        }
        result
    }
}

/// Parse one textual retention rule, e.g. `keep num 3`, `drop label foo`,
/// `drop older 3 days + 12 hours`, `pin newest`, `cleanup`. Interval values
/// are compiled to their canonical form before storage.
pub fn parse_rule(input: &str) -> Result<crate::catalog::descr::RetentionRuleDescr> {
    use crate::catalog::descr::RetentionRuleDescr;

    let mut tokens = input.split_whitespace();
    let action = tokens
        .next()
        .ok_or_else(|| ArchiveError::invalid("retention rule", "empty rule"))?;
    let rest = tokens.collect::<Vec<_>>().join(" ");

    let (kind, value) = match action {
        "cleanup" => {
            if !rest.is_empty() {
                return Err(ArchiveError::invalid("retention rule", "cleanup takes no value"));
            }
            (RetentionRuleKind::Cleanup, String::new())
        }
        "pin" => (RetentionRuleKind::Pin, rest),
        "unpin" => (RetentionRuleKind::Unpin, rest),
        "keep" | "drop" => {
            let keep = action == "keep";
            let mut parts = rest.splitn(2, ' ');
            let modifier = parts.next().unwrap_or_default();
            let value = parts.next().unwrap_or_default().to_string();
            if value.is_empty() {
                return Err(ArchiveError::invalid(
                    "retention rule",
                    format!("missing value after \"{action} {modifier}\""),
                ));
            }
            match modifier {
                "label" => (
                    if keep {
                        RetentionRuleKind::KeepWithLabel
                    } else {
                        RetentionRuleKind::DropWithLabel
                    },
                    value,
                ),
                "num" => {
                    value.parse::<u32>().map_err(|_| {
                        ArchiveError::invalid("retention rule", format!("bad count \"{value}\""))
                    })?;
                    (
                        if keep {
                            RetentionRuleKind::KeepNum
                        } else {
                            RetentionRuleKind::DropNum
                        },
                        value,
                    )
                }
                "newer" | "older" => {
                    let compiled = IntervalExpr::parse(&value)?.compile();
                    let kind = match (keep, modifier) {
                        (true, "newer") => RetentionRuleKind::KeepNewerByDatetime,
                        (true, _) => RetentionRuleKind::KeepOlderByDatetime,
                        (false, "newer") => RetentionRuleKind::DropNewerByDatetime,
                        (false, _) => RetentionRuleKind::DropOlderByDatetime,
                    };
                    (kind, compiled)
                }
                other => {
                    return Err(ArchiveError::invalid(
                        "retention rule",
                        format!("unknown modifier \"{other}\""),
                    ))
                }
            }
        }
        other => {
            return Err(ArchiveError::invalid(
                "retention rule",
                format!("unknown action \"{other}\""),
            ))
        }
    };

    Ok(RetentionRuleDescr { id: -1, kind, value })
}

/* ---------------- policy evaluation ---------------- */

/// Pin/unpin actions a policy requested; `true` pins.
pub type PinActions = Vec<(i64, bool)>;

/// Everything an APPLY RETENTION POLICY run needs to execute.
#[derive(Debug, Clone)]
pub struct RetentionPlan {
    pub cleanup: CleanupDescr,
    pub pins: PinActions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Keep,
    Delete,
}

struct Evaluation<'a> {
    backups: Vec<&'a BaseBackupDescr>,
    marks: HashMap<i64, Mark>,
    pins: PinActions,
    now: DateTime<Utc>,
}

impl<'a> Evaluation<'a> {
    /// First mark wins. Pinned and running backups cannot be marked for
    /// deletion at all.
    fn mark(&mut self, id: i64, mark: Mark) {
        if self.marks.contains_key(&id) {
            return;
        }
        self.marks.insert(id, mark);
    }

    fn eligible(&self, backup: &BaseBackupDescr) -> bool {
        backup.status == BackupStatus::Ready && backup.pinned == 0
    }

    fn apply_label_rule(&mut self, label: &str, mark: Mark) {
        let ids: Vec<i64> = self
            .backups
            .iter()
            .filter(|b| b.label == label)
            .map(|b| b.id)
            .collect();
        for id in ids {
            self.mark(id, mark);
        }
    }

    /// Count rules operate on ready backups, sorted by `started` with id as
    /// the ascending tie-break. `youngest` selects from the new end.
    fn apply_num_rule(&mut self, count: usize, youngest: bool, mark: Mark) {
        let mut ready: Vec<&BaseBackupDescr> = self
            .backups
            .iter()
            .copied()
            .filter(|b| b.status == BackupStatus::Ready)
            .collect();
        // self.backups is newest first already; flip for oldest-first rules.
        if !youngest {
            ready.reverse();
        }
        let ids: Vec<i64> = ready.iter().take(count).map(|b| b.id).collect();
        for id in ids {
            self.mark(id, mark);
        }
    }

    fn apply_datetime_rule(&mut self, interval: &IntervalExpr, older: bool, mark: Mark) {
        let threshold = interval.threshold(self.now);
        let ids: Vec<i64> = self
            .backups
            .iter()
            .filter(|b| match b.started {
                Some(started) => {
                    if older {
                        started < threshold
                    } else {
                        started >= threshold
                    }
                }
                None => false,
            })
            .map(|b| b.id)
            .collect();
        for id in ids {
            self.mark(id, mark);
        }
    }

    fn apply_pin_rule(&mut self, value: &str, pin: bool) -> Result<()> {
        let ready: Vec<&BaseBackupDescr> = self
            .backups
            .iter()
            .copied()
            .filter(|b| b.status == BackupStatus::Ready)
            .collect();
        let target = match value {
            "newest" => ready.first().map(|b| b.id),
            "oldest" => ready.last().map(|b| b.id),
            id => Some(id.parse::<i64>().map_err(|_| {
                ArchiveError::invalid("retention rule", format!("bad pin target \"{id}\""))
            })?),
        };
        if let Some(id) = target {
            self.pins.push((id, pin));
        }
        Ok(())
    }
}

/// Evaluate a policy over an archive's inventory. The inventory does not
/// need to be pre-sorted. `now` is injected so evaluation is deterministic.
pub fn evaluate(
    policy: &RetentionDescr,
    inventory: &[BaseBackupDescr],
    now: DateTime<Utc>,
) -> Result<RetentionPlan> {
    let mut backups: Vec<&BaseBackupDescr> = inventory.iter().collect();
    backups.sort_by(|a, b| b.started.cmp(&a.started).then(b.id.cmp(&a.id)));

    let mut eval = Evaluation {
        backups,
        marks: HashMap::new(),
        pins: Vec::new(),
        now,
    };

    for rule in &policy.rules {
        match rule.kind {
            RetentionRuleKind::KeepWithLabel => eval.apply_label_rule(&rule.value, Mark::Keep),
            RetentionRuleKind::DropWithLabel => eval.apply_label_rule(&rule.value, Mark::Delete),
            RetentionRuleKind::KeepNum | RetentionRuleKind::DropNum => {
                let count: usize = rule.value.parse().map_err(|_| {
                    ArchiveError::invalid(
                        "retention rule",
                        format!("bad backup count \"{}\"", rule.value),
                    )
                })?;
                let keep = rule.kind == RetentionRuleKind::KeepNum;
                let mark = if keep { Mark::Keep } else { Mark::Delete };
                eval.apply_num_rule(count, keep, mark);
            }
            RetentionRuleKind::KeepNewerByDatetime
            | RetentionRuleKind::KeepOlderByDatetime
            | RetentionRuleKind::DropNewerByDatetime
            | RetentionRuleKind::DropOlderByDatetime => {
                let interval = IntervalExpr::parse(&rule.value)?;
                let older = matches!(
                    rule.kind,
                    RetentionRuleKind::KeepOlderByDatetime | RetentionRuleKind::DropOlderByDatetime
                );
                let mark = if matches!(
                    rule.kind,
                    RetentionRuleKind::KeepNewerByDatetime | RetentionRuleKind::KeepOlderByDatetime
                ) {
                    Mark::Keep
                } else {
                    Mark::Delete
                };
                eval.apply_datetime_rule(&interval, older, mark);
            }
            RetentionRuleKind::Pin => eval.apply_pin_rule(&rule.value, true)?,
            RetentionRuleKind::Unpin => eval.apply_pin_rule(&rule.value, false)?,
            // WAL cleanup deduction runs after all backup decisions; the
            // rule itself carries no parameters.
            RetentionRuleKind::Cleanup => {}
        }
    }

    // Resolve the final keep/delete set. A delete mark only sticks on
    // eligible backups: pinned or running ones are always kept.
    let mut tagged: Vec<(BaseBackupDescr, bool)> = Vec::with_capacity(eval.backups.len());
    for backup in &eval.backups {
        let keep = match eval.marks.get(&backup.id) {
            Some(Mark::Delete) if eval.eligible(backup) => false,
            _ => true,
        };
        tagged.push(((*backup).clone(), keep));
    }

    let (mode, offsets) = deduce_wal_cleanup(&tagged);

    Ok(RetentionPlan {
        cleanup: CleanupDescr {
            basebackups: tagged,
            mode,
            offsets,
        },
        pins: eval.pins,
    })
}

/// WAL ranges released by a keep/delete decision, per timeline. The lower
/// boundary of what must stay is the oldest retained backup's start
/// position; everything below its segment is releasable.
fn deduce_wal_cleanup(
    tagged: &[(BaseBackupDescr, bool)],
) -> (WalCleanupMode, Vec<CleanupOffset>) {
    let deleted: Vec<&BaseBackupDescr> = tagged
        .iter()
        .filter(|(_, keep)| !keep)
        .map(|(b, _)| b)
        .collect();
    if deleted.is_empty() {
        return (WalCleanupMode::None, Vec::new());
    }
    let survivors: Vec<&BaseBackupDescr> = tagged
        .iter()
        .filter(|(_, keep)| *keep)
        .map(|(b, _)| b)
        .collect();
    if survivors.is_empty() {
        return (WalCleanupMode::All, Vec::new());
    }

    // Oldest retained start position per timeline bounds the deletable
    // range from above; the oldest deleted position bounds it from below.
    let mut upper: HashMap<TimeLineId, (Lsn, u64)> = HashMap::new();
    for backup in &survivors {
        if !backup.xlogpos.is_valid() {
            continue;
        }
        let entry = upper
            .entry(backup.timeline)
            .or_insert((backup.xlogpos, backup.wal_segment_size));
        if backup.xlogpos < entry.0 {
            *entry = (backup.xlogpos, backup.wal_segment_size);
        }
    }

    let mut lower: HashMap<TimeLineId, Lsn> = HashMap::new();
    for backup in &deleted {
        if !backup.xlogpos.is_valid() {
            continue;
        }
        let entry = lower.entry(backup.timeline).or_insert(backup.xlogpos);
        if backup.xlogpos < *entry {
            *entry = backup.xlogpos;
        }
    }

    let mut offsets: Vec<CleanupOffset> = Vec::new();
    let mut any_range = false;
    for (timeline, (upper_pos, seg_size)) in &upper {
        let seg_size = if *seg_size > 0 {
            *seg_size
        } else {
            DEFAULT_WAL_SEGMENT_SIZE
        };
        let end = upper_pos.segment_start(seg_size);
        let start = match lower.get(timeline) {
            Some(pos) => {
                any_range = true;
                pos.segment_start(seg_size)
            }
            // No deletion on this timeline: everything below the retained
            // boundary is releasable.
            None => Lsn::INVALID,
        };
        if end > start {
            offsets.push(CleanupOffset {
                timeline: *timeline,
                wal_segment_size: seg_size,
                start,
                end,
            });
        }
    }
    offsets.sort_by_key(|off| off.timeline);

    let mode = if offsets.is_empty() {
        WalCleanupMode::None
    } else if any_range {
        WalCleanupMode::Range
    } else {
        WalCleanupMode::Offset
    };
    (mode, offsets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::descr::RetentionRuleDescr;
    use chrono::TimeZone;

    #[test]
    fn rule_texts_compile() {
        let rule = parse_rule("keep num 3").unwrap();
        assert_eq!(rule.kind, RetentionRuleKind::KeepNum);
        assert_eq!(rule.value, "3");

        let rule = parse_rule("drop older 3 days + 12 hours").unwrap();
        assert_eq!(rule.kind, RetentionRuleKind::DropOlderByDatetime);
        assert_eq!(rule.value, "3 days + 12 hours");

        let rule = parse_rule("keep label nightly").unwrap();
        assert_eq!(rule.kind, RetentionRuleKind::KeepWithLabel);
        assert_eq!(rule.value, "nightly");

        assert_eq!(parse_rule("cleanup").unwrap().kind, RetentionRuleKind::Cleanup);
        assert_eq!(parse_rule("pin newest").unwrap().kind, RetentionRuleKind::Pin);

        for bad in [
            "",
            "keep",
            "keep num",
            "keep num many",
            "drop sideways 3 days",
            "shred label x",
            "cleanup now",
            "drop older 3 fortnights",
        ] {
            assert!(parse_rule(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn interval_round_trip() {
        for expr in [
            "3 days",
            "1 years + 6 months",
            "2 days - 12 hours",
            "1 months + 2 days - 30 minutes",
        ] {
            let parsed = IntervalExpr::parse(expr).unwrap();
            assert_eq!(parsed.compile(), expr);
            assert_eq!(IntervalExpr::parse(&parsed.compile()).unwrap(), parsed);
        }
    }

    #[test]
    fn interval_rejects_malformed_input() {
        for expr in [
            "",
            "days",
            "3",
            "3 fortnights",
            "3 days +",
            "3 days 2 hours",
            "three days",
            "3 days * 2 hours",
        ] {
            assert!(IntervalExpr::parse(expr).is_err(), "accepted {expr:?}");
        }
    }

    #[test]
    fn interval_sqlite_form_binds_operands_separately() {
        let interval = IntervalExpr::parse("3 days - 12 hours").unwrap();
        let (expr, operands) = interval.sqlite_datetime_expr(2);
        assert_eq!(expr, "datetime('now', ?2, ?3)");
        assert_eq!(operands, vec!["-3 days".to_string(), "+12 hours".to_string()]);
    }

    #[test]
    fn interval_threshold_arithmetic() {
        let now = Utc.with_ymd_and_hms(2024, 3, 31, 12, 0, 0).unwrap();
        let interval = IntervalExpr::parse("1 months").unwrap();
        // calendar-aware: 2024-03-31 minus one month clamps to Feb 29
        assert_eq!(
            interval.threshold(now),
            Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap()
        );
        let interval = IntervalExpr::parse("2 days - 12 hours").unwrap();
        assert_eq!(
            interval.threshold(now),
            Utc.with_ymd_and_hms(2024, 3, 30, 0, 0, 0).unwrap()
        );
    }

    fn backup(id: i64, age_days: i64, now: DateTime<Utc>) -> BaseBackupDescr {
        BaseBackupDescr {
            id,
            archive_id: 1,
            status: BackupStatus::Ready,
            started: Some(now - Duration::days(age_days)),
            xlogpos: Lsn((id as u64) * 0x100_0000),
            timeline: 1,
            wal_segment_size: DEFAULT_WAL_SEGMENT_SIZE,
            label: format!("backup-{id}"),
            ..Default::default()
        }
    }

    fn policy(rules: Vec<(RetentionRuleKind, &str)>) -> RetentionDescr {
        RetentionDescr {
            id: 1,
            name: "test".into(),
            created: None,
            rules: rules
                .into_iter()
                .map(|(kind, value)| RetentionRuleDescr {
                    id: 0,
                    kind,
                    value: value.into(),
                })
                .collect(),
        }
    }

    fn kept_ids(plan: &RetentionPlan) -> Vec<i64> {
        plan.cleanup
            .basebackups
            .iter()
            .filter(|(_, keep)| *keep)
            .map(|(b, _)| b.id)
            .collect()
    }

    fn deleted_ids(plan: &RetentionPlan) -> Vec<i64> {
        plan.cleanup
            .basebackups
            .iter()
            .filter(|(_, keep)| !*keep)
            .map(|(b, _)| b.id)
            .collect()
    }

    #[test]
    fn keep_num_wins_over_drop_older() {
        let now = Utc::now();
        // ids 5..1 aged 1..5 days; id 5 is the newest.
        let inventory: Vec<_> = (1..=5).map(|i| backup(i, 6 - i, now)).collect();
        let policy = policy(vec![
            (RetentionRuleKind::KeepNum, "2"),
            (RetentionRuleKind::DropOlderByDatetime, "3 days"),
        ]);

        let plan = evaluate(&policy, &inventory, now).unwrap();
        // newest two kept by keep_num; the 3-day-old one is not older than
        // 3 days and stays; the 4- and 5-day-old ones go.
        assert_eq!(kept_ids(&plan), vec![5, 4, 3]);
        assert_eq!(deleted_ids(&plan), vec![2, 1]);

        assert_eq!(plan.cleanup.mode, WalCleanupMode::Range);
        let off = &plan.cleanup.offsets[0];
        assert_eq!(off.timeline, 1);
        // boundary sits at the oldest retained backup's start position
        assert_eq!(off.end, Lsn(3 * 0x100_0000));
        assert_eq!(off.start, Lsn(0x100_0000));
    }

    #[test]
    fn pinned_backup_survives_any_rule_sequence() {
        let now = Utc::now();
        let mut inventory: Vec<_> = (1..=5).map(|i| backup(i, 6 - i, now)).collect();
        inventory[2].pinned = 1; // id 3

        let policy = policy(vec![
            (RetentionRuleKind::DropWithLabel, "backup-3"),
            (RetentionRuleKind::DropNum, "5"),
            (RetentionRuleKind::DropOlderByDatetime, "0 minutes"),
        ]);
        let plan = evaluate(&policy, &inventory, now).unwrap();
        assert!(kept_ids(&plan).contains(&3));
        assert!(!deleted_ids(&plan).contains(&3));
    }

    #[test]
    fn keep_is_sticky_against_later_drops() {
        let now = Utc::now();
        let inventory: Vec<_> = (1..=4).map(|i| backup(i, i, now)).collect();
        let policy = policy(vec![
            (RetentionRuleKind::KeepWithLabel, "backup-2"),
            (RetentionRuleKind::DropNum, "4"),
        ]);
        let plan = evaluate(&policy, &inventory, now).unwrap();
        assert!(kept_ids(&plan).contains(&2));
        // newest first: id 1 is the youngest backup
        assert_eq!(deleted_ids(&plan), vec![1, 3, 4]);
    }

    #[test]
    fn in_progress_backups_are_never_evicted() {
        let now = Utc::now();
        let mut inventory: Vec<_> = (1..=3).map(|i| backup(i, i, now)).collect();
        inventory[1].status = BackupStatus::InProgress;
        let policy = policy(vec![(RetentionRuleKind::DropNum, "3")]);
        let plan = evaluate(&policy, &inventory, now).unwrap();
        assert!(kept_ids(&plan).contains(&2));
    }

    #[test]
    fn dropping_everything_releases_all_wal() {
        let now = Utc::now();
        let inventory: Vec<_> = (1..=3).map(|i| backup(i, i, now)).collect();
        let policy = policy(vec![(RetentionRuleKind::DropNum, "3")]);
        let plan = evaluate(&policy, &inventory, now).unwrap();
        assert!(kept_ids(&plan).is_empty());
        assert_eq!(plan.cleanup.mode, WalCleanupMode::All);
    }

    #[test]
    fn empty_policy_is_a_noop() {
        let now = Utc::now();
        let inventory: Vec<_> = (1..=3).map(|i| backup(i, i, now)).collect();
        let plan = evaluate(&policy(vec![]), &inventory, now).unwrap();
        assert_eq!(deleted_ids(&plan), Vec::<i64>::new());
        assert_eq!(plan.cleanup.mode, WalCleanupMode::None);
        assert!(plan.cleanup.offsets.is_empty());
    }

    #[test]
    fn newest_first_ordering_in_plan() {
        let now = Utc::now();
        let inventory: Vec<_> = vec![backup(1, 5, now), backup(3, 1, now), backup(2, 3, now)];
        let plan = evaluate(&policy(vec![]), &inventory, now).unwrap();
        let ids: Vec<i64> = plan.cleanup.basebackups.iter().map(|(b, _)| b.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn pin_rules_report_actions_without_evicting() {
        let now = Utc::now();
        let inventory: Vec<_> = (1..=3).map(|i| backup(i, i, now)).collect();
        let policy = policy(vec![
            (RetentionRuleKind::Pin, "newest"),
            (RetentionRuleKind::Unpin, "oldest"),
        ]);
        let plan = evaluate(&policy, &inventory, now).unwrap();
        // id 1 carries the smallest age and is therefore the newest
        assert_eq!(plan.pins, vec![(1, true), (3, false)]);
        assert!(deleted_ids(&plan).is_empty());
    }
}
