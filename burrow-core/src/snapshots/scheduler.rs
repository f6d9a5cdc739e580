//! Scheduled snapshot creation and expiry.
//!
//! The daemon calls [`tick`] once per minute. A tick first prunes expired
//! snapshots (reclaiming space before new snapshots consume it), then
//! creates snapshots for volumes whose `snapshots.schedule` matches the
//! current minute. Volumes on remote-driver pools belong to no single
//! member, so each entry elects a stable random online member to do the
//! work; every member computes the same election without coordination.

use super::SnapshotService;
use crate::catalog::VolumeRef;
use crate::cluster::{stable_random_member, NODE_ID_REMOTE};
use crate::error::{Error, Result};
use crate::ops::{OpContext, Operation, OperationClass};
use crate::project;
use crate::types::volume;
use chrono::{DateTime, Datelike, Timelike, Utc};
use std::collections::HashMap;
use tracing::{debug, error, info, instrument};

/// Work done by one tick, for observability and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub pruned: usize,
    pub created: usize,
}

/// Run one scheduler tick at `now`.
#[instrument(skip(service, ctx))]
pub async fn tick(
    service: &SnapshotService,
    now: DateTime<Utc>,
    ctx: &mut OpContext,
) -> Result<TickReport> {
    let server = service.server();

    // Collect the candidates in one pass over the catalog.
    let all_expired = server.catalog.expired_snapshots(now).await?;
    let all_volumes = server.catalog.custom_volumes_all().await?;

    let projects: HashMap<String, project::Project> =
        server.catalog.projects().await?.into_iter().map(|p| (p.name.clone(), p)).collect();

    let minute_start = now
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);

    let mut scheduled = Vec::new();
    for entry in all_volumes {
        let Some(project_record) = projects.get(&entry.volume.project) else {
            continue;
        };

        if project::allow_snapshot_creation(project_record).is_err() {
            continue;
        }

        let schedule = entry.volume.config.get("snapshots.schedule").cloned().unwrap_or_default();
        if schedule.is_empty() || !schedule_matches(&schedule, now) {
            continue;
        }

        // A live snapshot taken this minute means this tick already ran;
        // snapshots about to be pruned don't count.
        let snapshots = server
            .catalog
            .snapshots_of(
                entry.volume.pool_id,
                &entry.volume.project,
                entry.volume.volume_type,
                &entry.volume.name,
            )
            .await?;
        if snapshots
            .iter()
            .any(|s| s.created_at >= minute_start && s.expiry_at.map_or(true, |e| e > now))
        {
            continue;
        }

        scheduled.push(entry);
    }

    // Split both lists into member-bound and remote entries.
    let (expired, expired_remote): (Vec<_>, Vec<_>) =
        all_expired.into_iter().partition(|e| e.volume.node_id != NODE_ID_REMOTE);
    let (mut to_create, remote_create): (Vec<_>, Vec<_>) =
        scheduled.into_iter().partition(|e| e.volume.node_id != NODE_ID_REMOTE);

    let mut to_prune: Vec<_> =
        expired.into_iter().filter(|e| e.volume.node_id == server.cluster.member_id).collect();
    to_create.retain(|e| e.volume.node_id == server.cluster.member_id);

    if !expired_remote.is_empty() || !remote_create.is_empty() {
        let members = server.catalog.members().await?;
        let member_count = members.len();
        let online: Vec<i64> = members
            .iter()
            .filter(|m| !m.is_offline(server.cluster.offline_threshold, now))
            .map(|m| m.id)
            .collect();

        if member_count > 1 && online.is_empty() {
            // A partitioned cluster must not expire or snapshot remote
            // volumes from several members at once.
            error!("Skipping remote volumes for snapshot task: no online members");
        } else {
            for entry in expired_remote {
                if member_count > 1 {
                    match stable_random_member(entry.volume.id, &online) {
                        Ok(chosen) if chosen == server.cluster.member_id => {}
                        Ok(_) => continue,
                        Err(e) => {
                            error!(volume = %entry.volume.name, error = %e, "Failed electing member for snapshot expiry");
                            continue;
                        }
                    }
                }
                to_prune.push(entry);
            }

            for entry in remote_create {
                if member_count > 1 {
                    match stable_random_member(entry.volume.id, &online) {
                        Ok(chosen) if chosen == server.cluster.member_id => {}
                        Ok(_) => continue,
                        Err(e) => {
                            error!(volume = %entry.volume.name, error = %e, "Failed electing member for scheduled snapshot");
                            continue;
                        }
                    }
                }
                to_create.push(entry);
            }
        }
    }

    let mut report = TickReport::default();

    // Expiry first: reclaim space before creating new snapshots.
    if !to_prune.is_empty() {
        info!(count = to_prune.len(), "Pruning expired custom volume snapshots");
        report.pruned = run_prune_operation(service, to_prune, ctx).await?;
    }

    if !to_create.is_empty() {
        info!(count = to_create.len(), "Creating scheduled volume snapshots");
        report.created = run_create_operation(service, to_create, ctx).await?;
    }

    Ok(report)
}

async fn run_prune_operation(
    service: &SnapshotService,
    entries: Vec<VolumeRef>,
    ctx: &mut OpContext,
) -> Result<usize> {
    let count = entries.len();
    let inner = service.clone();

    let op = Operation::create(
        &service.server().operations,
        project::DEFAULT_PROJECT,
        OperationClass::Task,
        "custom_volume_snapshots_expire",
        HashMap::new(),
        HashMap::new(),
        Box::new(move |op| {
            Box::pin(async move {
                let op_ctx = op.context();

                for entry in entries {
                    op_ctx.check()?;

                    // Another task may already be deleting this snapshot.
                    if !inner.claim_prune(entry.volume.id) {
                        debug!(snapshot = %entry.volume.name, "Prune already running, skipping");
                        continue;
                    }

                    let (parent, snap, _) = volume::split_snapshot_name(&entry.volume.name);
                    let result = inner
                        .delete_in_project(&entry.pool_name, &entry.volume.project, parent, snap)
                        .await;
                    inner.release_prune(entry.volume.id);

                    result.map_err(|e| {
                        Error::Internal(format!(
                            "Error deleting custom volume snapshot {:?} (project {:?}, pool {:?}): {}",
                            entry.volume.name, entry.volume.project, entry.pool_name, e
                        ))
                    })?;
                }

                Ok(())
            })
        }),
        None,
        None,
    );

    op.start()?;
    op.wait_with_cancel(ctx).await?;
    Ok(count)
}

async fn run_create_operation(
    service: &SnapshotService,
    entries: Vec<VolumeRef>,
    ctx: &mut OpContext,
) -> Result<usize> {
    let count = entries.len();
    let inner = service.clone();

    let op = Operation::create(
        &service.server().operations,
        project::DEFAULT_PROJECT,
        OperationClass::Task,
        "volume_snapshot_create",
        HashMap::new(),
        HashMap::new(),
        Box::new(move |op| {
            Box::pin(async move {
                let op_ctx = op.context();

                // Snapshots are made sequentially; stop on cancellation.
                for entry in entries {
                    op_ctx.check()?;

                    let name = inner
                        .next_snapshot_name(entry.volume.pool_id, &entry.volume)
                        .await
                        .map_err(|e| {
                            Error::Internal(format!(
                                "Error determining next snapshot name for volume {:?}: {}",
                                entry.volume.name, e
                            ))
                        })?;

                    let expiry_spec =
                        entry.volume.config.get("snapshots.expiry").cloned().unwrap_or_default();
                    let expiry = project::expiry_from(Utc::now(), &expiry_spec)?;

                    inner
                        .create_now(
                            &entry.pool_name,
                            &entry.volume.project,
                            &entry.volume.name,
                            &name,
                            expiry,
                        )
                        .await
                        .map_err(|e| {
                            Error::Internal(format!(
                                "Error creating snapshot for volume {:?} (project {:?}, pool {:?}): {}",
                                entry.volume.name, entry.volume.project, entry.pool_name, e
                            ))
                        })?;
                }

                Ok(())
            })
        }),
        None,
        None,
    );

    op.start()?;
    op.wait_with_cancel(ctx).await?;
    Ok(count)
}

/// Whether a cron-style schedule matches the given minute.
///
/// Five fields (`minute hour day-of-month month day-of-week`) with `*`,
/// `*/n`, single values, ranges and comma lists, plus the `@hourly` and
/// `@daily` aliases.
#[must_use]
pub fn schedule_matches(schedule: &str, at: DateTime<Utc>) -> bool {
    let schedule = match schedule.trim() {
        "@hourly" => "0 * * * *",
        "@daily" | "@midnight" => "0 0 * * *",
        "@weekly" => "0 0 * * 0",
        other => other,
    };

    let fields: Vec<&str> = schedule.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }

    let values = [
        at.minute(),
        at.hour(),
        at.day(),
        at.month(),
        at.weekday().num_days_from_sunday(),
    ];

    fields.iter().zip(values).all(|(field, value)| cron_field_matches(field, value))
}

fn cron_field_matches(field: &str, value: u32) -> bool {
    field.split(',').any(|part| {
        if part == "*" {
            return true;
        }

        if let Some(step) = part.strip_prefix("*/") {
            return match step.parse::<u32>() {
                Ok(step) if step > 0 => value % step == 0,
                _ => false,
            };
        }

        if let Some((lo, hi)) = part.split_once('-') {
            return match (lo.parse::<u32>(), hi.parse::<u32>()) {
                (Ok(lo), Ok(hi)) => value >= lo && value <= hi,
                _ => false,
            };
        }

        part.parse::<u32>().map(|v| v == value).unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_schedule_matches() {
        let at = Utc.with_ymd_and_hms(2025, 6, 15, 14, 30, 0).unwrap();

        assert!(schedule_matches("* * * * *", at));
        assert!(schedule_matches("30 14 * * *", at));
        assert!(schedule_matches("*/15 * * * *", at));
        assert!(schedule_matches("0,30 * * * *", at));
        assert!(schedule_matches("25-35 14 * * *", at));
        assert!(!schedule_matches("31 * * * *", at));
        assert!(!schedule_matches("30 15 * * *", at));
        assert!(!schedule_matches("not a schedule", at));
        assert!(!schedule_matches("* * * *", at));
    }

    #[test]
    fn test_schedule_aliases() {
        let top_of_hour = Utc.with_ymd_and_hms(2025, 6, 15, 14, 0, 0).unwrap();
        let midnight = Utc.with_ymd_and_hms(2025, 6, 15, 0, 0, 0).unwrap();

        assert!(schedule_matches("@hourly", top_of_hour));
        assert!(!schedule_matches("@hourly", top_of_hour.with_minute(1).unwrap()));
        assert!(schedule_matches("@daily", midnight));
        assert!(!schedule_matches("@daily", top_of_hour));
    }
}
