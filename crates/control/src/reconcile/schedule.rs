use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use common::Payload;
use serde_json::json;
use tracing::{debug, info};

use super::Reconciler;
use crate::audit::detail;
use crate::inventory::{DiskState, InstanceStatus, Schedule, ScheduleAction};

/// Parse a crontab expression. Five-field expressions get a leading seconds
/// field of zero; six and seven field forms are taken as they are.
pub fn parse_cron(expr: &str) -> Result<cron::Schedule, cron::error::Error> {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        cron::Schedule::from_str(&format!("0 {expr}"))
    } else {
        cron::Schedule::from_str(expr)
    }
}

/// Latest fire time in `(last, now]`, evaluated in `tz`. A schedule never
/// queued looks back one year. The search window widens backwards from `now`
/// so dense expressions do not walk the whole lookback.
pub fn due_fire(
    schedule: &cron::Schedule,
    tz: Tz,
    last: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let since = last.unwrap_or(now - Duration::days(366));
    if since >= now {
        return None;
    }
    let mut window = Duration::minutes(1);
    loop {
        let from = std::cmp::max(since, now - window);
        let latest = schedule
            .after(&from.with_timezone(&tz))
            .map(|fire| fire.with_timezone(&Utc))
            .take_while(|fire| *fire <= now)
            .last();
        if latest.is_some() || from == since {
            return latest;
        }
        window = window * 2;
    }
}

#[derive(Debug, Default)]
pub struct ScheduleReport {
    pub fired: Vec<String>,
    pub vetoed: Vec<String>,
    pub errors: usize,
}

impl fmt::Display for ScheduleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fired={} vetoed={} errors={}", self.fired.len(), self.vetoed.len(), self.errors)
    }
}

impl Reconciler {
    pub async fn run_schedules(&self, now: DateTime<Utc>) -> ScheduleReport {
        let schedules: Vec<Schedule> = self
            .inventory
            .read(|s| s.schedules.values().filter(|sc| sc.enabled).cloned().collect())
            .await;

        let mut report = ScheduleReport::default();
        for schedule in schedules {
            let cron = match parse_cron(&schedule.cron) {
                Ok(c) => c,
                Err(e) => {
                    report.errors += 1;
                    self.item_failed("schedules", &schedule.id, &format!("invalid cron '{}': {e}", schedule.cron)).await;
                    continue;
                }
            };
            let tz = match schedule.timezone.parse::<Tz>() {
                Ok(tz) => tz,
                Err(e) => {
                    report.errors += 1;
                    self.item_failed("schedules", &schedule.id, &format!("invalid timezone: {e}")).await;
                    continue;
                }
            };
            let Some(fire) = due_fire(&cron, tz, schedule.last_queued_at, now) else { continue };

            match self.fire(&schedule, fire, now).await {
                Ok(Some(job_id)) => report.fired.push(job_id),
                Ok(None) => report.vetoed.push(schedule.id.clone()),
                Err(e) => {
                    report.errors += 1;
                    self.item_failed("schedules", &schedule.id, &e).await;
                }
            }
        }
        info!(%report, "schedule pass");
        report
    }

    /// Dispatch the schedule's action. None when the instance is held.
    async fn fire(&self, schedule: &Schedule, fire: DateTime<Utc>, now: DateTime<Utc>) -> anyhow::Result<Option<String>> {
        let target = self
            .inventory
            .read(|s| {
                s.instances
                    .get(&schedule.instance_id)
                    .map(|i| (i.node_id.clone(), i.status, i.disk_state))
            })
            .await;
        let Some((agent_id, status, disk_state)) = target else {
            anyhow::bail!("instance {} not found", schedule.instance_id);
        };
        let held = disk_state == DiskState::Blocked || status == InstanceStatus::Suspended;
        if held && schedule.action != ScheduleAction::Stop {
            debug!(schedule_id=%schedule.id, instance_id=%schedule.instance_id, "schedule vetoed, instance held");
            return Ok(None);
        }

        let mut payload = Payload::new();
        payload.insert("instance_id".into(), json!(schedule.instance_id));
        payload.insert("schedule_id".into(), json!(schedule.id));
        payload.insert("scheduled_for".into(), json!(fire.to_rfc3339()));
        if schedule.action == ScheduleAction::Backup {
            payload.insert("backup_id".into(), json!(format!("{}-{}", schedule.id, fire.timestamp())));
        }
        let dispatched = self
            .dispatcher
            .submit(&agent_id, schedule.action.job_type(), payload, now)
            .await?;

        let id = schedule.id.clone();
        self.inventory
            .mutate(|s| {
                if let Some(sc) = s.schedules.get_mut(&id) {
                    sc.last_queued_at = Some(now);
                }
            })
            .await?;
        if dispatched.created {
            self.audit
                .record(
                    "schedule.fired",
                    detail([
                        ("schedule_id", json!(schedule.id)),
                        ("instance_id", json!(schedule.instance_id)),
                        ("action", json!(schedule.action.job_type())),
                        ("scheduled_for", json!(fire.to_rfc3339())),
                        ("job_id", json!(dispatched.job.id)),
                    ]),
                    now,
                )
                .await?;
        }
        info!(schedule_id=%schedule.id, job_id=%dispatched.job.id, fire=%fire, "schedule fired");
        Ok(Some(dispatched.job.id))
    }
}
