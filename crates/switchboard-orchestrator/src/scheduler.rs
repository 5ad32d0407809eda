use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use switchboard_core::{ScheduledJob, SwitchboardError, SwitchboardResult, TaskRequest};

/// Cron-based scheduler over a collection of [`ScheduledJob`]s.
///
/// The scheduler does not run on its own; the orchestrator asks it which
/// jobs came due since the previous cycle and submits their tasks.
#[derive(Debug)]
pub struct Scheduler {
    jobs: Vec<(ScheduledJob, Schedule)>,
    last_tick: DateTime<Utc>,
}

impl Scheduler {
    /// Parses every job's expression. Jobs are due from now on.
    pub fn new(jobs: Vec<ScheduledJob>) -> SwitchboardResult<Self> {
        Self::starting_at(jobs, Utc::now())
    }

    /// Like [`new`](Self::new) with an explicit starting point.
    pub fn starting_at(jobs: Vec<ScheduledJob>, start: DateTime<Utc>) -> SwitchboardResult<Self> {
        let jobs = jobs
            .into_iter()
            .map(|job| {
                let schedule = Self::parse_cron(&job.cron_expression)?;
                Ok((job, schedule))
            })
            .collect::<SwitchboardResult<Vec<_>>>()?;
        Ok(Self {
            jobs,
            last_tick: start,
        })
    }

    /// Parse a cron expression string into a [`cron::Schedule`].
    ///
    /// Uses the 7-field cron format: sec min hour day-of-month month day-of-week year.
    pub fn parse_cron(cron_expr: &str) -> SwitchboardResult<Schedule> {
        Schedule::from_str(cron_expr).map_err(|e| {
            SwitchboardError::Config(format!("Invalid cron expression '{cron_expr}': {e}"))
        })
    }

    /// Return references to only the enabled jobs.
    pub fn enabled_jobs(&self) -> Vec<&ScheduledJob> {
        self.jobs
            .iter()
            .filter(|(job, _)| job.enabled)
            .map(|(job, _)| job)
            .collect()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// The nearest upcoming fire time among enabled jobs.
    pub fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.jobs
            .iter()
            .filter(|(job, _)| job.enabled)
            .filter_map(|(_, schedule)| schedule.after(&self.last_tick).next())
            .min()
    }

    /// Enabled jobs with a fire time in `(last tick, now]`, as task
    /// submissions, and moves the tick to `now`. A job that missed several
    /// fire times fires once.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<(String, TaskRequest)> {
        if now <= self.last_tick {
            return Vec::new();
        }
        let since = self.last_tick;
        self.last_tick = now;
        self.jobs
            .iter()
            .filter(|(job, _)| job.enabled)
            .filter(|(_, schedule)| schedule.after(&since).next().is_some_and(|t| t <= now))
            .map(|(job, _)| (job.name.clone(), job.task.to_request()))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use switchboard_core::TaskTemplate;

    fn job(name: &str, cron: &str, enabled: bool) -> ScheduledJob {
        ScheduledJob {
            name: name.into(),
            cron_expression: cron.into(),
            task: TaskTemplate {
                skill: "report".into(),
                params: Default::default(),
                payload: serde_json::Value::Null,
                affinity: None,
            },
            enabled,
        }
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_parse_invalid_cron() {
        assert!(Scheduler::parse_cron("not a cron expression").is_err());
        assert!(Scheduler::new(vec![job("bad", "nope", true)]).is_err());
    }

    #[test]
    fn test_enabled_jobs_filter() {
        let scheduler = Scheduler::new(vec![
            job("active", "0 * * * * * *", true),
            job("inactive", "0 * * * * * *", false),
        ])
        .unwrap();
        assert_eq!(scheduler.job_count(), 2);
        assert_eq!(scheduler.enabled_jobs().len(), 1);
        assert_eq!(scheduler.enabled_jobs()[0].name, "active");
    }

    #[test]
    fn test_due_fires_once_per_window() {
        // Top of every minute.
        let mut scheduler =
            Scheduler::starting_at(vec![job("minutely", "0 * * * * * *", true)], at(10, 0, 30))
                .unwrap();
        assert_eq!(scheduler.next_fire_time(), Some(at(10, 1, 0)));

        assert!(scheduler.due(at(10, 0, 59)).is_empty());
        let fired = scheduler.due(at(10, 1, 5));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, "minutely");
        assert_eq!(fired[0].1.skill.id, "report");
        // Same window again: nothing new.
        assert!(scheduler.due(at(10, 1, 50)).is_empty());
        // Several missed minutes coalesce into one firing.
        assert_eq!(scheduler.due(at(10, 5, 0)).len(), 1);
    }

    #[test]
    fn test_disabled_jobs_never_fire() {
        let mut scheduler =
            Scheduler::starting_at(vec![job("off", "* * * * * * *", false)], at(10, 0, 0))
                .unwrap();
        assert!(scheduler.due(at(11, 0, 0)).is_empty());
        assert!(scheduler.next_fire_time().is_none());
    }
}
