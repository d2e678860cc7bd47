//! Task scheduler: polls the store for due tasks and hands them to the
//! group queue.
//!
//! Next-run computation:
//! - `cron`: next occurrence after now in the configured timezone
//! - `interval`: now + milliseconds
//! - `once`: none; the task completes after its single run

use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use nanoclaw_core::store::{ScheduleKind, ScheduledTask, Store, TaskStatus, now_rfc3339};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub timezone: String,
}

/// Invoked for each due task; expected to enqueue it on the group queue.
pub type TaskCallback = Box<dyn Fn(ScheduledTask) + Send + Sync>;

fn parse_tz(timezone: &str) -> chrono_tz::Tz {
    timezone.parse().unwrap_or_else(|_| {
        warn!(tz = timezone, "invalid timezone, falling back to UTC");
        chrono_tz::Tz::UTC
    })
}

/// Next run after a completed execution. `None` means the task is done.
pub fn calculate_next_run(
    kind: ScheduleKind,
    schedule_value: &str,
    timezone: &str,
) -> Option<String> {
    match kind {
        ScheduleKind::Cron => {
            let schedule = match cron::Schedule::from_str(schedule_value) {
                Ok(s) => s,
                Err(e) => {
                    error!(cron = schedule_value, err = %e, "invalid cron expression");
                    return None;
                }
            };
            let tz = parse_tz(timezone);
            let now = Utc::now().with_timezone(&tz);
            schedule.after(&now).next().map(|dt| {
                dt.with_timezone(&Utc)
                    .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
            })
        }
        ScheduleKind::Interval => {
            let ms: u64 = match schedule_value.parse() {
                Ok(v) => v,
                Err(e) => {
                    error!(value = schedule_value, err = %e, "invalid interval milliseconds");
                    return None;
                }
            };
            let next = Utc::now() + chrono::Duration::milliseconds(ms as i64);
            Some(next.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        }
        ScheduleKind::Once => None,
    }
}

/// First due time for a freshly created task. A one-shot's value is its
/// RFC3339 due instant; an unparseable value fires immediately.
pub fn initial_next_run(
    kind: ScheduleKind,
    schedule_value: &str,
    timezone: &str,
) -> Option<String> {
    match kind {
        ScheduleKind::Once => Some(
            chrono::DateTime::parse_from_rfc3339(schedule_value)
                .map(|dt| {
                    dt.with_timezone(&Utc)
                        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
                })
                .unwrap_or_else(|_| now_rfc3339()),
        ),
        other => calculate_next_run(other, schedule_value, timezone),
    }
}

/// Summary stored on the task row after a run; long results are capped.
pub fn result_summary(result: Option<&str>, error: Option<&str>) -> String {
    if let Some(e) = error {
        format!("Error: {e}")
    } else if let Some(r) = result {
        if r.chars().count() > 200 {
            r.chars().take(200).collect()
        } else {
            r.to_string()
        }
    } else {
        "Completed".to_string()
    }
}

/// Run the scheduler poll loop until the shutdown signal fires.
pub async fn run_scheduler_loop(
    config: SchedulerConfig,
    store: Store,
    on_task: TaskCallback,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        timezone = config.timezone.as_str(),
        "scheduler loop started"
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("scheduler loop shutting down");
                    return;
                }
            }
        }

        let due = match store.due_tasks(&now_rfc3339()) {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(err = %e, "failed to query due tasks");
                continue;
            }
        };
        if due.is_empty() {
            continue;
        }
        info!(count = due.len(), "due tasks found");

        for task in due {
            // Status may have changed between the query and dispatch.
            match store.get_task(&task.id) {
                Ok(Some(current)) if current.status == TaskStatus::Active => {
                    debug!(
                        task_id = current.id.as_str(),
                        folder = current.folder.as_str(),
                        "dispatching due task"
                    );
                    on_task(current);
                }
                Ok(Some(_)) => {
                    debug!(task_id = task.id.as_str(), "task no longer active, skipping");
                }
                Ok(None) => {
                    debug!(task_id = task.id.as_str(), "task deleted, skipping");
                }
                Err(e) => {
                    error!(task_id = task.id.as_str(), err = %e, "failed to re-check task");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_next_run_is_in_the_future() {
        let next = calculate_next_run(ScheduleKind::Interval, "60000", "UTC").unwrap();
        assert!(next > now_rfc3339());
    }

    #[test]
    fn once_has_no_next_run_after_execution() {
        assert!(calculate_next_run(ScheduleKind::Once, "", "UTC").is_none());
    }

    #[test]
    fn cron_next_run_parses_standard_expression() {
        // Six-field cron: every minute at second 0.
        let next = calculate_next_run(ScheduleKind::Cron, "0 * * * * *", "UTC");
        assert!(next.is_some());
    }

    #[test]
    fn cron_daily_nine_advances_past_stale_next_run() {
        // A task whose stored next_run is decades old must advance to the
        // next 09:00 after *now*, not replay every missed day.
        let next = calculate_next_run(ScheduleKind::Cron, "0 0 9 * * *", "UTC").unwrap();
        assert!(next > now_rfc3339());
        let dt = chrono::DateTime::parse_from_rfc3339(&next).unwrap();
        assert_eq!(dt.format("%H:%M").to_string(), "09:00");
    }

    #[test]
    fn invalid_cron_and_interval_yield_none() {
        assert!(calculate_next_run(ScheduleKind::Cron, "not a cron", "UTC").is_none());
        assert!(calculate_next_run(ScheduleKind::Interval, "abc", "UTC").is_none());
    }

    #[test]
    fn cron_respects_timezone() {
        let utc = calculate_next_run(ScheduleKind::Cron, "0 0 9 * * *", "UTC").unwrap();
        let berlin =
            calculate_next_run(ScheduleKind::Cron, "0 0 9 * * *", "Europe/Berlin").unwrap();
        assert_ne!(utc, berlin);
    }

    #[test]
    fn initial_once_uses_the_value_as_due_time() {
        let next = initial_next_run(ScheduleKind::Once, "2099-01-01T09:00:00Z", "UTC").unwrap();
        assert!(next.starts_with("2099-01-01T09:00:00"));

        // Garbage fires immediately rather than never.
        let next = initial_next_run(ScheduleKind::Once, "whenever", "UTC").unwrap();
        assert!(next <= now_rfc3339());
    }

    #[test]
    fn result_summary_shapes() {
        assert_eq!(result_summary(None, Some("boom")), "Error: boom");
        assert_eq!(result_summary(Some("short"), None), "short");
        assert_eq!(result_summary(None, None), "Completed");
        let long = "a".repeat(300);
        assert_eq!(result_summary(Some(&long), None).chars().count(), 200);
    }
}
