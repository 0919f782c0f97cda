use std::str::FromStr;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::types::Schedule;

/// Compute the next UTC epoch-millisecond execution time for `schedule`,
/// starting strictly after `from_ms`.
///
/// Returns `None` when the schedule is exhausted (an `At` job whose instant
/// has already passed) or when a `Cron` expression fails to parse.
pub fn compute_next_run_ms(schedule: &Schedule, from_ms: i64) -> Option<i64> {
    match schedule {
        Schedule::Every { every_ms } => Some(from_ms + *every_ms as i64),

        Schedule::At { at_ms } => {
            if *at_ms > from_ms {
                Some(*at_ms)
            } else {
                None
            }
        }

        Schedule::Cron { expr } => {
            let schedule = match cron::Schedule::from_str(expr) {
                Ok(s) => s,
                Err(e) => {
                    warn!(%expr, error = %e, "invalid cron expression; job will not be rescheduled");
                    return None;
                }
            };
            let from: DateTime<Utc> = DateTime::from_timestamp_millis(from_ms)?;
            schedule.after(&from).next().map(|dt| dt.timestamp_millis())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_advances_by_fixed_step() {
        let schedule = Schedule::Every { every_ms: 60_000 };
        assert_eq!(compute_next_run_ms(&schedule, 1_000), Some(61_000));
    }

    #[test]
    fn at_fires_once_then_exhausts() {
        let schedule = Schedule::At { at_ms: 5_000 };
        assert_eq!(compute_next_run_ms(&schedule, 1_000), Some(5_000));
        assert_eq!(compute_next_run_ms(&schedule, 5_000), None);
        assert_eq!(compute_next_run_ms(&schedule, 9_000), None);
    }

    #[test]
    fn cron_resolves_next_occurrence() {
        // Every minute at second 0; six-field cron (sec min hour dom mon dow).
        let schedule = Schedule::Cron {
            expr: "0 * * * * *".to_string(),
        };
        let from_ms = DateTime::parse_from_rfc3339("2026-01-01T00:00:30Z")
            .unwrap()
            .timestamp_millis();
        let next = compute_next_run_ms(&schedule, from_ms).expect("cron should resolve");
        assert!(next > from_ms);
    }

    #[test]
    fn invalid_cron_expression_yields_none() {
        let schedule = Schedule::Cron {
            expr: "not a cron expression".to_string(),
        };
        assert_eq!(compute_next_run_ms(&schedule, 0), None);
    }
}
