//! Recurring syncs driven by a cron schedule.
//!
//! Schedules use the standard five-field dialect (minute, hour, day of
//! month, month, day of week with Sunday as 0 or 7) or `@hourly`-style
//! descriptors, evaluated in UTC.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::ScheduleError;
use crate::model::{KnowledgeSourceState, KnowledgeSourceStatus};

/// Parse a schedule into a `cron::Schedule`.
pub fn parse_schedule(expression: &str) -> Result<cron::Schedule, ScheduleError> {
    let expression = expression.trim();
    let invalid = |reason: String| ScheduleError::Invalid {
        expression: expression.to_string(),
        reason,
    };

    let normalized = if expression.starts_with('@') {
        expression.to_string()
    } else {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(format!("expected 5 fields, found {}", fields.len())));
        }
        let dow = translate_day_of_week(fields[4]).map_err(invalid)?;
        format!(
            "0 {} {} {} {} {}",
            fields[0], fields[1], fields[2], fields[3], dow
        )
    };

    cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))
}

/// First fire time strictly after `after`.
pub fn next_fire(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    parse_schedule(expression)?
        .after(&after)
        .next()
        .ok_or_else(|| ScheduleError::NoUpcoming {
            expression: expression.to_string(),
        })
}

/// Map standard day-of-week numbers (Sunday = 0 or 7) onto the cron
/// crate's 1-7 numbering (Sunday = 1). Names pass through.
fn translate_day_of_week(field: &str) -> Result<String, String> {
    let mut out = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (item, None),
        };
        let suffix = step.map(|s| format!("/{s}")).unwrap_or_default();

        if base == "*" || base.chars().any(|c| c.is_ascii_alphabetic()) {
            out.push(format!("{base}{suffix}"));
            continue;
        }

        match base.split_once('-') {
            Some((lo, hi)) => {
                let lo = day_number(lo)?;
                let hi = day_number(hi)?;
                if lo > hi {
                    return Err(format!("day-of-week range {base} is reversed"));
                }
                if hi == 7 && let Some(step) = step {
                    // Listed day by day around the Sunday wrap.
                    let step = match step.parse::<usize>() {
                        Ok(n) if n > 0 => n,
                        _ => return Err(format!("invalid day-of-week step {step:?}")),
                    };
                    let mut days: Vec<u32> = (lo..=hi).step_by(step).map(|d| d % 7 + 1).collect();
                    days.sort_unstable();
                    days.dedup();
                    out.extend(days.iter().map(u32::to_string));
                } else if hi == 7 && lo > 0 {
                    // Ends on Sunday: split around the wrap.
                    if lo == 6 {
                        out.push("7".to_string());
                    } else {
                        out.push(format!("{}-7", lo + 1));
                    }
                    out.push("1".to_string());
                } else {
                    out.push(format!("{}-{}{suffix}", lo % 7 + 1, hi.min(6) + 1));
                }
            }
            None => out.push(format!("{}{suffix}", day_number(base)? % 7 + 1)),
        }
    }
    Ok(out.join(","))
}

fn day_number(s: &str) -> Result<u32, String> {
    match s.parse::<u32>() {
        Ok(n) if n <= 7 => Ok(n),
        _ => Err(format!("invalid day of week {s:?}")),
    }
}

/// Advance the schedule for a settled source.
///
/// Computes `next_sync_time` from the last start when unset, and flips the
/// state back to pending once that time has passed. A malformed schedule
/// is recorded as a terminal error. Returns how long until the next
/// scheduled sync, when one is pending.
pub fn reschedule(
    status: &mut KnowledgeSourceStatus,
    schedule: &str,
    now: DateTime<Utc>,
) -> Option<Duration> {
    if schedule.trim().is_empty() {
        return None;
    }
    let (Some(start), Some(_)) = (status.last_sync_start_time, status.last_sync_end_time) else {
        return None;
    };

    let next = match status.next_sync_time {
        Some(next) => next,
        None => match next_fire(schedule, start) {
            Ok(next) => {
                status.next_sync_time = Some(next);
                next
            }
            Err(e) => {
                status.sync_state = KnowledgeSourceState::Error;
                status.error = e.to_string();
                return None;
            }
        },
    };

    if next <= now {
        status.next_sync_time = None;
        status.sync_state = KnowledgeSourceState::Pending;
        return None;
    }
    (next - now).to_std().ok()
}
