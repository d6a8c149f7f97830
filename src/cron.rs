//! Minimal cron-style expression support for scheduled jobs (§4.6, §9).
//!
//! Only the named forms and `@every <duration>` are supported; standard
//! 5-field cron is explicitly unsupported per the open-questions note in
//! the spec's design notes.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronExpression {
    Yearly,
    Monthly,
    Weekly,
    Daily,
    Hourly,
    Every(std::time::Duration),
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported cron expression: {0}")]
pub struct CronParseError(pub String);

impl CronExpression {
    pub fn parse(s: &str) -> Result<Self, CronParseError> {
        let s = s.trim();
        match s {
            "@yearly" => Ok(CronExpression::Yearly),
            "@monthly" => Ok(CronExpression::Monthly),
            "@weekly" => Ok(CronExpression::Weekly),
            "@daily" => Ok(CronExpression::Daily),
            "@hourly" => Ok(CronExpression::Hourly),
            _ => {
                if let Some(rest) = s.strip_prefix("@every ") {
                    let dur = parse_duration(rest).ok_or_else(|| CronParseError(s.to_string()))?;
                    Ok(CronExpression::Every(dur))
                } else {
                    Err(CronParseError(s.to_string()))
                }
            }
        }
    }

    /// Next fire time strictly after `from`. Missed windows collapse into
    /// a single fire: this always computes relative to `from` (normally
    /// "now"), never replaying a backlog of missed boundaries.
    pub fn next_after(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            CronExpression::Hourly => next_hour_boundary(from),
            CronExpression::Daily => next_midnight(from),
            CronExpression::Weekly => next_midnight(from) + next_weekly_offset(from),
            CronExpression::Monthly => next_month_start(from),
            CronExpression::Yearly => next_year_start(from),
            CronExpression::Every(d) => from + ChronoDuration::from_std(*d).unwrap_or(ChronoDuration::zero()),
        }
    }
}

fn parse_duration(s: &str) -> Option<std::time::Duration> {
    let s = s.trim();
    let unit_start = s.find(|c: char| !c.is_ascii_digit())?;
    let (num, unit) = s.split_at(unit_start);
    let num: u64 = num.parse().ok()?;
    let secs = match unit {
        "s" => num,
        "m" => num * 60,
        "h" => num * 3600,
        "d" => num * 86400,
        _ => return None,
    };
    Some(std::time::Duration::from_secs(secs))
}

fn next_hour_boundary(from: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = from
        .date_naive()
        .and_hms_opt(from.hour(), 0, 0)
        .unwrap();
    let truncated = Utc.from_utc_datetime(&truncated);
    truncated + ChronoDuration::hours(1)
}

fn next_midnight(from: DateTime<Utc>) -> DateTime<Utc> {
    let next_day = from.date_naive() + ChronoDuration::days(1);
    Utc.from_utc_datetime(&next_day.and_hms_opt(0, 0, 0).unwrap())
}

fn next_weekly_offset(_from: DateTime<Utc>) -> ChronoDuration {
    ChronoDuration::days(6)
}

fn next_month_start(from: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if from.month() == 12 {
        (from.year() + 1, 1)
    } else {
        (from.year(), from.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).unwrap()
}

fn next_year_start(from: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(from.year() + 1, 1, 1, 0, 0, 0).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_forms() {
        assert_eq!(CronExpression::parse("@daily").unwrap(), CronExpression::Daily);
        assert_eq!(CronExpression::parse("@hourly").unwrap(), CronExpression::Hourly);
    }

    #[test]
    fn parses_every_duration() {
        assert!(matches!(CronExpression::parse("@every 15m").unwrap(), CronExpression::Every(_)));
    }

    #[test]
    fn rejects_standard_cron() {
        assert!(CronExpression::parse("*/5 * * * *").is_err());
    }

    #[test]
    fn daily_next_is_next_midnight() {
        let from = Utc.with_ymd_and_hms(2026, 7, 27, 15, 30, 0).unwrap();
        let next = CronExpression::Daily.next_after(from);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 7, 28, 0, 0, 0).unwrap());
    }
}
