//! Syslog timestamp parsing.
//!
//! RFC 3164 headers carry neither a year nor a timezone: they are in the
//! sender's local time. We interpret them in the process-local zone (the
//! `TZ` env var, which deployment keeps in step with the gateway) and
//! store UTC.

use chrono::{DateTime, Datelike, Local, LocalResult, TimeZone, Utc};

fn month_number(month: &str) -> u32 {
    match month {
        "Jan" => 1,
        "Feb" => 2,
        "Mar" => 3,
        "Apr" => 4,
        "May" => 5,
        "Jun" => 6,
        "Jul" => 7,
        "Aug" => 8,
        "Sep" => 9,
        "Oct" => 10,
        "Nov" => 11,
        "Dec" => 12,
        _ => 1,
    }
}

/// Parse a `month day HH:MM:SS` header into UTC, using the local clock to
/// pick the year.
pub fn parse_syslog_timestamp(month: &str, day: &str, time: &str) -> Option<DateTime<Utc>> {
    stamp_at(month, day, time, Local::now())
}

/// Year-rollover guard: only subtract a year when the parsed month is far
/// ahead of the current month (a December log arriving in January). A
/// plain `ts > now` check is too aggressive — a gateway clock even a few
/// seconds ahead of ours would misdate same-day logs into last year.
pub(crate) fn stamp_at<Tz: TimeZone>(
    month: &str,
    day: &str,
    time: &str,
    now: DateTime<Tz>,
) -> Option<DateTime<Utc>> {
    let month_num = month_number(month);
    let day: u32 = day.parse().ok()?;

    let mut parts = time.split(':');
    let hour: u32 = parts.next()?.parse().ok()?;
    let minute: u32 = parts.next()?.parse().ok()?;
    let second: u32 = parts.next()?.parse().ok()?;

    let mut year = now.year();
    if month_num as i32 - now.month() as i32 > 6 {
        year -= 1;
    }

    let local = match now
        .timezone()
        .with_ymd_and_hms(year, month_num, day, hour, minute, second)
    {
        LocalResult::Single(ts) => ts,
        // DST fold/gap: take the earlier interpretation
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => return None,
    };

    Some(local.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    #[test]
    fn test_same_year_stamp() {
        let now = Utc.with_ymd_and_hms(2026, 2, 8, 17, 0, 0).unwrap();
        let ts = stamp_at("Feb", "8", "16:43:49", now).unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2026, 2, 8, 16, 43, 49).unwrap());
    }

    #[test]
    fn test_year_wrap_december_log_in_january() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 1).unwrap();
        let ts = stamp_at("Dec", "31", "23:59:59", now).unwrap();
        assert_eq!(ts.year(), 2025);
    }

    #[test]
    fn test_sender_clock_slightly_ahead_keeps_current_year() {
        // Log is 5 seconds ahead of our clock on the same day. Month delta
        // is 0, so the year must NOT roll back.
        let now = Utc.with_ymd_and_hms(2026, 6, 15, 23, 59, 55).unwrap();
        let ts = stamp_at("Jun", "16", "00:00:00", now).unwrap();
        assert_eq!(ts.year(), 2026);
    }

    #[test]
    fn test_local_zone_converts_to_utc() {
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        let now = tz.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let ts = stamp_at("Mar", "10", "10:30:00", now).unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2026, 3, 10, 8, 30, 0).unwrap());
    }

    #[test]
    fn test_invalid_date_is_rejected() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        assert!(stamp_at("Feb", "30", "10:00:00", now).is_none());
        assert!(stamp_at("Feb", "8", "25:00:00", now).is_none());
    }
}
