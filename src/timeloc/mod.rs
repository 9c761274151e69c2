//! Italian civil time arithmetic.
//!
//! The pipeline reasons in Europe/Rome wall-clock time (prospects, reps and
//! the voice agent all live there) but every stored instant is UTC.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Europe::Rome;

pub mod province;

pub use province::{extract_province, ProvinceCache, PROVINCE_CODES};

/// Convert an Italian civil (date, time) pair to the UTC instant it names.
/// DST gaps resolve forward; ambiguous autumn times take the earlier offset.
pub fn italian_to_utc(date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    let naive = date.and_time(time);
    match Rome.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        chrono::LocalResult::None => {
            // Spring-forward gap: push past the missing hour.
            let shifted = naive + Duration::hours(1);
            Rome.from_local_datetime(&shifted)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
        }
    }
}

pub fn utc_to_italian(instant: DateTime<Utc>) -> DateTime<chrono_tz::Tz> {
    instant.with_timezone(&Rome)
}

/// Accepts `DD-MM-YYYY HH:mm` or `YYYY-MM-DD HH:mm` and returns the UTC
/// instant of that Italian wall-clock time.
pub fn parse_italian_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    let (date_part, time_part) = s.split_once(' ')?;
    let time = NaiveTime::parse_from_str(time_part.trim(), "%H:%M").ok()?;
    let date = parse_date(date_part)?;
    Some(italian_to_utc(date, time))
}

/// `DD-MM-YYYY` or `YYYY-MM-DD`.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%d-%m-%Y")
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .ok()
}

/// Operator hours: calls may be placed 08:00–20:00 Rome time.
pub fn is_operating_hours(now: DateTime<Utc>) -> bool {
    let hour = now.with_timezone(&Rome).hour();
    (8..20).contains(&hour)
}

/// Business hours offered to prospects: 09:00–20:00 Rome time.
pub fn is_within_italian_business(instant: DateTime<Utc>) -> bool {
    let hour = instant.with_timezone(&Rome).hour();
    (9..20).contains(&hour)
}

/// Step forward one calendar day, then past any weekend.
///
/// Weekend detection is UTC-based, so within the Rome offset window around
/// midnight a Friday/Sunday boundary can be off by a day. The retry
/// schedule was tuned against this behavior; keep it.
pub fn next_valid_workday(from: DateTime<Utc>) -> DateTime<Utc> {
    let mut next = from + Duration::days(1);
    while matches!(next.weekday(), Weekday::Sat | Weekday::Sun) {
        next += Duration::days(1);
    }
    next
}

/// The next workday at the given Rome wall-clock hour. Used by the retry
/// schedule steps that pin attempts to 09:00 / 14:00 / 19:00.
pub fn next_workday_at_rome_hour(from: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let day = next_valid_workday(from).with_timezone(&Rome).date_naive();
    let time = NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or_default();
    italian_to_utc(day, time)
}

/// Italian wall-clock timestamp injected into the voice agent's context,
/// e.g. "lunedì 17-03-2025 10:45".
pub fn now_italian_display(now: DateTime<Utc>) -> String {
    let rome = now.with_timezone(&Rome);
    format!("{} {}", italian_weekday(rome.weekday()), rome.format("%d-%m-%Y %H:%M"))
}

pub fn italian_weekday(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "lunedì",
        Weekday::Tue => "martedì",
        Weekday::Wed => "mercoledì",
        Weekday::Thu => "giovedì",
        Weekday::Fri => "venerdì",
        Weekday::Sat => "sabato",
        Weekday::Sun => "domenica",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn winter_conversion_is_plus_one() {
        // January: Rome is UTC+1.
        let utc = italian_to_utc(date(2025, 1, 15), time(10, 0));
        assert_eq!(utc, Utc.with_ymd_and_hms(2025, 1, 15, 9, 0, 0).unwrap());
    }

    #[test]
    fn summer_conversion_is_plus_two() {
        // July: Rome is UTC+2.
        let utc = italian_to_utc(date(2025, 7, 15), time(10, 0));
        assert_eq!(utc, Utc.with_ymd_and_hms(2025, 7, 15, 8, 0, 0).unwrap());
    }

    #[test]
    fn round_trip_away_from_dst_transitions() {
        for (d, t) in [
            (date(2025, 2, 3), time(9, 30)),
            (date(2025, 6, 20), time(19, 59)),
            (date(2025, 11, 11), time(14, 0)),
        ] {
            let rome = utc_to_italian(italian_to_utc(d, t));
            assert_eq!(rome.date_naive(), d);
            assert_eq!(rome.time(), t);
        }
    }

    #[test]
    fn parses_both_datetime_formats() {
        let a = parse_italian_datetime("17-03-2025 10:00").unwrap();
        let b = parse_italian_datetime("2025-03-17 10:00").unwrap();
        assert_eq!(a, b);
        // March 17 is before the DST switch: UTC+1.
        assert_eq!(a, Utc.with_ymd_and_hms(2025, 3, 17, 9, 0, 0).unwrap());
    }

    #[test]
    fn rejects_malformed_datetimes() {
        assert!(parse_italian_datetime("17/03/2025 10:00").is_none());
        assert!(parse_italian_datetime("2025-03-17").is_none());
        assert!(parse_italian_datetime("domani alle dieci").is_none());
    }

    #[test]
    fn operating_hours_bounds() {
        // 06:59 UTC in winter is 07:59 Rome: closed.
        assert!(!is_operating_hours(
            Utc.with_ymd_and_hms(2025, 1, 15, 6, 59, 0).unwrap()
        ));
        // 07:00 UTC winter is 08:00 Rome: open.
        assert!(is_operating_hours(
            Utc.with_ymd_and_hms(2025, 1, 15, 7, 0, 0).unwrap()
        ));
        // 19:00 UTC winter is 20:00 Rome: closed again.
        assert!(!is_operating_hours(
            Utc.with_ymd_and_hms(2025, 1, 15, 19, 0, 0).unwrap()
        ));
    }

    #[test]
    fn business_hours_start_at_nine() {
        assert!(!is_within_italian_business(
            Utc.with_ymd_and_hms(2025, 1, 15, 7, 30, 0).unwrap()
        ));
        assert!(is_within_italian_business(
            Utc.with_ymd_and_hms(2025, 1, 15, 8, 0, 0).unwrap()
        ));
    }

    #[test]
    fn workday_stepping_skips_weekends() {
        // Friday noon UTC -> Monday.
        let friday = Utc.with_ymd_and_hms(2025, 3, 14, 12, 0, 0).unwrap();
        assert_eq!(next_valid_workday(friday).weekday(), Weekday::Mon);
        // Tuesday -> Wednesday.
        let tuesday = Utc.with_ymd_and_hms(2025, 3, 11, 12, 0, 0).unwrap();
        assert_eq!(next_valid_workday(tuesday).weekday(), Weekday::Wed);
    }

    #[test]
    fn next_workday_pins_rome_hour() {
        let friday = Utc.with_ymd_and_hms(2025, 3, 14, 12, 0, 0).unwrap();
        let next = next_workday_at_rome_hour(friday, 9);
        let rome = utc_to_italian(next);
        assert_eq!(rome.weekday(), Weekday::Mon);
        assert_eq!((rome.hour(), rome.minute()), (9, 0));
    }

    #[test]
    fn italian_display_contains_weekday_and_clock() {
        // 2025-03-17 is a Monday; 10:45 Rome in winter offset.
        let now = Utc.with_ymd_and_hms(2025, 3, 17, 9, 45, 0).unwrap();
        assert_eq!(now_italian_display(now), "lunedì 17-03-2025 10:45");
    }
}
