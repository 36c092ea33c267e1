//! Recovery-step schedule expressions.
//!
//! Three forms, resolved against the campaign timezone:
//!   * relative:    `10m`, `2h`, `3d`   → anchor + N units
//!   * next-day-at: `14:00`             → today at 14:00 if still ahead, else tomorrow
//!   * offset:      `+2d 18:00`         → anchor's day + N days at 18:00; if past, +1 day
//!
//! The offset form also parses without the space (`+0d14:00`). All math runs
//! on timezone-aware values; the result converts back to UTC for storage.

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use hive_core::{HiveError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleExpr {
    Relative { minutes: i64 },
    NextDayAt { hour: u32, minute: u32 },
    OffsetDaysAt { days: i64, hour: u32, minute: u32 },
}

impl ScheduleExpr {
    pub fn parse(input: &str) -> Result<Self> {
        let s = input.trim();
        if s.is_empty() {
            return Err(bad(input));
        }

        if let Some(rest) = s.strip_prefix('+') {
            // "+Nd HH:MM" (space optional).
            let d_pos = rest.find('d').ok_or_else(|| bad(input))?;
            let days: i64 = rest[..d_pos].parse().map_err(|_| bad(input))?;
            if days < 0 {
                return Err(bad(input));
            }
            let (hour, minute) = parse_hhmm(rest[d_pos + 1..].trim())?;
            return Ok(ScheduleExpr::OffsetDaysAt { days, hour, minute });
        }

        if s.contains(':') {
            let (hour, minute) = parse_hhmm(s)?;
            return Ok(ScheduleExpr::NextDayAt { hour, minute });
        }

        // Relative: digits followed by a unit letter.
        let unit = s.chars().last().ok_or_else(|| bad(input))?;
        let value: i64 = s[..s.len() - 1].parse().map_err(|_| bad(input))?;
        if value <= 0 {
            return Err(bad(input));
        }
        let minutes = match unit {
            'm' => value,
            'h' => value * 60,
            'd' => value * 60 * 24,
            _ => return Err(bad(input)),
        };
        Ok(ScheduleExpr::Relative { minutes })
    }

    /// Absolute UTC instant this expression resolves to, measured from
    /// `anchor` in timezone `tz`.
    pub fn next_occurrence(&self, anchor: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
        match *self {
            ScheduleExpr::Relative { minutes } => anchor + Duration::minutes(minutes),

            ScheduleExpr::NextDayAt { hour, minute } => {
                let local = anchor.with_timezone(&tz);
                let candidate = at_time(local.date_naive(), hour, minute, tz);
                if candidate > anchor {
                    candidate
                } else {
                    at_time(local.date_naive() + Duration::days(1), hour, minute, tz)
                }
            }

            ScheduleExpr::OffsetDaysAt { days, hour, minute } => {
                let local = anchor.with_timezone(&tz);
                let day = local.date_naive() + Duration::days(days);
                let candidate = at_time(day, hour, minute, tz);
                if candidate > anchor {
                    candidate
                } else {
                    at_time(day + Duration::days(1), hour, minute, tz)
                }
            }
        }
    }
}

fn at_time(day: chrono::NaiveDate, hour: u32, minute: u32, tz: Tz) -> DateTime<Utc> {
    let naive = day.and_time(NaiveTime::from_hms_opt(hour, minute, 0).expect("validated HH:MM"));
    // DST gaps/folds: take the earliest valid instant, falling forward an
    // hour when the local time does not exist.
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(early, _) => early.with_timezone(&Utc),
        chrono::LocalResult::None => tz
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive)),
    }
}

fn parse_hhmm(s: &str) -> Result<(u32, u32)> {
    let (h, m) = s.split_once(':').ok_or_else(|| bad(s))?;
    let hour: u32 = h.parse().map_err(|_| bad(s))?;
    let minute: u32 = m.parse().map_err(|_| bad(s))?;
    if hour > 23 || minute > 59 {
        return Err(bad(s));
    }
    Ok((hour, minute))
}

fn bad(input: &str) -> HiveError {
    HiveError::Validation(format!("bad schedule expression {input:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::America::Sao_Paulo;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn parses_every_documented_form() {
        assert_eq!(ScheduleExpr::parse("10m").unwrap(), ScheduleExpr::Relative { minutes: 10 });
        assert_eq!(ScheduleExpr::parse("1h").unwrap(), ScheduleExpr::Relative { minutes: 60 });
        assert_eq!(ScheduleExpr::parse("2d").unwrap(), ScheduleExpr::Relative { minutes: 2880 });
        assert_eq!(
            ScheduleExpr::parse("14:00").unwrap(),
            ScheduleExpr::NextDayAt { hour: 14, minute: 0 }
        );
        assert_eq!(
            ScheduleExpr::parse("+2d 18:00").unwrap(),
            ScheduleExpr::OffsetDaysAt { days: 2, hour: 18, minute: 0 }
        );
        // No-space variant.
        assert_eq!(
            ScheduleExpr::parse("+0d14:00").unwrap(),
            ScheduleExpr::OffsetDaysAt { days: 0, hour: 14, minute: 0 }
        );
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "10x", "m", "25:00", "12:61", "+d 10:00", "-1d 10:00", "0m"] {
            assert!(ScheduleExpr::parse(bad).is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn relative_is_timezone_independent() {
        let anchor = utc(2026, 8, 1, 12, 0);
        let next = ScheduleExpr::parse("10m").unwrap().next_occurrence(anchor, Sao_Paulo);
        assert_eq!(next, anchor + Duration::minutes(10));
    }

    #[test]
    fn today_at_still_ahead_stays_today() {
        // 10:00 São Paulo == 13:00 UTC (UTC-3).
        let anchor = utc(2026, 8, 1, 13, 0);
        let next = ScheduleExpr::parse("14:00").unwrap().next_occurrence(anchor, Sao_Paulo);
        assert_eq!(next, utc(2026, 8, 1, 17, 0)); // 14:00 local
    }

    #[test]
    fn today_at_already_passed_rolls_to_tomorrow() {
        // 16:00 São Paulo == 19:00 UTC.
        let anchor = utc(2026, 8, 1, 19, 0);
        let next = ScheduleExpr::parse("14:00").unwrap().next_occurrence(anchor, Sao_Paulo);
        assert_eq!(next, utc(2026, 8, 2, 17, 0)); // tomorrow 14:00 local
    }

    #[test]
    fn offset_days_lands_on_the_right_local_day() {
        // 09:00 São Paulo on Aug 1.
        let anchor = utc(2026, 8, 1, 12, 0);
        let next = ScheduleExpr::parse("+2d 18:00").unwrap().next_occurrence(anchor, Sao_Paulo);
        assert_eq!(next, utc(2026, 8, 3, 21, 0)); // Aug 3, 18:00 local
    }

    #[test]
    fn zero_offset_in_the_past_shifts_one_day() {
        // 16:00 São Paulo; "+0d14:00" already passed today.
        let anchor = utc(2026, 8, 1, 19, 0);
        let next = ScheduleExpr::parse("+0d14:00").unwrap().next_occurrence(anchor, Sao_Paulo);
        assert_eq!(next, utc(2026, 8, 2, 17, 0));
    }

    #[test]
    fn next_day_at_exactly_now_rolls_forward() {
        // Candidate == anchor must not fire immediately.
        let anchor = utc(2026, 8, 1, 17, 0); // 14:00 local
        let next = ScheduleExpr::parse("14:00").unwrap().next_occurrence(anchor, Sao_Paulo);
        assert_eq!(next, utc(2026, 8, 2, 17, 0));
    }
}
