//! Declared availability windows for worker nodes.
//!
//! Windows are evaluated in UTC. A window whose start is later than its end
//! wraps past midnight. Bounds are whole minutes, so an end of `17:00`
//! covers 17:00:59. A node without restrictions (or with an empty window
//! list) is always available.

use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaySpec {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
    Weekdays,
    Weekends,
    All,
}

impl DaySpec {
    pub fn includes(&self, day: Weekday) -> bool {
        match self {
            Self::All => true,
            Self::Weekdays => !matches!(day, Weekday::Sat | Weekday::Sun),
            Self::Weekends => matches!(day, Weekday::Sat | Weekday::Sun),
            Self::Monday => day == Weekday::Mon,
            Self::Tuesday => day == Weekday::Tue,
            Self::Wednesday => day == Weekday::Wed,
            Self::Thursday => day == Weekday::Thu,
            Self::Friday => day == Weekday::Fri,
            Self::Saturday => day == Weekday::Sat,
            Self::Sunday => day == Weekday::Sun,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindow {
    pub day_of_week: DaySpec,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
}

impl TimeWindow {
    pub fn new(day_of_week: DaySpec, start_time: NaiveTime, end_time: NaiveTime) -> Self {
        Self {
            day_of_week,
            start_time,
            end_time,
        }
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        if !self.day_of_week.includes(now.weekday()) {
            return false;
        }
        let t = minute_of_day(now.time());
        let (start, end) = (minute_of_day(self.start_time), minute_of_day(self.end_time));
        if start <= end {
            start <= t && t <= end
        } else {
            t >= start || t <= end
        }
    }
}

fn minute_of_day(time: NaiveTime) -> u32 {
    time.hour() * 60 + time.minute()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRestrictions {
    pub available_hours: Vec<TimeWindow>,
}

impl TimeRestrictions {
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.available_hours.is_empty() || self.available_hours.iter().any(|w| w.contains(now))
    }
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn weekday_window() {
        let window = TimeWindow::new(DaySpec::Weekdays, hm(9, 0), hm(17, 0));
        // 2024-01-08 is a Monday
        assert!(window.contains(at(2024, 1, 8, 9, 0)));
        assert!(window.contains(at(2024, 1, 8, 17, 0)));
        assert!(!window.contains(at(2024, 1, 8, 17, 1)));
        assert!(!window.contains(at(2024, 1, 13, 12, 0)));
    }

    #[test]
    fn end_bound_covers_whole_minute() {
        let window = TimeWindow::new(DaySpec::All, hm(0, 0), hm(23, 59));
        let late = Utc.with_ymd_and_hms(2024, 1, 8, 23, 59, 30).unwrap();
        assert!(window.contains(late));

        let window = TimeWindow::new(DaySpec::Weekdays, hm(9, 0), hm(17, 0));
        assert!(window.contains(Utc.with_ymd_and_hms(2024, 1, 8, 17, 0, 59).unwrap()));
        assert!(!window.contains(Utc.with_ymd_and_hms(2024, 1, 8, 8, 59, 59).unwrap()));
    }

    #[test]
    fn overnight_window_wraps() {
        let window = TimeWindow::new(DaySpec::All, hm(22, 0), hm(6, 0));
        assert!(window.contains(at(2024, 1, 8, 23, 30)));
        assert!(window.contains(at(2024, 1, 8, 5, 59)));
        assert!(window.contains(Utc.with_ymd_and_hms(2024, 1, 8, 6, 0, 45).unwrap()));
        assert!(!window.contains(at(2024, 1, 8, 6, 1)));
        assert!(!window.contains(at(2024, 1, 8, 12, 0)));
    }

    #[test]
    fn empty_restrictions_always_open() {
        assert!(TimeRestrictions::default().is_open_at(at(2024, 1, 8, 3, 0)));
    }

    #[test]
    fn deserializes_hh_mm() {
        let raw = r#"{"availableHours":[
            {"dayOfWeek":"Weekends","startTime":"08:30","endTime":"20:00"}
        ]}"#;
        let restrictions: TimeRestrictions = serde_json::from_str(raw).unwrap();
        assert_eq!(restrictions.available_hours[0].start_time, hm(8, 30));
        assert!(restrictions.is_open_at(at(2024, 1, 13, 8, 30)));
        assert!(!restrictions.is_open_at(at(2024, 1, 12, 9, 0)));
    }
}
