use std::fmt;

use chrono::{DateTime, Datelike, TimeZone};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const PT_MONTHS: [&str; 12] = [
    "jan", "fev", "mar", "abr", "mai", "jun", "jul", "ago", "set", "out", "nov", "dez",
];
const EN_MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const LOCALE_ENV: [&str; 3] = ["LC_ALL", "LC_TIME", "LANG"];

/// A calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    pub fn containing<Tz: TimeZone>(instant: &DateTime<Tz>) -> Self {
        Self {
            year: instant.year(),
            month: instant.month(),
        }
    }

    pub fn previous(&self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    /// `<year>_<month>_<short-id>_readings.xlsx`, month not zero-padded.
    pub fn export_file_name(&self, task_id: &Uuid) -> String {
        format!(
            "{}_{}_{}_readings.xlsx",
            self.year,
            self.month,
            short_task_id(task_id)
        )
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.year, self.month)
    }
}

/// First hyphen-delimited segment of the task id.
pub fn short_task_id(task_id: &Uuid) -> String {
    let hyphenated = task_id.hyphenated().to_string();
    hyphenated
        .split('-')
        .next()
        .unwrap_or(hyphenated.as_str())
        .to_string()
}

/// Maximum "previous year" clicks needed to reach `target` from the year
/// the picker opens on.
pub fn year_steps(current: Period, target: Period) -> u32 {
    let years = i64::from(current.year) - i64::from(target.year);
    let months = years.max(0) * 12;
    // ceil(months / 12)
    ((months + 11) / 12) as u32
}

/// Month abbreviations as the portal's picker renders them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonthLabels {
    labels: [&'static str; 12],
}

impl MonthLabels {
    pub fn portuguese() -> Self {
        Self { labels: PT_MONTHS }
    }

    pub fn english() -> Self {
        Self { labels: EN_MONTHS }
    }

    /// Picks the table for the configured locale, falling back to the
    /// process locale (`LC_ALL`, `LC_TIME`, `LANG`) and then Portuguese.
    pub fn resolve(configured: Option<&str>) -> Self {
        let from_env = || {
            LOCALE_ENV
                .iter()
                .filter_map(|key| std::env::var(key).ok())
                .find(|value| !value.is_empty() && value != "C" && value != "POSIX")
        };
        let locale = configured.map(str::to_string).or_else(from_env);
        Self::for_locale(locale.as_deref())
    }

    pub fn for_locale(locale: Option<&str>) -> Self {
        match locale {
            Some(value) if value.to_ascii_lowercase().starts_with("en") => Self::english(),
            _ => Self::portuguese(),
        }
    }

    pub fn label(&self, month: u32) -> Option<&'static str> {
        let index = usize::try_from(month).ok()?.checked_sub(1)?;
        self.labels.get(index).copied()
    }
}

impl Default for MonthLabels {
    fn default() -> Self {
        Self::portuguese()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn export_file_name_uses_first_uuid_segment() {
        let id = Uuid::parse_str("3f2a9c1e-7b4d-4e2a-9f10-5c6d7e8f9a0b").unwrap();
        let period = Period::new(2023, 3).unwrap();
        assert_eq!(period.export_file_name(&id), "2023_3_3f2a9c1e_readings.xlsx");
        let december = Period::new(2022, 12).unwrap();
        assert_eq!(december.export_file_name(&id), "2022_12_3f2a9c1e_readings.xlsx");
    }

    #[test]
    fn export_file_name_matches_pattern_for_random_ids() {
        let pattern = regex::Regex::new(r"^\d{4}_([1-9]|1[0-2])_[0-9a-f]{8}_readings\.xlsx$").unwrap();
        for month in 1..=12 {
            let id = Uuid::new_v4();
            let name = Period::new(2024, month).unwrap().export_file_name(&id);
            assert!(pattern.is_match(&name), "{name}");
            assert!(id.to_string().starts_with(name.split('_').nth(2).unwrap()));
        }
    }

    #[test]
    fn previous_wraps_year() {
        assert_eq!(
            Period::new(2024, 1).unwrap().previous(),
            Period::new(2023, 12).unwrap()
        );
        assert_eq!(
            Period::new(2024, 5).unwrap().previous(),
            Period::new(2024, 4).unwrap()
        );
    }

    #[test]
    fn rejects_invalid_month() {
        assert!(Period::new(2024, 0).is_none());
        assert!(Period::new(2024, 13).is_none());
    }

    #[test]
    fn containing_reads_calendar_month() {
        let instant = Utc.with_ymd_and_hms(2024, 2, 29, 23, 0, 0).unwrap();
        assert_eq!(Period::containing(&instant), Period::new(2024, 2).unwrap());
    }

    #[test]
    fn year_steps_counts_whole_years() {
        let current = Period::new(2024, 5).unwrap();
        assert_eq!(year_steps(current, Period::new(2024, 1).unwrap()), 0);
        assert_eq!(year_steps(current, Period::new(2023, 12).unwrap()), 1);
        assert_eq!(year_steps(current, Period::new(2020, 1).unwrap()), 4);
        assert_eq!(year_steps(current, Period::new(2025, 1).unwrap()), 0);
    }

    #[test]
    fn month_labels_by_locale() {
        let pt = MonthLabels::for_locale(Some("pt_PT.UTF-8"));
        assert_eq!(pt.label(2), Some("fev"));
        assert_eq!(pt.label(12), Some("dez"));
        let en = MonthLabels::for_locale(Some("en_US.UTF-8"));
        assert_eq!(en.label(5), Some("may"));
        assert_eq!(MonthLabels::for_locale(None), pt);
        assert_eq!(pt.label(0), None);
        assert_eq!(pt.label(13), None);
        assert_eq!(MonthLabels::resolve(Some("en-GB")), en);
    }
}
