use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, Range, Reader};
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use thiserror::Error;
use tracing::debug;

use super::Reading;

/// Banner rows the portal writes above the readings table.
pub const HEADER_ROWS: u32 = 8;

const DATE_FORMATS: &[&str] = &["%Y/%m/%d", "%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y"];
const TIME_FORMATS: &[&str] = &["%H:%M", "%H:%M:%S"];
const SECONDS_PER_DAY: f64 = 86_400.0;

pub type ParseResult<T> = Result<T, ParseError>;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to open workbook {path}: {source}")]
    Workbook {
        source: calamine::Error,
        path: PathBuf,
    },
    #[error("workbook {0} has no worksheet")]
    MissingSheet(PathBuf),
    #[error("blocking parse task failed: {0}")]
    Join(String),
}

/// Turns an exported file into readings for one meter.
pub trait ExportParser: Send + Sync {
    fn parse(&self, path: &Path, meter_id: &str) -> ParseResult<Vec<Reading>>;
}

#[derive(Debug, Clone, Default)]
pub struct XlsxExportParser;

impl XlsxExportParser {
    pub fn new() -> Self {
        Self
    }

    /// Reads `date | time | consumption` rows below the header banner. Rows
    /// that do not hold a valid sample are skipped.
    pub fn parse_range(&self, range: &Range<Data>, meter_id: &str) -> Vec<Reading> {
        let Some((last_row, _)) = range.end() else {
            return Vec::new();
        };
        let first_row = range.start().map(|(row, _)| row).unwrap_or(0).max(HEADER_ROWS);
        let mut readings = Vec::new();
        for row in first_row..=last_row {
            let cell = |col: u32| range.get_value((row, col)).unwrap_or(&Data::Empty);
            match reading_from_cells(cell(0), cell(1), cell(2), meter_id) {
                Some(reading) => readings.push(reading),
                None => debug!(row, "skipping export row without a valid reading"),
            }
        }
        readings
    }
}

impl ExportParser for XlsxExportParser {
    fn parse(&self, path: &Path, meter_id: &str) -> ParseResult<Vec<Reading>> {
        let mut workbook = open_workbook_auto(path).map_err(|source| ParseError::Workbook {
            source,
            path: path.to_path_buf(),
        })?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| ParseError::MissingSheet(path.to_path_buf()))?
            .map_err(|source| ParseError::Workbook {
                source,
                path: path.to_path_buf(),
            })?;
        let readings = self.parse_range(&range, meter_id);
        debug!(path = %path.display(), meter = meter_id, readings = readings.len(), "parsed export");
        Ok(readings)
    }
}

pub(crate) fn reading_from_cells(
    date: &Data,
    time: &Data,
    consumption: &Data,
    meter_id: &str,
) -> Option<Reading> {
    let day = cell_date(date)?;
    let clock = cell_time(time)?;
    let consumption = cell_number(consumption)?;
    if !consumption.is_finite() || consumption < 0.0 {
        return None;
    }
    let timestamp = Utc.from_utc_datetime(&day.and_time(clock));
    Some(Reading::new(timestamp, consumption, meter_id))
}

fn cell_date(cell: &Data) -> Option<NaiveDate> {
    match cell {
        Data::DateTime(value) => excel_serial(value.as_f64()).map(|dt| dt.date()),
        Data::Float(value) => excel_serial(*value).map(|dt| dt.date()),
        Data::Int(value) => excel_serial(*value as f64).map(|dt| dt.date()),
        Data::String(value) | Data::DateTimeIso(value) => {
            let value = value.trim();
            let value = value.split(['T', ' ']).next().unwrap_or(value);
            DATE_FORMATS
                .iter()
                .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
        }
        _ => None,
    }
}

fn cell_time(cell: &Data) -> Option<NaiveTime> {
    match cell {
        Data::DateTime(value) => excel_serial(value.as_f64()).map(|dt| dt.time()),
        Data::Float(value) => excel_serial(*value).map(|dt| dt.time()),
        Data::String(value) | Data::DurationIso(value) => {
            let value = value.trim();
            TIME_FORMATS
                .iter()
                .find_map(|format| NaiveTime::parse_from_str(value, format).ok())
        }
        _ => None,
    }
}

fn cell_number(cell: &Data) -> Option<f64> {
    match cell {
        Data::Float(value) => Some(*value),
        Data::Int(value) => Some(*value as f64),
        Data::String(value) => value.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

/// Converts a spreadsheet serial (days since 1899-12-30) to a naive
/// datetime, rounded to the second.
fn excel_serial(value: f64) -> Option<NaiveDateTime> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let base = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    let seconds = (value * SECONDS_PER_DAY).round() as i64;
    base.checked_add_signed(Duration::seconds(seconds))
}
