use chrono::{DateTime, TimeZone, Utc};

use super::Reading;

/// `1989-05-11T00:00:00+01:00`, the "no prior data" watermark.
pub const SENTINEL_EPOCH_SECONDS: i64 = 610_844_400;

pub fn sentinel_epoch() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(SENTINEL_EPOCH_SECONDS, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Keeps the readings strictly newer than `watermark`. Both sides are
/// compared as absolute instants, whatever offset the watermark carries.
pub fn reconcile<Tz: TimeZone>(records: &[Reading], watermark: &DateTime<Tz>) -> Vec<Reading> {
    let watermark = watermark.with_timezone(&Utc);
    records
        .iter()
        .filter(|reading| reading.timestamp > watermark)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, FixedOffset};

    fn series(start: DateTime<Utc>, count: usize) -> Vec<Reading> {
        (0..count)
            .map(|idx| {
                Reading::new(
                    start + Duration::minutes(15 * idx as i64),
                    0.1 * idx as f64,
                    "PT0001",
                )
            })
            .collect()
    }

    #[test]
    fn sentinel_matches_portal_epoch() {
        let expected = FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(1989, 5, 11, 0, 0, 0)
            .unwrap();
        assert_eq!(sentinel_epoch(), expected.with_timezone(&Utc));
    }

    #[test]
    fn sentinel_watermark_keeps_everything() {
        let records = series(Utc.with_ymd_and_hms(2023, 3, 1, 0, 0, 0).unwrap(), 96);
        assert_eq!(reconcile(&records, &sentinel_epoch()), records);
    }

    #[test]
    fn watermark_is_exclusive() {
        let start = Utc.with_ymd_and_hms(2023, 3, 1, 0, 0, 0).unwrap();
        let records = series(start, 8);
        let watermark = records[3].timestamp;
        let kept = reconcile(&records, &watermark);
        assert_eq!(kept.len(), 4);
        assert!(kept.iter().all(|reading| reading.timestamp > watermark));
        assert_eq!(kept[0], records[4]);
    }

    #[test]
    fn offsets_are_compared_in_utc() {
        let start = Utc.with_ymd_and_hms(2023, 7, 1, 10, 0, 0).unwrap();
        let records = series(start, 4);
        // 11:15 at +01:00 is 10:15Z, the second reading.
        let watermark = FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2023, 7, 1, 11, 15, 0)
            .unwrap();
        let kept = reconcile(&records, &watermark);
        assert_eq!(kept, records[2..].to_vec());
    }

    #[test]
    fn later_watermark_yields_nothing() {
        let records = series(Utc.with_ymd_and_hms(2023, 3, 1, 0, 0, 0).unwrap(), 4);
        let watermark = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(reconcile(&records, &watermark).is_empty());
        assert!(reconcile(&[], &watermark).is_empty());
    }
}
