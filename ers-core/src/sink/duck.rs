use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use duckdb::{params, Connection};
use tracing::info;

use crate::readings::{sentinel_epoch, Reading};

use super::{Sink, SinkError, SinkResult};

pub(super) const SINK_NAME: &str = "duckdb";

/// Embedded analytical sink. Points are keyed by `(meter_id, ts_epoch)` so
/// repeated full-mode writes overwrite rather than duplicate.
#[derive(Debug)]
pub struct DuckDbSink {
    path: PathBuf,
    table: String,
    conn: Option<Arc<Mutex<Connection>>>,
}

impl DuckDbSink {
    pub fn new(path: &Path, table: &str) -> Self {
        Self {
            path: path.to_path_buf(),
            table: table.to_string(),
            conn: None,
        }
    }

    fn handle(&self) -> SinkResult<Arc<Mutex<Connection>>> {
        self.conn
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| SinkError::NotConnected(SINK_NAME.to_string()))
    }
}

fn valid_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        && !value.starts_with(|ch: char| ch.is_ascii_digit())
}

fn schema(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            meter_id VARCHAR NOT NULL,
            ts_epoch BIGINT NOT NULL,
            ts VARCHAR NOT NULL,
            consumption DOUBLE NOT NULL,
            PRIMARY KEY (meter_id, ts_epoch)
        );"
    )
}

async fn blocking<T, F>(handle: Arc<Mutex<Connection>>, op: F) -> Result<T, String>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> duckdb::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut guard = handle
            .lock()
            .map_err(|_| "duckdb connection lock poisoned".to_string())?;
        op(&mut guard).map_err(|err| err.to_string())
    })
    .await
    .map_err(|err| err.to_string())?
}

#[async_trait]
impl Sink for DuckDbSink {
    fn name(&self) -> &str {
        SINK_NAME
    }

    async fn connect(&mut self) -> SinkResult<()> {
        if !valid_identifier(&self.table) {
            return Err(SinkError::connection(
                SINK_NAME,
                format!("invalid table name `{}`", self.table),
            ));
        }
        let path = self.path.clone();
        let ddl = schema(&self.table);
        let conn = tokio::task::spawn_blocking(move || -> duckdb::Result<Connection> {
            let conn = Connection::open(&path)?;
            conn.execute_batch(&ddl)?;
            Ok(conn)
        })
        .await
        .map_err(|err| SinkError::connection(SINK_NAME, err))?
        .map_err(|err| SinkError::connection(SINK_NAME, err))?;
        info!(path = %self.path.display(), table = %self.table, "Opened DuckDB sink");
        self.conn = Some(Arc::new(Mutex::new(conn)));
        Ok(())
    }

    async fn write(&mut self, readings: &[Reading], meter_id: &str) -> SinkResult<usize> {
        let handle = self.handle()?;
        if readings.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "INSERT OR REPLACE INTO {} (meter_id, ts_epoch, ts, consumption) VALUES (?, ?, ?, ?)",
            self.table
        );
        // one row per second; a repeated timestamp keeps its last reading
        let rows: BTreeMap<i64, (String, f64)> = readings
            .iter()
            .map(|reading| {
                (
                    reading.timestamp.timestamp(),
                    (
                        reading
                            .timestamp
                            .to_rfc3339_opts(SecondsFormat::Secs, true),
                        reading.consumption,
                    ),
                )
            })
            .collect();
        let meter = meter_id.to_string();
        blocking(handle, move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(&sql)?;
                for (epoch, (ts, consumption)) in &rows {
                    stmt.execute(params![meter, epoch, ts, consumption])?;
                }
            }
            tx.commit()?;
            Ok(rows.len())
        })
        .await
        .map_err(|err| SinkError::write(SINK_NAME, err))
    }

    async fn last_written(&mut self, meter_id: &str) -> SinkResult<DateTime<Utc>> {
        let handle = self.handle()?;
        let sql = format!(
            "SELECT max(ts_epoch) FROM {} WHERE meter_id = ?",
            self.table
        );
        let meter = meter_id.to_string();
        let latest = blocking(handle, move |conn| {
            conn.query_row(&sql, params![meter], |row| row.get::<_, Option<i64>>(0))
        })
        .await
        .map_err(|err| SinkError::query(SINK_NAME, err))?;
        Ok(latest
            .and_then(|epoch| DateTime::<Utc>::from_timestamp(epoch, 0))
            .unwrap_or_else(sentinel_epoch))
    }

    async fn close(&mut self) -> SinkResult<()> {
        self.conn = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn readings(hours: &[u32]) -> Vec<Reading> {
        hours
            .iter()
            .map(|hour| {
                Reading::new(
                    Utc.with_ymd_and_hms(2023, 3, 15, *hour, 0, 0).unwrap(),
                    *hour as f64 * 0.1,
                    "PT01",
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn empty_table_reports_sentinel() {
        let dir = tempdir().unwrap();
        let mut sink = DuckDbSink::new(&dir.path().join("readings.duckdb"), "readings");
        sink.connect().await.unwrap();
        assert_eq!(sink.last_written("PT01").await.unwrap(), sentinel_epoch());
    }

    #[tokio::test]
    async fn watermark_tracks_latest_write_per_meter() {
        let dir = tempdir().unwrap();
        let mut sink = DuckDbSink::new(&dir.path().join("readings.duckdb"), "readings");
        sink.connect().await.unwrap();
        assert_eq!(sink.write(&readings(&[1, 2, 3]), "PT01").await.unwrap(), 3);
        assert_eq!(
            sink.last_written("PT01").await.unwrap(),
            Utc.with_ymd_and_hms(2023, 3, 15, 3, 0, 0).unwrap()
        );
        assert_eq!(sink.last_written("PT02").await.unwrap(), sentinel_epoch());
        sink.close().await.unwrap();
    }

    #[tokio::test]
    async fn rewriting_same_points_does_not_duplicate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("readings.duckdb");
        let mut sink = DuckDbSink::new(&path, "readings");
        sink.connect().await.unwrap();
        sink.write(&readings(&[1, 2]), "PT01").await.unwrap();
        sink.write(&readings(&[2, 3]), "PT01").await.unwrap();
        sink.close().await.unwrap();

        let conn = Connection::open(&path).unwrap();
        let count: i64 = conn
            .query_row("SELECT count(*) FROM readings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn repeated_timestamps_count_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("readings.duckdb");
        let mut sink = DuckDbSink::new(&path, "readings");
        sink.connect().await.unwrap();
        let mut batch = readings(&[1, 2]);
        let mut repeated = batch[1].clone();
        repeated.consumption = 0.9;
        batch.push(repeated);

        assert_eq!(sink.write(&batch, "PT01").await.unwrap(), 2);
        sink.close().await.unwrap();

        let conn = Connection::open(&path).unwrap();
        let (count, latest): (i64, f64) = conn
            .query_row(
                "SELECT count(*), max(consumption) FROM readings",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 2);
        assert!((latest - 0.9).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn rejects_unsafe_table_name() {
        let dir = tempdir().unwrap();
        let mut sink = DuckDbSink::new(&dir.path().join("x.duckdb"), "readings; DROP");
        let err = sink.connect().await.unwrap_err();
        assert!(matches!(err, SinkError::Connection { .. }));
    }

    #[tokio::test]
    async fn write_before_connect_fails() {
        let mut sink = DuckDbSink::new(Path::new("unused.duckdb"), "readings");
        let err = sink.write(&readings(&[1]), "PT01").await.unwrap_err();
        assert!(matches!(err, SinkError::NotConnected(_)));
    }
}
