use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use tracing::{debug, info};

use crate::config::InfluxSection;
use crate::readings::{sentinel_epoch, Reading};

use super::{Sink, SinkError, SinkResult};

pub(super) const SINK_NAME: &str = "influxdb";
const TAG_KEY: &str = "cpe";
const FIELD_KEY: &str = "consumption";
const QUERY_RANGE_START: &str = "1989-05-11T01:10:00Z";

#[derive(Clone)]
pub struct InfluxSettings {
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: String,
    pub measurement: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for InfluxSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfluxSettings")
            .field("url", &self.url)
            .field("org", &self.org)
            .field("bucket", &self.bucket)
            .field("measurement", &self.measurement)
            .finish_non_exhaustive()
    }
}

impl InfluxSettings {
    pub fn from_section(section: &InfluxSection) -> Self {
        Self {
            url: format!("{}:{}", section.host.trim_end_matches('/'), section.port),
            org: section.org.clone(),
            bucket: section.bucket.clone(),
            token: section.token.clone(),
            measurement: section.measurement.clone(),
            timeout: Duration::from_secs(section.timeout_seconds),
        }
    }
}

/// Time-series sink speaking the InfluxDB v2 HTTP API.
#[derive(Debug)]
pub struct InfluxSink {
    settings: InfluxSettings,
    client: Option<Client>,
}

impl InfluxSink {
    pub fn new(settings: InfluxSettings) -> Self {
        Self {
            settings,
            client: None,
        }
    }

    fn client(&self) -> SinkResult<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| SinkError::NotConnected(SINK_NAME.to_string()))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.settings.url.trim_end_matches('/'), path)
    }

    fn auth_header(&self) -> String {
        format!("Token {}", self.settings.token)
    }

    pub fn line_protocol(&self, readings: &[Reading], meter_id: &str) -> String {
        let measurement = escape_measurement(&self.settings.measurement);
        let tag = escape_tag(meter_id);
        readings
            .iter()
            .map(|reading| {
                format!(
                    "{measurement},{TAG_KEY}={tag} {FIELD_KEY}={} {}",
                    reading.consumption,
                    reading.timestamp.timestamp()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn last_point_query(&self, meter_id: &str) -> String {
        format!(
            "from(bucket: \"{bucket}\")\n  |> range(start: {QUERY_RANGE_START}, stop: now())\n  |> filter(fn: (r) => r[\"_measurement\"] == \"{measurement}\")\n  |> filter(fn: (r) => r[\"_field\"] == \"{FIELD_KEY}\")\n  |> filter(fn: (r) => r[\"{TAG_KEY}\"] == \"{meter}\")\n  |> last()",
            bucket = flux_string(&self.settings.bucket),
            measurement = flux_string(&self.settings.measurement),
            meter = flux_string(meter_id),
        )
    }
}

#[async_trait]
impl Sink for InfluxSink {
    fn name(&self) -> &str {
        SINK_NAME
    }

    async fn connect(&mut self) -> SinkResult<()> {
        let client = Client::builder()
            .timeout(self.settings.timeout)
            .build()
            .map_err(|err| SinkError::connection(SINK_NAME, err))?;
        let response = client
            .get(self.endpoint("/health"))
            .send()
            .await
            .map_err(|err| SinkError::connection(SINK_NAME, err))?;
        if !response.status().is_success() {
            return Err(SinkError::connection(
                SINK_NAME,
                format!("health check returned {}", response.status()),
            ));
        }
        info!(url = %self.settings.url, bucket = %self.settings.bucket, "Connected to InfluxDB");
        self.client = Some(client);
        Ok(())
    }

    async fn write(&mut self, readings: &[Reading], meter_id: &str) -> SinkResult<usize> {
        let client = self.client()?;
        if readings.is_empty() {
            return Ok(0);
        }
        let body = self.line_protocol(readings, meter_id);
        let response = client
            .post(self.endpoint("/api/v2/write"))
            .query(&[
                ("org", self.settings.org.as_str()),
                ("bucket", self.settings.bucket.as_str()),
                ("precision", "s"),
            ])
            .header(AUTHORIZATION, self.auth_header())
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(|err| SinkError::write(SINK_NAME, err))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SinkError::write(SINK_NAME, format!("{status}: {detail}")));
        }
        debug!(meter = meter_id, points = readings.len(), "InfluxDB write accepted");
        Ok(readings.len())
    }

    async fn last_written(&mut self, meter_id: &str) -> SinkResult<DateTime<Utc>> {
        let client = self.client()?;
        let response = client
            .post(self.endpoint("/api/v2/query"))
            .query(&[("org", self.settings.org.as_str())])
            .header(AUTHORIZATION, self.auth_header())
            .header(ACCEPT, "application/csv")
            .header(CONTENT_TYPE, "application/vnd.flux")
            .body(self.last_point_query(meter_id))
            .send()
            .await
            .map_err(|err| SinkError::query(SINK_NAME, err))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| SinkError::query(SINK_NAME, err))?;
        if !status.is_success() {
            return Err(SinkError::query(SINK_NAME, format!("{status}: {body}")));
        }
        Ok(parse_last_time(&body)?.unwrap_or_else(sentinel_epoch))
    }

    async fn close(&mut self) -> SinkResult<()> {
        self.client = None;
        Ok(())
    }
}

/// Extracts the newest `_time` from a Flux CSV response. Annotation rows
/// (`#...`) are skipped; each blank line starts a new table with its own
/// header row.
pub fn parse_last_time(csv: &str) -> SinkResult<Option<DateTime<Utc>>> {
    let mut latest: Option<DateTime<Utc>> = None;
    let mut time_column: Option<usize> = None;
    for line in csv.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            time_column = None;
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        let cells: Vec<&str> = line.split(',').collect();
        match time_column {
            None => time_column = cells.iter().position(|cell| *cell == "_time"),
            Some(index) => {
                let Some(raw) = cells.get(index) else {
                    continue;
                };
                let parsed = DateTime::parse_from_rfc3339(raw)
                    .map_err(|err| SinkError::query(SINK_NAME, format!("bad _time {raw}: {err}")))?
                    .with_timezone(&Utc);
                latest = Some(latest.map_or(parsed, |current| current.max(parsed)));
            }
        }
    }
    Ok(latest)
}

fn escape_measurement(value: &str) -> String {
    value.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_tag(value: &str) -> String {
    value
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

fn flux_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
