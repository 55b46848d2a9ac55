mod duck;
mod influx;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::ErsConfig;
use crate::readings::Reading;

pub use duck::DuckDbSink;
pub use influx::{parse_last_time, InfluxSettings, InfluxSink};

pub type SinkResult<T> = Result<T, SinkError>;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("{sink}: connection failed: {detail}")]
    Connection { sink: String, detail: String },
    #[error("{sink}: write rejected: {detail}")]
    Write { sink: String, detail: String },
    #[error("{sink}: watermark query failed: {detail}")]
    Query { sink: String, detail: String },
    #[error("{0}: used before connect")]
    NotConnected(String),
}

impl SinkError {
    pub fn connection(sink: &str, detail: impl fmt::Display) -> Self {
        SinkError::Connection {
            sink: sink.to_string(),
            detail: detail.to_string(),
        }
    }

    pub fn write(sink: &str, detail: impl fmt::Display) -> Self {
        SinkError::Write {
            sink: sink.to_string(),
            detail: detail.to_string(),
        }
    }

    pub fn query(sink: &str, detail: impl fmt::Display) -> Self {
        SinkError::Query {
            sink: sink.to_string(),
            detail: detail.to_string(),
        }
    }
}

/// A storage backend readings are synchronized into. The controller
/// connects before use and closes afterwards; nothing but the connection
/// handle is kept between calls.
#[async_trait]
pub trait Sink: Send {
    fn name(&self) -> &str;
    async fn connect(&mut self) -> SinkResult<()>;
    /// Persists the readings tagged with `meter_id`, returning how many
    /// points were written.
    async fn write(&mut self, readings: &[Reading], meter_id: &str) -> SinkResult<usize>;
    /// Newest persisted timestamp for the meter, or the sentinel epoch.
    async fn last_written(&mut self, meter_id: &str) -> SinkResult<DateTime<Utc>>;
    async fn close(&mut self) -> SinkResult<()>;
}

/// Builds a fresh adapter for each task.
pub trait SinkProvider: Send + Sync {
    fn create(&self) -> Box<dyn Sink>;
}

impl<F> SinkProvider for F
where
    F: Fn() -> Box<dyn Sink> + Send + Sync,
{
    fn create(&self) -> Box<dyn Sink> {
        self()
    }
}

#[derive(Clone, Default)]
pub struct SinkRegistry {
    providers: BTreeMap<String, Arc<dyn SinkProvider>>,
}

impl fmt::Debug for SinkRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkRegistry")
            .field("sinks", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every sink configured in `[sinks]`.
    pub fn from_config(config: &ErsConfig) -> Self {
        let section = &config.sinks;
        let mut registry = Self::new();
        if let Some(influx_section) = &section.influxdb {
            let settings = InfluxSettings::from_section(influx_section);
            registry.register(influx::SINK_NAME, move || -> Box<dyn Sink> {
                Box::new(InfluxSink::new(settings.clone()))
            });
        }
        if let Some(duck_section) = &section.duckdb {
            let path = config.resolve_path(&duck_section.path);
            let table = duck_section.table.clone();
            registry.register(duck::SINK_NAME, move || -> Box<dyn Sink> {
                Box::new(DuckDbSink::new(&path, &table))
            });
        }
        registry
    }

    pub fn register<P>(&mut self, name: impl Into<String>, provider: P)
    where
        P: SinkProvider + 'static,
    {
        self.providers.insert(name.into(), Arc::new(provider));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn Sink>> {
        self.providers.get(name).map(|provider| provider.create())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    const PORTAL: &str = r#"
        [portal]
        username = "123456789"
        meter_id = "PT0001"
    "#;

    #[test]
    fn registers_only_configured_sinks() {
        let config = parse_config(&format!(
            "{PORTAL}\n[sinks.duckdb]\npath = \"readings.duckdb\"\n"
        ))
        .unwrap();
        let registry = SinkRegistry::from_config(&config);
        assert_eq!(registry.names(), vec!["duckdb".to_string()]);
        assert!(registry.create("influxdb").is_none());
        assert_eq!(registry.create("duckdb").unwrap().name(), "duckdb");
    }

    #[test]
    fn names_are_sorted() {
        let config = parse_config(&format!(
            "{PORTAL}\n[sinks.influxdb]\norg = \"home\"\nbucket = \"energy\"\n\n[sinks.duckdb]\npath = \"readings.duckdb\"\n"
        ))
        .unwrap();
        let registry = SinkRegistry::from_config(&config);
        assert_eq!(registry.names(), vec!["duckdb", "influxdb"]);
        assert!(registry.contains("influxdb"));
    }

    #[test]
    fn closures_act_as_providers() {
        let mut registry = SinkRegistry::new();
        registry.register("scratch", || -> Box<dyn Sink> {
            Box::new(DuckDbSink::new(std::path::Path::new(":memory:"), "readings"))
        });
        assert_eq!(registry.create("scratch").unwrap().name(), "duckdb");
    }
}
