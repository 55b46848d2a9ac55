mod parser;
mod reconcile;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use parser::{ExportParser, ParseError, ParseResult, XlsxExportParser, HEADER_ROWS};
pub use reconcile::{reconcile, sentinel_epoch, SENTINEL_EPOCH_SECONDS};

/// One consumption sample from the portal export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub consumption: f64,
    pub meter_id: String,
}

impl Reading {
    pub fn new(timestamp: DateTime<Utc>, consumption: f64, meter_id: impl Into<String>) -> Self {
        Self {
            timestamp,
            consumption,
            meter_id: meter_id.into(),
        }
    }
}
