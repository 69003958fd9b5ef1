//! Parsing of Chicago open-data 311 exports into `ServiceRequest` records.

use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::ServiceRequest;

const TIMESTAMP_FORMATS: [&str; 3] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%m/%d/%Y %I:%M:%S %p",
];

#[derive(Debug, Deserialize)]
pub struct CsvRow {
    #[serde(alias = "SR_NUMBER")]
    sr_number: Option<String>,
    #[serde(alias = "SR_TYPE", alias = "category")]
    sr_type: Option<String>,
    #[serde(alias = "STATUS")]
    status: Option<String>,
    #[serde(alias = "CREATED_DATE")]
    created_date: Option<String>,
    #[serde(alias = "CLOSED_DATE")]
    closed_date: Option<String>,
    #[serde(alias = "WARD")]
    ward: Option<String>,
    #[serde(alias = "COMMUNITY_AREA")]
    community_area: Option<String>,
    #[serde(alias = "LATITUDE")]
    latitude: Option<String>,
    #[serde(alias = "LONGITUDE")]
    longitude: Option<String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum RowError {
    #[error("missing {0}")]
    Missing(&'static str),

    #[error("malformed {field}: '{value}'")]
    Malformed { field: &'static str, value: String },

    #[error("closed before created")]
    ClosedBeforeCreated,
}

#[derive(Debug, Default)]
pub struct ParsedExport {
    pub requests: Vec<ServiceRequest>,
    pub skipped: usize,
}

pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

fn present(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(value: Option<String>, field: &'static str) -> Result<String, RowError> {
    present(value).ok_or(RowError::Missing(field))
}

fn number(value: Option<String>, field: &'static str) -> Result<f64, RowError> {
    let raw = required(value, field)?;
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or(RowError::Malformed { field, value: raw })
}

/// Integer fields arrive as `12` or, from dataframe exports, `12.0`.
fn integer(value: Option<String>, field: &'static str) -> Result<i32, RowError> {
    let parsed = number(value, field)?;
    if parsed.fract() != 0.0 {
        return Err(RowError::Malformed {
            field,
            value: parsed.to_string(),
        });
    }
    Ok(parsed as i32)
}

fn timestamp(value: String, field: &'static str) -> Result<NaiveDateTime, RowError> {
    parse_timestamp(&value).ok_or(RowError::Malformed { field, value })
}

impl TryFrom<CsvRow> for ServiceRequest {
    type Error = RowError;

    fn try_from(row: CsvRow) -> Result<Self, Self::Error> {
        let created_at = timestamp(required(row.created_date, "created_date")?, "created_date")?;
        let closed_at = present(row.closed_date)
            .map(|raw| timestamp(raw, "closed_date"))
            .transpose()?;
        if matches!(closed_at, Some(closed) if closed < created_at) {
            return Err(RowError::ClosedBeforeCreated);
        }

        let status = present(row.status).unwrap_or_else(|| {
            if closed_at.is_some() { "Completed" } else { "Open" }.to_string()
        });

        Ok(ServiceRequest {
            sr_number: required(row.sr_number, "sr_number")?,
            category: required(row.sr_type, "sr_type")?,
            status,
            created_at,
            closed_at,
            ward: integer(row.ward, "ward")?,
            community_area: integer(row.community_area, "community_area")?,
            latitude: number(row.latitude, "latitude")?,
            longitude: number(row.longitude, "longitude")?,
        })
    }
}

/// Rows that cannot become a complete request are skipped and counted.
pub fn read_export(csv_path: &Path) -> anyhow::Result<ParsedExport> {
    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut parsed = ParsedExport::default();

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        match ServiceRequest::try_from(result?) {
            Ok(request) => parsed.requests.push(request),
            Err(err) => {
                debug!(line = line + 2, %err, "skipping row");
                parsed.skipped += 1;
            }
        }
    }

    if parsed.skipped > 0 {
        warn!(
            skipped = parsed.skipped,
            kept = parsed.requests.len(),
            path = %csv_path.display(),
            "skipped incomplete rows"
        );
    }
    Ok(parsed)
}
