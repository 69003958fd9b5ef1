use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AnalyticsError;

pub const SECONDS_PER_DAY: f64 = 86_400.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub sr_number: String,
    pub category: String,
    pub status: String,
    pub created_at: NaiveDateTime,
    pub closed_at: Option<NaiveDateTime>,
    pub ward: i32,
    pub community_area: i32,
    pub latitude: f64,
    pub longitude: f64,
}

impl ServiceRequest {
    /// Fractional days between creation and closure, if closed.
    pub fn days_to_close(&self) -> Option<f64> {
        self.closed_at
            .map(|closed| (closed - self.created_at).num_seconds() as f64 / SECONDS_PER_DAY)
    }

    /// Whether the request was still unresolved at `at`.
    pub fn is_open_at(&self, at: NaiveDateTime) -> bool {
        match self.closed_at {
            Some(closed) => closed > at,
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureSnapshot {
    pub sr_number: String,
    pub as_of: NaiveDateTime,
    pub created_at: NaiveDateTime,
    pub category: String,
    pub category_code: usize,
    pub ward: i32,
    pub backlog_7d: usize,
    pub backlog_30d: usize,
    pub median_close_30d: Option<f64>,
    pub median_close_90d: Option<f64>,
    pub closed_count_90d: usize,
    pub day_of_week: u32,
    pub month: u32,
    pub is_weekend: bool,
    pub is_holiday: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub eta_date: NaiveDate,
    pub eta_days: f64,
    pub ci_low: f64,
    pub ci_high: f64,
    pub confidence: f64,
    pub top_factors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestStatus {
    pub sr_number: String,
    pub status: String,
    pub category: String,
    pub created_date: NaiveDate,
    pub closed_date: Option<NaiveDate>,
    pub ward: i32,
    pub lat: f64,
    pub lon: f64,
}

impl From<&ServiceRequest> for RequestStatus {
    fn from(request: &ServiceRequest) -> Self {
        Self {
            sr_number: request.sr_number.clone(),
            status: request.status.clone(),
            category: request.category.clone(),
            created_date: request.created_at.date(),
            closed_date: request.closed_at.map(|closed| closed.date()),
            ward: request.ward,
            lat: request.latitude,
            lon: request.longitude,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AreaType {
    Ward,
    Community,
}

impl AreaType {
    pub fn label(self) -> &'static str {
        match self {
            AreaType::Ward => "Ward",
            AreaType::Community => "Community Area",
        }
    }

    pub fn max_id(self) -> i32 {
        match self {
            AreaType::Ward => 50,
            AreaType::Community => 77,
        }
    }

    pub fn area_of(self, request: &ServiceRequest) -> i32 {
        match self {
            AreaType::Ward => request.ward,
            AreaType::Community => request.community_area,
        }
    }
}

impl FromStr for AreaType {
    type Err = AnalyticsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ward" => Ok(AreaType::Ward),
            "community" | "community_area" | "community area" => Ok(AreaType::Community),
            _ => Err(AnalyticsError::InvalidAreaType(value.to_string())),
        }
    }
}

impl fmt::Display for AreaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AreaType::Ward => f.write_str("ward"),
            AreaType::Community => f.write_str("community"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityResult {
    pub area_name: String,
    pub area_type: AreaType,
    pub category: Option<String>,
    pub area_median: f64,
    pub city_median: f64,
    pub delta_days: f64,
    pub n: usize,
    pub significance: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hotspot {
    pub center: GeoPoint,
    pub count: usize,
    pub trend_7d: f64,
    pub trend_30d: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshMeta {
    pub data_last_updated: DateTime<Utc>,
    pub model_version: String,
    pub feature_version: String,
}
