//! Capability contract consumed by the resident agent.
//!
//! `AgentTools` is the only surface through which consumers reach the
//! pipeline. Every operation is a pure read; failures are normalized to
//! `ToolError` before they leave this module.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::analytics::{parse_area, AnalyticsConfig, AnalyticsEngine, SignificancePolicy};
use crate::error::{AnalyticsError, FeatureError, PredictorError};
use crate::features::FeatureEngine;
use crate::meta::RefreshMetaCell;
use crate::models::{AreaType, EquityResult, Hotspot, Prediction, RefreshMeta, RequestStatus};
use crate::predictor::{validate_prediction, Predictor};
use crate::store::SharedStore;

pub const DEFAULT_AREA_TYPE: &str = "ward";
pub const DEFAULT_HOTSPOT_DAYS: i64 = 30;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A collaborator returned an invalid or unreachable result
    #[error("upstream failure: {0}")]
    UpstreamFailure(String),
}

pub type ToolResult<T> = Result<T, ToolError>;

impl From<FeatureError> for ToolError {
    fn from(err: FeatureError) -> Self {
        match err {
            FeatureError::NotFound(id) => ToolError::NotFound(id),
            err @ FeatureError::InvalidTimestamp { .. } => ToolError::InvalidArgument(err.to_string()),
        }
    }
}

impl From<AnalyticsError> for ToolError {
    fn from(err: AnalyticsError) -> Self {
        match err {
            err @ AnalyticsError::EmptyGroup(_) => ToolError::NotFound(err.to_string()),
            other => ToolError::InvalidArgument(other.to_string()),
        }
    }
}

impl From<PredictorError> for ToolError {
    fn from(err: PredictorError) -> Self {
        ToolError::UpstreamFailure(err.to_string())
    }
}

pub trait AgentTools: Send + Sync {
    fn get_request_status(&self, sr_number: &str) -> ToolResult<RequestStatus>;

    fn predict_eta(&self, sr_number: &str) -> ToolResult<Prediction>;

    fn area_equity(
        &self,
        area_name: &str,
        area_type: &str,
        category: Option<&str>,
    ) -> ToolResult<EquityResult>;

    fn hotspots(&self, category: &str, days: i64) -> ToolResult<Vec<Hotspot>>;

    fn refresh_meta(&self) -> ToolResult<RefreshMeta>;
}

fn parse_area_type(area_type: &str) -> ToolResult<AreaType> {
    Ok(area_type.parse::<AreaType>()?)
}

/// Backed by the request store, feature engine, predictor and analytics.
pub struct LiveTools {
    store: Arc<SharedStore>,
    predictor: Arc<dyn Predictor>,
    policy: Arc<dyn SignificancePolicy>,
    analytics: AnalyticsConfig,
    meta: Arc<RefreshMetaCell>,
}

impl LiveTools {
    pub fn new(
        store: Arc<SharedStore>,
        predictor: Arc<dyn Predictor>,
        policy: Arc<dyn SignificancePolicy>,
        analytics: AnalyticsConfig,
        meta: Arc<RefreshMetaCell>,
    ) -> Self {
        Self {
            store,
            predictor,
            policy,
            analytics,
            meta,
        }
    }

    fn analytics(&self) -> AnalyticsEngine {
        AnalyticsEngine::new(
            self.store.snapshot(),
            Arc::clone(&self.policy),
            self.analytics.clone(),
        )
    }
}

impl AgentTools for LiveTools {
    fn get_request_status(&self, sr_number: &str) -> ToolResult<RequestStatus> {
        let store = self.store.snapshot();
        store
            .get(sr_number)
            .map(RequestStatus::from)
            .ok_or_else(|| ToolError::NotFound(sr_number.to_string()))
    }

    fn predict_eta(&self, sr_number: &str) -> ToolResult<Prediction> {
        let store = self.store.snapshot();
        let created_at = store
            .get(sr_number)
            .map(|r| r.created_at)
            .ok_or_else(|| ToolError::NotFound(sr_number.to_string()))?;

        let snapshot = FeatureEngine::new(store).compute(sr_number, created_at)?;
        let prediction = self.predictor.predict(&snapshot)?;
        if let Err(breach) = validate_prediction(&prediction) {
            warn!(
                sr_number,
                model_version = self.predictor.model_version(),
                %breach,
                "rejected prediction"
            );
            return Err(breach.into());
        }

        debug!(sr_number, eta_days = prediction.eta_days, "predicted eta");
        Ok(prediction)
    }

    fn area_equity(
        &self,
        area_name: &str,
        area_type: &str,
        category: Option<&str>,
    ) -> ToolResult<EquityResult> {
        let area_type = parse_area_type(area_type)?;
        Ok(self.analytics().area_equity(area_name, area_type, category)?)
    }

    fn hotspots(&self, category: &str, days: i64) -> ToolResult<Vec<Hotspot>> {
        Ok(self.analytics().hotspots(category, days)?.collect())
    }

    fn refresh_meta(&self) -> ToolResult<RefreshMeta> {
        Ok(self.meta.current().as_ref().clone())
    }
}

/// Fixed fixtures, loadable from JSON, for offline runs and tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureTools {
    #[serde(default)]
    pub statuses: HashMap<String, RequestStatus>,
    #[serde(default)]
    pub predictions: HashMap<String, Prediction>,
    #[serde(default)]
    pub equity: Vec<EquityResult>,
    #[serde(default)]
    pub hotspots: HashMap<String, Vec<Hotspot>>,
    pub meta: Option<RefreshMeta>,
}

impl FixtureTools {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading fixtures {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing fixtures {}", path.display()))
    }
}

impl AgentTools for FixtureTools {
    fn get_request_status(&self, sr_number: &str) -> ToolResult<RequestStatus> {
        self.statuses
            .get(sr_number)
            .cloned()
            .ok_or_else(|| ToolError::NotFound(sr_number.to_string()))
    }

    fn predict_eta(&self, sr_number: &str) -> ToolResult<Prediction> {
        if !self.statuses.contains_key(sr_number) {
            return Err(ToolError::NotFound(sr_number.to_string()));
        }
        let prediction = self
            .predictions
            .get(sr_number)
            .cloned()
            .ok_or_else(|| ToolError::UpstreamFailure(format!("no prediction for {sr_number}")))?;
        validate_prediction(&prediction)?;
        Ok(prediction)
    }

    fn area_equity(
        &self,
        area_name: &str,
        area_type: &str,
        category: Option<&str>,
    ) -> ToolResult<EquityResult> {
        let area_type = parse_area_type(area_type)?;
        let area = parse_area(area_name, area_type)?;
        self.equity
            .iter()
            .find(|e| {
                e.area_type == area_type
                    && parse_area(&e.area_name, e.area_type).ok() == Some(area)
                    && e.category.as_deref() == category
            })
            .cloned()
            .ok_or_else(|| ToolError::NotFound(format!("{} {area}", area_type.label())))
    }

    fn hotspots(&self, category: &str, days: i64) -> ToolResult<Vec<Hotspot>> {
        if !(1..=crate::analytics::MAX_HOTSPOT_DAYS).contains(&days) {
            return Err(ToolError::InvalidArgument(format!("invalid window of {days} days")));
        }
        self.hotspots
            .get(category)
            .cloned()
            .ok_or_else(|| ToolError::InvalidArgument(format!("invalid category '{category}'")))
    }

    fn refresh_meta(&self) -> ToolResult<RefreshMeta> {
        self.meta
            .clone()
            .ok_or_else(|| ToolError::UpstreamFailure("refresh metadata unavailable".into()))
    }
}
