use std::str::FromStr;

use anyhow::Context;
use chrono::{DateTime, Utc};

use crate::analytics::{AnalyticsConfig, ZScorePolicy, MAX_HOTSPOT_DAYS};
use crate::features::FEATURE_VERSION;
use crate::models::RefreshMeta;

pub const DEFAULT_MODEL_VERSION: &str = "baseline-v1";
pub const MAX_EQUITY_WINDOW_DAYS: i64 = MAX_HOTSPOT_DAYS * 10;

#[derive(Debug, Clone)]
pub struct Config {
    pub model_version: String,
    pub significance: ZScorePolicy,
    pub analytics: AnalyticsConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = AnalyticsConfig::default();
        let policy = ZScorePolicy::default();

        let config = Self {
            model_version: lookup("CHI311_MODEL_VERSION")
                .unwrap_or_else(|| DEFAULT_MODEL_VERSION.to_string()),
            significance: ZScorePolicy {
                min_sample: parse_or(&lookup, "CHI311_EQUITY_MIN_SAMPLE", policy.min_sample)?,
                z_critical: parse_or(&lookup, "CHI311_EQUITY_Z_CRITICAL", policy.z_critical)?,
            },
            analytics: AnalyticsConfig {
                equity_window_days: parse_or(
                    &lookup,
                    "CHI311_EQUITY_WINDOW_DAYS",
                    defaults.equity_window_days,
                )?,
                hotspot_cell_deg: parse_or(
                    &lookup,
                    "CHI311_HOTSPOT_CELL_DEG",
                    defaults.hotspot_cell_deg,
                )?,
                hotspot_min_count: parse_or(
                    &lookup,
                    "CHI311_HOTSPOT_MIN_COUNT",
                    defaults.hotspot_min_count,
                )?,
            },
        };

        anyhow::ensure!(
            config.analytics.hotspot_cell_deg > 0.0,
            "CHI311_HOTSPOT_CELL_DEG must be positive"
        );
        anyhow::ensure!(
            (1..=MAX_EQUITY_WINDOW_DAYS).contains(&config.analytics.equity_window_days),
            "CHI311_EQUITY_WINDOW_DAYS must be between 1 and {MAX_EQUITY_WINDOW_DAYS}"
        );
        anyhow::ensure!(
            config.significance.z_critical.is_finite() && config.significance.z_critical > 0.0,
            "CHI311_EQUITY_Z_CRITICAL must be positive"
        );
        Ok(config)
    }

    /// Refresh metadata for data current as of `data_last_updated`, tagged
    /// with the configured model and this build's feature definitions.
    pub fn refresh_meta(&self, data_last_updated: DateTime<Utc>) -> RefreshMeta {
        RefreshMeta {
            data_last_updated,
            model_version: self.model_version.clone(),
            feature_version: FEATURE_VERSION.to_string(),
        }
    }
}

pub fn database_url() -> anyhow::Result<String> {
    std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has invalid value '{raw}'")),
        None => Ok(default),
    }
}
