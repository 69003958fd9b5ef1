//! Point-in-time feature snapshots.
//!
//! Every aggregate is computed from records created at or before `as_of`.
//! The featurized request never contributes to its own aggregates, and
//! closures are only visible once they have happened (`closed_at <= as_of`).

use std::sync::Arc;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Weekday};
use tracing::debug;

use crate::error::FeatureError;
use crate::models::{FeatureSnapshot, ServiceRequest};
use crate::stats;
use crate::store::RequestStore;

pub const FEATURE_VERSION: &str = "features-v1";

pub const KNOWN_CATEGORIES: [&str; 3] = [
    "Pothole in Street",
    "Street Lights - All/Out",
    "Sanitation Code Violation",
];

pub const BACKLOG_SHORT_DAYS: i64 = 7;
pub const BACKLOG_LONG_DAYS: i64 = 30;
pub const RESOLUTION_SHORT_DAYS: i64 = 30;
pub const RESOLUTION_LONG_DAYS: i64 = 90;

/// Raw identifiers of snapshot fields; never valid as user-facing labels.
pub const FEATURE_NAMES: [&str; 11] = [
    "category_code",
    "ward",
    "backlog_7d",
    "backlog_30d",
    "median_close_30d",
    "median_close_90d",
    "closed_count_90d",
    "day_of_week",
    "month",
    "is_weekend",
    "is_holiday",
];

/// Index into `KNOWN_CATEGORIES`, or its length for any other category.
pub fn encode_category(category: &str) -> usize {
    KNOWN_CATEGORIES
        .iter()
        .position(|known| *known == category)
        .unwrap_or(KNOWN_CATEGORIES.len())
}

/// Closed window `[as_of - days, as_of]`.
fn in_window(at: NaiveDateTime, as_of: NaiveDateTime, days: i64) -> bool {
    at >= as_of - Duration::days(days) && at <= as_of
}

pub struct FeatureEngine {
    store: Arc<RequestStore>,
}

impl FeatureEngine {
    pub fn new(store: Arc<RequestStore>) -> Self {
        Self { store }
    }

    pub fn compute(
        &self,
        sr_number: &str,
        as_of: NaiveDateTime,
    ) -> Result<FeatureSnapshot, FeatureError> {
        let request = self
            .store
            .get(sr_number)
            .ok_or_else(|| FeatureError::NotFound(sr_number.to_string()))?;

        if as_of < request.created_at {
            return Err(FeatureError::InvalidTimestamp {
                sr_number: sr_number.to_string(),
                as_of,
                created_at: request.created_at,
            });
        }

        let peers: Vec<&ServiceRequest> = self
            .store
            .peers(&request.category, request.ward, as_of)
            .filter(|peer| peer.sr_number != request.sr_number)
            .collect();

        let backlog = |days: i64| {
            peers
                .iter()
                .filter(|peer| in_window(peer.created_at, as_of, days) && peer.is_open_at(as_of))
                .count()
        };

        let closed_within = |days: i64| -> Vec<f64> {
            peers
                .iter()
                .filter(|peer| matches!(peer.closed_at, Some(closed) if in_window(closed, as_of, days)))
                .filter_map(|peer| peer.days_to_close())
                .collect()
        };

        let recent = closed_within(RESOLUTION_SHORT_DAYS);
        let longer = closed_within(RESOLUTION_LONG_DAYS);
        let reported = request.created_at.date();

        let snapshot = FeatureSnapshot {
            sr_number: request.sr_number.clone(),
            as_of,
            created_at: request.created_at,
            category: request.category.clone(),
            category_code: encode_category(&request.category),
            ward: request.ward,
            backlog_7d: backlog(BACKLOG_SHORT_DAYS),
            backlog_30d: backlog(BACKLOG_LONG_DAYS),
            median_close_30d: stats::median(&recent),
            median_close_90d: stats::median(&longer),
            closed_count_90d: longer.len(),
            day_of_week: reported.weekday().num_days_from_monday(),
            month: reported.month(),
            is_weekend: matches!(reported.weekday(), Weekday::Sat | Weekday::Sun),
            is_holiday: is_holiday(reported),
        };

        debug!(
            sr_number,
            %as_of,
            backlog_7d = snapshot.backlog_7d,
            backlog_30d = snapshot.backlog_30d,
            closed_count_90d = snapshot.closed_count_90d,
            "computed feature snapshot"
        );

        Ok(snapshot)
    }
}

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u8) -> Option<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, n)
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    nth_weekday(year, month, weekday, 5).or_else(|| nth_weekday(year, month, weekday, 4))
}

/// US federal holidays observed by city departments for the given year.
pub fn holidays(year: i32) -> Vec<NaiveDate> {
    let fixed = [(1, 1), (6, 19), (7, 4), (11, 11), (12, 25)]
        .into_iter()
        .filter_map(|(month, day)| NaiveDate::from_ymd_opt(year, month, day));

    let floating = [
        nth_weekday(year, 1, Weekday::Mon, 3),
        nth_weekday(year, 2, Weekday::Mon, 3),
        last_weekday(year, 5, Weekday::Mon),
        nth_weekday(year, 9, Weekday::Mon, 1),
        nth_weekday(year, 10, Weekday::Mon, 2),
        nth_weekday(year, 11, Weekday::Thu, 4),
    ]
    .into_iter()
    .flatten();

    let mut days: Vec<NaiveDate> = fixed.chain(floating).collect();
    days.sort();
    days
}

pub fn is_holiday(date: NaiveDate) -> bool {
    holidays(date.year()).contains(&date)
}
