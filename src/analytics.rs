//! Equity comparisons and spatial hotspots over historical requests.

use std::collections::BTreeMap;
use std::iter::FusedIterator;
use std::sync::Arc;

use chrono::{Duration, NaiveDateTime};
use tracing::debug;

use crate::error::AnalyticsError;
use crate::models::{AreaType, EquityResult, GeoPoint, Hotspot, ServiceRequest};
use crate::stats;
use crate::store::RequestStore;

pub const MAX_HOTSPOT_DAYS: i64 = 365;

/// Decides whether an area's deviation from the city is significant.
///
/// Implementations must return `false` below their minimum sample and be
/// monotonic: growing `|delta|` or `n` never turns a `true` into `false`.
pub trait SignificancePolicy: Send + Sync {
    fn is_significant(&self, delta_days: f64, n: usize, spread: f64) -> bool;
}

/// One-sample z test of the area median against the city median, using the
/// citywide robust spread as the scale.
#[derive(Debug, Clone, Copy)]
pub struct ZScorePolicy {
    pub min_sample: usize,
    pub z_critical: f64,
}

impl Default for ZScorePolicy {
    fn default() -> Self {
        Self {
            min_sample: 30,
            z_critical: 1.96,
        }
    }
}

impl SignificancePolicy for ZScorePolicy {
    fn is_significant(&self, delta_days: f64, n: usize, spread: f64) -> bool {
        if n < self.min_sample || !delta_days.is_finite() {
            return false;
        }
        if spread <= 0.0 || !spread.is_finite() {
            return delta_days != 0.0;
        }
        delta_days.abs() * (n as f64).sqrt() / spread >= self.z_critical
    }
}

#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    pub equity_window_days: i64,
    pub hotspot_cell_deg: f64,
    pub hotspot_min_count: usize,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            equity_window_days: 365,
            hotspot_cell_deg: 0.01,
            hotspot_min_count: 3,
        }
    }
}

pub struct AnalyticsEngine {
    store: Arc<RequestStore>,
    policy: Arc<dyn SignificancePolicy>,
    config: AnalyticsConfig,
    reference: NaiveDateTime,
}

impl AnalyticsEngine {
    /// Windows end at the store's latest recorded event.
    pub fn new(
        store: Arc<RequestStore>,
        policy: Arc<dyn SignificancePolicy>,
        config: AnalyticsConfig,
    ) -> Self {
        let reference = store.latest_event().unwrap_or_default();
        Self {
            store,
            policy,
            config,
            reference,
        }
    }

    #[cfg(test)]
    pub fn with_reference(mut self, reference: NaiveDateTime) -> Self {
        self.reference = reference;
        self
    }

    fn check_category(&self, category: &str) -> Result<(), AnalyticsError> {
        if category.trim().is_empty() || !self.store.has_category(category) {
            return Err(AnalyticsError::InvalidCategory(category.to_string()));
        }
        Ok(())
    }

    pub fn area_equity(
        &self,
        area_name: &str,
        area_type: AreaType,
        category: Option<&str>,
    ) -> Result<EquityResult, AnalyticsError> {
        let area = parse_area(area_name, area_type)?;
        if let Some(category) = category {
            self.check_category(category)?;
        }

        let window_start = self.reference - Duration::days(self.config.equity_window_days);
        let closed: Vec<(i32, f64)> = self
            .store
            .created_up_to(self.reference)
            .iter()
            .filter(|r| r.created_at >= window_start)
            .filter(|r| category.map_or(true, |c| r.category == c))
            .filter(|r| matches!(r.closed_at, Some(at) if at <= self.reference))
            .filter_map(|r| r.days_to_close().map(|days| (area_type.area_of(r), days)))
            .collect();

        let city: Vec<f64> = closed.iter().map(|&(_, days)| days).collect();
        let local: Vec<f64> = closed
            .iter()
            .filter(|&&(id, _)| id == area)
            .map(|&(_, days)| days)
            .collect();

        let group = format!("{} {area}", area_type.label());
        let area_median = stats::median(&local).ok_or_else(|| AnalyticsError::EmptyGroup(group))?;
        let city_median = stats::median(&city)
            .ok_or_else(|| AnalyticsError::EmptyGroup("the city".to_string()))?;
        let spread = stats::robust_spread(&city).unwrap_or(0.0);
        let delta_days = area_median - city_median;
        let n = local.len();
        let significance = self.policy.is_significant(delta_days, n, spread);

        debug!(
            area,
            %area_type,
            category = category.unwrap_or("all"),
            n,
            delta_days,
            significance,
            "computed area equity"
        );

        Ok(EquityResult {
            area_name: area.to_string(),
            area_type,
            category: category.map(str::to_string),
            area_median,
            city_median,
            delta_days,
            n,
            significance,
        })
    }

    pub fn hotspots(&self, category: &str, days: i64) -> Result<HotspotIter, AnalyticsError> {
        if !(1..=MAX_HOTSPOT_DAYS).contains(&days) {
            return Err(AnalyticsError::InvalidWindow(days));
        }
        self.check_category(category)?;

        let cell = self.config.hotspot_cell_deg;
        let reference = self.reference;
        let window_start = reference - Duration::days(days);
        let of_category: Vec<&ServiceRequest> = self
            .store
            .created_up_to(reference)
            .iter()
            .filter(|r| r.category == category)
            .collect();

        let mut members: BTreeMap<CellKey, Vec<GeoPoint>> = BTreeMap::new();
        for request in of_category
            .iter()
            .filter(|r| r.created_at >= window_start && r.is_open_at(reference))
        {
            members
                .entry(cell_key(request.latitude, request.longitude, cell))
                .or_default()
                .push(GeoPoint {
                    lat: request.latitude,
                    lon: request.longitude,
                });
        }

        let mut cells: Vec<Cell> = members
            .into_iter()
            .filter(|(_, points)| points.len() >= self.config.hotspot_min_count)
            .map(|(key, points)| {
                let count = points.len();
                let lat = points.iter().map(|p| p.lat).sum::<f64>() / count as f64;
                let lon = points.iter().map(|p| p.lon).sum::<f64>() / count as f64;
                Cell {
                    key,
                    count,
                    center: GeoPoint { lat, lon },
                }
            })
            .collect();
        cells.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));

        let trend_start = reference - Duration::days(2 * TREND_LONG_DAYS);
        let arrivals = of_category
            .iter()
            .filter(|r| r.created_at >= trend_start)
            .map(|r| (cell_key(r.latitude, r.longitude, cell), r.created_at))
            .collect();

        debug!(category, days, cells = cells.len(), "binned hotspot cells");

        Ok(HotspotIter {
            cells: cells.into_iter(),
            arrivals,
            reference,
        })
    }
}

const TREND_SHORT_DAYS: i64 = 7;
const TREND_LONG_DAYS: i64 = 30;

type CellKey = (i64, i64);

fn cell_key(lat: f64, lon: f64, cell: f64) -> CellKey {
    ((lat / cell).floor() as i64, (lon / cell).floor() as i64)
}

/// Accepts `12` or a labelled form such as `Ward 12`, in any case.
pub(crate) fn parse_area(area_name: &str, area_type: AreaType) -> Result<i32, AnalyticsError> {
    let trimmed = area_name.trim();
    let label = area_type.label();
    let digits = match trimmed.get(..label.len()) {
        Some(head) if head.eq_ignore_ascii_case(label) => trimmed[label.len()..].trim(),
        _ => trimmed,
    };
    match digits.parse::<i32>() {
        Ok(id) if (1..=area_type.max_id()).contains(&id) => Ok(id),
        _ => Err(AnalyticsError::InvalidArea(area_name.to_string())),
    }
}

#[derive(Debug)]
struct Cell {
    key: CellKey,
    count: usize,
    center: GeoPoint,
}

/// Hotspots in descending count order. Trend ratios are computed as each
/// item is pulled; the sequence is consumed once.
#[derive(Debug)]
pub struct HotspotIter {
    cells: std::vec::IntoIter<Cell>,
    arrivals: Vec<(CellKey, NaiveDateTime)>,
    reference: NaiveDateTime,
}

impl HotspotIter {
    /// Count in `[ref - days, ref]` over the count in `[ref - 2*days, ref - days)`.
    fn trend(&self, key: CellKey, days: i64) -> f64 {
        let recent_start = self.reference - Duration::days(days);
        let previous_start = recent_start - Duration::days(days);
        let (recent, previous) = self
            .arrivals
            .iter()
            .filter(|(k, _)| *k == key)
            .fold((0usize, 0usize), |(recent, previous), (_, at)| {
                if *at >= recent_start && *at <= self.reference {
                    (recent + 1, previous)
                } else if *at >= previous_start && *at < recent_start {
                    (recent, previous + 1)
                } else {
                    (recent, previous)
                }
            });
        recent as f64 / previous.max(1) as f64
    }
}

impl Iterator for HotspotIter {
    type Item = Hotspot;

    fn next(&mut self) -> Option<Hotspot> {
        let cell = self.cells.next()?;
        Some(Hotspot {
            center: cell.center,
            count: cell.count,
            trend_7d: self.trend(cell.key, TREND_SHORT_DAYS),
            trend_30d: self.trend(cell.key, TREND_LONG_DAYS),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.cells.size_hint()
    }
}

impl FusedIterator for HotspotIter {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{request, ts};
    use proptest::prelude::*;

    const POTHOLE: &str = "Pothole in Street";

    fn engine(records: Vec<ServiceRequest>, min_count: usize) -> AnalyticsEngine {
        let store = Arc::new(RequestStore::from_records(records).unwrap());
        let config = AnalyticsConfig {
            hotspot_min_count: min_count,
            ..AnalyticsConfig::default()
        };
        AnalyticsEngine::new(store, Arc::new(ZScorePolicy::default()), config)
    }

    fn closed_in_ward(prefix: &str, ward: i32, days: &[i64]) -> Vec<ServiceRequest> {
        days.iter()
            .enumerate()
            .map(|(i, &d)| request(&format!("{prefix}-{i}"), POTHOLE, ward, ts(1, 8), Some(d)))
            .collect()
    }

    #[test]
    fn equity_compares_area_to_city_median() {
        let mut records = closed_in_ward("A", 1, &[10, 12, 14]);
        records.extend(closed_in_ward("B", 2, &[2, 4, 6, 8]));
        let engine = engine(records, 1);

        let result = engine.area_equity("1", AreaType::Ward, Some(POTHOLE)).unwrap();
        assert_eq!(result.area_median, 12.0);
        assert_eq!(result.city_median, 8.0);
        assert_eq!(result.delta_days, 4.0);
        assert_eq!(result.n, 3);
        assert!(!result.significance);
    }

    #[test]
    fn equity_ignores_open_requests() {
        let mut records = closed_in_ward("A", 1, &[10]);
        records.push(request("OPEN", POTHOLE, 1, ts(2, 8), None));
        let engine = engine(records, 1);

        let result = engine.area_equity("Ward 1", AreaType::Ward, None).unwrap();
        assert_eq!(result.n, 1);
        assert_eq!(result.area_median, 10.0);
    }

    #[test]
    fn equity_flags_large_well_sampled_gaps() {
        let slow: Vec<i64> = (0..40).map(|i| 20 + i % 3).collect();
        let fast: Vec<i64> = (0..40).map(|i| 3 + i % 3).collect();
        let mut records = closed_in_ward("SLOW", 9, &slow);
        records.extend(closed_in_ward("FAST", 10, &fast));
        let engine = engine(records, 1);

        let result = engine.area_equity("9", AreaType::Ward, None).unwrap();
        assert_eq!(result.n, 40);
        assert!(result.delta_days > 0.0);
        assert!(result.significance);
    }

    #[test]
    fn equity_rejects_malformed_arguments() {
        let engine = engine(closed_in_ward("A", 1, &[10]), 1);
        assert_eq!(
            engine.area_equity("51", AreaType::Ward, None).unwrap_err(),
            AnalyticsError::InvalidArea("51".into())
        );
        assert!(engine.area_equity("77", AreaType::Community, None).is_err());
        assert!(matches!(
            engine.area_equity("north side", AreaType::Ward, None),
            Err(AnalyticsError::InvalidArea(_))
        ));
        assert!(matches!(
            engine.area_equity("1", AreaType::Ward, Some("")),
            Err(AnalyticsError::InvalidCategory(_))
        ));
        assert!(matches!(
            engine.area_equity("2", AreaType::Ward, None),
            Err(AnalyticsError::EmptyGroup(_))
        ));
    }

    #[test]
    fn equity_excludes_requests_outside_window() {
        let recent = request("RECENT", POTHOLE, 1, ts(1, 8), Some(10));
        let reference = ts(11, 8);
        let edge = request("EDGE", POTHOLE, 1, reference - Duration::days(365), Some(4));
        let stale = request("STALE", POTHOLE, 1, reference - Duration::days(400), Some(2));
        let engine = engine(vec![recent, edge, stale], 1);

        let result = engine.area_equity("1", AreaType::Ward, None).unwrap();
        assert_eq!(result.n, 2);
        assert_eq!(result.area_median, 7.0);
        assert_eq!(result.city_median, 7.0);
    }

    #[test]
    fn area_labels_match_in_any_case() {
        assert_eq!(parse_area("ward 12", AreaType::Ward), Ok(12));
        assert_eq!(parse_area("WARD 12", AreaType::Ward), Ok(12));
        assert_eq!(parse_area(" Ward 7 ", AreaType::Ward), Ok(7));
        assert_eq!(parse_area("community area 31", AreaType::Community), Ok(31));
        assert_eq!(parse_area("31", AreaType::Community), Ok(31));
        assert!(parse_area("wards 12", AreaType::Ward).is_err());
        assert!(parse_area("ward", AreaType::Ward).is_err());
    }

    #[test]
    fn underpowered_samples_are_never_significant() {
        let policy = ZScorePolicy::default();
        assert!(!policy.is_significant(100.0, 29, 1.0));
        assert!(policy.is_significant(100.0, 30, 1.0));
        assert!(!policy.is_significant(0.0, 500, 0.0));
        assert!(policy.is_significant(0.5, 500, 0.0));
    }

    fn hotspot_records(recent: usize, previous: usize) -> Vec<ServiceRequest> {
        let reference = ts(28, 12);
        let mut records = Vec::new();
        for i in 0..recent {
            let created = reference - Duration::minutes(i as i64 * 80);
            records.push(request(&format!("NEW-{i}"), POTHOLE, 4, created, None));
        }
        for i in 0..previous {
            let created = reference - Duration::days(8) - Duration::minutes(i as i64 * 70);
            records.push(request(&format!("OLD-{i}"), POTHOLE, 4, created, Some(1)));
        }
        records
    }

    #[test]
    fn trend_compares_recent_week_to_previous_week() {
        let engine = engine(hotspot_records(120, 100), 1).with_reference(ts(28, 12));
        let spots: Vec<Hotspot> = engine.hotspots(POTHOLE, 30).unwrap().collect();

        assert_eq!(spots.len(), 1);
        assert_eq!(spots[0].count, 120);
        assert!((spots[0].trend_7d - 1.2).abs() < 1e-9);
    }

    #[test]
    fn hotspots_are_ordered_and_deterministic() {
        let mut records = Vec::new();
        let reference = ts(28, 12);
        for (i, (lat, lon, n)) in [(41.90, -87.70, 2), (41.75, -87.60, 5), (41.80, -87.65, 3)]
            .into_iter()
            .enumerate()
        {
            for j in 0..n {
                let mut r = request(&format!("C{i}-{j}"), POTHOLE, 4, reference - Duration::hours(j), None);
                r.latitude = lat + 0.001;
                r.longitude = lon + 0.001;
                records.push(r);
            }
        }
        let engine = engine(records, 3).with_reference(reference);

        let first: Vec<Hotspot> = engine.hotspots(POTHOLE, 7).unwrap().collect();
        let second: Vec<Hotspot> = engine.hotspots(POTHOLE, 7).unwrap().collect();
        assert_eq!(first, second);
        let counts: Vec<usize> = first.iter().map(|h| h.count).collect();
        assert_eq!(counts, vec![5, 3]);
        assert!((first[0].center.lat - 41.751).abs() < 1e-9);
    }

    #[test]
    fn hotspot_sequence_is_single_pass() {
        let engine = engine(hotspot_records(5, 0), 1).with_reference(ts(28, 12));
        let mut spots = engine.hotspots(POTHOLE, 7).unwrap();
        assert_eq!(spots.size_hint(), (1, Some(1)));
        assert!(spots.next().is_some());
        assert!(spots.next().is_none());
        assert!(spots.next().is_none());
    }

    #[test]
    fn hotspot_window_is_validated() {
        let engine = engine(hotspot_records(5, 0), 1);
        assert_eq!(
            engine.hotspots(POTHOLE, 0).unwrap_err(),
            AnalyticsError::InvalidWindow(0)
        );
        assert!(engine.hotspots(POTHOLE, 366).is_err());
        assert!(matches!(
            engine.hotspots("Graffiti Removal", 30),
            Err(AnalyticsError::InvalidCategory(_))
        ));
    }

    proptest! {
        #[test]
        fn significance_is_monotonic(
            delta in -50.0f64..50.0,
            extra_delta in 0.0f64..50.0,
            n in 0usize..200,
            extra_n in 0usize..200,
            spread in 0.0f64..20.0,
        ) {
            let policy = ZScorePolicy::default();
            let grown_delta = delta.signum() * (delta.abs() + extra_delta);
            if policy.is_significant(delta, n, spread) {
                prop_assert!(policy.is_significant(grown_delta, n, spread));
                prop_assert!(policy.is_significant(delta, n + extra_n, spread));
            }
            if n < policy.min_sample {
                prop_assert!(!policy.is_significant(delta, n, spread));
            }
        }
    }
}
