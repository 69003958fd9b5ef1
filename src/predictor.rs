//! Model boundary for resolution-time estimates.

use std::cmp::Ordering;

use chrono::Duration;

use crate::error::PredictorError;
use crate::features::FEATURE_NAMES;
use crate::models::{FeatureSnapshot, Prediction};

pub const MAX_FACTORS: usize = 5;

/// A versioned, side-effect-free estimator.
///
/// The same snapshot under the same `model_version` must always yield the
/// same prediction.
pub trait Predictor: Send + Sync {
    fn model_version(&self) -> &str;

    fn predict(&self, snapshot: &FeatureSnapshot) -> Result<Prediction, PredictorError>;
}

/// Reject predictions that break the output contract. Values are never clamped.
pub fn validate_prediction(prediction: &Prediction) -> Result<(), PredictorError> {
    let breach = |msg: String| Err(PredictorError::ContractBreach(msg));

    let Prediction {
        eta_days,
        ci_low,
        ci_high,
        confidence,
        top_factors,
        ..
    } = prediction;

    if ![*eta_days, *ci_low, *ci_high, *confidence]
        .iter()
        .all(|v| v.is_finite())
    {
        return breach("non-finite value in prediction".into());
    }
    if !(ci_low <= eta_days && eta_days <= ci_high) {
        return breach(format!(
            "interval [{ci_low}, {ci_high}] does not contain eta {eta_days}"
        ));
    }
    if !(0.0..=1.0).contains(confidence) {
        return breach(format!("confidence {confidence} outside [0, 1]"));
    }
    if top_factors.len() > MAX_FACTORS {
        return breach(format!(
            "{} contributing factors exceeds limit of {MAX_FACTORS}",
            top_factors.len()
        ));
    }
    for label in top_factors {
        if label.trim().is_empty() {
            return breach("empty contributing factor label".into());
        }
        if FEATURE_NAMES.contains(&label.as_str()) {
            return breach(format!("raw feature identifier '{label}' used as a factor"));
        }
    }
    Ok(())
}

fn category_prior_days(category: &str) -> f64 {
    match category {
        "Pothole in Street" => 14.0,
        "Street Lights - All/Out" => 22.0,
        "Sanitation Code Violation" => 21.0,
        _ => 10.0,
    }
}

/// Deterministic estimator built from historical medians, backlog pressure
/// and calendar effects. Falls back to category priors when a ward has no
/// recent closures.
#[derive(Debug, Clone)]
pub struct BaselinePredictor {
    version: String,
}

impl BaselinePredictor {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }
}

impl Predictor for BaselinePredictor {
    fn model_version(&self) -> &str {
        &self.version
    }

    fn predict(&self, snapshot: &FeatureSnapshot) -> Result<Prediction, PredictorError> {
        let prior = category_prior_days(&snapshot.category);
        let samples = snapshot.closed_count_90d as f64;
        let history = snapshot.median_close_90d.or(snapshot.median_close_30d);

        // Shrink toward the prior while the ward has few closures.
        let weight = samples / (samples + 5.0);
        let base = match history {
            Some(observed) => weight * observed + (1.0 - weight) * prior,
            None => prior,
        };

        let pressure = 1.0
            + 0.04 * snapshot.backlog_7d.min(25) as f64
            + 0.01 * snapshot.backlog_30d.min(100) as f64;
        let holiday_delay = if snapshot.is_holiday { 1.0 } else { 0.0 };
        let weekend_delay = if snapshot.is_weekend { 0.5 } else { 0.0 };

        let eta_days = (base * pressure + holiday_delay + weekend_delay).max(0.25);
        let spread = eta_days * (0.25 + 1.0 / (samples + 1.0).sqrt());
        let ci_low = (eta_days - spread).max(0.0);
        let ci_high = eta_days + spread;
        let confidence = 0.05 + 0.9 * samples / (samples + 10.0);

        let mut factors: Vec<(f64, &str)> = vec![
            (
                base * (pressure - 1.0),
                "Backlog of unresolved requests in this ward",
            ),
            (holiday_delay, "Reported on a holiday"),
            (weekend_delay, "Reported on a weekend"),
        ];
        match history {
            Some(observed) => {
                factors.push((weight * observed, "Typical resolution time in this ward"));
                factors.push((
                    (1.0 - weight) * prior,
                    "Citywide typical resolution time for this category",
                ));
            }
            None => factors.push((prior, "Citywide typical resolution time for this category")),
        }
        if let (Some(recent), Some(longer)) = (snapshot.median_close_30d, snapshot.median_close_90d)
        {
            factors.push(((recent - longer).abs(), "Recent change in resolution times"));
        }
        if snapshot.closed_count_90d < 5 {
            factors.push((spread / 2.0, "Limited recent history in this ward"));
        }

        factors.retain(|(impact, _)| *impact > 0.0);
        factors.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.1.cmp(b.1))
        });

        Ok(Prediction {
            eta_date: (snapshot.created_at + Duration::days(eta_days.ceil() as i64)).date(),
            eta_days,
            ci_low,
            ci_high,
            confidence,
            top_factors: factors
                .into_iter()
                .take(MAX_FACTORS)
                .map(|(_, label)| label.to_string())
                .collect(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::store::tests::ts;
    use proptest::prelude::*;

    /// Fixed lookup by SR number.
    pub(crate) struct FixedPredictor {
        pub(crate) predictions: HashMap<String, Prediction>,
    }

    impl Predictor for FixedPredictor {
        fn model_version(&self) -> &str {
            "fixed-test"
        }

        fn predict(&self, snapshot: &FeatureSnapshot) -> Result<Prediction, PredictorError> {
            self.predictions
                .get(&snapshot.sr_number)
                .cloned()
                .ok_or_else(|| PredictorError::Unavailable(snapshot.sr_number.clone()))
        }
    }

    pub(crate) fn snapshot(sr_number: &str, closed_count: usize, backlog_7d: usize) -> FeatureSnapshot {
        FeatureSnapshot {
            sr_number: sr_number.to_string(),
            as_of: ts(4, 9),
            created_at: ts(4, 9),
            category: "Pothole in Street".to_string(),
            category_code: 0,
            ward: 12,
            backlog_7d,
            backlog_30d: backlog_7d * 3,
            median_close_30d: (closed_count > 0).then_some(9.0),
            median_close_90d: (closed_count > 0).then_some(11.0),
            closed_count_90d: closed_count,
            day_of_week: 0,
            month: 3,
            is_weekend: false,
            is_holiday: false,
        }
    }

    pub(crate) fn prediction(eta_days: f64, ci_low: f64, ci_high: f64, confidence: f64) -> Prediction {
        Prediction {
            eta_date: ts(10, 0).date(),
            eta_days,
            ci_low,
            ci_high,
            confidence,
            top_factors: vec!["Typical resolution time in this ward".into()],
        }
    }

    #[test]
    fn baseline_is_deterministic_and_valid() {
        let model = BaselinePredictor::new("baseline-v1");
        let input = snapshot("SR-1", 40, 6);
        let first = model.predict(&input).unwrap();
        let second = model.predict(&input).unwrap();

        assert_eq!(first, second);
        assert!(validate_prediction(&first).is_ok());
        assert!(first.top_factors.len() <= MAX_FACTORS);
        assert!(first.eta_date >= input.created_at.date());
    }

    #[test]
    fn backlog_raises_the_estimate() {
        let model = BaselinePredictor::new("baseline-v1");
        let quiet = model.predict(&snapshot("SR-1", 40, 0)).unwrap();
        let busy = model.predict(&snapshot("SR-1", 40, 12)).unwrap();
        assert!(busy.eta_days > quiet.eta_days);
        assert!(!quiet
            .top_factors
            .iter()
            .any(|f| f == "Backlog of unresolved requests in this ward"));
        assert!(busy
            .top_factors
            .iter()
            .any(|f| f == "Backlog of unresolved requests in this ward"));
    }

    #[test]
    fn sparse_history_lowers_confidence() {
        let model = BaselinePredictor::new("baseline-v1");
        let sparse = model.predict(&snapshot("SR-1", 0, 2)).unwrap();
        let rich = model.predict(&snapshot("SR-1", 80, 2)).unwrap();
        assert!(sparse.confidence < rich.confidence);
        let relative_width = |p: &Prediction| (p.ci_high - p.ci_low) / p.eta_days;
        assert!(relative_width(&sparse) > relative_width(&rich));
        assert!(sparse
            .top_factors
            .iter()
            .any(|f| f == "Limited recent history in this ward"));
    }

    #[test]
    fn contract_violations_are_rejected() {
        assert!(validate_prediction(&prediction(5.0, 6.0, 9.0, 0.5)).is_err());
        assert!(validate_prediction(&prediction(5.0, 2.0, 4.0, 0.5)).is_err());
        assert!(validate_prediction(&prediction(5.0, 2.0, 9.0, 1.2)).is_err());
        assert!(validate_prediction(&prediction(5.0, 2.0, 9.0, -0.1)).is_err());
        assert!(validate_prediction(&prediction(f64::NAN, 2.0, 9.0, 0.5)).is_err());
        assert!(validate_prediction(&prediction(5.0, 5.0, 5.0, 1.0)).is_ok());

        let mut raw = prediction(5.0, 2.0, 9.0, 0.5);
        raw.top_factors = vec!["backlog_7d".into()];
        assert!(validate_prediction(&raw).is_err());

        let mut crowded = prediction(5.0, 2.0, 9.0, 0.5);
        crowded.top_factors = (0..6).map(|i| format!("Factor number {i}")).collect();
        assert!(validate_prediction(&crowded).is_err());
    }

    proptest! {
        #[test]
        fn baseline_always_honors_bounds(
            closed in 0usize..500,
            backlog in 0usize..200,
            holiday in any::<bool>(),
            weekend in any::<bool>(),
            recent in prop::option::of(0.0f64..120.0),
            longer in prop::option::of(0.0f64..120.0),
        ) {
            let mut input = snapshot("SR-P", closed, backlog);
            input.is_holiday = holiday;
            input.is_weekend = weekend;
            input.median_close_30d = recent;
            input.median_close_90d = longer;

            let output = BaselinePredictor::new("baseline-v1").predict(&input).unwrap();
            prop_assert!(validate_prediction(&output).is_ok());
        }

        #[test]
        fn validation_accepts_only_ordered_intervals(
            low in 0.0f64..50.0,
            eta in 0.0f64..50.0,
            high in 0.0f64..50.0,
            confidence in -0.5f64..1.5,
        ) {
            let ok = low <= eta && eta <= high && (0.0..=1.0).contains(&confidence);
            prop_assert_eq!(validate_prediction(&prediction(eta, low, high, confidence)).is_ok(), ok);
        }
    }
}
