//! Resident-facing answers rendered strictly from tool results.

use std::fmt::Write;

use tracing::{debug, info};

use crate::models::{Prediction, RefreshMeta, RequestStatus};
use crate::tools::{AgentTools, ToolResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Answering { sr_number: String },
}

/// Everything one summary needs, gathered before anything is rendered.
struct Facts {
    status: RequestStatus,
    prediction: Prediction,
    meta: RefreshMeta,
}

pub struct ResidentAgent<T: AgentTools> {
    tools: T,
    state: AgentState,
}

impl<T: AgentTools> ResidentAgent<T> {
    pub fn new(tools: T) -> Self {
        Self {
            tools,
            state: AgentState::Idle,
        }
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn summarize(&mut self, sr_number: &str) -> String {
        self.state = AgentState::Answering {
            sr_number: sr_number.to_string(),
        };
        debug!(sr_number, "agent answering");

        let answer = match self.gather(sr_number) {
            Ok(facts) => render_summary(sr_number, &facts),
            Err(err) => {
                info!(sr_number, error = %err, "tool call failed; apologizing");
                apology(sr_number)
            }
        };

        self.state = AgentState::Idle;
        answer
    }

    fn gather(&self, sr_number: &str) -> ToolResult<Facts> {
        Ok(Facts {
            status: self.tools.get_request_status(sr_number)?,
            prediction: self.tools.predict_eta(sr_number)?,
            meta: self.tools.refresh_meta()?,
        })
    }
}

pub fn apology(sr_number: &str) -> String {
    format!(
        "I'm sorry, I was unable to retrieve information for service request {sr_number}. \
         There might be an issue with the system or the ID may be incorrect."
    )
}

fn render_summary(sr_number: &str, facts: &Facts) -> String {
    let Facts {
        status,
        prediction,
        meta,
    } = facts;
    let mut output = String::new();

    let _ = writeln!(output, "Here is the information for service request #{sr_number}:");
    let _ = writeln!(output);
    let _ = writeln!(output, "- Status: {}", status.status);
    let _ = writeln!(output, "- Category: {}", status.category);
    let _ = writeln!(output, "- Reported on: {}", status.created_date);
    if let Some(closed) = status.closed_date {
        let _ = writeln!(output, "- Resolved on: {closed}");
    }
    let _ = writeln!(output);
    let overdue =
        status.closed_date.is_none() && prediction.eta_date < meta.data_last_updated.date_naive();
    if overdue {
        let _ = writeln!(
            output,
            "The estimated completion date was {} (an estimate, likely between {:.0} and {:.0} days after the report). That date has passed and the request is still open.",
            prediction.eta_date, prediction.ci_low, prediction.ci_high
        );
    } else {
        let _ = writeln!(
            output,
            "The estimated completion date is {} (an estimate, likely between {:.0} and {:.0} days after the report).",
            prediction.eta_date, prediction.ci_low, prediction.ci_high
        );
    }
    let _ = writeln!(output, "Confidence: {:.0}%", prediction.confidence * 100.0);

    if !prediction.top_factors.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(
            output,
            "This is a prediction based on historical data. Factors that might influence this estimate include: {}.",
            prediction.top_factors.join(", ")
        );
    }

    let _ = writeln!(output);
    let _ = write!(output, "Data last refreshed on {}.", meta.data_last_updated);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::tests::prediction;
    use crate::models::{EquityResult, Hotspot};
    use crate::tools::tests::refresh;
    use crate::tools::{FixtureTools, ToolError};
    use chrono::NaiveDate;

    const SR: &str = "SR24-000001";
    const OTHER_STATUSES: [&str; 4] = ["Completed", "Closed", "Canceled", "Duplicate"];

    fn status(value: &str) -> RequestStatus {
        RequestStatus {
            sr_number: SR.to_string(),
            status: value.to_string(),
            category: "Pothole in Street".to_string(),
            created_date: NaiveDate::from_ymd_opt(2024, 3, 20).unwrap(),
            closed_date: None,
            ward: 12,
            lat: 41.88,
            lon: -87.63,
        }
    }

    fn fixtures() -> FixtureTools {
        let mut tools = FixtureTools {
            meta: Some(refresh()),
            ..FixtureTools::default()
        };
        tools.statuses.insert(SR.to_string(), status("Open"));
        let mut estimate = prediction(12.0, 8.0, 16.0, 0.72);
        estimate.eta_date = NaiveDate::from_ymd_opt(2024, 4, 1).unwrap();
        tools.predictions.insert(SR.to_string(), estimate);
        tools
    }

    /// Fails a chosen operation with upstream failure, otherwise delegates.
    struct FailingTools {
        inner: FixtureTools,
        fail_prediction: bool,
        fail_meta: bool,
    }

    impl AgentTools for FailingTools {
        fn get_request_status(&self, sr_number: &str) -> ToolResult<RequestStatus> {
            self.inner.get_request_status(sr_number)
        }

        fn predict_eta(&self, sr_number: &str) -> ToolResult<Prediction> {
            if self.fail_prediction {
                return Err(ToolError::UpstreamFailure("model offline".into()));
            }
            self.inner.predict_eta(sr_number)
        }

        fn area_equity(
            &self,
            area_name: &str,
            area_type: &str,
            category: Option<&str>,
        ) -> ToolResult<EquityResult> {
            self.inner.area_equity(area_name, area_type, category)
        }

        fn hotspots(&self, category: &str, days: i64) -> ToolResult<Vec<Hotspot>> {
            self.inner.hotspots(category, days)
        }

        fn refresh_meta(&self) -> ToolResult<RefreshMeta> {
            if self.fail_meta {
                return Err(ToolError::UpstreamFailure("meta unavailable".into()));
            }
            self.inner.refresh_meta()
        }
    }

    #[test]
    fn answer_repeats_status_verbatim() {
        let mut agent = ResidentAgent::new(fixtures());
        let answer = agent.summarize(SR);

        assert!(answer.contains("Open"));
        for word in OTHER_STATUSES {
            assert!(!answer.contains(word), "unexpected status word {word}");
        }
        assert_eq!(agent.state(), &AgentState::Idle);
    }

    #[test]
    fn answer_labels_estimate_and_reports_confidence_and_refresh() {
        let mut agent = ResidentAgent::new(fixtures());
        let answer = agent.summarize(SR);

        assert!(answer.contains("The estimated completion date is 2024-04-01"));
        assert!(!answer.contains("has passed"));
        assert!(answer.contains("an estimate"));
        assert!(answer.contains("Confidence: 72%"));
        assert!(answer.contains(&refresh().data_last_updated.to_string()));
        assert!(answer.contains("Typical resolution time in this ward"));
    }

    #[test]
    fn past_estimate_for_open_request_is_flagged() {
        let mut tools = fixtures();
        // Refresh is 2024-03-30; the estimate fell on 2024-03-25.
        if let Some(estimate) = tools.predictions.get_mut(SR) {
            estimate.eta_date = NaiveDate::from_ymd_opt(2024, 3, 25).unwrap();
        }
        let answer = ResidentAgent::new(tools.clone()).summarize(SR);
        assert!(answer.contains("The estimated completion date was 2024-03-25"));
        assert!(answer.contains("an estimate"));
        assert!(answer.contains("That date has passed and the request is still open."));

        let mut resolved = tools;
        if let Some(status) = resolved.statuses.get_mut(SR) {
            status.status = "Completed".into();
            status.closed_date = NaiveDate::from_ymd_opt(2024, 3, 26);
        }
        let answer = ResidentAgent::new(resolved).summarize(SR);
        assert!(answer.contains("The estimated completion date is 2024-03-25"));
        assert!(!answer.contains("has passed"));
    }

    #[test]
    fn failed_prediction_yields_only_the_apology() {
        let mut agent = ResidentAgent::new(FailingTools {
            inner: fixtures(),
            fail_prediction: true,
            fail_meta: false,
        });
        let answer = agent.summarize(SR);

        assert_eq!(answer, apology(SR));
        assert!(answer.contains("SR24-000001"));
        assert!(!answer.contains("Open"));
        assert!(!answer.contains("estimated completion"));
        assert_eq!(agent.state(), &AgentState::Idle);
    }

    #[test]
    fn failed_refresh_meta_is_also_atomic() {
        let mut agent = ResidentAgent::new(FailingTools {
            inner: fixtures(),
            fail_prediction: false,
            fail_meta: true,
        });
        assert_eq!(agent.summarize(SR), apology(SR));
    }

    #[test]
    fn unknown_request_is_apologized_for() {
        let mut agent = ResidentAgent::new(fixtures());
        assert_eq!(agent.summarize("SR24-404"), apology("SR24-404"));
        assert_eq!(agent.state(), &AgentState::Idle);
    }
}
