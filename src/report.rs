use std::cmp::Ordering;
use std::fmt::Write;

use crate::models::{AreaType, EquityResult, Hotspot, RefreshMeta};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EquityOverview {
    pub areas: usize,
    pub slower: usize,
    pub faster: usize,
}

/// Counts areas whose gap to the city median is significant, by direction.
pub fn summarize_equity(results: &[EquityResult]) -> EquityOverview {
    results.iter().fold(
        EquityOverview {
            areas: results.len(),
            ..EquityOverview::default()
        },
        |mut overview, result| {
            if result.significance && result.delta_days > 0.0 {
                overview.slower += 1;
            } else if result.significance && result.delta_days < 0.0 {
                overview.faster += 1;
            }
            overview
        },
    )
}

fn trend_label(ratio: f64) -> String {
    let change = (ratio - 1.0) * 100.0;
    if change.abs() < 0.5 {
        "flat".to_string()
    } else {
        format!("{change:+.0}%")
    }
}

pub fn build_report(
    category: &str,
    area_type: AreaType,
    days: i64,
    meta: &RefreshMeta,
    equity: &[EquityResult],
    hotspots: &[Hotspot],
) -> String {
    let overview = summarize_equity(equity);
    let mut ranked = equity.to_vec();
    ranked.sort_by(|a, b| {
        b.delta_days
            .partial_cmp(&a.delta_days)
            .unwrap_or(Ordering::Equal)
    });

    let mut output = String::new();

    let _ = writeln!(output, "# CHI-311 Service Equity Report");
    let _ = writeln!(
        output,
        "Generated for {} (data last refreshed {}, model {}, features {})",
        category, meta.data_last_updated, meta.model_version, meta.feature_version
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Resolution Time by {}", area_type.label());

    if ranked.is_empty() {
        let _ = writeln!(output, "No closed requests recorded for this category.");
    } else {
        let _ = writeln!(
            output,
            "{} areas compared; {} significantly slower and {} significantly faster than the city.",
            overview.areas, overview.slower, overview.faster
        );
        let _ = writeln!(output);
        let _ = writeln!(
            output,
            "| {} | Median days | City median | Delta | Requests | Significant |",
            area_type.label()
        );
        let _ = writeln!(output, "|---|---|---|---|---|---|");
        for result in &ranked {
            let _ = writeln!(
                output,
                "| {} | {:.1} | {:.1} | {:+.1} | {} | {} |",
                result.area_name,
                result.area_median,
                result.city_median,
                result.delta_days,
                result.n,
                if result.significance { "yes" } else { "no" }
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Hotspots (last {days} days)");

    if hotspots.is_empty() {
        let _ = writeln!(output, "No clusters of unresolved requests in this window.");
    } else {
        for hotspot in hotspots {
            let _ = writeln!(
                output,
                "- ({:.4}, {:.4}): {} unresolved, 7-day trend {}, 30-day trend {}",
                hotspot.center.lat,
                hotspot.center.lon,
                hotspot.count,
                trend_label(hotspot.trend_7d),
                trend_label(hotspot.trend_30d)
            );
        }
    }

    output
}
