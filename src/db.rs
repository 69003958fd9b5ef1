use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::ingest;
use crate::models::{RefreshMeta, ServiceRequest};
use crate::store::{RequestStore, SharedStore};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn at(date: (i32, u32, u32), time: (u32, u32)) -> anyhow::Result<NaiveDateTime> {
    NaiveDate::from_ymd_opt(date.0, date.1, date.2)
        .and_then(|d| d.and_hms_opt(time.0, time.1, 0))
        .context("invalid date")
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let requests = vec![
        ServiceRequest {
            sr_number: "SR24-00112233".into(),
            category: "Pothole in Street".into(),
            status: "Completed".into(),
            created_at: at((2024, 7, 1), (8, 15))?,
            closed_at: Some(at((2024, 7, 12), (14, 0))?),
            ward: 12,
            community_area: 31,
            latitude: 41.8512,
            longitude: -87.6611,
        },
        ServiceRequest {
            sr_number: "SR24-00112987".into(),
            category: "Pothole in Street".into(),
            status: "Completed".into(),
            created_at: at((2024, 7, 9), (10, 40))?,
            closed_at: Some(at((2024, 7, 26), (9, 5))?),
            ward: 12,
            community_area: 31,
            latitude: 41.8498,
            longitude: -87.6642,
        },
        ServiceRequest {
            sr_number: "SR24-00118450".into(),
            category: "Street Lights - All/Out".into(),
            status: "Completed".into(),
            created_at: at((2024, 7, 15), (19, 20))?,
            closed_at: Some(at((2024, 8, 2), (11, 30))?),
            ward: 25,
            community_area: 28,
            latitude: 41.8731,
            longitude: -87.6498,
        },
        ServiceRequest {
            sr_number: "SR24-00120004".into(),
            category: "Sanitation Code Violation".into(),
            status: "Open".into(),
            created_at: at((2024, 8, 5), (9, 0))?,
            closed_at: None,
            ward: 25,
            community_area: 28,
            latitude: 41.8702,
            longitude: -87.6531,
        },
        ServiceRequest {
            sr_number: "SR24-00121771".into(),
            category: "Pothole in Street".into(),
            status: "Open".into(),
            created_at: at((2024, 8, 19), (7, 55))?,
            closed_at: None,
            ward: 12,
            community_area: 31,
            latitude: 41.8505,
            longitude: -87.6620,
        },
    ];

    for request in &requests {
        upsert_request(pool, request).await?;
    }

    Ok(())
}

/// Inserts a request, or records its closure. A stored closure is never
/// overwritten.
async fn upsert_request(pool: &PgPool, request: &ServiceRequest) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO chi311.service_requests
        (sr_number, category, status, created_date, closed_date, ward, community_area, latitude, longitude)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (sr_number) DO UPDATE
        SET closed_date = EXCLUDED.closed_date, status = EXCLUDED.status, imported_at = now()
        WHERE chi311.service_requests.closed_date IS NULL
        "#,
    )
    .bind(&request.sr_number)
    .bind(&request.category)
    .bind(&request.status)
    .bind(request.created_at)
    .bind(request.closed_at)
    .bind(request.ward)
    .bind(request.community_area)
    .bind(request.latitude)
    .bind(request.longitude)
    .execute(pool)
    .await?;

    Ok(())
}

#[derive(Debug, Default)]
pub struct ImportSummary {
    pub written: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

/// New requests and first-time closures go through the store's single
/// writer; only the records it reports as changed are written back.
pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<ImportSummary> {
    let parsed = ingest::read_export(csv_path)
        .with_context(|| format!("failed to read {}", csv_path.display()))?;
    let received = parsed.requests.len();

    let existing = RequestStore::from_records(fetch_requests(pool).await?)
        .context("stored requests are inconsistent")?;
    let store = SharedStore::new(existing);
    let changed = store
        .apply(parsed.requests)
        .context("export conflicts with stored requests")?;

    for request in &changed {
        upsert_request(pool, request).await?;
    }

    let summary = ImportSummary {
        written: changed.len(),
        unchanged: received.saturating_sub(changed.len()),
        skipped: parsed.skipped,
    };
    info!(
        written = summary.written,
        unchanged = summary.unchanged,
        skipped = summary.skipped,
        total = store.snapshot().len(),
        "imported service requests"
    );
    Ok(summary)
}

pub async fn fetch_requests(pool: &PgPool) -> anyhow::Result<Vec<ServiceRequest>> {
    let rows = sqlx::query(
        "SELECT sr_number, category, status, created_date, closed_date, \
         ward, community_area, latitude, longitude \
         FROM chi311.service_requests \
         ORDER BY created_date, sr_number",
    )
    .fetch_all(pool)
    .await?;

    let mut requests = Vec::with_capacity(rows.len());

    for row in rows {
        requests.push(ServiceRequest {
            sr_number: row.get("sr_number"),
            category: row.get("category"),
            status: row.get("status"),
            created_at: row.get("created_date"),
            closed_at: row.get("closed_date"),
            ward: row.get("ward"),
            community_area: row.get("community_area"),
            latitude: row.get("latitude"),
            longitude: row.get("longitude"),
        });
    }

    Ok(requests)
}

pub async fn latest_import(pool: &PgPool) -> anyhow::Result<Option<DateTime<Utc>>> {
    let row = sqlx::query("SELECT max(imported_at) AS latest FROM chi311.service_requests")
        .fetch_one(pool)
        .await?;
    Ok(row.get("latest"))
}

pub async fn latest_refresh(pool: &PgPool) -> anyhow::Result<Option<RefreshMeta>> {
    let row = sqlx::query(
        "SELECT data_last_updated, model_version, feature_version \
         FROM chi311.refresh_runs \
         ORDER BY recorded_at DESC \
         LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| RefreshMeta {
        data_last_updated: row.get("data_last_updated"),
        model_version: row.get("model_version"),
        feature_version: row.get("feature_version"),
    }))
}

pub async fn record_refresh(pool: &PgPool, meta: &RefreshMeta) -> anyhow::Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO chi311.refresh_runs (id, data_last_updated, model_version, feature_version)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(id)
    .bind(meta.data_last_updated)
    .bind(&meta.model_version)
    .bind(&meta.feature_version)
    .execute(pool)
    .await?;

    Ok(id)
}
