use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;

use crate::store::Store;

/// Aggregate projection read by the UI collaborator at a fixed interval;
/// stages signal recomputation implicitly through their lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStats {
    pub total_videos: i64,
    pub needs_analysis: i64,
    pub analyzed: i64,
    pub crf_searched: i64,
    pub encoded: i64,
    pub failed: i64,
    pub chosen_vmafs: i64,
    /// Σ(original size − predicted size) over chosen samples.
    pub estimated_savings_bytes: i64,
    pub last_update: Option<DateTime<Utc>>,
}

/// Single-query snapshot; this is the one deliberately expensive read.
pub async fn snapshot(store: &Store) -> Result<PipelineStats> {
    let row = sqlx::query(
        "SELECT
            (SELECT COUNT(*) FROM videos) AS total_videos,
            (SELECT COUNT(*) FROM videos WHERE state = 'needs-analysis') AS needs_analysis,
            (SELECT COUNT(*) FROM videos WHERE state = 'analyzed') AS analyzed,
            (SELECT COUNT(*) FROM videos WHERE state = 'crf-searched') AS crf_searched,
            (SELECT COUNT(*) FROM videos WHERE state = 'encoded') AS encoded,
            (SELECT COUNT(*) FROM videos WHERE failed = 1) AS failed,
            (SELECT COUNT(*) FROM vmafs WHERE chosen = 1) AS chosen_vmafs,
            (SELECT COALESCE(SUM(v.size - m.predicted_filesize), 0)
               FROM vmafs m JOIN videos v ON v.id = m.video_id
              WHERE m.chosen = 1) AS estimated_savings_bytes,
            (SELECT MAX(updated_at) FROM videos) AS last_update",
    )
    .fetch_one(store.pool())
    .await?;

    Ok(PipelineStats {
        total_videos: row.try_get("total_videos")?,
        needs_analysis: row.try_get("needs_analysis")?,
        analyzed: row.try_get("analyzed")?,
        crf_searched: row.try_get("crf_searched")?,
        encoded: row.try_get("encoded")?,
        failed: row.try_get("failed")?,
        chosen_vmafs: row.try_get("chosen_vmafs")?,
        estimated_savings_bytes: row.try_get("estimated_savings_bytes")?,
        last_update: row.try_get("last_update")?,
    })
}

/// Savings rollup scoped to one library root.
pub async fn library_savings(store: &Store, library_id: i64) -> Result<i64> {
    let row = sqlx::query(
        "SELECT COALESCE(SUM(v.size - m.predicted_filesize), 0) AS savings
           FROM vmafs m JOIN videos v ON v.id = m.video_id
          WHERE m.chosen = 1 AND v.library_id = ?",
    )
    .bind(library_id)
    .fetch_one(store.pool())
    .await?;
    Ok(row.try_get("savings")?)
}
