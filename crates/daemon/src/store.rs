use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::PathBuf;
use std::str::FromStr;

use crate::analysis::DerivedMedia;
use crate::models::{
    FailureCategory, HdrFormat, Library, MediaSource, ServiceConfig, Stage, Video, VideoFailure,
    VideoState, Vmaf,
};

/// All persisted state lives behind this handle. Selector queries are the
/// canonical definition of per-stage eligibility; each one is a single
/// indexed read.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

/// Row as the ingester collaborator creates it; everything else is derived
/// later by the analysis stage.
#[derive(Debug, Clone, Default)]
pub struct NewVideo {
    pub path: PathBuf,
    pub size: u64,
    pub bitrate: Option<u64>,
    pub service_type: Option<MediaSource>,
    pub service_id: Option<i64>,
    pub library_id: Option<i64>,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS libraries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT NOT NULL UNIQUE,
        monitor INTEGER NOT NULL DEFAULT 1
    )",
    "CREATE TABLE IF NOT EXISTS videos (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        service_type TEXT,
        service_id INTEGER,
        path TEXT NOT NULL UNIQUE,
        size INTEGER NOT NULL DEFAULT 0,
        bitrate INTEGER,
        duration REAL,
        width INTEGER,
        height INTEGER,
        frame_rate REAL,
        max_audio_channels INTEGER,
        audio_codecs TEXT NOT NULL DEFAULT '[]',
        video_codecs TEXT NOT NULL DEFAULT '[]',
        hdr TEXT,
        atmos INTEGER NOT NULL DEFAULT 0,
        state TEXT NOT NULL DEFAULT 'needs-analysis',
        failed INTEGER NOT NULL DEFAULT 0,
        mediainfo TEXT,
        library_id INTEGER REFERENCES libraries(id),
        inserted_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(service_type, service_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_videos_analysis_queue
        ON videos(state, failed, inserted_at)",
    "CREATE INDEX IF NOT EXISTS idx_videos_search_queue
        ON videos(state, failed, bitrate DESC, size DESC)",
    "CREATE TABLE IF NOT EXISTS vmafs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        video_id INTEGER NOT NULL REFERENCES videos(id),
        crf REAL NOT NULL,
        score REAL NOT NULL,
        predicted_filesize INTEGER NOT NULL DEFAULT 0,
        percent REAL NOT NULL DEFAULT 0,
        chosen INTEGER NOT NULL DEFAULT 0,
        params TEXT NOT NULL DEFAULT '[]',
        target REAL NOT NULL,
        inserted_at TEXT NOT NULL,
        UNIQUE(video_id, crf)
    )",
    "CREATE INDEX IF NOT EXISTS idx_vmafs_chosen ON vmafs(video_id, chosen)",
    "CREATE TABLE IF NOT EXISTS services (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL UNIQUE,
        base_url TEXT NOT NULL,
        api_key TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS video_failures (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        video_id INTEGER NOT NULL REFERENCES videos(id),
        stage TEXT NOT NULL,
        category TEXT NOT NULL,
        code TEXT NOT NULL,
        message TEXT NOT NULL,
        context TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        resolved INTEGER NOT NULL DEFAULT 0,
        inserted_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_failures_video ON video_failures(video_id, stage)",
];

impl Store {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Store> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid database url: {}", url))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("Failed to open database")?;

        Ok(Store { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Idempotent schema bootstrap, run once at boot before any stage starts.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Schema bootstrap failed")?;
        }
        Ok(())
    }

    // ---- video lifecycle -------------------------------------------------

    pub async fn insert_video(&self, new: NewVideo) -> Result<Video> {
        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO videos
                (path, size, bitrate, service_type, service_id, library_id,
                 state, failed, inserted_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, 'needs-analysis', 0, ?, ?)
             RETURNING *",
        )
        .bind(new.path.to_string_lossy().to_string())
        .bind(new.size as i64)
        .bind(Video::normalized_bitrate(new.bitrate).map(|b| b as i64))
        .bind(new.service_type.map(|s| s.as_str().to_string()))
        .bind(new.service_id)
        .bind(new.library_id)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert video")?;

        video_from_row(&row)
    }

    pub async fn fetch_video(&self, id: i64) -> Result<Option<Video>> {
        let row = sqlx::query("SELECT * FROM videos WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(video_from_row).transpose()
    }

    /// Persist the probe document and every derived field in one write.
    /// Pure function of the probe output, so re-running analysis on the same
    /// document leaves the row unchanged.
    pub async fn apply_analysis(
        &self,
        video_id: i64,
        mediainfo: &str,
        derived: &DerivedMedia,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE videos SET
                size = COALESCE(?, size),
                bitrate = ?,
                duration = ?,
                width = ?,
                height = ?,
                frame_rate = ?,
                max_audio_channels = ?,
                audio_codecs = ?,
                video_codecs = ?,
                hdr = ?,
                atmos = ?,
                mediainfo = ?,
                updated_at = ?
             WHERE id = ?",
        )
        .bind(derived.size.map(|s| s as i64))
        .bind(Video::normalized_bitrate(derived.bitrate).map(|b| b as i64))
        .bind(derived.duration)
        .bind(derived.width)
        .bind(derived.height)
        .bind(derived.frame_rate)
        .bind(derived.max_audio_channels)
        .bind(serde_json::to_string(&derived.audio_codecs)?)
        .bind(serde_json::to_string(&derived.video_codecs)?)
        .bind(derived.hdr.map(|h| h.as_str().to_string()))
        .bind(derived.atmos)
        .bind(mediainfo)
        .bind(Utc::now())
        .bind(video_id)
        .execute(&self.pool)
        .await
        .context("Failed to apply analysis")?;
        Ok(())
    }

    /// Guarded monotonic state advance. Returns false when the row was not
    /// in the expected `from` state (another writer got there first).
    pub async fn advance_state(&self, video_id: i64, from: VideoState, to: VideoState) -> Result<bool> {
        if !from.can_advance_to(to) {
            anyhow::bail!("illegal state transition {} -> {}", from, to);
        }

        let result = sqlx::query(
            "UPDATE videos SET state = ?, updated_at = ? WHERE id = ? AND state = ?",
        )
        .bind(to.as_str())
        .bind(Utc::now())
        .bind(video_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Mark one video failed; its state is left where it was.
    pub async fn mark_failed(&self, video_id: i64) -> Result<()> {
        sqlx::query("UPDATE videos SET failed = 1, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(video_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Operator bulk reset: every failed video goes back to the front of the
    /// pipeline. VMAF rows are left alone; re-runs overwrite them.
    pub async fn reset_failed(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE videos SET failed = 0, state = 'needs-analysis', updated_at = ?
             WHERE failed = 1",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Refresh file attributes from the post-encode re-probe.
    pub async fn update_after_encode(
        &self,
        video_id: i64,
        size: u64,
        bitrate: Option<u64>,
        video_codecs: &[String],
        audio_codecs: &[String],
        mediainfo: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE videos SET
                size = ?, bitrate = ?, video_codecs = ?, audio_codecs = ?,
                mediainfo = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(size as i64)
        .bind(Video::normalized_bitrate(bitrate).map(|b| b as i64))
        .bind(serde_json::to_string(video_codecs)?)
        .bind(serde_json::to_string(audio_codecs)?)
        .bind(mediainfo)
        .bind(Utc::now())
        .bind(video_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- selector queries ------------------------------------------------

    /// Analysis queue: plain FIFO on insertion time. `library_id` narrows
    /// the queue to one library root; `None` spans them all.
    pub async fn next_for_analysis(&self, n: i64, library_id: Option<i64>) -> Result<Vec<Video>> {
        let rows = sqlx::query(
            "SELECT * FROM videos
             WHERE state = 'needs-analysis' AND failed = 0
               AND (? IS NULL OR library_id = ?)
             ORDER BY inserted_at ASC
             LIMIT ?",
        )
        .bind(library_id)
        .bind(library_id)
        .bind(n)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(video_from_row).collect()
    }

    /// CRF-search queue: biggest compression opportunity first. Videos
    /// already in the target codec are skipped entirely.
    pub async fn next_for_crf_search(
        &self,
        n: i64,
        target_codec: &str,
        library_id: Option<i64>,
    ) -> Result<Vec<Video>> {
        let rows = sqlx::query(
            "SELECT * FROM videos
             WHERE state = 'analyzed' AND failed = 0
               AND video_codecs NOT LIKE '%\"' || ? || '\"%'
               AND (? IS NULL OR library_id = ?)
             ORDER BY bitrate DESC, size DESC
             LIMIT ?",
        )
        .bind(target_codec)
        .bind(library_id)
        .bind(library_id)
        .bind(n)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(video_from_row).collect()
    }

    /// Encoder queue: joined to the chosen VMAF, biggest expected savings
    /// first so storage wins are realized early.
    pub async fn next_for_encoding(
        &self,
        n: i64,
        library_id: Option<i64>,
    ) -> Result<Vec<(Video, Vmaf)>> {
        let rows = sqlx::query(
            "SELECT v.*,
                    m.id AS vmaf_id,
                    m.video_id AS vmaf_video_id,
                    m.crf AS vmaf_crf,
                    m.score AS vmaf_score,
                    m.predicted_filesize AS vmaf_predicted_filesize,
                    m.percent AS vmaf_percent,
                    m.chosen AS vmaf_chosen,
                    m.params AS vmaf_params,
                    m.target AS vmaf_target,
                    m.inserted_at AS vmaf_inserted_at
             FROM videos v
             JOIN vmafs m ON m.video_id = v.id AND m.chosen = 1
             WHERE v.state = 'crf-searched' AND v.failed = 0
               AND (? IS NULL OR v.library_id = ?)
             ORDER BY (v.size - m.predicted_filesize) DESC
             LIMIT ?",
        )
        .bind(library_id)
        .bind(library_id)
        .bind(n)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok((video_from_row(row)?, vmaf_from_prefixed_row(row)?)))
            .collect()
    }

    // ---- vmaf samples ----------------------------------------------------

    /// Record one search sample. Re-running a search overwrites the sample
    /// at the same CRF instead of accumulating stale duplicates.
    pub async fn upsert_vmaf(
        &self,
        video_id: i64,
        crf: f64,
        score: f64,
        predicted_filesize: u64,
        percent: f64,
        params: &[String],
        target: f64,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO vmafs
                (video_id, crf, score, predicted_filesize, percent, chosen,
                 params, target, inserted_at)
             VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?)
             ON CONFLICT(video_id, crf) DO UPDATE SET
                score = excluded.score,
                predicted_filesize = excluded.predicted_filesize,
                percent = excluded.percent,
                chosen = 0,
                params = excluded.params,
                target = excluded.target
             RETURNING id",
        )
        .bind(video_id)
        .bind(crf)
        .bind(score)
        .bind(predicted_filesize as i64)
        .bind(percent)
        .bind(serde_json::to_string(params)?)
        .bind(target)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    /// Among samples meeting the target, mark the highest-CRF one chosen.
    /// Atomic: concurrent calls leave exactly one chosen row per video.
    pub async fn choose_best_vmaf(&self, video_id: i64, target: f64) -> Result<Option<Vmaf>> {
        let mut tx = self.pool.begin().await?;

        let best = sqlx::query(
            "SELECT * FROM vmafs
             WHERE video_id = ? AND score >= ?
             ORDER BY crf DESC, score DESC
             LIMIT 1",
        )
        .bind(video_id)
        .bind(target)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = best else {
            tx.rollback().await?;
            return Ok(None);
        };
        let mut vmaf = vmaf_from_row(&row)?;

        sqlx::query("UPDATE vmafs SET chosen = 0 WHERE video_id = ?")
            .bind(video_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE vmafs SET chosen = 1 WHERE id = ?")
            .bind(vmaf.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        vmaf.chosen = true;
        Ok(Some(vmaf))
    }

    /// How many samples for a video meet the target score.
    pub async fn acceptable_vmaf_count(&self, video_id: i64, target: f64) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM vmafs WHERE video_id = ? AND score >= ?")
            .bind(video_id)
            .bind(target)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn chosen_vmaf(&self, video_id: i64) -> Result<Option<Vmaf>> {
        let row = sqlx::query("SELECT * FROM vmafs WHERE video_id = ? AND chosen = 1")
            .bind(video_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(vmaf_from_row).transpose()
    }

    /// Replace the remembered search params on one sample (used when a
    /// fallback preset must be replayed by the encode stage).
    pub async fn set_vmaf_params(&self, vmaf_id: i64, params: &[String]) -> Result<()> {
        sqlx::query("UPDATE vmafs SET params = ? WHERE id = ?")
            .bind(serde_json::to_string(params)?)
            .bind(vmaf_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- failure audit log -----------------------------------------------

    /// Append to the audit log. `retry_count` is the number of earlier
    /// entries for the same (video, stage).
    pub async fn record_failure(
        &self,
        video_id: i64,
        stage: Stage,
        category: FailureCategory,
        code: &str,
        message: &str,
        context: Option<&str>,
    ) -> Result<i64> {
        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO video_failures
                (video_id, stage, category, code, message, context,
                 retry_count, resolved, inserted_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?,
                     (SELECT COUNT(*) FROM video_failures WHERE video_id = ? AND stage = ?),
                     0, ?, ?)
             RETURNING id",
        )
        .bind(video_id)
        .bind(stage.as_str())
        .bind(category.as_str())
        .bind(code)
        .bind(message)
        .bind(context)
        .bind(video_id)
        .bind(stage.as_str())
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    /// Operator acknowledgment only; does not retry anything.
    pub async fn resolve_failure(&self, failure_id: i64) -> Result<()> {
        sqlx::query("UPDATE video_failures SET resolved = 1, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(failure_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn failures_for_video(&self, video_id: i64) -> Result<Vec<VideoFailure>> {
        let rows = sqlx::query(
            "SELECT * FROM video_failures WHERE video_id = ? ORDER BY inserted_at ASC, id ASC",
        )
        .bind(video_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(failure_from_row).collect()
    }

    // ---- libraries and services -------------------------------------------

    pub async fn insert_library(&self, path: &std::path::Path, monitor: bool) -> Result<Library> {
        let row = sqlx::query("INSERT INTO libraries (path, monitor) VALUES (?, ?) RETURNING *")
            .bind(path.to_string_lossy().to_string())
            .bind(monitor)
            .fetch_one(&self.pool)
            .await?;
        library_from_row(&row)
    }

    pub async fn list_libraries(&self) -> Result<Vec<Library>> {
        let rows = sqlx::query("SELECT * FROM libraries ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(library_from_row).collect()
    }

    pub async fn upsert_service(&self, kind: MediaSource, base_url: &str, api_key: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO services (kind, base_url, api_key) VALUES (?, ?, ?)
             ON CONFLICT(kind) DO UPDATE SET base_url = excluded.base_url,
                                             api_key = excluded.api_key",
        )
        .bind(kind.as_str())
        .bind(base_url)
        .bind(api_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_services(&self) -> Result<Vec<ServiceConfig>> {
        let rows = sqlx::query("SELECT * FROM services ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(service_from_row).collect()
    }
}

// ---- row mapping ---------------------------------------------------------

fn json_list(raw: &str) -> Result<Vec<String>> {
    serde_json::from_str(raw).context("Malformed JSON list column")
}

fn video_from_row(row: &SqliteRow) -> Result<Video> {
    let state_raw: String = row.try_get("state")?;
    let state = VideoState::parse(&state_raw)
        .with_context(|| format!("Unknown video state {:?}", state_raw))?;

    let hdr = row
        .try_get::<Option<String>, _>("hdr")?
        .as_deref()
        .and_then(HdrFormat::parse);

    let service_type = row
        .try_get::<Option<String>, _>("service_type")?
        .as_deref()
        .and_then(MediaSource::parse);

    let audio_codecs: String = row.try_get("audio_codecs")?;
    let video_codecs: String = row.try_get("video_codecs")?;

    Ok(Video {
        id: row.try_get("id")?,
        service_type,
        service_id: row.try_get("service_id")?,
        path: PathBuf::from(row.try_get::<String, _>("path")?),
        size: row.try_get::<i64, _>("size")? as u64,
        bitrate: Video::normalized_bitrate(
            row.try_get::<Option<i64>, _>("bitrate")?.map(|b| b as u64),
        ),
        duration: row.try_get("duration")?,
        width: row.try_get("width")?,
        height: row.try_get("height")?,
        frame_rate: row.try_get("frame_rate")?,
        max_audio_channels: row.try_get("max_audio_channels")?,
        audio_codecs: json_list(&audio_codecs)?,
        video_codecs: json_list(&video_codecs)?,
        hdr,
        atmos: row.try_get("atmos")?,
        state,
        failed: row.try_get("failed")?,
        mediainfo: row.try_get("mediainfo")?,
        library_id: row.try_get("library_id")?,
        inserted_at: row.try_get::<DateTime<Utc>, _>("inserted_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn vmaf_fields(
    row: &SqliteRow,
    id: &str,
    video_id: &str,
    crf: &str,
    score: &str,
    predicted: &str,
    percent: &str,
    chosen: &str,
    params: &str,
    target: &str,
    inserted_at: &str,
) -> Result<Vmaf> {
    let params_raw: String = row.try_get(params)?;
    Ok(Vmaf {
        id: row.try_get(id)?,
        video_id: row.try_get(video_id)?,
        crf: row.try_get(crf)?,
        score: row.try_get(score)?,
        predicted_filesize: row.try_get::<i64, _>(predicted)? as u64,
        percent: row.try_get(percent)?,
        chosen: row.try_get(chosen)?,
        params: json_list(&params_raw)?,
        target: row.try_get(target)?,
        inserted_at: row.try_get::<DateTime<Utc>, _>(inserted_at)?,
    })
}

fn vmaf_from_row(row: &SqliteRow) -> Result<Vmaf> {
    vmaf_fields(
        row,
        "id",
        "video_id",
        "crf",
        "score",
        "predicted_filesize",
        "percent",
        "chosen",
        "params",
        "target",
        "inserted_at",
    )
}

fn vmaf_from_prefixed_row(row: &SqliteRow) -> Result<Vmaf> {
    vmaf_fields(
        row,
        "vmaf_id",
        "vmaf_video_id",
        "vmaf_crf",
        "vmaf_score",
        "vmaf_predicted_filesize",
        "vmaf_percent",
        "vmaf_chosen",
        "vmaf_params",
        "vmaf_target",
        "vmaf_inserted_at",
    )
}

fn library_from_row(row: &SqliteRow) -> Result<Library> {
    Ok(Library {
        id: row.try_get("id")?,
        path: PathBuf::from(row.try_get::<String, _>("path")?),
        monitor: row.try_get("monitor")?,
    })
}

fn service_from_row(row: &SqliteRow) -> Result<ServiceConfig> {
    let kind_raw: String = row.try_get("kind")?;
    Ok(ServiceConfig {
        id: row.try_get("id")?,
        kind: MediaSource::parse(&kind_raw)
            .with_context(|| format!("Unknown service kind {:?}", kind_raw))?,
        base_url: row.try_get("base_url")?,
        api_key: row.try_get("api_key")?,
    })
}

fn failure_from_row(row: &SqliteRow) -> Result<VideoFailure> {
    let stage_raw: String = row.try_get("stage")?;
    let stage = match stage_raw.as_str() {
        "analyzer" => Stage::Analyzer,
        "crf_search" => Stage::CrfSearch,
        "encoder" => Stage::Encoder,
        other => anyhow::bail!("Unknown stage {:?}", other),
    };
    let category_raw: String = row.try_get("category")?;
    let category = FailureCategory::parse(&category_raw)
        .with_context(|| format!("Unknown failure category {:?}", category_raw))?;

    Ok(VideoFailure {
        id: row.try_get("id")?,
        video_id: row.try_get("video_id")?,
        stage,
        category,
        code: row.try_get("code")?,
        message: row.try_get("message")?,
        context: row.try_get("context")?,
        retry_count: row.try_get("retry_count")?,
        resolved: row.try_get("resolved")?,
        inserted_at: row.try_get::<DateTime<Utc>, _>("inserted_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}
