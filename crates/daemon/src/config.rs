use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::models::{MediaSource, Stage};

/// Process-wide settings, resolved once at boot. Not hot-reloadable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub tool: ToolSettings,
    pub pipeline: PipelineSettings,
    pub crf_search: CrfSearchSettings,
    pub encode: EncodeSettings,
    pub notify: NotifySettings,
    /// Library sources to notify after a successful encode.
    pub services: Vec<ServiceSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "sqlite:shrinkarr.db".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    /// Name or absolute path of the ab-av1 binary.
    pub ab_av1_bin: String,
    pub ffprobe_bin: String,
    /// Working directory for in-progress encodes; safe to wipe when idle.
    pub tmp_dir: PathBuf,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            ab_av1_bin: "ab-av1".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
            tmp_dir: PathBuf::from("/var/lib/shrinkarr/tmp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Messages each stage may start per rate-limit interval.
    pub rate_limit_messages: u32,
    pub rate_limit_interval_ms: u64,
    /// Videos probed per analyzer message.
    pub analysis_batch_size: usize,
    /// Probe subprocesses running concurrently inside one analyzer message.
    pub analysis_concurrency: usize,
    /// Idle re-poll so rows inserted by ingesters are picked up without a poke.
    pub queue_poll_interval_secs: u64,
    /// Restrict every stage queue to one library root; unset spans them all.
    pub library_scope: Option<i64>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            rate_limit_messages: 5,
            rate_limit_interval_ms: 1000,
            analysis_batch_size: 5,
            analysis_concurrency: 4,
            queue_poll_interval_secs: 60,
            library_scope: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrfSearchSettings {
    /// Minimum acceptable VMAF score.
    pub vmaf_target: f64,
    pub timeout_ms: u64,
    pub warn_threshold_ms: u64,
    pub kill_threshold_ms: u64,
}

impl Default for CrfSearchSettings {
    fn default() -> Self {
        Self {
            vmaf_target: 95.0,
            timeout_ms: 14_400_000, // 4 hours
            warn_threshold_ms: 1_800_000,
            kill_threshold_ms: 3_600_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeSettings {
    pub timeout_ms: u64,
    pub warn_threshold_ms: u64,
    pub kill_threshold_ms: u64,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 2_592_000_000, // 30 days
            warn_threshold_ms: 82_800_000,
            kill_threshold_ms: 86_400_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    pub max_attempts: u32,
    pub backoff_cap_secs: u64,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_cap_secs: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSettings {
    pub kind: MediaSource,
    pub base_url: String,
    pub api_key: String,
}

impl Settings {
    pub fn watchdog_warn_threshold_ms(&self, stage: Stage) -> u64 {
        match stage {
            Stage::CrfSearch => self.crf_search.warn_threshold_ms,
            Stage::Encoder => self.encode.warn_threshold_ms,
            // Probes are short; the subprocess timeout bounds them instead.
            Stage::Analyzer => self.crf_search.warn_threshold_ms,
        }
    }

    pub fn watchdog_kill_threshold_ms(&self, stage: Stage) -> u64 {
        match stage {
            Stage::CrfSearch => self.crf_search.kill_threshold_ms,
            Stage::Encoder => self.encode.kill_threshold_ms,
            Stage::Analyzer => self.crf_search.kill_threshold_ms,
        }
    }
}

pub fn load_settings(path: Option<&std::path::Path>) -> Result<Settings> {
    let settings = if let Some(config_path) = path {
        if config_path.exists() {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

            toml::from_str::<Settings>(&contents)
                .map_err(|e| anyhow::anyhow!("Failed to parse TOML config: {}", e))?
        } else {
            #[cfg(not(test))]
            tracing::warn!("Config file not found at {:?}, using defaults", config_path);
            Settings::default()
        }
    } else {
        #[cfg(not(test))]
        tracing::info!("No config path provided, using defaults");
        Settings::default()
    };

    validate_settings(&settings)?;
    Ok(settings)
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.database.url.is_empty() {
        anyhow::bail!("database.url cannot be empty");
    }

    if settings.pipeline.rate_limit_messages == 0 {
        anyhow::bail!("pipeline.rate_limit_messages must be at least 1");
    }

    if settings.pipeline.rate_limit_interval_ms == 0 {
        anyhow::bail!("pipeline.rate_limit_interval_ms must be at least 1");
    }

    if settings.pipeline.analysis_batch_size == 0 {
        anyhow::bail!("pipeline.analysis_batch_size must be at least 1");
    }

    if settings.pipeline.analysis_concurrency == 0 {
        anyhow::bail!("pipeline.analysis_concurrency must be at least 1");
    }

    if !(0.0..=100.0).contains(&settings.crf_search.vmaf_target) {
        anyhow::bail!("crf_search.vmaf_target must be between 0 and 100");
    }

    for (label, warn, kill) in [
        (
            "crf_search",
            settings.crf_search.warn_threshold_ms,
            settings.crf_search.kill_threshold_ms,
        ),
        (
            "encode",
            settings.encode.warn_threshold_ms,
            settings.encode.kill_threshold_ms,
        ),
    ] {
        if warn == 0 || kill == 0 {
            anyhow::bail!("{}.warn/kill thresholds must be non-zero", label);
        }
        if warn >= kill {
            anyhow::bail!("{}.warn_threshold_ms must be below kill_threshold_ms", label);
        }
    }

    if settings.notify.max_attempts == 0 {
        anyhow::bail!("notify.max_attempts must be at least 1");
    }

    for service in &settings.services {
        if service.base_url.is_empty() {
            anyhow::bail!("services entry is missing base_url");
        }
    }

    Ok(())
}
