use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Pipeline stage. Each stage runs as an independent producer/processor
/// pair and publishes on its own event-bus topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Analyzer,
    CrfSearch,
    Encoder,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Analyzer => "analyzer",
            Stage::CrfSearch => "crf_search",
            Stage::Encoder => "encoder",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing state of a video. Advances monotonically; `failed` on the
/// video row is orthogonal and never encoded as a state value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VideoState {
    NeedsAnalysis,
    Analyzed,
    CrfSearched,
    Encoded,
}

impl VideoState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoState::NeedsAnalysis => "needs-analysis",
            VideoState::Analyzed => "analyzed",
            VideoState::CrfSearched => "crf-searched",
            VideoState::Encoded => "encoded",
        }
    }

    pub fn parse(s: &str) -> Option<VideoState> {
        match s {
            "needs-analysis" => Some(VideoState::NeedsAnalysis),
            "analyzed" => Some(VideoState::Analyzed),
            "crf-searched" => Some(VideoState::CrfSearched),
            "encoded" => Some(VideoState::Encoded),
            _ => None,
        }
    }

    fn ordinal(&self) -> u8 {
        match self {
            VideoState::NeedsAnalysis => 0,
            VideoState::Analyzed => 1,
            VideoState::CrfSearched => 2,
            VideoState::Encoded => 3,
        }
    }

    /// A transition is legal only one step forward in processing order.
    /// Going backwards requires the explicit operator reset, which is not a
    /// transition but a row rewrite.
    pub fn can_advance_to(&self, next: VideoState) -> bool {
        next.ordinal() == self.ordinal() + 1
    }

    /// The stage whose successful completion produces this state.
    pub fn produced_by(&self) -> Option<Stage> {
        match self {
            VideoState::NeedsAnalysis => None,
            VideoState::Analyzed => Some(Stage::Analyzer),
            VideoState::CrfSearched => Some(Stage::CrfSearch),
            VideoState::Encoded => Some(Stage::Encoder),
        }
    }
}

impl fmt::Display for VideoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HDR transfer metadata detected during analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HdrFormat {
    #[serde(rename = "HDR10")]
    Hdr10,
    #[serde(rename = "HDR10+")]
    Hdr10Plus,
    #[serde(rename = "DolbyVision")]
    DolbyVision,
    #[serde(rename = "HLG")]
    Hlg,
}

impl HdrFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            HdrFormat::Hdr10 => "HDR10",
            HdrFormat::Hdr10Plus => "HDR10+",
            HdrFormat::DolbyVision => "DolbyVision",
            HdrFormat::Hlg => "HLG",
        }
    }

    pub fn parse(s: &str) -> Option<HdrFormat> {
        match s {
            "HDR10" => Some(HdrFormat::Hdr10),
            "HDR10+" => Some(HdrFormat::Hdr10Plus),
            "DolbyVision" => Some(HdrFormat::DolbyVision),
            "HLG" => Some(HdrFormat::Hlg),
            _ => None,
        }
    }
}

/// Which kind of external library source owns a video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaSource {
    #[serde(rename = "movies-source")]
    Movies,
    #[serde(rename = "series-source")]
    Series,
}

impl MediaSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaSource::Movies => "movies-source",
            MediaSource::Series => "series-source",
        }
    }

    pub fn parse(s: &str) -> Option<MediaSource> {
        match s {
            "movies-source" => Some(MediaSource::Movies),
            "series-source" => Some(MediaSource::Series),
            _ => None,
        }
    }
}

/// Primary entity: one managed video file and its pipeline position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Video {
    pub id: i64,
    pub service_type: Option<MediaSource>,
    pub service_id: Option<i64>,

    pub path: PathBuf,
    pub size: u64,
    /// Bits per second. Zero from an ingester is normalized to `None`.
    pub bitrate: Option<u64>,
    pub duration: Option<f64>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub frame_rate: Option<f64>,
    pub max_audio_channels: Option<i32>,
    pub audio_codecs: Vec<String>,
    pub video_codecs: Vec<String>,
    pub hdr: Option<HdrFormat>,
    pub atmos: bool,

    pub state: VideoState,
    pub failed: bool,

    /// Raw probe document the derived fields came from.
    pub mediainfo: Option<String>,
    pub library_id: Option<i64>,

    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Video {
    /// Zero bitrate means the ingester had nothing; treat as absent.
    pub fn normalized_bitrate(raw: Option<u64>) -> Option<u64> {
        raw.filter(|b| *b > 0)
    }
}

/// One sample from the CRF-search stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vmaf {
    pub id: i64,
    pub video_id: i64,
    pub crf: f64,
    /// Perceptual quality score, 0-100.
    pub score: f64,
    pub predicted_filesize: u64,
    /// Predicted size / original size * 100.
    pub percent: f64,
    pub chosen: bool,
    /// Extra arguments the successful search ran with; replayed verbatim by
    /// the encode stage.
    pub params: Vec<String>,
    /// Minimum acceptable score the search was asked for.
    pub target: f64,
    pub inserted_at: DateTime<Utc>,
}

/// A library root; scopes selector queries and savings rollups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Library {
    pub id: i64,
    pub path: PathBuf,
    pub monitor: bool,
}

/// External source connection details, one row per source. Written by the
/// ingester collaborator; the pipeline only reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub id: i64,
    pub kind: MediaSource,
    pub base_url: String,
    pub api_key: String,
}

/// Failure taxonomy recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Per-file; the stage continued with the next item.
    Recoverable,
    /// Systemic; the stage producer was paused.
    StageCritical,
    /// Encode succeeded but the move/notify step did not commit it.
    PostProcess,
    /// The watchdog force-killed a silent subprocess.
    Stalled,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Recoverable => "recoverable",
            FailureCategory::StageCritical => "stage_critical",
            FailureCategory::PostProcess => "post_process",
            FailureCategory::Stalled => "stalled",
        }
    }

    pub fn parse(s: &str) -> Option<FailureCategory> {
        match s {
            "recoverable" => Some(FailureCategory::Recoverable),
            "stage_critical" => Some(FailureCategory::StageCritical),
            "post_process" => Some(FailureCategory::PostProcess),
            "stalled" => Some(FailureCategory::Stalled),
            _ => None,
        }
    }
}

/// One row of the `video_failures` audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoFailure {
    pub id: i64,
    pub video_id: i64,
    pub stage: Stage,
    pub category: FailureCategory,
    /// Machine-readable code, e.g. `exit_137` or `killed_stuck_process`.
    pub code: String,
    pub message: String,
    /// Snapshot of recent subprocess output and the argument list.
    pub context: Option<String>,
    pub retry_count: i64,
    pub resolved: bool,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
