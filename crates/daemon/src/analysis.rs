use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::StreamExt;
use serde::Deserialize;
use std::path::Path;
use tokio::process::Command;
use tracing::{error, warn};

use crate::classify::{classify, FailureAction, FailureKind};
use crate::events::{Event, EventBus};
use crate::models::{FailureCategory, HdrFormat, Stage, Video, VideoState};
use crate::pipeline::{PipelineHandle, StageHandler};
use crate::store::Store;
use std::sync::Arc;

/// Fields derived from one probe document. Derivation is a pure function of
/// the document, so re-probing an unchanged file is idempotent on the row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DerivedMedia {
    pub size: Option<u64>,
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
}

/// Raw probe document plus the fields derived from it.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub raw_json: String,
    pub derived: DerivedMedia,
}

// Internal ffprobe JSON structures
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    streams: Option<Vec<FfprobeStream>>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    size: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    profile: Option<String>,
    width: Option<i32>,
    height: Option<i32>,
    bit_rate: Option<String>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    channels: Option<i32>,
    color_transfer: Option<String>,
    side_data_list: Option<Vec<FfprobeSideData>>,
}

#[derive(Debug, Deserialize)]
struct FfprobeSideData {
    side_data_type: Option<String>,
}

/// Execute ffprobe on a file and derive the media attributes the pipeline
/// keys on.
pub async fn probe_file(ffprobe_bin: &str, path: &Path) -> Result<ProbeOutcome> {
    let output = Command::new(ffprobe_bin)
        .arg("-v")
        .arg("quiet")
        .arg("-print_format")
        .arg("json")
        .arg("-show_format")
        .arg("-show_streams")
        .arg(path)
        .output()
        .await
        .context("Failed to execute ffprobe")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("ffprobe failed: {}", stderr);
    }

    let raw_json =
        String::from_utf8(output.stdout).context("ffprobe output is not valid UTF-8")?;
    let derived = derive_media(&raw_json)?;

    Ok(ProbeOutcome { raw_json, derived })
}

/// Derive pipeline attributes from a raw probe document.
pub fn derive_media(raw_json: &str) -> Result<DerivedMedia> {
    let probe: FfprobeOutput =
        serde_json::from_str(raw_json).context("Failed to parse ffprobe JSON output")?;

    let mut derived = DerivedMedia::default();

    if let Some(format) = &probe.format {
        derived.duration = format.duration.as_deref().and_then(|d| d.parse().ok());
        derived.size = format.size.as_deref().and_then(|s| s.parse().ok());
        derived.bitrate = Video::normalized_bitrate(
            format.bit_rate.as_deref().and_then(|b| b.parse().ok()),
        );
    }

    let streams = probe.streams.unwrap_or_default();
    for stream in &streams {
        match stream.codec_type.as_deref() {
            Some("video") => {
                if let Some(codec) = &stream.codec_name {
                    // mjpeg cover art is not a video track worth tracking
                    if codec == "mjpeg" || codec == "png" {
                        continue;
                    }
                    if !derived.video_codecs.contains(codec) {
                        derived.video_codecs.push(codec.clone());
                    }
                }
                if derived.width.is_none() {
                    derived.width = stream.width;
                    derived.height = stream.height;
                    derived.frame_rate = stream
                        .avg_frame_rate
                        .as_deref()
                        .or(stream.r_frame_rate.as_deref())
                        .and_then(parse_frame_rate);
                }
                if derived.hdr.is_none() {
                    derived.hdr = detect_hdr(stream);
                }
                // Prefer a stream-level bitrate when the container had none
                if derived.bitrate.is_none() {
                    derived.bitrate = Video::normalized_bitrate(
                        stream.bit_rate.as_deref().and_then(|b| b.parse().ok()),
                    );
                }
            }
            Some("audio") => {
                if let Some(codec) = &stream.codec_name {
                    if !derived.audio_codecs.contains(codec) {
                        derived.audio_codecs.push(codec.clone());
                    }
                }
                if let Some(channels) = stream.channels {
                    derived.max_audio_channels =
                        Some(derived.max_audio_channels.unwrap_or(0).max(channels));
                }
                if stream
                    .profile
                    .as_deref()
                    .map(|p| p.to_lowercase().contains("atmos"))
                    .unwrap_or(false)
                {
                    derived.atmos = true;
                }
            }
            _ => {}
        }
    }

    Ok(derived)
}

fn parse_frame_rate(raw: &str) -> Option<f64> {
    if let Some((num, den)) = raw.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den == 0.0 {
            return None;
        }
        return Some(num / den);
    }
    raw.parse().ok()
}

fn detect_hdr(stream: &FfprobeStream) -> Option<HdrFormat> {
    let side_data = stream.side_data_list.as_deref().unwrap_or(&[]);
    let has_side_data = |needle: &str| {
        side_data.iter().any(|sd| {
            sd.side_data_type
                .as_deref()
                .map(|t| t.contains(needle))
                .unwrap_or(false)
        })
    };

    if has_side_data("DOVI configuration record") {
        return Some(HdrFormat::DolbyVision);
    }
    if has_side_data("SMPTE 2094-40") || has_side_data("HDR Dynamic Metadata") {
        return Some(HdrFormat::Hdr10Plus);
    }
    match stream.color_transfer.as_deref() {
        Some("smpte2084") => Some(HdrFormat::Hdr10),
        Some("arib-std-b67") => Some(HdrFormat::Hlg),
        _ => None,
    }
}

/// Analyzer stage handler. Works in batches: probes are cheap and
/// CPU-parallel, so this is the one handler allowed to fan out internally
/// while the stage itself still processes one batch message at a time.
pub struct AnalysisHandler {
    store: Store,
    bus: Arc<EventBus>,
    handle: PipelineHandle,
    downstream: PipelineHandle,
    ffprobe_bin: String,
    batch_size: usize,
    concurrency: usize,
    library_scope: Option<i64>,
}

impl AnalysisHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        bus: Arc<EventBus>,
        handle: PipelineHandle,
        downstream: PipelineHandle,
        ffprobe_bin: String,
        batch_size: usize,
        concurrency: usize,
        library_scope: Option<i64>,
    ) -> AnalysisHandler {
        AnalysisHandler {
            store,
            bus,
            handle,
            downstream,
            ffprobe_bin,
            batch_size: batch_size.max(1),
            concurrency: concurrency.max(1),
            library_scope,
        }
    }

    /// Probe one video and persist the outcome. Returns true when the video
    /// advanced to analyzed.
    async fn analyze_one(&self, video: Video) -> bool {
        self.bus.publish(
            Stage::Analyzer,
            Event::Started {
                video_id: video.id,
                os_pid: None,
            },
        );

        let outcome = match probe_file(&self.ffprobe_bin, &video.path).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fail_video(&video, e).await;
                return false;
            }
        };

        let persisted = async {
            self.store
                .apply_analysis(video.id, &outcome.raw_json, &outcome.derived)
                .await?;
            self.store
                .advance_state(video.id, VideoState::NeedsAnalysis, VideoState::Analyzed)
                .await
        }
        .await;

        match persisted {
            Ok(true) => {
                self.bus
                    .publish(Stage::Analyzer, Event::Completed { video_id: video.id });
                true
            }
            Ok(false) => {
                warn!(
                    "video {} left needs-analysis while being probed, skipping",
                    video.id
                );
                false
            }
            Err(e) => {
                error!("failed to persist analysis for video {}: {:#}", video.id, e);
                false
            }
        }
    }

    async fn fail_video(&self, video: &Video, cause: anyhow::Error) {
        let classification = classify(&FailureKind::Exception(cause.to_string()));
        let category = match classification.action {
            FailureAction::PauseStage => FailureCategory::StageCritical,
            FailureAction::Continue => FailureCategory::Recoverable,
        };

        if let Err(e) = self
            .store
            .record_failure(
                video.id,
                Stage::Analyzer,
                category,
                &classification.code,
                &classification.reason,
                None,
            )
            .await
        {
            error!("failed to record analyzer failure: {:#}", e);
        }
        if let Err(e) = self.store.mark_failed(video.id).await {
            error!("failed to mark video {} failed: {:#}", video.id, e);
        }

        self.bus.publish(
            Stage::Analyzer,
            Event::Failed {
                video_id: video.id,
                code: classification.code.clone(),
                reason: classification.reason.clone(),
            },
        );

        if classification.action == FailureAction::PauseStage {
            error!(
                "analyzer hit a critical failure on video {}: {}",
                video.id, classification.reason
            );
            self.handle.pause();
        } else {
            warn!(
                "analysis failed for video {}: {}",
                video.id, classification.reason
            );
        }
    }
}

#[async_trait]
impl StageHandler for AnalysisHandler {
    type Item = Vec<Video>;

    fn stage(&self) -> Stage {
        Stage::Analyzer
    }

    async fn next_batch(&self, n: usize) -> Result<Vec<Vec<Video>>> {
        let videos = self
            .store
            .next_for_analysis((n * self.batch_size) as i64, self.library_scope)
            .await?;
        Ok(videos
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect())
    }

    async fn process(&self, batch: Vec<Video>) {
        let advanced = futures::stream::iter(
            batch
                .into_iter()
                .map(|video| async move { self.analyze_one(video).await }),
        )
        .buffer_unordered(self.concurrency)
        .collect::<Vec<bool>>()
        .await
        .into_iter()
        .filter(|ok| *ok)
        .count();

        if advanced > 0 {
            self.downstream.dispatch_available();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HDR_MOVIE_JSON: &str = r#"{
        "format": {"duration": "7200.5", "size": "40000000000", "bit_rate": "50000000"},
        "streams": [
            {
                "codec_type": "video",
                "codec_name": "hevc",
                "width": 3840,
                "height": 2160,
                "avg_frame_rate": "24000/1001",
                "color_transfer": "smpte2084"
            },
            {
                "codec_type": "audio",
                "codec_name": "truehd",
                "profile": "Dolby TrueHD + Dolby Atmos",
                "channels": 8
            },
            {
                "codec_type": "audio",
                "codec_name": "ac3",
                "channels": 6
            },
            {"codec_type": "subtitle", "codec_name": "subrip"}
        ]
    }"#;

    #[test]
    fn test_derive_media_from_hdr_movie() {
        let derived = derive_media(HDR_MOVIE_JSON).expect("should derive");
        assert_eq!(derived.size, Some(40_000_000_000));
        assert_eq!(derived.bitrate, Some(50_000_000));
        assert_eq!(derived.duration, Some(7200.5));
        assert_eq!(derived.width, Some(3840));
        assert_eq!(derived.height, Some(2160));
        assert_eq!(derived.hdr, Some(HdrFormat::Hdr10));
        assert_eq!(derived.max_audio_channels, Some(8));
        assert!(derived.atmos);
        assert_eq!(derived.video_codecs, vec!["hevc".to_string()]);
        assert_eq!(
            derived.audio_codecs,
            vec!["truehd".to_string(), "ac3".to_string()]
        );
        let fr = derived.frame_rate.expect("frame rate");
        assert!((fr - 23.976).abs() < 0.001);
    }

    #[test]
    fn test_derive_media_is_idempotent() {
        let first = derive_media(HDR_MOVIE_JSON).expect("should derive");
        let second = derive_media(HDR_MOVIE_JSON).expect("should derive");
        assert_eq!(first, second);
    }

    #[test]
    fn test_zero_bitrate_is_normalized_to_missing() {
        let json = r#"{
            "format": {"size": "1000", "bit_rate": "0"},
            "streams": [{"codec_type": "video", "codec_name": "h264", "width": 1280, "height": 720}]
        }"#;
        let derived = derive_media(json).expect("should derive");
        assert_eq!(derived.bitrate, None);
    }

    #[test]
    fn test_dolby_vision_wins_over_transfer_tag() {
        let json = r#"{
            "streams": [{
                "codec_type": "video",
                "codec_name": "hevc",
                "width": 3840,
                "height": 2160,
                "color_transfer": "smpte2084",
                "side_data_list": [{"side_data_type": "DOVI configuration record"}]
            }]
        }"#;
        let derived = derive_media(json).expect("should derive");
        assert_eq!(derived.hdr, Some(HdrFormat::DolbyVision));
    }

    #[test]
    fn test_hlg_detection() {
        let json = r#"{
            "streams": [{
                "codec_type": "video",
                "codec_name": "hevc",
                "width": 1920,
                "height": 1080,
                "color_transfer": "arib-std-b67"
            }]
        }"#;
        let derived = derive_media(json).expect("should derive");
        assert_eq!(derived.hdr, Some(HdrFormat::Hlg));
    }

    #[test]
    fn test_cover_art_is_not_a_video_codec() {
        let json = r#"{
            "streams": [
                {"codec_type": "video", "codec_name": "mjpeg", "width": 600, "height": 600},
                {"codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080}
            ]
        }"#;
        let derived = derive_media(json).expect("should derive");
        assert_eq!(derived.video_codecs, vec!["h264".to_string()]);
    }

    #[test]
    fn test_malformed_probe_json_is_an_error() {
        assert!(derive_media("{not json").is_err());
    }
}
