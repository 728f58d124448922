use std::path::PathBuf;

use crate::models::Video;

/// Stage context for argument compilation. The encode stage carries the CRF
/// chosen by the search and the temp output path it must write to.
#[derive(Debug, Clone, PartialEq)]
pub enum CompileStage {
    CrfSearch { vmaf_target: f64 },
    Encode { crf: f64, output: PathBuf },
}

/// Flags ab-av1 accepts more than once; every occurrence is passed through.
const REPEATABLE_FLAGS: &[&str] = &["--svt", "--enc", "--vfilter"];

/// Compile the full ab-av1 argument list for a video and stage.
///
/// This is the single authority on the tool command line. Rules are applied
/// in a fixed order and the result is deduplicated keeping the first
/// occurrence of each flag, so `extra_params` can supply remembered search
/// parameters without ever overriding `--input`/`--output`/`--crf`.
pub fn build_args(video: &Video, stage: &CompileStage, extra_params: &[String]) -> Vec<String> {
    let mut args = base_args(video, stage);
    args.extend(audio_args(stage));
    args.extend(hdr_args(video));
    args.extend(resolution_args(video));
    args.extend(pix_format_args());
    args.extend(extra_params.iter().cloned());

    let args = dedup_flags(args);
    match stage {
        CompileStage::CrfSearch { .. } => strip_audio_flags(args),
        CompileStage::Encode { .. } => args,
    }
}

fn base_args(video: &Video, stage: &CompileStage) -> Vec<String> {
    let input = video.path.to_string_lossy().to_string();
    match stage {
        CompileStage::CrfSearch { vmaf_target } => vec![
            "crf-search".to_string(),
            "--input".to_string(),
            input,
            "--min-vmaf".to_string(),
            format_number(*vmaf_target),
        ],
        CompileStage::Encode { crf, output } => vec![
            "encode".to_string(),
            "--input".to_string(),
            input,
            "--output".to_string(),
            output.to_string_lossy().to_string(),
            "--crf".to_string(),
            format_number(*crf),
        ],
    }
}

/// Audio is always copied verbatim on encode; the search never re-encodes
/// audio so it gets no audio flags at all.
fn audio_args(stage: &CompileStage) -> Vec<String> {
    match stage {
        CompileStage::Encode { .. } => vec!["--acodec".to_string(), "copy".to_string()],
        CompileStage::CrfSearch { .. } => vec![],
    }
}

fn hdr_args(video: &Video) -> Vec<String> {
    let mut args = vec!["--svt".to_string(), "tune=0".to_string()];
    if video.hdr.is_some() {
        args.push("--svt".to_string());
        args.push("dolbyvision=1".to_string());
    }
    args
}

/// Anything above 1080p is downscaled to 1920 wide; `-2` keeps the aspect
/// ratio and an even height.
fn resolution_args(video: &Video) -> Vec<String> {
    match video.height {
        Some(h) if h > 1080 => vec!["--vfilter".to_string(), "scale=1920:-2".to_string()],
        _ => vec![],
    }
}

fn pix_format_args() -> Vec<String> {
    vec!["--pix-format".to_string(), "yuv420p10le".to_string()]
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Walk the list once keeping the first occurrence of each `--flag` and its
/// value. Repeatable flags are passed through untouched.
fn dedup_flags(args: Vec<String>) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    let mut out: Vec<String> = Vec::with_capacity(args.len());
    let mut i = 0;

    while i < args.len() {
        let token = &args[i];
        if token.starts_with("--") {
            let value = args
                .get(i + 1)
                .filter(|v| !v.starts_with("--"))
                .cloned();
            let consumed = if value.is_some() { 2 } else { 1 };

            let keep = REPEATABLE_FLAGS.contains(&token.as_str())
                || !seen.iter().any(|s| s == token);
            if keep {
                if !REPEATABLE_FLAGS.contains(&token.as_str()) {
                    seen.push(token.clone());
                }
                out.push(token.clone());
                if let Some(v) = value {
                    out.push(v);
                }
            }
            i += consumed;
        } else {
            out.push(token.clone());
            i += 1;
        }
    }

    out
}

/// Drop audio-domain flags from a search argument list, even when they were
/// smuggled in through `extra_params`.
fn strip_audio_flags(args: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(args.len());
    let mut i = 0;

    while i < args.len() {
        let token = &args[i];
        let value = args.get(i + 1).filter(|v| !v.starts_with("--"));

        if token == "--acodec" {
            i += if value.is_some() { 2 } else { 1 };
            continue;
        }
        if token == "--enc" {
            if let Some(v) = value {
                if v.starts_with("b:a=") || v.starts_with("ac=") {
                    i += 2;
                    continue;
                }
            }
        }

        out.push(token.clone());
        i += 1;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HdrFormat, VideoState};
    use chrono::Utc;

    fn test_video(height: i32, hdr: Option<HdrFormat>) -> Video {
        Video {
            id: 7,
            service_type: None,
            service_id: None,
            path: PathBuf::from("/m/a.mkv"),
            size: 40_000_000_000,
            bitrate: Some(50_000_000),
            duration: Some(7200.0),
            width: Some(3840),
            height: Some(height),
            frame_rate: Some(23.976),
            max_audio_channels: Some(8),
            audio_codecs: vec!["truehd".to_string()],
            video_codecs: vec!["hevc".to_string()],
            hdr,
            atmos: false,
            state: VideoState::Analyzed,
            failed: false,
            mediainfo: None,
            library_id: None,
            inserted_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn contains_subsequence(haystack: &[String], needle: &[&str]) -> bool {
        let mut it = haystack.iter();
        needle.iter().all(|n| it.any(|h| h == n))
    }

    #[test]
    fn test_crf_search_args_for_4k_hdr() {
        let video = test_video(2160, Some(HdrFormat::Hdr10));
        let args = build_args(
            &video,
            &CompileStage::CrfSearch { vmaf_target: 95.0 },
            &[],
        );

        assert_eq!(args[0], "crf-search");
        assert!(contains_subsequence(
            &args,
            &[
                "--input",
                "/m/a.mkv",
                "--svt",
                "tune=0",
                "--svt",
                "dolbyvision=1",
                "--vfilter",
                "scale=1920:-2",
                "--pix-format",
                "yuv420p10le",
            ]
        ));
        assert!(!args.contains(&"--acodec".to_string()));
        assert!(!args.contains(&"--output".to_string()));
    }

    #[test]
    fn test_encode_args_copy_audio_and_carry_crf() {
        let video = test_video(2160, Some(HdrFormat::Hdr10));
        let args = build_args(
            &video,
            &CompileStage::Encode {
                crf: 28.0,
                output: PathBuf::from("/tmp/7.mkv"),
            },
            &["--preset".to_string(), "6".to_string()],
        );

        assert_eq!(args[0], "encode");
        assert!(contains_subsequence(&args, &["--output", "/tmp/7.mkv"]));
        assert!(contains_subsequence(&args, &["--crf", "28"]));
        assert!(contains_subsequence(&args, &["--acodec", "copy"]));
        assert!(contains_subsequence(&args, &["--preset", "6"]));
    }

    #[test]
    fn test_height_boundary_for_downscale() {
        let at_1080 = build_args(
            &test_video(1080, None),
            &CompileStage::CrfSearch { vmaf_target: 95.0 },
            &[],
        );
        assert!(!at_1080.contains(&"--vfilter".to_string()));

        let above = build_args(
            &test_video(1081, None),
            &CompileStage::CrfSearch { vmaf_target: 95.0 },
            &[],
        );
        assert!(contains_subsequence(&above, &["--vfilter", "scale=1920:-2"]));
    }

    #[test]
    fn test_extra_params_cannot_override_base_identity() {
        let video = test_video(1080, None);
        let args = build_args(
            &video,
            &CompileStage::Encode {
                crf: 24.0,
                output: PathBuf::from("/tmp/7.mkv"),
            },
            &[
                "--input".to_string(),
                "/evil/other.mkv".to_string(),
                "--crf".to_string(),
                "51".to_string(),
            ],
        );

        let inputs: Vec<_> = args.iter().filter(|a| *a == "--input").collect();
        assert_eq!(inputs.len(), 1);
        assert!(contains_subsequence(&args, &["--input", "/m/a.mkv"]));
        assert!(contains_subsequence(&args, &["--crf", "24"]));
        assert!(!args.contains(&"51".to_string()));
    }

    #[test]
    fn test_search_strips_audio_flags_from_extra_params() {
        let video = test_video(1080, None);
        let args = build_args(
            &video,
            &CompileStage::CrfSearch { vmaf_target: 95.0 },
            &[
                "--acodec".to_string(),
                "libopus".to_string(),
                "--enc".to_string(),
                "b:a=128k".to_string(),
                "--enc".to_string(),
                "ac=2".to_string(),
                "--enc".to_string(),
                "x265-params=log-level=error".to_string(),
            ],
        );

        assert!(!args.contains(&"--acodec".to_string()));
        assert!(!args.contains(&"b:a=128k".to_string()));
        assert!(!args.contains(&"ac=2".to_string()));
        // Non-audio --enc values survive
        assert!(contains_subsequence(
            &args,
            &["--enc", "x265-params=log-level=error"]
        ));
    }
}
