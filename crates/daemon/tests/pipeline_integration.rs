#![cfg(unix)]

use shrinkarr_daemon::config::Settings;
use shrinkarr_daemon::models::{Stage, VideoState};
use shrinkarr_daemon::store::NewVideo;
use shrinkarr_daemon::supervisor::Supervisor;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const FFPROBE_SCRIPT: &str = r#"#!/bin/sh
cat <<'EOF'
{
  "format": {"duration": "3600.0", "size": "1000000000", "bit_rate": "8000000"},
  "streams": [
    {"codec_type": "video", "codec_name": "hevc", "width": 1920, "height": 1080, "avg_frame_rate": "24/1"},
    {"codec_type": "audio", "codec_name": "aac", "channels": 6}
  ]
}
EOF
"#;

const AB_AV1_SCRIPT: &str = r#"#!/bin/sh
cmd="$1"; shift
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    --output) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
case "$cmd" in
  crf-search)
    echo "sample 1: crf 22, VMAF 97.1, predicted full encode size 700 MB, 70%"
    echo "sample 2: crf 28, VMAF 95.5, predicted full encode size 500 MB, 50%"
    echo "sample 3: crf 33, VMAF 93.0, predicted full encode size 300 MB, 30%"
    echo "crf 28 successful"
    ;;
  encode)
    echo "encoded 50%, 120 fps, eta 10s"
    echo "encoded 100%, 120 fps, eta 0s"
    printf 'ENCODED' > "$out"
    ;;
esac
"#;

// First search attempt finds nothing; only the fallback preset succeeds.
const AB_AV1_NEEDS_PRESET_SCRIPT: &str = r#"#!/bin/sh
cmd="$1"; shift
out=""
preset=""
while [ $# -gt 0 ]; do
  case "$1" in
    --output) out="$2"; shift 2 ;;
    --preset) preset="$2"; shift 2 ;;
    *) shift ;;
  esac
done
case "$cmd" in
  crf-search)
    if [ -z "$preset" ]; then
      echo "Warning: failed to find a suitable crf"
      exit 1
    fi
    echo "sample 1: crf 28, VMAF 95.5, predicted full encode size 500 MB, 50%"
    echo "crf 28 successful"
    ;;
  encode)
    printf 'ENCODED' > "$out"
    ;;
esac
"#;

fn write_script(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("write script");
    let mut perms = std::fs::metadata(&path).expect("stat").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod");
    path
}

fn test_settings(dir: &Path, ab_av1: &Path, ffprobe: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.database.url = format!("sqlite:{}", dir.join("pipeline.db").display());
    settings.tool.ab_av1_bin = ab_av1.display().to_string();
    settings.tool.ffprobe_bin = ffprobe.display().to_string();
    settings.tool.tmp_dir = dir.join("tmp");
    settings.pipeline.queue_poll_interval_secs = 1;
    settings
}

async fn wait_for_state(
    supervisor: &Supervisor,
    video_id: i64,
    state: VideoState,
) -> shrinkarr_daemon::Video {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let video = supervisor
            .store()
            .fetch_video(video_id)
            .await
            .expect("fetch")
            .expect("video exists");
        if video.state == state && !video.failed {
            return video;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {:?}, video is {:?} (failed={})",
            state,
            video.state,
            video.failed
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_video_flows_from_ingest_to_encoded() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ab_av1 = write_script(dir.path(), "ab-av1", AB_AV1_SCRIPT);
    let ffprobe = write_script(dir.path(), "ffprobe", FFPROBE_SCRIPT);
    let settings = test_settings(dir.path(), &ab_av1, &ffprobe);

    let library_file = dir.path().join("movie.mkv");
    std::fs::write(&library_file, "original bits").expect("write movie");

    let supervisor = Supervisor::start(settings).await.expect("start");

    let video = supervisor
        .store()
        .insert_video(NewVideo {
            path: library_file.clone(),
            size: 1_000_000_000,
            bitrate: Some(8_000_000),
            service_type: None,
            service_id: None,
            library_id: None,
        })
        .await
        .expect("insert");
    supervisor.handle(Stage::Analyzer).dispatch_available();

    let encoded = wait_for_state(&supervisor, video.id, VideoState::Encoded).await;

    // Derived fields came from the probe document.
    assert_eq!(encoded.video_codecs, vec!["hevc".to_string()]);
    assert_eq!(encoded.max_audio_channels, Some(6));
    assert_eq!(encoded.height, Some(1080));

    // The chosen sample is the highest CRF meeting the target.
    let chosen = supervisor
        .store()
        .chosen_vmaf(video.id)
        .await
        .expect("query")
        .expect("a chosen sample");
    assert_eq!(chosen.crf, 28.0);
    assert_eq!(chosen.predicted_filesize, 500_000_000);

    // The encode output replaced the original file.
    assert_eq!(
        std::fs::read_to_string(&library_file).expect("read"),
        "ENCODED"
    );
    // The temp output was consumed by the move.
    assert!(!dir.path().join("tmp").join(format!("{}.mkv", video.id)).exists());

    // No failures were recorded along the way.
    assert!(supervisor
        .store()
        .failures_for_video(video.id)
        .await
        .expect("failures")
        .is_empty());

    supervisor.shutdown();
}

#[tokio::test]
async fn test_search_falls_back_to_preset_and_encode_replays_it() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ab_av1 = write_script(dir.path(), "ab-av1", AB_AV1_NEEDS_PRESET_SCRIPT);
    let ffprobe = write_script(dir.path(), "ffprobe", FFPROBE_SCRIPT);
    let settings = test_settings(dir.path(), &ab_av1, &ffprobe);

    let library_file = dir.path().join("stubborn.mkv");
    std::fs::write(&library_file, "original bits").expect("write movie");

    let supervisor = Supervisor::start(settings).await.expect("start");

    let video = supervisor
        .store()
        .insert_video(NewVideo {
            path: library_file.clone(),
            size: 1_000_000_000,
            bitrate: Some(8_000_000),
            service_type: None,
            service_id: None,
            library_id: None,
        })
        .await
        .expect("insert");
    supervisor.handle(Stage::Analyzer).dispatch_available();

    let encoded = wait_for_state(&supervisor, video.id, VideoState::Encoded).await;
    assert!(!encoded.failed);

    // The fallback preset was remembered on the chosen sample, so the
    // encode stage replayed it.
    let chosen = supervisor
        .store()
        .chosen_vmaf(video.id)
        .await
        .expect("query")
        .expect("a chosen sample");
    assert_eq!(
        chosen.params,
        vec!["--preset".to_string(), "6".to_string()]
    );
    assert_eq!(chosen.crf, 28.0);

    supervisor.shutdown();
}

#[tokio::test]
async fn test_operator_reset_requeues_failed_videos() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ab_av1 = write_script(dir.path(), "ab-av1", AB_AV1_SCRIPT);
    let ffprobe = write_script(dir.path(), "ffprobe", FFPROBE_SCRIPT);
    let mut settings = test_settings(dir.path(), &ab_av1, &ffprobe);
    // No idle re-poll: only the reset's poke may move the video.
    settings.pipeline.queue_poll_interval_secs = 3600;

    let library_file = dir.path().join("retried.mkv");
    std::fs::write(&library_file, "original bits").expect("write movie");

    let supervisor = Supervisor::start(settings).await.expect("start");

    let video = supervisor
        .store()
        .insert_video(NewVideo {
            path: library_file,
            size: 1_000_000_000,
            bitrate: Some(8_000_000),
            service_type: None,
            service_id: None,
            library_id: None,
        })
        .await
        .expect("insert");
    supervisor.store().mark_failed(video.id).await.expect("fail");

    // A failed video sits in no queue until the operator resets it.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let parked = supervisor
        .store()
        .fetch_video(video.id)
        .await
        .expect("fetch")
        .expect("exists");
    assert!(parked.failed);
    assert_eq!(parked.state, VideoState::NeedsAnalysis);

    let reset = supervisor.reset_failed().await.expect("reset");
    assert_eq!(reset, 1);

    // The reset pokes the analyzer, and the video flows all the way through.
    wait_for_state(&supervisor, video.id, VideoState::Encoded).await;

    supervisor.shutdown();
}
