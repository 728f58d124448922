use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::analysis::probe_file;
use crate::models::{Video, VideoState};
use crate::notify::LibraryNotifier;
use crate::store::Store;

const EXDEV: i32 = 18;

#[derive(Debug, thiserror::Error)]
pub enum MoveError {
    #[error("failed to rename {src:?} to {dst:?}: {source}")]
    Rename {
        src: std::path::PathBuf,
        dst: std::path::PathBuf,
        source: io::Error,
    },
    #[error("cross-device copy to {dst:?} failed: {source}")]
    Copy {
        dst: std::path::PathBuf,
        source: io::Error,
    },
}

impl MoveError {
    fn os_error(&self) -> Option<i32> {
        match self {
            MoveError::Rename { source, .. } | MoveError::Copy { source, .. } => {
                source.raw_os_error()
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PostProcessError {
    #[error("encoded output {path:?} is missing or empty")]
    EmptyOutput { path: std::path::PathBuf },
    #[error(transparent)]
    Move(#[from] MoveError),
    #[error("re-probe of replaced file failed: {0}")]
    Probe(anyhow::Error),
    #[error("failed to persist post-encode update: {0}")]
    Persist(anyhow::Error),
}

impl PostProcessError {
    /// Machine-readable code for the audit log, carrying the errno name for
    /// file-access problems (e.g. `file_access/ENOSPC`).
    pub fn code(&self) -> String {
        match self {
            PostProcessError::EmptyOutput { .. } => "empty_output".to_string(),
            PostProcessError::Move(e) => match e.os_error() {
                Some(28) => "file_access/ENOSPC".to_string(),
                Some(13) => "file_access/EACCES".to_string(),
                Some(30) => "file_access/EROFS".to_string(),
                Some(code) => format!("file_access/errno_{}", code),
                None => "file_access/unknown".to_string(),
            },
            PostProcessError::Probe(_) => "reprobe_failed".to_string(),
            PostProcessError::Persist(_) => "persist_failed".to_string(),
        }
    }
}

/// Move the encoded file onto the original path. Same filesystem gets an
/// atomic rename; across devices we stream-copy then unlink the source. A
/// failed copy never leaves a partial destination behind.
pub async fn move_into_place(src: &Path, dst: &Path) -> Result<(), MoveError> {
    match tokio::fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(EXDEV) => {
            debug!("{:?} and {:?} are on different devices, copying", src, dst);
            copy_and_unlink(src, dst).await
        }
        Err(e) => Err(MoveError::Rename {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
            source: e,
        }),
    }
}

/// Cross-device fallback: copy, delete the partial destination on any
/// error, unlink the source on success.
pub async fn copy_and_unlink(src: &Path, dst: &Path) -> Result<(), MoveError> {
    match tokio::fs::copy(src, dst).await {
        Ok(_) => {
            if let Err(e) = tokio::fs::remove_file(src).await {
                warn!("failed to remove copied source {:?}: {}", src, e);
            }
            Ok(())
        }
        Err(e) => {
            if let Err(cleanup) = tokio::fs::remove_file(dst).await {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!(
                        "failed to remove partial destination {:?}: {}",
                        dst, cleanup
                    );
                }
            }
            Err(MoveError::Copy {
                dst: dst.to_path_buf(),
                source: e,
            })
        }
    }
}

/// Commits a successful encode: integrity check, move into place, re-probe,
/// row update, state advance, and a fire-and-forget library notification.
pub struct PostProcessor {
    store: Store,
    ffprobe_bin: String,
    notifier: Option<Arc<LibraryNotifier>>,
}

impl PostProcessor {
    pub fn new(
        store: Store,
        ffprobe_bin: String,
        notifier: Option<Arc<LibraryNotifier>>,
    ) -> PostProcessor {
        PostProcessor {
            store,
            ffprobe_bin,
            notifier,
        }
    }

    pub async fn finalize(&self, video: &Video, encoded: &Path) -> Result<(), PostProcessError> {
        let metadata = tokio::fs::metadata(encoded)
            .await
            .map_err(|_| PostProcessError::EmptyOutput {
                path: encoded.to_path_buf(),
            })?;
        if metadata.len() == 0 {
            return Err(PostProcessError::EmptyOutput {
                path: encoded.to_path_buf(),
            });
        }

        move_into_place(encoded, &video.path).await?;

        let probe = probe_file(&self.ffprobe_bin, &video.path)
            .await
            .map_err(PostProcessError::Probe)?;

        self.store
            .update_after_encode(
                video.id,
                probe.derived.size.unwrap_or(metadata.len()),
                probe.derived.bitrate,
                &probe.derived.video_codecs,
                &probe.derived.audio_codecs,
                &probe.raw_json,
            )
            .await
            .map_err(PostProcessError::Persist)?;

        let advanced = self
            .store
            .advance_state(video.id, VideoState::CrfSearched, VideoState::Encoded)
            .await
            .map_err(PostProcessError::Persist)?;
        if !advanced {
            warn!(
                "video {} was not in crf-searched when its encode finished",
                video.id
            );
        }

        info!(
            "replaced {:?} ({} -> {} bytes)",
            video.path,
            video.size,
            probe.derived.size.unwrap_or(metadata.len())
        );

        self.notify(video);
        Ok(())
    }

    /// Library notification is best-effort: failures are logged, never
    /// propagated, and the notifier retries transient errors internally.
    fn notify(&self, video: &Video) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let (Some(service_type), Some(service_id)) = (video.service_type, video.service_id) else {
            debug!("video {} has no library source to notify", video.id);
            return;
        };

        let notifier = notifier.clone();
        let video_id = video.id;
        tokio::spawn(async move {
            if let Err(e) = notifier.notify_rescan(service_type, service_id).await {
                warn!("library notify failed for video {}: {:#}", video_id, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_move_renames_on_same_filesystem() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("src.mkv");
        let dst = dir.path().join("dst.mkv");
        tokio::fs::write(&src, b"encoded bytes").await.expect("write");

        move_into_place(&src, &dst).await.expect("move");

        assert!(!src.exists());
        assert_eq!(tokio::fs::read(&dst).await.expect("read"), b"encoded bytes");
    }

    #[tokio::test]
    async fn test_copy_fallback_replaces_destination() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("src.mkv");
        let dst = dir.path().join("dst.mkv");
        tokio::fs::write(&src, b"new contents").await.expect("write");
        tokio::fs::write(&dst, b"old contents").await.expect("write");

        copy_and_unlink(&src, &dst).await.expect("copy");

        assert!(!src.exists());
        assert_eq!(tokio::fs::read(&dst).await.expect("read"), b"new contents");
    }

    #[tokio::test]
    async fn test_failed_copy_removes_partial_destination() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("does-not-exist.mkv");
        let dst = dir.path().join("dst.mkv");
        tokio::fs::write(&dst, b"partial junk").await.expect("write");

        let err = copy_and_unlink(&src, &dst).await.expect_err("should fail");
        assert!(matches!(err, MoveError::Copy { .. }));
        assert!(!dst.exists(), "partial destination must be removed");
    }

    #[test]
    fn test_enospc_move_error_code() {
        let err = PostProcessError::Move(MoveError::Copy {
            dst: "/m/a.mkv".into(),
            source: io::Error::from_raw_os_error(28),
        });
        assert_eq!(err.code(), "file_access/ENOSPC");
    }

    #[test]
    fn test_empty_output_code() {
        let err = PostProcessError::EmptyOutput {
            path: "/tmp/1.mkv".into(),
        };
        assert_eq!(err.code(), "empty_output");
    }
}
