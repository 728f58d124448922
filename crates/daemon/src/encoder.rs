use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::classify::{classify, FailureAction, FailureKind};
use crate::events::{Event, EventBus, Progress};
use crate::models::{FailureCategory, Stage, Video, Vmaf};
use crate::parser::ToolEvent;
use crate::pipeline::{PipelineHandle, StageHandler};
use crate::postprocess::PostProcessor;
use crate::rules::{self, CompileStage};
use crate::runner::{self, RunEvent, RunFailure, RunMonitor, RunSpec};
use crate::store::Store;

/// One unit of encoder work: a video joined to its chosen search sample.
#[derive(Debug, Clone)]
pub struct EncodeWork {
    pub video: Video,
    pub vmaf: Vmaf,
}

/// Encoder stage handler: replays the chosen search parameters into a full
/// encode and hands successful output to the post-processor.
pub struct EncodeHandler {
    store: Store,
    bus: Arc<EventBus>,
    handle: PipelineHandle,
    postprocessor: Arc<PostProcessor>,
    ab_av1_bin: String,
    tmp_dir: PathBuf,
    timeout: Duration,
    library_scope: Option<i64>,
}

impl EncodeHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        bus: Arc<EventBus>,
        handle: PipelineHandle,
        postprocessor: Arc<PostProcessor>,
        ab_av1_bin: String,
        tmp_dir: PathBuf,
        timeout: Duration,
        library_scope: Option<i64>,
    ) -> EncodeHandler {
        EncodeHandler {
            store,
            bus,
            handle,
            postprocessor,
            ab_av1_bin,
            tmp_dir,
            timeout,
            library_scope,
        }
    }

    /// Temp output location for a video; safe to delete whenever the video
    /// is not mid-encode.
    fn output_path(&self, video: &Video) -> PathBuf {
        self.tmp_dir.join(format!("{}.mkv", video.id))
    }

    async fn encode(&self, work: EncodeWork) {
        let EncodeWork { video, vmaf } = work;
        let output = self.output_path(&video);
        let args = rules::build_args(
            &video,
            &CompileStage::Encode {
                crf: vmaf.crf,
                output: output.clone(),
            },
            &vmaf.params,
        );
        let spec = RunSpec {
            program: self.ab_av1_bin.clone(),
            args,
            working_dir: Some(self.tmp_dir.clone()),
            expected_output: Some(output.clone()),
            timeout: self.timeout,
        };
        let monitor = RunMonitor::new();

        info!(
            "encoding video {} at crf {} (target score was {})",
            video.id, vmaf.crf, vmaf.target
        );

        let bus = self.bus.clone();
        let video_id = video.id;
        let result = runner::run(&spec, &monitor, move |event| match event {
            RunEvent::Spawned { os_pid } => {
                bus.publish(
                    Stage::Encoder,
                    Event::Started {
                        video_id,
                        os_pid: Some(os_pid),
                    },
                );
            }
            RunEvent::Line(ToolEvent::EncodeProgress { percent, fps, eta }) => {
                bus.publish(
                    Stage::Encoder,
                    Event::Progress {
                        video_id,
                        progress: Progress {
                            percent: Some(percent),
                            fps: Some(fps),
                            eta: Some(eta),
                            ..Default::default()
                        },
                    },
                );
            }
            RunEvent::Line(ToolEvent::Warning { reason }) => {
                warn!("encode warning for video {}: {}", video_id, reason);
            }
            RunEvent::Line(_) => {}
        })
        .await;

        match result {
            Ok(()) => match self.postprocessor.finalize(&video, &output).await {
                Ok(()) => {
                    info!("video {} encoded and committed", video.id);
                    self.bus
                        .publish(Stage::Encoder, Event::Completed { video_id: video.id });
                }
                Err(post_error) => {
                    // The encode itself succeeded; never roll it back, just
                    // surface a distinct failure for manual re-processing.
                    let code = post_error.code();
                    let message = post_error.to_string();
                    error!(
                        "post-processing failed for video {}: {}",
                        video.id, message
                    );
                    if output.exists() {
                        warn!(
                            "encoded output preserved at {:?} for manual re-processing",
                            output
                        );
                    }
                    self.record_failure(&video, FailureCategory::PostProcess, &code, &message, None)
                        .await;
                }
            },
            Err(failure) => {
                self.cleanup_output(&output).await;
                self.handle_run_failure(&video, failure).await;
            }
        }
    }

    async fn handle_run_failure(&self, video: &Video, failure: RunFailure) {
        let kind = match &failure {
            RunFailure::Exit { code, .. } => FailureKind::Exit(*code),
            RunFailure::Timeout { .. } => FailureKind::Timeout,
            RunFailure::MissingOutput { .. } => FailureKind::MissingOutput,
            RunFailure::Port { .. } => FailureKind::PortError,
        };
        let classification = classify(&kind);
        let context = failure.context_json();

        match classification.action {
            FailureAction::PauseStage => {
                error!(
                    "encoder paused by critical failure on video {}: {}",
                    video.id, classification.reason
                );
                self.record_failure(
                    video,
                    FailureCategory::StageCritical,
                    &classification.code,
                    &classification.reason,
                    Some(&context),
                )
                .await;
                self.handle.pause();
            }
            FailureAction::Continue => {
                warn!(
                    "encode failed for video {}: {}",
                    video.id, classification.reason
                );
                self.record_failure(
                    video,
                    FailureCategory::Recoverable,
                    &classification.code,
                    &classification.reason,
                    Some(&context),
                )
                .await;
            }
        }
    }

    async fn record_failure(
        &self,
        video: &Video,
        category: FailureCategory,
        code: &str,
        message: &str,
        context: Option<&str>,
    ) {
        if let Err(e) = self
            .store
            .record_failure(video.id, Stage::Encoder, category, code, message, context)
            .await
        {
            error!("failed to record encoder failure: {:#}", e);
        }
        if let Err(e) = self.store.mark_failed(video.id).await {
            error!("failed to mark video {} failed: {:#}", video.id, e);
        }
        self.bus.publish(
            Stage::Encoder,
            Event::Failed {
                video_id: video.id,
                code: code.to_string(),
                reason: message.to_string(),
            },
        );
    }

    async fn cleanup_output(&self, output: &std::path::Path) {
        match tokio::fs::remove_file(output).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove partial output {:?}: {}", output, e),
        }
    }
}

#[async_trait]
impl StageHandler for EncodeHandler {
    type Item = EncodeWork;

    fn stage(&self) -> Stage {
        Stage::Encoder
    }

    async fn next_batch(&self, n: usize) -> Result<Vec<EncodeWork>> {
        Ok(self
            .store
            .next_for_encoding(n as i64, self.library_scope)
            .await?
            .into_iter()
            .map(|(video, vmaf)| EncodeWork { video, vmaf })
            .collect())
    }

    async fn process(&self, work: EncodeWork) {
        self.encode(work).await;
    }
}
