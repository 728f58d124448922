use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::classify::{classify, Classification, FailureAction, FailureKind};
use crate::events::{Event, EventBus, Progress};
use crate::models::{FailureCategory, Stage, Video, VideoState, Vmaf};
use crate::parser::ToolEvent;
use crate::pipeline::{PipelineHandle, StageHandler};
use crate::rules::{self, CompileStage};
use crate::runner::{self, RunEvent, RunFailure, RunMonitor, RunSpec};
use crate::store::Store;

/// Videos already in this codec are skipped by the selector.
pub const TARGET_CODEC: &str = "av1";

/// Extra parameters for the single fallback retry after a first search
/// produced nothing usable.
const FALLBACK_PRESET: [&str; 2] = ["--preset", "6"];

/// Outcome of one search subprocess run.
enum AttemptOutcome {
    /// Search succeeded and a sample meeting the target was marked chosen.
    Chosen(Vmaf),
    /// The run finished (or failed recoverably) without an acceptable sample.
    NoAcceptable(Option<Classification>),
    /// Per-file failure with acceptable samples on record; not retried.
    Recoverable(Classification, Option<String>),
    Critical(Classification, Option<String>),
}

/// CRF-search stage handler: one subprocess per video, streaming samples
/// into VMAF rows, with a single preset-6 fallback retry.
pub struct CrfSearchHandler {
    store: Store,
    bus: Arc<EventBus>,
    handle: PipelineHandle,
    downstream: PipelineHandle,
    ab_av1_bin: String,
    tmp_dir: PathBuf,
    vmaf_target: f64,
    timeout: Duration,
    library_scope: Option<i64>,
}

impl CrfSearchHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        bus: Arc<EventBus>,
        handle: PipelineHandle,
        downstream: PipelineHandle,
        ab_av1_bin: String,
        tmp_dir: PathBuf,
        vmaf_target: f64,
        timeout: Duration,
        library_scope: Option<i64>,
    ) -> CrfSearchHandler {
        CrfSearchHandler {
            store,
            bus,
            handle,
            downstream,
            ab_av1_bin,
            tmp_dir,
            vmaf_target,
            timeout,
            library_scope,
        }
    }

    async fn search(&self, video: Video) {
        match self.run_attempt(&video, &[]).await {
            AttemptOutcome::Chosen(vmaf) => self.finish(&video, &vmaf).await,
            AttemptOutcome::NoAcceptable(_) => {
                info!(
                    "search for video {} found nothing at target {}, retrying with fallback preset",
                    video.id, self.vmaf_target
                );
                let extra: Vec<String> = FALLBACK_PRESET.iter().map(|s| s.to_string()).collect();
                match self.run_attempt(&video, &extra).await {
                    AttemptOutcome::Chosen(vmaf) => self.finish(&video, &vmaf).await,
                    AttemptOutcome::NoAcceptable(classification) => {
                        let classification = classification.unwrap_or(Classification {
                            action: FailureAction::Continue,
                            code: "no_acceptable_vmaf".to_string(),
                            reason: format!(
                                "No sample reached VMAF {} even with the fallback preset",
                                self.vmaf_target
                            ),
                        });
                        self.fail_video(&video, &classification, None).await;
                    }
                    AttemptOutcome::Recoverable(classification, context) => {
                        self.fail_video(&video, &classification, context.as_deref())
                            .await;
                    }
                    AttemptOutcome::Critical(classification, context) => {
                        self.fail_stage(&video, &classification, context.as_deref())
                            .await;
                    }
                }
            }
            AttemptOutcome::Recoverable(classification, context) => {
                self.fail_video(&video, &classification, context.as_deref())
                    .await;
            }
            AttemptOutcome::Critical(classification, context) => {
                self.fail_stage(&video, &classification, context.as_deref())
                    .await;
            }
        }
    }

    /// Run one search subprocess, streaming sample results into VMAF rows.
    async fn run_attempt(&self, video: &Video, extra: &[String]) -> AttemptOutcome {
        let args = rules::build_args(
            video,
            &CompileStage::CrfSearch {
                vmaf_target: self.vmaf_target,
            },
            extra,
        );
        let spec = RunSpec {
            program: self.ab_av1_bin.clone(),
            args,
            working_dir: Some(self.tmp_dir.clone()),
            expected_output: None,
            timeout: self.timeout,
        };
        let monitor = RunMonitor::new();

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ToolEvent>();
        let consumer = {
            let store = self.store.clone();
            let bus = self.bus.clone();
            let video_id = video.id;
            let params = extra.to_vec();
            let target = self.vmaf_target;
            async move {
                while let Some(event) = event_rx.recv().await {
                    match event {
                        ToolEvent::SampleResult {
                            crf,
                            score,
                            predicted_filesize,
                            percent,
                            ..
                        } => {
                            if let Err(e) = store
                                .upsert_vmaf(
                                    video_id,
                                    crf,
                                    score,
                                    predicted_filesize,
                                    percent,
                                    &params,
                                    target,
                                )
                                .await
                            {
                                error!("failed to record VMAF sample: {:#}", e);
                            }
                            bus.publish(
                                Stage::CrfSearch,
                                Event::Progress {
                                    video_id,
                                    progress: Progress {
                                        percent: Some(percent),
                                        crf: Some(crf),
                                        score: Some(score),
                                        ..Default::default()
                                    },
                                },
                            );
                        }
                        ToolEvent::SearchProgress {
                            crf,
                            score,
                            percent,
                        } => {
                            bus.publish(
                                Stage::CrfSearch,
                                Event::Progress {
                                    video_id,
                                    progress: Progress {
                                        percent: Some(percent),
                                        crf: Some(crf),
                                        score: Some(score),
                                        ..Default::default()
                                    },
                                },
                            );
                        }
                        ToolEvent::Warning { reason } => {
                            warn!("search warning for video {}: {}", video_id, reason);
                        }
                        ToolEvent::Success { crf } => {
                            info!("search for video {} converged on crf {}", video_id, crf);
                        }
                        ToolEvent::EncodeProgress { .. } => {}
                    }
                }
            }
        };

        let bus = self.bus.clone();
        let video_id = video.id;
        let run = runner::run(&spec, &monitor, move |event| match event {
            RunEvent::Spawned { os_pid } => {
                bus.publish(
                    Stage::CrfSearch,
                    Event::Started {
                        video_id,
                        os_pid: Some(os_pid),
                    },
                );
            }
            RunEvent::Line(line_event) => {
                let _ = event_tx.send(line_event);
            }
        });

        let (result, ()) = tokio::join!(run, consumer);

        match result {
            Ok(()) => match self.store.choose_best_vmaf(video.id, self.vmaf_target).await {
                Ok(Some(vmaf)) => AttemptOutcome::Chosen(vmaf),
                Ok(None) => AttemptOutcome::NoAcceptable(None),
                Err(e) => {
                    error!("failed to choose VMAF for video {}: {:#}", video.id, e);
                    AttemptOutcome::Recoverable(
                        Classification {
                            action: FailureAction::Continue,
                            code: "exception".to_string(),
                            reason: format!("Could not persist the chosen sample: {}", e),
                        },
                        None,
                    )
                }
            },
            Err(failure) => self.classify_failure(video, failure).await,
        }
    }

    async fn classify_failure(&self, video: &Video, failure: RunFailure) -> AttemptOutcome {
        let kind = match &failure {
            RunFailure::Exit { code, .. } => FailureKind::Exit(*code),
            RunFailure::Timeout { .. } => FailureKind::Timeout,
            RunFailure::MissingOutput { .. } => FailureKind::MissingOutput,
            RunFailure::Port { .. } => FailureKind::PortError,
        };
        let classification = classify(&kind);
        let context = Some(failure.context_json());

        match classification.action {
            FailureAction::PauseStage => AttemptOutcome::Critical(classification, context),
            FailureAction::Continue => {
                let acceptable = self
                    .store
                    .acceptable_vmaf_count(video.id, self.vmaf_target)
                    .await
                    .unwrap_or(0);
                if acceptable == 0 {
                    AttemptOutcome::NoAcceptable(Some(classification))
                } else {
                    AttemptOutcome::Recoverable(classification, context)
                }
            }
        }
    }

    async fn finish(&self, video: &Video, vmaf: &Vmaf) {
        match self
            .store
            .advance_state(video.id, VideoState::Analyzed, VideoState::CrfSearched)
            .await
        {
            Ok(true) => {
                info!(
                    "video {} searched: crf {} scores {:.2} (predicted {} bytes)",
                    video.id, vmaf.crf, vmaf.score, vmaf.predicted_filesize
                );
                self.bus
                    .publish(Stage::CrfSearch, Event::Completed { video_id: video.id });
                self.downstream.dispatch_available();
            }
            Ok(false) => {
                warn!(
                    "video {} moved out of analyzed during its search, not advancing",
                    video.id
                );
            }
            Err(e) => {
                error!("failed to advance video {}: {:#}", video.id, e);
            }
        }
    }

    async fn fail_video(
        &self,
        video: &Video,
        classification: &Classification,
        context: Option<&str>,
    ) {
        warn!(
            "search failed for video {}: {}",
            video.id, classification.reason
        );
        self.record(video, classification, FailureCategory::Recoverable, context)
            .await;
    }

    async fn fail_stage(
        &self,
        video: &Video,
        classification: &Classification,
        context: Option<&str>,
    ) {
        error!(
            "search stage paused by critical failure on video {}: {}",
            video.id, classification.reason
        );
        self.record(
            video,
            classification,
            FailureCategory::StageCritical,
            context,
        )
        .await;
        self.handle.pause();
    }

    async fn record(
        &self,
        video: &Video,
        classification: &Classification,
        category: FailureCategory,
        context: Option<&str>,
    ) {
        if let Err(e) = self
            .store
            .record_failure(
                video.id,
                Stage::CrfSearch,
                category,
                &classification.code,
                &classification.reason,
                context,
            )
            .await
        {
            error!("failed to record search failure: {:#}", e);
        }
        if let Err(e) = self.store.mark_failed(video.id).await {
            error!("failed to mark video {} failed: {:#}", video.id, e);
        }
        self.bus.publish(
            Stage::CrfSearch,
            Event::Failed {
                video_id: video.id,
                code: classification.code.clone(),
                reason: classification.reason.clone(),
            },
        );
    }
}

#[async_trait]
impl StageHandler for CrfSearchHandler {
    type Item = Video;

    fn stage(&self) -> Stage {
        Stage::CrfSearch
    }

    async fn next_batch(&self, n: usize) -> Result<Vec<Video>> {
        self.store
            .next_for_crf_search(n as i64, TARGET_CODEC, self.library_scope)
            .await
    }

    async fn process(&self, video: Video) {
        self.search(video).await;
    }
}
