use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::analysis::AnalysisHandler;
use crate::config::Settings;
use crate::crf_search::CrfSearchHandler;
use crate::encoder::EncodeHandler;
use crate::events::{EventBus, Subscription};
use crate::models::Stage;
use crate::notify::LibraryNotifier;
use crate::pipeline::{run_stage, PipelineHandle, RateLimiter, StageControl};
use crate::postprocess::PostProcessor;
use crate::startup;
use crate::stats::{self, PipelineStats};
use crate::store::Store;
use crate::watchdog::{run_watchdog, WatchdogConfig};

/// Owns the boot order and crash isolation for the whole pipeline: database
/// pool, event bus, the three stage pipelines, and their watchdogs. A crash
/// in one stage restarts only that stage.
pub struct Supervisor {
    store: Store,
    bus: Arc<EventBus>,
    analyzer: PipelineHandle,
    crf_search: PipelineHandle,
    encoder: PipelineHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl Supervisor {
    pub async fn start(settings: Settings) -> Result<Supervisor> {
        std::fs::create_dir_all(&settings.tool.tmp_dir).with_context(|| {
            format!("Failed to create tmp dir {:?}", settings.tool.tmp_dir)
        })?;

        let store = Store::connect(
            &settings.database.url,
            settings.database.max_connections,
        )
        .await?;
        store.migrate().await?;

        let bus = EventBus::new();

        let analyzer_control = StageControl::new();
        let crf_control = StageControl::new();
        let encoder_control = StageControl::new();

        let analyzer = PipelineHandle::new(Stage::Analyzer, analyzer_control.clone(), bus.clone());
        let crf_search = PipelineHandle::new(Stage::CrfSearch, crf_control.clone(), bus.clone());
        let encoder = PipelineHandle::new(Stage::Encoder, encoder_control.clone(), bus.clone());

        let notifier = if settings.services.is_empty() {
            None
        } else {
            Some(Arc::new(LibraryNotifier::from_settings(&settings)))
        };
        let postprocessor = Arc::new(PostProcessor::new(
            store.clone(),
            settings.tool.ffprobe_bin.clone(),
            notifier,
        ));

        let library_scope = settings.pipeline.library_scope;
        let analysis_handler = Arc::new(AnalysisHandler::new(
            store.clone(),
            bus.clone(),
            analyzer.clone(),
            crf_search.clone(),
            settings.tool.ffprobe_bin.clone(),
            settings.pipeline.analysis_batch_size,
            settings.pipeline.analysis_concurrency,
            library_scope,
        ));
        let crf_handler = Arc::new(CrfSearchHandler::new(
            store.clone(),
            bus.clone(),
            crf_search.clone(),
            encoder.clone(),
            settings.tool.ab_av1_bin.clone(),
            settings.tool.tmp_dir.clone(),
            settings.crf_search.vmaf_target,
            Duration::from_millis(settings.crf_search.timeout_ms),
            library_scope,
        ));
        let encode_handler = Arc::new(EncodeHandler::new(
            store.clone(),
            bus.clone(),
            encoder.clone(),
            postprocessor,
            settings.tool.ab_av1_bin.clone(),
            settings.tool.tmp_dir.clone(),
            Duration::from_millis(settings.encode.timeout_ms),
            library_scope,
        ));

        let rate_interval = Duration::from_millis(settings.pipeline.rate_limit_interval_ms);
        let rate_messages = settings.pipeline.rate_limit_messages;
        let poll_interval = Duration::from_secs(settings.pipeline.queue_poll_interval_secs);

        let mut tasks = Vec::new();

        // Stage pipelines, each with its own rate limiter.
        {
            let handler = analysis_handler;
            let control = analyzer_control.clone();
            tasks.push(spawn_supervised("analyzer pipeline", move || {
                run_stage(
                    handler.clone(),
                    control.clone(),
                    Arc::new(RateLimiter::new(rate_messages, rate_interval)),
                    poll_interval,
                )
            }));
        }
        {
            let handler = crf_handler;
            let control = crf_control.clone();
            tasks.push(spawn_supervised("crf-search pipeline", move || {
                run_stage(
                    handler.clone(),
                    control.clone(),
                    Arc::new(RateLimiter::new(rate_messages, rate_interval)),
                    poll_interval,
                )
            }));
        }
        {
            let handler = encode_handler;
            let control = encoder_control.clone();
            tasks.push(spawn_supervised("encoder pipeline", move || {
                run_stage(
                    handler.clone(),
                    control.clone(),
                    Arc::new(RateLimiter::new(rate_messages, rate_interval)),
                    poll_interval,
                )
            }));
        }

        // Watchdogs for the subprocess-bearing stages. A restarted watchdog
        // re-subscribes; lost kill timers re-arm on the next progress event.
        for stage in [Stage::CrfSearch, Stage::Encoder] {
            let bus = bus.clone();
            let store = store.clone();
            let config = WatchdogConfig {
                warn_threshold: Duration::from_millis(settings.watchdog_warn_threshold_ms(stage)),
                kill_threshold: Duration::from_millis(settings.watchdog_kill_threshold_ms(stage)),
            };
            let label = match stage {
                Stage::CrfSearch => "crf-search watchdog",
                _ => "encoder watchdog",
            };
            tasks.push(spawn_supervised(label, move || {
                let subscription = bus.subscribe(stage);
                run_watchdog(stage, subscription, bus.clone(), store.clone(), config)
            }));
        }

        info!("supervisor started: three stage pipelines, two watchdogs");

        Ok(Supervisor {
            store,
            bus,
            analyzer,
            crf_search,
            encoder,
            tasks,
        })
    }

    /// Validate the external tool binaries, then boot.
    pub async fn start_checked(settings: Settings) -> Result<Supervisor> {
        startup::check_external_tools(&settings.tool).await?;
        Supervisor::start(settings).await
    }

    pub fn handle(&self, stage: Stage) -> &PipelineHandle {
        match stage {
            Stage::Analyzer => &self.analyzer,
            Stage::CrfSearch => &self.crf_search,
            Stage::Encoder => &self.encoder,
        }
    }

    pub fn pause(&self, stage: Stage) {
        self.handle(stage).pause();
    }

    pub fn resume(&self, stage: Stage) {
        self.handle(stage).resume();
    }

    pub fn subscribe(&self, stage: Stage) -> Subscription {
        self.bus.subscribe(stage)
    }

    pub async fn stats(&self) -> Result<PipelineStats> {
        stats::snapshot(&self.store).await
    }

    /// Operator reset: every failed video goes back to needs-analysis, then
    /// the analyzer is poked to pick them up.
    pub async fn reset_failed(&self) -> Result<u64> {
        let reset = self.store.reset_failed().await?;
        if reset > 0 {
            self.analyzer.dispatch_available();
        }
        Ok(reset)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Run until externally stopped; the stage tasks never finish on their
    /// own.
    pub async fn wait(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }

    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Run a component in a restart loop so one crashing stage never takes the
/// others down.
fn spawn_supervised<F, Fut>(label: &'static str, factory: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let task = tokio::spawn(factory());
            match task.await {
                Ok(()) => warn!("{} exited, restarting", label),
                Err(e) if e.is_panic() => error!("{} panicked, restarting", label),
                // Cancelled during shutdown.
                Err(_) => return,
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    })
}

/// Boot the supervisor from settings and run forever.
pub async fn run_daemon(settings: Settings) -> Result<()> {
    let supervisor = Supervisor::start_checked(settings).await?;
    supervisor.wait().await;
    Ok(())
}
