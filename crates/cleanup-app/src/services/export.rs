//! Per-dataset export job.
//!
//! The orchestrator owns the dataset's [`ExportSnapshot`] and is the only
//! writer of it. Readers take point snapshots from a `watch` channel and
//! never wait on the job. Everything that decides *which* job owns the
//! dataset (start, terminal effects, init resolution) runs under `gate`;
//! polling sleeps and artifact downloads happen outside it.
//!
//! Each `start` bumps the snapshot generation. Background work carries the
//! generation it was started for and drops its effects once superseded.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tokio::sync::{Mutex, OnceCell, watch};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::constants::{DEFAULT_TIMEZONE, LAST_UPDATE_FORMAT, POLL_PHASE_MAX_PROGRESS};
use crate::services::context::{JobContext, JobError};
use crate::services::features::{ExportArtifact, LoadedFeatures};
use crate::services::platform::{CommandStatus, PlatformError};
use crate::services::poller::poll;
use crate::services::status::ExportStatus;

#[derive(Debug, Clone)]
pub struct ExportSnapshot {
    pub status: ExportStatus,
    pub progress: u8,
    /// Empty until an export artifact is loaded.
    pub export_item_id: String,
    pub last_update: Option<DateTime<Utc>>,
    pub timezone: Tz,
    pub generation: u64,
    pub features: Arc<LoadedFeatures>,
}

impl ExportSnapshot {
    fn initial() -> Self {
        Self {
            status: ExportStatus::Loading,
            progress: 0,
            export_item_id: String::new(),
            last_update: None,
            timezone: DEFAULT_TIMEZONE,
            generation: 0,
            features: Arc::new(LoadedFeatures::default()),
        }
    }

    /// Artifact time rendered in the caller's timezone, empty before the first export.
    pub fn last_update_display(&self) -> String {
        self.last_update
            .map(|at| {
                at.with_timezone(&self.timezone)
                    .format(LAST_UPDATE_FORMAT)
                    .to_string()
            })
            .unwrap_or_default()
    }

    pub fn view(&self) -> ExportStatusView {
        ExportStatusView {
            progress: if self.status == ExportStatus::Ready {
                100
            } else {
                self.progress
            },
            last_update: self.last_update_display(),
            status: self.status,
            export_item_id: self.export_item_id.clone(),
        }
    }
}

/// Status payload returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportStatusView {
    pub progress: u8,
    pub last_update: String,
    pub status: ExportStatus,
    pub export_item_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A loaded export was reused; nothing was sent to the platform.
    CacheHit,
    /// The command resumed from the active marker is still running.
    Attached { command_id: String },
    Started { command_id: String, generation: u64 },
}

/// Parse an IANA timezone name, falling back to UTC.
pub fn parse_timezone(raw: &str) -> Tz {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return DEFAULT_TIMEZONE;
    }
    trimmed.parse::<Tz>().unwrap_or_else(|_| {
        warn!(timezone = trimmed, "unknown timezone, using UTC");
        DEFAULT_TIMEZONE
    })
}

/// What marker resolution decided for a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
enum InitResolution {
    Resumed(String),
    Replayed,
    Idle,
    Skipped,
}

struct LoadedExport {
    features: LoadedFeatures,
    created_at: DateTime<Utc>,
}

pub struct ExportOrchestrator {
    dataset_id: String,
    ctx: JobContext,
    state: watch::Sender<ExportSnapshot>,
    gate: Mutex<()>,
    resolved: OnceCell<InitResolution>,
}

impl ExportOrchestrator {
    /// Create the job state for a dataset. Performs no IO.
    pub fn new(dataset_id: impl Into<String>, ctx: JobContext) -> Arc<Self> {
        let (state, _) = watch::channel(ExportSnapshot::initial());
        Arc::new(Self {
            dataset_id: dataset_id.into(),
            ctx,
            state,
            gate: Mutex::new(()),
            resolved: OnceCell::new(),
        })
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    pub fn snapshot(&self) -> ExportSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ExportSnapshot> {
        self.state.subscribe()
    }

    pub fn features(&self) -> Arc<LoadedFeatures> {
        Arc::clone(&self.state.borrow().features)
    }

    fn generation(&self) -> u64 {
        self.state.borrow().generation
    }

    /// Decide the dataset's initial state from its markers: resume an in-flight
    /// command, replay a finished export, or go idle awaiting `start`.
    ///
    /// Runs at most once per dataset; concurrent callers wait for the first.
    /// A marker-store failure leaves the resolution pending so the next
    /// caller retries it.
    pub async fn resolve_on_init(self: &Arc<Self>) -> Result<(), JobError> {
        self.resolution().await.map(|_| ())
    }

    async fn resolution(self: &Arc<Self>) -> Result<&InitResolution, JobError> {
        self.resolved
            .get_or_try_init(|| self.resolve_markers())
            .await
    }

    async fn resolve_markers(self: &Arc<Self>) -> Result<InitResolution, JobError> {
        let gate = self.gate.lock().await;
        let generation = self.generation();
        if generation != 0 {
            debug!(dataset_id = %self.dataset_id, "export already started, skipping init resolution");
            return Ok(InitResolution::Skipped);
        }

        let active = match self.ctx.markers.read_active(&self.dataset_id).await {
            Ok(active) => active,
            Err(err) => {
                self.state.send_modify(|s| s.status = ExportStatus::Error);
                return Err(err.into());
            }
        };
        if let Some(command_id) = active {
            info!(dataset_id = %self.dataset_id, %command_id, "resuming in-flight export");
            self.state.send_modify(|s| s.status = ExportStatus::Running);
            self.spawn_tracking(generation, command_id.clone());
            return Ok(InitResolution::Resumed(command_id));
        }

        let finished = match self.ctx.markers.read_finished(&self.dataset_id).await {
            Ok(finished) => finished,
            Err(err) => {
                self.state.send_modify(|s| s.status = ExportStatus::Error);
                return Err(err.into());
            }
        };
        let Some(item_id) = finished else {
            info!(dataset_id = %self.dataset_id, "no previous export, waiting for an explicit start");
            self.state.send_modify(|s| s.status = ExportStatus::Error);
            return Ok(InitResolution::Idle);
        };
        drop(gate);

        info!(dataset_id = %self.dataset_id, %item_id, "replaying finished export");
        let loaded = self.load_artifact(&item_id, None).await;

        let _gate = self.gate.lock().await;
        if self.generation() != generation {
            debug!(dataset_id = %self.dataset_id, "superseded while replaying finished export");
            return Ok(InitResolution::Skipped);
        }
        match loaded {
            Ok(loaded) => {
                self.publish_ready(item_id, loaded);
                info!(dataset_id = %self.dataset_id, "export restored from finished marker");
                Ok(InitResolution::Replayed)
            }
            Err(err) => {
                warn!(dataset_id = %self.dataset_id, error = %err, "finished export is unusable");
                self.state.send_modify(|s| s.status = ExportStatus::Error);
                Ok(InitResolution::Idle)
            }
        }
    }

    /// Start a fresh export, or reuse the loaded one when `use_cache` is set.
    /// Returns as soon as the command is registered; tracking continues in
    /// the background.
    ///
    /// Markers are resolved first, so a command resumed from the active
    /// marker is attached to instead of being started again.
    pub async fn start(
        self: &Arc<Self>,
        use_cache: bool,
        timezone: Option<Tz>,
    ) -> Result<StartOutcome, JobError> {
        let resolution = self.resolution().await?;
        let _gate = self.gate.lock().await;

        let (current_generation, status) = {
            let current = self.state.borrow();
            (current.generation, current.status)
        };
        if let InitResolution::Resumed(command_id) = resolution
            && current_generation == 0
            && status == ExportStatus::Running
        {
            if let Some(tz) = timezone {
                self.state.send_modify(|s| s.timezone = tz);
            }
            info!(dataset_id = %self.dataset_id, %command_id, "export already in flight, attaching");
            return Ok(StartOutcome::Attached {
                command_id: command_id.clone(),
            });
        }

        if use_cache && status == ExportStatus::Ready {
            if let Some(tz) = timezone {
                self.state.send_modify(|s| s.timezone = tz);
            }
            info!(dataset_id = %self.dataset_id, "export cache hit");
            return Ok(StartOutcome::CacheHit);
        }

        let generation = current_generation + 1;
        self.state.send_modify(|s| {
            s.generation = generation;
            s.status = ExportStatus::Starting;
            s.progress = 0;
            s.export_item_id.clear();
            s.last_update = None;
            s.features = Arc::new(LoadedFeatures::default());
            if let Some(tz) = timezone {
                s.timezone = tz;
            }
        });
        info!(dataset_id = %self.dataset_id, generation, "starting export");

        let registered = async {
            let command_id = self.ctx.platform.start_export(&self.dataset_id).await?;
            self.ctx
                .markers
                .write_active(&self.dataset_id, &command_id)
                .await?;
            Ok::<_, JobError>(command_id)
        }
        .await;
        let command_id = match registered {
            Ok(command_id) => command_id,
            Err(err) => {
                error!(dataset_id = %self.dataset_id, generation, error = %err, "could not start export");
                self.state.send_modify(|s| s.status = ExportStatus::Error);
                return Err(err);
            }
        };

        self.state.send_modify(|s| s.status = ExportStatus::Running);
        self.spawn_tracking(generation, command_id.clone());
        Ok(StartOutcome::Started {
            command_id,
            generation,
        })
    }

    fn spawn_tracking(self: &Arc<Self>, generation: u64, command_id: String) {
        let span = info_span!(
            "export_job",
            dataset_id = %self.dataset_id,
            command_id = %command_id,
            generation
        );
        let this = Arc::clone(self);
        tokio::spawn(async move { this.track(generation, command_id).await }.instrument(span));
    }

    async fn track(self: Arc<Self>, generation: u64, command_id: String) {
        let outcome = match self.poll_command(generation, &command_id).await {
            Ok(status) => self.complete(generation, &command_id, status).await,
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            self.fail(generation, &command_id, err).await;
        }
    }

    async fn poll_command(&self, generation: u64, command_id: &str) -> Result<CommandStatus, JobError> {
        let status = poll(&self.ctx.export_policy, move || async move {
            let status = self.ctx.platform.command_status(command_id).await?;
            self.publish_progress(generation, poll_phase_progress(status.progress));
            Ok::<_, PlatformError>(status)
        })
        .await?;
        Ok(status)
    }

    async fn complete(
        self: &Arc<Self>,
        generation: u64,
        command_id: &str,
        status: CommandStatus,
    ) -> Result<(), JobError> {
        let item_id = {
            let _gate = self.gate.lock().await;
            if self.generation() != generation {
                debug!("export finished after being superseded");
                self.release_stale_marker(command_id).await;
                return Ok(());
            }
            // Commit point: once cleared, a restart no longer resumes this command.
            self.ctx.markers.clear_active(&self.dataset_id).await?;
            let item_id = status.output_item_id.ok_or_else(|| JobError::MissingOutput {
                command_id: command_id.to_string(),
            })?;
            self.ctx
                .markers
                .write_finished(&self.dataset_id, &item_id)
                .await?;
            item_id
        };

        info!(%item_id, "export command finished, loading artifact");
        let loaded = self.load_artifact(&item_id, Some(generation)).await?;

        let _gate = self.gate.lock().await;
        if self.generation() != generation {
            debug!("superseded while loading the export artifact");
            return Ok(());
        }
        self.publish_ready(item_id, loaded);
        info!("export ready");
        Ok(())
    }

    async fn fail(&self, generation: u64, command_id: &str, err: JobError) {
        let _gate = self.gate.lock().await;
        if self.generation() != generation {
            warn!(error = %err, "superseded export job failed");
            self.release_stale_marker(command_id).await;
            return;
        }
        if let Err(clear_err) = self.ctx.markers.clear_active(&self.dataset_id).await {
            error!(error = %clear_err, "failed to clear the active export marker");
        }
        self.state.send_modify(|s| s.status = ExportStatus::Error);
        error!(
            progress = self.state.borrow().progress,
            infrastructure = err.is_infrastructure(),
            error = %err,
            "export job failed"
        );
    }

    /// A superseded job clears the active marker only while it still names its command.
    async fn release_stale_marker(&self, command_id: &str) {
        match self.ctx.markers.read_active(&self.dataset_id).await {
            Ok(Some(active)) if active == command_id => {
                match self.ctx.markers.clear_active(&self.dataset_id).await {
                    Ok(_) => debug!("cleared the marker of a superseded export"),
                    Err(err) => warn!(error = %err, "failed to clear a superseded export marker"),
                }
            }
            Ok(_) => debug!("active marker belongs to a newer export"),
            Err(err) => warn!(error = %err, "could not inspect the active export marker"),
        }
    }

    /// Download, validate and group the export artifact. With a generation,
    /// load-phase progress is published for that job.
    async fn load_artifact(
        self: &Arc<Self>,
        item_id: &str,
        progress_for: Option<u64>,
    ) -> Result<LoadedExport, JobError> {
        let downloaded = self.ctx.platform.download_item(item_id).await?;
        let set_names = self.ctx.platform.feature_set_names(&self.dataset_id).await?;
        let created_at = downloaded.created_at;
        let bytes = downloaded.bytes;

        let this = Arc::clone(self);
        let owned_item_id = item_id.to_string();
        let sets = tokio::task::spawn_blocking(move || {
            let artifact = ExportArtifact::parse(&bytes).map_err(|source| {
                JobError::InvalidArtifact {
                    item_id: owned_item_id,
                    source,
                }
            })?;
            debug!(items = artifact.len(), "export artifact parsed");
            Ok::<_, JobError>(artifact.group(&set_names, |progress| {
                if let Some(generation) = progress_for {
                    this.publish_progress(generation, progress);
                }
            }))
        })
        .await??;

        Ok(LoadedExport {
            features: LoadedFeatures::new(sets),
            created_at,
        })
    }

    /// Raise the running job's progress; never lowers it.
    fn publish_progress(&self, generation: u64, progress: u8) {
        debug_assert!(progress <= 100, "progress {progress} exceeds 100");
        self.state.send_if_modified(|s| {
            let applies = s.generation == generation
                && s.status == ExportStatus::Running
                && progress > s.progress;
            if applies {
                s.progress = progress;
            }
            applies
        });
    }

    fn publish_ready(&self, item_id: String, loaded: LoadedExport) {
        self.state.send_modify(|s| {
            s.status = ExportStatus::Ready;
            s.progress = 100;
            s.export_item_id = item_id;
            s.last_update = Some(loaded.created_at);
            s.features = Arc::new(loaded.features);
        });
    }
}

/// Remote command progress mapped into the polling window `[0, 50]`.
fn poll_phase_progress(remote: u8) -> u8 {
    let scaled = u16::from(remote.min(100)) * u16::from(POLL_PHASE_MAX_PROGRESS) / 100;
    debug_assert!(scaled <= u16::from(POLL_PHASE_MAX_PROGRESS));
    scaled as u8
}
