//! Dependent compute tasks (feature extraction, quality scoring).
//!
//! One task slot per [`ExecType`] and dataset. A successful task triggers a
//! fresh, uncached export so the new features become visible.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use strum::IntoEnumIterator;
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::services::context::{JobContext, JobError};
use crate::services::export::{ExportOrchestrator, StartOutcome};
use crate::services::platform::{ExecutionProgress, PlatformError};
use crate::services::poller::poll;
use crate::services::status::{ExecStatus, ExecTarget, ExecType};

const INITIAL_FULL_STATUS: &str = "created";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionSnapshot {
    pub progress: u8,
    pub status: ExecStatus,
    /// Raw platform status, verbatim.
    #[serde(rename = "full_status")]
    pub full_status: String,
    #[serde(skip)]
    pub execution_id: Option<String>,
}

impl ExecutionSnapshot {
    fn idle() -> Self {
        Self {
            progress: 0,
            status: ExecStatus::Ready,
            full_status: INITIAL_FULL_STATUS.to_string(),
            execution_id: None,
        }
    }
}

pub struct ExecutionSupervisor {
    dataset_id: String,
    ctx: JobContext,
    export: Arc<ExportOrchestrator>,
    tasks: HashMap<ExecType, watch::Sender<ExecutionSnapshot>>,
}

impl ExecutionSupervisor {
    pub fn new(ctx: JobContext, export: Arc<ExportOrchestrator>) -> Arc<Self> {
        let tasks = ExecType::iter()
            .map(|exec_type| (exec_type, watch::channel(ExecutionSnapshot::idle()).0))
            .collect();
        Arc::new(Self {
            dataset_id: export.dataset_id().to_string(),
            ctx,
            export,
            tasks,
        })
    }

    fn slot(&self, exec_type: ExecType) -> &watch::Sender<ExecutionSnapshot> {
        // Every ExecType gets a slot in `new`.
        &self.tasks[&exec_type]
    }

    pub fn snapshot(&self, exec_type: ExecType) -> ExecutionSnapshot {
        self.slot(exec_type).borrow().clone()
    }

    pub fn subscribe(&self, exec_type: ExecType) -> watch::Receiver<ExecutionSnapshot> {
        self.slot(exec_type).subscribe()
    }

    /// Launch `exec_type` unless it is already running. Returns the task
    /// snapshot right after launch; completion is tracked in the background.
    pub async fn start(self: &Arc<Self>, exec_type: ExecType) -> Result<ExecutionSnapshot, JobError> {
        let slot = self.slot(exec_type);
        let claimed = slot.send_if_modified(|task| {
            if task.status == ExecStatus::Running {
                return false;
            }
            *task = ExecutionSnapshot {
                status: ExecStatus::Running,
                ..ExecutionSnapshot::idle()
            };
            true
        });
        if !claimed {
            debug!(dataset_id = %self.dataset_id, exec_type = exec_type.as_ref(), "execution already running");
            return Ok(self.snapshot(exec_type));
        }

        let target = exec_type.target();
        match self.launch(&target).await {
            Ok(execution_id) => {
                info!(
                    dataset_id = %self.dataset_id,
                    exec_type = exec_type.as_ref(),
                    %execution_id,
                    "execution created"
                );
                slot.send_modify(|task| task.execution_id = Some(execution_id.clone()));
                self.spawn_tracking(exec_type, execution_id);
                Ok(self.snapshot(exec_type))
            }
            Err(err) => {
                error!(
                    dataset_id = %self.dataset_id,
                    exec_type = exec_type.as_ref(),
                    error = %err,
                    "could not launch execution"
                );
                slot.send_modify(|task| task.status = ExecStatus::Error);
                Err(err)
            }
        }
    }

    async fn launch(&self, target: &ExecTarget) -> Result<String, JobError> {
        let platform = &self.ctx.platform;
        if !platform.app_installed(&self.dataset_id, target.dpk_name).await? {
            info!(dataset_id = %self.dataset_id, dpk = target.dpk_name, "installing app");
            platform.install_app(&self.dataset_id, target.dpk_name).await?;
        }
        Ok(platform.create_execution(&self.dataset_id, target).await?)
    }

    fn spawn_tracking(self: &Arc<Self>, exec_type: ExecType, execution_id: String) {
        let span = info_span!(
            "execution_task",
            dataset_id = %self.dataset_id,
            exec_type = exec_type.as_ref(),
            execution_id = %execution_id
        );
        let this = Arc::clone(self);
        tokio::spawn(async move { this.track(exec_type, execution_id).await }.instrument(span));
    }

    async fn track(self: Arc<Self>, exec_type: ExecType, execution_id: String) {
        let slot = self.slot(exec_type);
        let platform = &self.ctx.platform;
        let id = execution_id.as_str();
        let outcome = poll(&self.ctx.execution_policy, move || async move {
            let status = platform.execution_status(id).await?;
            slot.send_modify(|task| {
                task.progress = status.progress;
                task.full_status.clone_from(&status.raw_status);
            });
            Ok::<ExecutionProgress, PlatformError>(status)
        })
        .await;

        match outcome {
            Ok(_) => {
                slot.send_modify(|task| task.status = ExecStatus::Success);
                info!("execution succeeded, refreshing export");
                match self.export.start(false, None).await {
                    Ok(StartOutcome::Started { command_id, .. }) => {
                        debug!(%command_id, "export restarted after execution");
                    }
                    Ok(StartOutcome::Attached { command_id }) => {
                        debug!(%command_id, "resumed export still running");
                    }
                    Ok(StartOutcome::CacheHit) => {}
                    Err(err) => warn!(error = %err, "export restart after execution failed"),
                }
            }
            Err(err) => {
                let err = JobError::from(err);
                slot.send_modify(|task| task.status = ExecStatus::Error);
                error!(error = %err, "execution failed");
            }
        }
    }
}
