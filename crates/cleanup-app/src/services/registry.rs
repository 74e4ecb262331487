use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{Instrument, info, info_span, warn};

use crate::services::context::{JobContext, JobError};
use crate::services::executions::ExecutionSupervisor;
use crate::services::export::ExportOrchestrator;
use crate::services::markers::validate_segment;

/// Job state of one dataset: its export plus its dependent tasks.
pub struct DatasetSession {
    pub export: Arc<ExportOrchestrator>,
    pub executions: Arc<ExecutionSupervisor>,
}

impl DatasetSession {
    fn new(dataset_id: &str, ctx: &JobContext) -> Self {
        let export = ExportOrchestrator::new(dataset_id, ctx.clone());
        let executions = ExecutionSupervisor::new(ctx.clone(), Arc::clone(&export));
        Self { export, executions }
    }
}

/// Process-wide map from dataset id to its session.
///
/// Sessions are only ever created through [`DatasetRegistry::open`]; lookups
/// never create state.
pub struct DatasetRegistry {
    ctx: JobContext,
    sessions: DashMap<String, Arc<DatasetSession>>,
}

impl DatasetRegistry {
    pub fn new(ctx: JobContext) -> Self {
        Self {
            ctx,
            sessions: DashMap::new(),
        }
    }

    pub fn context(&self) -> &JobContext {
        &self.ctx
    }

    /// Return the dataset's session, creating it on first use. A new session
    /// resolves its markers in a background task.
    pub fn open(&self, dataset_id: &str) -> Result<Arc<DatasetSession>, JobError> {
        validate_segment(dataset_id).map_err(|err| JobError::Validation(err.to_string()))?;
        if let Some(existing) = self.sessions.get(dataset_id) {
            return Ok(Arc::clone(existing.value()));
        }

        let session = match self.sessions.entry(dataset_id.to_string()) {
            Entry::Occupied(existing) => return Ok(Arc::clone(existing.get())),
            Entry::Vacant(slot) => {
                let session = Arc::new(DatasetSession::new(dataset_id, &self.ctx));
                slot.insert(Arc::clone(&session));
                session
            }
        };

        info!(dataset_id, sessions = self.sessions.len(), "dataset session opened");
        let export = Arc::clone(&session.export);
        let span = info_span!("resolve_export", dataset_id = %dataset_id);
        tokio::spawn(
            async move {
                if let Err(err) = export.resolve_on_init().await {
                    warn!(error = %err, "export state resolution failed");
                }
            }
            .instrument(span),
        );
        Ok(session)
    }

    pub fn get(&self, dataset_id: &str) -> Result<Arc<DatasetSession>, JobError> {
        self.sessions
            .get(dataset_id)
            .map(|session| Arc::clone(session.value()))
            .ok_or_else(|| JobError::UnknownDataset(dataset_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
