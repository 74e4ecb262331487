use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::services::features::ArtifactError;
use crate::services::markers::{MarkerError, MarkerStore};
use crate::services::platform::{Platform, PlatformError};
use crate::services::poller::{PollError, PollPolicy};
use crate::services::status::UnknownRemoteStatus;

/// Collaborators shared by every dataset's jobs.
#[derive(Clone, bon::Builder)]
pub struct JobContext {
    pub platform: Arc<dyn Platform>,
    pub markers: MarkerStore,
    #[builder(default)]
    pub export_policy: PollPolicy,
    #[builder(default)]
    pub execution_policy: PollPolicy,
}

/// Failures of export and execution jobs.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Markers(#[from] MarkerError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("remote job reported `{raw}` at {progress}%")]
    RemoteFailure { raw: String, progress: u8 },
    #[error("remote job timed out after {elapsed:?} at {progress}% (last status `{raw}`)")]
    Timeout {
        elapsed: Duration,
        progress: u8,
        raw: String,
    },
    #[error("export command `{command_id}` finished without an output item")]
    MissingOutput { command_id: String },
    #[error("export artifact `{item_id}` is unusable: {source}")]
    InvalidArtifact {
        item_id: String,
        #[source]
        source: ArtifactError,
    },
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("dataset `{0}` has not been opened")]
    UnknownDataset(String),
    #[error("background task aborted: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl JobError {
    /// Transport or storage failures, as opposed to the remote job itself failing.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            JobError::Markers(_) | JobError::Platform(_) | JobError::Task(_)
        )
    }
}

impl From<PollError<PlatformError>> for JobError {
    fn from(err: PollError<PlatformError>) -> Self {
        match err {
            PollError::Timeout {
                elapsed,
                progress,
                raw,
            } => JobError::Timeout {
                elapsed,
                progress,
                raw,
            },
            PollError::RemoteFailure { raw, progress } => JobError::RemoteFailure { raw, progress },
            PollError::Fetch {
                source: PlatformError::UnknownRemoteStatus(UnknownRemoteStatus(raw)),
                progress,
            } => JobError::RemoteFailure { raw, progress },
            PollError::Fetch { source, .. } => JobError::Platform(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_remote_status_is_a_remote_failure() {
        let err = JobError::from(PollError::Fetch {
            source: PlatformError::UnknownRemoteStatus(UnknownRemoteStatus("paused".to_string())),
            progress: 42,
        });

        assert!(matches!(
            &err,
            JobError::RemoteFailure { raw, progress: 42 } if raw == "paused"
        ));
        assert!(!err.is_infrastructure());
    }

    #[test]
    fn transport_failures_stay_infrastructure() {
        let err = JobError::from(PollError::Fetch {
            source: PlatformError::NotFound {
                kind: "command",
                id: "cmd-1".to_string(),
            },
            progress: 0,
        });
        assert!(matches!(err, JobError::Platform(PlatformError::NotFound { .. })));
        assert!(err.is_infrastructure());

        let timeout = JobError::from(PollError::<PlatformError>::Timeout {
            elapsed: Duration::from_secs(5),
            progress: 10,
            raw: "in-progress".to_string(),
        });
        assert!(!timeout.is_infrastructure());
    }
}
