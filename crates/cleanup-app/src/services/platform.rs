//! Contract with the external dataset platform.
//!
//! Everything that talks to the remote executor, item storage, or app
//! registry goes through [`Platform`]; the orchestration code never sees HTTP.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::poller::RemoteProgress;
use crate::services::status::{ExecTarget, RemoteState, UnknownRemoteStatus};

#[derive(Debug, Error, Clone)]
pub enum PlatformError {
    #[error("invalid platform base URL `{0}`")]
    InvalidBaseUrl(String),
    #[error("transport error during `{stage}`: {source}")]
    Transport {
        stage: &'static str,
        #[source]
        source: Arc<reqwest::Error>,
    },
    #[error("unexpected HTTP status {status} during `{stage}`: {body}")]
    UnexpectedStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[error("failed to decode `{stage}` response: {message}")]
    Decode { stage: &'static str, message: String },
    #[error(transparent)]
    UnknownRemoteStatus(#[from] UnknownRemoteStatus),
    #[error("{kind} `{id}` not found")]
    NotFound { kind: &'static str, id: String },
}

impl PlatformError {
    pub fn transport(stage: &'static str, error: reqwest::Error) -> Self {
        Self::Transport {
            stage,
            source: Arc::new(error),
        }
    }

    pub fn decode(stage: &'static str, message: impl Into<String>) -> Self {
        Self::Decode {
            stage,
            message: message.into(),
        }
    }

    /// Transient failures worth another attempt at the HTTP layer.
    pub fn is_retryable(&self) -> bool {
        match self {
            PlatformError::Transport { .. } => true,
            PlatformError::UnexpectedStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Snapshot of a platform export command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStatus {
    pub command_id: String,
    pub state: RemoteState,
    pub raw_status: String,
    pub progress: u8,
    /// Artifact produced by a finished export, if the platform reported one.
    pub output_item_id: Option<String>,
}

impl CommandStatus {
    pub fn from_raw(
        command_id: impl Into<String>,
        raw_status: impl Into<String>,
        progress: u8,
        output_item_id: Option<String>,
    ) -> Result<Self, UnknownRemoteStatus> {
        let raw_status = raw_status.into();
        Ok(Self {
            command_id: command_id.into(),
            state: RemoteState::parse(&raw_status)?,
            raw_status,
            progress: progress.min(100),
            output_item_id: output_item_id.filter(|id| !id.is_empty()),
        })
    }
}

impl RemoteProgress for CommandStatus {
    fn state(&self) -> RemoteState {
        self.state
    }

    fn progress(&self) -> u8 {
        self.progress
    }

    fn raw_status(&self) -> &str {
        &self.raw_status
    }
}

/// Snapshot of a platform function execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionProgress {
    pub execution_id: String,
    pub state: RemoteState,
    pub raw_status: String,
    pub progress: u8,
}

impl ExecutionProgress {
    pub fn from_raw(
        execution_id: impl Into<String>,
        raw_status: impl Into<String>,
        progress: u8,
    ) -> Result<Self, UnknownRemoteStatus> {
        let raw_status = raw_status.into();
        Ok(Self {
            execution_id: execution_id.into(),
            state: RemoteState::parse(&raw_status)?,
            raw_status,
            progress: progress.min(100),
        })
    }
}

impl RemoteProgress for ExecutionProgress {
    fn state(&self) -> RemoteState {
        self.state
    }

    fn progress(&self) -> u8 {
        self.progress
    }

    fn raw_status(&self) -> &str {
        &self.raw_status
    }
}

/// Raw item content plus its creation time.
#[derive(Debug, Clone)]
pub struct DownloadedItem {
    pub bytes: Bytes,
    pub created_at: DateTime<Utc>,
}

/// Item reference returned by quality-score queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSummary {
    pub item_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub thumbnail: String,
    #[serde(default)]
    pub annotated: bool,
}

/// Strict `min < field < max` range over an item metadata field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeFilter<'a> {
    pub field: &'a str,
    pub min: f64,
    pub max: f64,
}

#[async_trait]
pub trait Platform: Send + Sync {
    /// Request a full-vector export of the dataset. Returns the command id.
    async fn start_export(&self, dataset_id: &str) -> Result<String, PlatformError>;

    async fn command_status(&self, command_id: &str) -> Result<CommandStatus, PlatformError>;

    async fn download_item(&self, item_id: &str) -> Result<DownloadedItem, PlatformError>;

    /// Feature-set id to display name for the dataset's project.
    async fn feature_set_names(
        &self,
        dataset_id: &str,
    ) -> Result<HashMap<String, String>, PlatformError>;

    async fn app_installed(&self, dataset_id: &str, dpk_name: &str) -> Result<bool, PlatformError>;

    async fn install_app(&self, dataset_id: &str, dpk_name: &str) -> Result<(), PlatformError>;

    /// Create an execution of `target` over the dataset. Returns the execution id.
    async fn create_execution(
        &self,
        dataset_id: &str,
        target: &ExecTarget,
    ) -> Result<String, PlatformError>;

    async fn execution_status(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionProgress, PlatformError>;

    async fn query_items(
        &self,
        dataset_id: &str,
        filter: RangeFilter<'_>,
    ) -> Result<Vec<ItemSummary>, PlatformError>;
}
