//! Closed status vocabularies for export jobs, execution tasks, and the raw
//! statuses reported by the platform.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumIter, EnumString};
use thiserror::Error;

/// Lifecycle of the per-dataset export job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ExportStatus {
    Loading,
    Starting,
    Running,
    Ready,
    Error,
}

/// Lifecycle of a dependent execution task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ExecStatus {
    Ready,
    Running,
    Success,
    Error,
}

/// Normalised state of a platform command or execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteState {
    Created,
    InProgress,
    Success,
    Failed,
    Aborted,
    Canceled,
    Terminated,
    TimedOut,
}

/// Every raw status string the platform is known to report.
const REMOTE_STATE_TABLE: &[(&str, RemoteState)] = &[
    ("created", RemoteState::Created),
    ("pending", RemoteState::Created),
    ("in-progress", RemoteState::InProgress),
    ("inProgress", RemoteState::InProgress),
    ("success", RemoteState::Success),
    ("failed", RemoteState::Failed),
    ("aborted", RemoteState::Aborted),
    ("canceled", RemoteState::Canceled),
    ("terminated", RemoteState::Terminated),
    ("timeout", RemoteState::TimedOut),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognised remote status `{0}`")]
pub struct UnknownRemoteStatus(pub String);

impl RemoteState {
    pub fn parse(raw: &str) -> Result<Self, UnknownRemoteStatus> {
        let needle = raw.trim();
        REMOTE_STATE_TABLE
            .iter()
            .find(|(name, _)| *name == needle)
            .map(|(_, state)| *state)
            .ok_or_else(|| UnknownRemoteStatus(raw.to_string()))
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, RemoteState::Created | RemoteState::InProgress)
    }

    pub fn is_success(self) -> bool {
        self == RemoteState::Success
    }
}

/// Platform application backing an execution task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecTarget {
    pub dpk_name: &'static str,
    pub service_name: &'static str,
    pub function_name: &'static str,
}

/// Dependent compute jobs that feed the export.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumString, AsRefStr, EnumIter,
    Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ExecType {
    Clip,
    QualityScoreGenerator,
}

impl ExecType {
    pub fn target(self) -> ExecTarget {
        match self {
            ExecType::Clip => ExecTarget {
                dpk_name: "clip-image-search",
                service_name: "clip-extraction",
                function_name: "extract_dataset",
            },
            ExecType::QualityScoreGenerator => ExecTarget {
                dpk_name: "quality-score-generator-app",
                service_name: "quality-scores-generator",
                function_name: "dataset_scores_generator",
            },
        }
    }
}

/// Scalar quality metrics stored on items by the quality-score generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
pub enum QualityScoreType {
    #[strum(serialize = "Darkness/Brightness")]
    Darkness,
    #[strum(serialize = "Blurriness/Sharpness")]
    Blurriness,
}

impl QualityScoreType {
    pub fn metadata_field(self) -> &'static str {
        match self {
            QualityScoreType::Darkness => "metadata.user.quality_scores.darkness_score",
            QualityScoreType::Blurriness => "metadata.user.quality_scores.blurriness_score",
        }
    }
}
