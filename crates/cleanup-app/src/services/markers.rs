//! Durable export markers.
//!
//! Two small JSON pointers persisted per dataset in the blob store:
//!
//! - `fv_json/{dataset}/active_export.json` = `{"commandId": ...}` exists while
//!   an export command is in flight at the platform.
//! - `fv_done_json/{dataset}/{output_item}.json` = `{"OutputItemId": ...}` is
//!   written once the export artifact is confirmed.
//!
//! The key names inside both documents are fixed so markers written by earlier
//! deployments stay readable.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::constants::{ACTIVE_EXPORT_DIR, ACTIVE_EXPORT_FILE, FINISHED_EXPORT_DIR};
use crate::services::blob_store::{BlobError, BlobStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ActiveExportMarker {
    #[serde(rename = "commandId")]
    command_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct FinishedExportMarker {
    #[serde(rename = "OutputItemId")]
    output_item_id: String,
}

#[derive(Debug, Error)]
pub enum MarkerError {
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Encode(#[from] serde_json::Error),
    #[error("invalid identifier `{0}` for a marker path")]
    InvalidId(String),
}

/// Reads and writes the active/finished export markers for a dataset.
#[derive(Clone)]
pub struct MarkerStore {
    blobs: Arc<dyn BlobStore>,
}

impl MarkerStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    pub async fn read_active(&self, dataset_id: &str) -> Result<Option<String>, MarkerError> {
        let key = active_key(dataset_id)?;
        let Some(raw) = self.blobs.get(&key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<ActiveExportMarker>(&raw) {
            Ok(marker) if !marker.command_id.is_empty() => Ok(Some(marker.command_id)),
            Ok(_) => {
                warn!(dataset_id, %key, "active export marker has an empty command id");
                Ok(None)
            }
            Err(err) => {
                warn!(dataset_id, %key, error = %err, "ignoring unreadable active export marker");
                Ok(None)
            }
        }
    }

    pub async fn write_active(&self, dataset_id: &str, command_id: &str) -> Result<(), MarkerError> {
        let key = active_key(dataset_id)?;
        let body = serde_json::to_vec(&ActiveExportMarker {
            command_id: command_id.to_string(),
        })?;
        self.blobs.put(&key, Bytes::from(body)).await?;
        debug!(dataset_id, command_id, "active export marker written");
        Ok(())
    }

    /// Remove the active marker. Returns whether a marker was present.
    pub async fn clear_active(&self, dataset_id: &str) -> Result<bool, MarkerError> {
        let key = active_key(dataset_id)?;
        let removed = self.blobs.delete(&key).await?;
        debug!(dataset_id, removed, "active export marker cleared");
        Ok(removed)
    }

    /// Return the output item of the most recently created finished marker.
    /// Unreadable markers are skipped.
    pub async fn read_finished(&self, dataset_id: &str) -> Result<Option<String>, MarkerError> {
        let prefix = finished_prefix(dataset_id)?;
        let mut listed = self.blobs.list(&prefix).await?;
        listed.retain(|meta| meta.key.ends_with(".json"));
        listed.sort_by(|a, b| {
            b.created_at_ms
                .cmp(&a.created_at_ms)
                .then_with(|| b.key.cmp(&a.key))
        });
        if listed.len() > 1 {
            debug!(dataset_id, count = listed.len(), "multiple finished export markers");
        }

        for meta in listed {
            let Some(raw) = self.blobs.get(&meta.key).await? else {
                continue;
            };
            match serde_json::from_slice::<FinishedExportMarker>(&raw) {
                Ok(marker) if !marker.output_item_id.is_empty() => {
                    return Ok(Some(marker.output_item_id));
                }
                Ok(_) => warn!(dataset_id, key = %meta.key, "finished marker has an empty item id"),
                Err(err) => {
                    warn!(dataset_id, key = %meta.key, error = %err, "ignoring unreadable finished marker")
                }
            }
        }
        Ok(None)
    }

    pub async fn write_finished(
        &self,
        dataset_id: &str,
        output_item_id: &str,
    ) -> Result<(), MarkerError> {
        let key = finished_key(dataset_id, output_item_id)?;
        let body = serde_json::to_vec(&FinishedExportMarker {
            output_item_id: output_item_id.to_string(),
        })?;
        self.blobs.put(&key, Bytes::from(body)).await?;
        debug!(dataset_id, output_item_id, "finished export marker written");
        Ok(())
    }
}

/// Dataset and item identifiers become single path segments.
pub fn validate_segment(id: &str) -> Result<(), MarkerError> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && !id.contains(['/', '\\'])
        && !id.chars().any(char::is_control);
    if valid {
        Ok(())
    } else {
        Err(MarkerError::InvalidId(id.to_string()))
    }
}

fn active_key(dataset_id: &str) -> Result<String, MarkerError> {
    validate_segment(dataset_id)?;
    Ok(format!("{ACTIVE_EXPORT_DIR}/{dataset_id}/{ACTIVE_EXPORT_FILE}"))
}

fn finished_prefix(dataset_id: &str) -> Result<String, MarkerError> {
    validate_segment(dataset_id)?;
    Ok(format!("{FINISHED_EXPORT_DIR}/{dataset_id}/"))
}

fn finished_key(dataset_id: &str, output_item_id: &str) -> Result<String, MarkerError> {
    validate_segment(output_item_id)?;
    Ok(format!("{}{output_item_id}.json", finished_prefix(dataset_id)?))
}
