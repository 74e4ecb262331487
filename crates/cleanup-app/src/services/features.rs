//! Export artifact parsing and the per-export feature cache.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{debug, warn};

use crate::clustering::neighbors::{NeighborIndex, build_neighbor_index};
use crate::constants::{LOAD_PHASE_MAX_PROGRESS, POLL_PHASE_MAX_PROGRESS};

/// One item's vector within one feature set.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureRecord {
    pub item_id: String,
    pub value: Vec<f32>,
    pub name: String,
    pub thumbnail: String,
    pub annotated: bool,
}

/// Feature-set name to its records, in export order.
pub type FeatureSetExport = BTreeMap<String, Arc<[FeatureRecord]>>;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("export artifact is not a valid JSON export: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct ExportedItem {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    annotated: Option<bool>,
    #[serde(rename = "itemVectors", default)]
    item_vectors: Vec<ExportedVector>,
}

#[derive(Debug, Deserialize)]
struct ExportedVector {
    #[serde(rename = "featureSetId")]
    feature_set_id: String,
    #[serde(default)]
    value: Vec<f32>,
}

/// Parsed export artifact, not yet grouped.
#[derive(Debug)]
pub struct ExportArtifact {
    items: Vec<ExportedItem>,
}

impl ExportArtifact {
    pub fn parse(bytes: &[u8]) -> Result<Self, ArtifactError> {
        let items: Vec<ExportedItem> = serde_json::from_slice(bytes)?;
        Ok(Self { items })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Group item vectors by feature-set name. Ids missing from `set_names`
    /// keep their id as the name. `on_progress` sees each distinct load-phase
    /// progress value as items are consumed.
    pub fn group(
        self,
        set_names: &HashMap<String, String>,
        mut on_progress: impl FnMut(u8),
    ) -> FeatureSetExport {
        let total = self.items.len();
        let mut grouped: BTreeMap<String, Vec<FeatureRecord>> = BTreeMap::new();
        let mut last_reported = None;

        for (idx, item) in self.items.into_iter().enumerate() {
            let thumbnail = item.thumbnail.unwrap_or_default();
            let annotated = item.annotated.unwrap_or(false);
            for vector in item.item_vectors {
                let set_name = set_names
                    .get(&vector.feature_set_id)
                    .filter(|name| !name.is_empty())
                    .cloned()
                    .unwrap_or(vector.feature_set_id);
                grouped.entry(set_name).or_default().push(FeatureRecord {
                    item_id: item.id.clone(),
                    value: vector.value,
                    name: item.name.clone(),
                    thumbnail: thumbnail.clone(),
                    annotated,
                });
            }

            let progress = load_progress(idx + 1, total);
            if last_reported != Some(progress) {
                last_reported = Some(progress);
                on_progress(progress);
            }
        }

        grouped
            .into_iter()
            .map(|(name, records)| (name, Arc::from(records)))
            .collect()
    }
}

/// Load-phase progress after `done` of `total` items, scaled into `[50, 95]`.
pub fn load_progress(done: usize, total: usize) -> u8 {
    if total == 0 {
        return LOAD_PHASE_MAX_PROGRESS;
    }
    let span = f64::from(LOAD_PHASE_MAX_PROGRESS - POLL_PHASE_MAX_PROGRESS);
    let scaled = (done.min(total) as f64 / total as f64 * span).round() as u8;
    let progress = POLL_PHASE_MAX_PROGRESS + scaled;
    debug_assert!(
        (POLL_PHASE_MAX_PROGRESS..=LOAD_PHASE_MAX_PROGRESS).contains(&progress),
        "load progress {progress} outside the load window"
    );
    progress
}

/// Feature data of one completed export plus its lazily built neighbour lists.
#[derive(Debug, Default)]
pub struct LoadedFeatures {
    sets: FeatureSetExport,
    neighbors: DashMap<String, Arc<NeighborIndex>>,
}

impl LoadedFeatures {
    pub fn new(sets: FeatureSetExport) -> Self {
        Self {
            sets,
            neighbors: DashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Record count per feature set.
    pub fn set_sizes(&self) -> BTreeMap<String, usize> {
        self.sets
            .iter()
            .map(|(name, records)| (name.clone(), records.len()))
            .collect()
    }

    pub fn records(&self, set_name: &str) -> Option<Arc<[FeatureRecord]>> {
        self.sets.get(set_name).cloned()
    }

    /// Neighbour lists for `set_name`, computed on a blocking thread on first use.
    ///
    /// The index is built by brute force in `O(n² · d)`, so sets larger than
    /// `max_items` are refused and yield `None`.
    pub async fn neighbor_index(
        &self,
        set_name: &str,
        max_neighbors: usize,
        max_items: usize,
    ) -> Result<Option<Arc<NeighborIndex>>, JoinError> {
        if let Some(cached) = self.neighbors.get(set_name) {
            return Ok(Some(Arc::clone(cached.value())));
        }
        let Some(records) = self.records(set_name) else {
            return Ok(None);
        };

        let count = records.len();
        if count > max_items {
            warn!(set_name, items = count, max_items, "feature set too large to index");
            return Ok(None);
        }
        let built = tokio::task::spawn_blocking(move || {
            let vectors: Vec<&[f32]> = records.iter().map(|r| r.value.as_slice()).collect();
            build_neighbor_index(&vectors, max_neighbors)
        })
        .await?;
        debug!(set_name, items = count, max_neighbors, "neighbour index built");

        let entry = self
            .neighbors
            .entry(set_name.to_string())
            .or_insert_with(|| Arc::new(built));
        Ok(Some(Arc::clone(entry.value())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARTIFACT: &str = r#"[
        {"id": "i1", "name": "a.jpg", "thumbnail": "t1", "annotated": true,
         "itemVectors": [{"featureSetId": "fs-clip", "value": [1.0, 0.0]},
                          {"featureSetId": "fs-raw", "value": [0.5]}]},
        {"id": "i2", "name": "b.jpg",
         "itemVectors": [{"featureSetId": "fs-clip", "value": [0.0, 1.0]}]},
        {"id": "i3", "name": "c.jpg", "itemVectors": []},
        {"id": "i4", "name": "d.jpg",
         "itemVectors": [{"featureSetId": "fs-clip", "value": [1.0, 1.0]}]}
    ]"#;

    fn names() -> HashMap<String, String> {
        HashMap::from([("fs-clip".to_string(), "clip-feature-set".to_string())])
    }

    #[test]
    fn groups_by_feature_set_name_with_id_fallback() {
        let artifact = ExportArtifact::parse(ARTIFACT.as_bytes()).unwrap();
        assert_eq!(artifact.len(), 4);
        let sets = artifact.group(&names(), |_| {});

        let clip = &sets["clip-feature-set"];
        let ids: Vec<&str> = clip.iter().map(|r| r.item_id.as_str()).collect();
        assert_eq!(ids, ["i1", "i2", "i4"]);
        assert!(clip[0].annotated);
        assert_eq!(clip[0].thumbnail, "t1");
        assert!(!clip[1].annotated);
        assert_eq!(clip[1].thumbnail, "");

        // Unknown feature-set ids are kept under their id.
        assert_eq!(sets["fs-raw"].len(), 1);
        assert_eq!(sets.len(), 2);
    }

    #[test]
    fn load_progress_is_scaled_into_load_window() {
        let artifact = ExportArtifact::parse(ARTIFACT.as_bytes()).unwrap();
        let mut seen = Vec::new();
        artifact.group(&names(), |p| seen.push(p));
        // round(k / 4 * 45) + 50 for k = 1..=4
        assert_eq!(seen, vec![61, 73, 84, 95]);

        assert_eq!(load_progress(0, 10), 50);
        assert_eq!(load_progress(10, 10), 95);
        assert_eq!(load_progress(0, 0), 95);
    }

    #[test]
    fn rejects_non_export_json() {
        assert!(ExportArtifact::parse(b"{\"not\": \"a list\"}").is_err());
        assert!(ExportArtifact::parse(b"garbage").is_err());
        assert!(ExportArtifact::parse(b"[]").unwrap().is_empty());
    }

    #[tokio::test]
    async fn neighbor_index_is_cached_per_set() {
        let sets = ExportArtifact::parse(ARTIFACT.as_bytes())
            .unwrap()
            .group(&names(), |_| {});
        let loaded = LoadedFeatures::new(sets);
        assert_eq!(
            loaded.set_sizes(),
            BTreeMap::from([("clip-feature-set".to_string(), 3), ("fs-raw".to_string(), 1)])
        );

        let first = loaded.neighbor_index("clip-feature-set", 10, 100).await.unwrap().unwrap();
        let second = loaded.neighbor_index("clip-feature-set", 10, 100).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.len(), 3);
        assert!(loaded.neighbor_index("missing", 10, 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_sets_are_not_indexed() {
        let sets = ExportArtifact::parse(ARTIFACT.as_bytes())
            .unwrap()
            .group(&names(), |_| {});
        let loaded = LoadedFeatures::new(sets);

        assert!(loaded.neighbor_index("clip-feature-set", 10, 2).await.unwrap().is_none());
        assert!(loaded.neighbor_index("clip-feature-set", 10, 3).await.unwrap().is_some());
    }
}
