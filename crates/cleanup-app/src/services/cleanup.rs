//! Request-facing operations of the cleanup panel.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::clustering::{Cluster, ClusterParams, cluster};
use crate::services::context::{JobContext, JobError};
use crate::services::executions::ExecutionSnapshot;
use crate::services::export::{ExportStatusView, StartOutcome, parse_timezone};
use crate::services::markers::validate_segment;
use crate::services::platform::{ItemSummary, RangeFilter};
use crate::services::registry::{DatasetRegistry, DatasetSession};
use crate::services::status::{ExecType, QualityScoreType};

/// Neighbour lists kept per item when none is configured.
pub const DEFAULT_MAX_NEIGHBORS: usize = 200;

/// Largest feature set the brute-force neighbour index accepts by default.
pub const DEFAULT_MAX_INDEXED_ITEMS: usize = 20_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterQuery<'a> {
    pub feature_set: &'a str,
    pub params: ClusterParams,
    /// One-based page to return; zero returns every page.
    pub page: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QualityScores {
    pub items: Vec<ItemSummary>,
    pub total: usize,
}

pub struct CleanupService {
    registry: DatasetRegistry,
    max_neighbors: usize,
    max_indexed_items: usize,
}

impl CleanupService {
    pub fn new(ctx: JobContext, max_neighbors: usize) -> Self {
        Self {
            registry: DatasetRegistry::new(ctx),
            max_neighbors: max_neighbors.max(1),
            max_indexed_items: DEFAULT_MAX_INDEXED_ITEMS,
        }
    }

    /// Feature sets with more records than this cluster to the placeholder.
    pub fn with_max_indexed_items(mut self, max_indexed_items: usize) -> Self {
        self.max_indexed_items = max_indexed_items.max(1);
        self
    }

    pub fn registry(&self) -> &DatasetRegistry {
        &self.registry
    }

    pub fn open_dataset(&self, dataset_id: &str) -> Result<Arc<DatasetSession>, JobError> {
        self.registry.open(dataset_id)
    }

    pub async fn start_export(
        &self,
        dataset_id: &str,
        use_cache: bool,
        timezone: Option<&str>,
    ) -> Result<StartOutcome, JobError> {
        let session = self.registry.get(dataset_id)?;
        session
            .export
            .start(use_cache, timezone.map(parse_timezone))
            .await
    }

    pub fn export_status(&self, dataset_id: &str) -> Result<ExportStatusView, JobError> {
        Ok(self.registry.get(dataset_id)?.export.snapshot().view())
    }

    /// Record count per loaded feature set; empty until an export is ready.
    pub fn feature_set_names(&self, dataset_id: &str) -> Result<BTreeMap<String, usize>, JobError> {
        Ok(self.registry.get(dataset_id)?.export.features().set_sizes())
    }

    pub async fn start_execution(
        &self,
        dataset_id: &str,
        exec_type: ExecType,
    ) -> Result<ExecutionSnapshot, JobError> {
        self.registry.get(dataset_id)?.executions.start(exec_type).await
    }

    pub fn execution_status(
        &self,
        dataset_id: &str,
        exec_type: ExecType,
    ) -> Result<ExecutionSnapshot, JobError> {
        Ok(self.registry.get(dataset_id)?.executions.snapshot(exec_type))
    }

    /// Cluster one feature set of the loaded export. Bad parameters and
    /// unknown feature sets yield the placeholder cluster.
    pub async fn clusters(
        &self,
        dataset_id: &str,
        query: ClusterQuery<'_>,
    ) -> Result<Vec<Cluster>, JobError> {
        let session = self.registry.get(dataset_id)?;
        if let Err(err) = query.params.validate() {
            warn!(dataset_id, error = %err, "rejecting clustering parameters");
            return Ok(vec![Cluster::placeholder()]);
        }

        let features = session.export.features();
        let Some(records) = features.records(query.feature_set) else {
            warn!(dataset_id, feature_set = query.feature_set, "feature set not loaded");
            return Ok(vec![Cluster::placeholder()]);
        };
        let Some(index) = features
            .neighbor_index(query.feature_set, self.max_neighbors, self.max_indexed_items)
            .await?
        else {
            return Ok(vec![Cluster::placeholder()]);
        };

        let params = query.params;
        let clustered =
            tokio::task::spawn_blocking(move || cluster(&records, index.lists(), &params)).await?;
        let clusters = match clustered {
            Ok(clusters) => clusters,
            Err(err) => {
                warn!(dataset_id, error = %err, "clustering rejected its parameters");
                vec![Cluster::placeholder()]
            }
        };
        debug!(
            dataset_id,
            feature_set = query.feature_set,
            clusters = clusters.len(),
            page = query.page,
            "clusters computed"
        );
        Ok(select_page(clusters, query.page))
    }

    /// Items whose quality score lies strictly between `min` and `max`.
    /// Unsupported score types and platform rejections yield no items.
    pub async fn quality_scores(
        &self,
        dataset_id: &str,
        score_type: &str,
        min: f64,
        max: f64,
    ) -> Result<QualityScores, JobError> {
        validate_segment(dataset_id).map_err(|err| JobError::Validation(err.to_string()))?;
        let Ok(kind) = QualityScoreType::from_str(score_type) else {
            warn!(dataset_id, score_type, "quality score type not supported");
            return Ok(QualityScores::default());
        };
        if !(min.is_finite() && max.is_finite()) {
            warn!(dataset_id, min, max, "quality score bounds must be finite");
            return Ok(QualityScores::default());
        }

        let filter = RangeFilter {
            field: kind.metadata_field(),
            min,
            max,
        };
        match self
            .registry
            .context()
            .platform
            .query_items(dataset_id, filter)
            .await
        {
            Ok(items) => Ok(QualityScores {
                total: items.len(),
                items,
            }),
            Err(err) => {
                warn!(dataset_id, score_type, error = %err, "quality score query failed");
                Ok(QualityScores::default())
            }
        }
    }

    /// Number of items carrying a darkness score in `(0, 1)`.
    pub async fn quality_scores_exist(&self, dataset_id: &str) -> Result<usize, JobError> {
        let scores = self
            .quality_scores(dataset_id, QualityScoreType::Darkness.as_ref(), 0.0, 1.0)
            .await?;
        Ok(scores.total)
    }
}

/// Keep the clusters of one page (all of them for page zero). The first
/// returned cluster is the chosen one.
fn select_page(clusters: Vec<Cluster>, page: usize) -> Vec<Cluster> {
    if page == 0 {
        return clusters;
    }
    let mut selected: Vec<Cluster> = clusters
        .into_iter()
        .filter(|cluster| cluster.page == page && !cluster.is_placeholder())
        .collect();
    if selected.is_empty() {
        return vec![Cluster::placeholder()];
    }
    for (idx, cluster) in selected.iter_mut().enumerate() {
        cluster.is_chosen = idx == 0;
    }
    selected
}
