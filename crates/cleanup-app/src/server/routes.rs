//! Panel API handlers mounted under `/api`.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::clustering::{Cluster, ClusterParams};
use crate::server::error::ApiError;
use crate::services::{
    CleanupService, ClusterQuery, ExecType, ExecutionSnapshot, ExportStatusView, QualityScores,
    StartOutcome,
};

const SIMILARITY_TYPE: &str = "Similarity";

#[derive(Debug, Deserialize)]
struct DatasetParams {
    #[serde(rename = "datasetId")]
    dataset_id: String,
}

#[derive(Debug, Deserialize)]
struct ExportRunParams {
    #[serde(rename = "datasetId")]
    dataset_id: String,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(rename = "useCache", default)]
    use_cache: bool,
}

#[derive(Debug, Deserialize)]
struct ExecutionParams {
    #[serde(rename = "datasetId")]
    dataset_id: String,
    exec_type: String,
}

#[derive(Debug, Deserialize)]
struct ItemsParams {
    #[serde(rename = "datasetId")]
    dataset_id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "featureSetName", default)]
    feature_set_name: String,
    #[serde(default)]
    similarity: f32,
    /// Page to return; zero returns all pages.
    #[serde(default)]
    pagination: usize,
    /// Items per page.
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(rename = "minClusterSize", default = "default_min_cluster_size")]
    min_cluster_size: usize,
    #[serde(default)]
    min_v: f64,
    #[serde(default = "default_max_v")]
    max_v: f64,
}

fn default_limit() -> usize {
    10
}

fn default_min_cluster_size() -> usize {
    2
}

fn default_max_v() -> f64 {
    1.0
}

#[derive(Debug, Serialize)]
struct RunResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ItemsResponse {
    Clusters(Vec<Cluster>),
    Scores(QualityScores),
}

pub fn build_panel_router(service: Arc<CleanupService>) -> Router {
    Router::new()
        .route("/export/status", get(export_status))
        .route("/export/run", get(export_run))
        .route("/available_feature_sets", get(available_feature_sets))
        .route("/start_execution", get(start_execution))
        .route("/get_execution_status", get(get_execution_status))
        .route("/get_items", get(get_items))
        .route("/get_quality_score_exist", get(get_quality_score_exist))
        .with_state(service)
}

fn parse_exec_type(raw: &str) -> Result<ExecType, ApiError> {
    ExecType::from_str(raw).map_err(|_| ApiError::bad_request(format!("unknown exec_type `{raw}`")))
}

async fn export_status(
    State(service): State<Arc<CleanupService>>,
    Query(params): Query<DatasetParams>,
) -> Result<Json<ExportStatusView>, ApiError> {
    service.open_dataset(&params.dataset_id)?;
    let status = service.export_status(&params.dataset_id)?;
    tracing::debug!(dataset_id = %params.dataset_id, ?status, "export status");
    Ok(Json(status))
}

async fn export_run(
    State(service): State<Arc<CleanupService>>,
    Query(params): Query<ExportRunParams>,
) -> Result<Json<RunResponse>, ApiError> {
    service.open_dataset(&params.dataset_id)?;
    let outcome = service
        .start_export(&params.dataset_id, params.use_cache, params.timezone.as_deref())
        .await?;
    let status = match outcome {
        StartOutcome::CacheHit => "cached",
        StartOutcome::Attached { .. } => "running",
        StartOutcome::Started { .. } => "started",
    };
    Ok(Json(RunResponse { status }))
}

async fn available_feature_sets(
    State(service): State<Arc<CleanupService>>,
    Query(params): Query<DatasetParams>,
) -> Result<Json<BTreeMap<String, usize>>, ApiError> {
    service.open_dataset(&params.dataset_id)?;
    Ok(Json(service.feature_set_names(&params.dataset_id)?))
}

async fn start_execution(
    State(service): State<Arc<CleanupService>>,
    Query(params): Query<ExecutionParams>,
) -> Result<Json<ExecutionSnapshot>, ApiError> {
    let exec_type = parse_exec_type(&params.exec_type)?;
    service.open_dataset(&params.dataset_id)?;
    Ok(Json(
        service.start_execution(&params.dataset_id, exec_type).await?,
    ))
}

async fn get_execution_status(
    State(service): State<Arc<CleanupService>>,
    Query(params): Query<ExecutionParams>,
) -> Result<Json<ExecutionSnapshot>, ApiError> {
    let exec_type = parse_exec_type(&params.exec_type)?;
    service.open_dataset(&params.dataset_id)?;
    Ok(Json(service.execution_status(&params.dataset_id, exec_type)?))
}

async fn get_items(
    State(service): State<Arc<CleanupService>>,
    Query(params): Query<ItemsParams>,
) -> Result<Json<ItemsResponse>, ApiError> {
    service.open_dataset(&params.dataset_id)?;
    if params.kind != SIMILARITY_TYPE {
        let scores = service
            .quality_scores(&params.dataset_id, &params.kind, params.min_v, params.max_v)
            .await?;
        return Ok(Json(ItemsResponse::Scores(scores)));
    }

    let query = ClusterQuery {
        feature_set: &params.feature_set_name,
        params: ClusterParams {
            threshold: params.similarity,
            min_cluster_size: params.min_cluster_size,
            page_size: params.limit,
        },
        page: params.pagination,
    };
    let clusters = service.clusters(&params.dataset_id, query).await?;
    Ok(Json(ItemsResponse::Clusters(clusters)))
}

async fn get_quality_score_exist(
    State(service): State<Arc<CleanupService>>,
    Query(params): Query<DatasetParams>,
) -> Result<Json<usize>, ApiError> {
    service.open_dataset(&params.dataset_id)?;
    Ok(Json(service.quality_scores_exist(&params.dataset_id).await?))
}
