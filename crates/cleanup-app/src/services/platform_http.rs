use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, Url, header};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::services::platform::{
    CommandStatus, DownloadedItem, ExecutionProgress, ItemSummary, Platform, PlatformError,
    RangeFilter,
};
use crate::services::status::ExecTarget;

const USER_AGENT: &str = concat!("cleanup-app/", env!("CARGO_PKG_VERSION"));
const QUERY_PAGE_SIZE: u32 = 1000;
/// Page ceiling for queries whose response carries no item count.
const MAX_QUERY_PAGES: u32 = 1000;
const ERROR_BODY_LIMIT: usize = 512;

/// Platform REST gateway client.
#[derive(Debug, Clone)]
pub struct HttpPlatform {
    base_url: Url,
    http: Client,
    token: Option<String>,
    backoff: ExponentialBuilder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempts {
    /// Non-idempotent calls are sent exactly once.
    Once,
    /// Reads are retried on transport errors, 429 and 5xx.
    Transient,
}

#[derive(Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Deserialize)]
struct CommandResponse {
    id: String,
    status: String,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    spec: Option<CommandSpec>,
}

#[derive(Deserialize)]
struct CommandSpec {
    #[serde(rename = "outputItemId", default)]
    output_item_id: Option<String>,
}

#[derive(Deserialize)]
struct ItemResponse {
    #[serde(rename = "createdAt")]
    created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct DatasetResponse {
    #[serde(default)]
    projects: Vec<String>,
}

#[derive(Deserialize)]
struct Paged<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    #[serde(rename = "totalItemsCount", default)]
    total_items_count: u64,
    #[serde(rename = "hasNextPage", default)]
    has_next_page: bool,
}

#[derive(Deserialize)]
struct NamedEntity {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct ExecutionResponse {
    id: String,
    #[serde(rename = "latestStatus")]
    latest_status: LatestStatus,
}

#[derive(Deserialize)]
struct LatestStatus {
    status: String,
    #[serde(rename = "percentComplete", default)]
    percent_complete: Option<f64>,
}

#[derive(Deserialize)]
struct ItemResource {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    annotated: Option<bool>,
}

impl HttpPlatform {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, PlatformError> {
        let mut parsed =
            Url::parse(base_url).map_err(|_| PlatformError::InvalidBaseUrl(base_url.to_string()))?;
        if parsed.cannot_be_a_base() {
            return Err(PlatformError::InvalidBaseUrl(base_url.to_string()));
        }
        // Relative joins must extend the base path rather than replace its last segment.
        if !parsed.path().ends_with('/') {
            let path = format!("{}/", parsed.path());
            parsed.set_path(&path);
        }

        let http = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| PlatformError::transport("build_client", err))?;

        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(4)
            .with_jitter();

        Ok(Self {
            base_url: parsed,
            http,
            token: token.filter(|t| !t.is_empty()),
            backoff,
        })
    }

    fn url(&self, path: &str) -> Result<Url, PlatformError> {
        self.base_url
            .join(path)
            .map_err(|_| PlatformError::InvalidBaseUrl(format!("{}{path}", self.base_url)))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self
            .http
            .request(method, url)
            .header(header::ACCEPT, "application/json");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn call_json<T: DeserializeOwned>(
        &self,
        stage: &'static str,
        method: Method,
        url: Url,
        body: Option<&Value>,
        attempts: Attempts,
    ) -> Result<T, PlatformError> {
        let attempt = || {
            let mut request = self.request(method.clone(), url.clone());
            if let Some(body) = body {
                request = request.json(body);
            }
            async move {
                let response = send(stage, request).await?;
                let payload = response
                    .bytes()
                    .await
                    .map_err(|err| PlatformError::transport(stage, err))?;
                serde_json::from_slice::<T>(&payload)
                    .map_err(|err| PlatformError::decode(stage, err.to_string()))
            }
        };

        match attempts {
            Attempts::Once => attempt().await,
            Attempts::Transient => {
                attempt
                    .retry(self.backoff)
                    .sleep(sleep)
                    .when(PlatformError::is_retryable)
                    .notify(|err: &PlatformError, delay: Duration| {
                        warn!(
                            stage,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "retrying platform request"
                        );
                    })
                    .await
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        stage: &'static str,
        url: Url,
    ) -> Result<T, PlatformError> {
        self.call_json(stage, Method::GET, url, None, Attempts::Transient)
            .await
    }

    async fn project_id(&self, dataset_id: &str) -> Result<String, PlatformError> {
        let url = self.url(&format!("datasets/{dataset_id}"))?;
        let dataset: DatasetResponse = self.get_json("get_dataset", url).await?;
        dataset
            .projects
            .into_iter()
            .next()
            .ok_or_else(|| PlatformError::NotFound {
                kind: "project of dataset",
                id: dataset_id.to_string(),
            })
    }

    async fn service_id(&self, project_id: &str, service_name: &str) -> Result<String, PlatformError> {
        let mut url = self.url("services")?;
        url.query_pairs_mut()
            .append_pair("projectId", project_id)
            .append_pair("name", service_name);
        let services: Paged<NamedEntity> = self.get_json("list_services", url).await?;
        services
            .items
            .into_iter()
            .find(|service| service.name.is_empty() || service.name == service_name)
            .map(|service| service.id)
            .ok_or_else(|| PlatformError::NotFound {
                kind: "service",
                id: service_name.to_string(),
            })
    }
}

async fn send(stage: &'static str, request: RequestBuilder) -> Result<Response, PlatformError> {
    let response = request
        .send()
        .await
        .map_err(|err| PlatformError::transport(stage, err))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > ERROR_BODY_LIMIT {
        let cut = (0..=ERROR_BODY_LIMIT)
            .rev()
            .find(|idx| body.is_char_boundary(*idx))
            .unwrap_or(0);
        body.truncate(cut);
    }
    Err(PlatformError::UnexpectedStatus {
        stage,
        status: status.as_u16(),
        body,
    })
}

fn percent(value: Option<f64>) -> u8 {
    let value = value.unwrap_or(0.0);
    if value.is_finite() {
        value.clamp(0.0, 100.0).round() as u8
    } else {
        0
    }
}

#[async_trait]
impl Platform for HttpPlatform {
    async fn start_export(&self, dataset_id: &str) -> Result<String, PlatformError> {
        let url = self.url(&format!("datasets/{dataset_id}/export"))?;
        let payload = json!({
            "itemsQuery": { "filter": { "hidden": false, "type": "file" } },
            "includeItemVectors": true,
            "includeAnnotations": false,
            "exportVersion": "V2",
        });
        let created: IdResponse = self
            .call_json("start_export", Method::POST, url, Some(&payload), Attempts::Once)
            .await?;
        debug!(dataset_id, command_id = %created.id, "export command created");
        Ok(created.id)
    }

    async fn command_status(&self, command_id: &str) -> Result<CommandStatus, PlatformError> {
        let url = self.url(&format!("commands/{command_id}"))?;
        let command: CommandResponse = self.get_json("command_status", url).await?;
        let output = command.spec.and_then(|spec| spec.output_item_id);
        Ok(CommandStatus::from_raw(
            command.id,
            command.status,
            percent(command.progress),
            output,
        )?)
    }

    async fn download_item(&self, item_id: &str) -> Result<DownloadedItem, PlatformError> {
        let meta_url = self.url(&format!("items/{item_id}"))?;
        let meta: ItemResponse = match self.get_json("get_item", meta_url).await {
            Err(PlatformError::UnexpectedStatus { status: 404, .. }) => {
                return Err(PlatformError::NotFound {
                    kind: "item",
                    id: item_id.to_string(),
                });
            }
            other => other?,
        };

        let stage = "download_item";
        let stream_url = self.url(&format!("items/{item_id}/stream"))?;
        let attempt = || {
            let request = self.request(Method::GET, stream_url.clone());
            async move {
                let response = send(stage, request).await?;
                response
                    .bytes()
                    .await
                    .map_err(|err| PlatformError::transport(stage, err))
            }
        };
        let bytes: Bytes = attempt
            .retry(self.backoff)
            .sleep(sleep)
            .when(PlatformError::is_retryable)
            .notify(|err: &PlatformError, delay: Duration| {
                warn!(
                    stage,
                    item_id,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying item download"
                );
            })
            .await?;

        debug!(item_id, size = bytes.len(), "item downloaded");
        Ok(DownloadedItem {
            bytes,
            created_at: meta.created_at,
        })
    }

    async fn feature_set_names(
        &self,
        dataset_id: &str,
    ) -> Result<HashMap<String, String>, PlatformError> {
        let project_id = self.project_id(dataset_id).await?;
        let mut url = self.url("features/sets")?;
        url.query_pairs_mut().append_pair("projectId", &project_id);
        let sets: Paged<NamedEntity> = self.get_json("list_feature_sets", url).await?;
        Ok(sets
            .items
            .into_iter()
            .map(|set| (set.id, set.name))
            .collect())
    }

    async fn app_installed(&self, dataset_id: &str, dpk_name: &str) -> Result<bool, PlatformError> {
        let project_id = self.project_id(dataset_id).await?;
        let mut url = self.url("apps")?;
        url.query_pairs_mut()
            .append_pair("projectId", &project_id)
            .append_pair("dpkName", dpk_name);
        let apps: Paged<Value> = self.get_json("list_apps", url).await?;
        Ok(apps.total_items_count > 0 || !apps.items.is_empty())
    }

    async fn install_app(&self, dataset_id: &str, dpk_name: &str) -> Result<(), PlatformError> {
        let project_id = self.project_id(dataset_id).await?;
        let url = self.url("apps")?;
        let payload = json!({ "projectId": project_id, "dpkName": dpk_name });
        let installed: IdResponse = self
            .call_json("install_app", Method::POST, url, Some(&payload), Attempts::Once)
            .await?;
        debug!(dataset_id, dpk_name, app_id = %installed.id, "app installed");
        Ok(())
    }

    async fn create_execution(
        &self,
        dataset_id: &str,
        target: &ExecTarget,
    ) -> Result<String, PlatformError> {
        let project_id = self.project_id(dataset_id).await?;
        let service_id = self.service_id(&project_id, target.service_name).await?;
        let url = self.url(&format!("executions/{service_id}"))?;
        let payload = json!({
            "projectId": project_id,
            "functionName": target.function_name,
            "input": { "dataset": { "dataset_id": dataset_id }, "query": null },
        });
        let created: IdResponse = self
            .call_json("create_execution", Method::POST, url, Some(&payload), Attempts::Once)
            .await?;
        Ok(created.id)
    }

    async fn execution_status(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionProgress, PlatformError> {
        let url = self.url(&format!("executions/{execution_id}"))?;
        let execution: ExecutionResponse = self.get_json("execution_status", url).await?;
        Ok(ExecutionProgress::from_raw(
            execution.id,
            execution.latest_status.status,
            percent(execution.latest_status.percent_complete),
        )?)
    }

    async fn query_items(
        &self,
        dataset_id: &str,
        filter: RangeFilter<'_>,
    ) -> Result<Vec<ItemSummary>, PlatformError> {
        let url = self.url(&format!("datasets/{dataset_id}/query"))?;
        let mut items = Vec::new();
        let mut page: u32 = 0;
        let mut page_limit = MAX_QUERY_PAGES;
        loop {
            let payload = json!({
                "resource": "items",
                "filter": { "$and": [
                    { filter.field: { "$gt": filter.min } },
                    { filter.field: { "$lt": filter.max } },
                ] },
                "page": page,
                "pageSize": QUERY_PAGE_SIZE,
            });
            // Queries are reads, so they are safe to retry.
            let batch: Paged<ItemResource> = self
                .call_json("query_items", Method::POST, url.clone(), Some(&payload), Attempts::Transient)
                .await?;
            if batch.total_items_count > 0 {
                let pages = batch.total_items_count / u64::from(QUERY_PAGE_SIZE) + 1;
                page_limit = page_limit.min(u32::try_from(pages).unwrap_or(u32::MAX));
            }
            let exhausted = batch.items.is_empty() || !batch.has_next_page;
            items.extend(batch.items.into_iter().map(|item| ItemSummary {
                item_id: item.id,
                name: item.name,
                thumbnail: item.thumbnail.unwrap_or_default(),
                annotated: item.annotated.unwrap_or(false),
            }));
            if exhausted {
                break;
            }
            page += 1;
            if page >= page_limit {
                warn!(dataset_id, page, page_limit, "query still reports more pages, stopping");
                break;
            }
        }
        debug!(dataset_id, field = filter.field, count = items.len(), "items queried");
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_keeps_its_path_prefix() {
        let platform =
            HttpPlatform::new("https://gate.example.com/api/v1", None, Duration::from_secs(5))
                .unwrap();
        assert_eq!(
            platform.url("commands/abc").unwrap().as_str(),
            "https://gate.example.com/api/v1/commands/abc"
        );
    }

    #[test]
    fn rejects_unusable_base_urls() {
        assert!(matches!(
            HttpPlatform::new("not a url", None, Duration::from_secs(5)),
            Err(PlatformError::InvalidBaseUrl(_))
        ));
        assert!(matches!(
            HttpPlatform::new("mailto:ops@example.com", None, Duration::from_secs(5)),
            Err(PlatformError::InvalidBaseUrl(_))
        ));
    }

    #[test]
    fn percent_is_clamped() {
        assert_eq!(percent(None), 0);
        assert_eq!(percent(Some(42.4)), 42);
        assert_eq!(percent(Some(250.0)), 100);
        assert_eq!(percent(Some(f64::NAN)), 0);
    }
}
