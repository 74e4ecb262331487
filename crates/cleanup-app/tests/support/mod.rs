#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use cleanup_app::services::{
    BlobError, BlobMeta, BlobStore, CommandStatus, DownloadedItem, ExecTarget, ExecutionProgress,
    ItemSummary, JobContext, MarkerStore, Platform, PlatformError, PollPolicy, RangeFilter,
};
use serde_json::json;

pub const FEATURE_SET_ID: &str = "fs-clip";
pub const FEATURE_SET_NAME: &str = "clip";

pub fn test_policy() -> PollPolicy {
    PollPolicy::new(
        Duration::from_secs(60),
        Duration::from_millis(10),
        Duration::from_millis(200),
    )
}

pub fn artifact_created_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 7, 1, 12, 30, 0).unwrap()
}

/// Export artifact with one vector per item in the `clip` feature set.
pub fn artifact_json(vectors: &[(&str, [f32; 2])]) -> Bytes {
    let items: Vec<_> = vectors
        .iter()
        .map(|(id, value)| {
            json!({
                "id": id,
                "name": format!("{id}.jpg"),
                "thumbnail": format!("https://thumbs.example/{id}"),
                "annotated": false,
                "itemVectors": [{ "featureSetId": FEATURE_SET_ID, "value": value }],
            })
        })
        .collect();
    Bytes::from(serde_json::to_vec(&items).unwrap())
}

/// Three items, two of them near-duplicates.
pub fn sample_artifact() -> Bytes {
    artifact_json(&[
        ("item-a", [1.0, 0.0]),
        ("item-b", [0.99, 0.05]),
        ("item-c", [0.0, 1.0]),
    ])
}

#[derive(Debug, Clone)]
pub struct Step {
    pub raw: &'static str,
    pub progress: u8,
    pub output: Option<&'static str>,
}

pub fn step(raw: &'static str, progress: u8) -> Step {
    Step {
        raw,
        progress,
        output: None,
    }
}

pub fn finished(output: &'static str) -> Step {
    Step {
        raw: "success",
        progress: 100,
        output: Some(output),
    }
}

/// Scripted stand-in for the dataset platform. Each command and execution
/// replays its steps in order and repeats the last one forever.
#[derive(Default)]
pub struct FakePlatform {
    commands: Mutex<HashMap<String, VecDeque<Step>>>,
    executions: Mutex<HashMap<String, VecDeque<Step>>>,
    items: Mutex<HashMap<String, Bytes>>,
    scored_items: Mutex<Vec<ItemSummary>>,
    installed: Mutex<bool>,
    fail_start_export: Mutex<bool>,
    fail_create_execution: Mutex<bool>,
    pub start_export_calls: AtomicUsize,
    pub command_status_calls: AtomicUsize,
    pub install_calls: AtomicUsize,
    pub create_execution_calls: AtomicUsize,
    pub query_filters: Mutex<Vec<(String, f64, f64)>>,
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_command(&self, command_id: &str, steps: Vec<Step>) {
        self.commands
            .lock()
            .unwrap()
            .insert(command_id.to_string(), steps.into());
    }

    pub fn script_execution(&self, execution_id: &str, steps: Vec<Step>) {
        self.executions
            .lock()
            .unwrap()
            .insert(execution_id.to_string(), steps.into());
    }

    pub fn put_item(&self, item_id: &str, bytes: Bytes) {
        self.items
            .lock()
            .unwrap()
            .insert(item_id.to_string(), bytes);
    }

    pub fn set_scored_items(&self, items: Vec<ItemSummary>) {
        *self.scored_items.lock().unwrap() = items;
    }

    pub fn set_installed(&self, installed: bool) {
        *self.installed.lock().unwrap() = installed;
    }

    pub fn fail_start_export(&self, fail: bool) {
        *self.fail_start_export.lock().unwrap() = fail;
    }

    pub fn fail_create_execution(&self, fail: bool) {
        *self.fail_create_execution.lock().unwrap() = fail;
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn next_step(scripts: &Mutex<HashMap<String, VecDeque<Step>>>, id: &str) -> Step {
        let mut scripts = scripts.lock().unwrap();
        let Some(steps) = scripts.get_mut(id) else {
            return step("in-progress", 0);
        };
        if steps.len() > 1 {
            steps.pop_front().unwrap()
        } else {
            steps.front().cloned().unwrap_or_else(|| step("in-progress", 0))
        }
    }

    fn server_error(stage: &'static str) -> PlatformError {
        PlatformError::UnexpectedStatus {
            stage,
            status: 500,
            body: "injected failure".to_string(),
        }
    }
}

#[async_trait]
impl Platform for FakePlatform {
    async fn start_export(&self, _dataset_id: &str) -> Result<String, PlatformError> {
        if *self.fail_start_export.lock().unwrap() {
            return Err(Self::server_error("start_export"));
        }
        let n = self.start_export_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("cmd-{n}"))
    }

    async fn command_status(&self, command_id: &str) -> Result<CommandStatus, PlatformError> {
        self.command_status_calls.fetch_add(1, Ordering::SeqCst);
        let step = Self::next_step(&self.commands, command_id);
        Ok(CommandStatus::from_raw(
            command_id,
            step.raw,
            step.progress,
            step.output.map(str::to_string),
        )?)
    }

    async fn download_item(&self, item_id: &str) -> Result<DownloadedItem, PlatformError> {
        let bytes = self
            .items
            .lock()
            .unwrap()
            .get(item_id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound {
                kind: "item",
                id: item_id.to_string(),
            })?;
        Ok(DownloadedItem {
            bytes,
            created_at: artifact_created_at(),
        })
    }

    async fn feature_set_names(
        &self,
        _dataset_id: &str,
    ) -> Result<HashMap<String, String>, PlatformError> {
        Ok(HashMap::from([(
            FEATURE_SET_ID.to_string(),
            FEATURE_SET_NAME.to_string(),
        )]))
    }

    async fn app_installed(&self, _dataset_id: &str, _dpk_name: &str) -> Result<bool, PlatformError> {
        Ok(*self.installed.lock().unwrap())
    }

    async fn install_app(&self, _dataset_id: &str, _dpk_name: &str) -> Result<(), PlatformError> {
        self.install_calls.fetch_add(1, Ordering::SeqCst);
        *self.installed.lock().unwrap() = true;
        Ok(())
    }

    async fn create_execution(
        &self,
        _dataset_id: &str,
        _target: &ExecTarget,
    ) -> Result<String, PlatformError> {
        if *self.fail_create_execution.lock().unwrap() {
            return Err(Self::server_error("create_execution"));
        }
        let n = self.create_execution_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("exec-{n}"))
    }

    async fn execution_status(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionProgress, PlatformError> {
        let step = Self::next_step(&self.executions, execution_id);
        Ok(ExecutionProgress::from_raw(
            execution_id,
            step.raw,
            step.progress,
        )?)
    }

    async fn query_items(
        &self,
        _dataset_id: &str,
        filter: RangeFilter<'_>,
    ) -> Result<Vec<ItemSummary>, PlatformError> {
        self.query_filters
            .lock()
            .unwrap()
            .push((filter.field.to_string(), filter.min, filter.max));
        Ok(self.scored_items.lock().unwrap().clone())
    }
}

/// Blob store kept in memory; creation time is the insertion order.
#[derive(Default)]
pub struct InMemBlobStore {
    blobs: Mutex<BTreeMap<String, (Bytes, i64)>>,
    clock: AtomicUsize,
}

impl InMemBlobStore {
    pub fn keys(&self) -> Vec<String> {
        self.blobs.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl BlobStore for InMemBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), BlobError> {
        cleanup_app::services::validate_key(key)?;
        let at = self.clock.fetch_add(1, Ordering::SeqCst) as i64;
        self.blobs
            .lock()
            .unwrap()
            .insert(key.to_string(), (data, at));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, BlobError> {
        Ok(self
            .blobs
            .lock()
            .unwrap()
            .get(key)
            .map(|(data, _)| data.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool, BlobError> {
        Ok(self.blobs.lock().unwrap().remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>, BlobError> {
        let dir = format!("{}/", prefix.trim_end_matches('/'));
        Ok(self
            .blobs
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| {
                key.strip_prefix(&dir)
                    .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
            })
            .map(|(key, (data, at))| BlobMeta {
                key: key.clone(),
                size_bytes: data.len() as u64,
                created_at_ms: *at,
            })
            .collect())
    }
}

pub struct Harness {
    pub platform: Arc<FakePlatform>,
    pub blobs: Arc<InMemBlobStore>,
    pub ctx: JobContext,
}

impl Harness {
    pub fn new() -> Self {
        let platform = FakePlatform::new();
        let blobs = Arc::new(InMemBlobStore::default());
        let ctx = JobContext::builder()
            .platform(platform.clone() as Arc<dyn Platform>)
            .markers(MarkerStore::new(blobs.clone() as Arc<dyn BlobStore>))
            .export_policy(test_policy())
            .execution_policy(test_policy())
            .build();
        Self {
            platform,
            blobs,
            ctx,
        }
    }

    pub fn markers(&self) -> &MarkerStore {
        &self.ctx.markers
    }
}
