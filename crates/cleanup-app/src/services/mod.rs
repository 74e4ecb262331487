//! Orchestration layer for IO-bound services.
//!
//! Modules here coordinate the blob store and the remote platform. Pure
//! transforms (clustering, neighbour search) live in `crate::clustering` so
//! the job state machines stay free of CPU-heavy code.

pub mod blob_store;
pub mod cleanup;
pub mod context;
pub mod executions;
pub mod export;
pub mod features;
pub mod markers;
pub mod platform;
pub mod platform_http;
pub mod poller;
pub mod registry;
pub mod status;

pub use blob_store::{BlobError, BlobMeta, BlobStore, DurableWrite, FsBlobStore, validate_key};
pub use cleanup::{
    CleanupService, ClusterQuery, DEFAULT_MAX_INDEXED_ITEMS, DEFAULT_MAX_NEIGHBORS, QualityScores,
};
pub use context::{JobContext, JobError};
pub use executions::{ExecutionSnapshot, ExecutionSupervisor};
pub use export::{
    ExportOrchestrator, ExportSnapshot, ExportStatusView, StartOutcome, parse_timezone,
};
pub use features::{ArtifactError, ExportArtifact, FeatureRecord, FeatureSetExport, LoadedFeatures};
pub use markers::{MarkerError, MarkerStore};
pub use platform::{
    CommandStatus, DownloadedItem, ExecutionProgress, ItemSummary, Platform, PlatformError,
    RangeFilter,
};
pub use platform_http::HttpPlatform;
pub use poller::{PollError, PollPolicy, RemoteProgress, poll};
pub use registry::{DatasetRegistry, DatasetSession};
pub use status::{ExecStatus, ExecTarget, ExecType, ExportStatus, QualityScoreType, RemoteState};
