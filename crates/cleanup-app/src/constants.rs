//! Cross-cutting application constants.

use chrono_tz::Tz;

/// Blob-store directory holding the in-flight export pointer per dataset.
pub const ACTIVE_EXPORT_DIR: &str = "fv_json";

/// File name of the in-flight export pointer.
pub const ACTIVE_EXPORT_FILE: &str = "active_export.json";

/// Blob-store directory holding finished export pointers per dataset.
pub const FINISHED_EXPORT_DIR: &str = "fv_done_json";

/// Upper bound of the export progress reported while the platform command runs.
pub const POLL_PHASE_MAX_PROGRESS: u8 = 50;

/// Progress reported once every exported item has been grouped.
pub const LOAD_PHASE_MAX_PROGRESS: u8 = 95;

/// Timezone used when the caller does not supply one.
pub const DEFAULT_TIMEZONE: Tz = Tz::UTC;

/// Rendering of the export artifact timestamp.
pub const LAST_UPDATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S %Z";
