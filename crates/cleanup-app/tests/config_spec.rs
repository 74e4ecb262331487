use std::{
    env,
    ffi::{OsStr, OsString},
    fs,
    sync::{Mutex, OnceLock},
    time::Duration,
};

use cleanup_app::config::{self, AppConfigError, DEFAULT_LISTEN_ADDR};
use tempfile::TempDir;

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn env_guard() -> std::sync::MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

const TRACKED: [&str; 5] = [
    "HOME",
    "XDG_DATA_HOME",
    "CLEANUP__SERVER__LISTEN_ADDR",
    "CLEANUP__POLLING__MAX_SLEEP_SECS",
    "CLEANUP__PLATFORM__BASE_URL",
];

fn snapshot_env() -> Vec<(&'static str, Option<OsString>)> {
    TRACKED.iter().map(|&name| (name, env::var_os(name))).collect()
}

fn restore_env(vars: Vec<(&'static str, Option<OsString>)>) {
    for (name, value) in vars {
        match value {
            Some(val) => set_var(name, val),
            None => remove_var(name),
        }
    }
}

fn set_var(name: &str, value: impl AsRef<OsStr>) {
    unsafe { env::set_var(name, value) }
}

fn remove_var(name: &str) {
    unsafe { env::remove_var(name) }
}

fn isolated_home(workspace: &TempDir) {
    set_var("HOME", workspace.path());
    set_var("XDG_DATA_HOME", workspace.path().join("data"));
    for name in &TRACKED[2..] {
        remove_var(name);
    }
}

#[test]
fn defaults_apply_without_a_settings_file() {
    let _guard = env_guard();
    let saved = snapshot_env();
    let workspace = TempDir::new().expect("temp workspace");
    isolated_home(&workspace);

    let cfg = config::load_from(&workspace.path().join("missing")).expect("load defaults");

    assert_eq!(cfg.server.listen_addr, DEFAULT_LISTEN_ADDR);
    assert!(cfg.server.cors_allow_any);
    assert!(cfg.storage.path.ends_with("markers"));
    assert_eq!(cfg.platform.request_timeout(), Duration::from_secs(30));
    assert_eq!(cfg.polling.export_policy().timeout, Duration::from_secs(2 * 60 * 60));
    assert_eq!(cfg.clustering.max_neighbors, 200);
    assert_eq!(cfg.clustering.max_indexed_items, 20_000);
    assert!(cfg.platform.token.is_none());

    restore_env(saved);
}

#[test]
fn environment_overrides_the_settings_file() {
    let _guard = env_guard();
    let saved = snapshot_env();
    let workspace = TempDir::new().expect("temp workspace");
    isolated_home(&workspace);

    let settings = workspace.path().join("settings.toml");
    fs::write(
        &settings,
        "[server]\nlisten_addr = \"127.0.0.1:9001\"\n\n[polling]\nmax_sleep_secs = 4\n",
    )
    .expect("write settings");

    let from_file = config::load_from(&settings).expect("load file");
    assert_eq!(from_file.server.listen_addr, "127.0.0.1:9001");
    assert_eq!(from_file.polling.max_sleep_secs, 4);

    set_var("CLEANUP__SERVER__LISTEN_ADDR", "127.0.0.1:9002");
    set_var("CLEANUP__POLLING__MAX_SLEEP_SECS", "7");
    let from_env = config::load_from(&settings).expect("load env");
    assert_eq!(from_env.server.listen_addr, "127.0.0.1:9002");
    assert_eq!(from_env.polling.max_sleep_secs, 7);
    assert_eq!(
        from_env.polling.execution_policy().max_sleep,
        Duration::from_secs(7)
    );

    restore_env(saved);
}

#[test]
fn invalid_values_are_rejected() {
    let _guard = env_guard();
    let saved = snapshot_env();
    let workspace = TempDir::new().expect("temp workspace");
    isolated_home(&workspace);

    let settings = workspace.path().join("settings.toml");
    fs::write(&settings, "[clustering]\nmax_neighbors = 0\n").expect("write settings");
    let err = config::load_from(&settings).unwrap_err();
    assert!(matches!(err, AppConfigError::Invalid(msg) if msg.contains("max_neighbors")));

    fs::write(&settings, "").expect("truncate settings");
    set_var("CLEANUP__PLATFORM__BASE_URL", "not a url");
    let err = config::load_from(&settings).unwrap_err();
    assert!(matches!(err, AppConfigError::Invalid(msg) if msg.contains("base_url")));

    restore_env(saved);
}
