mod common;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lazy_static::lazy_static;
use safety_hub::{
    HubConfig, HubError, InMemoryTopology, RefreshReason, SafetyHub, SourceId, SourceKind, UserId,
    CONFIG_PATH_ENV, REFRESH_TIMEOUT_ENV,
};
use tempfile::TempDir;

use common::RecordingDispatcher;

lazy_static! {
    static ref TEST_ENV_GUARD: Mutex<()> = Mutex::new(());
}

const TEST_CONFIG_JSON: &str = r#"{
    "enabled": true,
    "refresh_timeout_ms": 2500,
    "groups": [
        {
            "id": "device",
            "title": "Device security",
            "sources": [
                {
                    "id": "lockscreen",
                    "kind": {
                        "type": "dynamic",
                        "target": { "package": "com.example.settings", "receiver": ".LockScreenRefresh" },
                        "refresh_on_page_open": true
                    }
                },
                { "id": "updates", "kind": { "type": "static" } }
            ]
        },
        {
            "id": "apps",
            "sources": [
                {
                    "id": "scanner",
                    "kind": {
                        "type": "dynamic",
                        "target": { "package": "com.example.scanner", "receiver": ".ScanRefresh" }
                    }
                }
            ]
        }
    ]
}"#;

struct ConfigTestEnv {
    dir: TempDir,
    prev_config: Option<String>,
    prev_timeout: Option<String>,
}

impl ConfigTestEnv {
    fn new() -> Self {
        let dir = TempDir::new().expect("temp config dir");
        let prev_config = std::env::var(CONFIG_PATH_ENV).ok();
        let prev_timeout = std::env::var(REFRESH_TIMEOUT_ENV).ok();
        std::env::remove_var(CONFIG_PATH_ENV);
        std::env::remove_var(REFRESH_TIMEOUT_ENV);
        ConfigTestEnv {
            dir,
            prev_config,
            prev_timeout,
        }
    }

    fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, contents).expect("write config");
        path
    }

    fn point_at(&self, path: &Path) {
        std::env::set_var(CONFIG_PATH_ENV, path);
    }
}

impl Drop for ConfigTestEnv {
    fn drop(&mut self) {
        if let Some(prev) = self.prev_config.take() {
            std::env::set_var(CONFIG_PATH_ENV, prev);
        } else {
            std::env::remove_var(CONFIG_PATH_ENV);
        }

        if let Some(prev) = self.prev_timeout.take() {
            std::env::set_var(REFRESH_TIMEOUT_ENV, prev);
        } else {
            std::env::remove_var(REFRESH_TIMEOUT_ENV);
        }
    }
}

fn acquire_env_guard() -> std::sync::MutexGuard<'static, ()> {
    TEST_ENV_GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[test]
fn load_from_path_reads_groups_in_order() {
    let _guard = acquire_env_guard();
    let env = ConfigTestEnv::new();
    let path = env.write("hub.json", TEST_CONFIG_JSON);

    let config = HubConfig::load_from_path(&path).expect("config should load");
    assert!(config.enabled);
    assert_eq!(config.refresh_timeout(), Duration::from_millis(2500));
    let ids: Vec<_> = config
        .groups
        .iter()
        .flat_map(|group| group.sources.iter().map(|source| source.id.as_str().to_string()))
        .collect();
    assert_eq!(ids, ["lockscreen", "updates", "scanner"]);
    assert_eq!(config.groups[0].title.as_deref(), Some("Device security"));
    assert_eq!(config.groups[1].title, None);
    assert!(matches!(
        config.groups[1].sources[0].kind,
        SourceKind::Dynamic {
            refresh_on_page_open: false,
            ..
        }
    ));
}

#[test]
fn missing_fields_fall_back_to_defaults() {
    let _guard = acquire_env_guard();
    let env = ConfigTestEnv::new();
    let path = env.write("empty.json", "{}");

    let config = HubConfig::load_from_path(&path).expect("config should load");
    assert_eq!(config, HubConfig::default());
    assert_eq!(config.refresh_timeout(), Duration::from_secs(10));
}

#[test]
fn malformed_and_missing_files_are_reported() {
    let _guard = acquire_env_guard();
    let env = ConfigTestEnv::new();
    let broken = env.write("broken.json", "{ \"groups\": [");
    match HubConfig::load_from_path(&broken) {
        Err(HubError::Config { path, .. }) => assert_eq!(path, broken),
        other => panic!("expected a config error, got {:?}", other),
    }

    let missing = env.dir.path().join("nope.json");
    assert!(matches!(
        HubConfig::load_from_path(&missing),
        Err(HubError::Io { .. })
    ));
}

#[test]
fn duplicate_source_ids_are_rejected_at_load() {
    let _guard = acquire_env_guard();
    let env = ConfigTestEnv::new();
    let path = env.write(
        "dupes.json",
        r#"{ "groups": [
            { "id": "one", "sources": [ { "id": "x", "kind": { "type": "static" } } ] },
            { "id": "two", "sources": [ { "id": "x", "kind": { "type": "static" } } ] }
        ] }"#,
    );
    match HubConfig::load_from_path(&path) {
        Err(HubError::DuplicateSource(id)) => assert_eq!(id, SourceId::new("x")),
        other => panic!("expected a duplicate source error, got {:?}", other),
    }
}

#[test]
fn from_env_uses_configured_path_and_timeout_override() {
    let _guard = acquire_env_guard();
    let env = ConfigTestEnv::new();

    let defaults = HubConfig::from_env().expect("defaults");
    assert_eq!(defaults, HubConfig::default());

    let path = env.write("hub.json", TEST_CONFIG_JSON);
    env.point_at(&path);
    std::env::set_var(REFRESH_TIMEOUT_ENV, "750");
    let config = HubConfig::from_env().expect("config from env");
    assert_eq!(config.groups.len(), 2);
    assert_eq!(config.refresh_timeout_ms, 750);

    std::env::set_var(REFRESH_TIMEOUT_ENV, "soon");
    let config = HubConfig::from_env().expect("bad override is ignored");
    assert_eq!(config.refresh_timeout_ms, 2500);
}

#[tokio::test]
async fn hub_built_from_loaded_config_refreshes_configured_sources() {
    let _guard = acquire_env_guard();
    let env = ConfigTestEnv::new();
    let path = env.write("hub.json", TEST_CONFIG_JSON);
    let config = HubConfig::load_from_path(&path).expect("config should load");

    let topology = Arc::new(InMemoryTopology::new());
    topology.add_user(UserId(0));
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let hub = SafetyHub::from_config(&config, topology, dispatcher.clone()).expect("hub");

    let ticket = hub
        .request_refresh(RefreshReason::PageOpen, UserId(0))
        .await
        .expect("refresh");
    assert_eq!(ticket.expected, 1);
    let sent = dispatcher.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].source_id, Some(SourceId::new("lockscreen")));
    assert_eq!(sent[0].target.receiver, ".LockScreenRefresh");

    let view = hub.get_aggregate(UserId(0)).expect("aggregate");
    assert_eq!(view.groups.len(), 2);
    assert_eq!(view.groups[0].title.as_deref(), Some("Device security"));
    assert!(view.is_all_unknown());
}
