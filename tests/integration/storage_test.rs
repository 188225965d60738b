//! Storage Integration Tests
//!
//! Config file lifecycle, the settings store and the first-run marker in a
//! temporary directory.

use query_gis_desktop::storage::API_KEY_SETTING;
use query_gis_desktop::{ConfigService, FirstRunMarker, SettingsStore, SettingsUpdate};

#[test]
fn test_config_created_updated_and_reloaded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");

    let mut service = ConfigService::open(&path).unwrap();
    assert!(path.exists());
    assert!(service.get_config().auto_run);

    service
        .update_config(SettingsUpdate {
            auto_run: Some(false),
            context_char_budget: Some(4000),
            ..Default::default()
        })
        .unwrap();

    let reopened = ConfigService::open(&path).unwrap();
    assert!(!reopened.get_config().auto_run);
    assert_eq!(reopened.get_config().context_char_budget, 4000);
}

#[test]
fn test_invalid_update_is_rejected_and_not_saved() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    let mut service = ConfigService::open(&path).unwrap();

    let result = service.update_config(SettingsUpdate {
        chat_endpoint: Some("not a url".into()),
        ..Default::default()
    });
    assert!(result.is_err());

    let reopened = ConfigService::open(&path).unwrap();
    assert_eq!(reopened.get_config().chat_endpoint, service.get_config().chat_endpoint);
    assert!(reopened.get_config().chat_endpoint.starts_with("https://"));
}

#[test]
fn test_settings_store_and_marker_share_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    let store = SettingsStore::open(dir.path().join("settings.json")).unwrap();
    let marker = FirstRunMarker::at(dir.path().join(".setup_complete"));

    assert!(!marker.is_complete());
    store.set_api_key("abc").unwrap();
    marker.mark_complete().unwrap();

    let raw = std::fs::read_to_string(dir.path().join("settings.json")).unwrap();
    let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(json[API_KEY_SETTING], "YWJj");
    assert!(marker.is_complete());
}
