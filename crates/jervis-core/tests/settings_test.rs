use std::fs;
use std::path::PathBuf;

use jervis_core::config::Config;
use jervis_core::settings::SettingsManager;

fn tmp_settings_path() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("jervis-settings-it-{}", uuid::Uuid::new_v4()));
    dir.join("config.toml")
}

fn cleanup(path: &PathBuf) {
    if let Some(parent) = path.parent() {
        let _ = fs::remove_dir_all(parent);
    }
}

#[test]
fn default_path_uses_config_default_path() {
    let mgr = SettingsManager::default_path();
    assert_eq!(mgr.path(), &Config::default_path());
}

#[test]
fn repeated_save_load_cycles_are_stable() {
    let path = tmp_settings_path();
    let mgr = SettingsManager::new(&path);

    let mut cfg = Config::default();
    for i in 0..5 {
        cfg.qualifier.model = Some(format!("model-{}", i));
        mgr.save(&cfg).unwrap();
        let loaded = mgr.load().unwrap();
        assert_eq!(loaded.qualifier.model, Some(format!("model-{}", i)));
    }

    cleanup(&path);
}

#[test]
fn two_managers_on_same_path_see_each_others_writes() {
    let path = tmp_settings_path();
    let writer = SettingsManager::new(&path);
    let reader = SettingsManager::new(&path);

    let mut cfg = Config::default();
    cfg.general.project_name = "shared".into();
    writer.save(&cfg).unwrap();

    let loaded = reader.load().unwrap();
    assert_eq!(loaded.general.project_name, "shared");

    cleanup(&path);
}

#[test]
fn malformed_toml_surfaces_parse_error() {
    let path = tmp_settings_path();
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, "this is not valid = = toml").unwrap();

    let mgr = SettingsManager::new(&path);
    let err = mgr.load().expect_err("malformed toml must fail");
    assert!(matches!(err, jervis_core::config::ConfigError::Parse(_)));

    cleanup(&path);
}
