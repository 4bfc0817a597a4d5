//! Integration tests for hostguard-core.

use std::path::PathBuf;

use hostguard_core::{
    ApiVersion, CURRENT_API_VERSION, DEFAULT_MAX_PLUGINS, HandleTable, PluginConfig, PluginError,
    PluginErrorType, PluginFault, PluginInfo, PluginState, RegistryFile,
};
use strum::IntoEnumIterator;

#[test]
fn test_every_state_can_reach_unloaded() {
    // Prefer the happy path; fall back to Error only when nothing else is allowed.
    for start in PluginState::iter() {
        let mut state = start;
        let mut steps = 0;
        while state != PluginState::Unloaded {
            state = PluginState::iter()
                .filter(|&next| state.can_transition_to(next))
                .min_by_key(|&next| next == PluginState::Error)
                .unwrap_or_else(|| panic!("{state} is a dead end"));
            steps += 1;
            assert!(steps < 16, "no way out of {start}");
        }
    }
}

#[test]
fn test_errors_become_faults() {
    let errors = [
        PluginError::NotFound {
            path: PathBuf::from("/plugins/viewer.so"),
        },
        PluginError::DependencyMissing {
            name: "viewer".into(),
            missing: vec!["core".into(), "storage".into()],
        },
        PluginError::SecurityViolation {
            name: "viewer".into(),
            message: "module is not signed".into(),
        },
    ];
    let faults: Vec<PluginFault> = errors.iter().map(PluginFault::from).collect();

    assert_eq!(faults[0].kind, PluginErrorType::LoadFailed);
    assert!(faults[0].details.contains("viewer.so"));
    assert_eq!(faults[1].kind, PluginErrorType::DependencyMissing);
    assert!(faults[1].details.contains("core, storage"));
    assert_eq!(faults[2].kind, PluginErrorType::SecurityViolation);
    assert_eq!(faults[2].message, "SecurityViolation");
}

#[test]
fn test_handle_table_churn() {
    let mut table = HandleTable::new();
    let mut live = Vec::new();
    for round in 0..10 {
        let handle = table.insert(round);
        live.push(handle);
        if round % 3 == 0 {
            let stale = live.remove(0);
            assert!(table.remove(stale).is_some());
            assert!(!table.contains(stale));
        }
    }

    assert_eq!(table.len(), live.len());
    for handle in &live {
        assert!(table.contains(*handle));
    }
}

#[test]
fn test_registry_file_document() {
    let text = r#"
[PluginManager]
MaxPluginCount = 16
PluginDirectory = "/opt/app/plugins"

[Plugin.core]
AutoLoad = true
Priority = 100

[Plugin.viewer]
Enabled = false
theme = "dark"
"#;
    let file = RegistryFile::from_toml(&PathBuf::from("registry.toml"), text).unwrap();
    assert_eq!(file.manager.max_plugin_count, 16);
    assert_eq!(file.manager.plugin_directory, PathBuf::from("/opt/app/plugins"));

    let names: Vec<_> = file.plugins.keys().cloned().collect();
    assert_eq!(names, vec!["core", "viewer"]);
    assert_eq!(
        file.plugins["core"],
        PluginConfig::default().with_auto_load(true).with_priority(100)
    );
    assert!(!file.plugins["viewer"].enabled);
    assert_eq!(file.plugins["viewer"].parameter("theme"), Some("dark"));
}

#[test]
fn test_default_registry_file() {
    let file = RegistryFile::default();
    assert_eq!(file.manager.max_plugin_count, DEFAULT_MAX_PLUGINS);
    assert!(file.plugins.is_empty());

    let text = file.to_toml().unwrap();
    assert!(text.contains("MaxPluginCount"));
}

#[test]
fn test_plugin_info_from_toml() {
    let info: PluginInfo = toml::from_str(
        r#"
name = "viewer"
version = "0.3.0"
dependencies = ["core"]

[api_version]
major = 1
minor = 2
patch = 0
"#,
    )
    .unwrap();
    assert_eq!(info.api_version, ApiVersion::new(1, 2, 0));
    assert_eq!(info.dependencies, vec!["core".to_string()]);
    assert!(!CURRENT_API_VERSION.is_compatible(&info.api_version));
    assert!(info.api_version.is_compatible(&CURRENT_API_VERSION));
}
