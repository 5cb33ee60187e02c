use std::path::PathBuf;

use idlink::{
    load_config, resolve_data_dir, save_config, ConnectorConfig, SqliteUsersConnector, Storage,
    UsersConnector,
};

#[test]
fn config_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let config = ConnectorConfig {
        database: Some(PathBuf::from("users.sqlite")),
        busy_timeout_ms: 1_500,
        log_filter: "idlink=debug".to_string(),
    };
    save_config(dir.path(), &config).unwrap();
    assert_eq!(load_config(dir.path()).unwrap(), config);
}

#[test]
fn default_config_roundtrip_omits_database() {
    let dir = tempfile::tempdir().unwrap();
    save_config(dir.path(), &ConnectorConfig::default()).unwrap();
    let written = std::fs::read_to_string(dir.path().join("config.toml")).unwrap();
    assert!(!written.contains("database"), "{written}");
    assert_eq!(load_config(dir.path()).unwrap(), ConnectorConfig::default());
}

#[test]
fn storage_opens_configured_database() {
    let dir = tempfile::tempdir().unwrap();
    let config = ConnectorConfig {
        database: Some(PathBuf::from("nested/users.sqlite")),
        ..ConnectorConfig::default()
    };

    let uid = {
        let storage = Storage::from_config(&config, dir.path()).unwrap();
        assert_eq!(storage.path(), Some(dir.path().join("nested/users.sqlite").as_path()));
        SqliteUsersConnector::new(storage)
            .add_user(Some("soap"), "IPv9", "0578cc6.8db024")
            .unwrap()
    };

    let reopened = SqliteUsersConnector::new(Storage::from_config(&config, dir.path()).unwrap());
    let view = reopened.get_user(uid).unwrap().unwrap();
    assert_eq!(view.identifier.as_deref(), Some("soap"));
}

// Everything that touches process environment stays in one test so it
// cannot interleave with itself.
#[test]
fn environment_overrides_file_values() {
    let home = tempfile::tempdir().unwrap();
    save_config(
        home.path(),
        &ConnectorConfig {
            database: Some(PathBuf::from("from-file.db")),
            ..ConnectorConfig::default()
        },
    )
    .unwrap();

    std::env::set_var("IDLINK_HOME", home.path());
    assert_eq!(resolve_data_dir(), home.path());
    let from_file = SqliteUsersConnector::from_env().unwrap();
    // from_env installed the global subscriber from log_filter
    assert!(!idlink::logging::init("info"));
    assert_eq!(
        from_file.storage().path(),
        Some(home.path().join("from-file.db").as_path())
    );

    std::env::set_var("IDLINK_DB", "override.db");
    std::env::set_var("IDLINK_LOG", "idlink=trace");
    let config = load_config(home.path()).unwrap().apply_env_overrides();
    let from_env = SqliteUsersConnector::from_env().unwrap();
    std::env::remove_var("IDLINK_DB");
    std::env::remove_var("IDLINK_LOG");
    std::env::remove_var("IDLINK_HOME");

    assert_eq!(config.database, Some(PathBuf::from("override.db")));
    assert_eq!(config.log_filter, "idlink=trace");
    assert_eq!(
        from_env.storage().path(),
        Some(home.path().join("override.db").as_path())
    );
}
