mod common;

use std::io::Write;

use lib_common::settings::SSM_BASE;
use lib_common::Settings;

use common::MockParamStore;

fn write_ini(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("create temp ini");
    file.write_all(contents.as_bytes()).expect("write temp ini");
    file
}

#[tokio::test]
async fn migrate_ini_to_ssm_is_idempotent() {
    let file = write_ini(common::SAMPLE_INI);
    let store = MockParamStore::new();

    Settings::migrate_ini_to_ssm(file.path(), &store)
        .await
        .expect("first migration should succeed");
    let first_pass = store.snapshot();

    Settings::migrate_ini_to_ssm(file.path(), &store)
        .await
        .expect("second migration should succeed");
    let second_pass = store.snapshot();

    assert_eq!(first_pass, second_pass, "re-migrating must not change the store's contents");
    assert_eq!(
        first_pass.get(&format!("{SSM_BASE}/aws_mq/mq_broker_id")),
        Some(&"b-1234".to_string())
    );
}

#[tokio::test]
async fn load_ssm_round_trips_migrated_values() {
    let file = write_ini(common::SAMPLE_INI);
    let store = MockParamStore::new();
    Settings::migrate_ini_to_ssm(file.path(), &store)
        .await
        .expect("migration should succeed");

    let from_ini = Settings::load_ini(file.path()).expect("ini should load");
    let from_ssm = Settings::load_ssm(&store).await.expect("ssm should load");

    assert_eq!(from_ini.mq_broker_id, from_ssm.mq_broker_id);
    assert_eq!(from_ini.mq_qname_to_ws, from_ssm.mq_qname_to_ws);
    assert_eq!(from_ini.mq_qname_from_ws, from_ssm.mq_qname_from_ws);
    assert_eq!(from_ini.ws_api_host, from_ssm.ws_api_host);
    assert_eq!(from_ini.ws_client_id, from_ssm.ws_client_id);
}

#[tokio::test]
async fn load_ssm_rejects_malformed_ws_max_connect_attempts_instead_of_defaulting() {
    let file = write_ini(common::SAMPLE_INI);
    let store = MockParamStore::new();
    Settings::migrate_ini_to_ssm(file.path(), &store)
        .await
        .expect("migration should succeed");

    // `ws_max_connect_attempts = 0` is itself meaningful (testable property
    // 11), so a malformed value must surface as a setup error rather than
    // silently collapsing to that same 0.
    store
        .put_parameter(&format!("{SSM_BASE}/ws_api/ws_max_connect_attempts"), "not-a-number")
        .await
        .expect("overwrite with malformed value");

    let err = Settings::load_ssm(&store).await.unwrap_err();
    assert!(matches!(
        err,
        lib_common::ConfigError::InvalidValue { section: "ws_api", key: "ws_max_connect_attempts", .. }
    ));
}
