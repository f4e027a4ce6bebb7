use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use cdmroute::config::Config;
use cdmroute::vault::{KeyVaults, Vault};
use cdmroute::ContentKey;

fn vaults(yaml: &str) -> KeyVaults {
    let config = Config::from_yaml_str(yaml).unwrap();
    KeyVaults::from_configs(&config.key_vaults).unwrap()
}

#[tokio::test]
async fn no_push_vault_is_never_written_but_lookup_still_hits() {
    let dir = tempfile::tempdir().unwrap();
    let vaults = vaults(&format!(
        r#"
key_vaults:
  - {{type: SQLite, name: A, path: {a}}}
  - {{type: SQLite, name: B, path: {b}, no_push: true}}
"#,
        a = dir.path().join("a.db").display(),
        b = dir.path().join("b.db").display(),
    ));

    let key = ContentKey::new(Uuid::new_v4(), vec![0x11; 16]);
    let report = vaults.store("NETFLIX", &key).await;
    assert!(report.is_clean());
    assert_eq!(report.inserted, vec![("A".to_string(), key.kid_hex())]);

    let b = vaults.get("B").unwrap();
    assert!(b.get_key("NETFLIX", &key.kid).await.unwrap().is_none());
    let hit = vaults.lookup("NETFLIX", &key.kid).await.unwrap();
    assert_eq!(hit.source_vault, "A");
    assert_eq!(hit.key, key);
}

#[tokio::test]
async fn repeated_store_keeps_a_single_entry() {
    let dir = tempfile::tempdir().unwrap();
    let vaults = vaults(&format!(
        "key_vaults:\n  - {{type: SQLite, name: local, path: {}}}\n",
        dir.path().join("keys.db").display()
    ));

    let key = ContentKey::new(Uuid::new_v4(), vec![0x22; 16]);
    let first = vaults.store("NETFLIX", &key).await;
    let second = vaults.store("NETFLIX", &key).await;
    assert_eq!(first.inserted.len(), 1);
    assert!(second.is_clean());
    assert!(second.inserted.is_empty());
    assert_eq!(second.existing.len(), 1);

    let listed = vaults.get("local").unwrap().list_keys("NETFLIX").await.unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn api_vault_failure_does_not_block_other_vaults() {
    let api = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&api)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 2, "message": "read only token",
        })))
        .mount(&api)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let vaults = vaults(&format!(
        r#"
key_vaults:
  - {{type: API, name: remote, uri: "{uri}/keys", token: t}}
  - {{type: SQLite, name: local, path: {db}}}
"#,
        uri = api.uri(),
        db = dir.path().join("keys.db").display(),
    ));

    let key = ContentKey::new(Uuid::new_v4(), vec![0x33; 16]);
    let report = vaults.store("DSNP", &key).await;
    assert_eq!(report.inserted, vec![("local".to_string(), key.kid_hex())]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "remote");
    assert!(!report.failed[0].1.contains(&key.key_hex()));

    let hit = vaults.lookup("DSNP", &key.kid).await.unwrap();
    assert_eq!(hit.source_vault, "local");
}

#[tokio::test]
async fn copy_fills_the_other_vaults() {
    let api = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let vaults = vaults(&format!(
        r#"
key_vaults:
  - {{type: SQLite, name: old, path: {old}}}
  - {{type: SQLite, name: new, path: {new}}}
  - {{type: API, name: mirror, uri: "{uri}", token: t, no_push: true}}
"#,
        old = dir.path().join("old.db").display(),
        new = dir.path().join("new.db").display(),
        uri = api.uri(),
    ));

    let old = vaults.get("old").unwrap();
    let keys: Vec<ContentKey> = (0..3)
        .map(|i| ContentKey::new(Uuid::new_v4(), vec![i + 1; 16]))
        .collect();
    for key in &keys {
        assert!(old.add_key("AMZN", key).await.unwrap());
    }
    old.add_key("NF", &keys[0]).await.unwrap();

    let report = vaults.copy_from("old").await.unwrap();
    assert_eq!(report.inserted.len(), 4);
    assert!(report.inserted.iter().all(|(vault, _)| vault == "new"));

    let new = vaults.get("new").unwrap();
    assert_eq!(new.services().await.unwrap(), vec!["amzn", "nf"]);
    assert_eq!(new.list_keys("AMZN").await.unwrap().len(), 3);
    assert!(api.received_requests().await.unwrap().is_empty());
}
