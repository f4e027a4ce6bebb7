mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use cdmroute::vault::Vault;
use cdmroute::{Config, DrmType, Engine, Error, KeySource, LocalCdms, SelectionContext};
use common::{content, write_devices, EchoCdm, FixedLicense};

struct Setup {
    _dir: tempfile::TempDir,
    engine: Engine,
    playready: Arc<EchoCdm>,
    widevine: Arc<EchoCdm>,
}

/// `remote` is spliced into `remote_cdm`, `cdm` into the `cdm` section.
fn setup(cdm: &str, remote: &str) -> Setup {
    let dir = tempfile::tempdir().unwrap();
    write_devices(dir.path());
    let yaml = format!(
        r#"
cdm:
{cdm}
remote_cdm:
{remote}
key_vaults:
  - type: SQLite
    name: primary
    path: {db}
  - type: SQLite
    name: shared
    path: {shared}
    no_push: true
directories:
  wvds: {dir}
  prds: {dir}
timeouts:
  default: 5
"#,
        db = dir.path().join("keys.db").display(),
        shared = dir.path().join("shared.db").display(),
        dir = dir.path().display(),
    );
    let config = Config::from_yaml_str(&yaml).unwrap();
    let playready = Arc::new(EchoCdm::default());
    let widevine = Arc::new(EchoCdm::default());
    let locals = LocalCdms::new()
        .with(DrmType::PlayReady, playready.clone())
        .with(DrmType::Widevine, widevine.clone());
    Setup {
        engine: Engine::new(&config, locals).unwrap(),
        _dir: dir,
        playready,
        widevine,
    }
}

#[tokio::test]
async fn unreachable_remote_falls_back_to_playready_and_caches() {
    let api = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/get-request"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&api)
        .await;

    let s = setup(
        r#"  NETFLIX:
    ">=1440": remote_l1
    playready:
      "<=1080": local_sl2000
    widevine: local_l3"#,
        &format!(
            r#"  - name: remote_l1
    type: decrypt_labs
    host: "{}"
    api_key: k
    device_name: SL3"#,
            api.uri()
        ),
    );

    let kid = Uuid::new_v4();
    let init = content(DrmType::PlayReady, &[kid]);
    let ctx = SelectionContext::new("NETFLIX").quality(2160);
    let server = FixedLicense::new(&[0x42; 16]);

    let material = s
        .engine
        .acquire(&ctx, &init, &server, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(material.source, KeySource::Cdm("local_sl2000".to_string()));
    assert_eq!(material.get(&kid).unwrap().key, vec![0x42; 16]);
    assert_eq!(s.playready.opened.load(Ordering::SeqCst), 1);
    assert_eq!(s.widevine.opened.load(Ordering::SeqCst), 0);

    let again = s
        .engine
        .acquire(&ctx, &init, &server, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(again.source, KeySource::Vault(vec!["primary".to_string()]));
    assert_eq!(server.calls(), 1);

    let shared = s.engine.vaults().get("shared").unwrap();
    assert!(shared.get_key("NETFLIX", &kid).await.unwrap().is_none());
}

#[tokio::test]
async fn custom_api_end_to_end() {
    let api = MockServer::start().await;
    let kid = Uuid::new_v4();
    Mock::given(method("POST"))
        .and(path("/api/challenge"))
        .and(header("Authorization", "Bearer tok"))
        .and(body_partial_json(json!({"drm": "L1", "svc": "DSNP"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "payload": {"challenge": "UkVR", "sid": 77},
        })))
        .mount(&api)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/keys"))
        .and(body_partial_json(json!({"sid": 77, "license_response": "TElD"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "payload": {"keys": format!("--key {}:00112233445566778899aabbccddeeff", kid.as_simple())},
        })))
        .mount(&api)
        .await;

    let s = setup(
        "  DSNP: custom_l1",
        &format!(
            r#"  - name: custom_l1
    type: custom_api
    host: "{}"
    device: {{name: L1, type: ANDROID}}
    auth: {{type: bearer, bearer_token: tok}}
    endpoints: {{challenge: /api/challenge, decrypt: /api/keys}}
    request_mapping:
      challenge:
        param_names: {{scheme: drm, service: svc}}
      decrypt:
        param_names: {{session_id: sid}}
        transforms: [{{param: sid, type: json_parse}}]
    response_mapping:
      challenge:
        fields: {{challenge: payload.challenge, session_id: payload.sid, ok: ok}}
        success_conditions: ["ok == true"]
      decrypt:
        fields: {{keys: payload.keys, ok: ok}}
        success_conditions: ["ok == true"]
        transforms: [{{field: keys, type: parse_key_string}}]"#,
            api.uri()
        ),
    );

    let server = FixedLicense::new(b"LIC");
    let material = s
        .engine
        .acquire(
            &SelectionContext::new("DSNP"),
            &content(DrmType::Widevine, &[kid]),
            &server,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(material.source, KeySource::Cdm("custom_l1".to_string()));
    assert_eq!(material.get(&kid).unwrap().key_hex(), "00112233445566778899aabbccddeeff");
    assert_eq!(s.widevine.opened.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn legacy_device_mismatch_is_skipped() {
    let api = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).insert_header("Server", "https (pywidevine serve v1.8.0)"))
        .mount(&api)
        .await;
    Mock::given(method("GET"))
        .and(path("/pixel/open"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": 200, "message": "Success",
            "data": {"session_id": "0c0d", "device": {"system_id": 8159, "security_level": 3}},
        })))
        .mount(&api)
        .await;
    Mock::given(method("GET"))
        .and(path("/pixel/close/0c0d"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": 200, "message": "closed", "data": {},
        })))
        .expect(1)
        .mount(&api)
        .await;

    let s = setup(
        "  AMZN: pixel_l1\n  default: local_l3",
        &format!(
            r#"  - name: pixel_l1
    host: "{}"
    secret: s3cret
    device_name: pixel
    device_type: ANDROID
    system_id: 4464
    security_level: 1"#,
            api.uri()
        ),
    );

    let kid = Uuid::new_v4();
    let material = s
        .engine
        .acquire(
            &SelectionContext::new("AMZN"),
            &content(DrmType::Widevine, &[kid]),
            &FixedLicense::new(&[7; 16]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(material.source, KeySource::Cdm("local_l3".to_string()));
    assert_eq!(s.widevine.opened.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn exhaustion_names_each_candidate() {
    let s = setup(
        "  NETFLIX: remote_l1",
        r#"  - name: remote_l1
    type: decrypt_labs
    host: "http://127.0.0.1:1"
    api_key: k
    device_name: L1"#,
    );

    let err = s
        .engine
        .acquire(
            &SelectionContext::new("NETFLIX"),
            &content(DrmType::PlayReady, &[Uuid::new_v4()]),
            &FixedLicense::new(&[1; 16]),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), 4);
    let Error::FallbackExhausted { attempts, .. } = err else {
        panic!("expected exhaustion");
    };
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].candidate, "remote_l1");
    assert!(attempts[0].reason.contains("cannot serve"));
}

#[tokio::test]
async fn concurrent_acquisitions_share_one_engine() {
    let s = setup("  default: local_l3", "  []");
    let engine = Arc::new(s.engine);
    let server = Arc::new(FixedLicense::new(&[9; 16]));

    let tasks: Vec<_> = (0..2)
        .map(|_| {
            let engine = engine.clone();
            let server = server.clone();
            tokio::spawn(async move {
                let kid = Uuid::new_v4();
                let material = engine
                    .acquire(
                        &SelectionContext::new("HULU"),
                        &content(DrmType::Widevine, &[kid]),
                        server.as_ref(),
                        &CancellationToken::new(),
                    )
                    .await
                    .unwrap();
                assert!(material.covers(&[kid]));
                kid
            })
        })
        .collect();

    for task in tasks {
        let kid = task.await.unwrap();
        assert!(engine.vaults().lookup("HULU", &kid).await.is_some());
    }
}
