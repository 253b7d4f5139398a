//! End-to-end lockbox builds against a scripted OTA server.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use lockbox_core::config::BuildConfig;
use lockbox_core::error::LockboxError;
use lockbox_runtime::http::{sha256_hex, HttpResponse};
use lockbox_runtime::testing::{FakeContainerRuntime, FakeOstree, ScriptedTransport};
use lockbox_runtime::{FetchedArtifact, LockboxBuilder, LockboxState, ServerCredentials};
use serde_json::{json, Value};

const AUTH: &str = "https://auth.example";
const REPO: &str = "https://ota.example/repo";
const TREEHUB: &str = "https://ota.example/treehub";
const DIRECTOR_BASE: &str = "https://ota.example/director/api/v1/admin/repo";
const IMAGE_REPO_BASE: &str = "https://ota.example/repo/api/v1/user_repo";
const COMMIT: &str = "ab12cd34ef56ab12cd34ef56ab12cd34ef56ab12cd34ef56ab12cd34ef56ab12";
const FIRMWARE: &[u8] = b"firmware image v1";

fn treehub_json() -> String {
    json!({
        "oauth2": {"server": AUTH, "client_id": "client", "client_secret": "secret"},
        "ostree": {"server": TREEHUB}
    })
    .to_string()
}

fn credentials() -> ServerCredentials {
    ServerCredentials::from_parts(&treehub_json(), REPO).unwrap()
}

fn json_response(value: &Value) -> HttpResponse {
    HttpResponse::new(200, serde_json::to_vec(value).unwrap())
}

fn firmware_target() -> Value {
    json!({
        "hashes": {"sha256": sha256_hex(FIRMWARE)},
        "length": FIRMWARE.len(),
        "custom": {"targetFormat": "BINARY", "name": "firmware", "version": "1", "hardwareIds": ["verdin-imx8mp"]}
    })
}

fn os_target() -> Value {
    json!({
        "hashes": {"sha256": COMMIT},
        "length": 0,
        "custom": {"targetFormat": "OSTREE", "name": "torizon-os", "version": "7.0", "hardwareIds": ["verdin-imx8mp"]}
    })
}

/// Script a complete OTA account serving lockbox `box`.
///
/// `image_repo_targets` is the `targets` map of the image repository.
fn script_server(transport: &ScriptedTransport, image_repo_targets: Value) {
    transport.on_post(
        &format!("{}/token", AUTH),
        json_response(&json!({"access_token": "tok", "token_type": "bearer"})),
    );

    let offline_targets = serde_json::to_vec(&json!({
        "signed": {
            "_type": "Offline-Updates",
            "version": 3,
            "expires": "2099-01-01T00:00:00Z",
            "targets": {"fw.bin": firmware_target(), "torizon-os-7.0": os_target()}
        },
        "signatures": []
    }))
    .unwrap();
    let offline_snapshot = json!({
        "signed": {
            "_type": "Offline-Snapshot",
            "version": 1,
            "expires": "2099-01-01T00:00:00Z",
            "meta": {"box.json": {"version": 3, "length": offline_targets.len()}}
        }
    });
    transport.on_get(
        &format!("{}/offline-updates/box.json", DIRECTOR_BASE),
        HttpResponse::new(200, offline_targets),
    );
    transport.on_get(
        &format!("{}/offline-snapshot.json", DIRECTOR_BASE),
        json_response(&offline_snapshot),
    );
    transport.on_get(
        &format!("{}/root.json", DIRECTOR_BASE),
        json_response(&json!({"signed": {"_type": "Root", "version": 2}})),
    );
    transport.on_get(&format!("{}/1.root.json", DIRECTOR_BASE), json_response(&json!({})));
    transport.on_get(&format!("{}/2.root.json", DIRECTOR_BASE), json_response(&json!({})));

    let targets = serde_json::to_vec(&json!({
        "signed": {"_type": "Targets", "version": 1, "targets": image_repo_targets}
    }))
    .unwrap();
    transport.on_get(
        &format!("{}/snapshot.json", IMAGE_REPO_BASE),
        json_response(&json!({"signed": {"meta": {
            "root.json": {"version": 1},
            "targets.json": {"version": 1, "length": targets.len()}
        }}})),
    );
    transport.on_get(
        &format!("{}/targets.json", IMAGE_REPO_BASE),
        HttpResponse::new(200, targets),
    );
    transport.on_get(&format!("{}/1.root.json", IMAGE_REPO_BASE), json_response(&json!({})));

    transport.on_get(
        &format!("{}/targets/fw.bin", IMAGE_REPO_BASE),
        HttpResponse::new(200, FIRMWARE.to_vec()),
    );
    transport.on_head(
        &format!("{}/objects/ab/{}.commit", TREEHUB, &COMMIT[2..]),
        HttpResponse::new(200, Vec::new()),
    );
}

fn all_targets() -> Value {
    json!({"fw.bin": firmware_target(), "torizon-os-7.0": os_target()})
}

struct Fixture {
    _dir: tempfile::TempDir,
    out: PathBuf,
    transport: Arc<ScriptedTransport>,
    ostree: Arc<FakeOstree>,
}

impl Fixture {
    fn new(ostree: FakeOstree) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("update");
        Self {
            _dir: dir,
            out,
            transport: Arc::new(ScriptedTransport::new()),
            ostree: Arc::new(ostree),
        }
    }

    fn config(&self) -> BuildConfig {
        let mut config = BuildConfig::new("box", "unused-credentials.zip");
        config.output_dir = self.out.clone();
        config
    }

    fn builder(&self, config: BuildConfig) -> LockboxBuilder {
        LockboxBuilder::with_collaborators(
            config,
            self.transport.clone(),
            self.ostree.clone(),
            Arc::new(FakeContainerRuntime::default()),
        )
        .with_credentials(credentials())
        .with_public_feed("https://feeds.example/ostree")
    }
}

fn assert_exists(root: &Path, relative: &str) {
    assert!(root.join(relative).exists(), "{} missing", relative);
}

#[tokio::test]
async fn test_full_build() {
    let fx = Fixture::new(FakeOstree::default());
    script_server(&fx.transport, all_targets());
    let mut builder = fx.builder(fx.config());

    let report = builder.build().await.unwrap();
    assert_eq!(builder.state(), LockboxState::Done);
    assert_eq!(report.output_dir, fx.out);
    assert_eq!(report.lockbox_name, "box");
    assert_eq!(report.targets, vec!["fw.bin".to_string(), "torizon-os-7.0".to_string()]);
    assert_eq!(report.artifacts.len(), 2);
    assert_eq!(
        report.artifacts[0],
        FetchedArtifact::Binary {
            file: fx.out.join("images/fw.bin")
        }
    );

    for file in [
        "metadata/director/box.json",
        "metadata/director/offline-snapshot.json",
        "metadata/director/root.json",
        "metadata/director/1.root.json",
        "metadata/director/2.root.json",
        "metadata/image-repo/snapshot.json",
        "metadata/image-repo/targets.json",
        "metadata/image-repo/1.root.json",
        "metadata/docker",
        "images/ostree",
    ] {
        assert_exists(&fx.out, file);
    }
    assert_eq!(std::fs::read(fx.out.join("images/fw.bin")).unwrap(), FIRMWARE);
    // Enumeration stops at the version root.json declares
    assert_eq!(
        fx.transport
            .count_for(&format!("{}/3.root.json", DIRECTOR_BASE)),
        0
    );

    let calls = fx.ostree.calls();
    assert!(calls.contains(&format!("pull tmpremote {} token", COMMIT)));
    assert!(calls.contains(&format!("ref torizon-os-7.0 {}", COMMIT)));
}

#[tokio::test]
async fn test_metadata_only_build() {
    let fx = Fixture::new(FakeOstree::default());
    script_server(&fx.transport, all_targets());
    let mut config = fx.config();
    config.fetch_targets = false;

    let report = fx.builder(config).build().await.unwrap();
    assert!(report.artifacts.is_empty());
    assert_eq!(
        fx.transport
            .count_for(&format!("{}/targets/fw.bin", IMAGE_REPO_BASE)),
        0
    );
    assert!(fx.ostree.calls().is_empty());
    assert_exists(&fx.out, "metadata/image-repo/targets.json");
}

#[tokio::test]
async fn test_unresolved_target_rolls_back() {
    let fx = Fixture::new(FakeOstree::default());
    script_server(&fx.transport, json!({"fw.bin": firmware_target()}));
    let mut builder = fx.builder(fx.config());

    let err = builder.build().await.unwrap_err();
    assert!(matches!(err, LockboxError::TargetNotFound { ref name } if name == "torizon-os-7.0"));
    assert_eq!(builder.state(), LockboxState::RolledBack);
    assert!(!fx.out.exists());
}

#[tokio::test]
async fn test_failed_pull_rolls_back() {
    let fx = Fixture::new(FakeOstree::failing_pull());
    script_server(&fx.transport, all_targets());
    let mut builder = fx.builder(fx.config());

    let err = builder.build().await.unwrap_err();
    assert!(matches!(err, LockboxError::Collaborator { .. }));
    assert!(!fx.out.exists());
}

#[tokio::test]
async fn test_expired_metadata_rolls_back() {
    let fx = Fixture::new(FakeOstree::default());
    script_server(&fx.transport, all_targets());
    let mut builder = fx
        .builder(fx.config())
        .with_validation_time(Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap());

    let err = builder.build().await.unwrap_err();
    assert!(matches!(err, LockboxError::InvalidData(_)));
    assert!(!fx.out.exists());
}

#[tokio::test]
async fn test_skip_validation() {
    let fx = Fixture::new(FakeOstree::default());
    script_server(&fx.transport, all_targets());
    let mut config = fx.config();
    config.validate = false;
    let mut builder = fx
        .builder(config)
        .with_validation_time(Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap());

    builder.build().await.unwrap();
    assert!(fx.out.exists());
}

#[tokio::test]
async fn test_token_failure_rolls_back() {
    let fx = Fixture::new(FakeOstree::default());
    script_server(&fx.transport, all_targets());
    fx.transport
        .on_post(&format!("{}/token", AUTH), HttpResponse::new(401, Vec::new()));
    let mut builder = fx.builder(fx.config());

    let err = builder.build().await.unwrap_err();
    assert!(matches!(err, LockboxError::Authorization(_)));
    assert!(!fx.out.exists());
}

#[tokio::test]
async fn test_server_error_during_root_enumeration_rolls_back() {
    let fx = Fixture::new(FakeOstree::default());
    script_server(&fx.transport, all_targets());
    fx.transport.on_get(
        &format!("{}/2.root.json", DIRECTOR_BASE),
        HttpResponse::new(503, Vec::new()),
    );
    let mut builder = fx.builder(fx.config());

    let err = builder.build().await.unwrap_err();
    assert_eq!(err.status_code(), Some(503));
    assert!(!fx.out.exists());
}

#[tokio::test]
async fn test_interrupted_build_removes_output() {
    let fx = Fixture::new(FakeOstree::default());
    script_server(&fx.transport, all_targets());
    fx.transport
        .hang(&format!("{}/targets/fw.bin", IMAGE_REPO_BASE));
    let mut builder = fx.builder(fx.config());

    let err = builder
        .build_with_shutdown(tokio::time::sleep(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(matches!(err, LockboxError::Interrupted(_)));
    assert_eq!(builder.state(), LockboxState::RolledBack);
    // The hanging request was reached, so the skeleton had been created
    assert_eq!(
        fx.transport
            .count_for(&format!("{}/targets/fw.bin", IMAGE_REPO_BASE)),
        1
    );
    assert!(!fx.out.exists());
}

#[tokio::test]
async fn test_existing_output_is_left_alone() {
    let fx = Fixture::new(FakeOstree::default());
    script_server(&fx.transport, all_targets());
    std::fs::create_dir_all(&fx.out).unwrap();
    std::fs::write(fx.out.join("previous"), b"keep").unwrap();
    let mut builder = fx.builder(fx.config());

    let err = builder.build().await.unwrap_err();
    assert!(matches!(err, LockboxError::InvalidState(_)));
    assert!(fx.out.join("previous").exists());
    assert_eq!(fx.transport.call_count(), 0);
}

#[tokio::test]
async fn test_force_rebuilds_output() {
    let fx = Fixture::new(FakeOstree::default());
    script_server(&fx.transport, all_targets());
    std::fs::create_dir_all(&fx.out).unwrap();
    std::fs::write(fx.out.join("previous"), b"stale").unwrap();
    let mut config = fx.config();
    config.force = true;

    fx.builder(config).build().await.unwrap();
    assert!(!fx.out.join("previous").exists());
    assert_exists(&fx.out, "images/fw.bin");
}

#[tokio::test]
async fn test_credentials_package() {
    let fx = Fixture::new(FakeOstree::default());
    script_server(&fx.transport, all_targets());

    let zip_path = fx.out.with_file_name("credentials.zip");
    {
        let file = std::fs::File::create(&zip_path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default();
        zip.start_file("treehub.json", options).unwrap();
        zip.write_all(treehub_json().as_bytes()).unwrap();
        zip.start_file("tufrepo.url", options).unwrap();
        zip.write_all(format!("{}/\n", REPO).as_bytes()).unwrap();
        zip.finish().unwrap();
    }

    let mut config = fx.config();
    config.credentials = zip_path;
    let mut builder = LockboxBuilder::with_collaborators(
        config,
        fx.transport.clone(),
        fx.ostree.clone(),
        Arc::new(FakeContainerRuntime::default()),
    );

    builder.build().await.unwrap();
    let token_request = &fx.transport.requests()[0];
    assert_eq!(token_request.url, format!("{}/token", AUTH));
    assert_eq!(
        token_request.basic_auth,
        Some(("client".to_string(), "secret".to_string()))
    );
}
