//! Shared fixtures for the end-to-end update tests: a signing publisher
//! and an in-process update server.

use std::collections::BTreeMap;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use launcher_core::canonical;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::EncodePublicKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Shell script standing in for the application executable. Emits one
/// timestamped heartbeat and exits cleanly.
pub const APP_SCRIPT: &str =
    "#!/bin/sh\nprintf 'HEARTBEAT [%s]\\n' \"$(date -u +%Y-%m-%dT%H:%M:%SZ)\"\nexit 0\n";

/// Publisher-side signing key, generated once per test process. 1024 bits
/// keeps generation fast and is well above the PKCS#1 v1.5 minimum.
pub fn test_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("generate test key")
    })
}

/// PEM of the verification key matching [`test_key`].
pub fn public_key_pem() -> String {
    test_key()
        .to_public_key()
        .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
        .expect("encode public key")
}

/// Payload file set for a typical release: the app script plus one data
/// file carrying the version so releases differ byte-wise.
pub fn app_files(version: &str) -> BTreeMap<String, Vec<u8>> {
    let mut files = BTreeMap::new();
    files.insert("app.sh".to_string(), APP_SCRIPT.as_bytes().to_vec());
    files.insert(
        "data/release.txt".to_string(),
        format!("release {version}\n").into_bytes(),
    );
    files
}

/// Builds a signed manifest document for the given payload files.
pub fn signed_manifest(version: &str, files: &BTreeMap<String, Vec<u8>>) -> Value {
    let hashes: BTreeMap<String, String> = files
        .iter()
        .map(|(path, contents)| (path.clone(), hex::encode(Sha256::digest(contents))))
        .collect();

    let file_map: Map<String, Value> = hashes
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    let unsigned = json!({"version": version, "files": file_map});
    let message = canonical::canonical_bytes(&unsigned).expect("canonical encode");

    let signing_key = SigningKey::<Sha256>::new(test_key().clone());
    let signature = BASE64_STANDARD.encode(signing_key.sign(&message).to_bytes());

    json!({"version": version, "files": hashes, "signature": signature})
}

/// Builds a release ZIP: payload files plus the signed `manifest.json`.
///
/// Script entries get executable permissions so the extracted payload can
/// be launched directly.
pub fn build_payload_zip(version: &str, files: &BTreeMap<String, Vec<u8>>) -> Vec<u8> {
    build_zip_with_manifest(files, &signed_manifest(version, files))
}

/// Like [`build_payload_zip`] but with one signature byte flipped, so the
/// payload installs fine and then fails verification.
pub fn build_payload_zip_bad_signature(
    version: &str,
    files: &BTreeMap<String, Vec<u8>>,
) -> Vec<u8> {
    let mut manifest = signed_manifest(version, files);
    let mut signature = BASE64_STANDARD
        .decode(manifest["signature"].as_str().unwrap())
        .unwrap();
    signature[0] ^= 0x01;
    manifest["signature"] = Value::String(BASE64_STANDARD.encode(&signature));
    build_zip_with_manifest(files, &manifest)
}

fn build_zip_with_manifest(files: &BTreeMap<String, Vec<u8>>, manifest: &Value) -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    let mut writer = ZipWriter::new(&mut cursor);
    for (path, contents) in files {
        let options = if path.ends_with(".sh") {
            SimpleFileOptions::default().unix_permissions(0o755)
        } else {
            SimpleFileOptions::default()
        };
        writer.start_file(path.as_str(), options).unwrap();
        writer.write_all(contents).unwrap();
    }
    writer
        .start_file("manifest.json", SimpleFileOptions::default())
        .unwrap();
    writer
        .write_all(serde_json::to_string_pretty(manifest).unwrap().as_bytes())
        .unwrap();
    writer.finish().unwrap();
    cursor.into_inner()
}

/// Writes a release directly into a slot directory, bypassing the
/// download path, to seed on-disk state for a scenario.
pub fn seed_slot(slot_dir: &Path, version: &str, files: &BTreeMap<String, Vec<u8>>) {
    std::fs::create_dir_all(slot_dir).unwrap();
    for (rel, contents) in files {
        let path = slot_dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, contents).unwrap();
        #[cfg(unix)]
        if rel.ends_with(".sh") {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
    }
    std::fs::write(
        slot_dir.join("manifest.json"),
        serde_json::to_string_pretty(&signed_manifest(version, files)).unwrap(),
    )
    .unwrap();
}

/// What the in-process update host currently publishes.
pub struct Published {
    pub version: String,
    pub zip: Vec<u8>,
}

/// Minimal update host serving `update.json` and the payload archive.
pub struct UpdateServer {
    addr: SocketAddr,
    published: Arc<Mutex<Published>>,
}

impl UpdateServer {
    /// Binds an ephemeral port and serves the given release.
    pub async fn start(version: &str, zip: Vec<u8>) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let published = Arc::new(Mutex::new(Published {
            version: version.to_string(),
            zip,
        }));

        let info_state = Arc::clone(&published);
        let zip_state = Arc::clone(&published);
        let app = Router::new()
            .route(
                "/update.json",
                get(move || {
                    let published = Arc::clone(&info_state);
                    async move {
                        let published = published.lock().unwrap();
                        json!({
                            "Version": published.version,
                            "Url": format!("http://{addr}/payload.zip"),
                        })
                        .to_string()
                    }
                }),
            )
            .route(
                "/payload.zip",
                get(move || {
                    let published = Arc::clone(&zip_state);
                    async move { published.lock().unwrap().zip.clone() }
                }),
            );

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, published }
    }

    /// URL of the update metadata endpoint.
    pub fn update_url(&self) -> String {
        format!("http://{}/update.json", self.addr)
    }

    /// Replaces the published release.
    pub fn publish(&self, version: &str, zip: Vec<u8>) {
        let mut published = self.published.lock().unwrap();
        published.version = version.to_string();
        published.zip = zip;
    }
}
