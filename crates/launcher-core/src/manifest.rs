//! Manifest parsing and verification.
//!
//! Every slot carries a `manifest.json` at its root describing the payload:
//!
//! ```json
//! {
//!     "version": "1.2.3.4",
//!     "files": { "MeineApp.exe": "<sha256 hex>", "lib/core.dll": "…" },
//!     "signature": "<base64 RSA signature>"
//! }
//! ```
//!
//! The signature is RSASSA-PKCS1-v1_5 over SHA-256 of the canonical
//! encoding (see [`crate::canonical`]) of the document with `signature`
//! removed and every `files` key path-normalized. Verification checks the
//! signature first and then hashes every listed file on disk.
//!
//! Verification is deliberately synchronous: it is pure CPU plus local
//! file reads and never suspends the caller.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::RsaPublicKey;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

use crate::canonical;

/// Well-known manifest file name at the root of every slot.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Reasons a manifest can fail verification.
///
/// Every failure carries a specific reason; the orchestrator surfaces the
/// `Display` text as status and branches on the variant.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The manifest could not be read or is not the expected shape.
    #[error("manifest is malformed: {0}")]
    MalformedManifest(String),

    /// The `signature` field is missing, not a string, or not valid base64.
    #[error("manifest signature is missing or not base64: {0}")]
    BadSignature(String),

    /// The signature does not match the canonical manifest contents.
    #[error("manifest signature is invalid")]
    SignatureInvalid,

    /// A file listed in the manifest does not exist in the slot.
    #[error("file listed in manifest is missing: {0}")]
    MissingFile(String),

    /// A file's SHA-256 digest differs from the manifest entry.
    #[error("file hash does not match manifest: {0}")]
    HashMismatch(String),

    /// A manifest path contains a `..` segment.
    #[error("manifest path is unsafe: {0}")]
    UnsafePath(String),

    /// The manifest lists no files at all.
    #[error("manifest lists no files")]
    EmptyManifest,

    /// Reading a listed file failed for a reason other than absence.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Slot-relative path of the file.
        path: String,
        /// Underlying I/O error.
        source: io::Error,
    },
}

/// Errors constructing a [`ManifestVerifier`].
#[derive(Debug, Error)]
pub enum KeyError {
    /// The PEM input is not an RSA public key in SPKI or PKCS#1 form.
    #[error("invalid RSA public key: {0}")]
    InvalidKey(String),
}

/// A parsed manifest whose signature and file hashes have been checked.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Four-part version string recorded by the publisher.
    pub version: String,

    /// Normalized relative path → lowercase hex SHA-256.
    pub files: BTreeMap<String, String>,
}

/// Normalizes a manifest-relative path to its canonical form.
///
/// Accepts `\` and `/` as separators, drops empty and `.` segments, and
/// rejoins with `/`. The canonical form is what the publisher signs; the
/// host separator is only applied when opening files.
///
/// # Errors
///
/// Returns [`VerifyError::UnsafePath`] for any `..` segment, so no path can
/// escape the slot directory.
pub fn normalize_path(raw: &str) -> Result<String, VerifyError> {
    let mut segments = Vec::new();
    let normalized = raw.replace('\\', "/");
    for segment in normalized.split('/') {
        match segment {
            "" | "." => {},
            ".." => return Err(VerifyError::UnsafePath(raw.to_string())),
            other => segments.push(other),
        }
    }
    Ok(segments.join("/"))
}

/// Verifies slot manifests against an embedded RSA public key.
pub struct ManifestVerifier {
    key: VerifyingKey<Sha256>,
}

impl ManifestVerifier {
    /// Creates a verifier from a PEM-encoded RSA public key.
    ///
    /// Accepts SubjectPublicKeyInfo PEM (`BEGIN PUBLIC KEY`) with a PKCS#1
    /// fallback (`BEGIN RSA PUBLIC KEY`).
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidKey`] if the PEM cannot be parsed.
    pub fn new(public_key_pem: &str) -> Result<Self, KeyError> {
        let key = RsaPublicKey::from_public_key_pem(public_key_pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(public_key_pem))
            .map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        Ok(Self {
            key: VerifyingKey::new(key),
        })
    }

    /// Verifies the manifest at `manifest_path` against the payload under
    /// `slot_dir`.
    ///
    /// Checks, in order: manifest shape, signature (over the canonical
    /// unsigned view with normalized `files` keys), then existence and
    /// SHA-256 of every listed file. Files present in the slot but not
    /// listed in the manifest are reported as a warning, never an error.
    ///
    /// # Errors
    ///
    /// Returns the first [`VerifyError`] encountered; see the enum for the
    /// full taxonomy.
    pub fn verify(&self, manifest_path: &Path, slot_dir: &Path) -> Result<Manifest, VerifyError> {
        let raw = std::fs::read_to_string(manifest_path)
            .map_err(|e| VerifyError::MalformedManifest(e.to_string()))?;
        let parsed: Value = serde_json::from_str(&raw)
            .map_err(|e| VerifyError::MalformedManifest(e.to_string()))?;
        let Value::Object(document) = parsed else {
            return Err(VerifyError::MalformedManifest(
                "top-level value is not an object".to_string(),
            ));
        };

        let signature = decode_signature(&document)?;
        let (version, files) = extract_fields(&document)?;

        // The signer encodes normalized paths; normalizing here makes the
        // canonical form agree regardless of separator conventions.
        let mut normalized: BTreeMap<String, String> = BTreeMap::new();
        for (path, digest) in &files {
            let canonical_path = normalize_path(path)?;
            if normalized.insert(canonical_path.clone(), digest.clone()).is_some() {
                return Err(VerifyError::MalformedManifest(format!(
                    "duplicate file entry after normalization: {canonical_path}"
                )));
            }
        }

        self.check_signature(&version, &normalized, &signature)?;

        if normalized.is_empty() {
            return Err(VerifyError::EmptyManifest);
        }

        for (rel_path, expected) in &normalized {
            let on_disk = host_path(slot_dir, rel_path);
            if !on_disk.is_file() {
                return Err(VerifyError::MissingFile(rel_path.clone()));
            }
            let actual = sha256_hex(&on_disk).map_err(|source| VerifyError::Io {
                path: rel_path.clone(),
                source,
            })?;
            if actual != expected.to_lowercase() {
                return Err(VerifyError::HashMismatch(rel_path.clone()));
            }
        }

        report_unlisted_files(slot_dir, &normalized);

        Ok(Manifest {
            version,
            files: normalized,
        })
    }

    fn check_signature(
        &self,
        version: &str,
        files: &BTreeMap<String, String>,
        signature: &[u8],
    ) -> Result<(), VerifyError> {
        let mut file_map = Map::new();
        for (path, digest) in files {
            file_map.insert(path.clone(), Value::String(digest.clone()));
        }
        let mut unsigned = Map::new();
        unsigned.insert("version".to_string(), Value::String(version.to_string()));
        unsigned.insert("files".to_string(), Value::Object(file_map));

        let message = canonical::canonical_bytes(&Value::Object(unsigned))
            .map_err(|e| VerifyError::MalformedManifest(e.to_string()))?;

        let signature = Signature::try_from(signature)
            .map_err(|e| VerifyError::BadSignature(e.to_string()))?;
        self.key
            .verify(&message, &signature)
            .map_err(|_| VerifyError::SignatureInvalid)
    }
}

fn decode_signature(document: &Map<String, Value>) -> Result<Vec<u8>, VerifyError> {
    let field = document
        .get("signature")
        .ok_or_else(|| VerifyError::BadSignature("field is missing".to_string()))?;
    let text = field
        .as_str()
        .ok_or_else(|| VerifyError::BadSignature("field is not a string".to_string()))?;
    BASE64_STANDARD
        .decode(text)
        .map_err(|e| VerifyError::BadSignature(e.to_string()))
}

fn extract_fields(
    document: &Map<String, Value>,
) -> Result<(String, BTreeMap<String, String>), VerifyError> {
    let version = document
        .get("version")
        .and_then(Value::as_str)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| {
            VerifyError::MalformedManifest("version is missing or empty".to_string())
        })?
        .to_string();

    let files_value = document
        .get("files")
        .and_then(Value::as_object)
        .ok_or_else(|| {
            VerifyError::MalformedManifest("files is missing or not an object".to_string())
        })?;

    let mut files = BTreeMap::new();
    for (path, digest) in files_value {
        let digest = digest.as_str().ok_or_else(|| {
            VerifyError::MalformedManifest(format!("hash for {path} is not a string"))
        })?;
        files.insert(path.clone(), digest.to_string());
    }

    Ok((version, files))
}

/// Maps a normalized relative path onto the host filesystem under `slot_dir`.
fn host_path(slot_dir: &Path, rel_path: &str) -> PathBuf {
    let mut path = slot_dir.to_path_buf();
    for segment in rel_path.split('/') {
        path.push(segment);
    }
    path
}

/// Computes the lowercase hex SHA-256 of a file's bytes.
fn sha256_hex(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Warns about payload files the manifest does not cover.
///
/// The launcher is not the publisher's strict validator, so unlisted files
/// never fail verification, but they are worth surfacing in the log.
fn report_unlisted_files(slot_dir: &Path, listed: &BTreeMap<String, String>) {
    let mut present = Vec::new();
    if collect_relative_files(slot_dir, String::new(), &mut present).is_err() {
        return;
    }
    for rel_path in present {
        if rel_path != MANIFEST_FILE_NAME && !listed.contains_key(&rel_path) {
            warn!(path = %rel_path, "slot contains a file not listed in the manifest");
        }
    }
}

fn collect_relative_files(
    dir: &Path,
    prefix: String,
    out: &mut Vec<String>,
) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_relative_files(&entry.path(), rel, out)?;
        } else if file_type.is_file() {
            out.push(rel);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;

    use rsa::pkcs1v15::SigningKey;
    use rsa::pkcs8::EncodePublicKey;
    use rsa::signature::{SignatureEncoding, Signer};
    use rsa::RsaPrivateKey;
    use serde_json::json;

    use super::*;

    /// Shared test key; 1024 bits keeps generation fast and is well above
    /// the PKCS#1 v1.5 / SHA-256 minimum.
    fn test_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| {
            RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("generate test key")
        })
    }

    fn test_verifier() -> ManifestVerifier {
        let pem = test_key()
            .to_public_key()
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();
        ManifestVerifier::new(&pem).unwrap()
    }

    fn sign_unsigned_view(version: &str, files: &BTreeMap<String, String>) -> String {
        let file_map: Map<String, Value> = files
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        let unsigned = json!({"version": version, "files": file_map});
        let message = canonical::canonical_bytes(&unsigned).unwrap();
        let signing_key = SigningKey::<Sha256>::new(test_key().clone());
        BASE64_STANDARD.encode(signing_key.sign(&message).to_bytes())
    }

    /// Writes `files` into `slot_dir` and a matching signed manifest.
    fn write_signed_slot(slot_dir: &Path, version: &str, files: &[(&str, &[u8])]) {
        std::fs::create_dir_all(slot_dir).unwrap();
        let mut hashes = BTreeMap::new();
        for (rel_path, contents) in files {
            let on_disk = host_path(slot_dir, rel_path);
            if let Some(parent) = on_disk.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(&on_disk, contents).unwrap();
            hashes.insert(
                (*rel_path).to_string(),
                hex::encode(Sha256::digest(contents)),
            );
        }
        let manifest = json!({
            "version": version,
            "files": hashes,
            "signature": sign_unsigned_view(version, &hashes),
        });
        std::fs::write(
            slot_dir.join(MANIFEST_FILE_NAME),
            serde_json::to_string_pretty(&manifest).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_normalize_path_separators() {
        assert_eq!(normalize_path("lib\\core.dll").unwrap(), "lib/core.dll");
        assert_eq!(normalize_path("./a//b/./c.txt").unwrap(), "a/b/c.txt");
        assert_eq!(normalize_path("plain.txt").unwrap(), "plain.txt");
    }

    #[test]
    fn test_normalize_path_rejects_parent_segments() {
        assert!(matches!(
            normalize_path("../escape.dll"),
            Err(VerifyError::UnsafePath(_))
        ));
        assert!(matches!(
            normalize_path("lib\\..\\..\\escape.dll"),
            Err(VerifyError::UnsafePath(_))
        ));
    }

    #[test]
    fn test_verify_valid_slot() {
        let dir = tempfile::tempdir().unwrap();
        let slot = dir.path().join("A");
        write_signed_slot(&slot, "1.0.0.0", &[("app.exe", b"binary"), ("lib/core.dll", b"lib")]);

        let manifest = test_verifier()
            .verify(&slot.join(MANIFEST_FILE_NAME), &slot)
            .unwrap();
        assert_eq!(manifest.version, "1.0.0.0");
        assert_eq!(manifest.files.len(), 2);
    }

    #[test]
    fn test_verify_detects_mutated_file() {
        let dir = tempfile::tempdir().unwrap();
        let slot = dir.path().join("A");
        write_signed_slot(&slot, "1.0.0.0", &[("app.exe", b"binary")]);

        let verifier = test_verifier();
        verifier.verify(&slot.join(MANIFEST_FILE_NAME), &slot).unwrap();

        std::fs::write(slot.join("app.exe"), b"tampered").unwrap();
        let err = verifier
            .verify(&slot.join(MANIFEST_FILE_NAME), &slot)
            .unwrap_err();
        assert!(matches!(err, VerifyError::HashMismatch(p) if p == "app.exe"));
    }

    #[test]
    fn test_verify_detects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let slot = dir.path().join("A");
        write_signed_slot(&slot, "1.0.0.0", &[("app.exe", b"binary"), ("data.bin", b"x")]);

        std::fs::remove_file(slot.join("data.bin")).unwrap();
        let err = test_verifier()
            .verify(&slot.join(MANIFEST_FILE_NAME), &slot)
            .unwrap_err();
        assert!(matches!(err, VerifyError::MissingFile(p) if p == "data.bin"));
    }

    #[test]
    fn test_verify_detects_flipped_signature_byte() {
        let dir = tempfile::tempdir().unwrap();
        let slot = dir.path().join("A");
        write_signed_slot(&slot, "1.0.0.0", &[("app.exe", b"binary")]);

        let manifest_path = slot.join(MANIFEST_FILE_NAME);
        let mut document: Value =
            serde_json::from_str(&std::fs::read_to_string(&manifest_path).unwrap()).unwrap();
        let mut sig = BASE64_STANDARD
            .decode(document["signature"].as_str().unwrap())
            .unwrap();
        sig[0] ^= 0x01;
        document["signature"] = Value::String(BASE64_STANDARD.encode(&sig));
        std::fs::write(&manifest_path, document.to_string()).unwrap();

        let err = test_verifier().verify(&manifest_path, &slot).unwrap_err();
        assert!(matches!(err, VerifyError::SignatureInvalid));
    }

    #[test]
    fn test_verify_rejects_wrong_version_in_signed_view() {
        let dir = tempfile::tempdir().unwrap();
        let slot = dir.path().join("A");
        write_signed_slot(&slot, "1.0.0.0", &[("app.exe", b"binary")]);

        let manifest_path = slot.join(MANIFEST_FILE_NAME);
        let mut document: Value =
            serde_json::from_str(&std::fs::read_to_string(&manifest_path).unwrap()).unwrap();
        document["version"] = Value::String("9.9.9.9".to_string());
        std::fs::write(&manifest_path, document.to_string()).unwrap();

        let err = test_verifier().verify(&manifest_path, &slot).unwrap_err();
        assert!(matches!(err, VerifyError::SignatureInvalid));
    }

    #[test]
    fn test_verify_missing_signature_field() {
        let dir = tempfile::tempdir().unwrap();
        let slot = dir.path().join("A");
        std::fs::create_dir_all(&slot).unwrap();
        std::fs::write(
            slot.join(MANIFEST_FILE_NAME),
            json!({"version": "1.0.0.0", "files": {}}).to_string(),
        )
        .unwrap();

        let err = test_verifier()
            .verify(&slot.join(MANIFEST_FILE_NAME), &slot)
            .unwrap_err();
        assert!(matches!(err, VerifyError::BadSignature(_)));
    }

    #[test]
    fn test_verify_signature_not_base64() {
        let dir = tempfile::tempdir().unwrap();
        let slot = dir.path().join("A");
        std::fs::create_dir_all(&slot).unwrap();
        std::fs::write(
            slot.join(MANIFEST_FILE_NAME),
            json!({"version": "1.0.0.0", "files": {"a": "00"}, "signature": "%%%"}).to_string(),
        )
        .unwrap();

        let err = test_verifier()
            .verify(&slot.join(MANIFEST_FILE_NAME), &slot)
            .unwrap_err();
        assert!(matches!(err, VerifyError::BadSignature(_)));
    }

    #[test]
    fn test_verify_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let slot = dir.path().join("A");
        std::fs::create_dir_all(&slot).unwrap();
        std::fs::write(slot.join(MANIFEST_FILE_NAME), "not json {").unwrap();

        let err = test_verifier()
            .verify(&slot.join(MANIFEST_FILE_NAME), &slot)
            .unwrap_err();
        assert!(matches!(err, VerifyError::MalformedManifest(_)));
    }

    #[test]
    fn test_verify_absent_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let slot = dir.path().join("A");
        std::fs::create_dir_all(&slot).unwrap();

        let err = test_verifier()
            .verify(&slot.join(MANIFEST_FILE_NAME), &slot)
            .unwrap_err();
        assert!(matches!(err, VerifyError::MalformedManifest(_)));
    }

    #[test]
    fn test_verify_empty_file_list() {
        let dir = tempfile::tempdir().unwrap();
        let slot = dir.path().join("A");
        std::fs::create_dir_all(&slot).unwrap();
        let empty = BTreeMap::new();
        std::fs::write(
            slot.join(MANIFEST_FILE_NAME),
            json!({
                "version": "1.0.0.0",
                "files": {},
                "signature": sign_unsigned_view("1.0.0.0", &empty),
            })
            .to_string(),
        )
        .unwrap();

        let err = test_verifier()
            .verify(&slot.join(MANIFEST_FILE_NAME), &slot)
            .unwrap_err();
        assert!(matches!(err, VerifyError::EmptyManifest));
    }

    #[test]
    fn test_verify_unsafe_path_opens_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let slot = dir.path().join("A");
        std::fs::create_dir_all(&slot).unwrap();
        let outside = dir.path().join("outside.txt");
        std::fs::write(&outside, b"secret").unwrap();

        let mut files = BTreeMap::new();
        files.insert("../outside.txt".to_string(), "00".repeat(32));
        std::fs::write(
            slot.join(MANIFEST_FILE_NAME),
            json!({
                "version": "1.0.0.0",
                "files": {"../outside.txt": "00".repeat(32)},
                "signature": sign_unsigned_view("1.0.0.0", &files),
            })
            .to_string(),
        )
        .unwrap();

        let err = test_verifier()
            .verify(&slot.join(MANIFEST_FILE_NAME), &slot)
            .unwrap_err();
        assert!(matches!(err, VerifyError::UnsafePath(_)));
    }

    #[test]
    fn test_verify_accepts_backslash_separators() {
        let dir = tempfile::tempdir().unwrap();
        let slot = dir.path().join("A");
        std::fs::create_dir_all(slot.join("lib")).unwrap();
        std::fs::write(slot.join("lib").join("core.dll"), b"lib").unwrap();

        // The publisher signed the normalized form; the on-disk manifest
        // uses backslashes, which must normalize to the same view.
        let mut normalized = BTreeMap::new();
        normalized.insert(
            "lib/core.dll".to_string(),
            hex::encode(Sha256::digest(b"lib")),
        );
        std::fs::write(
            slot.join(MANIFEST_FILE_NAME),
            json!({
                "version": "1.0.0.0",
                "files": {"lib\\core.dll": hex::encode(Sha256::digest(b"lib"))},
                "signature": sign_unsigned_view("1.0.0.0", &normalized),
            })
            .to_string(),
        )
        .unwrap();

        let manifest = test_verifier()
            .verify(&slot.join(MANIFEST_FILE_NAME), &slot)
            .unwrap();
        assert!(manifest.files.contains_key("lib/core.dll"));
    }

    #[test]
    fn test_verify_uppercase_expected_hash_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let slot = dir.path().join("A");
        std::fs::create_dir_all(&slot).unwrap();
        std::fs::write(slot.join("app.exe"), b"binary").unwrap();

        let upper = hex::encode(Sha256::digest(b"binary")).to_uppercase();
        let mut files = BTreeMap::new();
        files.insert("app.exe".to_string(), upper.clone());
        std::fs::write(
            slot.join(MANIFEST_FILE_NAME),
            json!({
                "version": "1.0.0.0",
                "files": {"app.exe": upper},
                "signature": sign_unsigned_view("1.0.0.0", &files),
            })
            .to_string(),
        )
        .unwrap();

        assert!(test_verifier()
            .verify(&slot.join(MANIFEST_FILE_NAME), &slot)
            .is_ok());
    }
}
