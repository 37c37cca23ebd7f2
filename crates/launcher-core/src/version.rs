//! Installed-version lookup and four-part version comparison.
//!
//! Versions are four dot-separated integers (`1.2.3.4`). The locally
//! installed version of a slot is read from the well-known file at the
//! slot root, `manifest.json`, which records the version the publisher
//! stamped into the payload. A slot with no readable version reports
//! [`FALLBACK_VERSION`], which compares older than everything and so
//! forces an update attempt.

use std::path::Path;

use serde::Deserialize;

use crate::manifest::MANIFEST_FILE_NAME;

/// Version reported for a slot whose version cannot be determined.
pub const FALLBACK_VERSION: &str = "0.0.0.0";

/// Minimal view of the manifest for version lookup only.
#[derive(Deserialize)]
struct VersionStamp {
    version: String,
}

/// Reads the installed version of the payload under `slot_dir`.
///
/// Returns [`FALLBACK_VERSION`] if the slot has no manifest or the
/// manifest is unreadable; the caller treats that as "needs update".
#[must_use]
pub fn installed_version(slot_dir: &Path) -> String {
    let manifest_path = slot_dir.join(MANIFEST_FILE_NAME);
    std::fs::read_to_string(manifest_path)
        .ok()
        .and_then(|raw| serde_json::from_str::<VersionStamp>(&raw).ok())
        .map_or_else(|| FALLBACK_VERSION.to_string(), |stamp| stamp.version)
}

/// Parses the first four dot-separated integer components.
fn components(version: &str) -> Option<[u64; 4]> {
    let mut parts = version.trim().split('.');
    let mut out = [0u64; 4];
    for slot in &mut out {
        *slot = parts.next()?.trim().parse().ok()?;
    }
    Some(out)
}

/// Whether `local` is at least as new as `remote`.
///
/// The first four components are compared as integers, most significant
/// first. If either string does not carry four integer components the
/// answer is `false`, forcing an update attempt. Equal versions are
/// up-to-date; equality never forces a reinstall.
#[must_use]
pub fn is_up_to_date(local: &str, remote: &str) -> bool {
    let (Some(local), Some(remote)) = (components(local), components(remote)) else {
        return false;
    };
    for (l, r) in local.iter().zip(remote.iter()) {
        if l > r {
            return true;
        }
        if l < r {
            return false;
        }
    }
    true
}
