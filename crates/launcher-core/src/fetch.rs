//! Remote update discovery and payload installation.
//!
//! The update host serves a tiny JSON document naming the latest version
//! and the URL of a ZIP archive:
//!
//! ```json
//! {"Version": "1.1.0.0", "Url": "http://host/payload.zip"}
//! ```
//!
//! The metadata itself carries no integrity data; trust is anchored in the
//! signed manifest inside the payload. Installation is a two-phase
//! operation per slot: full wipe, then extract. A failure partway leaves
//! the slot partially populated, which the next verification cycle rejects
//! and the next refresh cycle re-attempts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

/// File name of the download scratch archive in the OS temp directory.
pub const SCRATCH_ARCHIVE_FILE_NAME: &str = "MeineApp_Update.zip";

/// Remote update metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateInfo {
    /// Latest published four-part version.
    #[serde(rename = "Version")]
    pub version: String,

    /// Absolute URL of the payload ZIP archive.
    #[serde(rename = "Url")]
    pub url: String,
}

/// Errors fetching update metadata.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The HTTP request failed or returned an error status.
    #[error("network error fetching update metadata: {0}")]
    Network(#[from] reqwest::Error),

    /// The response body is not the expected JSON shape.
    #[error("update metadata is not valid JSON: {0}")]
    Parse(String),
}

/// The step of `download_and_install` that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStage {
    /// Fetching the archive bytes.
    Download,
    /// Writing the scratch archive file.
    WriteArchive,
    /// Removing the previous slot contents.
    ClearSlot,
    /// Extracting the archive into the slot.
    Extract,
}

impl std::fmt::Display for InstallStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Download => write!(f, "downloading the archive"),
            Self::WriteArchive => write!(f, "writing the archive to disk"),
            Self::ClearSlot => write!(f, "clearing the slot"),
            Self::Extract => write!(f, "extracting the archive"),
        }
    }
}

/// A failed installation, attributed to the stage that broke.
#[derive(Debug, Error)]
#[error("install failed while {stage}: {reason}")]
pub struct InstallError {
    /// The failed step.
    pub stage: InstallStage,
    /// Human-readable cause.
    pub reason: String,
}

impl InstallError {
    fn new(stage: InstallStage, reason: impl ToString) -> Self {
        Self {
            stage,
            reason: reason.to_string(),
        }
    }
}

/// Retrieves update metadata and materializes payloads into slots.
///
/// One fetcher (and its HTTP client) is shared across all calls within a
/// launcher run; at most one install is in flight at a time.
#[derive(Debug, Clone)]
pub struct UpdateFetcher {
    client: reqwest::Client,
    info_url: String,
    scratch_archive: PathBuf,
}

impl UpdateFetcher {
    /// Creates a fetcher for the given metadata URL.
    ///
    /// # Errors
    ///
    /// Returns the `reqwest` error if the HTTP client cannot be built.
    pub fn new(info_url: impl Into<String>, http_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(http_timeout).build()?;
        Ok(Self {
            client,
            info_url: info_url.into(),
            scratch_archive: std::env::temp_dir().join(SCRATCH_ARCHIVE_FILE_NAME),
        })
    }

    /// Places the scratch archive in `dir` instead of the OS temp
    /// directory. The file name stays [`SCRATCH_ARCHIVE_FILE_NAME`].
    #[must_use]
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_archive = dir.into().join(SCRATCH_ARCHIVE_FILE_NAME);
        self
    }

    /// Fetches and parses the remote update metadata.
    ///
    /// # Errors
    ///
    /// [`FetchError::Network`] on transport or HTTP-status failure,
    /// [`FetchError::Parse`] if the body is not the expected JSON.
    pub async fn fetch_info(&self) -> Result<UpdateInfo, FetchError> {
        debug!(url = %self.info_url, "fetching update metadata");
        let body = self
            .client
            .get(&self.info_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let info: UpdateInfo =
            serde_json::from_str(&body).map_err(|e| FetchError::Parse(e.to_string()))?;
        debug!(version = %info.version, url = %info.url, "update metadata received");
        Ok(info)
    }

    /// Downloads the payload archive and installs it into `slot_dir`.
    ///
    /// Steps: fetch the archive bytes, write them to the scratch file,
    /// remove any previous slot contents, recreate the slot directory and
    /// extract the archive into it (flat).
    ///
    /// # Errors
    ///
    /// Returns [`InstallError`] naming the failed stage. The slot may be
    /// left partially populated; it will fail verification until a later
    /// install completes.
    pub async fn download_and_install(
        &self,
        slot_dir: &Path,
        info: &UpdateInfo,
    ) -> Result<(), InstallError> {
        info!(version = %info.version, slot = %slot_dir.display(), "installing update");

        let bytes = self
            .fetch_archive(&info.url)
            .await
            .map_err(|e| InstallError::new(InstallStage::Download, e))?;

        if let Some(scratch_dir) = self.scratch_archive.parent() {
            tokio::fs::create_dir_all(scratch_dir)
                .await
                .map_err(|e| InstallError::new(InstallStage::WriteArchive, e))?;
        }
        tokio::fs::write(&self.scratch_archive, &bytes)
            .await
            .map_err(|e| InstallError::new(InstallStage::WriteArchive, e))?;

        if slot_dir.exists() {
            tokio::fs::remove_dir_all(slot_dir)
                .await
                .map_err(|e| InstallError::new(InstallStage::ClearSlot, e))?;
        }
        tokio::fs::create_dir_all(slot_dir)
            .await
            .map_err(|e| InstallError::new(InstallStage::Extract, e))?;

        let archive = self.scratch_archive.clone();
        let dest = slot_dir.to_path_buf();
        tokio::task::spawn_blocking(move || extract_archive(&archive, &dest))
            .await
            .map_err(|e| InstallError::new(InstallStage::Extract, e))?
            .map_err(|e| InstallError::new(InstallStage::Extract, e))?;

        info!(version = %info.version, "install complete");
        Ok(())
    }

    async fn fetch_archive(&self, url: &str) -> Result<Vec<u8>, reqwest::Error> {
        Ok(self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?
            .to_vec())
    }
}

/// Extracts a ZIP archive into `dest`, creating directories as needed.
fn extract_archive(archive_path: &Path, dest: &Path) -> Result<(), zip::result::ZipError> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    archive.extract(dest)
}
