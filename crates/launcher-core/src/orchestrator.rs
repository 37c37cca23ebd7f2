//! The update/validate/launch state machine.
//!
//! A single launcher run proceeds through three phases:
//!
//! 1. **Bootstrap** — ensure the base directory and active marker exist
//!    (first run creates slot A).
//! 2. **Refresh** — ask the update host for the latest version; if neither
//!    slot is current, install the payload into the refresh target and
//!    commit by flipping the active marker. Refresh failures are recorded
//!    as status and never abort the run: the launcher then tries to start
//!    whatever is installed.
//! 3. **Start with fallback** — verify and start the active slot; on
//!    failure, verify the other slot, flip the marker to it and start it.
//!
//! If no slot is startable, the launcher refreshes once more (forcing a
//! fresh install into the inactive slot) and retries. If that also fails,
//! both slots are wiped so the next run re-bootstraps from scratch.
//!
//! State transitions are committed only by writing the active marker; a
//! crash at any other point leaves the previously active slot untouched.

use std::io;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::LauncherConfig;
use crate::fetch::{UpdateFetcher, UpdateInfo};
use crate::manifest::{KeyError, Manifest, ManifestVerifier, VerifyError, MANIFEST_FILE_NAME};
use crate::slot::{Slot, SlotStore};
use crate::supervise::{AppHandle, AppSupervisor, SupervisorConfig};
use crate::version;

/// Errors constructing an [`Orchestrator`].
#[derive(Debug, Error)]
pub enum SetupError {
    /// The verification key PEM could not be parsed.
    #[error("invalid verification key: {0}")]
    Key(#[from] KeyError),

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Terminal errors of a launcher run.
///
/// Refresh and verification failures are not terminal; they are narrated
/// as status and handled by fallback. Only state-storage failures and the
/// both-slots-dead outcome surface here.
#[derive(Debug, Error)]
pub enum LauncherError {
    /// The marker file or base directory could not be read or written.
    #[error("launcher state error: {0}")]
    Storage(#[source] io::Error),

    /// Neither slot was startable, even after a fresh fetch attempt.
    /// The slot state has been wiped; the next run starts from scratch.
    #[error("no startable slot remains after refreshing from the update host")]
    NoStartableSlot,

    /// The recovery wipe itself failed; the filesystem is unrecoverable.
    #[error("failed to wipe launcher state: {0}")]
    CatastrophicWipeFailed(#[source] io::Error),
}

/// Drives one launcher run from bootstrap to a supervised child.
pub struct Orchestrator {
    store: SlotStore,
    fetcher: UpdateFetcher,
    verifier: ManifestVerifier,
    supervisor: AppSupervisor,
    status: watch::Sender<String>,
}

impl Orchestrator {
    /// Builds an orchestrator from configuration and the verification key.
    ///
    /// Returns the orchestrator together with the receiving end of the
    /// status channel; the UI shell consumes status text from there.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError`] if the key PEM is invalid or the HTTP client
    /// cannot be built.
    pub fn new(
        config: LauncherConfig,
        public_key_pem: &str,
    ) -> Result<(Self, watch::Receiver<String>), SetupError> {
        let verifier = ManifestVerifier::new(public_key_pem)?;
        let mut fetcher = UpdateFetcher::new(config.update_info_url.clone(), config.http_timeout)?;
        if let Some(scratch_dir) = &config.scratch_dir {
            fetcher = fetcher.with_scratch_dir(scratch_dir);
        }
        let store = SlotStore::new(&config.base_path);
        let (status_tx, status_rx) = watch::channel("launcher idle".to_string());
        let supervisor = AppSupervisor::new(
            SupervisorConfig {
                executable: config.app_executable.clone(),
                heartbeat_interval: config.heartbeat_interval,
                heartbeat_timeout: config.heartbeat_timeout,
            },
            status_tx.clone(),
        );
        Ok((
            Self {
                store,
                fetcher,
                verifier,
                supervisor,
                status: status_tx,
            },
            status_rx,
        ))
    }

    /// Runs the full update/validate/launch sequence.
    ///
    /// On success the application is running under supervision and its
    /// handle is returned. The run narrates progress through the status
    /// channel throughout; on terminal failure the last status value is
    /// left for the UI shell.
    ///
    /// # Errors
    ///
    /// See [`LauncherError`]; everything recoverable is handled internally.
    pub async fn run(&self) -> Result<AppHandle, LauncherError> {
        self.status("launcher starting");
        let first_run = !self.store.marker_path().exists();
        let active = self.store.read_active().map_err(LauncherError::Storage)?;
        if first_run {
            info!(slot = %active, "first run; bootstrapped slot state");
        }

        self.refresh(active, first_run, false).await;

        if let Some(handle) = self.start_with_fallback()? {
            return Ok(handle);
        }

        // Both on-disk slots were unusable. The remote may still have a
        // good payload: force a fresh install into the inactive slot and
        // try once more before giving up.
        self.status("no runnable installation; fetching a fresh copy");
        let active = self.store.read_active().map_err(LauncherError::Storage)?;
        self.refresh(active, false, true).await;

        if let Some(handle) = self.start_with_fallback()? {
            return Ok(handle);
        }

        self.status("no runnable installation; resetting launcher state");
        warn!("both slots unusable after refetch; wiping slot state");
        self.store
            .wipe_all()
            .map_err(LauncherError::CatastrophicWipeFailed)?;
        Err(LauncherError::NoStartableSlot)
    }

    /// The refresh phase: discover the remote version and install it if
    /// neither slot already has it.
    ///
    /// Never propagates an error; failures become status text and the run
    /// proceeds to start whatever is installed. On the first run the
    /// install targets the freshly bootstrapped active slot; `force`
    /// installs unconditionally, skipping the version comparison.
    async fn refresh(&self, active: Slot, first_run: bool, force: bool) {
        self.status("checking for updates");
        let info = match self.fetcher.fetch_info().await {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "update check failed");
                self.status(format!("update check failed: {e}"));
                return;
            },
        };

        let inactive = active.other();
        if !force {
            let local = version::installed_version(&self.store.path_of(active));
            if version::is_up_to_date(&local, &info.version) {
                info!(local = %local, remote = %info.version, "application is current");
                self.status("application is current");
                return;
            }
            let inactive_local = version::installed_version(&self.store.path_of(inactive));
            if version::is_up_to_date(&inactive_local, &info.version) {
                info!(slot = %inactive, "inactive slot already holds the latest version");
                self.status("inactive slot already current");
                return;
            }
        }

        let target = if first_run { active } else { inactive };
        self.install_into(target, &info).await;
    }

    async fn install_into(&self, target: Slot, info: &UpdateInfo) {
        self.status(format!("downloading version {}", info.version));
        let target_dir = self.store.path_of(target);
        match self.fetcher.download_and_install(&target_dir, info).await {
            Ok(()) => {
                // The commit point: flipping the marker makes the new
                // payload the one that will be launched.
                match self.store.write_active(target) {
                    Ok(()) => {
                        self.status(format!(
                            "version {} installed into slot {target}",
                            info.version
                        ));
                    },
                    Err(e) => {
                        warn!(error = %e, slot = %target, "failed to commit active marker");
                        self.status(format!("update installed but not committed: {e}"));
                    },
                }
            },
            Err(e) => {
                warn!(error = %e, slot = %target, "install failed");
                self.status(format!("update failed: {e}"));
            },
        }
    }

    /// The start phase: active slot first, then the fallback.
    ///
    /// Returns `Ok(None)` when neither slot could be verified and started.
    fn start_with_fallback(&self) -> Result<Option<AppHandle>, LauncherError> {
        // Re-read: the refresh phase may have flipped the marker.
        let active = self.store.read_active().map_err(LauncherError::Storage)?;

        match self.try_slot(active) {
            Ok(handle) => return Ok(Some(handle)),
            Err(reason) => {
                warn!(slot = %active, %reason, "active slot unusable");
                self.status(format!("slot {active} unusable: {reason}"));
            },
        }

        let fallback = active.other();
        self.status(format!("falling back to slot {fallback}"));
        match self.verify_slot(fallback) {
            Ok(_) => {
                self.store
                    .write_active(fallback)
                    .map_err(LauncherError::Storage)?;
                match self.supervisor.start(&self.store.path_of(fallback)) {
                    Ok(handle) => Ok(Some(handle)),
                    Err(e) => {
                        warn!(slot = %fallback, error = %e, "fallback slot failed to start");
                        self.status(format!("slot {fallback} unusable: {e}"));
                        Ok(None)
                    },
                }
            },
            Err(e) => {
                warn!(slot = %fallback, error = %e, "fallback slot failed validation");
                self.status(format!("slot {fallback} unusable: {e}"));
                Ok(None)
            },
        }
    }

    /// Verifies and starts one slot.
    fn try_slot(&self, slot: Slot) -> Result<AppHandle, String> {
        self.status(format!("validating slot {slot}"));
        self.verify_slot(slot).map_err(|e| e.to_string())?;
        self.supervisor
            .start(&self.store.path_of(slot))
            .map_err(|e| e.to_string())
    }

    fn verify_slot(&self, slot: Slot) -> Result<Manifest, VerifyError> {
        let slot_dir = self.store.path_of(slot);
        self.verifier
            .verify(&slot_dir.join(MANIFEST_FILE_NAME), &slot_dir)
    }

    fn status(&self, message: impl Into<String>) {
        self.status.send_replace(message.into());
    }
}
