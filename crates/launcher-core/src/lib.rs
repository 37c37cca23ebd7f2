//! # launcher-core
//!
//! Core library for the A/B slot application launcher.
//!
//! The launcher keeps two interchangeable installation directories ("slot A"
//! and "slot B") under a base directory. Updates are always written into the
//! inactive slot; a tiny marker file names the active one and flipping it is
//! the atomic commit point of an update. Before the application is started,
//! the slot's signed manifest is verified (RSA over a canonical JSON
//! encoding, plus per-file SHA-256 hashes). If the active slot fails
//! verification or launch, the launcher falls back to the other slot, and as
//! a last resort wipes both slots so the next run reinstalls from scratch.
//!
//! ## Modules
//!
//! - [`canonical`]: deterministic JSON byte encoding used as the signed
//!   message
//! - [`manifest`]: manifest parsing, signature verification, file hashing
//! - [`slot`]: the active-slot marker and slot directories on disk
//! - [`version`]: installed-version lookup and four-part version comparison
//! - [`fetch`]: remote update metadata and payload download/installation
//! - [`supervise`]: child process launch, stdout heartbeat protocol,
//!   exit observation
//! - [`orchestrator`]: the update/validate/start/fallback state machine
//! - [`config`]: launcher configuration surface
//!
//! ## Example
//!
//! ```rust,no_run
//! use launcher_core::config::LauncherConfig;
//! use launcher_core::orchestrator::Orchestrator;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LauncherConfig::default();
//! let (orchestrator, mut status) = Orchestrator::new(config, "-----BEGIN PUBLIC KEY-----...")?;
//!
//! tokio::spawn(async move {
//!     while status.changed().await.is_ok() {
//!         println!("{}", *status.borrow());
//!     }
//! });
//!
//! let mut handle = orchestrator.run().await?;
//! let code = handle.wait().await;
//! # let _ = code;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod canonical;
pub mod config;
pub mod fetch;
pub mod manifest;
pub mod orchestrator;
pub mod slot;
pub mod supervise;
pub mod version;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::LauncherConfig;
    pub use crate::manifest::{ManifestVerifier, VerifyError};
    pub use crate::orchestrator::{LauncherError, Orchestrator};
    pub use crate::slot::{Slot, SlotStore};
    pub use crate::supervise::{AppHandle, AppSupervisor};
}

/// Re-export commonly used types at the crate root.
pub use config::LauncherConfig;
pub use manifest::{ManifestVerifier, VerifyError};
pub use orchestrator::{LauncherError, Orchestrator};
pub use slot::{Slot, SlotStore};
pub use supervise::{AppHandle, AppSupervisor};
