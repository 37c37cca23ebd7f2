//! On-disk slot state: the active-slot marker and the two slot directories.
//!
//! The layout under the base directory is fixed:
//!
//! ```text
//! <base>/active.txt    one of "A" or "B" (trimmed); absent on first run
//! <base>/A/            slot A payload
//! <base>/B/            slot B payload
//! ```
//!
//! Writing `active.txt` is the atomic commit point of every update: any
//! crash before the marker write leaves the previous active slot untouched.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// File name of the active-slot marker under the base directory.
pub const ACTIVE_MARKER_FILE_NAME: &str = "active.txt";

/// One of the two interchangeable installation slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Slot A, the bootstrap default.
    A,
    /// Slot B.
    B,
}

impl Slot {
    /// Returns the other slot.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    /// Marker and directory name of this slot.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
        }
    }

    /// Parses marker file contents; anything that is not `B` reads as `A`.
    ///
    /// `read_active` must be total, so unrecognized contents fall back to
    /// the bootstrap default rather than failing.
    fn from_marker(contents: &str) -> Self {
        if contents.trim().eq_ignore_ascii_case("B") {
            Self::B
        } else {
            Self::A
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owner of the marker file and the two slot directories.
///
/// All mutations of the on-disk slot state go through this type;
/// verification and process startup only ever read from slot directories.
#[derive(Debug, Clone)]
pub struct SlotStore {
    base: PathBuf,
}

impl SlotStore {
    /// Creates a store rooted at `base`. Nothing is touched on disk until
    /// the first operation.
    #[must_use]
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// The base directory holding the marker and both slots.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Path of the active-slot marker file.
    #[must_use]
    pub fn marker_path(&self) -> PathBuf {
        self.base.join(ACTIVE_MARKER_FILE_NAME)
    }

    /// Directory of the given slot.
    #[must_use]
    pub fn path_of(&self, slot: Slot) -> PathBuf {
        self.base.join(slot.as_str())
    }

    /// Reads the active slot, bootstrapping on first run.
    ///
    /// If the marker file is absent, it is created with value `A` and the
    /// A slot directory is created alongside it. This is the one-time
    /// bootstrap side effect; afterwards the call is a plain read.
    ///
    /// # Errors
    ///
    /// Only on catastrophic I/O failure (base directory not creatable,
    /// marker unreadable for reasons other than absence).
    pub fn read_active(&self) -> io::Result<Slot> {
        fs::create_dir_all(&self.base)?;
        match fs::read_to_string(self.marker_path()) {
            Ok(contents) => Ok(Slot::from_marker(&contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(base = %self.base.display(), "no active marker; bootstrapping slot A");
                self.write_active(Slot::A)?;
                fs::create_dir_all(self.path_of(Slot::A))?;
                Ok(Slot::A)
            },
            Err(e) => Err(e),
        }
    }

    /// Persists `slot` as the active slot.
    ///
    /// Written to a temporary file and renamed into place so a crash
    /// mid-write can never leave a torn marker.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the write or rename fails.
    pub fn write_active(&self, slot: Slot) -> io::Result<()> {
        fs::create_dir_all(&self.base)?;
        let tmp = self.base.join("active.txt.tmp");
        fs::write(&tmp, slot.as_str())?;
        fs::rename(&tmp, self.marker_path())?;
        debug!(slot = %slot, "active marker written");
        Ok(())
    }

    /// Removes both slot directories and the marker, recreating an empty
    /// base directory.
    ///
    /// This is the recovery escape hatch when neither slot is startable;
    /// the next run re-bootstraps from scratch.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if any removal fails.
    pub fn wipe_all(&self) -> io::Result<()> {
        for slot in [Slot::A, Slot::B] {
            let dir = self.path_of(slot);
            match fs::remove_dir_all(&dir) {
                Ok(()) => {},
                Err(e) if e.kind() == io::ErrorKind::NotFound => {},
                Err(e) => return Err(e),
            }
        }
        match fs::remove_file(self.marker_path()) {
            Ok(()) => {},
            Err(e) if e.kind() == io::ErrorKind::NotFound => {},
            Err(e) => return Err(e),
        }
        fs::create_dir_all(&self.base)
    }
}
