//! Save-target allocation and serialized map persistence.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::engine::MapBuilderHandle;
use crate::map::{LocalizationSummaryMap, MIN_LANDMARK_OBSERVATIONS};

/// Resolve the folder a map will actually be written to.
///
/// Empty `requested` means saving is disabled and yields `None`. With
/// overwrite allowed the requested folder is used as-is. Otherwise `_0`,
/// `_1`, ... is appended until a path with no existing filesystem entry is
/// found. Pure: nothing is created here, and the filesystem can still change
/// between allocation and the save - collision avoidance is best effort.
pub fn allocate_save_folder(requested: &str, overwrite: bool) -> Option<PathBuf> {
    if requested.is_empty() {
        return None;
    }
    let base = PathBuf::from(requested);
    if overwrite || !base.exists() {
        return Some(base);
    }

    let mut counter = 0u64;
    loop {
        let candidate = PathBuf::from(format!("{}_{}", requested, counter));
        if !candidate.exists() {
            log::info!(
                "Save folder {:?} exists, using {:?} instead",
                requested,
                candidate
            );
            return Some(candidate);
        }
        counter += 1;
    }
}

/// Serializes every map persist for the session.
///
/// Saves can be requested from the control endpoint thread and from the
/// shutdown path at the same time; the inner lock guarantees at most one
/// persist runs at any instant, so two writers never interleave on the
/// resolved folder. A request that arrives mid-persist blocks until the
/// first one finishes, then runs.
pub struct SaveCoordinator {
    map: MapBuilderHandle,
    resolved_folder: Option<PathBuf>,
    optimize: bool,
    persist_lock: Mutex<()>,
}

impl SaveCoordinator {
    /// `resolved_folder` is the allocator's output, computed once at
    /// initialization; repeated saves target the same location.
    pub fn new(map: MapBuilderHandle, resolved_folder: Option<PathBuf>, optimize: bool) -> Self {
        Self {
            map,
            resolved_folder,
            optimize,
            persist_lock: Mutex::new(()),
        }
    }

    /// The folder saves are written to, if saving is configured.
    pub fn resolved_folder(&self) -> Option<&Path> {
        self.resolved_folder.as_deref()
    }

    /// Persist the current map snapshot. Returns `false` without touching the
    /// filesystem when no save folder is configured, and `false` on a failed
    /// write (logged, not escalated).
    pub fn request_save(&self) -> bool {
        let Some(folder) = self.resolved_folder.as_deref() else {
            log::warn!("Save requested but no save folder is configured");
            return false;
        };

        let _guard = match self.persist_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let snapshot = match self.map.lock() {
            Ok(builder) => builder.snapshot(),
            Err(poisoned) => poisoned.into_inner().snapshot(),
        };

        let result = if self.optimize {
            LocalizationSummaryMap::from_full(&snapshot, MIN_LANDMARK_OBSERVATIONS)
                .and_then(|summary| summary.save_to_folder(folder))
        } else {
            snapshot.save_to_folder(folder)
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                log::error!("Map save to {:?} failed: {}", folder, e);
                false
            }
        }
    }
}
