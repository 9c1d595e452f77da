//! Map representations and folder persistence.
//!
//! Two on-disk representations share the same folder layout of a YAML
//! metadata file plus a raw little-endian binary landmark payload:
//!
//! - **Full map** (`map.yaml` + `landmarks.bin`): every landmark with its
//!   observation count, plus session statistics.
//! - **Localization summary map** (`summary_map.yaml` + `landmarks.bin`):
//!   positions of well-constrained landmarks only, the compact form used to
//!   assist real-time localization.
//!
//! A summary can always be derived from a full map by keeping landmarks with
//! enough observations; an empty derivation is an error.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DrishtiError, Result};

/// Minimum observations for a landmark to count as well constrained.
pub const MIN_LANDMARK_OBSERVATIONS: u32 = 3;

const FULL_MAP_METADATA: &str = "map.yaml";
const SUMMARY_MAP_METADATA: &str = "summary_map.yaml";
const LANDMARK_FILE: &str = "landmarks.bin";

/// A triangulated landmark with its support.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Landmark {
    /// Position in the map frame (meters).
    pub position: [f32; 3],
    /// Number of frames observing this landmark.
    pub observations: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct FullMapMetadata {
    version: u32,
    landmark_count: usize,
    frame_count: u64,
    imu_sample_count: u64,
    trajectory_length_m: f32,
}

/// Full session map: all landmarks plus accumulated statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FullMap {
    pub landmarks: Vec<Landmark>,
    pub frame_count: u64,
    pub imu_sample_count: u64,
    pub trajectory_length_m: f32,
}

impl FullMap {
    /// Write the map to a folder, creating it if needed. Existing files in
    /// the folder are replaced.
    pub fn save_to_folder(&self, folder: &Path) -> Result<()> {
        fs::create_dir_all(folder)?;

        let metadata = FullMapMetadata {
            version: 1,
            landmark_count: self.landmarks.len(),
            frame_count: self.frame_count,
            imu_sample_count: self.imu_sample_count,
            trajectory_length_m: self.trajectory_length_m,
        };
        let yaml = serde_yaml::to_string(&metadata)
            .map_err(|e| DrishtiError::Map(format!("Failed to serialize map metadata: {}", e)))?;
        fs::write(folder.join(FULL_MAP_METADATA), yaml)?;

        // 16 bytes per landmark: 3x f32 position + u32 observation count.
        let mut payload = Vec::with_capacity(self.landmarks.len() * 16);
        for landmark in &self.landmarks {
            for coord in landmark.position {
                payload.extend_from_slice(&coord.to_le_bytes());
            }
            payload.extend_from_slice(&landmark.observations.to_le_bytes());
        }
        fs::write(folder.join(LANDMARK_FILE), payload)?;

        log::info!(
            "Saved full map to {:?} ({} landmarks, {} frames)",
            folder,
            self.landmarks.len(),
            self.frame_count
        );
        Ok(())
    }

    /// Load a full map from a folder.
    pub fn load_from_folder(folder: &Path) -> Result<Self> {
        let metadata_path = folder.join(FULL_MAP_METADATA);
        let content = fs::read_to_string(&metadata_path).map_err(|e| {
            DrishtiError::Map(format!("Could not read {:?}: {}", metadata_path, e))
        })?;
        let metadata: FullMapMetadata = serde_yaml::from_str(&content)
            .map_err(|e| DrishtiError::Map(format!("Invalid map metadata: {}", e)))?;

        let payload = fs::read(folder.join(LANDMARK_FILE))?;
        if payload.len() != metadata.landmark_count * 16 {
            return Err(DrishtiError::Map(format!(
                "Landmark payload size mismatch in {:?}: expected {} landmarks",
                folder, metadata.landmark_count
            )));
        }

        let mut landmarks = Vec::with_capacity(metadata.landmark_count);
        for chunk in payload.chunks_exact(16) {
            landmarks.push(Landmark {
                position: [
                    f32::from_le_bytes(chunk[0..4].try_into().unwrap()),
                    f32::from_le_bytes(chunk[4..8].try_into().unwrap()),
                    f32::from_le_bytes(chunk[8..12].try_into().unwrap()),
                ],
                observations: u32::from_le_bytes(chunk[12..16].try_into().unwrap()),
            });
        }

        Ok(Self {
            landmarks,
            frame_count: metadata.frame_count,
            imu_sample_count: metadata.imu_sample_count,
            trajectory_length_m: metadata.trajectory_length_m,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SummaryMapMetadata {
    version: u32,
    landmark_count: usize,
}

/// Compact localization map: positions of well-constrained landmarks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalizationSummaryMap {
    pub landmark_positions: Vec<[f32; 3]>,
}

impl LocalizationSummaryMap {
    /// Derive a summary from a full map by keeping landmarks observed at
    /// least `min_observations` times. An empty result is an error: a map
    /// with no usable landmarks cannot assist localization.
    pub fn from_full(full: &FullMap, min_observations: u32) -> Result<Self> {
        let landmark_positions: Vec<[f32; 3]> = full
            .landmarks
            .iter()
            .filter(|l| l.observations >= min_observations)
            .map(|l| l.position)
            .collect();

        if landmark_positions.is_empty() {
            return Err(DrishtiError::Map(
                "Full map has no well-constrained landmarks to summarize".to_string(),
            ));
        }
        Ok(Self { landmark_positions })
    }

    /// Write the summary map to a folder, creating it if needed.
    pub fn save_to_folder(&self, folder: &Path) -> Result<()> {
        fs::create_dir_all(folder)?;

        let metadata = SummaryMapMetadata {
            version: 1,
            landmark_count: self.landmark_positions.len(),
        };
        let yaml = serde_yaml::to_string(&metadata).map_err(|e| {
            DrishtiError::Map(format!("Failed to serialize summary metadata: {}", e))
        })?;
        fs::write(folder.join(SUMMARY_MAP_METADATA), yaml)?;

        // 12 bytes per landmark: 3x f32 position.
        let mut payload = Vec::with_capacity(self.landmark_positions.len() * 12);
        for position in &self.landmark_positions {
            for coord in position {
                payload.extend_from_slice(&coord.to_le_bytes());
            }
        }
        fs::write(folder.join(LANDMARK_FILE), payload)?;

        log::info!(
            "Saved localization summary map to {:?} ({} landmarks)",
            folder,
            self.landmark_positions.len()
        );
        Ok(())
    }

    /// Load a summary map from a folder.
    pub fn load_from_folder(folder: &Path) -> Result<Self> {
        let metadata_path = folder.join(SUMMARY_MAP_METADATA);
        let content = fs::read_to_string(&metadata_path).map_err(|e| {
            DrishtiError::Map(format!("Could not read {:?}: {}", metadata_path, e))
        })?;
        let metadata: SummaryMapMetadata = serde_yaml::from_str(&content)
            .map_err(|e| DrishtiError::Map(format!("Invalid summary metadata: {}", e)))?;

        let payload = fs::read(folder.join(LANDMARK_FILE))?;
        if payload.len() != metadata.landmark_count * 12 {
            return Err(DrishtiError::Map(format!(
                "Landmark payload size mismatch in {:?}: expected {} landmarks",
                folder, metadata.landmark_count
            )));
        }

        let mut landmark_positions = Vec::with_capacity(metadata.landmark_count);
        for chunk in payload.chunks_exact(12) {
            landmark_positions.push([
                f32::from_le_bytes(chunk[0..4].try_into().unwrap()),
                f32::from_le_bytes(chunk[4..8].try_into().unwrap()),
                f32::from_le_bytes(chunk[8..12].try_into().unwrap()),
            ]);
        }

        Ok(Self { landmark_positions })
    }
}

/// Load a localization map from a folder, falling back from a summary map to
/// deriving one from a full map stored at the same path.
///
/// The fallback is a soft failure (warned, not fatal); a folder holding
/// neither representation is fatal to the caller.
pub fn load_localization_map(folder: &Path) -> Result<LocalizationSummaryMap> {
    match LocalizationSummaryMap::load_from_folder(folder) {
        Ok(map) => {
            log::info!(
                "Loaded localization summary map from {:?} ({} landmarks)",
                folder,
                map.landmark_positions.len()
            );
            Ok(map)
        }
        Err(e) => {
            log::warn!(
                "Could not load a localization summary map from {:?}: {}. Trying it as a full map.",
                folder,
                e
            );
            let full = FullMap::load_from_folder(folder).map_err(|e| {
                DrishtiError::Map(format!(
                    "Loading a full map from {:?} failed: {}. Provide a valid localization map or leave the map folder empty.",
                    folder, e
                ))
            })?;
            let summary = LocalizationSummaryMap::from_full(&full, MIN_LANDMARK_OBSERVATIONS)?;
            log::info!(
                "Derived localization summary from full map ({} of {} landmarks)",
                summary.landmark_positions.len(),
                full.landmarks.len()
            );
            Ok(summary)
        }
    }
}
