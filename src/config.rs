//! Configuration resolution for the mapping session daemon.
//!
//! Settings come from two layers, merged once at startup:
//! 1. Command-line flags (with built-in defaults).
//! 2. An optional TOML override file whose set fields win over the flags.
//!
//! The result is an immutable [`EffectiveConfig`] that is handed to the
//! controller by value. No component reads flag state after resolution, so
//! every thread observes the same settings for the whole session.

use std::fs;
use std::path::Path;

use clap::Parser;
use serde::Deserialize;

use crate::error::{DrishtiError, Result};

/// Command-line flags.
#[derive(Debug, Parser)]
#[command(name = "drishti-vio", about = "Visual-inertial mapping session daemon")]
pub struct Args {
    /// Optional TOML file whose settings override the flags below.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Path to a localization summary map folder (or a full map folder to
    /// derive a summary from). Empty disables map-assisted localization.
    #[arg(long, default_value = "")]
    pub localization_map_folder: String,

    /// Path to the camera rig calibration YAML.
    #[arg(long, default_value = "camera-rig.yaml")]
    pub camera_calibration: String,

    /// Path to the IMU parameter YAML.
    #[arg(long, default_value = "imu.yaml")]
    pub imu_parameters: String,

    /// Optional IMU sigma YAML overriding only the estimator-facing noise
    /// parameters. Empty means the primary IMU sigmas are used.
    #[arg(long, default_value = "")]
    pub external_imu_parameters: String,

    /// Save the map to this folder; empty disables saving entirely.
    #[arg(long, default_value = "")]
    pub save_map_folder: String,

    /// Overwrite an existing map on save instead of suffixing the folder.
    #[arg(long)]
    pub overwrite_existing_map: bool,

    /// Optimize the map into a localization summary before saving.
    #[arg(long)]
    pub optimize_map_on_save: bool,

    /// Save the map automatically when the session ends.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub save_map_on_shutdown: bool,

    /// Record raw sensor frames under the save folder while processing.
    /// Requires --save-map-folder.
    #[arg(long)]
    pub save_sensor_resources: bool,

    /// Recorded sensor log to process (the session's data source).
    #[arg(long, default_value = "")]
    pub sensor_log: String,

    /// TCP port for the control endpoint.
    #[arg(long, default_value_t = 5560)]
    pub control_port: u16,

    /// Worker thread count for the processing pipeline (0 = hardware
    /// parallelism).
    #[arg(long, default_value_t = 0)]
    pub worker_threads: usize,
}

/// TOML override file. Only fields present in the file override the flags.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Overrides {
    pub localization_map_folder: Option<String>,
    pub camera_calibration: Option<String>,
    pub imu_parameters: Option<String>,
    pub external_imu_parameters: Option<String>,
    pub save_map_folder: Option<String>,
    pub overwrite_existing_map: Option<bool>,
    pub optimize_map_on_save: Option<bool>,
    pub save_map_on_shutdown: Option<bool>,
    pub save_sensor_resources: Option<bool>,
    pub sensor_log: Option<String>,
    pub control_port: Option<u16>,
    pub worker_threads: Option<usize>,
}

impl Overrides {
    /// Load overrides from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            DrishtiError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        Ok(basic_toml::from_str(&content)?)
    }
}

/// Immutable snapshot of the resolved session settings.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub localization_map_folder: String,
    pub camera_calibration: String,
    pub imu_parameters: String,
    pub external_imu_parameters: String,
    pub save_map_folder: String,
    pub overwrite_existing_map: bool,
    pub optimize_map_on_save: bool,
    pub save_map_on_shutdown: bool,
    pub save_sensor_resources: bool,
    pub sensor_log: String,
    pub control_port: u16,
    pub worker_threads: usize,
}

impl EffectiveConfig {
    /// Merge the override file over the flag values.
    pub fn resolve(args: Args, overrides: Overrides) -> Self {
        Self {
            localization_map_folder: overrides
                .localization_map_folder
                .unwrap_or(args.localization_map_folder),
            camera_calibration: overrides
                .camera_calibration
                .unwrap_or(args.camera_calibration),
            imu_parameters: overrides.imu_parameters.unwrap_or(args.imu_parameters),
            external_imu_parameters: overrides
                .external_imu_parameters
                .unwrap_or(args.external_imu_parameters),
            save_map_folder: overrides.save_map_folder.unwrap_or(args.save_map_folder),
            overwrite_existing_map: overrides
                .overwrite_existing_map
                .unwrap_or(args.overwrite_existing_map),
            optimize_map_on_save: overrides
                .optimize_map_on_save
                .unwrap_or(args.optimize_map_on_save),
            save_map_on_shutdown: overrides
                .save_map_on_shutdown
                .unwrap_or(args.save_map_on_shutdown),
            save_sensor_resources: overrides
                .save_sensor_resources
                .unwrap_or(args.save_sensor_resources),
            sensor_log: overrides.sensor_log.unwrap_or(args.sensor_log),
            control_port: overrides.control_port.unwrap_or(args.control_port),
            worker_threads: overrides.worker_threads.unwrap_or(args.worker_threads),
        }
    }

    /// Worker count with the hardware-parallelism fallback applied.
    pub fn effective_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            self.worker_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
        }
    }
}
