//! Camera rig and IMU calibration loading.
//!
//! Calibration files are YAML. Loading validates the values immediately so
//! that a bad file fails the session at initialization instead of partway
//! through processing.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DrishtiError, Result};

/// Intrinsics of a single camera in the rig.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Focal length [fx, fy] in pixels.
    pub focal: [f64; 2],
    /// Principal point [cx, cy] in pixels.
    pub principal: [f64; 2],
    /// Radial/tangential distortion coefficients.
    #[serde(default)]
    pub distortion: Vec<f64>,
}

impl CameraIntrinsics {
    fn validate(&self, index: usize) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(DrishtiError::Calibration(format!(
                "Camera {} has zero image dimensions",
                index
            )));
        }
        if self.focal.iter().any(|f| !f.is_finite() || *f <= 0.0) {
            return Err(DrishtiError::Calibration(format!(
                "Camera {} has invalid focal length {:?}",
                index, self.focal
            )));
        }
        Ok(())
    }
}

/// Calibrated multi-camera rig.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraRig {
    /// Rig label for logging.
    #[serde(default)]
    pub label: String,
    /// Cameras in the rig (at least one).
    pub cameras: Vec<CameraIntrinsics>,
}

impl CameraRig {
    /// Load and validate a camera rig calibration from YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            DrishtiError::Calibration(format!(
                "Could not read camera calibration {:?}: {}",
                path, e
            ))
        })?;
        let rig: CameraRig = serde_yaml::from_str(&content)?;
        rig.validate()?;
        Ok(rig)
    }

    fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(DrishtiError::Calibration(
                "Camera rig has no cameras".to_string(),
            ));
        }
        for (i, camera) in self.cameras.iter().enumerate() {
            camera.validate(i)?;
        }
        Ok(())
    }
}

/// Continuous-time IMU noise parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ImuSigmas {
    /// Gyroscope noise density (rad/s/sqrt(Hz)).
    pub gyro_noise_density: f64,
    /// Gyroscope bias random walk (rad/s^2/sqrt(Hz)).
    pub gyro_bias_random_walk: f64,
    /// Accelerometer noise density (m/s^2/sqrt(Hz)).
    pub accel_noise_density: f64,
    /// Accelerometer bias random walk (m/s^3/sqrt(Hz)).
    pub accel_bias_random_walk: f64,
}

impl ImuSigmas {
    /// All sigmas must be finite and strictly positive.
    pub fn is_valid(&self) -> bool {
        [
            self.gyro_noise_density,
            self.gyro_bias_random_walk,
            self.accel_noise_density,
            self.accel_bias_random_walk,
        ]
        .iter()
        .all(|s| s.is_finite() && *s > 0.0)
    }

    /// Load standalone estimator sigmas from YAML (the external override
    /// file carries only the noise parameters, not the full IMU block).
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            DrishtiError::Calibration(format!("Could not read IMU sigmas {:?}: {}", path, e))
        })?;
        let sigmas: ImuSigmas = serde_yaml::from_str(&content)?;
        if !sigmas.is_valid() {
            return Err(DrishtiError::Calibration(format!(
                "Invalid IMU sigmas in {:?}",
                path
            )));
        }
        Ok(sigmas)
    }
}

/// Full IMU parameter block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImuParameters {
    /// Sensor label for logging.
    #[serde(default)]
    pub label: String,
    /// Sample rate in Hz.
    pub rate_hz: f64,
    /// Noise parameters.
    pub sigmas: ImuSigmas,
}

impl ImuParameters {
    /// Load and validate IMU parameters from YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            DrishtiError::Calibration(format!("Could not read IMU parameters {:?}: {}", path, e))
        })?;
        let params: ImuParameters = serde_yaml::from_str(&content)?;
        if !params.rate_hz.is_finite() || params.rate_hz <= 0.0 {
            return Err(DrishtiError::Calibration(format!(
                "Invalid IMU rate {} in {:?}",
                params.rate_hz, path
            )));
        }
        if !params.sigmas.is_valid() {
            return Err(DrishtiError::Calibration(format!(
                "Invalid IMU sigmas in {:?}",
                path
            )));
        }
        Ok(params)
    }
}
