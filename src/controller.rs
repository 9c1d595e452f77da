//! Session lifecycle controller.
//!
//! Owns the fusion engine, the save coordinator, and the control endpoint,
//! and drives the session state machine:
//!
//! ```text
//! Created -> Initialized -> Running -> Draining -> Terminated
//! ```
//!
//! `init()` resolves everything that can fail up front - calibration, IMU
//! parameters, the localization map, the save-folder allocation - so a bad
//! configuration is rejected before any processing starts. Shutdown is
//! ordered: stop the engine, drain its buffered frames, then stop the control
//! endpoint (waiting out any in-flight save).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::calibration::{CameraRig, ImuParameters, ImuSigmas};
use crate::config::EffectiveConfig;
use crate::control::ControlServer;
use crate::engine::{FusionEngine, SensorLogSource};
use crate::error::{DrishtiError, Result};
use crate::map::load_localization_map;
use crate::saver::{SaveCoordinator, allocate_save_folder};

/// Controller lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Initialized,
    Running,
    Draining,
    Terminated,
}

/// Drives one mapping session from configuration to termination.
pub struct SessionController {
    config: EffectiveConfig,
    state: SessionState,
    resolved_save_folder: Option<PathBuf>,
    engine: Option<FusionEngine>,
    coordinator: Option<Arc<SaveCoordinator>>,
    control_server: Option<ControlServer>,
    control_running: Arc<AtomicBool>,
}

impl SessionController {
    pub fn new(config: EffectiveConfig) -> Self {
        Self {
            config,
            state: SessionState::Created,
            resolved_save_folder: None,
            engine: None,
            coordinator: None,
            control_server: None,
            control_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Folder saves will be written to, fixed for the session at `init()`.
    pub fn resolved_save_folder(&self) -> Option<&Path> {
        self.resolved_save_folder.as_deref()
    }

    /// Address of the control endpoint once the session is running.
    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.control_server.as_ref().map(|s| s.local_addr())
    }

    /// Load calibration and maps, allocate the save target, and construct
    /// the engine. Fails without a state change on any invalid input.
    pub fn init(&mut self) -> Result<()> {
        if self.state != SessionState::Created {
            return Err(DrishtiError::Engine("Session already initialized".to_string()));
        }

        if self.config.save_sensor_resources && self.config.save_map_folder.is_empty() {
            return Err(DrishtiError::Config(
                "Saving sensor resources requires a save folder; set --save-map-folder"
                    .to_string(),
            ));
        }
        if self.config.sensor_log.is_empty() {
            return Err(DrishtiError::Config(
                "No sensor log configured; set --sensor-log".to_string(),
            ));
        }

        // Optional localization map, with the full-map fallback inside.
        let localization_map = if self.config.localization_map_folder.is_empty() {
            None
        } else {
            Some(load_localization_map(Path::new(
                &self.config.localization_map_folder,
            ))?)
        };

        let rig = CameraRig::load(Path::new(&self.config.camera_calibration))?;
        let imu = ImuParameters::load(Path::new(&self.config.imu_parameters))?;

        // External override replaces only the estimator-facing sigmas.
        let estimator_sigmas = if self.config.external_imu_parameters.is_empty() {
            imu.sigmas
        } else {
            let sigmas = ImuSigmas::load(Path::new(&self.config.external_imu_parameters))?;
            log::info!(
                "Estimator IMU sigmas overridden from {}",
                self.config.external_imu_parameters
            );
            sigmas
        };

        // Allocated exactly once; every save in this session targets it.
        self.resolved_save_folder = allocate_save_folder(
            &self.config.save_map_folder,
            self.config.overwrite_existing_map,
        );
        match &self.resolved_save_folder {
            Some(folder) => log::info!("Maps will be saved to {:?}", folder),
            None => log::info!("No save folder configured; saving is disabled"),
        }

        let resource_folder = if self.config.save_sensor_resources {
            self.resolved_save_folder
                .as_ref()
                .map(|folder| folder.join("resources"))
        } else {
            None
        };

        let engine = FusionEngine::new(
            rig,
            imu,
            estimator_sigmas,
            localization_map,
            self.config.effective_worker_threads(),
            resource_folder,
        );
        log::info!(
            "Session initialized: {} cameras, IMU @ {}Hz, gyro noise {}",
            engine.camera_count(),
            engine.imu_rate_hz(),
            engine.estimator_sigmas().gyro_noise_density
        );

        self.coordinator = Some(Arc::new(SaveCoordinator::new(
            engine.map_handle(),
            self.resolved_save_folder.clone(),
            self.config.optimize_map_on_save,
        )));
        self.engine = Some(engine);
        self.state = SessionState::Initialized;
        Ok(())
    }

    /// Start the engine and the control endpoint. Must be called exactly
    /// once, after `init()`.
    pub fn start(&mut self) -> Result<()> {
        if self.state != SessionState::Initialized {
            return Err(DrishtiError::Engine(format!(
                "start() requires an initialized session (state: {:?})",
                self.state
            )));
        }

        let source = SensorLogSource::open(Path::new(&self.config.sensor_log))?;
        let engine = self
            .engine
            .as_mut()
            .ok_or_else(|| DrishtiError::Engine("Engine missing after init".to_string()))?;
        engine.start(source)?;

        let coordinator = self
            .coordinator
            .as_ref()
            .ok_or_else(|| DrishtiError::Engine("Coordinator missing after init".to_string()))?;
        self.control_running.store(true, Ordering::SeqCst);
        self.control_server = Some(ControlServer::spawn(
            self.config.control_port,
            coordinator.clone(),
            self.control_running.clone(),
        )?);

        self.state = SessionState::Running;
        log::info!("Session running");
        Ok(())
    }

    /// Read-only handle to the engine's exhaustion flag.
    pub fn exit_flag(&self) -> Result<Arc<AtomicBool>> {
        self.engine
            .as_ref()
            .map(|e| e.exhausted_flag())
            .ok_or_else(|| DrishtiError::Engine("Session not initialized".to_string()))
    }

    /// Persist the current map to the cached save folder. Returns `false`
    /// when no folder is configured. Safe to call at any time after
    /// `init()`, concurrently with the control endpoint and with shutdown.
    pub fn save_now(&self) -> bool {
        match &self.coordinator {
            Some(coordinator) => coordinator.request_save(),
            None => {
                log::warn!("Save requested before initialization");
                false
            }
        }
    }

    /// Drain and terminate the session: stop the engine, process every
    /// buffered frame, then stop the control endpoint. Returns only when all
    /// session threads have finished, including any in-flight save.
    pub fn shutdown(&mut self) {
        match self.state {
            SessionState::Running | SessionState::Draining => {}
            SessionState::Terminated => return,
            _ => {
                log::warn!("shutdown() before start; nothing to drain");
                self.state = SessionState::Terminated;
                return;
            }
        }

        self.state = SessionState::Draining;
        log::info!("Session draining...");

        if let Some(engine) = self.engine.as_mut() {
            engine.stop();
            engine.wait_until_idle();
        }

        self.control_running.store(false, Ordering::SeqCst);
        if let Some(server) = self.control_server.take()
            && server.join().is_err()
        {
            log::error!("Control thread panicked");
        }

        self.state = SessionState::Terminated;
        log::info!("Session terminated");
    }
}
