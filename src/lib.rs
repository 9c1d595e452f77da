//! DrishtiVIO - visual-inertial mapping session daemon.
//!
//! Turns a static configuration into a running sensor-processing session:
//! calibration and IMU parameters are resolved once, a fusion engine consumes
//! a recorded sensor log through a worker pool, and the accumulated map can
//! be persisted - from a TCP control endpoint, on demand, or automatically at
//! shutdown - with all saves serialized through one coordinator.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                      main                           │  ← Entry point
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                   controller                        │  ← Lifecycle state machine
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌──────────────┬──────────────────┬───────────────────┐
//! │    engine    │      saver       │      control      │  ← Session services
//! │ (worker pool)│ (serialized save)│  (TCP endpoint)   │
//! └──────────────┴──────────────────┴───────────────────┘
//!                          │
//! ┌──────────────┬──────────────────┬───────────────────┐
//! │    config    │   calibration    │        map        │  ← Foundation
//! └──────────────┴──────────────────┴───────────────────┘
//! ```
//!
//! # Threads
//!
//! The daemon runs with a fixed thread layout:
//! - `ingest`: reads the sensor log, feeds the frame channel, latches the
//!   exhaustion flag at end of log
//! - `fusion-N`: worker pool (hardware parallelism by default) integrating
//!   frames into the shared map
//! - `control`: serves the "save map" endpoint
//! - main: bounded poll on the exhaustion flag, then ordered shutdown

// Foundation (no internal deps)
pub mod calibration;
pub mod config;
pub mod error;
pub mod map;

// Session services
pub mod control;
pub mod engine;
pub mod saver;

// Lifecycle orchestration
pub mod controller;

// Convenience re-exports
pub use config::{Args, EffectiveConfig, Overrides};
pub use controller::{SessionController, SessionState};
pub use engine::{EngineState, FusionEngine, MapBuilder, SensorFrame, SensorLogSource};
pub use error::{DrishtiError, Result};
pub use map::{FullMap, Landmark, LocalizationSummaryMap};
pub use saver::{SaveCoordinator, allocate_save_folder};
