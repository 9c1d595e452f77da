//! End-to-end session tests.
//!
//! These drive the controller through a full init -> start -> exhaustion ->
//! shutdown cycle against real files in a temp directory, exercising the
//! control endpoint and both save representations.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use drishti_vio::config::EffectiveConfig;
use drishti_vio::controller::{SessionController, SessionState};
use drishti_vio::map::{FullMap, LocalizationSummaryMap};

const RIG_YAML: &str = "\
label: test-rig
cameras:
  - width: 640
    height: 480
    focal: [450.0, 450.0]
    principal: [320.0, 240.0]
";

const IMU_YAML: &str = "\
label: test-imu
rate_hz: 200.0
sigmas:
  gyro_noise_density: 0.005
  gyro_bias_random_walk: 4.0e-6
  accel_noise_density: 0.01
  accel_bias_random_walk: 0.0002
";

const IMU_RECORDS: u64 = 90;
const FRAME_RECORDS: u64 = 30;

/// Write calibration files and a sensor log with a known record count.
fn write_fixtures(dir: &Path) -> EffectiveConfig {
    std::fs::write(dir.join("rig.yaml"), RIG_YAML).unwrap();
    std::fs::write(dir.join("imu.yaml"), IMU_YAML).unwrap();

    let mut log_file = std::fs::File::create(dir.join("session.log")).unwrap();
    let mut t = 1_000_000u64;
    for i in 0..IMU_RECORDS {
        writeln!(log_file, "imu {} 0.0 0.0 0.02 0.2 0.0 9.9", t).unwrap();
        t += 5_000;
        if i % 3 == 0 && i / 3 < FRAME_RECORDS {
            writeln!(log_file, "frame {} 0", t).unwrap();
            t += 5_000;
        }
    }

    EffectiveConfig {
        localization_map_folder: String::new(),
        camera_calibration: dir.join("rig.yaml").to_str().unwrap().to_string(),
        imu_parameters: dir.join("imu.yaml").to_str().unwrap().to_string(),
        external_imu_parameters: String::new(),
        save_map_folder: dir.join("out").to_str().unwrap().to_string(),
        overwrite_existing_map: false,
        optimize_map_on_save: false,
        save_map_on_shutdown: true,
        save_sensor_resources: false,
        sensor_log: dir.join("session.log").to_str().unwrap().to_string(),
        control_port: 0,
        worker_threads: 2,
    }
}

fn wait_for_exhaustion(controller: &SessionController) {
    let flag = controller.exit_flag().unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while !flag.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "sensor log never exhausted");
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Issue a save over the control endpoint and return the reported result.
fn request_save_over_tcp(port: u16) -> bool {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let body = br#"{"command":"save_map"}"#;
    let mut frame = Vec::new();
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    stream.write_all(&frame).unwrap();

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).unwrap();
    let mut response = vec![0u8; u32::from_be_bytes(len_buf) as usize];
    stream.read_exact(&mut response).unwrap();
    serde_json::from_slice::<serde_json::Value>(&response).unwrap()["ok"]
        .as_bool()
        .unwrap()
}

#[test]
fn full_session_processes_log_and_saves_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = write_fixtures(dir.path());
    config.save_sensor_resources = true;

    let mut controller = SessionController::new(config);
    controller.init().unwrap();
    assert_eq!(controller.state(), SessionState::Initialized);

    controller.start().unwrap();
    assert_eq!(controller.state(), SessionState::Running);

    wait_for_exhaustion(&controller);
    controller.shutdown();
    assert_eq!(controller.state(), SessionState::Terminated);

    // Shutdown-time save, as the host loop performs it.
    assert!(controller.save_now());

    let folder = controller.resolved_save_folder().unwrap();
    let map = FullMap::load_from_folder(folder).unwrap();
    assert_eq!(map.imu_sample_count, IMU_RECORDS);
    assert_eq!(map.frame_count, FRAME_RECORDS);
    assert_eq!(map.landmarks.len(), (FRAME_RECORDS / 5) as usize);
    assert!(map.trajectory_length_m > 0.0);

    // Auxiliary resources were recorded alongside the map.
    let resources = std::fs::read_to_string(folder.join("resources").join("frames.log")).unwrap();
    assert_eq!(resources.lines().count(), (IMU_RECORDS + FRAME_RECORDS) as usize);
}

#[test]
fn control_endpoint_saves_during_processing() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_fixtures(dir.path());

    let mut controller = SessionController::new(config);
    controller.init().unwrap();
    controller.start().unwrap();

    // The endpoint is live while the session runs; a save succeeds and the
    // folder holds a loadable map even though processing may continue.
    let port = controller.control_addr().unwrap().port();
    assert!(request_save_over_tcp(port));
    let folder = controller.resolved_save_folder().unwrap().to_path_buf();
    assert!(FullMap::load_from_folder(&folder).is_ok());

    wait_for_exhaustion(&controller);
    controller.shutdown();

    // A later save overwrites the same resolved folder with the final state.
    assert!(controller.save_now());
    let final_map = FullMap::load_from_folder(&folder).unwrap();
    assert_eq!(final_map.imu_sample_count, IMU_RECORDS);
}

#[test]
fn optimized_session_saves_localization_summary() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = write_fixtures(dir.path());
    config.optimize_map_on_save = true;

    let mut controller = SessionController::new(config);
    controller.init().unwrap();
    controller.start().unwrap();
    wait_for_exhaustion(&controller);
    controller.shutdown();

    assert!(controller.save_now());
    let folder = controller.resolved_save_folder().unwrap();
    let summary = LocalizationSummaryMap::load_from_folder(folder).unwrap();
    assert_eq!(summary.landmark_positions.len(), (FRAME_RECORDS / 5) as usize);
}

#[test]
fn session_reuses_saved_map_for_localization() {
    let dir = tempfile::tempdir().unwrap();

    // First session: build and save an optimized map.
    let mut config = write_fixtures(dir.path());
    config.optimize_map_on_save = true;
    let mut first = SessionController::new(config);
    first.init().unwrap();
    first.start().unwrap();
    wait_for_exhaustion(&first);
    first.shutdown();
    assert!(first.save_now());
    let saved_folder = first.resolved_save_folder().unwrap().to_path_buf();

    // Second session localizes against it and saves elsewhere.
    let mut config = write_fixtures(dir.path());
    config.localization_map_folder = saved_folder.to_str().unwrap().to_string();
    config.save_map_folder = dir.path().join("second").to_str().unwrap().to_string();
    let mut second = SessionController::new(config);
    second.init().unwrap();
    second.start().unwrap();
    wait_for_exhaustion(&second);
    second.shutdown();
    assert!(second.save_now());
}

#[test]
fn save_issued_around_shutdown_completes() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_fixtures(dir.path());

    let mut controller = SessionController::new(config);
    controller.init().unwrap();
    controller.start().unwrap();
    let port = controller.control_addr().unwrap().port();
    let folder = controller.resolved_save_folder().unwrap().to_path_buf();

    // Fire a save from the external trigger while the host begins shutdown.
    let client = std::thread::spawn(move || request_save_over_tcp(port));
    std::thread::sleep(Duration::from_millis(200));
    controller.shutdown();

    // The in-flight save was allowed to finish and reported its result;
    // shutdown did not tear it down mid-write.
    assert!(client.join().unwrap());
    assert_eq!(controller.state(), SessionState::Terminated);
    assert!(FullMap::load_from_folder(&folder).is_ok());
}
