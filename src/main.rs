//! drishti-vio - visual-inertial mapping session daemon.
//!
//! Entry point: resolve configuration, initialize and start the session,
//! poll the exhaustion signal, then drain and optionally save the map.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;

use drishti_vio::config::{Args, EffectiveConfig, Overrides};
use drishti_vio::controller::SessionController;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {} - {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let args = Args::parse();
    let overrides = match &args.config {
        Some(path) => match Overrides::load(Path::new(path)) {
            Ok(overrides) => {
                log::info!("Loaded config overrides from {}", path);
                overrides
            }
            Err(e) => {
                log::error!("Failed to load config {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => Overrides::default(),
    };
    let config = EffectiveConfig::resolve(args, overrides);

    log::info!("drishti-vio starting");
    log::info!("  Sensor log: {}", config.sensor_log);
    if config.save_map_folder.is_empty() {
        log::info!("  Saving: disabled");
    } else {
        log::info!(
            "  Save folder: {} (overwrite: {}, optimize: {}, on shutdown: {})",
            config.save_map_folder,
            config.overwrite_existing_map,
            config.optimize_map_on_save,
            config.save_map_on_shutdown
        );
    }
    log::info!("  Control port: {}", config.control_port);
    log::info!("  Workers: {}", config.effective_worker_threads());

    let save_map_on_shutdown = config.save_map_on_shutdown;
    let mut controller = SessionController::new(config);

    if let Err(e) = controller.init() {
        log::error!("Failed to initialize the session: {}", e);
        std::process::exit(1);
    }
    if let Err(e) = controller.start() {
        log::error!("Failed to start the session: {}", e);
        std::process::exit(1);
    }

    // Setup signal handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        r.store(false, Ordering::Relaxed);
    })
    .expect("Error setting Ctrl-C handler");

    let exhausted = match controller.exit_flag() {
        Ok(flag) => flag,
        Err(e) => {
            log::error!("Session has no exit signal: {}", e);
            std::process::exit(1);
        }
    };

    // Bounded poll on the level-triggered exhaustion signal.
    while running.load(Ordering::Relaxed) && !exhausted.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    controller.shutdown();

    if save_map_on_shutdown {
        if controller.save_now() {
            log::info!("Final map saved");
        } else {
            log::warn!("Final map save skipped (no folder configured or save failed)");
        }
    }

    log::info!("drishti-vio shutdown complete");
}
