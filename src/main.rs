//! Monitor binary: connect to a station (or the virtual one) and log the
//! event streams until interrupted.

use log::{error, info, warn};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use trackio::config::ControllerConfig;
use trackio::{CsController, Result};

/// Config path from `--config <path>`, `-c <path>` or a bare positional
fn parse_config_path() -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => return args.next(),
            _ if !arg.starts_with('-') => return Some(arg),
            other => warn!("Ignoring unknown argument {other}"),
        }
    }
    None
}

fn run() -> Result<()> {
    let config = match parse_config_path() {
        Some(path) => {
            info!("Loading configuration from {path}");
            ControllerConfig::from_file(&path)?
        }
        None => {
            info!("No configuration given, using the virtual station");
            ControllerConfig::virtual_defaults()
        }
    };
    let auto_connect = config.connection.auto_connect;

    let controller = CsController::new(config)?;
    let bus = controller.events();
    bus.power
        .subscribe(|e| info!("Power: {:?}", e.state));
    bus.sensor.subscribe(|e| {
        info!(
            "Sensor {}:{} {} -> {} ({} ms)",
            e.device_id, e.contact, e.previous, e.status, e.elapsed_ms
        )
    });
    bus.accessory
        .subscribe(|e| info!("Accessory {} -> {:?}", e.address, e.value));
    bus.loc_speed
        .subscribe(|e| info!("Loc {:#010x} speed {}", e.uid, e.speed));
    bus.measurement.subscribe(|e| match e.value {
        Some(value) => info!("{} = {:.1} {}", e.name, value, e.unit),
        None => info!("{} = {} (raw)", e.name, e.raw),
    });
    bus.disconnection
        .subscribe(|e| warn!("Connection lost: {}", e.reason));

    if auto_connect {
        controller.connect()?;
        for device in controller.devices() {
            info!(
                "Device {:#010x}: {} ({}, article {}, v{})",
                device.uid,
                device.name,
                device.type_name,
                device.article,
                device.version_string()
            );
        }
    }

    let term = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&term))?;
    }
    while !term.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(200));
    }

    info!("Shutting down");
    controller.disconnect();
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = run() {
        error!("{e}");
        std::process::exit(1);
    }
}
