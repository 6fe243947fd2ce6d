//! Charge Cycle Example
//!
//! This example demonstrates the core functionality of the charger library:
//! - Automatic device discovery and connection
//! - Loading the hardware configuration from a JSON file
//! - Subscribing to control-loop events
//! - Running a full charging session with live status output
//!
//! Usage:
//!   cargo run --example charge_cycle                  # Defaults: 0.15 A / 1.35 V
//!   cargo run --example charge_cycle -- 0.3 1.45      # Current (A), voltage (V)
//!
//! Set RUST_LOG environment variable to control logging:
//!   RUST_LOG=debug cargo run --example charge_cycle
//!   RUST_LOG=info cargo run --example charge_cycle

use log::info;
use std::sync::mpsc;
use std::time::Duration;
use usb_battery_charger::{
    load_or_default, ChargeController, ChargeEvent, ChargeParameters, ChargeState,
};

const CONFIG_PATH: &str = "charger-config.json";

fn main() {
    // Initialize logger with default info level if RUST_LOG is not set
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Optional current/voltage targets from the command line
    let mut args = std::env::args().skip(1);
    let mut param = ChargeParameters::default();
    if let Some(cur) = args.next().and_then(|s| s.parse().ok()) {
        param.exp_current = cur;
    }
    if let Some(vol) = args.next().and_then(|s| s.parse().ok()) {
        param.exp_voltage = vol;
    }

    let conf = load_or_default(CONFIG_PATH);
    info!(
        "Configured for {:.1} V supply, {:.0} mA max",
        conf.v_ext_power,
        conf.i_max * 1000.0
    );

    let controller = ChargeController::with_config(conf, param);

    // Forward events to this thread; NewData fires on every frame, so keep
    // only the interesting ones
    let (tx, rx) = mpsc::channel();
    controller.set_event_callback(Box::new(move |ev| {
        if ev != ChargeEvent::NewData {
            let _ = tx.send(ev);
        }
    }));

    info!("Waiting for the charger device...");
    loop {
        match rx.recv() {
            Ok(ChargeEvent::DeviceConnect) => info!("✓ Device connected"),
            Ok(ChargeEvent::BatteryConnect) => {
                info!("✓ Battery detected, starting charge");
                if !controller.start_charging() {
                    info!("✗ Start rejected, waiting");
                }
            }
            Ok(ChargeEvent::BatteryDisconnect) => info!("Battery removed"),
            Ok(ChargeEvent::DeviceDisconnect) => info!("Device lost, retrying..."),
            Ok(ChargeEvent::ChargeBrake) => {
                info!("✗ Emergency brake engaged");
                break;
            }
            Ok(ChargeEvent::ChargeComplete) => {
                info!("✓ Charge complete");
                break;
            }
            Ok(_) => {}
            Err(_) => break,
        }

        // Print a status block while a session is running
        let status = controller.control_status();
        if status.state.is_charging() {
            println!("{status}");
        }
        std::thread::sleep(Duration::from_secs(2));
    }

    let status = controller.control_status();
    if status.state == ChargeState::Completed {
        println!("Final report:\n{status}");
    }
}
