//! # USB Battery Charger Control Library
//!
//! A Rust library for driving a USB serial DAC-controlled battery charger.
//! The device streams oversampled ADC readings of the charging circuit; this
//! library turns them into calibrated voltage/current telemetry and runs the
//! charge control loop (CC/CV staging, in-band internal-resistance
//! measurement, completion detection and safety braking) on the host.
//!
//! ## Features
//!
//! - Framed binary command protocol with automatic device discovery
//! - Outlier-rejecting oversampling and VRefInt-based VDDA calibration
//! - CC/CV charge state machine with NiMH voltage-decline detection
//! - DC internal-resistance measurement without interrupting the session
//! - Diagnostic DAC scan mode and an event stream for UI integration
//!
//! ## Example
//!
//! ```no_run
//! use usb_battery_charger::{ChargeController, ChargeState};
//!
//! fn main() {
//!     let controller = ChargeController::new();
//!     loop {
//!         let status = controller.control_status();
//!         if status.state == ChargeState::BatteryConnected {
//!             controller.start_charging();
//!             break;
//!         }
//!         std::thread::sleep(std::time::Duration::from_millis(500));
//!     }
//! }
//! ```

pub mod config;
pub mod constants;
pub mod controller;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod types;

pub use config::{load_config, load_or_default, save_config, save_if_changed};
pub use controller::{ChargeController, EventCallback};
pub use error::{ChargerError, Result};
pub use transport::Transport;
pub use types::*;
