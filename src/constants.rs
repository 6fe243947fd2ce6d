//! Protocol constants for the USB ADC/DAC charger device.
//!
//! Every value in this module is part of the compatibility contract with the
//! device firmware and must match it bit-for-bit: headers, command IDs,
//! status codes and timing limits.

/// Magic header starting every command and response (wire order: ff ff 00 00).
pub const PROTOCOL_HEADER: u32 = 0x0000_ffff;

/// Secondary magic carried by the capability-query response. Guards against
/// a device that happens to speak a compatible-looking framing but is not
/// the charger firmware.
pub const PROTOCOL_KEY: u32 = 0x2022_0914;

/// Synchronization header preceding every telemetry frame (wire order: ee ff ff ff).
pub const DATA_HEADER: u32 = 0xffff_ffee;

/// Length of the telemetry sync header in bytes.
pub const DATA_HEADER_LEN: usize = 4;

/// Capability query: the device answers with [`crate::protocol::HardwareCaps`].
pub const CMD_ID_CHECK: u8 = 0x01;

/// Start continuous ADC conversion and telemetry streaming.
pub const CMD_ID_ADC_START: u8 = 0x02;

/// Stop ADC conversion and telemetry streaming.
pub const CMD_ID_ADC_STOP: u8 = 0x03;

/// Set the PWM/DAC output level.
pub const CMD_ID_PWM_DAC: u8 = 0x04;

/// Force the output stage off.
pub const CMD_ID_DISABLE_OUTPUT: u8 = 0x05;

/// Watchdog keep-alive. The device disables its output autonomously when
/// it stops arriving; see [`SHAKE_INTERVAL_MAX_MS`].
pub const CMD_ID_SHAKE: u8 = 0x06;

/// Unlock the output stage after a protection trip.
pub const CMD_ID_UNLOCK: u8 = 0xfe;

/// Reset the microcontroller.
pub const CMD_ID_RESET: u8 = 0xff;

/// Response status: command accepted.
pub const RESP_OK: u8 = 0x00;

/// Response status: command rejected by the device.
pub const RESP_FAILED: u8 = 0x01;

/// Full-scale raw code of the 12-bit ADC.
pub const ADC_RAW_VALUE_MAX: u16 = 4095;

/// Full-scale raw code of the 12-bit DAC.
pub const DAC_RAW_VALUE_MAX: u16 = 4095;

/// Maximum wait for a command response (ms).
pub const TIMEOUT_COMM_MAX_MS: u64 = 500;

/// Extra margin over the bulk interval when waiting for a telemetry frame (ms).
pub const TIMEOUT_DATA_MAX_MS: u64 = 1000;

/// Device-side watchdog: output is disabled autonomously when no shake
/// command arrives within this interval (ms).
pub const SHAKE_INTERVAL_MAX_MS: u64 = 10_000;

/// Baud rate of the virtual serial port.
pub const BAUD_RATE: u32 = 9600;

/// Number of command write/read attempts before giving up.
pub const CMD_RETRY_COUNT: u32 = 5;

/// Desired raw sample interval handed to the sample-time chooser at
/// connect time (ms). Far above any real option, so the slowest
/// hardware-supported sample time is selected.
pub const RAW_DATA_INTERVAL_MS: f32 = 100.0;

/// Raw samples folded into one first-stage average.
pub const DATA_AMOUNT_PER_AV_FIRST: usize = 128;

/// Oversampling tolerance radius in raw ADC counts.
pub const OVERSAMPLING_RADIUS: f32 = 8.0;

/// Depth of the rolling VDDA estimation buffer.
pub const VDDA_BUF_DEPTH: usize = 64;
