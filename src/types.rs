//! Data model for the charge controller: configuration, per-session
//! parameters, live status and the state/event vocabulary.

use chrono::{DateTime, Duration as ChronoDuration, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

use crate::error::{ChargerError, Result};

/// Convert a monotonic timestamp to wall-clock time for display.
pub fn to_wall_clock(t: Instant) -> DateTime<Local> {
    let elapsed = ChronoDuration::from_std(t.elapsed()).unwrap_or_else(|_| ChronoDuration::zero());
    Local::now() - elapsed
}

/// Charge control state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeState {
    /// No device connection; the controller retries periodically.
    DeviceDisconnected,
    /// Device connected, no battery detected in the slot.
    BatteryDisconnected,
    /// Battery present, idle.
    BatteryConnected,
    /// Diagnostic DAC ramp in progress.
    DacScanning,
    /// Constant-current charge stage.
    ChargingCc,
    /// Constant-voltage charge stage.
    ChargingCv,
    /// Charge finished on a completion criterion.
    Completed,
    /// Charge ended early (manual stop, safety brake or connection loss).
    Stopped,
}

impl ChargeState {
    /// True in either charging stage.
    pub fn is_charging(self) -> bool {
        matches!(self, ChargeState::ChargingCc | ChargeState::ChargingCv)
    }
}

impl fmt::Display for ChargeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChargeState::DeviceDisconnected => "Device disconnected",
            ChargeState::BatteryDisconnected => "Battery disconnected",
            ChargeState::BatteryConnected => "Battery connected",
            ChargeState::DacScanning => "DAC scanning",
            ChargeState::ChargingCc => "Charging (CC)",
            ChargeState::ChargingCv => "Charging (CV)",
            ChargeState::Completed => "Charge completed",
            ChargeState::Stopped => "Charge stopped",
        };
        f.write_str(s)
    }
}

/// Why the last charging session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopCause {
    /// No session has ended yet.
    #[default]
    None,
    /// Operator requested a stop.
    Manual,
    /// Overcurrent or overpower emergency brake.
    Brake,
    /// Smoothed voltage reached the expected terminal voltage.
    VoltageReached,
    /// Open-circuit voltage reached its expected value.
    OpenCircuitVoltage,
    /// Sustained voltage decline below the running maximum (NiMH saturation).
    VoltageDecline,
    /// Accumulated charge reached the expected quantity.
    ChargeReached,
    /// The session time limit elapsed.
    TimeLimit,
    /// CV-stage current fell below the configured minimum.
    CurrentBelowMin,
    /// Battery removed while charging.
    BatteryLost,
    /// Device connection lost while charging.
    DeviceLost,
}

/// Events emitted by the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeEvent {
    DeviceConnect,
    DeviceDisconnect,
    BatteryConnect,
    BatteryDisconnect,
    /// One telemetry-derived status update has been applied.
    NewData,
    /// The diagnostic DAC ramp finished or was stopped.
    ScanComplete,
    ChargeComplete,
    /// Charging stopped by the emergency brake.
    ChargeBrake,
}

/// Operator-tunable hardware configuration, persisted across runs.
///
/// Every field has a validated numeric range; a rejected write leaves the
/// previous configuration unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChargeControlConfig {
    /// On-chip stable reference voltage (V); 0 means "use the value the
    /// device reports". Calibratable against an external voltmeter.
    pub v_refint: f32,
    /// Charge supply voltage (V).
    pub v_ext_power: f32,
    /// Voltage-divider ratio for the channel sensing v_supply − v_battery.
    pub div_prop: f32,
    /// Current-sampling shunt resistance (Ohm).
    pub r_samp: f32,
    /// Extra resistance of the battery and supply connections (Ohm).
    pub r_extra: f32,
    /// Maximum current through the battery and pass transistor (A).
    pub i_max: f32,
    /// Maximum pass-transistor dissipation (W).
    pub p_mos_max: f32,
    /// Battery-detection voltage threshold (V).
    pub v_bat_detect_th: f32,
    /// Minimum DAC output adjustment step (V).
    pub v_dac_adj_step: f32,
    /// Voltage-decline detection threshold (V), for NiMH chemistries.
    pub v_bat_dec_th: f32,
}

impl Default for ChargeControlConfig {
    fn default() -> Self {
        ChargeControlConfig {
            v_refint: 0.0,
            v_ext_power: 5.0,
            div_prop: 5.6 / (3.0 + 5.6),
            r_samp: 0.33,
            r_extra: 0.0,
            i_max: 0.5,
            p_mos_max: 2.0,
            v_bat_detect_th: 0.4,
            v_dac_adj_step: 0.001,
            v_bat_dec_th: 0.002,
        }
    }
}

impl ChargeControlConfig {
    /// Check all fields against their valid ranges.
    pub fn validate(&self) -> Result<()> {
        let check = |ok: bool, what: &str| -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(ChargerError::InvalidConfig(what.to_string()))
            }
        };
        check(
            self.v_refint == 0.0 || (0.1..=4.8).contains(&self.v_refint),
            "v_refint outside 0.1..4.8 V",
        )?;
        check(
            (0.5..=36.0).contains(&self.v_ext_power),
            "v_ext_power outside 0.5..36 V",
        )?;
        check(
            self.div_prop > 0.0 && self.div_prop <= 1.0,
            "div_prop outside 0..1",
        )?;
        check(
            self.r_samp > 0.0 && self.r_samp <= 100.0,
            "r_samp outside 0..100 Ohm",
        )?;
        check(
            (0.0..=100.0).contains(&self.r_extra),
            "r_extra outside 0..100 Ohm",
        )?;
        check(self.i_max > 0.0 && self.i_max <= 10.0, "i_max outside 0..10 A")?;
        check(
            self.p_mos_max > 0.0 && self.p_mos_max <= 100.0,
            "p_mos_max outside 0..100 W",
        )?;
        check(
            self.v_bat_detect_th > 0.0 && self.v_bat_detect_th < self.v_ext_power,
            "v_bat_detect_th outside 0..v_ext_power",
        )?;
        check(
            self.v_dac_adj_step > 0.0 && self.v_dac_adj_step <= 0.1,
            "v_dac_adj_step outside 0..0.1 V",
        )?;
        check(
            self.v_bat_dec_th > 0.0 && self.v_bat_dec_th <= 0.1,
            "v_bat_dec_th outside 0..0.1 V",
        )?;
        Ok(())
    }
}

/// Per-session charge targets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChargeParameters {
    /// Expected constant-current stage current (A).
    pub exp_current: f32,
    /// Expected terminal (closed-circuit) voltage (V).
    pub exp_voltage: f32,
    /// Expected open-circuit voltage (V), compared once internal
    /// resistance has been measured.
    pub exp_voltage_oc: f32,
    /// Expected charge quantity (C).
    pub exp_charge: f32,
    /// Enable the constant-voltage stage (for Li-ion chemistries).
    pub opt_stage_const_v: bool,
    /// CV-stage completion current threshold (A).
    pub min_current: f32,
    /// Session time limit.
    pub time_limit: Duration,
}

impl Default for ChargeParameters {
    fn default() -> Self {
        ChargeParameters {
            exp_current: 0.15,
            exp_voltage: 1.35,
            exp_voltage_oc: 1.3,
            exp_charge: 5400.0,
            opt_stage_const_v: false,
            min_current: 0.05,
            time_limit: Duration::from_secs(8 * 3600),
        }
    }
}

impl ChargeParameters {
    /// Validate against the configuration, clamping the targets into the
    /// config-derived safe bounds. Returns `None` for values that cannot be
    /// clamped into sanity (too-small current/voltage/charge).
    pub fn clamped(mut self, conf: &ChargeControlConfig) -> Option<Self> {
        if self.exp_current < 0.01
            || self.exp_voltage < conf.v_bat_detect_th + 0.1
            || self.exp_charge < 1.0
            || self.min_current <= 0.0
            || self.time_limit.is_zero()
        {
            return None;
        }
        if self.exp_current > conf.i_max {
            self.exp_current = conf.i_max;
        }
        let v_ceil = conf.v_ext_power - 0.1;
        if self.exp_voltage > v_ceil {
            self.exp_voltage = v_ceil;
        }
        if self.exp_voltage_oc > self.exp_voltage {
            self.exp_voltage_oc = self.exp_voltage;
        }
        if self.min_current > self.exp_current {
            self.min_current = self.exp_current;
        }
        Some(self)
    }
}

/// Live status derived by the control loop; read-only to external callers.
///
/// Fully reset on every transition into a new charging session. Timestamps
/// are monotonic [`Instant`]s; use [`to_wall_clock`] for display.
#[derive(Debug, Clone, Copy)]
pub struct ChargeStatus {
    pub state: ChargeState,
    pub stop_cause: StopCause,

    pub t_last_update: Instant,
    /// Present DAC output level (V).
    pub dac_voltage: f32,
    /// Smoothed battery voltage (V).
    pub bat_voltage: f32,
    /// Smoothed charge current (A).
    pub bat_current: f32,
    /// Open-circuit voltage estimate, v − i·r (V); valid once `ir_measured`.
    pub bat_voltage_oc: f32,
    /// Instantaneous battery power (W).
    pub bat_power: f32,
    /// Instantaneous pass-transistor dissipation (W).
    pub mos_power: f32,

    pub bat_voltage_initial: f32,
    pub bat_voltage_final: f32,
    pub t_charge_start: Instant,
    pub t_charge_stop: Instant,

    pub bat_voltage_max: f32,
    pub t_bat_voltage_max: Instant,
    pub bat_current_max: f32,
    pub t_bat_current_max: Instant,

    /// True once a DC internal-resistance measurement has succeeded.
    pub ir_measured: bool,
    pub t_ir_measure: Instant,
    /// DC internal resistance estimate (Ohm).
    pub ir: f32,

    /// Accumulated charge (C).
    pub bat_charge: f32,
    /// Accumulated energy delivered into the battery (J).
    pub bat_energy: f32,
}

impl ChargeStatus {
    pub fn new() -> Self {
        let now = Instant::now();
        let mut st = ChargeStatus {
            state: ChargeState::DeviceDisconnected,
            stop_cause: StopCause::None,
            t_last_update: now,
            dac_voltage: 0.0,
            bat_voltage: 0.0,
            bat_current: 0.0,
            bat_voltage_oc: 0.0,
            bat_power: 0.0,
            mos_power: 0.0,
            bat_voltage_initial: 0.0,
            bat_voltage_final: 0.0,
            t_charge_start: now,
            t_charge_stop: now,
            bat_voltage_max: 0.0,
            t_bat_voltage_max: now,
            bat_current_max: 0.0,
            t_bat_current_max: now,
            ir_measured: false,
            t_ir_measure: now,
            ir: 0.0,
            bat_charge: 0.0,
            bat_energy: 0.0,
        };
        st.reset_session();
        st
    }

    /// Clear everything accumulated during a charging session.
    pub fn reset_session(&mut self) {
        self.stop_cause = StopCause::None;
        self.bat_voltage_oc = 0.0;
        self.bat_power = 0.0;
        self.mos_power = 0.0;
        self.bat_voltage_initial = 0.0;
        self.bat_voltage_final = 0.0;
        self.bat_voltage_max = 0.0;
        self.bat_current_max = 0.0;
        self.ir_measured = false;
        self.ir = 0.0;
        self.bat_charge = 0.0;
        self.bat_energy = 0.0;
    }

    /// Full reset, as after a fresh device connection.
    pub fn reset(&mut self) {
        self.reset_session();
        self.state = ChargeState::DeviceDisconnected;
        self.dac_voltage = 0.0;
        self.bat_voltage = 0.0;
        self.bat_current = 0.0;
    }
}

impl Default for ChargeStatus {
    fn default() -> Self {
        ChargeStatus::new()
    }
}

impl fmt::Display for ChargeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.state)?;
        writeln!(
            f,
            "{:.3} V  {:.0} mA",
            self.bat_voltage,
            self.bat_current * 1000.0
        )?;
        writeln!(f, "MOS: {:.0} mW", self.mos_power * 1000.0)?;
        writeln!(f, "BAT: {:.0} mW", self.bat_power * 1000.0)?;
        writeln!(f)?;
        writeln!(f, "DAC: {:.3} V", self.dac_voltage)?;
        writeln!(f)?;
        writeln!(f, "VMax: {:.3} V", self.bat_voltage_max)?;
        writeln!(f, "IMax: {:.0} mA", self.bat_current_max * 1000.0)?;
        writeln!(f)?;
        if self.ir_measured {
            writeln!(f, "r: {:.0} mOhm", self.ir * 1000.0)?;
        }
        writeln!(
            f,
            "{} {:.3} V",
            to_wall_clock(self.t_charge_start).format("%H:%M:%S"),
            self.bat_voltage_initial
        )?;
        if self.state == ChargeState::Completed || self.state == ChargeState::Stopped {
            writeln!(
                f,
                "{} {:.3} V",
                to_wall_clock(self.t_charge_stop).format("%H:%M:%S"),
                self.bat_voltage_final
            )?;
        }
        writeln!(f)?;
        write!(
            f,
            "{:.0} mAh  {:.0} mWh",
            self.bat_charge * 1000.0 / 3600.0,
            self.bat_energy * 1000.0 / 3600.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ChargeControlConfig::default().validate().is_ok());
    }

    #[test]
    fn config_rejects_out_of_range_fields() {
        let mut conf = ChargeControlConfig::default();
        conf.i_max = 0.0;
        assert!(conf.validate().is_err());

        let mut conf = ChargeControlConfig::default();
        conf.div_prop = 1.5;
        assert!(conf.validate().is_err());

        let mut conf = ChargeControlConfig::default();
        conf.v_bat_detect_th = conf.v_ext_power;
        assert!(conf.validate().is_err());
    }

    #[test]
    fn zero_vrefint_means_device_reported() {
        let mut conf = ChargeControlConfig::default();
        conf.v_refint = 0.0;
        assert!(conf.validate().is_ok());
        conf.v_refint = 0.05;
        assert!(conf.validate().is_err());
    }

    #[test]
    fn parameters_clamped_into_config_bounds() {
        let conf = ChargeControlConfig::default();
        let param = ChargeParameters {
            exp_current: 2.0,
            exp_voltage: 9.0,
            ..Default::default()
        };
        let clamped = param.clamped(&conf).unwrap();
        assert_eq!(clamped.exp_current, conf.i_max);
        assert!((clamped.exp_voltage - (conf.v_ext_power - 0.1)).abs() < 1e-6);
    }

    #[test]
    fn parameters_below_sanity_rejected() {
        let conf = ChargeControlConfig::default();
        let param = ChargeParameters {
            exp_current: 0.001,
            ..Default::default()
        };
        assert!(param.clamped(&conf).is_none());

        let param = ChargeParameters {
            exp_voltage: conf.v_bat_detect_th,
            ..Default::default()
        };
        assert!(param.clamped(&conf).is_none());
    }

    #[test]
    fn session_reset_keeps_connection_state() {
        let mut st = ChargeStatus::new();
        st.state = ChargeState::BatteryConnected;
        st.bat_voltage = 1.3;
        st.bat_charge = 100.0;
        st.ir_measured = true;
        st.reset_session();
        assert_eq!(st.state, ChargeState::BatteryConnected);
        assert_eq!(st.bat_charge, 0.0);
        assert!(!st.ir_measured);
        // live readings survive a session reset
        assert!((st.bat_voltage - 1.3).abs() < 1e-6);
    }
}
