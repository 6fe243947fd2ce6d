//! Binary wire protocol shared with the charger firmware.
//!
//! Commands and responses are fixed-size packed little-endian records, each
//! starting with [`PROTOCOL_HEADER`]. The capability-query response carries a
//! secondary [`PROTOCOL_KEY`] that is validated independently from the header,
//! so a device that merely shares the framing is still rejected.
//!
//! Everything in this module is pure: building and validating frames has no
//! side effects and touches no I/O.

use crate::constants::*;
use crate::error::{ChargerError, Result};

/// Size of the common command header: u32 header + u8 cmd_id + u8 ext_len.
pub const CMD_HEADER_LEN: usize = 6;

/// Size of the common response header: u32 header + u8 cmd_id + u8 status + u8 ext_len.
pub const RESP_HEADER_LEN: usize = 7;

/// Size of the ADC-start command (header + discontinuous flag + option index).
pub const CMD_ADC_START_LEN: usize = CMD_HEADER_LEN + 2;

/// Size of the PWM/DAC command (header + 4 u16 fields + no-resp flag).
pub const CMD_PWM_DAC_LEN: usize = CMD_HEADER_LEN + 9;

/// Size of the capability-query response.
pub const RESP_CHECK_LEN: usize = RESP_HEADER_LEN + 49;

/// Wire length of the command with the given ID, or 0 if the ID is unknown.
pub fn cmd_length(cmd_id: u8) -> usize {
    match cmd_id {
        CMD_ID_CHECK | CMD_ID_ADC_STOP | CMD_ID_DISABLE_OUTPUT | CMD_ID_SHAKE
        | CMD_ID_UNLOCK | CMD_ID_RESET => CMD_HEADER_LEN,
        CMD_ID_ADC_START => CMD_ADC_START_LEN,
        CMD_ID_PWM_DAC => CMD_PWM_DAC_LEN,
        _ => 0,
    }
}

/// Wire length of the response to the given command ID.
pub fn resp_length(cmd_id: u8) -> usize {
    if cmd_id == CMD_ID_CHECK {
        RESP_CHECK_LEN
    } else {
        RESP_HEADER_LEN
    }
}

fn push_header(buf: &mut Vec<u8>, cmd_id: u8, ext_len: usize) {
    buf.extend_from_slice(&PROTOCOL_HEADER.to_le_bytes());
    buf.push(cmd_id);
    buf.push(ext_len as u8);
}

/// Build a plain command frame with no extension payload.
pub fn command(cmd_id: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(CMD_HEADER_LEN);
    push_header(&mut buf, cmd_id, cmd_length(cmd_id).saturating_sub(CMD_HEADER_LEN));
    buf
}

/// Build an ADC-start command selecting a sample-time option.
pub fn adc_start(sample_time_opt: u8, discontinuous_mode: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(CMD_ADC_START_LEN);
    push_header(&mut buf, CMD_ID_ADC_START, 2);
    buf.push(discontinuous_mode as u8);
    buf.push(sample_time_opt);
    buf
}

/// Build a PWM/DAC output command.
///
/// The PWM timer fields are fixed to the values the firmware expects when a
/// real DAC is present (prescaler 0, reload 0, duty 1); only `dac_val` is
/// variable on this code path. `no_resp` suppresses the acknowledgement so
/// the command never interleaves with an in-flight telemetry frame.
pub fn pwm_dac(dac_val: u16, no_resp: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(CMD_PWM_DAC_LEN);
    push_header(&mut buf, CMD_ID_PWM_DAC, 9);
    buf.extend_from_slice(&0u16.to_le_bytes()); // pwm_tim_prescaler
    buf.extend_from_slice(&0u16.to_le_bytes()); // pwm_reload_val
    buf.extend_from_slice(&1u16.to_le_bytes()); // pwm_duty_val
    buf.extend_from_slice(&dac_val.to_le_bytes());
    buf.push(no_resp as u8);
    buf
}

/// Build a plain response frame (used by tests and device emulation).
pub fn response(cmd_id: u8, status: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RESP_HEADER_LEN);
    buf.extend_from_slice(&PROTOCOL_HEADER.to_le_bytes());
    buf.push(cmd_id);
    buf.push(status);
    buf.push((resp_length(cmd_id) - RESP_HEADER_LEN) as u8);
    buf
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Structural validation of a command frame.
pub fn is_valid_cmd(bytes: &[u8]) -> bool {
    if bytes.len() < CMD_HEADER_LEN || read_u32(bytes, 0) != PROTOCOL_HEADER {
        return false;
    }
    let cmd_id = bytes[4];
    let expected = cmd_length(cmd_id);
    if expected == 0
        || bytes.len() != expected
        || bytes.len() != CMD_HEADER_LEN + bytes[5] as usize
    {
        return false;
    }

    if cmd_id == CMD_ID_ADC_START && bytes[7] > 15 {
        return false;
    }
    if cmd_id == CMD_ID_PWM_DAC && read_u16(bytes, 12) > DAC_RAW_VALUE_MAX {
        return false;
    }
    true
}

/// Structural validation of a response frame.
///
/// For the capability-query response this additionally checks the protocol
/// key and rejects all-zero capability fields, which a half-compatible
/// device could otherwise report.
pub fn is_valid_resp(bytes: &[u8]) -> bool {
    if bytes.len() < RESP_HEADER_LEN || read_u32(bytes, 0) != PROTOCOL_HEADER {
        return false;
    }
    let cmd_id = bytes[4];
    let status = bytes[5];
    if cmd_length(cmd_id) == 0
        || (status != RESP_OK && status != RESP_FAILED)
        || bytes.len() != RESP_HEADER_LEN + bytes[6] as usize
        || bytes.len() != resp_length(cmd_id)
    {
        return false;
    }

    if cmd_id == CMD_ID_CHECK {
        let key = read_u32(bytes, 7);
        if key != PROTOCOL_KEY
            || read_u32(bytes, 12) == 0 // pwm_clock_freq
            || read_u32(bytes, 16) == 0 // adc_clock_freq
            || read_u16(bytes, 20) == 0 // first sample-time option
            || read_u16(bytes, 52) == 0 // bulk_data_amount
            || read_u16(bytes, 54) == 0 // vrefint_mv
        {
            return false;
        }
    }
    true
}

/// Hardware capabilities reported by the capability-query response.
///
/// Received once at connect time; immutable for the life of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareCaps {
    /// True if a real DAC drives the output; false means PWM with an RC filter.
    pub dac_support: bool,
    /// PWM timer clock frequency (Hz).
    pub pwm_clock_freq: u32,
    /// ADC clock frequency (Hz).
    pub adc_clock_freq: u32,
    /// Sample-time options in ADC clock cycles, ascending; 0 = unavailable.
    pub sample_time_opts: [u16; 16],
    /// Number of (channel-1, channel-2) pairs per telemetry frame.
    pub bulk_data_amount: u16,
    /// Nominal on-chip reference voltage (mV).
    pub vrefint_mv: u16,
}

impl HardwareCaps {
    /// Parse a capability-query response.
    ///
    /// A structurally sound frame carrying the wrong [`PROTOCOL_KEY`] is a
    /// different device speaking a similar framing and is reported as
    /// [`ChargerError::ProtocolMismatch`]; everything else that fails
    /// validation is [`ChargerError::InvalidResponse`].
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let invalid = ChargerError::InvalidResponse {
            cmd_id: CMD_ID_CHECK,
        };
        if bytes.len() != RESP_CHECK_LEN
            || read_u32(bytes, 0) != PROTOCOL_HEADER
            || bytes[4] != CMD_ID_CHECK
        {
            return Err(invalid);
        }
        let key = read_u32(bytes, 7);
        if key != PROTOCOL_KEY {
            return Err(ChargerError::ProtocolMismatch { found: key });
        }
        if !is_valid_resp(bytes) || bytes[5] != RESP_OK {
            return Err(invalid);
        }
        let mut sample_time_opts = [0u16; 16];
        for (i, opt) in sample_time_opts.iter_mut().enumerate() {
            *opt = read_u16(bytes, 20 + 2 * i);
        }
        Ok(HardwareCaps {
            dac_support: bytes[11] != 0,
            pwm_clock_freq: read_u32(bytes, 12),
            adc_clock_freq: read_u32(bytes, 16),
            sample_time_opts,
            bulk_data_amount: read_u16(bytes, 52),
            vrefint_mv: read_u16(bytes, 54),
        })
    }

    /// Encode a capability-query response for these capabilities
    /// (used by tests and device emulation).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = response(CMD_ID_CHECK, RESP_OK);
        buf.extend_from_slice(&PROTOCOL_KEY.to_le_bytes());
        buf.push(self.dac_support as u8);
        buf.extend_from_slice(&self.pwm_clock_freq.to_le_bytes());
        buf.extend_from_slice(&self.adc_clock_freq.to_le_bytes());
        for opt in &self.sample_time_opts {
            buf.extend_from_slice(&opt.to_le_bytes());
        }
        buf.extend_from_slice(&self.bulk_data_amount.to_le_bytes());
        buf.extend_from_slice(&self.vrefint_mv.to_le_bytes());
        buf
    }

    /// Payload size of one telemetry frame, excluding the sync header and
    /// the reference-channel sample: two u16 channels per element.
    pub fn bulk_data_size(&self) -> usize {
        2 * 2 * self.bulk_data_amount as usize
    }

    /// Interval between two raw samples for a sample-time option (ms).
    pub fn raw_sample_interval_ms(&self, opt: u8) -> f32 {
        if self.adc_clock_freq == 0 {
            return 0.0;
        }
        self.sample_time_opts[opt as usize] as f32 * 1000.0 / self.adc_clock_freq as f32
    }

    /// Time span covered by one telemetry frame for a sample-time option (ms).
    pub fn bulk_interval_ms(&self, opt: u8) -> f32 {
        self.bulk_data_amount as f32 * self.raw_sample_interval_ms(opt)
    }

    /// Pick the sample-time option whose raw interval is closest to
    /// `interval_ms`.
    ///
    /// The option table is a sparse ascending array where zero entries are
    /// unavailable; ties resolve to the lower index (shorter interval). A
    /// desired interval below the smallest or above the largest populated
    /// option returns the nearest populated boundary, never an out-of-range
    /// index.
    pub fn choose_sample_time_opt(&self, interval_ms: f32) -> u8 {
        if interval_ms <= 0.0 {
            return 0;
        }
        let want_cycles = interval_ms * self.adc_clock_freq as f32 / 1000.0;

        let mut best = 0u8;
        let mut best_diff = f32::INFINITY;
        for (i, &cycles) in self.sample_time_opts.iter().enumerate() {
            if cycles == 0 {
                continue;
            }
            let diff = (cycles as f32 - want_cycles).abs();
            if diff < best_diff {
                best = i as u8;
                best_diff = diff;
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> HardwareCaps {
        let mut opts = [0u16; 16];
        // STM32F3-style total cycles (sampling + 12.5 conversion), ascending
        for (i, v) in [14u16, 15, 17, 20, 32, 74, 194, 614].iter().enumerate() {
            opts[i] = *v;
        }
        HardwareCaps {
            dac_support: true,
            pwm_clock_freq: 72_000_000,
            adc_clock_freq: 12_000_000,
            sample_time_opts: opts,
            bulk_data_amount: 1024,
            vrefint_mv: 1222,
        }
    }

    #[test]
    fn command_roundtrip_every_id() {
        for id in [
            CMD_ID_CHECK,
            CMD_ID_ADC_STOP,
            CMD_ID_DISABLE_OUTPUT,
            CMD_ID_SHAKE,
            CMD_ID_UNLOCK,
            CMD_ID_RESET,
        ] {
            let bytes = command(id);
            assert_eq!(bytes.len(), cmd_length(id));
            assert!(is_valid_cmd(&bytes), "command {id:#04x} should validate");
        }
        assert!(is_valid_cmd(&adc_start(3, false)));
        assert!(is_valid_cmd(&pwm_dac(4095, true)));
    }

    #[test]
    fn corrupted_header_rejected() {
        let good = command(CMD_ID_SHAKE);
        for i in 0..4 {
            let mut bad = good.clone();
            bad[i] ^= 0x01;
            assert!(!is_valid_cmd(&bad), "flipped header byte {i} accepted");
        }
    }

    #[test]
    fn wrong_length_and_unknown_id_rejected() {
        let mut bytes = command(CMD_ID_SHAKE);
        bytes.push(0);
        assert!(!is_valid_cmd(&bytes));

        let mut unknown = command(CMD_ID_SHAKE);
        unknown[4] = 0x42;
        assert!(!is_valid_cmd(&unknown));
    }

    #[test]
    fn adc_start_option_range_checked() {
        assert!(is_valid_cmd(&adc_start(15, true)));
        assert!(!is_valid_cmd(&adc_start(16, true)));
    }

    #[test]
    fn dac_value_range_checked() {
        assert!(is_valid_cmd(&pwm_dac(DAC_RAW_VALUE_MAX, false)));
        assert!(!is_valid_cmd(&pwm_dac(DAC_RAW_VALUE_MAX + 1, false)));
    }

    #[test]
    fn check_response_roundtrip() {
        let c = caps();
        let bytes = c.encode();
        assert_eq!(bytes.len(), RESP_CHECK_LEN);
        assert!(is_valid_resp(&bytes));
        assert_eq!(HardwareCaps::parse(&bytes).unwrap(), c);
    }

    #[test]
    fn check_response_bad_key_rejected() {
        let mut bytes = caps().encode();
        bytes[7] ^= 0xff;
        assert!(!is_valid_resp(&bytes));
        assert!(matches!(
            HardwareCaps::parse(&bytes),
            Err(ChargerError::ProtocolMismatch { .. })
        ));
    }

    #[test]
    fn check_response_zero_caps_rejected() {
        let mut c = caps();
        c.bulk_data_amount = 0;
        assert!(!is_valid_resp(&c.encode()));

        let mut c = caps();
        c.vrefint_mv = 0;
        assert!(!is_valid_resp(&c.encode()));
    }

    #[test]
    fn failed_status_rejected_by_parse() {
        let mut bytes = caps().encode();
        bytes[5] = RESP_FAILED;
        assert!(is_valid_resp(&bytes));
        assert!(matches!(
            HardwareCaps::parse(&bytes),
            Err(ChargerError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn plain_response_roundtrip() {
        let bytes = response(CMD_ID_SHAKE, RESP_OK);
        assert!(is_valid_resp(&bytes));
        let mut bad_status = bytes.clone();
        bad_status[5] = 0x07;
        assert!(!is_valid_resp(&bad_status));
    }

    #[test]
    fn interval_math() {
        let c = caps();
        // 614 cycles at 12 MHz
        let raw = c.raw_sample_interval_ms(7);
        assert!((raw - 614.0 * 1000.0 / 12e6).abs() < 1e-9);
        assert!((c.bulk_interval_ms(7) - 1024.0 * raw).abs() < 1e-6);
    }

    #[test]
    fn choose_opt_nearest_neighbor() {
        let c = caps();
        // 20 cycles = 20/12e6 s; exactly at option 3
        let exact_ms = 20.0 * 1000.0 / 12e6;
        assert_eq!(c.choose_sample_time_opt(exact_ms), 3);
        // between 32 and 74, closer to 32
        let ms = 40.0 * 1000.0 / 12e6;
        assert_eq!(c.choose_sample_time_opt(ms), 4);
        // between 32 and 74, closer to 74
        let ms = 70.0 * 1000.0 / 12e6;
        assert_eq!(c.choose_sample_time_opt(ms), 5);
    }

    #[test]
    fn choose_opt_tie_resolves_low() {
        let mut c = caps();
        c.sample_time_opts = [0; 16];
        c.sample_time_opts[0] = 10;
        c.sample_time_opts[1] = 30;
        // 20 cycles is equidistant; lower index wins
        let ms = 20.0 * 1000.0 / 12e6;
        assert_eq!(c.choose_sample_time_opt(ms), 0);
    }

    #[test]
    fn choose_opt_boundaries() {
        let c = caps();
        // far below the smallest populated option
        assert_eq!(c.choose_sample_time_opt(1e-9), 0);
        // far above the largest populated option: largest populated index,
        // never an out-of-range one
        assert_eq!(c.choose_sample_time_opt(100.0), 7);
    }

    #[test]
    fn choose_opt_sparse_table() {
        let mut c = caps();
        c.sample_time_opts = [0; 16];
        c.sample_time_opts[2] = 50;
        c.sample_time_opts[9] = 500;
        let ms = 400.0 * 1000.0 / 12e6;
        assert_eq!(c.choose_sample_time_opt(ms), 9);
        let ms = 60.0 * 1000.0 / 12e6;
        assert_eq!(c.choose_sample_time_opt(ms), 2);
    }
}
