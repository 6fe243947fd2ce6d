//! Serial transport to the charger device.
//!
//! Owns the physical port and a dedicated I/O loop thread that issues queued
//! commands, reads telemetry frames (resynchronizing byte-wise after framing
//! loss), runs the oversampling pipeline and fires a per-frame callback with
//! the two channel voltages. DAC and shake requests from other threads are
//! queued through atomic flags and consumed on the next loop pass, so they
//! never interleave with an in-flight telemetry read.

use log::{debug, info, warn};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::constants::*;
use crate::error::{ChargerError, Result};
use crate::protocol::{self, HardwareCaps};

/// Callback invoked once per telemetry frame with the oversampled channel
/// voltages (divider voltage, shunt voltage).
pub type DataCallback = Box<dyn FnMut(f32, f32) + Send + 'static>;

/// Byte-stream seam over the serial port, mockable in tests.
pub trait SerialLink: Send {
    /// Write the whole buffer.
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Read exactly `buf.len()` bytes within `timeout`.
    /// [`ChargerError::Timeout`] when the data did not arrive in time.
    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()>;

    /// Drop everything pending in the receive buffer.
    fn discard_input(&mut self);
}

/// Opens a candidate port by name; `None` when it cannot be opened.
pub type LinkOpener = Box<dyn Fn(&str) -> Option<Box<dyn SerialLink>> + Send>;

struct PortLink {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialLink for PortLink {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        Write::write_all(&mut self.port, data)?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        self.port.set_timeout(timeout)?;
        match Read::read_exact(&mut self.port, buf) {
            Ok(()) => Ok(()),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::UnexpectedEof
                ) =>
            {
                Err(ChargerError::Timeout)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn discard_input(&mut self) {
        let _ = self.port.clear(serialport::ClearBuffer::Input);
    }
}

fn open_serial(name: &str) -> Option<Box<dyn SerialLink>> {
    match serialport::new(name, BAUD_RATE)
        .timeout(Duration::from_millis(TIMEOUT_COMM_MAX_MS))
        .open()
    {
        Ok(port) => Some(Box::new(PortLink { port })),
        Err(_) => None,
    }
}

/// Default candidate port names for the platform.
pub fn port_candidates() -> Vec<String> {
    #[cfg(windows)]
    {
        (1..=256).map(|i| format!("\\\\.\\COM{i}")).collect()
    }
    #[cfg(not(windows))]
    {
        (0..=255).map(|i| format!("/dev/ttyACM{i}")).collect()
    }
}

/// Cross-thread state shared with the I/O loop. Floats travel as raw bits.
struct Shared {
    connected: AtomicBool,
    close: AtomicBool,

    dac_pending: AtomicBool,
    dac_raw: AtomicU16,

    shake_request: AtomicBool,
    shake_success: AtomicBool,

    vdda_bits: AtomicU32,
    vrefint_bits: AtomicU32,
    vdda_reset: AtomicBool,

    /// Last first-channel raw average, for VRefInt calibration.
    adc1_raw_bits: AtomicU32,
}

impl Shared {
    fn new() -> Self {
        Shared {
            connected: AtomicBool::new(false),
            close: AtomicBool::new(false),
            dac_pending: AtomicBool::new(false),
            dac_raw: AtomicU16::new(0),
            shake_request: AtomicBool::new(false),
            shake_success: AtomicBool::new(false),
            vdda_bits: AtomicU32::new(3.3f32.to_bits()),
            vrefint_bits: AtomicU32::new(0f32.to_bits()),
            vdda_reset: AtomicBool::new(false),
            adc1_raw_bits: AtomicU32::new(0f32.to_bits()),
        }
    }

    fn vdda(&self) -> f32 {
        f32::from_bits(self.vdda_bits.load(Ordering::SeqCst))
    }

    fn set_vdda(&self, v: f32) {
        self.vdda_bits.store(v.to_bits(), Ordering::SeqCst);
    }

    fn vrefint(&self) -> f32 {
        f32::from_bits(self.vrefint_bits.load(Ordering::SeqCst))
    }

    fn set_vrefint(&self, v: f32) {
        self.vrefint_bits.store(v.to_bits(), Ordering::SeqCst);
    }

    fn adc1_raw(&self) -> f32 {
        f32::from_bits(self.adc1_raw_bits.load(Ordering::SeqCst))
    }
}

/// Connection to the charger device.
///
/// One `Transport` drives at most one device at a time; all synchronous
/// methods are intended to be called from a single owner thread, while the
/// spawned I/O loop communicates only through [`Shared`] and the callback.
pub struct Transport {
    opener: LinkOpener,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    bulk_interval_ms: f32,
    vrefint_override: bool,
}

impl Transport {
    pub fn new() -> Self {
        Transport::with_opener(Box::new(|name| open_serial(name)))
    }

    /// Use a custom port opener (tests inject an in-memory link here).
    pub fn with_opener(opener: LinkOpener) -> Self {
        Transport {
            opener,
            shared: Arc::new(Shared::new()),
            worker: None,
            bulk_interval_ms: 0.0,
            vrefint_override: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Time span covered by one telemetry frame (ms); 0 when disconnected.
    pub fn data_interval_ms(&self) -> f32 {
        self.bulk_interval_ms
    }

    /// Rolling estimate of the analog supply rail (V).
    pub fn voltage_vdda(&self) -> f32 {
        self.shared.vdda()
    }

    /// Present on-chip reference voltage estimate (V).
    pub fn voltage_vrefint(&self) -> f32 {
        self.shared.vrefint()
    }

    /// Probe the default candidate ports and accept the first one carrying
    /// the charger firmware; spawns the I/O loop on success.
    pub fn connect(&mut self, callback: DataCallback) -> bool {
        let candidates = port_candidates();
        self.connect_to(&candidates, callback)
    }

    /// Like [`Transport::connect`] with an explicit candidate list.
    pub fn connect_to(&mut self, candidates: &[String], callback: DataCallback) -> bool {
        if self.is_connected() {
            return true;
        }

        for name in candidates {
            let Some(mut link) = (self.opener)(name) else {
                continue;
            };

            let Some(resp) = apply_cmd(link.as_mut(), &protocol::command(CMD_ID_CHECK)) else {
                continue; // dropping the link closes the port
            };
            let caps = match HardwareCaps::parse(&resp) {
                Ok(caps) => caps,
                Err(err) => {
                    debug!("{name}: {err}");
                    continue;
                }
            };
            if !caps.dac_support {
                info!("{name}: device has no DAC support, skipping");
                continue;
            }

            let opt = caps.choose_sample_time_opt(RAW_DATA_INTERVAL_MS);
            if apply_cmd(link.as_mut(), &protocol::adc_start(opt, false)).is_none() {
                warn!("{name}: ADC configuration handshake failed");
                continue;
            }

            self.bulk_interval_ms = caps.bulk_interval_ms(opt);
            if !self.vrefint_override {
                self.shared.set_vrefint(caps.vrefint_mv as f32 / 1000.0);
            }
            self.shared.vdda_reset.store(true, Ordering::SeqCst);
            self.shared.close.store(false, Ordering::SeqCst);
            self.shared.connected.store(true, Ordering::SeqCst);

            info!(
                "connected to {name}: bulk interval {:.1} ms, vrefint {:.3} V",
                self.bulk_interval_ms,
                self.shared.vrefint()
            );

            let mut io = IoLoop::new(
                link,
                Arc::clone(&self.shared),
                caps,
                opt,
                self.bulk_interval_ms,
                callback,
            );
            self.worker = Some(thread::spawn(move || io.run()));
            return true;
        }
        false
    }

    /// Signal the I/O loop to stop, join it and release the port.
    /// No-op when not connected.
    pub fn disconnect(&mut self) {
        self.shared.close.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.shared.close.store(false, Ordering::SeqCst);
        self.shared.connected.store(false, Ordering::SeqCst);
        self.bulk_interval_ms = 0.0;
    }

    /// Send one watchdog keep-alive through the I/O loop and report whether
    /// the device acknowledged it. Device-side, missing shakes disable the
    /// output autonomously; see [`SHAKE_INTERVAL_MAX_MS`].
    pub fn shake(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.shared.shake_request.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_millis(2 * TIMEOUT_DATA_MAX_MS);
        while self.shared.shake_request.load(Ordering::SeqCst) {
            if !self.is_connected()
                || self.shared.close.load(Ordering::SeqCst)
                || Instant::now() > deadline
            {
                return false;
            }
            thread::sleep(Duration::from_millis(30));
        }
        self.shared.shake_success.load(Ordering::SeqCst)
    }

    /// Queue a DAC output level (V) for the next I/O loop pass.
    /// Rejected when disconnected or outside [0, VDDA].
    pub fn dac_output(&self, val: f32) -> bool {
        if !self.is_connected() || val < 0.0 || val > self.shared.vdda() {
            return false;
        }
        self.shared.dac_raw.store(self.from_voltage(val), Ordering::SeqCst);
        self.shared.dac_pending.store(true, Ordering::SeqCst);
        true
    }

    /// Override the reference-voltage estimate (V). The VDDA estimate is
    /// rescaled immediately and its rolling buffer restarted.
    pub fn set_vrefint(&mut self, new_vrefint: f32) -> bool {
        if !(0.1..=4.8).contains(&new_vrefint) {
            return false;
        }
        let old = self.shared.vrefint();
        if old != 0.0 {
            self.shared.set_vdda(self.shared.vdda() * new_vrefint / old);
        }
        self.shared.set_vrefint(new_vrefint);
        self.shared.vdda_reset.store(true, Ordering::SeqCst);
        self.vrefint_override = true;
        true
    }

    /// Calibrate VRefInt against an externally measured channel-1 voltage
    /// and return the new estimate. Requires a connection and at least one
    /// processed telemetry frame.
    pub fn vrefint_calibrate(&mut self, v_adc1_actual: f32) -> Result<f32> {
        if !self.is_connected() {
            return Err(ChargerError::NotConnected);
        }
        let adc1 = self.shared.adc1_raw();
        if adc1 == 0.0 || v_adc1_actual <= 0.0 {
            return Err(ChargerError::InvalidConfig(
                "no channel-1 reading to calibrate against".to_string(),
            ));
        }
        let d = v_adc1_actual / self.get_voltage(adc1);
        let new_vrefint = self.shared.vrefint() * d;
        self.shared.set_vrefint(new_vrefint);
        self.shared.set_vdda(self.shared.vdda() * d);
        self.shared.vdda_reset.store(true, Ordering::SeqCst);
        self.vrefint_override = true;
        Ok(new_vrefint)
    }

    fn get_voltage(&self, raw: f32) -> f32 {
        raw / ADC_RAW_VALUE_MAX as f32 * self.shared.vdda()
    }

    fn from_voltage(&self, val: f32) -> u16 {
        let vdda = self.shared.vdda();
        if val <= 0.0 {
            return 0;
        }
        if val >= vdda {
            return DAC_RAW_VALUE_MAX;
        }
        (val / vdda * DAC_RAW_VALUE_MAX as f32) as u16
    }
}

impl Default for Transport {
    fn default() -> Self {
        Transport::new()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.disconnect();
        }
    }
}

/// Write a command and read its validated response, with retries.
///
/// Returns the response bytes on success (empty for no-response commands),
/// `None` after [`CMD_RETRY_COUNT`] failed attempts.
fn apply_cmd(link: &mut dyn SerialLink, cmd: &[u8]) -> Option<Vec<u8>> {
    let cmd_id = cmd[4];
    let no_resp = cmd_id == CMD_ID_PWM_DAC && cmd[CMD_PWM_DAC_NO_RESP_AT] != 0;
    let timeout = Duration::from_millis(TIMEOUT_COMM_MAX_MS);

    for _ in 0..CMD_RETRY_COUNT {
        if link.write_all(cmd).is_err() {
            thread::sleep(Duration::from_millis(100));
            continue;
        }
        if no_resp {
            return Some(Vec::new());
        }

        let mut resp = vec![0u8; protocol::resp_length(cmd_id)];
        match link.read_exact(&mut resp, timeout) {
            Ok(()) if protocol::is_valid_resp(&resp) => {
                if resp[5] == RESP_OK {
                    return Some(resp);
                }
                return None; // device refused; retrying won't change its mind
            }
            Ok(()) | Err(ChargerError::Timeout) => {
                rec_discard_in(link, timeout);
            }
            Err(_) => return None,
        }
    }
    None
}

const CMD_PWM_DAC_NO_RESP_AT: usize = protocol::CMD_PWM_DAC_LEN - 1;

/// Swallow garbage bytes for the given duration, then flush the receiver.
fn rec_discard_in(link: &mut dyn SerialLink, duration: Duration) {
    let deadline = Instant::now() + duration;
    let mut byte = [0u8; 1];
    while Instant::now() < deadline {
        if link.read_exact(&mut byte, Duration::from_millis(10)).is_err() {
            break;
        }
    }
    link.discard_input();
}

/// Byte-wise search for `pattern` in the receive stream.
///
/// On a mismatch the receive window shifts one byte and reading continues,
/// which recovers from partial or garbled frames without a device resend.
fn rec_until(link: &mut dyn SerialLink, pattern: &[u8], timeout: Duration) -> bool {
    if pattern.is_empty() {
        return true;
    }
    let deadline = Instant::now() + timeout;

    let mut window = vec![0u8; pattern.len()];
    if link.read_exact(&mut window, timeout).is_err() {
        return false;
    }

    loop {
        if window == pattern {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        window.rotate_left(1);
        let last = window.len() - 1;
        if link.read_exact(&mut window[last..], deadline - now).is_err() {
            return false;
        }
    }
}

/// Read one telemetry frame: sync header, reference sample, bulk payload.
fn read_frame(
    link: &mut dyn SerialLink,
    caps: &HardwareCaps,
    timeout: Duration,
) -> Option<(u16, Vec<u8>)> {
    if !rec_until(link, &DATA_HEADER.to_le_bytes(), timeout) {
        return None;
    }
    let mut refint = [0u8; 2];
    if link.read_exact(&mut refint, timeout).is_err() {
        return None;
    }
    let mut bulk = vec![0u8; caps.bulk_data_size()];
    match link.read_exact(&mut bulk, timeout) {
        Ok(()) => Some((u16::from_le_bytes(refint), bulk)),
        Err(_) => None,
    }
}

/// Trimmed two-pass average of raw ADC samples.
///
/// First pass: iteratively remove the extreme min/max pair up to n/8 times
/// and average the rest; the whole batch is rejected (0 sentinel) when the
/// trimmed peak-to-peak spread still exceeds 8× `diff_max`. Second pass:
/// re-average exactly the original samples within ±`diff_max` of the
/// first-pass reference, which filters isolated spikes without sorting.
pub fn stable_average(raw: &[u16], diff_max: f32) -> f32 {
    if raw.is_empty() {
        return 0.0;
    }
    if raw.len() < 8 {
        let sum: u32 = raw.iter().map(|&v| v as u32).sum();
        return sum as f32 / raw.len() as f32;
    }

    let mut data = raw.to_vec();
    let mut sum: u32 = raw.iter().map(|&v| v as u32).sum();
    let border = raw.len() / 8;
    let mut cnt_rem = raw.len() as u32;
    let mut curr_min = u16::MAX;
    let mut curr_max = 0u16;

    for i in 0..=border {
        curr_min = u16::MAX;
        curr_max = 0;
        let mut pmin = None;
        let mut pmax = None;
        for (j, &v) in data.iter().enumerate() {
            if v == u16::MAX {
                continue; // already removed
            }
            if v < curr_min {
                curr_min = v;
                pmin = Some(j);
            }
            if v > curr_max {
                curr_max = v;
                pmax = Some(j);
            }
        }
        if i == border {
            break; // curr_min/curr_max now describe the remaining data
        }
        let (Some(jmin), Some(jmax)) = (pmin, pmax) else {
            break;
        };
        if jmin == jmax {
            break; // single distinct value left
        }
        sum -= raw[jmin] as u32 + raw[jmax] as u32;
        cnt_rem -= 2;
        data[jmin] = u16::MAX;
        data[jmax] = u16::MAX;
    }

    if (curr_max.saturating_sub(curr_min)) as f32 / 2.0 > 8.0 * diff_max {
        return 0.0; // too noisy, treat the batch as dropped
    }
    let av_ref = sum as f32 / cnt_rem as f32;

    let mut sum2 = 0u32;
    let mut cnt2 = 0u32;
    for &v in raw {
        if (v as f32 - av_ref).abs() <= diff_max {
            sum2 += v as u32;
            cnt2 += 1;
        }
    }
    if cnt2 == 0 {
        return 0.0;
    }
    sum2 as f32 / cnt2 as f32
}

/// Second-stage average over first-stage sub-averages; zero entries are
/// invalid batches and are skipped unless every entry is zero.
pub fn average_nonzero(values: &[f32]) -> f32 {
    let mut sum = 0.0;
    let mut cnt = 0u32;
    for &v in values {
        if v != 0.0 {
            sum += v;
            cnt += 1;
        }
    }
    if cnt == 0 {
        return 0.0;
    }
    sum / cnt as f32
}

struct IoLoop {
    link: Box<dyn SerialLink>,
    shared: Arc<Shared>,
    caps: HardwareCaps,
    adc_start_cmd: Vec<u8>,
    bulk_interval_ms: f32,
    callback: DataCallback,

    av_first: usize,
    av_second: usize,
    vdda_buf: VecDeque<f32>,
    cnt_zero: u32,
}

impl IoLoop {
    fn new(
        link: Box<dyn SerialLink>,
        shared: Arc<Shared>,
        caps: HardwareCaps,
        adc_opt: u8,
        bulk_interval_ms: f32,
        callback: DataCallback,
    ) -> Self {
        let bulk = caps.bulk_data_amount as usize;
        let av_first = DATA_AMOUNT_PER_AV_FIRST.min(bulk);
        let av_second = bulk / av_first;
        IoLoop {
            link,
            shared,
            caps,
            adc_start_cmd: protocol::adc_start(adc_opt, false),
            bulk_interval_ms,
            callback,
            av_first,
            av_second,
            vdda_buf: VecDeque::with_capacity(VDDA_BUF_DEPTH),
            cnt_zero: 0,
        }
    }

    fn run(&mut self) {
        // drain whatever queued up before the loop started, so the first
        // shake command does not race a half-received frame
        let startup = Duration::from_millis((10.0 * self.bulk_interval_ms) as u64);
        let _ = read_frame(self.link.as_mut(), &self.caps, startup);

        let frame_timeout =
            Duration::from_millis(self.bulk_interval_ms as u64 + TIMEOUT_DATA_MAX_MS);

        loop {
            if self.shared.close.load(Ordering::SeqCst) {
                apply_cmd(self.link.as_mut(), &protocol::command(CMD_ID_ADC_STOP));
                break;
            }

            if self.shared.dac_pending.swap(false, Ordering::SeqCst) {
                let raw = self.shared.dac_raw.load(Ordering::SeqCst);
                if raw > 0 {
                    apply_cmd(self.link.as_mut(), &protocol::pwm_dac(raw, true));
                } else {
                    apply_cmd(self.link.as_mut(), &protocol::command(CMD_ID_DISABLE_OUTPUT));
                }
            } else if self.shared.shake_request.load(Ordering::SeqCst) {
                let suc =
                    apply_cmd(self.link.as_mut(), &protocol::command(CMD_ID_SHAKE)).is_some();
                self.shared.shake_success.store(suc, Ordering::SeqCst);
                self.shared.shake_request.store(false, Ordering::SeqCst);
            }

            match read_frame(self.link.as_mut(), &self.caps, frame_timeout) {
                Some((refint, bulk)) => self.process_frame(refint, &bulk),
                None => {
                    warn!("telemetry frame lost, restarting ADC");
                    if apply_cmd(self.link.as_mut(), &self.adc_start_cmd).is_some() {
                        continue;
                    }
                    info!("device unresponsive, terminating I/O loop");
                    break;
                }
            }
        }
        self.shared.connected.store(false, Ordering::SeqCst);
    }

    fn process_frame(&mut self, refint: u16, bulk: &[u8]) {
        if self.shared.vdda_reset.swap(false, Ordering::SeqCst) {
            self.vdda_buf.clear();
        }
        if refint != 0 {
            let sample =
                self.shared.vrefint() * ADC_RAW_VALUE_MAX as f32 / refint as f32;
            if self.vdda_buf.len() == VDDA_BUF_DEPTH {
                self.vdda_buf.pop_front();
            }
            self.vdda_buf.push_back(sample);
            let avg: f32 = self.vdda_buf.iter().sum::<f32>() / self.vdda_buf.len() as f32;
            self.shared.set_vdda(avg);
        }

        let amount = self.caps.bulk_data_amount as usize;
        let mut ch1 = Vec::with_capacity(amount);
        let mut ch2 = Vec::with_capacity(amount);
        for pair in bulk.chunks_exact(4) {
            ch1.push(u16::from_le_bytes([pair[0], pair[1]]));
            ch2.push(u16::from_le_bytes([pair[2], pair[3]]));
        }

        let mut av1 = Vec::with_capacity(self.av_second);
        let mut av2 = Vec::with_capacity(self.av_second);
        for i in 0..self.av_second {
            let range = i * self.av_first..(i + 1) * self.av_first;
            av1.push(stable_average(&ch1[range.clone()], OVERSAMPLING_RADIUS));
            av2.push(stable_average(&ch2[range], OVERSAMPLING_RADIUS));
        }
        let adc1_value = average_nonzero(&av1);
        let adc2_value = average_nonzero(&av2);
        self.shared
            .adc1_raw_bits
            .store(adc1_value.to_bits(), Ordering::SeqCst);

        // a couple of all-zero frames right after (re)start are expected,
        // don't report them as readings
        if adc1_value == 0.0 && adc2_value == 0.0 {
            self.cnt_zero += 1;
            if self.cnt_zero < 3 {
                return;
            }
        } else {
            self.cnt_zero = 0;
        }

        let vdda = self.shared.vdda();
        let u1 = adc1_value / ADC_RAW_VALUE_MAX as f32 * vdda;
        let u2 = adc2_value / ADC_RAW_VALUE_MAX as f32 * vdda;
        (self.callback)(u1, u2);
    }
}
