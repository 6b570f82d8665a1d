//! CCS811 indoor air-quality sensor driver
//!
//! The device boots into a bootloader (BOOT) and must be switched into its
//! measurement application (READY) before use. Sampling is controlled by a
//! drive mode (idle, pulsed 60 s / 10 s, constant 1 s / 250 ms) plus two
//! independent flags for interrupt generation and threshold-gated reporting,
//! all packed into the MEAS_MODE register.
//!
//! Switching to a slower drive mode requires an idle settling period the
//! driver does not block on: the device is parked in idle with both flags
//! cleared and the call reports [`Outcome::SwitchPending`]; the caller
//! repeats the request once the device has settled.
//!
//! When interrupt generation is enabled a background worker thread watches
//! the nINT data-ready line and invokes a user callback with each new
//! (eCO2, TVOC) pair. Cancellation is cooperative and `stop` joins the
//! worker before returning, so no callback fires after it completes. Do not
//! stop the driver from inside the callback itself.

use core::fmt::Debug;
use core::marker::PhantomData;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use embedded_hal::blocking::i2c;
use embedded_hal::digital::v2::{InputPin, OutputPin};
use log::{debug, trace, warn};

use crate::bits;
use crate::{lock_unpoisoned, Error, Outcome};

/// CCS811 default I2C address (ADDR pin tied to ground)
pub const DEFAULT_ADDRESS: u8 = 0x5A;

/// Expected hardware identification byte
pub const HARDWARE_ID: u8 = 0x81;

const REG_STATUS: u8 = 0x00;
const REG_MEAS_MODE: u8 = 0x01;
const REG_ALG_RESULT: u8 = 0x02;
const REG_ENV_DATA: u8 = 0x05;
const REG_NTC: u8 = 0x06;
const REG_THRESHOLDS: u8 = 0x10;
const REG_BASELINE: u8 = 0x11;
const REG_HW_ID: u8 = 0x20;
const REG_HW_VERSION: u8 = 0x21;
const REG_FW_BOOT_VERSION: u8 = 0x23;
const REG_FW_APP_VERSION: u8 = 0x24;
const REG_ERROR_ID: u8 = 0xE0;
const REG_APP_START: u8 = 0xF4;
const REG_SW_RESET: u8 = 0xFF;

const SW_RESET_KEY: [u8; 4] = [0x11, 0xE5, 0x72, 0x8A];

// MEAS_MODE field masks
const MASK_DRIVE_MODE: u8 = 0x70;
const MASK_INTERRUPT: u8 = 0x08;
const MASK_THRESHOLD: u8 = 0x04;

/// Minimum hold after asserting nWAKE before the bus transfer
const WAKE_DELAY: Duration = Duration::from_micros(50);
/// Minimum hold after releasing nWAKE
const UNWAKE_DELAY: Duration = Duration::from_micros(20);

/// Cancellation check granularity of the acquisition worker
const CANCEL_SLICE: Duration = Duration::from_millis(50);

/// Drive mode, the device sampling schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DriveMode {
    /// No measurements, lowest power
    Idle = 0b000,
    /// Constant power, one measurement per second
    Constant1s = 0b001,
    /// Pulse heating, one measurement every 10 seconds
    Pulse10s = 0b010,
    /// Low-power pulse heating, one measurement every 60 seconds
    Pulse60s = 0b011,
    /// Constant power, one raw measurement every 250 ms
    Constant250ms = 0b100,
}

impl DriveMode {
    /// Sampling period of this mode; zero for idle (no sampling)
    pub fn sample_period(&self) -> Duration {
        match self {
            DriveMode::Idle => Duration::from_secs(0),
            DriveMode::Constant1s => Duration::from_secs(1),
            DriveMode::Pulse10s => Duration::from_secs(10),
            DriveMode::Pulse60s => Duration::from_secs(60),
            DriveMode::Constant250ms => Duration::from_millis(250),
        }
    }
}

/// Decoded view of the status register, recomputed on every query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// Device is in application (READY) mode rather than BOOT
    pub ready: bool,
    /// Valid application firmware is loaded
    pub app_valid: bool,
    /// A new sample is waiting in ALG_RESULT_DATA
    pub data_ready: bool,
    /// An error is latched, see [`Ccs811::error_messages`]
    pub error: bool,
}

impl Status {
    /// Decode a raw status byte
    pub fn decode(byte: u8) -> Self {
        Status {
            ready: byte & 0x80 != 0,
            app_valid: byte & 0x10 != 0,
            data_ready: byte & 0x08 != 0,
            error: byte & 0x01 != 0,
        }
    }
}

/// Expand an ERROR_ID byte into one message per set flag
pub fn decode_error_flags(error_id: u8) -> Vec<&'static str> {
    const FLAGS: [&str; 6] = [
        "write register invalid",
        "read register invalid",
        "measure mode invalid",
        "max sensor resistance reached",
        "heater current fault",
        "heater supply error",
    ];

    FLAGS
        .iter()
        .enumerate()
        .filter(|(bit, _)| error_id & (1 << bit) != 0)
        .map(|(_, msg)| *msg)
        .collect()
}

/// One decoded ALG_RESULT_DATA sample
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AlgResult {
    /// Equivalent CO2 estimate in ppm
    pub eco2: u16,
    /// Total volatile organic compound estimate in ppb
    pub tvoc: u16,
    /// Raw status byte sampled with the data
    pub status: u8,
    /// Raw error id byte sampled with the data
    pub error_id: u8,
    /// Sense resistor current in microamps
    pub raw_current: u8,
    /// Raw ADC voltage reading across the sensor
    pub raw_voltage: u16,
}

/// Data-ready line, typically the device nINT output (asserted low)
pub trait ReadyLine: Send {
    /// Check whether the line currently signals new data
    fn is_ready(&mut self) -> bool;
}

impl<P> ReadyLine for P
where
    P: InputPin + Send,
    P::Error: Debug,
{
    fn is_ready(&mut self) -> bool {
        match self.is_low() {
            Ok(v) => v,
            Err(e) => {
                warn!("ready line read failed: {:?}", e);
                false
            }
        }
    }
}

/// Wake line, the device nWAKE input (asserted low)
pub trait WakeLine: Send {
    fn assert_wake(&mut self) -> Result<(), ()>;
    fn release_wake(&mut self) -> Result<(), ()>;
}

impl<P> WakeLine for P
where
    P: OutputPin + Send,
    P::Error: Debug,
{
    fn assert_wake(&mut self) -> Result<(), ()> {
        self.set_low().map_err(|e| warn!("wake assert failed: {:?}", e))
    }

    fn release_wake(&mut self) -> Result<(), ()> {
        self.set_high().map_err(|e| warn!("wake release failed: {:?}", e))
    }
}

/// Transport state shared with the acquisition worker
struct Inner<Conn> {
    conn: Conn,
    address: u8,
    wake: Option<Box<dyn WakeLine>>,
}

impl<Conn> Inner<Conn> {
    /// Read a register with the nWAKE bracket applied when power save is
    /// enabled. All register traffic funnels through here or
    /// `write_register`, so nested operations are bracketed automatically.
    fn read_register<Err>(&mut self, register: u8, buff: &mut [u8]) -> Result<(), Error<Err>>
    where
        Conn: i2c::WriteRead<Error = Err>,
        Err: Debug,
    {
        self.wake()?;
        let res = self.conn.write_read(self.address, &[register], buff);
        self.unwake();

        res.map_err(Error::Conn)?;
        trace!("read register 0x{:02x}: {:x?}", register, buff);

        Ok(())
    }

    fn read_byte<Err>(&mut self, register: u8) -> Result<u8, Error<Err>>
    where
        Conn: i2c::WriteRead<Error = Err>,
        Err: Debug,
    {
        let mut buff = [0u8; 1];
        self.read_register(register, &mut buff)?;
        Ok(buff[0])
    }

    fn write_register<Err>(&mut self, register: u8, data: &[u8]) -> Result<(), Error<Err>>
    where
        Conn: i2c::Write<Error = Err>,
        Err: Debug,
    {
        let mut buff = [0u8; 6];
        buff[0] = register;
        buff[1..=data.len()].copy_from_slice(data);

        trace!("write register 0x{:02x}: {:x?}", register, data);

        self.wake()?;
        let res = self.conn.write(self.address, &buff[..=data.len()]);
        self.unwake();

        res.map_err(Error::Conn)
    }

    /// Read and decode ALG_RESULT_DATA
    fn read_alg_result<Err>(&mut self) -> Result<AlgResult, Error<Err>>
    where
        Conn: i2c::WriteRead<Error = Err>,
        Err: Debug,
    {
        let mut buff = [0u8; 8];
        self.read_register(REG_ALG_RESULT, &mut buff)?;

        Ok(AlgResult {
            eco2: bits::combine_bytes(buff[0], buff[1]),
            tvoc: bits::combine_bytes(buff[2], buff[3]),
            status: buff[4],
            error_id: buff[5],
            raw_current: buff[6] >> 2,
            raw_voltage: ((buff[6] as u16 & 0x03) << 8) | buff[7] as u16,
        })
    }

    fn wake<Err>(&mut self) -> Result<(), Error<Err>> {
        if let Some(wake) = &mut self.wake {
            wake.assert_wake().map_err(|_| Error::Pin)?;
            thread::sleep(WAKE_DELAY);
        }
        Ok(())
    }

    fn unwake(&mut self) {
        if let Some(wake) = &mut self.wake {
            let _ = wake.release_wake();
            thread::sleep(UNWAKE_DELAY);
        }
    }
}

/// Ready line and callback handed to the acquisition worker
struct Acquisition {
    ready: Box<dyn ReadyLine>,
    callback: Box<dyn FnMut(u16, u16) + Send>,
}

/// Running acquisition worker
struct Worker {
    cancel: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

/// CCS811 driver object, generic over an I2C connector
pub struct Ccs811<Conn, Err> {
    inner: Arc<Mutex<Inner<Conn>>>,
    acquisition: Option<Arc<Mutex<Acquisition>>>,
    worker: Option<Worker>,
    /// Last mode value successfully written to the device, consulted for
    /// slow-switch detection and the worker's sleep interval
    mode: DriveMode,
    interrupt: bool,
    threshold: bool,
    _err: PhantomData<Err>,
}

impl<Conn, Err> Ccs811<Conn, Err>
where
    Conn: i2c::Read<Error = Err> + i2c::Write<Error = Err> + i2c::WriteRead<Error = Err>,
    Conn: Send + 'static,
    Err: Debug + Send + 'static,
{
    /// Create a new CCS811 driver instance, checking the hardware id
    pub fn new(conn: Conn, address: u8) -> Result<Self, Error<Err>> {
        let mut s = Ccs811 {
            inner: Arc::new(Mutex::new(Inner {
                conn,
                address,
                wake: None,
            })),
            acquisition: None,
            worker: None,
            mode: DriveMode::Idle,
            interrupt: false,
            threshold: false,
            _err: PhantomData,
        };

        let id = lock_unpoisoned(&s.inner).read_byte(REG_HW_ID)?;
        if id != HARDWARE_ID {
            return Err(Error::NoDevice);
        }

        Ok(s)
    }

    /// Stop the acquisition worker and release the underlying connector.
    /// Returns `None` if the transport is still shared (should not happen
    /// once the worker has been joined).
    pub fn destroy(mut self) -> Option<Conn> {
        self.stop_acquisition();
        self.acquisition = None;

        let inner = Arc::try_unwrap(self.inner).ok()?;
        let inner = match inner.into_inner() {
            Ok(i) => i,
            Err(poisoned) => poisoned.into_inner(),
        };

        Some(inner.conn)
    }

    /// Enable power-save operation: every register access is bracketed by
    /// asserting the given nWAKE line with the datasheet hold times
    pub fn set_wake_line<W>(&mut self, wake: W)
    where
        W: WakeLine + 'static,
    {
        lock_unpoisoned(&self.inner).wake = Some(Box::new(wake));
    }

    /// Register the data-ready line and callback used by interrupt-driven
    /// acquisition. Must be called before enabling interrupt mode.
    pub fn set_data_callback<R, F>(&mut self, ready: R, callback: F)
    where
        R: ReadyLine + 'static,
        F: FnMut(u16, u16) + Send + 'static,
    {
        self.acquisition = Some(Arc::new(Mutex::new(Acquisition {
            ready: Box::new(ready),
            callback: Box::new(callback),
        })));
    }

    /// Switch the device from BOOT into application (READY) mode
    pub fn app_start(&mut self) -> Result<(), Error<Err>> {
        let status = self.status()?;

        if !status.app_valid {
            return Err(Error::Device("no valid application firmware loaded"));
        }

        lock_unpoisoned(&self.inner).write_register(REG_APP_START, &[])?;

        let status = self.status()?;
        if !status.ready {
            return Err(Error::Device("application failed to start"));
        }

        debug!("application started, device ready");

        Ok(())
    }

    /// Configure the drive mode and the interrupt / threshold flags
    ///
    /// Repeating the current configuration is a no-op. A switch to a
    /// slower mode parks the device in idle and reports
    /// `Outcome::SwitchPending`; repeat the call after the settling
    /// period. Interrupt-driven acquisition is started or stopped to match
    /// the new configuration.
    pub fn set_drive_mode(
        &mut self,
        mode: DriveMode,
        interrupt: bool,
        threshold: bool,
    ) -> Result<Outcome, Error<Err>> {
        if mode == self.mode && interrupt == self.interrupt && threshold == self.threshold {
            debug!("drive mode unchanged, nothing to write");
            return Ok(Outcome::Unchanged);
        }

        // Slowing the sample rate requires an idle settling period first
        if mode != DriveMode::Idle
            && self.mode != DriveMode::Idle
            && mode.sample_period() > self.mode.sample_period()
        {
            let previous = self.mode;
            self.write_meas_mode(DriveMode::Idle, false, false)?;
            self.stop_acquisition();

            debug!(
                "slow switch {:?} -> {:?}: parked in idle, retry after settling",
                previous, mode
            );

            return Ok(Outcome::SwitchPending);
        }

        self.write_meas_mode(mode, interrupt, threshold)?;

        if interrupt && mode != DriveMode::Idle {
            self.start_acquisition()?;
        } else {
            self.stop_acquisition();
        }

        Ok(Outcome::Applied)
    }

    /// Currently configured (mode, interrupt, threshold)
    pub fn drive_mode(&self) -> (DriveMode, bool, bool) {
        (self.mode, self.interrupt, self.threshold)
    }

    /// Read and decode the status register
    pub fn status(&mut self) -> Result<Status, Error<Err>> {
        let byte = lock_unpoisoned(&self.inner).read_byte(REG_STATUS)?;
        Ok(Status::decode(byte))
    }

    /// Read the error register and expand it into messages, one per flag
    pub fn error_messages(&mut self) -> Result<Vec<&'static str>, Error<Err>> {
        let error_id = lock_unpoisoned(&self.inner).read_byte(REG_ERROR_ID)?;
        Ok(decode_error_flags(error_id))
    }

    /// Read the latest algorithm result
    pub fn alg_result(&mut self) -> Result<AlgResult, Error<Err>> {
        lock_unpoisoned(&self.inner).read_alg_result()
    }

    /// Write ambient temperature and humidity for the device's internal
    /// compensation algorithm
    ///
    /// Values are encoded in the device fixed-point format with the
    /// fraction rounded to the nearest half step; the temperature carries
    /// a +25 degree offset per the device contract.
    pub fn set_environment(
        &mut self,
        humidity_percent: f64,
        temperature_celsius: f64,
    ) -> Result<(), Error<Err>> {
        let hum = encode_env_value(humidity_percent);
        let temp = encode_env_value(temperature_celsius + 25.0);

        lock_unpoisoned(&self.inner)
            .write_register(REG_ENV_DATA, &[hum.0, hum.1, temp.0, temp.1])
    }

    /// Write the eCO2 interrupt thresholds: interrupts fire only when the
    /// reading crosses low/high with the given hysteresis
    pub fn set_thresholds(
        &mut self,
        low_ppm: u16,
        high_ppm: u16,
        hysteresis_ppm: u8,
    ) -> Result<(), Error<Err>> {
        let (low_msb, low_lsb) = bits::split_word(low_ppm);
        let (high_msb, high_lsb) = bits::split_word(high_ppm);

        lock_unpoisoned(&self.inner).write_register(
            REG_THRESHOLDS,
            &[low_msb, low_lsb, high_msb, high_lsb, hysteresis_ppm],
        )
    }

    /// Read the current drift-correction baseline as an opaque blob,
    /// suitable for persisting and restoring across sessions
    pub fn baseline(&mut self) -> Result<[u8; 2], Error<Err>> {
        let mut buff = [0u8; 2];
        lock_unpoisoned(&self.inner).read_register(REG_BASELINE, &mut buff)?;
        Ok(buff)
    }

    /// Restore a previously saved drift-correction baseline
    pub fn set_baseline(&mut self, baseline: [u8; 2]) -> Result<(), Error<Err>> {
        lock_unpoisoned(&self.inner).write_register(REG_BASELINE, &baseline)
    }

    /// Read the raw NTC register pair (reference and thermistor voltages)
    pub fn ntc(&mut self) -> Result<(u16, u16), Error<Err>> {
        let mut buff = [0u8; 4];
        lock_unpoisoned(&self.inner).read_register(REG_NTC, &mut buff)?;

        Ok((
            bits::combine_bytes(buff[0], buff[1]),
            bits::combine_bytes(buff[2], buff[3]),
        ))
    }

    /// Hardware version byte
    pub fn hardware_version(&mut self) -> Result<u8, Error<Err>> {
        lock_unpoisoned(&self.inner).read_byte(REG_HW_VERSION)
    }

    /// Bootloader firmware version
    pub fn firmware_boot_version(&mut self) -> Result<u16, Error<Err>> {
        let mut buff = [0u8; 2];
        lock_unpoisoned(&self.inner).read_register(REG_FW_BOOT_VERSION, &mut buff)?;
        Ok(bits::combine_bytes(buff[0], buff[1]))
    }

    /// Application firmware version
    pub fn firmware_app_version(&mut self) -> Result<u16, Error<Err>> {
        let mut buff = [0u8; 2];
        lock_unpoisoned(&self.inner).read_register(REG_FW_APP_VERSION, &mut buff)?;
        Ok(bits::combine_bytes(buff[0], buff[1]))
    }

    /// Software reset, returning the device to BOOT mode
    pub fn software_reset(&mut self) -> Result<(), Error<Err>> {
        self.stop_acquisition();
        self.mode = DriveMode::Idle;
        self.interrupt = false;
        self.threshold = false;

        lock_unpoisoned(&self.inner).write_register(REG_SW_RESET, &SW_RESET_KEY)
    }

    /// Erase the application firmware. Part of the public contract but not
    /// implemented by this driver.
    pub fn erase_application(&mut self) -> Result<(), Error<Err>> {
        Err(Error::NotImplemented)
    }

    /// Write an application firmware image. Part of the public contract
    /// but not implemented by this driver.
    pub fn write_application(&mut self, _image: &[u8]) -> Result<(), Error<Err>> {
        Err(Error::NotImplemented)
    }

    /// Verify the application firmware. Part of the public contract but
    /// not implemented by this driver.
    pub fn verify_application(&mut self) -> Result<(), Error<Err>> {
        Err(Error::NotImplemented)
    }

    /// Stop interrupt-driven acquisition, joining the worker thread. No
    /// callback fires after this returns. Must not be called from within
    /// the callback itself.
    pub fn stop_acquisition(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.cancel.store(true, Ordering::Relaxed);
            if worker.handle.join().is_err() {
                warn!("acquisition worker panicked");
            }
        }
    }

    /// Write MEAS_MODE read-modify-write and update the cached mode
    fn write_meas_mode(
        &mut self,
        mode: DriveMode,
        interrupt: bool,
        threshold: bool,
    ) -> Result<(), Error<Err>> {
        {
            let mut inner = lock_unpoisoned(&self.inner);

            let reg = inner.read_byte(REG_MEAS_MODE)?;
            let reg = bits::set_masked_bits(reg, mode as u8, MASK_DRIVE_MODE)?;
            let reg = bits::set_masked_bits(reg, interrupt as u8, MASK_INTERRUPT)?;
            let reg = bits::set_masked_bits(reg, threshold as u8, MASK_THRESHOLD)?;
            inner.write_register(REG_MEAS_MODE, &[reg])?;
        }

        self.mode = mode;
        self.interrupt = interrupt;
        self.threshold = threshold;

        Ok(())
    }

    /// Start the acquisition worker; a no-op if one is already running
    fn start_acquisition(&mut self) -> Result<(), Error<Err>> {
        if self.worker.is_some() {
            return Ok(());
        }

        let acquisition = match &self.acquisition {
            Some(a) => a.clone(),
            None => return Err(Error::Device("no data callback registered")),
        };

        let inner = self.inner.clone();
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();
        let period = self.mode.sample_period();

        let handle = thread::Builder::new()
            .name("ccs811-acquisition".into())
            .spawn(move || acquisition_loop(inner, acquisition, flag, period))
            .map_err(|_| Error::Device("failed to spawn acquisition worker"))?;

        self.worker = Some(Worker { cancel, handle });

        Ok(())
    }
}

/// Acquisition worker body: wait out the sampling period (in short
/// cancellable slices), check the ready line, read and deliver the sample
fn acquisition_loop<Conn, Err>(
    inner: Arc<Mutex<Inner<Conn>>>,
    acquisition: Arc<Mutex<Acquisition>>,
    cancel: Arc<AtomicBool>,
    period: Duration,
) where
    Conn: i2c::WriteRead<Error = Err>,
    Err: Debug,
{
    while !cancel.load(Ordering::Relaxed) {
        let mut remaining = period;
        while !remaining.is_zero() && !cancel.load(Ordering::Relaxed) {
            let nap = remaining.min(CANCEL_SLICE);
            thread::sleep(nap);
            remaining -= nap;
        }
        if cancel.load(Ordering::Relaxed) {
            break;
        }

        let mut acquisition = lock_unpoisoned(&acquisition);
        if !acquisition.ready.is_ready() {
            continue;
        }

        let result = {
            let mut inner = lock_unpoisoned(&inner);
            inner.read_alg_result()
        };

        match result {
            Ok(sample) => {
                trace!("sample ready: eCO2 {} ppm, TVOC {} ppb", sample.eco2, sample.tvoc);
                (acquisition.callback)(sample.eco2, sample.tvoc);
            }
            Err(e) => warn!("result read failed: {:?}", e),
        }
    }
}

/// Encode a value in the ENV_DATA fixed-point format: seven integral bits,
/// one half-step bit, one zero byte. The tenths digit rounds per the
/// datasheet: above 7 rounds the integral part up, above 2 sets the
/// half-step bit, anything lower rounds down.
fn encode_env_value(value: f64) -> (u8, u8) {
    // Scale before splitting so 48.8 yields a tenths digit of 8 rather
    // than falling victim to binary float truncation
    let scaled = (value.clamp(0.0, 127.0) * 10.0).round() as u32;
    let mut integral = (scaled / 10) as u8;
    let tenths = (scaled % 10) as u8;

    let half = if tenths > 7 {
        integral += 1;
        0
    } else if tenths > 2 {
        1
    } else {
        0
    };

    (integral.min(0x7F) << 1 | half, 0)
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use embedded_hal_mock::i2c::{Mock as I2cMock, Transaction as I2cTransaction};
    use embedded_hal_mock::MockError;

    use super::*;

    fn sensor(i2c: &I2cMock) -> Ccs811<I2cMock, MockError> {
        Ccs811 {
            inner: Arc::new(Mutex::new(Inner {
                conn: i2c.clone(),
                address: DEFAULT_ADDRESS,
                wake: None,
            })),
            acquisition: None,
            worker: None,
            mode: DriveMode::Idle,
            interrupt: false,
            threshold: false,
            _err: PhantomData,
        }
    }

    /// Ready line backed by a shared flag, settable from the test body
    struct TestReady(Arc<AtomicBool>);

    impl ReadyLine for TestReady {
        fn is_ready(&mut self) -> bool {
            self.0.load(Ordering::Relaxed)
        }
    }

    /// Wake line recording each assert/release transition
    struct TestWake(Arc<Mutex<Vec<bool>>>);

    impl WakeLine for TestWake {
        fn assert_wake(&mut self) -> Result<(), ()> {
            lock_unpoisoned(&self.0).push(true);
            Ok(())
        }

        fn release_wake(&mut self) -> Result<(), ()> {
            lock_unpoisoned(&self.0).push(false);
            Ok(())
        }
    }

    #[test]
    fn test_status_decode() {
        // Ready, no error
        let s = Status::decode(0x80);
        assert!(s.ready && !s.error && !s.data_ready && !s.app_valid);

        // Boot mode with valid firmware and fresh data
        let s = Status::decode(0x18);
        assert!(!s.ready && s.app_valid && s.data_ready && !s.error);
    }

    #[test]
    fn test_error_flag_decode() {
        // Bits 0 and 4: exactly two messages
        let msgs = decode_error_flags(0b0001_0001);
        assert_eq!(msgs, vec!["write register invalid", "heater current fault"]);

        assert!(decode_error_flags(0x00).is_empty());
        assert_eq!(decode_error_flags(0b0011_1111).len(), 6);
    }

    #[test]
    fn test_env_value_encoding() {
        // Tenths digit above 7 rounds the integral part up
        assert_eq!(encode_env_value(48.8), (49 << 1, 0));
        // Tenths digit in 3..=7 sets the half-step bit
        assert_eq!(encode_env_value(16.5), (16 << 1 | 1, 0));
        // Tenths digit of 2 or lower rounds down
        assert_eq!(encode_env_value(20.2), (20 << 1, 0));
        assert_eq!(encode_env_value(0.0), (0, 0));
        // Negative input saturates at zero
        assert_eq!(encode_env_value(-3.0), (0, 0));
    }

    #[test]
    fn test_set_environment() {
        // Humidity 48.8 % -> 49.0, temperature 25.0 C -> offset to 50.0
        let expectations = [I2cTransaction::write(
            DEFAULT_ADDRESS,
            vec![0x05, 0x62, 0x00, 0x64, 0x00],
        )];
        let mut i2c = I2cMock::new(&expectations);

        let mut s = sensor(&i2c);
        s.set_environment(48.8, 25.0).unwrap();

        i2c.done();
    }

    #[test]
    fn test_app_start() {
        let expectations = [
            I2cTransaction::write_read(DEFAULT_ADDRESS, vec![0x00], vec![0x10]),
            I2cTransaction::write(DEFAULT_ADDRESS, vec![0xF4]),
            I2cTransaction::write_read(DEFAULT_ADDRESS, vec![0x00], vec![0x90]),
        ];
        let mut i2c = I2cMock::new(&expectations);

        let mut s = sensor(&i2c);
        s.app_start().unwrap();

        i2c.done();
    }

    #[test]
    fn test_app_start_requires_valid_firmware() {
        // app_valid bit clear: no APP_START write may follow
        let expectations = [I2cTransaction::write_read(
            DEFAULT_ADDRESS,
            vec![0x00],
            vec![0x00],
        )];
        let mut i2c = I2cMock::new(&expectations);

        let mut s = sensor(&i2c);
        assert!(matches!(s.app_start(), Err(Error::Device(_))));

        i2c.done();
    }

    #[test]
    fn test_same_mode_is_a_noop() {
        let mut i2c = I2cMock::new(&[]);

        let mut s = sensor(&i2c);
        let outcome = s.set_drive_mode(DriveMode::Idle, false, false).unwrap();
        assert_eq!(outcome, Outcome::Unchanged);

        i2c.done();
    }

    #[test]
    fn test_slow_switch_parks_in_idle() {
        let expectations = [
            // Request Pulse60s while in Constant1s: park in idle, flags
            // cleared
            I2cTransaction::write_read(DEFAULT_ADDRESS, vec![0x01], vec![0x18]),
            I2cTransaction::write(DEFAULT_ADDRESS, vec![0x01, 0x00]),
            // Second call completes the transition
            I2cTransaction::write_read(DEFAULT_ADDRESS, vec![0x01], vec![0x00]),
            I2cTransaction::write(DEFAULT_ADDRESS, vec![0x01, 0x30]),
        ];
        let mut i2c = I2cMock::new(&expectations);

        let mut s = sensor(&i2c);
        s.mode = DriveMode::Constant1s;
        s.interrupt = true;

        let outcome = s.set_drive_mode(DriveMode::Pulse60s, false, false).unwrap();
        assert_eq!(outcome, Outcome::SwitchPending);
        assert_eq!(s.drive_mode(), (DriveMode::Idle, false, false));

        let outcome = s.set_drive_mode(DriveMode::Pulse60s, false, false).unwrap();
        assert_eq!(outcome, Outcome::Applied);
        assert_eq!(s.drive_mode(), (DriveMode::Pulse60s, false, false));

        i2c.done();
    }

    #[test]
    fn test_switch_to_idle_is_direct() {
        let expectations = [
            I2cTransaction::write_read(DEFAULT_ADDRESS, vec![0x01], vec![0x10]),
            I2cTransaction::write(DEFAULT_ADDRESS, vec![0x01, 0x00]),
        ];
        let mut i2c = I2cMock::new(&expectations);

        let mut s = sensor(&i2c);
        s.mode = DriveMode::Constant1s;

        let outcome = s.set_drive_mode(DriveMode::Idle, false, false).unwrap();
        assert_eq!(outcome, Outcome::Applied);

        i2c.done();
    }

    #[test]
    fn test_baseline_round_trip() {
        let expectations = [
            I2cTransaction::write_read(DEFAULT_ADDRESS, vec![0x11], vec![0xBE, 0xEF]),
            I2cTransaction::write(DEFAULT_ADDRESS, vec![0x11, 0xBE, 0xEF]),
        ];
        let mut i2c = I2cMock::new(&expectations);

        let mut s = sensor(&i2c);
        let baseline = s.baseline().unwrap();
        assert_eq!(baseline, [0xBE, 0xEF]);
        s.set_baseline(baseline).unwrap();

        i2c.done();
    }

    #[test]
    fn test_set_thresholds() {
        let expectations = [I2cTransaction::write(
            DEFAULT_ADDRESS,
            vec![0x10, 0x05, 0xDC, 0x09, 0xC4, 0x32],
        )];
        let mut i2c = I2cMock::new(&expectations);

        let mut s = sensor(&i2c);
        s.set_thresholds(1500, 2500, 50).unwrap();

        i2c.done();
    }

    #[test]
    fn test_firmware_management_is_stubbed() {
        let mut i2c = I2cMock::new(&[]);

        let mut s = sensor(&i2c);
        assert!(matches!(s.erase_application(), Err(Error::NotImplemented)));
        assert!(matches!(s.write_application(&[0u8; 8]), Err(Error::NotImplemented)));
        assert!(matches!(s.verify_application(), Err(Error::NotImplemented)));

        i2c.done();
    }

    #[test]
    fn test_wake_brackets_every_register_access() {
        let expectations = [
            I2cTransaction::write_read(DEFAULT_ADDRESS, vec![0x00], vec![0x80]),
            I2cTransaction::write(DEFAULT_ADDRESS, vec![0x11, 0x01, 0x02]),
        ];
        let mut i2c = I2cMock::new(&expectations);

        let events = Arc::new(Mutex::new(Vec::new()));

        let mut s = sensor(&i2c);
        s.set_wake_line(TestWake(events.clone()));

        s.status().unwrap();
        s.set_baseline([0x01, 0x02]).unwrap();

        // One assert/release pair per register access
        assert_eq!(*lock_unpoisoned(&events), vec![true, false, true, false]);

        i2c.done();
    }

    #[test]
    fn test_acquisition_worker_lifecycle() {
        let expectations = [
            // Enter Constant250ms with interrupts enabled
            I2cTransaction::write_read(DEFAULT_ADDRESS, vec![0x01], vec![0x00]),
            I2cTransaction::write(DEFAULT_ADDRESS, vec![0x01, 0x48]),
            // One result read once the ready line fires
            I2cTransaction::write_read(
                DEFAULT_ADDRESS,
                vec![0x02],
                vec![0x01, 0xF4, 0x00, 0x64, 0x98, 0x00, 0x00, 0x00],
            ),
            // Back to idle
            I2cTransaction::write_read(DEFAULT_ADDRESS, vec![0x01], vec![0x48]),
            I2cTransaction::write(DEFAULT_ADDRESS, vec![0x01, 0x00]),
        ];
        let mut i2c = I2cMock::new(&expectations);

        let ready = Arc::new(AtomicBool::new(true));
        let count = Arc::new(AtomicUsize::new(0));

        let mut s = sensor(&i2c);
        {
            let ready = ready.clone();
            let count = count.clone();
            s.set_data_callback(TestReady(ready.clone()), move |eco2, tvoc| {
                assert_eq!(eco2, 500);
                assert_eq!(tvoc, 100);
                count.fetch_add(1, Ordering::Relaxed);
                // Deassert so the worker reads exactly once
                ready.store(false, Ordering::Relaxed);
            });
        }

        let outcome = s
            .set_drive_mode(DriveMode::Constant250ms, true, false)
            .unwrap();
        assert_eq!(outcome, Outcome::Applied);

        thread::sleep(Duration::from_millis(600));
        assert_eq!(count.load(Ordering::Relaxed), 1);

        // Re-requesting the same configuration is idempotent: no second
        // worker, no register traffic
        let outcome = s
            .set_drive_mode(DriveMode::Constant250ms, true, false)
            .unwrap();
        assert_eq!(outcome, Outcome::Unchanged);

        // Stop joins the worker: no callback fires afterwards
        let outcome = s.set_drive_mode(DriveMode::Idle, false, false).unwrap();
        assert_eq!(outcome, Outcome::Applied);
        assert!(s.worker.is_none());

        ready.store(true, Ordering::Relaxed);
        thread::sleep(Duration::from_millis(400));
        assert_eq!(count.load(Ordering::Relaxed), 1);

        i2c.done();
    }
}
