//! BME280 combined temperature / pressure / humidity sensor driver
//!
//! The device is operated in forced mode: each measurement triggers a single
//! conversion, waits out the oversampling-dependent settle time, then reads
//! the raw data block and runs the Bosch double-precision compensation
//! formulas against the factory calibration constants read at init.
//!
//! The compensation coefficients and clamp bounds are taken from the BME280
//! datasheet (section 4.2.3) and must not be altered; any deviation changes
//! output values silently.

use core::fmt::Debug;
use core::marker::PhantomData;

use std::thread;
use std::time::Duration;

use embedded_hal::blocking::i2c;
use log::{debug, trace, warn};

use crate::bits;
use crate::Error;

/// BME280 default I2C address (SDO tied to ground)
pub const DEFAULT_ADDRESS: u8 = 0x76;

/// Expected chip identification byte
pub const CHIP_ID: u8 = 0x60;

const REG_CALIB: u8 = 0x88;
const REG_CHIP_ID: u8 = 0xD0;
const REG_RESET: u8 = 0xE0;
const REG_CALIB_HUM: u8 = 0xE1;
const REG_CTRL_HUM: u8 = 0xF2;
const REG_STATUS: u8 = 0xF3;
const REG_CTRL_MEAS: u8 = 0xF4;
const REG_CONFIG: u8 = 0xF5;
const REG_DATA: u8 = 0xF7;

const RESET_COMMAND: u8 = 0xB6;

// ctrl_meas field masks
const MASK_OSRS_T: u8 = 0xE0;
const MASK_OSRS_P: u8 = 0x1C;
const MASK_MODE: u8 = 0x03;

// ctrl_hum / config field masks
const MASK_OSRS_H: u8 = 0x07;
const MASK_STANDBY: u8 = 0xE0;
const MASK_FILTER: u8 = 0x1C;

/// Identification / reset attempts before giving up on the device
const INIT_ATTEMPTS: usize = 5;
/// Status polls after a soft reset before declaring the NVM copy failed
const RESET_POLL_ATTEMPTS: usize = 5;

const INIT_RETRY_DELAY: Duration = Duration::from_millis(10);
const RESET_POLL_DELAY: Duration = Duration::from_millis(2);

/// Pressure clamp bounds in Pascal
const PRESSURE_MIN_PA: f64 = 30000.0;
const PRESSURE_MAX_PA: f64 = 110000.0;

/// Oversampling factor for a single measurement channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Oversampling {
    /// Channel disabled, output reads as invalid
    Skipped = 0b000,
    X1 = 0b001,
    X2 = 0b010,
    X4 = 0b011,
    X8 = 0b100,
    /// 16x oversampling (register values 6 and 7 also select this)
    X16 = 0b101,
}

impl Oversampling {
    /// Effective sample count, used in the measurement-time formula
    fn multiplier(&self) -> f64 {
        match self {
            Oversampling::Skipped => 0.0,
            Oversampling::X1 => 1.0,
            Oversampling::X2 => 2.0,
            Oversampling::X4 => 4.0,
            Oversampling::X8 => 8.0,
            Oversampling::X16 => 16.0,
        }
    }
}

/// IIR filter coefficient for pressure and temperature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Filter {
    Off = 0b000,
    X2 = 0b001,
    X4 = 0b010,
    X8 = 0b011,
    X16 = 0b100,
}

/// Standby interval between conversions in normal mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Standby {
    Us500 = 0b000,
    Ms62_5 = 0b001,
    Ms125 = 0b010,
    Ms250 = 0b011,
    Ms500 = 0b100,
    Ms1000 = 0b101,
    Ms10 = 0b110,
    Ms20 = 0b111,
}

/// Factory calibration constants, read once after reset and immutable for
/// the rest of the device session
#[derive(Debug, Default, Clone, Copy)]
pub struct Calibration {
    pub dig_t1: u16,
    pub dig_t2: i16,
    pub dig_t3: i16,
    pub dig_p1: u16,
    pub dig_p2: i16,
    pub dig_p3: i16,
    pub dig_p4: i16,
    pub dig_p5: i16,
    pub dig_p6: i16,
    pub dig_p7: i16,
    pub dig_p8: i16,
    pub dig_p9: i16,
    pub dig_h1: u8,
    pub dig_h2: i16,
    pub dig_h3: u8,
    pub dig_h4: i16,
    pub dig_h5: i16,
    pub dig_h6: i8,
}

impl Calibration {
    /// Decode the 0x88 block (26 bytes, temperature/pressure plus dig_H1 at
    /// its tail address 0xA1) and the 0xE1 humidity block (7 bytes)
    fn parse(block: &[u8; 26], hum_block: &[u8; 7]) -> Self {
        Calibration {
            dig_t1: u16::from_le_bytes([block[0], block[1]]),
            dig_t2: i16::from_le_bytes([block[2], block[3]]),
            dig_t3: i16::from_le_bytes([block[4], block[5]]),
            dig_p1: u16::from_le_bytes([block[6], block[7]]),
            dig_p2: i16::from_le_bytes([block[8], block[9]]),
            dig_p3: i16::from_le_bytes([block[10], block[11]]),
            dig_p4: i16::from_le_bytes([block[12], block[13]]),
            dig_p5: i16::from_le_bytes([block[14], block[15]]),
            dig_p6: i16::from_le_bytes([block[16], block[17]]),
            dig_p7: i16::from_le_bytes([block[18], block[19]]),
            dig_p8: i16::from_le_bytes([block[20], block[21]]),
            dig_p9: i16::from_le_bytes([block[22], block[23]]),
            dig_h1: block[25],
            dig_h2: i16::from_le_bytes([hum_block[0], hum_block[1]]),
            dig_h3: hum_block[2],
            // dig_H4 and dig_H5 share the nibble at 0xE5
            dig_h4: ((hum_block[3] as i8 as i16) << 4) | (hum_block[4] & 0x0F) as i16,
            dig_h5: ((hum_block[5] as i8 as i16) << 4) | (hum_block[4] >> 4) as i16,
            dig_h6: hum_block[6] as i8,
        }
    }
}

/// A compensated measurement
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Temperature in degrees celsius, clamped to -40..85
    pub temperature: f64,
    /// Pressure in hPa, clamped to 300..1100
    pub pressure: f64,
    /// Relative humidity in percent, clamped to 0..100
    pub humidity: f64,
}

/// BME280 driver object, generic over an I2C connector
pub struct Bme280<Conn, Err> {
    conn: Conn,
    address: u8,
    calib: Calibration,
    osrs_t: Oversampling,
    osrs_p: Oversampling,
    osrs_h: Oversampling,
    /// Fine temperature from the last temperature compensation, consumed by
    /// the pressure and humidity formulas
    t_fine: f64,
    _err: PhantomData<Err>,
}

impl<Conn, Err> Bme280<Conn, Err>
where
    Conn: i2c::Read<Error = Err> + i2c::Write<Error = Err> + i2c::WriteRead<Error = Err>,
    Err: Debug,
{
    /// Create a new BME280 driver instance
    ///
    /// Probes the chip identification register (up to five attempts with a
    /// short delay), soft-resets the device and reads out the factory
    /// calibration block.
    pub fn new(conn: Conn, address: u8) -> Result<Self, Error<Err>> {
        let mut s = Bme280 {
            conn,
            address,
            calib: Calibration::default(),
            osrs_t: Oversampling::X1,
            osrs_p: Oversampling::X1,
            osrs_h: Oversampling::X1,
            t_fine: 0.0,
            _err: PhantomData,
        };

        let mut found = false;
        for attempt in 0..INIT_ATTEMPTS {
            match s.read_byte(REG_CHIP_ID) {
                Ok(CHIP_ID) => {
                    found = true;
                    break;
                }
                Ok(id) => warn!("unexpected chip id 0x{:02x} (attempt {})", id, attempt + 1),
                Err(e) => warn!("chip id read failed (attempt {}): {:?}", attempt + 1, e),
            }

            thread::sleep(INIT_RETRY_DELAY);
        }
        if !found {
            return Err(Error::NoDevice);
        }

        s.soft_reset()?;
        s.read_calibration()?;

        Ok(s)
    }

    /// Release the underlying I2C connector
    pub fn destroy(self) -> Conn {
        self.conn
    }

    /// Soft reset the device, then poll the status register until the
    /// non-volatile memory copy completes
    pub fn soft_reset(&mut self) -> Result<(), Error<Err>> {
        self.write_register(REG_RESET, &[RESET_COMMAND])?;

        for _attempt in 0..RESET_POLL_ATTEMPTS {
            thread::sleep(RESET_POLL_DELAY);

            let status = self.read_byte(REG_STATUS)?;
            if !bits::test_bit(status, 0)? {
                return Ok(());
            }
        }

        Err(Error::NvmCopy)
    }

    /// Factory calibration constants read at init
    pub fn calibration(&self) -> &Calibration {
        &self.calib
    }

    /// Configure per-channel oversampling
    ///
    /// The device is put to sleep first if it is not already asleep; the
    /// humidity setting only latches on the subsequent measurement-control
    /// write, so ctrl_hum is always written before ctrl_meas.
    pub fn set_oversampling(
        &mut self,
        temperature: Oversampling,
        pressure: Oversampling,
        humidity: Oversampling,
    ) -> Result<(), Error<Err>> {
        let ctrl = self.ensure_sleep()?;

        let hum = self.read_byte(REG_CTRL_HUM)?;
        let hum = bits::set_masked_bits(hum, humidity as u8, MASK_OSRS_H)?;
        self.write_register(REG_CTRL_HUM, &[hum])?;

        let ctrl = bits::set_masked_bits(ctrl, temperature as u8, MASK_OSRS_T)?;
        let ctrl = bits::set_masked_bits(ctrl, pressure as u8, MASK_OSRS_P)?;
        self.write_register(REG_CTRL_MEAS, &[ctrl])?;

        self.osrs_t = temperature;
        self.osrs_p = pressure;
        self.osrs_h = humidity;

        Ok(())
    }

    /// Configure the IIR filter coefficient
    pub fn set_filter(&mut self, filter: Filter) -> Result<(), Error<Err>> {
        self.ensure_sleep()?;

        let config = self.read_byte(REG_CONFIG)?;
        let config = bits::set_masked_bits(config, filter as u8, MASK_FILTER)?;
        self.write_register(REG_CONFIG, &[config])
    }

    /// Configure the normal-mode standby interval
    pub fn set_standby(&mut self, standby: Standby) -> Result<(), Error<Err>> {
        self.ensure_sleep()?;

        let config = self.read_byte(REG_CONFIG)?;
        let config = bits::set_masked_bits(config, standby as u8, MASK_STANDBY)?;
        self.write_register(REG_CONFIG, &[config])
    }

    /// Trigger a forced-mode conversion and return all three compensated
    /// values
    ///
    /// Aborts entirely on a failed raw read rather than returning partial
    /// data.
    pub fn measure(&mut self) -> Result<Measurement, Error<Err>> {
        // Forced mode: one conversion, device returns to sleep by itself
        let ctrl = self.read_byte(REG_CTRL_MEAS)?;
        let ctrl = bits::set_masked_bits(ctrl, 0b01, MASK_MODE)?;
        self.write_register(REG_CTRL_MEAS, &[ctrl])?;

        let wait = self.measurement_delay();
        trace!("forced conversion, settling {:?}", wait);
        thread::sleep(wait);

        let mut buff = [0u8; 8];
        self.read_register(REG_DATA, &mut buff)?;

        let raw_pressure =
            ((buff[0] as u32) << 12) | ((buff[1] as u32) << 4) | ((buff[2] as u32) >> 4);
        let raw_temperature =
            ((buff[3] as u32) << 12) | ((buff[4] as u32) << 4) | ((buff[5] as u32) >> 4);
        let raw_humidity = ((buff[6] as u16) << 8) | buff[7] as u16;

        // Temperature first, its fine-temperature side effect feeds the
        // pressure and humidity formulas
        let temperature = self.compensate_temperature(raw_temperature as f64);
        let pressure = self.compensate_pressure(raw_pressure as f64);
        let humidity = self.compensate_humidity(raw_humidity as f64);

        debug!(
            "measurement: {:.2} C, {:.2} hPa, {:.2} %",
            temperature, pressure, humidity
        );

        Ok(Measurement {
            temperature,
            pressure,
            humidity,
        })
    }

    /// Measure and return the compensated temperature in degrees celsius
    pub fn temperature(&mut self) -> Result<f64, Error<Err>> {
        Ok(self.measure()?.temperature)
    }

    /// Measure and return the compensated pressure in hPa
    pub fn pressure(&mut self) -> Result<f64, Error<Err>> {
        Ok(self.measure()?.pressure)
    }

    /// Measure and return the compensated relative humidity in percent
    pub fn humidity(&mut self) -> Result<f64, Error<Err>> {
        Ok(self.measure()?.humidity)
    }

    /// Worst-case conversion time for the configured oversampling factors,
    /// per the datasheet measurement-time formula
    fn measurement_delay(&self) -> Duration {
        let ms = 1.25
            + 2.3 * self.osrs_t.multiplier()
            + 2.3 * self.osrs_p.multiplier()
            + 0.575
            + 2.3 * self.osrs_h.multiplier()
            + 0.575;

        Duration::from_micros((ms * 1000.0) as u64)
    }

    /// Put the device to sleep if it is measuring, returning the latest
    /// measurement-control byte
    fn ensure_sleep(&mut self) -> Result<u8, Error<Err>> {
        let ctrl = self.read_byte(REG_CTRL_MEAS)?;

        if bits::extract_bits(ctrl, 0, 1)? == 0 {
            return Ok(ctrl);
        }

        let ctrl = bits::set_masked_bits(ctrl, 0, MASK_MODE)?;
        self.write_register(REG_CTRL_MEAS, &[ctrl])?;

        Ok(ctrl)
    }

    fn read_calibration(&mut self) -> Result<(), Error<Err>> {
        let mut block = [0u8; 26];
        self.read_register(REG_CALIB, &mut block)?;

        let mut hum_block = [0u8; 7];
        self.read_register(REG_CALIB_HUM, &mut hum_block)?;

        self.calib = Calibration::parse(&block, &hum_block);
        trace!("calibration: {:?}", self.calib);

        Ok(())
    }

    fn compensate_temperature(&mut self, raw: f64) -> f64 {
        let t1 = self.calib.dig_t1 as f64;
        let t2 = self.calib.dig_t2 as f64;
        let t3 = self.calib.dig_t3 as f64;

        let var1 = (raw / 16384.0 - t1 / 1024.0) * t2;
        let var2 = (raw / 131072.0 - t1 / 8192.0) * (raw / 131072.0 - t1 / 8192.0) * t3;

        self.t_fine = var1 + var2;

        ((var1 + var2) / 5120.0).clamp(-40.0, 85.0)
    }

    fn compensate_pressure(&self, raw: f64) -> f64 {
        let c = &self.calib;

        let mut var1 = self.t_fine / 2.0 - 64000.0;
        let mut var2 = var1 * var1 * (c.dig_p6 as f64) / 32768.0;
        var2 += var1 * (c.dig_p5 as f64) * 2.0;
        var2 = var2 / 4.0 + (c.dig_p4 as f64) * 65536.0;
        var1 = ((c.dig_p3 as f64) * var1 * var1 / 524288.0 + (c.dig_p2 as f64) * var1) / 524288.0;
        var1 = (1.0 + var1 / 32768.0) * (c.dig_p1 as f64);

        if var1 == 0.0 {
            // Avoid dividing by zero, report the minimum measurable pressure
            return PRESSURE_MIN_PA / 100.0;
        }

        let mut p = 1048576.0 - raw;
        p = (p - var2 / 4096.0) * 6250.0 / var1;
        var1 = (c.dig_p9 as f64) * p * p / 2147483648.0;
        var2 = p * (c.dig_p8 as f64) / 32768.0;
        p += (var1 + var2 + (c.dig_p7 as f64)) / 16.0;

        p.clamp(PRESSURE_MIN_PA, PRESSURE_MAX_PA) / 100.0
    }

    fn compensate_humidity(&self, raw: f64) -> f64 {
        let c = &self.calib;

        let var_h = self.t_fine - 76800.0;
        let var_h = (raw - ((c.dig_h4 as f64) * 64.0 + (c.dig_h5 as f64) / 16384.0 * var_h))
            * ((c.dig_h2 as f64) / 65536.0
                * (1.0
                    + (c.dig_h6 as f64) / 67108864.0
                        * var_h
                        * (1.0 + (c.dig_h3 as f64) / 67108864.0 * var_h)));
        let var_h = var_h * (1.0 - (c.dig_h1 as f64) * var_h / 524288.0);

        var_h.clamp(0.0, 100.0)
    }

    fn read_byte(&mut self, register: u8) -> Result<u8, Error<Err>> {
        let mut buff = [0u8; 1];
        self.read_register(register, &mut buff)?;
        Ok(buff[0])
    }

    fn read_register(&mut self, register: u8, buff: &mut [u8]) -> Result<(), Error<Err>> {
        self.conn
            .write_read(self.address, &[register], buff)
            .map_err(Error::Conn)?;

        trace!("read register 0x{:02x}: {:x?}", register, buff);

        Ok(())
    }

    fn write_register(&mut self, register: u8, data: &[u8]) -> Result<(), Error<Err>> {
        let mut buff = [0u8; 2];
        buff[0] = register;
        buff[1..=data.len()].copy_from_slice(data);

        trace!("write register 0x{:02x}: {:x?}", register, data);

        self.conn
            .write(self.address, &buff[..=data.len()])
            .map_err(Error::Conn)
    }
}
