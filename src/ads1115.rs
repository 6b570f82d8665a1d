//! ADS1115 16-bit delta-sigma ADC driver
//!
//! The converter exposes a single 16-bit configuration register packing the
//! conversion trigger, input multiplexer, gain, operating mode, data rate
//! and comparator setup. Every setting is updated read-modify-write so
//! sibling fields survive (see [`crate::bits`]).

use core::fmt::Debug;
use core::marker::PhantomData;

use embedded_hal::blocking::i2c;
use log::{debug, trace};

use crate::bits;
use crate::{Error, Outcome};

/// ADS1115 default I2C address (ADDR pin tied to ground)
pub const DEFAULT_ADDRESS: u8 = 0x48;

/// Conversion result register
pub const REG_CONVERSION: u8 = 0x00;
/// Configuration register, two bytes
pub const REG_CONFIG: u8 = 0x01;
/// Comparator low threshold register
pub const REG_LO_THRESH: u8 = 0x02;
/// Comparator high threshold register
pub const REG_HI_THRESH: u8 = 0x03;

/// Factory default low threshold bytes
pub const DEFAULT_LO_THRESH: u16 = 0x8000;
/// Factory default high threshold bytes
pub const DEFAULT_HI_THRESH: u16 = 0x7FFF;

// Config byte 1 field masks
const MASK_OS: u8 = 0x80;
const MASK_MUX: u8 = 0x70;
const MASK_PGA: u8 = 0x0E;
const MASK_MODE: u8 = 0x01;

// Config byte 2 field masks
const MASK_DATA_RATE: u8 = 0xE0;
const MASK_COMP_MODE: u8 = 0x10;
const MASK_COMP_POLARITY: u8 = 0x08;
const MASK_COMP_LATCH: u8 = 0x04;
const MASK_COMP_QUEUE: u8 = 0x03;

/// Input multiplexer, selects the sampled pin pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Multiplexer {
    /// AIN0 (positive) against AIN1 (negative), the default
    Ain0Ain1 = 0b000,
    Ain0Ain3 = 0b001,
    Ain1Ain3 = 0b010,
    Ain2Ain3 = 0b011,
    /// AIN0 against ground
    Ain0Gnd = 0b100,
    Ain1Gnd = 0b101,
    Ain2Gnd = 0b110,
    Ain3Gnd = 0b111,
}

impl Multiplexer {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b111 {
            0b000 => Multiplexer::Ain0Ain1,
            0b001 => Multiplexer::Ain0Ain3,
            0b010 => Multiplexer::Ain1Ain3,
            0b011 => Multiplexer::Ain2Ain3,
            0b100 => Multiplexer::Ain0Gnd,
            0b101 => Multiplexer::Ain1Gnd,
            0b110 => Multiplexer::Ain2Gnd,
            _ => Multiplexer::Ain3Gnd,
        }
    }
}

/// Programmable gain amplifier full-scale range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Gain {
    /// +/- 6.144 V
    Fs6144 = 0b000,
    /// +/- 4.096 V
    Fs4096 = 0b001,
    /// +/- 2.048 V, the default
    Fs2048 = 0b010,
    /// +/- 1.024 V
    Fs1024 = 0b011,
    /// +/- 0.512 V
    Fs512 = 0b100,
    /// +/- 0.256 V (register values 5..7 all select this range)
    Fs256 = 0b101,
}

impl Gain {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b111 {
            0b000 => Gain::Fs6144,
            0b001 => Gain::Fs4096,
            0b010 => Gain::Fs2048,
            0b011 => Gain::Fs1024,
            0b100 => Gain::Fs512,
            // 101, 110 and 111 all map to the smallest range
            _ => Gain::Fs256,
        }
    }

    /// Full-scale range in millivolts for this gain setting
    pub fn full_scale_mv(&self) -> f64 {
        match self {
            Gain::Fs6144 => 6144.0,
            Gain::Fs4096 => 4096.0,
            Gain::Fs2048 => 2048.0,
            Gain::Fs1024 => 1024.0,
            Gain::Fs512 => 512.0,
            Gain::Fs256 => 256.0,
        }
    }
}

/// Operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    /// Free-running conversions
    Continuous = 0,
    /// One conversion per trigger, then power down (the default)
    SingleShot = 1,
}

/// Conversion data rate in samples per second
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataRate {
    Sps8 = 0b000,
    Sps16 = 0b001,
    Sps32 = 0b010,
    Sps64 = 0b011,
    /// 128 SPS, the default
    Sps128 = 0b100,
    Sps250 = 0b101,
    Sps475 = 0b110,
    Sps860 = 0b111,
}

impl DataRate {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b111 {
            0b000 => DataRate::Sps8,
            0b001 => DataRate::Sps16,
            0b010 => DataRate::Sps32,
            0b011 => DataRate::Sps64,
            0b100 => DataRate::Sps128,
            0b101 => DataRate::Sps250,
            0b110 => DataRate::Sps475,
            _ => DataRate::Sps860,
        }
    }
}

/// Comparator operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ComparatorMode {
    /// Assert above high threshold, deassert below low threshold
    Traditional = 0,
    /// Assert whenever outside the threshold window
    Window = 1,
}

/// Comparator output polarity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ComparatorPolarity {
    ActiveLow = 0,
    ActiveHigh = 1,
}

/// Comparator latching behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ComparatorLatch {
    NonLatching = 0,
    Latching = 1,
}

/// Number of out-of-range conversions before the comparator asserts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ComparatorQueue {
    AfterOne = 0b00,
    AfterTwo = 0b01,
    AfterFour = 0b10,
    /// Comparator disabled, ALERT pin held high impedance (the default)
    Disabled = 0b11,
}

impl ComparatorQueue {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => ComparatorQueue::AfterOne,
            0b01 => ComparatorQueue::AfterTwo,
            0b10 => ComparatorQueue::AfterFour,
            _ => ComparatorQueue::Disabled,
        }
    }
}

/// ADS1115 driver object, generic over an I2C connector
pub struct Ads1115<Conn, Err> {
    conn: Conn,
    address: u8,
    _err: PhantomData<Err>,
}

impl<Conn, Err> Ads1115<Conn, Err>
where
    Conn: i2c::Read<Error = Err> + i2c::Write<Error = Err> + i2c::WriteRead<Error = Err>,
    Err: Debug,
{
    /// Create a new ADS1115 driver instance and check communication by
    /// reading back the configuration register
    pub fn new(conn: Conn, address: u8) -> Result<Self, Error<Err>> {
        let mut s = Ads1115 {
            conn,
            address,
            _err: PhantomData,
        };

        s.read_config()?;

        Ok(s)
    }

    /// Release the underlying I2C connector
    pub fn destroy(self) -> Conn {
        self.conn
    }

    /// Construct without the communication probe, for tests that supply
    /// their own transaction expectations
    #[cfg(test)]
    pub(crate) fn test_instance(conn: Conn, address: u8) -> Self {
        Ads1115 {
            conn,
            address,
            _err: PhantomData,
        }
    }

    /// Trigger a single conversion
    ///
    /// In continuous mode a single-shot trigger is meaningless, so the call
    /// reports `Outcome::Unchanged` and leaves the register untouched.
    pub fn start_single_conversion(&mut self) -> Result<Outcome, Error<Err>> {
        let (b1, b2) = self.read_config()?;

        if !bits::test_bit(b1, 0)? {
            debug!("single-shot trigger ignored, converter is in continuous mode");
            return Ok(Outcome::Unchanged);
        }

        let b1 = bits::set_masked_bits(b1, 1, MASK_OS)?;
        self.write_config(b1, b2)?;

        Ok(Outcome::Applied)
    }

    /// Check whether a conversion is currently in progress
    pub fn is_converting(&mut self) -> Result<bool, Error<Err>> {
        let (b1, _) = self.read_config()?;

        // OS reads 0 while a conversion is running
        Ok(!bits::test_bit(b1, 7)?)
    }

    /// Read the conversion register and scale to volts using the currently
    /// configured gain's full-scale range
    pub fn read_voltage(&mut self) -> Result<f64, Error<Err>> {
        let gain = self.gain()?;

        let mut buff = [0u8; 2];
        self.read_register(REG_CONVERSION, &mut buff)?;

        let count = bits::combine_bytes(buff[0], buff[1]) as i16;
        let volts = (count as f64) * gain.full_scale_mv() / 32767.0 / 1000.0;

        trace!("raw count {} at gain {:?} -> {:.4} V", count, gain, volts);

        Ok(volts)
    }

    /// Fetch the configured input multiplexer
    pub fn multiplexer(&mut self) -> Result<Multiplexer, Error<Err>> {
        let (b1, _) = self.read_config()?;
        Ok(Multiplexer::from_bits(bits::extract_bits(b1, 4, 6)?))
    }

    /// Select the input pin pair to sample
    pub fn set_multiplexer(&mut self, mux: Multiplexer) -> Result<(), Error<Err>> {
        let (b1, b2) = self.read_config()?;
        let b1 = bits::set_masked_bits(b1, mux as u8, MASK_MUX)?;
        self.write_config(b1, b2)
    }

    /// Fetch the configured gain
    pub fn gain(&mut self) -> Result<Gain, Error<Err>> {
        let (b1, _) = self.read_config()?;
        Ok(Gain::from_bits(bits::extract_bits(b1, 1, 3)?))
    }

    /// Configure the programmable gain amplifier
    pub fn set_gain(&mut self, gain: Gain) -> Result<(), Error<Err>> {
        let (b1, b2) = self.read_config()?;
        let b1 = bits::set_masked_bits(b1, gain as u8, MASK_PGA)?;
        self.write_config(b1, b2)
    }

    /// Fetch the operating mode
    pub fn mode(&mut self) -> Result<Mode, Error<Err>> {
        let (b1, _) = self.read_config()?;

        match bits::test_bit(b1, 0)? {
            false => Ok(Mode::Continuous),
            true => Ok(Mode::SingleShot),
        }
    }

    /// Configure continuous or single-shot operation
    pub fn set_mode(&mut self, mode: Mode) -> Result<(), Error<Err>> {
        let (b1, b2) = self.read_config()?;
        let b1 = bits::set_masked_bits(b1, mode as u8, MASK_MODE)?;
        self.write_config(b1, b2)
    }

    /// Fetch the configured data rate
    pub fn data_rate(&mut self) -> Result<DataRate, Error<Err>> {
        let (_, b2) = self.read_config()?;
        Ok(DataRate::from_bits(bits::extract_bits(b2, 5, 7)?))
    }

    /// Configure the conversion data rate
    pub fn set_data_rate(&mut self, rate: DataRate) -> Result<(), Error<Err>> {
        let (b1, b2) = self.read_config()?;
        let b2 = bits::set_masked_bits(b2, rate as u8, MASK_DATA_RATE)?;
        self.write_config(b1, b2)
    }

    /// Fetch the comparator mode
    pub fn comparator_mode(&mut self) -> Result<ComparatorMode, Error<Err>> {
        let (_, b2) = self.read_config()?;

        match bits::test_bit(b2, 4)? {
            false => Ok(ComparatorMode::Traditional),
            true => Ok(ComparatorMode::Window),
        }
    }

    /// Configure traditional or window comparator operation
    pub fn set_comparator_mode(&mut self, mode: ComparatorMode) -> Result<(), Error<Err>> {
        let (b1, b2) = self.read_config()?;
        let b2 = bits::set_masked_bits(b2, mode as u8, MASK_COMP_MODE)?;
        self.write_config(b1, b2)
    }

    /// Fetch the comparator output polarity
    pub fn comparator_polarity(&mut self) -> Result<ComparatorPolarity, Error<Err>> {
        let (_, b2) = self.read_config()?;

        match bits::test_bit(b2, 3)? {
            false => Ok(ComparatorPolarity::ActiveLow),
            true => Ok(ComparatorPolarity::ActiveHigh),
        }
    }

    /// Configure the comparator output polarity
    pub fn set_comparator_polarity(
        &mut self,
        polarity: ComparatorPolarity,
    ) -> Result<(), Error<Err>> {
        let (b1, b2) = self.read_config()?;
        let b2 = bits::set_masked_bits(b2, polarity as u8, MASK_COMP_POLARITY)?;
        self.write_config(b1, b2)
    }

    /// Fetch the comparator latching behaviour
    pub fn comparator_latch(&mut self) -> Result<ComparatorLatch, Error<Err>> {
        let (_, b2) = self.read_config()?;

        match bits::test_bit(b2, 2)? {
            false => Ok(ComparatorLatch::NonLatching),
            true => Ok(ComparatorLatch::Latching),
        }
    }

    /// Configure the comparator latching behaviour
    pub fn set_comparator_latch(&mut self, latch: ComparatorLatch) -> Result<(), Error<Err>> {
        let (b1, b2) = self.read_config()?;
        let b2 = bits::set_masked_bits(b2, latch as u8, MASK_COMP_LATCH)?;
        self.write_config(b1, b2)
    }

    /// Fetch the comparator queue depth
    pub fn comparator_queue(&mut self) -> Result<ComparatorQueue, Error<Err>> {
        let (_, b2) = self.read_config()?;
        Ok(ComparatorQueue::from_bits(bits::extract_bits(b2, 0, 1)?))
    }

    /// Configure the comparator queue depth (or disable the comparator)
    pub fn set_comparator_queue(&mut self, queue: ComparatorQueue) -> Result<(), Error<Err>> {
        let (b1, b2) = self.read_config()?;
        let b2 = bits::set_masked_bits(b2, queue as u8, MASK_COMP_QUEUE)?;
        self.write_config(b1, b2)
    }

    /// Read the comparator low threshold as a raw 16-bit value
    pub fn low_threshold(&mut self) -> Result<u16, Error<Err>> {
        let mut buff = [0u8; 2];
        self.read_register(REG_LO_THRESH, &mut buff)?;
        Ok(bits::combine_bytes(buff[0], buff[1]))
    }

    /// Write the comparator low threshold as a raw 16-bit value
    pub fn set_low_threshold(&mut self, threshold: u16) -> Result<(), Error<Err>> {
        let (msb, lsb) = bits::split_word(threshold);
        self.write_register(REG_LO_THRESH, &[msb, lsb])
    }

    /// Read the comparator high threshold as a raw 16-bit value
    pub fn high_threshold(&mut self) -> Result<u16, Error<Err>> {
        let mut buff = [0u8; 2];
        self.read_register(REG_HI_THRESH, &mut buff)?;
        Ok(bits::combine_bytes(buff[0], buff[1]))
    }

    /// Write the comparator high threshold as a raw 16-bit value
    pub fn set_high_threshold(&mut self, threshold: u16) -> Result<(), Error<Err>> {
        let (msb, lsb) = bits::split_word(threshold);
        self.write_register(REG_HI_THRESH, &[msb, lsb])
    }

    /// Restore both comparator thresholds to their factory defaults
    pub fn restore_default_thresholds(&mut self) -> Result<(), Error<Err>> {
        self.set_low_threshold(DEFAULT_LO_THRESH)?;
        self.set_high_threshold(DEFAULT_HI_THRESH)
    }

    fn read_config(&mut self) -> Result<(u8, u8), Error<Err>> {
        let mut buff = [0u8; 2];
        self.read_register(REG_CONFIG, &mut buff)?;
        Ok((buff[0], buff[1]))
    }

    fn write_config(&mut self, b1: u8, b2: u8) -> Result<(), Error<Err>> {
        self.write_register(REG_CONFIG, &[b1, b2])
    }

    fn read_register(&mut self, register: u8, buff: &mut [u8]) -> Result<(), Error<Err>> {
        self.conn
            .write_read(self.address, &[register], buff)
            .map_err(Error::Conn)?;

        trace!("read register 0x{:02x}: {:x?}", register, buff);

        Ok(())
    }

    fn write_register(&mut self, register: u8, data: &[u8]) -> Result<(), Error<Err>> {
        let mut buff = [0u8; 3];
        buff[0] = register;
        buff[1..=data.len()].copy_from_slice(data);

        trace!("write register 0x{:02x}: {:x?}", register, data);

        self.conn
            .write(self.address, &buff[..=data.len()])
            .map_err(Error::Conn)
    }
}

#[cfg(test)]
mod test {
    use embedded_hal_mock::i2c::{Mock as I2cMock, Transaction as I2cTransaction};

    use assert_approx_eq::assert_approx_eq;

    use super::*;

    fn adc(i2c: &I2cMock) -> Ads1115<I2cMock, embedded_hal_mock::MockError> {
        Ads1115 {
            conn: i2c.clone(),
            address: DEFAULT_ADDRESS,
            _err: PhantomData,
        }
    }

    #[test]
    fn test_set_multiplexer_preserves_siblings() {
        // Power-on default config is 0x8583; selecting AIN0/GND must only
        // touch bits 6-4 of the first byte
        let expectations = [
            I2cTransaction::write_read(DEFAULT_ADDRESS, vec![0x01], vec![0x85, 0x83]),
            I2cTransaction::write(DEFAULT_ADDRESS, vec![0x01, 0xC5, 0x83]),
        ];
        let mut i2c = I2cMock::new(&expectations);

        let mut sensor = adc(&i2c);
        sensor.set_multiplexer(Multiplexer::Ain0Gnd).unwrap();

        i2c.done();
    }

    #[test]
    fn test_trigger_in_continuous_mode_is_a_noop() {
        // Mode bit clear (continuous): no write transaction may follow
        let expectations = [I2cTransaction::write_read(
            DEFAULT_ADDRESS,
            vec![0x01],
            vec![0x84, 0x83],
        )];
        let mut i2c = I2cMock::new(&expectations);

        let mut sensor = adc(&i2c);
        let outcome = sensor.start_single_conversion().unwrap();
        assert_eq!(outcome, Outcome::Unchanged);

        i2c.done();
    }

    #[test]
    fn test_trigger_in_single_shot_mode() {
        let expectations = [
            I2cTransaction::write_read(DEFAULT_ADDRESS, vec![0x01], vec![0x05, 0x83]),
            I2cTransaction::write(DEFAULT_ADDRESS, vec![0x01, 0x85, 0x83]),
        ];
        let mut i2c = I2cMock::new(&expectations);

        let mut sensor = adc(&i2c);
        let outcome = sensor.start_single_conversion().unwrap();
        assert_eq!(outcome, Outcome::Applied);

        i2c.done();
    }

    #[test]
    fn test_is_converting() {
        let expectations = [
            I2cTransaction::write_read(DEFAULT_ADDRESS, vec![0x01], vec![0x05, 0x83]),
            I2cTransaction::write_read(DEFAULT_ADDRESS, vec![0x01], vec![0x85, 0x83]),
        ];
        let mut i2c = I2cMock::new(&expectations);

        let mut sensor = adc(&i2c);
        assert!(sensor.is_converting().unwrap());
        assert!(!sensor.is_converting().unwrap());

        i2c.done();
    }

    #[test]
    fn test_full_scale_count_scales_to_full_scale_volts() {
        // Gain bits 000 (+/- 6.144 V), raw count 0x7FFF
        let expectations = [
            I2cTransaction::write_read(DEFAULT_ADDRESS, vec![0x01], vec![0x81, 0x83]),
            I2cTransaction::write_read(DEFAULT_ADDRESS, vec![0x00], vec![0x7F, 0xFF]),
        ];
        let mut i2c = I2cMock::new(&expectations);

        let mut sensor = adc(&i2c);
        let v = sensor.read_voltage().unwrap();
        assert_approx_eq!(v, 6.144, 1e-6);

        i2c.done();
    }

    #[test]
    fn test_zero_count_scales_to_zero_volts() {
        for gain_bits in 0u8..6 {
            let b1 = 0x81 | (gain_bits << 1);
            let expectations = [
                I2cTransaction::write_read(DEFAULT_ADDRESS, vec![0x01], vec![b1, 0x83]),
                I2cTransaction::write_read(DEFAULT_ADDRESS, vec![0x00], vec![0x00, 0x00]),
            ];
            let mut i2c = I2cMock::new(&expectations);

            let mut sensor = adc(&i2c);
            let v = sensor.read_voltage().unwrap();
            assert_approx_eq!(v, 0.0, 1e-9);

            i2c.done();
        }
    }

    #[test]
    fn test_negative_count() {
        // 0x8000 is -32768, one count past negative full scale at 2.048 V
        let expectations = [
            I2cTransaction::write_read(DEFAULT_ADDRESS, vec![0x01], vec![0x85, 0x83]),
            I2cTransaction::write_read(DEFAULT_ADDRESS, vec![0x00], vec![0x80, 0x00]),
        ];
        let mut i2c = I2cMock::new(&expectations);

        let mut sensor = adc(&i2c);
        let v = sensor.read_voltage().unwrap();
        assert_approx_eq!(v, -2.048 * 32768.0 / 32767.0, 1e-6);

        i2c.done();
    }

    #[test]
    fn test_gain_decode_collapses_reserved_values() {
        for (bits, gain) in [(0b101u8, Gain::Fs256), (0b110, Gain::Fs256), (0b111, Gain::Fs256)] {
            let b1 = 0x81 | (bits << 1);
            let expectations = [I2cTransaction::write_read(
                DEFAULT_ADDRESS,
                vec![0x01],
                vec![b1, 0x83],
            )];
            let mut i2c = I2cMock::new(&expectations);

            let mut sensor = adc(&i2c);
            assert_eq!(sensor.gain().unwrap(), gain);

            i2c.done();
        }
    }

    #[test]
    fn test_restore_default_thresholds() {
        let expectations = [
            I2cTransaction::write(DEFAULT_ADDRESS, vec![0x02, 0x80, 0x00]),
            I2cTransaction::write(DEFAULT_ADDRESS, vec![0x03, 0x7F, 0xFF]),
        ];
        let mut i2c = I2cMock::new(&expectations);

        let mut sensor = adc(&i2c);
        sensor.restore_default_thresholds().unwrap();

        i2c.done();
    }

    #[test]
    fn test_set_data_rate() {
        let expectations = [
            I2cTransaction::write_read(DEFAULT_ADDRESS, vec![0x01], vec![0x85, 0x83]),
            I2cTransaction::write(DEFAULT_ADDRESS, vec![0x01, 0x85, 0xE3]),
        ];
        let mut i2c = I2cMock::new(&expectations);

        let mut sensor = adc(&i2c);
        sensor.set_data_rate(DataRate::Sps860).unwrap();

        i2c.done();
    }

    #[test]
    fn test_comparator_queue_round_trip() {
        let expectations = [
            I2cTransaction::write_read(DEFAULT_ADDRESS, vec![0x01], vec![0x85, 0x83]),
            I2cTransaction::write(DEFAULT_ADDRESS, vec![0x01, 0x85, 0x81]),
            I2cTransaction::write_read(DEFAULT_ADDRESS, vec![0x01], vec![0x85, 0x81]),
        ];
        let mut i2c = I2cMock::new(&expectations);

        let mut sensor = adc(&i2c);
        sensor.set_comparator_queue(ComparatorQueue::AfterTwo).unwrap();
        assert_eq!(sensor.comparator_queue().unwrap(), ComparatorQueue::AfterTwo);

        i2c.done();
    }
}
