//! Photoresistor light sensor sampled through a shared ADS1115
//!
//! The photoresistor forms a voltage divider with a fixed 10 kOhm resistor
//! against a 5 V supply, read on one ADC input channel. The ADC is shared
//! behind a mutex so several logical sensors can multiplex it; the lock is
//! held across the whole select-trigger-poll-read sequence so another
//! holder can never retarget the multiplexer mid-conversion.

use core::fmt::Debug;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use embedded_hal::blocking::i2c;
use log::{debug, trace};

use crate::ads1115::{Ads1115, Gain, Multiplexer};
use crate::reading::{Reading, SensorKind};
use crate::{lock_unpoisoned, Error};

/// Divider supply rail
const SUPPLY_VOLTS: f64 = 5.0;

/// Fixed leg of the voltage divider
const FIXED_DIVIDER_OHMS: f64 = 10_000.0;

/// Conversion completion poll interval and attempt bound. At the slowest
/// data rate a conversion takes 125 ms, so 200 attempts is ample.
const CONVERSION_POLL_INTERVAL: Duration = Duration::from_millis(1);
const CONVERSION_POLL_ATTEMPTS: usize = 200;

/// Photoresistor driver object over a shared ADC
pub struct Photoresistor<Conn, Err> {
    adc: Arc<Mutex<Ads1115<Conn, Err>>>,
    channel: Multiplexer,
    gain: Gain,
}

impl<Conn, Err> Photoresistor<Conn, Err>
where
    Conn: i2c::Read<Error = Err> + i2c::Write<Error = Err> + i2c::WriteRead<Error = Err>,
    Err: Debug,
{
    /// Create a photoresistor on the given ADC input channel
    ///
    /// The gain defaults to the 6.144 V full-scale range, the only one
    /// covering the divider's 5 V supply rail.
    pub fn new(adc: Arc<Mutex<Ads1115<Conn, Err>>>, channel: Multiplexer) -> Self {
        Photoresistor {
            adc,
            channel,
            gain: Gain::Fs6144,
        }
    }

    /// Override the ADC gain written before each conversion
    pub fn set_gain(&mut self, gain: Gain) {
        self.gain = gain;
    }

    /// Sample the divider tap voltage
    ///
    /// Retargets the multiplexer and gain, triggers a single conversion
    /// and polls for completion, all under one ADC lock.
    pub fn read_voltage(&mut self) -> Result<f64, Error<Err>> {
        let mut adc = lock_unpoisoned(&self.adc);

        adc.set_multiplexer(self.channel)?;
        adc.set_gain(self.gain)?;
        adc.start_single_conversion()?;

        let mut complete = false;
        for _ in 0..CONVERSION_POLL_ATTEMPTS {
            if !adc.is_converting()? {
                complete = true;
                break;
            }
            thread::sleep(CONVERSION_POLL_INTERVAL);
        }

        if !complete {
            debug!("conversion still running after {} polls", CONVERSION_POLL_ATTEMPTS);
            return Err(Error::Device("conversion did not complete"));
        }

        adc.read_voltage()
    }

    /// Read the photoresistor resistance in ohms
    ///
    /// Solves the divider equation for the variable leg. The tap voltage
    /// is clamped to the supply range first; an input pinned at the rail
    /// reads as infinite resistance.
    pub fn resistance(&mut self) -> Result<f64, Error<Err>> {
        let volts = self.read_voltage()?.clamp(0.0, SUPPLY_VOLTS);
        let ohms = FIXED_DIVIDER_OHMS * volts / (SUPPLY_VOLTS - volts);

        trace!("divider tap {:.4} V -> {:.1} ohm", volts, ohms);

        Ok(ohms)
    }

    /// Take a timestamped light reading
    pub fn reading(&mut self) -> Result<Reading, Error<Err>> {
        Ok(Reading::now(SensorKind::Light, self.resistance()?))
    }
}
