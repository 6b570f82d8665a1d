//! Environmental sensor drivers for I2C devices attached to a single-board
//! computer: an ADS1115 16-bit ADC, a BME280 temperature/pressure/humidity
//! sensor, a CCS811 air-quality sensor, and a photoresistor sampled through
//! the shared ADC.
//!
//! All drivers are generic over an I2C connector implementing the
//! `embedded-hal` blocking i2c traits, so they run against `linux-embedded-hal`
//! on real hardware and against `embedded-hal-mock` in tests.

use std::sync::{Mutex, MutexGuard};

pub mod bits;

pub mod reading;

pub mod ads1115;
pub mod bme280;
pub mod ccs811;
pub mod photo;

pub use crate::ads1115::Ads1115;
pub use crate::bme280::Bme280;
pub use crate::ccs811::Ccs811;
pub use crate::photo::Photoresistor;
pub use crate::reading::{Reading, SensorKind};

use crate::bits::BitError;

/// Driver error object, generic over the connector error type
#[derive(Debug, PartialEq)]
pub enum Error<ConnErr> {
    /// Underlying I2C communication error
    Conn(ConnErr),
    /// Device identification failed (wrong or missing chip id)
    NoDevice,
    /// Device rejected a command or reported an unexpected state
    Device(&'static str),
    /// Non-volatile memory copy did not complete after reset
    NvmCopy,
    /// A register field update was given a value too wide for its mask
    Bits(BitError),
    /// A wake/ready GPIO line could not be driven or read
    Pin,
    /// Operation is part of the public contract but not implemented
    NotImplemented,
}

impl<ConnErr> From<BitError> for Error<ConnErr> {
    fn from(bit_err: BitError) -> Self {
        Error::Bits(bit_err)
    }
}

/// Non-fatal advisory returned by operations that may decline to act
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The requested change was written to the device
    Applied,
    /// The request matched the current device state, nothing was written
    Unchanged,
    /// A slow mode transition was staged; the device was parked in idle and
    /// the caller must repeat the request after the settling period
    SwitchPending,
}

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
