//! Environmental sensor command-line utility
//!
//! Periodically samples a BME280 environmental sensor, a photoresistor
//! (via an ADS1115 ADC) and optionally a CCS811 air-quality sensor on a
//! local I2C bus and logs the readings.

use std::sync::{Arc, Mutex};

use humantime::Duration as HumanDuration;
use linux_embedded_hal::I2cdev;
use log::{debug, error, info, warn};
use simplelog::{LevelFilter, TermLogger};
use structopt::StructOpt;

use enviro_sensors::ads1115::{Ads1115, Multiplexer};
use enviro_sensors::bme280::{Bme280, Filter, Oversampling};
use enviro_sensors::ccs811::{Ccs811, DriveMode};
use enviro_sensors::reading::{Reading, SensorKind};
use enviro_sensors::Photoresistor;

#[derive(StructOpt)]
#[structopt(name = "enviro-util")]
/// A Command Line Interface (CLI) for reading local environmental sensors
/// (BME280, photoresistor via ADS1115) over I2C
pub struct Options {
    /// Specify the i2c interface to use to connect to the sensors
    #[structopt(short = "d", long = "i2c", default_value = "/dev/i2c-1", env = "ENVIRO_I2C")]
    i2c: String,

    /// BME280 device address
    #[structopt(long = "bme280-address", default_value = "0x76", parse(try_from_str = "parse_hex"))]
    bme280_address: u8,

    /// ADS1115 device address
    #[structopt(long = "adc-address", default_value = "0x48", parse(try_from_str = "parse_hex"))]
    adc_address: u8,

    /// ADC input channel wired to the photoresistor divider
    #[structopt(long = "photo-channel", default_value = "0")]
    photo_channel: u8,

    /// CCS811 device address; air-quality readings are skipped when unset
    #[structopt(long = "ccs811-address", parse(try_from_str = "parse_hex"))]
    ccs811_address: Option<u8>,

    /// Specify period for taking measurements
    #[structopt(short = "p", long = "sample-period", default_value = "10s")]
    pub period: HumanDuration,

    /// Number of allowed I2C errors (per measurement attempt) prior to exiting
    #[structopt(long = "allowed-errors", default_value = "3")]
    pub allowed_errors: usize,

    /// Enable verbose logging
    #[structopt(long = "log-level", default_value = "info")]
    level: LevelFilter,
}

fn parse_hex(s: &str) -> Result<u8, std::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn main() {
    // Load options
    let opts = Options::from_args();

    // Setup logging
    if let Err(e) = TermLogger::init(opts.level, simplelog::Config::default()) {
        eprintln!("Error initialising logger: {:?}", e);
        std::process::exit(-1);
    }

    let channel = match opts.photo_channel {
        0 => Multiplexer::Ain0Gnd,
        1 => Multiplexer::Ain1Gnd,
        2 => Multiplexer::Ain2Gnd,
        3 => Multiplexer::Ain3Gnd,
        v => {
            error!("Invalid ADC channel {} (expected 0..3)", v);
            std::process::exit(-1);
        }
    };

    // The kernel i2c-dev interface serialises transfers per file handle,
    // so each driver gets its own handle on the same bus
    debug!("Connecting to I2C device");
    let bme_i2c = open_i2c(&opts.i2c);
    let adc_i2c = open_i2c(&opts.i2c);

    debug!("Connecting to BME280 at 0x{:02x}", opts.bme280_address);
    let mut bme280 = match Bme280::new(bme_i2c, opts.bme280_address) {
        Ok(v) => v,
        Err(e) => {
            error!("Error connecting to BME280: {:?}", e);
            std::process::exit(-2);
        }
    };

    let setup = bme280
        .set_oversampling(Oversampling::X1, Oversampling::X1, Oversampling::X1)
        .and_then(|_| bme280.set_filter(Filter::Off));
    if let Err(e) = setup {
        error!("Error configuring BME280: {:?}", e);
        std::process::exit(-2);
    }

    debug!("Connecting to ADS1115 at 0x{:02x}", opts.adc_address);
    let adc = match Ads1115::new(adc_i2c, opts.adc_address) {
        Ok(v) => v,
        Err(e) => {
            error!("Error connecting to ADS1115: {:?}", e);
            std::process::exit(-3);
        }
    };

    let mut photo = Photoresistor::new(Arc::new(Mutex::new(adc)), channel);

    // Air-quality readings are polled rather than interrupt driven, so no
    // GPIO lines are required
    let mut ccs811 = opts.ccs811_address.map(|address| {
        debug!("Connecting to CCS811 at 0x{:02x}", address);
        let setup = Ccs811::new(open_i2c(&opts.i2c), address).and_then(|mut s| {
            s.app_start()?;
            s.set_drive_mode(DriveMode::Constant1s, false, false)?;
            Ok(s)
        });
        match setup {
            Ok(s) => s,
            Err(e) => {
                error!("Error connecting to CCS811: {:?}", e);
                std::process::exit(-5);
            }
        }
    });

    debug!("Starting sensor polling");

    loop {
        debug!("Starting sensor read cycle");

        // Errors are budgeted per read cycle
        let mut errors = 0;

        match bme280.measure() {
            Ok(m) => {
                info!("{}", Reading::now(SensorKind::Temperature, m.temperature));
                info!("{}", Reading::now(SensorKind::Pressure, m.pressure));
                info!("{}", Reading::now(SensorKind::Humidity, m.humidity));

                // Feed the ambient conditions into the air-quality
                // sensor's compensation algorithm
                if let Some(ccs) = &mut ccs811 {
                    if let Err(e) = ccs.set_environment(m.humidity, m.temperature) {
                        warn!("Error writing CCS811 environment data: {:?}", e);
                        errors += 1;
                    }
                }
            }
            Err(e) => {
                warn!("Error reading BME280: {:?}", e);
                errors += 1;
            }
        }

        if let Some(ccs) = &mut ccs811 {
            match ccs.status() {
                Ok(status) if status.data_ready => match ccs.alg_result() {
                    Ok(sample) => {
                        info!("{}", Reading::now(SensorKind::Eco2, sample.eco2 as f64));
                        info!("{}", Reading::now(SensorKind::Tvoc, sample.tvoc as f64));
                    }
                    Err(e) => {
                        warn!("Error reading CCS811 result: {:?}", e);
                        errors += 1;
                    }
                },
                Ok(status) if status.error => match ccs.error_messages() {
                    Ok(messages) => warn!("CCS811 reports errors: {:?}", messages),
                    Err(e) => {
                        warn!("Error reading CCS811 error register: {:?}", e);
                        errors += 1;
                    }
                },
                Ok(_) => debug!("CCS811 has no new data"),
                Err(e) => {
                    warn!("Error reading CCS811 status: {:?}", e);
                    errors += 1;
                }
            }
        }

        match photo.reading() {
            Ok(r) => {
                info!("{}", r);
            }
            Err(e) => {
                warn!("Error reading photoresistor: {:?}", e);
                errors += 1;
            }
        }

        if errors > opts.allowed_errors {
            error!("Exceeded maximum allowed I2C errors");
            std::process::exit(-4);
        }

        std::thread::sleep(*opts.period);
    }
}

fn open_i2c(path: &str) -> I2cdev {
    match I2cdev::new(path) {
        Ok(v) => v,
        Err(e) => {
            error!("Error opening I2C device '{}': {:?}", path, e);
            std::process::exit(-1);
        }
    }
}
