//! Temperature sources polled by the uplink scheduler.

use std::{error::Error as StdError, thread, time::Duration};

use i2cdev::{core::I2CDevice, linux::LinuxI2CDevice};
use log::{error, info, warn};

/// A synchronous temperature source.
pub trait Sensor {
    /// Returns the current temperature in Celsius, or `None` if the hardware is not ready.
    fn read(&mut self) -> Option<f32>;
}

impl<S: Sensor + ?Sized> Sensor for Box<S> {
    fn read(&mut self) -> Option<f32> {
        (**self).read()
    }
}

/// SHTC3 temperature and humidity sensor on Linux I2C.
pub struct Shtc3 {
    dev: LinuxI2CDevice,
}

pub const SHTC3_ADDR: u16 = 0x70;

const CMD_WAKEUP: [u8; 2] = [0x35, 0x17];
const CMD_SLEEP: [u8; 2] = [0xb0, 0x98];
const CMD_SOFT_RESET: [u8; 2] = [0x80, 0x5d];
/// Normal mode, temperature first, clock stretching disabled.
const CMD_MEASURE_T: [u8; 2] = [0x78, 0x66];
const MEASURE_MS: u64 = 20;

impl Shtc3 {
    pub fn new(path: &str) -> Result<Self, Box<dyn StdError>> {
        const FN_NAME: &'static str = "Shtc3::new";

        let mut dev = match LinuxI2CDevice::new(path, SHTC3_ADDR) {
            Err(e) => {
                error!("[{}] new SHTC3 device error: {}", FN_NAME, e);
                return Err(Box::new(e));
            }
            Ok(dev) => dev,
        };
        for cmd in [CMD_WAKEUP, CMD_SOFT_RESET, CMD_SLEEP] {
            if let Err(e) = dev.write(&cmd) {
                error!("[{}] write command {:02x?} error: {}", FN_NAME, cmd, e);
                return Err(Box::new(e));
            }
            thread::sleep(Duration::from_millis(1));
        }
        info!("[{}] SHTC3 initialized", FN_NAME);

        Ok(Shtc3 { dev })
    }

    fn measure(&mut self) -> Result<f32, Box<dyn StdError>> {
        self.dev.write(&CMD_WAKEUP)?;
        thread::sleep(Duration::from_millis(1));
        self.dev.write(&CMD_MEASURE_T)?;
        thread::sleep(Duration::from_millis(MEASURE_MS));
        let mut buf = [0u8; 3];
        self.dev.read(&mut buf)?;
        self.dev.write(&CMD_SLEEP)?;

        if crc8(&buf[..2]) != buf[2] {
            return Err(format!("temperature CRC mismatch: {:02x?}", buf).into());
        }
        Ok(raw_to_celsius(u16::from_be_bytes([buf[0], buf[1]])))
    }
}

impl Sensor for Shtc3 {
    fn read(&mut self) -> Option<f32> {
        const FN_NAME: &'static str = "Shtc3::read";

        match self.measure() {
            Err(e) => {
                warn!("[{}] read temperature error: {}", FN_NAME, e);
                None
            }
            Ok(temp) => Some(temp),
        }
    }
}

/// Temperature in Celsius: -45 + 175 * value / 65536
fn raw_to_celsius(raw: u16) -> f32 {
    -45.0 + 175.0 * raw as f32 / 65536.0
}

/// Sensirion CRC-8 (polynomial 0x31, init 0xff).
fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0xff;
    for d in data {
        crc ^= d;
        for _ in 0..8 {
            crc = match crc & 0x80 {
                0 => crc << 1,
                _ => (crc << 1) ^ 0x31,
            };
        }
    }
    crc
}

/// Bench sensor that sweeps between 20 and 25 °C in half-degree steps.
pub struct SimSensor {
    temp: f32,
    step: f32,
}

const SIM_MIN: f32 = 20.0;
const SIM_MAX: f32 = 25.0;
const SIM_STEP: f32 = 0.5;

impl Default for SimSensor {
    fn default() -> Self {
        SimSensor::new()
    }
}

impl SimSensor {
    pub fn new() -> Self {
        SimSensor {
            temp: SIM_MIN,
            step: SIM_STEP,
        }
    }
}

impl Sensor for SimSensor {
    fn read(&mut self) -> Option<f32> {
        let temp = self.temp;
        if (self.step > 0.0 && temp >= SIM_MAX) || (self.step < 0.0 && temp <= SIM_MIN) {
            self.step = -self.step;
        }
        self.temp += self.step;
        Some(temp)
    }
}
