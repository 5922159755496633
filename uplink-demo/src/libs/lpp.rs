//! Cayenne Low Power Payload (LPP) encoder.
//!
//! Each record is `channel (1 byte) | type (1 byte) | value (big endian)`.

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LppType {
    /// 1 byte, resolution 1.
    DigitalInput,
    /// 2 bytes signed, resolution 0.01.
    AnalogInput,
    /// 2 bytes signed, resolution 0.1 °C.
    Temperature,
    /// 1 byte unsigned, resolution 0.5 %.
    RelativeHumidity,
    /// 2 bytes unsigned, resolution 0.1 hPa.
    BarometricPressure,
}

impl LppType {
    pub fn tag(&self) -> u8 {
        match self {
            LppType::DigitalInput => 0,
            LppType::AnalogInput => 2,
            LppType::Temperature => 103,
            LppType::RelativeHumidity => 104,
            LppType::BarometricPressure => 115,
        }
    }

    /// Value size in bytes.
    pub fn size(&self) -> usize {
        match self {
            LppType::DigitalInput | LppType::RelativeHumidity => 1,
            LppType::AnalogInput | LppType::Temperature | LppType::BarometricPressure => 2,
        }
    }

    fn multiplier(&self) -> f32 {
        match self {
            LppType::DigitalInput => 1.0,
            LppType::AnalogInput => 100.0,
            LppType::Temperature | LppType::BarometricPressure => 10.0,
            LppType::RelativeHumidity => 2.0,
        }
    }

    fn signed(&self) -> bool {
        matches!(self, LppType::AnalogInput | LppType::Temperature)
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum LppError {
    #[error("payload overflow: {needed} bytes needed, {left} left")]
    Overflow { needed: usize, left: usize },
    #[error("value {value} out of range for {kind:?}")]
    OutOfRange { kind: LppType, value: f32 },
}

/// A bounded LPP buffer.
pub struct LppPayload {
    buff: Vec<u8>,
    max_size: usize,
}

impl LppPayload {
    pub fn new(max_size: usize) -> Self {
        LppPayload {
            buff: Vec::with_capacity(max_size),
            max_size,
        }
    }

    /// Appends one record and returns the new payload size.
    pub fn add(&mut self, channel: u8, kind: LppType, value: f32) -> Result<usize, LppError> {
        let needed = 2 + kind.size();
        let left = self.max_size - self.buff.len();
        if needed > left {
            return Err(LppError::Overflow { needed, left });
        }

        let scaled = (value * kind.multiplier()).round();
        let (min, max) = match (kind.size(), kind.signed()) {
            (1, false) => (0.0, u8::MAX as f32),
            (2, true) => (i16::MIN as f32, i16::MAX as f32),
            _ => (0.0, u16::MAX as f32),
        };
        if !scaled.is_finite() || scaled < min || scaled > max {
            return Err(LppError::OutOfRange { kind, value });
        }

        self.buff.push(channel);
        self.buff.push(kind.tag());
        match (kind.size(), kind.signed()) {
            (1, _) => self.buff.push(scaled as u8),
            (_, true) => self.buff.extend_from_slice(&(scaled as i16).to_be_bytes()),
            _ => self.buff.extend_from_slice(&(scaled as u16).to_be_bytes()),
        }
        Ok(self.buff.len())
    }

    pub fn add_temperature(&mut self, channel: u8, celsius: f32) -> Result<usize, LppError> {
        self.add(channel, LppType::Temperature, celsius)
    }

    pub fn add_relative_humidity(&mut self, channel: u8, percent: f32) -> Result<usize, LppError> {
        self.add(channel, LppType::RelativeHumidity, percent)
    }

    pub fn add_barometric_pressure(&mut self, channel: u8, hpa: f32) -> Result<usize, LppError> {
        self.add(channel, LppType::BarometricPressure, hpa)
    }

    pub fn reset(&mut self) {
        self.buff.clear();
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buff.as_slice()
    }

    pub fn len(&self) -> usize {
        self.buff.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buff.is_empty()
    }
}

/// Encodes a single record into a fresh buffer of at most `super::MAX_PAYLOAD` bytes.
pub fn encode(channel: u8, kind: LppType, value: f32) -> Result<Vec<u8>, LppError> {
    let mut payload = LppPayload::new(super::MAX_PAYLOAD);
    payload.add(channel, kind, value)?;
    Ok(payload.buff)
}
