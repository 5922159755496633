//! iFrogLab LoRa USB dongle serial port operations used by the device side.

use std::{
    io::{Error as IoError, ErrorKind},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    time,
};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Provides functions to control iFrogLab LoRa USB dongle.
pub struct IfroglabLora {
    port: SerialStream,
    buff: [u8; 24],
}

/// Chip information from command 0x00.
pub struct ChipInfo {
    pub fw_ver: u8,
    pub chip_id: u8,
    pub node_id: u32,
}

/// Operation mode of command 0x03.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Sleep = 0,
    Standby = 1,
    Tx = 2,
    Rx = 3,
}

pub struct ReadData {
    pub data: Vec<u8>,
    pub rssi: i16,
}

/// Maximum data size of command 0x05.
pub const MAX_WRITE: usize = 16;
/// Frequency range in 10 kHz.
pub const FREQ_RANGE: (u32, u32) = (86000, 102000);
pub const MAX_POWER: u8 = 15;

const TIMEOUT_MS: i64 = 1000;
const ACK_SLEEP_MS: u64 = 20;
const ACK_OK: u8 = 0x55;

impl IfroglabLora {
    /// Create a port stream for the USB dongle device.
    pub fn new(path: &str) -> Result<Self, IoError> {
        let port = tokio_serial::new(path, 115200)
            .timeout(Duration::from_secs(2))
            .open_native_async()?;

        Ok(IfroglabLora {
            port,
            buff: [0u8; 24],
        })
    }

    pub async fn chip_info(&mut self) -> Result<ChipInfo, IoError> {
        let data = self.command(&[0x80, 0, 0, 0x80]).await?;
        if data.len() < 2 {
            return Err(IoError::new(
                ErrorKind::InvalidData,
                "cmd-00 should with at least 2 bytes",
            ));
        }

        let mut node_id = 0;
        if data[1] >= 8 && data.len() >= 6 {
            node_id = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        }

        Ok(ChipInfo {
            fw_ver: data[1],
            chip_id: data[0],
            node_id,
        })
    }

    /// Set operation mode, frequency (10 kHz) and power level (0~15 means 2~17 dBm).
    pub async fn set_mode(&mut self, mode: Mode, freq: u32, power: u8) -> Result<(), IoError> {
        let cmd = set_mode_cmd(mode, freq, power)?;
        let data = self.command(&cmd).await?;
        expect_ok("cmd-03", data)
    }

    pub async fn write_data(&mut self, data: &[u8]) -> Result<(), IoError> {
        let cmd = write_data_cmd(data)?;
        let data = self.command(&cmd).await?;
        expect_ok("cmd-05", data)
    }

    pub async fn read_data(&mut self) -> Result<Option<ReadData>, IoError> {
        let data = self.command(&[0xC1, 0x06, 0, 0xC7]).await?;
        if data.len() == 0 {
            return Ok(None);
        } else if data.len() < 5 {
            return Err(IoError::new(
                ErrorKind::InvalidData,
                format!("cmd-06 should with at least 5 bytes, only {}", data.len()),
            ));
        }

        let split = data.len() - 2;
        Ok(Some(ReadData {
            data: data[..split].to_vec(),
            rssi: i16::from_be_bytes([data[split], data[split + 1]]),
        }))
    }

    pub async fn read_data_counter(&mut self) -> Result<u16, IoError> {
        let data = self.command(&[0xC1, 0x07, 0, 0xC6]).await?;
        if data.len() != 2 {
            return Err(IoError::new(
                ErrorKind::InvalidData,
                format!("cmd-07 should with 2 bytes, only {}", data.len()),
            ));
        }
        Ok(u16::from_be_bytes([data[0], data[1]]))
    }

    /// Write a command and wait for its ACK, retrying until [`TIMEOUT_MS`].
    async fn command(&mut self, cmd: &[u8]) -> Result<&[u8], IoError> {
        let start = Utc::now();
        let len = loop {
            self.port.write_all(cmd).await?;
            match self.read_ack().await {
                Err(e) => not_timeout(start, e)?,
                Ok(len) => break len,
            }
        };
        Ok(&self.buff[3..len + 3])
    }

    /// Read ACK for the command and return the `len` field. Data starts from BYTE-4.
    async fn read_ack(&mut self) -> Result<usize, IoError> {
        time::sleep(Duration::from_millis(ACK_SLEEP_MS)).await;

        // Read buffer and get the `len` field.
        let mut size = self.port.read(&mut self.buff).await?;
        if size < 3 {
            // Second chance.
            time::sleep(Duration::from_millis(ACK_SLEEP_MS)).await;
            size += self.port.read(&mut self.buff[size..]).await?;
            if size < 3 {
                return Err(IoError::new(
                    ErrorKind::TimedOut,
                    format!("less than 3 bytes, only {} bytes", size),
                ));
            }
        }

        let len = self.buff[2] as usize;
        if len + 4 > self.buff.len() {
            return Err(IoError::new(
                ErrorKind::InvalidData,
                format!("invalid `len` field: {}, buff: {:?}", len, self.buff),
            ));
        }

        if size < len + 4 {
            // Second chance.
            time::sleep(Duration::from_millis(ACK_SLEEP_MS)).await;
            size += self.port.read(&mut self.buff[size..]).await?;
            if size < len + 4 {
                return Err(IoError::new(
                    ErrorKind::TimedOut,
                    format!("only receive {}/{} bytes", size, len + 4),
                ));
            }
        }

        check_ack(&self.buff[..len + 4])?;
        Ok(len)
    }
}

/// Build command 0x03.
fn set_mode_cmd(mode: Mode, freq: u32, power: u8) -> Result<[u8; 9], IoError> {
    if freq < FREQ_RANGE.0 || freq > FREQ_RANGE.1 {
        return Err(IoError::new(
            ErrorKind::InvalidInput,
            format!("frequency {} out of range", freq),
        ));
    } else if power > MAX_POWER {
        return Err(IoError::new(
            ErrorKind::InvalidInput,
            format!("power {} out of range", power),
        ));
    }

    let freq = freq.to_be_bytes();
    let mut cmd: [u8; 9] = [
        0xC1, 0x03, 0x05, mode as u8, freq[1], freq[2], freq[3], power, 0,
    ];
    cmd[8] = crc(&cmd[..8]);
    Ok(cmd)
}

/// Build command 0x05.
fn write_data_cmd(data: &[u8]) -> Result<Vec<u8>, IoError> {
    if data.len() < 1 || data.len() > MAX_WRITE {
        return Err(IoError::new(
            ErrorKind::InvalidInput,
            format!("cmd-05 data size {} not in 1~{}", data.len(), MAX_WRITE),
        ));
    }

    let mut cmd = Vec::with_capacity(data.len() + 4);
    cmd.extend_from_slice(&[0xC1, 0x05, data.len() as u8]);
    cmd.extend_from_slice(data);
    cmd.push(crc(&cmd));
    Ok(cmd)
}

/// Check CRC and the error flag of a complete ACK frame.
fn check_ack(frame: &[u8]) -> Result<(), IoError> {
    let (body, tail) = frame.split_at(frame.len() - 1);
    if crc(body) != tail[0] {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("invalid CRC: {:02x?}", frame),
        ));
    }
    if frame[1] == 0xff {
        return Err(IoError::new(
            ErrorKind::Other,
            format!("{:02x?}", frame.get(3)),
        ));
    }
    Ok(())
}

fn expect_ok(name: &str, data: &[u8]) -> Result<(), IoError> {
    if data.len() != 1 {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("{} should with 1 byte", name),
        ));
    } else if data[0] != ACK_OK {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("{} not response 0x55: 0x{:02x?}", name, data[0]),
        ));
    }
    Ok(())
}

/// Calculate CRC.
fn crc(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, d| acc ^ d)
}

fn not_timeout(start: DateTime<Utc>, err: IoError) -> Result<(), IoError> {
    match Utc::now().timestamp_millis() - start.timestamp_millis() > TIMEOUT_MS {
        false => Ok(()),
        true => Err(err),
    }
}
