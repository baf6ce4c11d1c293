//! Arduino TENG board reached over Bluetooth LE.
//!
//! The board only measures voltage. Readings are pushed as notifications on
//! the reading characteristic and buffered on the host, which makes the host
//! buffer stand in for an instrument-internal one.

use super::Device;
use crate::error::DeviceError;
use crate::types::{BufferEntry, Channel};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};
use std::fmt;
use std::time::{Duration, Instant};

pub const SERVICE_UUID: &str = "00010000-9a74-4b30-9361-4a16ec09930f";
pub const STATUS_UUID: &str = "00010001-9a74-4b30-9361-4a16ec09930f";
pub const COMMAND_UUID: &str = "00010002-9a74-4b30-9361-4a16ec09930f";
pub const READING_UUID: &str = "00010003-9a74-4b30-9361-4a16ec09930f";
pub const COUNT_UUID: &str = "00010004-9a74-4b30-9361-4a16ec09930f";
pub const INTERVAL_UUID: &str = "00010005-9a74-4b30-9361-4a16ec09930f";

/// Advertised name of the board
pub const TARGET_NAME: &str = "ArduinoTENG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WirelessCommand {
    Stop = 0,
    MeasureCount = 1,
    Measure = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WirelessStatus {
    Error,
    Busy,
    WaitConnect,
    Connected,
    Measuring,
}

impl WirelessStatus {
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Error),
            1 => Some(Self::Busy),
            2 => Some(Self::WaitConnect),
            3 => Some(Self::Connected),
            4 => Some(Self::Measuring),
            _ => None,
        }
    }
}

impl fmt::Display for WirelessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Error => "ERROR",
            Self::Busy => "BUSY",
            Self::WaitConnect => "WAIT_CONNECT",
            Self::Connected => "CONNECTED",
            Self::Measuring => "MEASURING",
        };
        write!(f, "{name}")
    }
}

/// A notification payload and the moment the host received it.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub payload: Vec<u8>,
    pub received: Instant,
}

/// GATT client connected to the board. The BLE stack itself lives outside
/// this crate.
pub trait GattLink {
    fn is_connected(&self) -> bool;

    fn write_characteristic(&mut self, uuid: &str, value: &[u8]) -> Result<(), DeviceError>;

    fn read_characteristic(&mut self, uuid: &str) -> Result<Vec<u8>, DeviceError>;

    /// Notifications received on `uuid` since the last call, oldest first.
    fn take_notifications(&mut self, uuid: &str) -> Result<Vec<Notification>, DeviceError>;
}

impl<L: GattLink + ?Sized> GattLink for Box<L> {
    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn write_characteristic(&mut self, uuid: &str, value: &[u8]) -> Result<(), DeviceError> {
        (**self).write_characteristic(uuid, value)
    }

    fn read_characteristic(&mut self, uuid: &str) -> Result<Vec<u8>, DeviceError> {
        (**self).read_characteristic(uuid)
    }

    fn take_notifications(&mut self, uuid: &str) -> Result<Vec<Notification>, DeviceError> {
        (**self).take_notifications(uuid)
    }
}

/// Readings are unsigned little-endian integers of up to 8 bytes.
fn decode_reading(payload: &[u8]) -> Option<f64> {
    if payload.is_empty() || payload.len() > 8 {
        return None;
    }
    Some(LittleEndian::read_uint(payload, payload.len()) as f64)
}

fn encode_u16(value: u16) -> [u8; 2] {
    let mut buf = [0u8; 2];
    LittleEndian::write_u16(&mut buf, value);
    buf
}

pub struct WirelessDevice<L: GattLink> {
    link: L,
    buffer: Vec<BufferEntry>,
    target: usize,
    started: Option<Instant>,
}

impl<L: GattLink> WirelessDevice<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            buffer: Vec::new(),
            target: 0,
            started: None,
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn status(&mut self) -> Result<WirelessStatus, DeviceError> {
        self.ensure_connected()?;
        let data = self.link.read_characteristic(STATUS_UUID)?;
        let value = data.first().copied().unwrap_or(u8::MAX);
        WirelessStatus::from_byte(value)
            .ok_or_else(|| DeviceError::Protocol(format!("invalid status {value}")))
    }

    fn ensure_connected(&self) -> Result<(), DeviceError> {
        if self.link.is_connected() {
            Ok(())
        } else {
            Err(DeviceError::Disconnected(format!(
                "Bluetooth device '{TARGET_NAME}' was disconnected"
            )))
        }
    }

    fn send(&mut self, command: WirelessCommand) -> Result<(), DeviceError> {
        debug!("Sending {command:?}");
        self.ensure_connected()?;
        self.link
            .write_characteristic(COMMAND_UUID, &[command as u8])
    }

    fn voltage_only(channel: Channel) -> Result<(), DeviceError> {
        match channel {
            Channel::Voltage => Ok(()),
            Channel::Current => Err(DeviceError::UnsupportedChannel(channel)),
        }
    }

    /// Move pending reading notifications into the host buffer.
    fn sync(&mut self) -> Result<(), DeviceError> {
        self.ensure_connected()?;
        let notifications = self.link.take_notifications(READING_UUID)?;
        let Some(started) = self.started else {
            return Ok(());
        };
        for notification in notifications {
            if self.buffer.len() >= self.target {
                break;
            }
            match decode_reading(&notification.payload) {
                Some(value) => {
                    let timestamp = notification
                        .received
                        .saturating_duration_since(started)
                        .as_secs_f64();
                    self.buffer.push(BufferEntry::new(timestamp, value));
                }
                None => warn!(
                    "Dropping malformed reading ({} bytes)",
                    notification.payload.len()
                ),
            }
        }
        Ok(())
    }
}

impl<L: GattLink> Device for WirelessDevice<L> {
    fn name(&self) -> &str {
        "arduino"
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        self.ensure_connected()?;
        // discard readings from an earlier batch
        self.link.take_notifications(READING_UUID)?;
        self.buffer.clear();
        self.target = 0;
        self.started = None;
        Ok(())
    }

    fn arm_output(&mut self, on: bool) -> Result<(), DeviceError> {
        if on {
            self.ensure_connected()
        } else {
            self.send(WirelessCommand::Stop)
        }
    }

    fn start_batch(&mut self, count: usize, interval: Duration) -> Result<(), DeviceError> {
        let interval_ms = u16::try_from(interval.as_millis()).map_err(|_| {
            DeviceError::Protocol(format!("interval {interval:?} does not fit into u16 ms"))
        })?;
        let count_u16 = u16::try_from(count)
            .map_err(|_| DeviceError::Protocol(format!("count {count} does not fit into u16")))?;

        self.ensure_connected()?;
        self.link
            .write_characteristic(INTERVAL_UUID, &encode_u16(interval_ms))?;
        self.link
            .write_characteristic(COUNT_UUID, &encode_u16(count_u16))?;

        self.buffer.clear();
        self.buffer.reserve(count);
        self.target = count;
        self.started = Some(Instant::now());
        self.send(WirelessCommand::MeasureCount)?;
        info!("Started batch of {count} readings every {interval_ms} ms");
        Ok(())
    }

    fn is_batch_finished(&mut self) -> Result<bool, DeviceError> {
        self.sync()?;
        if self.buffer.len() >= self.target {
            return Ok(true);
        }
        match self.status()? {
            WirelessStatus::Measuring | WirelessStatus::Busy => Ok(false),
            WirelessStatus::Error => Err(DeviceError::Protocol(
                "board reported ERROR during measurement".to_string(),
            )),
            status => {
                debug!("Board stopped measuring, status {status}");
                Ok(true)
            }
        }
    }

    fn abort_batch(&mut self) -> Result<(), DeviceError> {
        self.send(WirelessCommand::Stop)
    }

    fn read_latest(&mut self, channel: Channel) -> Result<f64, DeviceError> {
        Self::voltage_only(channel)?;
        self.sync()?;
        self.buffer
            .last()
            .map(|entry| entry.value)
            .ok_or_else(|| DeviceError::NotReady("no reading received yet".to_string()))
    }

    fn read_full_buffer(&mut self, channel: Channel) -> Result<Vec<BufferEntry>, DeviceError> {
        Self::voltage_only(channel)?;
        self.sync()?;
        Ok(self.buffer.clone())
    }

    fn read_single(&mut self, channel: Channel) -> Result<f64, DeviceError> {
        Self::voltage_only(channel)?;
        self.ensure_connected()?;
        let data = self.link.read_characteristic(READING_UUID)?;
        decode_reading(&data).ok_or_else(|| DeviceError::parse(READING_UUID, &format!("{data:?}")))
    }
}
