use serde::{Deserialize, Serialize};
use std::fmt;

/// A measurement channel of the source-measure unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Current,
    Voltage,
}

impl Channel {
    pub fn unit(&self) -> &'static str {
        match self {
            Channel::Current => "A",
            Channel::Voltage => "V",
        }
    }

    pub fn column_name(&self) -> &'static str {
        match self {
            Channel::Current => "Current [A]",
            Channel::Voltage => "Voltage [V]",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Current => write!(f, "current"),
            Channel::Voltage => write!(f, "voltage"),
        }
    }
}

/// Which channels an acquisition reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelSelection {
    Current,
    Voltage,
    #[default]
    Both,
}

impl ChannelSelection {
    /// Channels in read order; current always comes first.
    pub fn channels(&self) -> &'static [Channel] {
        match self {
            ChannelSelection::Current => &[Channel::Current],
            ChannelSelection::Voltage => &[Channel::Voltage],
            ChannelSelection::Both => &[Channel::Current, Channel::Voltage],
        }
    }

    pub fn includes(&self, channel: Channel) -> bool {
        self.channels().contains(&channel)
    }
}

/// One reading of the selected channels. Unselected channels stay `None`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Reading {
    pub current: Option<f64>,
    pub voltage: Option<f64>,
}

impl Reading {
    pub fn new(current: Option<f64>, voltage: Option<f64>) -> Self {
        Self { current, voltage }
    }

    pub fn get(&self, channel: Channel) -> Option<f64> {
        match channel {
            Channel::Current => self.current,
            Channel::Voltage => self.voltage,
        }
    }

    pub fn set(&mut self, channel: Channel, value: f64) {
        match channel {
            Channel::Current => self.current = Some(value),
            Channel::Voltage => self.voltage = Some(value),
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.current, self.voltage) {
            (Some(i), Some(u)) => write!(f, "I = {i:.12} A, U = {u:.5} V"),
            (Some(i), None) => write!(f, "I = {i:.12} A"),
            (None, Some(u)) => write!(f, "U = {u:.5} V"),
            (None, None) => write!(f, "-"),
        }
    }
}

/// One entry of a device-internal measurement buffer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BufferEntry {
    /// Seconds since the batch started
    pub timestamp: f64,
    pub value: f64,
}

impl BufferEntry {
    pub fn new(timestamp: f64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// A point in time paired with the reading taken there.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub index: usize,
    /// Seconds since the acquisition started
    pub timestamp: f64,
    pub reading: Reading,
}
