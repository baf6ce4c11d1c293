//! Measurement backends.
//!
//! Every backend implements [`Device`]; the [`Backend`] enum picks one at
//! startup so the acquisition code never has to know which one it drives.

use crate::error::DeviceError;
use crate::types::{BufferEntry, Channel, ChannelSelection, Reading};
use std::time::Duration;

pub mod instrument;
pub mod synthetic;
pub mod transport;
pub mod wireless;

#[cfg(test)]
pub(crate) mod mock;

pub use instrument::InstrumentDevice;
pub use synthetic::SyntheticDevice;
pub use transport::{ConnectionConfig, TcpTransport, TcpTransportBuilder, Transport};
pub use wireless::{GattLink, WirelessDevice, WirelessStatus};

/// A source of current/voltage readings with an internal measurement buffer.
pub trait Device {
    /// Short human readable name for log messages
    fn name(&self) -> &str;

    /// Bring the device into a known state and clear its buffers.
    fn reset(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Enable or disable the output stage.
    fn arm_output(&mut self, on: bool) -> Result<(), DeviceError>;

    /// Start a hardware-timed batch of `count` readings, `interval` apart.
    fn start_batch(&mut self, count: usize, interval: Duration) -> Result<(), DeviceError>;

    fn is_batch_finished(&mut self) -> Result<bool, DeviceError>;

    /// Stop a running batch early. Readings taken so far stay buffered.
    fn abort_batch(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Most recent buffered value of `channel`, best effort.
    fn read_latest(&mut self, channel: Channel) -> Result<f64, DeviceError>;

    /// Everything the device buffered for `channel`, in acquisition order.
    fn read_full_buffer(&mut self, channel: Channel) -> Result<Vec<BufferEntry>, DeviceError>;

    /// Take one reading right now.
    fn read_single(&mut self, channel: Channel) -> Result<f64, DeviceError>;

    /// Take one reading of every selected channel.
    fn read_reading(&mut self, channels: ChannelSelection) -> Result<Reading, DeviceError> {
        let mut reading = Reading::default();
        for &channel in channels.channels() {
            reading.set(channel, self.read_single(channel)?);
        }
        Ok(reading)
    }

    /// Latest buffered value of every selected channel.
    fn read_preview(&mut self, channels: ChannelSelection) -> Result<Reading, DeviceError> {
        let mut reading = Reading::default();
        for &channel in channels.channels() {
            reading.set(channel, self.read_latest(channel)?);
        }
        Ok(reading)
    }

    /// Audible signal, where the hardware has one.
    fn beep(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// The backend selected at startup.
pub enum Backend {
    Instrument(InstrumentDevice<TcpTransport>),
    Wireless(WirelessDevice<Box<dyn GattLink + Send>>),
    Synthetic(SyntheticDevice),
}

macro_rules! delegate {
    ($self:ident, $dev:ident => $call:expr) => {
        match $self {
            Backend::Instrument($dev) => $call,
            Backend::Wireless($dev) => $call,
            Backend::Synthetic($dev) => $call,
        }
    };
}

impl Device for Backend {
    fn name(&self) -> &str {
        delegate!(self, d => d.name())
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        delegate!(self, d => d.reset())
    }

    fn arm_output(&mut self, on: bool) -> Result<(), DeviceError> {
        delegate!(self, d => d.arm_output(on))
    }

    fn start_batch(&mut self, count: usize, interval: Duration) -> Result<(), DeviceError> {
        delegate!(self, d => d.start_batch(count, interval))
    }

    fn is_batch_finished(&mut self) -> Result<bool, DeviceError> {
        delegate!(self, d => d.is_batch_finished())
    }

    fn abort_batch(&mut self) -> Result<(), DeviceError> {
        delegate!(self, d => d.abort_batch())
    }

    fn read_latest(&mut self, channel: Channel) -> Result<f64, DeviceError> {
        delegate!(self, d => d.read_latest(channel))
    }

    fn read_full_buffer(&mut self, channel: Channel) -> Result<Vec<BufferEntry>, DeviceError> {
        delegate!(self, d => d.read_full_buffer(channel))
    }

    fn read_single(&mut self, channel: Channel) -> Result<f64, DeviceError> {
        delegate!(self, d => d.read_single(channel))
    }

    fn read_reading(&mut self, channels: ChannelSelection) -> Result<Reading, DeviceError> {
        delegate!(self, d => d.read_reading(channels))
    }

    fn read_preview(&mut self, channels: ChannelSelection) -> Result<Reading, DeviceError> {
        delegate!(self, d => d.read_preview(channels))
    }

    fn beep(&mut self) -> Result<(), DeviceError> {
        delegate!(self, d => d.beep())
    }
}

impl<D: Device + ?Sized> Device for &mut D {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        (**self).reset()
    }

    fn arm_output(&mut self, on: bool) -> Result<(), DeviceError> {
        (**self).arm_output(on)
    }

    fn start_batch(&mut self, count: usize, interval: Duration) -> Result<(), DeviceError> {
        (**self).start_batch(count, interval)
    }

    fn is_batch_finished(&mut self) -> Result<bool, DeviceError> {
        (**self).is_batch_finished()
    }

    fn abort_batch(&mut self) -> Result<(), DeviceError> {
        (**self).abort_batch()
    }

    fn read_latest(&mut self, channel: Channel) -> Result<f64, DeviceError> {
        (**self).read_latest(channel)
    }

    fn read_full_buffer(&mut self, channel: Channel) -> Result<Vec<BufferEntry>, DeviceError> {
        (**self).read_full_buffer(channel)
    }

    fn read_single(&mut self, channel: Channel) -> Result<f64, DeviceError> {
        (**self).read_single(channel)
    }

    fn read_reading(&mut self, channels: ChannelSelection) -> Result<Reading, DeviceError> {
        (**self).read_reading(channels)
    }

    fn read_preview(&mut self, channels: ChannelSelection) -> Result<Reading, DeviceError> {
        (**self).read_preview(channels)
    }

    fn beep(&mut self) -> Result<(), DeviceError> {
        (**self).beep()
    }
}
