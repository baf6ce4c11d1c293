//! Hardware-free device generating a [`TestCurve`] on the host clock.

use super::Device;
use crate::error::DeviceError;
use crate::types::{BufferEntry, Channel};
use crate::waveform::TestCurve;
use log::debug;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Batch {
    started: Instant,
    count: usize,
    interval: Duration,
}

impl Batch {
    /// Readings the device would have taken by now, the first one at t = 0.
    fn completed(&self) -> usize {
        let elapsed = self.started.elapsed().as_secs_f64();
        let taken = (elapsed / self.interval.as_secs_f64()).floor() as usize + 1;
        taken.min(self.count)
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticDevice {
    curve: TestCurve,
    current_scale: f64,
    batch: Option<Batch>,
    armed_at: Option<Instant>,
}

impl SyntheticDevice {
    pub fn new(curve: TestCurve) -> Self {
        Self {
            curve,
            current_scale: 1e-9,
            batch: None,
            armed_at: None,
        }
    }

    /// Factor applied to the curve to obtain the current in A.
    pub fn with_current_scale(mut self, scale: f64) -> Self {
        self.current_scale = scale;
        self
    }

    pub fn curve(&self) -> &TestCurve {
        &self.curve
    }

    fn value(&self, channel: Channel, t: f64) -> f64 {
        let v = self.curve.value(t);
        match channel {
            Channel::Current => v * self.current_scale,
            Channel::Voltage => v,
        }
    }
}

impl Device for SyntheticDevice {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        self.batch = None;
        self.armed_at = None;
        Ok(())
    }

    fn arm_output(&mut self, on: bool) -> Result<(), DeviceError> {
        self.armed_at = on.then(Instant::now);
        Ok(())
    }

    fn start_batch(&mut self, count: usize, interval: Duration) -> Result<(), DeviceError> {
        if interval.is_zero() {
            return Err(DeviceError::Protocol("interval must not be zero".to_string()));
        }
        debug!("Synthetic batch: {count} readings every {interval:?}");
        self.batch = Some(Batch {
            started: Instant::now(),
            count,
            interval,
        });
        Ok(())
    }

    fn is_batch_finished(&mut self) -> Result<bool, DeviceError> {
        Ok(self
            .batch
            .is_none_or(|batch| batch.completed() >= batch.count))
    }

    fn abort_batch(&mut self) -> Result<(), DeviceError> {
        if let Some(batch) = self.batch.as_mut() {
            batch.count = batch.completed();
        }
        Ok(())
    }

    fn read_latest(&mut self, channel: Channel) -> Result<f64, DeviceError> {
        let batch = self
            .batch
            .ok_or_else(|| DeviceError::NotReady("no batch running".to_string()))?;
        match batch.completed() {
            0 => Err(DeviceError::NotReady("no reading taken yet".to_string())),
            n => {
                let t = (n - 1) as f64 * batch.interval.as_secs_f64();
                Ok(self.value(channel, t))
            }
        }
    }

    fn read_full_buffer(&mut self, channel: Channel) -> Result<Vec<BufferEntry>, DeviceError> {
        let Some(batch) = self.batch else {
            return Ok(Vec::new());
        };
        let dt = batch.interval.as_secs_f64();
        Ok((0..batch.completed())
            .map(|i| {
                let t = i as f64 * dt;
                BufferEntry::new(t, self.value(channel, t))
            })
            .collect())
    }

    fn read_single(&mut self, channel: Channel) -> Result<f64, DeviceError> {
        let armed_at = *self.armed_at.get_or_insert_with(Instant::now);
        Ok(self.value(channel, armed_at.elapsed().as_secs_f64()))
    }
}
