//! Scripted devices and transports for unit tests.

use super::{Device, Transport};
use crate::error::DeviceError;
use crate::types::{BufferEntry, Channel};
use std::collections::VecDeque;
use std::time::Duration;

/// Everything the acquisition asked the device to do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Reset,
    Arm(bool),
    StartBatch(usize, Duration),
    IsFinished,
    Abort,
    Latest(Channel),
    FullBuffer(Channel),
    Single(Channel),
    Beep,
}

/// Failure injected on the n-th call of a given kind (1-based).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fault {
    Disconnect,
    Transient,
}

impl Fault {
    fn error(self) -> DeviceError {
        match self {
            Fault::Disconnect => DeviceError::Disconnected("mock unplugged".to_string()),
            Fault::Transient => DeviceError::NotReady("mock buffer empty".to_string()),
        }
    }
}

/// Device whose batch finishes after a fixed number of status polls.
#[derive(Debug, Default)]
pub struct MockDevice {
    pub calls: Vec<Call>,
    /// `is_batch_finished` returns true on this poll (1-based)
    pub finish_after_polls: usize,
    pub buffer: Vec<BufferEntry>,
    /// extra entries appended to the buffer beyond the requested count
    pub overfill: usize,
    /// entries missing from the buffer after the batch
    pub short_by: usize,
    pub status_fault: Option<(usize, Fault)>,
    pub latest_faults: Vec<usize>,
    pub single_fault: Option<(usize, Fault)>,
    pub fail_disarm: bool,
    polls: usize,
    latest_reads: usize,
    singles: usize,
}

impl MockDevice {
    pub fn finishing_after(polls: usize) -> Self {
        Self {
            finish_after_polls: polls,
            ..Default::default()
        }
    }

    pub fn disarm_count(&self) -> usize {
        self.calls.iter().filter(|c| **c == Call::Arm(false)).count()
    }

    pub fn count_calls(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(c)).count()
    }
}

impl Device for MockDevice {
    fn name(&self) -> &str {
        "mock"
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        self.calls.push(Call::Reset);
        self.buffer.clear();
        Ok(())
    }

    fn arm_output(&mut self, on: bool) -> Result<(), DeviceError> {
        self.calls.push(Call::Arm(on));
        if !on && self.fail_disarm {
            return Err(DeviceError::Disconnected("mock lost during disarm".to_string()));
        }
        Ok(())
    }

    fn start_batch(&mut self, count: usize, interval: Duration) -> Result<(), DeviceError> {
        self.calls.push(Call::StartBatch(count, interval));
        let dt = interval.as_secs_f64();
        self.buffer = (0..(count + self.overfill).saturating_sub(self.short_by))
            .map(|i| BufferEntry::new(i as f64 * dt, i as f64))
            .collect();
        Ok(())
    }

    fn is_batch_finished(&mut self) -> Result<bool, DeviceError> {
        self.calls.push(Call::IsFinished);
        self.polls += 1;
        if let Some((n, fault)) = self.status_fault {
            if n == self.polls {
                return Err(fault.error());
            }
        }
        Ok(self.polls >= self.finish_after_polls)
    }

    fn abort_batch(&mut self) -> Result<(), DeviceError> {
        self.calls.push(Call::Abort);
        Ok(())
    }

    fn read_latest(&mut self, channel: Channel) -> Result<f64, DeviceError> {
        self.calls.push(Call::Latest(channel));
        self.latest_reads += 1;
        if self.latest_faults.contains(&self.latest_reads) {
            return Err(Fault::Transient.error());
        }
        Ok(self.buffer.last().map(|e| e.value).unwrap_or(0.0))
    }

    fn read_full_buffer(&mut self, channel: Channel) -> Result<Vec<BufferEntry>, DeviceError> {
        self.calls.push(Call::FullBuffer(channel));
        let scale = match channel {
            Channel::Current => 1e-9,
            Channel::Voltage => 1.0,
        };
        Ok(self
            .buffer
            .iter()
            .map(|e| BufferEntry::new(e.timestamp, e.value * scale))
            .collect())
    }

    fn read_single(&mut self, channel: Channel) -> Result<f64, DeviceError> {
        self.calls.push(Call::Single(channel));
        self.singles += 1;
        if let Some((n, fault)) = self.single_fault {
            if n == self.singles {
                return Err(fault.error());
            }
        }
        Ok(self.singles as f64)
    }

    fn beep(&mut self) -> Result<(), DeviceError> {
        self.calls.push(Call::Beep);
        Ok(())
    }
}

/// Transport that answers queries from a script and records every line.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    pub sent: Vec<String>,
    responses: VecDeque<Result<String, DeviceError>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, response: &str) -> Self {
        self.responses.push_back(Ok(response.to_string()));
        self
    }

    pub fn fail(mut self, error: DeviceError) -> Self {
        self.responses.push_back(Err(error));
        self
    }
}

impl Transport for ScriptedTransport {
    fn write_line(&mut self, command: &str) -> Result<(), DeviceError> {
        self.sent.push(command.to_string());
        Ok(())
    }

    fn query(&mut self, command: &str) -> Result<String, DeviceError> {
        self.sent.push(command.to_string());
        self.responses
            .pop_front()
            .unwrap_or_else(|| Err(DeviceError::Timeout))
    }
}
