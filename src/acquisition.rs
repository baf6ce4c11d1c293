use crate::error::AcquisitionError;
use crate::types::{Channel, ChannelSelection, Reading, Sample};
use chrono::{DateTime, Local};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parameters of one acquisition run.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionRequest {
    /// Number of samples to take, `None` runs until cancelled
    pub count: Option<usize>,
    /// Nominal time between two samples
    pub interval: Duration,
    /// How often a running batch is polled for completion and previews
    pub poll_cadence: Duration,
    pub channels: ChannelSelection,
}

impl AcquisitionRequest {
    /// Request for `count` samples taken `interval` apart.
    pub fn bounded(count: usize, interval: Duration) -> Self {
        Self {
            count: Some(count),
            interval,
            poll_cadence: Duration::from_millis(500),
            channels: ChannelSelection::Both,
        }
    }

    /// Request that keeps sampling until cancelled.
    pub fn unbounded(interval: Duration) -> Self {
        Self {
            count: None,
            ..Self::bounded(0, interval)
        }
    }

    pub fn with_max_count(mut self, count: Option<usize>) -> Self {
        self.count = count;
        self
    }

    pub fn with_poll_cadence(mut self, poll_cadence: Duration) -> Self {
        self.poll_cadence = poll_cadence;
        self
    }

    pub fn with_channels(mut self, channels: ChannelSelection) -> Self {
        self.channels = channels;
        self
    }

    pub fn validate(&self) -> Result<(), AcquisitionError> {
        if self.interval.is_zero() {
            return Err(AcquisitionError::InvalidRequest(
                "interval must be greater than zero".to_string(),
            ));
        }
        if self.poll_cadence.is_zero() {
            return Err(AcquisitionError::InvalidRequest(
                "poll cadence must be greater than zero".to_string(),
            ));
        }
        if self.count == Some(0) {
            return Err(AcquisitionError::InvalidRequest(
                "count must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle of a run. Disarming is not a state: it happens on every exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Armed,
    Polling,
    Reading,
    Completed,
    Cancelled,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Cancelled | RunState::Failed
        )
    }
}

/// How a run that returned data ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Completed,
    Cancelled,
}

/// Mutable state of one in-flight acquisition.
#[derive(Debug)]
pub struct AcquisitionRun {
    samples: Vec<Sample>,
    target: Option<usize>,
    index: usize,
    state: RunState,
    warnings: usize,
    started_at: DateTime<Local>,
}

impl AcquisitionRun {
    pub fn new(target: Option<usize>) -> Self {
        Self {
            samples: Vec::with_capacity(target.unwrap_or(0).min(1 << 16)),
            target,
            index: 0,
            state: RunState::Idle,
            warnings: 0,
            started_at: Local::now(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Record that a read failure was reported to the user.
    pub fn note_warning(&mut self) {
        self.warnings += 1;
    }

    pub fn warnings(&self) -> usize {
        self.warnings
    }

    pub fn is_full(&self) -> bool {
        self.target.is_some_and(|target| self.samples.len() >= target)
    }

    /// Move to a new state. Terminal states are final.
    pub fn transition(&mut self, next: RunState) {
        if self.state.is_terminal() {
            log::debug!("Ignoring transition {:?} -> {:?}", self.state, next);
            return;
        }
        log::debug!("Run state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Append the next sample. Returns `false` if it was rejected because the
    /// run already ended or reached its target.
    pub fn push(&mut self, timestamp: f64, reading: Reading) -> bool {
        if self.state.is_terminal() || self.is_full() {
            return false;
        }
        self.samples.push(Sample {
            index: self.index,
            timestamp,
            reading,
        });
        self.index += 1;
        true
    }

    pub fn complete(&mut self) {
        self.transition(RunState::Completed);
    }

    pub fn cancel(&mut self) {
        self.transition(RunState::Cancelled);
    }

    pub fn fail(&mut self) {
        self.transition(RunState::Failed);
    }

    pub fn into_recording(self, channels: ChannelSelection) -> Recording {
        let outcome = match self.state {
            RunState::Cancelled => Outcome::Cancelled,
            _ => Outcome::Completed,
        };
        Recording {
            samples: self.samples,
            channels,
            outcome,
            warnings: self.warnings,
            started_at: self.started_at,
        }
    }
}

/// The ordered result of an acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub samples: Vec<Sample>,
    pub channels: ChannelSelection,
    pub outcome: Outcome,
    /// Read failures that were logged as warnings during the run
    #[serde(default)]
    pub warnings: usize,
    pub started_at: DateTime<Local>,
}

pub const TIME_COLUMN_NAME: &str = "Time [s]";

impl Recording {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.outcome == Outcome::Completed
    }

    pub fn timestamps(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.timestamp).collect()
    }

    /// All values of one channel, `None` if the channel was not recorded.
    pub fn channel(&self, channel: Channel) -> Option<Vec<f64>> {
        if !self.channels.includes(channel) {
            return None;
        }
        Some(
            self.samples
                .iter()
                .map(|s| s.reading.get(channel).unwrap_or(f64::NAN))
                .collect(),
        )
    }

    /// (min, max) of one channel.
    pub fn range(&self, channel: Channel) -> Option<(f64, f64)> {
        let values = self.channel(channel)?;
        if values.is_empty() {
            return None;
        }
        let min = values.iter().fold(f64::INFINITY, |a, &b| a.min(b));
        let max = values.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        Some((min, max))
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        std::iter::once(TIME_COLUMN_NAME)
            .chain(self.channels.channels().iter().map(|c| c.column_name()))
            .collect()
    }

    /// Samples as a matrix: one row per sample, columns as in
    /// [`Recording::column_names`].
    pub fn to_array(&self) -> Array2<f64> {
        let channels = self.channels.channels();
        let width = 1 + channels.len();
        Array2::from_shape_fn((self.samples.len(), width), |(row, col)| {
            let sample = &self.samples[row];
            match col {
                0 => sample.timestamp,
                c => sample.reading.get(channels[c - 1]).unwrap_or(f64::NAN),
            }
        })
    }
}
