//! Receivers for incremental samples.
//!
//! A sink is called from inside the acquisition loop, so it must return
//! quickly: time spent here delays the next poll or read.

use crate::types::Reading;
use crossbeam_channel::{Sender, TrySendError};

pub trait SampleSink {
    fn on_sample(&mut self, index: usize, reading: &Reading);
}

impl<F> SampleSink for F
where
    F: FnMut(usize, &Reading),
{
    fn on_sample(&mut self, index: usize, reading: &Reading) {
        self(index, reading)
    }
}

/// Sink that ignores every sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct Discard;

impl SampleSink for Discard {
    fn on_sample(&mut self, _index: usize, _reading: &Reading) {}
}

/// A sample forwarded out of a running acquisition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preview {
    pub index: usize,
    pub reading: Reading,
}

/// Forwards samples over a channel without ever blocking the acquisition.
///
/// When the receiver lags behind and the channel is full, samples are dropped.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: Sender<Preview>,
    dropped: usize,
}

impl ChannelSink {
    pub fn new(sender: Sender<Preview>) -> Self {
        Self { sender, dropped: 0 }
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl SampleSink for ChannelSink {
    fn on_sample(&mut self, index: usize, reading: &Reading) {
        match self.sender.try_send(Preview {
            index,
            reading: *reading,
        }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                log::trace!("Preview channel full, dropped sample {index}");
            }
            // nobody is watching anymore
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}
