//! Running an acquisition on a worker thread.
//!
//! The worker owns the device for the duration of the run and hands it back
//! through [`AcquisitionHandle::join`]. Previews arrive over a bounded
//! channel; when the consumer falls behind, previews are dropped rather than
//! slowing the acquisition down.

use crate::acquirer::Acquirer;
use crate::acquisition::{AcquisitionRequest, Recording};
use crate::cancel::CancelToken;
use crate::device::Device;
use crate::error::AcquisitionError;
use crate::sink::{ChannelSink, Preview};
use crossbeam_channel::Receiver;
use log::debug;
use std::thread::{self, JoinHandle};

const PREVIEW_CAPACITY: usize = 64;

/// Device handed back by the worker, together with the run result.
pub type Finished<D> = (D, Result<Recording, AcquisitionError>);

#[derive(Debug, Clone, Copy)]
enum Mode {
    Bounded,
    Timed,
}

pub struct AcquisitionHandle<D> {
    previews: Receiver<Preview>,
    cancel: CancelToken,
    worker: JoinHandle<Finished<D>>,
}

impl<D> AcquisitionHandle<D> {
    /// Previews of the running acquisition. The channel disconnects once the
    /// run is over, so iterating it ends with the run.
    pub fn previews(&self) -> &Receiver<Preview> {
        &self.previews
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Wait for the worker and take back the device.
    pub fn join(self) -> Result<Finished<D>, AcquisitionError> {
        self.worker
            .join()
            .map_err(|_| AcquisitionError::WorkerPanicked)
    }
}

impl Acquirer {
    /// [`Acquirer::run_bounded`] on a worker thread.
    pub fn spawn_bounded<D>(&self, device: D, request: AcquisitionRequest) -> AcquisitionHandle<D>
    where
        D: Device + Send + 'static,
    {
        self.spawn(device, request, Mode::Bounded)
    }

    /// [`Acquirer::run_timed`] on a worker thread.
    pub fn spawn_timed<D>(&self, device: D, request: AcquisitionRequest) -> AcquisitionHandle<D>
    where
        D: Device + Send + 'static,
    {
        self.spawn(device, request, Mode::Timed)
    }

    fn spawn<D>(&self, mut device: D, request: AcquisitionRequest, mode: Mode) -> AcquisitionHandle<D>
    where
        D: Device + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(PREVIEW_CAPACITY);
        let acquirer = self.clone();

        let worker = thread::spawn(move || {
            let mut sink = ChannelSink::new(tx);
            let result = match mode {
                Mode::Bounded => acquirer.run_bounded(&mut device, &request, &mut sink),
                Mode::Timed => acquirer.run_timed(&mut device, &request, &mut sink),
            };
            if sink.dropped() > 0 {
                debug!("{} previews dropped by a slow consumer", sink.dropped());
            }
            (device, result)
        });

        AcquisitionHandle {
            previews: rx,
            cancel: self.cancel_token().clone(),
            worker,
        }
    }
}
