//! The acquisition loop.
//!
//! Two modes are supported:
//!
//! - [`Acquirer::run_bounded`]: the device takes a hardware-timed batch into
//!   its own buffer while the host polls for completion and forwards
//!   best-effort previews. The result is read back from the device buffer
//!   once, after the batch finished.
//! - [`Acquirer::run_timed`]: the host paces single-shot reads itself and
//!   every reading reaches the sink.
//!
//! Both reset and arm the device first and disarm it on every way out.

use crate::acquisition::{AcquisitionRequest, AcquisitionRun, Recording, RunState};
use crate::cancel::CancelToken;
use crate::device::Device;
use crate::error::{AcquisitionError, DeviceError};
use crate::sink::SampleSink;
use crate::types::{BufferEntry, Reading};
use log::{debug, error, info, trace, warn};
use std::ops::{Deref, DerefMut};
use std::thread;
use std::time::{Duration, Instant};

/// Keeps the device output enabled for as long as it lives.
///
/// Dropping the guard disarms the output, which also covers early returns
/// and panics inside a sink. [`ArmedOutput::disarm`] does the same but
/// reports the result.
struct ArmedOutput<'a, D: Device + ?Sized> {
    device: &'a mut D,
    armed: bool,
}

impl<'a, D: Device + ?Sized> ArmedOutput<'a, D> {
    fn arm(device: &'a mut D) -> Result<Self, DeviceError> {
        let mut guard = Self {
            device,
            armed: true,
        };
        guard.device.arm_output(true)?;
        Ok(guard)
    }

    fn disarm(mut self) -> Result<(), DeviceError> {
        self.armed = false;
        self.device.arm_output(false)
    }
}

impl<D: Device + ?Sized> Deref for ArmedOutput<'_, D> {
    type Target = D;

    fn deref(&self) -> &D {
        self.device
    }
}

impl<D: Device + ?Sized> DerefMut for ArmedOutput<'_, D> {
    fn deref_mut(&mut self) -> &mut D {
        self.device
    }
}

impl<D: Device + ?Sized> Drop for ArmedOutput<'_, D> {
    fn drop(&mut self) {
        if self.armed {
            debug!("Disarming {} on early exit", self.device.name());
            if let Err(e) = self.device.arm_output(false) {
                error!("Failed to disarm {}: {e}", self.device.name());
            }
        }
    }
}

/// Index of the newest sample a batch should hold after `elapsed`.
fn estimated_index(elapsed: Duration, interval: Duration, count: usize) -> usize {
    let taken = (elapsed.as_secs_f64() / interval.as_secs_f64()).floor() as usize;
    taken.min(count.saturating_sub(1))
}

/// Drives acquisitions on any [`Device`].
///
/// The acquirer holds no device; every run borrows one exclusively.
/// A cancelled token stays cancelled: call [`CancelToken::reset`] before
/// reusing it for another run.
///
/// ```
/// use std::time::Duration;
/// use m_teng::{AcquisitionRequest, Acquirer, Discard, SyntheticDevice, TestCurve};
///
/// let mut device = SyntheticDevice::new(TestCurve::default());
/// let request = AcquisitionRequest::bounded(5, Duration::from_millis(10))
///     .with_poll_cadence(Duration::from_millis(20));
/// let recording = Acquirer::new().run_bounded(&mut device, &request, &mut Discard)?;
/// assert_eq!(recording.len(), 5);
/// # Ok::<(), m_teng::AcquisitionError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct Acquirer {
    cancel: CancelToken,
    beep_when_done: bool,
}

impl Acquirer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Let the device beep after a bounded run completed.
    pub fn beep_when_done(mut self, beep: bool) -> Self {
        self.beep_when_done = beep;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Take `request.count` readings as one hardware-timed batch.
    ///
    /// While the batch runs, `sink` receives at most one preview per poll
    /// and only when the estimated sample index advanced, so samples may be
    /// skipped. The returned recording holds exactly `count` samples read
    /// from the device buffer, or fewer if the run was cancelled.
    pub fn run_bounded<D, S>(
        &self,
        device: &mut D,
        request: &AcquisitionRequest,
        sink: &mut S,
    ) -> Result<Recording, AcquisitionError>
    where
        D: Device + ?Sized,
        S: SampleSink + ?Sized,
    {
        request.validate()?;
        let count = request.count.ok_or_else(|| {
            AcquisitionError::InvalidRequest("bounded acquisition needs a count".to_string())
        })?;

        info!(
            "Starting batch of {count} samples every {:?} on {}",
            request.interval,
            device.name()
        );
        let started = Instant::now();
        let mut run = AcquisitionRun::new(Some(count));

        if let Err(e) = self.drive_batch(device, request, count, sink, &mut run) {
            run.fail();
            error!("Acquisition on {} failed: {e}", device.name());
            return Err(e.into());
        }

        self.finish(device, run, request, started, self.beep_when_done)
    }

    fn drive_batch<D, S>(
        &self,
        device: &mut D,
        request: &AcquisitionRequest,
        count: usize,
        sink: &mut S,
        run: &mut AcquisitionRun,
    ) -> Result<(), DeviceError>
    where
        D: Device + ?Sized,
        S: SampleSink + ?Sized,
    {
        device.reset()?;
        let mut armed = ArmedOutput::arm(device)?;
        run.transition(RunState::Armed);

        armed.start_batch(count, request.interval)?;
        let batch_start = Instant::now();
        run.transition(RunState::Polling);

        // the device needs a moment before the first status query
        thread::sleep(request.poll_cadence);

        let mut last_preview: Option<usize> = None;
        let mut poll = 0usize;
        let cancelled = loop {
            if self.cancel.is_cancelled() {
                armed.abort_batch()?;
                break true;
            }

            // status failures are never tolerated: they decide when the batch ends
            if armed.is_batch_finished()? {
                break false;
            }

            let index = estimated_index(batch_start.elapsed(), request.interval, count);
            if last_preview.is_none_or(|last| index > last) {
                match armed.read_preview(request.channels) {
                    Ok(reading) => {
                        last_preview = Some(index);
                        sink.on_sample(index, &reading);
                    }
                    Err(e) if e.is_transient() => {
                        if poll == 0 {
                            warn!("Could not read from {}: {e}", armed.name());
                            run.note_warning();
                        } else {
                            trace!("Ignoring failed preview on poll {poll}: {e}");
                        }
                    }
                    Err(e) => return Err(e),
                }
            }

            poll += 1;
            thread::sleep(request.poll_cadence);
        };
        debug!("Batch ended after {poll} polls");

        run.transition(RunState::Reading);
        let channels = request.channels.channels();
        let mut columns: Vec<Vec<BufferEntry>> = Vec::with_capacity(channels.len());
        for &channel in channels {
            columns.push(armed.read_full_buffer(channel)?);
        }

        let available = columns.iter().map(Vec::len).min().unwrap_or(0);
        if !cancelled && available < count {
            return Err(DeviceError::Protocol(format!(
                "device buffer holds {available} of {count} readings"
            )));
        }
        if available > count {
            debug!("Dropping {} extra buffer entries", available - count);
        }

        for i in 0..available.min(count) {
            let mut reading = Reading::default();
            for (&channel, column) in channels.iter().zip(&columns) {
                reading.set(channel, column[i].value);
            }
            run.push(columns[0][i].timestamp, reading);
        }

        if cancelled {
            run.cancel();
        } else {
            run.complete();
        }
        armed.disarm()
    }

    /// Take readings one by one, `request.interval` apart, until
    /// `request.count` readings were taken or the token is cancelled.
    ///
    /// Every reading is passed to `sink` right after it was taken.
    /// Timestamps are seconds since the output was armed.
    pub fn run_timed<D, S>(
        &self,
        device: &mut D,
        request: &AcquisitionRequest,
        sink: &mut S,
    ) -> Result<Recording, AcquisitionError>
    where
        D: Device + ?Sized,
        S: SampleSink + ?Sized,
    {
        request.validate()?;

        match request.count {
            Some(count) => info!(
                "Starting {count} readings every {:?} on {}",
                request.interval,
                device.name()
            ),
            None => info!(
                "Starting readings every {:?} on {} until cancelled",
                request.interval,
                device.name()
            ),
        }
        let started = Instant::now();
        let mut run = AcquisitionRun::new(request.count);

        if let Err(e) = self.drive_timed(device, request, sink, &mut run) {
            run.fail();
            error!("Acquisition on {} failed: {e}", device.name());
            return Err(e.into());
        }

        self.finish(device, run, request, started, false)
    }

    fn drive_timed<D, S>(
        &self,
        device: &mut D,
        request: &AcquisitionRequest,
        sink: &mut S,
        run: &mut AcquisitionRun,
    ) -> Result<(), DeviceError>
    where
        D: Device + ?Sized,
        S: SampleSink + ?Sized,
    {
        device.reset()?;
        let mut armed = ArmedOutput::arm(device)?;
        run.transition(RunState::Armed);
        let armed_at = Instant::now();
        run.transition(RunState::Reading);

        let cancelled = loop {
            if self.cancel.is_cancelled() {
                break true;
            }
            if run.is_full() {
                break false;
            }

            let reading = armed.read_reading(request.channels)?;
            let index = run.index();
            run.push(armed_at.elapsed().as_secs_f64(), reading);
            sink.on_sample(index, &reading);

            if !run.is_full() {
                thread::sleep(request.interval);
            }
        };

        if cancelled {
            run.cancel();
        } else {
            run.complete();
        }
        armed.disarm()
    }

    fn finish<D: Device + ?Sized>(
        &self,
        device: &mut D,
        run: AcquisitionRun,
        request: &AcquisitionRequest,
        started: Instant,
        beep: bool,
    ) -> Result<Recording, AcquisitionError> {
        let state = run.state();
        let recording = run.into_recording(request.channels);

        if state == RunState::Cancelled {
            warn!(
                "Acquisition cancelled, {} samples collected",
                recording.len()
            );
            return Ok(recording);
        }

        info!(
            "Collected {} samples in {:.2} s",
            recording.len(),
            started.elapsed().as_secs_f64()
        );
        if beep {
            if let Err(e) = device.beep() {
                warn!("Beep failed: {e}");
            }
        }
        Ok(recording)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::Outcome;
    use crate::device::mock::{Call, Fault, MockDevice};
    use crate::device::SyntheticDevice;
    use crate::sink::Discard;
    use crate::types::ChannelSelection;
    use crate::waveform::TestCurve;
    use std::panic::{self, AssertUnwindSafe};

    fn fast_batch(count: usize) -> AcquisitionRequest {
        AcquisitionRequest::bounded(count, Duration::from_millis(1))
            .with_poll_cadence(Duration::from_millis(1))
    }

    fn fast_timed() -> AcquisitionRequest {
        AcquisitionRequest::unbounded(Duration::from_millis(1))
    }

    #[test]
    fn test_estimated_index_is_capped() {
        let interval = Duration::from_millis(50);
        assert_eq!(estimated_index(Duration::ZERO, interval, 5), 0);
        assert_eq!(estimated_index(Duration::from_millis(120), interval, 5), 2);
        assert_eq!(estimated_index(Duration::from_secs(10), interval, 5), 4);
    }

    #[test]
    fn test_bounded_returns_exactly_count_samples() {
        let mut device = MockDevice::finishing_after(4);
        device.overfill = 3;
        let mut previews = 0;
        let mut sink = |_: usize, _: &Reading| previews += 1;

        let recording = Acquirer::new()
            .run_bounded(&mut device, &fast_batch(5), &mut sink)
            .unwrap();

        assert_eq!(recording.len(), 5);
        assert_eq!(recording.outcome, Outcome::Completed);
        for (i, sample) in recording.samples.iter().enumerate() {
            assert_eq!(sample.index, i);
            assert_eq!(sample.reading.voltage, Some(i as f64));
            assert_eq!(sample.reading.current, Some(i as f64 * 1e-9));
        }
        assert!(recording
            .timestamps()
            .windows(2)
            .all(|w| w[0] < w[1]));
        assert!(previews <= 5);

        assert_eq!(device.calls[0], Call::Reset);
        assert_eq!(device.calls[1], Call::Arm(true));
        assert_eq!(
            device.calls[2],
            Call::StartBatch(5, Duration::from_millis(1))
        );
        assert_eq!(device.disarm_count(), 1);
        assert_eq!(device.calls.last(), Some(&Call::Arm(false)));
    }

    #[test]
    fn test_bounded_reads_only_selected_channels() {
        let mut device = MockDevice::finishing_after(1);
        let request = fast_batch(3).with_channels(ChannelSelection::Voltage);

        let recording = Acquirer::new()
            .run_bounded(&mut device, &request, &mut Discard)
            .unwrap();

        assert_eq!(recording.len(), 3);
        assert!(recording.samples.iter().all(|s| s.reading.current.is_none()));
        assert_eq!(
            device.count_calls(|c| matches!(c, Call::FullBuffer(_))),
            1
        );
    }

    #[test]
    fn test_bounded_fails_on_third_poll_and_disarms_first() {
        let mut device = MockDevice::finishing_after(10);
        device.status_fault = Some((3, Fault::Disconnect));

        let err = Acquirer::new()
            .run_bounded(&mut device, &fast_batch(5), &mut Discard)
            .unwrap_err();

        assert!(matches!(
            err,
            AcquisitionError::Device(DeviceError::Disconnected(_))
        ));
        assert_eq!(device.count_calls(|c| *c == Call::IsFinished), 3);
        assert_eq!(device.disarm_count(), 1);
        assert_eq!(device.calls.last(), Some(&Call::Arm(false)));
    }

    #[test]
    fn test_first_poll_preview_failure_warns_once() {
        let mut device = MockDevice::finishing_after(4);
        device.latest_faults = vec![1];
        let request = fast_batch(100).with_channels(ChannelSelection::Voltage);

        let recording = Acquirer::new()
            .run_bounded(&mut device, &request, &mut Discard)
            .unwrap();

        assert_eq!(recording.len(), 100);
        assert_eq!(recording.warnings, 1);
        assert_eq!(device.disarm_count(), 1);
    }

    #[test]
    fn test_later_preview_failure_is_silent() {
        let mut device = MockDevice::finishing_after(6);
        device.latest_faults = vec![3];
        let request = fast_batch(100).with_channels(ChannelSelection::Voltage);

        let recording = Acquirer::new()
            .run_bounded(&mut device, &request, &mut Discard)
            .unwrap();

        assert!(device.count_calls(|c| matches!(c, Call::Latest(_))) >= 3);
        assert_eq!(recording.len(), 100);
        assert_eq!(recording.warnings, 0);
    }

    #[test]
    fn test_unreadable_status_is_fatal() {
        let mut device = MockDevice::finishing_after(10);
        device.status_fault = Some((1, Fault::Transient));

        let err = Acquirer::new()
            .run_bounded(&mut device, &fast_batch(5), &mut Discard)
            .unwrap_err();

        assert!(matches!(
            err,
            AcquisitionError::Device(DeviceError::NotReady(_))
        ));
        assert_eq!(device.count_calls(|c| *c == Call::IsFinished), 1);
        assert_eq!(device.disarm_count(), 1);
        assert_eq!(device.calls.last(), Some(&Call::Arm(false)));
    }

    #[test]
    fn test_instrument_status_garbage_aborts_run() {
        use crate::device::mock::ScriptedTransport;
        use crate::device::InstrumentDevice;

        let transport = ScriptedTransport::new().respond("TSP>");
        let mut device = InstrumentDevice::new(transport);

        let err = Acquirer::new()
            .run_bounded(&mut device, &fast_batch(5), &mut Discard)
            .unwrap_err();

        assert!(matches!(
            err,
            AcquisitionError::Device(DeviceError::Parse { .. })
        ));
        let sent = &device.transport().sent;
        assert_eq!(
            sent.iter()
                .filter(|c| c.as_str() == "print(status.operation.measuring.condition)")
                .count(),
            1
        );
        assert_eq!(
            sent.last().map(String::as_str),
            Some("smua.source.output = smua.OUTPUT_OFF")
        );
    }

    #[test]
    fn test_bounded_short_buffer_is_protocol_error() {
        let mut device = MockDevice::finishing_after(1);
        device.short_by = 2;

        let err = Acquirer::new()
            .run_bounded(&mut device, &fast_batch(5), &mut Discard)
            .unwrap_err();

        assert!(matches!(
            err,
            AcquisitionError::Device(DeviceError::Protocol(_))
        ));
        assert_eq!(device.disarm_count(), 1);
    }

    #[test]
    fn test_bounded_cancel_aborts_batch() {
        let mut device = MockDevice::finishing_after(1000);
        device.overfill = 2;
        let acquirer = Acquirer::new();
        let token = acquirer.cancel_token().clone();
        let mut sink = |_: usize, _: &Reading| token.cancel();

        let recording = acquirer
            .run_bounded(&mut device, &fast_batch(5), &mut sink)
            .unwrap();

        assert_eq!(recording.outcome, Outcome::Cancelled);
        assert_eq!(recording.len(), 5);
        assert_eq!(device.count_calls(|c| *c == Call::Abort), 1);
        assert_eq!(device.count_calls(|c| *c == Call::IsFinished), 1);
        assert_eq!(device.disarm_count(), 1);
    }

    #[test]
    fn test_bounded_beeps_when_done() {
        let mut device = MockDevice::finishing_after(1);
        Acquirer::new()
            .beep_when_done(true)
            .run_bounded(&mut device, &fast_batch(2), &mut Discard)
            .unwrap();
        assert_eq!(device.calls.last(), Some(&Call::Beep));

        let mut device = MockDevice::finishing_after(1);
        Acquirer::new()
            .run_bounded(&mut device, &fast_batch(2), &mut Discard)
            .unwrap();
        assert_eq!(device.count_calls(|c| *c == Call::Beep), 0);
    }

    #[test]
    fn test_timed_never_beeps() {
        let mut device = MockDevice::default();
        let request = fast_timed().with_max_count(Some(2));
        Acquirer::new()
            .beep_when_done(true)
            .run_timed(&mut device, &request, &mut Discard)
            .unwrap();
        assert_eq!(device.count_calls(|c| *c == Call::Beep), 0);
        assert_eq!(device.calls.last(), Some(&Call::Arm(false)));
    }

    #[test]
    fn test_invalid_request_never_touches_device() {
        let mut device = MockDevice::finishing_after(1);
        let err = Acquirer::new()
            .run_bounded(&mut device, &fast_batch(0), &mut Discard)
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::InvalidRequest(_)));

        let err = Acquirer::new()
            .run_bounded(&mut device, &fast_timed(), &mut Discard)
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::InvalidRequest(_)));
        assert!(device.calls.is_empty());
    }

    fn exploding_sink(_: usize, _: &Reading) {
        panic!("sink failed");
    }

    #[test]
    fn test_panicking_sink_still_disarms() {
        let mut device = MockDevice::finishing_after(10);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            Acquirer::new().run_bounded(&mut device, &fast_batch(5), &mut exploding_sink)
        }));
        assert!(result.is_err());
        assert_eq!(device.disarm_count(), 1);
    }

    #[test]
    fn test_failed_disarm_is_reported() {
        let mut device = MockDevice::finishing_after(1);
        device.fail_disarm = true;
        let err = Acquirer::new()
            .run_bounded(&mut device, &fast_batch(2), &mut Discard)
            .unwrap_err();
        assert!(matches!(
            err,
            AcquisitionError::Device(DeviceError::Disconnected(_))
        ));
        assert_eq!(device.disarm_count(), 1);
    }

    #[test]
    fn test_timed_cancel_after_n_reads() {
        let mut device = MockDevice::default();
        let acquirer = Acquirer::new();
        let token = acquirer.cancel_token().clone();
        let mut seen = Vec::new();
        let mut sink = |i: usize, r: &Reading| {
            seen.push((i, *r));
            if i + 1 == 3 {
                token.cancel();
            }
        };

        let recording = acquirer
            .run_timed(&mut device, &fast_timed(), &mut sink)
            .unwrap();

        assert_eq!(recording.len(), 3);
        assert_eq!(recording.outcome, Outcome::Cancelled);
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2], (2, Reading::new(Some(5.0), Some(6.0))));
        assert_eq!(device.disarm_count(), 1);
    }

    #[test]
    fn test_timed_stops_at_max_count() {
        let mut device = MockDevice::default();
        let mut indices = Vec::new();
        let mut sink = |i: usize, _: &Reading| indices.push(i);
        let request = fast_timed().with_max_count(Some(4));

        let recording = Acquirer::new()
            .run_timed(&mut device, &request, &mut sink)
            .unwrap();

        assert_eq!(recording.outcome, Outcome::Completed);
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert!(recording
            .timestamps()
            .windows(2)
            .all(|w| w[0] <= w[1]));
        assert_eq!(device.count_calls(|c| matches!(c, Call::Single(_))), 8);
        assert_eq!(device.disarm_count(), 1);
    }

    #[test]
    fn test_timed_error_disarms() {
        let mut device = MockDevice::default();
        device.single_fault = Some((3, Fault::Disconnect));

        let err = Acquirer::new()
            .run_timed(&mut device, &fast_timed(), &mut Discard)
            .unwrap_err();

        assert!(matches!(
            err,
            AcquisitionError::Device(DeviceError::Disconnected(_))
        ));
        assert_eq!(device.disarm_count(), 1);
        assert_eq!(device.calls.last(), Some(&Call::Arm(false)));
    }

    #[test]
    fn test_timed_precancelled_token_reads_nothing() {
        let mut device = MockDevice::default();
        let token = CancelToken::new();
        token.cancel();

        let recording = Acquirer::new()
            .with_cancel_token(token)
            .run_timed(&mut device, &fast_timed(), &mut Discard)
            .unwrap();

        assert!(recording.is_empty());
        assert_eq!(device.count_calls(|c| matches!(c, Call::Single(_))), 0);
        assert_eq!(device.disarm_count(), 1);
    }

    #[test]
    fn test_synthetic_batch() {
        let mut device = SyntheticDevice::new(TestCurve::default());
        let request = AcquisitionRequest::bounded(5, Duration::from_millis(50))
            .with_poll_cadence(Duration::from_millis(100));
        let mut previews = 0;
        let mut sink = |_: usize, _: &Reading| previews += 1;

        let recording = Acquirer::new()
            .run_bounded(&mut device, &request, &mut sink)
            .unwrap();

        assert_eq!(recording.len(), 5);
        let timestamps = recording.timestamps();
        for (i, w) in timestamps.windows(2).enumerate() {
            assert!(w[0] < w[1], "sample {i}");
            assert!((w[1] - w[0] - 0.05).abs() < 1e-9);
        }
        assert!(previews <= 5);
    }
}
