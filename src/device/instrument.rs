//! Keithley 2600-series source-measure unit, driven with TSP commands.
//!
//! Current readings go to `smua.nvbuffer1`, voltage readings to
//! `smua.nvbuffer2`. Batches always record both.

use super::transport::{ConnectionConfig, TcpTransport, Transport};
use super::Device;
use crate::error::DeviceError;
use crate::types::{BufferEntry, Channel, ChannelSelection, Reading};
use log::{debug, info};
use std::time::Duration;

const SMU_RESET: &[&str] = &[
    "smua.reset()",
    "smua.measure.autorangev = smua.AUTORANGE_ON",
    "smua.measure.autozero = smua.AUTOZERO_ONCE",
    "smua.source.output = smua.OUTPUT_OFF",
    // max 20 V expected
    "smua.measure.rangev = 20",
];

/// Significant digits for buffer dumps and for single reads.
const BUFFER_PRECISION: u8 = 7;
const SINGLE_PRECISION: u8 = 12;
const MEASURING_CONDITION: &str = "print(status.operation.measuring.condition)";
const BEEP_DONE: &str = "beeper.beep(0.3, 1000)";
const BEEP_CONNECTED: &str = "beeper.beep(0.5, 1000)";

/// Name of the non-volatile buffer a channel is recorded into.
pub fn buffer_name(channel: Channel) -> &'static str {
    match channel {
        Channel::Current => "smua.nvbuffer1",
        Channel::Voltage => "smua.nvbuffer2",
    }
}

fn ascii_format(precision: u8) -> String {
    format!("format.data = format.ASCII\nformat.asciiprecision = {precision}")
}

fn latest_query(channel: Channel) -> String {
    let b = buffer_name(channel);
    format!("if {b}.n > 0 then print({b}.readings[{b}.n]) else print(0) end")
}

fn single_query(channel: Channel) -> String {
    match channel {
        Channel::Current => format!("print(smua.measure.i({}))", buffer_name(channel)),
        Channel::Voltage => format!("print(smua.measure.v({}))", buffer_name(channel)),
    }
}

fn parse_value(query: &str, response: &str) -> Result<f64, DeviceError> {
    response
        .trim()
        .parse::<f64>()
        .map_err(|_| DeviceError::parse(query, response))
}

/// Parse a `printbuffer` response: comma separated numbers, empty when the
/// buffer is empty.
fn parse_list(query: &str, response: &str) -> Result<Vec<f64>, DeviceError> {
    let response = response.trim();
    if response.is_empty() {
        return Ok(Vec::new());
    }
    response
        .split(',')
        .map(|v| parse_value(query, v))
        .collect()
}

pub struct InstrumentDevice<T: Transport> {
    transport: T,
    /// ASCII precision last sent, `None` until known
    precision: Option<u8>,
}

impl InstrumentDevice<TcpTransport> {
    /// Connect to an instrument on the LAN.
    pub fn connect(
        host: &str,
        port: u16,
        config: ConnectionConfig,
        beep_on_connect: bool,
    ) -> Result<Self, DeviceError> {
        let transport = TcpTransport::builder()
            .address(host)
            .port(port)
            .config(config)
            .build()?;
        info!("Opened instrument at {}", transport.peer());

        let mut device = Self::new(transport);
        if beep_on_connect {
            device.transport.write_line(BEEP_CONNECTED)?;
        }
        Ok(device)
    }
}

impl<T: Transport> InstrumentDevice<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            precision: None,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Send a raw TSP chunk to the instrument.
    pub fn run_script(&mut self, script: &str) -> Result<(), DeviceError> {
        debug!("Running TSP chunk ({} bytes)", script.len());
        self.transport.write_line(script)
    }

    /// Number of readings currently stored for `channel`.
    pub fn buffer_len(&mut self, channel: Channel) -> Result<usize, DeviceError> {
        let query = format!("print({}.n)", buffer_name(channel));
        let response = self.transport.query(&query)?;
        let n = parse_value(&query, &response)?;
        Ok(n as usize)
    }

    fn ensure_format(&mut self, precision: u8) -> Result<(), DeviceError> {
        if self.precision != Some(precision) {
            self.transport.write_line(&ascii_format(precision))?;
            self.precision = Some(precision);
        }
        Ok(())
    }

    fn reset_buffers(&mut self) -> Result<(), DeviceError> {
        for channel in [Channel::Current, Channel::Voltage] {
            let b = buffer_name(channel);
            self.transport.write_line(&format!("{b}.clear()"))?;
            self.transport.write_line(&format!("{b}.appendmode = 1"))?;
            self.transport
                .write_line(&format!("{b}.collecttimestamps = 1"))?;
        }
        Ok(())
    }
}

impl<T: Transport> Device for InstrumentDevice<T> {
    fn name(&self) -> &str {
        "keithley"
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        debug!("Resetting SMU and buffers");
        self.precision = None;
        for command in SMU_RESET {
            self.transport.write_line(command)?;
        }
        self.reset_buffers()
    }

    fn arm_output(&mut self, on: bool) -> Result<(), DeviceError> {
        let state = if on { "smua.OUTPUT_ON" } else { "smua.OUTPUT_OFF" };
        self.transport
            .write_line(&format!("smua.source.output = {state}"))
    }

    fn start_batch(&mut self, count: usize, interval: Duration) -> Result<(), DeviceError> {
        self.transport
            .write_line(&format!("smua.measure.count = {count}"))?;
        self.transport.write_line(&format!(
            "smua.measure.interval = {}",
            interval.as_secs_f64()
        ))?;
        self.transport.write_line(&format!(
            "smua.measure.overlappediv({}, {})",
            buffer_name(Channel::Current),
            buffer_name(Channel::Voltage)
        ))
    }

    fn is_batch_finished(&mut self) -> Result<bool, DeviceError> {
        let response = self.transport.query(MEASURING_CONDITION)?;
        // non-zero while measuring
        Ok(parse_value(MEASURING_CONDITION, &response)? == 0.0)
    }

    fn abort_batch(&mut self) -> Result<(), DeviceError> {
        self.transport.write_line("smua.abort()")
    }

    fn read_latest(&mut self, channel: Channel) -> Result<f64, DeviceError> {
        let query = latest_query(channel);
        let response = self.transport.query(&query)?;
        parse_value(&query, &response)
    }

    fn read_full_buffer(&mut self, channel: Channel) -> Result<Vec<BufferEntry>, DeviceError> {
        let b = buffer_name(channel);
        self.ensure_format(BUFFER_PRECISION)?;

        let query = format!("printbuffer(1, {b}.n, {b}.timestamps)");
        let timestamps = parse_list(&query, &self.transport.query(&query)?)?;
        let query = format!("printbuffer(1, {b}.n, {b}.readings)");
        let readings = parse_list(&query, &self.transport.query(&query)?)?;

        if timestamps.len() != readings.len() {
            return Err(DeviceError::Protocol(format!(
                "{b} returned {} timestamps but {} readings",
                timestamps.len(),
                readings.len()
            )));
        }
        debug!("Collected {} readings from {b}", readings.len());

        Ok(timestamps
            .into_iter()
            .zip(readings)
            .map(|(t, v)| BufferEntry::new(t, v))
            .collect())
    }

    fn read_single(&mut self, channel: Channel) -> Result<f64, DeviceError> {
        self.ensure_format(SINGLE_PRECISION)?;
        let query = single_query(channel);
        let response = self.transport.query(&query)?;
        parse_value(&query, &response)
    }

    fn read_reading(&mut self, channels: ChannelSelection) -> Result<Reading, DeviceError> {
        if channels != ChannelSelection::Both {
            let channel = channels.channels()[0];
            let mut reading = Reading::default();
            reading.set(channel, self.read_single(channel)?);
            return Ok(reading);
        }

        self.ensure_format(SINGLE_PRECISION)?;
        let query = format!(
            "print(smua.measure.iv({}, {}))",
            buffer_name(Channel::Current),
            buffer_name(Channel::Voltage)
        );
        let response = self.transport.query(&query)?;
        let mut values = response.split('\t');
        match (values.next(), values.next(), values.next()) {
            (Some(i), Some(v), None) => Ok(Reading::new(
                Some(parse_value(&query, i)?),
                Some(parse_value(&query, v)?),
            )),
            _ => Err(DeviceError::parse(&query, &response)),
        }
    }

    fn beep(&mut self) -> Result<(), DeviceError> {
        self.transport.write_line(BEEP_DONE)
    }
}
