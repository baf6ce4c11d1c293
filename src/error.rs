use crate::types::Channel;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },
    #[error("Device disconnected: {0}")]
    Disconnected(String),
    #[error("Connection timeout")]
    Timeout,
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Could not parse response to '{query}': {response:?}")]
    Parse { query: String, response: String },
    #[error("No reading available yet: {0}")]
    NotReady(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Channel {0} is not supported by this device")]
    UnsupportedChannel(Channel),
}

impl DeviceError {
    /// Momentary failures of a best-effort read, e.g. an empty buffer or a
    /// half-written response. Everything else means the device is unusable.
    pub fn is_transient(&self) -> bool {
        matches!(self, DeviceError::Parse { .. } | DeviceError::NotReady(_))
    }

    pub fn parse(query: &str, response: &str) -> Self {
        DeviceError::Parse {
            query: query.to_string(),
            response: response.to_string(),
        }
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(source: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match source.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => DeviceError::Timeout,
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected => DeviceError::Disconnected(source.to_string()),
            _ => DeviceError::Io {
                source,
                context: "device communication".to_string(),
            },
        }
    }
}

#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("Invalid acquisition request: {0}")]
    InvalidRequest(String),
    #[error("Acquisition worker panicked")]
    WorkerPanicked,
}
