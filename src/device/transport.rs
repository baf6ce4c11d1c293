use crate::error::DeviceError;
use log::{debug, trace, warn};
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// Line-oriented command channel to an instrument.
///
/// Commands are terminated with `\n`, responses end at the first `\n`.
pub trait Transport {
    /// Send a command that produces no response.
    fn write_line(&mut self, command: &str) -> Result<(), DeviceError>;

    /// Send a command and read one response line, without the terminator.
    fn query(&mut self, command: &str) -> Result<String, DeviceError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write_line(&mut self, command: &str) -> Result<(), DeviceError> {
        (**self).write_line(command)
    }

    fn query(&mut self, command: &str) -> Result<String, DeviceError> {
        (**self).query(command)
    }
}

/// Connection configuration for [`TcpTransport`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use m_teng::device::ConnectionConfig;
///
/// let config = ConnectionConfig {
///     connect_timeout: Duration::from_secs(30),
///     ..Default::default()
/// };
/// assert_eq!(config.read_timeout, Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Builder for [`TcpTransport`].
///
/// ```no_run
/// use m_teng::device::TcpTransport;
///
/// let transport = TcpTransport::builder()
///     .address("192.168.1.50")
///     .port(5025)
///     .build()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Default)]
pub struct TcpTransportBuilder {
    address: Option<String>,
    port: Option<u16>,
    config: ConnectionConfig,
}

impl TcpTransportBuilder {
    pub fn address(mut self, addr: &str) -> Self {
        self.address = Some(addr.to_string());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<TcpTransport, DeviceError> {
        let address = self
            .address
            .ok_or_else(|| DeviceError::InvalidAddress("address must be specified".to_string()))?;
        let port = self
            .port
            .ok_or_else(|| DeviceError::InvalidAddress("port must be specified".to_string()))?;

        let socket_addr: SocketAddr = format!("{address}:{port}")
            .parse()
            .map_err(|_| DeviceError::InvalidAddress(address.clone()))?;

        debug!("Connecting to instrument at {socket_addr}");

        let stream = TcpStream::connect_timeout(&socket_addr, self.config.connect_timeout)
            .map_err(|e| {
                warn!("Failed to connect to {socket_addr}: {e}");
                if e.kind() == std::io::ErrorKind::TimedOut {
                    DeviceError::Timeout
                } else {
                    DeviceError::Io {
                        source: e,
                        context: format!("Failed to connect to {socket_addr}"),
                    }
                }
            })?;

        stream.set_read_timeout(Some(self.config.read_timeout))?;
        stream.set_write_timeout(Some(self.config.write_timeout))?;
        stream.set_nodelay(true)?;

        let reader = BufReader::new(stream.try_clone()?);

        debug!("Connected to instrument at {socket_addr}");

        Ok(TcpTransport {
            stream,
            reader,
            peer: socket_addr,
        })
    }
}

/// Raw-socket connection to a LAN instrument (port 5025 on most SMUs).
pub struct TcpTransport {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    peer: SocketAddr,
}

impl TcpTransport {
    pub fn builder() -> TcpTransportBuilder {
        TcpTransportBuilder::default()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for TcpTransport {
    fn write_line(&mut self, command: &str) -> Result<(), DeviceError> {
        trace!("-> {command}");
        self.stream.write_all(command.as_bytes())?;
        self.stream.write_all(b"\n")?;
        self.stream.flush()?;
        Ok(())
    }

    fn query(&mut self, command: &str) -> Result<String, DeviceError> {
        self.write_line(command)?;

        let mut line = String::new();
        let read = self.reader.read_line(&mut line)?;
        if read == 0 {
            return Err(DeviceError::Disconnected(format!(
                "{} closed the connection",
                self.peer
            )));
        }
        let response = line.trim_end_matches(['\r', '\n']).to_string();
        trace!("<- {response}");
        Ok(response)
    }
}
