//! Serial line transport for RS-232/USB-serial instruments
//!
//! Protocol Overview:
//! - Format: ASCII command/response, one command per line
//! - Framing: 8N1, no flow control
//! - Command terminator: LF (`\n`)
//! - Response terminator: LF, trailing whitespace (including CR) trimmed
//!
//! The port is opened through `tokio-serial` on a blocking thread. Any
//! `AsyncRead + AsyncWrite` stream can stand in for the port, which is how
//! the tests drive a transport through `tokio::io::duplex`.

use super::{validate_settle, Transport};
use crate::config::{validate_port_name, SerialSettings};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, instrument};

/// Anything that can stand in for an open serial port.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}
type DynSerial = Box<dyn SerialPortIO>;

/// How long `read` waits for a line before reporting nothing available.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Serial port transport
pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
    settle: Duration,
    read_timeout: Duration,
    port: Option<BufReader<DynSerial>>,
    // Bytes of a line whose terminator has not arrived yet
    pending: Vec<u8>,
}

impl SerialTransport {
    /// Closed transport for `port_name`
    pub fn new(port_name: impl Into<String>, baud_rate: u32, settle: Duration) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            settle,
            read_timeout: DEFAULT_READ_TIMEOUT,
            port: None,
            pending: Vec::new(),
        }
    }

    /// Closed transport from a `[laser]`/`[delay_stage]` settings block
    pub fn from_settings(settings: &SerialSettings) -> Self {
        Self::new(settings.port.clone(), settings.baud_rate, settings.settle)
    }

    /// Already-open transport over an arbitrary stream
    pub fn from_stream<S>(port_name: impl Into<String>, stream: S, settle: Duration) -> Self
    where
        S: SerialPortIO + 'static,
    {
        let mut transport = Self::new(port_name, 0, settle);
        transport.port = Some(BufReader::new(Box::new(stream)));
        transport
    }

    /// Set how long `read` waits before returning an empty line
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Configured baud rate
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
}

#[cfg(feature = "instrument_serial")]
async fn open_port(port_name: String, baud_rate: u32) -> AppResult<DynSerial> {
    use tokio_serial::SerialPortBuilderExt;

    let port = tokio::task::spawn_blocking(move || {
        tokio_serial::new(&port_name, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
    })
    .await
    .map_err(|e| DaqError::Transport(format!("serial open task failed: {e}")))??;
    Ok(Box::new(port))
}

#[cfg(not(feature = "instrument_serial"))]
fn open_port(_port_name: String, _baud_rate: u32) -> AppResult<DynSerial> {
    Err(DaqError::SerialFeatureDisabled)
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> AppResult<()> {
        if self.port.is_some() {
            return Ok(());
        }
        #[cfg(feature = "instrument_serial")]
        let port = open_port(self.port_name.clone(), self.baud_rate).await?;
        #[cfg(not(feature = "instrument_serial"))]
        let port = open_port(self.port_name.clone(), self.baud_rate)?;
        self.pending.clear();
        self.port = Some(BufReader::new(port));
        debug!(port = %self.port_name, baud = self.baud_rate, "Serial port opened");
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        self.pending.clear();
        if let Some(mut port) = self.port.take() {
            // Dropping the stream releases the OS handle; shutdown just flushes.
            let _ = port.get_mut().shutdown().await;
            debug!(port = %self.port_name, "Serial port closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    #[instrument(skip(self), fields(port = %self.port_name), err)]
    async fn write(&mut self, command: &str, settle: Duration) -> AppResult<()> {
        let port = self.port.as_mut().ok_or(DaqError::NotConnected)?;
        let line = format!("{}\n", command);
        port.get_mut().write_all(line.as_bytes()).await?;
        port.get_mut().flush().await?;
        tokio::time::sleep(settle).await;
        Ok(())
    }

    #[instrument(skip(self), fields(port = %self.port_name), err)]
    async fn read(&mut self) -> AppResult<String> {
        let port = self.port.as_mut().ok_or(DaqError::NotConnected)?;
        // read_until keeps partial bytes in `pending` when the timeout cancels it
        match tokio::time::timeout(self.read_timeout, port.read_until(b'\n', &mut self.pending))
            .await
        {
            Ok(Ok(_)) => {
                let line = std::mem::take(&mut self.pending);
                let response = String::from_utf8_lossy(&line).trim().to_string();
                debug!(response = %response, "Serial response");
                Ok(response)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(String::new()),
        }
    }

    fn settle_time(&self) -> Duration {
        self.settle
    }

    fn set_settle_time(&mut self, settle: Duration) -> AppResult<()> {
        validate_settle(settle)?;
        self.settle = settle;
        Ok(())
    }

    fn channel(&self) -> &str {
        &self.port_name
    }

    fn set_channel(&mut self, channel: &str) -> AppResult<()> {
        validate_port_name(channel)?;
        self.port_name = channel.to_string();
        Ok(())
    }
}

/// Names of the serial ports the OS currently reports.
#[cfg(feature = "instrument_serial")]
pub fn list_serial_ports() -> AppResult<Vec<String>> {
    let ports = serialport::available_ports()
        .map_err(|e| DaqError::Transport(format!("port enumeration failed: {e}")))?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

/// Names of the serial ports the OS currently reports.
#[cfg(not(feature = "instrument_serial"))]
pub fn list_serial_ports() -> AppResult<Vec<String>> {
    Err(DaqError::SerialFeatureDisabled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    const SETTLE: Duration = Duration::from_millis(1);

    #[tokio::test]
    async fn write_appends_newline() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut transport = SerialTransport::from_stream("COM6", device, SETTLE);

        transport.write("*STB?", SETTLE).await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = host.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"*STB?\n");
    }

    #[tokio::test]
    async fn read_returns_trimmed_line() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut transport = SerialTransport::from_stream("COM7", device, SETTLE);

        host.write_all(b"1TP12.5000\r\n").await.unwrap();
        assert_eq!(transport.read().await.unwrap(), "1TP12.5000");
    }

    #[tokio::test]
    async fn read_with_nothing_pending_is_empty() {
        let (_host, device) = tokio::io::duplex(64);
        let mut transport = SerialTransport::from_stream("COM7", device, SETTLE)
            .with_read_timeout(Duration::from_millis(10));

        assert_eq!(transport.read().await.unwrap(), "");
    }

    #[tokio::test]
    async fn partial_line_survives_read_timeout() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut transport = SerialTransport::from_stream("COM7", device, SETTLE)
            .with_read_timeout(Duration::from_millis(20));

        host.write_all(b"1TP12.").await.unwrap();
        assert_eq!(transport.read().await.unwrap(), "");

        host.write_all(b"5000\n").await.unwrap();
        assert_eq!(transport.read().await.unwrap(), "1TP12.5000");
    }

    #[tokio::test]
    async fn open_of_missing_port_fails_cleanly() {
        let mut transport = SerialTransport::new("/dev/ttySRSMICRO9", 57_600, SETTLE);

        let err = transport.open().await.unwrap_err();

        #[cfg(not(feature = "instrument_serial"))]
        assert!(matches!(err, DaqError::SerialFeatureDisabled));
        #[cfg(feature = "instrument_serial")]
        assert!(!err.is_not_connected());
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn closed_transport_reports_not_connected() {
        let (_host, device) = tokio::io::duplex(64);
        let mut transport = SerialTransport::from_stream("COM7", device, SETTLE);
        transport.close().await.unwrap();

        assert!(!transport.is_open());
        let err = transport.write("1TE", SETTLE).await.unwrap_err();
        assert!(err.is_not_connected());
        assert!(transport.read().await.unwrap_err().is_not_connected());
    }

    #[test]
    fn rejected_settings_leave_state_unchanged() {
        let mut transport = SerialTransport::new("COM6", 115_200, Duration::from_millis(100));

        assert!(transport.set_channel("not a port").is_err());
        assert_eq!(transport.channel(), "COM6");

        assert!(transport.set_settle_time(Duration::from_secs(3600)).is_err());
        assert_eq!(transport.settle_time(), Duration::from_millis(100));

        transport.set_channel("/dev/ttyUSB2").unwrap();
        assert_eq!(transport.channel(), "/dev/ttyUSB2");
    }
}
