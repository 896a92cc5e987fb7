//! Byte transports the driver can speak through.
//!
//! The driver only needs an ordered byte stream to the controller chip; the
//! [`Transport`] trait is the seam where serial ports, HID bridges or test
//! harnesses plug in. Opening is synchronous (serial port setup is), all
//! I/O afterwards is async on the returned stream.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};

/// Source of connections to a Z-Wave controller.
pub trait Transport: Send + 'static {
    /// Byte stream produced by [`open`](Transport::open).
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Establish (or re-establish) the connection.
    fn open(&mut self) -> io::Result<Self::Stream>;

    /// Human-readable endpoint description for the log.
    fn describe(&self) -> String;
}

/// Serial-port transport, the common case for USB Z-Wave sticks.
#[derive(Debug, Clone)]
pub struct SerialTransport {
    path: String,
    baud_rate: u32,
}

impl SerialTransport {
    /// Default baud rate of Serial API controllers.
    pub const DEFAULT_BAUD_RATE: u32 = 115_200;

    /// Transport for the device at `path` (e.g. `/dev/ttyUSB0`, `COM3`)
    /// at the default baud rate.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: Self::DEFAULT_BAUD_RATE,
        }
    }

    /// Override the baud rate.
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }
}

impl Transport for SerialTransport {
    type Stream = SerialStream;

    fn open(&mut self) -> io::Result<Self::Stream> {
        let mut stream = tokio_serial::new(&self.path, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .open_native_async()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        #[cfg(unix)]
        stream
            .set_exclusive(true)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        Ok(stream)
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.path, self.baud_rate)
    }
}

/// Adapter turning an already-connected byte stream into a one-shot
/// transport. Used by the test suite (in-memory duplex pipes) and by
/// embedders bridging transports the crate does not know about, such as HID.
#[derive(Debug)]
pub struct StreamTransport<S> {
    stream: Option<S>,
    label: String,
}

impl<S> StreamTransport<S> {
    /// Wrap a connected stream.
    pub fn new(stream: S, label: impl Into<String>) -> Self {
        Self {
            stream: Some(stream),
            label: label.into(),
        }
    }
}

impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Stream = S;

    fn open(&mut self) -> io::Result<Self::Stream> {
        self.stream.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "stream transport already consumed")
        })
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_transport_is_one_shot() {
        let (a, _b) = tokio::io::duplex(16);
        let mut transport = StreamTransport::new(a, "duplex");

        assert!(transport.open().is_ok());
        let err = transport.open().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_serial_transport_describe() {
        let transport = SerialTransport::new("/dev/ttyUSB0").with_baud_rate(9600);
        assert_eq!(transport.describe(), "/dev/ttyUSB0 @ 9600 baud");
    }
}
