//! Device transport abstraction.
//!
//! Defines the `DeviceTransport` trait for opening connections to numbered
//! device services, allowing different backends (usbmuxd, mock).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no device found")]
    DeviceNotFound,

    #[error("failed to connect to port {port}: {message}")]
    ConnectFailed { port: u16, message: String },

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("connection closed by peer")]
    Closed,

    #[error("malformed muxer reply: {0}")]
    MalformedReply(String),

    #[error("muxer refused the request (result {0})")]
    MuxerError(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One open byte stream to a device service.
///
/// Dropping a connection closes it; release is never optional.
pub trait Connection: Send {
    /// Send bytes, returning how many were actually written.
    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Blocking receive of up to `max_len` bytes.
    fn receive(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError>;

    /// Receive exactly `len` bytes.
    fn receive_exact(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        let mut buf = Vec::with_capacity(len);
        while buf.len() < len {
            let chunk = self.receive(len - buf.len())?;
            if chunk.is_empty() {
                return Err(TransportError::Closed);
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf)
    }

    /// Send the whole buffer.
    fn send_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut offset = 0;
        while offset < data.len() {
            let n = self.send(&data[offset..])?;
            if n == 0 {
                return Err(TransportError::Closed);
            }
            offset += n;
        }
        Ok(())
    }
}

/// Abstract device transport.
///
/// This trait enables:
/// - Production implementation over usbmuxd
/// - Mock implementation for unit testing
pub trait DeviceTransport {
    type Conn: Connection;

    /// Open a connection to the given device service port.
    fn connect(&self, port: u16) -> Result<Self::Conn, TransportError>;
}
