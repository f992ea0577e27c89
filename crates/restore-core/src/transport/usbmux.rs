//! usbmuxd-backed device transport.
//!
//! Talks to the local usbmuxd daemon over its unix socket. Each daemon
//! message is a 16-byte little-endian header (total length, protocol
//! version 1, message type 8 for plist payloads, tag) followed by an XML
//! property list. After a successful `Connect` request the socket becomes a
//! raw tunnel to the requested device port.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, info, instrument};

use super::traits::{Connection, DeviceTransport, TransportError};
use crate::envelope::Envelope;

/// Default daemon socket path.
pub const USBMUXD_SOCKET: &str = "/var/run/usbmuxd";

const MUX_PROTOCOL_VERSION: u32 = 1;
const MUX_MESSAGE_PLIST: u32 = 8;
const MUX_HEADER_SIZE: usize = 16;

const CLIENT_NAME: &str = "irestore";

/// usbmuxd-backed transport bound to one attached device.
pub struct UsbmuxTransport {
    socket_path: String,
    device_id: u64,
    udid: String,
}

impl UsbmuxTransport {
    /// Find an attached device, optionally by serial number.
    #[instrument(level = "info")]
    pub fn discover(udid: Option<&str>) -> Result<Self, TransportError> {
        Self::discover_at(USBMUXD_SOCKET, udid)
    }

    /// Discover against a specific daemon socket path.
    pub fn discover_at(socket_path: &str, udid: Option<&str>) -> Result<Self, TransportError> {
        let mut stream = UnixStream::connect(socket_path)?;

        let request = mux_request("ListDevices");
        write_mux_message(&mut stream, &request, 1)?;
        let reply = read_mux_message(&mut stream)?;

        let devices = reply
            .get("DeviceList")
            .and_then(plist::Value::as_array)
            .ok_or_else(|| TransportError::MalformedReply("no DeviceList".to_string()))?;

        for entry in devices {
            let Some(entry) = entry.as_dictionary() else {
                continue;
            };
            let Some(device_id) = entry.get("DeviceID").and_then(plist::Value::as_unsigned_integer)
            else {
                continue;
            };
            let serial = entry
                .get("Properties")
                .and_then(plist::Value::as_dictionary)
                .and_then(|props| props.get("SerialNumber"))
                .and_then(plist::Value::as_string)
                .unwrap_or_default();

            if udid.is_none_or(|wanted| wanted == serial) {
                info!(device_id, udid = %serial, "found device");
                return Ok(Self {
                    socket_path: socket_path.to_string(),
                    device_id,
                    udid: serial.to_string(),
                });
            }
        }

        Err(TransportError::DeviceNotFound)
    }

    /// Serial number of the bound device.
    pub fn udid(&self) -> &str {
        &self.udid
    }
}

impl DeviceTransport for UsbmuxTransport {
    type Conn = UsbmuxConnection;

    fn connect(&self, port: u16) -> Result<Self::Conn, TransportError> {
        let mut stream = UnixStream::connect(&self.socket_path)?;

        let mut request = mux_request("Connect");
        request.insert_uint("DeviceID", self.device_id);
        // The daemon expects the port in network byte order.
        request.insert_uint("PortNumber", u64::from(port.to_be()));
        write_mux_message(&mut stream, &request, 2)?;

        let reply = read_mux_message(&mut stream)?;
        let number = reply
            .get("Number")
            .and_then(plist::Value::as_unsigned_integer)
            .ok_or_else(|| TransportError::MalformedReply("no Result Number".to_string()))?;
        if number != 0 {
            return Err(TransportError::MuxerError(number));
        }

        debug!(port, "tunnel established");
        Ok(UsbmuxConnection { stream })
    }
}

/// Raw tunnel to a device port. Closes the socket on drop.
pub struct UsbmuxConnection {
    stream: UnixStream,
}

impl Connection for UsbmuxConnection {
    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.stream
            .write(data)
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn receive(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; max_len];
        let n = self
            .stream
            .read(&mut buf)
            .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        buf.truncate(n);
        Ok(buf)
    }
}

fn mux_request(message_type: &str) -> Envelope {
    let mut env = Envelope::new();
    env.insert_string("MessageType", message_type);
    env.insert_string("ClientVersionString", CLIENT_NAME);
    env.insert_string("ProgName", CLIENT_NAME);
    env
}

fn write_mux_message(
    stream: &mut UnixStream,
    env: &Envelope,
    tag: u32,
) -> Result<(), TransportError> {
    let payload = env
        .to_xml()
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;

    let mut header = [0u8; MUX_HEADER_SIZE];
    LittleEndian::write_u32(&mut header[0..4], (MUX_HEADER_SIZE + payload.len()) as u32);
    LittleEndian::write_u32(&mut header[4..8], MUX_PROTOCOL_VERSION);
    LittleEndian::write_u32(&mut header[8..12], MUX_MESSAGE_PLIST);
    LittleEndian::write_u32(&mut header[12..16], tag);

    stream
        .write_all(&header)
        .and_then(|_| stream.write_all(&payload))
        .map_err(|e| TransportError::SendFailed(e.to_string()))
}

fn read_mux_message(stream: &mut UnixStream) -> Result<Envelope, TransportError> {
    let mut header = [0u8; MUX_HEADER_SIZE];
    stream
        .read_exact(&mut header)
        .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;

    let total = LittleEndian::read_u32(&header[0..4]) as usize;
    if total < MUX_HEADER_SIZE {
        return Err(TransportError::MalformedReply(format!(
            "header claims {total} bytes"
        )));
    }

    let mut payload = vec![0u8; total - MUX_HEADER_SIZE];
    stream
        .read_exact(&mut payload)
        .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;

    Envelope::from_xml(&payload).map_err(|e| TransportError::MalformedReply(e.to_string()))
}
