//! Restore daemon control-channel client.
//!
//! The restore daemon speaks length-prefixed XML property lists: a
//! big-endian u32 byte count followed by the document.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use tracing::debug;

use crate::envelope::{Envelope, EnvelopeError};
use crate::transport::{Connection, TransportError};

/// Identity the device reports when the restore daemon is up.
pub const RESTORED_TYPE: &str = "com.apple.mobile.restored";

const CLIENT_LABEL: &str = "irestore";

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("envelope: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("device refused {request}")]
    Refused { request: &'static str },
}

/// The control-channel session surface.
///
/// The session controller is generic over this so tests can script the
/// peer; `RestoredClient` is the production implementation.
pub trait ControlChannel {
    /// Query the peer's protocol identity and version.
    fn query_type(&mut self) -> Result<(String, u64), ControlError>;

    /// Ask the device to begin the restore.
    fn start_restore(&mut self) -> Result<(), ControlError>;

    /// Blocking receive of the next message.
    fn receive(&mut self) -> Result<Envelope, ControlError>;

    /// Send one message.
    fn send(&mut self, env: &Envelope) -> Result<(), ControlError>;
}

/// Control-channel client over one device connection.
pub struct RestoredClient<C: Connection> {
    conn: C,
}

impl<C: Connection> RestoredClient<C> {
    pub fn new(conn: C) -> Self {
        Self { conn }
    }

    fn request(&mut self, name: &'static str) -> Result<(), ControlError> {
        let mut env = Envelope::new();
        env.insert_string("Label", CLIENT_LABEL);
        env.insert_string("Request", name);
        self.send_envelope(&env)
    }

    fn send_envelope(&mut self, env: &Envelope) -> Result<(), ControlError> {
        let xml = env.to_xml()?;
        let mut framed = Vec::with_capacity(4 + xml.len());
        let mut header = [0u8; 4];
        BigEndian::write_u32(&mut header, xml.len() as u32);
        framed.extend_from_slice(&header);
        framed.extend_from_slice(&xml);
        self.conn.send_all(&framed)?;
        debug!(bytes = xml.len(), "control message sent");
        Ok(())
    }

    fn receive_envelope(&mut self) -> Result<Envelope, ControlError> {
        let header = self.conn.receive_exact(4)?;
        let len = BigEndian::read_u32(&header) as usize;
        let body = self.conn.receive_exact(len)?;
        debug!(bytes = len, "control message received");
        Ok(Envelope::from_xml(&body)?)
    }
}

impl<C: Connection> ControlChannel for RestoredClient<C> {
    fn query_type(&mut self) -> Result<(String, u64), ControlError> {
        self.request("QueryType")?;
        let reply = self.receive_envelope()?;
        let identity = reply.string("Type")?.to_string();
        let version = reply.uint("ProtocolVersion").unwrap_or(0);
        Ok((identity, version))
    }

    fn start_restore(&mut self) -> Result<(), ControlError> {
        // The daemon acknowledges with messages in the receive loop, not
        // with a direct reply.
        self.request("StartRestore")
    }

    fn receive(&mut self) -> Result<Envelope, ControlError> {
        self.receive_envelope()
    }

    fn send(&mut self, env: &Envelope) -> Result<(), ControlError> {
        self.send_envelope(env)
    }
}

/// Scripted control channel for session and handler tests.
#[cfg(test)]
pub(crate) struct ScriptedControl {
    pub identity: String,
    pub version: u64,
    pub incoming: std::collections::VecDeque<Envelope>,
    pub sent: Vec<Envelope>,
    pub started: bool,
    pub receives: usize,
    /// Tripped when the script runs dry, standing in for signal delivery.
    pub cancel_when_empty: Option<crate::session::CancelToken>,
}

#[cfg(test)]
impl ScriptedControl {
    pub fn new(identity: &str, version: u64) -> Self {
        Self {
            identity: identity.to_string(),
            version,
            incoming: std::collections::VecDeque::new(),
            sent: Vec::new(),
            started: false,
            receives: 0,
            cancel_when_empty: None,
        }
    }

    pub fn push_message(&mut self, env: Envelope) {
        self.incoming.push_back(env);
    }
}

#[cfg(test)]
impl ControlChannel for ScriptedControl {
    fn query_type(&mut self) -> Result<(String, u64), ControlError> {
        Ok((self.identity.clone(), self.version))
    }

    fn start_restore(&mut self) -> Result<(), ControlError> {
        self.started = true;
        Ok(())
    }

    fn receive(&mut self) -> Result<Envelope, ControlError> {
        self.receives += 1;
        match self.incoming.pop_front() {
            Some(env) => Ok(env),
            None => {
                if let Some(cancel) = &self.cancel_when_empty {
                    cancel.cancel();
                }
                Err(ControlError::Transport(TransportError::ReceiveFailed(
                    "script exhausted".to_string(),
                )))
            }
        }
    }

    fn send(&mut self, env: &Envelope) -> Result<(), ControlError> {
        self.sent.push(env.clone());
        Ok(())
    }
}
