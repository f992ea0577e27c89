//! Lockdown client, used to push a device into recovery mode.
//!
//! Same framing as the restore daemon: big-endian u32 length followed by an
//! XML property list, on the lockdown service port.

use byteorder::{BigEndian, ByteOrder};
use tracing::info;

use crate::envelope::Envelope;
use crate::restored::ControlError;
use crate::transport::Connection;

const CLIENT_LABEL: &str = "irestore";

/// Minimal lockdown session.
pub struct LockdownClient<C: Connection> {
    conn: C,
}

impl<C: Connection> LockdownClient<C> {
    pub fn new(conn: C) -> Self {
        Self { conn }
    }

    /// Ask the device to reboot into recovery mode.
    pub fn enter_recovery(&mut self) -> Result<(), ControlError> {
        let mut env = Envelope::new();
        env.insert_string("Label", CLIENT_LABEL);
        env.insert_string("Request", "EnterRecovery");
        self.exchange(&env).and_then(|reply| {
            match reply.string("Result") {
                Ok("Success") => {
                    info!("device acknowledged recovery request");
                    Ok(())
                }
                _ => Err(ControlError::Refused {
                    request: "EnterRecovery",
                }),
            }
        })
    }

    fn exchange(&mut self, env: &Envelope) -> Result<Envelope, ControlError> {
        let xml = env.to_xml()?;
        let mut framed = Vec::with_capacity(4 + xml.len());
        let mut header = [0u8; 4];
        BigEndian::write_u32(&mut header, xml.len() as u32);
        framed.extend_from_slice(&header);
        framed.extend_from_slice(&xml);
        self.conn.send_all(&framed)?;

        let header = self.conn.receive_exact(4)?;
        let len = BigEndian::read_u32(&header) as usize;
        let body = self.conn.receive_exact(len)?;
        Ok(Envelope::from_xml(&body)?)
    }
}
