//! Mock device transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::traits::{Connection, DeviceTransport, TransportError};
use crate::envelope::Envelope;

#[derive(Default)]
struct MockState {
    /// Connect attempts that fail before one succeeds.
    connect_failures: u32,
    /// Ports requested via connect.
    connects: Vec<u16>,
    /// Queued receive buffers, shared by connections from this transport.
    recv_queue: VecDeque<Vec<u8>>,
    /// Captured sends.
    sent: Vec<Vec<u8>>,
    /// If set, sends report at most this many bytes written.
    short_send: Option<usize>,
}

/// Mock transport for unit testing protocol logic.
pub struct MockTransport {
    inner: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Fail the first `n` connect attempts.
    pub fn with_connect_failures(n: u32) -> Self {
        let mock = Self::new();
        mock.inner.lock().unwrap().connect_failures = n;
        mock
    }

    /// Queue raw bytes to be returned on a future receive.
    pub fn queue_receive(&self, bytes: &[u8]) {
        self.inner.lock().unwrap().recv_queue.push_back(bytes.to_vec());
    }

    /// Queue an envelope as one XML document.
    pub fn queue_envelope(&self, env: &Envelope) {
        let xml = env.to_xml().expect("envelope encodes");
        self.queue_receive(&xml);
    }

    /// Truncate every send to at most `n` reported bytes.
    pub fn set_short_send(&self, n: usize) {
        self.inner.lock().unwrap().short_send = Some(n);
    }

    /// All captured sends, in order.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().sent.clone()
    }

    /// Ports passed to connect, in order.
    pub fn connects(&self) -> Vec<u16> {
        self.inner.lock().unwrap().connects.clone()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTransport for MockTransport {
    type Conn = MockConnection;

    fn connect(&self, port: u16) -> Result<Self::Conn, TransportError> {
        let mut state = self.inner.lock().unwrap();
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(TransportError::ConnectFailed {
                port,
                message: "connection refused".to_string(),
            });
        }
        state.connects.push(port);
        Ok(MockConnection {
            inner: Arc::clone(&self.inner),
        })
    }
}

/// Connection handed out by `MockTransport`; shares its queues so tests can
/// inspect traffic after the connection has been consumed.
pub struct MockConnection {
    inner: Arc<Mutex<MockState>>,
}

impl Connection for MockConnection {
    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.inner.lock().unwrap();
        state.sent.push(data.to_vec());
        match state.short_send {
            Some(n) => Ok(n.min(data.len())),
            None => Ok(data.len()),
        }
    }

    fn receive(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let mut state = self.inner.lock().unwrap();
        let mut chunk = state
            .recv_queue
            .pop_front()
            .ok_or_else(|| TransportError::ReceiveFailed("receive queue empty".to_string()))?;
        if chunk.len() > max_len {
            let rest = chunk.split_off(max_len);
            state.recv_queue.push_front(rest);
        }
        Ok(chunk)
    }
}
