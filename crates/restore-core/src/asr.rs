//! ASR filesystem streaming transfer.
//!
//! The device's ASR service accepts a second connection next to the control
//! channel. After a greeting and a transfer-parameters handshake the peer
//! may issue any number of out-of-band reads against the source image, in
//! any order, before it requests the payload; the image is then streamed
//! sequentially in fixed-size chunks.

use std::io::{Read, Seek};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::envelope::{Envelope, EnvelopeError};
use crate::events::{RestoreEvent, RestoreObserver, RestorePhase};
use crate::image::{ImageError, SourceImage};
use crate::protocol::{
    ASR_CONNECT_ATTEMPTS, ASR_CONNECT_RETRY_DELAY, ASR_PORT, ASR_VERSION, AsrCommand,
    FEC_SLICE_STRIDE, PACKET_PAYLOAD_SIZE, PACKETS_PER_FEC, PROGRESS_CHUNK_INTERVAL,
    RECV_BUFFER_SIZE, STREAM_ID,
};
use crate::transport::{Connection, DeviceTransport, TransportError};

#[derive(Error, Debug)]
pub enum AsrError {
    #[error("could not connect to ASR after {attempts} attempts: {source}")]
    Connect {
        attempts: u32,
        source: TransportError,
    },

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("envelope: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("malformed OOB request: {0}")]
    MalformedOob(#[source] EnvelopeError),

    #[error("{0}")]
    Image(#[from] ImageError),

    #[error("short write: sent {sent} of {requested} bytes")]
    ShortWrite { sent: usize, requested: usize },

    #[error("OOB request budget of {0} exhausted before payload start")]
    OobBudgetExhausted(u64),
}

/// Negotiated stream settings, sent to the peer before any data.
///
/// The FEC striping values are passed through unchanged; only the payload
/// size is coupled to behavior here, as the bulk streaming chunk size.
#[derive(Debug, Clone)]
pub struct TransferParameters {
    pub fec_slice_stride: u64,
    pub packet_payload_size: u64,
    pub packets_per_fec: u64,
    pub stream_id: u64,
    pub version: u64,
    pub port: u64,
    pub total_size: u64,
}

impl TransferParameters {
    /// Default parameters for an image of the given size.
    pub fn for_image(total_size: u64) -> Self {
        Self {
            fec_slice_stride: FEC_SLICE_STRIDE,
            packet_payload_size: PACKET_PAYLOAD_SIZE as u64,
            packets_per_fec: PACKETS_PER_FEC,
            stream_id: STREAM_ID,
            version: ASR_VERSION,
            port: 1,
            total_size,
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        let mut payload = Envelope::new();
        payload.insert_uint("Port", self.port);
        payload.insert_uint("Size", self.total_size);

        let mut env = Envelope::new();
        env.insert_uint("FEC Slice Stride", self.fec_slice_stride);
        env.insert_uint("Packet Payload Size", self.packet_payload_size);
        env.insert_uint("Packets Per FEC", self.packets_per_fec);
        env.insert_dict("Payload", payload);
        env.insert_uint("Stream ID", self.stream_id);
        env.insert_uint("Version", self.version);
        env
    }
}

/// Drives one filesystem transfer over a dedicated ASR connection.
pub struct AsrTransfer<'a, O: RestoreObserver> {
    observer: &'a O,
    /// OOB rounds to serve before giving up; `None` waits for the payload
    /// command indefinitely, which is what the device protocol expects.
    max_oob_requests: Option<u64>,
    retry_delay: Duration,
}

impl<'a, O: RestoreObserver> AsrTransfer<'a, O> {
    pub fn new(observer: &'a O) -> Self {
        Self {
            observer,
            max_oob_requests: None,
            retry_delay: ASR_CONNECT_RETRY_DELAY,
        }
    }

    /// Bound the OOB negotiation loop.
    pub fn oob_budget(mut self, budget: u64) -> Self {
        self.max_oob_requests = Some(budget);
        self
    }

    /// Override the delay between connect attempts.
    pub fn connect_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Run the whole transfer: handshake, OOB service, bulk stream.
    ///
    /// The connection and the image are released on every exit path.
    pub fn send_image<T, R>(
        &self,
        transport: &T,
        mut image: SourceImage<R>,
    ) -> Result<(), AsrError>
    where
        T: DeviceTransport,
        R: Read + Seek,
    {
        let mut conn = self.connect(transport)?;

        // The service announces itself once on accept; the content is
        // informational only, but failing to receive it is fatal.
        let greeting = conn.receive(RECV_BUFFER_SIZE)?;
        debug!(
            len = greeting.len(),
            greeting = %String::from_utf8_lossy(&greeting).trim_end(),
            "ASR greeting"
        );

        let params = TransferParameters::for_image(image.len());
        conn.send_all(&params.to_envelope().to_xml()?)?;
        info!(size = image.len(), "sent transfer parameters");

        self.observer.on_event(&RestoreEvent::PhaseChanged {
            from: RestorePhase::Restoring,
            to: RestorePhase::AsrHandshake,
        });
        self.serve_oob(&mut conn, &mut image)?;

        self.observer.on_event(&RestoreEvent::PhaseChanged {
            from: RestorePhase::AsrHandshake,
            to: RestorePhase::AsrStreaming,
        });
        self.stream_payload(&mut conn, &mut image)?;

        info!("done sending filesystem");
        Ok(())
    }

    fn connect<T: DeviceTransport>(&self, transport: &T) -> Result<T::Conn, AsrError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match transport.connect(ASR_PORT) {
                Ok(conn) => {
                    debug!(attempt, "connected to ASR");
                    return Ok(conn);
                }
                Err(source) if attempt >= ASR_CONNECT_ATTEMPTS => {
                    return Err(AsrError::Connect {
                        attempts: attempt,
                        source,
                    });
                }
                Err(err) => {
                    debug!(attempt, error = %err, "ASR connect attempt failed");
                    thread::sleep(self.retry_delay);
                }
            }
        }
    }

    /// Serve OOB reads until the peer requests the payload.
    fn serve_oob<C, R>(&self, conn: &mut C, image: &mut SourceImage<R>) -> Result<(), AsrError>
    where
        C: Connection,
        R: Read + Seek,
    {
        let mut served = 0u64;
        loop {
            let raw = conn.receive(RECV_BUFFER_SIZE)?;
            let request = Envelope::from_xml(&raw)?;

            match request.asr_command() {
                Some(AsrCommand::OobData) => {
                    if let Some(budget) = self.max_oob_requests {
                        if served >= budget {
                            return Err(AsrError::OobBudgetExhausted(budget));
                        }
                    }
                    served += 1;
                    self.serve_oob_request(conn, image, &request)?;
                }
                Some(AsrCommand::Payload) => {
                    debug!(oob_requests = served, "payload start requested");
                    return Ok(());
                }
                Some(AsrCommand::Other(command)) => {
                    warn!(command = %command, "ignoring unexpected ASR command");
                }
                None => {
                    warn!("ASR message without command");
                }
            }
        }
    }

    fn serve_oob_request<C, R>(
        &self,
        conn: &mut C,
        image: &mut SourceImage<R>,
        request: &Envelope,
    ) -> Result<(), AsrError>
    where
        C: Connection,
        R: Read + Seek,
    {
        let length = request.uint("OOB Length").map_err(AsrError::MalformedOob)?;
        let offset = request.uint("OOB Offset").map_err(AsrError::MalformedOob)?;
        debug!(offset, length, "serving OOB read");

        let data = image.read_at(offset, length)?;
        let sent = conn.send(&data)?;
        if sent != data.len() {
            return Err(AsrError::ShortWrite {
                sent,
                requested: data.len(),
            });
        }
        Ok(())
    }

    /// Stream the image from offset 0 in fixed-size chunks.
    fn stream_payload<C, R>(&self, conn: &mut C, image: &mut SourceImage<R>) -> Result<(), AsrError>
    where
        C: Connection,
        R: Read + Seek,
    {
        image.rewind()?;
        let total = image.len();
        let mut buf = [0u8; PACKET_PAYLOAD_SIZE];
        let mut sent_bytes = 0u64;
        let mut chunks = 0u64;

        while sent_bytes < total {
            let want = (total - sent_bytes).min(PACKET_PAYLOAD_SIZE as u64) as usize;
            image.read_chunk(&mut buf[..want])?;
            conn.send_all(&buf[..want])?;
            sent_bytes += want as u64;
            chunks += 1;

            if chunks % PROGRESS_CHUNK_INTERVAL == 0 {
                self.observer.on_event(&RestoreEvent::Progress {
                    phase: RestorePhase::AsrStreaming,
                    current: sent_bytes,
                    total,
                });
            }
        }

        debug!(chunks, bytes = sent_bytes, "bulk stream finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::transport::MockTransport;
    use std::io::Cursor;

    fn image_of(len: usize) -> SourceImage<Cursor<Vec<u8>>> {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        SourceImage::from_reader(Cursor::new(data)).unwrap()
    }

    fn command(name: &str) -> Envelope {
        let mut env = Envelope::new();
        env.insert_string("Command", name);
        env
    }

    fn oob_request(offset: u64, length: u64) -> Envelope {
        let mut env = command("OOBData");
        env.insert_uint("OOB Length", length);
        env.insert_uint("OOB Offset", offset);
        env
    }

    /// Mock with greeting queued, ready for a transfer.
    fn greeted_mock() -> MockTransport {
        let mock = MockTransport::new();
        mock.queue_receive(b"Apple System Restore v1\n");
        mock
    }

    fn transfer<O: RestoreObserver>(observer: &O) -> AsrTransfer<'_, O> {
        AsrTransfer::new(observer).connect_retry_delay(Duration::ZERO)
    }

    #[test]
    fn test_bulk_chunking() {
        let mock = greeted_mock();
        mock.queue_envelope(&command("Payload"));

        let observer = NullObserver;
        transfer(&observer)
            .send_image(&mock, image_of(3000))
            .unwrap();

        let sent = mock.sent();
        // First send is the transfer-parameters document.
        let params = Envelope::from_xml(&sent[0]).unwrap();
        assert_eq!(params.uint("Packet Payload Size").unwrap(), 1450);

        let chunks: Vec<usize> = sent[1..].iter().map(|c| c.len()).collect();
        assert_eq!(chunks, vec![1450, 1450, 100]);

        let streamed: Vec<u8> = sent[1..].concat();
        let expected: Vec<u8> = (0..3000).map(|i| (i % 251) as u8).collect();
        assert_eq!(streamed, expected);
    }

    #[test]
    fn test_bulk_chunking_exact_multiple() {
        let mock = greeted_mock();
        mock.queue_envelope(&command("Payload"));

        let observer = NullObserver;
        transfer(&observer)
            .send_image(&mock, image_of(2900))
            .unwrap();

        let chunks: Vec<usize> = mock.sent()[1..].iter().map(|c| c.len()).collect();
        assert_eq!(chunks, vec![1450, 1450]);
    }

    #[test]
    fn test_zero_length_image_streams_nothing() {
        let mock = greeted_mock();
        mock.queue_envelope(&command("Payload"));

        let observer = NullObserver;
        transfer(&observer).send_image(&mock, image_of(0)).unwrap();

        // Only the parameters document went out.
        assert_eq!(mock.sent().len(), 1);
    }

    #[test]
    fn test_declared_size_matches_image() {
        let mock = greeted_mock();
        mock.queue_envelope(&command("Payload"));

        let observer = NullObserver;
        transfer(&observer)
            .send_image(&mock, image_of(3000))
            .unwrap();

        let params = Envelope::from_xml(&mock.sent()[0]).unwrap();
        let payload = params.dict("Payload").unwrap();
        assert_eq!(payload.get("Size").unwrap().as_unsigned_integer(), Some(3000));
    }

    #[test]
    fn test_oob_read_served() {
        let mock = greeted_mock();
        mock.queue_envelope(&oob_request(500, 200));
        mock.queue_envelope(&command("Payload"));

        let observer = NullObserver;
        transfer(&observer)
            .send_image(&mock, image_of(1000))
            .unwrap();

        let sent = mock.sent();
        let expected: Vec<u8> = (500..700).map(|i| (i % 251) as u8).collect();
        assert_eq!(sent[1], expected);
    }

    #[test]
    fn test_oob_read_past_end_aborts() {
        let mock = greeted_mock();
        mock.queue_envelope(&oob_request(900, 200));

        let observer = NullObserver;
        let err = transfer(&observer)
            .send_image(&mock, image_of(1000))
            .unwrap_err();

        assert!(matches!(
            err,
            AsrError::Image(ImageError::RangeOutOfBounds { .. })
        ));
        // Nothing beyond the parameters document was sent.
        assert_eq!(mock.sent().len(), 1);
    }

    #[test]
    fn test_malformed_oob_request() {
        let mock = greeted_mock();
        let mut bad = command("OOBData");
        bad.insert_uint("OOB Offset", 0);
        mock.queue_envelope(&bad);

        let observer = NullObserver;
        let err = transfer(&observer)
            .send_image(&mock, image_of(100))
            .unwrap_err();
        assert!(matches!(err, AsrError::MalformedOob(_)));
    }

    #[test]
    fn test_short_write_is_fatal() {
        let mock = greeted_mock();
        mock.queue_envelope(&oob_request(0, 64));

        let observer = NullObserver;
        let asr = transfer(&observer);
        mock.set_short_send(10);
        let err = asr.send_image(&mock, image_of(100)).unwrap_err();
        assert!(matches!(
            err,
            AsrError::ShortWrite {
                sent: 10,
                requested: 64
            }
        ));
    }

    #[test]
    fn test_unknown_commands_tolerated() {
        let mock = greeted_mock();
        mock.queue_envelope(&command("KeepAlive"));
        mock.queue_envelope(&Envelope::new());
        mock.queue_envelope(&command("Payload"));

        let observer = NullObserver;
        transfer(&observer).send_image(&mock, image_of(10)).unwrap();
    }

    #[test]
    fn test_connect_retries_then_fails() {
        let mock = MockTransport::with_connect_failures(5);
        let observer = NullObserver;
        let err = transfer(&observer)
            .send_image(&mock, image_of(10))
            .unwrap_err();
        assert!(matches!(err, AsrError::Connect { attempts: 5, .. }));
    }

    #[test]
    fn test_connect_succeeds_within_budget() {
        let mock = MockTransport::with_connect_failures(4);
        mock.queue_receive(b"greeting");
        mock.queue_envelope(&command("Payload"));

        let observer = NullObserver;
        transfer(&observer).send_image(&mock, image_of(10)).unwrap();
        assert_eq!(mock.connects(), vec![ASR_PORT]);
    }

    #[test]
    fn test_oob_budget_exhausted() {
        let mock = greeted_mock();
        mock.queue_envelope(&oob_request(0, 10));
        mock.queue_envelope(&oob_request(10, 10));

        let observer = NullObserver;
        let err = AsrTransfer::new(&observer)
            .connect_retry_delay(Duration::ZERO)
            .oob_budget(1)
            .send_image(&mock, image_of(100))
            .unwrap_err();
        assert!(matches!(err, AsrError::OobBudgetExhausted(1)));
    }

    #[test]
    fn test_progress_events_every_thousand_chunks() {
        use crate::events::RecordingObserver;

        let mock = greeted_mock();
        mock.queue_envelope(&command("Payload"));

        // 1000 full chunks and one trailing byte: exactly one progress event.
        let observer = RecordingObserver::new();
        transfer(&observer)
            .send_image(&mock, image_of(1450 * 1000 + 1))
            .unwrap();

        let progress: Vec<_> = observer
            .events()
            .into_iter()
            .filter(|e| matches!(e, RestoreEvent::Progress { .. }))
            .collect();
        assert_eq!(progress.len(), 1);
        match &progress[0] {
            RestoreEvent::Progress { current, total, .. } => {
                assert_eq!(*current, 1450 * 1000);
                assert_eq!(*total, 1450 * 1000 + 1);
            }
            _ => unreachable!(),
        }
    }
}
