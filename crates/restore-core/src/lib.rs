//! Restore-Core: device firmware/filesystem restore orchestration in Rust.
//!
//! This crate drives a device restore over the restored control channel and
//! streams the filesystem image to the device's ASR service on a dedicated
//! connection.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Service ports, ASR tuning constants, tagged message kinds
//! - **Envelope**: Property-list control messages with typed accessors
//! - **Transport**: Device connection abstraction (usbmuxd, mock)
//! - **Image**: Seekable source image for OOB reads and bulk streaming
//! - **ASR**: The filesystem streaming transfer
//! - **Restored / Lockdown**: Control-channel service clients
//! - **Handlers**: Inbound message handlers and data-request dispatch
//! - **Session**: High-level restore session controller
//! - **Events**: Observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use restore_core::events::TracingObserver;
//! use restore_core::protocol::LOCKDOWN_PORT;
//! use restore_core::restored::RestoredClient;
//! use restore_core::session::{RestoreConfig, RestoreSession};
//! use restore_core::transport::{DeviceTransport, UsbmuxTransport};
//!
//! let config = RestoreConfig {
//!     filesystem: Some("root.dmg".to_string()),
//!     ..Default::default()
//! };
//!
//! let transport = UsbmuxTransport::discover(None).expect("no device attached");
//! let conn = transport.connect(LOCKDOWN_PORT).expect("restore service");
//! let control = RestoredClient::new(conn);
//!
//! let observer = TracingObserver;
//! let mut session = RestoreSession::new(&transport, control, &config, &observer);
//! session.run().expect("restore failed");
//! ```

pub mod asr;
pub mod envelope;
pub mod events;
pub mod handlers;
pub mod image;
pub mod lockdown;
pub mod protocol;
pub mod restored;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use asr::{AsrError, AsrTransfer, TransferParameters};
pub use envelope::{Envelope, EnvelopeError};
pub use events::{LogLevel, NullObserver, RestoreEvent, RestoreObserver, RestorePhase, TracingObserver};
pub use handlers::{HandlerContext, HandlerError};
pub use image::{ImageError, SourceImage};
pub use lockdown::LockdownClient;
pub use protocol::{AsrCommand, DataType, MessageKind};
pub use restored::{ControlChannel, ControlError, RESTORED_TYPE, RestoredClient};
pub use session::{CancelToken, RestoreConfig, RestoreSession, SessionError, SessionState};
pub use transport::{Connection, DeviceTransport, MockTransport, TransportError};
#[cfg(unix)]
pub use transport::UsbmuxTransport;
