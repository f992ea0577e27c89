//! Restore session controller.
//!
//! High-level orchestrator for one restore: queries the device's protocol
//! identity over the control channel, starts the restore, then dispatches
//! inbound messages until cancelled.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::envelope::Envelope;
use crate::events::{RestoreEvent, RestoreObserver, RestorePhase};
use crate::handlers::{HandlerContext, handle_data_request, handle_progress, handle_status};
use crate::protocol::MessageKind;
use crate::restored::{ControlChannel, ControlError, RESTORED_TYPE};
use crate::transport::DeviceTransport;

/// Errors that end the whole session.
///
/// Per-message failures inside the receive loop are not represented here;
/// they are logged and the loop carries on.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("device is not in restore mode (reports \"{identity}\")")]
    WrongMode { identity: String },

    #[error("could not query device type: {0}")]
    TypeQuery(#[source] ControlError),

    #[error("could not start restore: {0}")]
    StartRestore(#[source] ControlError),
}

impl SessionError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        -1
    }
}

/// Configuration for a restore session.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Path to the filesystem image streamed over ASR.
    pub filesystem: Option<String>,
    /// Path to the kernelcache sent on the control channel.
    pub kernelcache: Option<String>,
    /// Restrict device discovery to this serial number.
    pub udid: Option<String>,
}

impl RestoreConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RestoreConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Cooperative cancellation flag, shared with a signal handler.
///
/// Observed at receive-loop iteration boundaries only; a blocking receive
/// or file read in flight is not interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Control channel open, nothing exchanged yet.
    Init,
    /// Device identity confirmed.
    TypeQueried,
    /// Restore started, receive loop running.
    Restoring,
    /// Session over; no further messages are processed.
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Init => write!(f, "INIT"),
            SessionState::TypeQueried => write!(f, "TYPE_QUERIED"),
            SessionState::Restoring => write!(f, "RESTORING"),
            SessionState::Terminated => write!(f, "TERMINATED"),
        }
    }
}

impl SessionState {
    fn phase(self) -> RestorePhase {
        match self {
            SessionState::Init => RestorePhase::Connecting,
            SessionState::TypeQueried => RestorePhase::TypeQuery,
            SessionState::Restoring => RestorePhase::Restoring,
            SessionState::Terminated => RestorePhase::Complete,
        }
    }
}

/// Drives one restore over an open control channel.
///
/// Owns the channel for the whole session; it is released when the session
/// is dropped.
pub struct RestoreSession<'a, T: DeviceTransport, C: ControlChannel, O: RestoreObserver> {
    transport: &'a T,
    control: C,
    config: &'a RestoreConfig,
    observer: &'a O,
    cancel: CancelToken,
    state: SessionState,
    protocol_version: u64,
}

impl<'a, T, C, O> RestoreSession<'a, T, C, O>
where
    T: DeviceTransport,
    C: ControlChannel,
    O: RestoreObserver,
{
    pub fn new(transport: &'a T, control: C, config: &'a RestoreConfig, observer: &'a O) -> Self {
        Self {
            transport,
            control,
            config,
            observer,
            cancel: CancelToken::new(),
            state: SessionState::Init,
            protocol_version: 0,
        }
    }

    /// Use an externally shared cancellation token.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Protocol version the device reported, 0 before the query.
    pub fn protocol_version(&self) -> u64 {
        self.protocol_version
    }

    /// The underlying control channel.
    pub fn control(&self) -> &C {
        &self.control
    }

    /// Run the session to completion.
    ///
    /// Returns `Ok(())` when the receive loop ends through cancellation;
    /// only a mode mismatch or a failure before the loop is an error.
    #[instrument(skip(self))]
    pub fn run(&mut self) -> Result<(), SessionError> {
        let result = self.drive();
        match &result {
            Ok(()) => self.observer.on_event(&RestoreEvent::Complete),
            Err(err) => self.observer.on_event(&RestoreEvent::Error {
                code: err.exit_code(),
                message: err.to_string(),
            }),
        }
        self.goto_state(SessionState::Terminated);
        result
    }

    fn drive(&mut self) -> Result<(), SessionError> {
        let (identity, version) = self.control.query_type().map_err(SessionError::TypeQuery)?;
        if !identity.contains(RESTORED_TYPE) {
            return Err(SessionError::WrongMode { identity });
        }
        info!(identity = %identity, version, "device is in restore mode");
        self.protocol_version = version;
        self.goto_state(SessionState::TypeQueried);

        self.control
            .start_restore()
            .map_err(SessionError::StartRestore)?;
        info!("restore started");
        self.goto_state(SessionState::Restoring);

        self.receive_loop();
        Ok(())
    }

    /// Receive and dispatch messages until the token trips.
    ///
    /// Receive noise and per-message failures are logged and tolerated;
    /// nothing inside the loop ends the session.
    fn receive_loop(&mut self) {
        while !self.cancel.is_cancelled() {
            let env = match self.control.receive() {
                Ok(env) => env,
                Err(err) => {
                    warn!(error = %err, "receive failed");
                    continue;
                }
            };
            self.dispatch(&env);
        }
        info!("session cancelled");
    }

    fn dispatch(&mut self, env: &Envelope) {
        let kind = match env.message_kind() {
            Ok(kind) => kind,
            Err(err) => {
                warn!(error = %err, "message without usable type");
                return;
            }
        };

        match kind {
            MessageKind::Progress => handle_progress(self.observer, env),
            MessageKind::Status => handle_status(env),
            MessageKind::DataRequest => {
                let mut ctx = HandlerContext {
                    transport: self.transport,
                    control: &mut self.control,
                    config: self.config,
                    observer: self.observer,
                };
                if let Err(err) = handle_data_request(&mut ctx, env) {
                    warn!(error = %err, "data request failed");
                }
            }
            MessageKind::Unknown(kind) => {
                warn!(kind = %kind, "unknown message type");
            }
        }
    }

    fn goto_state(&mut self, to: SessionState) {
        if self.state == to {
            return;
        }
        debug!(from = %self.state, to = %to, "session state change");
        self.observer.on_event(&RestoreEvent::PhaseChanged {
            from: self.state.phase(),
            to: to.phase(),
        });
        self.state = to;
    }
}
