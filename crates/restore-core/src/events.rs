//! Event system for UI decoupling.
//!
//! Lets a CLI or other front-end follow the restore without tight coupling
//! to the protocol logic.

use std::fmt;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Restore phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorePhase {
    /// Opening the control channel.
    Connecting,
    /// Querying the device's protocol identity.
    TypeQuery,
    /// Restore started, receive loop running.
    Restoring,
    /// ASR handshake and OOB negotiation.
    AsrHandshake,
    /// Filesystem image streaming.
    AsrStreaming,
    /// Session finished.
    Complete,
    /// Error state.
    Error,
}

impl fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestorePhase::Connecting => write!(f, "Connecting"),
            RestorePhase::TypeQuery => write!(f, "Type Query"),
            RestorePhase::Restoring => write!(f, "Restoring"),
            RestorePhase::AsrHandshake => write!(f, "ASR Handshake"),
            RestorePhase::AsrStreaming => write!(f, "ASR Streaming"),
            RestorePhase::Complete => write!(f, "Complete"),
            RestorePhase::Error => write!(f, "Error"),
        }
    }
}

/// Events emitted during a restore session.
#[derive(Debug, Clone)]
pub enum RestoreEvent {
    /// Device found and control channel usable.
    DeviceConnected { udid: String },
    /// Phase changed.
    PhaseChanged { from: RestorePhase, to: RestorePhase },
    /// Progress update for the current operation.
    Progress {
        phase: RestorePhase,
        current: u64,
        total: u64,
    },
    /// Device reported a restore operation.
    Operation { code: u64, name: &'static str },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Error occurred.
    Error { code: i32, message: String },
    /// Session finished.
    Complete,
}

/// Observer trait for receiving restore events.
///
/// Implement this in your UI layer to receive updates.
pub trait RestoreObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &RestoreEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl RestoreObserver for NullObserver {
    fn on_event(&self, _event: &RestoreEvent) {
        // Do nothing
    }
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl RestoreObserver for TracingObserver {
    fn on_event(&self, event: &RestoreEvent) {
        match event {
            RestoreEvent::DeviceConnected { udid } => {
                tracing::info!(udid = %udid, "Device connected");
            }
            RestoreEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            RestoreEvent::Progress {
                phase,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::info!(phase = %phase, progress = %format!("{}%", pct), "Progress");
            }
            RestoreEvent::Operation { code, name } => {
                tracing::info!(code = code, "{}", name);
            }
            RestoreEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            RestoreEvent::Error { code, message } => {
                tracing::error!(code = code, "Error: {}", message);
            }
            RestoreEvent::Complete => {
                tracing::info!("Restore session complete");
            }
        }
    }
}

/// Observer that records every event, for assertions in tests.
#[cfg(test)]
pub(crate) struct RecordingObserver {
    events: std::sync::Mutex<Vec<RestoreEvent>>,
}

#[cfg(test)]
impl RecordingObserver {
    pub fn new() -> Self {
        Self {
            events: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<RestoreEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl RestoreObserver for RecordingObserver {
    fn on_event(&self, event: &RestoreEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
