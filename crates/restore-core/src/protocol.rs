//! Protocol constants and message discriminants.
//!
//! Values match the wire protocol spoken by restored and the ASR service.

use std::fmt;
use std::time::Duration;

// ============================================================================
// Service Ports
// ============================================================================

/// TCP port of the ASR data-stream service on the device.
pub const ASR_PORT: u16 = 12345;

/// Lockdown service port. In restore mode the restore daemon takes this
/// port over, so the control channel connects here as well.
pub const LOCKDOWN_PORT: u16 = 62078;

// ============================================================================
// ASR Tuning
// ============================================================================

/// Payload bytes per ASR packet. Also the bulk streaming chunk size; the
/// negotiated value and the streaming loop must agree bit-exactly.
pub const PACKET_PAYLOAD_SIZE: usize = 1450;

/// FEC striping parameters, passed through to the peer unchanged.
pub const FEC_SLICE_STRIDE: u64 = 40;
pub const PACKETS_PER_FEC: u64 = 25;

pub const STREAM_ID: u64 = 1;
pub const ASR_VERSION: u64 = 1;

/// Receive buffer size for one inbound envelope.
pub const RECV_BUFFER_SIZE: usize = 0x1000;

/// Attempts made to open the ASR connection before giving up.
pub const ASR_CONNECT_ATTEMPTS: u32 = 5;

/// Delay between ASR connect attempts.
pub const ASR_CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// One progress event per this many streamed chunks.
pub const PROGRESS_CHUNK_INTERVAL: u64 = 1000;

// ============================================================================
// Message Discriminants
// ============================================================================

/// Kind of an inbound control-channel message, from its `MsgType` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Progress,
    DataRequest,
    Status,
    Unknown(String),
}

impl From<&str> for MessageKind {
    fn from(wire: &str) -> Self {
        match wire {
            "ProgressMsg" => MessageKind::Progress,
            "DataRequestMsg" => MessageKind::DataRequest,
            "StatusMsg" => MessageKind::Status,
            other => MessageKind::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Progress => write!(f, "ProgressMsg"),
            MessageKind::DataRequest => write!(f, "DataRequestMsg"),
            MessageKind::Status => write!(f, "StatusMsg"),
            MessageKind::Unknown(other) => write!(f, "{other}"),
        }
    }
}

/// Payload selector of a data request, from its `DataType` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataType {
    SystemImage,
    KernelCache,
    Nor,
    Unknown(String),
}

impl From<&str> for DataType {
    fn from(wire: &str) -> Self {
        match wire {
            "SystemImageData" => DataType::SystemImage,
            "KernelCache" => DataType::KernelCache,
            "NORData" => DataType::Nor,
            other => DataType::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::SystemImage => write!(f, "SystemImageData"),
            DataType::KernelCache => write!(f, "KernelCache"),
            DataType::Nor => write!(f, "NORData"),
            DataType::Unknown(other) => write!(f, "{other}"),
        }
    }
}

/// ASR negotiation command, from the `Command` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsrCommand {
    OobData,
    Payload,
    Other(String),
}

impl From<&str> for AsrCommand {
    fn from(wire: &str) -> Self {
        match wire {
            "OOBData" => AsrCommand::OobData,
            "Payload" => AsrCommand::Payload,
            other => AsrCommand::Other(other.to_string()),
        }
    }
}

// ============================================================================
// Restore Operations
// ============================================================================

/// Human-readable name for the `Operation` code carried by progress messages.
pub fn operation_name(code: u64) -> &'static str {
    match code {
        11 => "Creating partition map",
        12 => "Creating filesystem",
        13 => "Restoring image",
        14 => "Verifying restore",
        15 => "Checking filesystems",
        16 => "Mounting filesystems",
        18 => "Flashing NOR",
        19 => "Updating baseband",
        20 => "Finalizing NAND epoch update",
        25 => "Modifying persistent boot-args",
        28 => "Waiting for NAND",
        29 => "Unmounting filesystems",
        32 => "Waiting for Device...",
        35 => "Loading NOR data to flash",
        _ => "Unknown",
    }
}
