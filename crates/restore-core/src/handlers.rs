//! Inbound message handlers and data-request dispatch.

use std::path::Path;

use thiserror::Error;
use tracing::{info, warn};

use crate::asr::{AsrError, AsrTransfer};
use crate::envelope::{Envelope, EnvelopeError};
use crate::events::{RestoreEvent, RestoreObserver, RestorePhase};
use crate::image::{ImageError, SourceImage};
use crate::protocol::{DataType, operation_name};
use crate::restored::{ControlChannel, ControlError};
use crate::session::RestoreConfig;
use crate::transport::DeviceTransport;

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("ASR transfer failed: {0}")]
    Asr(#[from] AsrError),

    #[error("envelope: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("control channel: {0}")]
    Control(#[from] ControlError),

    #[error("image: {0}")]
    Image(#[from] ImageError),

    #[error("failed to read {path}: {source}")]
    KernelRead {
        path: String,
        source: std::io::Error,
    },

    #[error("no {0} file configured")]
    MissingPath(&'static str),

    #[error("unsupported data type \"{0}\"")]
    UnsupportedDataType(String),
}

/// Resources a message handler may need.
pub struct HandlerContext<'a, T: DeviceTransport, C: ControlChannel, O: RestoreObserver> {
    pub transport: &'a T,
    pub control: &'a mut C,
    pub config: &'a RestoreConfig,
    pub observer: &'a O,
}

/// Progress messages have no protocol effect; surface them to the observer.
pub fn handle_progress<O: RestoreObserver>(observer: &O, env: &Envelope) {
    if let Ok(code) = env.uint("Operation") {
        observer.on_event(&RestoreEvent::Operation {
            code,
            name: operation_name(code),
        });
    }
    if let Ok(progress) = env.uint("Progress") {
        observer.on_event(&RestoreEvent::Progress {
            phase: RestorePhase::Restoring,
            current: progress,
            total: 100,
        });
    }
}

/// Status messages are logging-only.
pub fn handle_status(env: &Envelope) {
    match env.uint("Status") {
        Ok(status) => info!(status, "status message"),
        Err(_) => info!("status message"),
    }
}

/// Route a data request to the matching delivery action.
pub fn handle_data_request<T, C, O>(
    ctx: &mut HandlerContext<'_, T, C, O>,
    env: &Envelope,
) -> Result<(), HandlerError>
where
    T: DeviceTransport,
    C: ControlChannel,
    O: RestoreObserver,
{
    match env.data_type()? {
        DataType::SystemImage => send_filesystem(ctx),
        DataType::KernelCache => send_kernel_cache(ctx),
        DataType::Nor => send_nor_data(),
        DataType::Unknown(name) => {
            warn!(data_type = %name, "unknown data type requested");
            Err(HandlerError::UnsupportedDataType(name))
        }
    }
}

/// Stream the filesystem image over a dedicated ASR connection.
fn send_filesystem<T, C, O>(ctx: &mut HandlerContext<'_, T, C, O>) -> Result<(), HandlerError>
where
    T: DeviceTransport,
    C: ControlChannel,
    O: RestoreObserver,
{
    let path = ctx
        .config
        .filesystem
        .as_deref()
        .ok_or(HandlerError::MissingPath("filesystem"))?;
    let image = SourceImage::open(Path::new(path))?;
    info!(path = %path, size = image.len(), "starting filesystem transfer");

    AsrTransfer::new(ctx.observer).send_image(ctx.transport, image)?;
    Ok(())
}

/// Send the whole kernelcache as one blob on the control channel.
fn send_kernel_cache<T, C, O>(ctx: &mut HandlerContext<'_, T, C, O>) -> Result<(), HandlerError>
where
    T: DeviceTransport,
    C: ControlChannel,
    O: RestoreObserver,
{
    let path = ctx
        .config
        .kernelcache
        .as_deref()
        .ok_or(HandlerError::MissingPath("kernelcache"))?;
    info!(path = %path, "sending kernelcache");

    let data = std::fs::read(path).map_err(|source| HandlerError::KernelRead {
        path: path.to_string(),
        source,
    })?;

    let mut env = Envelope::new();
    env.insert_data("KernelCacheFile", data);
    ctx.control.send(&env)?;

    info!("done sending kernelcache");
    Ok(())
}

/// NOR flashing is not implemented; the request is acknowledged by silence.
fn send_nor_data() -> Result<(), HandlerError> {
    warn!("NOR data requested, not implemented");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::restored::ScriptedControl;
    use crate::transport::MockTransport;

    fn data_request(data_type: &str) -> Envelope {
        let mut env = Envelope::new();
        env.insert_string("MsgType", "DataRequestMsg");
        env.insert_string("DataType", data_type);
        env
    }

    fn context<'a>(
        transport: &'a MockTransport,
        control: &'a mut ScriptedControl,
        config: &'a RestoreConfig,
        observer: &'a NullObserver,
    ) -> HandlerContext<'a, MockTransport, ScriptedControl, NullObserver> {
        HandlerContext {
            transport,
            control,
            config,
            observer,
        }
    }

    #[test]
    fn test_nor_request_succeeds_and_sends_nothing() {
        let transport = MockTransport::new();
        let mut control = ScriptedControl::new("x", 1);
        let config = RestoreConfig::default();
        let observer = NullObserver;

        let mut ctx = context(&transport, &mut control, &config, &observer);
        handle_data_request(&mut ctx, &data_request("NORData")).unwrap();

        assert!(transport.sent().is_empty());
        assert!(transport.connects().is_empty());
        assert!(control.sent.is_empty());
    }

    #[test]
    fn test_unknown_data_type_is_an_error() {
        let transport = MockTransport::new();
        let mut control = ScriptedControl::new("x", 1);
        let config = RestoreConfig::default();
        let observer = NullObserver;

        let mut ctx = context(&transport, &mut control, &config, &observer);
        let err = handle_data_request(&mut ctx, &data_request("BasebandData")).unwrap_err();
        assert!(matches!(err, HandlerError::UnsupportedDataType(t) if t == "BasebandData"));
    }

    #[test]
    fn test_missing_data_type_is_an_error() {
        let transport = MockTransport::new();
        let mut control = ScriptedControl::new("x", 1);
        let config = RestoreConfig::default();
        let observer = NullObserver;

        let mut env = Envelope::new();
        env.insert_string("MsgType", "DataRequestMsg");
        let mut ctx = context(&transport, &mut control, &config, &observer);
        assert!(matches!(
            handle_data_request(&mut ctx, &env),
            Err(HandlerError::Envelope(_))
        ));
    }

    #[test]
    fn test_kernel_cache_requires_configured_path() {
        let transport = MockTransport::new();
        let mut control = ScriptedControl::new("x", 1);
        let config = RestoreConfig::default();
        let observer = NullObserver;

        let mut ctx = context(&transport, &mut control, &config, &observer);
        let err = handle_data_request(&mut ctx, &data_request("KernelCache")).unwrap_err();
        assert!(matches!(err, HandlerError::MissingPath("kernelcache")));
        assert!(control.sent.is_empty());
    }

    #[test]
    fn test_kernel_cache_sent_as_single_blob() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("irestore-test-kernel-{}", std::process::id()));
        std::fs::write(&path, b"kernelcache contents").unwrap();

        let transport = MockTransport::new();
        let mut control = ScriptedControl::new("x", 1);
        let config = RestoreConfig {
            kernelcache: Some(path.display().to_string()),
            ..Default::default()
        };
        let observer = NullObserver;

        let mut ctx = context(&transport, &mut control, &config, &observer);
        handle_data_request(&mut ctx, &data_request("KernelCache")).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(control.sent.len(), 1);
        assert_eq!(
            control.sent[0].data("KernelCacheFile").unwrap(),
            b"kernelcache contents"
        );
        // The blob rides the control channel, not a new connection.
        assert!(transport.connects().is_empty());
    }

    #[test]
    fn test_missing_kernel_file_sends_nothing() {
        let transport = MockTransport::new();
        let mut control = ScriptedControl::new("x", 1);
        let config = RestoreConfig {
            kernelcache: Some("/nonexistent/kernelcache".to_string()),
            ..Default::default()
        };
        let observer = NullObserver;

        let mut ctx = context(&transport, &mut control, &config, &observer);
        let err = handle_data_request(&mut ctx, &data_request("KernelCache")).unwrap_err();
        assert!(matches!(err, HandlerError::KernelRead { .. }));
        assert!(control.sent.is_empty());
    }

    #[test]
    fn test_progress_message_maps_operation() {
        use crate::events::RecordingObserver;

        let mut env = Envelope::new();
        env.insert_string("MsgType", "ProgressMsg");
        env.insert_uint("Operation", 13);
        env.insert_uint("Progress", 42);

        let observer = RecordingObserver::new();
        handle_progress(&observer, &env);

        let events = observer.events();
        assert!(events.iter().any(|e| matches!(
            e,
            RestoreEvent::Operation {
                code: 13,
                name: "Restoring image"
            }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            RestoreEvent::Progress {
                current: 42,
                total: 100,
                ..
            }
        )));
    }
}
