use thiserror::Error;

/// Failure modes of the capture-to-serial pipeline.
///
/// Only `DeviceChanged` is recoverable (the driver restarts the pipeline a
/// bounded number of times); everything else is reported to the user and the
/// process exits after a short delay.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Loopback audio device not found")]
    LoopbackUnavailable,

    #[error("Your audio configuration does not work with audio capture: {0}")]
    StreamOpenFailed(String),

    #[error("Serial device {port} is not available: {reason}")]
    LinkUnavailable { port: String, reason: String },

    #[error("Audio device changed")]
    DeviceChanged,
}
