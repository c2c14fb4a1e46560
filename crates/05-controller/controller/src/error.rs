use thiserror::Error;

pub type ControllerResult<T> = Result<T, ControllerError>;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("duplicate module routing key ({0}, {1})")]
    DuplicateRoutingKey(u8, u8),

    #[error("event logger is stopped; controller refuses to start")]
    LoggerStopped,

    #[error("controller did not identify within {timeout_ms} ms")]
    IdentifyTimeout { timeout_ms: u64 },

    #[error("controller replied with id {found}, expected {expected}")]
    IdentifyMismatch { expected: u8, found: u8 },

    #[error("controller is faulted; stop and restart the runtime")]
    Faulted,

    #[error("controller is not running")]
    NotRunning,

    #[error("controller was already stopped; interfaces cannot be restarted")]
    AlreadyStopped,

    #[error("frame-error storm on the serial link ({count} errors in {window_ms} ms)")]
    FrameErrorStorm { count: u32, window_ms: u64 },

    #[error("failed to open serial port {port}: {source}")]
    PortOpen {
        port: String,
        source: serialport::Error,
    },

    #[error("serial i/o failure: {0}")]
    SerialIo(#[from] std::io::Error),

    #[error(transparent)]
    Module(#[from] modules::ModuleError),

    #[error("log submission failed: {0}")]
    Log(#[from] eventlog::LogError),
}
