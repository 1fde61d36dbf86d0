use crate::backend::BackendError;
use crate::engine::EngineState;

/// Result alias that carries the custom [`ScanError`] type.
pub type Result<T> = std::result::Result<T, ScanError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// Invalid scan parameters or configuration, rejected before they can
    /// reach the timing model or the hardware.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// The hardware backend reported a failure. Fatal to the running session.
    #[error("hardware fault: {0}")]
    Hardware(#[from] BackendError),
    /// Raw sample count does not match the pixel grid being decoded.
    #[error("sample buffer holds {actual} samples but the pixel grid needs {expected}")]
    ShapeMismatch { expected: usize, actual: usize },
    /// Operation invoked while the engine was in a state that forbids it.
    #[error("cannot {operation} while the engine is {state}")]
    State {
        operation: &'static str,
        state: EngineState,
    },
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    /// Free-form failure, mostly poisoned locks.
    #[error("{0}")]
    Message(String),
}

impl ScanError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn state(operation: &'static str, state: EngineState) -> Self {
        Self::State { operation, state }
    }

    /// True for errors that end the current scanning session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Hardware(_) | Self::ShapeMismatch { .. })
    }
}

impl From<&str> for ScanError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for ScanError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
