//! Error types for the media pipeline engine
//!
//! Fatal conditions are returned as [`Error`]; soft failures (an empty queue
//! poll, an invalid buffer seen while draining) are logged and never surface
//! here.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Port error: {0}")]
    Port(#[from] PortError),

    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error is a programming defect rather than a runtime failure
    pub fn is_protocol_violation(&self) -> bool {
        match self {
            Error::Pool(e) => e.is_protocol_violation(),
            Error::Port(e) => e.is_protocol_violation(),
            Error::Pipeline(PipelineError::Protocol(_)) => true,
            _ => false,
        }
    }
}

/// Buffer pool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Invalid pool dimensions: {num} buffers of {size} bytes")]
    InvalidDimensions { num: usize, size: usize },

    #[error("Failed to allocate {0} bytes of buffer memory")]
    AllocationFailed(usize),

    #[error("{0} buffers still outstanding")]
    Outstanding(usize),

    #[error("Buffer does not belong to this pool")]
    ForeignBuffer,

    #[error("Buffer belongs to a destroyed or resized pool")]
    StaleBuffer,

    #[error("Buffer {0} released while not outstanding")]
    NotOutstanding(usize),

    #[error("Buffer {0} is owned by the hardware")]
    InFlight(usize),

    #[error("Buffer {0} completed without being submitted")]
    NotInFlight(usize),

    #[error("Buffer {0} submitted without being acquired from the pool")]
    NotAcquired(usize),

    #[error("Buffer {0} forwarded before the hardware returned it")]
    NotCompleted(usize),
}

impl PoolError {
    /// Double release, double submit and forged handles are defects, not
    /// resource problems
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            PoolError::ForeignBuffer
                | PoolError::StaleBuffer
                | PoolError::NotOutstanding(_)
                | PoolError::InFlight(_)
                | PoolError::NotInFlight(_)
                | PoolError::NotAcquired(_)
                | PoolError::NotCompleted(_)
        )
    }
}

/// Port configuration and lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("Cannot change format of {0} while it is enabled")]
    FormatWhileEnabled(String),

    #[error("Port {0} has no committed format")]
    NotCommitted(String),

    #[error("Port {0} has no buffer pool")]
    NoPool(String),

    #[error("Port {port} is not an {expected} port")]
    WrongKind { port: String, expected: String },

    #[error("Incompatible formats: {from} -> {to}")]
    Incompatible { from: String, to: String },

    #[error("Port {0} is already connected")]
    AlreadyConnected(String),
}

impl PortError {
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            PortError::FormatWhileEnabled(_) | PortError::NotCommitted(_) | PortError::NoPool(_)
        )
    }
}

/// Errors reported by the hardware stage binding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HardwareError {
    #[error("status {code}: {context}")]
    Status { code: i32, context: String },

    #[error("Unknown port: {0}")]
    UnknownPort(String),

    #[error("Port {0} is disabled")]
    Disabled(String),

    #[error("Hardware worker stopped")]
    WorkerStopped,
}

/// Driver-level failures
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Timed out draining {port}: {outstanding} buffers never returned")]
    DrainTimeout { port: String, outstanding: usize },

    #[error("Producer failed: {0}")]
    ProducerFailed(String),

    #[error("Component {0} has no output port at the requested index")]
    NoOutputPort(String),
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("Resolution {width}x{height} cannot be padded to the block size")]
    InvalidResolution { width: u32, height: u32 },

    #[error("No configuration directory available")]
    NoConfigDir,
}

/// Errors raised by capture handlers (producers and sinks)
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handler has no {0} stream")]
    NoStream(&'static str),

    #[error("{0}")]
    Custom(String),
}

impl HandlerError {
    /// Create a custom handler error
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_violation_classification() {
        assert!(Error::from(PoolError::NotOutstanding(2)).is_protocol_violation());
        assert!(Error::from(PoolError::InFlight(0)).is_protocol_violation());
        assert!(Error::from(PortError::NotCommitted("output:0".into())).is_protocol_violation());
        assert!(!Error::from(PoolError::AllocationFailed(64)).is_protocol_violation());
        assert!(!Error::from(HardwareError::WorkerStopped).is_protocol_violation());
    }

    #[test]
    fn test_error_display() {
        let err = PoolError::InvalidDimensions { num: 0, size: 4096 };
        assert_eq!(err.to_string(), "Invalid pool dimensions: 0 buffers of 4096 bytes");

        let err = Error::from(HardwareError::Status { code: -3, context: "commit".into() });
        assert_eq!(err.to_string(), "Hardware error: status -3: commit");
    }
}
