// Error types for capmux

use std::{fmt, io};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Which half of filter installation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStage {
    Compile,
    Attach,
}

impl fmt::Display for FilterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterStage::Compile => write!(f, "error in filter expression"),
            FilterStage::Attach => write!(f, "can't set filter expression"),
        }
    }
}

/// Main error type for capmux operations
#[derive(Debug, Error)]
pub enum Error {
    /// A signal channel or multiplexer syscall failed.
    #[error("{op}: {source}")]
    System {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The capture device could not be opened (unknown device, missing privilege).
    #[error("can't open {device}: {reason}")]
    CaptureOpen { device: String, reason: String },

    /// The filter expression failed to compile or could not be attached.
    #[error("{stage} '{expr}': {reason}")]
    Filter {
        stage: FilterStage,
        expr: String,
        reason: String,
    },

    /// Reading from the capture source failed in a way the loop cannot recover from.
    #[error("pcap error: {0}")]
    CaptureDispatch(String),

    /// Capture counters could not be read.
    #[error("pcap_stat error: {0}")]
    StatsRead(String),
}

impl Error {
    /// Wrap the current `errno` for the named operation.
    pub fn last_os_error(op: &'static str) -> Self {
        Self::System {
            op,
            source: io::Error::last_os_error(),
        }
    }

    pub fn system(op: &'static str, source: io::Error) -> Self {
        Self::System { op, source }
    }

    pub fn capture_open(device: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::CaptureOpen {
            device: device.into(),
            reason: reason.to_string(),
        }
    }

    pub fn filter(stage: FilterStage, expr: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Filter {
            stage,
            expr: expr.into(),
            reason: reason.to_string(),
        }
    }

    /// Everything except a failed statistics query ends the process.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::StatsRead(_))
    }
}
