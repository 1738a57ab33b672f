//! Loader error kinds

use core::fmt;

/// Result type used across the loader
pub type Result<T> = core::result::Result<T, Error>;

/// Errors surfaced by every loader layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// Out of physical or heap memory
    NoMemory,

    /// Device or stream read failed
    Io,

    /// File, device or entry does not exist
    NotFound,

    /// Malformed image, partition table or request
    Invalid,

    /// Mapping or reservation conflict
    Exists,

    /// Firmware or device did not answer in time
    TimedOut,

    /// Firmware or format lacks a needed capability
    NotSupported,

    /// Failure after firmware services were shut down
    Fatal,
}

impl Error {
    /// Symbolic name printed in `error: <kind>: ...` console lines.
    pub const fn kind_name(self) -> &'static str {
        match self {
            Self::NoMemory => "ENOMEM",
            Self::Io => "EIO",
            Self::NotFound => "ENOENT",
            Self::Invalid => "EINVAL",
            Self::Exists => "EEXIST",
            Self::TimedOut => "ETIMEDOUT",
            Self::NotSupported => "ENOTSUP",
            Self::Fatal => "EFATAL",
        }
    }

    /// Errors worth another attempt at the transport level.
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Io | Self::TimedOut)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMemory => write!(f, "Out of memory"),
            Self::Io => write!(f, "I/O error"),
            Self::NotFound => write!(f, "Not found"),
            Self::Invalid => write!(f, "Invalid data or request"),
            Self::Exists => write!(f, "Already exists"),
            Self::TimedOut => write!(f, "Timed out"),
            Self::NotSupported => write!(f, "Not supported"),
            Self::Fatal => write!(f, "Fatal error after firmware shutdown"),
        }
    }
}
