//! Unified error type for the ftlink-lib crate.
//!
//! [`FtlinkError`] wraps the per-component errors (discovery, open,
//! configuration, read, write, backend) plus I/O and config-file problems.
//! `From` impls allow `?` to propagate across module boundaries.

use std::fmt;

use crate::connection::{DiscoveryError, OpenError};
use crate::device::DeviceError;
use crate::link::ConfigError;
use crate::read_loop::ReadError;
use crate::write::WriteError;

#[derive(Debug)]
pub enum FtlinkError {
    Discovery(DiscoveryError),
    Open(OpenError),
    /// Link configuration could not be applied to the device.
    Configure(ConfigError),
    Read(ReadError),
    Write(WriteError),
    /// Backend error not covered by the above.
    Device(DeviceError),
    /// Standard I/O error (config persistence).
    Io(std::io::Error),
    /// Configuration file validation error.
    Config(String),
}

impl fmt::Display for FtlinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FtlinkError::Discovery(e) => write!(f, "{e}"),
            FtlinkError::Open(e) => write!(f, "{e}"),
            FtlinkError::Configure(e) => write!(f, "{e}"),
            FtlinkError::Read(e) => write!(f, "{e}"),
            FtlinkError::Write(e) => write!(f, "{e}"),
            FtlinkError::Device(e) => write!(f, "{e}"),
            FtlinkError::Io(e) => write!(f, "I/O error: {e}"),
            FtlinkError::Config(e) => write!(f, "Config error: {e}"),
        }
    }
}

impl std::error::Error for FtlinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FtlinkError::Discovery(e) => Some(e),
            FtlinkError::Open(e) => Some(e),
            FtlinkError::Configure(e) => Some(e),
            FtlinkError::Read(e) => Some(e),
            FtlinkError::Write(e) => Some(e),
            FtlinkError::Device(e) => Some(e),
            FtlinkError::Io(e) => Some(e),
            FtlinkError::Config(_) => None,
        }
    }
}

impl From<DiscoveryError> for FtlinkError {
    fn from(e: DiscoveryError) -> Self {
        FtlinkError::Discovery(e)
    }
}

impl From<OpenError> for FtlinkError {
    fn from(e: OpenError) -> Self {
        FtlinkError::Open(e)
    }
}

impl From<ConfigError> for FtlinkError {
    fn from(e: ConfigError) -> Self {
        FtlinkError::Configure(e)
    }
}

impl From<ReadError> for FtlinkError {
    fn from(e: ReadError) -> Self {
        FtlinkError::Read(e)
    }
}

impl From<WriteError> for FtlinkError {
    fn from(e: WriteError) -> Self {
        FtlinkError::Write(e)
    }
}

impl From<DeviceError> for FtlinkError {
    fn from(e: DeviceError) -> Self {
        FtlinkError::Device(e)
    }
}

impl From<std::io::Error> for FtlinkError {
    fn from(e: std::io::Error) -> Self {
        FtlinkError::Io(e)
    }
}

/// Crate-level Result alias using [`FtlinkError`].
pub type Result<T> = std::result::Result<T, FtlinkError>;
