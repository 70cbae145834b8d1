//! Write Path — synchronous send on an open handle.

use std::fmt;

use crate::connection::DeviceHandle;
use crate::device::{DeviceError, UartDevice};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    NotOpen,
    /// The device accepted only part of the data.
    Partial { written: usize, requested: usize },
    Failed(String),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::NotOpen => write!(f, "Cannot write: device not open"),
            WriteError::Partial { written, requested } => {
                write!(f, "Partial write: {written} of {requested} bytes sent")
            }
            WriteError::Failed(e) => write!(f, "Write failed: {e}"),
        }
    }
}

impl std::error::Error for WriteError {}

impl<D: UartDevice> DeviceHandle<D> {
    /// Send `data`, blocking until the device accepts it or fails.
    ///
    /// Returns the byte count only when everything was accepted; anything
    /// less is [`WriteError::Partial`]. An empty write is `Ok(0)` and never
    /// reaches the device.
    pub fn write(&self, data: &[u8]) -> Result<usize, WriteError> {
        if !self.is_open() {
            return Err(WriteError::NotOpen);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let requested = data.len();
        let result = self
            .with_device(|device| device.write(data))
            .ok_or(WriteError::NotOpen)?;

        match result {
            Ok(written) if written >= requested => {
                log::debug!("{}: wrote {requested} bytes", self.info().path);
                Ok(requested)
            }
            Ok(written) => Err(WriteError::Partial { written, requested }),
            Err(DeviceError::Disconnected) if !self.is_open() => Err(WriteError::NotOpen),
            Err(e) => Err(WriteError::Failed(e.to_string())),
        }
    }
}
