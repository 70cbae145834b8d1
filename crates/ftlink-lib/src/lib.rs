//! ftlink — connection manager for FTDI USB-UART bridges.
//!
//! Discover a bridge, open it, translate link parameters into register
//! writes, and receive bytes on a background Read Loop that hands them to
//! the consumer over a bounded channel.

pub mod backoff;
pub mod channel;
pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod link;
pub mod protocol;
pub mod read_loop;
pub mod reconnect;
pub mod session;
pub mod write;

pub use channel::{Notification, Notifications, OverflowPolicy};
pub use connection::{ConnectionManager, DeviceHandle, DiscoveryError, OpenError};
pub use error::{FtlinkError, Result};
pub use link::{ConfigError, LinkConfiguration, RegisterSet, apply, translate};
pub use read_loop::{ReadError, ReadLoop, ReadLoopState};
pub use session::{Session, SessionOptions};
pub use write::WriteError;
