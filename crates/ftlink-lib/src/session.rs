//! Session — open, configure and start receiving in one call.

use crate::channel::{self, Notifications, OverflowPolicy};
use crate::connection::{ConnectionManager, DeviceHandle};
use crate::device::{DeviceAccess, UartDevice};
use crate::link::LinkConfiguration;
use crate::read_loop::{ReadLoop, ReadLoopConfig};
use crate::write::WriteError;

/// Everything needed to bring a link up.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub link: LinkConfiguration,
    pub read_loop: ReadLoopConfig,
    pub channel_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::new(LinkConfiguration::default())
    }
}

impl SessionOptions {
    pub fn new(link: LinkConfiguration) -> Self {
        SessionOptions {
            link,
            read_loop: ReadLoopConfig::default(),
            channel_capacity: channel::DEFAULT_CAPACITY,
            overflow: OverflowPolicy::default(),
        }
    }
}

/// An open, configured device with a running Read Loop.
pub struct Session<D: UartDevice + 'static> {
    handle: DeviceHandle<D>,
    read_loop: ReadLoop,
    notifications: Notifications,
}

impl<D: UartDevice + 'static> Session<D> {
    /// Open device `index`, apply `options.link`, start the Read Loop.
    ///
    /// Any failure after the open closes the handle again.
    pub fn start<A>(
        manager: &ConnectionManager<A>,
        index: usize,
        options: &SessionOptions,
    ) -> crate::Result<Self>
    where
        A: DeviceAccess<Device = D>,
    {
        let handle = manager.open(index)?;

        if let Err(e) = handle.configure(&options.link) {
            handle.close();
            return Err(e.into());
        }

        let (notifier, notifications) =
            channel::channel(options.channel_capacity, options.overflow);
        let read_loop = match ReadLoop::start(&handle, notifier, options.read_loop.clone()) {
            Ok(read_loop) => read_loop,
            Err(e) => {
                handle.close();
                return Err(e.into());
            }
        };

        Ok(Session {
            handle,
            read_loop,
            notifications,
        })
    }

    pub fn handle(&self) -> &DeviceHandle<D> {
        &self.handle
    }

    pub fn read_loop(&self) -> &ReadLoop {
        &self.read_loop
    }

    pub fn notifications(&self) -> &Notifications {
        &self.notifications
    }

    pub fn send(&self, data: &[u8]) -> Result<usize, WriteError> {
        self.handle.write(data)
    }

    /// Stop receiving; the handle stays open.
    pub fn stop(&self) {
        self.read_loop.stop();
    }

    /// Close the handle and join the Read Loop.
    pub fn close(self) {
        self.handle.close();
    }

    pub fn into_parts(self) -> (DeviceHandle<D>, ReadLoop, Notifications) {
        (self.handle, self.read_loop, self.notifications)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::FtlinkError;
    use crate::channel::Notification;
    use crate::connection::OpenError;
    use crate::device::mock::{MockAccess, MockCall, MockStep};
    use crate::link::ConfigError;
    use crate::read_loop::ReadLoopState;

    #[test]
    fn start_send_receive() {
        let (access, _a, _b) = MockAccess::loopback_pair();
        let mgr = ConnectionManager::new(access);
        let options = SessionOptions::new(LinkConfiguration::default());
        let left = Session::start(&mgr, 0, &options).unwrap();
        let right = Session::start(&mgr, 1, &options).unwrap();

        assert_eq!(left.send(b"ping"), Ok(4));
        assert_eq!(
            right.notifications().recv_timeout(Duration::from_secs(5)),
            Ok(Notification::Data(b"ping".to_vec()))
        );
        assert_eq!(left.handle().link(), Some(LinkConfiguration::default()));
    }

    #[test]
    fn rejected_configuration_closes_handle() {
        let (access, ports) = MockAccess::with_ports(1);
        ports[0].fail_step(Some(MockStep::Characteristics));
        let mgr = ConnectionManager::new(access);
        let err = Session::start(&mgr, 0, &SessionOptions::default())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            FtlinkError::Configure(ConfigError::DeviceRejected { .. })
        ));
        assert!(!ports[0].is_open());
        assert_eq!(mgr.open_count(), 0);
        assert_eq!(ports[0].count(|c| *c == MockCall::Close), 1);
    }

    #[test]
    fn open_failure_propagates() {
        let (access, _ports) = MockAccess::with_ports(0);
        let mgr = ConnectionManager::new(access);
        let err = Session::start(&mgr, 0, &SessionOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, FtlinkError::Open(OpenError::NotFound)));
    }

    #[test]
    fn stop_keeps_handle_open() {
        let (access, _ports) = MockAccess::with_ports(1);
        let mgr = ConnectionManager::new(access);
        let session = Session::start(&mgr, 0, &SessionOptions::default()).unwrap();
        session.stop();
        assert!(session.read_loop().wait_stopped(Duration::from_secs(5)));
        assert_eq!(session.read_loop().state(), ReadLoopState::Stopped);
        assert!(session.handle().is_open());
    }

    #[test]
    fn close_releases_port() {
        let (access, ports) = MockAccess::with_ports(1);
        let mgr = ConnectionManager::new(access);
        let session = Session::start(&mgr, 0, &SessionOptions::default()).unwrap();
        session.close();
        assert!(!ports[0].is_open());
        assert_eq!(mgr.open_count(), 0);
    }
}
