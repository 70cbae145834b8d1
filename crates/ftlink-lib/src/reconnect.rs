//! Reconnection after a device fault.
//!
//! When a bridge disappears (cable pulled, driver rebind), the Read Loop
//! stops with a terminal fault. These helpers retry the open on a
//! [`Backoff`] schedule so callers don't hammer the USB stack.

use crate::backoff::Backoff;
use crate::connection::{ConnectionManager, DeviceHandle};
use crate::device::DeviceAccess;
use crate::session::{Session, SessionOptions};

/// Attempt to reopen device `index`, respecting backoff timing.
///
/// - Returns `None` without attempting if the backoff timer hasn't elapsed.
/// - On success, records success and returns the new handle.
/// - On failure, records failure, logs the backoff schedule, and returns `None`.
pub fn try_reopen<A: DeviceAccess>(
    backoff: &mut Backoff,
    manager: &ConnectionManager<A>,
    index: usize,
) -> Option<DeviceHandle<A::Device>> {
    if !backoff.should_attempt() {
        return None;
    }
    match manager.open(index) {
        Ok(handle) => {
            backoff.record_success();
            Some(handle)
        }
        Err(e) => {
            record_failure(backoff, &e);
            None
        }
    }
}

/// Like [`try_reopen`], but brings the whole session back: reopen,
/// re-apply the link configuration and restart the Read Loop.
pub fn try_restart<A: DeviceAccess>(
    backoff: &mut Backoff,
    manager: &ConnectionManager<A>,
    index: usize,
    options: &SessionOptions,
) -> Option<Session<A::Device>> {
    if !backoff.should_attempt() {
        return None;
    }
    match Session::start(manager, index, options) {
        Ok(session) => {
            backoff.record_success();
            log::info!("reconnected to device {index}");
            Some(session)
        }
        Err(e) => {
            record_failure(backoff, &e);
            None
        }
    }
}

fn record_failure(backoff: &mut Backoff, e: &dyn std::fmt::Display) {
    backoff.record_failure();
    log::warn!(
        "reconnect failed: {e} (attempt {}, retry in {:.1}s)",
        backoff.consecutive_failures(),
        backoff.current_delay().as_secs_f64()
    );
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backoff::BackoffConfig;
    use crate::device::DeviceError;
    use crate::device::mock::MockAccess;

    fn quick() -> Backoff {
        Backoff::new(BackoffConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2.0,
        })
    }

    #[test]
    fn reopen_succeeds_and_resets() {
        let (access, _ports) = MockAccess::with_ports(1);
        let mgr = ConnectionManager::new(access);
        let mut backoff = quick();
        backoff.record_failure();
        std::thread::sleep(Duration::from_millis(10));

        let handle = try_reopen(&mut backoff, &mgr, 0).unwrap();
        assert!(handle.is_open());
        assert_eq!(backoff.consecutive_failures(), 0);
    }

    #[test]
    fn reopen_failure_advances_backoff() {
        let (access, ports) = MockAccess::with_ports(1);
        ports[0].fail_open(DeviceError::NotFound);
        let mgr = ConnectionManager::new(access);
        let mut backoff = quick();

        assert!(try_reopen(&mut backoff, &mgr, 0).is_none());
        assert_eq!(backoff.consecutive_failures(), 1);
        assert_eq!(backoff.current_delay(), Duration::from_millis(2));
    }

    #[test]
    fn reopen_waits_for_backoff() {
        let (access, _ports) = MockAccess::with_ports(1);
        let mgr = ConnectionManager::new(access);
        let mut backoff = Backoff::new(BackoffConfig {
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        });
        backoff.record_failure();
        assert!(try_reopen(&mut backoff, &mgr, 0).is_none());
        assert_eq!(mgr.open_count(), 0);
    }

    #[test]
    fn restart_brings_session_back() {
        let (access, ports) = MockAccess::with_ports(1);
        let mgr = ConnectionManager::new(access);
        let mut backoff = quick();
        let session = try_restart(&mut backoff, &mgr, 0, &SessionOptions::default()).unwrap();

        ports[0].inject(b"back");
        assert_eq!(
            session.notifications().recv_timeout(Duration::from_secs(5)),
            Ok(crate::channel::Notification::Data(b"back".to_vec()))
        );
    }
}
