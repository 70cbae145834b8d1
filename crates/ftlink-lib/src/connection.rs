//! Connection Manager — discovery, open/close, and the shared device handle.
//!
//! A [`DeviceHandle`] is shared between the control thread and the Read Loop
//! worker. Hardware calls are serialised through a mutex; the open flag is
//! atomic so that `close` and `is_open` never wait on an in-flight transfer.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use crate::device::{DeviceAccess, DeviceError, DeviceInfo, DiscoveredDevice, UartDevice};
use crate::link::{self, ConfigError, LinkConfiguration, RegisterSet};
use crate::read_loop::{LoopControl, ReadError, ReceiveBuffer};

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Error types ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// The device-access layer cannot be used at all.
    Unavailable(String),
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryError::Unavailable(e) => write!(f, "Device discovery unavailable: {e}"),
        }
    }
}

impl std::error::Error for DiscoveryError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenError {
    NotFound,
    PermissionDenied(String),
    /// The port already has a live handle (from us or another process).
    AlreadyOpen,
    /// The backend failed, or produced a device that does not report open.
    DeviceFailed(String),
}

impl fmt::Display for OpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenError::NotFound => write!(f, "No device at that index"),
            OpenError::PermissionDenied(e) => write!(f, "Permission denied: {e}"),
            OpenError::AlreadyOpen => write!(f, "Device is already open"),
            OpenError::DeviceFailed(e) => write!(f, "Device failed to open: {e}"),
        }
    }
}

impl std::error::Error for OpenError {}

impl From<DeviceError> for OpenError {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::NotFound => OpenError::NotFound,
            DeviceError::PermissionDenied(e) => OpenError::PermissionDenied(e),
            DeviceError::Busy(_) => OpenError::AlreadyOpen,
            other => OpenError::DeviceFailed(other.to_string()),
        }
    }
}

// ── Connection Manager ──

type Registry = Arc<Mutex<HashSet<usize>>>;

/// Default bound on one receive poll.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Default bound on one write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Owns the device-access layer and tracks which ports have a live handle.
pub struct ConnectionManager<A: DeviceAccess> {
    access: A,
    registry: Registry,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl<A: DeviceAccess> ConnectionManager<A> {
    pub fn new(access: A) -> Self {
        Self::with_timeouts(access, DEFAULT_READ_TIMEOUT, DEFAULT_WRITE_TIMEOUT)
    }

    /// Manager whose handles bound read polling and writes by the given timeouts.
    pub fn with_timeouts(access: A, read_timeout: Duration, write_timeout: Duration) -> Self {
        ConnectionManager {
            access,
            registry: Arc::new(Mutex::new(HashSet::new())),
            read_timeout,
            write_timeout,
        }
    }

    /// Number of attached compatible devices. Never touches open handles.
    pub fn discover(&self) -> Result<usize, DiscoveryError> {
        self.devices().map(|d| d.len())
    }

    /// Attached compatible devices, in enumeration order.
    pub fn devices(&self) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
        self.access
            .enumerate()
            .map_err(|e| DiscoveryError::Unavailable(e.to_string()))
    }

    /// Open the device at `index` in enumeration order.
    ///
    /// The returned handle is guaranteed to report itself open; a backend
    /// that hands back a closed device is released and reported as
    /// [`OpenError::DeviceFailed`].
    pub fn open(&self, index: usize) -> Result<DeviceHandle<A::Device>, OpenError> {
        if !lock(&self.registry).insert(index) {
            return Err(OpenError::AlreadyOpen);
        }
        let result = self.open_reserved(index);
        if result.is_err() {
            lock(&self.registry).remove(&index);
        }
        result
    }

    fn open_reserved(&self, index: usize) -> Result<DeviceHandle<A::Device>, OpenError> {
        let mut device = self.access.open(index)?;

        if let Err(e) = device.set_timeouts(self.read_timeout, self.write_timeout) {
            log::warn!("could not set I/O timeouts: {e}");
        }

        if !device.is_open() {
            device.close();
            return Err(OpenError::DeviceFailed(
                "device did not report open after open".into(),
            ));
        }

        log::info!("opened device {index} ({})", device.info().path);
        Ok(DeviceHandle::new(device, Arc::clone(&self.registry)))
    }

    /// Close `handle`. Idempotent, callable from any thread.
    pub fn close(&self, handle: &DeviceHandle<A::Device>) {
        handle.close();
    }

    pub fn is_open(&self, handle: &DeviceHandle<A::Device>) -> bool {
        handle.is_open()
    }

    /// Number of ports with a live handle.
    pub fn open_count(&self) -> usize {
        lock(&self.registry).len()
    }
}

impl ConnectionManager<crate::device::PlatformAccess> {
    /// Manager over the platform's native backend.
    pub fn platform() -> Self {
        Self::new(crate::device::PlatformAccess::new())
    }
}

// ── Device handle ──

struct HandleInner<D: UartDevice> {
    info: DeviceInfo,
    device: Mutex<D>,
    open: AtomicBool,
    released: AtomicBool,
    link: Mutex<Option<LinkConfiguration>>,
    read_loop: Mutex<Option<Arc<LoopControl>>>,
    registry: Registry,
}

/// Close the device and give the port back to the registry (once).
fn release<D: UartDevice>(device: &mut D, released: &AtomicBool, registry: &Registry, info: &DeviceInfo) {
    device.close();
    if !released.swap(true, Ordering::SeqCst) {
        lock(registry).remove(&info.index);
        log::info!("closed {}", info.path);
    }
}

impl<D: UartDevice> HandleInner<D> {
    fn release(&self, device: &mut D) {
        release(device, &self.released, &self.registry, &self.info);
    }
}

impl<D: UartDevice> Drop for HandleInner<D> {
    fn drop(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        let device = self.device.get_mut().unwrap_or_else(|e| e.into_inner());
        release(device, &self.released, &self.registry, &self.info);
    }
}

/// One open hardware connection. Cheap to clone; all clones refer to the
/// same port, and closing any of them closes it for all.
pub struct DeviceHandle<D: UartDevice> {
    inner: Arc<HandleInner<D>>,
}

impl<D: UartDevice> Clone for DeviceHandle<D> {
    fn clone(&self) -> Self {
        DeviceHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: UartDevice> fmt::Debug for DeviceHandle<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("info", &self.inner.info)
            .field("open", &self.inner.open.load(Ordering::SeqCst))
            .finish()
    }
}

impl<D: UartDevice> DeviceHandle<D> {
    fn new(device: D, registry: Registry) -> Self {
        DeviceHandle {
            inner: Arc::new(HandleInner {
                info: device.info().clone(),
                device: Mutex::new(device),
                open: AtomicBool::new(true),
                released: AtomicBool::new(false),
                link: Mutex::new(None),
                read_loop: Mutex::new(None),
                registry,
            }),
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.inner.info
    }

    /// Non-blocking status query.
    ///
    /// False once closed, or when the backend reports the device gone. A
    /// device busy with a transfer is assumed still open.
    pub fn is_open(&self) -> bool {
        if !self.inner.open.load(Ordering::SeqCst) {
            return false;
        }
        match self.inner.device.try_lock() {
            Ok(device) => device.is_open(),
            Err(TryLockError::Poisoned(p)) => p.into_inner().is_open(),
            Err(TryLockError::WouldBlock) => true,
        }
    }

    /// Release the port. Idempotent and non-blocking: an attached Read Loop
    /// is asked to stop, and if a transfer is in flight the thread running
    /// it finishes the release.
    pub fn close(&self) {
        if !self.inner.open.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(control) = lock(&self.inner.read_loop).as_ref() {
            control.request_stop();
        }
        *lock(&self.inner.link) = None;
        match self.inner.device.try_lock() {
            Ok(mut device) => self.inner.release(&mut device),
            Err(TryLockError::Poisoned(p)) => self.inner.release(&mut p.into_inner()),
            Err(TryLockError::WouldBlock) => log::debug!("close deferred to in-flight transfer"),
        }
    }

    /// The last configuration applied successfully, if any.
    pub fn link(&self) -> Option<LinkConfiguration> {
        *lock(&self.inner.link)
    }

    /// Translate and apply `cfg`, replacing the stored configuration.
    ///
    /// On failure the handle is left unconfigured; re-apply from scratch.
    pub fn configure(&self, cfg: &LinkConfiguration) -> Result<(), ConfigError> {
        self.apply(&link::translate(cfg))?;
        *lock(&self.inner.link) = Some(*cfg);
        log::info!("{}: configured {cfg}", self.inner.info.path);
        Ok(())
    }

    /// Write a register set. Clears the stored configuration first, so a
    /// failed pass leaves the handle unconfigured.
    pub fn apply(&self, regs: &RegisterSet) -> Result<(), ConfigError> {
        *lock(&self.inner.link) = None;
        self.with_device(|device| link::apply(device, regs))
            .unwrap_or(Err(ConfigError::NotOpen))
    }

    /// Run `f` with exclusive access to the device. `None` if closed.
    pub(crate) fn with_device<R>(&self, f: impl FnOnce(&mut D) -> R) -> Option<R> {
        if !self.inner.open.load(Ordering::SeqCst) {
            return None;
        }
        let out = {
            let mut device = lock(&self.inner.device);
            if !self.inner.open.load(Ordering::SeqCst) {
                self.inner.release(&mut device);
                return None;
            }
            f(&mut device)
        };
        // A close that raced this call could not take the lock.
        if !self.inner.open.load(Ordering::SeqCst) {
            self.inner.release(&mut lock(&self.inner.device));
        }
        Some(out)
    }

    /// One Read Loop poll: query queue status, then read at most
    /// `min(available, capacity)` bytes into `buf`. Returns the count read.
    pub(crate) fn poll(&self, buf: &mut ReceiveBuffer) -> Result<usize, ReadError> {
        let result = self
            .with_device(|device| {
                if !device.is_open() {
                    return Err(DeviceError::Disconnected);
                }
                let available = device.queue_status()?;
                if available == 0 {
                    buf.clear();
                    return Ok(0);
                }
                let want = available.min(buf.capacity());
                buf.fill(|space| device.read(&mut space[..want]))
            })
            .ok_or(ReadError::NotOpen)?;

        result.map_err(|e| {
            if self.inner.open.load(Ordering::SeqCst) {
                ReadError::DeviceFault(e.to_string())
            } else {
                ReadError::NotOpen
            }
        })
    }

    /// Register `control` as this handle's Read Loop.
    pub(crate) fn attach_loop(&self, control: &Arc<LoopControl>) -> Result<(), ReadError> {
        let mut slot = lock(&self.inner.read_loop);
        if let Some(existing) = slot.as_ref()
            && !existing.is_stopped()
        {
            return Err(ReadError::AlreadyRunning);
        }
        *slot = Some(Arc::clone(control));
        Ok(())
    }

    pub(crate) fn detach_loop(&self, control: &Arc<LoopControl>) {
        let mut slot = lock(&self.inner.read_loop);
        if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, control)) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{MockAccess, MockCall, MockStep};

    #[test]
    fn discover_counts_devices() {
        let (access, _ports) = MockAccess::with_ports(2);
        let mgr = ConnectionManager::new(access);
        assert_eq!(mgr.discover().unwrap(), 2);
        assert_eq!(mgr.open_count(), 0);
    }

    #[test]
    fn discover_does_not_touch_open_handles() {
        let (access, _ports) = MockAccess::with_ports(2);
        let mgr = ConnectionManager::new(access);
        let handle = mgr.open(1).unwrap();
        assert_eq!(mgr.discover().unwrap(), 2);
        assert!(handle.is_open());
    }

    #[test]
    fn discover_unavailable_layer() {
        let (access, _ports) = MockAccess::with_ports(1);
        access.set_unavailable(true);
        let mgr = ConnectionManager::new(access);
        assert!(matches!(mgr.discover(), Err(DiscoveryError::Unavailable(_))));
    }

    #[test]
    fn open_out_of_range_is_not_found() {
        let (access, _ports) = MockAccess::with_ports(1);
        let mgr = ConnectionManager::new(access);
        assert_eq!(mgr.open(5).unwrap_err(), OpenError::NotFound);
        assert_eq!(mgr.open_count(), 0);
    }

    #[test]
    fn open_sets_timeouts() {
        let (access, ports) = MockAccess::with_ports(1);
        let mgr = ConnectionManager::with_timeouts(
            access,
            Duration::from_millis(20),
            Duration::from_millis(300),
        );
        let _handle = mgr.open(0).unwrap();
        assert_eq!(
            ports[0].calls(),
            vec![MockCall::SetTimeouts {
                read: Duration::from_millis(20),
                write: Duration::from_millis(300),
            }]
        );
    }

    #[test]
    fn open_twice_is_already_open() {
        let (access, _ports) = MockAccess::with_ports(1);
        let mgr = ConnectionManager::new(access);
        let _handle = mgr.open(0).unwrap();
        assert_eq!(mgr.open(0).unwrap_err(), OpenError::AlreadyOpen);
    }

    #[test]
    fn busy_backend_maps_to_already_open() {
        let (access, ports) = MockAccess::with_ports(1);
        ports[0].fail_open(DeviceError::Busy("claimed by another process".into()));
        let mgr = ConnectionManager::new(access);
        assert_eq!(mgr.open(0).unwrap_err(), OpenError::AlreadyOpen);
    }

    #[test]
    fn permission_denied_is_surfaced() {
        let (access, ports) = MockAccess::with_ports(1);
        ports[0].fail_open(DeviceError::PermissionDenied("udev".into()));
        let mgr = ConnectionManager::new(access);
        assert_eq!(
            mgr.open(0).unwrap_err(),
            OpenError::PermissionDenied("udev".into())
        );
        assert_eq!(mgr.open_count(), 0);
    }

    #[test]
    fn device_reporting_closed_yields_no_handle() {
        let (access, ports) = MockAccess::with_ports(1);
        ports[0].open_as_closed(true);
        let mgr = ConnectionManager::new(access);
        assert!(matches!(mgr.open(0), Err(OpenError::DeviceFailed(_))));
        assert_eq!(mgr.open_count(), 0);
    }

    #[test]
    fn close_is_idempotent() {
        let (access, ports) = MockAccess::with_ports(1);
        let mgr = ConnectionManager::new(access);
        let handle = mgr.open(0).unwrap();
        mgr.close(&handle);
        mgr.close(&handle);
        assert!(!mgr.is_open(&handle));
        assert_eq!(ports[0].count(|c| *c == MockCall::Close), 1);
        assert_eq!(mgr.open_count(), 0);
    }

    #[test]
    fn reopen_after_close() {
        let (access, _ports) = MockAccess::with_ports(1);
        let mgr = ConnectionManager::new(access);
        let handle = mgr.open(0).unwrap();
        handle.close();
        let again = mgr.open(0).unwrap();
        assert!(again.is_open());
    }

    #[test]
    fn dropping_last_clone_releases_port() {
        let (access, ports) = MockAccess::with_ports(1);
        let mgr = ConnectionManager::new(access);
        let handle = mgr.open(0).unwrap();
        let clone = handle.clone();
        drop(handle);
        assert!(ports[0].is_open());
        drop(clone);
        assert!(!ports[0].is_open());
        assert_eq!(mgr.open_count(), 0);
    }

    #[test]
    fn unplugged_device_reports_closed() {
        let (access, ports) = MockAccess::with_ports(1);
        let mgr = ConnectionManager::new(access);
        let handle = mgr.open(0).unwrap();
        ports[0].unplug();
        assert!(!handle.is_open());
    }

    #[test]
    fn configure_stores_link() {
        let (access, _ports) = MockAccess::with_ports(1);
        let mgr = ConnectionManager::new(access);
        let handle = mgr.open(0).unwrap();
        assert_eq!(handle.link(), None);
        let cfg = LinkConfiguration::from_raw(57_600, 7, 2, 1, 1);
        handle.configure(&cfg).unwrap();
        assert_eq!(handle.link(), Some(cfg));
    }

    #[test]
    fn failed_configure_clears_link() {
        let (access, ports) = MockAccess::with_ports(1);
        let mgr = ConnectionManager::new(access);
        let handle = mgr.open(0).unwrap();
        handle.configure(&LinkConfiguration::default()).unwrap();

        ports[0].fail_step(Some(MockStep::FlowControl));
        let err = handle
            .configure(&LinkConfiguration::from_raw(115_200, 8, 1, 0, 3))
            .unwrap_err();
        assert!(matches!(err, ConfigError::DeviceRejected { .. }));
        assert_eq!(handle.link(), None);
    }

    #[test]
    fn configure_after_close_is_not_open() {
        let (access, ports) = MockAccess::with_ports(1);
        let mgr = ConnectionManager::new(access);
        let handle = mgr.open(0).unwrap();
        handle.close();
        ports[0].clear_calls();
        assert_eq!(
            handle.configure(&LinkConfiguration::default()),
            Err(ConfigError::NotOpen)
        );
        assert!(ports[0].calls().is_empty());
    }

    #[test]
    fn open_error_display() {
        assert_eq!(OpenError::AlreadyOpen.to_string(), "Device is already open");
        assert_eq!(
            DiscoveryError::Unavailable("no usb".into()).to_string(),
            "Device discovery unavailable: no usb"
        );
    }
}
