//! Read Loop — background worker that drains received bytes into the
//! Notification Channel.
//!
//! Each iteration: check the handle is open, query queue status, read at
//! most one buffer's worth, copy exactly the bytes read into a message, and
//! push it. Empty polls back off from `idle_min` to `idle_max`; any data
//! resets the pacing. A device fault is pushed as a terminal
//! [`Notification::Fault`] and the loop stops.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::backoff::{Backoff, BackoffConfig};
use crate::channel::{Delivery, Notification, Notifier};
use crate::connection::{DeviceHandle, lock};
use crate::device::UartDevice;
use crate::protocol::RX_BUFFER_CAPACITY;

// ── Error type ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// The handle is closed.
    NotOpen,
    /// The device failed mid-poll. Terminal for this loop; reopen to resume.
    DeviceFault(String),
    /// The handle already has a running Read Loop.
    AlreadyRunning,
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::NotOpen => write!(f, "Cannot read: device not open"),
            ReadError::DeviceFault(e) => write!(f, "Device fault while reading: {e}"),
            ReadError::AlreadyRunning => write!(f, "A read loop is already running on this device"),
        }
    }
}

impl std::error::Error for ReadError {}

// ── State ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadLoopState {
    Stopped = 0,
    Running = 1,
    StopRequested = 2,
}

impl ReadLoopState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ReadLoopState::Running,
            2 => ReadLoopState::StopRequested,
            _ => ReadLoopState::Stopped,
        }
    }
}

impl fmt::Display for ReadLoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReadLoopState::Stopped => "stopped",
            ReadLoopState::Running => "running",
            ReadLoopState::StopRequested => "stop requested",
        };
        f.write_str(s)
    }
}

/// Cross-thread coordination for one Read Loop: the atomic state plus a
/// condvar so idle waits and `wait_stopped` wake on transitions.
#[derive(Debug)]
pub(crate) struct LoopControl {
    state: AtomicU8,
    wake: Mutex<()>,
    cv: Condvar,
}

impl LoopControl {
    fn running() -> Self {
        LoopControl {
            state: AtomicU8::new(ReadLoopState::Running as u8),
            wake: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn state(&self) -> ReadLoopState {
        ReadLoopState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state() == ReadLoopState::Running
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.state() == ReadLoopState::Stopped
    }

    /// Running → StopRequested. No effect in any other state.
    pub(crate) fn request_stop(&self) -> bool {
        let changed = self
            .state
            .compare_exchange(
                ReadLoopState::Running as u8,
                ReadLoopState::StopRequested as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if changed {
            let _guard = lock(&self.wake);
            self.cv.notify_all();
        }
        changed
    }

    /// Worker exit: → Stopped.
    fn finish(&self) {
        let _guard = lock(&self.wake);
        self.state
            .store(ReadLoopState::Stopped as u8, Ordering::SeqCst);
        self.cv.notify_all();
    }

    /// Sleep up to `delay`, waking early on a stop request.
    fn pause(&self, delay: Duration) {
        let guard = lock(&self.wake);
        if !self.is_running() {
            return;
        }
        let _ = self.cv.wait_timeout(guard, delay);
    }

    fn wait_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = lock(&self.wake);
        while !self.is_stopped() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = match self.cv.wait_timeout(guard, deadline - now) {
                Ok((g, _)) => g,
                Err(e) => e.into_inner().0,
            };
        }
        true
    }
}

// ── Receive buffer ──

/// Fixed-capacity buffer owned by the worker for one poll cycle.
///
/// Only the bytes filled by the last read are ever exposed; earlier,
/// longer reads never leak into a later message.
#[derive(Debug)]
pub struct ReceiveBuffer {
    data: Box<[u8]>,
    len: usize,
}

impl ReceiveBuffer {
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        ReceiveBuffer {
            data: vec![0u8; capacity.max(1)].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Let `read` fill the buffer; records and returns the count it reports.
    pub fn fill<E>(
        &mut self,
        read: impl FnOnce(&mut [u8]) -> Result<usize, E>,
    ) -> Result<usize, E> {
        self.len = 0;
        let n = read(&mut self.data)?;
        self.len = n.min(self.data.len());
        Ok(self.len)
    }

    /// Bytes from the last fill.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Owned copy of the bytes from the last fill.
    pub fn to_message(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}

// ── Read loop ──

#[derive(Debug, Clone)]
pub struct ReadLoopConfig {
    pub buffer_capacity: usize,
    pub idle_min: Duration,
    pub idle_max: Duration,
}

impl Default for ReadLoopConfig {
    fn default() -> Self {
        ReadLoopConfig {
            buffer_capacity: RX_BUFFER_CAPACITY,
            idle_min: Duration::from_millis(1),
            idle_max: Duration::from_millis(16),
        }
    }
}

/// A running (or finished) Read Loop. Dropping it stops and joins the worker.
pub struct ReadLoop {
    control: Arc<LoopControl>,
    worker: Option<JoinHandle<()>>,
}

impl ReadLoop {
    /// Start the worker on `handle`, pushing into `notifier`.
    ///
    /// Fails with [`ReadError::NotOpen`] on a closed handle and
    /// [`ReadError::AlreadyRunning`] if the handle already has a loop.
    pub fn start<D: UartDevice + 'static>(
        handle: &DeviceHandle<D>,
        notifier: Notifier,
        config: ReadLoopConfig,
    ) -> Result<ReadLoop, ReadError> {
        if !handle.is_open() {
            return Err(ReadError::NotOpen);
        }
        let control = Arc::new(LoopControl::running());
        handle.attach_loop(&control)?;

        let worker_handle = handle.clone();
        let worker_control = Arc::clone(&control);
        let spawned = std::thread::Builder::new()
            .name("ftlink-read".into())
            .spawn(move || run(worker_handle, worker_control, notifier, config));

        match spawned {
            Ok(worker) => Ok(ReadLoop {
                control,
                worker: Some(worker),
            }),
            Err(e) => {
                control.finish();
                handle.detach_loop(&control);
                Err(ReadError::DeviceFault(format!("spawn read loop: {e}")))
            }
        }
    }

    pub fn state(&self) -> ReadLoopState {
        self.control.state()
    }

    /// Request a stop. Returns immediately; the worker exits at the top of
    /// its next iteration.
    pub fn stop(&self) {
        if self.control.request_stop() {
            log::debug!("read loop stop requested");
        }
    }

    /// Wait until the worker has exited. `false` on timeout.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        self.control.wait_stopped(timeout)
    }
}

impl Drop for ReadLoop {
    fn drop(&mut self) {
        self.control.request_stop();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            log::warn!("read loop worker panicked");
        }
    }
}

fn run<D: UartDevice>(
    handle: DeviceHandle<D>,
    control: Arc<LoopControl>,
    notifier: Notifier,
    config: ReadLoopConfig,
) {
    let mut buffer = ReceiveBuffer::new(config.buffer_capacity);
    let mut idle = Backoff::new(BackoffConfig::idle(config.idle_min, config.idle_max));
    log::debug!(
        "read loop started on {} (buffer {} bytes)",
        handle.info().path,
        buffer.capacity()
    );

    while control.is_running() {
        if !handle.is_open() {
            control.request_stop();
            break;
        }

        match handle.poll(&mut buffer) {
            Ok(0) => {
                control.pause(idle.current_delay());
                idle.record_failure();
            }
            Ok(_) => {
                idle.record_success();
                let msg = Notification::Data(buffer.to_message());
                if notifier.push(msg, || control.is_running()) == Delivery::Closed {
                    log::debug!("consumer gone, stopping read loop");
                    control.request_stop();
                }
            }
            Err(ReadError::NotOpen) => {
                control.request_stop();
            }
            Err(e) => {
                log::warn!("{}: {e}", handle.info().path);
                match notifier.push(Notification::Fault(e), || control.is_running()) {
                    Delivery::Delivered => {}
                    Delivery::Dropped => log::warn!(
                        "{}: fault notification dropped on stop ({} messages dropped)",
                        handle.info().path,
                        notifier.dropped()
                    ),
                    Delivery::Closed => log::warn!(
                        "{}: fault notification undelivered, consumer gone",
                        handle.info().path
                    ),
                }
                control.request_stop();
            }
        }
    }

    // Disconnect the consumer before reporting Stopped.
    drop(notifier);
    handle.detach_loop(&control);
    control.finish();
    log::debug!("read loop stopped on {}", handle.info().path);
}
