//! Device-access layer — capability traits + nusb backend for FTDI bridges.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

// ── Error type ──

/// Errors reported by a device-access backend.
///
/// String payloads follow the convention **"context: details"** where *context*
/// identifies the operation (e.g. `"USB open"`, `"SET_DATA"`) and *details*
/// describes what went wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    NotFound,
    PermissionDenied(String),
    Busy(String),
    OpenFailed(String),
    /// The device-access layer itself cannot be used (no USB subsystem, etc.).
    Unavailable(String),
    TransferFailed(String),
    Disconnected,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::NotFound => write!(f, "USB-UART device not found"),
            DeviceError::PermissionDenied(e) => write!(f, "Permission denied: {e}"),
            DeviceError::Busy(e) => write!(f, "Device busy: {e}"),
            DeviceError::OpenFailed(e) => write!(f, "Failed to open device: {e}"),
            DeviceError::Unavailable(e) => write!(f, "Device access unavailable: {e}"),
            DeviceError::TransferFailed(e) => write!(f, "Transfer failed: {e}"),
            DeviceError::Disconnected => write!(f, "Device disconnected"),
        }
    }
}

impl std::error::Error for DeviceError {}

pub type Result<T> = std::result::Result<T, DeviceError>;

// ── Device info ──

/// A discovered bridge (not yet opened).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    /// Bus location, e.g. `usb:001/004 [0403:6001]`.
    pub path: String,
    /// USB serial number, if the device reports one.
    pub serial: Option<String>,
    /// Product string, e.g. "FT232R USB UART".
    pub description: Option<String>,
}

/// Identity of an opened device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub index: usize,
    pub path: String,
    pub serial: Option<String>,
    pub description: Option<String>,
}

impl DeviceInfo {
    pub fn from_discovered(index: usize, dev: &DiscoveredDevice) -> Self {
        DeviceInfo {
            index,
            path: dev.path.clone(),
            serial: dev.serial.clone(),
            description: dev.description.clone(),
        }
    }
}

// ── Traits ──

/// Enumerates and opens bridges.
pub trait DeviceAccess: Send + Sync {
    type Device: UartDevice + 'static;

    /// List attached compatible devices, in enumeration order.
    fn enumerate(&self) -> Result<Vec<DiscoveredDevice>>;

    /// Open the device at `index` in enumeration order.
    fn open(&self, index: usize) -> Result<Self::Device>;
}

/// One opened UART bridge.
///
/// Methods take `&mut self`: the connection manager serialises access, so a
/// backend never sees two concurrent hardware calls.
pub trait UartDevice: Send {
    fn info(&self) -> &DeviceInfo;
    fn is_open(&self) -> bool;
    /// Release the underlying resource. Must be idempotent.
    fn close(&mut self);

    /// Number of received bytes ready to be read without blocking.
    fn queue_status(&mut self) -> Result<usize>;
    /// Read up to `buf.len()` bytes; returns the count actually read.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    /// Send bytes; returns the count the device accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    fn set_bit_mode(&mut self, mask: u8, mode: u8) -> Result<()>;
    fn set_baud_rate(&mut self, baud: u32) -> Result<()>;
    fn set_characteristics(&mut self, data_bits: u8, stop_bits: u8, parity: u8) -> Result<()>;
    fn set_flow_control(&mut self, flow: u16, xon: u8, xoff: u8) -> Result<()>;

    /// Bound read polling and writes. Default: not supported, ignored.
    fn set_timeouts(&mut self, _read: Duration, _write: Duration) -> Result<()> {
        Ok(())
    }
}

// ── Linux implementation ──

#[cfg(target_os = "linux")]
mod linux_impl {
    use super::*;
    use std::collections::VecDeque;
    use std::io::ErrorKind;

    use nusb::MaybeFuture;
    use nusb::transfer::{Bulk, ControlOut, ControlType, In, Out, Recipient, TransferError};

    use crate::protocol::*;

    /// Maps an nusb error onto the backend taxonomy.
    fn map_usb_error(context: &str, e: nusb::Error) -> DeviceError {
        let io: std::io::Error = e.into();
        match io.kind() {
            ErrorKind::PermissionDenied => DeviceError::PermissionDenied(format!("{context}: {io}")),
            ErrorKind::NotFound => DeviceError::NotFound,
            ErrorKind::ResourceBusy => DeviceError::Busy(format!("{context}: {io}")),
            _ => DeviceError::OpenFailed(format!("{context}: {io}")),
        }
    }

    fn map_transfer_error(context: &str, e: TransferError) -> DeviceError {
        match e {
            TransferError::Disconnected => DeviceError::Disconnected,
            other => DeviceError::TransferFailed(format!("{context}: {other}")),
        }
    }

    fn is_bridge(dev: &nusb::DeviceInfo) -> bool {
        dev.vendor_id() == FTDI_VID && FTDI_UART_PIDS.contains(&dev.product_id())
    }

    fn describe(dev: &nusb::DeviceInfo) -> DiscoveredDevice {
        DiscoveredDevice {
            path: format!(
                "usb:{:03}/{:03} [{:04x}:{:04x}]",
                dev.busnum(),
                dev.device_address(),
                dev.vendor_id(),
                dev.product_id(),
            ),
            serial: dev.serial_number().map(|s| s.to_string()),
            description: dev.product_string().map(|s| s.to_string()),
        }
    }

    fn list_bridges() -> Result<Vec<nusb::DeviceInfo>> {
        let devices = nusb::list_devices()
            .wait()
            .map_err(|e| DeviceError::Unavailable(format!("USB enumeration: {e}")))?;
        Ok(devices.filter(is_bridge).collect())
    }

    /// Device-access layer backed by nusb.
    #[derive(Debug, Default)]
    pub struct NusbAccess;

    impl NusbAccess {
        pub fn new() -> Self {
            NusbAccess
        }
    }

    impl DeviceAccess for NusbAccess {
        type Device = NusbDevice;

        fn enumerate(&self) -> Result<Vec<DiscoveredDevice>> {
            Ok(list_bridges()?.iter().map(describe).collect())
        }

        fn open(&self, index: usize) -> Result<NusbDevice> {
            let dev_info = list_bridges()?
                .into_iter()
                .nth(index)
                .ok_or(DeviceError::NotFound)?;
            NusbDevice::from_device_info(index, dev_info)
        }
    }

    /// Interface A of an opened FTDI bridge.
    pub struct NusbDevice {
        info: DeviceInfo,
        // `None` once closed; dropping the interface releases the claim.
        interface: Option<nusb::Interface>,
        ep_in: Option<nusb::Endpoint<Bulk, In>>,
        ep_out: Option<nusb::Endpoint<Bulk, Out>>,
        product_id: u16,
        packet_size: usize,
        rx: VecDeque<u8>,
        read_timeout: Duration,
        write_timeout: Duration,
    }

    impl NusbDevice {
        fn from_device_info(index: usize, dev_info: nusb::DeviceInfo) -> Result<Self> {
            let discovered = describe(&dev_info);
            let product_id = dev_info.product_id();
            let device = dev_info
                .open()
                .wait()
                .map_err(|e| map_usb_error("USB open", e))?;

            // Detach ftdi_sio and claim interface A
            let interface = device
                .detach_and_claim_interface(0)
                .wait()
                .map_err(|e| map_usb_error("claim interface 0", e))?;

            let bcd = device.device_descriptor().device_version();
            let packet_size = match bcd {
                0x0700 | 0x0800 | 0x0900 => HIGH_SPEED_PACKET_SIZE,
                _ => FULL_SPEED_PACKET_SIZE,
            };

            let ep_in = interface
                .endpoint::<Bulk, In>(EP_IN_A)
                .map_err(|e| map_usb_error("bulk IN endpoint", e))?;
            let ep_out = interface
                .endpoint::<Bulk, Out>(EP_OUT_A)
                .map_err(|e| map_usb_error("bulk OUT endpoint", e))?;

            let mut dev = NusbDevice {
                info: DeviceInfo::from_discovered(index, &discovered),
                interface: Some(interface),
                ep_in: Some(ep_in),
                ep_out: Some(ep_out),
                product_id,
                packet_size,
                rx: VecDeque::new(),
                read_timeout: Duration::from_millis(50),
                write_timeout: Duration::from_millis(USB_TIMEOUT_MS),
            };

            dev.control_out(SIO_RESET_REQUEST, SIO_RESET_SIO, USB_INDEX_A)
                .map_err(|e| DeviceError::OpenFailed(format!("SIO reset: {e}")))?;
            log::debug!(
                "opened {} (packet size {})",
                dev.info.path,
                dev.packet_size
            );
            Ok(dev)
        }

        fn control_out(&self, request: u8, value: u16, index: u16) -> Result<()> {
            let interface = self.interface.as_ref().ok_or(DeviceError::Disconnected)?;
            interface
                .control_out(
                    ControlOut {
                        control_type: ControlType::Vendor,
                        recipient: Recipient::Device,
                        request,
                        value,
                        index,
                        data: &[],
                    },
                    Duration::from_millis(USB_TIMEOUT_MS),
                )
                .wait()
                .map_err(|e| map_transfer_error(&format!("control_out(bRequest={request})"), e))
        }

        /// One bounded bulk IN transfer; payload goes to the internal FIFO.
        fn fill_rx(&mut self) -> Result<()> {
            let ep = self.ep_in.as_mut().ok_or(DeviceError::Disconnected)?;
            let buf = nusb::transfer::Buffer::new(RX_BUFFER_CAPACITY);
            let completion = ep.transfer_blocking(buf, self.read_timeout);
            match completion.status {
                Ok(()) => {}
                // Timed out with nothing pending
                Err(TransferError::Cancelled) if completion.actual_len == 0 => return Ok(()),
                Err(TransferError::Cancelled) => {}
                Err(e) => return Err(map_transfer_error("bulk IN", e)),
            }
            let mut raw = completion.buffer.into_vec();
            raw.truncate(completion.actual_len);
            let n = strip_modem_status(&mut raw, self.packet_size);
            self.rx.extend(&raw[..n]);
            Ok(())
        }
    }

    impl UartDevice for NusbDevice {
        fn info(&self) -> &DeviceInfo {
            &self.info
        }

        fn is_open(&self) -> bool {
            self.interface.is_some()
        }

        fn close(&mut self) {
            self.ep_in = None;
            self.ep_out = None;
            if self.interface.take().is_some() {
                log::debug!("released {}", self.info.path);
            }
            self.rx.clear();
        }

        fn queue_status(&mut self) -> Result<usize> {
            if self.rx.is_empty() {
                self.fill_rx()?;
            }
            Ok(self.rx.len())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            if self.rx.is_empty() {
                self.fill_rx()?;
            }
            let n = self.rx.len().min(buf.len());
            for (dst, src) in buf.iter_mut().zip(self.rx.drain(..n)) {
                *dst = src;
            }
            Ok(n)
        }

        fn write(&mut self, data: &[u8]) -> Result<usize> {
            let timeout = self.write_timeout;
            let ep = self.ep_out.as_mut().ok_or(DeviceError::Disconnected)?;
            let mut offset = 0;
            while offset < data.len() {
                let end = (offset + RX_BUFFER_CAPACITY).min(data.len());
                let mut buf = nusb::transfer::Buffer::new(end - offset);
                buf.extend_from_slice(&data[offset..end]);
                let completion = ep.transfer_blocking(buf, timeout);
                offset += completion.actual_len;
                if let Err(e) = completion.status {
                    // Whatever was accepted before the failure counts.
                    if offset > 0 {
                        log::warn!("bulk OUT stopped after {offset} bytes: {e}");
                        return Ok(offset);
                    }
                    return Err(map_transfer_error("bulk OUT", e));
                }
            }
            Ok(offset)
        }

        fn set_bit_mode(&mut self, mask: u8, mode: u8) -> Result<()> {
            let value = ((mode as u16) << 8) | mask as u16;
            self.control_out(SIO_SET_BITMODE_REQUEST, value, USB_INDEX_A)
        }

        fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
            let (value, high) = baud_divisor(baud)
                .ok_or_else(|| DeviceError::TransferFailed("SET_BAUDRATE: baud rate must be > 0".into()))?;
            let index = baud_index(self.product_id, high, USB_INDEX_A);
            log::debug!(
                "baud {baud}: divisor {value:#06x}/{index:#06x} (~{} baud)",
                effective_baud(value, high)
            );
            self.control_out(SIO_SET_BAUDRATE_REQUEST, value, index)
        }

        fn set_characteristics(&mut self, data_bits: u8, stop_bits: u8, parity: u8) -> Result<()> {
            let value = data_bits as u16 | ((parity as u16) << 8) | ((stop_bits as u16) << 11);
            self.control_out(SIO_SET_DATA_REQUEST, value, USB_INDEX_A)
        }

        fn set_flow_control(&mut self, flow: u16, xon: u8, xoff: u8) -> Result<()> {
            let value = if flow == FT_FLOW_XON_XOFF {
                xon as u16 | ((xoff as u16) << 8)
            } else {
                0
            };
            self.control_out(SIO_SET_FLOW_CTRL_REQUEST, value, flow | USB_INDEX_A)
        }

        fn set_timeouts(&mut self, read: Duration, write: Duration) -> Result<()> {
            self.read_timeout = read;
            self.write_timeout = write;
            Ok(())
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux_impl::{NusbAccess, NusbDevice};

// ── Stub for unsupported platforms ──

/// Device-access layer that never finds a device.
/// Enables compilation and `cargo test` on unsupported hosts.
#[cfg(not(target_os = "linux"))]
#[derive(Debug, Default)]
pub struct StubAccess;

#[cfg(not(target_os = "linux"))]
impl StubAccess {
    pub fn new() -> Self {
        StubAccess
    }
}

/// Placeholder device type for [`StubAccess`]; never constructed.
#[cfg(not(target_os = "linux"))]
pub enum StubDevice {}

#[cfg(not(target_os = "linux"))]
impl DeviceAccess for StubAccess {
    type Device = StubDevice;

    fn enumerate(&self) -> Result<Vec<DiscoveredDevice>> {
        Ok(Vec::new())
    }

    fn open(&self, _index: usize) -> Result<StubDevice> {
        Err(DeviceError::NotFound)
    }
}

#[cfg(not(target_os = "linux"))]
impl UartDevice for StubDevice {
    fn info(&self) -> &DeviceInfo {
        match *self {}
    }
    fn is_open(&self) -> bool {
        match *self {}
    }
    fn close(&mut self) {
        match *self {}
    }
    fn queue_status(&mut self) -> Result<usize> {
        match *self {}
    }
    fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
        match *self {}
    }
    fn write(&mut self, _data: &[u8]) -> Result<usize> {
        match *self {}
    }
    fn set_bit_mode(&mut self, _mask: u8, _mode: u8) -> Result<()> {
        match *self {}
    }
    fn set_baud_rate(&mut self, _baud: u32) -> Result<()> {
        match *self {}
    }
    fn set_characteristics(&mut self, _data_bits: u8, _stop_bits: u8, _parity: u8) -> Result<()> {
        match *self {}
    }
    fn set_flow_control(&mut self, _flow: u16, _xon: u8, _xoff: u8) -> Result<()> {
        match *self {}
    }
}

/// Device-access layer for the current platform.
///
/// Use this when you need to name the type explicitly (e.g. a
/// `ConnectionManager<PlatformAccess>` field).
#[cfg(target_os = "linux")]
pub type PlatformAccess = NusbAccess;
#[cfg(not(target_os = "linux"))]
pub type PlatformAccess = StubAccess;

// ── Mock device for testing ──

/// In-memory device-access layer for unit and integration tests.
///
/// Always compiled (zero runtime cost), hidden from public docs.
#[doc(hidden)]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, MutexGuard};

    fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
        m.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One hardware call as seen by a mock port.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum MockCall {
        SetBitMode { mask: u8, mode: u8 },
        SetBaudRate(u32),
        SetCharacteristics { data_bits: u8, stop_bits: u8, parity: u8 },
        SetFlowControl { flow: u16, xon: u8, xoff: u8 },
        SetTimeouts { read: Duration, write: Duration },
        QueueStatus,
        /// Read with the requested length.
        Read(usize),
        Write(Vec<u8>),
        Close,
    }

    impl MockCall {
        /// True for the four configuration writes.
        pub fn is_config(&self) -> bool {
            matches!(
                self,
                MockCall::SetBitMode { .. }
                    | MockCall::SetBaudRate(_)
                    | MockCall::SetCharacteristics { .. }
                    | MockCall::SetFlowControl { .. }
            )
        }
    }

    /// Configuration step that can be made to fail.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum MockStep {
        BitMode,
        BaudRate,
        Characteristics,
        FlowControl,
    }

    /// Shared state of one simulated bridge. Tests keep an `Arc<MockPort>`
    /// to inject bytes and inspect calls after the device has been opened.
    #[derive(Debug)]
    pub struct MockPort {
        pub description: String,
        rx: Mutex<VecDeque<u8>>,
        calls: Mutex<Vec<MockCall>>,
        open: AtomicBool,
        open_error: Mutex<Option<DeviceError>>,
        opens_closed: AtomicBool,
        fail_step: Mutex<Option<MockStep>>,
        read_fault: AtomicBool,
        read_chunk: Mutex<Option<usize>>,
        write_limit: Mutex<Option<usize>>,
        write_error: AtomicBool,
        peer: Mutex<Option<Arc<MockPort>>>,
    }

    impl MockPort {
        pub fn new(description: &str) -> Arc<Self> {
            Arc::new(MockPort {
                description: description.into(),
                rx: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
                open: AtomicBool::new(false),
                open_error: Mutex::new(None),
                opens_closed: AtomicBool::new(false),
                fail_step: Mutex::new(None),
                read_fault: AtomicBool::new(false),
                read_chunk: Mutex::new(None),
                write_limit: Mutex::new(None),
                write_error: AtomicBool::new(false),
                peer: Mutex::new(None),
            })
        }

        /// Wire two ports so that writes on one arrive on the other.
        pub fn connect(a: &Arc<MockPort>, b: &Arc<MockPort>) {
            *lock(&a.peer) = Some(Arc::clone(b));
            *lock(&b.peer) = Some(Arc::clone(a));
        }

        /// Simulate bytes arriving on the wire.
        pub fn inject(&self, data: &[u8]) {
            lock(&self.rx).extend(data);
        }

        /// Bytes received but not yet read.
        pub fn pending(&self) -> usize {
            lock(&self.rx).len()
        }

        pub fn calls(&self) -> Vec<MockCall> {
            lock(&self.calls).clone()
        }

        pub fn clear_calls(&self) {
            lock(&self.calls).clear();
        }

        pub fn count(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
            lock(&self.calls).iter().filter(|c| pred(c)).count()
        }

        pub fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        /// Next `open` fails with `err`.
        pub fn fail_open(&self, err: DeviceError) {
            *lock(&self.open_error) = Some(err);
        }

        /// Next `open` succeeds but the device reports itself closed.
        pub fn open_as_closed(&self, on: bool) {
            self.opens_closed.store(on, Ordering::SeqCst);
        }

        pub fn fail_step(&self, step: Option<MockStep>) {
            *lock(&self.fail_step) = step;
        }

        /// Make `queue_status`/`read` fail until cleared.
        pub fn fail_reads(&self, on: bool) {
            self.read_fault.store(on, Ordering::SeqCst);
        }

        /// Limit how many bytes one `read` returns (short reads).
        pub fn set_read_chunk(&self, chunk: Option<usize>) {
            *lock(&self.read_chunk) = chunk;
        }

        /// Limit how many bytes one `write` accepts (partial writes).
        pub fn set_write_limit(&self, limit: Option<usize>) {
            *lock(&self.write_limit) = limit;
        }

        pub fn fail_writes(&self, on: bool) {
            self.write_error.store(on, Ordering::SeqCst);
        }

        /// Simulate the cable being pulled while open.
        pub fn unplug(&self) {
            self.open.store(false, Ordering::SeqCst);
        }

        fn record(&self, call: MockCall) {
            lock(&self.calls).push(call);
        }
    }

    /// An opened mock port.
    pub struct MockDevice {
        info: DeviceInfo,
        port: Arc<MockPort>,
    }

    impl MockDevice {
        fn check_open(&self) -> Result<()> {
            if self.port.is_open() {
                Ok(())
            } else {
                Err(DeviceError::Disconnected)
            }
        }

        fn config_step(&self, step: MockStep, call: MockCall) -> Result<()> {
            self.check_open()?;
            self.port.record(call);
            if *lock(&self.port.fail_step) == Some(step) {
                return Err(DeviceError::TransferFailed(format!(
                    "mock: {step:?} rejected"
                )));
            }
            Ok(())
        }
    }

    impl UartDevice for MockDevice {
        fn info(&self) -> &DeviceInfo {
            &self.info
        }

        fn is_open(&self) -> bool {
            self.port.is_open()
        }

        fn close(&mut self) {
            if self.port.open.swap(false, Ordering::SeqCst) {
                self.port.record(MockCall::Close);
            }
        }

        fn queue_status(&mut self) -> Result<usize> {
            self.check_open()?;
            self.port.record(MockCall::QueueStatus);
            if self.port.read_fault.load(Ordering::SeqCst) {
                return Err(DeviceError::TransferFailed("mock: read fault injected".into()));
            }
            Ok(self.port.pending())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            self.check_open()?;
            self.port.record(MockCall::Read(buf.len()));
            if self.port.read_fault.load(Ordering::SeqCst) {
                return Err(DeviceError::TransferFailed("mock: read fault injected".into()));
            }
            let mut want = buf.len();
            if let Some(chunk) = *lock(&self.port.read_chunk) {
                want = want.min(chunk);
            }
            let mut rx = lock(&self.port.rx);
            let n = want.min(rx.len());
            for (dst, src) in buf.iter_mut().zip(rx.drain(..n)) {
                *dst = src;
            }
            Ok(n)
        }

        fn write(&mut self, data: &[u8]) -> Result<usize> {
            self.check_open()?;
            self.port.record(MockCall::Write(data.to_vec()));
            if self.port.write_error.load(Ordering::SeqCst) {
                return Err(DeviceError::TransferFailed("mock: write fault injected".into()));
            }
            let n = match *lock(&self.port.write_limit) {
                Some(limit) => data.len().min(limit),
                None => data.len(),
            };
            if let Some(peer) = lock(&self.port.peer).as_ref() {
                peer.inject(&data[..n]);
            }
            Ok(n)
        }

        fn set_bit_mode(&mut self, mask: u8, mode: u8) -> Result<()> {
            self.config_step(MockStep::BitMode, MockCall::SetBitMode { mask, mode })
        }

        fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
            self.config_step(MockStep::BaudRate, MockCall::SetBaudRate(baud))
        }

        fn set_characteristics(&mut self, data_bits: u8, stop_bits: u8, parity: u8) -> Result<()> {
            self.config_step(
                MockStep::Characteristics,
                MockCall::SetCharacteristics {
                    data_bits,
                    stop_bits,
                    parity,
                },
            )
        }

        fn set_flow_control(&mut self, flow: u16, xon: u8, xoff: u8) -> Result<()> {
            self.config_step(
                MockStep::FlowControl,
                MockCall::SetFlowControl { flow, xon, xoff },
            )
        }

        fn set_timeouts(&mut self, read: Duration, write: Duration) -> Result<()> {
            self.port.record(MockCall::SetTimeouts { read, write });
            Ok(())
        }
    }

    /// In-memory device-access layer over a list of ports.
    #[derive(Default)]
    pub struct MockAccess {
        ports: Vec<Arc<MockPort>>,
        unavailable: AtomicBool,
    }

    impl MockAccess {
        /// Access layer with `n` unconnected ports.
        pub fn with_ports(n: usize) -> (Self, Vec<Arc<MockPort>>) {
            let ports: Vec<_> = (0..n)
                .map(|i| MockPort::new(&format!("Mock UART {i}")))
                .collect();
            let access = MockAccess {
                ports: ports.clone(),
                unavailable: AtomicBool::new(false),
            };
            (access, ports)
        }

        /// Two ports wired TX→RX in both directions.
        pub fn loopback_pair() -> (Self, Arc<MockPort>, Arc<MockPort>) {
            let (access, ports) = Self::with_ports(2);
            MockPort::connect(&ports[0], &ports[1]);
            let a = Arc::clone(&ports[0]);
            let b = Arc::clone(&ports[1]);
            (access, a, b)
        }

        /// Make enumeration fail as if the USB subsystem were missing.
        pub fn set_unavailable(&self, on: bool) {
            self.unavailable.store(on, Ordering::SeqCst);
        }

        fn discovered(index: usize, port: &MockPort) -> DiscoveredDevice {
            DiscoveredDevice {
                path: format!("mock://uart{index}"),
                serial: Some(format!("MOCK{index:04}")),
                description: Some(port.description.clone()),
            }
        }
    }

    impl DeviceAccess for MockAccess {
        type Device = MockDevice;

        fn enumerate(&self) -> Result<Vec<DiscoveredDevice>> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(DeviceError::Unavailable("mock: USB subsystem missing".into()));
            }
            Ok(self
                .ports
                .iter()
                .enumerate()
                .map(|(i, p)| Self::discovered(i, p))
                .collect())
        }

        fn open(&self, index: usize) -> Result<MockDevice> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(DeviceError::Unavailable("mock: USB subsystem missing".into()));
            }
            let port = self.ports.get(index).ok_or(DeviceError::NotFound)?;
            if let Some(err) = lock(&port.open_error).take() {
                return Err(err);
            }
            if port.open.load(Ordering::SeqCst) {
                return Err(DeviceError::Busy(format!("mock://uart{index} already claimed")));
            }
            let opened = !port.opens_closed.load(Ordering::SeqCst);
            port.open.store(opened, Ordering::SeqCst);
            Ok(MockDevice {
                info: DeviceInfo::from_discovered(index, &Self::discovered(index, port)),
                port: Arc::clone(port),
            })
        }
    }
}
