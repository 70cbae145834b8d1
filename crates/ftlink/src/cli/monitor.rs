//! `monitor` subcommand — print everything a bridge receives until Ctrl+C.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Duration;

use ftlink_lib::backoff::Backoff;
use ftlink_lib::channel::RecvTimeoutError;
use ftlink_lib::device::DeviceAccess;
use ftlink_lib::{Notification, Session, SessionOptions, reconnect};

use super::{Config, ConnectionManager, LinkArgs, PlatformAccess, RUNNING, Result, format_hex};

type PlatformSession = Session<<PlatformAccess as DeviceAccess>::Device>;

/// How long the loop blocks on the channel before re-checking Ctrl+C.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// State for the `monitor` command, created during setup.
struct MonitorCtx {
    manager: ConnectionManager<PlatformAccess>,
    options: SessionOptions,
    index: usize,
    session: Option<PlatformSession>,
    backoff: Backoff,
    hex: bool,
    text: Utf8Stream,
    reconnect: bool,
    received: u64,
}

/// Decodes a byte stream as UTF-8 across message boundaries: an incomplete
/// trailing sequence is held back until the next message completes it.
#[derive(Default)]
struct Utf8Stream {
    pending: Vec<u8>,
}

/// Length of an incomplete multi-byte sequence at the end of `buf`.
fn incomplete_tail(buf: &[u8]) -> usize {
    for back in 1..=buf.len().min(4) {
        let b = buf[buf.len() - back];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let need = match b {
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            _ => return 0,
        };
        return if back < need { back } else { 0 };
    }
    0
}

impl Utf8Stream {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let split = self.pending.len() - incomplete_tail(&self.pending);
        let text = String::from_utf8_lossy(&self.pending[..split]).into_owned();
        self.pending.drain(..split);
        text
    }

    /// Whatever is still held back, decoded lossily.
    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Open the device, apply the link, start the Read Loop.
fn monitor_setup(config: &Config, hex: bool, reconnect: bool) -> Result<MonitorCtx> {
    let manager = super::manager(config);
    let options = config.session_options();
    let index = config.device_index;

    let session = Session::start(&manager, index, &options)?;
    println!("[device] {}", session.handle().info().path);
    println!("[link]   {}", options.link);

    Ok(MonitorCtx {
        manager,
        options,
        index,
        session: Some(session),
        backoff: Backoff::with_defaults(),
        hex,
        text: Utf8Stream::default(),
        reconnect,
        received: 0,
    })
}

fn print_text(text: &str) {
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(text.as_bytes());
    let _ = out.flush();
}

fn print_data(mctx: &mut MonitorCtx, bytes: &[u8]) {
    if mctx.hex {
        println!("{}", format_hex(bytes));
    } else {
        print_text(&mctx.text.push(bytes));
    }
}

/// Drop the current session after a fault. Returns `false` if monitoring
/// should end.
fn lose_session(mctx: &mut MonitorCtx, reason: &str) -> bool {
    if let Some(session) = mctx.session.take() {
        session.close();
    }
    print_text(&mctx.text.finish());
    if mctx.reconnect {
        log::warn!("[device] {reason}");
        log::warn!("[device] will attempt reconnection...");
        true
    } else {
        false
    }
}

/// Monitor main loop: print notifications, handle reconnection.
fn monitor_loop(mctx: &mut MonitorCtx) -> Result<()> {
    while RUNNING.load(Ordering::SeqCst) {
        // Attempt reconnection if device is disconnected
        if mctx.session.is_none() {
            match reconnect::try_restart(&mut mctx.backoff, &mctx.manager, mctx.index, &mctx.options)
            {
                Some(session) => {
                    println!("[device] Reconnected to {}", session.handle().info().path);
                    mctx.session = Some(session);
                }
                None => {
                    std::thread::sleep(POLL_INTERVAL);
                    continue;
                }
            }
        }
        let Some(ref session) = mctx.session else {
            continue;
        };

        match session.notifications().recv_timeout(POLL_INTERVAL) {
            Ok(Notification::Data(bytes)) => {
                mctx.received += bytes.len() as u64;
                print_data(mctx, &bytes);
            }
            Ok(Notification::Fault(e)) => {
                if !lose_session(mctx, &format!("read fault: {e}")) {
                    return Err(e.into());
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                // Read Loop ended without a fault: the handle was closed under us
                if !lose_session(mctx, "read loop stopped") {
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

/// Close the session and report totals.
fn monitor_teardown(mut mctx: MonitorCtx) {
    let mut dropped = 0;
    if let Some(session) = mctx.session.take() {
        // Print what was already received before the loop stopped
        session.stop();
        for msg in session.notifications().iter() {
            if let Notification::Data(bytes) = msg {
                mctx.received += bytes.len() as u64;
                print_data(&mut mctx, &bytes);
            }
        }
        dropped = session.notifications().dropped();
        session.close();
    }
    print_text(&mctx.text.finish());
    println!();
    println!("Received {} byte(s).", mctx.received);
    if dropped > 0 {
        log::warn!("{dropped} message(s) dropped by the overflow policy");
    }
    println!("Done.");
}

pub(super) fn cmd_monitor(
    config_path: Option<&Path>,
    link: &LinkArgs,
    hex: bool,
    reconnect: bool,
) -> Result<()> {
    let mut config = super::load_config(config_path);
    link.apply_to(&mut config);
    super::validated(&config)?;

    println!("ftlink — printing data received from device {}.", config.device_index);
    println!("Press Ctrl+C to exit.");
    println!();

    let mut mctx = monitor_setup(&config, hex, reconnect)?;
    let result = monitor_loop(&mut mctx);
    monitor_teardown(mctx);
    result
}
