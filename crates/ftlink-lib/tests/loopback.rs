//! Integration tests: end-to-end sessions over mock bridges.
//!
//! These tests drive the public API the way an application would
//! (discover, open, configure, receive, write, close) and check what the
//! simulated hardware saw.

use std::time::{Duration, Instant};

use ftlink_lib::channel::{self, RecvTimeoutError};
use ftlink_lib::device::mock::{MockAccess, MockCall};
use ftlink_lib::read_loop::ReadLoopConfig;
use ftlink_lib::*;

const WAIT: Duration = Duration::from_secs(5);

fn data(bytes: &[u8]) -> Notification {
    Notification::Data(bytes.to_vec())
}

/// Poll `cond` until it holds or [`WAIT`] elapses.
fn eventually(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

fn options_9600() -> SessionOptions {
    SessionOptions::new(LinkConfiguration::from_raw(9600, 8, 1, 0, 0))
}

#[test]
fn at_command_round_trip() {
    let (access, a, b) = MockAccess::loopback_pair();
    let mgr = ConnectionManager::new(access);
    assert_eq!(mgr.discover().unwrap(), 2);

    let host = Session::start(&mgr, 0, &options_9600()).unwrap();
    let modem = Session::start(&mgr, 1, &options_9600()).unwrap();
    assert_eq!(mgr.open_count(), 2);

    assert_eq!(host.send(b"AT\r\n").unwrap(), 4);
    assert_eq!(
        modem.notifications().recv_timeout(WAIT),
        Ok(data(b"AT\r\n"))
    );

    assert_eq!(modem.send(b"OK\r\n").unwrap(), 4);
    assert_eq!(host.notifications().recv_timeout(WAIT), Ok(data(b"OK\r\n")));

    host.close();
    modem.close();
    assert_eq!(mgr.open_count(), 0);
    assert!(!a.is_open());
    assert!(!b.is_open());
}

#[test]
fn configuration_reaches_device_in_order() {
    let (access, ports) = MockAccess::with_ports(1);
    let mgr = ConnectionManager::new(access);
    let handle = mgr.open(0).unwrap();

    let cfg = LinkConfiguration::from_raw(115_200, 7, 2, 2, 1);
    handle.configure(&cfg).unwrap();
    assert_eq!(handle.link(), Some(cfg));

    let regs = translate(&cfg);
    let config_calls: Vec<_> = ports[0]
        .calls()
        .into_iter()
        .filter(MockCall::is_config)
        .collect();
    assert_eq!(
        config_calls,
        vec![
            MockCall::SetBitMode {
                mask: regs.bit_mode_mask,
                mode: regs.bit_mode,
            },
            MockCall::SetBaudRate(115_200),
            MockCall::SetCharacteristics {
                data_bits: regs.data_bits,
                stop_bits: regs.stop_bits,
                parity: regs.parity,
            },
            MockCall::SetFlowControl {
                flow: regs.flow_control,
                xon: 0x0B,
                xoff: 0x0D,
            },
        ]
    );
}

#[test]
fn configure_after_close_touches_nothing() {
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
fn burst_larger_than_buffer_arrives_in_order() {
    let (access, ports) = MockAccess::with_ports(1);
    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    ports[0].inject(&payload);

    let mgr = ConnectionManager::new(access);
    let session = Session::start(&mgr, 0, &options_9600()).unwrap();

    let first = session.notifications().recv_timeout(WAIT).unwrap();
    let second = session.notifications().recv_timeout(WAIT).unwrap();
    assert_eq!(first, data(&payload[..4096]));
    assert_eq!(second, data(&payload[4096..]));
    assert_eq!(
        session.notifications().recv_timeout(Duration::from_millis(50)),
        Err(RecvTimeoutError::Timeout)
    );
}

#[test]
fn short_message_after_long_one_is_not_padded() {
    let (access, ports) = MockAccess::with_ports(1);
    let mgr = ConnectionManager::new(access);
    let session = Session::start(&mgr, 0, &options_9600()).unwrap();

    ports[0].inject(b"ABCDEF");
    assert_eq!(session.notifications().recv_timeout(WAIT), Ok(data(b"ABCDEF")));
    ports[0].inject(b"XY");
    assert_eq!(session.notifications().recv_timeout(WAIT), Ok(data(b"XY")));
}

#[test]
fn double_close_releases_once() {
    let (access, ports) = MockAccess::with_ports(1);
    let mgr = ConnectionManager::new(access);
    let session = Session::start(&mgr, 0, &options_9600()).unwrap();
    let (handle, read_loop, notifications) = session.into_parts();

    handle.close();
    handle.close();
    mgr.close(&handle);

    assert!(read_loop.wait_stopped(WAIT));
    assert_eq!(read_loop.state(), ReadLoopState::Stopped);
    assert_eq!(ports[0].count(|c| *c == MockCall::Close), 1);
    assert!(!mgr.is_open(&handle));
    assert_eq!(notifications.recv_timeout(WAIT), Err(RecvTimeoutError::Disconnected));
}

#[test]
fn written_burst_crosses_buffer_boundary_over_loopback() {
    let (access, _a, _b) = MockAccess::loopback_pair();
    let mgr = ConnectionManager::new(access);
    let host = Session::start(&mgr, 0, &options_9600()).unwrap();
    let modem = Session::start(&mgr, 1, &options_9600()).unwrap();

    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 253) as u8).collect();
    assert_eq!(host.send(&payload).unwrap(), 5000);

    let mut received = Vec::new();
    let mut messages = 0;
    while received.len() < payload.len() {
        match modem.notifications().recv_timeout(WAIT) {
            Ok(Notification::Data(bytes)) => {
                assert!(bytes.len() <= 4096);
                received.extend_from_slice(&bytes);
                messages += 1;
            }
            other => panic!("expected data, got {other:?}"),
        }
    }
    assert_eq!(received, payload);
    assert!(messages >= 2);
    assert_eq!(
        modem.notifications().recv_timeout(Duration::from_millis(50)),
        Err(RecvTimeoutError::Timeout)
    );
}

#[test]
fn stop_while_streaming_delivers_exact_prefix() {
    const CHUNK: usize = 7;
    let (access, ports) = MockAccess::with_ports(1);
    ports[0].set_read_chunk(Some(CHUNK));
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 241) as u8).collect();
    ports[0].inject(&payload);

    let mgr = ConnectionManager::new(access);
    let session = Session::start(&mgr, 0, &options_9600()).unwrap();

    // Consume a little while the worker is still streaming, then stop.
    let mut received = Vec::new();
    for _ in 0..8 {
        match session.notifications().recv_timeout(WAIT) {
            Ok(Notification::Data(bytes)) => received.extend_from_slice(&bytes),
            other => panic!("expected data, got {other:?}"),
        }
    }
    session.stop();
    assert!(session.read_loop().wait_stopped(WAIT));
    assert_eq!(session.read_loop().state(), ReadLoopState::Stopped);

    for msg in session.notifications().iter() {
        match msg {
            Notification::Data(bytes) => {
                assert!(bytes.len() <= CHUNK);
                received.extend_from_slice(&bytes);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    assert_eq!(received.as_slice(), &payload[..received.len()]);
    assert!(ports[0].pending() > 0, "stop arrived after the whole burst");
    // Only a message held at stop time may be lost, and only whole.
    let dropped = session.notifications().dropped() as usize;
    assert!(dropped <= 1);
    assert_eq!(
        received.len() + dropped * CHUNK + ports[0].pending(),
        payload.len()
    );
    assert!(session.handle().is_open());
}

#[test]
fn stop_keeps_handle_open_and_ends_stream() {
    let (access, ports) = MockAccess::with_ports(1);
    let mgr = ConnectionManager::new(access);
    let session = Session::start(&mgr, 0, &options_9600()).unwrap();

    ports[0].inject(b"before");
    assert_eq!(session.notifications().recv_timeout(WAIT), Ok(data(b"before")));

    session.stop();
    assert!(session.read_loop().wait_stopped(WAIT));
    assert!(session.handle().is_open());

    ports[0].inject(b"after");
    assert_eq!(session.notifications().recv(), None);
    assert_eq!(ports[0].pending(), 5);

    // Writes still work without a Read Loop
    assert_eq!(session.send(b"ping").unwrap(), 4);
}

#[test]
fn unplugged_device_faults_once_then_reopens() {
    let (access, ports) = MockAccess::with_ports(1);
    let mgr = ConnectionManager::new(access);
    let session = Session::start(&mgr, 0, &options_9600()).unwrap();

    ports[0].fail_reads(true);
    match session.notifications().recv_timeout(WAIT) {
        Ok(Notification::Fault(ReadError::DeviceFault(_))) => {}
        other => panic!("expected a device fault, got {other:?}"),
    }
    assert_eq!(session.notifications().recv_timeout(WAIT), Err(RecvTimeoutError::Disconnected));
    assert_eq!(session.read_loop().state(), ReadLoopState::Stopped);

    session.close();
    ports[0].fail_reads(false);

    let mut backoff = backoff::Backoff::with_defaults();
    let again = reconnect::try_restart(&mut backoff, &mgr, 0, &options_9600()).unwrap();
    ports[0].inject(b"hello again");
    assert_eq!(again.notifications().recv_timeout(WAIT), Ok(data(b"hello again")));
}

#[test]
fn drop_oldest_keeps_newest_messages() {
    let (access, ports) = MockAccess::with_ports(1);
    ports[0].set_read_chunk(Some(1));
    let mgr = ConnectionManager::new(access);
    let handle = mgr.open(0).unwrap();

    let (notifier, notifications) = channel::channel(2, OverflowPolicy::DropOldest);
    ports[0].inject(b"abcdef");
    let read_loop = ReadLoop::start(&handle, notifier, ReadLoopConfig::default()).unwrap();

    assert!(eventually(|| notifications.dropped() == 4 && notifications.len() == 2));
    assert_eq!(notifications.drain(), vec![data(b"e"), data(b"f")]);
    read_loop.stop();
    assert!(read_loop.wait_stopped(WAIT));
}

#[test]
fn second_open_of_same_device_is_rejected() {
    let (access, _ports) = MockAccess::with_ports(1);
    let mgr = ConnectionManager::new(access);
    let handle = mgr.open(0).unwrap();

    assert!(matches!(mgr.open(0), Err(OpenError::AlreadyOpen)));
    handle.close();
    assert!(mgr.open(0).is_ok());
}

#[test]
fn discovery_failure_and_missing_index() {
    let (access, _ports) = MockAccess::with_ports(1);
    let mgr = ConnectionManager::new(access);
    assert!(matches!(mgr.open(3), Err(OpenError::NotFound)));

    let (access, _ports) = MockAccess::with_ports(1);
    access.set_unavailable(true);
    let mgr = ConnectionManager::new(access);
    assert!(matches!(mgr.discover(), Err(DiscoveryError::Unavailable(_))));
}

#[test]
fn partial_write_reports_count() {
    let (access, ports) = MockAccess::with_ports(1);
    ports[0].set_write_limit(Some(2));
    let mgr = ConnectionManager::new(access);
    let handle = mgr.open(0).unwrap();

    assert_eq!(
        handle.write(b"ATZ\r"),
        Err(WriteError::Partial {
            written: 2,
            requested: 4,
        })
    );
    handle.close();
    assert_eq!(handle.write(b"ATZ\r"), Err(WriteError::NotOpen));
}
