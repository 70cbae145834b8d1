//! Notification Channel — bounded hand-off from the Read Loop to a consumer.
//!
//! Single producer (the Read Loop worker), single consumer. The queue is a
//! crossbeam bounded channel; what happens when it is full is decided by the
//! [`OverflowPolicy`]. The consumer sees end of stream as a disconnected
//! channel once the worker exits.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TrySendError, bounded};

pub use crossbeam_channel::{RecvTimeoutError, TryRecvError};

use crate::read_loop::ReadError;

/// How long a backpressured send waits before re-checking for a stop request.
const BACKPRESSURE_SLICE: Duration = Duration::from_millis(10);

/// Default queue bound, in messages.
pub const DEFAULT_CAPACITY: usize = 256;

/// One message from the Read Loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Bytes received in one poll cycle, in arrival order.
    Data(Vec<u8>),
    /// The Read Loop hit a device fault and has stopped. Always the last
    /// message of a stream.
    Fault(ReadError),
}

/// What to do when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Block the Read Loop until the consumer catches up. Nothing is lost
    /// unless the loop is stopped while waiting.
    #[default]
    Backpressure,
    /// Evict the oldest queued message to make room.
    DropOldest,
}

impl OverflowPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverflowPolicy::Backpressure => "backpressure",
            OverflowPolicy::DropOldest => "drop-oldest",
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "backpressure" => Ok(OverflowPolicy::Backpressure),
            "drop-oldest" | "drop_oldest" => Ok(OverflowPolicy::DropOldest),
            other => Err(format!(
                "unknown overflow policy \"{other}\" (expected \"backpressure\" or \"drop-oldest\")"
            )),
        }
    }
}

/// Outcome of one [`Notifier::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Given up on (stop requested while backpressured); counted as dropped.
    Dropped,
    /// The consumer is gone.
    Closed,
}

/// Create a bounded channel. A capacity of zero is raised to one.
pub fn channel(capacity: usize, policy: OverflowPolicy) -> (Notifier, Notifications) {
    let (tx, rx) = bounded(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let notifier = Notifier {
        tx,
        // Drop-oldest evicts from the producer side.
        evict: match policy {
            OverflowPolicy::DropOldest => Some(rx.clone()),
            OverflowPolicy::Backpressure => None,
        },
        dropped: Arc::clone(&dropped),
    };
    (notifier, Notifications { rx, dropped })
}

/// Producer end, owned by the Read Loop worker.
pub struct Notifier {
    tx: Sender<Notification>,
    evict: Option<Receiver<Notification>>,
    dropped: Arc<AtomicU64>,
}

impl Notifier {
    /// Queue `msg` according to the overflow policy.
    ///
    /// Under backpressure the call blocks in short slices and consults
    /// `keep_waiting` between them; once it returns false the message is
    /// counted as dropped and the call returns.
    pub fn push(&self, msg: Notification, keep_waiting: impl Fn() -> bool) -> Delivery {
        match &self.evict {
            None => self.push_blocking(msg, keep_waiting),
            Some(evict) => self.push_evicting(msg, evict),
        }
    }

    fn push_blocking(&self, mut msg: Notification, keep_waiting: impl Fn() -> bool) -> Delivery {
        loop {
            match self.tx.send_timeout(msg, BACKPRESSURE_SLICE) {
                Ok(()) => return Delivery::Delivered,
                Err(SendTimeoutError::Timeout(m)) => {
                    if !keep_waiting() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        log::warn!("consumer stalled, message dropped on stop");
                        return Delivery::Dropped;
                    }
                    msg = m;
                }
                Err(SendTimeoutError::Disconnected(_)) => return Delivery::Closed,
            }
        }
    }

    fn push_evicting(&self, mut msg: Notification, evict: &Receiver<Notification>) -> Delivery {
        // The eviction receiver keeps the channel connected; the counter is
        // shared only with the consumer, so it tells us when that end is gone.
        if Arc::strong_count(&self.dropped) == 1 {
            return Delivery::Closed;
        }
        loop {
            match self.tx.try_send(msg) {
                Ok(()) => return Delivery::Delivered,
                Err(TrySendError::Full(m)) => {
                    if evict.try_recv().is_ok() {
                        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        log::warn!("notification queue full, dropped oldest ({total} total)");
                    }
                    msg = m;
                }
                Err(TrySendError::Disconnected(_)) => return Delivery::Closed,
            }
        }
    }

    /// Messages dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer end.
pub struct Notifications {
    rx: Receiver<Notification>,
    dropped: Arc<AtomicU64>,
}

impl Notifications {
    /// Block until a message arrives. `None` once the Read Loop has exited
    /// and the queue is empty.
    pub fn recv(&self) -> Option<Notification> {
        self.rx.recv().ok()
    }

    /// Like [`recv`](Self::recv), bounded by `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Notification, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<Notification, TryRecvError> {
        self.rx.try_recv()
    }

    /// Everything queued right now, without blocking.
    pub fn drain(&self) -> Vec<Notification> {
        self.rx.try_iter().collect()
    }

    /// Blocking iterator over the stream; ends when the Read Loop exits.
    pub fn iter(&self) -> impl Iterator<Item = Notification> + '_ {
        self.rx.iter()
    }

    /// Messages currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Messages lost to the overflow policy.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
