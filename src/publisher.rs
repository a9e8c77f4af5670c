use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use log::{error, warn};
use parking_lot::Mutex;

use crate::broker::BrokerLink;
use crate::error::AppError;
use crate::event::HardwareEvent;
use crate::spool::Spool;
use crate::status::FaultIndicator;

/// Seam between the drain loop and the broker so the loop is testable
/// without a running broker. `reset` tears the underlying link down; the
/// next `publish` must rebuild it from scratch.
pub trait PublishSink: Send + 'static {
    fn publish(&mut self, body: &[u8]) -> Result<(), AppError>;
    fn reset(&mut self);
}

impl PublishSink for BrokerLink {
    fn publish(&mut self, body: &[u8]) -> Result<(), AppError> {
        BrokerLink::publish(self, body)
    }

    fn reset(&mut self) {
        BrokerLink::reset(self);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(5),
            attempts: 5,
        }
    }
}

/// How long the drain loop waits for a wake signal when the spool is empty.
/// The wake channel is latency sugar only; the filesystem is authoritative.
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Durable at-least-once publisher. `enqueue` commits the event to the
/// on-disk spool and returns; a background thread drains the spool in
/// strict arrival order, deleting each record only after a confirmed
/// publish.
pub struct EventPublisher {
    spool: Arc<Spool>,
    fault: Arc<FaultIndicator>,
    wake_tx: Sender<()>,
    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventPublisher {
    pub fn start<S: PublishSink>(
        spool: Arc<Spool>,
        sink: S,
        fault: Arc<FaultIndicator>,
    ) -> Arc<Self> {
        Self::start_with_policy(spool, sink, fault, RetryPolicy::default())
    }

    pub fn start_with_policy<S: PublishSink>(
        spool: Arc<Spool>,
        sink: S,
        fault: Arc<FaultIndicator>,
        policy: RetryPolicy,
    ) -> Arc<Self> {
        let (wake_tx, wake_rx) = bounded(1);
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker = {
            let spool = spool.clone();
            let fault = fault.clone();
            let shutdown = shutdown.clone();
            std::thread::spawn(move || drain_loop(spool, sink, fault, shutdown, wake_rx, policy))
        };

        Arc::new(Self {
            spool,
            fault,
            wake_tx,
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Commits one event to the spool. Never blocks on network I/O and
    /// never raises into the caller: a failed spool write drops the event,
    /// raises the fault indicator and logs at highest severity, because it
    /// is the one silent data-loss path in the system.
    pub fn enqueue(&self, event: &HardwareEvent) {
        match self.spool.append(event) {
            Ok(_) => {
                let _ = self.wake_tx.try_send(());
            }
            Err(e) => {
                error!("event dropped, spool write failed: {e}");
                self.fault.raise("spool write failure");
            }
        }
    }

    /// Cooperative stop: flag, wake, join. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.wake_tx.try_send(());
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

fn drain_loop<S: PublishSink>(
    spool: Arc<Spool>,
    mut sink: S,
    fault: Arc<FaultIndicator>,
    shutdown: Arc<AtomicBool>,
    wake_rx: Receiver<()>,
    policy: RetryPolicy,
) {
    while !shutdown.load(Ordering::Relaxed) {
        let next = match spool.oldest() {
            Ok(next) => next,
            Err(e) => {
                error!("spool listing failed: {e}");
                sleep_interruptible(Duration::from_secs(1), &shutdown);
                continue;
            }
        };
        let Some(path) = next else {
            let _ = wake_rx.recv_timeout(IDLE_POLL);
            continue;
        };

        let body = match fs::read(&path) {
            Ok(body) => body,
            Err(e) => {
                // An unreadable record would block the FIFO forever.
                error!("unreadable spool record {}: {e}", path.display());
                spool.sideline(&path);
                continue;
            }
        };

        if publish_with_retry(&mut sink, &body, &shutdown, policy) {
            // Delete strictly after the confirmed publish. A crash in
            // between redelivers the record: at-least-once, by design of
            // the commit order, not a bug.
            if let Err(e) = spool.remove(&path) {
                error!("failed to remove published record {}: {e}", path.display());
            }
            fault.clear();
        } else if !shutdown.load(Ordering::Relaxed) {
            fault.raise("publish retries exhausted");
            // Back to listing the directory. The same record is still the
            // oldest, so ordering is preserved across retry cycles.
        }
    }
}

fn publish_with_retry<S: PublishSink>(
    sink: &mut S,
    body: &[u8],
    shutdown: &AtomicBool,
    policy: RetryPolicy,
) -> bool {
    let mut backoff = policy.base;
    for attempt in 1..=policy.attempts {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        match sink.publish(body) {
            Ok(()) => return true,
            Err(e) => {
                warn!(
                    "publish attempt {attempt}/{} failed: {e}",
                    policy.attempts
                );
                sink.reset();
                if attempt < policy.attempts {
                    sleep_interruptible(backoff, shutdown);
                    backoff = (backoff * 2).min(policy.cap);
                }
            }
        }
    }
    false
}

fn sleep_interruptible(duration: Duration, shutdown: &AtomicBool) {
    let step = Duration::from_millis(20);
    let mut remaining = duration;
    while !remaining.is_zero() && !shutdown.load(Ordering::Relaxed) {
        let chunk = remaining.min(step);
        std::thread::sleep(chunk);
        remaining -= chunk;
    }
}

#[cfg(test)]
pub(crate) mod test_sink {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::PublishSink;
    use crate::error::AppError;

    #[derive(Default)]
    pub struct MemorySinkState {
        pub broker_down: bool,
        pub published: Vec<Vec<u8>>,
        pub resets: usize,
    }

    /// In-memory stand-in for a broker link; tests flip `broker_down` to
    /// simulate an outage.
    pub struct MemorySink {
        pub state: Arc<Mutex<MemorySinkState>>,
    }

    impl MemorySink {
        pub fn new() -> (Self, Arc<Mutex<MemorySinkState>>) {
            let state = Arc::new(Mutex::new(MemorySinkState::default()));
            (
                Self {
                    state: state.clone(),
                },
                state,
            )
        }
    }

    impl PublishSink for MemorySink {
        fn publish(&mut self, body: &[u8]) -> Result<(), AppError> {
            let mut state = self.state.lock();
            if state.broker_down {
                return Err(AppError::Publish("connection refused".into()));
            }
            state.published.push(body.to_vec());
            Ok(())
        }

        fn reset(&mut self) {
            self.state.lock().resets += 1;
        }
    }
}
