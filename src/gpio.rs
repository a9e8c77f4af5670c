use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::warn;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::AppError;

/// Sampling cadence of the per-line edge poll loops (~1 kHz).
const EDGE_SAMPLE_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bias {
    Floating,
    PullUp,
    PullDown,
}

/// Capability set every GPIO backend must provide. Edge detection is not a
/// backend concern: the manager layers its own poll loops on top of `read`,
/// so both the character-device and the mock backend behave identically.
pub trait GpioBackend: Send + Sync + 'static {
    fn claim_output(&self, line: u32) -> Result<(), AppError>;
    fn claim_input(&self, line: u32, bias: Bias) -> Result<(), AppError>;
    fn read(&self, line: u32) -> Result<u8, AppError>;
    fn write(&self, line: u32, level: u8) -> Result<(), AppError>;
    fn release_all(&self);
}

/// Owns physical line lifecycle: claims, reads/writes, software falling-edge
/// detection, and release-on-shutdown.
pub struct LineManager<B: GpioBackend> {
    backend: Arc<B>,
    watchers: Mutex<FxHashMap<u32, EdgeWatcher>>,
}

impl<B: GpioBackend> LineManager<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            watchers: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn claim_output(&self, line: u32) -> Result<(), AppError> {
        self.backend.claim_output(line)
    }

    pub fn claim_input(&self, line: u32, bias: Bias) -> Result<(), AppError> {
        self.backend.claim_input(line, bias)
    }

    pub fn read(&self, line: u32) -> Result<u8, AppError> {
        self.backend.read(line)
    }

    pub fn write(&self, line: u32, level: u8) -> Result<(), AppError> {
        self.backend.write(line, level)
    }

    /// Starts a dedicated poll loop reporting high-to-low transitions on
    /// `line`. Debounce is time-based: a transition is reported only if at
    /// least `debounce_ms` elapsed since the last *reported* transition,
    /// regardless of how many samples bounced in between. Handler errors
    /// are logged and never terminate the loop.
    pub fn watch_falling_edge<F>(
        &self,
        line: u32,
        debounce_ms: u64,
        handler: F,
    ) -> Result<(), AppError>
    where
        F: Fn(u32) -> Result<(), AppError> + Send + 'static,
    {
        let mut watchers = self.watchers.lock();
        if watchers.contains_key(&line) {
            return Err(AppError::Gpio(format!("line {line} is already watched")));
        }
        let watcher = EdgeWatcher::spawn(line, debounce_ms, self.backend.clone(), handler);
        watchers.insert(line, watcher);
        Ok(())
    }

    pub fn unwatch(&self, line: u32) {
        // Drop joins the poll thread.
        self.watchers.lock().remove(&line);
    }

    /// Stops every poll loop before releasing the underlying lines, so no
    /// handler can fire after release. Idempotent; safe after a partial
    /// startup.
    pub fn release_all(&self) {
        self.watchers.lock().clear();
        self.backend.release_all();
    }
}

struct EdgeWatcher {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EdgeWatcher {
    fn spawn<B, F>(line: u32, debounce_ms: u64, backend: Arc<B>, handler: F) -> Self
    where
        B: GpioBackend,
        F: Fn(u32) -> Result<(), AppError> + Send + 'static,
    {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();
        let debounce = Duration::from_millis(debounce_ms);

        let handle = std::thread::spawn(move || {
            let mut last_level = backend.read(line).unwrap_or(1);
            let mut last_reported: Option<Instant> = None;

            while !cancel_flag.load(Ordering::Relaxed) {
                std::thread::sleep(EDGE_SAMPLE_INTERVAL);

                let level = match backend.read(line) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("read error on watched line {line}: {e}");
                        continue;
                    }
                };

                if last_level == 1 && level == 0 {
                    let due = last_reported
                        .map(|t| t.elapsed() >= debounce)
                        .unwrap_or(true);
                    if due {
                        last_reported = Some(Instant::now());
                        if let Err(e) = handler(line) {
                            warn!("edge handler error on line {line}: {e}");
                        }
                    }
                }
                last_level = level;
            }
        });

        Self {
            cancel,
            handle: Some(handle),
        }
    }
}

impl Drop for EdgeWatcher {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
