//! Wall-clock collection pacing.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::GcError;

/// Requests a collection once the configured interval has passed since the
/// last one.
#[derive(Debug)]
pub struct RegularIntervalPacer {
    interval: Duration,
    last_gc: Instant,
}

impl RegularIntervalPacer {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_gc: Instant::now(),
        }
    }

    #[must_use]
    pub fn needs_gc(&self) -> bool {
        self.last_gc.elapsed() >= self.interval
    }

    pub fn on_gc_done(&mut self) {
        self.last_gc = Instant::now();
    }

    pub const fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }
}

struct TimerState {
    interval: Duration,
    restarted: bool,
    stopped: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wake: Condvar,
}

/// Runs a callback on its own thread every `interval`.
pub struct RepeatedTimer {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RepeatedTimer {
    /// Starts the timer thread.
    ///
    /// # Errors
    ///
    /// Fails if the thread cannot be spawned.
    pub fn start(
        name: &str,
        interval: Duration,
        mut tick: impl FnMut() + Send + 'static,
    ) -> Result<Self, GcError> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                interval,
                restarted: false,
                stopped: false,
            }),
            wake: Condvar::new(),
        });
        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(name.to_owned())
                .spawn(move || loop {
                    {
                        let mut state = shared.state.lock();
                        let deadline = Instant::now() + state.interval;
                        loop {
                            if state.stopped {
                                return;
                            }
                            if state.restarted {
                                break;
                            }
                            if shared.wake.wait_until(&mut state, deadline).timed_out() {
                                break;
                            }
                        }
                        if std::mem::take(&mut state.restarted) {
                            continue;
                        }
                    }
                    tick();
                })
                .map_err(GcError::ThreadSpawn)?
        };
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Resets the countdown with a new interval.
    pub fn restart(&self, interval: Duration) {
        let mut state = self.shared.state.lock();
        state.interval = interval;
        state.restarted = true;
        self.shared.wake.notify_all();
    }

    /// Stops and joins the timer thread.
    pub fn stop(&self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        self.shared.state.lock().stopped = true;
        self.shared.wake.notify_all();
        if handle.join().is_err() {
            tracing::error!("timer thread panicked");
        }
    }
}

impl Drop for RepeatedTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for RepeatedTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepeatedTimer")
            .field("interval", &self.shared.state.lock().interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_pacer() {
        let mut pacer = RegularIntervalPacer::new(Duration::ZERO);
        assert!(pacer.needs_gc());
        pacer.set_interval(Duration::from_secs(3600));
        pacer.on_gc_done();
        assert!(!pacer.needs_gc());
    }

    #[test]
    fn test_timer_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let timer = {
            let ticks = Arc::clone(&ticks);
            RepeatedTimer::start("test-timer", Duration::from_millis(5), move || {
                ticks.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        };
        while ticks.load(Ordering::SeqCst) < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        timer.stop();
        let after = ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ticks.load(Ordering::SeqCst), after);
    }

    #[test]
    fn test_restart_postpones_tick() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let timer = {
            let ticks = Arc::clone(&ticks);
            RepeatedTimer::start("test-timer", Duration::from_secs(3600), move || {
                ticks.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        };
        timer.restart(Duration::from_millis(1));
        while ticks.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        timer.restart(Duration::from_secs(3600));
        drop(timer);
    }
}
