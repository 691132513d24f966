//! Thread drivers for producers and consumers
//!
//! Every producer and consumer runs on its own named thread, driven either
//! at a fixed rate (camera, microphone) or as fast as its step allows
//! (network receive, consumer poll loops).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::sync::{Parker, Unparker};

use crate::error::MediaError;

/// How a worker thread paces its step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Run the step once per period. Ticks that fall behind are skipped,
    /// never bursted.
    Periodic(Duration),
    /// Run the step back to back; the step bounds its own waits
    Continuous,
}

impl Schedule {
    /// Periodic schedule at `per_second` ticks per second
    pub fn per_second(per_second: u32) -> Self {
        Schedule::Periodic(Duration::from_secs(1) / per_second.max(1))
    }
}

/// Worker counters
#[derive(Debug, Default)]
struct WorkerCounters {
    steps: AtomicU64,
    missed_ticks: AtomicU64,
}

/// Snapshot of worker statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub steps: u64,
    pub missed_ticks: u64,
}

/// A named thread running one component's step until stopped
pub struct Worker {
    name: String,
    running: Arc<AtomicBool>,
    waker: Unparker,
    counters: Arc<WorkerCounters>,
    thread_handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn a thread that calls `step` on `schedule` until [`stop`](Self::stop)
    pub fn spawn<F>(name: impl Into<String>, schedule: Schedule, mut step: F) -> Result<Self, MediaError>
    where
        F: FnMut() + Send + 'static,
    {
        let name = name.into();
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(WorkerCounters::default());
        let parker = Parker::new();
        let waker = parker.unparker().clone();

        let running_for_loop = running.clone();
        let counters_for_loop = counters.clone();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || match schedule {
                Schedule::Continuous => {
                    while running_for_loop.load(Ordering::Relaxed) {
                        step();
                        counters_for_loop.steps.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Schedule::Periodic(period) => {
                    run_periodic(period, &parker, &running_for_loop, &counters_for_loop, &mut step)
                }
            })
            .map_err(|e| MediaError::Spawn(e.to_string()))?;

        tracing::debug!(worker = %name, ?schedule, "Worker started");

        Ok(Self {
            name,
            running,
            waker,
            counters,
            thread_handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            steps: self.counters.steps.load(Ordering::Relaxed),
            missed_ticks: self.counters.missed_ticks.load(Ordering::Relaxed),
        }
    }

    /// Stop the loop and wait for the current step to finish
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.waker.unpark();

        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                tracing::error!(worker = %self.name, "Worker thread panicked");
            } else {
                tracing::debug!(worker = %self.name, "Worker stopped");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_periodic(
    period: Duration,
    parker: &Parker,
    running: &AtomicBool,
    counters: &WorkerCounters,
    step: &mut impl FnMut(),
) {
    let mut deadline = Instant::now();

    while running.load(Ordering::Relaxed) {
        step();
        counters.steps.fetch_add(1, Ordering::Relaxed);

        deadline += period;
        let now = Instant::now();
        if deadline <= now {
            // Realign to the next tick instead of catching up
            let behind = (now - deadline).as_nanos() / period.as_nanos().max(1) + 1;
            counters.missed_ticks.fetch_add(behind as u64, Ordering::Relaxed);
            deadline += period * behind as u32;
        }

        // Woken early only by `stop`
        while running.load(Ordering::Relaxed) && Instant::now() < deadline {
            parker.park_deadline(deadline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_continuous_runs_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_for_step = count.clone();
        let mut worker = Worker::spawn("test-continuous", Schedule::Continuous, move || {
            count_for_step.fetch_add(1, Ordering::Relaxed);
            thread::sleep(Duration::from_millis(1));
        })
        .unwrap();

        thread::sleep(Duration::from_millis(50));
        worker.stop();
        assert!(!worker.is_running());

        let after_stop = count.load(Ordering::Relaxed);
        assert!(after_stop > 0);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::Relaxed), after_stop);
    }

    #[test]
    fn test_periodic_paces_steps() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_for_step = count.clone();
        let worker = Worker::spawn("test-periodic", Schedule::Periodic(Duration::from_millis(20)), move || {
            count_for_step.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

        thread::sleep(Duration::from_millis(110));
        drop(worker);
        let steps = count.load(Ordering::Relaxed);
        assert!((3..=8).contains(&steps), "unexpected step count {}", steps);
    }

    #[test]
    fn test_periodic_skips_missed_ticks() {
        let mut worker = Worker::spawn("test-slow", Schedule::Periodic(Duration::from_millis(5)), || {
            thread::sleep(Duration::from_millis(22));
        })
        .unwrap();

        thread::sleep(Duration::from_millis(100));
        worker.stop();
        let stats = worker.stats();
        assert!(stats.missed_ticks >= stats.steps, "{:?}", stats);
    }

    #[test]
    fn test_stop_interrupts_long_period() {
        let mut worker =
            Worker::spawn("test-long", Schedule::Periodic(Duration::from_secs(60)), || {}).unwrap();
        thread::sleep(Duration::from_millis(10));

        let started = Instant::now();
        worker.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(worker.stats().steps, 1);
    }

    #[test]
    fn test_per_second() {
        assert_eq!(Schedule::per_second(50), Schedule::Periodic(Duration::from_millis(20)));
        assert_eq!(Schedule::per_second(0), Schedule::Periodic(Duration::from_secs(1)));
    }
}
