//! Admission gate: bounded-concurrency, rate-limited task admission.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, Semaphore, SemaphorePermit, watch};
use tokio::time::Instant;

/// Fixed admission window: at most `cap` admissions between resets.
struct RateWindow {
    started_at: Instant,
    admitted: usize,
}

/// Snapshot of the gate's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateStats {
    pub queued: usize,
    pub in_flight: usize,
    pub paused: bool,
}

/// Controls how many submitted tasks execute simultaneously.
///
/// Admission waits, in order, for: the pause flag to clear, a rate-window
/// slot, and a concurrency slot; the flag is re-checked after the
/// semaphore wait so a pause landing mid-wait still holds the line. The
/// counters here are the only in-memory mutable state shared across
/// workers; they must stay consistent under concurrent admit/complete,
/// so all transitions are atomic ops or happen under the window lock.
pub struct AdmissionGate {
    semaphore: Semaphore,
    paused: watch::Sender<bool>,
    window: Mutex<RateWindow>,
    rate_interval: Duration,
    interval_cap: usize,
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl AdmissionGate {
    pub fn new(concurrency: usize, rate_interval: Duration, interval_cap: usize) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            semaphore: Semaphore::new(concurrency),
            paused,
            window: Mutex::new(RateWindow {
                started_at: Instant::now(),
                admitted: 0,
            }),
            rate_interval,
            interval_cap,
            queued: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    /// Record a submission that will later call [`AdmissionGate::admit`].
    ///
    /// Split from `admit` so the poll loop can account for a task
    /// synchronously before spawning its execution.
    pub fn enqueue(&self) {
        self.queued.fetch_add(1, Ordering::SeqCst);
    }

    /// Wait for admission. The returned permit holds a concurrency slot
    /// until dropped.
    pub async fn admit(&self) -> AdmissionPermit<'_> {
        loop {
            self.wait_unpaused().await;

            self.rate_slot().await;

            let permit = self
                .semaphore
                .acquire()
                .await
                .expect("admission semaphore is never closed");

            // A pause may have landed while this submission was parked on
            // the semaphore; hand the slot back and wait it out.
            if self.is_paused() {
                drop(permit);
                continue;
            }

            self.queued.fetch_sub(1, Ordering::SeqCst);
            self.in_flight.fetch_add(1, Ordering::SeqCst);

            return AdmissionPermit {
                gate: self,
                _permit: permit,
            };
        }
    }

    async fn wait_unpaused(&self) {
        let mut paused = self.paused.subscribe();
        while *paused.borrow_and_update() {
            if paused.changed().await.is_err() {
                break;
            }
        }
    }

    /// Take one slot in the current rate window, waiting for the next
    /// window when the cap is spent.
    async fn rate_slot(&self) {
        loop {
            let wake_at = {
                let mut window = self.window.lock().await;
                let now = Instant::now();
                if now.duration_since(window.started_at) >= self.rate_interval {
                    window.started_at = now;
                    window.admitted = 0;
                }
                if window.admitted < self.interval_cap {
                    window.admitted += 1;
                    return;
                }
                window.started_at + self.rate_interval
            };
            tokio::time::sleep_until(wake_at).await;
        }
    }

    /// Block new admissions. Tasks already admitted keep running.
    pub fn pause(&self) {
        // send_replace stores the value even when no admission currently
        // holds a subscription; plain send would fail and drop it.
        self.paused.send_replace(true);
    }

    /// Allow admissions again.
    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn is_idle(&self) -> bool {
        self.queued.load(Ordering::SeqCst) == 0 && self.in_flight.load(Ordering::SeqCst) == 0
    }

    /// Suspend until nothing is queued or in flight.
    pub async fn wait_idle(&self) {
        loop {
            // Register interest before checking, so a completion landing
            // between the check and the await is not missed.
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            queued: self.queued.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            paused: self.is_paused(),
        }
    }
}

/// One occupied concurrency slot. Dropping it releases the slot and wakes
/// idle waiters once the gate is fully drained.
pub struct AdmissionPermit<'a> {
    gate: &'a AdmissionGate,
    _permit: SemaphorePermit<'a>,
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        self.gate.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.gate.is_idle() {
            self.gate.idle.notify_waiters();
        }
    }
}
