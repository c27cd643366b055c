//! Control-plane state shared between the tracker, the mapper, and the loop
//! closer.
//!
//! Independently polled predicates are plain atomics; the stop and reset
//! protocols each need a couple of flags to move together, so those live
//! behind small mutexes. Lock order, where both are held, is stop before
//! finish.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::info;

#[derive(Default)]
struct StopFlags {
    stop_requested: bool,
    stopped: bool,
    not_stop: bool,
}

#[derive(Default)]
struct ResetFlags {
    full: bool,
    active_map: bool,
}

/// Flags coordinating the mapping thread with its neighbors.
pub struct SharedState {
    /// Tracker-visible: the mapper is between pipeline runs and accepts work.
    accept_keyframes: AtomicBool,

    /// Raised on every enqueue and on stop/reset requests; polled by the
    /// bundle adjustment to return early.
    abort_ba: AtomicBool,

    finish_requested: AtomicBool,
    finished: AtomicBool,

    /// Inertial bootstrap declared the active map unusable; the loop stops
    /// producing into it until the reset lands.
    bad_imu: AtomicBool,

    /// An inertial initialization attempt is in flight.
    initializing: AtomicBool,

    stop: Mutex<StopFlags>,
    reset: Mutex<ResetFlags>,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            accept_keyframes: AtomicBool::new(true),
            abort_ba: AtomicBool::new(false),
            finish_requested: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            bad_imu: AtomicBool::new(false),
            initializing: AtomicBool::new(false),
            stop: Mutex::new(StopFlags::default()),
            reset: Mutex::new(ResetFlags::default()),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Accept / abort
    // ─────────────────────────────────────────────────────────────────────

    pub fn accepts_keyframes(&self) -> bool {
        self.accept_keyframes.load(Ordering::SeqCst)
    }

    pub fn set_accept_keyframes(&self, flag: bool) {
        self.accept_keyframes.store(flag, Ordering::SeqCst);
    }

    pub fn abort_ba(&self) -> bool {
        self.abort_ba.load(Ordering::SeqCst)
    }

    pub fn raise_abort_ba(&self) {
        self.abort_ba.store(true, Ordering::SeqCst);
    }

    pub fn clear_abort_ba(&self) {
        self.abort_ba.store(false, Ordering::SeqCst);
    }

    pub(crate) fn abort_flag(&self) -> &AtomicBool {
        &self.abort_ba
    }

    // ─────────────────────────────────────────────────────────────────────
    // Stop protocol
    // ─────────────────────────────────────────────────────────────────────

    pub fn request_stop(&self) {
        self.stop.lock().stop_requested = true;
        self.raise_abort_ba();
    }

    /// Transition into the stopped state if requested and not vetoed.
    pub fn try_stop(&self) -> bool {
        let mut stop = self.stop.lock();
        if stop.stop_requested && !stop.not_stop {
            stop.stopped = true;
            info!("local mapping stopped");
            true
        } else {
            false
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.lock().stopped
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.lock().stop_requested
    }

    /// Leave the stopped state. Returns false after finish, when the thread
    /// is gone and there is nothing to release.
    pub fn release(&self) -> bool {
        let mut stop = self.stop.lock();
        if self.finished.load(Ordering::SeqCst) {
            return false;
        }
        stop.stopped = false;
        stop.stop_requested = false;
        info!("local mapping released");
        true
    }

    /// Veto stopping, e.g. while the tracker inserts a keyframe it cannot
    /// lose. Fails when the loop is already stopped.
    pub fn set_not_stop(&self, flag: bool) -> bool {
        let mut stop = self.stop.lock();
        if flag && stop.stopped {
            return false;
        }
        stop.not_stop = flag;
        true
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reset protocol
    // ─────────────────────────────────────────────────────────────────────

    pub fn request_reset(&self) {
        self.reset.lock().full = true;
        self.raise_abort_ba();
    }

    pub fn request_reset_active_map(&self) {
        self.reset.lock().active_map = true;
        self.raise_abort_ba();
    }

    pub fn reset_pending(&self) -> bool {
        let reset = self.reset.lock();
        reset.full || reset.active_map
    }

    /// Consume any pending reset request: (full, active_map).
    pub fn take_reset(&self) -> (bool, bool) {
        let mut reset = self.reset.lock();
        let pending = (reset.full, reset.active_map);
        reset.full = false;
        reset.active_map = false;
        pending
    }

    // ─────────────────────────────────────────────────────────────────────
    // Finish protocol
    // ─────────────────────────────────────────────────────────────────────

    pub fn request_finish(&self) {
        self.finish_requested.store(true, Ordering::SeqCst);
    }

    pub fn finish_requested(&self) -> bool {
        self.finish_requested.load(Ordering::SeqCst)
    }

    /// Terminal transition: the loop has exited.
    pub fn set_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
        self.stop.lock().stopped = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inertial health
    // ─────────────────────────────────────────────────────────────────────

    pub fn bad_imu(&self) -> bool {
        self.bad_imu.load(Ordering::SeqCst)
    }

    pub fn set_bad_imu(&self, flag: bool) {
        self.bad_imu.store(flag, Ordering::SeqCst);
    }

    pub fn is_initializing(&self) -> bool {
        self.initializing.load(Ordering::SeqCst)
    }

    pub fn set_initializing(&self, flag: bool) {
        self.initializing.store(flag, Ordering::SeqCst);
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}
