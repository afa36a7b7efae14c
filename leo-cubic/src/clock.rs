// Copyright (C) 2025, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Satellite phase clock.
//!
//! Handovers happen at fixed offsets within every wall-clock minute. Reading
//! the wall clock on every ACK is too expensive, and the monotonic tick
//! counter has no absolute epoch, so the clock keeps a base offset such that
//! `base + monotonic` is the time elapsed since the start of the current
//! minute. The base is recomputed once per minute to absorb drift between
//! the tick counter and the wall clock.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use std::time::SystemTime;

use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::Error;
use crate::Result;

/// Length of the handover cycle tracked by the clock.
pub const CYCLE: Duration = Duration::from_secs(60);

/// Interval between two resynchronizations against the wall clock.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Default resolution of the monotonic tick counter.
pub const DEFAULT_TICK: Duration = Duration::from_millis(1);

const CYCLE_NANOS: i64 = CYCLE.as_nanos() as i64;

/// Time sources backing a [`PhaseClock`].
pub trait ClockSource: Send + Sync + 'static {
    /// Monotonic time since an arbitrary origin, with tick resolution.
    fn monotonic(&self) -> Duration;

    /// Wall-clock time since the Unix epoch.
    fn wall(&self) -> Duration;
}

/// The host's clocks.
///
/// The monotonic side is tokio's clock so that paused-time runtimes drive it.
pub struct SystemClock {
    origin: tokio::time::Instant,

    tick: Duration,
}

impl SystemClock {
    /// Creates a clock with the default tick.
    pub fn new() -> Self {
        Self::with_tick(DEFAULT_TICK)
    }

    /// Creates a clock whose monotonic counter advances in steps of `tick`.
    pub fn with_tick(tick: Duration) -> Self {
        SystemClock {
            origin: tokio::time::Instant::now(),
            tick: tick.max(Duration::from_nanos(1)),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for SystemClock {
    fn monotonic(&self) -> Duration {
        let elapsed = self.origin.elapsed().as_nanos();
        let tick = self.tick.as_nanos();

        Duration::from_nanos((elapsed - elapsed % tick) as u64)
    }

    fn wall(&self) -> Duration {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
    }
}

/// Process-wide clock giving the position within the current minute.
///
/// Create it once, share it by `Arc` with every connection, and call
/// [`init()`] from within a tokio runtime to keep it synchronized.
///
/// [`init()`]: PhaseClock::init
pub struct PhaseClock {
    source: Box<dyn ClockSource>,

    // Nanoseconds; may be negative. Overwritten by resync without any
    // exclusion against readers.
    base: AtomicI64,

    stopped: AtomicBool,

    sync_task: Mutex<Option<AbortHandle>>,
}

impl PhaseClock {
    /// Creates a clock synchronized once against `source`.
    pub fn new(source: impl ClockSource) -> Arc<Self> {
        let clock = PhaseClock {
            source: Box::new(source),
            base: AtomicI64::new(0),
            stopped: AtomicBool::new(false),
            sync_task: Mutex::new(None),
        };

        clock.resync();

        Arc::new(clock)
    }

    /// Starts the periodic resynchronization task on the current runtime.
    pub fn init(self: &Arc<Self>) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::ClockStopped);
        }

        let runtime = tokio::runtime::Handle::try_current()?;

        self.resync();

        let clock = Arc::downgrade(self);
        let handle = runtime.spawn(sync_loop(clock)).abort_handle();

        if let Some(prev) = self.sync_task.lock().replace(handle) {
            prev.abort();
        }

        trace!("phase clock: started: {:?}", self.now_in_cycle());

        Ok(())
    }

    /// Recomputes the base offset from the wall clock.
    pub fn resync(&self) {
        let wall = self.source.wall();
        let mono = self.source.monotonic();

        // Drop whole minutes before mixing in the monotonic count so that
        // the base never wraps. The result may be negative; it cancels out
        // in `now_in_cycle()`.
        let wall_in_cycle = (wall.as_nanos() % CYCLE.as_nanos()) as i64;
        let base = wall_in_cycle.wrapping_sub(nanos(mono));

        let old = self.base.swap(base, Ordering::Relaxed);

        trace!(
            "phase clock: resync: old {} new {} diff {:?}",
            old,
            base,
            Duration::from_nanos(
                base.wrapping_sub(old).rem_euclid(CYCLE_NANOS).unsigned_abs()
            )
        );
    }

    /// Time elapsed since the start of the current minute.
    pub fn now_in_cycle(&self) -> Duration {
        let mono = nanos(self.source.monotonic());
        let base = self.base.load(Ordering::Relaxed);

        let t = base.wrapping_add(mono).rem_euclid(CYCLE_NANOS);

        Duration::from_nanos(t.unsigned_abs())
    }

    /// Stops the resynchronization task.
    ///
    /// The clock keeps answering from its last base, but connections adopting
    /// the algorithm afterwards run without handover awareness.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Relaxed);

        if let Some(task) = self.sync_task.lock().take() {
            task.abort();
        }
    }

    /// Whether [`shutdown()`] was called.
    ///
    /// [`shutdown()`]: PhaseClock::shutdown
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    /// Whether the periodic resynchronization task is running.
    pub fn is_syncing(&self) -> bool {
        self.sync_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for PhaseClock {
    fn drop(&mut self) {
        if let Some(task) = self.sync_task.get_mut().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for PhaseClock {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "base={} ", self.base.load(Ordering::Relaxed))?;
        write!(f, "now_in_cycle={:?} ", self.now_in_cycle())?;
        write!(f, "stopped={}", self.is_stopped())
    }
}

async fn sync_loop(clock: Weak<PhaseClock>) {
    let start = tokio::time::Instant::now() + SYNC_INTERVAL;
    let mut interval = tokio::time::interval_at(start, SYNC_INTERVAL);

    loop {
        interval.tick().await;

        match clock.upgrade() {
            Some(clock) => clock.resync(),

            None => return,
        }
    }
}

fn nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}
