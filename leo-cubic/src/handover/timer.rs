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

//! Handover timer.
//!
//! Each connection with handover awareness owns one timer, backed by a tokio
//! task. While armed the task keeps a strong reference to the connection.
//! The connection lock is only ever tried from the task: when another
//! context owns the connection, the task retries a tick later instead of
//! blocking.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use crate::sock::TcpSock;

use super::Handover;
use super::MIN_TIMER_DELAY;

/// Outcome of a timer expiration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fire {
    /// The connection is owned by another context. Retry after the minimum
    /// timer delay.
    Busy,

    /// Fire again after the given delay.
    Rearm(Duration),

    /// Stop the timer and release the connection.
    Stop,
}

/// A connection hosting handover state.
pub trait HandoverHost {
    /// Returns the socket and its handover state, or `None` if handover is
    /// no longer active for this connection.
    fn handover_parts(&mut self) -> Option<(&mut dyn TcpSock, &mut Handover)>;
}

/// What the handover timer fires on.
pub trait HandoverTarget: Send + Sync {
    /// Runs the timer callback. Must not block.
    fn fire(&self) -> Fire;
}

impl<H> HandoverTarget for parking_lot::Mutex<H>
where
    H: HandoverHost + Send + 'static,
{
    fn fire(&self) -> Fire {
        let Some(mut host) = self.try_lock() else {
            return Fire::Busy;
        };

        match host.handover_parts() {
            Some((tp, handover)) => handover.on_timer(tp),

            None => Fire::Stop,
        }
    }
}

const IDLE: u8 = 0;
const ARMED: u8 = 1;
const FIRING: u8 = 2;
const CANCELLED: u8 = 3;

/// State shared between a timer handle and its task.
#[derive(Debug)]
pub(crate) struct TimerRecord {
    state: AtomicU8,

    // Set when the timer is cancelled while its callback runs, cleared by
    // the task once it has dropped its hold on the connection. Only read for
    // tracing: the `Arc` held by the task is what defers the release.
    free_pending: AtomicBool,
}

impl TimerRecord {
    fn new() -> Self {
        TimerRecord {
            state: AtomicU8::new(ARMED),
            free_pending: AtomicBool::new(false),
        }
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn begin_firing(&self) -> bool {
        self.transition(ARMED, FIRING)
    }

    fn end_firing(&self) -> bool {
        self.transition(FIRING, ARMED)
    }

    fn stop(&self) {
        self.transition(FIRING, IDLE);
    }

    /// Returns whether the callback was running.
    fn cancel(&self) -> bool {
        let prev = self.state.swap(CANCELLED, Ordering::AcqRel);

        if prev == FIRING {
            self.free_pending.store(true, Ordering::Release);
            return true;
        }

        false
    }

    pub(crate) fn is_armed(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire), ARMED | FIRING)
    }

    pub(crate) fn is_free_pending(&self) -> bool {
        self.free_pending.load(Ordering::Acquire)
    }
}

/// Handle to an armed handover timer. Dropping it cancels the timer.
pub(crate) struct HandoverTimer {
    record: Arc<TimerRecord>,

    task: AbortHandle,
}

impl HandoverTimer {
    /// Spawns the timer task on `runtime`, first firing after `delay`.
    pub(crate) fn arm(
        runtime: &Handle, target: Arc<dyn HandoverTarget>, delay: Duration,
    ) -> Self {
        let record = Arc::new(TimerRecord::new());

        let hold = Hold {
            record: Arc::clone(&record),
            target: Some(target),
        };

        let task = runtime.spawn(run(hold, delay)).abort_handle();

        HandoverTimer { record, task }
    }

    /// Cancels the timer.
    ///
    /// Returns `true` if the callback was running at that moment, in which
    /// case the hold on the connection is released by the task itself.
    pub(crate) fn cancel(&self) -> bool {
        let in_flight = self.record.cancel();

        self.task.abort();

        in_flight
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.record.is_armed()
    }

    #[cfg(test)]
    pub(crate) fn record(&self) -> &Arc<TimerRecord> {
        &self.record
    }
}

impl Drop for HandoverTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for HandoverTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "armed={} ", self.is_armed())?;
        write!(f, "free_pending={}", self.record.is_free_pending())
    }
}

/// The task's hold on the connection.
struct Hold {
    record: Arc<TimerRecord>,

    target: Option<Arc<dyn HandoverTarget>>,
}

impl Hold {
    fn fire(&self) -> Fire {
        match &self.target {
            Some(target) => target.fire(),

            None => Fire::Stop,
        }
    }
}

impl Drop for Hold {
    fn drop(&mut self) {
        // Release the connection before resolving the deferred cleanup.
        drop(self.target.take());

        if self.record.free_pending.swap(false, Ordering::AcqRel) {
            trace!("handover timer: released after in-flight cancel");
        }
    }
}

async fn run(hold: Hold, delay: Duration) {
    let mut delay = delay;

    loop {
        tokio::time::sleep(delay).await;

        if !hold.record.begin_firing() {
            return;
        }

        delay = match hold.fire() {
            Fire::Busy => MIN_TIMER_DELAY,

            Fire::Rearm(delay) => delay,

            Fire::Stop => {
                hold.record.stop();
                return;
            },
        };

        if !hold.record.end_firing() {
            return;
        }
    }
}
