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

//! Handover scheduling.
//!
//! Satellites hand over at 12 s into every 15 s period of the wall-clock
//! minute. Transmission is suspended from slightly before each handover to
//! slightly after, by closing the congestion window.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use crate::clock::PhaseClock;
use crate::sock::TcpSock;
use crate::Error;
use crate::Result;
use crate::MAX_HANDOVER_OFFSET;

use self::gate::Gate;
use self::timer::Fire;
use self::timer::HandoverTarget;
use self::timer::HandoverTimer;

/// Length of a handover period.
pub const HANDOVER_PERIOD: Duration = Duration::from_secs(15);

/// Handover instant within each period.
pub const HANDOVER_TIME: Duration = Duration::from_secs(12);

/// Margin for timers firing slightly early.
pub const JITTER: Duration = Duration::from_millis(10);

/// Shortest delay the handover timer is armed for.
pub const MIN_TIMER_DELAY: Duration = Duration::from_millis(1);

macro_rules! handover_debug {
    ($handover:expr, $tp:expr, $($arg:tt)+) => {
        if $handover.debug {
            debug!("{} handover: {}", $tp.trace_id(), format_args!($($arg)+));
        }
    };
}

/// Position of the handover window within a period.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandoverWindow {
    start: Duration,

    end: Duration,
}

/// What a timer expiration does to the transmission gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Restore the congestion window.
    Resume,

    /// Close the congestion window.
    Suspend,

    /// Leave the gate alone.
    Keep,
}

impl HandoverWindow {
    /// Creates the window `[12s - start_offset, 12s + end_offset]`.
    ///
    /// Offsets larger than [`MAX_HANDOVER_OFFSET`] are clamped.
    pub fn new(start_offset: Duration, end_offset: Duration) -> Self {
        HandoverWindow {
            start: HANDOVER_TIME - start_offset.min(MAX_HANDOVER_OFFSET),
            end: HANDOVER_TIME + end_offset.min(MAX_HANDOVER_OFFSET),
        }
    }

    /// Start of the window within the period.
    pub fn start(&self) -> Duration {
        self.start
    }

    /// End of the window within the period.
    pub fn end(&self) -> Duration {
        self.end
    }

    /// Length of the window.
    pub fn span(&self) -> Duration {
        self.end - self.start
    }

    /// Whether `phase` falls within the window, bounds included.
    pub fn contains(&self, phase: Duration) -> bool {
        phase >= self.start && phase <= self.end
    }

    /// Delay until the next window boundary after `phase`.
    ///
    /// At the window end itself the timer fires again a tick later, which
    /// reopens a window closed by an ACK in the same tick.
    pub fn next_timeout(&self, phase: Duration) -> Duration {
        let timeout = if phase < self.start {
            self.start - phase
        } else if phase <= self.end {
            self.end - phase
        } else {
            (self.start + HANDOVER_PERIOD).saturating_sub(phase)
        };

        timeout.max(MIN_TIMER_DELAY)
    }

    /// Delay until the next boundary when the timer alone drives the gate.
    pub fn next_timeout_timer_only(
        &self, phase: Duration, closed: bool,
    ) -> Duration {
        let timeout = if closed {
            self.end.saturating_sub(phase)
        } else if phase <= HANDOVER_TIME {
            self.start.saturating_sub(phase)
        } else {
            (self.start + HANDOVER_PERIOD).saturating_sub(phase)
        };

        timeout.max(MIN_TIMER_DELAY)
    }

    /// Decides what a timer expiration at `phase` does.
    pub fn transition(&self, phase: Duration, closed: bool) -> Transition {
        let phase = phase + JITTER;

        if phase >= self.end {
            Transition::Resume
        } else if phase >= self.start {
            Transition::Suspend
        } else if closed {
            Transition::Resume
        } else {
            Transition::Keep
        }
    }
}

impl Default for HandoverWindow {
    fn default() -> Self {
        Self::new(crate::DEFAULT_HANDOVER_OFFSET, crate::DEFAULT_HANDOVER_OFFSET)
    }
}

/// Handover state of a connection.
pub struct Handover {
    window: HandoverWindow,

    timer_only: bool,

    debug: bool,

    clock: Arc<PhaseClock>,

    pub(crate) gate: Gate,

    timer: Option<HandoverTimer>,
}

impl Handover {
    pub(crate) fn new(
        window: HandoverWindow, timer_only: bool, debug: bool,
        clock: Arc<PhaseClock>,
    ) -> Self {
        Handover {
            window,
            timer_only,
            debug,
            clock,
            gate: Gate::Open,
            timer: None,
        }
    }

    /// Suspends transmission if a handover is in progress, then arms the
    /// timer on the current tokio runtime.
    ///
    /// Nothing is changed on error.
    pub(crate) fn start(
        &mut self, tp: &mut dyn TcpSock, conn: Arc<dyn HandoverTarget>,
    ) -> Result<()> {
        if self.clock.is_stopped() {
            return Err(Error::ClockStopped);
        }

        let runtime = Handle::try_current()?;

        let phase = self.phase();

        if self.window.contains(phase) {
            handover_debug!(self, tp, "adopted at {:?}", phase);

            self.suspend(tp);
        }

        let delay = self.next_timeout(tp, phase);

        handover_debug!(self, tp, "timer armed for {:?}", delay);

        self.timer = Some(HandoverTimer::arm(&runtime, conn, delay));

        Ok(())
    }

    /// Cancels the timer.
    pub(crate) fn release(&mut self) {
        if let Some(timer) = self.timer.take() {
            if timer.cancel() {
                trace!("handover: cancelled while firing");
            }
        }
    }

    /// Reconciles the gate with the clock on every ACK.
    ///
    /// Returns `true` while a handover is in progress, in which case window
    /// growth must be skipped.
    pub(crate) fn check(&mut self, tp: &mut dyn TcpSock) -> bool {
        if self.timer_only {
            return tp.snd_cwnd() == 0;
        }

        let phase = self.phase();

        if self.window.contains(phase) {
            if tp.snd_cwnd() != 0 {
                handover_debug!(self, tp, "missed suspend at {:?}", phase);

                self.suspend(tp);
            }

            return true;
        }

        if tp.snd_cwnd() == 0 {
            handover_debug!(self, tp, "missed resume at {:?}", phase);

            self.resume(tp);
        }

        false
    }

    /// Timer callback, called with the connection locked.
    pub fn on_timer(&mut self, tp: &mut dyn TcpSock) -> Fire {
        if !tp.is_established() {
            handover_debug!(self, tp, "connection closed, timer stopped");

            return Fire::Stop;
        }

        let phase = self.phase();

        if self.timer_only {
            if tp.snd_cwnd() != 0 {
                self.suspend(tp);
            } else {
                self.resume(tp);
            }
        } else {
            match self.window.transition(phase, tp.snd_cwnd() == 0) {
                Transition::Resume => self.resume(tp),

                Transition::Suspend => self.suspend(tp),

                Transition::Keep => handover_debug!(
                    self,
                    tp,
                    "nothing to do at {:?}, cwnd {}",
                    phase,
                    tp.snd_cwnd()
                ),
            }
        }

        let phase = self.phase();
        let delay = self.next_timeout(tp, phase);

        handover_debug!(self, tp, "timer rearmed for {:?}", delay);

        Fire::Rearm(delay)
    }

    /// Position within the current handover period.
    pub fn phase(&self) -> Duration {
        let t = self.clock.now_in_cycle().as_nanos() % HANDOVER_PERIOD.as_nanos();

        Duration::from_nanos(t as u64)
    }

    /// Whether transmission is currently suspended.
    pub fn is_suspended(&self) -> bool {
        self.gate.is_suspended()
    }

    /// The transmission gate.
    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    /// The handover window.
    pub fn window(&self) -> &HandoverWindow {
        &self.window
    }

    /// Whether the timer is armed.
    pub fn is_armed(&self) -> bool {
        self.timer.as_ref().is_some_and(HandoverTimer::is_armed)
    }

    fn next_timeout(&self, tp: &dyn TcpSock, phase: Duration) -> Duration {
        if self.timer_only {
            self.window.next_timeout_timer_only(phase, tp.snd_cwnd() == 0)
        } else {
            self.window.next_timeout(phase)
        }
    }

    fn suspend(&mut self, tp: &mut dyn TcpSock) {
        let cwnd = tp.snd_cwnd();

        if self.gate.suspend(tp, self.window.span()) {
            handover_debug!(
                self,
                tp,
                "suspend, cwnd {} in_flight {}",
                cwnd,
                tp.packets_in_flight()
            );
        } else {
            handover_debug!(self, tp, "suspend with closed window");
        }
    }

    fn resume(&mut self, tp: &mut dyn TcpSock) {
        if self.gate.resume(tp) {
            handover_debug!(
                self,
                tp,
                "resume, cwnd {} in_flight {}",
                tp.snd_cwnd(),
                tp.packets_in_flight()
            );
        } else {
            handover_debug!(self, tp, "resume with open window {}", tp.snd_cwnd());
        }
    }
}

impl std::fmt::Debug for Handover {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "gate={:?} ", self.gate)?;
        write!(f, "window={:?}..{:?} ", self.window.start, self.window.end)?;
        write!(f, "timer_only={} ", self.timer_only)?;

        match &self.timer {
            Some(timer) => write!(f, "timer={{ {timer:?} }}"),

            None => write!(f, "timer=none"),
        }
    }
}

pub mod gate;
pub mod timer;

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;

    use crate::testing::ManualClock;
    use crate::testing::TestConn;
    use crate::testing::TestSock;
    use crate::Config;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn window_bounds() {
        let window = HandoverWindow::default();

        assert_eq!(window.start(), ms(11_800));
        assert_eq!(window.end(), ms(12_200));
        assert_eq!(window.span(), ms(400));

        assert!(!window.contains(ms(11_799)));
        assert!(window.contains(ms(11_800)));
        assert!(window.contains(ms(12_200)));
        assert!(!window.contains(ms(12_201)));

        let window = HandoverWindow::new(ms(5_000), Duration::ZERO);
        assert_eq!(window.start(), ms(11_000));
        assert_eq!(window.end(), ms(12_000));
    }

    #[rstest]
    #[case::before(0, 11_800)]
    #[case::just_before(11_799, 1)]
    #[case::at_start(11_800, 400)]
    #[case::inside(12_000, 200)]
    #[case::at_end(12_200, 1)]
    #[case::after_end(12_201, 14_599)]
    #[case::after(14_000, 12_800)]
    #[case::last_tick(14_999, 11_801)]
    fn next_timeout(#[case] phase: u64, #[case] timeout: u64) {
        let window = HandoverWindow::default();

        assert_eq!(window.next_timeout(ms(phase)), ms(timeout));
    }

    #[test]
    fn next_timeout_floor() {
        let window = HandoverWindow::default();

        let phase = ms(11_800) - Duration::from_micros(10);
        assert_eq!(window.next_timeout(phase), MIN_TIMER_DELAY);
    }

    #[rstest]
    #[case::closed_inside(12_000, true, 200)]
    #[case::closed_late(12_500, true, 1)]
    #[case::open_before(5_000, false, 6_800)]
    #[case::open_late(11_900, false, 1)]
    #[case::open_at_handover(12_000, false, 1)]
    #[case::open_after(12_001, false, 14_799)]
    fn next_timeout_timer_only(
        #[case] phase: u64, #[case] closed: bool, #[case] timeout: u64,
    ) {
        let window = HandoverWindow::default();

        assert_eq!(
            window.next_timeout_timer_only(ms(phase), closed),
            ms(timeout)
        );
    }

    #[rstest]
    #[case::early_fire(11_795, false, Transition::Suspend)]
    #[case::start(11_800, false, Transition::Suspend)]
    #[case::inside_closed(12_000, true, Transition::Suspend)]
    #[case::end_early_fire(12_190, true, Transition::Resume)]
    #[case::after(13_000, true, Transition::Resume)]
    #[case::after_open(13_000, false, Transition::Resume)]
    #[case::before_closed(5_000, true, Transition::Resume)]
    #[case::before_open(5_000, false, Transition::Keep)]
    fn transition(
        #[case] phase: u64, #[case] closed: bool, #[case] expected: Transition,
    ) {
        let window = HandoverWindow::default();

        assert_eq!(window.transition(ms(phase), closed), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn adopt_during_handover() {
        let source = ManualClock::new();
        source.set_wall(ms(42_000));

        let conn = TestConn::new(
            &Config::new(),
            PhaseClock::new(source),
            TestSock::new(30),
        )
        .unwrap();
        TestConn::init(&conn);

        let mut guard = conn.lock();
        let TestConn { tcp, cc } = &mut *guard;

        assert_eq!(tcp.cwnd, 0);
        assert!(cc.is_suspended());

        let handover = cc.handover().unwrap();
        assert!(handover.is_armed());
        assert_eq!(handover.gate(), &Gate::Suspended { saved_cwnd: 30 });

        cc.on_release();
        assert!(cc.handover().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn adopt_outside_handover() {
        let source = ManualClock::new();
        source.set_wall(ms(3_000));

        let conn = TestConn::new(
            &Config::new(),
            PhaseClock::new(source),
            TestSock::new(30),
        )
        .unwrap();
        TestConn::init(&conn);

        let mut guard = conn.lock();

        assert_eq!(guard.tcp.cwnd, 30);
        assert!(!guard.cc.is_suspended());

        guard.cc.on_release();
    }

    #[test]
    fn timer_fires_through_window() {
        let source = ManualClock::new();
        source.set_wall(ms(11_800));

        let clock = PhaseClock::new(source.clone());
        let mut tcp = TestSock::new(25);
        let mut handover =
            Handover::new(HandoverWindow::default(), false, true, clock);

        assert_eq!(handover.on_timer(&mut tcp), Fire::Rearm(ms(400)));
        assert_eq!(tcp.cwnd, 0);

        source.advance(ms(400));
        assert_eq!(handover.on_timer(&mut tcp), Fire::Rearm(MIN_TIMER_DELAY));
        assert_eq!(tcp.cwnd, 25);

        source.advance(ms(1));
        assert_eq!(handover.on_timer(&mut tcp), Fire::Rearm(ms(14_599)));
        assert_eq!(tcp.cwnd, 25);

        // Early firing of the next period's start.
        source.advance(ms(14_594));
        assert_eq!(handover.on_timer(&mut tcp), Fire::Rearm(ms(5)));
        assert_eq!(tcp.cwnd, 0);

        tcp.established = false;
        assert_eq!(handover.on_timer(&mut tcp), Fire::Stop);
    }

    #[test]
    fn timer_only_toggles() {
        let source = ManualClock::new();
        source.set_wall(ms(11_800));

        let clock = PhaseClock::new(source.clone());
        let mut tcp = TestSock::new(25);
        let mut handover =
            Handover::new(HandoverWindow::default(), true, false, clock);

        assert_eq!(handover.on_timer(&mut tcp), Fire::Rearm(ms(400)));
        assert_eq!(tcp.cwnd, 0);

        // The ACK path only reports the gate.
        assert!(handover.check(&mut tcp));

        source.advance(ms(400));
        assert_eq!(handover.on_timer(&mut tcp), Fire::Rearm(ms(14_600)));
        assert_eq!(tcp.cwnd, 25);

        // Outside the window the timer alone decides.
        tcp.cwnd = 0;
        assert!(handover.check(&mut tcp));
        assert_eq!(tcp.cwnd, 0);
    }

    #[test]
    fn ack_at_window_end_reopens_next_tick() {
        let source = ManualClock::new();
        source.set_wall(ms(12_200));

        let clock = PhaseClock::new(source.clone());
        let mut tcp = TestSock::new(25);
        let mut handover =
            Handover::new(HandoverWindow::default(), false, false, clock);

        handover.gate.suspend(&mut tcp, handover.window.span());

        // The timer resumes at the window end, then an ACK in the same tick
        // closes the window again.
        let rearm = handover.on_timer(&mut tcp);
        assert_eq!(tcp.cwnd, 25);

        assert!(handover.check(&mut tcp));
        assert_eq!(tcp.cwnd, 0);

        // The next firing is one tick away and reopens the window.
        assert_eq!(rearm, Fire::Rearm(MIN_TIMER_DELAY));

        source.advance(MIN_TIMER_DELAY);
        assert_eq!(handover.on_timer(&mut tcp), Fire::Rearm(ms(14_599)));
        assert_eq!(tcp.cwnd, 25);
        assert!(!handover.is_suspended());
    }

    #[test]
    fn debug_traces_report_in_flight() {
        let _ = env_logger::builder().is_test(true).try_init();

        let source = ManualClock::new();
        source.set_wall(ms(11_800));

        let clock = PhaseClock::new(source.clone());
        let mut tcp = TestSock::new(25);
        tcp.in_flight = 7;

        let mut handover =
            Handover::new(HandoverWindow::default(), false, true, clock);

        handover.on_timer(&mut tcp);
        assert_eq!(tcp.cwnd, 0);

        source.advance(ms(400));
        handover.on_timer(&mut tcp);
        assert_eq!(tcp.cwnd, 25);
        assert_eq!(tcp.in_flight, 7);
    }

    #[test]
    fn check_reconciles_gate() {
        let source = ManualClock::new();
        source.set_wall(ms(12_000));

        let clock = PhaseClock::new(source.clone());
        let mut tcp = TestSock::new(25);
        let mut handover =
            Handover::new(HandoverWindow::default(), false, false, clock);

        assert!(handover.check(&mut tcp));
        assert_eq!(tcp.cwnd, 0);
        assert!(handover.check(&mut tcp));

        source.advance(ms(300));
        assert!(!handover.check(&mut tcp));
        assert_eq!(tcp.cwnd, 25);
        assert!(!handover.is_suspended());
    }

    #[test]
    fn start_without_runtime() {
        let mut tcp = TestSock::new(25);
        let mut handover = Handover::new(
            HandoverWindow::default(),
            false,
            false,
            PhaseClock::new(ManualClock::new()),
        );

        let conn: Arc<dyn HandoverTarget> = TestConn::new(
            &Config::new(),
            PhaseClock::new(ManualClock::new()),
            TestSock::new(10),
        )
        .unwrap();

        assert_eq!(handover.start(&mut tcp, conn), Err(Error::NoRuntime));
        assert!(!handover.is_armed());
    }

    #[test]
    fn debug_format() {
        let handover = Handover::new(
            HandoverWindow::default(),
            false,
            false,
            PhaseClock::new(ManualClock::new()),
        );

        assert_eq!(
            format!("{handover:?}"),
            "gate=Open window=11.8s..12.2s timer_only=false timer=none"
        );
    }
}
