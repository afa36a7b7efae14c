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

use std::str::FromStr;
use std::sync::Arc;

use crate::clock::PhaseClock;
use crate::handover::gate::Gate;
use crate::handover::timer::HandoverTarget;
use crate::handover::Handover;
use crate::handover::HandoverWindow;
use crate::sock::AckSample;
use crate::sock::CaEvent;
use crate::sock::CaState;
use crate::sock::TcpSock;
use crate::Config;
use crate::Result;

pub use hystart::HystartStats;

/// Scale of the multiplicative decrease factor.
pub(crate) const BETA_SCALE: u32 = 1024;

/// Per-connection congestion control state.
///
/// The host stack calls the hooks below for every connection that adopted
/// the algorithm. Both algorithms share the handover machinery: while a
/// handover is in progress the congestion window is `0` and window growth is
/// skipped.
pub struct Congestion {
    // Congestion control.
    pub(crate) cc_ops: &'static CongestionControlOps,

    pub(crate) cubic_params: cubic::Params,

    pub(crate) cubic_state: cubic::State,

    pub(crate) hystart: hystart::Hystart,

    pub(crate) initial_ssthresh: Option<u32>,

    // Handover.
    clock: Arc<PhaseClock>,

    handover_enabled: bool,

    handover_timer_only: bool,

    handover_window: HandoverWindow,

    debug: bool,

    handover: Option<Handover>,
}

impl Congestion {
    /// Creates the congestion state of a new connection.
    ///
    /// The configuration is validated first. Nothing is armed until
    /// [`on_init()`] is called.
    ///
    /// [`on_init()`]: Congestion::on_init
    pub fn new(config: &Config, clock: Arc<PhaseClock>) -> Result<Self> {
        config.validate()?;

        Ok(Congestion {
            cc_ops: config.cc_algorithm.into(),

            cubic_params: cubic::Params::new(config),

            cubic_state: cubic::State::default(),

            hystart: hystart::Hystart::new(config),

            initial_ssthresh: config.initial_ssthresh,

            clock,

            handover_enabled: config.handover,

            handover_timer_only: config.handover_timer_only,

            handover_window: HandoverWindow::new(
                config.handover_start,
                config.handover_end,
            ),

            debug: config.debug,

            handover: None,
        })
    }

    /// Called when the connection adopts the algorithm.
    ///
    /// Resets the window engine and arms the handover timer, which keeps a
    /// hold on `conn` until [`on_release()`] is called or the connection
    /// leaves the established state. If the connection adopts the algorithm
    /// in the middle of a handover, transmission is suspended immediately.
    ///
    /// Failing to arm the timer disables handover awareness for this
    /// connection only.
    ///
    /// [`on_release()`]: Congestion::on_release
    pub fn on_init(
        &mut self, tp: &mut dyn TcpSock, conn: Arc<dyn HandoverTarget>,
    ) {
        (self.cc_ops.on_init)(self, tp);

        if let Some(mut handover) = self.handover.take() {
            handover.release();
        }

        if !self.handover_enabled {
            return;
        }

        let mut handover = Handover::new(
            self.handover_window,
            self.handover_timer_only,
            self.debug,
            Arc::clone(&self.clock),
        );

        match handover.start(tp, conn) {
            Ok(()) => self.handover = Some(handover),

            Err(e) => warn!(
                "{} handover disabled for this connection: {:?}",
                tp.trace_id(),
                e
            ),
        }
    }

    /// Called when the connection drops the algorithm or is destroyed.
    ///
    /// Cancels the handover timer. If the timer callback is running
    /// concurrently, it releases its hold on the connection once it
    /// observes the cancellation.
    pub fn on_release(&mut self) {
        if let Some(mut handover) = self.handover.take() {
            handover.release();
        }
    }

    /// Returns the slow start threshold to use after a loss event.
    ///
    /// During a handover the window saved by the suspension is used as the
    /// current window.
    pub fn recalc_ssthresh(&mut self, tp: &dyn TcpSock) -> u32 {
        let cwnd = self.effective_cwnd(tp);

        (self.cc_ops.recalc_ssthresh)(self, cwnd)
    }

    /// Called for every acknowledgment that advances the window.
    ///
    /// `ack` is the acknowledged sequence number and `acked` the number of
    /// newly acknowledged packets.
    pub fn on_ack(&mut self, tp: &mut dyn TcpSock, _ack: u32, acked: u32) {
        if !tp.is_cwnd_limited() {
            return;
        }

        if let Some(handover) = self.handover.as_mut() {
            if handover.check(tp) {
                return;
            }
        }

        (self.cc_ops.cong_avoid)(self, tp, acked);
    }

    /// Called when the host stack changes congestion avoidance state.
    pub fn on_state_change(&mut self, tp: &dyn TcpSock, state: CaState) {
        (self.cc_ops.on_state_change)(self, tp, state);
    }

    /// Called with the RTT sample attached to an acknowledgment.
    pub fn on_rtt_sample(&mut self, tp: &mut dyn TcpSock, sample: &AckSample) {
        (self.cc_ops.on_rtt_sample)(self, tp, sample);
    }

    /// Called on congestion window events.
    pub fn on_cwnd_event(&mut self, tp: &dyn TcpSock, event: CaEvent) {
        (self.cc_ops.on_cwnd_event)(self, tp, event);
    }

    /// Returns the congestion window to restore after a spurious loss.
    ///
    /// A connection in the middle of a handover stays closed, but the window
    /// it resumes with is raised accordingly.
    pub fn undo_cwnd(&mut self, tp: &dyn TcpSock) -> u32 {
        if let Some(handover) = self.handover.as_mut() {
            if handover.gate.raise_saved(tp.prior_cwnd()) {
                return tp.snd_cwnd();
            }
        }

        (self.cc_ops.undo_cwnd)(self, tp)
    }

    /// Returns the HyStart exit counters.
    pub fn stats(&self) -> HystartStats {
        self.hystart.stats()
    }

    /// Returns the handover state, unless handover is disabled for this
    /// connection.
    pub fn handover(&self) -> Option<&Handover> {
        self.handover.as_ref()
    }

    /// Mutable access to the handover state, used by the timer callback.
    pub fn handover_mut(&mut self) -> Option<&mut Handover> {
        self.handover.as_mut()
    }

    /// Whether transmission is currently suspended by a handover.
    pub fn is_suspended(&self) -> bool {
        self.handover.as_ref().is_some_and(Handover::is_suspended)
    }

    fn effective_cwnd(&self, tp: &dyn TcpSock) -> u32 {
        match self.handover.as_ref().map(|h| &h.gate) {
            Some(Gate::Suspended { saved_cwnd }) => *saved_cwnd,

            _ => tp.snd_cwnd(),
        }
    }
}

impl std::fmt::Debug for Congestion {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        (self.cc_ops.debug_fmt)(self, f)?;

        match &self.handover {
            Some(handover) => write!(f, " handover={handover:?}"),

            None => write!(f, " handover=off"),
        }
    }
}

/// Available congestion control algorithms.
///
/// This enum provides currently available list of congestion control
/// algorithms.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(C)]
pub enum CongestionControlAlgorithm {
    /// Reno congestion control algorithm. `reno` in a string form.
    Reno  = 0,
    /// CUBIC congestion control algorithm (default). `cubic` in a string form.
    CUBIC = 1,
}

impl FromStr for CongestionControlAlgorithm {
    type Err = crate::Error;

    /// Converts a string to `CongestionControlAlgorithm`.
    ///
    /// If `name` is not valid, `Error::CongestionControl` is returned.
    fn from_str(name: &str) -> std::result::Result<Self, Self::Err> {
        match name {
            "reno" => Ok(CongestionControlAlgorithm::Reno),
            "cubic" => Ok(CongestionControlAlgorithm::CUBIC),

            _ => Err(crate::Error::CongestionControl),
        }
    }
}

pub(crate) struct CongestionControlOps {
    pub on_init: fn(r: &mut Congestion, tp: &mut dyn TcpSock),

    pub recalc_ssthresh: fn(r: &mut Congestion, cwnd: u32) -> u32,

    pub cong_avoid: fn(r: &mut Congestion, tp: &mut dyn TcpSock, acked: u32),

    pub on_state_change:
        fn(r: &mut Congestion, tp: &dyn TcpSock, state: CaState),

    pub on_rtt_sample:
        fn(r: &mut Congestion, tp: &mut dyn TcpSock, sample: &AckSample),

    pub on_cwnd_event:
        fn(r: &mut Congestion, tp: &dyn TcpSock, event: CaEvent),

    pub undo_cwnd: fn(r: &mut Congestion, tp: &dyn TcpSock) -> u32,

    pub debug_fmt: fn(
        r: &Congestion,
        formatter: &mut std::fmt::Formatter,
    ) -> std::fmt::Result,
}

impl From<CongestionControlAlgorithm> for &'static CongestionControlOps {
    fn from(algo: CongestionControlAlgorithm) -> Self {
        match algo {
            CongestionControlAlgorithm::Reno => &reno::RENO,
            CongestionControlAlgorithm::CUBIC => &cubic::CUBIC,
        }
    }
}

mod cubic;
mod hystart;
mod reno;
