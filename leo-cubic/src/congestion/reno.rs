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

//! Reno Congestion Control
//!
//! Also provides the slow start and additive increase helpers shared with
//! CUBIC.

use std::cmp;

use crate::sock::AckSample;
use crate::sock::CaEvent;
use crate::sock::CaState;
use crate::sock::TcpSock;

use super::Congestion;
use super::CongestionControlOps;

pub(crate) static RENO: CongestionControlOps = CongestionControlOps {
    on_init,
    recalc_ssthresh,
    cong_avoid,
    on_state_change,
    on_rtt_sample,
    on_cwnd_event,
    undo_cwnd,
    debug_fmt,
};

/// Minimum slow start threshold after a loss.
pub(crate) const MIN_SSTHRESH: u32 = 2;

fn on_init(_r: &mut Congestion, _tp: &mut dyn TcpSock) {}

fn recalc_ssthresh(_r: &mut Congestion, cwnd: u32) -> u32 {
    cmp::max(cwnd >> 1, MIN_SSTHRESH)
}

fn cong_avoid(_r: &mut Congestion, tp: &mut dyn TcpSock, acked: u32) {
    let mut acked = acked;

    if tp.in_slow_start() {
        acked = slow_start(tp, acked);

        if acked == 0 {
            return;
        }
    }

    let cwnd = tp.snd_cwnd();
    cong_avoid_ai(tp, cwnd, acked);
}

fn on_state_change(_r: &mut Congestion, _tp: &dyn TcpSock, _state: CaState) {}

fn on_rtt_sample(
    _r: &mut Congestion, _tp: &mut dyn TcpSock, _sample: &AckSample,
) {
}

fn on_cwnd_event(_r: &mut Congestion, _tp: &dyn TcpSock, _event: CaEvent) {}

pub(crate) fn undo_cwnd(_r: &mut Congestion, tp: &dyn TcpSock) -> u32 {
    cmp::max(tp.snd_cwnd(), tp.prior_cwnd())
}

fn debug_fmt(_r: &Congestion, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    write!(f, "reno")
}

/// Grows the window by one packet per acknowledged packet, up to ssthresh.
///
/// Returns the part of `acked` left over once ssthresh is reached.
pub(crate) fn slow_start(tp: &mut dyn TcpSock, acked: u32) -> u32 {
    let cwnd = tp.snd_cwnd();
    let new_cwnd = cmp::min(cwnd.saturating_add(acked), tp.snd_ssthresh());

    // ssthresh may sit below the window after a reduction.
    let consumed = new_cwnd.saturating_sub(cwnd);

    tp.set_snd_cwnd(cmp::min(cmp::max(new_cwnd, cwnd), tp.snd_cwnd_clamp()));

    acked - cmp::min(consumed, acked)
}

/// Grows the window by one packet every `w` acknowledged packets.
pub(crate) fn cong_avoid_ai(tp: &mut dyn TcpSock, w: u32, acked: u32) {
    let w = cmp::max(w, 1);
    let mut cwnd = tp.snd_cwnd();
    let mut cnt = tp.snd_cwnd_cnt();

    // Apply credit accumulated at a larger w gently.
    if cnt >= w {
        cnt = 0;
        cwnd = cwnd.saturating_add(1);
    }

    cnt = cnt.saturating_add(acked);

    if cnt >= w {
        let delta = cnt / w;

        cnt -= delta * w;
        cwnd = cwnd.saturating_add(delta);
    }

    tp.set_snd_cwnd_cnt(cnt);
    tp.set_snd_cwnd(cmp::min(cwnd, tp.snd_cwnd_clamp()));
}
