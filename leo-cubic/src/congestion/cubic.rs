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

//! CUBIC Congestion Control
//!
//! Integer implementation counting the window in packets, with time in
//! 1/1024 s units inside the cubic function. The window grows along
//! `W(t) = C * (t - K)^3 + W_max` after a reduction, with a Reno-friendly
//! floor.
//!
//! Note that Slow Start can use HyStart when enabled.

use std::cmp;

use std::time::Duration;
use std::time::Instant;

use crate::sock::AckSample;
use crate::sock::CaEvent;
use crate::sock::CaState;
use crate::sock::TcpSock;
use crate::Config;

use super::reno;
use super::Congestion;
use super::CongestionControlOps;
use super::BETA_SCALE;

pub(crate) static CUBIC: CongestionControlOps = CongestionControlOps {
    on_init,
    recalc_ssthresh,
    cong_avoid,
    on_state_change,
    on_rtt_sample,
    on_cwnd_event,
    undo_cwnd: reno::undo_cwnd,
    debug_fmt,
};

/// Time unit of the cubic function is 2^BICTCP_HZ per second.
const BICTCP_HZ: u32 = 10;

/// Granularity of the update clock.
const TICK: Duration = Duration::from_millis(1);

/// `cnt` is recomputed at most this often while the window is unchanged.
const UPDATE_INTERVAL: Duration = Duration::from_micros(1_000_000 / 32);

/// RTT samples taken this soon after a reduction are discarded.
const RTT_SAMPLE_HOLDOFF: Duration = Duration::from_secs(1);

/// Cap of `cnt` while no maximum window is known, 5% growth per RTT.
const INITIAL_MAX_CNT: u32 = 20;

/// At most one packet of growth per two packets acknowledged.
const MIN_CNT: u32 = 2;

/// Scaling factors derived from the configuration.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Params {
    fast_convergence: bool,

    beta: u32,

    tcp_friendliness: bool,

    // Reno-equivalent growth, scaled by 8.
    beta_scale: u32,

    // 1024 * C / RTT, with an RTT of 100 ms.
    cube_rtt_scale: u32,

    // 2^40 / cube_rtt_scale, turns a window gap into K^3.
    cube_factor: u64,
}

impl Params {
    pub(crate) fn new(config: &Config) -> Self {
        let beta = cmp::min(config.beta, BETA_SCALE - 1);
        let cube_rtt_scale = cmp::max(config.bic_scale.saturating_mul(10), 1);

        Params {
            fast_convergence: config.fast_convergence,

            beta,

            tcp_friendliness: config.tcp_friendliness,

            beta_scale: 8 * (BETA_SCALE + beta) / 3 / (BETA_SCALE - beta),

            cube_rtt_scale,

            cube_factor: (1u64 << (10 + 3 * BICTCP_HZ)) /
                u64::from(cube_rtt_scale),
        }
    }
}

/// CUBIC State Variables.
#[derive(Debug, Default)]
pub(crate) struct State {
    // Increase the window by 1 after this many ACKs.
    cnt: u32,

    last_max_cwnd: u32,

    last_cwnd: u32,

    last_time: Option<Instant>,

    bic_origin_point: u32,

    // Time to reach the origin point from the epoch start, in 1/1024 s.
    bic_k: u32,

    // Minimum observed RTT in microseconds, 0 until the first sample.
    pub(crate) delay_min: u32,

    epoch_start: Option<Instant>,

    ack_cnt: u32,

    // Window a Reno flow would have reached.
    tcp_cwnd: u32,
}

/// Computes the cube root of `a` using a table lookup followed by one
/// Newton-Raphson iteration.
///
/// The result is within one unit of the exact value below 2^22 and within
/// 0.3% of it from 2^26 up.
pub(crate) fn cubic_root(a: u64) -> u32 {
    // cbrt(x) MSB values for x MSB values in [0..63]:
    //   v = cbrt(x << 18) - 1
    //   cbrt(x) = (v[x] + 10) >> 6
    const V: [u8; 64] = [
        0, 54, 54, 54, 118, 118, 118, 118, 123, 129, 134, 138, 143, 147, 151,
        156, 157, 161, 164, 168, 170, 173, 176, 179, 181, 185, 187, 190, 192,
        194, 197, 199, 200, 202, 204, 206, 209, 211, 213, 215, 217, 219, 221,
        222, 224, 225, 227, 229, 231, 232, 234, 236, 237, 239, 240, 242, 244,
        245, 246, 248, 250, 251, 252, 254,
    ];

    let b = u64::BITS - a.leading_zeros();

    if b < 7 {
        // a in [0..63]
        return (u32::from(V[a as usize]) + 35) >> 6;
    }

    let b = ((b * 84) >> 8) - 1;
    let shift = (a >> (b * 3)) as usize;

    let x = (u64::from(V[shift]) + 10) << b >> 6;

    //   x' = (2 * x + a / x^2) / 3
    let x = 2 * x + a / cmp::max(x * (x - 1), 1);
    let x = (x * 341) >> 10;

    x as u32
}

fn on_init(r: &mut Congestion, tp: &mut dyn TcpSock) {
    r.cubic_state = State::default();

    r.hystart.reset();

    if r.hystart.enabled() {
        r.hystart.reset_round(tp);
    } else if let Some(ssthresh) = r.initial_ssthresh.filter(|&v| v != 0) {
        tp.set_snd_ssthresh(ssthresh);
    }
}

fn recalc_ssthresh(r: &mut Congestion, cwnd: u32) -> u32 {
    let params = &r.cubic_params;
    let cubic = &mut r.cubic_state;

    // End of epoch.
    cubic.epoch_start = None;

    // Wmax and fast convergence.
    cubic.last_max_cwnd =
        if cwnd < cubic.last_max_cwnd && params.fast_convergence {
            scale(cwnd, BETA_SCALE + params.beta, 2 * BETA_SCALE)
        } else {
            cwnd
        };

    cmp::max(scale(cwnd, params.beta, BETA_SCALE), reno::MIN_SSTHRESH)
}

fn cong_avoid(r: &mut Congestion, tp: &mut dyn TcpSock, acked: u32) {
    let mut acked = acked;

    if tp.in_slow_start() {
        acked = reno::slow_start(tp, acked);

        if acked == 0 {
            return;
        }
    }

    update(r, tp.snd_cwnd(), acked, tp.now());

    reno::cong_avoid_ai(tp, r.cubic_state.cnt, acked);
}

/// Computes how many ACKs `cnt` it takes to grow the window by one packet.
fn update(r: &mut Congestion, cwnd: u32, acked: u32, now: Instant) {
    let params = &r.cubic_params;
    let cubic = &mut r.cubic_state;

    cubic.ack_cnt = cubic.ack_cnt.saturating_add(acked);

    let since_update = cubic
        .last_time
        .map(|last_time| now.saturating_duration_since(last_time));

    if cubic.last_cwnd == cwnd &&
        since_update.is_some_and(|d| d <= UPDATE_INTERVAL)
    {
        return;
    }

    // The cubic function is evaluated at most once per tick. Reductions
    // close the epoch, which forces a new evaluation.
    let same_tick =
        cubic.epoch_start.is_some() && since_update.is_some_and(|d| d < TICK);

    if !same_tick {
        cubic.last_cwnd = cwnd;
        cubic.last_time = Some(now);

        let epoch_start = match cubic.epoch_start {
            Some(epoch_start) => epoch_start,

            None => {
                cubic.epoch_start = Some(now);
                cubic.ack_cnt = acked;
                cubic.tcp_cwnd = cwnd;

                if cubic.last_max_cwnd <= cwnd {
                    cubic.bic_k = 0;
                    cubic.bic_origin_point = cwnd;
                } else {
                    let gap = u64::from(cubic.last_max_cwnd - cwnd);

                    cubic.bic_k =
                        cubic_root(params.cube_factor.saturating_mul(gap));
                    cubic.bic_origin_point = cubic.last_max_cwnd;
                }

                now
            },
        };

        // Elapsed time plus one minimum RTT, in 1/1024 s.
        let t = now.saturating_duration_since(epoch_start) +
            Duration::from_micros(u64::from(cubic.delay_min));
        let t = (t.as_micros() << BICTCP_HZ) / 1_000_000;

        let k = u128::from(cubic.bic_k);
        let offs = t.abs_diff(k);

        // C / RTT * (t - K)^3
        let delta = u128::from(params.cube_rtt_scale)
            .saturating_mul(offs.saturating_mul(offs).saturating_mul(offs)) >>
            (10 + 3 * BICTCP_HZ);
        let delta = u32::try_from(delta).unwrap_or(u32::MAX);

        let bic_target = if t < k {
            cubic.bic_origin_point.saturating_sub(delta)
        } else {
            cubic.bic_origin_point.saturating_add(delta)
        };

        cubic.cnt = if bic_target > cwnd {
            cwnd / (bic_target - cwnd)
        } else {
            // Very small increment.
            cwnd.saturating_mul(100)
        };

        // Initial growth is too conservative while the available bandwidth
        // is still unknown.
        if cubic.last_max_cwnd == 0 {
            cubic.cnt = cmp::min(cubic.cnt, INITIAL_MAX_CNT);
        }
    }

    if params.tcp_friendliness {
        let delta = cmp::max(cwnd.saturating_mul(params.beta_scale) >> 3, 1);

        if cubic.ack_cnt > delta {
            let inc = (cubic.ack_cnt - 1) / delta;

            cubic.ack_cnt -= inc * delta;
            cubic.tcp_cwnd = cubic.tcp_cwnd.saturating_add(inc);
        }

        // Reno would be faster.
        if cubic.tcp_cwnd > cwnd {
            let max_cnt = cwnd / (cubic.tcp_cwnd - cwnd);

            cubic.cnt = cmp::min(cubic.cnt, max_cnt);
        }
    }

    cubic.cnt = cmp::max(cubic.cnt, MIN_CNT);
}

fn on_state_change(r: &mut Congestion, tp: &dyn TcpSock, state: CaState) {
    if state == CaState::Loss {
        r.cubic_state = State::default();

        r.hystart.reset();
        r.hystart.reset_round(tp);
    }
}

fn on_rtt_sample(r: &mut Congestion, tp: &mut dyn TcpSock, sample: &AckSample) {
    // Duplicates carry no timestamp.
    if sample.rtt_us < 0 {
        return;
    }

    let cubic = &mut r.cubic_state;

    if let Some(epoch_start) = cubic.epoch_start {
        if tp.now().saturating_duration_since(epoch_start) < RTT_SAMPLE_HOLDOFF
        {
            return;
        }
    }

    let delay = cmp::max(u32::try_from(sample.rtt_us).unwrap_or(u32::MAX), 1);

    if cubic.delay_min == 0 || cubic.delay_min > delay {
        cubic.delay_min = delay;
    }

    if r.hystart.enabled() &&
        !r.hystart.found() &&
        tp.in_slow_start() &&
        tp.snd_cwnd() >= r.hystart.low_window()
    {
        r.hystart.on_rtt_sample(tp, delay, cubic.delay_min);
    }
}

fn on_cwnd_event(r: &mut Congestion, tp: &dyn TcpSock, event: CaEvent) {
    if event != CaEvent::TxStart {
        return;
    }

    let now = tp.now();
    let idle = now.saturating_duration_since(tp.last_send_time());

    // We were application limited (idle) for a while.
    // Shift epoch start to keep cwnd growth to cubic curve.
    if let Some(epoch_start) = r.cubic_state.epoch_start {
        if !idle.is_zero() {
            r.cubic_state.epoch_start = Some(cmp::min(epoch_start + idle, now));
        }
    }
}

fn debug_fmt(r: &Congestion, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    let cubic = &r.cubic_state;

    write!(
        f,
        "cubic={{ cnt={} last_max_cwnd={} k={} origin={} delay_min={} }} ",
        cubic.cnt,
        cubic.last_max_cwnd,
        cubic.bic_k,
        cubic.bic_origin_point,
        cubic.delay_min
    )?;

    write!(f, "hystart={:?}", r.hystart)
}

fn scale(cwnd: u32, num: u32, den: u32) -> u32 {
    let v = u64::from(cwnd) * u64::from(num) / u64::from(den);

    u32::try_from(v).unwrap_or(u32::MAX)
}
