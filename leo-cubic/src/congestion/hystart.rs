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

//! Hybrid Slow Start
//!
//! Exits slow start before the first loss, either when the ACKs of a round
//! keep arriving as a dense train for longer than half the minimum RTT, or
//! when the RTT of a round grows noticeably above the minimum RTT.

use std::cmp;
use std::time::Duration;
use std::time::Instant;

use crate::sock::seq_after;
use crate::sock::TcpSock;
use crate::Config;
use crate::HYSTART_ACK_TRAIN;
use crate::HYSTART_DELAY;

/// Number of delay samples needed before checking for a delay increase.
const MIN_SAMPLES: u8 = 8;

/// Bounds of the delay increase threshold, in microseconds.
const DELAY_MIN: u32 = 4_000;

const DELAY_MAX: u32 = 16_000;

/// Upper bound of the pacing cushion added to the train threshold.
const MAX_ACK_DELAY: u64 = 1_000;

/// Slow start exit counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HystartStats {
    /// Number of slow start exits triggered by an ACK train.
    pub train_detect: u64,

    /// Sum of the congestion windows at ACK train exits.
    pub train_cwnd: u64,

    /// Number of slow start exits triggered by a delay increase.
    pub delay_detect: u64,

    /// Sum of the congestion windows at delay increase exits.
    pub delay_cwnd: u64,
}

pub(crate) struct Hystart {
    enabled: bool,

    detect: u8,

    low_window: u32,

    ack_delta: Duration,

    found: bool,

    round_start: Option<Instant>,

    end_seq: u32,

    last_ack: Option<Instant>,

    // Minimum RTT of the current round, in microseconds.
    curr_rtt: u32,

    sample_cnt: u8,

    stats: HystartStats,
}

impl std::fmt::Debug for Hystart {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "found={:?} ", self.found)?;
        write!(f, "round_start={:?} ", self.round_start)?;
        write!(f, "end_seq={:?} ", self.end_seq)?;
        write!(f, "curr_rtt={:?} ", self.curr_rtt)?;
        write!(f, "sample_cnt={:?}", self.sample_cnt)?;

        Ok(())
    }
}

impl Hystart {
    pub fn new(config: &Config) -> Self {
        Hystart {
            enabled: config.hystart,
            detect: config.hystart_detect,
            low_window: config.hystart_low_window,
            ack_delta: config.hystart_ack_delta,
            found: false,
            round_start: None,
            end_seq: 0,
            last_ack: None,
            curr_rtt: u32::MAX,
            sample_cnt: 0,
            stats: HystartStats::default(),
        }
    }

    /// Forgets any previous exit.
    pub fn reset(&mut self) {
        self.found = false;
        self.round_start = None;
        self.last_ack = None;
    }

    /// Starts a new round ending with the next packet to be sent.
    pub fn reset_round(&mut self, tp: &dyn TcpSock) {
        let now = tp.now();

        self.round_start = Some(now);
        self.last_ack = Some(now);
        self.end_seq = tp.snd_nxt();
        self.curr_rtt = u32::MAX;
        self.sample_cnt = 0;
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn found(&self) -> bool {
        self.found
    }

    pub fn low_window(&self) -> u32 {
        self.low_window
    }

    pub fn stats(&self) -> HystartStats {
        self.stats
    }

    /// Processes an RTT sample of `delay` microseconds taken in slow start.
    pub fn on_rtt_sample(
        &mut self, tp: &mut dyn TcpSock, delay: u32, delay_min: u32,
    ) {
        if self.round_start.is_none() || seq_after(tp.snd_una(), self.end_seq)
        {
            self.reset_round(tp);
        }

        if self.detect & HYSTART_ACK_TRAIN != 0 {
            self.detect_ack_train(tp, delay_min);
        }

        if self.detect & HYSTART_DELAY != 0 {
            self.detect_delay(tp, delay, delay_min);
        }
    }

    fn detect_ack_train(&mut self, tp: &mut dyn TcpSock, delay_min: u32) {
        let now = tp.now();

        let (Some(last_ack), Some(round_start)) =
            (self.last_ack, self.round_start)
        else {
            return;
        };

        if now.saturating_duration_since(last_ack) > self.ack_delta {
            return;
        }

        self.last_ack = Some(now);

        let mut threshold = u64::from(delay_min) + ack_delay(tp);

        // Pacing might have delayed packets up to RTT/2 during slow start.
        if !tp.is_paced() {
            threshold >>= 1;
        }

        let train = now.saturating_duration_since(round_start);

        if train > Duration::from_micros(threshold) {
            let cwnd = tp.snd_cwnd();

            trace!(
                "{} hystart_ack_train ({:?} > {}us) delay_min {} cwnd {}",
                tp.trace_id(),
                train,
                threshold,
                delay_min,
                cwnd
            );

            self.found = true;
            self.stats.train_detect += 1;
            self.stats.train_cwnd += u64::from(cwnd);

            tp.set_snd_ssthresh(cwnd);
        }
    }

    fn detect_delay(&mut self, tp: &mut dyn TcpSock, delay: u32, delay_min: u32) {
        self.curr_rtt = cmp::min(self.curr_rtt, delay);

        if self.sample_cnt < MIN_SAMPLES {
            self.sample_cnt += 1;
            return;
        }

        let threshold =
            delay_min.saturating_add((delay_min >> 3).clamp(DELAY_MIN, DELAY_MAX));

        if self.curr_rtt > threshold {
            let cwnd = tp.snd_cwnd();

            trace!(
                "{} hystart_delay ({} > {}) cwnd {}",
                tp.trace_id(),
                self.curr_rtt,
                threshold,
                cwnd
            );

            self.found = true;
            self.stats.delay_detect += 1;
            self.stats.delay_cwnd += u64::from(cwnd);

            tp.set_snd_ssthresh(cwnd);
        }
    }
}

/// Cushion for segmentation offload and aggregation delays, in
/// microseconds.
///
/// Short RTT flows would otherwise get a too small ssthresh: slow start
/// begins with small offload bursts and the minimum RTT doesn't account for
/// aggregation delay once bursts get bigger.
fn ack_delay(tp: &dyn TcpSock) -> u64 {
    let rate = tp.pacing_rate();

    if rate == 0 {
        return 0;
    }

    cmp::min(MAX_ACK_DELAY, u64::from(tp.gso_max_size()) * 4_000_000 / rate)
}
