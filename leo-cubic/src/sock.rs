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

//! The host transport stack as seen by the congestion controller.

use std::time::Duration;
use std::time::Instant;

/// Minimum congestion window, in packets, outside of a handover.
pub const MIN_CWND: u32 = 1;

/// Connection state exposed by the host TCP stack.
///
/// Windows are counted in packets, sequence numbers wrap around as in TCP.
/// The trait is object safe: the congestion hooks take `&mut dyn TcpSock`.
pub trait TcpSock {
    /// Current congestion window.
    fn snd_cwnd(&self) -> u32;

    /// Sets the congestion window. Unlike the regular window update path,
    /// `0` is a valid value here and freezes transmission.
    fn set_snd_cwnd(&mut self, cwnd: u32);

    /// Upper bound of the congestion window.
    fn snd_cwnd_clamp(&self) -> u32 {
        u32::MAX
    }

    /// Linear increase counter used by additive increase.
    fn snd_cwnd_cnt(&self) -> u32;

    /// Sets the linear increase counter.
    fn set_snd_cwnd_cnt(&mut self, cnt: u32);

    /// Slow start threshold.
    fn snd_ssthresh(&self) -> u32;

    /// Sets the slow start threshold.
    fn set_snd_ssthresh(&mut self, ssthresh: u32);

    /// Congestion window recorded before the last reduction, used by undo.
    fn prior_cwnd(&self) -> u32 {
        0
    }

    /// Next sequence number to be sent.
    fn snd_nxt(&self) -> u32;

    /// First unacknowledged sequence number.
    fn snd_una(&self) -> u32;

    /// Whether the sender is currently limited by the congestion window
    /// rather than by the application.
    fn is_cwnd_limited(&self) -> bool;

    /// Number of packets sent and not yet acknowledged or lost.
    fn packets_in_flight(&self) -> u32;

    /// Whether the connection is in the established state.
    fn is_established(&self) -> bool;

    /// Timestamp of the event being processed.
    fn now(&self) -> Instant;

    /// Time of the last data transmission.
    fn last_send_time(&self) -> Instant;

    /// Pacing rate in bytes per second, `0` when unknown.
    fn pacing_rate(&self) -> u64 {
        0
    }

    /// Whether packets are explicitly paced.
    fn is_paced(&self) -> bool {
        false
    }

    /// Maximum size of a segmentation offload burst, in bytes.
    fn gso_max_size(&self) -> u32 {
        65536
    }

    /// Deadline of the pending retransmission timer, if armed.
    fn retransmit_deadline(&self) -> Option<Instant>;

    /// Moves the pending retransmission timer to `deadline`.
    fn set_retransmit_deadline(&mut self, deadline: Instant);

    /// Whether writers are blocked waiting for send buffer space.
    fn is_write_blocked(&self) -> bool;

    /// Wakes up writers blocked on send buffer space.
    fn write_space(&mut self);

    /// Identifier prefixed to log messages.
    fn trace_id(&self) -> &str {
        ""
    }

    /// Whether the connection is still in slow start.
    fn in_slow_start(&self) -> bool {
        self.snd_cwnd() < self.snd_ssthresh()
    }
}

/// Congestion avoidance states of the host stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaState {
    /// Nothing bad has been observed recently.
    Open,

    /// Duplicate ACKs or SACKs have been received.
    Disorder,

    /// The window is being reduced due to an ECN signal.
    Cwr,

    /// Fast retransmit is in progress.
    Recovery,

    /// A retransmission timeout fired and the window collapsed.
    Loss,
}

/// Congestion window events reported by the host stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaEvent {
    /// First transmission when no packets are in flight.
    TxStart,

    /// The congestion window was restarted after idle.
    CwndRestart,

    /// Congestion window reduction completed.
    CompleteCwr,

    /// A retransmission timeout fired.
    Loss,
}

/// A round-trip time sample attached to an acknowledgment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AckSample {
    /// Number of packets newly acknowledged.
    pub pkts_acked: u32,

    /// RTT in microseconds, negative when the ACK carries no valid sample.
    pub rtt_us: i64,
}

impl AckSample {
    /// Creates a sample, without RTT if the ACK carried no timestamp.
    pub fn new(pkts_acked: u32, rtt: Option<Duration>) -> Self {
        AckSample {
            pkts_acked,
            rtt_us: rtt.map_or(-1, |rtt| {
                i64::try_from(rtt.as_micros()).unwrap_or(i64::MAX)
            }),
        }
    }
}

/// Returns whether sequence number `a` comes after `b`, allowing for wrap.
pub fn seq_after(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) < 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_after_wraps() {
        assert!(seq_after(10, 5));
        assert!(!seq_after(5, 10));
        assert!(!seq_after(7, 7));

        assert!(seq_after(3, u32::MAX - 2));
        assert!(!seq_after(u32::MAX - 2, 3));
    }

    #[test]
    fn ack_sample_without_rtt() {
        let sample = AckSample::new(1, None);
        assert_eq!(sample.rtt_us, -1);

        let sample = AckSample::new(2, Some(Duration::from_millis(12)));
        assert_eq!(sample.pkts_acked, 2);
        assert_eq!(sample.rtt_us, 12_000);
    }
}
