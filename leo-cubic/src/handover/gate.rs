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

//! Freezes and restores the congestion window around a handover.

use std::cmp;
use std::time::Duration;

use crate::sock::TcpSock;
use crate::sock::MIN_CWND;

/// Transmission gate of a connection.
///
/// A suspended connection has a congestion window of `0` and remembers the
/// window it had before.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Gate {
    /// Transmission follows the congestion window.
    #[default]
    Open,

    /// Transmission is frozen until the handover is over.
    Suspended {
        /// Window to restore on resume.
        saved_cwnd: u32,
    },
}

impl Gate {
    /// Closes the congestion window.
    ///
    /// The pending retransmission deadline, if any, is pushed back by
    /// `extend` so that the blackout does not read as a timeout. Returns
    /// `false` without doing anything if the window is already closed.
    pub fn suspend(&mut self, tp: &mut dyn TcpSock, extend: Duration) -> bool {
        let cwnd = tp.snd_cwnd();

        if cwnd == 0 {
            return false;
        }

        *self = Gate::Suspended { saved_cwnd: cwnd };

        tp.set_snd_cwnd(0);

        if let Some(deadline) = tp.retransmit_deadline() {
            tp.set_retransmit_deadline(deadline + extend);
        }

        true
    }

    /// Restores the window saved by [`suspend()`].
    ///
    /// Writers blocked on send buffer space are woken up once. Returns
    /// `false` without touching the window if it is already open.
    ///
    /// [`suspend()`]: Gate::suspend
    pub fn resume(&mut self, tp: &mut dyn TcpSock) -> bool {
        if tp.snd_cwnd() != 0 {
            *self = Gate::Open;
            return false;
        }

        let saved = match *self {
            Gate::Suspended { saved_cwnd } => saved_cwnd,

            Gate::Open => 0,
        };

        *self = Gate::Open;

        tp.set_snd_cwnd(cmp::max(saved, MIN_CWND));

        if tp.is_write_blocked() {
            tp.write_space();
        }

        true
    }

    /// Raises the window to restore on resume to at least `cwnd`.
    ///
    /// Returns whether the gate is suspended.
    pub fn raise_saved(&mut self, cwnd: u32) -> bool {
        match self {
            Gate::Suspended { saved_cwnd } => {
                *saved_cwnd = cmp::max(*saved_cwnd, cwnd);
                true
            },

            Gate::Open => false,
        }
    }

    /// Whether transmission is frozen.
    pub fn is_suspended(&self) -> bool {
        matches!(self, Gate::Suspended { .. })
    }
}
