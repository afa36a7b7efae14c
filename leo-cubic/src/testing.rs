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

//! Test doubles for the host stack and the clock sources.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;

use crate::clock::ClockSource;
use crate::clock::PhaseClock;
use crate::congestion::Congestion;
use crate::handover::timer::HandoverHost;
use crate::handover::timer::HandoverTarget;
use crate::handover::Handover;
use crate::sock::TcpSock;
use crate::Config;
use crate::Result;

/// A scripted TCP socket.
#[derive(Clone, Debug)]
pub struct TestSock {
    pub cwnd: u32,

    pub cwnd_clamp: u32,

    pub cwnd_cnt: u32,

    pub ssthresh: u32,

    pub prior_cwnd: u32,

    pub snd_nxt: u32,

    pub snd_una: u32,

    pub cwnd_limited: bool,

    pub in_flight: u32,

    pub established: bool,

    pub now: Instant,

    pub last_send: Instant,

    pub pacing_rate: u64,

    pub paced: bool,

    pub gso_max_size: u32,

    pub rto: Option<Instant>,

    pub write_blocked: bool,

    pub write_space_calls: usize,

    pub trace_id: String,
}

impl TestSock {
    /// Slow start threshold of a fresh connection.
    pub const INFINITE_SSTHRESH: u32 = 0x7fff_ffff;

    pub fn new(cwnd: u32) -> Self {
        let now = Instant::now();

        TestSock {
            cwnd,
            cwnd_clamp: u32::MAX,
            cwnd_cnt: 0,
            ssthresh: Self::INFINITE_SSTHRESH,
            prior_cwnd: 0,
            snd_nxt: 0,
            snd_una: 0,
            cwnd_limited: true,
            in_flight: cwnd,
            established: true,
            now,
            last_send: now,
            pacing_rate: 0,
            paced: false,
            gso_max_size: 65536,
            rto: None,
            write_blocked: false,
            write_space_calls: 0,
            trace_id: "test".to_string(),
        }
    }

    /// Moves the socket's notion of the current time forward.
    pub fn advance(&mut self, d: Duration) {
        self.now += d;
    }
}

impl TcpSock for TestSock {
    fn snd_cwnd(&self) -> u32 {
        self.cwnd
    }

    fn set_snd_cwnd(&mut self, cwnd: u32) {
        self.cwnd = cwnd;
    }

    fn snd_cwnd_clamp(&self) -> u32 {
        self.cwnd_clamp
    }

    fn snd_cwnd_cnt(&self) -> u32 {
        self.cwnd_cnt
    }

    fn set_snd_cwnd_cnt(&mut self, cnt: u32) {
        self.cwnd_cnt = cnt;
    }

    fn snd_ssthresh(&self) -> u32 {
        self.ssthresh
    }

    fn set_snd_ssthresh(&mut self, ssthresh: u32) {
        self.ssthresh = ssthresh;
    }

    fn prior_cwnd(&self) -> u32 {
        self.prior_cwnd
    }

    fn snd_nxt(&self) -> u32 {
        self.snd_nxt
    }

    fn snd_una(&self) -> u32 {
        self.snd_una
    }

    fn is_cwnd_limited(&self) -> bool {
        self.cwnd_limited
    }

    fn packets_in_flight(&self) -> u32 {
        self.in_flight
    }

    fn is_established(&self) -> bool {
        self.established
    }

    fn now(&self) -> Instant {
        self.now
    }

    fn last_send_time(&self) -> Instant {
        self.last_send
    }

    fn pacing_rate(&self) -> u64 {
        self.pacing_rate
    }

    fn is_paced(&self) -> bool {
        self.paced
    }

    fn gso_max_size(&self) -> u32 {
        self.gso_max_size
    }

    fn retransmit_deadline(&self) -> Option<Instant> {
        self.rto
    }

    fn set_retransmit_deadline(&mut self, deadline: Instant) {
        self.rto = Some(deadline);
    }

    fn is_write_blocked(&self) -> bool {
        self.write_blocked
    }

    fn write_space(&mut self) {
        self.write_space_calls += 1;
    }

    fn trace_id(&self) -> &str {
        &self.trace_id
    }
}

#[derive(Debug, Default)]
struct ManualTime {
    wall: Duration,

    monotonic: Duration,
}

/// A clock source moved by hand. Clones share the same time.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    time: Arc<Mutex<ManualTime>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_wall(&self, wall: Duration) {
        self.time.lock().wall = wall;
    }

    pub fn set_monotonic(&self, monotonic: Duration) {
        self.time.lock().monotonic = monotonic;
    }

    /// Moves both clocks forward.
    pub fn advance(&self, d: Duration) {
        let mut time = self.time.lock();

        time.wall += d;
        time.monotonic += d;
    }

    pub fn advance_wall(&self, d: Duration) {
        self.time.lock().wall += d;
    }

    pub fn advance_monotonic(&self, d: Duration) {
        self.time.lock().monotonic += d;
    }
}

impl ClockSource for ManualClock {
    fn monotonic(&self) -> Duration {
        self.time.lock().monotonic
    }

    fn wall(&self) -> Duration {
        self.time.lock().wall
    }
}

/// A clock source driven by tokio time, for paused-time runtimes.
///
/// The wall clock starts at `wall_start` and advances with tokio time, plus
/// any skew applied afterwards.
#[derive(Clone, Debug)]
pub struct SimClock {
    origin: tokio::time::Instant,

    wall_start: Duration,

    skew: Arc<Mutex<Duration>>,
}

impl SimClock {
    pub fn new(wall_start: Duration) -> Self {
        SimClock {
            origin: tokio::time::Instant::now(),
            wall_start,
            skew: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Steps the wall clock forward, leaving the monotonic clock alone.
    pub fn skew(&self, d: Duration) {
        *self.skew.lock() += d;
    }
}

impl ClockSource for SimClock {
    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }

    fn wall(&self) -> Duration {
        self.wall_start + self.origin.elapsed() + *self.skew.lock()
    }
}

/// A connection as owned by the host stack.
pub struct TestConn {
    pub tcp: TestSock,

    pub cc: Congestion,
}

impl TestConn {
    pub fn new(
        config: &Config, clock: Arc<PhaseClock>, tcp: TestSock,
    ) -> Result<Arc<Mutex<Self>>> {
        let cc = Congestion::new(config, clock)?;

        Ok(Arc::new(Mutex::new(TestConn { tcp, cc })))
    }

    /// Adopts the algorithm, as the host does under the connection lock.
    pub fn init(conn: &Arc<Mutex<Self>>) {
        let target: Arc<dyn HandoverTarget> = conn.clone();

        let mut guard = conn.lock();
        let TestConn { tcp, cc } = &mut *guard;

        cc.on_init(tcp, target);
    }

    /// Drops the algorithm.
    pub fn release(conn: &Arc<Mutex<Self>>) {
        conn.lock().cc.on_release();
    }
}

impl HandoverHost for TestConn {
    fn handover_parts(&mut self) -> Option<(&mut dyn TcpSock, &mut Handover)> {
        let handover = self.cc.handover_mut()?;

        Some((&mut self.tcp, handover))
    }
}
