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

use std::sync::Arc;
use std::time::Duration;

use leo_cubic::testing::SimClock;
use leo_cubic::testing::TestConn;
use leo_cubic::testing::TestSock;
use leo_cubic::Config;
use leo_cubic::PhaseClock;

use parking_lot::Mutex;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

async fn sleep_until(start: tokio::time::Instant, at: Duration) {
    tokio::time::sleep_until(start + at).await;
}

fn debug_config() -> Config {
    let mut config = Config::new();
    config.enable_debug(true);
    config
}

fn cwnd(conn: &Arc<Mutex<TestConn>>) -> u32 {
    conn.lock().tcp.cwnd
}

#[tokio::test(start_paused = true)]
async fn suspends_around_every_handover() {
    init_logger();

    let start = tokio::time::Instant::now();

    let clock = PhaseClock::new(SimClock::new(Duration::ZERO));
    clock.init().unwrap();

    let mut tcp = TestSock::new(40);
    tcp.write_blocked = true;

    let conn = TestConn::new(&debug_config(), clock.clone(), tcp).unwrap();
    TestConn::init(&conn);

    // The armed timer holds the connection.
    assert_eq!(Arc::strong_count(&conn), 2);
    assert!(conn.lock().cc.handover().unwrap().is_armed());

    sleep_until(start, ms(11_799)).await;
    assert_eq!(cwnd(&conn), 40);

    sleep_until(start, ms(11_801)).await;
    assert_eq!(cwnd(&conn), 0);
    assert!(conn.lock().cc.is_suspended());

    sleep_until(start, ms(12_199)).await;
    assert_eq!(cwnd(&conn), 0);

    sleep_until(start, ms(12_201)).await;
    {
        let conn = conn.lock();

        assert_eq!(conn.tcp.cwnd, 40);
        assert_eq!(conn.tcp.write_space_calls, 1);
        assert!(!conn.cc.is_suspended());
    }

    // Next period.
    sleep_until(start, ms(26_799)).await;
    assert_eq!(cwnd(&conn), 40);

    sleep_until(start, ms(26_801)).await;
    assert_eq!(cwnd(&conn), 0);

    sleep_until(start, ms(27_201)).await;
    assert_eq!(cwnd(&conn), 40);
    assert_eq!(conn.lock().tcp.write_space_calls, 2);

    TestConn::release(&conn);
    tokio::time::sleep(ms(1)).await;

    assert_eq!(Arc::strong_count(&conn), 1);

    clock.shutdown();
}

#[tokio::test(start_paused = true)]
async fn retransmit_deadline_pushed_back() {
    init_logger();

    let start = tokio::time::Instant::now();

    let clock = PhaseClock::new(SimClock::new(ms(10_000)));

    let conn = TestConn::new(&debug_config(), clock, TestSock::new(40)).unwrap();
    TestConn::init(&conn);

    let deadline = {
        let mut conn = conn.lock();
        let deadline = conn.tcp.now + Duration::from_secs(3);

        conn.tcp.rto = Some(deadline);
        deadline
    };

    sleep_until(start, ms(1_801)).await;

    let conn_ref = conn.lock();
    assert_eq!(conn_ref.tcp.cwnd, 0);
    assert_eq!(conn_ref.tcp.rto, Some(deadline + ms(400)));
    drop(conn_ref);

    TestConn::release(&conn);
}

#[allow(clippy::await_holding_lock)]
#[tokio::test(start_paused = true)]
async fn busy_connection_is_retried() {
    init_logger();

    let start = tokio::time::Instant::now();

    let clock = PhaseClock::new(SimClock::new(ms(11_000)));

    let conn = TestConn::new(&debug_config(), clock, TestSock::new(40)).unwrap();
    TestConn::init(&conn);

    sleep_until(start, ms(799)).await;

    // The host owns the connection across the window start.
    let guard = conn.lock();
    sleep_until(start, ms(850)).await;
    assert_eq!(guard.tcp.cwnd, 40);
    drop(guard);

    // Retried within a tick.
    sleep_until(start, ms(852)).await;
    assert_eq!(cwnd(&conn), 0);

    sleep_until(start, ms(1_201)).await;
    assert_eq!(cwnd(&conn), 40);

    TestConn::release(&conn);
}

#[tokio::test(start_paused = true)]
async fn closed_connection_stops_timer() {
    init_logger();

    let start = tokio::time::Instant::now();

    let clock = PhaseClock::new(SimClock::new(Duration::ZERO));

    let conn = TestConn::new(&debug_config(), clock, TestSock::new(40)).unwrap();
    TestConn::init(&conn);

    conn.lock().tcp.established = false;

    sleep_until(start, ms(11_801)).await;

    // The timer let go of the connection without touching it.
    assert_eq!(Arc::strong_count(&conn), 1);
    assert_eq!(cwnd(&conn), 40);
    assert!(!conn.lock().cc.handover().unwrap().is_armed());

    TestConn::release(&conn);
}

#[tokio::test(start_paused = true)]
async fn adopt_during_handover_then_resume() {
    init_logger();

    let start = tokio::time::Instant::now();

    // 42s into the minute is 12s into the third period.
    let clock = PhaseClock::new(SimClock::new(ms(3_600_000 + 42_000)));

    let conn = TestConn::new(&debug_config(), clock, TestSock::new(40)).unwrap();
    TestConn::init(&conn);

    assert_eq!(cwnd(&conn), 0);

    sleep_until(start, ms(201)).await;
    assert_eq!(cwnd(&conn), 40);

    TestConn::release(&conn);
}

#[tokio::test(start_paused = true)]
async fn stopped_clock_disables_handover() {
    init_logger();

    let clock = PhaseClock::new(SimClock::new(ms(42_000)));
    clock.shutdown();

    let conn = TestConn::new(&debug_config(), clock, TestSock::new(40)).unwrap();
    TestConn::init(&conn);

    assert_eq!(cwnd(&conn), 40);
    assert!(conn.lock().cc.handover().is_none());
    assert_eq!(Arc::strong_count(&conn), 1);
}

#[tokio::test(start_paused = true)]
async fn timer_only_mode() {
    init_logger();

    let start = tokio::time::Instant::now();

    let mut config = debug_config();
    config.enable_handover_timer_only(true);

    let clock = PhaseClock::new(SimClock::new(Duration::ZERO));

    let conn = TestConn::new(&config, clock, TestSock::new(40)).unwrap();
    TestConn::init(&conn);

    sleep_until(start, ms(11_801)).await;
    assert_eq!(cwnd(&conn), 0);

    // ACKs during the window are ignored.
    {
        let mut guard = conn.lock();
        let TestConn { tcp, cc } = &mut *guard;

        cc.on_ack(tcp, 0, 5);
        assert_eq!(tcp.cwnd, 0);
    }

    sleep_until(start, ms(12_201)).await;
    assert_eq!(cwnd(&conn), 40);

    sleep_until(start, ms(26_801)).await;
    assert_eq!(cwnd(&conn), 0);

    TestConn::release(&conn);
}
