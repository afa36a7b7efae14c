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

//! CUBIC congestion control for low-earth-orbit satellite links.
//!
//! Satellite constellations such as Starlink switch beams at fixed instants:
//! seconds 12, 27, 42 and 57 of every wall-clock minute. During the switch
//! the link is dark for a few hundred milliseconds, and a regular congestion
//! controller reads the resulting silence as heavy loss. This crate combines
//! a CUBIC + HyStart window engine with a handover scheduler that closes the
//! congestion window right before each blackout and restores it right after.
//!
//! ## Configuration
//!
//! The first step is creating a configuration object, shared among all
//! connections:
//!
//! ```
//! use std::time::Duration;
//!
//! let mut config = leo_cubic::Config::new();
//! config.set_cc_algorithm_name("cubic")?;
//! config.set_handover_offsets(
//!     Duration::from_millis(150),
//!     Duration::from_millis(250),
//! );
//! config.validate()?;
//! # Ok::<(), leo_cubic::Error>(())
//! ```
//!
//! The same options can be loaded from any [`serde`] data format.
//!
//! ## Phase clock
//!
//! Handover instants are derived from a process-wide [`PhaseClock`]. It is
//! created once, before any connection, and resynchronized against the wall
//! clock by a background task once [`PhaseClock::init()`] is called from
//! within a tokio runtime.
//!
//! ## Connections
//!
//! The host transport stack exposes each connection through the [`TcpSock`]
//! trait and owns it behind an `Arc<parking_lot::Mutex<_>>`. The mutex type
//! implements [`HandoverTarget`] as long as the connection implements
//! [`HandoverHost`], which lets the handover timer reach the connection from
//! its own task.
//!
//! The congestion hooks on [`Congestion`] are then called by the host stack
//! at the usual places: [`on_init()`] when the connection adopts the
//! algorithm, [`on_ack()`] and [`on_rtt_sample()`] for every acknowledgment,
//! [`recalc_ssthresh()`] on loss, and [`on_release()`] when the connection
//! goes away. Calling [`on_release()`] is mandatory: the handover timer keeps
//! the connection alive until it is cancelled.
//!
//! [`on_init()`]: Congestion::on_init
//! [`on_ack()`]: Congestion::on_ack
//! [`on_rtt_sample()`]: Congestion::on_rtt_sample
//! [`recalc_ssthresh()`]: Congestion::recalc_ssthresh
//! [`on_release()`]: Congestion::on_release

#![allow(clippy::upper_case_acronyms)]
#![warn(missing_docs)]

#[macro_use]
extern crate log;

use std::str::FromStr;
use std::time::Duration;

use serde_with::serde_as;
use serde_with::DurationMicroSeconds;
use serde_with::DurationMilliSeconds;

pub use crate::clock::ClockSource;
pub use crate::clock::PhaseClock;
pub use crate::clock::SystemClock;
pub use crate::congestion::Congestion;
pub use crate::congestion::CongestionControlAlgorithm;
pub use crate::congestion::HystartStats;
pub use crate::error::Error;
pub use crate::error::Result;
pub use crate::handover::gate::Gate;
pub use crate::handover::timer::Fire;
pub use crate::handover::timer::HandoverHost;
pub use crate::handover::timer::HandoverTarget;
pub use crate::handover::Handover;
pub use crate::handover::HandoverWindow;
pub use crate::handover::Transition;
pub use crate::sock::seq_after;
pub use crate::sock::AckSample;
pub use crate::sock::CaEvent;
pub use crate::sock::CaState;
pub use crate::sock::TcpSock;

/// Default offset of the handover window around the handover instant.
pub const DEFAULT_HANDOVER_OFFSET: Duration = Duration::from_millis(200);

/// Largest accepted handover offset. Larger values are clamped.
pub const MAX_HANDOVER_OFFSET: Duration = Duration::from_millis(1000);

const DEFAULT_BETA: u32 = 717;

const DEFAULT_BIC_SCALE: u32 = 41;

const DEFAULT_HYSTART_LOW_WINDOW: u32 = 16;

const DEFAULT_HYSTART_ACK_DELTA: Duration = Duration::from_micros(2000);

/// HyStart exit detection based on ACK trains.
pub const HYSTART_ACK_TRAIN: u8 = 0x1;

/// HyStart exit detection based on delay increase.
pub const HYSTART_DELAY: u8 = 0x2;

/// Stores configuration shared between multiple connections.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Config {
    cc_algorithm: CongestionControlAlgorithm,

    debug: bool,

    handover: bool,

    handover_timer_only: bool,

    #[serde(rename = "handover_start_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    handover_start: Duration,

    #[serde(rename = "handover_end_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    handover_end: Duration,

    fast_convergence: bool,

    beta: u32,

    initial_ssthresh: Option<u32>,

    bic_scale: u32,

    tcp_friendliness: bool,

    hystart: bool,

    hystart_detect: u8,

    hystart_low_window: u32,

    #[serde(rename = "hystart_ack_delta_us")]
    #[serde_as(as = "DurationMicroSeconds<u64>")]
    hystart_ack_delta: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cc_algorithm: CongestionControlAlgorithm::CUBIC,
            debug: false,
            handover: true,
            handover_timer_only: false,
            handover_start: DEFAULT_HANDOVER_OFFSET,
            handover_end: DEFAULT_HANDOVER_OFFSET,
            fast_convergence: true,
            beta: DEFAULT_BETA,
            initial_ssthresh: None,
            bic_scale: DEFAULT_BIC_SCALE,
            tcp_friendliness: true,
            hystart: true,
            hystart_detect: HYSTART_ACK_TRAIN | HYSTART_DELAY,
            hystart_low_window: DEFAULT_HYSTART_LOW_WINDOW,
            hystart_ack_delta: DEFAULT_HYSTART_ACK_DELTA,
        }
    }
}

impl Config {
    /// Creates a config object with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks that every parameter is within its accepted range.
    ///
    /// This is also done by [`Congestion::new()`], so configurations loaded
    /// through `serde` are validated before use.
    ///
    /// [`Congestion::new()`]: Congestion::new
    pub fn validate(&self) -> Result<()> {
        if self.beta == 0 || self.beta >= congestion::BETA_SCALE {
            return Err(Error::InvalidConfig("beta"));
        }

        if self.bic_scale == 0 {
            return Err(Error::InvalidConfig("bic_scale"));
        }

        if self.hystart_detect == 0 ||
            self.hystart_detect & !(HYSTART_ACK_TRAIN | HYSTART_DELAY) != 0
        {
            return Err(Error::InvalidConfig("hystart_detect"));
        }

        Ok(())
    }

    /// Sets the congestion control algorithm used by string.
    ///
    /// The default value is `cubic`. On error `Error::CongestionControl`
    /// will be returned.
    ///
    /// ## Examples:
    ///
    /// ```
    /// # let mut config = leo_cubic::Config::new();
    /// config.set_cc_algorithm_name("reno");
    /// ```
    pub fn set_cc_algorithm_name(&mut self, name: &str) -> Result<()> {
        self.cc_algorithm = CongestionControlAlgorithm::from_str(name)?;

        Ok(())
    }

    /// Sets the congestion control algorithm used.
    ///
    /// The default value is `CongestionControlAlgorithm::CUBIC`.
    pub fn set_cc_algorithm(&mut self, algo: CongestionControlAlgorithm) {
        self.cc_algorithm = algo;
    }

    /// Configures whether handover traces and anomalies are logged.
    ///
    /// The default value is `false`.
    pub fn enable_debug(&mut self, v: bool) {
        self.debug = v;
    }

    /// Configures whether transmission is suspended during handovers.
    ///
    /// The default value is `true`.
    pub fn enable_handover(&mut self, v: bool) {
        self.handover = v;
    }

    /// Configures whether the handover timer alone toggles transmission.
    ///
    /// When enabled, acknowledgments no longer reconcile the congestion
    /// window with the handover schedule, and every timer expiration flips
    /// the transmission state.
    ///
    /// The default value is `false`.
    pub fn enable_handover_timer_only(&mut self, v: bool) {
        self.handover_timer_only = v;
    }

    /// Sets how long before and after the handover instant transmission is
    /// suspended.
    ///
    /// Both offsets are clamped to [`MAX_HANDOVER_OFFSET`]. The default value
    /// is 200 milliseconds for both.
    pub fn set_handover_offsets(&mut self, start: Duration, end: Duration) {
        self.handover_start = start.min(MAX_HANDOVER_OFFSET);
        self.handover_end = end.min(MAX_HANDOVER_OFFSET);
    }

    /// Configures whether to enable fast convergence.
    ///
    /// The default value is `true`.
    pub fn enable_fast_convergence(&mut self, v: bool) {
        self.fast_convergence = v;
    }

    /// Sets the multiplicative decrease factor, in 1/1024 units.
    ///
    /// The default value is `717`. Valid values are in `1..1024`.
    pub fn set_beta(&mut self, v: u32) {
        self.beta = v;
    }

    /// Sets the initial slow start threshold, used when HyStart is disabled.
    ///
    /// The default value is `None`, which keeps the host's threshold.
    pub fn set_initial_ssthresh(&mut self, v: Option<u32>) {
        self.initial_ssthresh = v;
    }

    /// Sets the scale of the cubic function, in 1/1024 units.
    ///
    /// The default value is `41`. It must not be zero.
    pub fn set_bic_scale(&mut self, v: u32) {
        self.bic_scale = v;
    }

    /// Configures whether the window grows at least as fast as Reno's.
    ///
    /// The default value is `true`.
    pub fn enable_tcp_friendliness(&mut self, v: bool) {
        self.tcp_friendliness = v;
    }

    /// Configures whether to enable HyStart.
    ///
    /// The default value is `true`.
    pub fn enable_hystart(&mut self, v: bool) {
        self.hystart = v;
    }

    /// Sets the HyStart exit detection methods.
    ///
    /// The value is a mask of [`HYSTART_ACK_TRAIN`] and [`HYSTART_DELAY`].
    /// The default value is both.
    pub fn set_hystart_detect(&mut self, v: u8) {
        self.hystart_detect = v;
    }

    /// Sets the smallest window, in packets, at which HyStart is applied.
    ///
    /// The default value is `16`.
    pub fn set_hystart_low_window(&mut self, v: u32) {
        self.hystart_low_window = v;
    }

    /// Sets the largest spacing between two ACKs of the same ACK train.
    ///
    /// The default value is 2 milliseconds.
    pub fn set_hystart_ack_delta(&mut self, v: Duration) {
        self.hystart_ack_delta = v;
    }
}

pub mod clock;
mod congestion;
mod error;
mod handover;
mod sock;

#[doc(hidden)]
pub mod testing;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = Config::new();

        assert_eq!(config.cc_algorithm, CongestionControlAlgorithm::CUBIC);
        assert!(config.handover);
        assert!(!config.handover_timer_only);
        assert_eq!(config.handover_start, Duration::from_millis(200));
        assert_eq!(config.handover_end, Duration::from_millis(200));
        assert_eq!(config.beta, 717);
        assert_eq!(config.bic_scale, 41);
        assert_eq!(config.hystart_detect, 3);
        assert_eq!(config.hystart_low_window, 16);
        assert_eq!(config.hystart_ack_delta, Duration::from_micros(2000));
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn config_algorithm_name() {
        let mut config = Config::new();

        assert_eq!(config.set_cc_algorithm_name("reno"), Ok(()));
        assert_eq!(config.cc_algorithm, CongestionControlAlgorithm::Reno);

        assert_eq!(
            config.set_cc_algorithm_name("bbr"),
            Err(Error::CongestionControl)
        );
        assert_eq!(config.cc_algorithm, CongestionControlAlgorithm::Reno);
    }

    #[test]
    fn config_offsets_clamped() {
        let mut config = Config::new();
        config.set_handover_offsets(
            Duration::from_millis(50),
            Duration::from_millis(1500),
        );

        assert_eq!(config.handover_start, Duration::from_millis(50));
        assert_eq!(config.handover_end, MAX_HANDOVER_OFFSET);
    }

    #[test]
    fn config_validate() {
        let mut config = Config::new();

        config.set_beta(1024);
        assert_eq!(config.validate(), Err(Error::InvalidConfig("beta")));

        config.set_beta(0);
        assert_eq!(config.validate(), Err(Error::InvalidConfig("beta")));

        config.set_beta(512);
        config.set_bic_scale(0);
        assert_eq!(config.validate(), Err(Error::InvalidConfig("bic_scale")));

        config.set_bic_scale(41);
        config.set_hystart_detect(4);
        assert_eq!(
            config.validate(),
            Err(Error::InvalidConfig("hystart_detect"))
        );

        config.set_hystart_detect(HYSTART_DELAY);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn config_from_json() {
        let config: Config = serde_json::from_str(
            r#"{
                "cc_algorithm": "reno",
                "debug": true,
                "handover_start_ms": 150,
                "handover_end_ms": 300,
                "initial_ssthresh": 64,
                "hystart_ack_delta_us": 1500
            }"#,
        )
        .unwrap();

        assert_eq!(config.cc_algorithm, CongestionControlAlgorithm::Reno);
        assert!(config.debug);
        assert_eq!(config.handover_start, Duration::from_millis(150));
        assert_eq!(config.handover_end, Duration::from_millis(300));
        assert_eq!(config.initial_ssthresh, Some(64));
        assert_eq!(config.hystart_ack_delta, Duration::from_micros(1500));

        // Everything else keeps its default.
        assert!(config.handover);
        assert_eq!(config.beta, 717);
    }

    #[test]
    fn config_json_roundtrip() {
        let mut config = Config::new();
        config.enable_handover_timer_only(true);
        config.set_beta(600);

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(r#""handover_start_ms":200"#));
        assert!(json.contains(r#""cc_algorithm":"cubic""#));

        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn config_rejects_unknown_algorithm() {
        let res = serde_json::from_str::<Config>(r#"{"cc_algorithm":"vegas"}"#);
        assert!(res.is_err());
    }
}
