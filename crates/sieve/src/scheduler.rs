//! Adaptive control of the I/O preparation threads. A penalty signal (time
//! the manager spent waiting for a batch) is forecast with Holt's double
//! exponential smoothing; the forecast drives grow/shrink decisions within
//! `[1, max_threads]`.

use std::time::{Duration, Instant};

/// Smoothing weight on the newest observation.
const ALPHA: f64 = 0.5;

/// Smoothing weight on the trend term.
const GAMMA: f64 = 0.8;

/// Sleep applied by polling loops when there is nothing to do.
pub const IDLE_SLEEP: Duration = Duration::from_millis(10);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Spawn one more preparation thread
    Grow,
    /// Retire one preparation thread
    Shrink,
    Hold,
}

#[derive(Debug)]
pub struct LaspScheduler {
    active: usize,
    max_threads: usize,

    /// Forecast penalty above which a thread is retired
    pub max_penalty: f64,
    /// Forecast penalty below which growth is considered
    pub min_rate: f64,
    /// Minimum latency between consecutive grow decisions
    pub wait_since_last: Duration,

    level: f64,
    trend: f64,
    samples: u64,
    last_change: Instant,
}

impl LaspScheduler {
    pub fn new(max_threads: usize) -> Self {
        Self {
            active: 1,
            max_threads: max_threads.max(1),
            max_penalty: 2.0,
            min_rate: 0.5,
            wait_since_last: Duration::from_secs(2),
            level: 0.0,
            trend: 0.0,
            samples: 0,
            last_change: Instant::now(),
        }
    }

    pub fn active_threads(&self) -> usize {
        self.active
    }

    /// Update the smoothed level and trend with observation `yt` and
    /// return the one-step-ahead forecast `F_{t+1} = S_t + b_t`.
    pub fn forecast(&mut self, yt: f64) -> f64 {
        if self.samples == 0 {
            self.level = yt;
            self.trend = 0.0;
        } else {
            let prev = self.level;
            self.level = ALPHA * yt + (1.0 - ALPHA) * (prev + self.trend);
            self.trend = GAMMA * (self.level - prev) + (1.0 - GAMMA) * self.trend;
        }
        self.samples += 1;
        self.level + self.trend
    }

    /// Feed one penalty observation and decide whether the preparation
    /// pool should change size. Never preempts below one thread.
    pub fn observe(&mut self, yt: f64) -> Decision {
        let forecast = self.forecast(yt);

        if forecast > self.max_penalty && self.active > 1 {
            self.active -= 1;
            self.last_change = Instant::now();
            return Decision::Shrink;
        }
        if forecast < self.min_rate
            && self.active < self.max_threads
            && self.last_change.elapsed() >= self.wait_since_last
        {
            self.active += 1;
            self.last_change = Instant::now();
            return Decision::Grow;
        }
        Decision::Hold
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn forecast_tracks_trend() {
        let mut lasp = LaspScheduler::new(4);
        // Steady ramp: the forecast should overshoot the latest value
        let mut last = 0.0;
        for t in 0..20 {
            last = lasp.forecast(t as f64);
        }
        assert!(last > 19.0);
    }

    #[test]
    fn forecast_settles_on_constant_signal() {
        let mut lasp = LaspScheduler::new(4);
        let mut value = 0.0;
        for _ in 0..50 {
            value = lasp.forecast(3.0);
        }
        assert!((value - 3.0).abs() < 1e-6);
    }

    #[test]
    fn shrinks_under_penalty_but_not_below_one() {
        let mut lasp = LaspScheduler::new(4);
        lasp.wait_since_last = Duration::ZERO;

        // Grow twice on a quiet signal
        assert_eq!(lasp.observe(0.0), Decision::Grow);
        assert_eq!(lasp.observe(0.0), Decision::Grow);
        assert_eq!(lasp.active_threads(), 3);

        // Sustained penalty drains the pool down to one thread
        let mut shrinks = 0;
        for _ in 0..20 {
            if lasp.observe(100.0) == Decision::Shrink {
                shrinks += 1;
            }
        }
        assert_eq!(shrinks, 2);
        assert_eq!(lasp.active_threads(), 1);
    }

    #[test]
    fn growth_respects_latency_gate() {
        let mut lasp = LaspScheduler::new(4);
        lasp.wait_since_last = Duration::from_secs(3600);
        for _ in 0..10 {
            assert_eq!(lasp.observe(0.0), Decision::Hold);
        }
        assert_eq!(lasp.active_threads(), 1);
    }

    #[test]
    fn growth_is_bounded() {
        let mut lasp = LaspScheduler::new(2);
        lasp.wait_since_last = Duration::ZERO;
        for _ in 0..10 {
            lasp.observe(0.0);
        }
        assert_eq!(lasp.active_threads(), 2);
    }
}
