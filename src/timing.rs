//! Named wall-clock timers.
//!
//! An explicit value owned by the caller; no global state. Starting an
//! already-running timer restarts it, stopping adds the elapsed time to the
//! cumulative total.

use std::collections::HashMap;
use std::time::Instant;

use ahash::RandomState;
use log::info;

#[derive(Default)]
pub struct Timers {
    total: HashMap<String, f64, RandomState>,
    running: HashMap<String, Instant, RandomState>,
}

impl Timers {
    pub fn new() -> Self {
        Timers::default()
    }

    /// Start (or restart) a named timer.
    pub fn start(&mut self, name: &str) {
        self.running.insert(name.to_string(), Instant::now());
    }

    /// Stop a named timer and accumulate its elapsed seconds.
    pub fn stop(&mut self, name: &str) {
        if let Some(t0) = self.running.remove(name) {
            *self.total.entry(name.to_string()).or_insert(0.0) += t0.elapsed().as_secs_f64();
        }
    }

    /// Cumulative seconds of a timer.
    pub fn seconds(&self, name: &str) -> f64 {
        self.total.get(name).copied().unwrap_or(0.0)
    }

    /// Log all cumulative timings.
    pub fn report(&self) {
        let mut names: Vec<&String> = self.total.keys().collect();
        names.sort();
        for name in names {
            info!("Timer {name}: {:.3} s", self.total[name]);
        }
    }
}

#[cfg(test)]
mod timing_test {
    use super::*;

    #[test]
    fn accumulates_across_runs() {
        let mut timers = Timers::new();
        timers.start("work");
        timers.stop("work");
        let first = timers.seconds("work");
        timers.start("work");
        timers.stop("work");
        assert!(timers.seconds("work") >= first);
        assert_eq!(timers.seconds("unknown"), 0.0);
    }

    #[test]
    fn stop_without_start_is_harmless() {
        let mut timers = Timers::new();
        timers.stop("nothing");
        assert_eq!(timers.seconds("nothing"), 0.0);
    }
}
