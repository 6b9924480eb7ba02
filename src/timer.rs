//! Tick-driven timers.
//!
//! Modeled as counters advanced by an external `tick()`, never by
//! `tokio::time` sleeps — this is what makes the core deterministically
//! testable. Deadlines are tick counts, not `Instant`s.

use rand::Rng;

/// Drives the election and heartbeat timers from an external `tick()`.
#[derive(Debug, Clone)]
pub struct Ticker {
    base_election_timeout: u64,
    heartbeat_interval: u64,
    election_ticks: u64,
    election_deadline: u64,
    heartbeat_ticks: u64,
}

impl Ticker {
    pub fn new(base_election_timeout: u64, heartbeat_interval: u64) -> Self {
        let mut t = Self {
            base_election_timeout,
            heartbeat_interval,
            election_ticks: 0,
            election_deadline: base_election_timeout,
            heartbeat_ticks: 0,
        };
        t.reset_election();
        t
    }

    /// Advance both counters by one tick. Returns `(election_fired, heartbeat_fired)`.
    pub fn tick(&mut self) -> (bool, bool) {
        self.election_ticks += 1;
        self.heartbeat_ticks += 1;

        let election_fired = self.election_ticks >= self.election_deadline;
        let heartbeat_fired = self.heartbeat_ticks >= self.heartbeat_interval;

        if heartbeat_fired {
            self.heartbeat_ticks = 0;
        }
        // Caller resets the election deadline explicitly via `reset_election`
        // once it has acted on the firing (e.g. started an election), mirroring
        // the rule that the timer resets on specific events, not just on tick.
        (election_fired, heartbeat_fired)
    }

    /// Reset the election timer with a freshly randomized deadline, uniform
    /// in `[E, 2E)` ticks, as required on every reset.
    pub fn reset_election(&mut self) {
        self.election_ticks = 0;
        self.election_deadline = if self.base_election_timeout == 0 {
            1
        } else {
            rand::thread_rng().gen_range(self.base_election_timeout..(2 * self.base_election_timeout))
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn election_deadline_is_in_range() {
        for _ in 0..200 {
            let t = Ticker::new(5, 1);
            assert!(t.election_deadline >= 5 && t.election_deadline < 10);
        }
    }

    #[test]
    fn heartbeat_fires_every_interval() {
        let mut t = Ticker::new(100, 3);
        let (_, h1) = t.tick();
        let (_, h2) = t.tick();
        let (_, h3) = t.tick();
        assert!(!h1 && !h2 && h3);
    }

    #[test]
    fn election_fires_once_deadline_reached() {
        let mut t = Ticker::new(2, 100);
        t.election_deadline = 2;
        let (f1, _) = t.tick();
        let (f2, _) = t.tick();
        assert!(!f1);
        assert!(f2);
    }
}
