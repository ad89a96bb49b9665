use std::time::{Duration, Instant};

/// Retransmission deadline of a datagram handshake.
///
/// Mirrors the timer the crypto library keeps internally: starts at one
/// second, doubles on every expiry up to a ceiling, and restarts whenever the
/// handshake makes progress. Re-driving the handshake after the deadline is
/// what makes the library retransmit its last flight.
pub struct ExponentialBackoff {
    start_rto: Duration,
    max_rto: Duration,
    rto: Duration,
    armed_at: Option<Instant>,
}

impl ExponentialBackoff {
    pub fn new(start_rto: Duration, max_rto: Duration) -> Self {
        Self {
            start_rto,
            max_rto,
            rto: start_rto,
            armed_at: None,
        }
    }

    /// Start counting from `now` unless already running.
    pub fn arm(&mut self, now: Instant) {
        if self.armed_at.is_none() {
            self.armed_at = Some(now);
        }
    }

    /// Stop the timer and go back to the initial timeout.
    pub fn reset(&mut self) {
        self.rto = self.start_rto;
        self.armed_at = None;
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Time left until the deadline, `None` when not armed.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        let armed_at = self.armed_at?;
        Some((armed_at + self.rto).saturating_duration_since(now))
    }

    /// The deadline passed. Double the timeout and restart counting.
    pub fn attempt(&mut self, now: Instant) {
        self.rto = (self.rto * 2).min(self.max_rto);
        self.armed_at = Some(now);
    }
}
