//! Reconnection schedule for broker disconnects.

use std::time::Duration;

/// Reconnection tuning, mirrored from the broker client settings.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// First delay between reconnect attempts.
    pub retry_interval: Duration,
    /// Growth factor applied after each failed attempt.
    pub multiplier: f64,
    /// Cap on the delay.
    pub max_retry_interval: Duration,
    /// Number of attempts; -1 means retry forever.
    pub attempts: i64,
    /// How often the client checks the connection for liveness.
    pub failure_check_period: Duration,
    /// Idle TTL the broker applies to this client's connection.
    pub connection_ttl: Duration,
    /// Delay before session recovery after a reconnect.
    pub recovery_interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(2),
            multiplier: 2.0,
            max_retry_interval: Duration::from_secs(60),
            attempts: -1,
            failure_check_period: Duration::from_secs(30),
            connection_ttl: Duration::from_secs(60),
            recovery_interval: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// The delay sequence: exponential with `multiplier`, capped at
    /// `max_retry_interval`, bounded by `attempts` (-1 = unbounded).
    pub fn delays(&self) -> ReconnectSchedule {
        ReconnectSchedule {
            next: self.retry_interval,
            multiplier: self.multiplier.max(1.0),
            cap: self.max_retry_interval,
            remaining: self.attempts,
        }
    }
}

/// Iterator over the reconnect delays of a [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct ReconnectSchedule {
    next: Duration,
    multiplier: f64,
    cap: Duration,
    remaining: i64,
}

impl Iterator for ReconnectSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        if self.remaining > 0 {
            self.remaining -= 1;
        }
        let current = self.next;
        let grown = Duration::from_secs_f64(current.as_secs_f64() * self.multiplier);
        self.next = std::cmp::min(grown, self.cap);
        Some(current)
    }
}
