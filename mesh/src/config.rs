//! Tunable bounds and intervals for the peer group agent's tick loop, named per §4.7 rather
//! than left as magic numbers scattered through `agent.rs`.
use std::time::Duration;

/// Peer group membership bounds and timing, with the defaults the spec calls out.
#[derive(Clone, Debug)]
pub struct Config {
    /// Lower bound on `Ready` connections the agent tries to maintain.
    pub min_peers: usize,
    /// Upper bound on `Ready` connections the agent will accept.
    pub max_peers: usize,
    /// A non-`Ready` connection older than this is torn down.
    pub peer_connection_timeout: Duration,
    /// Minimum spacing between connection attempts to the same endpoint.
    pub peer_connection_attempt_interval: Duration,
    /// Minimum spacing between discovery rounds.
    pub peer_discovery_attempt_interval: Duration,
    /// Spacing between tick cycles.
    pub tick_interval: Duration,
    /// Capacity of the bounded online-query timestamp cache.
    pub online_query_cache_size: usize,
    /// Window, from agent start, during which discovery/connection intervals are boosted.
    pub bootstrap_window: Duration,
    /// Multiplier applied to the relevant intervals during `bootstrap_window`.
    pub bootstrap_boost: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_peers: 3,
            max_peers: 12,
            peer_connection_timeout: Duration::from_secs(20),
            peer_connection_attempt_interval: Duration::from_secs(10),
            peer_discovery_attempt_interval: Duration::from_secs(15),
            tick_interval: Duration::from_secs(30),
            online_query_cache_size: 128,
            bootstrap_window: Duration::from_secs(20),
            bootstrap_boost: 0.05,
        }
    }
}

impl Config {
    /// Sets the minimum and maximum `Ready`-connection bounds.
    pub fn with_peer_bounds(mut self, min_peers: usize, max_peers: usize) -> Self {
        self.min_peers = min_peers;
        self.max_peers = max_peers;
        self
    }

    /// Sets how long a non-`Ready` connection may live before it is torn down.
    pub fn with_peer_connection_timeout(mut self, timeout: Duration) -> Self {
        self.peer_connection_timeout = timeout;
        self
    }

    /// Sets the minimum spacing between connection attempts to the same endpoint.
    pub fn with_peer_connection_attempt_interval(mut self, interval: Duration) -> Self {
        self.peer_connection_attempt_interval = interval;
        self
    }

    /// Sets the minimum spacing between discovery rounds.
    pub fn with_peer_discovery_attempt_interval(mut self, interval: Duration) -> Self {
        self.peer_discovery_attempt_interval = interval;
        self
    }

    /// Sets the tick cycle spacing.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// The discovery interval, boosted while still inside the bootstrap window and below
    /// `min_peers`.
    pub fn effective_discovery_interval(&self, since_start: Duration, below_min: bool) -> Duration {
        if below_min && since_start < self.bootstrap_window {
            self.peer_discovery_attempt_interval.mul_f64(self.bootstrap_boost)
        } else {
            self.peer_discovery_attempt_interval
        }
    }

    /// The connection-attempt interval, boosted under the same condition as discovery.
    pub fn effective_connection_attempt_interval(&self, since_start: Duration, below_min: bool) -> Duration {
        if below_min && since_start < self.bootstrap_window {
            self.peer_connection_attempt_interval.mul_f64(self.bootstrap_boost)
        } else {
            self.peer_connection_attempt_interval
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_numbers() {
        let config = Config::default();
        assert_eq!(config.min_peers, 3);
        assert_eq!(config.max_peers, 12);
        assert_eq!(config.peer_connection_timeout, Duration::from_secs(20));
        assert_eq!(config.tick_interval, Duration::from_secs(30));
    }

    #[test]
    fn bootstrap_window_boosts_discovery_interval_only_while_below_min() {
        let config = Config::default();
        let boosted = config.effective_discovery_interval(Duration::from_secs(1), true);
        let normal = config.effective_discovery_interval(Duration::from_secs(1), false);
        assert!(boosted < normal);
        let past_window = config.effective_discovery_interval(Duration::from_secs(30), true);
        assert_eq!(past_window, config.peer_discovery_attempt_interval);
    }
}
