//! Update gating for forwarded progress values.

use std::time::{Duration, Instant};

use crate::config::OrchestratorConfig;

/// Divisor used to derive a minimum increment from a task's total.
const DEFAULT_INCREMENT_DIVISOR: f64 = 250.0;

/// Decides whether a value update is worth forwarding to observers.
///
/// An update passes when both the time since the last forwarded update and
/// the value delta reach their thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throttle {
    pub min_interval: Duration,
    /// Fixed minimum delta. `None` uses `floor(total / 250)`.
    pub min_increment: Option<f64>,
}

impl Throttle {
    pub fn new(min_interval: Duration, min_increment: Option<f64>) -> Self {
        Self {
            min_interval,
            min_increment,
        }
    }

    /// Minimum delta for a task with this total.
    pub fn increment_for(&self, total: f64) -> f64 {
        self.min_increment
            .unwrap_or_else(|| (total / DEFAULT_INCREMENT_DIVISOR).floor().max(0.0))
    }

    pub fn allows(
        &self,
        last_forwarded: Option<Instant>,
        last_value: f64,
        value: f64,
        total: f64,
        now: Instant,
    ) -> bool {
        let interval_ok = match last_forwarded {
            Some(at) => now.saturating_duration_since(at) >= self.min_interval,
            None => true,
        };
        interval_ok && value - last_value >= self.increment_for(total)
    }
}

impl From<&OrchestratorConfig> for Throttle {
    fn from(config: &OrchestratorConfig) -> Self {
        Self::new(config.max_update_frequency, config.min_update_increment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_update_passes_interval_gate() {
        let throttle = Throttle::new(Duration::from_secs(60), Some(0.0));
        assert!(throttle.allows(None, 0.0, 1.0, 10.0, Instant::now()));
    }

    #[test]
    fn too_soon_is_suppressed() {
        let throttle = Throttle::new(Duration::from_millis(20), Some(0.0));
        let last = Instant::now();
        assert!(!throttle.allows(Some(last), 0.0, 1.0, 10.0, last + Duration::from_millis(5)));
        assert!(throttle.allows(Some(last), 0.0, 1.0, 10.0, last + Duration::from_millis(20)));
    }

    #[test]
    fn derived_increment_from_total() {
        let throttle = Throttle::new(Duration::ZERO, None);
        assert_eq!(throttle.increment_for(1000.0), 4.0);
        assert_eq!(throttle.increment_for(100.0), 0.0);

        let now = Instant::now();
        assert!(!throttle.allows(None, 10.0, 13.0, 1000.0, now));
        assert!(throttle.allows(None, 10.0, 14.0, 1000.0, now));
    }

    #[test]
    fn regression_is_never_forwarded() {
        let throttle = Throttle::new(Duration::ZERO, Some(0.0));
        assert!(!throttle.allows(None, 5.0, 4.0, 10.0, Instant::now()));
        assert!(throttle.allows(None, 5.0, 5.0, 10.0, Instant::now()));
    }

    #[test]
    fn built_from_config() {
        let config = OrchestratorConfig::default();
        let throttle = Throttle::from(&config);
        assert_eq!(throttle.min_interval, Duration::from_millis(20));
        assert_eq!(throttle.min_increment, None);
    }
}
