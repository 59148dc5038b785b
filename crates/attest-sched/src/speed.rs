//! Hash-speed calibration used to turn payload sizes into time estimates.

use std::time::Duration;

/// Weight given to the newest measurement
const SMOOTHING: f64 = 0.3;

/// Exponentially weighted payload bytes per millisecond.
#[derive(Debug, Clone)]
pub struct HashSpeed {
    bytes_per_ms: f64,
    measured: bool,
}

impl HashSpeed {
    /// Start from an assumed speed until the first measurement arrives.
    pub fn new(default_bytes_per_ms: u64) -> Self {
        HashSpeed {
            bytes_per_ms: default_bytes_per_ms.max(1) as f64,
            measured: false,
        }
    }

    pub fn bytes_per_ms(&self) -> f64 {
        self.bytes_per_ms
    }

    pub fn is_measured(&self) -> bool {
        self.measured
    }

    /// Fold in one finished job. Runs shorter than a millisecond carry no signal.
    pub fn record(&mut self, bytes: u64, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        if bytes == 0 || ms < 1.0 {
            return;
        }
        let sample = bytes as f64 / ms;
        self.bytes_per_ms = if self.measured {
            self.bytes_per_ms * (1.0 - SMOOTHING) + sample * SMOOTHING
        } else {
            sample
        };
        self.measured = true;
    }

    /// Unpadded time to hash `bytes` at the current speed.
    pub fn duration_for(&self, bytes: u64) -> Duration {
        let ms = (bytes as f64 / self.bytes_per_ms).ceil();
        Duration::from_millis(ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_speed_until_measured() {
        let speed = HashSpeed::new(250);
        assert!(!speed.is_measured());
        assert_eq!(speed.duration_for(1000), Duration::from_millis(4));
        assert_eq!(speed.duration_for(1001), Duration::from_millis(5));
    }

    #[test]
    fn first_sample_replaces_default_then_smooths() {
        let mut speed = HashSpeed::new(250);
        speed.record(10_000, Duration::from_millis(10));
        assert_eq!(speed.bytes_per_ms(), 1000.0);

        speed.record(5_000, Duration::from_millis(10));
        assert!((speed.bytes_per_ms() - 850.0).abs() < 1e-9);
    }

    #[test]
    fn ignores_sub_millisecond_runs() {
        let mut speed = HashSpeed::new(100);
        speed.record(1_000_000, Duration::from_micros(200));
        speed.record(0, Duration::from_secs(1));
        assert!(!speed.is_measured());
        assert_eq!(speed.bytes_per_ms(), 100.0);
    }
}
