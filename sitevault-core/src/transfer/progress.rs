//! Transfer rate measurement and human-readable formatting.

use std::time::Instant;

/// Throughput between consecutive samples of one transfer.
#[derive(Debug, Clone)]
pub struct RateMeter {
    total: u64,
    sampled_at: Instant,
    done: u64,
    rate: u64,
}

impl RateMeter {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            sampled_at: Instant::now(),
            done: 0,
            rate: 0,
        }
    }

    /// Feed the cumulative byte count; returns bytes per second since the
    /// previous sample.
    pub fn record(&mut self, done: u64) -> u64 {
        let now = Instant::now();
        let secs = now.duration_since(self.sampled_at).as_secs_f64();
        if secs > 0.0 {
            self.rate = (done.saturating_sub(self.done) as f64 / secs) as u64;
        }
        self.sampled_at = now;
        self.done = done;
        self.rate
    }

    /// Seconds left at the last measured rate.
    pub fn eta_secs(&self) -> Option<u64> {
        (self.rate > 0).then(|| self.total.saturating_sub(self.done) / self.rate)
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

pub fn format_duration(secs: u64) -> String {
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m {}s", secs / 60, secs % 60),
        _ => format!("{}h {}m", secs / 3600, secs % 3600 / 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_rate_meter() {
        let mut meter = RateMeter::new(1000);
        assert_eq!(meter.eta_secs(), None);

        meter.record(100);
        thread::sleep(Duration::from_millis(50));
        assert!(meter.record(500) > 0);
        assert!(meter.eta_secs().is_some());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(16 * 1024 * 1024), "16.00 MB");
    }

    #[test]
    fn test_format_speed_and_duration() {
        assert_eq!(format_speed(1024 * 1024), "1.00 MB/s");
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3665), "1h 1m");
    }
}
