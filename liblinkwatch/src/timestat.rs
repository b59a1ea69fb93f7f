use liblinkwatch_tools::Duration;
use serde::Serialize;

/// Sliding-window rate estimator (frames or bytes per second)
///
/// The window is split in fixed-width buckets; samples older than the window
/// are dropped as the window slides forward.
#[derive(Clone, Debug, Serialize)]
pub struct TimeStat {
    #[serde(skip)]
    bucket_us: u64,
    #[serde(skip)]
    buckets: Vec<u64>,
    #[serde(skip)]
    first: u64,
    #[serde(skip)]
    last: Option<u64>,
    pub total: u64,
    /// Largest per-second rate observed so far
    pub peak: f64,
}

impl Default for TimeStat {
    fn default() -> Self {
        // 10 x 100ms
        TimeStat::new(100_000, 10)
    }
}

impl TimeStat {
    pub fn new(bucket_us: u64, nbuckets: usize) -> Self {
        TimeStat {
            bucket_us: std::cmp::max(bucket_us, 1),
            buckets: vec![0; std::cmp::max(nbuckets, 1)],
            first: 0,
            last: None,
            total: 0,
            peak: 0.0,
        }
    }

    /// Account `n` units at time `ts`. Samples older than the window are counted
    /// in the total only.
    pub fn inc(&mut self, ts: Duration, n: u64) {
        let idx = ts.as_micros() / self.bucket_us;
        let nb = self.buckets.len() as u64;
        self.total += n;
        let last = match self.last {
            None => {
                self.first = idx;
                self.last = Some(idx);
                idx
            }
            Some(last) => last,
        };
        if idx > last {
            let stale = std::cmp::min(idx - last, nb);
            for i in 1..=stale {
                let slot = ((last + i) % nb) as usize;
                self.buckets[slot] = 0;
            }
            self.last = Some(idx);
            if idx - self.first >= nb {
                self.first = idx + 1 - nb;
            }
        } else if last - idx >= nb {
            return;
        }
        let slot = (idx % nb) as usize;
        self.buckets[slot] += n;
        let rate = self.rate();
        if rate > self.peak {
            self.peak = rate;
        }
    }

    /// Rate per second over the valid part of the window
    pub fn rate(&self) -> f64 {
        let last = match self.last {
            Some(l) => l,
            None => return 0.0,
        };
        let valid = last - self.first + 1;
        let sum: u64 = self.buckets.iter().sum();
        let span_us = valid * self.bucket_us;
        sum as f64 * 1_000_000.0 / span_us as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestat_rate() {
        let mut ts = TimeStat::new(100_000, 10);
        for i in 0..10 {
            ts.inc(Duration::new(5, i * 100_000), 10);
        }
        assert_eq!(ts.total, 100);
        assert!((ts.rate() - 100.0).abs() < 1e-6);
    }

    #[test]
    fn timestat_window_slides() {
        let mut ts = TimeStat::new(100_000, 10);
        ts.inc(Duration::new(1, 0), 50);
        ts.inc(Duration::new(10, 0), 1);
        // old bucket was dropped, one sample over a full window
        assert!((ts.rate() - 1.0).abs() < 1e-6);
        assert_eq!(ts.total, 51);
        // too old to land in the window
        ts.inc(Duration::new(2, 0), 7);
        assert!((ts.rate() - 1.0).abs() < 1e-6);
    }
}
