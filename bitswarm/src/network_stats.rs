use std::time::{Duration, Instant};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct NetworkStats {
    pub download: u64,
    pub download_rate: u32,
}

/// Byte counter that reports the rate observed over the last complete period.
#[derive(Debug, Clone)]
pub struct RateMeter {
    total: u64,
    rate: u32,
    accum: u64,
    period_start: Instant,
    period: Duration,
}

impl RateMeter {
    pub fn new(period: Duration) -> Self {
        Self::new_at(period, Instant::now())
    }

    pub fn new_at(period: Duration, now: Instant) -> Self {
        assert!(!period.is_zero(), "rate period must not be zero");
        Self {
            total: 0,
            rate: 0,
            accum: 0,
            period_start: now,
            period,
        }
    }

    pub fn record(&mut self, num_bytes: u32) {
        self.record_at(Instant::now(), num_bytes);
    }

    pub fn record_at(&mut self, now: Instant, num_bytes: u32) {
        self.roll(now);
        self.total += u64::from(num_bytes);
        self.accum += u64::from(num_bytes);
    }

    /// rate in bytes/sec
    pub fn rate(&self) -> u32 {
        self.rate_at(Instant::now())
    }

    pub fn rate_at(&self, now: Instant) -> u32 {
        // nothing recorded for a whole period means the stored rate is stale
        if now.saturating_duration_since(self.period_start) >= self.period * 2 {
            0
        } else {
            self.rate
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    fn roll(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.period_start);
        if elapsed < self.period {
            return;
        }
        self.rate = if elapsed >= self.period * 2 {
            0
        } else {
            (self.accum as f64 / self.period.as_secs_f64()) as u32
        };
        self.accum = 0;
        self.period_start = now;
    }
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new(Duration::from_secs_f64(1.5))
    }
}

/// Bytes stored from block requests across a whole torrent.
#[derive(Debug, Default, Clone)]
pub struct NetworkStatsAccum {
    download: RateMeter,
}

impl NetworkStatsAccum {
    pub fn add_download(&mut self, num_bytes: u32) {
        self.download.record(num_bytes);
    }

    pub fn download_rate(&self) -> u32 {
        self.download.rate()
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            download: self.download.total(),
            download_rate: self.download_rate(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rate_over_one_period() {
        let start = Instant::now();
        let period = Duration::from_secs(2);
        let mut meter = RateMeter::new_at(period, start);
        meter.record_at(start, 1000);
        meter.record_at(start + Duration::from_millis(500), 3000);
        assert_eq!(meter.rate_at(start + Duration::from_secs(1)), 0);

        meter.record_at(start + Duration::from_secs(2), 10);
        assert_eq!(meter.rate_at(start + Duration::from_secs(2)), 2000);
        assert_eq!(meter.total(), 4010);
    }

    #[test]
    fn idle_meter_decays_to_zero() {
        let start = Instant::now();
        let period = Duration::from_secs(1);
        let mut meter = RateMeter::new_at(period, start);
        meter.record_at(start, 500);
        meter.record_at(start + Duration::from_secs(1), 0);
        assert_eq!(meter.rate_at(start + Duration::from_secs(1)), 500);
        assert_eq!(meter.rate_at(start + Duration::from_secs(3)), 0);

        meter.record_at(start + Duration::from_secs(10), 100);
        assert_eq!(meter.rate_at(start + Duration::from_secs(10)), 0);
    }
}
