//! Token bucket that hands out whole admissions at a fractional rate.
//!
//! Allocation accrues with time and is drawn down by takes. The fractional
//! part of each take is carried into the next one, so the number of whole
//! admissions over any window tracks `rate * window` regardless of how often
//! the limiter is polled.

/// Nanoseconds in one second.
pub const NANOS_PER_SECOND: u64 = 1_000_000_000;

#[derive(Clone, Debug, PartialEq)]
pub struct AllocatingRateLimiter {
    /// Longest interval credited by a single tick or take.
    granularity: u64,
    allocation: f64,
    last_allocation: u64,
    /// Fractional admission left over from the previous take, in `[0, 1)`.
    carry: f64,
    last_take: u64,
}

impl AllocatingRateLimiter {
    #[must_use]
    pub const fn new(granularity_nanos: u64) -> Self {
        Self {
            granularity: granularity_nanos,
            allocation: 0.0,
            last_allocation: 0,
            carry: 0.0,
            last_take: 0,
        }
    }

    /// Drop all allocation and restart the clocks at `now`.
    pub fn reset(&mut self, now: u64) {
        self.allocation = 0.0;
        self.last_allocation = now;
        self.carry = 0.0;
        self.last_take = now;
    }

    #[must_use]
    pub const fn allocation(&self) -> f64 {
        self.allocation
    }

    fn elapsed_seconds(&self, since: u64, now: u64) -> f64 {
        now.saturating_sub(since).min(self.granularity) as f64 * 1.0e-9
    }

    /// Accrue `rate` per second since the last tick, up to `max_allocation`.
    pub fn tick_allocation(&mut self, now: u64, rate: f64, max_allocation: f64) {
        let elapsed = self.elapsed_seconds(self.last_allocation, now);
        self.last_allocation = now;
        self.allocation = (max_allocation - self.carry).min(self.allocation + rate * elapsed);
    }

    fn available(&self, now: u64, rate: f64, max_take: u64) -> f64 {
        let elapsed = self.elapsed_seconds(self.last_take, now);
        (max_take as f64 - self.carry)
            .min(self.allocation)
            .min(rate * elapsed)
    }

    /// Whole admissions [`AllocatingRateLimiter::take_allocation`] would grant
    /// right now, without taking them.
    #[must_use]
    pub fn preview_allocation(&self, now: u64, rate: f64, max_take: u64) -> u64 {
        if max_take == 0 {
            return 0;
        }
        (self.carry + self.available(now, rate, max_take)).floor() as u64
    }

    /// Take up to `max_take` whole admissions.
    pub fn take_allocation(&mut self, now: u64, rate: f64, max_take: u64) -> u64 {
        if max_take == 0 {
            return 0;
        }
        let take = self.available(now, rate, max_take);
        self.last_take = now;
        self.allocation -= take;

        let total = self.carry + take;
        let whole = total.floor();
        self.carry = total - whole;
        whole as u64
    }
}

impl Default for AllocatingRateLimiter {
    fn default() -> Self {
        Self::new(NANOS_PER_SECOND)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: u64 = NANOS_PER_SECOND / 20;

    #[test]
    fn test_starts_empty_after_reset() {
        let mut limiter = AllocatingRateLimiter::default();
        limiter.reset(5 * NANOS_PER_SECOND);
        assert_eq!(limiter.take_allocation(5 * NANOS_PER_SECOND, 100.0, 10), 0);
    }

    #[test]
    fn test_take_never_exceeds_rate_plus_one_tick() {
        let rate = 7.5;
        let mut limiter = AllocatingRateLimiter::default();
        limiter.reset(0);

        let mut taken = 0;
        let mut now = 0;
        for tick in 1..=400u64 {
            // uneven polling: 50ms mostly, occasionally a long stall
            now += if tick % 37 == 0 { 3 * TICK } else { TICK };
            limiter.tick_allocation(now, rate, rate);
            taken += limiter.take_allocation(now, rate, u64::MAX / 2);

            let window = now as f64 * 1.0e-9;
            let bound = rate * window + rate * (3 * TICK) as f64 * 1.0e-9;
            assert!(taken as f64 <= bound, "{taken} > {bound} after {tick} ticks");
        }
        assert!(taken > 0);
    }

    #[test]
    fn test_preview_does_not_consume() {
        let mut limiter = AllocatingRateLimiter::default();
        limiter.reset(0);
        limiter.tick_allocation(NANOS_PER_SECOND, 4.0, 4.0);

        let preview = limiter.preview_allocation(NANOS_PER_SECOND, 4.0, 10);
        assert_eq!(preview, 4);
        assert_eq!(limiter.preview_allocation(NANOS_PER_SECOND, 4.0, 10), preview);

        // take less than previewed; the rest stays allocated
        assert_eq!(limiter.take_allocation(NANOS_PER_SECOND, 4.0, 1), 1);
        assert!((limiter.allocation() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_two_per_second_at_twenty_hertz() {
        let mut limiter = AllocatingRateLimiter::default();
        limiter.reset(0);

        let mut per_tick = Vec::new();
        for tick in 1..=20 {
            let now = tick * TICK;
            limiter.tick_allocation(now, 2.0, 2.0);
            per_tick.push(limiter.take_allocation(now, 2.0, 5));
        }
        let total: u64 = per_tick.iter().sum();
        assert!((1..=2).contains(&total), "took {total}");
        assert!(per_tick.iter().all(|&n| n <= 1));
    }

    #[test]
    fn test_zero_max_take() {
        let mut limiter = AllocatingRateLimiter::default();
        limiter.reset(0);
        limiter.tick_allocation(NANOS_PER_SECOND, 10.0, 10.0);
        assert_eq!(limiter.preview_allocation(NANOS_PER_SECOND, 10.0, 0), 0);
        assert_eq!(limiter.take_allocation(NANOS_PER_SECOND, 10.0, 0), 0);
        assert!((limiter.allocation() - 10.0).abs() < 1e-9);
    }
}
