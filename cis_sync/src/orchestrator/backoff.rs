use std::time::Duration;

/// Inter-cycle delay: doubles per failed cycle up to `max`, resets on success.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
    consecutive_failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
            consecutive_failures: 0,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn on_success(&mut self) -> Duration {
        self.consecutive_failures = 0;
        self.current = self.base;
        self.current
    }

    pub fn on_failure(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.current = self.current.saturating_mul(2).min(self.max);
        self.current
    }

    pub fn reset(&mut self) {
        self.on_success();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped_then_resets() {
        let mut b = Backoff::new(Duration::from_secs(30), Duration::from_secs(100));
        assert_eq!(b.on_failure(), Duration::from_secs(60));
        assert_eq!(b.on_failure(), Duration::from_secs(100));
        assert_eq!(b.on_failure(), Duration::from_secs(100));
        assert_eq!(b.consecutive_failures(), 3);
        assert_eq!(b.on_success(), Duration::from_secs(30));
        assert_eq!(b.consecutive_failures(), 0);
    }
}
