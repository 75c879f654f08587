//! Circuit breaker guarding the external source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::BreakerConfig;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    trial_in_flight: bool,
}

impl Inner {
    fn closed() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            last_error: None,
            trial_in_flight: false,
        }
    }

    fn open(&mut self, now: DateTime<Utc>) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.trial_in_flight = false;
    }
}

/// closed -> open after `failure_threshold` consecutive failures; open ->
/// half-open after `cooldown`; half-open admits a single trial call whose outcome
/// closes or re-opens the breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(cfg: &BreakerConfig) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold.max(1),
            cooldown: cfg.cooldown,
            inner: Mutex::new(Inner::closed()),
        }
    }

    pub async fn try_acquire(&self) -> Result<()> {
        self.try_acquire_at(Utc::now()).await
    }

    /// Admit or reject a call. Rejections never reach the source.
    pub async fn try_acquire_at(&self, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = (now - opened_at).to_std().unwrap_or_default();
                if elapsed >= self.cooldown {
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    tracing::info!("circuit breaker half-open, admitting trial call");
                    Ok(())
                } else {
                    let remaining = self.cooldown - elapsed;
                    Err(Error::CircuitOpen {
                        retry_after_ms: remaining.as_millis() as u64,
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(Error::CircuitOpen { retry_after_ms: 0 })
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != BreakerState::Closed {
            tracing::info!("circuit breaker closed");
        }
        *inner = Inner::closed();
    }

    pub async fn record_failure(&self, error: &str) {
        self.record_failure_at(Utc::now(), error).await
    }

    pub async fn record_failure_at(&self, now: DateTime<Utc>, error: &str) {
        let mut inner = self.inner.lock().await;
        inner.last_error = Some(error.to_string());
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        match inner.state {
            BreakerState::HalfOpen => {
                inner.open(now);
                tracing::warn!(error, "circuit breaker trial call failed, re-opened");
            }
            BreakerState::Closed if inner.consecutive_failures >= self.failure_threshold => {
                inner.open(now);
                tracing::warn!(
                    failures = inner.consecutive_failures,
                    error,
                    "circuit breaker opened"
                );
            }
            _ => {}
        }
    }

    /// Open immediately regardless of the failure count.
    pub async fn trip_at(&self, now: DateTime<Utc>, reason: &str) {
        let mut inner = self.inner.lock().await;
        inner.last_error = Some(reason.to_string());
        inner.consecutive_failures = inner.consecutive_failures.max(self.failure_threshold);
        inner.open(now);
    }

    pub async fn trip(&self, reason: &str) {
        self.trip_at(Utc::now(), reason).await
    }

    /// Hand back a half-open trial call whose call failed for a reason that says
    /// nothing about the source's health.
    pub async fn release_trial(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == BreakerState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    pub async fn reset(&self) {
        *self.inner.lock().await = Inner::closed();
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().await;
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at,
            last_error: inner.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(&BreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_secs(60),
        })
    }

    #[tokio::test]
    async fn opens_after_exactly_threshold_failures() {
        let b = breaker(3);
        let t0 = Utc::now();
        for i in 0..2 {
            b.try_acquire_at(t0).await.unwrap();
            b.record_failure_at(t0, "boom").await;
            assert_eq!(b.snapshot().await.state, BreakerState::Closed, "after {}", i + 1);
        }
        b.try_acquire_at(t0).await.unwrap();
        b.record_failure_at(t0, "boom").await;
        let snap = b.snapshot().await;
        assert_eq!(snap.state, BreakerState::Open);
        assert_eq!(snap.consecutive_failures, 3);
        assert_eq!(snap.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn rejects_during_cooldown_with_retry_after() {
        let b = breaker(1);
        let t0 = Utc::now();
        b.record_failure_at(t0, "down").await;
        match b.try_acquire_at(t0 + ChronoDuration::seconds(20)).await {
            Err(Error::CircuitOpen { retry_after_ms }) => assert_eq!(retry_after_ms, 40_000),
            other => panic!("expected open, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn admits_exactly_one_trial_after_cooldown() {
        let b = breaker(1);
        let t0 = Utc::now();
        b.record_failure_at(t0, "down").await;
        let later = t0 + ChronoDuration::seconds(61);
        b.try_acquire_at(later).await.unwrap();
        assert_eq!(b.snapshot().await.state, BreakerState::HalfOpen);
        assert!(matches!(
            b.try_acquire_at(later).await,
            Err(Error::CircuitOpen { .. })
        ));
    }

    #[tokio::test]
    async fn successful_trial_closes_and_zeroes_counter() {
        let b = breaker(2);
        let t0 = Utc::now();
        b.record_failure_at(t0, "a").await;
        b.record_failure_at(t0, "b").await;
        b.try_acquire_at(t0 + ChronoDuration::seconds(60)).await.unwrap();
        b.record_success().await;
        let snap = b.snapshot().await;
        assert_eq!(snap.state, BreakerState::Closed);
        assert_eq!(snap.consecutive_failures, 0);
        b.try_acquire_at(t0 + ChronoDuration::seconds(60)).await.unwrap();
    }

    #[tokio::test]
    async fn failed_trial_reopens_with_fresh_cooldown() {
        let b = breaker(1);
        let t0 = Utc::now();
        b.record_failure_at(t0, "a").await;
        let t1 = t0 + ChronoDuration::seconds(61);
        b.try_acquire_at(t1).await.unwrap();
        b.record_failure_at(t1, "still down").await;
        assert_eq!(b.snapshot().await.state, BreakerState::Open);
        assert!(b.try_acquire_at(t1 + ChronoDuration::seconds(30)).await.is_err());
        b.try_acquire_at(t1 + ChronoDuration::seconds(60)).await.unwrap();
    }

    #[tokio::test]
    async fn trip_bypasses_threshold() {
        let b = breaker(5);
        let t0 = Utc::now();
        b.trip_at(t0, "auth").await;
        assert_eq!(b.snapshot().await.state, BreakerState::Open);
        assert!(b.try_acquire_at(t0).await.is_err());
    }

    #[tokio::test]
    async fn released_trial_can_be_retaken() {
        let b = breaker(1);
        let t0 = Utc::now();
        b.record_failure_at(t0, "a").await;
        let t1 = t0 + ChronoDuration::seconds(61);
        b.try_acquire_at(t1).await.unwrap();
        b.release_trial().await;
        b.try_acquire_at(t1).await.unwrap();
    }
}
