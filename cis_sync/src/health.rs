//! Sync health: a per-cycle quick check over fresh run records and a windowed
//! deep check over the persisted run log, with alerting deduplicated per
//! table and anomaly.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::events::{Alert, AlertPriority, AlertSink};
use crate::store::{SyncRunRecord, SyncStore};

/// Error-rate threshold for a high-priority issue.
pub const ERROR_RATE_HIGH: f64 = 0.2;
/// Error-rate threshold for a critical issue.
pub const ERROR_RATE_CRITICAL: f64 = 0.5;
/// Rows-found runs with an unmoved watermark needed to call a table stalled.
pub const STALLED_RUN_THRESHOLD: usize = 10;
pub const LATENCY_SPIKE_FACTOR: f64 = 2.0;
/// Prior runs required before a latency spike can be judged.
pub const LATENCY_MIN_PRIOR_RUNS: usize = 3;
/// Run-log window aggregated by the deep check, in seconds.
pub const DEEP_CHECK_WINDOW_SECS: i64 = 2 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    StalledWatermark,
    HighErrorRate,
    LatencySpike,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StalledWatermark => "stalled_watermark",
            Self::HighErrorRate => "high_error_rate",
            Self::LatencySpike => "latency_spike",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthIssue {
    pub table: String,
    pub anomaly: AnomalyKind,
    pub priority: AlertPriority,
    pub description: String,
    pub metric: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableHealth {
    pub recent_runs: usize,
    pub error_rate: f64,
    pub avg_duration_ms: i64,
    pub watermark_advancing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    pub issues: Vec<HealthIssue>,
    pub checked_at: DateTime<Utc>,
    pub tables: BTreeMap<String, TableHealth>,
}

impl HealthReport {
    fn empty(at: DateTime<Utc>) -> Self {
        Self {
            healthy: true,
            issues: Vec::new(),
            checked_at: at,
            tables: BTreeMap::new(),
        }
    }
}

fn error_rate_issue(table: &str, failed: i64, found: i64, scope: &str) -> Option<HealthIssue> {
    if found <= 0 {
        return None;
    }
    let rate = failed as f64 / found as f64;
    if rate <= ERROR_RATE_HIGH {
        return None;
    }
    let priority = if rate > ERROR_RATE_CRITICAL {
        AlertPriority::Critical
    } else {
        AlertPriority::High
    };
    Some(HealthIssue {
        table: table.to_string(),
        anomaly: AnomalyKind::HighErrorRate,
        priority,
        description: format!("{:.0}% failure rate ({failed}/{found} records) {scope}", rate * 100.0),
        metric: Some(rate),
    })
}

/// In-memory check over one cycle's run records. No I/O.
pub fn quick_check(runs: &[SyncRunRecord]) -> Vec<HealthIssue> {
    let mut issues = Vec::new();
    for r in runs {
        if let Some(issue) = error_rate_issue(&r.source_table, r.records_failed, r.records_found, "this cycle") {
            issues.push(issue);
        }
        if r.records_found > 0 && !r.watermark_moved() {
            issues.push(HealthIssue {
                table: r.source_table.clone(),
                anomaly: AnomalyKind::StalledWatermark,
                priority: AlertPriority::High,
                description: format!(
                    "watermark did not advance despite {} records found",
                    r.records_found
                ),
                metric: None,
            });
        }
    }
    issues
}

/// Anomalies for one table's runs, newest first.
fn table_health(table: &str, runs: &[&SyncRunRecord]) -> (TableHealth, Vec<HealthIssue>) {
    let mut issues = Vec::new();
    let found: i64 = runs.iter().map(|r| r.records_found).sum();
    let failed: i64 = runs.iter().map(|r| r.records_failed).sum();
    let error_rate = if found > 0 { failed as f64 / found as f64 } else { 0.0 };

    let stalled = runs
        .iter()
        .filter(|r| r.records_found > 0 && !r.watermark_moved())
        .count();
    let watermark_advancing = stalled < STALLED_RUN_THRESHOLD;
    if !watermark_advancing {
        issues.push(HealthIssue {
            table: table.to_string(),
            anomaly: AnomalyKind::StalledWatermark,
            priority: AlertPriority::High,
            description: format!("watermark not advancing for {stalled} runs despite records found"),
            metric: Some(stalled as f64),
        });
    }

    if let Some(issue) = error_rate_issue(table, failed, found, &format!("over {} recent runs", runs.len())) {
        issues.push(issue);
    }

    let durations: Vec<f64> = runs
        .iter()
        .map(|r| r.duration_ms as f64)
        .filter(|d| *d > 0.0)
        .collect();
    let avg_duration = if durations.is_empty() {
        0.0
    } else {
        durations.iter().sum::<f64>() / durations.len() as f64
    };
    if let Some((latest, prior)) = durations.split_first() {
        if prior.len() >= LATENCY_MIN_PRIOR_RUNS {
            let baseline = prior.iter().sum::<f64>() / prior.len() as f64;
            if baseline > 0.0 && *latest > baseline * LATENCY_SPIKE_FACTOR {
                issues.push(HealthIssue {
                    table: table.to_string(),
                    anomaly: AnomalyKind::LatencySpike,
                    priority: AlertPriority::Medium,
                    description: format!(
                        "latest run {latest:.0}ms vs {baseline:.0}ms baseline ({:.1}x)",
                        latest / baseline
                    ),
                    metric: Some(latest / baseline),
                });
            }
        }
    }

    let health = TableHealth {
        recent_runs: runs.len(),
        error_rate,
        avg_duration_ms: avg_duration.round() as i64,
        watermark_advancing,
    };
    (health, issues)
}

pub struct HealthMonitor {
    store: Arc<dyn SyncStore>,
    alerts: Arc<dyn AlertSink>,
    alert_window: Duration,
    last_alerted: DashMap<(String, AnomalyKind), DateTime<Utc>>,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn SyncStore>, alerts: Arc<dyn AlertSink>, alert_window: Duration) -> Self {
        Self {
            store,
            alerts,
            alert_window,
            last_alerted: DashMap::new(),
        }
    }

    /// Records the alert as sent when it is due.
    fn should_alert_at(&self, issue: &HealthIssue, now: DateTime<Utc>) -> bool {
        let key = (issue.table.clone(), issue.anomaly);
        if let Some(last) = self.last_alerted.get(&key) {
            let since = (now - *last).to_std().unwrap_or_default();
            if since < self.alert_window {
                return false;
            }
        }
        self.last_alerted.insert(key, now);
        true
    }

    pub fn clear_alert_state(&self) {
        self.last_alerted.clear();
    }

    pub async fn deep_check(&self) -> HealthReport {
        self.deep_check_at(Utc::now()).await
    }

    /// Aggregate the last two hours of runs per table and alert on anomalies.
    /// A failing run-log read yields an empty, healthy report.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn deep_check_at(&self, now: DateTime<Utc>) -> HealthReport {
        let runs = match self.store.runs_since(now - chrono::Duration::seconds(DEEP_CHECK_WINDOW_SECS)).await {
            Ok(runs) => runs,
            Err(e) => {
                tracing::warn!(error = %e, "sync health check failed");
                return HealthReport::empty(now);
            }
        };

        let mut by_table: BTreeMap<&str, Vec<&SyncRunRecord>> = BTreeMap::new();
        for r in runs.iter().rev() {
            by_table.entry(r.source_table.as_str()).or_default().push(r);
        }

        let mut report = HealthReport::empty(now);
        for (table, table_runs) in by_table {
            let (health, issues) = table_health(table, &table_runs);
            for issue in issues {
                if self.should_alert_at(&issue, now) {
                    self.fire_alert(&issue).await;
                }
                report.issues.push(issue);
            }
            report.tables.insert(table.to_string(), health);
        }
        report.healthy = report.issues.is_empty();
        report
    }

    async fn fire_alert(&self, issue: &HealthIssue) {
        let alert = Alert::system(
            issue.priority,
            "sync_health_monitor",
            format!("Sync health: {} on {}", issue.anomaly.as_str(), issue.table),
            issue.description.clone(),
            serde_json::json!({
                "table": issue.table,
                "anomaly": issue.anomaly,
                "metric": issue.metric,
            }),
        );
        if let Err(e) = self.alerts.create_alert(alert).await {
            tracing::warn!(table = %issue.table, anomaly = issue.anomaly.as_str(), error = %e, "failed to fire health alert");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::memory::MemoryAlertSink;
    use crate::store::MemorySyncStore;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_800_000_000 + secs, 0).single().unwrap()
    }

    fn run(table: &str, at: DateTime<Utc>, found: i64, failed: i64, moved: bool, ms: i64) -> SyncRunRecord {
        let mut r = SyncRunRecord::start(table, at, t(0));
        r.records_found = found;
        r.records_failed = failed;
        r.records_processed = found - failed;
        if moved {
            r.watermark_after = at;
        }
        r.finish(at + chrono::Duration::milliseconds(ms));
        r
    }

    #[test]
    fn quick_check_flags_error_rate_and_stall() {
        let issues = quick_check(&[
            run("users", t(1), 10, 6, true, 5),
            run("payments", t(1), 4, 0, false, 5),
            run("ratings", t(1), 10, 2, true, 5),
            run("bookings", t(1), 0, 0, false, 5),
        ]);
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].anomaly, AnomalyKind::HighErrorRate);
        assert_eq!(issues[0].priority, AlertPriority::Critical);
        assert_eq!(issues[1].table, "payments");
        assert_eq!(issues[1].anomaly, AnomalyKind::StalledWatermark);
    }

    #[tokio::test]
    async fn stalled_alert_fires_once_per_window() {
        let store = Arc::new(MemorySyncStore::new());
        let alerts = Arc::new(MemoryAlertSink::new());
        let monitor = HealthMonitor::new(store.clone(), alerts.clone(), Duration::from_secs(3600));
        for i in 0..10 {
            store.append_run(&run("users", t(i * 60), 5, 0, false, 10)).await.unwrap();
        }

        for minute in 0..5 {
            let report = monitor.deep_check_at(t(600 + minute * 60)).await;
            assert!(!report.healthy);
            assert!(!report.tables["users"].watermark_advancing);
        }
        assert_eq!(alerts.all_alerts().await.len(), 1);

        monitor.deep_check_at(t(600 + 3600)).await;
        assert_eq!(alerts.all_alerts().await.len(), 2);
    }

    #[tokio::test]
    async fn nine_stalled_runs_are_not_a_stall() {
        let store = Arc::new(MemorySyncStore::new());
        let alerts = Arc::new(MemoryAlertSink::new());
        let monitor = HealthMonitor::new(store.clone(), alerts.clone(), Duration::from_secs(3600));
        for i in 0..9 {
            store.append_run(&run("users", t(i), 5, 0, false, 10)).await.unwrap();
        }
        let report = monitor.deep_check_at(t(100)).await;
        assert!(report.healthy);
        assert!(alerts.all_alerts().await.is_empty());
    }

    #[tokio::test]
    async fn latency_spike_needs_three_prior_runs() {
        let store = Arc::new(MemorySyncStore::new());
        let monitor = HealthMonitor::new(
            store.clone(),
            Arc::new(MemoryAlertSink::new()),
            Duration::from_secs(3600),
        );
        store.append_run(&run("bookings", t(1), 0, 0, false, 100)).await.unwrap();
        store.append_run(&run("bookings", t(2), 0, 0, false, 100)).await.unwrap();
        store.append_run(&run("bookings", t(3), 0, 0, false, 500)).await.unwrap();
        assert!(monitor.deep_check_at(t(10)).await.healthy);

        store.append_run(&run("bookings", t(4), 0, 0, false, 900)).await.unwrap();
        let report = monitor.deep_check_at(t(10)).await;
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].anomaly, AnomalyKind::LatencySpike);
        assert_eq!(report.issues[0].priority, AlertPriority::Medium);
    }

    #[tokio::test]
    async fn unreadable_run_log_reports_healthy_and_stays_quiet() {
        let alerts = Arc::new(MemoryAlertSink::new());
        let monitor = HealthMonitor::new(
            Arc::new(crate::test_support::UnavailableStore),
            alerts.clone(),
            Duration::from_secs(3600),
        );
        let report = monitor.deep_check_at(t(10)).await;
        assert!(report.healthy);
        assert!(report.issues.is_empty());
        assert!(report.tables.is_empty());
        assert_eq!(report.checked_at, t(10));
        assert!(alerts.all_alerts().await.is_empty());
    }

    #[tokio::test]
    async fn runs_outside_window_are_ignored() {
        let store = Arc::new(MemorySyncStore::new());
        let monitor = HealthMonitor::new(
            store.clone(),
            Arc::new(MemoryAlertSink::new()),
            Duration::from_secs(3600),
        );
        store.append_run(&run("users", t(0), 10, 10, true, 5)).await.unwrap();
        let report = monitor.deep_check_at(t(3 * 3600)).await;
        assert!(report.healthy);
        assert!(report.tables.is_empty());
    }
}
