use std::sync::Arc;

use chrono::Utc;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use super::dedup::DedupWindow;
use crate::config::{SyncConfig, WatermarkPolicy};
use crate::events::{AlertSink, EventBus};
use crate::external::{BreakerSnapshot, BreakerState, GuardedConnection};
use crate::health::{quick_check, HealthMonitor, HealthReport};
use crate::mappings::{MappingRegistry, TableMapping};
use crate::poller::{advance, CursorPosition, PollOutcome, Poller};
use crate::schema::SchemaValidator;
use crate::store::models::epoch;
use crate::store::{SyncRunRecord, SyncStore, Watermark, WatermarkAdvance};
use crate::{Error, Result};

/// Upper bound for `get_run_history`.
pub const MAX_RUN_HISTORY: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Primary,
    GapFill,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub enabled: bool,
    /// A cycle is in flight right now.
    pub running: bool,
    /// Sync is started: the first cycle or the periodic scheduler is active.
    pub scheduled: bool,
    pub mode: SyncMode,
    pub interval_ms: u64,
    pub current_delay_ms: u64,
    pub consecutive_cycle_failures: u32,
    pub driver: String,
    pub breaker: BreakerSnapshot,
    pub backfill_tables: Vec<String>,
    pub tables: Vec<Watermark>,
    pub external_db_connected: bool,
}

/// Result of one cycle across the enabled tables.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub runs: Vec<SyncRunRecord>,
    /// Tables whose poll failed at the query level.
    pub failed_tables: Vec<String>,
    /// Another cycle was already in flight; nothing ran.
    pub skipped: bool,
}

impl CycleReport {
    pub fn is_failure(&self) -> bool {
        !self.failed_tables.is_empty()
    }

    pub fn records_processed(&self) -> i64 {
        self.runs.iter().map(|r| r.records_processed).sum()
    }
}

struct Scheduler {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

enum SchedulerState {
    Idle,
    /// `start_sync` is verifying the source or running its first cycle.
    Starting(CancellationToken),
    Running(Scheduler),
}

/// Top-level sync control loop and admin surface.
///
/// One instance owns the in-flight guard, the scheduler, the backoff, the
/// dedup window and (through the connection) the breaker.
pub struct SyncService {
    cfg: SyncConfig,
    registry: Arc<MappingRegistry>,
    connection: Arc<GuardedConnection>,
    store: Arc<dyn SyncStore>,
    bus: Arc<dyn EventBus>,
    poller: Poller,
    schema: SchemaValidator,
    health: Arc<HealthMonitor>,
    dedup: DedupWindow,
    backoff: Mutex<Backoff>,
    cycle_lock: Mutex<()>,
    backfill: DashSet<String>,
    scheduler: Mutex<SchedulerState>,
}

impl SyncService {
    pub fn new(
        cfg: SyncConfig,
        registry: Arc<MappingRegistry>,
        connection: Arc<GuardedConnection>,
        store: Arc<dyn SyncStore>,
        bus: Arc<dyn EventBus>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let poller = Poller::new(connection.clone(), store.clone());
        let schema = SchemaValidator::new(connection.clone(), alerts.clone(), cfg.schema_cache_ttl);
        let health = Arc::new(HealthMonitor::new(store.clone(), alerts, cfg.health_alert_window));
        Self {
            dedup: DedupWindow::new(cfg.dedup_window),
            backoff: Mutex::new(Backoff::new(cfg.effective_interval(), cfg.max_backoff)),
            cfg,
            registry,
            connection,
            store,
            bus,
            poller,
            schema,
            health,
            cycle_lock: Mutex::new(()),
            backfill: DashSet::new(),
            scheduler: Mutex::new(SchedulerState::Idle),
        }
    }

    /// Wire the marketplace registry and the configured driver.
    pub fn from_config(
        cfg: SyncConfig,
        store: Arc<dyn SyncStore>,
        bus: Arc<dyn EventBus>,
        alerts: Arc<dyn AlertSink>,
    ) -> Result<Self> {
        cfg.validate()?;
        let registry = Arc::new(MappingRegistry::marketplace()?);
        let connection = Arc::new(GuardedConnection::from_config(&cfg.external, &cfg.breaker));
        Ok(Self::new(cfg, registry, connection, store, bus, alerts))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.cfg
    }

    pub fn registry(&self) -> &MappingRegistry {
        &self.registry
    }

    pub fn connection(&self) -> &Arc<GuardedConnection> {
        &self.connection
    }

    /// Register every mapped table locally and admit the static query
    /// templates. Idempotent.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn bootstrap(&self) -> Result<()> {
        for table in self.registry.tables() {
            self.store.register_table(table).await?;
        }
        self.connection.register_allowlist(&self.registry);
        Ok(())
    }

    fn mapping(&self, table: &str) -> Result<&TableMapping> {
        self.registry
            .get(table)
            .ok_or_else(|| Error::NotFound(format!("no mapping for table '{table}'")))
    }

    fn mode(&self) -> SyncMode {
        if self.cfg.push_channel_active {
            SyncMode::GapFill
        } else {
            SyncMode::Primary
        }
    }

    /// Run one cycle over the enabled tables, optionally narrowed to one.
    /// Returns a skipped report when a cycle is already in flight.
    pub async fn run_cycle(&self, table: Option<&str>) -> Result<CycleReport> {
        self.run_cycle_unless(table, None).await
    }

    /// `run_cycle` that also skips once `cancel` fires. Checked under the
    /// in-flight guard, so a stop holding the guard is never raced.
    #[tracing::instrument(level = "info", skip(self, cancel))]
    async fn run_cycle_unless(
        &self,
        table: Option<&str>,
        cancel: Option<&CancellationToken>,
    ) -> Result<CycleReport> {
        let skipped = || CycleReport {
            skipped: true,
            ..CycleReport::default()
        };
        let Ok(_in_flight) = self.cycle_lock.try_lock() else {
            tracing::info!("sync cycle already in progress, skipping");
            return Ok(skipped());
        };
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Ok(skipped());
        }

        if let Some(t) = table {
            self.mapping(t)?;
        }
        let enabled: Vec<String> = self
            .store
            .list_watermarks()
            .await?
            .into_iter()
            .filter(|w| w.enabled)
            .map(|w| w.source_table)
            .collect();
        let mappings: Vec<&TableMapping> = self
            .registry
            .iter()
            .filter(|m| enabled.iter().any(|t| t == m.source_table))
            .filter(|m| table.map_or(true, |t| t == m.source_table))
            .collect();

        let mut report = CycleReport::default();
        if mappings.is_empty() {
            tracing::info!("no enabled tables to sync");
            return Ok(report);
        }
        self.dedup.prune_at(Utc::now());

        for mapping in mappings {
            let (run, query_failed) = self.sync_table(mapping).await;
            if query_failed {
                report.failed_tables.push(mapping.source_table.to_string());
            }
            report.runs.push(run);
        }

        for issue in quick_check(&report.runs) {
            tracing::warn!(
                table = %issue.table,
                anomaly = issue.anomaly.as_str(),
                priority = issue.priority.as_str(),
                "{}",
                issue.description
            );
        }

        let health = self.health.clone();
        tokio::spawn(async move {
            let report = health.deep_check().await;
            if !report.healthy {
                tracing::debug!(issues = report.issues.len(), "sync health issues detected");
            }
        });

        Ok(report)
    }

    /// Admin trigger. A concurrent call while a cycle runs returns no runs.
    pub async fn trigger_cycle(&self, table: Option<&str>) -> Result<Vec<SyncRunRecord>> {
        Ok(self.run_cycle(table).await?.runs)
    }

    /// Poll, emit and advance one table. The flag marks a query-level failure.
    async fn sync_table(&self, mapping: &TableMapping) -> (SyncRunRecord, bool) {
        let table = mapping.source_table;
        let watermark = match self.store.get_watermark(table).await {
            Ok(Some(w)) => w,
            Ok(None) => Watermark::new(table),
            Err(e) => {
                tracing::error!(table, error = %e, "failed to read watermark");
                let mut run = SyncRunRecord::start(table, Utc::now(), epoch());
                run.error = Some(e.to_string());
                run.finish(Utc::now());
                return (run, false);
            }
        };

        if self.cfg.validate_schema {
            let drift = self.schema.validate_table_schema(mapping).await;
            if !drift.valid {
                let message = match &drift.error {
                    Some(e) => format!("schema check failed: {e}"),
                    None => format!("schema drift: missing columns {}", drift.missing_columns.join(", ")),
                };
                let run = self.fail_table(&watermark, message).await;
                return (run, drift.error.is_some());
            }
        }

        match self
            .poller
            .poll_table(mapping, self.cfg.batch_size, self.cfg.watermark_policy)
            .await
        {
            Ok(outcome) => self.finish_poll(&watermark, outcome).await,
            Err(e) => {
                tracing::error!(table, error = %e, "table sync failed");
                (self.fail_table(&watermark, e.to_string()).await, true)
            }
        }
    }

    async fn finish_poll(&self, watermark: &Watermark, outcome: PollOutcome) -> (SyncRunRecord, bool) {
        let PollOutcome { rows, mut run, mut next } = outcome;
        let table = watermark.source_table.as_str();
        let backfill = self.backfill.contains(table);

        let mut suppressed = 0usize;
        let mut emit_failures = 0i64;
        // Furthest row before the first failed row, in read order.
        let mut held: Option<CursorPosition> = None;
        let mut blocked = false;
        for polled in rows {
            let mut emit_failed = false;
            for event in polled.events {
                let event = if backfill { event.into_backfill() } else { event };
                let key = event.dedup_key(table);
                if !self.dedup.admit(&key) {
                    suppressed += 1;
                    continue;
                }
                match self.bus.emit(event).await {
                    Ok(()) => run.events_emitted += 1,
                    Err(e) => {
                        self.dedup.forget(&key);
                        run.row_errors.push(format!("emit {key}: {e}"));
                        emit_failed = true;
                    }
                }
            }
            if emit_failed {
                emit_failures += 1;
                run.records_failed += 1;
                run.records_processed -= 1;
            }
            blocked |= polled.failed || emit_failed;
            if !blocked {
                held = advance(held, polled.position);
            }
        }
        if suppressed > 0 {
            tracing::debug!(table, suppressed, "suppressed replayed events");
        }
        if emit_failures > 0 {
            tracing::warn!(table, rows = emit_failures, "event emit failed");
            if matches!(self.cfg.watermark_policy, WatermarkPolicy::HoldAtFirstFailure) {
                next = held;
            }
        }
        run.watermark_after = next
            .as_ref()
            .map_or(run.watermark_before, |p| p.at.max(run.watermark_before));

        if backfill && run.records_found < i64::from(self.cfg.batch_size) {
            self.backfill.remove(table);
            tracing::info!(table, "backfill complete");
        }

        let (at, id) = match next {
            Some(pos) => (pos.at, pos.id),
            None => (watermark.last_synced_at, watermark.last_synced_id.clone()),
        };
        let update = WatermarkAdvance {
            last_synced_at: at,
            last_synced_id: id,
            records_processed: run.records_processed,
            run_at: run.finished_at,
            duration_ms: run.duration_ms,
            error: run.row_errors.first().cloned(),
        };
        if let Err(e) = self.store.advance_watermark(table, &update).await {
            tracing::error!(table, error = %e, "failed to advance watermark");
            run.error = Some(format!("watermark advance failed: {e}"));
            run.watermark_after = run.watermark_before;
        }
        self.record_run(&run).await;

        if run.records_found > 0 {
            tracing::info!(
                table,
                processed = run.records_processed,
                found = run.records_found,
                emitted = run.events_emitted,
                duration_ms = run.duration_ms,
                "table synced"
            );
        }
        (run, false)
    }

    /// Record a table that made no progress this cycle.
    async fn fail_table(&self, watermark: &Watermark, error: String) -> SyncRunRecord {
        let now = Utc::now();
        let mut run = SyncRunRecord::start(watermark.source_table.clone(), now, watermark.last_synced_at);
        run.error = Some(error.clone());
        run.finish(Utc::now());
        let advance = WatermarkAdvance {
            last_synced_at: watermark.last_synced_at,
            last_synced_id: watermark.last_synced_id.clone(),
            records_processed: 0,
            run_at: run.finished_at,
            duration_ms: run.duration_ms,
            error: Some(error),
        };
        if let Err(e) = self.store.advance_watermark(&watermark.source_table, &advance).await {
            tracing::warn!(table = %watermark.source_table, error = %e, "failed to record table error");
        }
        self.record_run(&run).await;
        run
    }

    async fn record_run(&self, run: &SyncRunRecord) {
        if let Err(e) = self.store.append_run(run).await {
            tracing::warn!(table = %run.source_table, error = %e, "failed to append sync run");
        }
    }

    /// Verify the source, then run one cycle and keep polling until
    /// `stop_sync`.
    ///
    /// A call while sync is starting or running is a no-op. A `stop_sync`
    /// that lands during startup wins: no loop is left behind.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn start_sync(self: &Arc<Self>) -> Result<()> {
        if !self.cfg.enabled {
            return Err(Error::Disabled("set SYNC_ENABLED=true to enable data sync".to_string()));
        }
        let cancel = {
            let mut state = self.scheduler.lock().await;
            if !matches!(*state, SchedulerState::Idle) {
                tracing::info!("data sync already started");
                return Ok(());
            }
            let cancel = CancellationToken::new();
            *state = SchedulerState::Starting(cancel.clone());
            cancel
        };

        if let Err(e) = self.prepare_start(&cancel).await {
            let mut state = self.scheduler.lock().await;
            // A cancelled token means stop_sync already reset the state.
            if !cancel.is_cancelled() {
                *state = SchedulerState::Idle;
            }
            return Err(e);
        }

        let mut state = self.scheduler.lock().await;
        if cancel.is_cancelled() {
            tracing::info!("data sync stopped during startup");
            return Ok(());
        }
        let svc = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { svc.schedule_loop(token).await });
        *state = SchedulerState::Running(Scheduler { cancel, handle });
        Ok(())
    }

    async fn prepare_start(&self, cancel: &CancellationToken) -> Result<()> {
        if !self.connection.test_connection().await {
            return Err(Error::BackendMessage("cannot connect to external database".to_string()));
        }
        let privileges = self.connection.verify_read_only_privileges().await;
        if !privileges.safe {
            self.connection.close().await;
            return match privileges.error {
                Some(e) if privileges.dangerous.is_empty() => Err(Error::BackendMessage(format!(
                    "could not verify external account privileges: {e}"
                ))),
                _ => Err(Error::UnsafePrivileges(privileges.dangerous)),
            };
        }

        self.bootstrap().await?;
        let watermarks = self.store.list_watermarks().await?;
        if cancel.is_cancelled() {
            return Ok(());
        }
        for w in watermarks {
            if w.enabled && w.is_at_epoch() {
                self.backfill.insert(w.source_table);
            }
        }
        if !self.backfill.is_empty() {
            tracing::info!(tables = self.backfill.len(), "initial backfill mode");
        }

        let interval = self.cfg.effective_interval();
        tracing::info!(
            mode = ?self.mode(),
            interval_ms = interval.as_millis() as u64,
            batch = self.cfg.batch_size,
            "starting data sync"
        );

        let first = self.run_cycle_unless(None, Some(cancel)).await;
        self.record_cycle_outcome(&first).await;
        Ok(())
    }

    async fn schedule_loop(&self, cancel: CancellationToken) {
        loop {
            let delay = self.backoff.lock().await.current();
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("sync scheduler cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let outcome = self.run_cycle_unless(None, Some(&cancel)).await;
            if let Ok(report) = &outcome {
                let gap_filled = report.records_processed();
                if self.cfg.push_channel_active && gap_filled > 0 {
                    tracing::info!(
                        records = gap_filled,
                        "gap-fill: polling found records the push channel did not deliver"
                    );
                }
            }
            self.record_cycle_outcome(&outcome).await;
        }
    }

    async fn record_cycle_outcome(&self, outcome: &Result<CycleReport>) {
        let mut backoff = self.backoff.lock().await;
        match outcome {
            Ok(r) if r.skipped => {}
            Ok(r) if !r.is_failure() => {
                backoff.on_success();
            }
            Ok(r) => {
                let next = backoff.on_failure();
                tracing::warn!(
                    failed = ?r.failed_tables,
                    next_delay_ms = next.as_millis() as u64,
                    "sync cycle failed, backing off"
                );
            }
            Err(e) => {
                let next = backoff.on_failure();
                tracing::warn!(error = %e, next_delay_ms = next.as_millis() as u64, "sync cycle error, backing off");
            }
        }
    }

    /// Cancel the scheduler (or a startup in progress), wait for an
    /// in-flight cycle, reset the breaker, backoff and dedup state, and
    /// release the pool.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn stop_sync(&self) {
        // Held throughout so a concurrent start_sync cannot install a loop
        // between the cancel and the reset.
        let mut state = self.scheduler.lock().await;
        // A startup's first cycle either finishes before this guard is taken
        // or sees the cancel once it gets the guard.
        let _quiesced = match std::mem::replace(&mut *state, SchedulerState::Idle) {
            SchedulerState::Idle => None,
            SchedulerState::Starting(cancel) => {
                cancel.cancel();
                Some(self.cycle_lock.lock().await)
            }
            SchedulerState::Running(s) => {
                s.cancel.cancel();
                if let Err(e) = s.handle.await {
                    tracing::warn!(error = %e, "sync scheduler task ended abnormally");
                }
                None
            }
        };
        self.backoff.lock().await.reset();
        self.connection.breaker().reset().await;
        self.dedup.clear();
        self.backfill.clear();
        self.connection.close().await;
        tracing::info!("data sync stopped");
    }

    /// True from the start of `start_sync` until `stop_sync`.
    pub async fn is_scheduled(&self) -> bool {
        !matches!(*self.scheduler.lock().await, SchedulerState::Idle)
    }

    pub fn is_running(&self) -> bool {
        self.cycle_lock.try_lock().is_err()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_status(&self) -> Result<SyncStatus> {
        let breaker = self.connection.breaker_snapshot().await;
        // Checking through a non-closed breaker would spend its half-open call.
        let external_db_connected = self.cfg.enabled
            && breaker.state == BreakerState::Closed
            && self.connection.test_connection().await;
        let (current_delay, failures) = {
            let b = self.backoff.lock().await;
            (b.current(), b.consecutive_failures())
        };
        let mut backfill_tables: Vec<String> = self.backfill.iter().map(|t| t.clone()).collect();
        backfill_tables.sort();
        Ok(SyncStatus {
            enabled: self.cfg.enabled,
            running: self.is_running(),
            scheduled: self.is_scheduled().await,
            mode: self.mode(),
            interval_ms: self.cfg.effective_interval().as_millis() as u64,
            current_delay_ms: current_delay.as_millis() as u64,
            consecutive_cycle_failures: failures,
            driver: self.connection.dialect().as_str().to_string(),
            breaker,
            backfill_tables,
            tables: self.store.list_watermarks().await?,
            external_db_connected,
        })
    }

    /// Newest first, at most `MAX_RUN_HISTORY`.
    pub async fn get_run_history(&self, limit: usize) -> Result<Vec<SyncRunRecord>> {
        self.store.list_runs(limit.clamp(1, MAX_RUN_HISTORY)).await
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn set_table_enabled(&self, table: &str, enabled: bool) -> Result<()> {
        self.mapping(table)?;
        self.store.set_table_enabled(table, enabled).await
    }

    /// Re-sync a table from the beginning. Its next poll runs as a backfill.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn reset_watermark(&self, table: &str) -> Result<()> {
        self.mapping(table)?;
        self.store.reset_watermark(table).await?;
        self.dedup.forget_prefix(&format!("{table}:"));
        if self.is_scheduled().await {
            self.backfill.insert(table.to_string());
        }
        Ok(())
    }

    pub async fn test_connection(&self) -> bool {
        self.connection.test_connection().await
    }

    pub async fn get_health_report(&self) -> HealthReport {
        self.health.deep_check().await
    }
}
