//! One bounded, cursor-ordered pull per table.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::WatermarkPolicy;
use crate::events::DomainEvent;
use crate::external::{GuardedConnection, SqlParam};
use crate::mappings::{Row, TableMapping};
use crate::store::{SyncRunRecord, SyncStore};
use crate::transformer::{resolve_payload_user_ids, transform_row, Transformer};
use crate::{Error, Result};

/// Cursor position a poll proposes to advance to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorPosition {
    pub at: DateTime<Utc>,
    pub id: Option<String>,
}

/// One row read by a poll and the events it produced.
#[derive(Debug)]
pub struct PolledRow {
    pub position: Option<CursorPosition>,
    /// The row event followed by any contact-change events. Empty when the
    /// row failed.
    pub events: Vec<DomainEvent>,
    pub failed: bool,
}

#[derive(Debug)]
pub struct PollOutcome {
    /// Every row read, in read order.
    pub rows: Vec<PolledRow>,
    /// Run record with counts filled in; `events_emitted` is left to the caller.
    pub run: SyncRunRecord,
    /// `None` when the watermark must not move.
    pub next: Option<CursorPosition>,
}

impl PollOutcome {
    /// All events of the poll, in read order.
    pub fn events(&self) -> Vec<&DomainEvent> {
        self.rows.iter().flat_map(|r| r.events.iter()).collect()
    }
}

pub struct Poller {
    connection: Arc<GuardedConnection>,
    store: Arc<dyn SyncStore>,
    transformer: Transformer,
}

impl Poller {
    pub fn new(connection: Arc<GuardedConnection>, store: Arc<dyn SyncStore>) -> Self {
        Self {
            transformer: Transformer::new(store.clone()),
            connection,
            store,
        }
    }

    pub fn transformer(&self) -> &Transformer {
        &self.transformer
    }

    /// Read up to `batch_size` rows past the table's watermark and turn them
    /// into events.
    ///
    /// Errors only when the watermark or the external query fails. Per-row
    /// failures are counted in the run record and never abort the batch.
    #[tracing::instrument(level = "info", skip(self, mapping), fields(table = mapping.source_table))]
    pub async fn poll_table(
        &self,
        mapping: &TableMapping,
        batch_size: u32,
        policy: WatermarkPolicy,
    ) -> Result<PollOutcome> {
        let watermark = self
            .store
            .get_watermark(mapping.source_table)
            .await?
            .ok_or_else(|| Error::NotFound(format!("watermark for table '{}'", mapping.source_table)))?;
        let started_at = Utc::now();
        let mut run = SyncRunRecord::start(mapping.source_table, started_at, watermark.last_synced_at);

        let result = self
            .connection
            .query(
                &mapping.poll_query(),
                &[
                    SqlParam::Timestamp(watermark.last_synced_at),
                    SqlParam::I64(i64::from(batch_size)),
                    tie_break_param(watermark.last_synced_id.as_deref()),
                ],
            )
            .await?;
        run.records_found = result.row_count as i64;

        let mut rows = Vec::with_capacity(result.rows.len());
        let mut read_max: Option<CursorPosition> = None;
        let mut held: Option<CursorPosition> = None;
        let mut failed_yet = false;

        for row in &result.rows {
            let position = mapping.cursor_value(row).map(|at| CursorPosition {
                at,
                id: mapping.source_id(row),
            });
            match self.process_row(row, mapping).await {
                Ok(events) => {
                    run.records_processed += 1;
                    if !failed_yet {
                        held = advance(held, position.clone());
                    }
                    rows.push(PolledRow {
                        position: position.clone(),
                        events,
                        failed: false,
                    });
                }
                Err(e) => {
                    let id = mapping.source_id(row).unwrap_or_else(|| "?".to_string());
                    tracing::warn!(table = mapping.source_table, source_id = %id, error = %e, "row failed to sync");
                    run.records_failed += 1;
                    run.row_errors.push(format!("{id}: {e}"));
                    failed_yet = true;
                    rows.push(PolledRow {
                        position: position.clone(),
                        events: Vec::new(),
                        failed: true,
                    });
                }
            }
            read_max = advance(read_max, position);
        }

        let next = match policy {
            WatermarkPolicy::AdvancePastFailures => read_max,
            WatermarkPolicy::HoldAtFirstFailure => held,
        };
        if let Some(pos) = &next {
            run.watermark_after = pos.at.max(watermark.last_synced_at);
        }
        run.finish(Utc::now());

        tracing::debug!(
            found = run.records_found,
            processed = run.records_processed,
            failed = run.records_failed,
            "poll finished"
        );
        Ok(PollOutcome { rows, run, next })
    }

    async fn process_row(&self, row: &Row, mapping: &TableMapping) -> Result<Vec<DomainEvent>> {
        let entities = self.transformer.ensure_entities_for_row(row, mapping).await?;
        let mut out = self
            .transformer
            .detect_field_changes(row, mapping, &entities)
            .await?;
        let event = transform_row(row, mapping)?;
        out.insert(0, event);
        for ev in &mut out {
            resolve_payload_user_ids(&mut ev.payload, &entities.ids);
        }
        Ok(out)
    }
}

/// Primary key bound against rows that share the watermark's cursor value.
/// Numeric keys bind as integers; a table with no synced id yet starts below
/// every key.
fn tie_break_param(last_id: Option<&str>) -> SqlParam {
    match last_id {
        Some(id) => id
            .parse::<i64>()
            .map(SqlParam::I64)
            .unwrap_or_else(|_| SqlParam::Text(id.to_string())),
        None => SqlParam::I64(i64::MIN),
    }
}

pub(crate) fn advance(current: Option<CursorPosition>, candidate: Option<CursorPosition>) -> Option<CursorPosition> {
    match (current, candidate) {
        (Some(c), Some(n)) if n.at >= c.at => Some(n),
        (Some(c), _) => Some(c),
        (None, n) => n,
    }
}
