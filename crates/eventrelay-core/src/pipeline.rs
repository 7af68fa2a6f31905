//! The relay pipeline: a single-worker, checkpointed polling loop.
//!
//! ```text
//! Initializing ─► Idle ─► RangeComputed ─► EventsFetched ─► EventsFiltered
//!                  ▲                                               │
//!                  └──── Checkpointing ◄──────── Delivering ◄──────┘
//! ```
//!
//! One cycle:
//! 1. Re-attempt payloads whose delivery exhausted retries last time.
//! 2. `range = [cursor + 1, min(head, cursor + span)]`; an empty range ends the cycle.
//! 3. Fetch events; connectivity/query errors skip the cycle, cursor unchanged,
//!    and halve the span for the next attempt.
//! 4. Normalize, drop already-relayed ids, keep source order.
//! 5. Deliver one by one, marking each id right after its delivery succeeds.
//! 6. Record the range and advance the cursor.
//!
//! The span starts at `max_blocks_per_cycle` and doubles back towards it after
//! every successful fetch. While the cursor trails the head, [`Pipeline::run`]
//! starts the next cycle without sleeping.
//!
//! Cancellation is observed while sleeping, while waiting on the chain and
//! while waiting on the relay endpoint.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::chain::ChainReader;
use crate::config::{PipelineConfig, PipelineState};
use crate::dedup::Deduplicator;
use crate::error::{DeliveryError, RelayError};
use crate::relayer::{RelayTransport, Relayer};
use crate::store::ProgressStore;
use crate::types::{BlockRange, NormalizedPayload};

/// What happened in one call to [`Pipeline::run_cycle`].
#[derive(Debug)]
pub enum CycleOutcome {
    /// The cursor is already at the chain head.
    Idle { cursor: u64 },
    /// The chain could not be queried; nothing was advanced.
    Skipped(RelayError),
    /// A range was scanned and checkpointed.
    Completed(CycleReport),
    /// Shutdown was requested mid-cycle; nothing was checkpointed.
    Cancelled,
}

/// Summary of a completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub range: Option<BlockRange>,
    /// Raw events returned by the chain.
    pub fetched: usize,
    /// Events that could not be normalized.
    pub undecodable: usize,
    /// Ids delivered and marked, in delivery order.
    pub delivered: Vec<String>,
    /// Ids permanently rejected by the endpoint.
    pub dropped: Vec<String>,
    /// Ids that exhausted their retries and were queued for redelivery.
    pub failed: Vec<String>,
    /// Queued ids delivered at the start of this cycle.
    pub redelivered: Vec<String>,
    /// Blocks between the checkpoint and the observed head after this cycle.
    pub behind: u64,
}

/// Outcome of delivering a single payload.
enum Delivery {
    Delivered,
    Dropped,
    Failed,
    Cancelled,
}

/// The orchestrator. Sole writer of the scan checkpoint.
pub struct Pipeline<R, T> {
    config: PipelineConfig,
    reader: R,
    store: Arc<dyn ProgressStore>,
    dedup: Deduplicator,
    relayer: Relayer<T>,
    cancel: CancellationToken,
    cursor: Option<u64>,
    span: u64,
    state: PipelineState,
    pending: VecDeque<NormalizedPayload>,
}

impl<R: ChainReader, T: RelayTransport> Pipeline<R, T> {
    pub fn new(
        config: PipelineConfig,
        reader: R,
        store: Arc<dyn ProgressStore>,
        transport: T,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            dedup: Deduplicator::new(store.clone()),
            relayer: Relayer::new(transport, config.relayer.clone()),
            span: config.max_blocks_per_cycle.max(1),
            config,
            reader,
            store,
            cancel,
            cursor: None,
            state: PipelineState::Initializing,
            pending: VecDeque::new(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Last block known to be scanned, once initialized.
    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    /// Widest range the next cycle will scan.
    pub fn span(&self) -> u64 {
        self.span
    }

    /// Number of payloads waiting for redelivery.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn relayer(&self) -> &Relayer<T> {
        &self.relayer
    }

    /// Load progress and position the cursor.
    ///
    /// With no saved progress, start `start_block_offset` blocks behind the head.
    pub async fn initialize(&mut self) -> Result<u64, RelayError> {
        self.state = PipelineState::Initializing;
        let cursor = match self.store.load().await? {
            Some(record) => {
                tracing::info!(
                    stream = %self.config.id,
                    block = record.last_scanned_block,
                    relayed = record.relayed_ids.len(),
                    "resuming from checkpoint"
                );
                record.last_scanned_block
            }
            None => {
                let head = self.chain_call("current height", self.reader.current_height()).await?;
                let start = head.saturating_sub(self.config.start_block_offset);
                tracing::info!(
                    stream = %self.config.id,
                    head,
                    offset = self.config.start_block_offset,
                    start,
                    "no checkpoint; starting behind head"
                );
                start
            }
        };
        self.cursor = Some(cursor);
        self.state = PipelineState::Idle;
        Ok(cursor)
    }

    /// Run until cancelled. Only initialization failures are returned.
    pub async fn run(&mut self) -> Result<(), RelayError> {
        match self.initialize().await {
            Ok(_) => {}
            Err(RelayError::Cancelled) => {
                self.stop();
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            stream = %self.config.id,
            poll_ms = self.config.poll_interval_ms,
            "relay pipeline started"
        );

        loop {
            match self.run_cycle().await {
                Ok(CycleOutcome::Cancelled) => break,
                Ok(CycleOutcome::Completed(report)) if report.behind > 0 => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    continue;
                }
                Ok(_) => {}
                Err(e) => tracing::error!(
                    stream = %self.config.id,
                    kind = e.kind(),
                    error = %e,
                    "cycle aborted; checkpoint not advanced"
                ),
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }

        self.stop();
        Ok(())
    }

    /// Run exactly one polling cycle.
    ///
    /// Store failures abort the cycle and are returned; the checkpoint is
    /// left where it was.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, RelayError> {
        let result = match self.cursor {
            Some(_) => self.cycle().await,
            None => match self.initialize().await {
                Ok(_) => self.cycle().await,
                Err(e) => Err(e),
            },
        };
        match &result {
            Ok(CycleOutcome::Cancelled) | Err(RelayError::Cancelled) => {
                self.state = PipelineState::Stopped;
            }
            _ => self.state = PipelineState::Idle,
        }
        match result {
            Err(RelayError::Cancelled) => Ok(CycleOutcome::Cancelled),
            other => other,
        }
    }

    async fn cycle(&mut self) -> Result<CycleOutcome, RelayError> {
        let mut report = CycleReport::default();

        if !self.pending.is_empty() && !self.redeliver_pending(&mut report).await? {
            return Ok(CycleOutcome::Cancelled);
        }

        // ── RangeComputed ──
        let cursor = self.cursor.unwrap_or_default();
        let head = match self.chain_call("current height", self.reader.current_height()).await {
            Ok(h) => h,
            Err(e) if e.is_transient() => return Ok(self.skip(e, None)),
            Err(e) => return Err(e),
        };
        let Some(unscanned) = BlockRange::after(cursor, head) else {
            tracing::debug!(cursor, head, "no new blocks");
            return Ok(CycleOutcome::Idle { cursor });
        };
        let range = unscanned.capped(self.span);
        self.state = PipelineState::RangeComputed;
        report.range = Some(range);
        report.behind = head - range.to;

        // ── EventsFetched ──
        let events = match self.chain_call("fetch events", self.reader.fetch_events(range)).await {
            Ok(ev) => ev,
            Err(e) if e.is_transient() => {
                self.narrow_span(range);
                return Ok(self.skip(e, Some(range)));
            }
            Err(e) => return Err(e),
        };
        self.span = self.span.saturating_mul(2).min(self.config.max_blocks_per_cycle.max(1));
        self.state = PipelineState::EventsFetched;
        report.fetched = events.len();

        // ── EventsFiltered ──
        let mut fresh = Vec::new();
        let mut seen = HashSet::new();
        for event in &events {
            let payload = match NormalizedPayload::from_raw(event) {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!(
                        block = event.block_number,
                        log_index = event.log_index,
                        tx_hash = %event.tx_hash,
                        error = %e,
                        "undecodable event skipped"
                    );
                    report.undecodable += 1;
                    continue;
                }
            };
            if !seen.insert(payload.transaction_id.clone()) {
                continue;
            }
            if self.dedup.is_new(&payload).await? {
                fresh.push((event.block_number, payload));
            } else {
                tracing::debug!(tx_id = %payload.transaction_id, "already relayed; skipping");
            }
        }
        self.state = PipelineState::EventsFiltered;

        // ── Delivering ──
        self.state = PipelineState::Delivering;
        for (block, payload) in fresh {
            match self.deliver_one(&payload, Some(block)).await? {
                Delivery::Delivered => report.delivered.push(payload.transaction_id),
                Delivery::Dropped => report.dropped.push(payload.transaction_id),
                Delivery::Failed => {
                    report.failed.push(payload.transaction_id.clone());
                    self.enqueue(payload);
                }
                Delivery::Cancelled => return Ok(CycleOutcome::Cancelled),
            }
        }

        // ── Checkpointing ──
        self.state = PipelineState::Checkpointing;
        self.store.record_range(range.to).await?;
        self.cursor = Some(range.to);

        tracing::info!(
            stream = %self.config.id,
            from = range.from,
            to = range.to,
            fetched = report.fetched,
            delivered = report.delivered.len(),
            dropped = report.dropped.len(),
            failed = report.failed.len(),
            behind = report.behind,
            "range checkpointed"
        );
        Ok(CycleOutcome::Completed(report))
    }

    /// Deliver a payload and, on success, mark it processed immediately.
    async fn deliver_one(
        &self,
        payload: &NormalizedPayload,
        block: Option<u64>,
    ) -> Result<Delivery, RelayError> {
        let tx_id = payload.transaction_id.as_str();
        match self.relayer.deliver(payload, &self.cancel).await {
            Ok(_) => {
                self.store.mark_processed(tx_id).await?;
                Ok(Delivery::Delivered)
            }
            Err(DeliveryError::Cancelled) => Ok(Delivery::Cancelled),
            Err(e @ DeliveryError::Exhausted { .. }) => {
                tracing::warn!(tx_id, block = ?block, error = %e, "delivery failed; queued for redelivery");
                Ok(Delivery::Failed)
            }
            Err(e) => {
                tracing::error!(
                    tx_id,
                    block = ?block,
                    source_tx = %payload.source_tx_hash,
                    error = %e,
                    "dropped event: relay rejected payload, operator attention required"
                );
                Ok(Delivery::Dropped)
            }
        }
    }

    /// Returns `false` if cancelled part-way.
    async fn redeliver_pending(&mut self, report: &mut CycleReport) -> Result<bool, RelayError> {
        let queued: Vec<_> = self.pending.drain(..).collect();
        tracing::info!(count = queued.len(), "redelivering queued payloads");
        self.state = PipelineState::Delivering;

        let mut queued = queued.into_iter();
        while let Some(payload) = queued.next() {
            if !self.dedup.is_new(&payload).await? {
                continue;
            }
            match self.deliver_one(&payload, None).await {
                Ok(Delivery::Delivered) => report.redelivered.push(payload.transaction_id),
                Ok(Delivery::Dropped) => report.dropped.push(payload.transaction_id),
                Ok(Delivery::Failed) => self.enqueue(payload),
                Ok(Delivery::Cancelled) => {
                    self.enqueue(payload);
                    queued.for_each(|p| self.enqueue(p));
                    return Ok(false);
                }
                Err(e) => {
                    // Not marked: keep it and everything after it for next time.
                    self.enqueue(payload);
                    queued.for_each(|p| self.enqueue(p));
                    return Err(e);
                }
            }
        }
        Ok(true)
    }

    fn enqueue(&mut self, payload: NormalizedPayload) {
        if self.pending.iter().any(|p| p.transaction_id == payload.transaction_id) {
            return;
        }
        if self.pending.len() >= self.config.max_pending {
            if let Some(evicted) = self.pending.pop_front() {
                tracing::error!(
                    tx_id = %evicted.transaction_id,
                    capacity = self.config.max_pending,
                    "redelivery queue full; evicting oldest payload"
                );
            }
        }
        self.pending.push_back(payload);
    }

    fn narrow_span(&mut self, failed: BlockRange) {
        let span = (failed.len() / 2).max(1);
        if span < self.span {
            tracing::debug!(stream = %self.config.id, from = self.span, to = span, "narrowing scan span");
        }
        self.span = span;
    }

    fn skip(&self, error: RelayError, range: Option<BlockRange>) -> CycleOutcome {
        tracing::warn!(
            stream = %self.config.id,
            kind = error.kind(),
            range = %range.map_or_else(|| "-".to_string(), |r| r.to_string()),
            cursor = ?self.cursor,
            error = %error,
            "chain unavailable; skipping cycle"
        );
        CycleOutcome::Skipped(error)
    }

    fn stop(&mut self) {
        self.state = PipelineState::Stopped;
        tracing::info!(stream = %self.config.id, cursor = ?self.cursor, "relay pipeline stopped");
    }

    /// Bound a chain call by the configured timeout and the shutdown token.
    async fn chain_call<V>(
        &self,
        what: &'static str,
        fut: impl Future<Output = Result<V, RelayError>>,
    ) -> Result<V, RelayError> {
        let timeout = self.config.chain_timeout();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RelayError::Cancelled),
            res = tokio::time::timeout(timeout, fut) => res.unwrap_or_else(|_| {
                Err(RelayError::Connectivity(format!(
                    "{what} timed out after {}ms",
                    timeout.as_millis()
                )))
            }),
        }
    }
}
