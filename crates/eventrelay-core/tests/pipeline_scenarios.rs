//! End-to-end cycles over fake chain and relay endpoints.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

use eventrelay_core::{
    BlockRange, ChainReader, CycleOutcome, CycleReport, DeliveryError, MemoryProgressStore,
    NormalizedPayload, Pipeline, PipelineBuilder, PipelineConfig, PipelineState, ProgressRecord,
    ProgressStore, RawEvent, RelayError, RelayTransport,
};

// ─── Fakes ────────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct FakeChain {
    head: Arc<Mutex<u64>>,
    events: Arc<Mutex<Vec<RawEvent>>>,
    failures: Arc<Mutex<VecDeque<RelayError>>>,
    fetched: Arc<Mutex<Vec<BlockRange>>>,
    hang_fetch: Arc<Mutex<bool>>,
}

impl FakeChain {
    fn at(head: u64) -> Self {
        let chain = Self::default();
        chain.set_head(head);
        chain
    }

    fn set_head(&self, head: u64) {
        *self.head.lock().unwrap() = head;
    }

    fn emit(&self, id: &str, block: u64, log_index: u64) {
        self.events.lock().unwrap().push(event(id, block, log_index));
    }

    fn fail_next(&self, err: RelayError) {
        self.failures.lock().unwrap().push_back(err);
    }

    fn fetched(&self) -> Vec<BlockRange> {
        self.fetched.lock().unwrap().clone()
    }

    fn take_failure(&self) -> Result<(), RelayError> {
        match self.failures.lock().unwrap().pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ChainReader for FakeChain {
    async fn current_height(&self) -> Result<u64, RelayError> {
        self.take_failure()?;
        Ok(*self.head.lock().unwrap())
    }

    async fn fetch_events(&self, range: BlockRange) -> Result<Vec<RawEvent>, RelayError> {
        if range.is_empty() {
            return Err(RelayError::ChainQuery(format!("malformed range {range}")));
        }
        self.take_failure()?;
        if *self.hang_fetch.lock().unwrap() {
            std::future::pending::<()>().await;
        }
        self.fetched.lock().unwrap().push(range);
        let mut out: Vec<RawEvent> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.block_number >= range.from && e.block_number <= range.to)
            .cloned()
            .collect();
        out.sort_by_key(RawEvent::position);
        Ok(out)
    }
}

#[derive(Clone, Default)]
struct FakeRelay {
    scripted: Arc<Mutex<HashMap<String, VecDeque<Result<(), DeliveryError>>>>>,
    calls: Arc<Mutex<Vec<String>>>,
    hang: Arc<Mutex<bool>>,
}

impl FakeRelay {
    fn script(&self, id: &str, outcomes: Vec<Result<(), DeliveryError>>) {
        self.scripted
            .lock()
            .unwrap()
            .insert(id.to_string(), outcomes.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RelayTransport for FakeRelay {
    async fn post(&self, payload: &NormalizedPayload) -> Result<(), DeliveryError> {
        let id = payload.transaction_id.clone();
        self.calls.lock().unwrap().push(id.clone());
        if *self.hang.lock().unwrap() {
            std::future::pending::<()>().await;
        }
        self.scripted
            .lock()
            .unwrap()
            .get_mut(&id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(()))
    }

    fn endpoint(&self) -> &str {
        "fake"
    }
}

/// Store whose writes can be switched to fail.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryProgressStore,
    fail_marks: Mutex<bool>,
}

#[async_trait]
impl ProgressStore for FlakyStore {
    async fn load(&self) -> Result<Option<ProgressRecord>, RelayError> {
        self.inner.load().await
    }

    async fn record_range(&self, to_block: u64) -> Result<(), RelayError> {
        self.inner.record_range(to_block).await
    }

    async fn has_processed(&self, id: &str) -> Result<bool, RelayError> {
        self.inner.has_processed(id).await
    }

    async fn mark_processed(&self, id: &str) -> Result<(), RelayError> {
        if *self.fail_marks.lock().unwrap() {
            return Err(RelayError::Store("disk full".into()));
        }
        self.inner.mark_processed(id).await
    }
}

/// Records every event's level, message and `tx_id` field.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<LogLine>>>);

#[derive(Debug, Clone, Default)]
struct LogLine {
    level: String,
    message: String,
    tx_id: Option<String>,
}

impl Visit for LogLine {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "tx_id" {
            self.tx_id = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

impl<S: tracing::Subscriber> Layer<S> for CapturedLogs {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut line = LogLine {
            level: event.metadata().level().to_string(),
            ..LogLine::default()
        };
        event.record(&mut line);
        self.0.lock().unwrap().push(line);
    }
}

impl CapturedLogs {
    fn lines(&self) -> Vec<LogLine> {
        self.0.lock().unwrap().clone()
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn event(id: &str, block: u64, log_index: u64) -> RawEvent {
    RawEvent {
        block_number: block,
        tx_hash: format!("0x{block:064x}"),
        log_index,
        fields: json!({
            "transactionId": id,
            "sender": "0x1111111111111111111111111111111111111111",
            "recipient": "0x2222222222222222222222222222222222222222",
            "amount": "1000000000000000000",
            "sourceChainId": 1,
            "destinationChainId": 137,
        }),
    }
}

fn config() -> PipelineConfig {
    PipelineBuilder::new()
        .id("test")
        .poll_interval_ms(10)
        .start_block_offset(100)
        .chain_timeout_ms(200)
        .max_attempts(3)
        .base_delay_ms(1)
        .max_delay_ms(5)
        .build_config()
        .unwrap()
}

fn pipeline(
    chain: &FakeChain,
    store: Arc<dyn ProgressStore>,
    relay: &FakeRelay,
) -> Pipeline<FakeChain, FakeRelay> {
    Pipeline::new(
        config(),
        chain.clone(),
        store,
        relay.clone(),
        CancellationToken::new(),
    )
}

fn completed(outcome: CycleOutcome) -> CycleReport {
    match outcome {
        CycleOutcome::Completed(report) => report,
        other => panic!("expected a completed cycle, got {other:?}"),
    }
}

/// Chain with head 110, "A" at block 101 and "B" at block 105; store checkpointed at 99.
fn scenario() -> (FakeChain, Arc<MemoryProgressStore>, FakeRelay) {
    let chain = FakeChain::at(110);
    chain.emit("A", 101, 0);
    chain.emit("B", 105, 2);
    (chain, Arc::new(MemoryProgressStore::with_checkpoint(99)), FakeRelay::default())
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn relays_both_events_and_checkpoints_range() {
    let (chain, store, relay) = scenario();
    let mut p = pipeline(&chain, store.clone(), &relay);

    let report = completed(p.run_cycle().await.unwrap());

    assert_eq!(report.range, Some(BlockRange::new(100, 110)));
    assert_eq!(report.delivered, vec!["A", "B"]);
    assert_eq!(relay.calls(), vec!["A", "B"]);
    let ids = store.relayed_ids();
    assert!(ids.contains("A") && ids.contains("B"));
    assert_eq!(store.last_scanned_block(), Some(110));
    assert_eq!(p.cursor(), Some(110));
    assert_eq!(p.state(), PipelineState::Idle);
}

#[tokio::test]
async fn already_relayed_event_is_not_sent_again() {
    let (chain, store, relay) = scenario();
    store.mark_processed("A").await.unwrap();
    let mut p = pipeline(&chain, store.clone(), &relay);

    let report = completed(p.run_cycle().await.unwrap());

    assert_eq!(relay.calls(), vec!["B"]);
    assert_eq!(report.delivered, vec!["B"]);
}

#[tokio::test]
async fn permanent_rejection_drops_event_but_advances_checkpoint() {
    let (chain, store, relay) = scenario();
    relay.script("B", vec![Err(DeliveryError::from_status(400, "bad payload"))]);
    let mut p = pipeline(&chain, store.clone(), &relay);

    let report = completed(p.run_cycle().await.unwrap());

    assert_eq!(report.dropped, vec!["B"]);
    assert_eq!(store.last_scanned_block(), Some(110));
    assert!(!store.relayed_ids().contains("B"));
    assert!(store.relayed_ids().contains("A"));
    assert_eq!(p.pending_len(), 0);
}

#[tokio::test]
async fn rescanned_event_is_relayed_once() {
    let (chain, store, relay) = scenario();
    let mut p = pipeline(&chain, store.clone(), &relay);
    completed(p.run_cycle().await.unwrap());

    // The same transaction id shows up again in a later range.
    chain.emit("A", 115, 0);
    chain.set_head(120);
    let report = completed(p.run_cycle().await.unwrap());

    assert_eq!(report.fetched, 1);
    assert!(report.delivered.is_empty());
    assert_eq!(relay.calls().iter().filter(|id| *id == "A").count(), 1);
    assert_eq!(store.last_scanned_block(), Some(120));
}

#[tokio::test]
async fn restart_between_mark_and_checkpoint_does_not_redeliver() {
    // A previous run delivered and marked "A" but crashed before recording [100, 110].
    let (chain, store, relay) = scenario();
    store.mark_processed("A").await.unwrap();
    assert_eq!(store.last_scanned_block(), Some(99));

    let mut p = pipeline(&chain, store.clone(), &relay);
    assert_eq!(p.initialize().await.unwrap(), 99);
    let report = completed(p.run_cycle().await.unwrap());

    assert_eq!(chain.fetched(), vec![BlockRange::new(100, 110)]);
    assert_eq!(relay.calls(), vec!["B"]);
    assert_eq!(report.delivered, vec!["B"]);
    assert_eq!(store.last_scanned_block(), Some(110));
}

#[tokio::test]
async fn delivers_in_block_then_log_index_order() {
    let chain = FakeChain::at(120);
    chain.emit("E", 118, 0);
    chain.emit("C", 105, 7);
    chain.emit("A", 101, 0);
    chain.emit("D", 110, 1);
    chain.emit("B", 105, 3);
    let store = Arc::new(MemoryProgressStore::with_checkpoint(99));
    let relay = FakeRelay::default();
    let mut p = pipeline(&chain, store, &relay);

    completed(p.run_cycle().await.unwrap());

    assert_eq!(relay.calls(), vec!["A", "B", "C", "D", "E"]);
}

#[tokio::test]
async fn connectivity_error_skips_cycle_without_moving_checkpoint() {
    let (chain, store, relay) = scenario();
    let mut p = pipeline(&chain, store.clone(), &relay);
    completed(p.run_cycle().await.unwrap());

    chain.set_head(130);
    chain.fail_next(RelayError::Connectivity("connection refused".into()));
    let outcome = p.run_cycle().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Skipped(RelayError::Connectivity(_))));
    assert_eq!(store.last_scanned_block(), Some(110));
    assert_eq!(p.cursor(), Some(110));

    let report = completed(p.run_cycle().await.unwrap());
    assert_eq!(report.range, Some(BlockRange::new(111, 130)));
    assert_eq!(store.last_scanned_block(), Some(130));
}

#[tokio::test]
async fn hung_chain_query_times_out_and_skips() {
    let (chain, store, relay) = scenario();
    *chain.hang_fetch.lock().unwrap() = true;
    let mut p = pipeline(&chain, store.clone(), &relay);

    let outcome = p.run_cycle().await.unwrap();

    assert!(matches!(outcome, CycleOutcome::Skipped(RelayError::Connectivity(_))));
    assert_eq!(store.last_scanned_block(), Some(99));
    assert!(relay.calls().is_empty());
}

#[tokio::test]
async fn first_run_starts_offset_behind_head() {
    let chain = FakeChain::at(500);
    let store = Arc::new(MemoryProgressStore::new());
    let relay = FakeRelay::default();
    let mut p = pipeline(&chain, store.clone(), &relay);

    let report = completed(p.run_cycle().await.unwrap());

    assert_eq!(report.range, Some(BlockRange::new(401, 500)));
    assert_eq!(store.last_scanned_block(), Some(500));
}

#[tokio::test]
async fn first_run_offset_clamps_at_genesis() {
    let chain = FakeChain::at(30);
    let store = Arc::new(MemoryProgressStore::new());
    let relay = FakeRelay::default();
    let mut p = pipeline(&chain, store, &relay);

    assert_eq!(p.initialize().await.unwrap(), 0);
}

#[tokio::test]
async fn cursor_at_head_is_idle() {
    let chain = FakeChain::at(110);
    let store = Arc::new(MemoryProgressStore::with_checkpoint(110));
    let relay = FakeRelay::default();
    let mut p = pipeline(&chain, store, &relay);

    let outcome = p.run_cycle().await.unwrap();

    assert!(matches!(outcome, CycleOutcome::Idle { cursor: 110 }));
    assert!(chain.fetched().is_empty());
}

#[tokio::test]
async fn store_failure_aborts_cycle_before_checkpoint() {
    let (chain, _, relay) = scenario();
    let store = Arc::new(FlakyStore::default());
    store.inner.record_range(99).await.unwrap();
    *store.fail_marks.lock().unwrap() = true;
    let mut p = pipeline(&chain, store.clone(), &relay);

    let err = p.run_cycle().await.unwrap_err();

    assert!(matches!(err, RelayError::Store(_)));
    assert_eq!(store.inner.last_scanned_block(), Some(99));
    assert_eq!(p.cursor(), Some(99));
    assert_eq!(p.state(), PipelineState::Idle);
}

#[tokio::test]
async fn exhausted_delivery_is_retried_next_cycle() {
    let (chain, store, relay) = scenario();
    let unavailable = || Err(DeliveryError::from_status(503, "unavailable"));
    relay.script("B", vec![unavailable(), unavailable(), unavailable(), Ok(())]);
    let mut p = pipeline(&chain, store.clone(), &relay);

    let report = completed(p.run_cycle().await.unwrap());
    assert_eq!(report.failed, vec!["B"]);
    assert_eq!(store.last_scanned_block(), Some(110));
    assert_eq!(p.pending_len(), 1);

    // Head has not moved: the queued payload is still re-attempted.
    let outcome = p.run_cycle().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Idle { .. }));
    assert_eq!(p.pending_len(), 0);
    assert!(store.relayed_ids().contains("B"));
    assert_eq!(relay.calls().iter().filter(|id| *id == "B").count(), 4);
}

#[tokio::test]
async fn duplicate_id_within_one_range_is_sent_once() {
    let chain = FakeChain::at(110);
    chain.emit("A", 101, 0);
    chain.emit("A", 101, 1);
    let store = Arc::new(MemoryProgressStore::with_checkpoint(99));
    let relay = FakeRelay::default();
    let mut p = pipeline(&chain, store, &relay);

    completed(p.run_cycle().await.unwrap());

    assert_eq!(relay.calls(), vec!["A"]);
}

#[tokio::test]
async fn undecodable_event_is_skipped() {
    let (chain, store, relay) = scenario();
    chain.events.lock().unwrap().push(RawEvent {
        block_number: 103,
        tx_hash: "0xbad".into(),
        log_index: 0,
        fields: json!({ "transactionId": "C" }),
    });
    let mut p = pipeline(&chain, store.clone(), &relay);

    let report = completed(p.run_cycle().await.unwrap());

    assert_eq!(report.undecodable, 1);
    assert_eq!(report.delivered, vec!["A", "B"]);
    assert_eq!(store.last_scanned_block(), Some(110));
}

#[tokio::test]
async fn run_stops_on_cancellation() {
    let (chain, store, relay) = scenario();
    let cancel = CancellationToken::new();
    let mut p = Pipeline::new(config(), chain.clone(), store.clone(), relay.clone(), cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    tokio::time::timeout(Duration::from_secs(5), p.run())
        .await
        .expect("pipeline did not stop")
        .unwrap();

    assert_eq!(p.state(), PipelineState::Stopped);
    assert_eq!(store.last_scanned_block(), Some(110));
}

#[tokio::test]
async fn cancellation_during_chain_query_leaves_checkpoint() {
    let (chain, store, relay) = scenario();
    *chain.hang_fetch.lock().unwrap() = true;
    let cancel = CancellationToken::new();
    let mut cfg = config();
    cfg.chain_timeout_ms = 60_000;
    let mut p = Pipeline::new(cfg, chain.clone(), store.clone(), relay.clone(), cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let outcome = p.run_cycle().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Cancelled));
    assert_eq!(p.state(), PipelineState::Stopped);
    assert_eq!(store.last_scanned_block(), Some(99));
}

#[tokio::test]
async fn permanent_rejection_logs_dropped_event_with_tx_id() {
    let logs = CapturedLogs::default();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(logs.clone()));

    let (chain, store, relay) = scenario();
    relay.script("B", vec![Err(DeliveryError::from_status(422, "schema mismatch"))]);
    let mut p = pipeline(&chain, store, &relay);
    completed(p.run_cycle().await.unwrap());

    let dropped: Vec<_> = logs
        .lines()
        .into_iter()
        .filter(|l| l.message.starts_with("dropped event"))
        .collect();
    assert_eq!(dropped.len(), 1, "lines: {:?}", logs.lines());
    assert_eq!(dropped[0].level, "ERROR");
    assert_eq!(dropped[0].tx_id.as_deref(), Some("B"));
}

#[tokio::test]
async fn cancellation_during_relay_post_leaves_checkpoint_and_id_unmarked() {
    let (chain, store, relay) = scenario();
    *relay.hang.lock().unwrap() = true;
    let cancel = CancellationToken::new();
    let mut p = Pipeline::new(config(), chain.clone(), store.clone(), relay.clone(), cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let outcome = tokio::time::timeout(Duration::from_secs(5), p.run_cycle())
        .await
        .expect("cycle did not observe cancellation")
        .unwrap();

    assert!(matches!(outcome, CycleOutcome::Cancelled));
    assert_eq!(relay.calls(), vec!["A"]);
    assert_eq!(store.last_scanned_block(), Some(99));
    assert!(!store.relayed_ids().contains("A"));
    assert_eq!(p.cursor(), Some(99));
    assert_eq!(p.state(), PipelineState::Stopped);
}

#[tokio::test]
async fn wide_backlog_is_scanned_in_capped_ranges() {
    let (chain, store, relay) = scenario();
    let mut cfg = config();
    cfg.max_blocks_per_cycle = 5;
    let mut p = Pipeline::new(cfg, chain.clone(), store.clone(), relay.clone(), CancellationToken::new());

    let first = completed(p.run_cycle().await.unwrap());
    assert_eq!(first.range, Some(BlockRange::new(100, 104)));
    assert_eq!(first.delivered, vec!["A"]);
    assert_eq!(first.behind, 6);
    assert_eq!(store.last_scanned_block(), Some(104));

    let second = completed(p.run_cycle().await.unwrap());
    assert_eq!(second.range, Some(BlockRange::new(105, 109)));
    assert_eq!(second.delivered, vec!["B"]);

    let third = completed(p.run_cycle().await.unwrap());
    assert_eq!(third.range, Some(BlockRange::new(110, 110)));
    assert_eq!(third.behind, 0);
    assert_eq!(store.last_scanned_block(), Some(110));
}

#[tokio::test]
async fn timed_out_fetch_narrows_the_next_range() {
    let (chain, store, relay) = scenario();
    *chain.hang_fetch.lock().unwrap() = true;
    let mut cfg = config();
    cfg.max_blocks_per_cycle = 8;
    let mut p = Pipeline::new(cfg, chain.clone(), store.clone(), relay.clone(), CancellationToken::new());

    let outcome = p.run_cycle().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Skipped(RelayError::Connectivity(_))));
    assert_eq!(p.span(), 4);

    *chain.hang_fetch.lock().unwrap() = false;
    let report = completed(p.run_cycle().await.unwrap());
    assert_eq!(report.range, Some(BlockRange::new(100, 103)));
    assert_eq!(p.span(), 8);
    assert_eq!(store.last_scanned_block(), Some(103));
}

#[tokio::test]
async fn run_catches_up_without_waiting_for_the_poll_interval() {
    let (chain, store, relay) = scenario();
    let cancel = CancellationToken::new();
    let mut cfg = config();
    cfg.poll_interval_ms = 60_000;
    cfg.max_blocks_per_cycle = 2;
    let mut p = Pipeline::new(cfg, chain.clone(), store.clone(), relay.clone(), cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    tokio::time::timeout(Duration::from_secs(5), p.run())
        .await
        .expect("pipeline did not stop")
        .unwrap();

    assert_eq!(store.last_scanned_block(), Some(110));
    assert_eq!(relay.calls(), vec!["A", "B"]);
    assert_eq!(chain.fetched().len(), 6);
}
