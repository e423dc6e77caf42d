//! Live session: merges the tails of many sources into one ordered event
//! stream, follows sources as they appear, and keeps the client alive with
//! heartbeats.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use kubestream_types::{LogRecord, SourceEvent, SourcePredicate, StdSelector};

use crate::backfill::{BackfillOptions, run_backfill};
use crate::error::ValidationError;
use crate::filter::RecordFilter;
use crate::source::{LogSource, MembershipTracker, TailExit, deliver};
use crate::stream::LogStreamManager;

/// Records buffered between the tails and the session loop
const LIVE_BUFFER: usize = 256;

/// Default interval between heartbeats
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(5);

/// What a live session sends to its client
#[derive(Clone, Debug)]
pub enum SessionEvent {
    Record(LogRecord),
    Source(SourceEvent),
    Backfill(Vec<LogRecord>),
    Heartbeat,
}

#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub selector: StdSelector,
    pub filter: RecordFilter,
    pub heartbeat: Duration,
    pub backfill: BackfillOptions,
}

impl SessionOptions {
    pub fn new(selector: StdSelector) -> Self {
        Self {
            selector,
            filter: RecordFilter::new(),
            heartbeat: DEFAULT_HEARTBEAT,
            backfill: BackfillOptions::default(),
        }
    }

    pub fn with_filter(mut self, filter: RecordFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_backfill(mut self, backfill: BackfillOptions) -> Self {
        self.backfill = backfill;
        self
    }
}

/// Counters reported when a session closes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub records: usize,
    pub backfill_batches: usize,
    pub sources_started: usize,
    pub sources_stopped: usize,
    pub heartbeats: usize,
}

/// One live session over every source matching a predicate
pub struct LiveMultiplexer<S> {
    source: Arc<S>,
    predicate: SourcePredicate,
    options: SessionOptions,
}

impl<S> LiveMultiplexer<S>
where
    S: LogSource + MembershipTracker,
{
    pub fn new(source: Arc<S>, predicate: SourcePredicate, options: SessionOptions) -> Self {
        Self {
            source,
            predicate,
            options,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.options.selector.is_empty() {
            return Err(ValidationError::SelectorRequired);
        }
        if self.options.heartbeat.is_zero() {
            return Err(ValidationError::ZeroInterval("heartbeat"));
        }
        if self.options.backfill.initial_window.is_zero() {
            return Err(ValidationError::ZeroInterval("backfill window"));
        }
        Ok(())
    }

    /// Run the session until `cancel` fires or the client stops reading
    ///
    /// Events go to `out`; nothing is sent once `cancel` has fired. Every
    /// task the session spawned has finished by the time this returns.
    pub async fn run(
        self,
        out: mpsc::Sender<SessionEvent>,
        cancel: CancellationToken,
    ) -> Result<SessionSummary, ValidationError> {
        self.validate()?;

        let session = cancel.child_token();
        let _guard = session.clone().drop_guard();
        let selector = self.options.selector;

        let (existing, errors) = self.source.list_matching(&self.predicate).await;
        if let Some(first) = errors.first() {
            warn!(error = %first, failures = errors.len(), "error while listing sources");
        }
        debug!(predicate = ?self.predicate, sources = existing.len(), "starting live session");

        // Only a filtered session is backfilled, and then live output starts
        // where the backfill starts so nothing is sent twice
        let reference = self.options.filter.has_pattern().then(Utc::now);

        let (live_tx, mut live_rx) = mpsc::channel(LIVE_BUFFER);
        let (started_tx, mut started_rx) = mpsc::channel(1);
        let (backfill_tx, mut backfill_rx) = mpsc::channel(1);
        let mut helpers = JoinSet::new();

        let mut backfill_open = false;
        if let Some(now) = reference {
            backfill_open = true;
            let source = Arc::clone(&self.source);
            let known = existing.clone();
            let filter = self.options.filter.clone();
            let options = self.options.backfill;
            let cancel = session.child_token();
            helpers.spawn(async move {
                let result = run_backfill(
                    &*source,
                    &known,
                    selector,
                    &filter,
                    options,
                    now,
                    backfill_tx,
                    cancel,
                )
                .await;
                match result {
                    Ok(batches) => debug!(batches, "backfill finished"),
                    Err(err) => error!(error = %err, "error while fetching logs for backfill"),
                }
            });
        } else {
            drop(backfill_tx);
        }

        {
            let source = Arc::clone(&self.source);
            let predicate = self.predicate.clone();
            let cancel = session.child_token();
            helpers.spawn(async move {
                source.subscribe_started(predicate, started_tx, cancel).await;
            });
        }

        let mut tails = LogStreamManager::new(
            Arc::clone(&self.source),
            selector,
            live_tx,
            session.child_token(),
            reference,
        );
        for descriptor in existing {
            tails.start(descriptor);
        }

        let mut heartbeat = tokio::time::interval(self.options.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut summary = SessionSummary::default();
        loop {
            let event = tokio::select! {
                _ = session.cancelled() => break,

                Some(record) = live_rx.recv() => {
                    if !self.options.filter.matches_content(&record) {
                        continue;
                    }
                    summary.records += 1;
                    SessionEvent::Record(record)
                }

                Some(descriptor) = started_rx.recv() => {
                    let key = descriptor.key();
                    if !tails.start(descriptor) {
                        continue;
                    }
                    debug!(source = %key, "source started");
                    summary.sources_started += 1;
                    SessionEvent::Source(SourceEvent::started(&key))
                }

                Some(outcome) = tails.next_finished(), if !tails.is_empty() => {
                    match outcome.exit {
                        Ok(TailExit::Cancelled) => continue,
                        Ok(TailExit::EndOfData) => {
                            debug!(source = %outcome.key, "streaming ended");
                        }
                        Err(err) => {
                            error!(source = %outcome.key, error = %err, "unknown error while streaming logs");
                        }
                    }
                    summary.sources_stopped += 1;
                    SessionEvent::Source(SourceEvent::stopped(&outcome.key))
                }

                batch = backfill_rx.recv(), if backfill_open => match batch {
                    Some(batch) => {
                        summary.backfill_batches += 1;
                        SessionEvent::Backfill(batch)
                    }
                    None => {
                        backfill_open = false;
                        continue;
                    }
                },

                _ = heartbeat.tick() => {
                    summary.heartbeats += 1;
                    SessionEvent::Heartbeat
                }
            };

            if !deliver(&out, event, &session).await {
                break;
            }
        }

        session.cancel();
        tails.stop().await;
        helpers.shutdown().await;
        debug!(?summary, "live session closed");
        Ok(summary)
    }
}
