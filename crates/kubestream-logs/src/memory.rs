//! In-process source backend
//!
//! Holds descriptors and their history in memory and lets callers drive live
//! output by hand. Backs the test suites and embedders that produce records
//! themselves.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use kubestream_types::{LogRecord, SourceDescriptor, SourceKey, SourcePredicate, StdSelector};

use crate::error::SourceError;
use crate::source::{LogSource, MembershipTracker, TailExit, deliver};

/// Capacity of each source's live fan-out
const LIVE_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
enum LiveItem {
    Record(LogRecord),
    End,
    Fail(String),
}

struct MemorySource {
    descriptor: SourceDescriptor,
    history: Vec<LogRecord>,
    live: broadcast::Sender<LiveItem>,
    fail_queries: bool,
}

struct Subscriber {
    predicate: SourcePredicate,
    tx: mpsc::Sender<SourceDescriptor>,
    cancel: CancellationToken,
}

/// Sources and records kept in memory
#[derive(Default)]
pub struct MemorySources {
    sources: Mutex<HashMap<SourceKey, MemorySource>>,
    subscribers: Mutex<Vec<Subscriber>>,
    fetches: Mutex<usize>,
}

impl MemorySources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source without announcing it to live sessions
    ///
    /// A source that is already registered only gets its descriptor
    /// replaced; its history and live tails are kept.
    pub fn insert(&self, descriptor: SourceDescriptor) {
        match self.sources.lock().entry(descriptor.key()) {
            Entry::Occupied(mut entry) => entry.get_mut().descriptor = descriptor,
            Entry::Vacant(entry) => {
                let (live, _) = broadcast::channel(LIVE_CAPACITY);
                entry.insert(MemorySource {
                    descriptor,
                    history: Vec::new(),
                    live,
                    fail_queries: false,
                });
            }
        }
    }

    /// Register a source and notify every live subscriber whose predicate matches
    pub async fn announce(&self, descriptor: SourceDescriptor) {
        self.insert(descriptor.clone());

        let targets: Vec<_> = {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|s| !s.cancel.is_cancelled());
            subscribers
                .iter()
                .filter(|s| s.predicate.matches(&descriptor))
                .map(|s| (s.tx.clone(), s.cancel.clone()))
                .collect()
        };

        for (tx, cancel) in targets {
            deliver(&tx, descriptor.clone(), &cancel).await;
        }
    }

    /// Append records to a source's history, keeping it ordered by time
    pub fn extend_history(&self, key: &SourceKey, records: impl IntoIterator<Item = LogRecord>) {
        if let Some(source) = self.sources.lock().get_mut(key) {
            source.history.extend(records);
            source.history.sort_by_key(|r| r.timestamp);
        }
    }

    /// Publish a record to everyone tailing the source; it also joins history
    pub fn emit(&self, record: LogRecord) {
        if let Some(source) = self.sources.lock().get_mut(&record.source_key()) {
            let at = source
                .history
                .partition_point(|r| r.timestamp <= record.timestamp);
            source.history.insert(at, record.clone());
            let _ = source.live.send(LiveItem::Record(record));
        }
    }

    /// End every tail of the source with end-of-data
    pub fn stop(&self, key: &SourceKey) {
        if let Some(source) = self.sources.lock().get_mut(key) {
            source.descriptor.state = kubestream_types::SourceState::Stopped;
            let _ = source.live.send(LiveItem::End);
        }
    }

    /// End every tail of the source with an error
    pub fn break_tail(&self, key: &SourceKey, message: &str) {
        if let Some(source) = self.sources.lock().get(key) {
            let _ = source.live.send(LiveItem::Fail(message.to_string()));
        }
    }

    /// Make historical queries of the source fail
    pub fn fail_queries(&self, key: &SourceKey) {
        if let Some(source) = self.sources.lock().get_mut(key) {
            source.fail_queries = true;
        }
    }

    /// Number of `fetch_between` calls served so far
    pub fn fetch_count(&self) -> usize {
        *self.fetches.lock()
    }

    /// Number of tails currently attached to the source
    pub fn tail_count(&self, key: &SourceKey) -> usize {
        self.sources
            .lock()
            .get(key)
            .map(|s| s.live.receiver_count())
            .unwrap_or(0)
    }

    /// Wait until at least `count` tails follow the source
    pub async fn wait_for_tails(&self, key: &SourceKey, count: usize) {
        while self.tail_count(key) < count {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    /// Wait until a live session subscribed to new sources
    pub async fn wait_for_subscribers(&self, count: usize) {
        loop {
            let live = {
                let mut subscribers = self.subscribers.lock();
                subscribers.retain(|s| !s.cancel.is_cancelled());
                subscribers.len()
            };
            if live >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    /// Next record of `key` in `[from, to)` at or after `position`, with the
    /// position to resume from
    ///
    /// `None` as position starts at the first record not older than `from`.
    fn next_between(
        &self,
        key: &SourceKey,
        position: Option<usize>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        selector: StdSelector,
    ) -> Result<Option<(LogRecord, Option<usize>)>, SourceError> {
        let sources = self.sources.lock();
        let entry = sources
            .get(key)
            .ok_or_else(|| SourceError::NotFound(key.clone()))?;
        if entry.fail_queries {
            return Err(SourceError::query(key, "backend unavailable"));
        }

        let start =
            position.unwrap_or_else(|| entry.history.partition_point(|r| r.timestamp < from));
        let rest = entry.history.get(start..).unwrap_or_default();
        Ok(rest
            .iter()
            .enumerate()
            .take_while(|(_, r)| r.timestamp < to)
            .find(|(_, r)| selector.includes(r.stream))
            .map(|(offset, r)| (r.clone(), Some(start + offset + 1))))
    }
}

impl LogSource for MemorySources {
    fn fetch_between<'a>(
        &'a self,
        source: &'a SourceDescriptor,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        selector: StdSelector,
    ) -> BoxStream<'a, Result<LogRecord, SourceError>> {
        *self.fetches.lock() += 1;

        // One record per poll, the history lock is never held across polls
        let key = source.key();
        stream::try_unfold(None, move |position| {
            futures::future::ready(self.next_between(&key, position, from, to, selector))
        })
        .boxed()
    }

    async fn tail(
        &self,
        source: &SourceDescriptor,
        since: DateTime<Utc>,
        selector: StdSelector,
        tx: mpsc::Sender<LogRecord>,
        cancel: CancellationToken,
    ) -> Result<TailExit, SourceError> {
        let key = source.key();
        let mut live = {
            let sources = self.sources.lock();
            let entry = sources.get(&key).ok_or(SourceError::NotFound(key.clone()))?;
            entry.live.subscribe()
        };

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return Ok(TailExit::Cancelled),
                item = live.recv() => item,
            };

            match item {
                Ok(LiveItem::Record(record)) => {
                    if record.timestamp < since || !selector.includes(record.stream) {
                        continue;
                    }
                    if !deliver(&tx, record, &cancel).await {
                        return Ok(TailExit::Cancelled);
                    }
                }
                Ok(LiveItem::End) | Err(broadcast::error::RecvError::Closed) => {
                    return Ok(TailExit::EndOfData);
                }
                Ok(LiveItem::Fail(message)) => return Err(SourceError::tail(&key, message)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    }
}

impl MembershipTracker for MemorySources {
    async fn find(&self, host: &str, id: &str) -> Result<SourceDescriptor, SourceError> {
        let key = SourceKey::new(host, id);
        self.sources
            .lock()
            .get(&key)
            .map(|s| s.descriptor.clone())
            .ok_or(SourceError::NotFound(key))
    }

    async fn list_matching(
        &self,
        predicate: &SourcePredicate,
    ) -> (Vec<SourceDescriptor>, Vec<SourceError>) {
        let mut found: Vec<_> = self
            .sources
            .lock()
            .values()
            .map(|s| s.descriptor.clone())
            .filter(|d| predicate.matches(d))
            .collect();
        found.sort_by(|a, b| a.key().cmp(&b.key()));
        (found, Vec::new())
    }

    async fn subscribe_started(
        &self,
        predicate: SourcePredicate,
        tx: mpsc::Sender<SourceDescriptor>,
        cancel: CancellationToken,
    ) {
        self.subscribers.lock().push(Subscriber {
            predicate,
            tx,
            cancel: cancel.clone(),
        });
        cancel.cancelled().await;
    }
}
