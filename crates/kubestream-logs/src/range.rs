//! Historical range search with adaptive backward widening

use chrono::{DateTime, TimeDelta, Utc};
use futures::TryStreamExt;
use std::ops::ControlFlow;
use tokio::sync::mpsc;
use tracing::debug;

use kubestream_types::{LogRecord, SearchCursor, SourceDescriptor, StdSelector};

use crate::buffer::RingBuffer;
use crate::error::{SearchError, SourceError, ValidationError};
use crate::filter::{RecordFilter, Verdict};
use crate::source::LogSource;
use crate::widen::{BackwardWindow, WindowProbe, widen_backward};

/// Records kept while searching for the minimum
pub const DEFAULT_BUFFER_CAPACITY: usize = 500;

/// Smallest first widening step, in seconds
pub const MIN_STEP_SECS: i64 = 3;

/// Slack added to `to` when resuming from a cursor so its record is re-read
pub const CURSOR_MARGIN_MS: i64 = 50;

/// Parameters of one historical query
#[derive(Clone, Debug)]
pub struct RangeQuery {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub selector: StdSelector,

    /// Keep widening until more than this many records matched
    pub minimum: usize,

    /// Content, level, structured-only and cursor stages
    pub filter: RecordFilter,

    /// Single pass over the whole history of the source, only the
    /// structured-only stage applies
    pub everything: bool,
}

impl RangeQuery {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>, selector: StdSelector) -> Self {
        Self {
            from,
            to,
            selector,
            minimum: 0,
            filter: RecordFilter::new(),
            everything: false,
        }
    }
}

/// Outcome of a range search
#[derive(Clone, Debug)]
pub struct RangeResult {
    /// Matching records, oldest first
    pub records: Vec<LogRecord>,

    /// How often the window was pushed back
    pub widenings: usize,

    /// Where the next page should resume
    pub cursor: SearchCursor,
}

/// Answers historical queries against one source
pub struct RangeSearcher<'a, S> {
    source: &'a S,
    descriptor: &'a SourceDescriptor,
    capacity: usize,
}

impl<'a, S: LogSource> RangeSearcher<'a, S> {
    pub fn new(source: &'a S, descriptor: &'a SourceDescriptor) -> Self {
        Self {
            source,
            descriptor,
            capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Reject queries that cannot be answered, before touching the source
    pub fn validate(&self, query: &RangeQuery) -> Result<(), ValidationError> {
        if query.selector.is_empty() {
            return Err(ValidationError::SelectorRequired);
        }
        if query.minimum > self.capacity {
            return Err(ValidationError::MinimumOutOfRange {
                value: query.minimum.to_string(),
                max: self.capacity,
            });
        }
        Ok(())
    }

    pub async fn search(&self, query: &RangeQuery) -> Result<RangeResult, SearchError> {
        self.validate(query)?;

        let (from, to) = if query.everything {
            (self.descriptor.created, Utc::now())
        } else if query.filter.cursor().is_some() {
            (query.from, query.to + TimeDelta::milliseconds(CURSOR_MARGIN_MS))
        } else {
            (query.from, query.to)
        };

        let mut probe = RangeProbe {
            source: self.source,
            descriptor: self.descriptor,
            query,
            buffer: RingBuffer::new(self.capacity),
            unbounded: Vec::new(),
            scanned_from: from,
        };
        let window = BackwardWindow::growing(from, to, TimeDelta::seconds(MIN_STEP_SECS));
        let widenings = widen_backward(window, &mut probe).await?;

        let scanned_from = probe.scanned_from;
        let records = if query.everything {
            probe.unbounded
        } else {
            probe.buffer.into_vec()
        };

        debug!(
            source = %self.descriptor.key(),
            buffer_size = records.len(),
            widenings,
            "sending logs to client"
        );

        Ok(RangeResult {
            cursor: SearchCursor {
                last_seen_id: records.first().map(|r| r.id),
                scanned_from: Some(scanned_from),
                scanned_to: Some(to),
            },
            records,
            widenings,
        })
    }

    /// Everything mode without collecting: send every record since the
    /// source was created into `tx` as it is read
    ///
    /// Returns how many records were sent. Stops early once `tx` is closed.
    pub async fn send_everything(
        &self,
        query: &RangeQuery,
        tx: mpsc::Sender<LogRecord>,
    ) -> Result<usize, SearchError> {
        self.validate(query)?;

        let mut records = self.source.fetch_between(
            self.descriptor,
            self.descriptor.created,
            Utc::now(),
            query.selector,
        );
        let mut sent = 0;
        while let Some(record) = records.try_next().await? {
            if !query.filter.passes_structure(&record) {
                continue;
            }
            if tx.send(record).await.is_err() {
                debug!(source = %self.descriptor.key(), sent, "client went away");
                break;
            }
            sent += 1;
        }

        debug!(source = %self.descriptor.key(), sent, "sent whole history to client");
        Ok(sent)
    }
}

struct RangeProbe<'a, S> {
    source: &'a S,
    descriptor: &'a SourceDescriptor,
    query: &'a RangeQuery,
    buffer: RingBuffer<LogRecord>,
    /// Everything-mode output, not capped by the buffer
    unbounded: Vec<LogRecord>,
    scanned_from: DateTime<Utc>,
}

impl<S: LogSource> WindowProbe for RangeProbe<'_, S> {
    type Error = SourceError;

    async fn probe(
        &mut self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<ControlFlow<()>, SourceError> {
        self.buffer.clear();
        self.scanned_from = from;

        let mut records =
            self.source
                .fetch_between(self.descriptor, from, to, self.query.selector);

        if self.query.everything {
            while let Some(record) = records.try_next().await? {
                if self.query.filter.passes_structure(&record) {
                    self.unbounded.push(record);
                }
            }
            return Ok(ControlFlow::Break(()));
        }

        // Candidates go straight into the bounded buffer as they are read
        while let Some(record) = records.try_next().await? {
            match self.query.filter.evaluate(&record) {
                Verdict::Accept => self.buffer.push(record),
                Verdict::Reject => {}
                Verdict::Boundary => {
                    debug!(last_seen_id = record.id, "found last seen id");
                    break;
                }
            }
        }

        if self.buffer.len() > self.query.minimum || from < self.descriptor.created {
            Ok(ControlFlow::Break(()))
        } else {
            Ok(ControlFlow::Continue(()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySources;
    use kubestream_types::{Payload, SourceKey};

    fn at(t0: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
        t0 + TimeDelta::seconds(secs)
    }

    /// Source created at `created` with info records at the given offsets from `t0`
    fn seeded(
        t0: DateTime<Utc>,
        created: DateTime<Utc>,
        offsets: impl IntoIterator<Item = i64>,
    ) -> (MemorySources, SourceDescriptor) {
        let sources = MemorySources::new();
        let descriptor = SourceDescriptor::new("local", "api", created);
        let key = descriptor.key();
        sources.insert(descriptor.clone());
        sources.extend_history(
            &key,
            offsets.into_iter().enumerate().map(|(i, offset)| {
                LogRecord::text(&key, i as u32 + 1, at(t0, offset), "info", format!("line {}", i + 1))
            }),
        );
        (sources, descriptor)
    }

    fn ceil_log2(ratio: f64) -> usize {
        ratio.log2().ceil() as usize
    }

    #[tokio::test]
    async fn test_initial_window_satisfies_minimum() {
        let t0 = Utc::now() - TimeDelta::hours(1);
        let (sources, descriptor) = seeded(t0, t0, 1..=10);

        let mut query = RangeQuery::new(t0, at(t0, 5), StdSelector::STDOUT);
        query.minimum = 3;
        query.filter = RecordFilter::new().with_levels(["info"]);

        let result = RangeSearcher::new(&sources, &descriptor)
            .search(&query)
            .await
            .unwrap();

        assert_eq!(result.widenings, 0);
        assert!(result.records.len() >= 3);
        let first: Vec<_> = result.records.iter().take(3).map(|r| r.id).collect();
        assert_eq!(first, vec![1, 2, 3]);
        assert_eq!(result.cursor.last_seen_id, Some(1));
    }

    #[tokio::test]
    async fn test_widens_until_minimum_met() {
        let t0 = Utc::now();
        let offsets: Vec<i64> = (1..=60).map(|k| -60 * k).collect();
        let (sources, descriptor) = seeded(t0, at(t0, -3600), offsets);

        let mut query = RangeQuery::new(at(t0, -1), t0, StdSelector::ALL);
        query.minimum = 10;

        let result = RangeSearcher::new(&sources, &descriptor)
            .search(&query)
            .await
            .unwrap();

        assert_eq!(result.records.len(), 12);
        assert_eq!(result.widenings, 8);
        assert!(result.widenings <= ceil_log2(766.0 / 3.0) + 1);
        assert_eq!(sources.fetch_count(), result.widenings + 1);
        assert!(result.records.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_stops_at_creation_when_history_runs_out() {
        let t0 = Utc::now();
        let (sources, descriptor) = seeded(t0, at(t0, -100), [-90, -50, -10]);

        let mut query = RangeQuery::new(at(t0, -1), t0, StdSelector::ALL);
        query.minimum = 50;

        let result = RangeSearcher::new(&sources, &descriptor)
            .search(&query)
            .await
            .unwrap();

        assert_eq!(result.records.len(), 3);
        assert!(result.widenings <= ceil_log2(100.0 / 3.0) + 1);
        assert!(result.cursor.scanned_from.unwrap() < descriptor.created);
    }

    #[tokio::test]
    async fn test_cursor_excludes_delivered_records() {
        let t0 = Utc::now() - TimeDelta::hours(1);
        let (sources, descriptor) = seeded(t0, t0, 1..=10);

        let mut query = RangeQuery::new(at(t0, 5), at(t0, 8), StdSelector::ALL);
        query.filter = RecordFilter::new().with_cursor(Some(8));

        let result = RangeSearcher::new(&sources, &descriptor)
            .search(&query)
            .await
            .unwrap();

        let ids: Vec<_> = result.records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![5, 6, 7]);
    }

    #[tokio::test]
    async fn test_empty_levels_return_nothing() {
        let t0 = Utc::now() - TimeDelta::hours(1);
        let (sources, descriptor) = seeded(t0, t0, 1..=10);

        let mut query = RangeQuery::new(t0, at(t0, 11), StdSelector::ALL);
        query.filter = RecordFilter::new()
            .with_pattern("line")
            .unwrap()
            .with_levels(Vec::<String>::new());

        let result = RangeSearcher::new(&sources, &descriptor)
            .search(&query)
            .await
            .unwrap();
        assert!(result.records.is_empty());
    }

    #[tokio::test]
    async fn test_everything_ignores_levels_but_not_structure() {
        let t0 = Utc::now() - TimeDelta::hours(1);
        let (sources, descriptor) = seeded(t0, t0, 1..=4);
        let key = descriptor.key();
        let mut structured = LogRecord::text(&key, 99, at(t0, 2), "debug", "");
        structured.payload = Payload::Structured(serde_json::json!({"msg": "hello"}));
        sources.extend_history(&key, [structured]);

        let mut query = RangeQuery::new(at(t0, 3), at(t0, 4), StdSelector::ALL);
        query.everything = true;
        query.filter = RecordFilter::new().with_levels(["error"]);

        let result = RangeSearcher::new(&sources, &descriptor)
            .search(&query)
            .await
            .unwrap();
        let ids: Vec<_> = result.records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 99, 3, 4]);
        assert_eq!(result.widenings, 0);

        query.filter = RecordFilter::new().with_structured_only(true);
        let result = RangeSearcher::new(&sources, &descriptor)
            .search(&query)
            .await
            .unwrap();
        let ids: Vec<_> = result.records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![99]);
    }

    #[tokio::test]
    async fn test_buffer_caps_a_dense_window() {
        let t0 = Utc::now() - TimeDelta::hours(1);
        let sources = MemorySources::new();
        let descriptor = SourceDescriptor::new("local", "api", t0);
        let key = descriptor.key();
        sources.insert(descriptor.clone());
        sources.extend_history(
            &key,
            (1..=5000).map(|i| {
                LogRecord::text(&key, i, t0 + TimeDelta::milliseconds(i as i64), "info", "tick")
            }),
        );

        let query = RangeQuery::new(t0, at(t0, 10), StdSelector::ALL);
        let result = RangeSearcher::new(&sources, &descriptor)
            .with_capacity(10)
            .search(&query)
            .await
            .unwrap();

        // Only the newest records of the window survive
        let ids: Vec<_> = result.records.iter().map(|r| r.id).collect();
        assert_eq!(ids, (4991..=5000).collect::<Vec<u32>>());
        assert_eq!(result.widenings, 0);
    }

    #[tokio::test]
    async fn test_send_everything_streams_history() {
        let t0 = Utc::now() - TimeDelta::hours(1);
        let (sources, descriptor) = seeded(t0, t0, 1..=20);

        let mut query = RangeQuery::new(t0, t0, StdSelector::ALL);
        query.everything = true;
        query.filter = RecordFilter::new().with_levels(["error"]);

        let searcher = RangeSearcher::new(&sources, &descriptor).with_capacity(5);
        let (tx, mut rx) = mpsc::channel(1);
        let (sent, ids) = tokio::join!(searcher.send_everything(&query, tx), async {
            let mut ids = Vec::new();
            while let Some(record) = rx.recv().await {
                ids.push(record.id);
            }
            ids
        });

        assert_eq!(sent.unwrap(), 20);
        assert_eq!(ids, (1..=20).collect::<Vec<u32>>());
        assert_eq!(sources.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_send_everything_stops_when_client_leaves() {
        let t0 = Utc::now() - TimeDelta::hours(1);
        let (sources, descriptor) = seeded(t0, t0, 1..=1000);

        let mut query = RangeQuery::new(t0, t0, StdSelector::ALL);
        query.everything = true;

        let searcher = RangeSearcher::new(&sources, &descriptor);
        let (tx, mut rx) = mpsc::channel(1);
        let (sent, first) = tokio::join!(searcher.send_everything(&query, tx), async move {
            rx.recv().await.map(|r| r.id)
        });

        assert_eq!(first, Some(1));
        assert!(sent.unwrap() < 10);
    }

    #[tokio::test]
    async fn test_validation() {
        let t0 = Utc::now();
        let (sources, descriptor) = seeded(t0, t0, []);
        let searcher = RangeSearcher::new(&sources, &descriptor).with_capacity(10);

        let query = RangeQuery::new(t0, t0, StdSelector::NONE);
        assert!(matches!(
            searcher.search(&query).await,
            Err(SearchError::Validation(ValidationError::SelectorRequired))
        ));

        let mut query = RangeQuery::new(t0, t0, StdSelector::ALL);
        query.minimum = 11;
        assert!(matches!(
            searcher.search(&query).await,
            Err(SearchError::Validation(ValidationError::MinimumOutOfRange { .. }))
        ));
        assert_eq!(sources.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_source_failure_is_fatal() {
        let t0 = Utc::now();
        let (sources, descriptor) = seeded(t0, t0, [1]);
        sources.fail_queries(&SourceKey::new("local", "api"));

        let query = RangeQuery::new(t0, at(t0, 5), StdSelector::ALL);
        let result = RangeSearcher::new(&sources, &descriptor).search(&query).await;
        assert!(matches!(result, Err(SearchError::Source(SourceError::Query { .. }))));
    }
}
