//! Seeds a filtered live session with recent matching history

use chrono::{DateTime, TimeDelta, Utc};
use futures::TryStreamExt;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use kubestream_types::{LogRecord, SourceDescriptor, StdSelector};

use crate::error::SourceError;
use crate::filter::RecordFilter;
use crate::source::{LogSource, deliver};
use crate::widen::{BackwardWindow, WindowProbe, widen_backward};

/// Shortest first window; shorter ones are widened to this
pub const MIN_BACKFILL_WINDOW: Duration = Duration::from_secs(1);

/// Backfill tuning
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackfillOptions {
    /// Stop once this many matches were delivered
    pub minimum: usize,

    /// Span of the first (most recent) window
    pub initial_window: Duration,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            minimum: 50,
            initial_window: Duration::from_secs(10),
        }
    }
}

/// Search backwards from `now` across `known` sources, sending each round's
/// matches as one time-ordered batch
///
/// Returns the number of batches sent. Stops when enough matches were found,
/// when every source was created after the current window, or when the
/// session goes away.
#[allow(clippy::too_many_arguments)]
pub async fn run_backfill<S: LogSource>(
    source: &S,
    known: &[SourceDescriptor],
    selector: StdSelector,
    filter: &RecordFilter,
    options: BackfillOptions,
    now: DateTime<Utc>,
    tx: mpsc::Sender<Vec<LogRecord>>,
    cancel: CancellationToken,
) -> Result<usize, SourceError> {
    let span = TimeDelta::from_std(options.initial_window.max(MIN_BACKFILL_WINDOW))
        .unwrap_or(TimeDelta::MAX);
    let mut probe = BackfillProbe {
        source,
        known,
        selector,
        filter,
        remaining: options.minimum,
        tx,
        cancel,
        batches: 0,
    };

    if probe.remaining > 0 {
        widen_backward(BackwardWindow::sliding(now, span), &mut probe).await?;
    }
    Ok(probe.batches)
}

struct BackfillProbe<'a, S> {
    source: &'a S,
    known: &'a [SourceDescriptor],
    selector: StdSelector,
    filter: &'a RecordFilter,
    remaining: usize,
    tx: mpsc::Sender<Vec<LogRecord>>,
    cancel: CancellationToken,
    batches: usize,
}

impl<S: LogSource> WindowProbe for BackfillProbe<'_, S> {
    type Error = SourceError;

    async fn probe(
        &mut self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<ControlFlow<()>, SourceError> {
        let mut matches = Vec::new();
        let mut covered = false;

        for descriptor in self.known {
            if to < descriptor.created {
                continue;
            }
            covered = true;

            let mut records = self
                .source
                .fetch_between(descriptor, from, to, self.selector);
            while let Some(record) = records.try_next().await? {
                if self.filter.matches_content(&record) {
                    matches.push(record);
                }
            }
        }

        // History exhausted for every known source
        if !covered {
            return Ok(ControlFlow::Break(()));
        }

        self.remaining = self.remaining.saturating_sub(matches.len());
        matches.sort_by_key(|r| r.timestamp);

        if !matches.is_empty() {
            if !deliver(&self.tx, matches, &self.cancel).await {
                return Ok(ControlFlow::Break(()));
            }
            self.batches += 1;
        }

        if self.remaining == 0 {
            Ok(ControlFlow::Break(()))
        } else {
            Ok(ControlFlow::Continue(()))
        }
    }
}
