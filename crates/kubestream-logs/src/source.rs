//! Boundary to the systems that own containers and their logs

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::future::Future;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use kubestream_types::{LogRecord, SourceDescriptor, SourcePredicate, StdSelector};

use crate::error::SourceError;

/// How a live tail ended when it did not fail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TailExit {
    /// The source has nothing more to produce (stopped or removed)
    EndOfData,
    /// The session went away
    Cancelled,
}

/// Reads historical and live records of a single source
pub trait LogSource: Send + Sync + 'static {
    /// Records with `from <= timestamp < to`, oldest first
    ///
    /// Records are read as the stream is polled; dropping it stops the read.
    fn fetch_between<'a>(
        &'a self,
        source: &'a SourceDescriptor,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        selector: StdSelector,
    ) -> BoxStream<'a, Result<LogRecord, SourceError>>;

    /// Follow the source from `since`, pushing records into `tx` until it
    /// ends, `cancel` fires or the receiver is dropped
    fn tail(
        &self,
        source: &SourceDescriptor,
        since: DateTime<Utc>,
        selector: StdSelector,
        tx: mpsc::Sender<LogRecord>,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<TailExit, SourceError>> + Send;
}

/// Knows which sources exist and announces new ones
pub trait MembershipTracker: Send + Sync + 'static {
    fn find(
        &self,
        host: &str,
        id: &str,
    ) -> impl Future<Output = Result<SourceDescriptor, SourceError>> + Send;

    /// Partial failures are returned alongside whatever could be listed
    fn list_matching(
        &self,
        predicate: &SourcePredicate,
    ) -> impl Future<Output = (Vec<SourceDescriptor>, Vec<SourceError>)> + Send;

    /// Push sources that start matching `predicate` into `tx` until `cancel` fires
    fn subscribe_started(
        &self,
        predicate: SourcePredicate,
        tx: mpsc::Sender<SourceDescriptor>,
        cancel: CancellationToken,
    ) -> impl Future<Output = ()> + Send;
}

/// Send `item` unless the session is cancelled first
///
/// Returns false when the item was not delivered.
pub async fn deliver<T>(tx: &mpsc::Sender<T>, item: T, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}
