//! Pods as log sources

use chrono::{DateTime, Utc};
use futures::future;
use futures::stream::{self, BoxStream};
use futures::{AsyncBufReadExt, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::{ListParams, LogParams};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kubestream_logs::{LogParser, LogSource, MembershipTracker, SourceError, TailExit, deliver};
use kubestream_types::{
    GROUP_LABEL, LogRecord, SourceDescriptor, SourceKey, SourcePredicate, SourceState,
    StdSelector, StdStream,
};

/// Default pause between pod list polls
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(2);

/// Pods of a fixed set of namespaces; the namespace is the source's host
pub struct KubeSources {
    client: kube::Client,

    /// Namespaces clients may read
    namespaces: Vec<String>,

    /// Container to read in multi-container pods
    container: Option<String>,

    discovery_interval: Duration,
}

impl KubeSources {
    pub fn new(client: kube::Client, namespaces: Vec<String>) -> Self {
        Self {
            client,
            namespaces,
            container: None,
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
        }
    }

    pub fn with_container(mut self, container: Option<String>) -> Self {
        self.container = container;
        self
    }

    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }

    fn is_visible(&self, namespace: &str) -> bool {
        self.namespaces.iter().any(|ns| ns == namespace)
    }

    fn check_visible(&self, key: &SourceKey) -> Result<(), SourceError> {
        if self.is_visible(&key.host) {
            Ok(())
        } else {
            Err(SourceError::Forbidden(key.clone()))
        }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn log_params(&self, since: DateTime<Utc>, follow: bool) -> LogParams {
        LogParams {
            follow,
            container: self.container.clone(),
            since_time: Some(since),
            timestamps: true,
            ..Default::default()
        }
    }

    async fn list_namespace(&self, namespace: &str) -> Result<Vec<SourceDescriptor>, SourceError> {
        let list = self
            .pods(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|err| query_error(&SourceKey::new(namespace, "*"), err))?;

        Ok(list
            .items
            .iter()
            .map(|pod| pod_to_descriptor(pod, namespace))
            .collect())
    }
}

/// Convert a pod to the descriptor of its log source
pub fn pod_to_descriptor(pod: &Pod, namespace: &str) -> SourceDescriptor {
    let name = pod.metadata.name.clone().unwrap_or_default();
    let created = pod
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|time| time.0)
        .unwrap_or_else(Utc::now);

    let mut descriptor = SourceDescriptor::new(namespace, name, created);

    if let Some(status) = &pod.status {
        descriptor.state = status
            .phase
            .as_deref()
            .map(SourceState::from)
            .unwrap_or(SourceState::Unknown);
        if let Some(started) = &status.start_time {
            descriptor.started_at = started.0;
        }
    } else {
        descriptor.state = SourceState::Unknown;
    }

    if let Some(labels) = &pod.metadata.labels {
        descriptor.labels = labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
    }
    descriptor.group = descriptor.label(GROUP_LABEL).map(str::to_string);

    descriptor
}

/// Status codes the API server uses for missing and forbidden pods
fn api_error(key: &SourceKey, err: &kube::Error) -> Option<SourceError> {
    match err {
        kube::Error::Api(response) if response.code == 404 => {
            Some(SourceError::NotFound(key.clone()))
        }
        kube::Error::Api(response) if response.code == 403 => {
            Some(SourceError::Forbidden(key.clone()))
        }
        _ => None,
    }
}

fn query_error(key: &SourceKey, err: kube::Error) -> SourceError {
    api_error(key, &err).unwrap_or_else(|| SourceError::query(key, err))
}

fn tail_error(key: &SourceKey, err: kube::Error) -> SourceError {
    api_error(key, &err).unwrap_or_else(|| SourceError::tail(key, err))
}

/// Parse a log line of a pod; Kubernetes merges both streams
fn parse_line(line: &str, key: &SourceKey) -> LogRecord {
    LogParser::parse(line, key, StdStream::Stdout)
}

impl LogSource for KubeSources {
    fn fetch_between<'a>(
        &'a self,
        source: &'a SourceDescriptor,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        selector: StdSelector,
    ) -> BoxStream<'a, Result<LogRecord, SourceError>> {
        let key = source.key();

        let lines = {
            let key = key.clone();
            stream::once(async move {
                self.check_visible(&key)?;
                let reader = self
                    .pods(&key.host)
                    .log_stream(&key.id, &self.log_params(from, false))
                    .await
                    .map_err(|err| query_error(&key, err))?;
                Ok::<_, SourceError>(
                    reader
                        .lines()
                        .map_err(move |err| SourceError::query(&key, err)),
                )
            })
            .try_flatten()
        };

        lines
            .map_ok(move |line| parse_line(&line, &key))
            // since_time only has second precision
            .try_skip_while(move |record| future::ready(Ok(record.timestamp < from)))
            .try_take_while(move |record| future::ready(Ok(record.timestamp < to)))
            .try_filter(move |record| future::ready(selector.includes(record.stream)))
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
        self.check_visible(&key)?;

        let stream = self
            .pods(&key.host)
            .log_stream(&key.id, &self.log_params(since, true))
            .await
            .map_err(|err| tail_error(&key, err))?;
        let mut lines = stream.lines();
        debug!(source = %key, %since, "following pod log");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(TailExit::Cancelled),

                result = lines.try_next() => {
                    match result {
                        Ok(Some(line)) => {
                            let record = parse_line(&line, &key);
                            if record.timestamp < since || !selector.includes(record.stream) {
                                continue;
                            }
                            if !deliver(&tx, record, &cancel).await {
                                return Ok(TailExit::Cancelled);
                            }
                        }
                        // Stream ended (pod terminated?)
                        Ok(None) => return Ok(TailExit::EndOfData),
                        Err(err) => return Err(SourceError::tail(&key, err)),
                    }
                }
            }
        }
    }
}

impl MembershipTracker for KubeSources {
    async fn find(&self, host: &str, id: &str) -> Result<SourceDescriptor, SourceError> {
        let key = SourceKey::new(host, id);
        self.check_visible(&key)?;

        match self.pods(host).get_opt(id).await {
            Ok(Some(pod)) => Ok(pod_to_descriptor(&pod, host)),
            Ok(None) => Err(SourceError::NotFound(key)),
            Err(err) => Err(query_error(&key, err)),
        }
    }

    async fn list_matching(
        &self,
        predicate: &SourcePredicate,
    ) -> (Vec<SourceDescriptor>, Vec<SourceError>) {
        let mut found = Vec::new();
        let mut errors = Vec::new();

        let namespaces: Vec<&str> = match predicate {
            SourcePredicate::Id(key) => vec![key.host.as_str()],
            SourcePredicate::Ids { host, .. } => vec![host.as_str()],
            _ => self.namespaces.iter().map(String::as_str).collect(),
        };

        for namespace in namespaces {
            if !self.is_visible(namespace) {
                errors.push(SourceError::Forbidden(SourceKey::new(namespace, "*")));
                continue;
            }
            match self.list_namespace(namespace).await {
                Ok(pods) => found.extend(pods.into_iter().filter(|d| predicate.matches(d))),
                Err(err) => errors.push(err),
            }
        }

        found.sort_by(|a, b| a.key().cmp(&b.key()));
        (found, errors)
    }

    async fn subscribe_started(
        &self,
        predicate: SourcePredicate,
        tx: mpsc::Sender<SourceDescriptor>,
        cancel: CancellationToken,
    ) {
        let mut known: HashSet<SourceKey> = HashSet::new();
        let mut ticker = tokio::time::interval(self.discovery_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let (found, errors) = self.list_matching(&predicate).await;
            if let Some(first) = errors.first() {
                warn!(error = %first, failures = errors.len(), "error while discovering pods");
                // Keep what we know rather than re-announce after a failed poll
                continue;
            }

            let running: Vec<_> = found.into_iter().filter(|d| d.is_running()).collect();
            let current: HashSet<SourceKey> = running.iter().map(|d| d.key()).collect();

            for descriptor in running {
                if known.insert(descriptor.key()) && !deliver(&tx, descriptor, &cancel).await {
                    return;
                }
            }
            known.retain(|key| current.contains(key));
        }
    }
}
