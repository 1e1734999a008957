//! The replication cascade run on every new connection.
//!
//! A cascade is a lazy sequence of steps, each fetching the history of one feed from the
//! remote:
//!
//! 1. the remote's own feed,
//! 2. our own feed, if it is missing locally,
//! 3. every feed present in the local store, skipping feeds already fetched in this cascade.
//!
//! Every step continues from the local cursor of its feed. A step the remote refuses before
//! sending anything is skipped, any other failure ends the cascade. Entries appended before a
//! failure stay.

use std::{collections::HashSet, sync::Arc, time::Duration};

use n0_future::stream::StreamExt;
use nested_enum_utils::common_fields;
use serde_json::Value;
use snafu::{Backtrace, IntoError, ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{CREATE_HISTORY_STREAM, HistoryArgs};
use crate::{
    config::CascadeConfig,
    message::Message,
    metrics::GossipMetrics,
    refs::{FeedRef, Seq},
    rpc::{CallError, Endpoint, Method, Payload},
    store::{FeedStore, StoreError},
    want::WantManager,
};

/// Errors fetching a single feed.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum FetchError {
    /// The remote refused the request before sending any entry.
    #[snafu(display("remote refused: {message}"))]
    Rejected { message: String },
    #[snafu(display("history request failed"))]
    Request { source: CallError },
    #[snafu(display("history stream aborted"))]
    Stream { source: CallError },
    #[snafu(display("expected a json entry, got binary data"))]
    UnexpectedPayload {},
    #[snafu(display("malformed entry"))]
    Malformed { source: serde_json::Error },
    #[snafu(display("entry of {got} in the history of {expected}"))]
    WrongAuthor { expected: FeedRef, got: FeedRef },
    #[snafu(display("expected sequence {expected}, got {got}"))]
    SequenceGap { expected: Seq, got: Seq },
    #[snafu(display("storage failure"))]
    Store { source: StoreError },
    #[snafu(display("step timed out after {timeout:?}"))]
    Timeout { timeout: Duration },
}

/// Why a feed is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum StepKind {
    /// The remote's own feed.
    Remote,
    /// Our own feed, which is missing locally.
    SelfBootstrap,
    /// A feed present in the local store.
    Followed,
}

/// The result of a single step.
#[derive(Debug)]
pub enum StepOutcome {
    /// The history was fetched completely.
    Fetched {
        kind: StepKind,
        feed: FeedRef,
        /// Entries appended to the local store.
        appended: u64,
        /// The cursor after the step.
        cursor: Seq,
    },
    /// The remote refused, the cascade continues.
    Skipped {
        kind: StepKind,
        feed: FeedRef,
        reason: String,
    },
    /// The step failed, the cascade is over.
    Failed {
        kind: StepKind,
        /// `None` if the failure happened while planning the step.
        feed: Option<FeedRef>,
        error: FetchError,
    },
    /// The node is shutting down, the cascade is over.
    Cancelled { kind: StepKind, feed: FeedRef },
}

impl StepOutcome {
    /// The kind of the step.
    pub fn kind(&self) -> StepKind {
        match self {
            StepOutcome::Fetched { kind, .. }
            | StepOutcome::Skipped { kind, .. }
            | StepOutcome::Failed { kind, .. }
            | StepOutcome::Cancelled { kind, .. } => *kind,
        }
    }

    /// Whether the cascade ends after this step.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepOutcome::Failed { .. } | StepOutcome::Cancelled { .. }
        )
    }
}

#[derive(Debug)]
enum Phase {
    Remote,
    SelfBootstrap,
    ListFeeds,
    Feeds(std::vec::IntoIter<FeedRef>),
    Done,
}

#[derive(Debug, Default)]
struct Progress {
    received: u64,
    appended: u64,
    cursor: Seq,
}

/// Replicates feeds from one connected peer.
#[derive(Debug)]
pub struct Cascade<S> {
    conn: Arc<dyn Endpoint>,
    store: S,
    wants: WantManager,
    me: FeedRef,
    remote: FeedRef,
    config: CascadeConfig,
    cancel: CancellationToken,
    metrics: Arc<GossipMetrics>,
    phase: Phase,
    fetched: HashSet<FeedRef>,
    steps: usize,
}

impl<S: FeedStore> Cascade<S> {
    /// Creates a cascade pulling from `conn`.
    pub fn new(
        conn: Arc<dyn Endpoint>,
        store: S,
        wants: WantManager,
        me: FeedRef,
        config: CascadeConfig,
        cancel: CancellationToken,
        metrics: Arc<GossipMetrics>,
    ) -> Self {
        let remote = FeedRef::ed25519(conn.remote());
        Self {
            conn,
            store,
            wants,
            me,
            remote,
            config,
            cancel,
            metrics,
            phase: Phase::Remote,
            fetched: HashSet::new(),
            steps: 0,
        }
    }

    /// The feed of the remote.
    pub fn remote(&self) -> &FeedRef {
        &self.remote
    }

    /// Runs the cascade to completion.
    pub async fn run(mut self) -> Vec<StepOutcome> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.next().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Runs the next step. Returns `None` once the cascade is over.
    pub async fn next(&mut self) -> Option<StepOutcome> {
        if self.config.max_steps.is_some_and(|max| self.steps >= max) {
            if !matches!(self.phase, Phase::Done) {
                debug!(steps = self.steps, "step limit reached");
                self.phase = Phase::Done;
            }
            return None;
        }
        let (kind, feed) = match self.plan() {
            Ok(Some(step)) => step,
            Ok(None) => return None,
            Err((kind, err)) => {
                warn!(%kind, "failed to plan replication step: {err}");
                self.phase = Phase::Done;
                self.metrics.cascade_failures.inc();
                return Some(StepOutcome::Failed {
                    kind,
                    feed: None,
                    error: StoreSnafu.into_error(err),
                });
            }
        };
        self.steps += 1;
        self.fetched.insert(feed);

        let timeout = self.config.step_timeout;
        let res = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            res = tokio::time::timeout(timeout, self.fetch_feed(feed)) => Some(res),
        };
        let outcome = match res {
            None => StepOutcome::Cancelled { kind, feed },
            Some(Err(_elapsed)) => StepOutcome::Failed {
                kind,
                feed: Some(feed),
                error: TimeoutSnafu { timeout }.build(),
            },
            Some(Ok(Ok(progress))) => StepOutcome::Fetched {
                kind,
                feed,
                appended: progress.appended,
                cursor: progress.cursor,
            },
            Some(Ok(Err(FetchError::Rejected { message, .. }))) => StepOutcome::Skipped {
                kind,
                feed,
                reason: message,
            },
            Some(Ok(Err(error))) => StepOutcome::Failed {
                kind,
                feed: Some(feed),
                error,
            },
        };

        match &outcome {
            StepOutcome::Fetched {
                appended, cursor, ..
            } => {
                debug!(%kind, %feed, appended, %cursor, "fetched feed");
                self.metrics.feeds_fetched.inc();
            }
            StepOutcome::Skipped { reason, .. } => {
                warn!(%kind, %feed, "remote refused feed: {reason}");
                self.metrics.feeds_skipped.inc();
            }
            StepOutcome::Failed { error, .. } => {
                warn!(%kind, %feed, "replication step failed: {error}");
                self.metrics.cascade_failures.inc();
            }
            StepOutcome::Cancelled { .. } => debug!(%kind, %feed, "replication cancelled"),
        }
        if outcome.is_terminal() {
            self.phase = Phase::Done;
        }
        Some(outcome)
    }

    /// Picks the feed of the next step.
    fn plan(&mut self) -> Result<Option<(StepKind, FeedRef)>, (StepKind, StoreError)> {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Remote => {
                    self.phase = Phase::SelfBootstrap;
                    return Ok(Some((StepKind::Remote, self.remote)));
                }
                Phase::SelfBootstrap => {
                    self.phase = Phase::ListFeeds;
                    let present = self
                        .store
                        .has_feed(&self.me)
                        .map_err(|err| (StepKind::SelfBootstrap, err))?;
                    if !present && !self.fetched.contains(&self.me) {
                        return Ok(Some((StepKind::SelfBootstrap, self.me)));
                    }
                }
                Phase::ListFeeds => {
                    let feeds = self
                        .store
                        .feeds()
                        .map_err(|err| (StepKind::Followed, err))?;
                    self.phase = Phase::Feeds(feeds.into_iter());
                }
                Phase::Feeds(mut feeds) => {
                    let next = feeds.by_ref().find(|feed| !self.fetched.contains(feed));
                    if let Some(feed) = next {
                        self.phase = Phase::Feeds(feeds);
                        return Ok(Some((StepKind::Followed, feed)));
                    }
                }
                Phase::Done => return Ok(None),
            }
        }
    }

    /// Pulls the history of `feed` past the local cursor.
    async fn fetch_feed(&self, feed: FeedRef) -> Result<Progress, FetchError> {
        let mut cursor = self.store.current_seq(&feed).context(StoreSnafu)?;
        let args = HistoryArgs::new(feed, cursor.next());
        let args = serde_json::to_value(&args).expect("history args always encode to json");
        trace!(%feed, %cursor, "requesting history");
        let mut stream = self
            .conn
            .source(Method::new(CREATE_HISTORY_STREAM), vec![args])
            .await
            .map_err(|err| remote_error(err, 0, RequestSnafu))?;

        let mut progress = Progress {
            cursor,
            ..Default::default()
        };
        while let Some(item) = stream.next().await {
            let item = item.map_err(|err| remote_error(err, progress.received, StreamSnafu))?;
            let Payload::Json(value) = item else {
                return UnexpectedPayloadSnafu.fail();
            };
            progress.received += 1;
            let message = parse_entry(value)?;
            snafu::ensure!(
                message.author == feed,
                WrongAuthorSnafu {
                    expected: feed,
                    got: message.author,
                }
            );
            if message.sequence <= cursor {
                trace!(%feed, seq = %message.sequence, "already have entry");
                continue;
            }
            snafu::ensure!(
                message.sequence == cursor.next(),
                SequenceGapSnafu {
                    expected: cursor.next(),
                    got: message.sequence,
                }
            );
            let blobs = message.blobs();
            match self.store.append(message) {
                Ok(seq) => cursor = seq,
                Err(StoreError::OutOfOrder { .. }) => {
                    // another connection appended concurrently
                    cursor = self.store.current_seq(&feed).context(StoreSnafu)?;
                    progress.cursor = cursor;
                    continue;
                }
                Err(err) => return Err(StoreSnafu.into_error(err)),
            }
            progress.appended += 1;
            progress.cursor = cursor;
            self.metrics.messages_appended.inc();
            for blob in blobs {
                if let Err(err) = self.wants.want(blob, None).await {
                    debug!(%blob, "failed to register want: {err}");
                }
            }
        }
        Ok(progress)
    }
}

fn parse_entry(value: Value) -> Result<Message, FetchError> {
    // entries may come wrapped in a `{ key, value }` envelope
    let value = match value {
        Value::Object(mut map) if map.contains_key("key") && map.contains_key("value") => {
            map.remove("value").unwrap_or_default()
        }
        value => value,
    };
    serde_json::from_value(value).context(MalformedSnafu)
}

/// A remote error before any entry arrived is a refusal, anything else is a failure.
fn remote_error<C>(err: CallError, received: u64, context: C) -> FetchError
where
    C: IntoError<FetchError, Source = CallError>,
{
    match err {
        CallError::Remote { message, .. } if received == 0 => RejectedSnafu { message }.build(),
        err => context.into_error(err),
    }
}
