//! Tracks the blobs we want and retrieves them from connected peers.
//!
//! The [`WantManager`] is a cheap handle to a single actor task that exclusively owns the want
//! set. All operations are messages to that task, so every transition of a want happens in
//! submission order and on one task.
//!
//! Once a blob is wanted the logic is as follows:
//! 1. The want is announced to every connected peer with a `blobs.want` call. Peers answer
//!    with the size of the blob if they have it, which is treated like
//!    [`WantManager::notify_have`].
//! 2. The first acceptable "have" moves the want to [`WantState::Fetching`] and starts a
//!    `blobs.get` call to that peer. Only one retrieval per blob runs at a time.
//! 3. Received content is verified against the hash and the size limit, stored, and the want
//!    is removed. Content that fails verification puts the want back so that another peer can
//!    be tried.
//!
//! Wants without any known source are announced again to every newly connected peer.

use std::{collections::HashMap, sync::Arc};

use bytes::{Bytes, BytesMut};
use n0_future::stream::StreamExt;
use nested_enum_utils::common_fields;
use serde_json::Value;
use snafu::{Backtrace, IntoError, ResultExt, Snafu};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinSet,
};
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{Instrument, debug, error_span, trace, warn};

use self::state::{OutEvent, Rejection, State};
pub use self::state::{WantEntry, WantState};
use crate::{
    blobs::{BLOBS_GET, BLOBS_WANT},
    metrics::WantMetrics,
    refs::{BlobRef, Hash, PeerId},
    rpc::{self, CallError, Endpoint, Method, Payload},
    store::{BlobStore, StoreError},
};

mod state;

/// Default maximum size of a blob, 5 MiB.
pub const DEFAULT_MAX_SIZE: u64 = 5 * 1024 * 1024;
/// Default number of verification failures after which a want expires.
pub const DEFAULT_MAX_VERIFY_FAILURES: u32 = 3;
/// Capacity of the channel to the actor.
const TO_ACTOR_CAP: usize = 64;

/// Errors of the want manager.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum WantError {
    /// The manager was closed.
    #[snafu(display("want manager is shut down"))]
    Cancelled {},
    #[snafu(display("want manager actor is gone"))]
    ActorClosed {},
    #[snafu(display("blob of {size} bytes exceeds the maximum of {max} bytes"))]
    TooLarge { size: u64, max: u64 },
    #[snafu(display("content does not match {blob}, hashes to {actual}"))]
    HashMismatch { blob: BlobRef, actual: Hash },
    #[snafu(display("failed to store blob"))]
    Store { source: StoreError },
}

impl WantError {
    fn rejected(blob: BlobRef, rejection: Rejection) -> Self {
        match rejection {
            Rejection::TooLarge { size, max } => TooLargeSnafu { size, max }.build(),
            Rejection::HashMismatch { actual } => HashMismatchSnafu { blob, actual }.build(),
        }
    }
}

#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
enum FetchError {
    #[snafu(display("fetch aborted"))]
    Aborted {},
    #[snafu(display("blobs.get failed"))]
    Call { source: CallError },
    #[snafu(display("expected binary content"))]
    UnexpectedPayload {},
    #[snafu(display("received {size} bytes, more than the maximum of {max}"))]
    Oversized { size: u64, max: u64 },
}

/// Builder for a [`WantManager`].
#[derive(Debug)]
pub struct Builder {
    cancel: CancellationToken,
    max_size: u64,
    max_verify_failures: u32,
    metrics: Arc<WantMetrics>,
    me: Option<PeerId>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            cancel: CancellationToken::new(),
            max_size: DEFAULT_MAX_SIZE,
            max_verify_failures: DEFAULT_MAX_VERIFY_FAILURES,
            metrics: Default::default(),
            me: None,
        }
    }
}

impl Builder {
    /// The scope of the manager. Cancelling it closes the manager.
    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Blobs larger than this are never fetched.
    pub fn max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    /// Number of verification failures after which a want expires.
    pub fn max_verify_failures(mut self, max: u32) -> Self {
        self.max_verify_failures = max;
        self
    }

    /// Where to record metrics.
    pub fn metrics(mut self, metrics: Arc<WantMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Our own identity, for logging.
    pub fn me(mut self, me: PeerId) -> Self {
        self.me = Some(me);
        self
    }

    /// Spawns the actor, storing resolved blobs in `store`.
    pub fn spawn<B: BlobStore>(self, store: B) -> WantManager {
        let (to_actor_tx, to_actor_rx) = mpsc::channel(TO_ACTOR_CAP);
        let state = State::new(self.max_size, self.max_verify_failures, self.metrics);
        let actor = Actor::new(state, store, to_actor_rx, self.cancel.clone());
        let me = self.me.map(|me| me.fmt_short()).unwrap_or_default();
        let task = tokio::spawn(actor.run().instrument(error_span!("wants", %me)));
        WantManager {
            to_actor_tx,
            cancel: self.cancel,
            max_size: self.max_size,
            _actor_handle: Arc::new(AbortOnDropHandle::new(task)),
        }
    }
}

/// Handle to the want manager.
#[derive(Debug, Clone)]
pub struct WantManager {
    to_actor_tx: mpsc::Sender<ToActor>,
    cancel: CancellationToken,
    max_size: u64,
    _actor_handle: Arc<AbortOnDropHandle<()>>,
}

impl WantManager {
    /// Creates a builder.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Registers desire for a blob, optionally with a peer known to have it.
    ///
    /// Wanting an already tracked blob only adds the hint. Blobs whose declared size exceeds
    /// the maximum are recorded as dropped.
    pub async fn want(&self, blob: BlobRef, hint: Option<PeerId>) -> Result<(), WantError> {
        self.send(ToActor::Want { blob, hint }).await
    }

    /// Records that `from` has `size` bytes of `blob`.
    pub async fn notify_have(
        &self,
        blob: BlobRef,
        from: PeerId,
        size: u64,
    ) -> Result<(), WantError> {
        self.send(ToActor::Have { blob, from, size }).await
    }

    /// Verifies and stores content for a blob obtained elsewhere.
    ///
    /// On a verification failure the want stays active and can be served by another peer.
    pub async fn resolve(&self, blob: BlobRef, content: Bytes) -> Result<(), WantError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(ToActor::Resolve {
            blob,
            content,
            reply,
        })
        .await?;
        reply_rx.await.map_err(|_| ActorClosedSnafu.build())?
    }

    /// A copy of all tracked wants.
    ///
    /// This keeps working after [`Self::close`].
    pub async fn snapshot(&self) -> Result<Vec<WantEntry>, WantError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send_unchecked(ToActor::Snapshot { reply }).await?;
        reply_rx.await.map_err(|_| ActorClosedSnafu.build())
    }

    /// Shuts the manager down.
    ///
    /// Running retrievals are aborted and their wants expire. Calling this more than once is
    /// fine.
    pub async fn close(&self) -> Result<(), WantError> {
        self.cancel.cancel();
        let (reply, reply_rx) = oneshot::channel();
        if self
            .send_unchecked(ToActor::Close { reply })
            .await
            .is_err()
        {
            // the actor is already gone, nothing left to clean up
            return Ok(());
        }
        reply_rx.await.ok();
        Ok(())
    }

    /// The maximum blob size.
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub(crate) async fn peer_connected(&self, conn: Arc<dyn Endpoint>) -> Result<(), WantError> {
        self.send(ToActor::PeerConnected { conn }).await
    }

    pub(crate) async fn peer_disconnected(&self, peer: PeerId) -> Result<(), WantError> {
        self.send_unchecked(ToActor::PeerDisconnected { peer }).await
    }

    async fn send(&self, msg: ToActor) -> Result<(), WantError> {
        snafu::ensure!(!self.cancel.is_cancelled(), CancelledSnafu);
        self.send_unchecked(msg).await
    }

    async fn send_unchecked(&self, msg: ToActor) -> Result<(), WantError> {
        self.to_actor_tx
            .send(msg)
            .await
            .map_err(|_| ActorClosedSnafu.build())
    }
}

#[derive(derive_more::Debug)]
enum ToActor {
    Want {
        blob: BlobRef,
        hint: Option<PeerId>,
    },
    Have {
        blob: BlobRef,
        from: PeerId,
        size: u64,
    },
    Resolve {
        blob: BlobRef,
        #[debug("Bytes")]
        content: Bytes,
        #[debug(skip)]
        reply: oneshot::Sender<Result<(), WantError>>,
    },
    Snapshot {
        #[debug(skip)]
        reply: oneshot::Sender<Vec<WantEntry>>,
    },
    PeerConnected {
        conn: Arc<dyn Endpoint>,
    },
    PeerDisconnected {
        peer: PeerId,
    },
    Close {
        #[debug(skip)]
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
enum TaskResult {
    Announced {
        blob: BlobRef,
        peer: PeerId,
        result: Result<Option<u64>, CallError>,
    },
    Fetched {
        blob: BlobRef,
        from: PeerId,
        id: u64,
        result: Result<Bytes, FetchError>,
    },
}

#[derive(Debug)]
struct Actor<B> {
    state: State,
    store: B,
    /// Connected peers.
    peers: HashMap<PeerId, Arc<dyn Endpoint>>,
    /// Running retrievals, by the id of their task.
    fetches: HashMap<Hash, (u64, CancellationToken)>,
    next_fetch_id: u64,
    tasks: JoinSet<TaskResult>,
    to_actor_rx: mpsc::Receiver<ToActor>,
    cancel: CancellationToken,
    closed: bool,
}

impl<B: BlobStore> Actor<B> {
    fn new(
        state: State,
        store: B,
        to_actor_rx: mpsc::Receiver<ToActor>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state,
            store,
            peers: Default::default(),
            fetches: Default::default(),
            next_fetch_id: 0,
            tasks: JoinSet::new(),
            to_actor_rx,
            cancel,
            closed: false,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !self.closed => {
                    self.shutdown();
                }
                msg = self.to_actor_rx.recv() => {
                    match msg {
                        Some(msg) => {
                            trace!(?msg, "tick: message");
                            self.handle_message(msg);
                        }
                        None => {
                            trace!("all handles dropped");
                            break;
                        }
                    }
                }
                Some(res) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    match res {
                        Ok(res) => self.on_task_done(res),
                        Err(err) if err.is_cancelled() => {}
                        Err(err) => warn!("want task panicked: {err}"),
                    }
                }
            }
            self.process_actions();
        }
        if !self.closed {
            self.shutdown();
        }
    }

    fn handle_message(&mut self, msg: ToActor) {
        match msg {
            ToActor::Want { blob, hint } => {
                if self.closed {
                    debug!(%blob, "ignoring want after shutdown");
                    return;
                }
                match self.store.has(&blob.hash()) {
                    Ok(true) => trace!(%blob, "blob already stored, not wanting"),
                    Ok(false) => self.state.want(blob, hint),
                    Err(err) => {
                        warn!(%blob, "failed to check blob store: {err}");
                        self.state.want(blob, hint);
                    }
                }
            }
            ToActor::Have { blob, from, size } => {
                if !self.closed {
                    self.state.have(blob, from, size);
                }
            }
            ToActor::Resolve {
                blob,
                content,
                reply,
            } => {
                let res = if self.closed {
                    Err(CancelledSnafu.build())
                } else {
                    self.resolve(blob, content, None)
                };
                reply.send(res).ok();
            }
            ToActor::Snapshot { reply } => {
                reply.send(self.state.snapshot()).ok();
            }
            ToActor::PeerConnected { conn } => {
                if self.closed {
                    return;
                }
                let peer = conn.remote();
                debug!(peer = %peer.fmt_short(), "peer connected");
                self.peers.insert(peer, conn);
                self.state.peer_up(peer);
            }
            ToActor::PeerDisconnected { peer } => {
                if self.peers.remove(&peer).is_some() {
                    debug!(peer = %peer.fmt_short(), "peer disconnected");
                }
                self.state.peer_down(&peer);
            }
            ToActor::Close { reply } => {
                if !self.closed {
                    self.shutdown();
                }
                reply.send(()).ok();
            }
        }
    }

    /// Verifies and stores content. `from` is the peer it was fetched from.
    fn resolve(
        &mut self,
        blob: BlobRef,
        content: Bytes,
        from: Option<PeerId>,
    ) -> Result<(), WantError> {
        let hash = blob.hash();
        if let Err(rejection) = state::check_content(&blob, &content, self.state.max_size()) {
            self.state.on_rejected(&hash, from, rejection);
            return Err(WantError::rejected(blob, rejection));
        }
        let size = content.len();
        if let Err(err) = self.store.put(&blob, content) {
            if let Some(from) = from {
                self.state.on_fetch_failed(&hash, from);
            }
            return Err(StoreSnafu.into_error(err));
        }
        if self.state.on_resolved(&hash).is_some() {
            debug!(%blob, size, "blob resolved");
        } else {
            trace!(%blob, size, "stored blob that was not wanted");
        }
        Ok(())
    }

    fn on_task_done(&mut self, res: TaskResult) {
        match res {
            TaskResult::Announced { blob, peer, result } => match result {
                Ok(Some(size)) => self.state.have(blob, peer, size),
                Ok(None) => trace!(%blob, peer = %peer.fmt_short(), "peer does not have blob"),
                Err(err) => {
                    debug!(%blob, peer = %peer.fmt_short(), "announcing want failed: {err}")
                }
            },
            TaskResult::Fetched {
                blob,
                from,
                id,
                result,
            } => {
                let hash = blob.hash();
                let current = self
                    .fetches
                    .get(&hash)
                    .is_some_and(|(current, _)| *current == id);
                if !current || !self.state.is_fetching_from(&hash, &from) {
                    trace!(%blob, from = %from.fmt_short(), id, "discarding stale fetch result");
                    return;
                }
                self.fetches.remove(&hash);
                match result {
                    Ok(content) => {
                        if let Err(err) = self.resolve(blob, content, Some(from)) {
                            warn!(%blob, from = %from.fmt_short(), "fetched content rejected: {err}");
                        }
                    }
                    Err(FetchError::Oversized { size, max, .. }) => {
                        self.state
                            .on_rejected(&hash, Some(from), Rejection::TooLarge { size, max });
                    }
                    Err(err) => {
                        debug!(%blob, from = %from.fmt_short(), "fetch failed: {err}");
                        self.state.on_fetch_failed(&hash, from);
                    }
                }
            }
        }
    }

    fn process_actions(&mut self) {
        loop {
            let actions: Vec<_> = self.state.events().collect();
            if actions.is_empty() {
                break;
            }
            for action in actions {
                match action {
                    OutEvent::Announce { blob, peers } => {
                        for peer in peers {
                            self.spawn_announce(blob, peer);
                        }
                    }
                    OutEvent::StartFetch { blob, from } => self.spawn_fetch(blob, from),
                    OutEvent::CancelFetch { hash } => {
                        if let Some((_, token)) = self.fetches.remove(&hash) {
                            token.cancel();
                        }
                    }
                }
            }
        }
    }

    fn spawn_announce(&mut self, blob: BlobRef, peer: PeerId) {
        let Some(conn) = self.peers.get(&peer).cloned() else {
            return;
        };
        let cancel = self.cancel.clone();
        self.tasks.spawn(
            async move {
                let result = tokio::select! {
                    _ = cancel.cancelled() => Err(rpc::CancelledSnafu.build()),
                    res = announce(conn, blob) => res,
                };
                TaskResult::Announced { blob, peer, result }
            }
            .in_current_span(),
        );
    }

    fn spawn_fetch(&mut self, blob: BlobRef, from: PeerId) {
        let Some(conn) = self.peers.get(&from).cloned() else {
            debug!(%blob, from = %from.fmt_short(), "peer not connected, cannot fetch");
            self.state.on_fetch_failed(&blob.hash(), from);
            return;
        };
        let token = self.cancel.child_token();
        let id = self.next_fetch_id;
        self.next_fetch_id += 1;
        debug!(%blob, from = %from.fmt_short(), id, "fetching");
        if let Some((_, previous)) = self.fetches.insert(blob.hash(), (id, token.clone())) {
            previous.cancel();
        }
        let max_size = self.state.max_size();
        self.tasks.spawn(
            async move {
                let result = tokio::select! {
                    _ = token.cancelled() => AbortedSnafu.fail(),
                    res = fetch(conn, blob, max_size) => res,
                };
                TaskResult::Fetched {
                    blob,
                    from,
                    id,
                    result,
                }
            }
            .in_current_span(),
        );
    }

    fn shutdown(&mut self) {
        debug!("shutting down");
        self.closed = true;
        for (_, (_, token)) in self.fetches.drain() {
            token.cancel();
        }
        self.tasks.abort_all();
        self.state.shutdown();
        self.peers.clear();
    }
}

/// Asks a peer whether it has a blob. Returns the size it holds.
async fn announce(conn: Arc<dyn Endpoint>, blob: BlobRef) -> Result<Option<u64>, CallError> {
    let reply = conn
        .call(Method::new(BLOBS_WANT), vec![Value::String(blob.to_string())])
        .await?;
    Ok(reply.into_json().and_then(|value| value.as_u64()))
}

/// Retrieves a blob, giving up as soon as it grows past `max_size`.
async fn fetch(conn: Arc<dyn Endpoint>, blob: BlobRef, max_size: u64) -> Result<Bytes, FetchError> {
    let mut stream = conn
        .source(Method::new(BLOBS_GET), vec![Value::String(blob.to_string())])
        .await
        .context(CallSnafu)?;
    let mut buf = BytesMut::new();
    while let Some(item) = stream.next().await {
        let Payload::Binary(chunk) = item.context(CallSnafu)? else {
            return UnexpectedPayloadSnafu.fail();
        };
        let size = (buf.len() + chunk.len()) as u64;
        snafu::ensure!(size <= max_size, OversizedSnafu { size, max: max_size });
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}
