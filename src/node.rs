//! A replicating node: the handlers, the want manager and the connections they serve.
//!
//! The transport establishes and authenticates connections and hands each of them to
//! [`Node::handle_connection`] together with the stream of inbound calls.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use ssb_gossip::{node::Node, refs::FeedRef, rpc::{Endpoint, Request}, store::mem::MemStore};
//! # async fn wrapper(
//! #     me: FeedRef,
//! #     conn: Arc<dyn Endpoint>,
//! #     calls: n0_future::boxed::BoxStream<Request>,
//! # ) {
//! let node = Node::builder(me, MemStore::new()).spawn();
//! node.handle_connection(conn, calls).await;
//! node.shutdown().await;
//! # }
//! ```

use std::sync::Arc;

use n0_future::{
    boxed::BoxFuture,
    stream::{Stream, StreamExt},
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, error_span, trace};

use crate::{
    blobs::BlobsHandler,
    config::Config,
    get::GetHandler,
    gossip::GossipHandler,
    metrics::{GossipMetrics, WantMetrics},
    private::Unboxer,
    protocol::HandlerMap,
    refs::FeedRef,
    rpc::{self, DialError, Dialer, Endpoint, PeerAddr, Request},
    store::{BlobStore, FeedStore},
    want::WantManager,
};

/// Builder for a [`Node`].
#[derive(Debug)]
pub struct Builder<S> {
    me: FeedRef,
    store: S,
    config: Config,
    dialer: Option<Arc<dyn Dialer>>,
    unboxer: Option<Arc<dyn Unboxer>>,
    cancel: CancellationToken,
    gossip_metrics: Arc<GossipMetrics>,
    want_metrics: Arc<WantMetrics>,
}

impl<S: FeedStore + BlobStore> Builder<S> {
    /// Sets the configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Sets the dialer used by `gossip.connect`. Without one, connect requests are refused.
    pub fn dialer(mut self, dialer: impl Dialer) -> Self {
        self.dialer = Some(Arc::new(dialer));
        self
    }

    /// Sets the unboxer used by private `get` calls.
    pub fn unboxer(mut self, unboxer: impl Unboxer) -> Self {
        self.unboxer = Some(Arc::new(unboxer));
        self
    }

    /// Runs the node as a child of `cancel`.
    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Records gossip metrics in `metrics`.
    pub fn gossip_metrics(mut self, metrics: Arc<GossipMetrics>) -> Self {
        self.gossip_metrics = metrics;
        self
    }

    /// Records want manager metrics in `metrics`.
    pub fn want_metrics(mut self, metrics: Arc<WantMetrics>) -> Self {
        self.want_metrics = metrics;
        self
    }

    /// Spawns the want manager and assembles the handlers.
    pub fn spawn(self) -> Node<S> {
        let Self {
            me,
            store,
            config,
            dialer,
            unboxer,
            cancel,
            gossip_metrics,
            want_metrics,
        } = self;
        let wants = WantManager::builder()
            .cancel_token(cancel.clone())
            .max_size(config.blobs.max_size)
            .max_verify_failures(config.blobs.max_verify_failures)
            .metrics(want_metrics.clone())
            .me(me.id())
            .spawn(store.clone());
        let dialer = dialer.unwrap_or_else(|| Arc::new(NoDialer));
        let gossip = GossipHandler::new(
            me,
            store.clone(),
            wants.clone(),
            dialer,
            config.gossip,
            cancel.clone(),
            gossip_metrics.clone(),
        );
        let handlers = HandlerMap::new(gossip)
            .with(BlobsHandler::new(store.clone(), cancel.clone()))
            .with(GetHandler::new(store.clone(), unboxer));
        debug!(me = %me.fmt_short(), "node started");
        Node {
            inner: Arc::new(Inner {
                me,
                store,
                wants,
                handlers,
                cancel,
                gossip_metrics,
                want_metrics,
            }),
        }
    }
}

/// A replicating node.
///
/// Cloning is cheap, clones refer to the same node.
#[derive(Debug)]
pub struct Node<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Node<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[derive(Debug)]
struct Inner<S> {
    me: FeedRef,
    store: S,
    wants: WantManager,
    handlers: HandlerMap,
    cancel: CancellationToken,
    gossip_metrics: Arc<GossipMetrics>,
    want_metrics: Arc<WantMetrics>,
}

impl<S: FeedStore + BlobStore> Node<S> {
    /// Creates a builder for the node owning feed `me`, storing into `store`.
    pub fn builder(me: FeedRef, store: S) -> Builder<S> {
        Builder {
            me,
            store,
            config: Config::default(),
            dialer: None,
            unboxer: None,
            cancel: CancellationToken::new(),
            gossip_metrics: Default::default(),
            want_metrics: Default::default(),
        }
    }

    /// Our own feed.
    pub fn me(&self) -> FeedRef {
        self.inner.me
    }

    /// The store.
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// The want manager.
    pub fn wants(&self) -> &WantManager {
        &self.inner.wants
    }

    /// The handlers serving inbound calls.
    pub fn handlers(&self) -> &HandlerMap {
        &self.inner.handlers
    }

    /// The token that shuts the node down when cancelled.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Metrics of the gossip handlers.
    pub fn gossip_metrics(&self) -> &Arc<GossipMetrics> {
        &self.inner.gossip_metrics
    }

    /// Metrics of the want manager.
    pub fn want_metrics(&self) -> &Arc<WantMetrics> {
        &self.inner.want_metrics
    }

    /// Whether [`Self::shutdown`] was called or the cancel token fired.
    pub fn is_shutdown(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Serves a connection until its inbound calls end or the node shuts down.
    ///
    /// Every handler gets to run its connect hook, the gossip handler starts replicating from
    /// the remote. Each inbound call runs on its own task. Once `calls` ends the connection is
    /// gone: inbound calls still running are aborted, the connect hooks are awaited. On
    /// shutdown everything is aborted.
    pub async fn handle_connection(
        &self,
        conn: Arc<dyn Endpoint>,
        calls: impl Stream<Item = Request> + Send + Unpin,
    ) {
        let remote = conn.remote();
        let span = error_span!(
            "conn",
            me = %self.inner.me.fmt_short(),
            remote = %remote.fmt_short()
        );
        async move {
            debug!("connection established");
            if let Err(err) = self.inner.wants.peer_connected(conn.clone()).await {
                debug!("not announcing wants to peer: {err}");
            }
            self.serve(conn, calls).await;
            if let Err(err) = self.inner.wants.peer_disconnected(remote).await {
                debug!("failed to unregister peer: {err}");
            }
            debug!("connection closed");
        }
        .instrument(span)
        .await
    }

    async fn serve(&self, conn: Arc<dyn Endpoint>, mut calls: impl Stream<Item = Request> + Unpin) {
        let cancel = &self.inner.cancel;
        let mut hooks = JoinSet::new();
        for handler in self.inner.handlers.iter() {
            hooks.spawn(handler.handle_connect(conn.clone()).in_current_span());
        }
        let mut inbound = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("shutting down connection");
                    inbound.shutdown().await;
                    hooks.shutdown().await;
                    return;
                }
                Some(res) = hooks.join_next(), if !hooks.is_empty() => log_task_result(res),
                Some(res) = inbound.join_next(), if !inbound.is_empty() => log_task_result(res),
                req = calls.next() => {
                    let Some(req) = req else {
                        trace!("inbound calls ended");
                        break;
                    };
                    trace!(method = %req.method, kind = %req.kind, "inbound call");
                    let span = error_span!("call", method = %req.method);
                    inbound.spawn(self.inner.handlers.handle_call(req).instrument(span));
                }
            }
        }
        // the remote is gone, nobody is left to answer
        if !inbound.is_empty() {
            debug!(calls = inbound.len(), "aborting inbound calls");
        }
        inbound.shutdown().await;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    hooks.shutdown().await;
                    return;
                }
                res = hooks.join_next() => match res {
                    Some(res) => log_task_result(res),
                    None => return,
                }
            }
        }
    }

    /// Shuts the node down.
    ///
    /// Aborts all connection tasks and closes the want manager. Calling this more than once
    /// is fine.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        if let Err(err) = self.inner.wants.close().await {
            debug!("failed to close want manager: {err}");
        }
    }
}

fn log_task_result(res: Result<(), tokio::task::JoinError>) {
    match res {
        Ok(()) => trace!("task finished"),
        Err(err) if err.is_cancelled() => trace!("task cancelled"),
        Err(err) => error!("task panicked: {err:?}"),
    }
}

/// Refuses all connection requests.
#[derive(Debug)]
struct NoDialer;

impl Dialer for NoDialer {
    fn connect(
        &self,
        _cancel: CancellationToken,
        addr: PeerAddr,
    ) -> BoxFuture<Result<(), DialError>> {
        debug!(addr = %addr.addr, "no dialer configured");
        let err = rpc::RefusedSnafu {
            reason: "dialing is not enabled",
        }
        .build();
        Box::pin(async move { Err::<(), _>(err) })
    }
}
