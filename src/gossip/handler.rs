//! The gossip calls and the replication cascade started for every connection.
//!
//! Every call ends with exactly one terminal action. `gossip.ping` and unknown methods close
//! with a diagnostic message, which is part of the protocol and not counted as a failure.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use n0_future::boxed::BoxFuture;
use nested_enum_utils::common_fields;
use serde_json::{Value, json};
use snafu::{Backtrace, IntoError, OptionExt, ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span};

use super::{CONNECT, CREATE_HISTORY_STREAM, Cascade, HistoryArgs, PING};
use crate::{
    config::{GossipConfig, PingConfig},
    message::KeyValue,
    metrics::GossipMetrics,
    protocol::{CallOutcome, Handler, finish},
    refs::{FeedRef, ParseError, Seq},
    rpc::{
        CallError, CallStream, CallType, DialError, Dialer, Endpoint, Method, PeerAddr, Payload,
        Request,
    },
    store::{FeedStore, StoreError},
    want::WantManager,
};

/// Expected argument of `gossip.connect`.
const CONNECT_USAGE: &str = "gossip.connect host:port:key";
/// How `gossip.ping` ends after its last pulse.
const PING_DONE: &str = "ping done";

/// Errors of the gossip calls.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum HandlerError {
    #[snafu(display("{method} must be called as {expected}, got {got}"))]
    WrongCallType {
        method: &'static str,
        expected: CallType,
        got: CallType,
    },
    #[snafu(display("missing argument"))]
    MissingArgument {},
    #[snafu(display("invalid arguments"))]
    InvalidArgument { source: serde_json::Error },
    #[snafu(display("usage: {CONNECT_USAGE}"))]
    Usage {},
    #[snafu(display("usage: {CONNECT_USAGE}, expected 3 parts but got {parts}"))]
    BadAddress { parts: usize },
    #[snafu(display("invalid key"))]
    InvalidKey { source: ParseError },
    #[snafu(display("failed to resolve {addr}"))]
    Resolve {
        addr: String,
        source: std::io::Error,
    },
    #[snafu(display("{addr} resolves to no address"))]
    NoAddress { addr: String },
    #[snafu(display("failed to connect to {dest}"))]
    Dial { dest: String, source: DialError },
    #[snafu(display("storage failure"))]
    Store { source: StoreError },
    #[snafu(display("failed to send entry"))]
    Pour { source: CallError },
}

/// Answers the gossip calls and runs a replication cascade for every connection.
#[derive(Debug, Clone)]
pub struct GossipHandler<S> {
    me: FeedRef,
    store: S,
    wants: WantManager,
    dialer: Arc<dyn Dialer>,
    config: GossipConfig,
    cancel: CancellationToken,
    metrics: Arc<GossipMetrics>,
}

impl<S: FeedStore> GossipHandler<S> {
    /// Creates a handler.
    pub fn new(
        me: FeedRef,
        store: S,
        wants: WantManager,
        dialer: Arc<dyn Dialer>,
        config: GossipConfig,
        cancel: CancellationToken,
        metrics: Arc<GossipMetrics>,
    ) -> Self {
        Self {
            me,
            store,
            wants,
            dialer,
            config,
            cancel,
            metrics,
        }
    }

    /// The replication cascade for a connection.
    pub fn cascade(&self, conn: Arc<dyn Endpoint>) -> Cascade<S> {
        Cascade::new(
            conn,
            self.store.clone(),
            self.wants.clone(),
            self.me,
            self.config.cascade,
            self.cancel.clone(),
            self.metrics.clone(),
        )
    }

    async fn on_connect(self, conn: Arc<dyn Endpoint>) {
        let cascade = self.cascade(conn);
        let span = info_span!("cascade", remote = %cascade.remote().fmt_short());
        async move {
            let outcomes = cascade.run().await;
            let failed = outcomes.iter().any(|outcome| outcome.is_terminal());
            info!(steps = outcomes.len(), failed, "replication finished");
        }
        .instrument(span)
        .await
    }

    async fn on_call(self, req: Request) {
        let Request {
            method,
            kind,
            args,
            stream,
        } = req;
        self.metrics.calls_handled.inc();
        let outcome: CallOutcome<HandlerError> = match method.to_string().as_str() {
            CREATE_HISTORY_STREAM => {
                match self.history_stream(kind, &args, stream.as_ref()).await {
                    Ok(()) => CallOutcome::Done,
                    Err(_) if self.cancel.is_cancelled() => CallOutcome::Cancelled,
                    Err(err) => CallOutcome::Failed(err),
                }
            }
            PING => self.ping(&args, stream.as_ref()).await,
            CONNECT => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => CallOutcome::Cancelled,
                res = self.connect(&args) => CallOutcome::from(res.map(|()| json!("connected"))),
            },
            _ => {
                self.metrics.unknown_calls.inc();
                CallOutcome::Diagnostic(format!("unknown command: {method}"))
            }
        };
        if outcome.is_failure() {
            self.metrics.calls_failed.inc();
        }
        finish(&method, stream.as_ref(), outcome).await;
    }

    /// Pours the requested slice of a feed.
    async fn history_stream(
        &self,
        kind: CallType,
        args: &[Value],
        stream: &dyn CallStream,
    ) -> Result<(), HandlerError> {
        snafu::ensure!(
            kind == CallType::Source,
            WrongCallTypeSnafu {
                method: CREATE_HISTORY_STREAM,
                expected: CallType::Source,
                got: kind,
            }
        );
        let arg = args.first().cloned().context(MissingArgumentSnafu)?;
        let args: HistoryArgs = serde_json::from_value(arg).context(InvalidArgumentSnafu)?;
        if args.live {
            debug!(feed = %args.id, "live streaming not supported, sending history only");
        }
        let end = self.store.current_seq(&args.id).context(StoreSnafu)?;
        let mut seq = args.seq.max(Seq::FIRST);
        let mut sent = 0u64;
        while seq <= end && args.limit.is_none_or(|limit| sent < limit) {
            if self.cancel.is_cancelled() {
                break;
            }
            let Some(message) = self.store.get(&args.id, seq).context(StoreSnafu)? else {
                break;
            };
            let value = if args.keys {
                serde_json::to_value(KeyValue::new(message))
            } else {
                serde_json::to_value(message)
            }
            .expect("entries always encode to json");
            stream
                .pour(Payload::Json(value))
                .await
                .context(PourSnafu)?;
            sent += 1;
            seq = seq.next();
        }
        debug!(feed = %args.id, from = %args.seq, sent, "sent history");
        Ok(())
    }

    /// Sends a few timestamps, then closes with a diagnostic.
    async fn ping(&self, args: &[Value], stream: &dyn CallStream) -> CallOutcome<HandlerError> {
        let PingConfig { pulses, interval } = self.config.ping;
        debug!(?args, pulses, "ping");
        for pulse in 0..pulses {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            if let Err(err) = stream.pour(Payload::Json(json!(now))).await {
                return CallOutcome::Failed(PourSnafu.into_error(err));
            }
            debug!(pulse, "pong");
            tokio::select! {
                _ = self.cancel.cancelled() => return CallOutcome::Cancelled,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        CallOutcome::Diagnostic(PING_DONE.to_string())
    }

    /// Dials the peer given as `host:port:key`.
    async fn connect(&self, args: &[Value]) -> Result<(), HandlerError> {
        let [dest] = args else {
            return UsageSnafu.fail();
        };
        let dest = dest.as_str().context(UsageSnafu)?;
        let addr = resolve_connect_addr(dest).await?;
        info!(addr = %addr.addr, key = %addr.key, "dialing");
        self.dialer
            .connect(self.cancel.child_token(), addr)
            .await
            .context(DialSnafu { dest })?;
        Ok(())
    }
}

/// Parses `host:port:key` and resolves the host.
async fn resolve_connect_addr(dest: &str) -> Result<PeerAddr, HandlerError> {
    let parts: Vec<&str> = dest.split(':').collect();
    let [host, port, key] = parts.as_slice() else {
        return BadAddressSnafu { parts: parts.len() }.fail();
    };
    let key: FeedRef = key.parse().context(InvalidKeySnafu)?;
    let host_port = format!("{host}:{port}");
    let addr = tokio::net::lookup_host(&host_port)
        .await
        .context(ResolveSnafu { addr: &host_port })?
        .next()
        .context(NoAddressSnafu { addr: &host_port })?;
    Ok(PeerAddr { addr, key })
}

impl<S: FeedStore> Handler for GossipHandler<S> {
    fn handles(&self, method: &Method) -> bool {
        matches!(
            method.to_string().as_str(),
            CREATE_HISTORY_STREAM | PING | CONNECT
        )
    }

    fn handle_connect(&self, conn: Arc<dyn Endpoint>) -> BoxFuture<()> {
        Box::pin(self.clone().on_connect(conn))
    }

    fn handle_call(&self, req: Request) -> BoxFuture<()> {
        Box::pin(self.clone().on_call(req))
    }
}
