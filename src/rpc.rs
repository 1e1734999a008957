//! Contracts of the multiplexed RPC transport.
//!
//! The transport (framing, the secret handshake, stream multiplexing) lives outside of this
//! crate. For every authenticated connection it hands us an [`Endpoint`] to issue calls on
//! and a stream of inbound [`Request`]s, each carrying the [`CallStream`] to answer on.
//!
//! Every call has a [`CallType`]. `async` calls are answered with a single value, `source`
//! calls with any number of values followed by a close.
use std::{fmt, net::SocketAddr};

use bytes::Bytes;
use n0_future::boxed::{BoxFuture, BoxStream};
use nested_enum_utils::common_fields;
use serde_json::Value;
use snafu::{Backtrace, Snafu};
use tokio_util::sync::CancellationToken;

use crate::refs::{FeedRef, PeerId};

/// The name of a remote procedure, e.g. `gossip.ping`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Method(Vec<String>);

impl Method {
    /// Parses a dotted method name.
    pub fn new(name: &str) -> Self {
        Self(name.split('.').map(ToOwned::to_owned).collect())
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl From<&str> for Method {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// The shape of a call.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum CallType {
    /// Request and a single response.
    #[default]
    Async,
    /// Request and a stream of responses.
    Source,
    /// Stream of requests and a single response.
    Sink,
    /// Streams in both directions.
    Duplex,
}

/// A single value sent over a call.
#[derive(Debug, Clone, PartialEq, derive_more::From)]
pub enum Payload {
    /// A JSON value.
    Json(Value),
    /// Raw bytes.
    Binary(Bytes),
}

impl Payload {
    /// The JSON value, if this is one.
    pub fn into_json(self) -> Option<Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Binary(_) => None,
        }
    }
}

/// Errors of a single call.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub))]
pub enum CallError {
    /// The other side went away.
    #[snafu(display("call stream closed"))]
    Closed {},
    /// The remote closed the call with an error.
    #[snafu(display("remote error: {message}"))]
    Remote { message: String },
    /// The call was aborted locally.
    #[snafu(display("call cancelled"))]
    Cancelled {},
    #[snafu(display("transport failure"))]
    Transport { source: std::io::Error },
}

/// The sending half of an inbound call.
///
/// Exactly one of [`ret`](Self::ret), [`close`](Self::close) and
/// [`close_with_error`](Self::close_with_error) ends the call.
pub trait CallStream: Send + Sync + fmt::Debug + 'static {
    /// Sends one value of a stream.
    fn pour(&self, value: Payload) -> BoxFuture<Result<(), CallError>>;

    /// Answers an async call.
    fn ret(&self, value: Payload) -> BoxFuture<Result<(), CallError>>;

    /// Ends the call successfully.
    fn close(&self) -> BoxFuture<Result<(), CallError>>;

    /// Ends the call with an error message for the remote.
    fn close_with_error(&self, message: String) -> BoxFuture<Result<(), CallError>>;
}

/// An inbound call.
#[derive(Debug)]
pub struct Request {
    /// The called procedure.
    pub method: Method,
    /// The shape of the call.
    pub kind: CallType,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Where to send the answer.
    pub stream: Box<dyn CallStream>,
}

/// Values of a source call.
pub type SourceStream = BoxStream<Result<Payload, CallError>>;

/// The calling side of an authenticated connection.
pub trait Endpoint: Send + Sync + fmt::Debug + 'static {
    /// The authenticated identity of the other side.
    fn remote(&self) -> PeerId;

    /// Issues an async call and waits for its answer.
    fn call(&self, method: Method, args: Vec<Value>) -> BoxFuture<Result<Payload, CallError>>;

    /// Issues a source call.
    ///
    /// The stream ends when the remote closes the call and yields a [`CallError::Remote`] if it
    /// closes with an error.
    fn source(&self, method: Method, args: Vec<Value>)
    -> BoxFuture<Result<SourceStream, CallError>>;
}

/// Where to reach a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr {
    /// The network address.
    pub addr: SocketAddr,
    /// The key the peer must authenticate as.
    pub key: FeedRef,
}

/// Errors when dialing a peer.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub))]
pub enum DialError {
    #[snafu(display("connection refused: {reason}"))]
    Refused { reason: String },
    #[snafu(display("dial cancelled"))]
    DialCancelled {},
}

/// Establishes outgoing connections.
///
/// A connection established this way is handed back to the node like any inbound one.
pub trait Dialer: Send + Sync + fmt::Debug + 'static {
    /// Connects to `addr` and authenticates the remote.
    ///
    /// The attempt is abandoned with [`DialError::DialCancelled`] once `cancel` fires.
    fn connect(
        &self,
        cancel: CancellationToken,
        addr: PeerAddr,
    ) -> BoxFuture<Result<(), DialError>>;
}
