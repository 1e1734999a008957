//! Utilities for tests: an in-memory call stream, a loopback connection to a node and
//! deterministic identities and feeds.
use std::sync::{Arc, Mutex};

use ed25519_dalek::SigningKey;
use n0_future::boxed::{BoxFuture, BoxStream};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error_span};

use crate::{
    message::Message,
    node::Node,
    protocol::HandlerMap,
    refs::{FeedRef, PeerId},
    rpc::{
        self, CallError, CallStream, CallType, DialError, Dialer, Endpoint, Method, Payload,
        PeerAddr, Request, SourceStream,
    },
    store::{BlobStore, FeedStore, mem::MemStore},
};

/// What a handler did to a [`MemStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A stream value.
    Pour(Payload),
    /// The answer to an async call.
    Return(Payload),
    /// Normal end.
    Close,
    /// End with an error.
    CloseWithError(String),
}

/// A [`CallStream`] that records everything sent on it.
#[derive(Debug, Clone)]
pub struct MemStream(mpsc::UnboundedSender<StreamEvent>);

/// Creates a [`MemStream`] and the receiver of its events.
pub fn mem_stream() -> (MemStream, mpsc::UnboundedReceiver<StreamEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MemStream(tx), rx)
}

impl MemStream {
    fn push(&self, event: StreamEvent) -> BoxFuture<Result<(), CallError>> {
        let res = self.0.send(event).map_err(|_| rpc::ClosedSnafu.build());
        Box::pin(async move { res })
    }
}

impl CallStream for MemStream {
    fn pour(&self, value: Payload) -> BoxFuture<Result<(), CallError>> {
        self.push(StreamEvent::Pour(value))
    }

    fn ret(&self, value: Payload) -> BoxFuture<Result<(), CallError>> {
        self.push(StreamEvent::Return(value))
    }

    fn close(&self) -> BoxFuture<Result<(), CallError>> {
        self.push(StreamEvent::Close)
    }

    fn close_with_error(&self, message: String) -> BoxFuture<Result<(), CallError>> {
        self.push(StreamEvent::CloseWithError(message))
    }
}

/// Creates an inbound call answered on a [`MemStream`].
pub fn request(
    method: &str,
    kind: CallType,
    args: Vec<Value>,
) -> (Request, mpsc::UnboundedReceiver<StreamEvent>) {
    let (stream, events) = mem_stream();
    let req = Request {
        method: Method::new(method),
        kind,
        args,
        stream: Box::new(stream),
    };
    (req, events)
}

/// A connection whose calls are served directly by the handlers of a node.
#[derive(Debug, Clone)]
pub struct LoopbackEndpoint {
    remote: PeerId,
    handlers: HandlerMap,
}

impl LoopbackEndpoint {
    /// Serves calls with `handlers`, claiming to be `remote`.
    pub fn new(remote: PeerId, handlers: HandlerMap) -> Self {
        Self { remote, handlers }
    }

    /// A connection to `node`.
    pub fn to_node<S: FeedStore + BlobStore>(node: &Node<S>) -> Self {
        Self::new(node.me().id(), node.handlers().clone())
    }

    fn dispatch(
        &self,
        method: Method,
        kind: CallType,
        args: Vec<Value>,
    ) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (stream, events) = mem_stream();
        let span = error_span!("loopback", %method);
        let req = Request {
            method,
            kind,
            args,
            stream: Box::new(stream),
        };
        tokio::spawn(self.handlers.handle_call(req).instrument(span));
        events
    }
}

impl Endpoint for LoopbackEndpoint {
    fn remote(&self) -> PeerId {
        self.remote
    }

    fn call(&self, method: Method, args: Vec<Value>) -> BoxFuture<Result<Payload, CallError>> {
        let mut events = self.dispatch(method, CallType::Async, args);
        Box::pin(async move {
            match events.recv().await {
                Some(StreamEvent::Return(value) | StreamEvent::Pour(value)) => Ok(value),
                Some(StreamEvent::CloseWithError(message)) => {
                    Err(rpc::RemoteSnafu { message }.build())
                }
                Some(StreamEvent::Close) | None => Err(rpc::ClosedSnafu.build()),
            }
        })
    }

    fn source(
        &self,
        method: Method,
        args: Vec<Value>,
    ) -> BoxFuture<Result<SourceStream, CallError>> {
        let events = self.dispatch(method, CallType::Source, args);
        let stream = n0_future::stream::unfold(Some(events), |events| async move {
            let mut events = events?;
            match events.recv().await? {
                StreamEvent::Pour(value) => Some((Ok(value), Some(events))),
                StreamEvent::Return(value) => Some((Ok(value), None)),
                StreamEvent::Close => None,
                StreamEvent::CloseWithError(message) => {
                    Some((Err(rpc::RemoteSnafu { message }.build()), None))
                }
            }
        });
        let stream: BoxStream<_> = Box::pin(stream);
        Box::pin(async move { Ok::<_, CallError>(stream) })
    }
}

/// A [`Dialer`] that records the addresses it is asked to dial.
#[derive(Debug, Clone, Default)]
pub struct MockDialer {
    dialed: Arc<Mutex<Vec<PeerAddr>>>,
    refuse: bool,
    hang: bool,
}

impl MockDialer {
    /// A dialer whose connection attempts all fail.
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Default::default()
        }
    }

    /// A dialer whose connection attempts only end when cancelled.
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }

    /// The addresses dialed so far.
    pub fn dialed(&self) -> Vec<PeerAddr> {
        self.dialed.lock().expect("poisoned").clone()
    }
}

impl Dialer for MockDialer {
    fn connect(
        &self,
        cancel: CancellationToken,
        addr: PeerAddr,
    ) -> BoxFuture<Result<(), DialError>> {
        self.dialed.lock().expect("poisoned").push(addr);
        if self.hang {
            return Box::pin(async move {
                cancel.cancelled().await;
                Err::<(), _>(rpc::DialCancelledSnafu.build())
            });
        }
        let res = if self.refuse {
            Err(rpc::RefusedSnafu { reason: "mock" }.build())
        } else {
            Ok(())
        };
        Box::pin(async move { res })
    }
}

/// A deterministic identity.
pub fn peer(seed: u8) -> PeerId {
    SigningKey::from_bytes(&[seed; 32]).verifying_key().into()
}

/// The feed of [`peer`]`(seed)`.
pub fn feed(seed: u8) -> FeedRef {
    FeedRef::ed25519(peer(seed))
}

/// Appends a message with `content` to `author`'s feed.
pub fn append(store: &MemStore, author: FeedRef, content: Value) -> Message {
    let last = store.current_seq(&author).expect("mem store");
    let previous = FeedStore::get(store, &author, last)
        .expect("mem store")
        .map(|message| message.key());
    let sequence = last.next();
    let message = Message {
        previous,
        author,
        sequence,
        timestamp: sequence.get() as i64 * 1000,
        content,
    };
    store.append(message.clone()).expect("in order");
    message
}

/// Extends `author`'s feed up to sequence `up_to`.
///
/// The content of every message only depends on its sequence, so separate stores populated
/// this way hold the same feed.
pub fn populate(store: &MemStore, author: FeedRef, up_to: u64) {
    let from = store.current_seq(&author).expect("mem store").next();
    for seq in from.get()..=up_to {
        append(
            store,
            author,
            json!({ "type": "post", "text": format!("message {seq}") }),
        );
    }
}

