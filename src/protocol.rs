//! Routing inbound calls to the handlers mounted on a node.
//!
//! A [`Handler`] claims a set of methods. The [`HandlerMap`] routes every call to the first
//! handler that claims its method, or to the fallback handler, which also answers unknown
//! methods.
//!
//! Handlers compute a [`CallOutcome`] for every call and then end the call with [`finish`],
//! which performs exactly one terminal action on the call stream.
use std::{fmt, sync::Arc};

use n0_future::boxed::BoxFuture;
use tracing::{debug, warn};

use crate::rpc::{CallStream, Endpoint, Method, Payload, Request};

/// Handles calls for a set of methods.
pub trait Handler: Send + Sync + fmt::Debug + 'static {
    /// Whether this handler answers calls to `method`.
    fn handles(&self, method: &Method) -> bool;

    /// Runs once for every new connection, on its own task.
    fn handle_connect(&self, _conn: Arc<dyn Endpoint>) -> BoxFuture<()> {
        Box::pin(async {})
    }

    /// Handles a single inbound call, on its own task.
    fn handle_call(&self, req: Request) -> BoxFuture<()>;
}

impl<T: Handler> Handler for Arc<T> {
    fn handles(&self, method: &Method) -> bool {
        self.as_ref().handles(method)
    }

    fn handle_connect(&self, conn: Arc<dyn Endpoint>) -> BoxFuture<()> {
        self.as_ref().handle_connect(conn)
    }

    fn handle_call(&self, req: Request) -> BoxFuture<()> {
        self.as_ref().handle_call(req)
    }
}

/// The handlers of a node.
#[derive(Debug, Clone)]
pub struct HandlerMap {
    handlers: Vec<Arc<dyn Handler>>,
    fallback: Arc<dyn Handler>,
}

impl HandlerMap {
    /// Creates a map that sends every call to `fallback`.
    pub fn new(fallback: impl Handler) -> Self {
        Self {
            handlers: Vec::new(),
            fallback: Arc::new(fallback),
        }
    }

    /// Mounts a handler. Earlier handlers take precedence.
    pub fn with(mut self, handler: impl Handler) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// The handler for `method`.
    pub fn get(&self, method: &Method) -> &Arc<dyn Handler> {
        self.handlers
            .iter()
            .find(|handler| handler.handles(method))
            .unwrap_or(&self.fallback)
    }

    /// All handlers, each once, the fallback last.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Handler>> {
        self.handlers.iter().chain(std::iter::once(&self.fallback))
    }

    /// Routes a call.
    pub fn handle_call(&self, req: Request) -> BoxFuture<()> {
        self.get(&req.method).handle_call(req)
    }
}

/// How a call ends.
#[derive(Debug)]
pub enum CallOutcome<E> {
    /// Close the call normally.
    Done,
    /// Answer an async call.
    Return(Payload),
    /// Close with an error message that is part of the protocol, not a failure.
    Diagnostic(String),
    /// The call failed.
    Failed(E),
    /// The node is shutting down.
    Cancelled,
}

impl<E> CallOutcome<E> {
    /// Whether this is a failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, CallOutcome::Failed(_))
    }
}

impl<E, T: Into<Payload>> From<Result<T, E>> for CallOutcome<E> {
    fn from(res: Result<T, E>) -> Self {
        match res {
            Ok(value) => CallOutcome::Return(value.into()),
            Err(err) => CallOutcome::Failed(err),
        }
    }
}

/// Ends a call according to `outcome`.
pub async fn finish<E: fmt::Display>(
    method: &Method,
    stream: &dyn CallStream,
    outcome: CallOutcome<E>,
) {
    let res = match outcome {
        CallOutcome::Done | CallOutcome::Cancelled => stream.close().await,
        CallOutcome::Return(value) => stream.ret(value).await,
        CallOutcome::Diagnostic(message) => {
            debug!(%method, %message, "closing call");
            stream.close_with_error(message).await
        }
        CallOutcome::Failed(err) => {
            warn!(%method, "call failed: {err}");
            stream.close_with_error(err.to_string()).await
        }
    };
    if let Err(err) = res {
        debug!(%method, "failed to end call: {err}");
    }
}
