//! Serving blobs to peers.
//!
//! This is the other side of the calls the [`WantManager`](crate::want::WantManager) makes:
//! `blobs.want` answers with the size of a locally held blob or `false`, `blobs.get` pours its
//! content in chunks.

use n0_future::boxed::BoxFuture;
use nested_enum_utils::common_fields;
use serde_json::{Value, json};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    protocol::{CallOutcome, Handler, finish},
    refs::{BlobRef, ParseError},
    rpc::{CallError, CallStream, CallType, Method, Payload, Request},
    store::{BlobStore, StoreError},
};

/// Asks whether a peer has a blob.
pub const BLOBS_WANT: &str = "blobs.want";
/// Retrieves the content of a blob.
pub const BLOBS_GET: &str = "blobs.get";
/// Size of the chunks blob content is sent in.
pub const BLOB_CHUNK_SIZE: usize = 64 * 1024;

/// Errors when serving blob calls.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum BlobsError {
    #[snafu(display("expected a blob reference argument"))]
    MissingArgument {},
    #[snafu(display("invalid blob reference"))]
    InvalidRef { source: ParseError },
    #[snafu(display("{method} must be called as {expected}, got {got}"))]
    WrongCallType {
        method: &'static str,
        expected: CallType,
        got: CallType,
    },
    #[snafu(display("no such blob: {blob}"))]
    NotFound { blob: BlobRef },
    #[snafu(display("blob store failure"))]
    Store { source: StoreError },
    #[snafu(display("failed to send content"))]
    Pour { source: CallError },
}

/// Answers `blobs.want` and `blobs.get` from a blob store.
#[derive(Debug, Clone)]
pub struct BlobsHandler<B> {
    store: B,
    cancel: CancellationToken,
}

impl<B: BlobStore> BlobsHandler<B> {
    /// Creates a handler serving from `store`.
    pub fn new(store: B, cancel: CancellationToken) -> Self {
        Self { store, cancel }
    }

    async fn handle(self, req: Request) {
        let Request {
            method,
            kind,
            args,
            stream,
        } = req;
        let outcome: CallOutcome<BlobsError> = match method.to_string().as_str() {
            BLOBS_WANT => self.want(&args).into(),
            BLOBS_GET => match self.get(kind, &args, stream.as_ref()).await {
                Ok(()) => CallOutcome::Done,
                Err(err) if self.cancel.is_cancelled() => {
                    debug!("aborted sending blob: {err}");
                    CallOutcome::Cancelled
                }
                Err(err) => CallOutcome::Failed(err),
            },
            _ => CallOutcome::Diagnostic(format!("unknown command: {method}")),
        };
        finish(&method, stream.as_ref(), outcome).await;
    }

    fn want(&self, args: &[Value]) -> Result<Value, BlobsError> {
        let blob = blob_arg(args)?;
        let size = self.store.size(&blob.hash()).context(StoreSnafu)?;
        debug!(%blob, ?size, "peer wants blob");
        Ok(match size {
            Some(size) => json!(size),
            None => json!(false),
        })
    }

    async fn get(
        &self,
        kind: CallType,
        args: &[Value],
        stream: &dyn CallStream,
    ) -> Result<(), BlobsError> {
        snafu::ensure!(
            kind == CallType::Source,
            WrongCallTypeSnafu {
                method: BLOBS_GET,
                expected: CallType::Source,
                got: kind,
            }
        );
        let blob = blob_arg(args)?;
        let content = self
            .store
            .get(&blob.hash())
            .context(StoreSnafu)?
            .context(NotFoundSnafu { blob })?;
        let mut offset = 0;
        while offset < content.len() {
            let end = (offset + BLOB_CHUNK_SIZE).min(content.len());
            stream
                .pour(Payload::Binary(content.slice(offset..end)))
                .await
                .context(PourSnafu)?;
            offset = end;
        }
        debug!(%blob, size = content.len(), "sent blob");
        Ok(())
    }
}

fn blob_arg(args: &[Value]) -> Result<BlobRef, BlobsError> {
    let arg = args
        .first()
        .and_then(Value::as_str)
        .context(MissingArgumentSnafu)?;
    arg.parse().context(InvalidRefSnafu)
}

impl<B: BlobStore> Handler for BlobsHandler<B> {
    fn handles(&self, method: &Method) -> bool {
        matches!(method.to_string().as_str(), BLOBS_WANT | BLOBS_GET)
    }

    fn handle_call(&self, req: Request) -> BoxFuture<()> {
        Box::pin(self.clone().handle(req))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        store::mem::MemStore,
        test_utils::{StreamEvent, request},
    };

    fn handler() -> (MemStore, BlobsHandler<MemStore>) {
        let store = MemStore::new();
        (store.clone(), BlobsHandler::new(store, CancellationToken::new()))
    }

    #[tokio::test]
    #[traced_test]
    async fn want_answers_with_size() {
        let (store, handler) = handler();
        let content = Bytes::from_static(b"have it");
        let blob = BlobRef::of(&content);
        store.put(&blob, content).unwrap();

        let (req, mut events) = request(BLOBS_WANT, CallType::Async, vec![json!(blob.to_string())]);
        handler.handle_call(req).await;
        assert_eq!(events.recv().await, Some(StreamEvent::Return(json!(7).into())));

        let other = BlobRef::of(b"nope");
        let (req, mut events) = request(BLOBS_WANT, CallType::Async, vec![json!(other.to_string())]);
        handler.handle_call(req).await;
        assert_eq!(events.recv().await, Some(StreamEvent::Return(json!(false).into())));
    }

    #[tokio::test]
    #[traced_test]
    async fn get_pours_chunks() {
        let (store, handler) = handler();
        let content = Bytes::from(vec![7u8; BLOB_CHUNK_SIZE * 2 + 10]);
        let blob = BlobRef::of(&content);
        store.put(&blob, content.clone()).unwrap();

        let (req, mut events) = request(BLOBS_GET, CallType::Source, vec![json!(blob.to_string())]);
        handler.handle_call(req).await;
        let mut received = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                StreamEvent::Pour(Payload::Binary(chunk)) => received.push(chunk),
                StreamEvent::Close => break,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(received.len(), 3);
        assert_eq!(received.concat(), content.to_vec());
    }

    #[tokio::test]
    #[traced_test]
    async fn get_errors() {
        let (_store, handler) = handler();
        let missing = BlobRef::of(b"missing");
        let (req, mut events) =
            request(BLOBS_GET, CallType::Source, vec![json!(missing.to_string())]);
        handler.handle_call(req).await;
        assert!(matches!(
            events.recv().await,
            Some(StreamEvent::CloseWithError(msg)) if msg.contains("no such blob")
        ));

        let (req, mut events) = request(BLOBS_GET, CallType::Async, vec![json!(missing.to_string())]);
        handler.handle_call(req).await;
        assert!(matches!(
            events.recv().await,
            Some(StreamEvent::CloseWithError(msg)) if msg.contains("must be called as source")
        ));

        let (req, mut events) = request(BLOBS_WANT, CallType::Async, vec![json!(42)]);
        handler.handle_call(req).await;
        assert!(matches!(events.recv().await, Some(StreamEvent::CloseWithError(_))));
    }
}
