//! The `get` call: looking up a single message by key.
//!
//! The argument is either a message key, or `{ "id": key, "private": true }` to have the
//! content of an encrypted message decrypted. Messages that turn out not to be encrypted are
//! returned unchanged.

use std::sync::Arc;

use n0_future::boxed::BoxFuture;
use nested_enum_utils::common_fields;
use serde::Deserialize;
use serde_json::Value;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tracing::debug;

use crate::{
    message::KeyValue,
    private::{UnboxError, Unboxed, Unboxer},
    protocol::{CallOutcome, Handler, finish},
    refs::{MessageRef, ParseError},
    rpc::{Method, Request},
    store::{FeedStore, StoreError},
};

/// Looks up a message.
pub const GET: &str = "get";

/// Errors of the `get` call.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum GetError {
    #[snafu(display("expected a message key or {{ id, private }}"))]
    InvalidArgument {},
    #[snafu(display("invalid message key"))]
    InvalidKey { source: ParseError },
    #[snafu(display("no such message: {key}"))]
    NotFound { key: MessageRef },
    #[snafu(display("storage failure"))]
    Store { source: StoreError },
    #[snafu(display("no unboxer configured"))]
    NoUnboxer {},
    #[snafu(display("failed to unbox {key}"))]
    Unbox { key: MessageRef, source: UnboxError },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GetArg {
    Key(String),
    Options {
        id: String,
        #[serde(default)]
        private: bool,
    },
}

/// Answers `get` from a feed store.
#[derive(Debug, Clone)]
pub struct GetHandler<S> {
    store: S,
    unboxer: Option<Arc<dyn Unboxer>>,
}

impl<S: FeedStore> GetHandler<S> {
    /// Creates a handler. Without an unboxer, private lookups fail.
    pub fn new(store: S, unboxer: Option<Arc<dyn Unboxer>>) -> Self {
        Self { store, unboxer }
    }

    /// Looks up a message and decrypts it if asked to.
    pub fn get(&self, arg: Value) -> Result<KeyValue, GetError> {
        let (id, private) = match serde_json::from_value(arg).ok().context(InvalidArgumentSnafu)? {
            GetArg::Key(id) => (id, false),
            GetArg::Options { id, private } => (id, private),
        };
        let key: MessageRef = id.parse().context(InvalidKeySnafu)?;
        let message = self
            .store
            .get_message(&key)
            .context(StoreSnafu)?
            .context(NotFoundSnafu { key })?;
        let boxed = message.is_boxed();
        let mut kv = KeyValue::new(message);
        if !private {
            return Ok(kv);
        }
        if !boxed {
            debug!(%key, "message is not boxed");
            return Ok(kv);
        }
        let unboxer = self.unboxer.as_ref().context(NoUnboxerSnafu)?;
        match unboxer.unbox(&kv.value).context(UnboxSnafu { key })? {
            Unboxed::Cleartext(content) => {
                kv.value.content = content;
                kv.meta.insert("private".to_string(), Value::Bool(true));
            }
            Unboxed::NotBoxed => debug!(%key, "message is not boxed"),
        }
        Ok(kv)
    }

    async fn handle(self, req: Request) {
        let arg = req.args.into_iter().next().unwrap_or_default();
        let outcome: CallOutcome<GetError> = self
            .get(arg)
            .map(|kv| serde_json::to_value(kv).expect("messages always encode to json"))
            .into();
        finish(&req.method, req.stream.as_ref(), outcome).await;
    }
}

impl<S: FeedStore> Handler for GetHandler<S> {
    fn handles(&self, method: &Method) -> bool {
        method.to_string() == GET
    }

    fn handle_call(&self, req: Request) -> BoxFuture<()> {
        Box::pin(self.clone().handle(req))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        message::Message,
        private::MalformedSnafu,
        rpc::CallType,
        store::mem::MemStore,
        test_utils::{StreamEvent, append, feed, request},
    };

    #[derive(Debug)]
    struct Rot13;

    impl Unboxer for Rot13 {
        fn unbox(&self, message: &Message) -> Result<Unboxed, UnboxError> {
            let Value::String(boxed) = &message.content else {
                return Ok(Unboxed::NotBoxed);
            };
            let Some(body) = boxed.strip_suffix(".box") else {
                return Ok(Unboxed::NotBoxed);
            };
            let text: String = body
                .chars()
                .map(|c| match c {
                    'a'..='m' | 'A'..='M' => (c as u8 + 13) as char,
                    'n'..='z' | 'N'..='Z' => (c as u8 - 13) as char,
                    c => c,
                })
                .collect();
            if text.is_empty() {
                return MalformedSnafu { reason: "empty" }.fail();
            }
            Ok(Unboxed::Cleartext(json!({ "type": "post", "text": text })))
        }
    }

    fn setup() -> (MemStore, GetHandler<MemStore>) {
        let store = MemStore::new();
        let handler = GetHandler::new(store.clone(), Some(Arc::new(Rot13)));
        (store, handler)
    }

    #[test]
    fn get_by_key() {
        let (store, handler) = setup();
        let message = append(&store, feed(1), json!({ "type": "post", "text": "hi" }));
        let kv = handler.get(json!(message.key().to_string())).unwrap();
        assert_eq!(kv.key, message.key());
        assert_eq!(kv.value, message);
        assert!(kv.meta.is_empty());

        let missing = Message {
            sequence: message.sequence.next(),
            ..message
        };
        assert!(matches!(
            handler.get(json!(missing.key().to_string())),
            Err(GetError::NotFound { .. })
        ));
        assert!(matches!(handler.get(json!(12)), Err(GetError::InvalidArgument { .. })));
        assert!(matches!(handler.get(json!("%nope")), Err(GetError::InvalidKey { .. })));
    }

    #[test]
    fn private_get() {
        let (store, handler) = setup();
        let boxed = append(&store, feed(1), json!("uryyb.box"));
        let kv = handler
            .get(json!({ "id": boxed.key().to_string(), "private": true }))
            .unwrap();
        assert_eq!(kv.value.content["text"], json!("hello"));
        assert_eq!(kv.meta["private"], json!(true));
        // the key is still the one of the stored message
        assert_eq!(kv.key, boxed.key());

        // not boxed is not an error
        let plain = append(&store, feed(1), json!({ "type": "post" }));
        let kv = handler
            .get(json!({ "id": plain.key().to_string(), "private": true }))
            .unwrap();
        assert_eq!(kv.value, plain);
        assert!(kv.meta.is_empty());

        let broken = append(&store, feed(1), json!(".box"));
        assert!(matches!(
            handler.get(json!({ "id": broken.key().to_string(), "private": true })),
            Err(GetError::Unbox { .. })
        ));

        let no_unboxer = GetHandler::new(store, None);
        assert!(matches!(
            no_unboxer.get(json!({ "id": boxed.key().to_string(), "private": true })),
            Err(GetError::NoUnboxer { .. })
        ));
        // plain messages never reach the unboxer
        let kv = no_unboxer
            .get(json!({ "id": plain.key().to_string(), "private": true }))
            .unwrap();
        assert_eq!(kv.value, plain);
    }

    #[tokio::test]
    async fn get_call() {
        let (store, handler) = setup();
        let message = append(&store, feed(1), json!({ "type": "about" }));
        let (req, mut events) = request(GET, CallType::Async, vec![json!(message.key().to_string())]);
        handler.handle_call(req).await;
        match events.recv().await {
            Some(StreamEvent::Return(payload)) => {
                let value = payload.into_json().unwrap();
                assert_eq!(value["value"]["content"]["type"], json!("about"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let (req, mut events) = request(GET, CallType::Async, vec![]);
        handler.handle_call(req).await;
        assert!(matches!(events.recv().await, Some(StreamEvent::CloseWithError(_))));
    }
}
