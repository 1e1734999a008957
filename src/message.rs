//! Feed entries.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::refs::{BlobRef, FeedRef, Hash, MessageRef, Seq};

/// A single entry of a feed.
///
/// The content is opaque JSON to this crate, except that blob references are extracted from
/// it with [`Message::blobs`]. Encrypted ("boxed") content is a string ending in `.box`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Key of the previous entry, `None` for the first one.
    pub previous: Option<MessageRef>,
    /// The feed this entry belongs to.
    pub author: FeedRef,
    /// Position in the feed, starting at 1.
    pub sequence: Seq,
    /// Claimed creation time, milliseconds since the unix epoch.
    pub timestamp: i64,
    /// The payload.
    pub content: Value,
}

impl Message {
    /// The key of this message, the hash of its JSON encoding.
    pub fn key(&self) -> MessageRef {
        let encoded = serde_json::to_vec(self).expect("messages always encode to json");
        MessageRef::new(Hash::new(encoded))
    }

    /// All blobs referenced from the content, deduplicated.
    ///
    /// A `{ "link": "&...", "size": n }` object declares the size of the linked blob.
    pub fn blobs(&self) -> Vec<BlobRef> {
        let mut found = Vec::new();
        collect_blobs(&self.content, &mut found);
        found
    }

    /// Whether the content is encrypted.
    pub fn is_boxed(&self) -> bool {
        matches!(&self.content, Value::String(s) if s.ends_with(".box"))
    }
}

fn collect_blobs(value: &Value, found: &mut Vec<BlobRef>) {
    match value {
        Value::String(s) => {
            if let Ok(blob) = s.parse::<BlobRef>() {
                push_blob(found, blob);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_blobs(item, found);
            }
        }
        Value::Object(map) => {
            if let (Some(Value::String(link)), Some(size)) =
                (map.get("link"), map.get("size").and_then(Value::as_u64))
            {
                if let Ok(blob) = link.parse::<BlobRef>() {
                    push_blob(found, blob.with_size(size));
                }
            }
            for item in map.values() {
                collect_blobs(item, found);
            }
        }
        _ => {}
    }
}

fn push_blob(found: &mut Vec<BlobRef>, blob: BlobRef) {
    match found.iter_mut().find(|existing| **existing == blob) {
        Some(existing) if existing.size().is_none() => *existing = blob,
        Some(_) => {}
        None => found.push(blob),
    }
}

/// A message together with its key, as served by `get` and by history streams that asked
/// for keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    /// The key of the message.
    pub key: MessageRef,
    /// The message.
    pub value: Message,
    /// When the message was received locally.
    pub timestamp: i64,
    /// Additional local annotations, such as `private: true` for unboxed messages.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
}

impl KeyValue {
    /// Wraps a message with its key.
    pub fn new(value: Message) -> Self {
        Self {
            key: value.key(),
            timestamp: value.timestamp,
            value,
            meta: Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;
    use serde_json::json;

    use super::*;

    fn msg(content: Value) -> Message {
        let author = FeedRef::ed25519(SigningKey::from_bytes(&[9; 32]).verifying_key().into());
        Message {
            previous: None,
            author,
            sequence: Seq::FIRST,
            timestamp: 1_700_000_000_000,
            content,
        }
    }

    #[test]
    fn extracts_nested_blobs() {
        let a = BlobRef::of(b"a");
        let b = BlobRef::of(b"bb");
        let m = msg(json!({
            "type": "post",
            "text": format!("look at {a}"),
            "image": a.to_string(),
            "mentions": [
                { "link": b.to_string(), "size": 2, "name": "b.txt" },
                { "link": b.to_string() },
                "not a ref",
            ],
        }));
        let blobs = m.blobs();
        assert_eq!(blobs.len(), 2);
        assert!(blobs.contains(&a));
        let found_b = blobs.iter().find(|x| **x == b).unwrap();
        assert_eq!(found_b.size(), Some(2));
    }

    #[test]
    fn key_depends_on_content() {
        let one = msg(json!({ "type": "post", "text": "one" }));
        let two = msg(json!({ "type": "post", "text": "two" }));
        assert_ne!(one.key(), two.key());
        assert_eq!(one.key(), one.clone().key());
    }

    #[test]
    fn boxed_content() {
        assert!(msg(json!("c2VjcmV0.box")).is_boxed());
        assert!(!msg(json!({ "type": "post" })).is_boxed());
    }

    #[test]
    fn key_value_json_shape() {
        let kv = KeyValue::new(msg(json!({ "type": "about" })));
        let value = serde_json::to_value(&kv).unwrap();
        assert_eq!(value["key"], json!(kv.key.to_string()));
        assert_eq!(value["value"]["sequence"], json!(1));
        assert!(value.get("meta").is_none());
    }
}
