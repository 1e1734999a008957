//! In-memory implementation of the storage traits.
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock},
};

use bytes::Bytes;

use super::{BlobStore, FeedStore, OutOfOrderSnafu, StoreError};
use crate::{
    message::Message,
    refs::{BlobRef, FeedRef, Hash, MessageRef, Seq},
};

/// Feeds and blobs kept in memory.
///
/// Cloning is cheap and clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    feeds: BTreeMap<FeedRef, Vec<Message>>,
    keys: HashMap<MessageRef, (FeedRef, Seq)>,
    blobs: HashMap<Hash, Bytes>,
}

impl MemStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn index(seq: Seq) -> Option<usize> {
    (seq.get() as usize).checked_sub(1)
}

impl FeedStore for MemStore {
    fn get(&self, feed: &FeedRef, seq: Seq) -> Result<Option<Message>, StoreError> {
        let inner = self.inner.read().expect("poisoned");
        let Some(idx) = index(seq) else {
            return Ok(None);
        };
        Ok(inner.feeds.get(feed).and_then(|log| log.get(idx)).cloned())
    }

    fn append(&self, message: Message) -> Result<Seq, StoreError> {
        let mut inner = self.inner.write().expect("poisoned");
        let feed = message.author;
        let key = message.key();
        let log = inner.feeds.entry(feed).or_default();
        let expected = Seq::from(log.len() as u64).next();
        snafu::ensure!(
            message.sequence == expected,
            OutOfOrderSnafu {
                feed,
                expected,
                got: message.sequence,
            }
        );
        log.push(message);
        inner.keys.insert(key, (feed, expected));
        Ok(expected)
    }

    fn current_seq(&self, feed: &FeedRef) -> Result<Seq, StoreError> {
        let inner = self.inner.read().expect("poisoned");
        let len = inner.feeds.get(feed).map(Vec::len).unwrap_or_default();
        Ok(Seq::from(len as u64))
    }

    fn feeds(&self) -> Result<Vec<FeedRef>, StoreError> {
        let inner = self.inner.read().expect("poisoned");
        Ok(inner
            .feeds
            .iter()
            .filter(|(_, log)| !log.is_empty())
            .map(|(feed, _)| *feed)
            .collect())
    }

    fn get_message(&self, key: &MessageRef) -> Result<Option<Message>, StoreError> {
        let inner = self.inner.read().expect("poisoned");
        let Some((feed, seq)) = inner.keys.get(key) else {
            return Ok(None);
        };
        Ok(index(*seq)
            .and_then(|idx| inner.feeds.get(feed)?.get(idx))
            .cloned())
    }
}

impl BlobStore for MemStore {
    fn put(&self, blob: &BlobRef, content: Bytes) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("poisoned");
        inner.blobs.insert(blob.hash(), content);
        Ok(())
    }

    fn get(&self, hash: &Hash) -> Result<Option<Bytes>, StoreError> {
        let inner = self.inner.read().expect("poisoned");
        Ok(inner.blobs.get(hash).cloned())
    }

    fn size(&self, hash: &Hash) -> Result<Option<u64>, StoreError> {
        let inner = self.inner.read().expect("poisoned");
        Ok(inner.blobs.get(hash).map(|content| content.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;
    use serde_json::json;

    use super::*;

    fn entry(author: FeedRef, seq: u64) -> Message {
        Message {
            previous: None,
            author,
            sequence: Seq::from(seq),
            timestamp: seq as i64,
            content: json!({ "type": "test", "n": seq }),
        }
    }

    #[test]
    fn append_is_gap_free() {
        let store = MemStore::new();
        let feed = FeedRef::ed25519(SigningKey::from_bytes(&[4; 32]).verifying_key().into());
        assert_eq!(store.current_seq(&feed).unwrap(), Seq::ZERO);
        assert!(!store.has_feed(&feed).unwrap());

        assert_eq!(store.append(entry(feed, 1)).unwrap(), Seq::FIRST);
        let err = store.append(entry(feed, 3)).unwrap_err();
        assert!(matches!(err, StoreError::OutOfOrder { expected, .. } if expected == Seq::from(2)));
        let err = store.append(entry(feed, 1)).unwrap_err();
        assert!(matches!(err, StoreError::OutOfOrder { .. }));

        store.append(entry(feed, 2)).unwrap();
        assert_eq!(store.current_seq(&feed).unwrap(), Seq::from(2));
        assert_eq!(store.feeds().unwrap(), vec![feed]);

        let second = FeedStore::get(&store, &feed, Seq::from(2)).unwrap().unwrap();
        assert_eq!(store.get_message(&second.key()).unwrap(), Some(second));
        assert!(FeedStore::get(&store, &feed, Seq::ZERO).unwrap().is_none());
    }

    #[test]
    fn blobs() {
        let store = MemStore::new();
        let content = Bytes::from_static(b"blob content");
        let blob = BlobRef::of(&content);
        assert!(!store.has(&blob.hash()).unwrap());
        store.put(&blob, content.clone()).unwrap();
        assert_eq!(store.size(&blob.hash()).unwrap(), Some(12));
        assert_eq!(BlobStore::get(&store, &blob.hash()).unwrap(), Some(content));
    }
}
