//! Storage collaborators: the feed log and the blob store.
//!
//! The storage engine itself is not part of this crate. Replication only needs the narrow
//! interfaces below; [`mem::MemStore`] implements both in memory.

use std::fmt::Debug;

use bytes::Bytes;
use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};

use crate::{
    message::Message,
    refs::{BlobRef, FeedRef, Hash, MessageRef, Seq},
};

pub mod mem;

/// Errors from a storage backend.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub))]
pub enum StoreError {
    /// The appended entry does not directly follow the current end of its feed.
    #[snafu(display("out of order append to {feed}: expected sequence {expected}, got {got}"))]
    OutOfOrder {
        feed: FeedRef,
        expected: Seq,
        got: Seq,
    },
    #[snafu(display("storage backend failure"))]
    Backend { source: std::io::Error },
}

/// The append-only log of feed entries.
///
/// The current sequence of a feed is its replication cursor: it only ever grows, by one per
/// append.
pub trait FeedStore: Debug + Clone + Send + Sync + 'static {
    /// The entry of `feed` at `seq`, if present.
    fn get(&self, feed: &FeedRef, seq: Seq) -> Result<Option<Message>, StoreError>;

    /// Appends an entry at the end of its author's feed and returns its sequence.
    ///
    /// Fails with [`StoreError::OutOfOrder`] unless the sequence of the entry is exactly one
    /// past the current end.
    fn append(&self, message: Message) -> Result<Seq, StoreError>;

    /// The sequence of the last entry of `feed`, [`Seq::ZERO`] for unknown feeds.
    fn current_seq(&self, feed: &FeedRef) -> Result<Seq, StoreError>;

    /// All feeds with at least one entry.
    fn feeds(&self) -> Result<Vec<FeedRef>, StoreError>;

    /// Whether any entry of `feed` is present.
    fn has_feed(&self, feed: &FeedRef) -> Result<bool, StoreError> {
        Ok(self.current_seq(feed)? > Seq::ZERO)
    }

    /// Looks up an entry by its key.
    fn get_message(&self, key: &MessageRef) -> Result<Option<Message>, StoreError>;
}

/// Content addressed blob storage.
pub trait BlobStore: Debug + Clone + Send + Sync + 'static {
    /// Stores verified content.
    fn put(&self, blob: &BlobRef, content: Bytes) -> Result<(), StoreError>;

    /// Whether the blob is present.
    fn has(&self, hash: &Hash) -> Result<bool, StoreError> {
        Ok(self.size(hash)?.is_some())
    }

    /// The content of a blob.
    fn get(&self, hash: &Hash) -> Result<Option<Bytes>, StoreError>;

    /// The size of a blob, `None` if it is not present.
    fn size(&self, hash: &Hash) -> Result<Option<u64>, StoreError>;
}
