//! Feed replication between connected peers.
//!
//! On every new connection the [`GossipHandler`] runs a replication [`Cascade`], which pulls
//! the history of the remote's own feed, of our own feed if we lost it, and of every feed we
//! know about. In the other direction it answers the same `createHistoryStream` calls from the
//! remote, plus the `gossip.ping` liveness probe and `gossip.connect`.

use serde::{Deserialize, Serialize};

use crate::refs::{FeedRef, Seq};

pub mod cascade;
mod handler;

pub use self::{
    cascade::{Cascade, StepKind, StepOutcome},
    handler::{GossipHandler, HandlerError},
};

/// Streams the history of a feed.
pub const CREATE_HISTORY_STREAM: &str = "createHistoryStream";
/// Liveness probe.
pub const PING: &str = "gossip.ping";
/// Asks the node to dial another peer.
pub const CONNECT: &str = "gossip.connect";

/// Arguments of `createHistoryStream`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryArgs {
    /// The feed to stream.
    pub id: FeedRef,
    /// First sequence to send.
    #[serde(default, alias = "sequence")]
    pub seq: Seq,
    /// Maximum number of entries to send.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// Keep the stream open for new entries. Not supported, the stream ends when the history
    /// is exhausted.
    #[serde(default)]
    pub live: bool,
    /// Send `{ key, value, timestamp }` envelopes instead of bare entries.
    #[serde(default)]
    pub keys: bool,
}

impl HistoryArgs {
    /// Requests the history of `id` starting at `seq`.
    pub fn new(id: FeedRef, seq: Seq) -> Self {
        Self {
            id,
            seq,
            limit: None,
            live: false,
            keys: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::test_utils::feed;

    #[test]
    fn history_args_accept_sequence_alias() {
        let id = feed(1);
        let args: HistoryArgs =
            serde_json::from_value(json!({ "id": id.to_string(), "sequence": 4 })).unwrap();
        assert_eq!(args.seq, Seq::from(4));
        assert!(!args.keys);

        let encoded = serde_json::to_value(HistoryArgs::new(id, Seq::FIRST)).unwrap();
        assert_eq!(
            encoded,
            json!({ "id": id.to_string(), "seq": 1, "live": false, "keys": false })
        );
    }
}
