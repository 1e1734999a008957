//! Gossip replication of append-only feeds and the blobs they reference.
//!
//! A [`Node`](node::Node) replicates over connections established by an external transport.
//! For every connection it runs a replication [`Cascade`](gossip::Cascade) that pulls feed
//! history from the remote, and it answers the calls the remote makes in turn:
//!
//! - `createHistoryStream`, `gossip.ping` and `gossip.connect`, see [`gossip`],
//! - `blobs.want` and `blobs.get`, see [`blobs`],
//! - `get`, see [`get`].
//!
//! Blobs referenced by replicated messages are registered with the
//! [`WantManager`](want::WantManager), which finds peers that have them, retrieves and verifies
//! their content.
//!
//! The transport, the storage and the decryption of private messages are collaborators this
//! crate only defines contracts for, see [`rpc`], [`store`] and [`private`].
#![warn(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod blobs;
pub mod config;
pub mod get;
pub mod gossip;
pub mod keys;
pub mod message;
pub mod metrics;
pub mod node;
pub mod private;
pub mod protocol;
pub mod refs;
pub mod rpc;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod want;

pub use self::{
    config::Config,
    keys::KeyPair,
    node::Node,
    refs::{BlobRef, FeedRef, Hash, MessageRef, PeerId, Seq},
    want::WantManager,
};
