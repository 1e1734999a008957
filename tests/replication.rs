use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use n0_snafu::{Result, ResultExt};
use serde_json::json;
use ssb_gossip::{
    BlobRef, Node, Seq,
    get::GET,
    rpc::{CallType, Endpoint, Method},
    store::{BlobStore, FeedStore, mem::MemStore},
    test_utils::{LoopbackEndpoint, StreamEvent, append, feed, populate, request},
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing_test::traced_test;

fn node(seed: u8) -> Node<MemStore> {
    Node::builder(feed(seed), MemStore::new()).spawn()
}

#[tokio::test]
#[traced_test]
async fn fresh_peer_replicates_feed() -> Result {
    let alice = node(1);
    let bob = node(2);
    populate(alice.store(), alice.me(), 10);

    let conn = Arc::new(LoopbackEndpoint::to_node(&alice));
    bob.handle_connection(conn, n0_future::stream::empty()).await;

    assert_eq!(bob.store().current_seq(&alice.me())?, Seq::from(10));
    let mut previous = None;
    for seq in 1..=10u64 {
        let seq = Seq::from(seq);
        let entry = FeedStore::get(bob.store(), &alice.me(), seq)?;
        let original = FeedStore::get(alice.store(), &alice.me(), seq)?;
        assert_eq!(entry, original);
        let entry = entry.expect("replicated");
        assert_eq!(entry.previous, previous);
        previous = Some(entry.key());
    }
    assert_eq!(bob.gossip_metrics().messages_appended.get(), 10);
    // alice's feed, then bob's own which alice does not have
    assert_eq!(bob.gossip_metrics().feeds_fetched.get(), 2);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn replication_goes_both_ways() -> Result {
    let alice = node(1);
    let bob = node(2);
    populate(alice.store(), alice.me(), 3);
    populate(bob.store(), bob.me(), 5);
    // a third feed only bob follows
    populate(bob.store(), feed(3), 2);
    populate(alice.store(), feed(3), 4);

    let to_alice = Arc::new(LoopbackEndpoint::to_node(&alice));
    let to_bob = Arc::new(LoopbackEndpoint::to_node(&bob));
    tokio::join!(
        bob.handle_connection(to_alice, n0_future::stream::empty()),
        alice.handle_connection(to_bob, n0_future::stream::empty()),
    );

    assert_eq!(bob.store().current_seq(&alice.me())?, Seq::from(3));
    assert_eq!(alice.store().current_seq(&bob.me())?, Seq::from(5));
    assert_eq!(bob.store().current_seq(&feed(3))?, Seq::from(4));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn referenced_blobs_follow_their_messages() -> Result {
    let alice = node(1);
    let bob = node(2);
    let content = Bytes::from_static(b"a picture of a cat");
    let blob = BlobRef::of(&content);
    alice.store().put(&blob, content.clone())?;
    let post = append(
        alice.store(),
        alice.me(),
        json!({ "type": "post", "text": "look", "mentions": [{ "link": blob.to_string() }] }),
    );

    let (calls_tx, calls_rx) = mpsc::unbounded_channel();
    let conn = Arc::new(LoopbackEndpoint::to_node(&alice));
    let task = tokio::spawn({
        let bob = bob.clone();
        async move {
            bob.handle_connection(conn, UnboundedReceiverStream::new(calls_rx))
                .await
        }
    });

    tokio::time::timeout(Duration::from_secs(5), async {
        while !bob.store().has(&blob.hash()).unwrap_or(false) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .e()?;
    assert_eq!(BlobStore::get(bob.store(), &blob.hash())?, Some(content));
    assert!(bob.wants().snapshot().await?.is_empty());
    assert_eq!(bob.want_metrics().blobs_resolved.get(), 1);

    // alice can read the replicated message back from bob
    let to_bob = LoopbackEndpoint::to_node(&bob);
    let reply = to_bob
        .call(Method::new(GET), vec![json!(post.key().to_string())])
        .await?
        .into_json()
        .expect("json reply");
    assert_eq!(reply["key"], json!(post.key().to_string()));
    assert_eq!(reply["value"]["content"]["text"], json!("look"));

    // calls made over the connection are served while it is open
    let (req, mut events) = request("whoami", CallType::Async, vec![]);
    calls_tx.send(req).e()?;
    assert_eq!(
        events.recv().await,
        Some(StreamEvent::CloseWithError("unknown command: whoami".into()))
    );

    drop(calls_tx);
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .e()?
        .e()?;
    bob.shutdown().await;
    alice.shutdown().await;
    Ok(())
}
