//! Scenarios 3 and 5 (spec §8): a multi-hop seek through intermediaries
//! that only forward, and loop suppression across a fully-connected
//! triangle.

use std::sync::Arc;

use meshpost::identity::{IdentityStore, MemoryIdentityStore};
use meshpost::surface;
use meshpost::transport::{bind_with_retry, listener_port, Node};
use meshpost::discovery;

async fn spawn_surfaced_node(username: &str) -> Arc<Node> {
    let store = Arc::new(MemoryIdentityStore::new(username).unwrap());
    let listener = bind_with_retry("127.0.0.1", 0, 1).await.unwrap();
    let port = listener_port(&listener).unwrap();
    store.set_current_ip_port("127.0.0.1", port).await.unwrap();

    let node = Arc::new(Node::new(store));
    tokio::spawn(surface::serve(listener, Arc::clone(&node)));
    node
}

async fn pair(left: &Node, right: &Node) {
    let (left_ip, left_port) = left.store.current_ip_port().await.unwrap().unwrap();
    let (right_ip, right_port) = right.store.current_ip_port().await.unwrap().unwrap();
    left.store
        .set_contact(right.store.username(), &right_ip, right_port)
        .await
        .unwrap();
    right
        .store
        .set_contact(left.store.username(), &left_ip, left_port)
        .await
        .unwrap();
}

#[tokio::test]
async fn three_hop_seek_discovers_the_target_through_two_forwarders() {
    let a = spawn_surfaced_node("a3").await;
    let b = spawn_surfaced_node("b3").await;
    let c = spawn_surfaced_node("c3").await;
    let d = spawn_surfaced_node("d3").await;

    pair(&a, &b).await;
    pair(&b, &c).await;
    pair(&c, &d).await;

    let d_public_key = d.store.public_key_text().await.unwrap();
    a.store.set_public_key("d3", &d_public_key).await.unwrap();

    let a_public_key = a.store.public_key_text().await.unwrap();
    d.store.set_public_key("a3", &a_public_key).await.unwrap();

    assert!(a.store.get_contact("d3").await.unwrap().is_none());
    assert!(d.store.get_contact("a3").await.unwrap().is_none());

    discovery::seek_user(&a, "d3").await.unwrap();

    // The seek_user_response is sent directly from d3 to a3 once d3
    // finishes pinging/challenging a3; give that a moment to land.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let discovered = a.store.get_contact("d3").await.unwrap();
    assert!(discovered.is_some(), "a3 should have learned d3's address");

    let (d_ip, d_port) = d.store.current_ip_port().await.unwrap().unwrap();
    let discovered = discovered.unwrap();
    assert_eq!(discovered.ip, d_ip);
    assert_eq!(discovered.port, d_port);

    assert!(d.store.get_contact("a3").await.unwrap().is_some());
}

#[tokio::test]
async fn loop_suppression_across_a_fully_connected_triangle() {
    let a = spawn_surfaced_node("a5").await;
    let b = spawn_surfaced_node("b5").await;
    let c = spawn_surfaced_node("c5").await;

    pair(&a, &b).await;
    pair(&b, &c).await;
    pair(&a, &c).await;

    // a5 seeks an unknown target; since it holds no public key for it,
    // this fails fast instead of flooding — exercising the same
    // custody-chain-tagged frame shape `pulse_network` uses, which
    // never needs a public key and is safe to flood for real.
    let response = discovery::pulse_network(&a).await.unwrap();
    assert!(response.success);

    // Every peer in a's book gets exactly one pulse; each forwards to
    // its remaining peers, whose hashes are already in the chain after
    // one hop in a triangle, so nothing loops back to a5 or b5/c5 twice.
    // We can't directly observe frame_ids here without instrumentation
    // hooks into the handler, so this asserts the weaker but still
    // meaningful property: the call completes and reports two direct
    // sends (a5's own address book has exactly b5 and c5).
    assert_eq!(response.field_str("message"), Some("pulse sent to 2 peers"));
}
