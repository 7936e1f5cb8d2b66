//! Scenario 1 (spec §8): two peers, each in the other's ipcache,
//! neither holding the other's public key. A requests B's key; B
//! processes its queue; A processes its responses. Both public_keys
//! stores end up populated.

use std::sync::Arc;

use meshpost::identity::{IdentityStore, MemoryIdentityStore};
use meshpost::surface;
use meshpost::transport::{bind_with_retry, listener_port, Node};
use meshpost::{pubkey, transport};

async fn spawn_surfaced_node(username: &str) -> (Arc<Node>, u16) {
    let store = Arc::new(MemoryIdentityStore::new(username).unwrap());
    let listener = bind_with_retry("127.0.0.1", 0, 1).await.unwrap();
    let port = listener_port(&listener).unwrap();
    store.set_current_ip_port("127.0.0.1", port).await.unwrap();

    let node = Arc::new(Node::new(store));
    tokio::spawn(surface::serve(listener, Arc::clone(&node)));
    (node, port)
}

#[tokio::test]
async fn two_peer_pairing_exchanges_public_keys() {
    let (a, a_port) = spawn_surfaced_node("alice").await;
    let (b, b_port) = spawn_surfaced_node("bob").await;

    a.store.set_contact("bob", "127.0.0.1", b_port).await.unwrap();
    b.store.set_contact("alice", "127.0.0.1", a_port).await.unwrap();

    assert!(a.store.get_public_key("bob").await.unwrap().is_none());
    assert!(b.store.get_public_key("alice").await.unwrap().is_none());

    let response = pubkey::request_public_key(&a, "bob").await.unwrap();
    assert!(response.success);

    let answered = pubkey::process_public_key_requests(&b).await.unwrap();
    assert_eq!(answered, vec!["alice".to_string()]);

    let committed = pubkey::process_public_key_responses(&a).await.unwrap();
    assert_eq!(committed, vec!["bob".to_string()]);

    assert_eq!(
        a.store.get_public_key("bob").await.unwrap().unwrap(),
        b.store.public_key_text().await.unwrap(),
    );

    let response = transport::send_frame_to_user(
        a.store.as_ref(),
        "bob",
        &meshpost::frame::Frame::new(meshpost::frame::Action::Ping, serde_json::json!({})).unwrap(),
    )
    .await
    .unwrap();
    assert!(response.success);
}

#[tokio::test]
async fn direct_challenges_succeed_after_pairing() {
    let (a, a_port) = spawn_surfaced_node("alice2").await;
    let (b, b_port) = spawn_surfaced_node("bob2").await;

    a.store.set_contact("bob2", "127.0.0.1", b_port).await.unwrap();
    b.store.set_contact("alice2", "127.0.0.1", a_port).await.unwrap();

    pubkey::request_public_key(&a, "bob2").await.unwrap();
    pubkey::process_public_key_requests(&b).await.unwrap();
    pubkey::process_public_key_responses(&a).await.unwrap();

    // For the has_pk challenge to succeed, bob2 also needs alice2's key.
    pubkey::request_public_key(&b, "alice2").await.unwrap();
    pubkey::process_public_key_requests(&a).await.unwrap();
    pubkey::process_public_key_responses(&b).await.unwrap();

    assert!(meshpost::challenge::challenge_user_pk(&a, "bob2").await.unwrap());
    assert!(meshpost::challenge::challenge_user_has_pk(&a, "bob2").await.unwrap());
}
