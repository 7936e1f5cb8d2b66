//! Public-key exchange (spec §4.3): a deliberately two-phase,
//! user-gated handshake. A `request_public_key` never gets an
//! immediate synchronous key back — the responder files it, a later
//! "process requests" pass approves and answers, and a "process
//! responses" pass on the initiator side decrypts and commits.

use log::info;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::crypto::{rsa_decrypt, rsa_encrypt, symmetric_decrypt_text, symmetric_encrypt};
use crate::error::MeshError;
use crate::frame::{Action, Frame, Response};
use crate::identity::{IdentityStore, PublicKeyResponsePayload};
use crate::transport::{send_frame_to_user, Node};

#[derive(Serialize, Deserialize)]
struct RequestPublicKeyPayload {
    user2: String,
    public_key: String,
}

#[derive(Serialize, Deserialize)]
struct PublicKeyResponseWire {
    from_username: String,
    password: String,
    public_key: String,
}

/// Sends our username and PEM to `peer_username`, asking them to file a
/// request. Does not return a key — see `process_public_key_responses`.
pub async fn request_public_key(node: &Node, peer_username: &str) -> Result<Response, MeshError> {
    let frame = Frame::new(
        Action::RequestPublicKey,
        RequestPublicKeyPayload {
            user2: node.store.username().to_string(),
            public_key: node.store.public_key_text().await?,
        },
    )?;
    send_frame_to_user(node.store.as_ref(), peer_username, &frame).await
}

/// Handler side: file the request and the volunteered key. Never
/// commits the key to the trusted store (spec §3 invariant).
pub async fn handle_request_public_key(node: &Node, frame: &Frame) -> Result<Response, MeshError> {
    let payload: RequestPublicKeyPayload = frame.payload_as()?;
    node.store
        .store_public_key_request(&payload.user2, &payload.public_key)
        .await?;
    info!("filed public_key_request from {}", payload.user2);
    Ok(Response::ok_with(format!(
        "queued public key request from {}",
        payload.user2
    )))
}

/// Approves every queued request and sends a `public_key_response` for
/// each. Returns the usernames successfully answered.
pub async fn process_public_key_requests(node: &Node) -> Result<Vec<String>, MeshError> {
    let requests = node.store.list_public_key_requests().await?;
    let mut answered = Vec::new();

    for request in requests {
        let mut password = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut password);

        let our_pem = node.store.public_key_text().await?;
        let encrypted_pem = symmetric_encrypt(our_pem.as_bytes(), &password)?;
        let encrypted_password = rsa_encrypt(&password, &request.volunteered_public_key)?;

        let frame = Frame::new(
            Action::PublicKeyResponse,
            PublicKeyResponseWire {
                from_username: node.store.username().to_string(),
                password: hex::encode(encrypted_password),
                public_key: hex::encode(encrypted_pem),
            },
        )?;

        let response = send_frame_to_user(node.store.as_ref(), &request.from_username, &frame).await?;
        if response.success {
            node.store.remove_public_key_request(&request.from_username).await?;
            answered.push(request.from_username);
        }
    }

    Ok(answered)
}

/// Handler side: file the response for later processing. Does not
/// decrypt synchronously.
pub async fn handle_public_key_response(node: &Node, frame: &Frame) -> Result<Response, MeshError> {
    let payload: PublicKeyResponseWire = frame.payload_as()?;
    node.store
        .store_public_key_response(PublicKeyResponsePayload {
            from_username: payload.from_username.clone(),
            password: payload.password,
            public_key: payload.public_key,
        })
        .await?;
    Ok(Response::ok_with(format!(
        "queued public key response from {}",
        payload.from_username
    )))
}

/// Decrypts every queued response and commits the recovered key under
/// `public_keys[from_username]`. Per spec §9's resolution of the
/// auto-trust open question, this commits on a successful decrypt alone
/// — a follow-up `challenge_user_pk` is left to the caller.
pub async fn process_public_key_responses(node: &Node) -> Result<Vec<String>, MeshError> {
    let responses = node.store.list_public_key_responses().await?;
    let mut committed = Vec::new();
    let private_key = node.store.private_key_text().await?;

    for response in responses {
        let encrypted_password = crate::crypto::hexstr2bytes(&response.password)?;
        let password = match rsa_decrypt(&encrypted_password, &private_key) {
            Ok(password) => password,
            Err(_) => continue,
        };

        let encrypted_pem = crate::crypto::hexstr2bytes(&response.public_key)?;
        let pem = match symmetric_decrypt_text(&encrypted_pem, &password) {
            Ok(pem) => pem.trim_end().to_string(),
            Err(_) => continue,
        };

        node.store.set_public_key(&response.from_username, &pem).await?;
        node.store.remove_public_key_response(&response.from_username).await?;
        committed.push(response.from_username);
    }

    Ok(committed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MemoryIdentityStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn request_is_filed_not_auto_trusted() {
        let store = MemoryIdentityStore::new("bob").unwrap();
        let node = Node::new(Arc::new(store));

        let alice_pem = crate::crypto::generate_rsa_keypair().unwrap().public_key_text;
        let frame = Frame::new(
            Action::RequestPublicKey,
            RequestPublicKeyPayload {
                user2: "alice".to_string(),
                public_key: alice_pem,
            },
        )
        .unwrap();

        let response = handle_request_public_key(&node, &frame).await.unwrap();
        assert!(response.success);
        assert!(node.store.get_public_key("alice").await.unwrap().is_none());
        assert_eq!(node.store.list_public_key_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn repeated_request_from_same_user_leaves_one_queued_entry() {
        let store = MemoryIdentityStore::new("bob").unwrap();
        store.store_public_key_request("alice", "pem-v1").await.unwrap();
        store.store_public_key_request("alice", "pem-v2").await.unwrap();
        assert_eq!(store.list_public_key_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn response_round_trip_commits_under_correct_username() {
        let responder = MemoryIdentityStore::new("bob").unwrap();
        let responder_pem = responder.public_key_text().await.unwrap();
        let initiator = MemoryIdentityStore::new("alice").unwrap();
        let initiator_pem = initiator.public_key_text().await.unwrap();

        let mut password = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut password);
        let encrypted_pem = symmetric_encrypt(responder_pem.as_bytes(), &password).unwrap();
        let encrypted_password = rsa_encrypt(&password, &initiator_pem).unwrap();

        initiator
            .store_public_key_response(PublicKeyResponsePayload {
                from_username: "bob".to_string(),
                password: hex::encode(encrypted_password),
                public_key: hex::encode(encrypted_pem),
            })
            .await
            .unwrap();

        let node = Node::new(Arc::new(initiator));
        let committed = process_public_key_responses(&node).await.unwrap();
        assert_eq!(committed, vec!["bob".to_string()]);
        assert_eq!(
            node.store.get_public_key("bob").await.unwrap().unwrap(),
            responder_pem
        );
    }
}
