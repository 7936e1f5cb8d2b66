//! Mutual public-key-possession challenges (spec §4.4).
//!
//! Both challenges are "send random string, verify echo", one in each
//! direction: `challenge_user_pk` proves the peer holds the private key
//! for the public key we have on file for them; `challenge_user_has_pk`
//! proves the peer holds *our* public key.

use log::{info, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::crypto::{rsa_decrypt, rsa_encrypt};
use crate::error::MeshError;
use crate::frame::{Action, Frame, Response};
use crate::identity::IdentityStore;
use crate::transport::{send_frame_to_user, Node};

fn random_challenge_text() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

#[derive(Serialize, Deserialize)]
struct ChallengeUserPkPayload {
    challenge: String,
}

#[derive(Serialize, Deserialize)]
struct ChallengeUserHasPkPayload {
    u2: String,
    challenge_text: String,
}

/// Proves peer holds the private key matching the public key we have on
/// file for them. Returns `Ok(true)` on a verified echo, `Ok(false)` on
/// any mismatch or reported failure (never treats "challenge failed" as
/// a `MeshError` — that's a legitimate negative outcome, not a fault).
pub async fn challenge_user_pk(node: &Node, peer_username: &str) -> Result<bool, MeshError> {
    let peer_public_key = node
        .store
        .get_public_key(peer_username)
        .await?
        .ok_or_else(|| MeshError::semantic(format!("no public key on file for {peer_username}")))?;

    let plaintext = random_challenge_text();
    let ciphertext = rsa_encrypt(plaintext.as_bytes(), &peer_public_key)?;

    let frame = Frame::new(
        Action::ChallengeUserPk,
        ChallengeUserPkPayload {
            challenge: hex::encode(ciphertext),
        },
    )?;

    let response = send_frame_to_user(node.store.as_ref(), peer_username, &frame).await?;
    if !response.success {
        return Ok(false);
    }
    let matches = response.field_str("decrypted_challenge") == Some(plaintext.as_str());
    info!("challenge_user_pk({peer_username}) -> {matches}");
    Ok(matches)
}

/// Handler side of `challenge_user_pk`: decrypt with our private key and
/// echo the plaintext. A decrypt failure here is an authentic failure
/// (unlike in the seek protocol) since challenges are always addressed
/// to us.
pub async fn handle_challenge_user_pk(node: &Node, frame: &Frame) -> Result<Response, MeshError> {
    let payload: ChallengeUserPkPayload = frame.payload_as()?;
    let ciphertext = crate::crypto::hexstr2bytes(&payload.challenge)?;
    let private_key = node.store.private_key_text().await?;

    let plaintext = rsa_decrypt(&ciphertext, &private_key)?;
    let decrypted_challenge = String::from_utf8(plaintext)
        .map_err(|e| MeshError::Crypto(format!("challenge plaintext not utf8: {e}")))?;

    Ok(Response::ok().with_field("decrypted_challenge", decrypted_challenge))
}

/// Proves the peer has *our* public key: we send them a random
/// plaintext, they encrypt it to our public key (proving they know
/// which key is ours), we decrypt and compare.
pub async fn challenge_user_has_pk(node: &Node, peer_username: &str) -> Result<bool, MeshError> {
    let plaintext = random_challenge_text();

    let frame = Frame::new(
        Action::ChallengeUserHasPk,
        ChallengeUserHasPkPayload {
            u2: node.store.username().to_string(),
            challenge_text: plaintext.clone(),
        },
    )?;

    let response = send_frame_to_user(node.store.as_ref(), peer_username, &frame).await?;
    if !response.success {
        warn!("challenge_user_has_pk({peer_username}) rejected: peer lacks our key");
        return Ok(false);
    }

    let encrypted_hex = response
        .field_str("encrypted_challenge")
        .ok_or_else(|| MeshError::Decode("missing encrypted_challenge in response".into()))?;
    let ciphertext = crate::crypto::hexstr2bytes(encrypted_hex)?;
    let private_key = node.store.private_key_text().await?;

    let decrypted = match rsa_decrypt(&ciphertext, &private_key) {
        Ok(bytes) => bytes,
        Err(_) => return Ok(false),
    };
    Ok(decrypted == plaintext.as_bytes())
}

/// Handler side: look up the requester's public key, encrypt the
/// plaintext to it. `{success:false}` if we don't hold that key.
pub async fn handle_challenge_user_has_pk(node: &Node, frame: &Frame) -> Result<Response, MeshError> {
    let payload: ChallengeUserHasPkPayload = frame.payload_as()?;

    let public_key = match node.store.get_public_key(&payload.u2).await? {
        Some(key) => key,
        None => return Ok(Response::err(format!("no public key on file for {}", payload.u2))),
    };

    let ciphertext = rsa_encrypt(payload.challenge_text.as_bytes(), &public_key)?;
    Ok(Response::ok().with_field("encrypted_challenge", hex::encode(ciphertext)))
}
