//! Three-phase chunked message transfer (spec §4.7): a key frame
//! establishes the per-message content password, chunk frames carry
//! 4096-byte plaintext pieces, a terminator closes the message out.
//! Each phase uses its own RSA-wrapped transport password; only the
//! content password from the key frame survives across frames.

use log::info;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{bytes2hexstr, hexstr2bytes, rsa_decrypt, rsa_encrypt, symmetric_decrypt, symmetric_decrypt_text, symmetric_encrypt};
use crate::error::MeshError;
use crate::frame::{Action, Frame, Response};
use crate::identity::MessageKey;
use crate::transport::{send_frame_to_user, Node};

pub const CHUNK_SIZE: usize = 4096;

fn is_binary(mime_type: &str) -> bool {
    matches!(mime_type, "image/png" | "image/jpg")
}

#[derive(Serialize, Deserialize)]
struct SendMessageKeyPayload {
    key: String,
    password: String,
}

#[derive(Serialize, Deserialize)]
struct KeyWirePayload {
    password: String,
    message_id: String,
    filename: String,
    length: u64,
    md5: String,
}

#[derive(Serialize, Deserialize)]
struct SendMessagePayload {
    password: String,
    meta: String,
    content: String,
}

#[derive(Serialize, Deserialize)]
struct MetaWirePayload {
    message_id: String,
    filename: String,
    mime_type: String,
}

#[derive(Serialize, Deserialize)]
struct SendMessageTermPayload {
    term: String,
    password: String,
}

fn fresh_password() -> [u8; 32] {
    let mut password = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut password);
    password
}

/// Drives the whole three-phase upload of `content` to `peer_username`.
/// Per spec §5, chunks are sent sequentially, each awaiting its
/// response before the next is issued, so per-peer ordering is
/// preserved by TCP-connection serialization alone.
pub async fn send_message(
    node: &Node,
    peer_username: &str,
    filename: &str,
    mime_type: &str,
    content: &[u8],
) -> Result<Response, MeshError> {
    let peer_public_key = node
        .store
        .get_public_key(peer_username)
        .await?
        .ok_or_else(|| MeshError::semantic(format!("no public key on file for {peer_username}")))?;

    let message_id = Uuid::new_v4().to_string();
    let content_password = fresh_password();
    let md5_hex = format!("{:x}", md5::compute(content));

    let pw1 = fresh_password();
    let key_json = serde_json::to_vec(&KeyWirePayload {
        password: bytes2hexstr(&content_password),
        message_id: message_id.clone(),
        filename: filename.to_string(),
        length: content.len() as u64,
        md5: md5_hex,
    })
    .map_err(|e| MeshError::Decode(e.to_string()))?;
    let key_encrypted = symmetric_encrypt(&key_json, &pw1)?;
    let pw1_encrypted = rsa_encrypt(&pw1, &peer_public_key)?;

    let key_frame = Frame::new(
        Action::SendMessageKey,
        SendMessageKeyPayload {
            key: hex::encode(key_encrypted),
            password: hex::encode(pw1_encrypted),
        },
    )?;
    let response = send_frame_to_user(node.store.as_ref(), peer_username, &key_frame).await?;
    if !response.success {
        return Ok(response);
    }

    for chunk in content.chunks(CHUNK_SIZE) {
        let pw2 = fresh_password();
        let meta_json = serde_json::to_vec(&MetaWirePayload {
            message_id: message_id.clone(),
            filename: filename.to_string(),
            mime_type: mime_type.to_string(),
        })
        .map_err(|e| MeshError::Decode(e.to_string()))?;
        let meta_encrypted = symmetric_encrypt(&meta_json, &pw2)?;
        let pw2_encrypted = rsa_encrypt(&pw2, &peer_public_key)?;
        let content_encrypted = symmetric_encrypt(chunk, &content_password)?;

        let chunk_frame = Frame::new(
            Action::SendMessage,
            SendMessagePayload {
                password: hex::encode(pw2_encrypted),
                meta: hex::encode(meta_encrypted),
                content: hex::encode(content_encrypted),
            },
        )?;
        let response = send_frame_to_user(node.store.as_ref(), peer_username, &chunk_frame).await?;
        if !response.success {
            return Ok(response);
        }
    }

    let pw3 = fresh_password();
    let term_json = serde_json::to_vec(&MetaWirePayload {
        message_id: message_id.clone(),
        filename: filename.to_string(),
        mime_type: mime_type.to_string(),
    })
    .map_err(|e| MeshError::Decode(e.to_string()))?;
    let term_encrypted = symmetric_encrypt(&term_json, &pw3)?;
    let pw3_encrypted = rsa_encrypt(&pw3, &peer_public_key)?;

    let term_frame = Frame::new(
        Action::SendMessageTerm,
        SendMessageTermPayload {
            term: hex::encode(term_encrypted),
            password: hex::encode(pw3_encrypted),
        },
    )?;
    send_frame_to_user(node.store.as_ref(), peer_username, &term_frame).await
}

pub async fn handle_send_message_key(node: &Node, frame: &Frame) -> Result<Response, MeshError> {
    let payload: SendMessageKeyPayload = frame.payload_as()?;
    let pw1_encrypted = hexstr2bytes(&payload.password)?;
    let private_key = node.store.private_key_text().await?;
    let pw1 = rsa_decrypt(&pw1_encrypted, &private_key)?;

    let key_encrypted = hexstr2bytes(&payload.key)?;
    let key_json = symmetric_decrypt_text(&key_encrypted, &pw1)?;
    let wire: KeyWirePayload = serde_json::from_str(key_json.trim_end())
        .map_err(|e| MeshError::Decode(format!("bad key payload: {e}")))?;

    node.store
        .store_message_key(MessageKey {
            password: wire.password,
            message_id: wire.message_id.clone(),
            filename: wire.filename,
            mime_type: String::new(),
            length: wire.length,
            md5: wire.md5,
        })
        .await?;

    info!("staged key for message {}", wire.message_id);
    Ok(Response::ok_with(format!("staged key for message {}", wire.message_id)))
}

pub async fn handle_send_message(node: &Node, frame: &Frame) -> Result<Response, MeshError> {
    let payload: SendMessagePayload = frame.payload_as()?;
    let pw2_encrypted = hexstr2bytes(&payload.password)?;
    let private_key = node.store.private_key_text().await?;
    let pw2 = rsa_decrypt(&pw2_encrypted, &private_key)?;

    let meta_encrypted = hexstr2bytes(&payload.meta)?;
    let meta_json = symmetric_decrypt_text(&meta_encrypted, &pw2)?;
    let meta: MetaWirePayload = serde_json::from_str(meta_json.trim_end())
        .map_err(|e| MeshError::Decode(format!("bad meta: {e}")))?;

    let key = node
        .store
        .load_message_key(&meta.message_id)
        .await?
        .ok_or_else(|| MeshError::semantic("chunk received before key"))?;

    let content_password = hexstr2bytes(&key.password)?;
    let content_encrypted = hexstr2bytes(&payload.content)?;
    let chunk = symmetric_decrypt(&content_encrypted, &content_password)?;

    if key.mime_type.is_empty() && !meta.mime_type.is_empty() {
        let mut updated = key.clone();
        updated.mime_type = meta.mime_type.clone();
        node.store.store_message_key(updated).await?;
    }

    // Every chunk is symmetric-encrypted on its own, so every one picks up
    // its own ASCII-space padding to a 16-byte boundary (pad_with_spaces):
    // a full 4096-byte chunk is itself a multiple of 16 and so gets a
    // whole extra padding block. Trim back to exactly the bytes this
    // message still needs so that padding never lands in the middle of
    // the assembled file — only the last chunk's own trailing padding,
    // past the key's declared length, is ever discarded here.
    let already_written = node
        .store
        .read_message(&meta.message_id, &meta.filename)
        .await?
        .len() as u64;
    let remaining = key.length.saturating_sub(already_written) as usize;
    let trimmed = &chunk[..chunk.len().min(remaining)];

    node.store
        .append_message_chunk(&meta.message_id, &meta.filename, trimmed)
        .await?;
    Ok(Response::ok_with(format!("appended chunk to message {}", meta.message_id)))
}

pub async fn handle_send_message_term(node: &Node, frame: &Frame) -> Result<Response, MeshError> {
    let payload: SendMessageTermPayload = frame.payload_as()?;
    let pw3_encrypted = hexstr2bytes(&payload.password)?;
    let private_key = node.store.private_key_text().await?;
    let pw3 = rsa_decrypt(&pw3_encrypted, &private_key)?;

    let term_encrypted = hexstr2bytes(&payload.term)?;
    let term_json = symmetric_decrypt_text(&term_encrypted, &pw3)?;
    let term: MetaWirePayload = serde_json::from_str(term_json.trim_end())
        .map_err(|e| MeshError::Decode(format!("bad term payload: {e}")))?;

    let key = node
        .store
        .load_message_key(&term.message_id)
        .await?
        .ok_or_else(|| MeshError::semantic("terminator received before key"))?;

    let assembled = node.store.read_message(&term.message_id, &term.filename).await?;
    if assembled.len() as u64 != key.length {
        return Ok(Response::err(format!(
            "message {} incomplete: expected {} bytes, got {}",
            term.message_id,
            key.length,
            assembled.len()
        )));
    }
    let digest = format!("{:x}", md5::compute(&assembled));
    if digest != key.md5 {
        return Ok(Response::err(format!("message {} failed md5 check", term.message_id)));
    }

    info!(
        "message {} complete, filename={} binary={}",
        term.message_id,
        term.filename,
        is_binary(&term.mime_type)
    );
    Ok(Response::ok_with(format!("message {} complete", term.message_id)).with_field("filename", term.filename))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MemoryIdentityStore;
    use std::sync::Arc;

    #[test]
    fn is_binary_matches_only_the_two_known_image_types() {
        assert!(is_binary("image/png"));
        assert!(is_binary("image/jpg"));
        assert!(!is_binary("text/plain"));
        assert!(!is_binary("image/jpeg"));
    }

    #[tokio::test]
    async fn chunk_before_key_is_rejected() {
        let store = MemoryIdentityStore::new("bob").unwrap();
        let node = Node::new(Arc::new(store));

        let content_password = fresh_password();
        let pw2 = fresh_password();
        let peer_public_key = node.store.public_key_text().await.unwrap();

        let meta_json = serde_json::to_vec(&MetaWirePayload {
            message_id: "nonexistent".to_string(),
            filename: "a.txt".to_string(),
            mime_type: "text/plain".to_string(),
        })
        .unwrap();
        let meta_encrypted = symmetric_encrypt(&meta_json, &pw2).unwrap();
        let pw2_encrypted = rsa_encrypt(&pw2, &peer_public_key).unwrap();
        let content_encrypted = symmetric_encrypt(b"hello", &content_password).unwrap();

        let frame = Frame::new(
            Action::SendMessage,
            SendMessagePayload {
                password: hex::encode(pw2_encrypted),
                meta: hex::encode(meta_encrypted),
                content: hex::encode(content_encrypted),
            },
        )
        .unwrap();

        let err = handle_send_message(&node, &frame).await.unwrap_err();
        assert!(matches!(err, MeshError::Semantic(_)));
    }

    #[tokio::test]
    async fn key_then_chunk_round_trips_through_the_store() {
        let sender_keys = crate::crypto::generate_rsa_keypair().unwrap();
        let receiver = MemoryIdentityStore::new("bob").unwrap();
        let receiver_public_key = receiver.public_key_text().await.unwrap();
        let node = Node::new(Arc::new(receiver));

        let content_password = fresh_password();
        let pw1 = fresh_password();
        let key_json = serde_json::to_vec(&KeyWirePayload {
            password: bytes2hexstr(&content_password),
            message_id: "msg-1".to_string(),
            filename: "note.txt".to_string(),
            length: 5,
            md5: format!("{:x}", md5::compute(b"hello")),
        })
        .unwrap();
        let key_encrypted = symmetric_encrypt(&key_json, &pw1).unwrap();
        let pw1_encrypted = rsa_encrypt(&pw1, &receiver_public_key).unwrap();

        let key_frame = Frame::new(
            Action::SendMessageKey,
            SendMessageKeyPayload {
                key: hex::encode(key_encrypted),
                password: hex::encode(pw1_encrypted),
            },
        )
        .unwrap();
        let response = handle_send_message_key(&node, &key_frame).await.unwrap();
        assert!(response.success);
        let _ = sender_keys;

        let pw2 = fresh_password();
        let meta_json = serde_json::to_vec(&MetaWirePayload {
            message_id: "msg-1".to_string(),
            filename: "note.txt".to_string(),
            mime_type: "text/plain".to_string(),
        })
        .unwrap();
        let meta_encrypted = symmetric_encrypt(&meta_json, &pw2).unwrap();
        let pw2_encrypted = rsa_encrypt(&pw2, &receiver_public_key).unwrap();
        let content_encrypted = symmetric_encrypt(b"hello", &content_password).unwrap();

        let chunk_frame = Frame::new(
            Action::SendMessage,
            SendMessagePayload {
                password: hex::encode(pw2_encrypted),
                meta: hex::encode(meta_encrypted),
                content: hex::encode(content_encrypted),
            },
        )
        .unwrap();
        let response = handle_send_message(&node, &chunk_frame).await.unwrap();
        assert!(response.success);

        // The chunk's own ASCII-space padding (symmetric_encrypt pads
        // "hello" to 16 bytes) must not survive into the stored message.
        let assembled = node.store.read_message("msg-1", "note.txt").await.unwrap();
        assert_eq!(assembled, b"hello");
    }
}
