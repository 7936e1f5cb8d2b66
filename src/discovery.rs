//! Seek/Discovery engine (spec §4.5) and the pulse/topology tracers of
//! §4.6 — the hardest part of the overlay. A seek finds a peer's
//! current address by flooding an encrypted envelope only the target
//! can open, with loop suppression and a hop limit carried in a
//! custody chain of hashed usernames.

use std::collections::HashMap;

use log::{info, warn};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::crypto::{hexstr2bytes, rsa_decrypt, rsa_encrypt, sha256_hex, symmetric_decrypt_text, symmetric_encrypt};
use crate::error::MeshError;
use crate::frame::{Action, Frame, Response};
use crate::transport::{send_frame_to_user, Node};

const MAX_CUSTODY_CHAIN_LEN: usize = 4;

#[derive(Serialize, Deserialize)]
struct SeekUserPayload {
    password: String,
    host_info: String,
    custody_chain: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct InitiatorHostInfo {
    ip: String,
    port: u16,
    public_key: String,
    from_username: String,
    seek_token: String,
}

#[derive(Serialize, Deserialize)]
struct SeekUserResponsePayload {
    password: String,
    host_info: String,
    seek_token: String,
}

#[derive(Serialize, Deserialize)]
struct ResponderHostInfo {
    ip: String,
    port: u16,
    username: String,
}

#[derive(Serialize, Deserialize)]
struct PulseNetworkPayload {
    custody_chain: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct CheckNetTopoPayload {
    custody_chain: Vec<String>,
    hashed_ipcaches: HashMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct NetTopoDamagedPayload {
    username: String,
}

/// Extends `original`'s `custody_chain` field with `chain`, keeping
/// every other field untouched. Used when forwarding a propagating
/// frame without re-decoding and re-encoding its whole payload.
fn with_chain(original: &Value, chain: Vec<String>) -> Result<Value, MeshError> {
    let mut object = original
        .as_object()
        .cloned()
        .ok_or_else(|| MeshError::Decode("propagating payload is not a JSON object".into()))?;
    object.insert(
        "custody_chain".to_string(),
        serde_json::to_value(chain).map_err(|e| MeshError::Decode(e.to_string()))?,
    );
    Ok(Value::Object(object))
}

/// Shared forwarding rule for `seek_user`, `pulse_network` and
/// `check_net_topo` (spec §4.5 "Forwarding rule", reused verbatim by
/// §4.6). Splits "compute forwarding set" from "send": the address
/// book is only read, never locked across the sends (spec §9).
async fn propagate(node: &Node, action: Action, original_payload: &Value, custody_chain: &[String]) -> Result<Response, MeshError> {
    if custody_chain.len() >= MAX_CUSTODY_CHAIN_LEN {
        return Ok(Response::ok_with("custody_chain len exceeded"));
    }

    let mut chain = custody_chain.to_vec();
    chain.push(sha256_hex(node.store.username()));

    let contacts = node.store.list_contacts().await?;
    let targets: Vec<String> = contacts
        .into_iter()
        .map(|(username, _)| username)
        .filter(|username| !chain.contains(&sha256_hex(username)))
        .collect();

    let payload = with_chain(original_payload, chain)?;
    let frame = Frame {
        frame_id: Uuid::new_v4(),
        action,
        payload,
    };

    let mut sent = 0usize;
    for peer in &targets {
        if send_frame_to_user(node.store.as_ref(), peer, &frame).await.is_ok() {
            sent += 1;
        }
    }
    Ok(Response::ok_with(format!("propagated to {sent}")))
}

/// Broadcasts an "initial hop" of a propagating frame to every known
/// peer, with a fresh custody chain containing only our own hash.
async fn broadcast_initial(node: &Node, action: Action, payload: Value) -> Result<usize, MeshError> {
    let frame = Frame {
        frame_id: Uuid::new_v4(),
        action,
        payload,
    };
    let contacts = node.store.list_contacts().await?;
    let mut sent = 0usize;
    for (peer, _) in &contacts {
        if send_frame_to_user(node.store.as_ref(), peer, &frame).await.is_ok() {
            sent += 1;
        }
    }
    Ok(sent)
}

/// Initiates a seek for `target_username`, whose public key we must
/// already hold (we need it to address the envelope only they can
/// open) but whose address we don't.
pub async fn seek_user(node: &Node, target_username: &str) -> Result<Response, MeshError> {
    let target_public_key = node
        .store
        .get_public_key(target_username)
        .await?
        .ok_or_else(|| MeshError::semantic(format!("no public key on file for {target_username}")))?;

    let seek_token = Uuid::new_v4().to_string();
    node.store.add_seek_token(target_username, &seek_token).await?;

    let (ip, port) = node
        .store
        .current_ip_port()
        .await?
        .ok_or_else(|| MeshError::semantic("not surfaced: no bound listener address"))?;

    let host_info = InitiatorHostInfo {
        ip,
        port,
        public_key: node.store.public_key_text().await?,
        from_username: node.store.username().to_string(),
        seek_token,
    };

    let mut password = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut password);
    let password_encrypted = rsa_encrypt(&password, &target_public_key)?;
    let host_info_json = serde_json::to_vec(&host_info).map_err(|e| MeshError::Decode(e.to_string()))?;
    let host_info_encrypted = symmetric_encrypt(&host_info_json, &password)?;

    let payload = serde_json::to_value(SeekUserPayload {
        password: hex::encode(password_encrypted),
        host_info: hex::encode(host_info_encrypted),
        custody_chain: vec![sha256_hex(node.store.username())],
    })
    .map_err(|e| MeshError::Decode(e.to_string()))?;

    let sent = broadcast_initial(node, Action::SeekUser, payload).await?;
    info!("seek_user({target_username}) sent to {sent} peers");
    Ok(Response::ok_with(format!("seek sent to {sent} peers")))
}

/// Restores a previously known address, or removes the entry entirely
/// if there wasn't one — the rollback step of spec §4.5 step 2-4.
async fn restore_contact(
    node: &Node,
    username: &str,
    previous: Option<(String, u16)>,
) -> Result<(), MeshError> {
    match previous {
        Some((ip, port)) => node.store.set_contact(username, &ip, port).await,
        None => node.store.remove_contact(username).await,
    }
}

pub async fn handle_seek_user(node: &Node, frame: &Frame) -> Result<Response, MeshError> {
    let payload: SeekUserPayload = frame.payload_as()?;
    let password_encrypted = hexstr2bytes(&payload.password)?;
    let private_key = node.store.private_key_text().await?;

    let password = match rsa_decrypt(&password_encrypted, &private_key) {
        Ok(password) => password,
        Err(_) => {
            // Not addressed to us (spec §4.2): forward, not a fault.
            return propagate(node, Action::SeekUser, &frame.payload, &payload.custody_chain).await;
        }
    };

    let host_info_encrypted = hexstr2bytes(&payload.host_info)?;
    let host_info_json = symmetric_decrypt_text(&host_info_encrypted, &password)?;
    let host_info: InitiatorHostInfo = serde_json::from_str(host_info_json.trim_end())
        .map_err(|e| MeshError::Decode(format!("bad host_info: {e}")))?;

    let previous = node
        .store
        .get_contact(&host_info.from_username)
        .await?
        .map(|entry| (entry.ip, entry.port));
    node.store
        .set_contact(&host_info.from_username, &host_info.ip, host_info.port)
        .await?;

    let ping_frame = Frame::new(Action::Ping, serde_json::json!({}))?;
    let ping_response = send_frame_to_user(node.store.as_ref(), &host_info.from_username, &ping_frame).await?;
    if !ping_response.success {
        restore_contact(node, &host_info.from_username, previous).await?;
        return Ok(Response::err("that was us, but the asking user is unreachable"));
    }

    match crate::challenge::challenge_user_has_pk(node, &host_info.from_username).await {
        Ok(true) => {}
        _ => {
            restore_contact(node, &host_info.from_username, previous).await?;
            return Ok(Response::err("challenge failed"));
        }
    }

    let mut response_password = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut response_password);
    let response_password_encrypted = rsa_encrypt(&response_password, &host_info.public_key)?;

    let (our_ip, our_port) = node
        .store
        .current_ip_port()
        .await?
        .ok_or_else(|| MeshError::semantic("not surfaced: no bound listener address"))?;
    let response_host_info = ResponderHostInfo {
        ip: our_ip,
        port: our_port,
        username: node.store.username().to_string(),
    };
    let response_host_info_json =
        serde_json::to_vec(&response_host_info).map_err(|e| MeshError::Decode(e.to_string()))?;
    let response_host_info_encrypted = symmetric_encrypt(&response_host_info_json, &response_password)?;
    let seek_token_encrypted = symmetric_encrypt(host_info.seek_token.as_bytes(), &response_password)?;

    // Re-confirm the initiator's address book entry before replying
    // directly to them (spec §4.5 step 5).
    node.store
        .set_contact(&host_info.from_username, &host_info.ip, host_info.port)
        .await?;

    let response_frame = Frame::new(
        Action::SeekUserResponse,
        SeekUserResponsePayload {
            password: hex::encode(response_password_encrypted),
            host_info: hex::encode(response_host_info_encrypted),
            seek_token: hex::encode(seek_token_encrypted),
        },
    )?;
    send_frame_to_user(node.store.as_ref(), &host_info.from_username, &response_frame).await?;

    Ok(Response::ok_with("that was me, response sent directly"))
}

pub async fn handle_seek_user_response(node: &Node, frame: &Frame) -> Result<Response, MeshError> {
    let payload: SeekUserResponsePayload = frame.payload_as()?;
    let password_encrypted = hexstr2bytes(&payload.password)?;
    let private_key = node.store.private_key_text().await?;
    let password = rsa_decrypt(&password_encrypted, &private_key)?;

    let seek_token_encrypted = hexstr2bytes(&payload.seek_token)?;
    let seek_token = symmetric_decrypt_text(&seek_token_encrypted, &password)?;
    let seek_token = seek_token.trim();

    let host_info_encrypted = hexstr2bytes(&payload.host_info)?;
    let host_info_json = symmetric_decrypt_text(&host_info_encrypted, &password)?;
    let host_info: ResponderHostInfo = serde_json::from_str(host_info_json.trim_end())
        .map_err(|e| MeshError::Decode(format!("bad host_info: {e}")))?;

    if !node
        .store
        .contains_seek_token(&host_info.username, seek_token)
        .await?
    {
        return Ok(Response::err("seek_token not found"));
    }

    node.store
        .set_contact(&host_info.username, &host_info.ip, host_info.port)
        .await?;
    Ok(Response::ok_with(format!("updated address for {}", host_info.username)))
}

pub async fn pulse_network(node: &Node) -> Result<Response, MeshError> {
    let payload = serde_json::to_value(PulseNetworkPayload {
        custody_chain: vec![sha256_hex(node.store.username())],
    })
    .map_err(|e| MeshError::Decode(e.to_string()))?;
    let sent = broadcast_initial(node, Action::PulseNetwork, payload).await?;
    Ok(Response::ok_with(format!("pulse sent to {sent} peers")))
}

pub async fn handle_pulse_network(node: &Node, frame: &Frame) -> Result<Response, MeshError> {
    let payload: PulseNetworkPayload = frame.payload_as()?;
    propagate(node, Action::PulseNetwork, &frame.payload, &payload.custody_chain).await
}

pub async fn check_net_topo(node: &Node) -> Result<Response, MeshError> {
    let contacts = node.store.list_contacts().await?;
    let hashed_ipcaches: HashMap<String, String> = contacts
        .iter()
        .map(|(username, entry)| {
            (
                sha256_hex(username),
                sha256_hex(format!("{}:{}", entry.ip, entry.port)),
            )
        })
        .collect();

    let payload = serde_json::to_value(CheckNetTopoPayload {
        custody_chain: vec![sha256_hex(node.store.username())],
        hashed_ipcaches,
    })
    .map_err(|e| MeshError::Decode(e.to_string()))?;

    let sent = broadcast_initial(node, Action::CheckNetTopo, payload).await?;
    Ok(Response::ok_with(format!("check_net_topo sent to {sent} peers")))
}

/// Evicts a stale address book entry and, if we still hold the
/// username's public key, re-seeks it. This is the "principled
/// interpretation" of `flush_inconsistent_user` spec §9 leaves
/// unspecified in the source.
async fn flush_inconsistent_user(node: &Node, username: &str) -> Result<(), MeshError> {
    node.store.remove_contact(username).await?;
    if node.store.get_public_key(username).await?.is_some() {
        if let Err(e) = seek_user(node, username).await {
            warn!("re-seek of {username} after topo damage failed: {e}");
        }
    }
    Ok(())
}

pub async fn handle_check_net_topo(node: &Node, frame: &Frame) -> Result<Response, MeshError> {
    let payload: CheckNetTopoPayload = frame.payload_as()?;
    let contacts = node.store.list_contacts().await?;

    let mut damaged = Vec::new();
    for (username, entry) in &contacts {
        let username_hash = sha256_hex(username);
        if let Some(their_ipcache_hash) = payload.hashed_ipcaches.get(&username_hash) {
            let our_ipcache_hash = sha256_hex(format!("{}:{}", entry.ip, entry.port));
            if their_ipcache_hash != &our_ipcache_hash {
                damaged.push(username.clone());
            }
        }
    }

    for username in &damaged {
        flush_inconsistent_user(node, username).await?;
        let notify_payload = serde_json::to_value(NetTopoDamagedPayload {
            username: username.clone(),
        })
        .map_err(|e| MeshError::Decode(e.to_string()))?;
        let _ = broadcast_initial(node, Action::NetTopoDamaged, notify_payload).await;
    }

    if damaged.is_empty() {
        return propagate(node, Action::CheckNetTopo, &frame.payload, &payload.custody_chain).await;
    }
    Ok(Response::ok_with(format!("flagged {} inconsistent entries", damaged.len())))
}

pub async fn handle_net_topo_damaged(node: &Node, frame: &Frame) -> Result<Response, MeshError> {
    let payload: NetTopoDamagedPayload = frame.payload_as()?;
    if node.store.get_contact(&payload.username).await?.is_some() {
        flush_inconsistent_user(node, &payload.username).await?;
    }
    Ok(Response::ok())
}
