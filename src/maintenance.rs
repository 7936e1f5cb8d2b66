//! Maintenance loop (spec §4.8): the sole retry driver in the system.
//! Every 60-120 seconds it seeks unreachable-but-known peers, pings
//! reachable ones, and challenges the ones it trusts a public key for,
//! evicting and re-seeking on a failed challenge.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;

use crate::challenge::challenge_user_pk;
use crate::discovery::seek_user;
use crate::error::MeshError;
use crate::frame::{Action, Frame};
use crate::transport::{send_frame_to_user, Node};

fn next_interval() -> Duration {
    Duration::from_secs(rand::thread_rng().gen_range(60..=120))
}

/// Runs forever. Intended to be spawned alongside the Surface listener;
/// errors from a single sweep are logged and do not stop the loop —
/// only the Maintenance loop itself is a long-lived retry driver, so it
/// must outlive any one failed peer.
pub async fn run(node: Arc<Node>) {
    loop {
        tokio::time::sleep(next_interval()).await;
        if let Err(e) = sweep(&node).await {
            warn!("maintenance sweep failed: {e}");
        }
    }
}

pub async fn sweep(node: &Node) -> Result<(), MeshError> {
    seek_unaddressed_known_keys(node).await?;
    ping_and_challenge_known_peers(node).await?;
    Ok(())
}

/// Spec §4.8 step 1: every username we trust a public key for but
/// don't have an address for gets a fresh seek.
async fn seek_unaddressed_known_keys(node: &Node) -> Result<(), MeshError> {
    let known_keys = node.store.list_public_keys().await?;
    for (username, _) in known_keys {
        if node.store.get_contact(&username).await?.is_none() {
            debug!("maintenance: seeking {username} (known key, no address)");
            if let Err(e) = seek_user(node, &username).await {
                warn!("maintenance: seek of {username} failed: {e}");
            }
        }
    }
    Ok(())
}

/// Spec §4.8 step 2: ping everyone in the address book; reseek on
/// failure, challenge on success if we hold their public key, and evict
/// + reseek on a failed challenge.
async fn ping_and_challenge_known_peers(node: &Node) -> Result<(), MeshError> {
    let contacts = node.store.list_contacts().await?;
    for (username, _) in contacts {
        let ping_frame = Frame::new(Action::Ping, serde_json::json!({}))?;
        let ping_ok = send_frame_to_user(node.store.as_ref(), &username, &ping_frame)
            .await
            .map(|r| r.success)
            .unwrap_or(false);

        if !ping_ok {
            debug!("maintenance: {username} did not answer ping, re-seeking");
            if let Err(e) = seek_user(node, &username).await {
                warn!("maintenance: re-seek of unreachable {username} failed: {e}");
            }
            continue;
        }

        if node.store.get_public_key(&username).await?.is_none() {
            continue;
        }

        match challenge_user_pk(node, &username).await {
            Ok(true) => {
                info!("maintenance: {username} passed challenge_user_pk");
            }
            Ok(false) | Err(_) => {
                warn!("maintenance: {username} failed challenge_user_pk, evicting and re-seeking");
                node.store.remove_contact(&username).await?;
                if let Err(e) = seek_user(node, &username).await {
                    warn!("maintenance: re-seek of evicted {username} failed: {e}");
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MemoryIdentityStore;

    #[tokio::test]
    async fn sweep_with_no_peers_or_keys_is_a_no_op() {
        let store = MemoryIdentityStore::new("alice").unwrap();
        let node = Node::new(std::sync::Arc::new(store));
        sweep(&node).await.unwrap();
    }

    #[tokio::test]
    async fn known_key_without_address_triggers_a_best_effort_seek() {
        let store = MemoryIdentityStore::new("alice").unwrap();
        store.set_current_ip_port("127.0.0.1", 9001).await.unwrap();
        let bob_keys = crate::crypto::generate_rsa_keypair().unwrap();
        store.set_public_key("bob", &bob_keys.public_key_text).await.unwrap();
        let node = Node::new(std::sync::Arc::new(store));

        // No peers in the address book, so the seek sends nowhere, but
        // it still must not error the whole sweep out.
        sweep(&node).await.unwrap();
    }
}
