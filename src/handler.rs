//! Incoming handler (spec §4/§6): decodes a frame, dispatches on
//! `action` with an exhaustive match, and produces a `Response`. This
//! is the single place a non-fatal `MeshError` is converted into
//! `{success:false, error}` rather than unwinding (spec §7) — every
//! domain module below it returns `Result<Response, MeshError>` and
//! lets this function catch it.

use log::{error, warn};
use serde::{Deserialize, Serialize};

use crate::error::MeshError;
use crate::frame::{Action, Frame, Response};
use crate::transport::Node;
use crate::{challenge, discovery, messaging, pubkey};

#[derive(Serialize, Deserialize)]
struct SurfaceUserPayload {
    username: String,
    ip: String,
    port: u16,
}

async fn handle_ping(_node: &Node, _frame: &Frame) -> Result<Response, MeshError> {
    Ok(Response::ok_with("pong"))
}

/// Announces a sender's own listening address so the receiver's
/// address book tracks them without a full seek round-trip — useful
/// right after two peers agree to pair up.
async fn handle_surface_user(node: &Node, frame: &Frame) -> Result<Response, MeshError> {
    let payload: SurfaceUserPayload = frame.payload_as()?;
    node.store.set_contact(&payload.username, &payload.ip, payload.port).await?;
    Ok(Response::ok_with(format!("recorded address for {}", payload.username)))
}

/// Decodes one wire frame and runs it to completion, producing the
/// `Response` that goes back over the same connection. A malformed
/// frame never reaches this function — `Frame::decode` failures are
/// handled by the caller in `surface.rs` before a `Frame` exists.
pub async fn dispatch(node: &Node, frame: Frame) -> Response {
    let frame_id = frame.frame_id;
    let action = frame.action;

    let result = match action {
        Action::Ping => handle_ping(node, &frame).await,
        Action::SurfaceUser => handle_surface_user(node, &frame).await,
        Action::RequestPublicKey => pubkey::handle_request_public_key(node, &frame).await,
        Action::PublicKeyResponse => pubkey::handle_public_key_response(node, &frame).await,
        Action::ChallengeUserPk => challenge::handle_challenge_user_pk(node, &frame).await,
        Action::ChallengeUserHasPk => challenge::handle_challenge_user_has_pk(node, &frame).await,
        Action::SeekUser => discovery::handle_seek_user(node, &frame).await,
        Action::SeekUserResponse => discovery::handle_seek_user_response(node, &frame).await,
        Action::PulseNetwork => discovery::handle_pulse_network(node, &frame).await,
        Action::CheckNetTopo => discovery::handle_check_net_topo(node, &frame).await,
        Action::NetTopoDamaged => discovery::handle_net_topo_damaged(node, &frame).await,
        Action::SendMessageKey => messaging::handle_send_message_key(node, &frame).await,
        Action::SendMessage => messaging::handle_send_message(node, &frame).await,
        Action::SendMessageTerm => messaging::handle_send_message_term(node, &frame).await,
    };

    match result {
        Ok(response) => response.for_request(frame_id),
        Err(e) if e.is_fatal() => {
            // Spec §7 kind 5 is scoped to listener bind/identity store
            // failures at startup; a handler hitting one mid-request
            // still answers the caller rather than aborting the whole
            // process over a single bad frame.
            error!("fatal-class error inside handler for {action}: {e}");
            Response::from_mesh_error(&e).for_request(frame_id)
        }
        Err(e) => {
            warn!("{action} failed: {e}");
            Response::from_mesh_error(&e).for_request(frame_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MemoryIdentityStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let store = MemoryIdentityStore::new("alice").unwrap();
        let node = Node::new(Arc::new(store));
        let frame = Frame::new(Action::Ping, serde_json::json!({})).unwrap();
        let frame_id = frame.frame_id;

        let response = dispatch(&node, frame).await;
        assert!(response.success);
        assert_eq!(response.response_to_frame, Some(frame_id));
        assert_eq!(response.field_str("message"), Some("pong"));
    }

    #[tokio::test]
    async fn decode_errors_never_panic_the_dispatcher() {
        let store = MemoryIdentityStore::new("alice").unwrap();
        let node = Node::new(Arc::new(store));
        // A chunk referencing an unknown message_id decodes fine but
        // fails semantically; dispatch must still answer cleanly.
        let frame = Frame::new(
            Action::SendMessageTerm,
            serde_json::json!({"term": "00", "password": "00"}),
        )
        .unwrap();
        let response = dispatch(&node, frame).await;
        assert!(!response.success);
    }
}
