//! Transport: one TCP connection per frame (spec §5), replacing the
//! teacher's persistent multiplexed DERP connections. `send_frame` opens
//! a connection, writes exactly one length-prefixed `Frame`, reads
//! exactly one length-prefixed `Response`, and closes — mirroring the
//! original's `send_frame`/`send_frame_users` helper in
//! `original_source/pckr_client/utilities/utilities.py`, which does a
//! fresh `socket.connect` per call.

use std::sync::Arc;

use log::{debug, warn};
use tokio::net::{TcpListener, TcpStream};

use crate::error::MeshError;
use crate::frame::{read_frame, write_frame, Frame, Response};
use crate::identity::IdentityStore;

/// Sends `frame` to `username`, resolving its address via the sender's
/// address book. A connection refusal is reported as an ordinary
/// `{success:false}` response (spec §5's "peer unreachable" case) rather
/// than surfaced as a `MeshError` — only an unknown address (no ipcache
/// entry at all) is a hard error, since there is nowhere to dial.
pub async fn send_frame_to_user(
    store: &dyn IdentityStore,
    username: &str,
    frame: &Frame,
) -> Result<Response, MeshError> {
    let contact = store
        .get_contact(username)
        .await?
        .ok_or_else(|| MeshError::semantic(format!("no known address for {username}")))?;

    send_frame_to_addr(&contact.ip, contact.port, frame).await
}

pub async fn send_frame_to_addr(ip: &str, port: u16, frame: &Frame) -> Result<Response, MeshError> {
    let addr = format!("{ip}:{port}");
    let mut stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("connect to {addr} failed: {e}");
            return Ok(Response::err(format!("connection refused: {e}")));
        }
    };

    let bytes = frame.encode()?;
    write_frame(&mut stream, &bytes).await?;

    let response_bytes = read_frame(&mut stream).await?;
    Response::decode(&response_bytes)
}

/// Binds the overlay's listening socket. Spec §5 has a node try its
/// configured port and, if taken, probe upward — the teacher's `main.rs`
/// binds a single fixed port and gives up on failure; this generalizes
/// that to the spec's retry behavior.
pub async fn bind_with_retry(host: &str, start_port: u16, max_attempts: u16) -> Result<TcpListener, MeshError> {
    let mut last_err = None;
    for attempt in 0..max_attempts {
        let port = start_port + attempt;
        match TcpListener::bind((host, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                warn!("bind {host}:{port} failed: {e}, trying next port");
                last_err = Some(e);
            }
        }
    }
    Err(MeshError::Fatal(format!(
        "could not bind any port in [{start_port}, {}): {}",
        start_port + max_attempts,
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// Address actually bound, to be recorded via `set_current_ip_port`.
pub fn listener_port(listener: &TcpListener) -> Result<u16, MeshError> {
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|e| MeshError::Fatal(e.to_string()))
}

/// Shared handle passed to every spawned connection task.
pub struct Node {
    pub store: Arc<dyn IdentityStore>,
}

impl Node {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self { store }
    }
}
