//! Surface: the listener (spec §2 item 5, §5). One long-lived accept
//! loop; each accepted connection is handed to an independent task
//! that reads exactly one frame, runs it to completion, writes exactly
//! one response, and closes — mirroring the teacher's own accept-loop
//! shape (spawn-per-connection, task runs to completion) without its
//! persistent multiplexed-connection lifetime.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::net::TcpListener;

use crate::error::MeshError;
use crate::frame::{read_frame, write_frame, Frame, Response};
use crate::handler::dispatch;
use crate::identity::IdentityStore;
use crate::transport::{bind_with_retry, listener_port, Node};

/// Binds per spec §6 (increment-and-retry on a taken port), records the
/// bound address via `current_ip_port.json` (spec §11.4's bootstrap
/// behavior), and runs the accept loop forever. Only a `Fatal` error —
/// bind fully exhausted — returns from this function.
pub async fn run(store: Arc<dyn IdentityStore>, host: &str, start_port: u16, max_port_attempts: u16) -> Result<(), MeshError> {
    let listener = bind_with_retry(host, start_port, max_port_attempts).await?;
    let bound_port = listener_port(&listener)?;
    store.set_current_ip_port(host, bound_port).await?;
    info!("surfaced as {} at {host}:{bound_port}", store.username());

    let node = Arc::new(Node::new(store));
    serve(listener, node).await
}

/// Runs the accept loop against an already-bound listener. Split out
/// from `run` so tests (and anything embedding meshpost in a larger
/// process) can bind with `transport::bind_with_retry`, learn the
/// actual port, and only then start serving.
pub async fn serve(listener: TcpListener, node: Arc<Node>) -> Result<(), MeshError> {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };
        debug!("accepted connection from {peer_addr}");

        let node = Arc::clone(&node);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, node).await {
                warn!("connection from {peer_addr} failed: {e}");
            }
        });
    }
}

async fn handle_connection(mut stream: tokio::net::TcpStream, node: Arc<Node>) -> Result<(), MeshError> {
    let request_bytes = read_frame(&mut stream).await?;

    let response = match Frame::decode(&request_bytes) {
        Ok(frame) => dispatch(&node, frame).await,
        Err(e) => {
            // spec §4.1: an undecodable frame gets {success:false}
            // without any state mutation; there's no frame_id to echo.
            Response::from_mesh_error(&e)
        }
    };

    let response_bytes = response.encode()?;
    write_frame(&mut stream, &response_bytes).await
}
