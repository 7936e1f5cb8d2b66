//! The five error kinds of the overlay (see spec §7).
//!
//! `Transport`/`Decode`/`Crypto`/`Semantic` are all non-fatal: a handler
//! catches them and replies `{success:false, error}` without unwinding.
//! `Fatal` is the only variant allowed to propagate out of the accept
//! loop and abort the process (listener bind exhausted, identity store
//! unreadable).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("{0}")]
    Semantic(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl MeshError {
    /// True for the error kinds that must never be reported to the peer
    /// as a `{success:false}` response body carrying internal detail
    /// that wasn't meant to propagate past the process boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MeshError::Fatal(_))
    }

    pub fn semantic(msg: impl Into<String>) -> Self {
        MeshError::Semantic(msg.into())
    }
}
