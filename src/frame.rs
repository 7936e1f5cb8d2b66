//! Frame codec (spec §4.1) and the length-prefixed reader/writer that
//! carries it over TCP.
//!
//! The wire format is a single JSON object per connection (spec §6).
//! The legacy implementation read a single `recv(32768)` and hoped the
//! whole frame fit; spec §9 flags this and recommends a length-prefixed
//! reader instead, which is what `read_frame`/`write_frame` below do.
//! The shape (read a fixed header, then read exactly that many more
//! bytes) is the same one the teacher's own `inout.rs::DerpReader` uses
//! for its binary frames — tokio's `AsyncReadExt::read_exact` does the
//! buffering DerpReader does by hand, since DerpReader predates it
//! being the obvious tool for a length-prefixed body.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::MeshError;

/// Generous ceiling for a single frame: chunk frames carry a
/// hex-encoded, Blowfish-padded 4096-byte plaintext chunk plus RSA
/// envelope overhead, so a few hundred KB is typical; this just guards
/// against a peer claiming an unbounded length.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Ping,
    RequestPublicKey,
    PublicKeyResponse,
    ChallengeUserPk,
    ChallengeUserHasPk,
    SeekUser,
    SeekUserResponse,
    SurfaceUser,
    PulseNetwork,
    CheckNetTopo,
    NetTopoDamaged,
    SendMessageKey,
    SendMessage,
    SendMessageTerm,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let json = serde_json::to_value(self).unwrap_or(Value::Null);
        write!(f, "{}", json.as_str().unwrap_or("unknown"))
    }
}

/// `{frame_id, action, payload}` — the request envelope of spec §4.1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub frame_id: Uuid,
    pub action: Action,
    pub payload: Value,
}

impl Frame {
    pub fn new(action: Action, payload: impl Serialize) -> Result<Self, MeshError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| MeshError::Decode(format!("failed to serialize payload: {e}")))?;
        Ok(Self {
            frame_id: Uuid::new_v4(),
            action,
            payload,
        })
    }

    /// Deserialize `payload` into the action-specific struct. A decode
    /// failure here is a spec §7 kind-2 error: caught by the handler,
    /// never propagated.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, MeshError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| MeshError::Decode(format!("bad payload for {}: {e}", self.action)))
    }

    /// A decoder that cannot parse JSON, or parses an object missing
    /// `action`/`frame_id`, returns a `Decode` error rather than
    /// mutating any state (spec §4.1).
    pub fn decode(bytes: &[u8]) -> Result<Self, MeshError> {
        serde_json::from_slice(bytes)
            .map_err(|e| MeshError::Decode(format!("invalid frame: {e}")))
    }

    pub fn encode(&self) -> Result<Vec<u8>, MeshError> {
        serde_json::to_vec(self).map_err(|e| MeshError::Decode(format!("encode failed: {e}")))
    }
}

/// The response envelope: `success`, `response_to_frame`, and either
/// `error` or action-specific success fields folded in via `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Response {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_to_frame: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn ok_with(message: impl Into<String>) -> Self {
        let mut response = Self::ok();
        response.extra.insert("message".into(), Value::String(message.into()));
        response
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn from_mesh_error(error: &MeshError) -> Self {
        Self::err(error.to_string())
    }

    pub fn with_field(mut self, key: &str, value: impl Serialize) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.extra.insert(key.to_string(), value);
        }
        self
    }

    pub fn for_request(mut self, frame_id: Uuid) -> Self {
        self.response_to_frame = Some(frame_id);
        self
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MeshError> {
        serde_json::from_slice(bytes)
            .map_err(|e| MeshError::Decode(format!("invalid response: {e}")))
    }

    pub fn encode(&self) -> Result<Vec<u8>, MeshError> {
        serde_json::to_vec(self).map_err(|e| MeshError::Decode(format!("encode failed: {e}")))
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
) -> Result<(), MeshError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(MeshError::Transport("frame exceeds MAX_FRAME_SIZE".into()));
    }
    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| MeshError::Transport(e.to_string()))?;
    writer
        .write_all(bytes)
        .await
        .map_err(|e| MeshError::Transport(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| MeshError::Transport(e.to_string()))
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, MeshError> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| MeshError::Transport(e.to_string()))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(MeshError::Transport("peer claimed an oversized frame".into()));
    }
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| MeshError::Transport(e.to_string()))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_through_json() {
        let frame = Frame::new(Action::Ping, serde_json::json!({})).unwrap();
        let bytes = frame.encode().unwrap();
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded.frame_id, frame.frame_id);
        assert_eq!(decoded.action, Action::Ping);
    }

    #[test]
    fn decode_rejects_malformed_json_without_panicking() {
        let err = Frame::decode(b"not json").unwrap_err();
        assert!(matches!(err, MeshError::Decode(_)));
    }

    #[test]
    fn decode_rejects_missing_required_fields() {
        let err = Frame::decode(br#"{"payload": {}}"#).unwrap_err();
        assert!(matches!(err, MeshError::Decode(_)));
    }

    #[test]
    fn response_echoes_frame_id_and_carries_extra_fields() {
        let frame_id = Uuid::new_v4();
        let response = Response::ok_with("propagated to 3 other clients").for_request(frame_id);
        assert!(response.success);
        assert_eq!(response.response_to_frame, Some(frame_id));
        assert_eq!(response.field_str("message"), Some("propagated to 3 other clients"));

        let bytes = response.encode().unwrap();
        let decoded = Response::decode(&bytes).unwrap();
        assert_eq!(decoded.response_to_frame, Some(frame_id));
    }

    #[tokio::test]
    async fn length_prefixed_round_trip() {
        let frame = Frame::new(Action::PulseNetwork, serde_json::json!({"custody_chain": []})).unwrap();
        let bytes = frame.encode().unwrap();

        let mut buf = Vec::new();
        write_frame(&mut buf, &bytes).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor).await.unwrap();
        assert_eq!(read_back, bytes);
    }

    #[tokio::test]
    async fn read_frame_rejects_oversized_length_prefix() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, MeshError::Transport(_)));
    }
}
