//! The Identity & Address Book component (spec §3/§6), expressed as an
//! injected capability rather than ambient filesystem access — see
//! spec §9's "ambient per-user directory access" redesign flag.
//!
//! Two implementations ship: `FsIdentityStore`, which lays files out
//! exactly as `original_source/pckr_client/user/user.py` does, and
//! `MemoryIdentityStore`, used by tests and for running several
//! simulated users in one process.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use crate::error::MeshError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddressBookEntry {
    pub ip: String,
    pub port: u16,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyRecord {
    pub public_key_text: String,
    pub modified_at: DateTime<Utc>,
}

/// A `request_public_key` filed for later approval, carrying the
/// initiator's "volunteered" key (never auto-trusted, spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyRequest {
    pub from_username: String,
    pub volunteered_public_key: String,
}

/// A `public_key_response` filed for later processing (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyResponsePayload {
    pub from_username: String,
    pub password: String,    // hex rsa_encrypt(password, our public key)
    pub public_key: String,  // hex symmetric_encrypt(responder PEM, password)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageKey {
    pub password: String,
    pub message_id: String,
    pub filename: String,
    pub mime_type: String,
    pub length: u64,
    pub md5: String,
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    fn username(&self) -> &str;

    async fn public_key_text(&self) -> Result<String, MeshError>;
    async fn private_key_text(&self) -> Result<String, MeshError>;

    async fn current_ip_port(&self) -> Result<Option<(String, u16)>, MeshError>;
    async fn set_current_ip_port(&self, ip: &str, port: u16) -> Result<(), MeshError>;

    async fn get_contact(&self, username: &str) -> Result<Option<AddressBookEntry>, MeshError>;
    async fn set_contact(&self, username: &str, ip: &str, port: u16) -> Result<(), MeshError>;
    async fn remove_contact(&self, username: &str) -> Result<(), MeshError>;
    async fn list_contacts(&self) -> Result<Vec<(String, AddressBookEntry)>, MeshError>;

    async fn get_public_key(&self, username: &str) -> Result<Option<String>, MeshError>;
    async fn set_public_key(&self, username: &str, public_key_text: &str) -> Result<(), MeshError>;
    async fn list_public_keys(&self) -> Result<Vec<(String, PublicKeyRecord)>, MeshError>;

    async fn store_public_key_request(
        &self,
        from_username: &str,
        volunteered_public_key: &str,
    ) -> Result<(), MeshError>;
    async fn list_public_key_requests(&self) -> Result<Vec<PublicKeyRequest>, MeshError>;
    async fn remove_public_key_request(&self, from_username: &str) -> Result<(), MeshError>;

    async fn store_public_key_response(
        &self,
        response: PublicKeyResponsePayload,
    ) -> Result<(), MeshError>;
    async fn list_public_key_responses(&self) -> Result<Vec<PublicKeyResponsePayload>, MeshError>;
    async fn remove_public_key_response(&self, from_username: &str) -> Result<(), MeshError>;

    async fn add_seek_token(&self, target_username: &str, token: &str) -> Result<(), MeshError>;
    async fn contains_seek_token(&self, target_username: &str, token: &str)
        -> Result<bool, MeshError>;

    async fn store_message_key(&self, key: MessageKey) -> Result<(), MeshError>;
    async fn load_message_key(&self, message_id: &str) -> Result<Option<MessageKey>, MeshError>;
    async fn append_message_chunk(
        &self,
        message_id: &str,
        filename: &str,
        chunk: &[u8],
    ) -> Result<(), MeshError>;
    /// Bytes assembled so far for `message_id`/`filename`. Empty if no
    /// chunk has landed yet. Used both to trim interior chunk padding
    /// (messaging.rs) and to read a finished message back for `md5`
    /// verification.
    async fn read_message(&self, message_id: &str, filename: &str) -> Result<Vec<u8>, MeshError>;
    async fn list_message_ids(&self) -> Result<Vec<String>, MeshError>;
}

// ---------------------------------------------------------------------
// Filesystem-backed store
// ---------------------------------------------------------------------

/// Lays itself out exactly as `pckr_client/user/user.py` did:
/// `<home>/<username>/{public,private}.key`, `ipcache/<user>.json`,
/// `public_keys/<user>/public.key`, `public_key_requests/<user>/request.json`,
/// `public_key_responses/<user>/response.json`, `seek_tokens/<user>.json`,
/// `message_keys/<id>/key.json`, `messages/<id>/<filename>`.
pub struct FsIdentityStore {
    username: String,
    root: PathBuf,
}

impl FsIdentityStore {
    pub fn path_for(home: &Path, username: &str) -> PathBuf {
        home.join(username)
    }

    pub fn exists(home: &Path, username: &str) -> bool {
        Self::path_for(home, username).exists()
    }

    pub async fn init(home: &Path, username: &str) -> Result<Self, MeshError> {
        let root = Self::path_for(home, username);
        if root.exists() {
            return Err(MeshError::Semantic(format!(
                "user {username} already exists"
            )));
        }

        for dir in [
            "",
            "ipcache",
            "public_keys",
            "public_key_requests",
            "public_key_responses",
            "seek_tokens",
            "message_keys",
            "messages",
        ] {
            fs::create_dir_all(root.join(dir))
                .await
                .map_err(|e| MeshError::Fatal(format!("could not create {dir}: {e}")))?;
        }

        let keypair = crate::crypto::generate_rsa_keypair()?;
        fs::write(root.join("public.key"), &keypair.public_key_text)
            .await
            .map_err(|e| MeshError::Fatal(e.to_string()))?;
        fs::write(root.join("private.key"), &keypair.private_key_text)
            .await
            .map_err(|e| MeshError::Fatal(e.to_string()))?;

        Ok(Self {
            username: username.to_string(),
            root,
        })
    }

    pub async fn open(home: &Path, username: &str) -> Result<Self, MeshError> {
        let root = Self::path_for(home, username);
        if !root.exists() {
            return Err(MeshError::Semantic(format!("user {username} does not exist")));
        }
        Ok(Self {
            username: username.to_string(),
            root,
        })
    }

    fn ipcache_path(&self, username: &str) -> PathBuf {
        self.root.join("ipcache").join(format!("{username}.json"))
    }

    fn public_key_dir(&self, username: &str) -> PathBuf {
        self.root.join("public_keys").join(username)
    }

    fn public_key_request_dir(&self, username: &str) -> PathBuf {
        self.root.join("public_key_requests").join(username)
    }

    fn public_key_response_dir(&self, username: &str) -> PathBuf {
        self.root.join("public_key_responses").join(username)
    }

    fn seek_tokens_path(&self, username: &str) -> PathBuf {
        self.root.join("seek_tokens").join(format!("{username}.json"))
    }

    fn message_key_dir(&self, message_id: &str) -> PathBuf {
        self.root.join("message_keys").join(message_id)
    }

    fn message_dir(&self, message_id: &str) -> PathBuf {
        self.root.join("messages").join(message_id)
    }

    fn message_basename(filename: &str) -> Result<&str, MeshError> {
        Path::new(filename)
            .file_name()
            .and_then(|f| f.to_str())
            .ok_or_else(|| MeshError::semantic("invalid filename"))
    }

    async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, MeshError> {
        match fs::read(path).await {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| MeshError::Decode(format!("corrupt {}: {e}", path.display())))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MeshError::Fatal(format!("read {}: {e}", path.display()))),
        }
    }

    async fn write_json<T: Serialize + Sync>(path: &Path, value: &T) -> Result<(), MeshError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| MeshError::Fatal(e.to_string()))?;
        }
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| MeshError::Decode(format!("serialize failed: {e}")))?;
        fs::write(path, bytes)
            .await
            .map_err(|e| MeshError::Fatal(format!("write {}: {e}", path.display())))
    }
}

#[derive(Serialize, Deserialize)]
struct CurrentIpPort {
    ip: String,
    port: u16,
}

#[derive(Serialize, Deserialize, Default)]
struct SeekTokenFile {
    tokens: HashSet<String>,
}

#[async_trait]
impl IdentityStore for FsIdentityStore {
    fn username(&self) -> &str {
        &self.username
    }

    async fn public_key_text(&self) -> Result<String, MeshError> {
        fs::read_to_string(self.root.join("public.key"))
            .await
            .map_err(|e| MeshError::Fatal(format!("public.key: {e}")))
    }

    async fn private_key_text(&self) -> Result<String, MeshError> {
        fs::read_to_string(self.root.join("private.key"))
            .await
            .map_err(|e| MeshError::Fatal(format!("private.key: {e}")))
    }

    async fn current_ip_port(&self) -> Result<Option<(String, u16)>, MeshError> {
        let parsed: Option<CurrentIpPort> =
            Self::read_json(&self.root.join("current_ip_port.json")).await?;
        Ok(parsed.map(|p| (p.ip, p.port)))
    }

    async fn set_current_ip_port(&self, ip: &str, port: u16) -> Result<(), MeshError> {
        Self::write_json(
            &self.root.join("current_ip_port.json"),
            &CurrentIpPort {
                ip: ip.to_string(),
                port,
            },
        )
        .await
    }

    async fn get_contact(&self, username: &str) -> Result<Option<AddressBookEntry>, MeshError> {
        Self::read_json(&self.ipcache_path(username)).await
    }

    async fn set_contact(&self, username: &str, ip: &str, port: u16) -> Result<(), MeshError> {
        let entry = AddressBookEntry {
            ip: ip.to_string(),
            port,
            last_seen: Utc::now(),
        };
        Self::write_json(&self.ipcache_path(username), &entry).await
    }

    async fn remove_contact(&self, username: &str) -> Result<(), MeshError> {
        match fs::remove_file(self.ipcache_path(username)).await {
            Ok(()) | Err(_) => Ok(()),
        }
    }

    async fn list_contacts(&self) -> Result<Vec<(String, AddressBookEntry)>, MeshError> {
        let dir = self.root.join("ipcache");
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| MeshError::Fatal(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| MeshError::Fatal(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let username = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            if let Some(value) = Self::read_json::<AddressBookEntry>(&path).await? {
                out.push((username, value));
            }
        }
        Ok(out)
    }

    async fn get_public_key(&self, username: &str) -> Result<Option<String>, MeshError> {
        match fs::read_to_string(self.public_key_dir(username).join("public.key")).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MeshError::Fatal(e.to_string())),
        }
    }

    async fn set_public_key(&self, username: &str, public_key_text: &str) -> Result<(), MeshError> {
        let dir = self.public_key_dir(username);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| MeshError::Fatal(e.to_string()))?;
        fs::write(dir.join("public.key"), public_key_text)
            .await
            .map_err(|e| MeshError::Fatal(e.to_string()))?;
        Self::write_json(
            &dir.join("modified_at.json"),
            &Utc::now(),
        )
        .await
    }

    async fn list_public_keys(&self) -> Result<Vec<(String, PublicKeyRecord)>, MeshError> {
        let dir = self.root.join("public_keys");
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| MeshError::Fatal(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| MeshError::Fatal(e.to_string()))?
        {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let username = path.file_name().and_then(|s| s.to_str()).unwrap_or_default();
            if let Some(public_key_text) = self.get_public_key(username).await? {
                let modified_at = Self::read_json(&path.join("modified_at.json"))
                    .await?
                    .unwrap_or_else(Utc::now);
                out.push((
                    username.to_string(),
                    PublicKeyRecord {
                        public_key_text,
                        modified_at,
                    },
                ));
            }
        }
        Ok(out)
    }

    async fn store_public_key_request(
        &self,
        from_username: &str,
        volunteered_public_key: &str,
    ) -> Result<(), MeshError> {
        Self::write_json(
            &self.public_key_request_dir(from_username).join("request.json"),
            &PublicKeyRequest {
                from_username: from_username.to_string(),
                volunteered_public_key: volunteered_public_key.to_string(),
            },
        )
        .await
    }

    async fn list_public_key_requests(&self) -> Result<Vec<PublicKeyRequest>, MeshError> {
        let dir = self.root.join("public_key_requests");
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| MeshError::Fatal(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| MeshError::Fatal(e.to_string()))?
        {
            let request_path = entry.path().join("request.json");
            if let Some(request) = Self::read_json(&request_path).await? {
                out.push(request);
            }
        }
        Ok(out)
    }

    async fn remove_public_key_request(&self, from_username: &str) -> Result<(), MeshError> {
        let _ = fs::remove_dir_all(self.public_key_request_dir(from_username)).await;
        Ok(())
    }

    async fn store_public_key_response(
        &self,
        response: PublicKeyResponsePayload,
    ) -> Result<(), MeshError> {
        Self::write_json(
            &self
                .public_key_response_dir(&response.from_username)
                .join("response.json"),
            &response,
        )
        .await
    }

    async fn list_public_key_responses(&self) -> Result<Vec<PublicKeyResponsePayload>, MeshError> {
        let dir = self.root.join("public_key_responses");
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| MeshError::Fatal(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| MeshError::Fatal(e.to_string()))?
        {
            let response_path = entry.path().join("response.json");
            if let Some(response) = Self::read_json(&response_path).await? {
                out.push(response);
            }
        }
        Ok(out)
    }

    async fn remove_public_key_response(&self, from_username: &str) -> Result<(), MeshError> {
        let _ = fs::remove_dir_all(self.public_key_response_dir(from_username)).await;
        Ok(())
    }

    async fn add_seek_token(&self, target_username: &str, token: &str) -> Result<(), MeshError> {
        let path = self.seek_tokens_path(target_username);
        let mut file: SeekTokenFile = Self::read_json(&path).await?.unwrap_or_default();
        file.tokens.insert(token.to_string());
        Self::write_json(&path, &file).await
    }

    async fn contains_seek_token(
        &self,
        target_username: &str,
        token: &str,
    ) -> Result<bool, MeshError> {
        let path = self.seek_tokens_path(target_username);
        let file: Option<SeekTokenFile> = Self::read_json(&path).await?;
        let token = token.trim();
        Ok(file
            .map(|f| f.tokens.iter().any(|t| t.trim() == token))
            .unwrap_or(false))
    }

    async fn store_message_key(&self, key: MessageKey) -> Result<(), MeshError> {
        Self::write_json(&self.message_key_dir(&key.message_id).join("key.json"), &key).await
    }

    async fn load_message_key(&self, message_id: &str) -> Result<Option<MessageKey>, MeshError> {
        Self::read_json(&self.message_key_dir(message_id).join("key.json")).await
    }

    async fn append_message_chunk(
        &self,
        message_id: &str,
        filename: &str,
        chunk: &[u8],
    ) -> Result<(), MeshError> {
        use tokio::io::AsyncWriteExt;

        let dir = self.message_dir(message_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| MeshError::Fatal(e.to_string()))?;
        let basename = Self::message_basename(filename)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(basename))
            .await
            .map_err(|e| MeshError::Fatal(e.to_string()))?;
        file.write_all(chunk)
            .await
            .map_err(|e| MeshError::Fatal(e.to_string()))
    }

    async fn read_message(&self, message_id: &str, filename: &str) -> Result<Vec<u8>, MeshError> {
        let basename = Self::message_basename(filename)?;
        match fs::read(self.message_dir(message_id).join(basename)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(MeshError::Fatal(e.to_string())),
        }
    }

    async fn list_message_ids(&self) -> Result<Vec<String>, MeshError> {
        let dir = self.root.join("messages");
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| MeshError::Fatal(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| MeshError::Fatal(e.to_string()))?
        {
            if let Some(name) = entry.file_name().to_str() {
                out.push(name.to_string());
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------
// In-memory store (tests, multi-user-in-one-process simulation)
// ---------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    current_ip_port: Option<(String, u16)>,
    ipcache: HashMap<String, AddressBookEntry>,
    public_keys: HashMap<String, PublicKeyRecord>,
    public_key_requests: HashMap<String, PublicKeyRequest>,
    public_key_responses: HashMap<String, PublicKeyResponsePayload>,
    seek_tokens: HashMap<String, HashSet<String>>,
    message_keys: HashMap<String, MessageKey>,
    messages: HashMap<String, HashMap<String, Vec<u8>>>,
}

pub struct MemoryIdentityStore {
    username: String,
    public_key_text: String,
    private_key_text: String,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryIdentityStore {
    pub fn new(username: impl Into<String>) -> Result<Self, MeshError> {
        let keypair = crate::crypto::generate_rsa_keypair()?;
        Ok(Self {
            username: username.into(),
            public_key_text: keypair.public_key_text,
            private_key_text: keypair.private_key_text,
            state: Arc::new(Mutex::new(MemoryState::default())),
        })
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    fn username(&self) -> &str {
        &self.username
    }

    async fn public_key_text(&self) -> Result<String, MeshError> {
        Ok(self.public_key_text.clone())
    }

    async fn private_key_text(&self) -> Result<String, MeshError> {
        Ok(self.private_key_text.clone())
    }

    async fn current_ip_port(&self) -> Result<Option<(String, u16)>, MeshError> {
        Ok(self.state.lock().await.current_ip_port.clone())
    }

    async fn set_current_ip_port(&self, ip: &str, port: u16) -> Result<(), MeshError> {
        self.state.lock().await.current_ip_port = Some((ip.to_string(), port));
        Ok(())
    }

    async fn get_contact(&self, username: &str) -> Result<Option<AddressBookEntry>, MeshError> {
        Ok(self.state.lock().await.ipcache.get(username).cloned())
    }

    async fn set_contact(&self, username: &str, ip: &str, port: u16) -> Result<(), MeshError> {
        self.state.lock().await.ipcache.insert(
            username.to_string(),
            AddressBookEntry {
                ip: ip.to_string(),
                port,
                last_seen: Utc::now(),
            },
        );
        Ok(())
    }

    async fn remove_contact(&self, username: &str) -> Result<(), MeshError> {
        self.state.lock().await.ipcache.remove(username);
        Ok(())
    }

    async fn list_contacts(&self) -> Result<Vec<(String, AddressBookEntry)>, MeshError> {
        Ok(self
            .state
            .lock()
            .await
            .ipcache
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn get_public_key(&self, username: &str) -> Result<Option<String>, MeshError> {
        Ok(self
            .state
            .lock()
            .await
            .public_keys
            .get(username)
            .map(|r| r.public_key_text.clone()))
    }

    async fn set_public_key(&self, username: &str, public_key_text: &str) -> Result<(), MeshError> {
        self.state.lock().await.public_keys.insert(
            username.to_string(),
            PublicKeyRecord {
                public_key_text: public_key_text.to_string(),
                modified_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn list_public_keys(&self) -> Result<Vec<(String, PublicKeyRecord)>, MeshError> {
        Ok(self
            .state
            .lock()
            .await
            .public_keys
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn store_public_key_request(
        &self,
        from_username: &str,
        volunteered_public_key: &str,
    ) -> Result<(), MeshError> {
        self.state.lock().await.public_key_requests.insert(
            from_username.to_string(),
            PublicKeyRequest {
                from_username: from_username.to_string(),
                volunteered_public_key: volunteered_public_key.to_string(),
            },
        );
        Ok(())
    }

    async fn list_public_key_requests(&self) -> Result<Vec<PublicKeyRequest>, MeshError> {
        Ok(self
            .state
            .lock()
            .await
            .public_key_requests
            .values()
            .cloned()
            .collect())
    }

    async fn remove_public_key_request(&self, from_username: &str) -> Result<(), MeshError> {
        self.state.lock().await.public_key_requests.remove(from_username);
        Ok(())
    }

    async fn store_public_key_response(
        &self,
        response: PublicKeyResponsePayload,
    ) -> Result<(), MeshError> {
        self.state
            .lock()
            .await
            .public_key_responses
            .insert(response.from_username.clone(), response);
        Ok(())
    }

    async fn list_public_key_responses(&self) -> Result<Vec<PublicKeyResponsePayload>, MeshError> {
        Ok(self
            .state
            .lock()
            .await
            .public_key_responses
            .values()
            .cloned()
            .collect())
    }

    async fn remove_public_key_response(&self, from_username: &str) -> Result<(), MeshError> {
        self.state.lock().await.public_key_responses.remove(from_username);
        Ok(())
    }

    async fn add_seek_token(&self, target_username: &str, token: &str) -> Result<(), MeshError> {
        self.state
            .lock()
            .await
            .seek_tokens
            .entry(target_username.to_string())
            .or_default()
            .insert(token.to_string());
        Ok(())
    }

    async fn contains_seek_token(
        &self,
        target_username: &str,
        token: &str,
    ) -> Result<bool, MeshError> {
        let token = token.trim();
        Ok(self
            .state
            .lock()
            .await
            .seek_tokens
            .get(target_username)
            .map(|set| set.iter().any(|t| t.trim() == token))
            .unwrap_or(false))
    }

    async fn store_message_key(&self, key: MessageKey) -> Result<(), MeshError> {
        self.state
            .lock()
            .await
            .message_keys
            .insert(key.message_id.clone(), key);
        Ok(())
    }

    async fn load_message_key(&self, message_id: &str) -> Result<Option<MessageKey>, MeshError> {
        Ok(self.state.lock().await.message_keys.get(message_id).cloned())
    }

    async fn append_message_chunk(
        &self,
        message_id: &str,
        filename: &str,
        chunk: &[u8],
    ) -> Result<(), MeshError> {
        let basename = Path::new(filename)
            .file_name()
            .and_then(|f| f.to_str())
            .ok_or_else(|| MeshError::semantic("invalid filename"))?
            .to_string();
        let mut state = self.state.lock().await;
        state
            .messages
            .entry(message_id.to_string())
            .or_default()
            .entry(basename)
            .or_default()
            .extend_from_slice(chunk);
        Ok(())
    }

    async fn read_message(&self, message_id: &str, filename: &str) -> Result<Vec<u8>, MeshError> {
        let basename = Path::new(filename)
            .file_name()
            .and_then(|f| f.to_str())
            .ok_or_else(|| MeshError::semantic("invalid filename"))?;
        Ok(self
            .state
            .lock()
            .await
            .messages
            .get(message_id)
            .and_then(|files| files.get(basename))
            .cloned()
            .unwrap_or_default())
    }

    async fn list_message_ids(&self) -> Result<Vec<String>, MeshError> {
        Ok(self.state.lock().await.messages.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_seek_token_round_trip() {
        let store = MemoryIdentityStore::new("alice").unwrap();
        store.add_seek_token("bob", "  token-123  ").await.unwrap();
        assert!(store.contains_seek_token("bob", "token-123").await.unwrap());
        assert!(!store.contains_seek_token("bob", "nope").await.unwrap());
    }

    #[tokio::test]
    async fn memory_store_public_key_request_not_auto_trusted() {
        let store = MemoryIdentityStore::new("alice").unwrap();
        store
            .store_public_key_request("bob", "-----BEGIN PUBLIC KEY-----\nvolunteered\n-----END PUBLIC KEY-----")
            .await
            .unwrap();

        assert!(store.get_public_key("bob").await.unwrap().is_none());
        assert_eq!(store.list_public_key_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fs_store_init_and_open() {
        let home = tempfile::tempdir().unwrap();
        let created = FsIdentityStore::init(home.path(), "alice").await.unwrap();
        assert_eq!(created.username(), "alice");
        assert!(!created.public_key_text().await.unwrap().is_empty());

        let reopened = FsIdentityStore::open(home.path(), "alice").await.unwrap();
        assert_eq!(
            reopened.public_key_text().await.unwrap(),
            created.public_key_text().await.unwrap()
        );

        let err = FsIdentityStore::init(home.path(), "alice").await.unwrap_err();
        assert!(matches!(err, MeshError::Semantic(_)));
    }

    #[tokio::test]
    async fn fs_store_ipcache_round_trip() {
        let home = tempfile::tempdir().unwrap();
        let store = FsIdentityStore::init(home.path(), "alice").await.unwrap();
        store.set_contact("bob", "10.0.0.1", 9001).await.unwrap();
        let entry = store.get_contact("bob").await.unwrap().unwrap();
        assert_eq!(entry.ip, "10.0.0.1");
        assert_eq!(entry.port, 9001);

        store.remove_contact("bob").await.unwrap();
        assert!(store.get_contact("bob").await.unwrap().is_none());
    }
}
