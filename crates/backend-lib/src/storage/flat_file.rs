//! Flat-file implementation of the Storage trait.
//!
//! Layout under the root directory:
//!
//! ```text
//! messages.log            one JSON StoredMessage per line, append-only
//! channels/<id>.json      Channel records
//! profiles/<identity>.json UserProfile records
//! ```
//!
//! The message log is replayed into memory on open so lookups by id and
//! conversation scans do not touch the disk.
use super::{check_draft_invariants, Channel, Storage};
use crate::error::AppError;
use async_trait::async_trait;
use chat_relay_common::{MessageDraft, MessageId, MessageScope, StoredMessage, UserProfile};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::{fs as tokio_fs, io::AsyncWriteExt, sync::Mutex};
use uuid::Uuid;

#[derive(Default)]
struct MessageIndex {
    log: Vec<StoredMessage>,
    by_id: HashMap<MessageId, usize>,
}

impl MessageIndex {
    fn push(&mut self, message: StoredMessage) {
        self.by_id.insert(message.id.clone(), self.log.len());
        self.log.push(message);
    }
}

#[derive(Clone)]
pub struct FlatFileStorage {
    root: PathBuf,
    index: Arc<RwLock<MessageIndex>>,
    // serializes every write so the log order is the persistence order
    write_lock: Arc<Mutex<()>>,
}

impl FlatFileStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("channels"))?;
        fs::create_dir_all(root.join("profiles"))?;

        let index = replay_log(&root.join("messages.log"))?;
        tracing::debug!(
            "Opened flat-file storage at {} with {} messages",
            root.display(),
            index.log.len()
        );

        Ok(Self {
            root,
            index: Arc::new(RwLock::new(index)),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn log_path(&self) -> PathBuf {
        self.root.join("messages.log")
    }

    fn channel_path(&self, channel_id: &str) -> Result<PathBuf, AppError> {
        Ok(self
            .root
            .join("channels")
            .join(format!("{}.json", file_stem(channel_id)?)))
    }

    fn profile_path(&self, identity: &str) -> Result<PathBuf, AppError> {
        Ok(self
            .root
            .join("profiles")
            .join(format!("{}.json", file_stem(identity)?)))
    }

    async fn read_channel(&self, channel_id: &str) -> Result<Channel, AppError> {
        let path = self.channel_path(channel_id)?;
        if !tokio_fs::try_exists(&path).await? {
            return Err(AppError::ChannelNotFound(channel_id.to_string()));
        }
        let content = tokio_fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn write_channel(&self, channel: &Channel) -> Result<(), AppError> {
        let path = self.channel_path(&channel.id)?;
        let tmp = path.with_extension("json.tmp");
        tokio_fs::write(&tmp, serde_json::to_string_pretty(channel)?).await?;
        tokio_fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Create or replace a channel record (channel administration)
    pub async fn upsert_channel(&self, channel: &Channel) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        self.write_channel(channel).await
    }

    /// Create or replace a profile record (profile administration)
    pub async fn upsert_profile(&self, profile: &UserProfile) -> Result<(), AppError> {
        let path = self.profile_path(&profile.identity)?;
        let _guard = self.write_lock.lock().await;
        tokio_fs::write(path, serde_json::to_string_pretty(profile)?).await?;
        Ok(())
    }
}

async fn write_line(file: &mut tokio_fs::File, line: &str) -> std::io::Result<()> {
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}

// Ids are validated upstream; this keeps a bad id from escaping the data dir.
fn file_stem(id: &str) -> Result<&str, AppError> {
    if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
        return Err(AppError::Validation(
            crate::validation::ValidationError::InvalidChannelId(id.to_string()),
        ));
    }
    Ok(id)
}

/// Rebuild the index from the message log.
///
/// Unreadable complete lines are skipped. An unterminated tail is a torn
/// final write: it is kept (and terminated) if it parses, and cut off
/// otherwise, so the next append starts on a fresh line.
fn replay_log(log_path: &Path) -> anyhow::Result<MessageIndex> {
    let mut index = MessageIndex::default();
    if !log_path.exists() {
        return Ok(index);
    }

    let bytes = fs::read(log_path)?;
    let complete = bytes.iter().rposition(|&b| b == b'\n').map_or(0, |pos| pos + 1);

    for (lineno, line) in bytes[..complete].split(|&b| b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<StoredMessage>(line) {
            Ok(message) => index.push(message),
            Err(e) => tracing::warn!(
                "Skipping unreadable line {} in {}: {e}",
                lineno + 1,
                log_path.display()
            ),
        }
    }

    let tail = &bytes[complete..];
    if !tail.is_empty() {
        match serde_json::from_slice::<StoredMessage>(tail) {
            Ok(message) => {
                index.push(message);
                fs::OpenOptions::new()
                    .append(true)
                    .open(log_path)?
                    .write_all(b"\n")?;
            },
            Err(e) => {
                tracing::warn!(
                    "Truncating torn write ({} bytes) at the end of {}: {e}",
                    tail.len(),
                    log_path.display()
                );
                fs::OpenOptions::new()
                    .write(true)
                    .open(log_path)?
                    .set_len(complete as u64)?;
            },
        }
    }

    Ok(index)
}

#[async_trait]
impl Storage for FlatFileStorage {
    async fn store_message(&self, draft: MessageDraft) -> Result<StoredMessage, AppError> {
        check_draft_invariants(&draft)?;

        let _guard = self.write_lock.lock().await;
        if let MessageScope::Channel { channel_id } = &draft.scope {
            let path = self.channel_path(channel_id)?;
            if !tokio_fs::try_exists(&path).await? {
                return Err(AppError::ChannelNotFound(channel_id.clone()));
            }
        }

        let message = StoredMessage::from_draft(Uuid::new_v4().to_string(), draft, Utc::now());
        let mut line = serde_json::to_string(&message)?;
        line.push('\n');

        let mut file = tokio_fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
            .await?;
        let len_before = file.metadata().await?.len();
        if let Err(e) = write_line(&mut file, &line).await {
            // leave no partial line for the next append to land on
            if let Err(trunc) = file.set_len(len_before).await {
                tracing::error!("Failed to roll back partial log write: {trunc}");
            }
            return Err(e.into());
        }

        self.index.write().push(message.clone());
        Ok(message)
    }

    async fn get_message(&self, id: &str) -> Result<StoredMessage, AppError> {
        let index = self.index.read();
        index
            .by_id
            .get(id)
            .map(|&pos| index.log[pos].clone())
            .ok_or_else(|| AppError::MessageNotFound(id.to_string()))
    }

    async fn get_profile(&self, identity: &str) -> Result<Option<UserProfile>, AppError> {
        let path = self.profile_path(identity)?;
        if !tokio_fs::try_exists(&path).await? {
            return Ok(None);
        }
        let content = tokio_fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn append_message_to_channel(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        let mut channel = self.read_channel(channel_id).await?;
        channel.messages.push(message_id.to_string());
        self.write_channel(&channel).await
    }

    async fn get_channel(&self, channel_id: &str) -> Result<Channel, AppError> {
        self.read_channel(channel_id).await
    }

    async fn conversation(&self, a: &str, b: &str) -> Result<Vec<StoredMessage>, AppError> {
        Ok(self
            .index
            .read()
            .log
            .iter()
            .filter(|m| m.is_between(a, b))
            .cloned()
            .collect())
    }
}
