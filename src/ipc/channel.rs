/*!
 * Mailbox Channel
 * Durable, file-backed mailbox shared between the supervisor and one worker
 *
 * Layout: `<root>/<channel_id>/{inbox,outbox,errors}`
 *
 * A message is serialized into the sender's outbox as a temporary file and
 * then renamed into the recipient's inbox, so a reader never observes a
 * partially written message. Inbox file names sort in send order.
 * Files that fail to parse are moved to `errors/` instead of being dropped.
 */

use super::types::{ChannelId, IpcError, IpcMessage, IpcResult};
use crate::core::limits::{ERRORS_DIR, INBOX_DIR, OUTBOX_DIR};
use crate::core::types::now_micros;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

const MESSAGE_EXT: &str = "json";
const STAGING_EXT: &str = "tmp";

/// One inbox file that has been read but not yet acknowledged
#[derive(Debug)]
pub struct InboxEntry {
    pub path: PathBuf,
    pub message: IpcMessage,
}

/// Result of one inbox scan
#[derive(Debug, Default)]
pub struct DrainResult {
    pub entries: Vec<InboxEntry>,
    pub quarantined: usize,
}

/// File-backed mailbox of one channel
#[derive(Debug, Clone)]
pub struct Mailbox {
    id: ChannelId,
    dir: PathBuf,
}

impl Mailbox {
    pub fn new(root: &Path, id: &str) -> Self {
        Self {
            id: id.to_string(),
            dir: root.join(id),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn inbox(&self) -> PathBuf {
        self.dir.join(INBOX_DIR)
    }

    pub fn outbox(&self) -> PathBuf {
        self.dir.join(OUTBOX_DIR)
    }

    pub fn errors(&self) -> PathBuf {
        self.dir.join(ERRORS_DIR)
    }

    /// Create the mailbox directories (idempotent)
    pub async fn create(&self) -> IpcResult<()> {
        for dir in [self.inbox(), self.outbox(), self.errors()] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| IpcError::io(&dir, e))?;
        }
        Ok(())
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(self.inbox()).await.is_ok()
    }

    /// Delete the mailbox and everything in it
    pub async fn destroy(&self) -> IpcResult<()> {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(IpcError::io(&self.dir, e)),
        }
    }

    /// Write `message` into `recipient`'s inbox as one unit
    pub async fn deliver(&self, recipient: &Mailbox, message: &IpcMessage, seq: u64) -> IpcResult<()> {
        let bytes = serde_json::to_vec(message)?;
        let file_name = format!("{:020}-{:012}-{}", now_micros(), seq, message.id);

        let staged = self.outbox().join(format!("{}.{}", file_name, STAGING_EXT));
        fs::write(&staged, &bytes)
            .await
            .map_err(|e| IpcError::io(&staged, e))?;

        let target = recipient.inbox().join(format!("{}.{}", file_name, MESSAGE_EXT));
        if let Err(e) = fs::rename(&staged, &target).await {
            let _ = fs::remove_file(&staged).await;
            if e.kind() == std::io::ErrorKind::NotFound {
                return Err(IpcError::ChannelNotFound(recipient.id.clone()));
            }
            return Err(IpcError::io(&target, e));
        }

        debug!(
            from = %self.id,
            to = %recipient.id,
            message_id = %message.id,
            command = %message.command,
            "Message delivered"
        );
        Ok(())
    }

    /// Read every inbox message in send order
    ///
    /// Entries stay on disk until `ack` is called. Malformed files are
    /// quarantined.
    pub async fn drain(&self) -> IpcResult<DrainResult> {
        let inbox = self.inbox();
        let mut reader = fs::read_dir(&inbox)
            .await
            .map_err(|e| IpcError::io(&inbox, e))?;

        let mut paths = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| IpcError::io(&inbox, e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == MESSAGE_EXT) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut result = DrainResult::default();
        for path in paths {
            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                // Raced with another reader that already acknowledged it
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(IpcError::io(&path, e)),
            };

            match serde_json::from_slice::<IpcMessage>(&bytes) {
                Ok(message) => result.entries.push(InboxEntry { path, message }),
                Err(e) => {
                    warn!(channel = %self.id, path = %path.display(), error = %e, "Malformed message quarantined");
                    self.quarantine(&path).await?;
                    result.quarantined += 1;
                }
            }
        }

        Ok(result)
    }

    /// Remove a processed inbox entry
    pub async fn ack(&self, entry: &InboxEntry) -> IpcResult<()> {
        match fs::remove_file(&entry.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(IpcError::io(&entry.path, e)),
        }
    }

    /// Move an inbox file into the error area
    pub async fn quarantine(&self, path: &Path) -> IpcResult<()> {
        let name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| format!("{}.{}", now_micros(), MESSAGE_EXT).into());
        let target = self.errors().join(name);
        fs::rename(path, &target)
            .await
            .map_err(|e| IpcError::io(&target, e))
    }

    /// Number of undelivered inbox messages
    pub async fn pending(&self) -> IpcResult<usize> {
        let inbox = self.inbox();
        let mut reader = fs::read_dir(&inbox)
            .await
            .map_err(|e| IpcError::io(&inbox, e))?;
        let mut count = 0;
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| IpcError::io(&inbox, e))?
        {
            if entry.path().extension().is_some_and(|ext| ext == MESSAGE_EXT) {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Number of quarantined files
    pub async fn quarantined(&self) -> IpcResult<usize> {
        let errors = self.errors();
        let mut reader = fs::read_dir(&errors)
            .await
            .map_err(|e| IpcError::io(&errors, e))?;
        let mut count = 0;
        while reader
            .next_entry()
            .await
            .map_err(|e| IpcError::io(&errors, e))?
            .is_some()
        {
            count += 1;
        }
        Ok(count)
    }
}
