// In-memory user directory

use super::{Filter, UserDirectory};
use crate::errors::DirectoryError;
use crate::models::Recipient;
use async_trait::async_trait;
use std::fs;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{info, instrument};

/// InMemoryDirectory keeps recipients in process memory
///
/// Recipients are kept in insertion order; inserting an existing id replaces
/// the stored recipient.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    recipients: RwLock<Vec<Recipient>>,
}

impl InMemoryDirectory {
    pub fn new(recipients: impl IntoIterator<Item = Recipient>) -> Self {
        let mut deduped: Vec<Recipient> = Vec::new();
        for recipient in recipients {
            upsert(&mut deduped, recipient);
        }
        Self {
            recipients: RwLock::new(deduped),
        }
    }

    /// Load recipients from a JSON array of `{"id": ..., <attributes>}` objects
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| DirectoryError::Unavailable(format!("{}: {}", path.display(), e)))?;
        let recipients: Vec<Recipient> = serde_json::from_str(&raw)
            .map_err(|e| DirectoryError::QueryFailed(format!("{}: {}", path.display(), e)))?;

        info!(path = %path.display(), count = recipients.len(), "Recipients loaded");
        Ok(Self::new(recipients))
    }

    pub async fn insert(&self, recipient: Recipient) {
        let mut recipients = self.recipients.write().await;
        upsert(&mut recipients, recipient);
    }

    /// Remove a recipient, returning whether it existed
    pub async fn remove(&self, id: &str) -> bool {
        let mut recipients = self.recipients.write().await;
        let before = recipients.len();
        recipients.retain(|r| r.id != id);
        recipients.len() != before
    }

    pub async fn len(&self) -> usize {
        self.recipients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.recipients.read().await.is_empty()
    }
}

fn upsert(recipients: &mut Vec<Recipient>, recipient: Recipient) {
    match recipients.iter_mut().find(|r| r.id == recipient.id) {
        Some(existing) => *existing = recipient,
        None => recipients.push(recipient),
    }
}

#[async_trait]
impl UserDirectory for InMemoryDirectory {
    #[instrument(skip(self, filter))]
    async fn query(&self, filter: Option<&Filter>) -> Result<Vec<Recipient>, DirectoryError> {
        if let Some(filter) = filter {
            filter.validate()?;
        }

        let recipients = self.recipients.read().await;
        Ok(recipients
            .iter()
            .filter(|r| filter.map_or(true, |f| f.matches(r)))
            .cloned()
            .collect())
    }
}
