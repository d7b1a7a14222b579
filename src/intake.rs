//! Intake store for content shared into the background context.
//!
//! The store is an actor: a single task owns the pending state and every
//! reader or writer talks to it through an [`IntakeHandle`]. State lives
//! only as long as the task, so restarting the background process loses
//! anything that was never pulled.
//!
//! Pulls never clear the store (at-least-once delivery): a later pull sees
//! the same content again until the background context restarts.

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::source::{FilePayload, InputItem};

/// One field of a share submission.
#[derive(Debug, Clone)]
pub enum SubmittedField {
    Text { name: String, value: String },
    File { name: String, file: PendingFile },
}

impl SubmittedField {
    pub fn name(&self) -> &str {
        match self {
            SubmittedField::Text { name, .. } | SubmittedField::File { name, .. } => name,
        }
    }
}

/// A shared file waiting to be pulled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFile {
    pub content_type: String,
    pub data: Bytes,
}

impl PendingFile {
    pub fn into_input(self, key: &str) -> InputItem {
        InputItem::File(FilePayload {
            name: key.to_string(),
            media_type: self.content_type,
            data: self.data,
        })
    }
}

/// Body of `GET /income`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingListing {
    pub pending_files: Vec<String>,
    pub pending_texts: Vec<String>,
}

impl PendingListing {
    pub fn is_empty(&self) -> bool {
        self.pending_files.is_empty() && self.pending_texts.is_empty()
    }
}

/// What a submission added.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub files: usize,
    pub texts: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("no pending file under key {0:?}")]
    NotFound(String),
    #[error("intake store is not running")]
    Unavailable,
}

/// Volatile state owned by the actor.
#[derive(Debug, Default)]
struct PendingIntake {
    // Keys stay in first-insertion order; a resubmitted key keeps its slot.
    files: Vec<(String, PendingFile)>,
    texts: Vec<String>,
}

impl PendingIntake {
    fn submit(&mut self, fields: Vec<SubmittedField>) -> SubmitReceipt {
        let mut receipt = SubmitReceipt::default();
        for field in fields {
            match field {
                SubmittedField::Text { value, .. } => {
                    self.texts.push(value);
                    receipt.texts += 1;
                }
                SubmittedField::File { name, file } => {
                    match self.files.iter_mut().find(|(key, _)| *key == name) {
                        Some(slot) => slot.1 = file,
                        None => self.files.push((name, file)),
                    }
                    receipt.files += 1;
                }
            }
        }
        receipt
    }

    fn listing(&self) -> PendingListing {
        PendingListing {
            pending_files: self.files.iter().map(|(key, _)| key.clone()).collect(),
            pending_texts: self.texts.clone(),
        }
    }

    fn file(&self, key: &str) -> Option<PendingFile> {
        self.files
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, file)| file.clone())
    }
}

enum IntakeCommand {
    Submit {
        fields: Vec<SubmittedField>,
        reply: oneshot::Sender<SubmitReceipt>,
    },
    List {
        reply: oneshot::Sender<PendingListing>,
    },
    Fetch {
        key: String,
        reply: oneshot::Sender<Option<PendingFile>>,
    },
}

/// Cloneable handle to the intake actor.
#[derive(Clone)]
pub struct IntakeHandle {
    tx: mpsc::Sender<IntakeCommand>,
}

/// Spawns the actor task.
pub struct IntakeStore;

impl IntakeStore {
    /// Start an empty store. The store stops once every handle is dropped.
    pub fn spawn() -> IntakeHandle {
        let (tx, mut rx) = mpsc::channel::<IntakeCommand>(64);

        tokio::spawn(async move {
            let mut state = PendingIntake::default();
            info!("Intake store started");

            while let Some(cmd) = rx.recv().await {
                match cmd {
                    IntakeCommand::Submit { fields, reply } => {
                        let receipt = state.submit(fields);
                        debug!(
                            "Intake: stored {} files, {} texts ({} keys pending)",
                            receipt.files,
                            receipt.texts,
                            state.files.len()
                        );
                        let _ = reply.send(receipt);
                    }
                    IntakeCommand::List { reply } => {
                        let _ = reply.send(state.listing());
                    }
                    IntakeCommand::Fetch { key, reply } => {
                        let _ = reply.send(state.file(&key));
                    }
                }
            }

            info!("Intake store stopped");
        });

        IntakeHandle { tx }
    }
}

impl IntakeHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> IntakeCommand) -> Result<T, IntakeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| IntakeError::Unavailable)?;
        rx.await.map_err(|_| IntakeError::Unavailable)
    }

    /// Text fields are appended in arrival order; file fields replace any
    /// previous file under the same key.
    pub async fn submit(&self, fields: Vec<SubmittedField>) -> Result<SubmitReceipt, IntakeError> {
        self.call(|reply| IntakeCommand::Submit { fields, reply }).await
    }

    pub async fn list_pending(&self) -> Result<PendingListing, IntakeError> {
        self.call(|reply| IntakeCommand::List { reply }).await
    }

    pub async fn fetch_pending_file(&self, key: &str) -> Result<PendingFile, IntakeError> {
        let found = self
            .call(|reply| IntakeCommand::Fetch {
                key: key.to_string(),
                reply,
            })
            .await?;
        found.ok_or_else(|| IntakeError::NotFound(key.to_string()))
    }
}
