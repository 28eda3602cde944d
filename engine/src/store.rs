//! Persistent-store boundary.
//!
//! Storage backends are external collaborators: the engine only knows a
//! synchronous [`StoreSink`] fronted by a worker task, so handler code gets
//! an async [`StoreHandle`] no matter what the backend blocks on. Model
//! namespaces are declared up front; operations against an undeclared model
//! are rejected rather than silently creating one.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store worker channel closed")]
    ChannelClosed,

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("store sink error: {0}")]
    Sink(String),
}

/// Backend operations. Records are opaque bytes; callers pick their own
/// serialization.
pub trait StoreSink: Send + Sync + 'static {
    fn load(&self, model: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn save(&self, model: &str, key: &str, record: Vec<u8>) -> Result<(), StoreError>;
    fn delete(&self, model: &str, key: &str) -> Result<bool, StoreError>;
}

/// In-memory sink for tests and demos.
#[derive(Clone, Default)]
pub struct MemoryStoreSink {
    records: Arc<DashMap<(String, String), Vec<u8>>>,
}

impl MemoryStoreSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

impl StoreSink for MemoryStoreSink {
    fn load(&self, model: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .records
            .get(&(model.to_string(), key.to_string()))
            .map(|entry| entry.value().clone()))
    }

    fn save(&self, model: &str, key: &str, record: Vec<u8>) -> Result<(), StoreError> {
        self.records
            .insert((model.to_string(), key.to_string()), record);
        Ok(())
    }

    fn delete(&self, model: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self
            .records
            .remove(&(model.to_string(), key.to_string()))
            .is_some())
    }
}

enum StoreCommand {
    RegisterModels(Vec<String>),
    Load {
        model: String,
        key: String,
        ack: oneshot::Sender<Result<Option<Vec<u8>>, StoreError>>,
    },
    Save {
        model: String,
        key: String,
        record: Vec<u8>,
        ack: oneshot::Sender<Result<(), StoreError>>,
    },
    Delete {
        model: String,
        key: String,
        ack: oneshot::Sender<Result<bool, StoreError>>,
    },
}

/// Cloneable async front for the store worker. Handlers acquire it per call
/// through their state context.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::UnboundedSender<StoreCommand>,
}

impl StoreHandle {
    /// Declares model namespaces. Commands are processed in order, so models
    /// registered before the server starts are visible to every handler.
    pub fn register_models(&self, models: &[&str]) -> Result<(), StoreError> {
        self.tx
            .send(StoreCommand::RegisterModels(
                models.iter().map(|m| (*m).to_string()).collect(),
            ))
            .map_err(|_| StoreError::ChannelClosed)
    }

    pub async fn load(&self, model: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Load {
                model: model.to_string(),
                key: key.to_string(),
                ack: ack_tx,
            })
            .map_err(|_| StoreError::ChannelClosed)?;
        ack_rx.await.map_err(|_| StoreError::ChannelClosed)?
    }

    pub async fn save(&self, model: &str, key: &str, record: Vec<u8>) -> Result<(), StoreError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Save {
                model: model.to_string(),
                key: key.to_string(),
                record,
                ack: ack_tx,
            })
            .map_err(|_| StoreError::ChannelClosed)?;
        ack_rx.await.map_err(|_| StoreError::ChannelClosed)?
    }

    pub async fn delete(&self, model: &str, key: &str) -> Result<bool, StoreError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Delete {
                model: model.to_string(),
                key: key.to_string(),
                ack: ack_tx,
            })
            .map_err(|_| StoreError::ChannelClosed)?;
        ack_rx.await.map_err(|_| StoreError::ChannelClosed)?
    }
}

/// Spawns the store worker over `sink` and returns its handle.
pub fn start_store_worker(sink: Arc<dyn StoreSink>) -> StoreHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<StoreCommand>();

    tokio::spawn(async move {
        let mut models: HashSet<String> = HashSet::new();

        while let Some(command) = rx.recv().await {
            match command {
                StoreCommand::RegisterModels(names) => {
                    for name in names {
                        log::debug!("registered store model '{name}'");
                        models.insert(name);
                    }
                }
                StoreCommand::Load { model, key, ack } => {
                    let result = if models.contains(&model) {
                        sink.load(&model, &key)
                    } else {
                        Err(StoreError::UnknownModel(model))
                    };
                    let _ = ack.send(result);
                }
                StoreCommand::Save {
                    model,
                    key,
                    record,
                    ack,
                } => {
                    let result = if models.contains(&model) {
                        sink.save(&model, &key, record)
                    } else {
                        Err(StoreError::UnknownModel(model))
                    };
                    let _ = ack.send(result);
                }
                StoreCommand::Delete { model, key, ack } => {
                    let result = if models.contains(&model) {
                        sink.delete(&model, &key)
                    } else {
                        Err(StoreError::UnknownModel(model))
                    };
                    let _ = ack.send(result);
                }
            }
        }
    });

    StoreHandle { tx }
}
