use crate::chat::{ChatController, MessageStore};
use crate::config::{SyncConfig, TransportConfig};
use crate::storage::{FileStore, KeyValueStore};
use crate::sync::{NetworkMonitor, OfflineActionQueue};
use crate::transport::{ChatTransport, HttpTransport};
use anyhow::{Context, Result};
use std::sync::Arc;

/// The wired-up pipeline: one store, one queue, one controller sharing a network monitor.
pub struct ChatPipeline {
    pub store: Arc<MessageStore>,
    pub network: Arc<NetworkMonitor>,
    pub queue: Arc<OfflineActionQueue>,
    pub controller: Arc<ChatController>,
}

impl ChatPipeline {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        storage: Arc<dyn KeyValueStore>,
        network: Arc<NetworkMonitor>,
        config: SyncConfig,
    ) -> Self {
        let store = Arc::new(MessageStore::new());
        let queue = Arc::new(OfflineActionQueue::new(
            storage,
            Arc::clone(&transport),
            Arc::clone(&store),
            Arc::clone(&network),
            config.clone(),
        ));
        queue.watch_connectivity();
        let controller = Arc::new(ChatController::new(
            transport,
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&network),
            &config,
        ));
        Self {
            store,
            network,
            queue,
            controller,
        }
    }

    /// Builds the HTTP-backed pipeline with file storage, configured from the environment.
    pub fn from_env(network: Arc<NetworkMonitor>) -> Result<Self> {
        let transport_config = TransportConfig::from_env()?;
        let sync_config = SyncConfig::from_env()?;
        let transport = HttpTransport::new(&transport_config)
            .context("failed to build HTTP client for the chat backend")?;
        Ok(Self::new(
            Arc::new(transport),
            Arc::new(FileStore::in_data_dir()),
            network,
            sync_config,
        ))
    }
}
