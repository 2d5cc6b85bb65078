mod bookmark;
mod config_cmd;
mod watch;

use clap::ValueEnum;
use std::sync::Arc;

use smartmarks_core::{HostedStore, SyncCore, SyncError, SyncHandle};

use crate::config::Config;

pub use bookmark::{AddCommand, DeleteCommand, ListCommand};
pub use config_cmd::ConfigCommand;
pub use watch::WatchCommand;

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Connects to the hosted store and starts a session for the configured
/// user. A feed that cannot be opened is not fatal; the fetched rows are
/// still served.
pub async fn open_session(config: &Config) -> Result<SyncHandle, Box<dyn std::error::Error>> {
    let store = HostedStore::new(config.hosted()?);
    let owner_id = config.owner_id()?;
    let handle = SyncCore::spawn(Arc::new(store), config.sync_options());

    match handle.initialize(owner_id).await {
        Ok(()) => Ok(handle),
        Err(SyncError::Subscription(reason)) => {
            tracing::warn!("live updates unavailable: {}", reason);
            Ok(handle)
        }
        Err(e) => {
            let _ = handle.shutdown().await;
            Err(e.into())
        }
    }
}
