//! Persisted queue settings.

use async_trait::async_trait;

use crate::db::DbHandle;
use crate::Result;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_queue_paused(&self) -> Result<bool>;

    async fn set_queue_paused(&self, paused: bool) -> Result<()>;
}

#[async_trait]
impl SettingsStore for DbHandle {
    async fn get_queue_paused(&self) -> Result<bool> {
        self.queue_paused().await
    }

    async fn set_queue_paused(&self, paused: bool) -> Result<()> {
        self.store_queue_paused(paused).await
    }
}
