//! Per-conversation state and scratch data.
//!
//! Two backends share the [`StateStorage`] contract: [`MemoryStorage`] keeps
//! everything in-process and reaps idle conversations, [`RedisStorage`] keeps
//! it in Redis with a per-key expiry. A missing value is never an error.

use async_trait::async_trait;

use crate::errors::StorageError;
use crate::state::{ConversationData, ConversationKey, DataField, RegistrationState};

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStorage;
pub use self::redis::RedisStorage;

#[async_trait]
pub trait StateStorage: Send + Sync {
    /// Current state, `Start` when nothing is stored.
    async fn get(&self, key: ConversationKey) -> Result<RegistrationState, StorageError>;

    async fn set(&self, key: ConversationKey, state: RegistrationState) -> Result<(), StorageError>;

    /// Forget the state. A no-op for unknown keys.
    async fn delete(&self, key: ConversationKey) -> Result<(), StorageError>;

    async fn get_data(
        &self,
        key: ConversationKey,
        field: DataField,
    ) -> Result<Option<String>, StorageError>;

    async fn set_data(
        &self,
        key: ConversationKey,
        field: DataField,
        value: String,
    ) -> Result<(), StorageError>;

    async fn clear_data(&self, key: ConversationKey) -> Result<(), StorageError>;

    /// Whole data record for the conversation.
    async fn data(&self, key: ConversationKey) -> Result<ConversationData, StorageError> {
        Ok(ConversationData {
            login: self.get_data(key, DataField::Login).await?,
            code: self.get_data(key, DataField::Code).await?,
        })
    }
}
