use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use super::StateStorage;
use crate::errors::StorageError;
use crate::state::{ConversationKey, DataField, RegistrationState};

pub const DEFAULT_KEY_PREFIX: &str = "fsm:";
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// Redis-backed store.
///
/// Each conversation owns two keys: `{prefix}state:{chat}:{user}` holding the
/// state name and `{prefix}data:{chat}:{user}`, a hash of field to JSON value.
/// Every write refreshes the expiry of the key it touches.
#[derive(Clone)]
pub struct RedisStorage {
    connection: MultiplexedConnection,
    key_prefix: String,
    expiry: Duration,
}

impl RedisStorage {
    pub async fn connect(
        url: &str,
        key_prefix: impl Into<String>,
        expiry: Duration,
    ) -> Result<Self, StorageError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        let mut key_prefix = key_prefix.into();
        if key_prefix.is_empty() {
            key_prefix = DEFAULT_KEY_PREFIX.to_owned();
        }
        let expiry = if expiry.is_zero() { DEFAULT_EXPIRY } else { expiry };

        Ok(Self {
            connection,
            key_prefix,
            expiry,
        })
    }

    pub async fn ping(&self) -> Result<(), StorageError> {
        let mut connection = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut connection).await?;
        Ok(())
    }

    fn state_key(&self, key: ConversationKey) -> String {
        state_key(&self.key_prefix, key)
    }

    fn data_key(&self, key: ConversationKey) -> String {
        data_key(&self.key_prefix, key)
    }
}

fn state_key(prefix: &str, key: ConversationKey) -> String {
    format!("{prefix}state:{}:{}", key.chat_id, key.user_id)
}

fn data_key(prefix: &str, key: ConversationKey) -> String {
    format!("{prefix}data:{}:{}", key.chat_id, key.user_id)
}

fn decode_state(redis_key: &str, raw: &str) -> Result<RegistrationState, StorageError> {
    if raw.is_empty() {
        return Ok(RegistrationState::Start);
    }
    RegistrationState::from_str(raw).map_err(|e| StorageError::Decode {
        key: redis_key.to_owned(),
        reason: e.to_string(),
    })
}

fn decode_value(redis_key: &str, raw: &str) -> Result<String, StorageError> {
    serde_json::from_str::<String>(raw).map_err(|e| StorageError::Decode {
        key: redis_key.to_owned(),
        reason: e.to_string(),
    })
}

fn encode_value(value: &str) -> String {
    serde_json::Value::String(value.to_owned()).to_string()
}

#[async_trait]
impl StateStorage for RedisStorage {
    async fn get(&self, key: ConversationKey) -> Result<RegistrationState, StorageError> {
        let redis_key = self.state_key(key);
        let mut connection = self.connection.clone();
        let raw: Option<String> = connection.get(&redis_key).await?;
        match raw {
            Some(raw) => decode_state(&redis_key, &raw),
            None => Ok(RegistrationState::Start),
        }
    }

    async fn set(&self, key: ConversationKey, state: RegistrationState) -> Result<(), StorageError> {
        let mut connection = self.connection.clone();
        let _: () = connection
            .set_ex(self.state_key(key), state.as_ref(), self.expiry.as_secs())
            .await?;
        Ok(())
    }

    async fn delete(&self, key: ConversationKey) -> Result<(), StorageError> {
        let mut connection = self.connection.clone();
        let _: () = connection.del(self.state_key(key)).await?;
        Ok(())
    }

    async fn get_data(
        &self,
        key: ConversationKey,
        field: DataField,
    ) -> Result<Option<String>, StorageError> {
        let redis_key = self.data_key(key);
        let mut connection = self.connection.clone();
        let raw: Option<String> = connection.hget(&redis_key, field.as_ref()).await?;
        raw.map(|raw| decode_value(&redis_key, &raw)).transpose()
    }

    async fn set_data(
        &self,
        key: ConversationKey,
        field: DataField,
        value: String,
    ) -> Result<(), StorageError> {
        let redis_key = self.data_key(key);
        let mut connection = self.connection.clone();
        let _: () = redis::pipe()
            .atomic()
            .hset(&redis_key, field.as_ref(), encode_value(&value))
            .ignore()
            .expire(&redis_key, self.expiry.as_secs() as i64)
            .ignore()
            .query_async(&mut connection)
            .await?;
        Ok(())
    }

    async fn clear_data(&self, key: ConversationKey) -> Result<(), StorageError> {
        let mut connection = self.connection.clone();
        let _: () = connection.del(self.data_key(key)).await?;
        Ok(())
    }
}
