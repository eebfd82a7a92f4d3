use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::StateStorage;
use crate::errors::StorageError;
use crate::state::{ConversationData, ConversationKey, DataField, RegistrationState};

#[derive(Debug, Default)]
struct Entry {
    state: Option<RegistrationState>,
    data: ConversationData,
    // Milliseconds since the storage epoch. Atomic so reads can touch it under the read lock.
    last_access: AtomicU64,
}

impl Entry {
    fn is_empty(&self) -> bool {
        self.state.is_none() && self.data.is_empty()
    }
}

/// In-process store. Not shared between bot processes.
#[derive(Debug)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<ConversationKey, Entry>>,
    epoch: Instant,
    cleanup_interval: Duration,
}

impl MemoryStorage {
    pub fn new(cleanup_interval: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            epoch: Instant::now(),
            cleanup_interval,
        }
    }

    /// Starts the sweep that drops conversations idle for more than twice the
    /// cleanup interval. Returns `None` when the interval is zero.
    pub fn spawn_cleanup(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if self.cleanup_interval.is_zero() {
            return None;
        }

        let storage: Weak<Self> = Arc::downgrade(self);
        let period = self.cleanup_interval;

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(storage) = storage.upgrade() else {
                    break;
                };
                let purged = storage.purge_idle();
                if purged > 0 {
                    log::debug!("Purged {purged} idle conversations from memory storage");
                }
            }
        }))
    }

    /// Removes every conversation whose last access is older than twice the
    /// cleanup interval and returns how many were dropped.
    pub fn purge_idle(&self) -> usize {
        let now = self.now_millis();
        let max_idle = (self.cleanup_interval * 2).as_millis() as u64;

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| now.saturating_sub(entry.last_access.load(Ordering::Relaxed)) <= max_idle);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn read<T>(&self, key: ConversationKey, f: impl FnOnce(&Entry) -> T) -> Option<T> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(&key).map(|entry| {
            entry.last_access.store(self.now_millis(), Ordering::Relaxed);
            f(entry)
        })
    }

    fn write(&self, key: ConversationKey, f: impl FnOnce(&mut Entry)) {
        let now = self.now_millis();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(key).or_default();
        f(entry);
        entry.last_access.store(now, Ordering::Relaxed);
        if entry.is_empty() {
            entries.remove(&key);
        }
    }
}

#[async_trait]
impl StateStorage for MemoryStorage {
    async fn get(&self, key: ConversationKey) -> Result<RegistrationState, StorageError> {
        Ok(self.read(key, |entry| entry.state).flatten().unwrap_or_default())
    }

    async fn set(&self, key: ConversationKey, state: RegistrationState) -> Result<(), StorageError> {
        self.write(key, |entry| entry.state = Some(state));
        Ok(())
    }

    async fn delete(&self, key: ConversationKey) -> Result<(), StorageError> {
        self.write(key, |entry| entry.state = None);
        Ok(())
    }

    async fn get_data(
        &self,
        key: ConversationKey,
        field: DataField,
    ) -> Result<Option<String>, StorageError> {
        Ok(self
            .read(key, |entry| entry.data.get(field).map(str::to_owned))
            .flatten())
    }

    async fn set_data(
        &self,
        key: ConversationKey,
        field: DataField,
        value: String,
    ) -> Result<(), StorageError> {
        self.write(key, |entry| entry.data.set(field, value));
        Ok(())
    }

    async fn clear_data(&self, key: ConversationKey) -> Result<(), StorageError> {
        self.write(key, |entry| entry.data = ConversationData::default());
        Ok(())
    }

    async fn data(&self, key: ConversationKey) -> Result<ConversationData, StorageError> {
        Ok(self.read(key, |entry| entry.data.clone()).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const KEY: ConversationKey = ConversationKey { chat_id: 10, user_id: 20 };

    #[tokio::test]
    async fn missing_key_reads_as_start_and_absent() {
        let storage = MemoryStorage::new(Duration::ZERO);

        assert_eq!(storage.get(KEY).await.unwrap(), RegistrationState::Start);
        assert_eq!(storage.get_data(KEY, DataField::Login).await.unwrap(), None);
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn set_replaces_state() {
        let storage = MemoryStorage::new(Duration::ZERO);

        storage.set(KEY, RegistrationState::AwaitingLogin).await.unwrap();
        storage.set(KEY, RegistrationState::AwaitingOtp).await.unwrap();
        storage.set(KEY, RegistrationState::AwaitingOtp).await.unwrap();

        assert_eq!(storage.get(KEY).await.unwrap(), RegistrationState::AwaitingOtp);
    }

    #[tokio::test]
    async fn delete_and_clear_reset_the_conversation() {
        let storage = MemoryStorage::new(Duration::ZERO);
        storage.set(KEY, RegistrationState::AwaitingOtp).await.unwrap();
        storage.set_data(KEY, DataField::Login, "rct.ivanov".into()).await.unwrap();
        storage.set_data(KEY, DataField::Code, "123456".into()).await.unwrap();

        storage.delete(KEY).await.unwrap();
        assert_eq!(storage.get(KEY).await.unwrap(), RegistrationState::Start);
        assert_eq!(
            storage.get_data(KEY, DataField::Login).await.unwrap().as_deref(),
            Some("rct.ivanov")
        );

        storage.clear_data(KEY).await.unwrap();
        assert_eq!(storage.data(KEY).await.unwrap(), ConversationData::default());
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn delete_of_unknown_key_is_a_no_op() {
        let storage = MemoryStorage::new(Duration::ZERO);
        storage.delete(KEY).await.unwrap();
        storage.clear_data(KEY).await.unwrap();
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn conversations_are_isolated() {
        let storage = MemoryStorage::new(Duration::ZERO);
        let other = ConversationKey::new(10, 21);

        storage.set_data(KEY, DataField::Code, "111111".into()).await.unwrap();

        assert_eq!(storage.get_data(other, DataField::Code).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_only_idle_conversations() {
        let storage = MemoryStorage::new(Duration::from_secs(60));
        let active = ConversationKey::new(1, 1);
        storage.set(KEY, RegistrationState::AwaitingLogin).await.unwrap();
        storage.set(active, RegistrationState::AwaitingOtp).await.unwrap();

        tokio::time::advance(Duration::from_secs(100)).await;
        storage.get(active).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(storage.purge_idle(), 1);
        assert_eq!(storage.get(KEY).await.unwrap(), RegistrationState::Start);
        assert_eq!(storage.get(active).await.unwrap(), RegistrationState::AwaitingOtp);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_reaps_abandoned_dialogs() {
        let storage = Arc::new(MemoryStorage::new(Duration::from_secs(10)));
        let shutdown = CancellationToken::new();
        let handle = storage.spawn_cleanup(shutdown.clone()).unwrap();

        storage.set(KEY, RegistrationState::AwaitingOtp).await.unwrap();
        tokio::time::sleep(Duration::from_secs(35)).await;

        assert!(storage.is_empty());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn zero_interval_disables_the_sweep() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let storage = Arc::new(MemoryStorage::new(Duration::ZERO));
            assert!(storage.spawn_cleanup(CancellationToken::new()).is_none());
        });
    }
}
