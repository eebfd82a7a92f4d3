//! Dialog routing.
//!
//! [`Router`] maps each [`RegistrationState`] to a handler and dispatches
//! incoming messages to the handler for the sender's current state. Every
//! dispatch for a conversation runs under that conversation's lock, so at
//! most one handler is in flight per (chat, user) pair.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::errors::{DialogError, Recovery, StorageError};
use crate::messenger::Messenger;
use crate::state::{ConversationData, ConversationKey, DataField, RegistrationState};
use crate::storage::StateStorage;

pub const HOLD_MESSAGE: &str = "Something went wrong on our side. Please try again in a moment.";
pub const RESET_MESSAGE: &str =
    "Something went wrong with this conversation. Please start again with /register.";

pub type BoxedHandler = Arc<
    dyn Fn(FsmContext, IncomingMessage, Arc<dyn Messenger>) -> BoxFuture<'static, Result<(), DialogError>>
        + Send
        + Sync,
>;

/// A text message as the dialog sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub chat_id: i64,
    pub user_id: i64,
    pub text: Option<String>,
    pub username: Option<String>,
}

impl IncomingMessage {
    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(self.chat_id, self.user_id)
    }

    /// `None` for messages without a sender, e.g. channel posts.
    pub fn from_message(msg: &teloxide::types::Message) -> Option<Self> {
        let user = msg.from.as_ref()?;
        Some(Self {
            chat_id: msg.chat.id.0,
            user_id: user.id.0 as i64,
            text: msg.text().map(str::to_owned),
            username: user.username.clone(),
        })
    }
}

/// Handle on one conversation's state, bound to its key.
#[derive(Clone)]
pub struct FsmContext {
    storage: Arc<dyn StateStorage>,
    key: ConversationKey,
    cancel: CancellationToken,
}

impl FsmContext {
    pub fn new(storage: Arc<dyn StateStorage>, key: ConversationKey, cancel: CancellationToken) -> Self {
        Self { storage, key, cancel }
    }

    pub fn key(&self) -> ConversationKey {
        self.key
    }

    pub async fn current(&self) -> Result<RegistrationState, StorageError> {
        self.storage.get(self.key).await
    }

    pub async fn set(&self, state: RegistrationState) -> Result<(), StorageError> {
        log::debug!("{}: -> {}", self.key, state);
        self.storage.set(self.key, state).await
    }

    /// Drops both the state and the scratch data.
    pub async fn finish(&self) -> Result<(), StorageError> {
        self.storage.delete(self.key).await?;
        self.storage.clear_data(self.key).await
    }

    pub async fn get_data(&self, field: DataField) -> Result<Option<String>, StorageError> {
        self.storage.get_data(self.key, field).await
    }

    pub async fn set_data(&self, field: DataField, value: impl Into<String>) -> Result<(), StorageError> {
        self.storage.set_data(self.key, field, value.into()).await
    }

    pub async fn clear_data(&self) -> Result<(), StorageError> {
        self.storage.clear_data(self.key).await
    }

    pub async fn data(&self) -> Result<ConversationData, StorageError> {
        self.storage.data(self.key).await
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Registry of per-conversation locks. An entry lives only while someone
/// holds or waits for it.
#[derive(Clone, Default)]
pub struct ConversationLocks {
    inner: Arc<DashMap<ConversationKey, Arc<Mutex<()>>>>,
}

impl ConversationLocks {
    pub async fn acquire(&self, key: ConversationKey) -> ConversationGuard {
        let lock = self.inner.entry(key).or_default().clone();
        let guard = lock.lock_owned().await;
        ConversationGuard {
            key,
            guard: Some(guard),
            locks: self.inner.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

pub struct ConversationGuard {
    key: ConversationKey,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<ConversationKey, Arc<Mutex<()>>>>,
}

impl Drop for ConversationGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// A locked conversation. The lock is released on drop.
pub struct Conversation {
    context: FsmContext,
    _guard: ConversationGuard,
}

impl Conversation {
    pub fn context(&self) -> &FsmContext {
        &self.context
    }
}

pub struct Router {
    storage: Arc<dyn StateStorage>,
    handlers: HashMap<RegistrationState, BoxedHandler>,
    default_handler: Option<BoxedHandler>,
    locks: ConversationLocks,
}

fn boxed<F, Fut>(handler: F) -> BoxedHandler
where
    F: Fn(FsmContext, IncomingMessage, Arc<dyn Messenger>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DialogError>> + Send + 'static,
{
    Arc::new(move |ctx, msg, messenger| handler(ctx, msg, messenger).boxed())
}

impl Router {
    pub fn new(storage: Arc<dyn StateStorage>) -> Self {
        Self {
            storage,
            handlers: HashMap::new(),
            default_handler: None,
            locks: ConversationLocks::default(),
        }
    }

    /// Replaces any handler already registered for `state`.
    pub fn register<F, Fut>(&mut self, state: RegistrationState, handler: F) -> &mut Self
    where
        F: Fn(FsmContext, IncomingMessage, Arc<dyn Messenger>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DialogError>> + Send + 'static,
    {
        self.handlers.insert(state, boxed(handler));
        self
    }

    /// Handler for states without their own handler and for non-text messages.
    pub fn default_message<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(FsmContext, IncomingMessage, Arc<dyn Messenger>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DialogError>> + Send + 'static,
    {
        self.default_handler = Some(boxed(handler));
        self
    }

    pub fn locks(&self) -> &ConversationLocks {
        &self.locks
    }

    /// Waits for the conversation's lock.
    pub async fn enter(&self, key: ConversationKey, cancel: CancellationToken) -> Conversation {
        let guard = self.locks.acquire(key).await;
        Conversation {
            context: FsmContext::new(self.storage.clone(), key, cancel),
            _guard: guard,
        }
    }

    #[tracing::instrument(skip_all, fields(key = %msg.key()))]
    pub async fn process(
        &self,
        msg: IncomingMessage,
        messenger: Arc<dyn Messenger>,
        cancel: CancellationToken,
    ) -> Result<(), DialogError> {
        let conversation = self.enter(msg.key(), cancel).await;
        let ctx = conversation.context().clone();
        let chat_id = msg.chat_id;

        let handler = if msg.text.is_none() {
            self.default_handler.clone()
        } else {
            let state = match ctx.current().await {
                Ok(state) => state,
                Err(e) => return recover(&ctx, chat_id, messenger.as_ref(), e.into()).await,
            };
            log::debug!("{}: dispatching in state {}", ctx.key(), state);
            match self.handlers.get(&state).or(self.default_handler.as_ref()) {
                Some(handler) => Some(handler.clone()),
                None => {
                    let err = DialogError::NoHandler(state.to_string());
                    return recover(&ctx, chat_id, messenger.as_ref(), err).await;
                }
            }
        };

        let Some(handler) = handler else {
            log::debug!("{}: ignoring message without text", ctx.key());
            return Ok(());
        };

        match handler(ctx.clone(), msg, messenger.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => recover(&ctx, chat_id, messenger.as_ref(), e).await,
        }
    }
}

/// Applies the error's recovery policy, tells the user, and hands the error back.
async fn recover(
    ctx: &FsmContext,
    chat_id: i64,
    messenger: &dyn Messenger,
    err: DialogError,
) -> Result<(), DialogError> {
    if matches!(err, DialogError::Cancelled) {
        log::info!("{}: dialog cancelled", ctx.key());
        return Err(err);
    }

    let reply = match err.recovery() {
        Recovery::Reset => {
            log::error!("{}: resetting conversation: {err}", ctx.key());
            if let Err(e) = ctx.finish().await {
                log::error!("{}: failed to reset conversation: {e}", ctx.key());
            }
            RESET_MESSAGE
        }
        Recovery::Hold => {
            log::warn!("{}: handler failed, keeping state: {err}", ctx.key());
            HOLD_MESSAGE
        }
    };

    if let Err(e) = messenger.send_text(chat_id, reply).await {
        log::warn!("{}: failed to notify user: {e}", ctx.key());
    }
    Err(err)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::storage::MemoryStorage;
    use crate::testing::RecordingMessenger;

    fn text(user_id: i64, text: &str) -> IncomingMessage {
        IncomingMessage {
            chat_id: 10,
            user_id,
            text: Some(text.into()),
            username: None,
        }
    }

    fn storage() -> Arc<dyn StateStorage> {
        Arc::new(MemoryStorage::new(Duration::ZERO))
    }

    #[tokio::test]
    async fn dispatches_on_current_state() {
        let storage = storage();
        let mut router = Router::new(storage.clone());
        router.register(RegistrationState::AwaitingLogin, |ctx, msg, _| async move {
            ctx.set_data(DataField::Login, msg.text.unwrap_or_default()).await?;
            ctx.set(RegistrationState::AwaitingOtp).await?;
            Ok::<(), DialogError>(())
        });

        let key = ConversationKey::new(10, 1);
        storage.set(key, RegistrationState::AwaitingLogin).await.unwrap();
        let messenger = Arc::new(RecordingMessenger::default());

        router
            .process(text(1, "rct.ivanov"), messenger, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(storage.get(key).await.unwrap(), RegistrationState::AwaitingOtp);
        assert_eq!(
            storage.get_data(key, DataField::Login).await.unwrap().as_deref(),
            Some("rct.ivanov")
        );
    }

    #[tokio::test]
    async fn falls_back_to_default_handler() {
        let mut router = Router::new(storage());
        router.default_message(|_, msg, messenger: Arc<dyn Messenger>| async move {
            messenger.send_text(msg.chat_id, "fallback").await?;
            Ok::<(), DialogError>(())
        });
        let messenger = Arc::new(RecordingMessenger::default());

        router
            .process(text(1, "hello"), messenger.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(messenger.texts(), vec!["fallback".to_string()]);
    }

    #[tokio::test]
    async fn missing_handler_fails_loudly_and_resets() {
        let storage = storage();
        let router = Router::new(storage.clone());
        let key = ConversationKey::new(10, 1);
        storage.set(key, RegistrationState::AwaitingOtp).await.unwrap();
        let messenger = Arc::new(RecordingMessenger::default());

        let err = router
            .process(text(1, "123456"), messenger.clone(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DialogError::NoHandler(ref state) if state == "awaiting_otp"));
        assert_eq!(storage.get(key).await.unwrap(), RegistrationState::Start);
        assert_eq!(messenger.texts(), vec![RESET_MESSAGE.to_string()]);
    }

    #[tokio::test]
    async fn missing_data_resets_while_infrastructure_errors_hold() {
        let storage = storage();
        let mut router = Router::new(storage.clone());
        router
            .register(RegistrationState::AwaitingOtp, |_, _, _| async {
                Err::<(), _>(DialogError::MissingData("code"))
            })
            .register(RegistrationState::Registered, |_, _, _| async {
                Err::<(), _>(DialogError::Email(crate::errors::EmailError::Timeout(15)))
            });
        let messenger = Arc::new(RecordingMessenger::default());
        let (otp, registered) = (ConversationKey::new(10, 1), ConversationKey::new(10, 2));
        storage.set(otp, RegistrationState::AwaitingOtp).await.unwrap();
        storage.set(registered, RegistrationState::Registered).await.unwrap();

        assert!(router
            .process(text(1, "123456"), messenger.clone(), CancellationToken::new())
            .await
            .is_err());
        assert!(router
            .process(text(2, "hi"), messenger.clone(), CancellationToken::new())
            .await
            .is_err());

        assert_eq!(storage.get(otp).await.unwrap(), RegistrationState::Start);
        assert_eq!(storage.get(registered).await.unwrap(), RegistrationState::Registered);
        assert_eq!(
            messenger.texts(),
            vec![RESET_MESSAGE.to_string(), HOLD_MESSAGE.to_string()]
        );
    }

    #[tokio::test]
    async fn non_text_messages_go_to_default_without_reading_state() {
        let storage = storage();
        let mut router = Router::new(storage.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        router
            .register(RegistrationState::Start, |_, _, _| async {
                Err::<(), _>(DialogError::MissingData("login"))
            })
            .default_message(move |_, _, _| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), DialogError>(())
                }
            });

        let mut sticker = text(1, "");
        sticker.text = None;
        router
            .process(sticker, Arc::new(RecordingMessenger::default()), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_conversation_is_serialized() {
        let storage = storage();
        let mut router = Router::new(storage.clone());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let (a, b) = (in_flight.clone(), max_seen.clone());
        router.default_message(move |_, _, _| {
            let (in_flight, max_seen) = (a.clone(), b.clone());
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<(), DialogError>(())
            }
        });
        let router = Arc::new(router);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let router = router.clone();
                tokio::spawn(async move {
                    router
                        .process(
                            text(1, "hi"),
                            Arc::new(RecordingMessenger::default()),
                            CancellationToken::new(),
                        )
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(router.locks().is_empty());
    }

    #[tokio::test]
    async fn locks_are_released_and_dropped() {
        let locks = ConversationLocks::default();
        let key = ConversationKey::new(1, 1);

        let first = locks.acquire(key).await;
        assert_eq!(locks.len(), 1);

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _second = locks.acquire(key).await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn other_conversations_are_not_blocked() {
        let locks = ConversationLocks::default();
        let _held = locks.acquire(ConversationKey::new(1, 1)).await;

        let other = tokio::time::timeout(
            Duration::from_secs(1),
            locks.acquire(ConversationKey::new(1, 2)),
        )
        .await;

        assert!(other.is_ok());
    }
}
