use async_trait::async_trait;
use teloxide::payloads::SendMessageSetters;
use teloxide::prelude::Requester;
use teloxide::types::{ChatId, ParseMode};
use teloxide::{Bot, RequestError};

/// Outgoing side of a conversation.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), RequestError>;

    /// `text` is Telegram HTML.
    async fn send_html(&self, chat_id: i64, text: &str) -> Result<(), RequestError>;
}

#[async_trait]
impl Messenger for Bot {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), RequestError> {
        self.send_message(ChatId(chat_id), text).await?;
        Ok(())
    }

    async fn send_html(&self, chat_id: i64, text: &str) -> Result<(), RequestError> {
        self.send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html)
            .await?;
        Ok(())
    }
}
