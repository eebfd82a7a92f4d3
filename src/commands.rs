use std::sync::Arc;

use teloxide::{
    payloads::SendMessageSetters, prelude::Requester, types::Message, utils::command::BotCommands,
    Bot,
};
use tokio_util::sync::CancellationToken;

use crate::{
    fsm::{IncomingMessage, Router},
    keyboard::start_keyboard,
    registration::Registration,
    HandlerResult,
};

pub const WELCOME: &str = "Welcome to the quiz platform! Register with your university login to take part in quizzes.";
pub const CANCELLED: &str = "Cancelled. Send /register to start again.";

#[derive(Debug, Clone, BotCommands)]
#[command(rename_rule = "lowercase", description = "These commands are supported:")]
pub enum Command {
    #[command(description = "display this text.")]
    Help,
    #[command(description = "start the bot.")]
    Start,
    #[command(description = "register with your university login.")]
    Register,
    #[command(description = "cancel the current dialog.")]
    Cancel,
}

pub(crate) async fn help(bot: Bot, msg: Message) -> HandlerResult {
    bot.send_message(msg.chat.id, Command::descriptions().to_string())
        .await?;
    Ok(())
}

pub(crate) async fn start(bot: Bot, msg: Message) -> HandlerResult {
    bot.send_message(msg.chat.id, WELCOME)
        .reply_markup(start_keyboard())
        .await?;
    Ok(())
}

pub(crate) async fn register(
    bot: Bot,
    msg: Message,
    router: Arc<Router>,
    registration: Arc<Registration>,
    shutdown: CancellationToken,
) -> HandlerResult {
    let Some(incoming) = IncomingMessage::from_message(&msg) else {
        return Ok(());
    };
    let conversation = router.enter(incoming.key(), shutdown).await;
    log::info!("{}: /register", incoming.key());
    registration
        .begin(conversation.context(), incoming.chat_id, &bot)
        .await?;
    Ok(())
}

pub(crate) async fn cancel(
    bot: Bot,
    msg: Message,
    router: Arc<Router>,
    shutdown: CancellationToken,
) -> HandlerResult {
    let Some(incoming) = IncomingMessage::from_message(&msg) else {
        return Ok(());
    };
    let conversation = router.enter(incoming.key(), shutdown).await;
    conversation.context().finish().await?;
    log::info!("{}: dialog cancelled by user", incoming.key());
    bot.send_message(msg.chat.id, CANCELLED).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_in_lowercase() {
        assert!(matches!(Command::parse("/register", "quizbot"), Ok(Command::Register)));
        assert!(matches!(Command::parse("/cancel", "quizbot"), Ok(Command::Cancel)));
        assert!(Command::parse("/quiz", "quizbot").is_err());
    }

    #[test]
    fn help_lists_every_command() {
        let help = Command::descriptions().to_string();
        for command in ["/help", "/start", "/register", "/cancel"] {
            assert!(help.contains(command), "{command} missing from {help}");
        }
    }
}
