use std::sync::Arc;

use teloxide::dispatching::{UpdateFilterExt, UpdateHandler};
use teloxide::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    commands::{cancel, help, register, start, Command},
    fsm::{IncomingMessage, Router},
    HandlerResult,
};

/// Commands go to their endpoints, every other message to the dialog router.
pub fn schema() -> UpdateHandler<Box<dyn std::error::Error + Send + Sync + 'static>> {
    use dptree::case;

    let command_handler = dptree::entry()
        .filter_command::<Command>()
        .branch(case![Command::Help].endpoint(help))
        .branch(case![Command::Start].endpoint(start))
        .branch(case![Command::Register].endpoint(register))
        .branch(case![Command::Cancel].endpoint(cancel));

    Update::filter_message()
        .branch(command_handler)
        .endpoint(process_message)
}

#[instrument(level = "debug", skip_all)]
async fn process_message(
    bot: Bot,
    msg: Message,
    router: Arc<Router>,
    shutdown: CancellationToken,
) -> HandlerResult {
    let Some(incoming) = IncomingMessage::from_message(&msg) else {
        log::debug!("Ignoring message without a sender in chat {}", msg.chat.id);
        return Ok(());
    };
    router.process(incoming, Arc::new(bot), shutdown).await?;
    Ok(())
}
