use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use teloxide::error_handlers::LoggingErrorHandler;
use teloxide::prelude::*;
use teloxide::update_listeners::webhooks::{self, Options};
use teloxide::utils::command::BotCommands;
use tokio_util::sync::CancellationToken;
use tracing_log::LogTracer;
use tracing_subscriber::EnvFilter;

use quizregbot::commands::Command;
use quizregbot::config::{Config, Environment, StateBackend, DEFAULT_CONFIG_PATH};
use quizregbot::database::connection::Connection;
use quizregbot::email::EmailService;
use quizregbot::fsm::Router;
use quizregbot::otp::DigitCodeGenerator;
use quizregbot::registration::{Registration, Settings};
use quizregbot::schema::schema;
use quizregbot::shutdown;
use quizregbot::storage::{MemoryStorage, RedisStorage, StateStorage};

#[derive(Debug, Parser)]
#[command(version, about = "Telegram registration bot of the quiz platform")]
struct Args {
    /// YAML configuration file.
    #[arg(short, long, env = "CONFIG_PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = Config::load(Some(&config_path)).context("failed to load configuration")?;
    init_tracing(config.env)?;
    log::info!("Loaded configuration from {}", config_path.display());

    let shutdown = CancellationToken::new();

    let connection = Connection::connect(&config.database.url, config.database.max_connections)
        .await
        .context("failed to connect to the database")?;
    connection
        .run_migrations()
        .await
        .context("failed to run database migrations")?;
    let connection = Arc::new(connection);

    let storage: Arc<dyn StateStorage> = match config.state_store.backend {
        StateBackend::Memory => {
            let storage = Arc::new(MemoryStorage::new(config.state_store.cleanup_interval()));
            storage.spawn_cleanup(shutdown.clone());
            storage
        }
        StateBackend::Redis => {
            let url = config
                .state_store
                .redis_url
                .as_deref()
                .context("state_store.redis_url is not set")?;
            let storage = RedisStorage::connect(
                url,
                config.state_store.key_prefix.clone(),
                config.state_store.expiry(),
            )
            .await
            .context("failed to connect to redis")?;
            storage.ping().await.context("redis did not answer PING")?;
            Arc::new(storage)
        }
    };
    log::info!("Using {:?} state store", config.state_store.backend);

    let mailer = EmailService::from_config(config.email.clone())
        .context("failed to set up email delivery")?;
    let registration = Arc::new(Registration::new(
        connection.clone(),
        connection,
        Arc::new(mailer),
        Arc::new(DigitCodeGenerator::new(config.registration.code_length)),
        Settings::from_config(&config),
    ));
    let mut router = Router::new(storage);
    registration.install(&mut router);
    let router = Arc::new(router);

    let bot = Bot::new(config.bot.token.clone());
    bot.set_my_commands(Command::bot_commands())
        .await
        .context("failed to publish bot commands")?;
    log::info!("Starting bot...");

    let mut dispatcher = Dispatcher::builder(bot.clone(), schema())
        .dependencies(dptree::deps![router, registration, shutdown.clone()])
        .build();

    let dispatcher_token = dispatcher.shutdown_token();
    tokio::spawn(shutdown::cancel_then_stop(
        shutdown::signal(),
        shutdown.clone(),
        move || async move {
            match dispatcher_token.shutdown() {
                Ok(stopped) => stopped.await,
                Err(_) => log::warn!("Shutdown requested before the dispatcher started"),
            }
        },
    ));

    match (config.bot.webhook_url.clone(), config.bot.webhook_addr) {
        (Some(url), Some(addr)) => {
            log::info!("Listening for webhook updates on {addr}");
            let listener = webhooks::axum(bot, Options::new(addr, url))
                .await
                .context("failed to set up the webhook listener")?;
            dispatcher
                .dispatch_with_listener(
                    listener,
                    LoggingErrorHandler::with_custom_text("An error from the update listener"),
                )
                .await;
        }
        _ => dispatcher.dispatch().await,
    }

    shutdown.cancel();
    log::info!("Bot stopped");
    Ok(())
}

fn init_tracing(env: Environment) -> anyhow::Result<()> {
    let default_level = match env {
        Environment::Local | Environment::Dev => "debug",
        Environment::Prod => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_line_number(true)
        .with_target(false);

    match env {
        Environment::Local => tracing::subscriber::set_global_default(builder.pretty().finish()),
        Environment::Dev | Environment::Prod => {
            tracing::subscriber::set_global_default(builder.json().finish())
        }
    }
    .context("failed to install the tracing subscriber")?;
    LogTracer::init().context("failed to bridge log records into tracing")?;
    Ok(())
}
