pub mod commands;
pub mod config;
pub mod database;
pub mod email;
pub mod errors;
pub mod fsm;
pub mod keyboard;
pub mod messenger;
pub mod otp;
pub mod registration;
pub mod schema;
pub mod shutdown;
pub mod state;
pub mod storage;

#[cfg(test)]
mod testing;

pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync + 'static>>;
