pub mod connection;
pub mod user;
pub mod verification;
