use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::MigrateError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use super::user::{NewUser, User};
use super::verification::VerificationCode;
use crate::errors::RepositoryError;

pub struct Connection {
    pool: PgPool,
}

impl Connection {
    pub async fn connect(connection_string: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(connection_string)
            .await?;
        Ok(Self { pool })
    }

    /// Applies the embedded migrations. Already applied ones are skipped.
    pub async fn run_migrations(&self) -> Result<(), MigrateError> {
        sqlx::migrate!().run(&self.pool).await
    }
}

/// Registered users, keyed by login.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Inserts the user, or updates the row with the same login. Role flags
    /// are merged with the stored ones, never cleared.
    async fn update_or_create(&self, user: NewUser) -> Result<User, RepositoryError>;
}

/// One active verification code per Telegram user.
#[async_trait]
pub trait VerificationCodes: Send + Sync {
    async fn update_or_create(
        &self,
        user_id: i64,
        code: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<VerificationCode, RepositoryError>;

    async fn find_by_user_id(&self, user_id: i64) -> Result<VerificationCode, RepositoryError>;

    /// Removes the user's row only while it still holds `code`, so a newer
    /// code issued from another chat survives.
    async fn delete(&self, user_id: i64, code: &str) -> Result<(), RepositoryError>;
}

fn not_found(entity: &'static str) -> impl FnOnce(sqlx::Error) -> RepositoryError {
    move |e| match e {
        sqlx::Error::RowNotFound => RepositoryError::NotFound { entity },
        e => RepositoryError::Database(e),
    }
}

#[async_trait]
impl UserDirectory for Connection {
    async fn update_or_create(&self, user: NewUser) -> Result<User, RepositoryError> {
        log::debug!("Upserting user {}", user.login);
        let user = sqlx::query_as::<_, User>(
            "INSERT INTO users (telegram_id, login, role_flags) VALUES ($1, $2, $3) \
             ON CONFLICT (login) DO UPDATE SET \
                 telegram_id = EXCLUDED.telegram_id, \
                 role_flags = users.role_flags | EXCLUDED.role_flags, \
                 updated_at = NOW() \
             RETURNING id, telegram_id, login, role_flags, created_at, updated_at",
        )
        .bind(user.telegram_id)
        .bind(&user.login)
        .bind(user.role)
        .fetch_one(&self.pool)
        .await?;

        Ok(user)
    }
}

#[async_trait]
impl VerificationCodes for Connection {
    async fn update_or_create(
        &self,
        user_id: i64,
        code: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<VerificationCode, RepositoryError> {
        let record = sqlx::query_as::<_, VerificationCode>(
            "INSERT INTO verification_codes (id, user_id, code, expires_at) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (user_id) DO UPDATE SET \
                 code = EXCLUDED.code, \
                 expires_at = EXCLUDED.expires_at, \
                 created_at = NOW() \
             RETURNING id, user_id, code, expires_at, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(code)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_by_user_id(&self, user_id: i64) -> Result<VerificationCode, RepositoryError> {
        sqlx::query_as::<_, VerificationCode>(
            "SELECT id, user_id, code, expires_at, created_at FROM verification_codes WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(not_found("verification code"))
    }

    async fn delete(&self, user_id: i64, code: &str) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM verification_codes WHERE user_id = $1 AND code = $2")
            .bind(user_id)
            .bind(code)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
