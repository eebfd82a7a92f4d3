//! In-memory stand-ins for the bot's collaborators.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use teloxide::RequestError;

use crate::database::connection::{UserDirectory, VerificationCodes};
use crate::database::user::{NewUser, User};
use crate::database::verification::VerificationCode;
use crate::email::VerificationMailer;
use crate::errors::{EmailError, OtpError, RepositoryError};
use crate::messenger::Messenger;
use crate::otp::CodeGenerator;

#[derive(Default)]
pub struct RecordingMessenger {
    sent: Mutex<Vec<(i64, String)>>,
}

impl RecordingMessenger {
    pub fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, text)| text.clone()).collect()
    }

    pub fn last(&self) -> Option<String> {
        self.sent.lock().unwrap().last().map(|(_, text)| text.clone())
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), RequestError> {
        self.sent.lock().unwrap().push((chat_id, text.to_owned()));
        Ok(())
    }

    async fn send_html(&self, chat_id: i64, text: &str) -> Result<(), RequestError> {
        self.send_text(chat_id, text).await
    }
}

/// Upserts by login like the SQL implementation and counts what it did.
#[derive(Default)]
pub struct FakeDirectory {
    users: Mutex<HashMap<String, User>>,
    next_id: AtomicI64,
    pub inserts: AtomicUsize,
    pub updates: AtomicUsize,
}

impl FakeDirectory {
    pub fn get(&self, login: &str) -> Option<User> {
        self.users.lock().unwrap().get(login).cloned()
    }

    pub fn len(&self) -> usize {
        self.users.lock().unwrap().len()
    }

    pub fn insert_count(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UserDirectory for FakeDirectory {
    async fn update_or_create(&self, user: NewUser) -> Result<User, RepositoryError> {
        let mut users = self.users.lock().unwrap();
        let now = Utc::now();
        match users.get_mut(&user.login) {
            Some(existing) => {
                existing.telegram_id = user.telegram_id;
                existing.role = existing.role | user.role;
                existing.updated_at = now;
                self.updates.fetch_add(1, Ordering::SeqCst);
                Ok(existing.clone())
            }
            None => {
                let created = User {
                    id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
                    telegram_id: user.telegram_id,
                    login: user.login.clone(),
                    role: user.role,
                    created_at: now,
                    updated_at: now,
                };
                users.insert(user.login, created.clone());
                self.inserts.fetch_add(1, Ordering::SeqCst);
                Ok(created)
            }
        }
    }
}

#[derive(Default)]
pub struct FakeCodes {
    records: Mutex<HashMap<i64, VerificationCode>>,
}

impl FakeCodes {
    pub fn get(&self, user_id: i64) -> Option<VerificationCode> {
        self.records.lock().unwrap().get(&user_id).cloned()
    }

    /// Moves the user's code deadline into the past.
    pub fn expire(&self, user_id: i64) {
        if let Some(record) = self.records.lock().unwrap().get_mut(&user_id) {
            record.expires_at = Utc::now() - Duration::minutes(1);
        }
    }
}

#[async_trait]
impl VerificationCodes for FakeCodes {
    async fn update_or_create(
        &self,
        user_id: i64,
        code: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<VerificationCode, RepositoryError> {
        let record = VerificationCode::new(user_id, code, expires_at);
        self.records.lock().unwrap().insert(user_id, record.clone());
        Ok(record)
    }

    async fn find_by_user_id(&self, user_id: i64) -> Result<VerificationCode, RepositoryError> {
        self.get(user_id)
            .ok_or(RepositoryError::NotFound { entity: "verification code" })
    }

    async fn delete(&self, user_id: i64, code: &str) -> Result<(), RepositoryError> {
        let mut records = self.records.lock().unwrap();
        if records.get(&user_id).is_some_and(|record| record.code == code) {
            records.remove(&user_id);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub local_part: String,
    pub subject: String,
    pub code: String,
}

#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<SentMail>>,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl VerificationMailer for RecordingMailer {
    async fn send(
        &self,
        local_part: &str,
        subject: &str,
        code: &str,
        _expires_at: DateTime<Utc>,
    ) -> Result<(), EmailError> {
        self.sent.lock().unwrap().push(SentMail {
            local_part: local_part.to_owned(),
            subject: subject.to_owned(),
            code: code.to_owned(),
        });
        Ok(())
    }
}

pub struct FailingMailer;

#[async_trait]
impl VerificationMailer for FailingMailer {
    async fn send(&self, _: &str, _: &str, _: &str, _: DateTime<Utc>) -> Result<(), EmailError> {
        Err(EmailError::Transport("connection refused".into()))
    }
}

/// Always hands out the same code.
pub struct FixedCodeGenerator(pub &'static str);

impl CodeGenerator for FixedCodeGenerator {
    fn generate(&self) -> Result<String, OtpError> {
        Ok(self.0.to_owned())
    }
}

/// Hands out the given codes in order.
pub struct SequenceCodeGenerator(Mutex<VecDeque<&'static str>>);

impl SequenceCodeGenerator {
    pub fn new(codes: impl IntoIterator<Item = &'static str>) -> Self {
        Self(Mutex::new(codes.into_iter().collect()))
    }
}

impl CodeGenerator for SequenceCodeGenerator {
    fn generate(&self) -> Result<String, OtpError> {
        let code = self.0.lock().unwrap().pop_front().expect("code sequence exhausted");
        Ok(code.to_owned())
    }
}
