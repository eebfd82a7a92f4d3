use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

/// Identifies one in-flight dialog: the chat it happens in and the user talking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    pub chat_id: i64,
    pub user_id: i64,
}

impl ConversationKey {
    pub fn new(chat_id: i64, user_id: i64) -> Self {
        Self { chat_id, user_id }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chat_id, self.user_id)
    }
}

/// Steps of the registration dialog. A key without a stored state is in `Start`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum RegistrationState {
    #[default]
    Start,
    AwaitingLogin,
    AwaitingOtp,
    Registered,
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Fields a dialog may keep between messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum DataField {
    Login,
    Code,
}

/// Scratch data carried across the login and OTP steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationData {
    pub login: Option<String>,
    pub code: Option<String>,
}

impl ConversationData {
    pub fn get(&self, field: DataField) -> Option<&str> {
        match field {
            DataField::Login => self.login.as_deref(),
            DataField::Code => self.code.as_deref(),
        }
    }

    pub fn set(&mut self, field: DataField, value: String) {
        match field {
            DataField::Login => self.login = Some(value),
            DataField::Code => self.code = Some(value),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.login.is_none() && self.code.is_none()
    }
}
