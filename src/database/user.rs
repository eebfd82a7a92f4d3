use std::fmt;
use std::ops::BitOr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role flags stored in `users.role_flags`. Flags combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct Role(i64);

impl Role {
    pub const NONE: Role = Role(0);
    pub const USER: Role = Role(1);
    pub const ADMIN: Role = Role(1 << 1);
    pub const TEACHER: Role = Role(1 << 2);
    pub const BLOCKED: Role = Role(1 << 3);

    const NAMED: [(Role, &'static str); 4] = [
        (Role::USER, "User"),
        (Role::ADMIN, "Admin"),
        (Role::TEACHER, "Teacher"),
        (Role::BLOCKED, "Blocked"),
    ];

    pub fn bits(self) -> i64 {
        self.0
    }

    /// True when every flag of `other` is set.
    pub fn contains(self, other: Role) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when at least one flag of `other` is set.
    pub fn intersects(self, other: Role) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Role) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Role) {
        self.0 &= !other.0;
    }

    pub fn names(self) -> Vec<&'static str> {
        Self::NAMED
            .iter()
            .filter(|(role, _)| self.contains(*role))
            .map(|(_, name)| *name)
            .collect()
    }

    pub fn is_blocked(self) -> bool {
        self.contains(Role::BLOCKED)
    }

    pub fn can_create_quiz(self) -> bool {
        !self.is_blocked() && self.intersects(Role::ADMIN | Role::TEACHER)
    }

    pub fn can_manage_users(self) -> bool {
        self.contains(Role::ADMIN)
    }
}

impl BitOr for Role {
    type Output = Role;

    fn bitor(self, rhs: Role) -> Role {
        Role(self.0 | rhs.0)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.names().join(", "))
    }
}

/// A registered platform user.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub telegram_id: i64,
    pub login: String,
    #[sqlx(rename = "role_flags")]
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "User[{}, {}, Roles: {}]", self.id, self.login, self.role)
    }
}

/// Fields supplied when registering; the directory assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub telegram_id: i64,
    pub login: String,
    pub role: Role,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn flags_combine_and_split() {
        let mut role = Role::USER | Role::TEACHER;
        assert!(role.contains(Role::USER));
        assert!(role.contains(Role::TEACHER));
        assert!(!role.contains(Role::USER | Role::ADMIN));
        assert!(role.intersects(Role::USER | Role::ADMIN));

        role.insert(Role::ADMIN);
        role.remove(Role::USER);
        assert_eq!(role.bits(), 6);
        assert_eq!(role.names(), vec!["Admin", "Teacher"]);
    }

    #[test]
    fn blocked_users_cannot_create_quizzes() {
        assert!(Role::TEACHER.can_create_quiz());
        assert!(Role::ADMIN.can_create_quiz());
        assert!(!Role::USER.can_create_quiz());
        assert!(!(Role::TEACHER | Role::BLOCKED).can_create_quiz());
        assert!(Role::ADMIN.can_manage_users());
        assert!(!Role::TEACHER.can_manage_users());
    }

    #[test]
    fn role_display_lists_names() {
        assert_eq!((Role::USER | Role::BLOCKED).to_string(), "[User, Blocked]");
        assert_eq!(Role::NONE.to_string(), "[]");
    }
}
