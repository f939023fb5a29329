//! Permission model
//!
//! The mutation queue asks a [`Permissions`] collaborator before accepting a
//! write. [`Session`] is the stock implementation: an explicit value carrying
//! the acting user and their [`Role`], passed into every enqueue call.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Actions a role may be granted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    View,
    Add,
    Edit,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::View => "view",
            Action::Add => "add",
            Action::Edit => "edit",
            Action::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Answers whether the acting user may perform an action
pub trait Permissions {
    fn has_permission(&self, action: Action) -> bool;
}

/// User roles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Every action
    Admin,
    /// View and add only
    #[default]
    Employee,
}

impl Permissions for Role {
    fn has_permission(&self, action: Action) -> bool {
        match self {
            Role::Admin => true,
            Role::Employee => matches!(action, Action::View | Action::Add),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Admin => f.write_str("admin"),
            Role::Employee => f.write_str("employee"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "employee" => Ok(Role::Employee),
            other => Err(format!("unknown role '{}' (expected admin or employee)", other)),
        }
    }
}

/// The acting user, passed explicitly instead of read from ambient state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user: String,
    pub role: Role,
}

impl Session {
    pub fn new(user: impl Into<String>, role: Role) -> Self {
        Self {
            user: user.into(),
            role,
        }
    }
}

impl Permissions for Session {
    fn has_permission(&self, action: Action) -> bool {
        self.role.has_permission(action)
    }
}
