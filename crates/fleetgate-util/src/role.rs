//! Operator roles
//!
//! Roles form a closed set so the access policy can dispatch with an
//! exhaustive match instead of string comparison.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role of an identity. Ordering here has no meaning; the policy
/// decides what each role may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    Technician,
    /// Freshly registered devices land here and are denied everything
    /// until an administrator elevates them.
    Pending,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Technician => "technician",
            Role::Pending => "pending",
        }
    }

    /// Parse a stored role string. Unrecognized values map to
    /// `Pending`, which the policy denies, so a corrupted or
    /// hand-edited row can never widen anyone's access.
    pub fn from_stored(s: &str) -> Self {
        s.parse().unwrap_or_else(|_| {
            tracing::warn!(role = s, "Unrecognized stored role, treating as pending");
            Role::Pending
        })
    }
}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "manager" => Ok(Role::Manager),
            "technician" => Ok(Role::Technician),
            "pending" => Ok(Role::Pending),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// Error for role strings outside the closed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRole(pub String);

impl fmt::Display for UnknownRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown role: {}", self.0)
    }
}

impl std::error::Error for UnknownRole {}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
