//! Record types for the four persisted entities

use chrono::{DateTime, Utc};
use fleetgate_util::{AssignmentId, IdentityId, MachineId, Role, SessionId};
use serde::{Deserialize, Serialize};

/// A person or device account capable of authenticating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: IdentityId,

    /// Unique login handle.
    pub handle: String,

    /// Argon2id PHC-format hash of the secret. `None` means no
    /// credential login is possible (freshly registered devices stay
    /// in this state until an administrator sets a secret).
    #[serde(skip_serializing, default)]
    pub secret_hash: Option<String>,

    pub role: Role,

    /// Bound device identifier, unique across all identities.
    pub device_id: Option<String>,
}

/// Fields for creating an identity.
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub handle: String,
    pub secret_hash: Option<String>,
    pub role: Role,
    pub device_id: Option<String>,
}

/// Partial update to an identity. Outer `None` leaves a field
/// untouched; for the optional fields, `Some(None)` clears the value.
#[derive(Debug, Clone, Default)]
pub struct IdentityChanges {
    pub role: Option<Role>,
    pub secret_hash: Option<Option<String>>,
    pub device_id: Option<Option<String>>,
}

/// A physical machine, identified primarily by its hardware
/// (Bluetooth) address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineRecord {
    pub id: MachineId,
    pub name: String,
    pub hw_address: String,
    pub friendly_name: Option<String>,

    /// Inactive machines are hidden from listings but keep their
    /// historical sessions.
    pub active: bool,
}

/// Fields for creating a machine.
#[derive(Debug, Clone)]
pub struct NewMachine {
    pub name: String,
    pub hw_address: String,
    pub friendly_name: Option<String>,
    pub active: bool,
}

/// A grant of usage rights from one identity to one machine.
/// Duplicates are allowed; a grant is valid from `starts_at` until
/// `ends_at` (or forever when `ends_at` is absent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub id: AssignmentId,
    pub identity_id: IdentityId,
    pub machine_id: MachineId,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
}

/// Fields for creating an assignment.
#[derive(Debug, Clone)]
pub struct NewAssignment {
    pub identity_id: IdentityId,
    pub machine_id: MachineId,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
}

/// One recorded interval of machine usage. Open while `ended_at` is
/// absent; closed exactly once, which also fixes `duration_minutes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub identity_id: IdentityId,
    pub machine_id: MachineId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i64>,
}

impl SessionRecord {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Fields for opening a session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub identity_id: IdentityId,
    pub machine_id: MachineId,
    pub started_at: DateTime<Utc>,
}
