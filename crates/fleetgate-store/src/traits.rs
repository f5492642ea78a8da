//! Store trait definitions

use chrono::{DateTime, Utc};
use fleetgate_util::{IdentityId, MachineId, SessionId};

use crate::{
    AssignmentRecord, IdentityChanges, IdentityRecord, MachineRecord, NewAssignment, NewIdentity,
    NewMachine, NewSession, SessionRecord, StoreResult,
};

/// Main store trait. The core engine receives a handle to an
/// implementation of this trait; it never touches storage directly.
///
/// Implementations must make each method atomic with respect to the
/// others: the guarded session insert and the conditional close are the
/// read-then-write operations the session invariants depend on.
pub trait Store: Send + Sync {
    // Identities

    /// Insert a new identity. Fails with `Conflict` on a duplicate
    /// handle or device identifier.
    fn insert_identity(&self, new: &NewIdentity) -> StoreResult<IdentityRecord>;

    fn identity_by_id(&self, id: IdentityId) -> StoreResult<Option<IdentityRecord>>;

    fn identity_by_handle(&self, handle: &str) -> StoreResult<Option<IdentityRecord>>;

    fn identity_by_device(&self, device_id: &str) -> StoreResult<Option<IdentityRecord>>;

    /// Apply a partial update. Fails with `Conflict` if a device
    /// rebinding collides with another identity, `NotFound` if the
    /// identity does not exist.
    fn update_identity(
        &self,
        id: IdentityId,
        changes: &IdentityChanges,
    ) -> StoreResult<IdentityRecord>;

    /// Delete an identity and cascade to its assignments and sessions.
    fn delete_identity(&self, id: IdentityId) -> StoreResult<()>;

    // Machines

    /// Insert a new machine. Fails with `Conflict` on a duplicate
    /// hardware address or friendly name.
    fn insert_machine(&self, new: &NewMachine) -> StoreResult<MachineRecord>;

    fn machine_by_id(&self, id: MachineId) -> StoreResult<Option<MachineRecord>>;

    fn machine_by_address(&self, hw_address: &str) -> StoreResult<Option<MachineRecord>>;

    /// All machines with the active flag set.
    fn list_active_machines(&self) -> StoreResult<Vec<MachineRecord>>;

    /// Delete a machine and cascade to its assignments and sessions.
    fn delete_machine(&self, id: MachineId) -> StoreResult<()>;

    // Assignments

    fn insert_assignment(&self, new: &NewAssignment) -> StoreResult<AssignmentRecord>;

    /// Whether at least one assignment links the identity to the
    /// machine and is still valid at `at` (no end timestamp, or an end
    /// timestamp in the future).
    fn has_assignment(
        &self,
        identity_id: IdentityId,
        machine_id: MachineId,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Active machines the identity holds a currently-valid assignment
    /// to, deduplicated.
    fn machines_assigned_to(
        &self,
        identity_id: IdentityId,
        at: DateTime<Utc>,
    ) -> StoreResult<Vec<MachineRecord>>;

    // Sessions

    /// Open a new session. When `single_open_per_machine` is set, the
    /// insert is refused with `Conflict` if the machine already has an
    /// open session; the check and the insert happen atomically.
    fn insert_session(
        &self,
        new: &NewSession,
        single_open_per_machine: bool,
    ) -> StoreResult<SessionRecord>;

    fn session_by_id(&self, id: SessionId) -> StoreResult<Option<SessionRecord>>;

    /// Close a session, conditionally: the update only applies while
    /// the session is still open. Returns `None` when no open session
    /// with this id existed (already closed, or never existed), so two
    /// racing closers cannot both succeed.
    fn close_session(
        &self,
        id: SessionId,
        ended_at: DateTime<Utc>,
        duration_minutes: i64,
    ) -> StoreResult<Option<SessionRecord>>;

    /// All sessions, most recently started first.
    fn list_sessions(&self) -> StoreResult<Vec<SessionRecord>>;

    // Health

    /// Check if store is healthy
    fn is_healthy(&self) -> bool;
}
