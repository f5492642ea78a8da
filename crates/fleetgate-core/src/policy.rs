//! Access policy
//!
//! Two fixed rules, dispatched by role:
//! - admin and manager may start a session on any machine, active or
//!   not (listing visibility is a separate, stricter operation)
//! - technicians need a currently-valid assignment to the machine
//! - pending identities are denied everything

use chrono::{DateTime, Utc};
use fleetgate_store::{IdentityRecord, MachineRecord, Store};
use fleetgate_util::Role;

use crate::CoreResult;

/// Access decision for starting a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed,
    Denied { reason: String },
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allowed)
    }
}

/// Decide whether `identity` may start a session on `machine` at `at`.
pub fn evaluate_access(
    store: &dyn Store,
    identity: &IdentityRecord,
    machine: &MachineRecord,
    at: DateTime<Utc>,
) -> CoreResult<AccessDecision> {
    let decision = match identity.role {
        Role::Admin | Role::Manager => AccessDecision::Allowed,
        Role::Technician => {
            if store.has_assignment(identity.id, machine.id, at)? {
                AccessDecision::Allowed
            } else {
                AccessDecision::Denied {
                    reason: format!("no assignment to machine {}", machine.hw_address),
                }
            }
        }
        Role::Pending => AccessDecision::Denied {
            reason: "identity is pending elevation".to_string(),
        },
    };
    Ok(decision)
}
