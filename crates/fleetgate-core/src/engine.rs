//! The access engine
//!
//! Every public operation resolves its referents from the store,
//! applies the policy, and performs at most one write. Time is always
//! passed in by the caller so behavior is reproducible under test.

use chrono::{DateTime, Utc};
use fleetgate_store::{
    AssignmentRecord, IdentityChanges, IdentityRecord, MachineRecord, NewAssignment, NewIdentity,
    NewMachine, NewSession, SessionRecord, Store,
};
use fleetgate_util::{IdentityId, MachineId, Role, SessionId};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::{
    evaluate_access, registration, resolve_identity, secret, AccessDecision, CoreError,
    CoreResult, Credentials, RegistrationRequest,
};

/// Engine configuration
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Refuse to open a session on a machine that already has one
    /// open. Off by default, matching the legacy overlapping-session
    /// behavior.
    pub enforce_single_open_session_per_machine: bool,
}

/// Request to provision an identity administratively.
#[derive(Debug, Clone, Deserialize)]
pub struct NewIdentityRequest {
    pub handle: String,
    pub secret: Option<String>,
    pub role: Role,
    pub device_id: Option<String>,
}

/// Partial administrative update. Omitted fields are untouched;
/// `device_id: Some(None)` clears the binding.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentityUpdateRequest {
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default, with = "serde_double_option")]
    pub device_id: Option<Option<String>>,
}

/// Treats a missing field as "leave alone" and an explicit null as
/// "clear".
mod serde_double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Option<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(de).map(Some)
    }
}

/// The access-control and session-lifecycle engine.
///
/// Holds no cross-operation state: the store is the single shared
/// resource, and the engine is safe to share behind an `Arc` and call
/// from any number of request handlers concurrently.
pub struct AccessEngine {
    store: Arc<dyn Store>,
    config: EngineConfig,
}

impl AccessEngine {
    pub fn new(store: Arc<dyn Store>, config: EngineConfig) -> Self {
        info!(
            single_open_session = config.enforce_single_open_session_per_machine,
            "Access engine initialized"
        );
        Self { store, config }
    }

    /// Resolve a credential bundle to an identity.
    pub fn authenticate(&self, creds: &Credentials) -> CoreResult<IdentityRecord> {
        let identity = resolve_identity(self.store.as_ref(), creds)?;
        info!(
            identity_id = %identity.id,
            handle = %identity.handle,
            role = %identity.role,
            "Identity authenticated"
        );
        Ok(identity)
    }

    /// All machines with the active flag set, for any role.
    pub fn list_visible_machines(&self) -> CoreResult<Vec<MachineRecord>> {
        Ok(self.store.list_active_machines()?)
    }

    /// Machines the identity may see as "theirs": everything active
    /// for admin and manager, currently-assigned active machines for a
    /// technician, nothing for pending identities.
    pub fn list_assigned_machines(
        &self,
        identity_id: IdentityId,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<MachineRecord>> {
        let identity = self.identity(identity_id)?;

        let machines = match identity.role {
            Role::Admin | Role::Manager => self.store.list_active_machines()?,
            Role::Technician => self.store.machines_assigned_to(identity.id, now)?,
            Role::Pending => Vec::new(),
        };
        Ok(machines)
    }

    /// Open a usage session for `identity_id` on the machine with the
    /// given hardware address. Fails with `NotFound` if either is
    /// absent and `Forbidden` if the policy denies.
    pub fn start_session(
        &self,
        identity_id: IdentityId,
        machine_hw_address: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<SessionId> {
        let identity = self.identity(identity_id)?;
        let machine = self
            .store
            .machine_by_address(machine_hw_address)?
            .ok_or_else(|| CoreError::NotFound(format!("machine {machine_hw_address}")))?;

        match evaluate_access(self.store.as_ref(), &identity, &machine, now)? {
            AccessDecision::Allowed => {}
            AccessDecision::Denied { reason } => {
                warn!(
                    identity_id = %identity.id,
                    machine_id = %machine.id,
                    hw_address = %machine.hw_address,
                    reason = %reason,
                    "Session start denied"
                );
                return Err(CoreError::Forbidden(reason));
            }
        }

        let session = self.store.insert_session(
            &NewSession {
                identity_id: identity.id,
                machine_id: machine.id,
                started_at: now,
            },
            self.config.enforce_single_open_session_per_machine,
        )?;

        info!(
            session_id = %session.id,
            identity_id = %identity.id,
            machine_id = %machine.id,
            "Session started"
        );
        Ok(session.id)
    }

    /// Close a session, fixing its end time and whole-minute duration.
    /// A second close on the same session fails with `AlreadyClosed`.
    pub fn end_session(
        &self,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> CoreResult<SessionRecord> {
        let session = self
            .store
            .session_by_id(session_id)?
            .ok_or_else(|| CoreError::NotFound(format!("session {session_id}")))?;

        if !session.is_open() {
            return Err(CoreError::AlreadyClosed(session_id));
        }

        let duration_minutes = fleetgate_util::whole_minutes(session.started_at, now);
        match self.store.close_session(session_id, now, duration_minutes)? {
            Some(closed) => {
                info!(
                    session_id = %session_id,
                    duration_minutes,
                    "Session ended"
                );
                Ok(closed)
            }
            // Lost a race against another closer between the read and
            // the conditional update.
            None => Err(CoreError::AlreadyClosed(session_id)),
        }
    }

    /// All recorded sessions, most recently started first.
    pub fn list_sessions(&self) -> CoreResult<Vec<SessionRecord>> {
        Ok(self.store.list_sessions()?)
    }

    /// Onboard an unknown device as a pending identity awaiting
    /// elevation. No secret is stored, so credential login stays
    /// impossible until an administrator sets one.
    pub fn register_device(&self, req: &RegistrationRequest) -> CoreResult<IdentityId> {
        if self.store.identity_by_device(&req.device_id)?.is_some() {
            return Err(CoreError::Conflict(format!(
                "device {} is already bound to an identity",
                req.device_id
            )));
        }

        let handle = registration::derive_handle(&req.given_name, &req.family_name);
        let identity = self.store.insert_identity(&NewIdentity {
            handle,
            secret_hash: None,
            role: Role::Pending,
            device_id: Some(req.device_id.clone()),
        })?;

        info!(
            identity_id = %identity.id,
            handle = %identity.handle,
            "Device registered as pending identity"
        );
        Ok(identity.id)
    }

    // Administrative operations

    pub fn create_identity(&self, req: &NewIdentityRequest) -> CoreResult<IdentityRecord> {
        let secret_hash = match &req.secret {
            Some(s) => Some(secret::hash_secret(s)?),
            None => None,
        };

        let identity = self.store.insert_identity(&NewIdentity {
            handle: req.handle.clone(),
            secret_hash,
            role: req.role,
            device_id: req.device_id.clone(),
        })?;

        info!(identity_id = %identity.id, handle = %identity.handle, role = %identity.role, "Identity created");
        Ok(identity)
    }

    pub fn update_identity(
        &self,
        id: IdentityId,
        update: &IdentityUpdateRequest,
    ) -> CoreResult<IdentityRecord> {
        let secret_hash = match &update.secret {
            Some(s) => Some(Some(secret::hash_secret(s)?)),
            None => None,
        };

        let identity = self.store.update_identity(
            id,
            &IdentityChanges {
                role: update.role,
                secret_hash,
                device_id: update.device_id.clone(),
            },
        )?;

        info!(identity_id = %id, role = %identity.role, "Identity updated");
        Ok(identity)
    }

    /// Delete an identity; its assignments and sessions go with it.
    pub fn delete_identity(&self, id: IdentityId) -> CoreResult<()> {
        self.store.delete_identity(id)?;
        info!(identity_id = %id, "Identity deleted");
        Ok(())
    }

    pub fn create_machine(&self, new: &NewMachine) -> CoreResult<MachineRecord> {
        let machine = self.store.insert_machine(new)?;
        info!(machine_id = %machine.id, hw_address = %machine.hw_address, "Machine created");
        Ok(machine)
    }

    /// Delete a machine; its assignments and sessions go with it.
    pub fn delete_machine(&self, id: MachineId) -> CoreResult<()> {
        self.store.delete_machine(id)?;
        info!(machine_id = %id, "Machine deleted");
        Ok(())
    }

    /// Grant an identity the right to use a machine, optionally until
    /// `ends_at`. Duplicate grants are allowed.
    pub fn assign_machine(
        &self,
        identity_id: IdentityId,
        machine_id: MachineId,
        ends_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> CoreResult<AssignmentRecord> {
        let identity = self.identity(identity_id)?;
        let machine = self
            .store
            .machine_by_id(machine_id)?
            .ok_or_else(|| CoreError::NotFound(format!("machine {machine_id}")))?;

        let assignment = self.store.insert_assignment(&NewAssignment {
            identity_id: identity.id,
            machine_id: machine.id,
            starts_at: now,
            ends_at,
        })?;

        info!(
            identity_id = %identity.id,
            machine_id = %machine.id,
            "Assignment created"
        );
        Ok(assignment)
    }

    pub fn is_healthy(&self) -> bool {
        self.store.is_healthy()
    }

    fn identity(&self, id: IdentityId) -> CoreResult<IdentityRecord> {
        self.store
            .identity_by_id(id)?
            .ok_or_else(|| CoreError::NotFound(format!("identity {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use fleetgate_store::SqliteStore;

    const M1_MAC: &str = "08:D1:F9:E9:C2:CE";
    const M2_MAC: &str = "F4:CF:A2:00:11:22";

    fn engine() -> AccessEngine {
        engine_with(EngineConfig::default())
    }

    fn engine_with(config: EngineConfig) -> AccessEngine {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        AccessEngine::new(store, config)
    }

    fn identity(engine: &AccessEngine, handle: &str, role: Role) -> IdentityRecord {
        engine
            .create_identity(&NewIdentityRequest {
                handle: handle.into(),
                secret: None,
                role,
                device_id: None,
            })
            .unwrap()
    }

    fn machine(engine: &AccessEngine, name: &str, mac: &str, active: bool) -> MachineRecord {
        engine
            .create_machine(&NewMachine {
                name: name.into(),
                hw_address: mac.into(),
                friendly_name: None,
                active,
            })
            .unwrap()
    }

    #[test]
    fn technician_needs_an_assignment() {
        let engine = engine();
        let now = Utc::now();
        let tech = identity(&engine, "tech1", Role::Technician);
        let m1 = machine(&engine, "Floor Scrubber 1", M1_MAC, true);
        machine(&engine, "Polisher 2", M2_MAC, true);

        engine.assign_machine(tech.id, m1.id, None, now).unwrap();

        assert!(engine.start_session(tech.id, M1_MAC, now).is_ok());
        assert!(matches!(
            engine.start_session(tech.id, M2_MAC, now),
            Err(CoreError::Forbidden(_))
        ));
    }

    #[test]
    fn expired_assignment_does_not_grant_access() {
        let engine = engine();
        let now = Utc::now();
        let tech = identity(&engine, "tech1", Role::Technician);
        let m1 = machine(&engine, "M1", M1_MAC, true);

        engine
            .assign_machine(tech.id, m1.id, Some(now - Duration::hours(1)), now - Duration::days(1))
            .unwrap();

        assert!(matches!(
            engine.start_session(tech.id, M1_MAC, now),
            Err(CoreError::Forbidden(_))
        ));
    }

    #[test]
    fn admin_and_manager_may_use_any_machine() {
        let engine = engine();
        let now = Utc::now();
        let admin = identity(&engine, "admin", Role::Admin);
        let manager = identity(&engine, "manager", Role::Manager);
        machine(&engine, "Inactive", M1_MAC, false);

        // No assignments, machine inactive: still allowed to start.
        assert!(engine.start_session(admin.id, M1_MAC, now).is_ok());
        assert!(engine.start_session(manager.id, M1_MAC, now).is_ok());
    }

    #[test]
    fn pending_identity_is_denied() {
        let engine = engine();
        let now = Utc::now();
        let pending = identity(&engine, "newbie", Role::Pending);
        machine(&engine, "M1", M1_MAC, true);

        assert!(matches!(
            engine.start_session(pending.id, M1_MAC, now),
            Err(CoreError::Forbidden(_))
        ));
    }

    #[test]
    fn start_session_unknown_referents() {
        let engine = engine();
        let now = Utc::now();
        let admin = identity(&engine, "admin", Role::Admin);

        assert!(matches!(
            engine.start_session(IdentityId::new(), M1_MAC, now),
            Err(CoreError::NotFound(_))
        ));

        assert!(matches!(
            engine.start_session(admin.id, "00:00:00:00:00:00", now),
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn duration_floors_to_whole_minutes() {
        let engine = engine();
        let start = Utc::now();
        let admin = identity(&engine, "admin", Role::Admin);
        machine(&engine, "M1", M1_MAC, true);

        let session_id = engine.start_session(admin.id, M1_MAC, start).unwrap();
        let closed = engine
            .end_session(session_id, start + Duration::seconds(125))
            .unwrap();

        assert_eq!(closed.duration_minutes, Some(2));
        assert!(!closed.is_open());
    }

    #[test]
    fn second_close_is_rejected() {
        let engine = engine();
        let start = Utc::now();
        let admin = identity(&engine, "admin", Role::Admin);
        machine(&engine, "M1", M1_MAC, true);

        let session_id = engine.start_session(admin.id, M1_MAC, start).unwrap();
        engine
            .end_session(session_id, start + Duration::seconds(60))
            .unwrap();

        assert!(matches!(
            engine.end_session(session_id, start + Duration::seconds(120)),
            Err(CoreError::AlreadyClosed(_))
        ));
    }

    #[test]
    fn end_unknown_session_is_not_found() {
        let engine = engine();
        assert!(matches!(
            engine.end_session(SessionId::new(), Utc::now()),
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn overlapping_sessions_allowed_by_default() {
        let engine = engine();
        let now = Utc::now();
        let admin = identity(&engine, "admin", Role::Admin);
        machine(&engine, "M1", M1_MAC, true);

        engine.start_session(admin.id, M1_MAC, now).unwrap();
        engine.start_session(admin.id, M1_MAC, now).unwrap();

        assert_eq!(engine.list_sessions().unwrap().len(), 2);
    }

    #[test]
    fn single_open_session_flag_refuses_overlap() {
        let engine = engine_with(EngineConfig {
            enforce_single_open_session_per_machine: true,
        });
        let now = Utc::now();
        let admin = identity(&engine, "admin", Role::Admin);
        machine(&engine, "M1", M1_MAC, true);

        let first = engine.start_session(admin.id, M1_MAC, now).unwrap();
        assert!(matches!(
            engine.start_session(admin.id, M1_MAC, now),
            Err(CoreError::Conflict(_))
        ));

        // Once the open session closes, the machine frees up.
        engine
            .end_session(first, now + Duration::seconds(30))
            .unwrap();
        assert!(engine.start_session(admin.id, M1_MAC, now).is_ok());
    }

    #[test]
    fn listing_hides_inactive_machines_but_start_does_not() {
        let engine = engine();
        let now = Utc::now();
        let manager = identity(&engine, "manager", Role::Manager);
        machine(&engine, "Active", M1_MAC, true);
        machine(&engine, "Retired", M2_MAC, false);

        let visible = engine.list_visible_machines().unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].hw_address, M1_MAC);

        let assigned = engine.list_assigned_machines(manager.id, now).unwrap();
        assert_eq!(assigned.len(), 1);

        // The asymmetry: the retired machine is hidden but a manager
        // can still start a session on it.
        assert!(engine.start_session(manager.id, M2_MAC, now).is_ok());
    }

    #[test]
    fn assigned_listing_by_role() {
        let engine = engine();
        let now = Utc::now();
        let tech = identity(&engine, "tech1", Role::Technician);
        let pending = identity(&engine, "newbie", Role::Pending);
        let m1 = machine(&engine, "M1", M1_MAC, true);
        machine(&engine, "M2", M2_MAC, true);

        engine.assign_machine(tech.id, m1.id, None, now).unwrap();

        let tech_machines = engine.list_assigned_machines(tech.id, now).unwrap();
        assert_eq!(tech_machines.len(), 1);
        assert_eq!(tech_machines[0].hw_address, M1_MAC);

        assert!(engine
            .list_assigned_machines(pending.id, now)
            .unwrap()
            .is_empty());

        assert!(matches!(
            engine.list_assigned_machines(IdentityId::new(), now),
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn sessions_list_most_recent_first() {
        let engine = engine();
        let base = Utc::now();
        let admin = identity(&engine, "admin", Role::Admin);
        machine(&engine, "M1", M1_MAC, true);

        engine.start_session(admin.id, M1_MAC, base).unwrap();
        engine
            .start_session(admin.id, M1_MAC, base + Duration::seconds(60))
            .unwrap();

        let sessions = engine.list_sessions().unwrap();
        assert_eq!(sessions.len(), 2);
        assert!(sessions[0].started_at > sessions[1].started_at);
    }

    #[test]
    fn authenticate_by_credentials() {
        let engine = engine();
        engine
            .create_identity(&NewIdentityRequest {
                handle: "admin".into(),
                secret: Some("adminpass".into()),
                role: Role::Admin,
                device_id: None,
            })
            .unwrap();

        let ok = engine.authenticate(&Credentials {
            handle: Some("admin".into()),
            secret: Some("adminpass".into()),
            device_id: None,
        });
        assert_eq!(ok.unwrap().handle, "admin");

        let bad = engine.authenticate(&Credentials {
            handle: Some("admin".into()),
            secret: Some("wrong".into()),
            device_id: None,
        });
        assert!(matches!(bad, Err(CoreError::NotAuthenticated)));
    }

    #[test]
    fn authenticate_by_bound_device() {
        let engine = engine();
        engine
            .create_identity(&NewIdentityRequest {
                handle: "tech1".into(),
                secret: None,
                role: Role::Technician,
                device_id: Some("dev-123".into()),
            })
            .unwrap();

        let ok = engine.authenticate(&Credentials {
            handle: None,
            secret: None,
            device_id: Some("dev-123".into()),
        });
        assert_eq!(ok.unwrap().handle, "tech1");

        let unknown = engine.authenticate(&Credentials {
            handle: None,
            secret: None,
            device_id: Some("dev-999".into()),
        });
        assert!(matches!(unknown, Err(CoreError::NotAuthenticated)));
    }

    #[test]
    fn credential_match_wins_over_device() {
        let engine = engine();
        engine
            .create_identity(&NewIdentityRequest {
                handle: "admin".into(),
                secret: Some("adminpass".into()),
                role: Role::Admin,
                device_id: None,
            })
            .unwrap();
        engine
            .create_identity(&NewIdentityRequest {
                handle: "tech1".into(),
                secret: None,
                role: Role::Technician,
                device_id: Some("dev-123".into()),
            })
            .unwrap();

        // Both paths would resolve; credentials are checked first.
        let resolved = engine
            .authenticate(&Credentials {
                handle: Some("admin".into()),
                secret: Some("adminpass".into()),
                device_id: Some("dev-123".into()),
            })
            .unwrap();
        assert_eq!(resolved.handle, "admin");

        // Wrong credentials fall through to the device binding.
        let resolved = engine
            .authenticate(&Credentials {
                handle: Some("admin".into()),
                secret: Some("wrong".into()),
                device_id: Some("dev-123".into()),
            })
            .unwrap();
        assert_eq!(resolved.handle, "tech1");
    }

    #[test]
    fn register_device_creates_pending_identity() {
        let engine = engine();
        let id = engine
            .register_device(&RegistrationRequest {
                given_name: "Ada".into(),
                family_name: "Lovelace".into(),
                device_id: "dev-123".into(),
            })
            .unwrap();

        let identity = engine
            .authenticate(&Credentials {
                handle: None,
                secret: None,
                device_id: Some("dev-123".into()),
            })
            .unwrap();
        assert_eq!(identity.id, id);
        assert_eq!(identity.handle, "ada.lovelace");
        assert_eq!(identity.role, Role::Pending);
    }

    #[test]
    fn register_duplicate_device_conflicts() {
        let engine = engine();
        engine
            .register_device(&RegistrationRequest {
                given_name: "Ada".into(),
                family_name: "Lovelace".into(),
                device_id: "dev-123".into(),
            })
            .unwrap();

        let second = engine.register_device(&RegistrationRequest {
            given_name: "Alan".into(),
            family_name: "Turing".into(),
            device_id: "dev-123".into(),
        });
        assert!(matches!(second, Err(CoreError::Conflict(_))));
    }

    #[test]
    fn register_handle_collision_conflicts() {
        let engine = engine();
        engine
            .register_device(&RegistrationRequest {
                given_name: "Ada".into(),
                family_name: "Lovelace".into(),
                device_id: "dev-123".into(),
            })
            .unwrap();

        // Same derived handle, different device: handle uniqueness is
        // enforced, so the second registration is rejected.
        let second = engine.register_device(&RegistrationRequest {
            given_name: "Ada".into(),
            family_name: "Lovelace".into(),
            device_id: "dev-456".into(),
        });
        assert!(matches!(second, Err(CoreError::Conflict(_))));
    }

    #[test]
    fn registered_identity_cannot_login_by_credentials() {
        let engine = engine();
        engine
            .register_device(&RegistrationRequest {
                given_name: "Ada".into(),
                family_name: "Lovelace".into(),
                device_id: "dev-123".into(),
            })
            .unwrap();

        // No secret is stored at registration, so no credential guess
        // can succeed.
        let attempt = engine.authenticate(&Credentials {
            handle: Some("ada.lovelace".into()),
            secret: Some("".into()),
            device_id: None,
        });
        assert!(matches!(attempt, Err(CoreError::NotAuthenticated)));
    }

    #[test]
    fn elevation_enables_credential_login() {
        let engine = engine();
        let id = engine
            .register_device(&RegistrationRequest {
                given_name: "Ada".into(),
                family_name: "Lovelace".into(),
                device_id: "dev-123".into(),
            })
            .unwrap();

        engine
            .update_identity(
                id,
                &IdentityUpdateRequest {
                    role: Some(Role::Technician),
                    secret: Some("s3cret".into()),
                    device_id: None,
                },
            )
            .unwrap();

        let identity = engine
            .authenticate(&Credentials {
                handle: Some("ada.lovelace".into()),
                secret: Some("s3cret".into()),
                device_id: None,
            })
            .unwrap();
        assert_eq!(identity.role, Role::Technician);
    }

    #[test]
    fn delete_identity_cascades_through_engine() {
        let engine = engine();
        let now = Utc::now();
        let tech = identity(&engine, "tech1", Role::Technician);
        let m1 = machine(&engine, "M1", M1_MAC, true);

        engine.assign_machine(tech.id, m1.id, None, now).unwrap();
        engine.start_session(tech.id, M1_MAC, now).unwrap();

        engine.delete_identity(tech.id).unwrap();

        assert!(engine.list_sessions().unwrap().is_empty());
        assert!(matches!(
            engine.list_assigned_machines(tech.id, now),
            Err(CoreError::NotFound(_))
        ));
    }
}
