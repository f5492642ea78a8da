//! SQLite-based store implementation

use chrono::{DateTime, Utc};
use fleetgate_util::{AssignmentId, IdentityId, MachineId, Role, SessionId};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use crate::{
    AssignmentRecord, IdentityChanges, IdentityRecord, MachineRecord, NewAssignment, NewIdentity,
    NewMachine, NewSession, SessionRecord, Store, StoreError, StoreResult,
};

/// SQLite-based store. A single connection behind a mutex serializes
/// all operations, so each trait method executes atomically.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch(
            r#"
            -- People and device accounts
            CREATE TABLE IF NOT EXISTS identities (
                id TEXT PRIMARY KEY,
                handle TEXT NOT NULL UNIQUE,
                secret_hash TEXT,
                role TEXT NOT NULL,
                device_id TEXT UNIQUE
            );

            -- Physical machines, keyed by hardware address
            CREATE TABLE IF NOT EXISTS machines (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                hw_address TEXT NOT NULL UNIQUE,
                friendly_name TEXT UNIQUE,
                active INTEGER NOT NULL DEFAULT 1
            );

            -- Usage grants (duplicates allowed)
            CREATE TABLE IF NOT EXISTS assignments (
                id TEXT PRIMARY KEY,
                identity_id TEXT NOT NULL REFERENCES identities(id),
                machine_id TEXT NOT NULL REFERENCES machines(id),
                starts_at TEXT NOT NULL,
                ends_at TEXT
            );

            -- Usage sessions (open while ended_at is NULL)
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                identity_id TEXT NOT NULL REFERENCES identities(id),
                machine_id TEXT NOT NULL REFERENCES machines(id),
                started_at TEXT NOT NULL,
                ended_at TEXT,
                duration_minutes INTEGER
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_assignments_identity ON assignments(identity_id);
            CREATE INDEX IF NOT EXISTS idx_assignments_machine ON assignments(machine_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_machine_open ON sessions(machine_id, ended_at);
            CREATE INDEX IF NOT EXISTS idx_sessions_started ON sessions(started_at);
            "#,
        )?;

        debug!("Store schema initialized");
        Ok(())
    }
}

fn bad_id(s: &str) -> StoreError {
    StoreError::Database(format!("malformed id in database: {s:?}"))
}

fn parse_ts(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Database(format!("malformed timestamp {s:?}: {e}")))
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

type IdentityRow = (String, String, Option<String>, String, Option<String>);
type MachineRow = (String, String, String, Option<String>, i64);
type SessionRow = (String, String, String, String, Option<String>, Option<i64>);

fn identity_from_row(row: IdentityRow) -> StoreResult<IdentityRecord> {
    let (id, handle, secret_hash, role, device_id) = row;
    Ok(IdentityRecord {
        id: IdentityId::parse(&id).ok_or_else(|| bad_id(&id))?,
        handle,
        secret_hash,
        role: Role::from_stored(&role),
        device_id,
    })
}

fn machine_from_row(row: MachineRow) -> StoreResult<MachineRecord> {
    let (id, name, hw_address, friendly_name, active) = row;
    Ok(MachineRecord {
        id: MachineId::parse(&id).ok_or_else(|| bad_id(&id))?,
        name,
        hw_address,
        friendly_name,
        active: active != 0,
    })
}

fn session_from_row(row: SessionRow) -> StoreResult<SessionRecord> {
    let (id, identity_id, machine_id, started_at, ended_at, duration_minutes) = row;
    Ok(SessionRecord {
        id: SessionId::parse(&id).ok_or_else(|| bad_id(&id))?,
        identity_id: IdentityId::parse(&identity_id).ok_or_else(|| bad_id(&identity_id))?,
        machine_id: MachineId::parse(&machine_id).ok_or_else(|| bad_id(&machine_id))?,
        started_at: parse_ts(&started_at)?,
        ended_at: ended_at.as_deref().map(parse_ts).transpose()?,
        duration_minutes,
    })
}

const IDENTITY_COLS: &str = "id, handle, secret_hash, role, device_id";
const MACHINE_COLS: &str = "id, name, hw_address, friendly_name, active";
const SESSION_COLS: &str = "id, identity_id, machine_id, started_at, ended_at, duration_minutes";

/// Fetch helpers take the already-locked connection so multi-step
/// operations never re-lock.
fn fetch_identity(conn: &Connection, id: IdentityId) -> StoreResult<Option<IdentityRecord>> {
    let row: Option<IdentityRow> = conn
        .query_row(
            &format!("SELECT {IDENTITY_COLS} FROM identities WHERE id = ?"),
            [id.to_string()],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()?;
    row.map(identity_from_row).transpose()
}

fn fetch_machine(conn: &Connection, id: MachineId) -> StoreResult<Option<MachineRecord>> {
    let row: Option<MachineRow> = conn
        .query_row(
            &format!("SELECT {MACHINE_COLS} FROM machines WHERE id = ?"),
            [id.to_string()],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()?;
    row.map(machine_from_row).transpose()
}

fn fetch_session(conn: &Connection, id: SessionId) -> StoreResult<Option<SessionRecord>> {
    let row: Option<SessionRow> = conn
        .query_row(
            &format!("SELECT {SESSION_COLS} FROM sessions WHERE id = ?"),
            [id.to_string()],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                ))
            },
        )
        .optional()?;
    row.map(session_from_row).transpose()
}

impl Store for SqliteStore {
    fn insert_identity(&self, new: &NewIdentity) -> StoreResult<IdentityRecord> {
        let conn = self.conn.lock().unwrap();
        let id = IdentityId::new();

        conn.execute(
            "INSERT INTO identities (id, handle, secret_hash, role, device_id) VALUES (?, ?, ?, ?, ?)",
            params![
                id.to_string(),
                new.handle,
                new.secret_hash,
                new.role.as_str(),
                new.device_id,
            ],
        )?;

        debug!(identity_id = %id, handle = %new.handle, "Identity inserted");

        Ok(IdentityRecord {
            id,
            handle: new.handle.clone(),
            secret_hash: new.secret_hash.clone(),
            role: new.role,
            device_id: new.device_id.clone(),
        })
    }

    fn identity_by_id(&self, id: IdentityId) -> StoreResult<Option<IdentityRecord>> {
        let conn = self.conn.lock().unwrap();
        fetch_identity(&conn, id)
    }

    fn identity_by_handle(&self, handle: &str) -> StoreResult<Option<IdentityRecord>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<IdentityRow> = conn
            .query_row(
                &format!("SELECT {IDENTITY_COLS} FROM identities WHERE handle = ?"),
                [handle],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
            )
            .optional()?;
        row.map(identity_from_row).transpose()
    }

    fn identity_by_device(&self, device_id: &str) -> StoreResult<Option<IdentityRecord>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<IdentityRow> = conn
            .query_row(
                &format!("SELECT {IDENTITY_COLS} FROM identities WHERE device_id = ?"),
                [device_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
            )
            .optional()?;
        row.map(identity_from_row).transpose()
    }

    fn update_identity(
        &self,
        id: IdentityId,
        changes: &IdentityChanges,
    ) -> StoreResult<IdentityRecord> {
        let conn = self.conn.lock().unwrap();

        let mut record = fetch_identity(&conn, id)?
            .ok_or_else(|| StoreError::NotFound(format!("identity {id}")))?;

        if let Some(role) = changes.role {
            record.role = role;
        }
        if let Some(secret_hash) = &changes.secret_hash {
            record.secret_hash = secret_hash.clone();
        }
        if let Some(device_id) = &changes.device_id {
            record.device_id = device_id.clone();
        }

        conn.execute(
            "UPDATE identities SET role = ?, secret_hash = ?, device_id = ? WHERE id = ?",
            params![
                record.role.as_str(),
                record.secret_hash,
                record.device_id,
                id.to_string(),
            ],
        )?;

        debug!(identity_id = %id, role = %record.role, "Identity updated");
        Ok(record)
    }

    fn delete_identity(&self, id: IdentityId) -> StoreResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let id_str = id.to_string();
        tx.execute("DELETE FROM sessions WHERE identity_id = ?", [&id_str])?;
        tx.execute("DELETE FROM assignments WHERE identity_id = ?", [&id_str])?;
        let n = tx.execute("DELETE FROM identities WHERE id = ?", [&id_str])?;
        tx.commit()?;

        if n == 0 {
            return Err(StoreError::NotFound(format!("identity {id}")));
        }
        debug!(identity_id = %id, "Identity deleted with cascade");
        Ok(())
    }

    fn insert_machine(&self, new: &NewMachine) -> StoreResult<MachineRecord> {
        let conn = self.conn.lock().unwrap();
        let id = MachineId::new();

        conn.execute(
            "INSERT INTO machines (id, name, hw_address, friendly_name, active) VALUES (?, ?, ?, ?, ?)",
            params![
                id.to_string(),
                new.name,
                new.hw_address,
                new.friendly_name,
                new.active as i64,
            ],
        )?;

        debug!(machine_id = %id, hw_address = %new.hw_address, "Machine inserted");

        Ok(MachineRecord {
            id,
            name: new.name.clone(),
            hw_address: new.hw_address.clone(),
            friendly_name: new.friendly_name.clone(),
            active: new.active,
        })
    }

    fn machine_by_id(&self, id: MachineId) -> StoreResult<Option<MachineRecord>> {
        let conn = self.conn.lock().unwrap();
        fetch_machine(&conn, id)
    }

    fn machine_by_address(&self, hw_address: &str) -> StoreResult<Option<MachineRecord>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<MachineRow> = conn
            .query_row(
                &format!("SELECT {MACHINE_COLS} FROM machines WHERE hw_address = ?"),
                [hw_address],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
            )
            .optional()?;
        row.map(machine_from_row).transpose()
    }

    fn list_active_machines(&self) -> StoreResult<Vec<MachineRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MACHINE_COLS} FROM machines WHERE active = 1 ORDER BY name"
        ))?;

        let rows = stmt.query_map([], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
        })?;

        let mut machines = Vec::new();
        for row in rows {
            machines.push(machine_from_row(row?)?);
        }
        Ok(machines)
    }

    fn delete_machine(&self, id: MachineId) -> StoreResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let id_str = id.to_string();
        tx.execute("DELETE FROM sessions WHERE machine_id = ?", [&id_str])?;
        tx.execute("DELETE FROM assignments WHERE machine_id = ?", [&id_str])?;
        let n = tx.execute("DELETE FROM machines WHERE id = ?", [&id_str])?;
        tx.commit()?;

        if n == 0 {
            return Err(StoreError::NotFound(format!("machine {id}")));
        }
        debug!(machine_id = %id, "Machine deleted with cascade");
        Ok(())
    }

    fn insert_assignment(&self, new: &NewAssignment) -> StoreResult<AssignmentRecord> {
        let conn = self.conn.lock().unwrap();
        let id = AssignmentId::new();

        conn.execute(
            "INSERT INTO assignments (id, identity_id, machine_id, starts_at, ends_at) VALUES (?, ?, ?, ?, ?)",
            params![
                id.to_string(),
                new.identity_id.to_string(),
                new.machine_id.to_string(),
                ts(new.starts_at),
                new.ends_at.map(ts),
            ],
        )?;

        debug!(
            identity_id = %new.identity_id,
            machine_id = %new.machine_id,
            "Assignment inserted"
        );

        Ok(AssignmentRecord {
            id,
            identity_id: new.identity_id,
            machine_id: new.machine_id,
            starts_at: new.starts_at,
            ends_at: new.ends_at,
        })
    }

    fn has_assignment(
        &self,
        identity_id: IdentityId,
        machine_id: MachineId,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM assignments
             WHERE identity_id = ? AND machine_id = ?
               AND (ends_at IS NULL OR ends_at > ?)",
            params![identity_id.to_string(), machine_id.to_string(), ts(at)],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    fn machines_assigned_to(
        &self,
        identity_id: IdentityId,
        at: DateTime<Utc>,
    ) -> StoreResult<Vec<MachineRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT m.id, m.name, m.hw_address, m.friendly_name, m.active
             FROM machines m
             JOIN assignments a ON a.machine_id = m.id
             WHERE a.identity_id = ? AND m.active = 1
               AND (a.ends_at IS NULL OR a.ends_at > ?)
             ORDER BY m.name",
        )?;

        let rows = stmt.query_map(params![identity_id.to_string(), ts(at)], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
        })?;

        let mut machines = Vec::new();
        for row in rows {
            machines.push(machine_from_row(row?)?);
        }
        Ok(machines)
    }

    fn insert_session(
        &self,
        new: &NewSession,
        single_open_per_machine: bool,
    ) -> StoreResult<SessionRecord> {
        let conn = self.conn.lock().unwrap();

        // The open-session check and the insert run under the same
        // lock, so two concurrent starts cannot both pass the guard.
        if single_open_per_machine {
            let open: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sessions WHERE machine_id = ? AND ended_at IS NULL",
                [new.machine_id.to_string()],
                |r| r.get(0),
            )?;
            if open > 0 {
                return Err(StoreError::Conflict(format!(
                    "machine {} already has an open session",
                    new.machine_id
                )));
            }
        }

        let id = SessionId::new();
        conn.execute(
            "INSERT INTO sessions (id, identity_id, machine_id, started_at) VALUES (?, ?, ?, ?)",
            params![
                id.to_string(),
                new.identity_id.to_string(),
                new.machine_id.to_string(),
                ts(new.started_at),
            ],
        )?;

        debug!(session_id = %id, machine_id = %new.machine_id, "Session opened");

        Ok(SessionRecord {
            id,
            identity_id: new.identity_id,
            machine_id: new.machine_id,
            started_at: new.started_at,
            ended_at: None,
            duration_minutes: None,
        })
    }

    fn session_by_id(&self, id: SessionId) -> StoreResult<Option<SessionRecord>> {
        let conn = self.conn.lock().unwrap();
        fetch_session(&conn, id)
    }

    fn close_session(
        &self,
        id: SessionId,
        ended_at: DateTime<Utc>,
        duration_minutes: i64,
    ) -> StoreResult<Option<SessionRecord>> {
        let conn = self.conn.lock().unwrap();

        // Conditional update: only an open session transitions.
        let n = conn.execute(
            "UPDATE sessions SET ended_at = ?, duration_minutes = ? WHERE id = ? AND ended_at IS NULL",
            params![ts(ended_at), duration_minutes, id.to_string()],
        )?;

        if n == 0 {
            return Ok(None);
        }

        let record = fetch_session(&conn, id)?
            .ok_or_else(|| StoreError::Database(format!("session {id} vanished after close")))?;
        debug!(session_id = %id, duration_minutes, "Session closed");
        Ok(Some(record))
    }

    fn list_sessions(&self) -> StoreResult<Vec<SessionRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLS} FROM sessions ORDER BY started_at DESC"
        ))?;

        let rows = stmt.query_map([], |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
            ))
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(session_from_row(row?)?);
        }
        Ok(sessions)
    }

    fn is_healthy(&self) -> bool {
        match self.conn.lock() {
            Ok(conn) => conn.query_row("SELECT 1", [], |_| Ok(())).is_ok(),
            Err(_) => {
                tracing::warn!("Store lock poisoned");
                false
            }
        }
    }
}
