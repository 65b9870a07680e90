//! Durable state store backed by SQLite.
//!
//! Holds sandboxes, snapshots, command audit rows, and credential metadata.
//! Sandboxes are soft-deleted only; audit children are retained forever.
//! All writes funnel through one mutex-guarded connection, which also makes
//! state transitions atomic: [`Store::transition_sandbox`] consults the
//! state table and rejects illegal moves in the same critical section that
//! applies them.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::model::{
    CommandRecord, CredentialRecord, Sandbox, SandboxState, Snapshot, SnapshotKind,
};

/// Default cap applied to each captured output stream before persisting.
pub const DEFAULT_OUTPUT_CAP: usize = 64 * 1024;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sandboxes (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    source      TEXT NOT NULL,
    agent       TEXT NOT NULL,
    vcpus       INTEGER NOT NULL,
    memory_mib  INTEGER NOT NULL,
    state       TEXT NOT NULL,
    ip          TEXT,
    error_reason TEXT,
    created_at  TEXT NOT NULL,
    deleted_at  TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_sandboxes_live_name
    ON sandboxes(name) WHERE deleted_at IS NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_sandboxes_live_ip
    ON sandboxes(ip) WHERE deleted_at IS NULL AND ip IS NOT NULL;

CREATE TABLE IF NOT EXISTS snapshots (
    id          TEXT PRIMARY KEY,
    sandbox_id  TEXT NOT NULL REFERENCES sandboxes(id),
    name        TEXT NOT NULL,
    kind        TEXT NOT NULL,
    parent_id   TEXT,
    created_at  TEXT NOT NULL,
    UNIQUE(sandbox_id, name)
);

CREATE TABLE IF NOT EXISTS commands (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    sandbox_id  TEXT NOT NULL REFERENCES sandboxes(id),
    command     TEXT NOT NULL,
    exit_code   INTEGER,
    stdout      TEXT NOT NULL,
    stderr      TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    duration_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS credentials (
    sandbox_id  TEXT NOT NULL,
    principal   TEXT NOT NULL,
    serial      INTEGER NOT NULL,
    issued_at   TEXT NOT NULL,
    expires_at  TEXT NOT NULL,
    key_path    TEXT NOT NULL,
    cert_path   TEXT NOT NULL,
    PRIMARY KEY (sandbox_id, principal)
);
";

/// Range-query filter for [`Store::list_sandboxes`].
#[derive(Debug, Clone, Default)]
pub struct SandboxFilter {
    pub states: Option<Vec<SandboxState>>,
    pub agent: Option<String>,
    pub include_deleted: bool,
}

impl SandboxFilter {
    /// Everything that is not terminal and not deleted: the recovery set.
    pub fn non_terminal() -> Self {
        Self {
            states: Some(vec![
                SandboxState::Pending,
                SandboxState::Provisioning,
                SandboxState::Running,
                SandboxState::Stopping,
                SandboxState::Stopped,
                SandboxState::Starting,
                SandboxState::Destroying,
            ]),
            agent: None,
            include_deleted: false,
        }
    }
}

pub struct Store {
    conn: Mutex<Connection>,
    output_cap: usize,
}

impl Store {
    pub fn open(path: &Path, output_cap: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::internal(format!("create data dir: {e}")))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::internal(format!("open {}: {e}", path.display())))?;
        Self::init(conn, output_cap)
    }

    pub fn open_in_memory(output_cap: usize) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::internal(format!("open in-memory store: {e}")))?;
        Self::init(conn, output_cap)
    }

    fn init(conn: Connection, output_cap: usize) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            output_cap,
        })
    }

    // ── Transactions ────────────────────────────────────────────────

    /// Run `f` inside a single atomic unit; any error rolls everything back.
    pub async fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    // ── Sandboxes ───────────────────────────────────────────────────

    pub async fn insert_sandbox(&self, s: &Sandbox) -> Result<()> {
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "INSERT INTO sandboxes (id, name, source, agent, vcpus, memory_mib, state, ip, error_reason, created_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                s.id,
                s.name,
                s.source,
                s.agent,
                s.vcpus,
                s.memory_mib,
                s.state.as_str(),
                s.ip,
                s.error_reason,
                s.created_at.to_rfc3339(),
                s.deleted_at.map(|t| t.to_rfc3339()),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::invalid_input(format!(
                    "sandbox name '{}' is already in use",
                    s.name
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_sandbox(&self, id: &str) -> Result<Sandbox> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, name, source, agent, vcpus, memory_mib, state, ip, error_reason, created_at, deleted_at
             FROM sandboxes WHERE id = ?1",
            [id],
            row_to_sandbox,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Error::not_found(format!("sandbox {id}")),
            other => other.into(),
        })
    }

    pub async fn get_sandbox_by_name(&self, name: &str) -> Result<Sandbox> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, name, source, agent, vcpus, memory_mib, state, ip, error_reason, created_at, deleted_at
             FROM sandboxes WHERE name = ?1 AND deleted_at IS NULL",
            [name],
            row_to_sandbox,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Error::not_found(format!("sandbox '{name}'")),
            other => other.into(),
        })
    }

    pub async fn list_sandboxes(&self, filter: &SandboxFilter) -> Result<Vec<Sandbox>> {
        let conn = self.conn.lock().await;
        let mut sql = String::from(
            "SELECT id, name, source, agent, vcpus, memory_mib, state, ip, error_reason, created_at, deleted_at
             FROM sandboxes WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if !filter.include_deleted {
            sql.push_str(" AND deleted_at IS NULL");
        }
        if let Some(ref states) = filter.states {
            let placeholders: Vec<String> = states
                .iter()
                .enumerate()
                .map(|(i, _)| format!("?{}", params.len() + i + 1))
                .collect();
            sql.push_str(&format!(" AND state IN ({})", placeholders.join(",")));
            for st in states {
                params.push(Box::new(st.as_str().to_string()));
            }
        }
        if let Some(ref agent) = filter.agent {
            sql.push_str(&format!(" AND agent = ?{}", params.len() + 1));
            params.push(Box::new(agent.clone()));
        }
        sql.push_str(" ORDER BY created_at");

        let mut stmt = conn.prepare(&sql)?;
        let refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(refs.as_slice(), row_to_sandbox)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Apply a state transition, rejecting edges the state table forbids.
    pub async fn transition_sandbox(
        &self,
        id: &str,
        to: SandboxState,
        reason: Option<&str>,
    ) -> Result<Sandbox> {
        let conn = self.conn.lock().await;
        let current: String = conn
            .query_row("SELECT state FROM sandboxes WHERE id = ?1", [id], |r| r.get(0))
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Error::not_found(format!("sandbox {id}")),
                other => other.into(),
            })?;
        let from = SandboxState::parse(&current)
            .ok_or_else(|| Error::internal(format!("corrupt state '{current}' for {id}")))?;

        if from != to && !SandboxState::can_transition(from, to) {
            return Err(Error::internal(format!(
                "illegal transition {from} -> {to} for {id}"
            )));
        }

        // A sandbox that is no longer running holds no address; freeing it
        // keeps the live-IP uniqueness index honest for the next clone.
        let clears_ip = matches!(to, SandboxState::Stopped | SandboxState::Destroyed);
        if clears_ip {
            conn.execute(
                "UPDATE sandboxes SET state = ?1, error_reason = ?2, ip = NULL WHERE id = ?3",
                rusqlite::params![to.as_str(), reason, id],
            )?;
        } else {
            conn.execute(
                "UPDATE sandboxes SET state = ?1, error_reason = ?2 WHERE id = ?3",
                rusqlite::params![to.as_str(), reason, id],
            )?;
        }

        conn.query_row(
            "SELECT id, name, source, agent, vcpus, memory_mib, state, ip, error_reason, created_at, deleted_at
             FROM sandboxes WHERE id = ?1",
            [id],
            row_to_sandbox,
        )
        .map_err(Into::into)
    }

    pub async fn update_sandbox_ip(&self, id: &str, ip: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "UPDATE sandboxes SET ip = ?1 WHERE id = ?2",
            rusqlite::params![ip, id],
        );
        match result {
            Ok(0) => Err(Error::not_found(format!("sandbox {id}"))),
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::internal(format!(
                    "address {} is already held by a live sandbox",
                    ip.unwrap_or("<none>")
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Soft-delete: set `deleted_at`, keep every audit child.
    pub async fn soft_delete_sandbox(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE sandboxes SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
            rusqlite::params![Utc::now().to_rfc3339(), id],
        )?;
        if changed == 0 {
            // Already deleted or never existed; destroy flows treat both
            // as success.
            tracing::debug!(id, "soft delete was a no-op");
        }
        Ok(())
    }

    // ── Snapshots ───────────────────────────────────────────────────

    pub async fn insert_snapshot(&self, snap: &Snapshot) -> Result<()> {
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "INSERT INTO snapshots (id, sandbox_id, name, kind, parent_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                snap.id,
                snap.sandbox_id,
                snap.name,
                snap.kind.as_str(),
                snap.parent_id,
                snap.created_at.to_rfc3339(),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::invalid_input(format!(
                    "snapshot name '{}' already exists for {}",
                    snap.name, snap.sandbox_id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Snapshots for live sandboxes only; a hard-removed sandbox never
    /// lists snapshots again.
    pub async fn list_snapshots(&self, sandbox_id: &str) -> Result<Vec<Snapshot>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT s.id, s.sandbox_id, s.name, s.kind, s.parent_id, s.created_at
             FROM snapshots s JOIN sandboxes b ON b.id = s.sandbox_id
             WHERE s.sandbox_id = ?1
             ORDER BY s.created_at",
        )?;
        let rows = stmt.query_map([sandbox_id], row_to_snapshot)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ── Command audit ───────────────────────────────────────────────

    /// Append-only; output streams are truncated to the configured cap.
    pub async fn record_command(&self, rec: &CommandRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO commands (sandbox_id, command, exit_code, stdout, stderr, started_at, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                rec.sandbox_id,
                rec.command,
                rec.exit_code,
                truncate_utf8(&rec.stdout, self.output_cap),
                truncate_utf8(&rec.stderr, self.output_cap),
                rec.started_at.to_rfc3339(),
                rec.duration_ms,
            ],
        )?;
        Ok(())
    }

    pub async fn list_commands(&self, sandbox_id: &str, limit: usize) -> Result<Vec<CommandRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT sandbox_id, command, exit_code, stdout, stderr, started_at, duration_ms
             FROM commands WHERE sandbox_id = ?1 ORDER BY seq DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![sandbox_id, limit as i64], row_to_command)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        out.reverse();
        Ok(out)
    }

    // ── Credential metadata ─────────────────────────────────────────

    pub async fn upsert_credential(&self, rec: &CredentialRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO credentials (sandbox_id, principal, serial, issued_at, expires_at, key_path, cert_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(sandbox_id, principal) DO UPDATE SET
                serial = excluded.serial,
                issued_at = excluded.issued_at,
                expires_at = excluded.expires_at,
                key_path = excluded.key_path,
                cert_path = excluded.cert_path",
            rusqlite::params![
                rec.sandbox_id,
                rec.principal,
                rec.serial as i64,
                rec.issued_at.to_rfc3339(),
                rec.expires_at.to_rfc3339(),
                rec.key_path,
                rec.cert_path,
            ],
        )?;
        Ok(())
    }

    pub async fn get_credential(
        &self,
        sandbox_id: &str,
        principal: &str,
    ) -> Result<CredentialRecord> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT sandbox_id, principal, serial, issued_at, expires_at, key_path, cert_path
             FROM credentials WHERE sandbox_id = ?1 AND principal = ?2",
            [sandbox_id, principal],
            row_to_credential,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                Error::not_found(format!("credential {sandbox_id}/{principal}"))
            }
            other => other.into(),
        })
    }

    /// Removed together with the on-disk key material; the two never
    /// diverge.
    pub async fn delete_credentials(&self, sandbox_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM credentials WHERE sandbox_id = ?1", [sandbox_id])?;
        Ok(())
    }
}

// ── Row mappers ─────────────────────────────────────────────────────

fn parse_time(s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_err(format!("bad timestamp '{s}': {e}")))
}

fn conversion_err(msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::other(msg)),
    )
}

fn row_to_sandbox(row: &rusqlite::Row<'_>) -> rusqlite::Result<Sandbox> {
    let state_raw: String = row.get(6)?;
    let state = SandboxState::parse(&state_raw)
        .ok_or_else(|| conversion_err(format!("unknown state '{state_raw}'")))?;
    let created_at = parse_time(row.get::<_, String>(9)?)?;
    let deleted_at = match row.get::<_, Option<String>>(10)? {
        Some(s) => Some(parse_time(s)?),
        None => None,
    };
    Ok(Sandbox {
        id: row.get(0)?,
        name: row.get(1)?,
        source: row.get(2)?,
        agent: row.get(3)?,
        vcpus: row.get(4)?,
        memory_mib: row.get(5)?,
        state,
        ip: row.get(7)?,
        error_reason: row.get(8)?,
        created_at,
        deleted_at,
    })
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<Snapshot> {
    let kind_raw: String = row.get(3)?;
    let kind = SnapshotKind::parse(&kind_raw)
        .ok_or_else(|| conversion_err(format!("unknown snapshot kind '{kind_raw}'")))?;
    Ok(Snapshot {
        id: row.get(0)?,
        sandbox_id: row.get(1)?,
        name: row.get(2)?,
        kind,
        parent_id: row.get(4)?,
        created_at: parse_time(row.get::<_, String>(5)?)?,
    })
}

fn row_to_command(row: &rusqlite::Row<'_>) -> rusqlite::Result<CommandRecord> {
    Ok(CommandRecord {
        sandbox_id: row.get(0)?,
        command: row.get(1)?,
        exit_code: row.get(2)?,
        stdout: row.get(3)?,
        stderr: row.get(4)?,
        started_at: parse_time(row.get::<_, String>(5)?)?,
        duration_ms: row.get(6)?,
    })
}

fn row_to_credential(row: &rusqlite::Row<'_>) -> rusqlite::Result<CredentialRecord> {
    Ok(CredentialRecord {
        sandbox_id: row.get(0)?,
        principal: row.get(1)?,
        serial: row.get::<_, i64>(2)? as u64,
        issued_at: parse_time(row.get::<_, String>(3)?)?,
        expires_at: parse_time(row.get::<_, String>(4)?)?,
        key_path: row.get(5)?,
        cert_path: row.get(6)?,
    })
}

/// Truncate to at most `cap` bytes without splitting a UTF-8 sequence.
fn truncate_utf8(s: &str, cap: usize) -> &str {
    if s.len() <= cap {
        return s;
    }
    let mut end = cap;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{new_sandbox_id, new_snapshot_id};

    fn store() -> Store {
        Store::open_in_memory(DEFAULT_OUTPUT_CAP).unwrap()
    }

    fn sandbox(name: &str) -> Sandbox {
        Sandbox {
            id: new_sandbox_id(),
            name: name.to_string(),
            source: "ubuntu-base".into(),
            agent: "agent-1".into(),
            vcpus: 2,
            memory_mib: 1024,
            state: SandboxState::Pending,
            ip: None,
            error_reason: None,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn sandbox_round_trip() {
        let store = store();
        let sbx = sandbox("sbx-alpha");
        store.insert_sandbox(&sbx).await.unwrap();

        let loaded = store.get_sandbox(&sbx.id).await.unwrap();
        assert_eq!(loaded.name, "sbx-alpha");
        assert_eq!(loaded.state, SandboxState::Pending);
        assert_eq!(loaded.vcpus, 2);

        let by_name = store.get_sandbox_by_name("sbx-alpha").await.unwrap();
        assert_eq!(by_name.id, sbx.id);
    }

    #[tokio::test]
    async fn missing_sandbox_is_not_found() {
        let store = store();
        let err = store.get_sandbox("sbx-missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn live_names_are_unique_until_soft_delete() {
        let store = store();
        store.insert_sandbox(&sandbox("sbx-dup")).await.unwrap();

        let err = store.insert_sandbox(&sandbox("sbx-dup")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        // After soft delete the name is reusable.
        let original = store.get_sandbox_by_name("sbx-dup").await.unwrap();
        store.soft_delete_sandbox(&original.id).await.unwrap();
        store.insert_sandbox(&sandbox("sbx-dup")).await.unwrap();
    }

    #[tokio::test]
    async fn transition_enforces_state_table() {
        let store = store();
        let sbx = sandbox("sbx-fsm");
        store.insert_sandbox(&sbx).await.unwrap();

        store
            .transition_sandbox(&sbx.id, SandboxState::Provisioning, None)
            .await
            .unwrap();
        let running = store
            .transition_sandbox(&sbx.id, SandboxState::Running, None)
            .await
            .unwrap();
        assert_eq!(running.state, SandboxState::Running);

        // RUNNING -> STARTING is illegal.
        let err = store
            .transition_sandbox(&sbx.id, SandboxState::Starting, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("illegal transition"));

        // Errored records its reason.
        let errored = store
            .transition_sandbox(&sbx.id, SandboxState::Errored, Some("ssh probe failed"))
            .await
            .unwrap();
        assert_eq!(errored.error_reason.as_deref(), Some("ssh probe failed"));
    }

    #[tokio::test]
    async fn idempotent_transition_to_same_state() {
        let store = store();
        let sbx = sandbox("sbx-same");
        store.insert_sandbox(&sbx).await.unwrap();
        store
            .transition_sandbox(&sbx.id, SandboxState::Pending, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn soft_delete_is_idempotent_and_retains_audit() {
        let store = store();
        let sbx = sandbox("sbx-del");
        store.insert_sandbox(&sbx).await.unwrap();
        store
            .record_command(&CommandRecord {
                sandbox_id: sbx.id.clone(),
                command: "whoami".into(),
                exit_code: Some(0),
                stdout: "sandbox\n".into(),
                stderr: String::new(),
                started_at: Utc::now(),
                duration_ms: 12,
            })
            .await
            .unwrap();

        store.soft_delete_sandbox(&sbx.id).await.unwrap();
        store.soft_delete_sandbox(&sbx.id).await.unwrap();

        let deleted = store.get_sandbox(&sbx.id).await.unwrap();
        assert!(deleted.deleted_at.is_some());

        // Audit rows survive the delete.
        let commands = store.list_commands(&sbx.id, 10).await.unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].stdout, "sandbox\n");
    }

    #[tokio::test]
    async fn list_filters_by_state_agent_and_deletion() {
        let store = store();
        let mut a = sandbox("sbx-a");
        a.state = SandboxState::Running;
        let mut b = sandbox("sbx-b");
        b.state = SandboxState::Stopped;
        b.agent = "agent-2".into();
        let c = sandbox("sbx-c");
        store.insert_sandbox(&a).await.unwrap();
        store.insert_sandbox(&b).await.unwrap();
        store.insert_sandbox(&c).await.unwrap();
        store.soft_delete_sandbox(&c.id).await.unwrap();

        let all_live = store.list_sandboxes(&SandboxFilter::default()).await.unwrap();
        assert_eq!(all_live.len(), 2);

        let running = store
            .list_sandboxes(&SandboxFilter {
                states: Some(vec![SandboxState::Running]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].name, "sbx-a");

        let agent2 = store
            .list_sandboxes(&SandboxFilter {
                agent: Some("agent-2".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(agent2.len(), 1);

        let with_deleted = store
            .list_sandboxes(&SandboxFilter {
                include_deleted: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(with_deleted.len(), 3);
    }

    #[tokio::test]
    async fn live_sandboxes_never_share_an_address() {
        let store = store();
        let a = sandbox("sbx-ip-a");
        let b = sandbox("sbx-ip-b");
        store.insert_sandbox(&a).await.unwrap();
        store.insert_sandbox(&b).await.unwrap();

        store.update_sandbox_ip(&a.id, Some("192.168.122.70")).await.unwrap();
        let err = store
            .update_sandbox_ip(&b.id, Some("192.168.122.70"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already held"));

        // Address frees up once the holder is gone.
        store.soft_delete_sandbox(&a.id).await.unwrap();
        store.update_sandbox_ip(&b.id, Some("192.168.122.70")).await.unwrap();
    }

    #[tokio::test]
    async fn stopping_clears_the_stored_address() {
        let store = store();
        let mut sbx = sandbox("sbx-ipclear");
        sbx.state = SandboxState::Running;
        store.insert_sandbox(&sbx).await.unwrap();
        store.update_sandbox_ip(&sbx.id, Some("192.168.122.71")).await.unwrap();

        store
            .transition_sandbox(&sbx.id, SandboxState::Stopping, None)
            .await
            .unwrap();
        let stopped = store
            .transition_sandbox(&sbx.id, SandboxState::Stopped, None)
            .await
            .unwrap();
        assert!(stopped.ip.is_none());
    }

    #[tokio::test]
    async fn snapshots_unique_per_sandbox() {
        let store = store();
        let sbx = sandbox("sbx-snap");
        store.insert_sandbox(&sbx).await.unwrap();

        let snap = Snapshot {
            id: new_snapshot_id(),
            sandbox_id: sbx.id.clone(),
            name: "before-upgrade".into(),
            kind: SnapshotKind::External,
            parent_id: None,
            created_at: Utc::now(),
        };
        store.insert_snapshot(&snap).await.unwrap();

        let dup = Snapshot {
            id: new_snapshot_id(),
            ..snap.clone()
        };
        assert!(store.insert_snapshot(&dup).await.is_err());

        let listed = store.list_snapshots(&sbx.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].kind, SnapshotKind::External);
    }

    #[tokio::test]
    async fn command_output_is_truncated_to_cap() {
        let store = Store::open_in_memory(16).unwrap();
        let sbx = sandbox("sbx-cap");
        store.insert_sandbox(&sbx).await.unwrap();

        store
            .record_command(&CommandRecord {
                sandbox_id: sbx.id.clone(),
                command: "yes".into(),
                exit_code: Some(0),
                stdout: "y\n".repeat(100),
                stderr: String::new(),
                started_at: Utc::now(),
                duration_ms: 1,
            })
            .await
            .unwrap();

        let commands = store.list_commands(&sbx.id, 1).await.unwrap();
        assert_eq!(commands[0].stdout.len(), 16);
    }

    #[tokio::test]
    async fn credential_metadata_round_trip_and_delete() {
        let store = store();
        let sbx = sandbox("sbx-cred");
        store.insert_sandbox(&sbx).await.unwrap();

        let rec = CredentialRecord {
            sandbox_id: sbx.id.clone(),
            principal: "sandbox".into(),
            serial: 7,
            issued_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(1800),
            key_path: "/keys/sbx/key".into(),
            cert_path: "/keys/sbx/key-cert.pub".into(),
        };
        store.upsert_credential(&rec).await.unwrap();

        let loaded = store.get_credential(&sbx.id, "sandbox").await.unwrap();
        assert_eq!(loaded.serial, 7);

        // Upsert replaces in place.
        store
            .upsert_credential(&CredentialRecord { serial: 8, ..rec })
            .await
            .unwrap();
        let reloaded = store.get_credential(&sbx.id, "sandbox").await.unwrap();
        assert_eq!(reloaded.serial, 8);

        store.delete_credentials(&sbx.id).await.unwrap();
        assert!(store.get_credential(&sbx.id, "sandbox").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn with_tx_rolls_back_on_error() {
        let store = store();
        let sbx = sandbox("sbx-tx");
        let id = sbx.id.clone();
        store.insert_sandbox(&sbx).await.unwrap();

        let result: Result<()> = store
            .with_tx(|tx| {
                tx.execute(
                    "UPDATE sandboxes SET agent = 'rewritten' WHERE id = ?1",
                    [id.as_str()],
                )?;
                Err(Error::internal("boom"))
            })
            .await;
        assert!(result.is_err());

        let loaded = store.get_sandbox(&sbx.id).await.unwrap();
        assert_eq!(loaded.agent, "agent-1");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_utf8("hello", 10), "hello");
        assert_eq!(truncate_utf8("hello", 3), "hel");
        // Multi-byte char straddling the cap is dropped whole.
        let s = "ab\u{00e9}cd";
        assert_eq!(truncate_utf8(s, 3), "ab");
    }
}
