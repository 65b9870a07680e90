//! Core entities: sandboxes, snapshots, command audit rows, credential
//! metadata, and source (golden) VMs, plus the sandbox state machine.
//!
//! The state machine is table-driven: every legal edge lives in one place
//! and [`SandboxState::can_transition`] is the only authority. Service code
//! never encodes transitions ad hoc.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Identifiers ─────────────────────────────────────────────────────

/// Mint a sandbox id: opaque, globally unique, type-prefixed.
pub fn new_sandbox_id() -> String {
    format!("sbx-{}", uuid::Uuid::new_v4())
}

/// Mint a snapshot id.
pub fn new_snapshot_id() -> String {
    format!("snap-{}", uuid::Uuid::new_v4())
}

/// Short token for certificate ids and generated names.
pub fn short_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

// ── Sandbox state machine ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxState {
    Pending,
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Starting,
    Destroying,
    Destroyed,
    Errored,
}

/// Every legal edge. `Errored → Destroying` is the operator re-drive path;
/// `Destroyed` has no outgoing edges.
const TRANSITIONS: &[(SandboxState, SandboxState)] = &[
    (SandboxState::Pending, SandboxState::Provisioning),
    (SandboxState::Pending, SandboxState::Destroying),
    (SandboxState::Pending, SandboxState::Errored),
    (SandboxState::Provisioning, SandboxState::Running),
    (SandboxState::Provisioning, SandboxState::Destroying),
    (SandboxState::Provisioning, SandboxState::Errored),
    (SandboxState::Running, SandboxState::Stopping),
    (SandboxState::Running, SandboxState::Destroying),
    (SandboxState::Running, SandboxState::Errored),
    (SandboxState::Stopping, SandboxState::Stopped),
    (SandboxState::Stopping, SandboxState::Errored),
    (SandboxState::Stopped, SandboxState::Starting),
    (SandboxState::Stopped, SandboxState::Destroying),
    (SandboxState::Stopped, SandboxState::Errored),
    (SandboxState::Starting, SandboxState::Running),
    (SandboxState::Starting, SandboxState::Errored),
    (SandboxState::Destroying, SandboxState::Destroyed),
    (SandboxState::Destroying, SandboxState::Errored),
    (SandboxState::Errored, SandboxState::Destroying),
];

impl SandboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxState::Pending => "PENDING",
            SandboxState::Provisioning => "PROVISIONING",
            SandboxState::Running => "RUNNING",
            SandboxState::Stopping => "STOPPING",
            SandboxState::Stopped => "STOPPED",
            SandboxState::Starting => "STARTING",
            SandboxState::Destroying => "DESTROYING",
            SandboxState::Destroyed => "DESTROYED",
            SandboxState::Errored => "ERRORED",
        }
    }

    pub fn parse(s: &str) -> Option<SandboxState> {
        Some(match s {
            "PENDING" => SandboxState::Pending,
            "PROVISIONING" => SandboxState::Provisioning,
            "RUNNING" => SandboxState::Running,
            "STOPPING" => SandboxState::Stopping,
            "STOPPED" => SandboxState::Stopped,
            "STARTING" => SandboxState::Starting,
            "DESTROYING" => SandboxState::Destroying,
            "DESTROYED" => SandboxState::Destroyed,
            "ERRORED" => SandboxState::Errored,
            _ => return None,
        })
    }

    /// Terminal states have no provider-side object to reconcile.
    /// `Errored` still admits the operator re-drive to `Destroying`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SandboxState::Destroyed | SandboxState::Errored)
    }

    pub fn can_transition(from: SandboxState, to: SandboxState) -> bool {
        TRANSITIONS.contains(&(from, to))
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Sandbox ─────────────────────────────────────────────────────────

/// The unit of work: an ephemeral clone of a golden image.
///
/// The service exclusively owns mutation; everything else observes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: String,
    /// Human name, unique among live sandboxes on a host.
    pub name: String,
    /// Golden image this sandbox was cloned from.
    pub source: String,
    /// Owning agent identifier.
    pub agent: String,
    pub vcpus: u32,
    pub memory_mib: u32,
    pub state: SandboxState,
    /// Last observed address, informational only; flows re-discover.
    pub ip: Option<String>,
    /// Why the sandbox is `ERRORED`, when it is.
    pub error_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Sandbox {
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none() && !self.state.is_terminal()
    }
}

// ── Snapshot ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    /// Stored inside the disk image itself.
    Internal,
    /// A separate overlay file.
    External,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::Internal => "internal",
            SnapshotKind::External => "external",
        }
    }

    pub fn parse(s: &str) -> Option<SnapshotKind> {
        match s {
            "internal" => Some(SnapshotKind::Internal),
            "external" => Some(SnapshotKind::External),
            _ => None,
        }
    }
}

/// Immutable once created; removed only with its sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub sandbox_id: String,
    /// Unique within the owning sandbox.
    pub name: String,
    pub kind: SnapshotKind,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ── Command audit record ────────────────────────────────────────────

/// Append-only audit row for one command run inside a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    pub sandbox_id: String,
    pub command: String,
    pub exit_code: Option<i32>,
    /// Captured output, truncated to the configured cap.
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
}

// ── Credential metadata ─────────────────────────────────────────────

/// Metadata only; the key material itself lives on the filesystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub sandbox_id: String,
    /// In-guest user the certificate authorizes.
    pub principal: String,
    pub serial: u64,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub key_path: String,
    pub cert_path: String,
}

// ── Source VM ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceVmState {
    Running,
    Stopped,
    Unknown,
}

/// A golden image as last observed on the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceVm {
    pub name: String,
    pub state: SourceVmState,
    /// Read-only user and CA trust are installed.
    pub prepared: bool,
    pub ip: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_prefixes() {
        assert!(new_sandbox_id().starts_with("sbx-"));
        assert!(new_snapshot_id().starts_with("snap-"));
        assert_eq!(short_token().len(), 8);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(new_sandbox_id(), new_sandbox_id());
    }

    #[test]
    fn happy_path_transitions_are_legal() {
        use SandboxState::*;
        for (from, to) in [
            (Pending, Provisioning),
            (Provisioning, Running),
            (Running, Stopping),
            (Stopping, Stopped),
            (Stopped, Starting),
            (Starting, Running),
            (Running, Destroying),
            (Destroying, Destroyed),
        ] {
            assert!(SandboxState::can_transition(from, to), "{from} -> {to}");
        }
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        use SandboxState::*;
        for (from, to) in [
            (Pending, Running),
            (Running, Starting),
            (Stopped, Running),
            (Destroyed, Running),
            (Destroyed, Destroying),
            (Running, Pending),
        ] {
            assert!(!SandboxState::can_transition(from, to), "{from} -> {to}");
        }
    }

    #[test]
    fn any_nonterminal_state_can_error() {
        use SandboxState::*;
        for from in [Pending, Provisioning, Running, Stopping, Stopped, Starting, Destroying] {
            assert!(SandboxState::can_transition(from, Errored), "{from} -> ERRORED");
        }
    }

    #[test]
    fn errored_admits_only_redrive() {
        use SandboxState::*;
        assert!(SandboxState::can_transition(Errored, Destroying));
        assert!(!SandboxState::can_transition(Errored, Running));
        assert!(!SandboxState::can_transition(Errored, Starting));
    }

    #[test]
    fn state_strings_round_trip() {
        use SandboxState::*;
        for s in [
            Pending,
            Provisioning,
            Running,
            Stopping,
            Stopped,
            Starting,
            Destroying,
            Destroyed,
            Errored,
        ] {
            assert_eq!(SandboxState::parse(s.as_str()), Some(s));
        }
        assert_eq!(SandboxState::parse("RESUMING"), None);
    }

    #[test]
    fn terminality() {
        assert!(SandboxState::Destroyed.is_terminal());
        assert!(SandboxState::Errored.is_terminal());
        assert!(!SandboxState::Running.is_terminal());
        assert!(!SandboxState::Destroying.is_terminal());
    }

    #[test]
    fn snapshot_kind_round_trips() {
        assert_eq!(SnapshotKind::parse("internal"), Some(SnapshotKind::Internal));
        assert_eq!(SnapshotKind::parse("external"), Some(SnapshotKind::External));
        assert_eq!(SnapshotKind::parse("other"), None);
    }

    #[test]
    fn live_excludes_deleted_and_terminal() {
        let mut sbx = Sandbox {
            id: new_sandbox_id(),
            name: "sbx-demo".into(),
            source: "ubuntu-base".into(),
            agent: "agent-1".into(),
            vcpus: 2,
            memory_mib: 1024,
            state: SandboxState::Running,
            ip: None,
            error_reason: None,
            created_at: Utc::now(),
            deleted_at: None,
        };
        assert!(sbx.is_live());
        sbx.state = SandboxState::Errored;
        assert!(!sbx.is_live());
        sbx.state = SandboxState::Running;
        sbx.deleted_at = Some(Utc::now());
        assert!(!sbx.is_live());
    }
}
