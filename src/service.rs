//! The sandbox service: orchestrates providers, credentials, the read-only
//! gate, and the store behind one API.
//!
//! Mutating operations on a single sandbox serialize on a per-id mutex;
//! reads go straight to the store. Every flow that can leave residue
//! cleans up before surfacing its error, and destroy is idempotent at
//! every layer.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::creds::CredentialManager;
use crate::error::{Error, Result};
use crate::gate::prepare::{PrepareOutcome, ProgressFn};
use crate::gate::validator::validate_read_only;
use crate::host::CommandOutput;
use crate::model::{
    CommandRecord, CredentialRecord, Sandbox, SandboxState, Snapshot, SourceVm, new_sandbox_id,
    new_snapshot_id, short_token,
};
use crate::provider::{Backend, CloneRequest, SANDBOX_NAME_PREFIX};
use crate::store::{SandboxFilter, Store};

/// SSH probe backoff schedule: transport errors only, capped waits.
const PROBE_BACKOFF: [Duration; 5] = [
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
    Duration::from_secs(16),
    Duration::from_secs(30),
];
const PROBE_TIMEOUT: Duration = Duration::from_secs(20);
/// Per-sandbox budget in the batch cleanup path.
const CLEANUP_ITEM_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub default_vcpus: u32,
    pub default_memory_mib: u32,
    pub command_timeout: Duration,
    /// IP discovery budget on the create flow.
    pub ip_discovery_timeout: Duration,
    /// Decoded-size bound for source file reads.
    pub max_source_file_bytes: u64,
    /// Append-only JSON-lines audit log; disabled when unset.
    pub history_path: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_vcpus: 2,
            default_memory_mib: 2048,
            command_timeout: Duration::from_secs(120),
            ip_discovery_timeout: Duration::from_secs(120),
            max_source_file_bytes: 10 * 1024 * 1024,
            history_path: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateSandboxRequest {
    pub source: String,
    pub agent: String,
    pub name: Option<String>,
    pub vcpus: Option<u32>,
    pub memory_mib: Option<u32>,
}

/// What happened to one sandbox in a batch cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStatus {
    Destroying,
    Destroyed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone)]
pub enum CleanupEvent {
    Item {
        sandbox_id: String,
        status: CleanupStatus,
        detail: Option<String>,
    },
    Summary(CleanupSummary),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    pub destroyed: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub type CleanupFn = Arc<dyn Fn(CleanupEvent) + Send + Sync>;

/// Outcome of [`SandboxService::recover_state`].
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Rows moved to ERRORED because their provider object vanished.
    pub errored: Vec<String>,
    /// Provider objects with no store row; logged and left untouched.
    pub orphans: Vec<String>,
}

pub struct SandboxService {
    backend: Arc<dyn Backend>,
    store: Arc<Store>,
    creds: Arc<CredentialManager>,
    cfg: ServiceConfig,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SandboxService {
    pub fn new(
        backend: Arc<dyn Backend>,
        store: Arc<Store>,
        creds: Arc<CredentialManager>,
        cfg: ServiceConfig,
    ) -> Self {
        Self {
            backend,
            store,
            creds,
            cfg,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    /// The per-sandbox mutex. Entries live until the sandbox is destroyed;
    /// callers receive an `Arc` so a late waiter never holds a dangling
    /// reference.
    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(id.to_string()).or_default().clone()
    }

    fn drop_lock(&self, id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(id);
    }

    /// Append one line to the history file; never fails the operation.
    fn audit(&self, operation: &str, detail: serde_json::Value) {
        let Some(ref path) = self.cfg.history_path else {
            return;
        };
        let line = serde_json::json!({
            "at": Utc::now().to_rfc3339(),
            "op": operation,
            "detail": detail,
        });
        let entry = format!("{line}\n");
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| std::io::Write::write_all(&mut f, entry.as_bytes()));
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "audit append failed");
        }
    }

    // ── Create ──────────────────────────────────────────────────────

    pub async fn create_sandbox(&self, req: CreateSandboxRequest) -> Result<Sandbox> {
        if req.source.is_empty() {
            return Err(Error::invalid_input("source image is required"));
        }
        if req.agent.is_empty() {
            return Err(Error::invalid_input("agent id is required"));
        }

        let id = new_sandbox_id();
        let name = match req.name {
            Some(n) if n.starts_with(SANDBOX_NAME_PREFIX) => n,
            Some(n) => format!("{SANDBOX_NAME_PREFIX}{n}"),
            None => format!("{SANDBOX_NAME_PREFIX}{}", short_token()),
        };

        let sandbox = Sandbox {
            id: id.clone(),
            name,
            source: req.source,
            agent: req.agent,
            vcpus: req.vcpus.unwrap_or(self.cfg.default_vcpus),
            memory_mib: req.memory_mib.unwrap_or(self.cfg.default_memory_mib),
            state: SandboxState::Pending,
            ip: None,
            error_reason: None,
            created_at: Utc::now(),
            deleted_at: None,
        };
        self.store.insert_sandbox(&sandbox).await?;

        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;

        match self.provision(&sandbox).await {
            Ok(ip) => {
                self.store.update_sandbox_ip(&id, Some(&ip)).await?;
                let running = self
                    .store
                    .transition_sandbox(&id, SandboxState::Running, None)
                    .await?;
                self.audit(
                    "create_sandbox",
                    serde_json::json!({"id": id, "name": running.name, "ip": ip}),
                );
                tracing::info!(sandbox_id = %id, name = %running.name, ip = %ip, "sandbox running");
                Ok(running)
            }
            Err(e) => {
                tracing::error!(sandbox_id = %id, error = %e, "create failed, cleaning up");
                // Full destroy pipeline before surfacing the error: no
                // half-cloned domain, keys, or workspace may survive.
                if let Err(cleanup_err) = self.backend.destroy_sandbox(&sandbox).await {
                    if !cleanup_err.is_not_found() {
                        tracing::warn!(sandbox_id = %id, error = %cleanup_err, "partial cleanup failed");
                    }
                }
                if let Err(cleanup_err) = self.creds.cleanup_sandbox(&id).await {
                    tracing::warn!(sandbox_id = %id, error = %cleanup_err, "credential scrub failed");
                }
                let _ = self.store.delete_credentials(&id).await;
                let _ = self
                    .store
                    .transition_sandbox(&id, SandboxState::Errored, Some(&e.to_string()))
                    .await;
                self.audit(
                    "create_sandbox_failed",
                    serde_json::json!({"id": id, "error": e.to_string()}),
                );
                Err(e)
            }
        }
    }

    async fn provision(&self, sandbox: &Sandbox) -> Result<String> {
        self.store
            .transition_sandbox(&sandbox.id, SandboxState::Provisioning, None)
            .await?;

        // Issue credentials up front so the clone can inject the public key.
        let creds = self
            .creds
            .get_credentials(
                &sandbox.id,
                &sandbox.agent,
                &sandbox.source,
                self.creds.default_principal(),
            )
            .await?;
        self.store
            .upsert_credential(&CredentialRecord {
                sandbox_id: sandbox.id.clone(),
                principal: creds.principal.clone(),
                serial: creds.serial,
                issued_at: creds.issued_at,
                expires_at: creds.expires_at,
                key_path: creds.key_path.display().to_string(),
                cert_path: creds.cert_path.display().to_string(),
            })
            .await?;
        let public_key = std::fs::read_to_string(&creds.public_key_path)
            .map_err(|e| Error::internal(format!("read sandbox public key: {e}")))?;

        let outcome = self
            .backend
            .create_sandbox(&CloneRequest {
                sandbox_id: sandbox.id.clone(),
                name: sandbox.name.clone(),
                source: sandbox.source.clone(),
                vcpus: sandbox.vcpus,
                memory_mib: sandbox.memory_mib,
                ssh_public_key: Some(public_key.trim().to_string()),
                ip_timeout: self.cfg.ip_discovery_timeout,
            })
            .await?;

        let ip = match outcome.ip {
            Some(ip) => ip,
            None => {
                self.backend
                    .discover_ip(sandbox, self.cfg.ip_discovery_timeout)
                    .await?
            }
        };

        self.probe_guest(sandbox).await?;
        Ok(ip)
    }

    /// Probe with a trivial command, retrying transport errors on the
    /// backoff schedule. Application failures abort immediately.
    async fn probe_guest(&self, sandbox: &Sandbox) -> Result<()> {
        let mut last_err: Option<Error> = None;
        for (attempt, delay) in PROBE_BACKOFF.iter().enumerate() {
            match self.backend.exec_in_guest(sandbox, "true", PROBE_TIMEOUT).await {
                Ok(out) if out.success() => return Ok(()),
                Ok(out) => {
                    return Err(Error::provider(format!(
                        "guest probe exited {:?}: {}",
                        out.exit_code,
                        out.stderr_string()
                    )));
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(
                        sandbox = %sandbox.name,
                        attempt = attempt + 1,
                        error = %e,
                        "probe not ready, backing off"
                    );
                    last_err = Some(e);
                    tokio::time::sleep(*delay).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::transient("guest never became reachable")))
    }

    // ── Run ─────────────────────────────────────────────────────────

    /// Run a command inside a sandbox over its ephemeral credentials. The
    /// stored IP is never trusted; the backend re-discovers on each call.
    pub async fn run_command(&self, sandbox_id: &str, command: &str) -> Result<CommandOutput> {
        if command.trim().is_empty() {
            return Err(Error::invalid_input("command is required"));
        }
        let sandbox = self.store.get_sandbox(sandbox_id).await?;
        if sandbox.state != SandboxState::Running {
            return Err(Error::invalid_input(format!(
                "sandbox {sandbox_id} is {}, not RUNNING",
                sandbox.state
            )));
        }

        let lock = self.lock_for(sandbox_id);
        let _guard = lock.lock().await;

        let started_at = Utc::now();
        let t0 = tokio::time::Instant::now();
        let result = self
            .backend
            .exec_in_guest(&sandbox, command, self.cfg.command_timeout)
            .await;
        let duration_ms = t0.elapsed().as_millis() as i64;

        // One audit row per invocation, success or failure.
        let (exit_code, stdout, stderr) = match &result {
            Ok(out) => (
                out.exit_code,
                out.stdout_string(),
                out.stderr_string(),
            ),
            Err(e) => (None, String::new(), e.to_string()),
        };
        self.store
            .record_command(&CommandRecord {
                sandbox_id: sandbox_id.to_string(),
                command: command.to_string(),
                exit_code,
                stdout,
                stderr,
                started_at,
                duration_ms,
            })
            .await?;
        self.audit(
            "run_command",
            serde_json::json!({"id": sandbox_id, "command": command, "exit": exit_code}),
        );

        result
    }

    // ── Source VM (read-only plane) ─────────────────────────────────

    /// Validate through the client-side gate, then dispatch with the
    /// `fluid-readonly` credential path.
    pub async fn run_source_command(&self, source: &str, command: &str) -> Result<CommandOutput> {
        validate_read_only(command)?;
        let out = self
            .backend
            .run_source_command(source, command, self.cfg.command_timeout)
            .await?;
        self.audit(
            "run_source_command",
            serde_json::json!({"source": source, "command": command, "exit": out.exit_code}),
        );
        Ok(out)
    }

    /// Base64 round-trip file read, bounded before decode.
    pub async fn read_source_file(&self, source: &str, path: &str) -> Result<Vec<u8>> {
        if !path.starts_with('/') {
            return Err(Error::invalid_input(format!(
                "path must be absolute, got '{path}'"
            )));
        }
        let bytes = self
            .backend
            .read_source_file(source, path, self.cfg.max_source_file_bytes)
            .await?;
        self.audit(
            "read_source_file",
            serde_json::json!({"source": source, "path": path, "bytes": bytes.len()}),
        );
        Ok(bytes)
    }

    pub async fn prepare_source(
        &self,
        source: &str,
        ca_pub_key: &str,
        progress: Option<ProgressFn>,
    ) -> Result<PrepareOutcome> {
        self.backend.validate_source(source).await?;
        let outcome = self.backend.prepare_source(source, ca_pub_key, progress).await?;
        self.audit(
            "prepare_source",
            serde_json::json!({
                "source": source,
                "completed": outcome.completed_steps,
                "failed_step": outcome.failed_step,
            }),
        );
        Ok(outcome)
    }

    pub async fn list_sources(&self) -> Result<Vec<SourceVm>> {
        self.backend.list_templates().await
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    pub async fn stop_sandbox(&self, sandbox_id: &str, force: bool) -> Result<Sandbox> {
        let lock = self.lock_for(sandbox_id);
        let _guard = lock.lock().await;

        let sandbox = self.store.get_sandbox(sandbox_id).await?;
        self.store
            .transition_sandbox(sandbox_id, SandboxState::Stopping, None)
            .await?;
        match self.backend.stop(&sandbox, force).await {
            Ok(()) => {
                self.audit("stop_sandbox", serde_json::json!({"id": sandbox_id, "force": force}));
                self.store
                    .transition_sandbox(sandbox_id, SandboxState::Stopped, None)
                    .await
            }
            Err(e) => {
                let _ = self
                    .store
                    .transition_sandbox(sandbox_id, SandboxState::Errored, Some(&e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    pub async fn start_sandbox(&self, sandbox_id: &str) -> Result<Sandbox> {
        let lock = self.lock_for(sandbox_id);
        let _guard = lock.lock().await;

        let sandbox = self.store.get_sandbox(sandbox_id).await?;
        self.store
            .transition_sandbox(sandbox_id, SandboxState::Starting, None)
            .await?;

        let result = async {
            self.backend.start(&sandbox).await?;
            self.probe_guest(&sandbox).await?;
            self.backend
                .discover_ip(&sandbox, Duration::from_secs(30))
                .await
        }
        .await;

        match result {
            Ok(ip) => {
                self.store.update_sandbox_ip(sandbox_id, Some(&ip)).await?;
                self.audit("start_sandbox", serde_json::json!({"id": sandbox_id, "ip": ip}));
                self.store
                    .transition_sandbox(sandbox_id, SandboxState::Running, None)
                    .await
            }
            Err(e) => {
                let _ = self
                    .store
                    .transition_sandbox(sandbox_id, SandboxState::Errored, Some(&e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    pub async fn snapshot_sandbox(&self, sandbox_id: &str, name: &str) -> Result<Snapshot> {
        if name.is_empty() {
            return Err(Error::invalid_input("snapshot name is required"));
        }
        let lock = self.lock_for(sandbox_id);
        let _guard = lock.lock().await;

        let sandbox = self.store.get_sandbox(sandbox_id).await?;
        if !matches!(sandbox.state, SandboxState::Running | SandboxState::Stopped) {
            return Err(Error::invalid_input(format!(
                "sandbox {sandbox_id} is {}, cannot snapshot",
                sandbox.state
            )));
        }

        let kind = self.backend.snapshot(&sandbox, name).await?;
        let snapshot = Snapshot {
            id: new_snapshot_id(),
            sandbox_id: sandbox_id.to_string(),
            name: name.to_string(),
            kind,
            parent_id: None,
            created_at: Utc::now(),
        };
        self.store.insert_snapshot(&snapshot).await?;
        self.audit(
            "snapshot_sandbox",
            serde_json::json!({"id": sandbox_id, "snapshot": snapshot.id, "name": name}),
        );
        Ok(snapshot)
    }

    // ── Destroy ─────────────────────────────────────────────────────

    /// Destroy every layer in order, tolerating absence at each: provider
    /// object and storage, DHCP lease, credentials, workspace, store row.
    /// Calling it twice is success.
    pub async fn destroy_sandbox(&self, sandbox_id: &str) -> Result<()> {
        let lock = self.lock_for(sandbox_id);
        let _guard = lock.lock().await;

        let sandbox = match self.store.get_sandbox(sandbox_id).await {
            Ok(s) => s,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if sandbox.state == SandboxState::Destroyed {
            return Ok(());
        }

        self.store
            .transition_sandbox(sandbox_id, SandboxState::Destroying, None)
            .await?;

        match self.backend.destroy_sandbox(&sandbox).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                let _ = self
                    .store
                    .transition_sandbox(sandbox_id, SandboxState::Errored, Some(&e.to_string()))
                    .await;
                return Err(e);
            }
        }

        self.creds.cleanup_sandbox(sandbox_id).await?;
        self.store.delete_credentials(sandbox_id).await?;

        self.store
            .transition_sandbox(sandbox_id, SandboxState::Destroyed, None)
            .await?;
        self.store.soft_delete_sandbox(sandbox_id).await?;

        drop(_guard);
        self.drop_lock(sandbox_id);

        self.audit("destroy_sandbox", serde_json::json!({"id": sandbox_id}));
        tracing::info!(sandbox_id, "sandbox destroyed");
        Ok(())
    }

    /// Destroy a list sequentially with per-item progress and a hard
    /// per-item budget so one wedged host cannot stall the rest.
    pub async fn cleanup_with_progress(
        &self,
        sandbox_ids: &[String],
        callback: Option<CleanupFn>,
    ) -> CleanupSummary {
        let emit = |event: CleanupEvent| {
            if let Some(ref cb) = callback {
                cb(event);
            }
        };
        let mut summary = CleanupSummary::default();

        for id in sandbox_ids {
            let exists = matches!(self.store.get_sandbox(id).await, Ok(_));
            if !exists {
                summary.skipped += 1;
                emit(CleanupEvent::Item {
                    sandbox_id: id.clone(),
                    status: CleanupStatus::Skipped,
                    detail: Some("not in store".into()),
                });
                continue;
            }

            emit(CleanupEvent::Item {
                sandbox_id: id.clone(),
                status: CleanupStatus::Destroying,
                detail: None,
            });

            match tokio::time::timeout(CLEANUP_ITEM_TIMEOUT, self.destroy_sandbox(id)).await {
                Ok(Ok(())) => {
                    summary.destroyed += 1;
                    emit(CleanupEvent::Item {
                        sandbox_id: id.clone(),
                        status: CleanupStatus::Destroyed,
                        detail: None,
                    });
                }
                Ok(Err(e)) => {
                    summary.failed += 1;
                    emit(CleanupEvent::Item {
                        sandbox_id: id.clone(),
                        status: CleanupStatus::Failed,
                        detail: Some(e.to_string()),
                    });
                }
                Err(_) => {
                    summary.failed += 1;
                    emit(CleanupEvent::Item {
                        sandbox_id: id.clone(),
                        status: CleanupStatus::Failed,
                        detail: Some(format!(
                            "timed out after {}s",
                            CLEANUP_ITEM_TIMEOUT.as_secs()
                        )),
                    });
                }
            }
        }

        emit(CleanupEvent::Summary(summary));
        self.audit(
            "cleanup",
            serde_json::json!({
                "destroyed": summary.destroyed,
                "failed": summary.failed,
                "skipped": summary.skipped,
            }),
        );
        summary
    }

    // ── Recovery ────────────────────────────────────────────────────

    /// Reconcile the store against the provider after a restart. Rows with
    /// no provider object go to ERRORED; orphaned provider objects are
    /// logged and left for the operator.
    pub async fn recover_state(&self) -> Result<RecoveryReport> {
        let provider_names: HashSet<String> =
            self.backend.recover_state().await?.into_iter().collect();
        let rows = self
            .store
            .list_sandboxes(&SandboxFilter::non_terminal())
            .await?;

        let mut report = RecoveryReport::default();
        let mut store_names: HashSet<String> = HashSet::new();

        for row in rows {
            store_names.insert(row.name.clone());
            if !provider_names.contains(&row.name) {
                tracing::warn!(
                    sandbox_id = %row.id,
                    name = %row.name,
                    "provider object vanished, marking errored"
                );
                self.store
                    .transition_sandbox(&row.id, SandboxState::Errored, Some("provider object vanished"))
                    .await?;
                report.errored.push(row.id);
            }
        }

        for orphan in provider_names.difference(&store_names) {
            tracing::warn!(name = %orphan, "provider object has no store row; leaving untouched");
            report.orphans.push(orphan.clone());
        }

        self.audit(
            "recover_state",
            serde_json::json!({
                "errored": report.errored,
                "orphans": report.orphans,
            }),
        );
        Ok(report)
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub async fn get_sandbox(&self, sandbox_id: &str) -> Result<Sandbox> {
        self.store.get_sandbox(sandbox_id).await
    }

    pub async fn list_sandboxes(&self, filter: &SandboxFilter) -> Result<Vec<Sandbox>> {
        self.store.list_sandboxes(filter).await
    }

    pub async fn list_snapshots(&self, sandbox_id: &str) -> Result<Vec<Snapshot>> {
        self.store.list_snapshots(sandbox_id).await
    }

    pub async fn list_commands(&self, sandbox_id: &str, limit: usize) -> Result<Vec<CommandRecord>> {
        self.store.list_commands(sandbox_id, limit).await
    }
}
