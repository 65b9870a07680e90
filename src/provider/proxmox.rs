//! Proxmox LXC backend.
//!
//! Talks to the Proxmox REST API with an API token. Mutating calls return a
//! task id which is polled on a 2-second tick until terminal; any
//! `exitstatus != "OK"` is a failure. 5xx and transport errors retry with
//! jittered exponential backoff, 4xx surfaces immediately. In-guest
//! execution uses `pct exec` on the node itself, so this backend runs
//! where that capability exists.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::gate::prepare::{self, PrepareOutcome, ProgressFn};
use crate::host::{self, CommandOutput, HostContext, shell_quote};
use crate::model::{Sandbox, SnapshotKind, SourceVm, SourceVmState};
use crate::provider::resolver::ResolverCache;
use crate::provider::{
    Backend, Capabilities, CloneOutcome, CloneRequest, ProviderKind, SANDBOX_NAME_PREFIX,
    decode_bounded_base64,
};

/// Default VMID range reserved for sandboxes.
pub const DEFAULT_VMID_RANGE: (u32, u32) = (9000, 9999);

const TASK_POLL_INTERVAL: Duration = Duration::from_secs(2);
const TASK_TIMEOUT: Duration = Duration::from_secs(300);
const IFACE_POLL_INTERVAL: Duration = Duration::from_secs(2);
const PCT_TIMEOUT: Duration = Duration::from_secs(60);
const PREPARE_STEP_TIMEOUT: Duration = Duration::from_secs(120);
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ProxmoxConfig {
    /// e.g. `https://pve.example:8006`
    pub host_url: String,
    /// `user@realm!tokenname`
    pub token_id: String,
    pub token_secret: String,
    pub node: String,
    /// Target storage for full clones; the node default when unset.
    pub storage: Option<String>,
    pub bridge: String,
    pub vmid_range: (u32, u32),
    pub verify_tls: bool,
    pub request_timeout: Duration,
}

// ── REST client ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Method {
    Get,
    Post,
    Put,
    Delete,
}

struct ProxmoxClient {
    http: reqwest::Client,
    base: String,
    auth: String,
    node: String,
}

impl ProxmoxClient {
    fn new(cfg: &ProxmoxConfig) -> Result<Self> {
        if !cfg.verify_tls {
            tracing::warn!(
                host = %cfg.host_url,
                "TLS verification is disabled for the Proxmox API"
            );
        }
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!cfg.verify_tls)
            .timeout(cfg.request_timeout)
            .build()
            .map_err(|e| Error::internal(format!("build proxmox http client: {e}")))?;
        Ok(Self {
            http,
            base: format!("{}/api2/json", cfg.host_url.trim_end_matches('/')),
            auth: format!("PVEAPIToken={}={}", cfg.token_id, cfg.token_secret),
            node: cfg.node.clone(),
        })
    }

    fn node_path(&self, suffix: &str) -> String {
        format!("/nodes/{}{suffix}", self.node)
    }

    /// One API call with retry on 5xx/transport; 4xx is surfaced at once.
    async fn request(
        &self,
        method: Method,
        path: &str,
        form: Option<&[(&str, String)]>,
    ) -> Result<serde_json::Value> {
        let url = format!("{}{path}", self.base);
        let mut last_transient: Option<Error> = None;

        for attempt in 1..=RETRY_ATTEMPTS {
            let mut builder = match method {
                Method::Get => self.http.get(&url),
                Method::Post => self.http.post(&url),
                Method::Put => self.http.put(&url),
                Method::Delete => self.http.delete(&url),
            };
            builder = builder.header("Authorization", &self.auth);
            if let Some(form) = form {
                builder = builder.form(form);
            }

            match builder.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body: serde_json::Value = resp
                            .json()
                            .await
                            .map_err(|e| Error::provider(format!("bad API response: {e}")))?;
                        return Ok(body.get("data").cloned().unwrap_or(serde_json::Value::Null));
                    }
                    let body = resp.text().await.unwrap_or_default();
                    if status.is_server_error() {
                        last_transient =
                            Some(Error::transient(format!("proxmox {status}: {body}")));
                    } else if status.as_u16() == 404 {
                        return Err(Error::not_found(format!("proxmox {path}")));
                    } else {
                        return Err(Error::provider(format!("proxmox {status}: {body}")));
                    }
                }
                Err(e) => {
                    last_transient = Some(e.into());
                }
            }

            if attempt < RETRY_ATTEMPTS {
                let delay = backoff_delay(attempt)?;
                tracing::debug!(
                    path,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying proxmox request"
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(last_transient
            .unwrap_or_else(|| Error::transient("proxmox request failed")))
    }

    /// Poll a task until terminal; anything but `exitstatus == "OK"` fails.
    async fn wait_task(&self, upid: &str, timeout: Duration) -> Result<()> {
        let path = self.node_path(&format!("/tasks/{upid}/status"));
        let started = tokio::time::Instant::now();
        loop {
            let status: TaskStatus = from_value(self.request(Method::Get, &path, None).await?)?;
            if status.status != "running" {
                return match status.exitstatus.as_deref() {
                    Some("OK") => Ok(()),
                    Some(err) => Err(Error::provider(format!("task {upid} failed: {err}"))),
                    None => Err(Error::provider(format!(
                        "task {upid} finished without an exit status"
                    ))),
                };
            }
            if started.elapsed() >= timeout {
                return Err(Error::transient(format!(
                    "task {upid} still running after {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(TASK_POLL_INTERVAL).await;
        }
    }

    /// A mutating call whose response is the task id to wait on.
    async fn run_task(
        &self,
        method: Method,
        path: &str,
        form: Option<&[(&str, String)]>,
    ) -> Result<()> {
        let data = self.request(method, path, form).await?;
        match data.as_str() {
            Some(upid) => self.wait_task(upid, TASK_TIMEOUT).await,
            // Some config calls complete synchronously with null data.
            None => Ok(()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LxcEntry {
    vmid: u32,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    template: Option<u8>,
}

fn from_value<T: serde::de::DeserializeOwned>(v: serde_json::Value) -> Result<T> {
    serde_json::from_value(v).map_err(|e| Error::provider(format!("unexpected API shape: {e}")))
}

/// Exponential backoff with ±10% jitter: 1 s base, doubling per attempt.
fn backoff_delay(attempt: u32) -> Result<Duration> {
    let base = RETRY_BASE.as_millis() as u64 * 2u64.pow(attempt - 1);
    let mut byte = [0u8; 1];
    getrandom::fill(&mut byte).map_err(|e| Error::internal(format!("jitter: {e}")))?;
    let jitter = 0.9 + (byte[0] as f64 / 255.0) * 0.2;
    Ok(Duration::from_millis((base as f64 * jitter) as u64))
}

/// Lowest unused VMID in the reserved range.
fn allocate_vmid(range: (u32, u32), used: &HashSet<u32>) -> Result<u32> {
    (range.0..=range.1)
        .find(|id| !used.contains(id))
        .ok_or_else(|| {
            Error::provider(format!(
                "sandbox VMID range {}..{} is exhausted",
                range.0, range.1
            ))
        })
}

/// First usable IPv4 from the container's interfaces payload: not
/// loopback, not link-local.
fn pick_container_ip(interfaces: &serde_json::Value) -> Option<String> {
    for iface in interfaces.as_array()? {
        let name = iface.get("name").and_then(|n| n.as_str()).unwrap_or("");
        if name == "lo" {
            continue;
        }
        let Some(inet) = iface.get("inet").and_then(|i| i.as_str()) else {
            continue;
        };
        let ip = inet.split('/').next().unwrap_or("");
        if ip.is_empty() || ip.starts_with("127.") || ip.starts_with("169.254.") {
            continue;
        }
        return Some(ip.to_string());
    }
    None
}

// ── Backend ─────────────────────────────────────────────────────────

pub struct ProxmoxLxcBackend {
    client: ProxmoxClient,
    cfg: ProxmoxConfig,
    /// Covers VMID allocation and clone start so two concurrent creates
    /// never pick the same id.
    alloc_lock: tokio::sync::Mutex<()>,
    /// sandbox name → vmid, re-seeded by recovery.
    vmids: ResolverCache<u32>,
    /// source name → vmid.
    sources: ResolverCache<u32>,
}

impl ProxmoxLxcBackend {
    pub fn new(cfg: ProxmoxConfig) -> Result<Self> {
        let client = ProxmoxClient::new(&cfg)?;
        Ok(Self {
            client,
            cfg,
            alloc_lock: tokio::sync::Mutex::new(()),
            vmids: ResolverCache::new(),
            sources: ResolverCache::new(),
        })
    }

    async fn list_lxc(&self) -> Result<Vec<LxcEntry>> {
        let data = self
            .client
            .request(Method::Get, &self.client.node_path("/lxc"), None)
            .await?;
        from_value(data)
    }

    async fn resolve_source(&self, source: &str) -> Result<u32> {
        if let Some(vmid) = self.sources.get(source).await {
            return Ok(vmid);
        }
        let entries = self.list_lxc().await?;
        self.sources
            .replace_all(entries.iter().filter_map(|e| {
                e.name
                    .clone()
                    .filter(|n| !n.starts_with(SANDBOX_NAME_PREFIX))
                    .map(|n| (n, e.vmid))
            }))
            .await;
        self.sources
            .get(source)
            .await
            .ok_or_else(|| Error::not_found(format!("source container '{source}'")))
    }

    async fn resolve_sandbox(&self, name: &str) -> Result<Option<u32>> {
        if let Some(vmid) = self.vmids.get(name).await {
            return Ok(Some(vmid));
        }
        let entries = self.list_lxc().await?;
        for entry in &entries {
            if entry.name.as_deref() == Some(name) {
                self.vmids.insert(name, entry.vmid).await;
                return Ok(Some(entry.vmid));
            }
        }
        Ok(None)
    }

    async fn require_sandbox(&self, name: &str) -> Result<u32> {
        self.resolve_sandbox(name)
            .await?
            .ok_or_else(|| Error::not_found(format!("container '{name}'")))
    }

    /// `pct exec` on the node; runs as root inside the container.
    async fn pct_exec(&self, vmid: u32, cmd: &str, timeout: Duration) -> Result<CommandOutput> {
        let full = format!("pct exec {vmid} -- sh -c {}", shell_quote(cmd));
        host::run(&HostContext::Local, &full, timeout).await
    }

    async fn poll_ip(&self, vmid: u32, timeout: Duration) -> Result<String> {
        let path = self.client.node_path(&format!("/lxc/{vmid}/interfaces"));
        let started = tokio::time::Instant::now();
        loop {
            match self.client.request(Method::Get, &path, None).await {
                Ok(data) => {
                    if let Some(ip) = pick_container_ip(&data) {
                        return Ok(ip);
                    }
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(vmid, error = %e, "interfaces poll failed, retrying");
                }
                Err(e) => return Err(e),
            }
            if started.elapsed() >= timeout {
                return Err(Error::transient(format!(
                    "container {vmid} had no usable IPv4 within {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(IFACE_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl Backend for ProxmoxLxcBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ProxmoxLxc
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            snapshots: true,
            native_exec: true,
            source_prepare: true,
        }
    }

    async fn create_sandbox(&self, req: &CloneRequest) -> Result<CloneOutcome> {
        let src_vmid = self.resolve_source(&req.source).await?;

        // Allocation and clone start under one mutex: the new VMID is only
        // visible to other allocators once the clone task exists.
        let vmid = {
            let _guard = self.alloc_lock.lock().await;
            let entries = self.list_lxc().await?;
            let used: HashSet<u32> = entries.iter().map(|e| e.vmid).collect();
            let vmid = allocate_vmid(self.cfg.vmid_range, &used)?;

            let mut form = vec![
                ("newid", vmid.to_string()),
                ("hostname", req.name.clone()),
                ("full", "1".to_string()),
            ];
            if let Some(ref storage) = self.cfg.storage {
                form.push(("storage", storage.clone()));
            }
            self.client
                .run_task(
                    Method::Post,
                    &self.client.node_path(&format!("/lxc/{src_vmid}/clone")),
                    Some(&form),
                )
                .await?;
            self.vmids.insert(&req.name, vmid).await;
            vmid
        };

        let mut config = vec![
            ("cores", req.vcpus.to_string()),
            ("memory", req.memory_mib.to_string()),
            (
                "net0",
                format!("name=eth0,bridge={},ip=dhcp", self.cfg.bridge),
            ),
        ];
        if let Some(ref key) = req.ssh_public_key {
            config.push(("ssh-public-keys", key.clone()));
        }
        self.client
            .run_task(
                Method::Put,
                &self.client.node_path(&format!("/lxc/{vmid}/config")),
                Some(&config),
            )
            .await?;

        self.client
            .run_task(
                Method::Post,
                &self.client.node_path(&format!("/lxc/{vmid}/status/start")),
                None,
            )
            .await?;

        let ip = self.poll_ip(vmid, req.ip_timeout).await?;

        tracing::info!(
            sandbox = %req.name,
            source = %req.source,
            vmid,
            ip = %ip,
            "cloned and started container"
        );

        Ok(CloneOutcome {
            ip: Some(ip),
            mac: None,
        })
    }

    async fn destroy_sandbox(&self, sandbox: &Sandbox) -> Result<()> {
        let Some(vmid) = self.resolve_sandbox(&sandbox.name).await? else {
            tracing::debug!(sandbox = %sandbox.name, "container already gone");
            return Ok(());
        };

        // Stop first; a container that is not running errors harmlessly.
        if let Err(e) = self
            .client
            .run_task(
                Method::Post,
                &self.client.node_path(&format!("/lxc/{vmid}/status/stop")),
                None,
            )
            .await
        {
            if !e.is_not_found() {
                tracing::debug!(vmid, error = %e, "stop before destroy failed");
            }
        }

        let result = self
            .client
            .run_task(
                Method::Delete,
                &self
                    .client
                    .node_path(&format!("/lxc/{vmid}?purge=1&destroy-unreferenced-disks=1")),
                None,
            )
            .await;
        match result {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        self.vmids.remove(&sandbox.name).await;
        tracing::info!(sandbox = %sandbox.name, vmid, "destroyed container");
        Ok(())
    }

    async fn start(&self, sandbox: &Sandbox) -> Result<()> {
        let vmid = self.require_sandbox(&sandbox.name).await?;
        self.client
            .run_task(
                Method::Post,
                &self.client.node_path(&format!("/lxc/{vmid}/status/start")),
                None,
            )
            .await
    }

    async fn stop(&self, sandbox: &Sandbox, force: bool) -> Result<()> {
        let vmid = self.require_sandbox(&sandbox.name).await?;
        let verb = if force { "stop" } else { "shutdown" };
        self.client
            .run_task(
                Method::Post,
                &self.client.node_path(&format!("/lxc/{vmid}/status/{verb}")),
                None,
            )
            .await
    }

    async fn snapshot(&self, sandbox: &Sandbox, name: &str) -> Result<SnapshotKind> {
        let vmid = self.require_sandbox(&sandbox.name).await?;
        self.client
            .run_task(
                Method::Post,
                &self.client.node_path(&format!("/lxc/{vmid}/snapshot")),
                Some(&[("snapname", name.to_string())]),
            )
            .await?;
        Ok(SnapshotKind::Internal)
    }

    async fn discover_ip(&self, sandbox: &Sandbox, timeout: Duration) -> Result<String> {
        let vmid = self.require_sandbox(&sandbox.name).await?;
        self.poll_ip(vmid, timeout).await
    }

    async fn exec_in_guest(
        &self,
        sandbox: &Sandbox,
        cmd: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let vmid = self.require_sandbox(&sandbox.name).await?;
        self.pct_exec(vmid, cmd, timeout).await
    }

    async fn list_templates(&self) -> Result<Vec<SourceVm>> {
        let entries = self.list_lxc().await?;
        Ok(entries
            .into_iter()
            .filter_map(|e| {
                let name = e.name.clone()?;
                if name.starts_with(SANDBOX_NAME_PREFIX) {
                    return None;
                }
                // Templates never run; report them as stopped.
                let state = if e.template == Some(1) {
                    SourceVmState::Stopped
                } else {
                    match e.status.as_deref() {
                        Some("running") => SourceVmState::Running,
                        Some("stopped") => SourceVmState::Stopped,
                        _ => SourceVmState::Unknown,
                    }
                };
                Some(SourceVm {
                    name,
                    state,
                    prepared: false,
                    ip: None,
                })
            })
            .collect())
    }

    async fn list_sandboxes(&self) -> Result<Vec<String>> {
        let entries = self.list_lxc().await?;
        Ok(entries
            .into_iter()
            .filter_map(|e| e.name)
            .filter(|n| n.starts_with(SANDBOX_NAME_PREFIX))
            .collect())
    }

    async fn validate_source(&self, source: &str) -> Result<()> {
        self.resolve_source(source).await.map(|_| ())
    }

    /// Opt-in only: mutating a golden container is never implied by clone.
    async fn prepare_source(
        &self,
        source: &str,
        ca_pub_key: &str,
        progress: Option<ProgressFn>,
    ) -> Result<PrepareOutcome> {
        let vmid = self.resolve_source(source).await?;
        prepare::run_prepare(ca_pub_key, progress.as_ref(), |script: String| async move {
            // pct exec already runs as root inside the container; the
            // base64 wrap still guards the heredoc content.
            let wrapped = format!("echo {} | base64 -d | bash", BASE64.encode(&script));
            self.pct_exec(vmid, &wrapped, PREPARE_STEP_TIMEOUT).await
        })
        .await
    }

    async fn read_source_file(&self, source: &str, path: &str, max_bytes: u64) -> Result<Vec<u8>> {
        let vmid = self.resolve_source(source).await?;
        let out = self
            .pct_exec(vmid, &format!("base64 {}", shell_quote(path)), PCT_TIMEOUT)
            .await?;
        if !out.success() {
            let stderr = out.stderr_string();
            if stderr.contains("No such file") {
                return Err(Error::not_found(format!("{path} on {source}")));
            }
            return Err(Error::provider(format!("read {path}: {stderr}")));
        }
        decode_bounded_base64(&out.stdout_string(), max_bytes)
    }

    async fn run_source_command(
        &self,
        source: &str,
        cmd: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let vmid = self.resolve_source(source).await?;
        self.pct_exec(vmid, cmd, timeout).await
    }

    async fn recover_state(&self) -> Result<Vec<String>> {
        let entries = self.list_lxc().await?;
        let mut names = Vec::new();
        for entry in entries {
            if let Some(name) = entry.name {
                if name.starts_with(SANDBOX_NAME_PREFIX) {
                    self.vmids.insert(name.clone(), entry.vmid).await;
                    names.push(name);
                }
            }
        }
        tracing::info!(count = names.len(), "recovered proxmox sandbox containers");
        Ok(names)
    }
}
