//! Control-plane backend: a thin JSON-over-HTTP client implementing the
//! same provider contract against a remote fluid control plane.
//!
//! No local state beyond the HTTP client; every call maps one-to-one onto
//! an API endpoint. Its existence keeps the provider trait honest: the
//! conformance surface is transport-independent.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::gate::prepare::{PrepareOutcome, ProgressFn};
use crate::host::CommandOutput;
use crate::model::{Sandbox, SnapshotKind, SourceVm, SourceVmState};
use crate::provider::{
    Backend, Capabilities, CloneOutcome, CloneRequest, ProviderKind, decode_bounded_base64,
};

#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    pub url: String,
    pub api_token: Option<String>,
    pub request_timeout: Duration,
}

pub struct ControlPlaneBackend {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct CreateRequestBody<'a> {
    sandbox_id: &'a str,
    name: &'a str,
    source: &'a str,
    vcpus: u32,
    memory_mib: u32,
    ssh_public_key: Option<&'a str>,
    ip_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct CreateResponseBody {
    ip: Option<String>,
    mac: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IpResponseBody {
    ip: String,
}

#[derive(Debug, Serialize)]
struct ExecRequestBody<'a> {
    command: &'a str,
    timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct ExecResponseBody {
    exit_code: Option<i32>,
    stdout_b64: String,
    stderr_b64: String,
}

#[derive(Debug, Deserialize)]
struct TemplateBody {
    name: String,
    state: String,
    prepared: bool,
    ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SnapshotResponseBody {
    kind: String,
}

#[derive(Debug, Deserialize)]
struct PrepareResponseBody {
    completed_steps: Vec<String>,
    failed_step: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileResponseBody {
    content_b64: String,
}

impl ControlPlaneBackend {
    pub fn new(cfg: ControlPlaneConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .map_err(|e| Error::internal(format!("build control-plane client: {e}")))?;
        Ok(Self {
            http,
            base: format!("{}/v1", cfg.url.trim_end_matches('/')),
            token: cfg.api_token,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{path}", self.base));
        if let Some(ref token) = self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn parse<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if status.as_u16() == 404 {
            return Err(Error::not_found("control plane: no such entity"));
        }
        if status.is_server_error() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::transient(format!("control plane {status}: {body}")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::provider(format!("control plane {status}: {body}")));
        }
        resp.json::<T>()
            .await
            .map_err(|e| Error::provider(format!("bad control-plane response: {e}")))
    }

    async fn expect_ok(resp: reqwest::Response) -> Result<()> {
        let status = resp.status();
        if status.as_u16() == 404 {
            return Err(Error::not_found("control plane: no such entity"));
        }
        if status.is_server_error() {
            return Err(Error::transient(format!("control plane {status}")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::provider(format!("control plane {status}: {body}")));
        }
        Ok(())
    }

    fn decode_output(body: ExecResponseBody) -> Result<CommandOutput> {
        use base64::Engine as _;
        let engine = &base64::engine::general_purpose::STANDARD;
        Ok(CommandOutput {
            exit_code: body.exit_code,
            stdout: engine
                .decode(&body.stdout_b64)
                .map_err(|e| Error::provider(format!("bad stdout encoding: {e}")))?,
            stderr: engine
                .decode(&body.stderr_b64)
                .map_err(|e| Error::provider(format!("bad stderr encoding: {e}")))?,
        })
    }
}

#[async_trait]
impl Backend for ControlPlaneBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ControlPlane
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            snapshots: true,
            native_exec: true,
            source_prepare: true,
        }
    }

    async fn create_sandbox(&self, req: &CloneRequest) -> Result<CloneOutcome> {
        let body = CreateRequestBody {
            sandbox_id: &req.sandbox_id,
            name: &req.name,
            source: &req.source,
            vcpus: req.vcpus,
            memory_mib: req.memory_mib,
            ssh_public_key: req.ssh_public_key.as_deref(),
            ip_timeout_secs: req.ip_timeout.as_secs(),
        };
        let resp = self
            .request(reqwest::Method::POST, "/sandboxes")
            .json(&body)
            .send()
            .await?;
        let created: CreateResponseBody = Self::parse(resp).await?;
        Ok(CloneOutcome {
            ip: created.ip,
            mac: created.mac,
        })
    }

    async fn destroy_sandbox(&self, sandbox: &Sandbox) -> Result<()> {
        let resp = self
            .request(
                reqwest::Method::DELETE,
                &format!("/sandboxes/{}", sandbox.name),
            )
            .send()
            .await?;
        match Self::expect_ok(resp).await {
            Ok(()) => Ok(()),
            // Already gone upstream; destroy stays idempotent.
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn start(&self, sandbox: &Sandbox) -> Result<()> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/sandboxes/{}/start", sandbox.name),
            )
            .send()
            .await?;
        Self::expect_ok(resp).await
    }

    async fn stop(&self, sandbox: &Sandbox, force: bool) -> Result<()> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/sandboxes/{}/stop?force={force}", sandbox.name),
            )
            .send()
            .await?;
        Self::expect_ok(resp).await
    }

    async fn snapshot(&self, sandbox: &Sandbox, name: &str) -> Result<SnapshotKind> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/sandboxes/{}/snapshots", sandbox.name),
            )
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await?;
        let body: SnapshotResponseBody = Self::parse(resp).await?;
        Ok(SnapshotKind::parse(&body.kind).unwrap_or(SnapshotKind::Internal))
    }

    async fn discover_ip(&self, sandbox: &Sandbox, timeout: Duration) -> Result<String> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!(
                    "/sandboxes/{}/ip?timeout_secs={}",
                    sandbox.name,
                    timeout.as_secs()
                ),
            )
            .send()
            .await?;
        let body: IpResponseBody = Self::parse(resp).await?;
        Ok(body.ip)
    }

    async fn exec_in_guest(
        &self,
        sandbox: &Sandbox,
        cmd: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/sandboxes/{}/exec", sandbox.name),
            )
            .json(&ExecRequestBody {
                command: cmd,
                timeout_secs: timeout.as_secs(),
            })
            .send()
            .await?;
        let body: ExecResponseBody = Self::parse(resp).await?;
        Self::decode_output(body)
    }

    async fn list_templates(&self) -> Result<Vec<SourceVm>> {
        let resp = self
            .request(reqwest::Method::GET, "/templates")
            .send()
            .await?;
        let body: Vec<TemplateBody> = Self::parse(resp).await?;
        Ok(body
            .into_iter()
            .map(|t| SourceVm {
                state: match t.state.as_str() {
                    "running" => SourceVmState::Running,
                    "stopped" => SourceVmState::Stopped,
                    _ => SourceVmState::Unknown,
                },
                name: t.name,
                prepared: t.prepared,
                ip: t.ip,
            })
            .collect())
    }

    async fn list_sandboxes(&self) -> Result<Vec<String>> {
        let resp = self
            .request(reqwest::Method::GET, "/sandboxes")
            .send()
            .await?;
        Self::parse(resp).await
    }

    async fn validate_source(&self, source: &str) -> Result<()> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/sources/{source}"))
            .send()
            .await?;
        Self::expect_ok(resp).await
    }

    async fn prepare_source(
        &self,
        source: &str,
        ca_pub_key: &str,
        progress: Option<ProgressFn>,
    ) -> Result<PrepareOutcome> {
        // The remote side drives the steps; progress granularity collapses
        // to a single completion tick.
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/sources/{source}/prepare"),
            )
            .json(&serde_json::json!({ "ca_public_key": ca_pub_key }))
            .send()
            .await?;
        let body: PrepareResponseBody = Self::parse(resp).await?;
        let outcome = PrepareOutcome {
            completed_steps: body.completed_steps,
            failed_step: body.failed_step,
            error: body.error,
        };
        if let Some(cb) = progress {
            cb(crate::gate::prepare::PrepareProgress {
                step: outcome.completed_steps.len(),
                total_steps: outcome.completed_steps.len(),
                done: "remote prepare".into(),
            });
        }
        Ok(outcome)
    }

    async fn read_source_file(&self, source: &str, path: &str, max_bytes: u64) -> Result<Vec<u8>> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/sources/{source}/file"))
            .query(&[("path", path)])
            .send()
            .await?;
        let body: FileResponseBody = Self::parse(resp).await?;
        decode_bounded_base64(&body.content_b64, max_bytes)
    }

    async fn run_source_command(
        &self,
        source: &str,
        cmd: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/sources/{source}/command"),
            )
            .json(&ExecRequestBody {
                command: cmd,
                timeout_secs: timeout.as_secs(),
            })
            .send()
            .await?;
        let body: ExecResponseBody = Self::parse(resp).await?;
        Self::decode_output(body)
    }

    async fn recover_state(&self) -> Result<Vec<String>> {
        self.list_sandboxes().await
    }
}
