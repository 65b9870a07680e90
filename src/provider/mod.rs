//! Provider abstraction: one trait, three backends.
//!
//! Every backend honors the same externally visible contract, which makes
//! the trait the conformance seam: the service drives `dyn Backend` and a
//! single test suite can cover any implementation. The `control-plane`
//! variant is an ordinary implementation, not a special case.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::gate::prepare::{PrepareOutcome, ProgressFn};
use crate::host::CommandOutput;
use crate::model::{Sandbox, SnapshotKind, SourceVm};

pub mod control_plane;
pub mod libvirt;
pub mod proxmox;
pub mod resolver;

pub use control_plane::{ControlPlaneBackend, ControlPlaneConfig};
pub use libvirt::{LibvirtBackend, LibvirtConfig};
pub use proxmox::{ProxmoxConfig, ProxmoxLxcBackend};

/// Prefix every provider-side sandbox object carries, used for recovery.
pub const SANDBOX_NAME_PREFIX: &str = "sbx-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Libvirt,
    ProxmoxLxc,
    ControlPlane,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Libvirt => "libvirt",
            ProviderKind::ProxmoxLxc => "proxmox-lxc",
            ProviderKind::ControlPlane => "control-plane",
        }
    }
}

/// Capability flags the service consults before dispatching.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub snapshots: bool,
    /// The backend can execute in-guest without sandbox SSH credentials
    /// (e.g. `pct exec`). When false the service probes over SSH.
    pub native_exec: bool,
    /// The backend can install the read-only plane on golden images.
    pub source_prepare: bool,
}

/// Everything a backend needs to clone and boot one sandbox.
#[derive(Debug, Clone)]
pub struct CloneRequest {
    pub sandbox_id: String,
    /// Provider-side object name; always carries [`SANDBOX_NAME_PREFIX`].
    pub name: String,
    pub source: String,
    pub vcpus: u32,
    pub memory_mib: u32,
    /// Injected at clone time when the backend supports it.
    pub ssh_public_key: Option<String>,
    pub ip_timeout: Duration,
}

/// What the clone produced. The address is a hint; flows re-discover.
#[derive(Debug, Clone, Default)]
pub struct CloneOutcome {
    pub ip: Option<String>,
    pub mac: Option<String>,
}

/// The capability set every backend implements.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn capabilities(&self) -> Capabilities;

    /// Clone the source, boot it, and wait for an address (best-effort).
    async fn create_sandbox(&self, req: &CloneRequest) -> Result<CloneOutcome>;

    /// Remove the provider object and its storage. Must tolerate the
    /// object being already gone; destroy is idempotent.
    async fn destroy_sandbox(&self, sandbox: &Sandbox) -> Result<()>;

    async fn start(&self, sandbox: &Sandbox) -> Result<()>;

    async fn stop(&self, sandbox: &Sandbox, force: bool) -> Result<()>;

    async fn snapshot(&self, sandbox: &Sandbox, name: &str) -> Result<SnapshotKind>;

    /// Always re-discovers; never returns a cached address.
    async fn discover_ip(&self, sandbox: &Sandbox, timeout: Duration) -> Result<String>;

    async fn exec_in_guest(
        &self,
        sandbox: &Sandbox,
        cmd: &str,
        timeout: Duration,
    ) -> Result<CommandOutput>;

    async fn list_templates(&self) -> Result<Vec<SourceVm>>;

    /// Provider-side sandbox object names.
    async fn list_sandboxes(&self) -> Result<Vec<String>>;

    async fn validate_source(&self, source: &str) -> Result<()>;

    /// Install the read-only plane on a golden image. Strictly opt-in;
    /// cloning never implies it.
    async fn prepare_source(
        &self,
        source: &str,
        ca_pub_key: &str,
        progress: Option<ProgressFn>,
    ) -> Result<PrepareOutcome>;

    /// Read a file off a golden image via a base64 round-trip, bounded to
    /// `max_bytes` decoded.
    async fn read_source_file(&self, source: &str, path: &str, max_bytes: u64) -> Result<Vec<u8>>;

    /// Run an (already validated) command on a golden image.
    async fn run_source_command(
        &self,
        source: &str,
        cmd: &str,
        timeout: Duration,
    ) -> Result<CommandOutput>;

    /// Re-register provider-side sandboxes after a restart; returns their
    /// names so the service can reconcile the store.
    async fn recover_state(&self) -> Result<Vec<String>>;
}

/// Decode the output of a remote `base64 <path>` while enforcing the size
/// cap *before* decoding, so a pathological file cannot balloon memory.
pub(crate) fn decode_bounded_base64(encoded: &str, max_bytes: u64) -> Result<Vec<u8>> {
    use base64::Engine as _;

    // `base64` wraps lines; strip all whitespace before decoding.
    let compact: String = encoded.split_whitespace().collect();
    // Coarse pre-decode bound (padding makes it overshoot by up to 2);
    // the exact check below runs on the decoded bytes.
    let decoded_upper_bound = (compact.len() as u64 / 4) * 3;
    if decoded_upper_bound > max_bytes.saturating_add(2) {
        return Err(Error::invalid_input(format!(
            "file exceeds the {max_bytes}-byte read limit"
        )));
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| Error::provider(format!("remote base64 output was malformed: {e}")))?;
    if bytes.len() as u64 > max_bytes {
        return Err(Error::invalid_input(format!(
            "file exceeds the {max_bytes}-byte read limit"
        )));
    }
    Ok(bytes)
}

/// Instantiate the configured backend.
pub fn build_backend(
    cfg: &crate::config::Config,
    creds: Arc<crate::creds::CredentialManager>,
) -> Result<Arc<dyn Backend>> {
    match cfg.provider.as_str() {
        "libvirt" => {
            tracing::info!(uri = %cfg.libvirt.uri, "initializing libvirt backend");
            Ok(Arc::new(LibvirtBackend::new(
                LibvirtConfig::from(&cfg.libvirt),
                creds,
            )))
        }
        "proxmox-lxc" => {
            tracing::info!(host = %cfg.proxmox.host_url, "initializing proxmox-lxc backend");
            Ok(Arc::new(ProxmoxLxcBackend::new(ProxmoxConfig::from(
                &cfg.proxmox,
            ))?))
        }
        "control-plane" => {
            tracing::info!(url = %cfg.control_plane.url, "initializing control-plane backend");
            Ok(Arc::new(ControlPlaneBackend::new(ControlPlaneConfig::from(
                &cfg.control_plane,
            ))?))
        }
        other => Err(Error::invalid_input(format!("unknown provider: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    #[test]
    fn provider_kind_names() {
        assert_eq!(ProviderKind::Libvirt.as_str(), "libvirt");
        assert_eq!(ProviderKind::ProxmoxLxc.as_str(), "proxmox-lxc");
        assert_eq!(ProviderKind::ControlPlane.as_str(), "control-plane");
    }

    #[test]
    fn bounded_decode_round_trips_small_files() {
        let content = b"hello sandbox\n";
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);
        let decoded = decode_bounded_base64(&encoded, 1024).unwrap();
        assert_eq!(decoded, content);
    }

    #[test]
    fn bounded_decode_tolerates_line_wrapping() {
        let content = vec![0xABu8; 300];
        let encoded = base64::engine::general_purpose::STANDARD.encode(&content);
        // Re-wrap at 76 columns the way coreutils base64 does.
        let wrapped: String = encoded
            .as_bytes()
            .chunks(76)
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect::<Vec<_>>()
            .join("\n");
        let decoded = decode_bounded_base64(&wrapped, 1024).unwrap();
        assert_eq!(decoded, content);
    }

    #[test]
    fn bounded_decode_accepts_file_exactly_at_limit() {
        let content = vec![7u8; 1024];
        let encoded = base64::engine::general_purpose::STANDARD.encode(&content);
        let decoded = decode_bounded_base64(&encoded, 1024).unwrap();
        assert_eq!(decoded.len(), 1024);

        // One byte over is rejected.
        let over = vec![7u8; 1025];
        let encoded = base64::engine::general_purpose::STANDARD.encode(&over);
        assert!(decode_bounded_base64(&encoded, 1024).is_err());
    }

    #[test]
    fn bounded_decode_rejects_oversize_before_decoding() {
        let content = vec![1u8; 2048];
        let encoded = base64::engine::general_purpose::STANDARD.encode(&content);
        let err = decode_bounded_base64(&encoded, 1024).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(err.to_string().contains("read limit"));
    }

    #[test]
    fn bounded_decode_rejects_garbage() {
        let err = decode_bounded_base64("not!!valid@@base64", 1024).unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
    }
}
