//! libvirt/QEMU backend.
//!
//! Drives a hypervisor entirely through `virsh`, `qemu-img`, and
//! `genisoimage` over the host executor, so the same code manages a local
//! hypervisor or one reached over SSH. Cloning is copy-on-write: a QCOW2
//! overlay backed by the golden image, a fresh cloud-init seed ISO with a
//! new `instance-id`, and a rewritten domain XML with a regenerated MAC.
//!
//! Addresses are never cached: every flow re-reads the network's DHCP
//! leases so IP churn cannot hand out a stale address.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use regex::Regex;

use crate::creds::CredentialManager;
use crate::error::{Error, Result};
use crate::gate::prepare::{self, PrepareOutcome, ProgressFn};
use crate::host::{self, CommandOutput, HostContext, SshTarget, shell_quote};
use crate::model::{Sandbox, SnapshotKind, SourceVm, SourceVmState, short_token};
use crate::provider::resolver::ResolverCache;
use crate::provider::{
    Backend, Capabilities, CloneOutcome, CloneRequest, ProviderKind, SANDBOX_NAME_PREFIX,
    decode_bounded_base64,
};

/// Timeout for individual virsh/qemu-img invocations.
const TOOL_TIMEOUT: Duration = Duration::from_secs(60);
/// Timeout for each prepare step on the source VM.
const PREPARE_STEP_TIMEOUT: Duration = Duration::from_secs(120);
/// Lease poll interval.
const LEASE_POLL_INTERVAL: Duration = Duration::from_secs(3);
/// IP discovery budget outside the create flow.
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// How an SSH public key is placed into a clone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyInjection {
    CloudInit,
    VirtCustomize,
}

#[derive(Debug, Clone)]
pub struct LibvirtConfig {
    /// Connection URI, e.g. `qemu:///system`.
    pub uri: String,
    /// libvirt network whose DHCP leases we poll and scrub.
    pub network: String,
    /// Per-sandbox workspaces live under here on the hypervisor host.
    pub work_dir: PathBuf,
    /// Override for the network's dnsmasq status file.
    pub lease_file: Option<PathBuf>,
    pub key_injection: KeyInjection,
    /// When set, all hypervisor commands run over SSH on this host and
    /// guest SSH is proxied through it.
    pub remote_host: Option<SshTarget>,
    /// Account used for prepare on source VMs (needs sudo).
    pub source_admin_user: String,
}

pub struct LibvirtBackend {
    cfg: LibvirtConfig,
    host: HostContext,
    creds: Arc<CredentialManager>,
    /// source name → primary disk path, populated from domain XML.
    source_disks: ResolverCache<String>,
}

impl LibvirtBackend {
    pub fn new(cfg: LibvirtConfig, creds: Arc<CredentialManager>) -> Self {
        let host = match &cfg.remote_host {
            Some(target) => HostContext::Ssh(target.clone()),
            None => HostContext::Local,
        };
        Self {
            cfg,
            host,
            creds,
            source_disks: ResolverCache::new(),
        }
    }

    async fn virsh(&self, args: &[&str]) -> Result<CommandOutput> {
        let cmd = format!(
            "virsh -c {} {}",
            shell_quote(&self.cfg.uri),
            args.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" ")
        );
        host::run(&self.host, &cmd, TOOL_TIMEOUT).await
    }

    fn workspace(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(Error::invalid_input(format!(
                "unsafe sandbox name '{name}'"
            )));
        }
        Ok(self.cfg.work_dir.join(name))
    }

    fn lease_file(&self) -> PathBuf {
        self.cfg.lease_file.clone().unwrap_or_else(|| {
            PathBuf::from(format!(
                "/var/lib/libvirt/dnsmasq/{}.status",
                self.cfg.network
            ))
        })
    }

    /// Write arbitrary bytes to a path on the hypervisor host.
    async fn write_host_file(&self, path: &str, content: &str) -> Result<()> {
        let cmd = format!(
            "echo {} | base64 -d > {}",
            BASE64.encode(content),
            shell_quote(path)
        );
        host::run(&self.host, &cmd, TOOL_TIMEOUT).await?.check()
    }

    async fn resolve_source_disk(&self, source: &str) -> Result<String> {
        if let Some(disk) = self.source_disks.get(source).await {
            return Ok(disk);
        }
        let xml = self.dump_xml(source).await?;
        let disk = primary_disk_path(&xml)?;
        self.source_disks.insert(source, disk.clone()).await;
        Ok(disk)
    }

    async fn dump_xml(&self, domain: &str) -> Result<String> {
        let out = self.virsh(&["dumpxml", domain]).await?;
        if !out.success() {
            let stderr = out.stderr_string();
            if is_missing_domain(&stderr) {
                return Err(Error::not_found(format!("domain '{domain}'")));
            }
            return Err(Error::provider(format!("dumpxml {domain}: {stderr}")));
        }
        Ok(String::from_utf8_lossy(&out.stdout).to_string())
    }

    async fn domain_mac(&self, domain: &str) -> Result<String> {
        let xml = self.dump_xml(domain).await?;
        first_mac(&xml)
            .ok_or_else(|| Error::provider(format!("domain '{domain}' has no interface MAC")))
    }

    /// Best-effort cloud-init NoCloud seed. A missing `genisoimage` only
    /// delays or loses the IP; the clone still boots.
    async fn build_seed_iso(
        &self,
        workspace: &str,
        name: &str,
        mac: &str,
        ssh_public_key: Option<&str>,
    ) -> Result<String> {
        let meta = meta_data_doc(name);
        let user = user_data_doc(name, ssh_public_key);
        let net = network_config_doc(mac);

        self.write_host_file(&format!("{workspace}/meta-data"), &meta).await?;
        self.write_host_file(&format!("{workspace}/user-data"), &user).await?;
        self.write_host_file(&format!("{workspace}/network-config"), &net)
            .await?;

        let iso = format!("{workspace}/cloud-init.iso");
        let cmd = format!(
            "cd {} && genisoimage -output cloud-init.iso -volid cidata -joliet -rock user-data meta-data network-config",
            shell_quote(workspace)
        );
        host::run(&self.host, &cmd, TOOL_TIMEOUT).await?.check()?;
        Ok(iso)
    }

    async fn wait_for_lease(&self, mac: &str, timeout: Duration) -> Result<String> {
        let started = tokio::time::Instant::now();
        loop {
            let out = self
                .virsh(&["net-dhcp-leases", &self.cfg.network])
                .await?;
            if out.success() {
                if let Some(ip) = parse_lease_ip(&out.stdout_string(), mac) {
                    return Ok(ip);
                }
            }
            if started.elapsed() >= timeout {
                return Err(Error::transient(format!(
                    "no DHCP lease for {mac} within {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(LEASE_POLL_INTERVAL).await;
        }
    }

    /// Scrub every lease entry for `mac` from the network's dnsmasq status
    /// file. Stale leases collide with future clones reusing the address.
    async fn remove_lease(&self, mac: &str) -> Result<()> {
        let lease_file = self.lease_file();
        let lease_path = lease_file.to_string_lossy().to_string();

        let read = host::run_sudo(
            &self.host,
            &format!("cat {}", shell_quote(&lease_path)),
            TOOL_TIMEOUT,
        )
        .await?;
        if !read.success() {
            // No lease file means nothing to scrub.
            tracing::debug!(mac, file = %lease_path, "lease file absent, skipping scrub");
            return Ok(());
        }

        let raw = read.stdout_string();
        if raw.trim().is_empty() {
            return Ok(());
        }
        let filtered = filter_leases(&raw, mac)?;
        if filtered == raw.trim() {
            return Ok(());
        }

        let cmd = format!(
            "echo {} | base64 -d > {}",
            BASE64.encode(&filtered),
            shell_quote(&lease_path)
        );
        host::run_sudo(&self.host, &cmd, TOOL_TIMEOUT).await?.check()?;
        tracing::debug!(mac, file = %lease_path, "scrubbed DHCP lease");
        Ok(())
    }

    async fn source_ip(&self, source: &str) -> Result<String> {
        let out = self.virsh(&["domifaddr", source]).await?;
        if out.success() {
            if let Some(ip) = parse_first_ipv4(&out.stdout_string()) {
                return Ok(ip);
            }
        }
        // Fall back to the lease table keyed by the domain's MAC.
        let mac = self.domain_mac(source).await?;
        self.wait_for_lease(&mac, DEFAULT_DISCOVERY_TIMEOUT).await
    }

    fn guest_ctx(&self, principal: &str, ip: &str, key: PathBuf, cert: PathBuf) -> HostContext {
        let target = SshTarget::new(principal, ip).with_identity(key, Some(cert));
        match &self.cfg.remote_host {
            Some(jump) => HostContext::SshJump {
                target,
                jump: jump.clone(),
            },
            None => HostContext::Ssh(target),
        }
    }
}

#[async_trait]
impl Backend for LibvirtBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Libvirt
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            snapshots: true,
            native_exec: false,
            source_prepare: true,
        }
    }

    async fn create_sandbox(&self, req: &CloneRequest) -> Result<CloneOutcome> {
        self.validate_source(&req.source).await?;
        let disk = self.resolve_source_disk(&req.source).await?;

        let workspace = self.workspace(&req.name)?;
        let ws = workspace.to_string_lossy().to_string();
        host::run(&self.host, &format!("mkdir -p {}", shell_quote(&ws)), TOOL_TIMEOUT)
            .await?
            .check()?;

        // Constant-time copy-on-write clone of the golden disk.
        let overlay = format!("{ws}/disk-overlay.img");
        host::run(
            &self.host,
            &format!(
                "qemu-img create -f qcow2 -b {} -F qcow2 {}",
                shell_quote(&disk),
                shell_quote(&overlay)
            ),
            TOOL_TIMEOUT,
        )
        .await?
        .check()?;

        let mac = generate_mac()?;

        let cloud_init_key = match self.cfg.key_injection {
            KeyInjection::CloudInit => req.ssh_public_key.as_deref(),
            KeyInjection::VirtCustomize => None,
        };
        let iso = match self
            .build_seed_iso(&ws, &req.name, &mac, cloud_init_key)
            .await
        {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(
                    sandbox = %req.name,
                    error = %e,
                    "seed ISO generation failed; clone proceeds without cloud-init"
                );
                None
            }
        };

        if self.cfg.key_injection == KeyInjection::VirtCustomize {
            if let Some(ref key) = req.ssh_public_key {
                let cmd = format!(
                    "virt-customize -a {} --ssh-inject sandbox:string:{}",
                    shell_quote(&overlay),
                    shell_quote(key)
                );
                host::run(&self.host, &cmd, Duration::from_secs(300))
                    .await?
                    .check()?;
            }
        }

        let source_xml = self.dump_xml(&req.source).await?;
        let domain_xml = rewrite_domain_xml(&source_xml, &req.name, &overlay, &mac, iso.as_deref())?;
        let xml_path = format!("{ws}/domain.xml");
        self.write_host_file(&xml_path, &domain_xml).await?;

        self.virsh(&["define", &xml_path]).await?.check()?;
        self.virsh(&["start", &req.name]).await?.check()?;

        let ip = self.wait_for_lease(&mac, req.ip_timeout).await?;

        tracing::info!(
            sandbox = %req.name,
            source = %req.source,
            ip = %ip,
            mac = %mac,
            "cloned and started domain"
        );

        Ok(CloneOutcome {
            ip: Some(ip),
            mac: Some(mac),
        })
    }

    async fn destroy_sandbox(&self, sandbox: &Sandbox) -> Result<()> {
        let name = &sandbox.name;
        // Capture the MAC before the domain definition disappears.
        let mac = self.domain_mac(name).await.ok();

        // Force-stop; a domain that is not running is fine.
        let _ = self.virsh(&["destroy", name]).await;

        let undefine = self
            .virsh(&["undefine", name, "--remove-all-storage"])
            .await?;
        if !undefine.success() {
            let stderr = undefine.stderr_string();
            if !is_missing_domain(&stderr) {
                // Older hosts reject --remove-all-storage; undefine plain
                // and let the workspace delete below collect the overlay.
                let plain = self.virsh(&["undefine", name]).await?;
                if !plain.success() && !is_missing_domain(&plain.stderr_string()) {
                    return Err(Error::provider(format!(
                        "undefine {name}: {}",
                        plain.stderr_string()
                    )));
                }
            }
        }

        if let Some(mac) = mac {
            if let Err(e) = self.remove_lease(&mac).await {
                tracing::warn!(sandbox = %name, error = %e, "lease scrub failed");
            }
        }

        let workspace = self.workspace(name)?;
        host::run(
            &self.host,
            &format!("rm -rf {}", shell_quote(&workspace.to_string_lossy())),
            TOOL_TIMEOUT,
        )
        .await?
        .check()?;

        tracing::info!(sandbox = %name, "destroyed domain and workspace");
        Ok(())
    }

    async fn start(&self, sandbox: &Sandbox) -> Result<()> {
        let out = self.virsh(&["start", &sandbox.name]).await?;
        if !out.success() && !out.stderr_string().contains("already active") {
            return Err(Error::provider(format!(
                "start {}: {}",
                sandbox.name,
                out.stderr_string()
            )));
        }
        Ok(())
    }

    async fn stop(&self, sandbox: &Sandbox, force: bool) -> Result<()> {
        let verb = if force { "destroy" } else { "shutdown" };
        let out = self.virsh(&[verb, &sandbox.name]).await?;
        if !out.success() {
            let stderr = out.stderr_string();
            if stderr.contains("not running") || is_missing_domain(&stderr) {
                return Ok(());
            }
            return Err(Error::provider(format!("{verb} {}: {stderr}", sandbox.name)));
        }
        Ok(())
    }

    async fn snapshot(&self, sandbox: &Sandbox, name: &str) -> Result<SnapshotKind> {
        self.virsh(&["snapshot-create-as", &sandbox.name, name, "--atomic"])
            .await?
            .check()?;
        Ok(SnapshotKind::Internal)
    }

    async fn discover_ip(&self, sandbox: &Sandbox, timeout: Duration) -> Result<String> {
        let mac = self.domain_mac(&sandbox.name).await?;
        self.wait_for_lease(&mac, timeout).await
    }

    async fn exec_in_guest(
        &self,
        sandbox: &Sandbox,
        cmd: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let ip = self.discover_ip(sandbox, DEFAULT_DISCOVERY_TIMEOUT).await?;
        let principal = self.creds.default_principal().to_string();
        let creds = self
            .creds
            .get_credentials(&sandbox.id, &sandbox.agent, &sandbox.source, &principal)
            .await?;
        let ctx = self.guest_ctx(&creds.principal, &ip, creds.key_path.clone(), creds.cert_path.clone());
        host::run(&ctx, cmd, timeout).await
    }

    async fn list_templates(&self) -> Result<Vec<SourceVm>> {
        let out = self.virsh(&["list", "--all"]).await?;
        out.check()?;
        Ok(parse_domain_table(&out.stdout_string())
            .into_iter()
            .filter(|(name, _)| !name.starts_with(SANDBOX_NAME_PREFIX))
            .map(|(name, state)| SourceVm {
                name,
                state,
                prepared: false,
                ip: None,
            })
            .collect())
    }

    async fn list_sandboxes(&self) -> Result<Vec<String>> {
        let out = self.virsh(&["list", "--all", "--name"]).await?;
        out.check()?;
        Ok(out
            .stdout_string()
            .lines()
            .map(str::trim)
            .filter(|l| l.starts_with(SANDBOX_NAME_PREFIX))
            .map(String::from)
            .collect())
    }

    async fn validate_source(&self, source: &str) -> Result<()> {
        let out = self.virsh(&["dominfo", source]).await?;
        if !out.success() {
            return Err(Error::not_found(format!("source domain '{source}'")));
        }
        Ok(())
    }

    async fn prepare_source(
        &self,
        source: &str,
        ca_pub_key: &str,
        progress: Option<ProgressFn>,
    ) -> Result<PrepareOutcome> {
        let ip = self.source_ip(source).await?;
        let target = SshTarget::new(self.cfg.source_admin_user.clone(), ip);
        let ctx = match &self.cfg.remote_host {
            Some(jump) => HostContext::SshJump {
                target,
                jump: jump.clone(),
            },
            None => HostContext::Ssh(target),
        };
        prepare::prepare_source(&ctx, ca_pub_key, progress.as_ref(), PREPARE_STEP_TIMEOUT).await
    }

    async fn read_source_file(&self, source: &str, path: &str, max_bytes: u64) -> Result<Vec<u8>> {
        let cmd = format!("base64 {}", shell_quote(path));
        let out = self
            .run_source_command(source, &cmd, TOOL_TIMEOUT)
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
        let ip = self.source_ip(source).await?;
        let creds = self.creds.get_source_vm_credentials(source).await?;
        let ctx = self.guest_ctx(&creds.principal, &ip, creds.key_path.clone(), creds.cert_path.clone());
        host::run(&ctx, cmd, timeout).await
    }

    async fn recover_state(&self) -> Result<Vec<String>> {
        let names = self.list_sandboxes().await?;
        tracing::info!(count = names.len(), "recovered libvirt sandbox domains");
        Ok(names)
    }
}

// ── Pure helpers ────────────────────────────────────────────────────

fn re(pattern: &'static str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::internal(format!("regex '{pattern}': {e}")))
}

fn is_missing_domain(stderr: &str) -> bool {
    stderr.contains("failed to get domain") || stderr.contains("Domain not found")
}

/// QEMU/KVM locally administered MAC prefix with random tail.
fn generate_mac() -> Result<String> {
    let mut tail = [0u8; 3];
    getrandom::fill(&mut tail).map_err(|e| Error::internal(format!("random mac: {e}")))?;
    Ok(format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        tail[0], tail[1], tail[2]
    ))
}

/// First `<source file=...>` in the domain XML, the primary disk.
fn primary_disk_path(xml: &str) -> Result<String> {
    let pattern = re(r#"<source\s+file=['"]([^'"]+)['"]"#)?;
    pattern
        .captures(xml)
        .map(|c| c[1].to_string())
        .ok_or_else(|| Error::provider("source domain has no file-backed disk"))
}

fn first_mac(xml: &str) -> Option<String> {
    Regex::new(r#"<mac\s+address=['"]([0-9A-Fa-f:]+)['"]"#)
        .ok()?
        .captures(xml)
        .map(|c| c[1].to_lowercase())
}

/// Rewrite a golden domain definition for a clone: fresh name, no UUID,
/// overlay disk, regenerated MAC, seed ISO attached, and NIC PCI slots
/// stripped (clones collide on the source's slots).
fn rewrite_domain_xml(
    xml: &str,
    name: &str,
    overlay: &str,
    mac: &str,
    iso: Option<&str>,
) -> Result<String> {
    let mut out = re(r"<name>[^<]*</name>")?
        .replace(xml, format!("<name>{name}</name>").as_str())
        .into_owned();

    out = re(r"\s*<uuid>[^<]*</uuid>")?.replace(&out, "").into_owned();

    out = re(r#"<source\s+file=['"][^'"]+['"]"#)?
        .replace(&out, format!("<source file='{overlay}'").as_str())
        .into_owned();

    out = re(r#"<mac\s+address=['"][^'"]+['"]\s*/>"#)?
        .replace(&out, format!("<mac address='{mac}'/>").as_str())
        .into_owned();

    // Drop PCI address pins inside interface elements only.
    let iface_re = re(r"(?s)<interface\b.*?</interface>")?;
    let addr_re = re(r#"\s*<address\s+type=['"]pci['"][^>]*/>"#)?;
    out = iface_re
        .replace_all(&out, |caps: &regex::Captures<'_>| {
            addr_re.replace_all(&caps[0], "").into_owned()
        })
        .into_owned();

    if let Some(iso) = iso {
        let cdrom = format!(
            "    <disk type='file' device='cdrom'>\n      <driver name='qemu' type='raw'/>\n      <source file='{iso}'/>\n      <target dev='sdz' bus='sata'/>\n      <readonly/>\n    </disk>\n  </devices>"
        );
        out = out.replacen("</devices>", &cdrom, 1);
    }

    Ok(out)
}

/// A fresh `instance-id` is critical: without one cloud-init inside the
/// clone detects the source's prior state and skips network bring-up.
fn meta_data_doc(name: &str) -> String {
    format!("instance-id: {name}-{}\nlocal-hostname: {name}\n", short_token())
}

fn user_data_doc(name: &str, ssh_public_key: Option<&str>) -> String {
    let mut doc = format!("#cloud-config\nhostname: {name}\nmanage_etc_hosts: true\n");
    if let Some(key) = ssh_public_key {
        doc.push_str(&format!("ssh_authorized_keys:\n  - {}\n", key.trim()));
    }
    doc
}

fn network_config_doc(mac: &str) -> String {
    format!(
        "version: 2\nethernets:\n  primary:\n    match:\n      macaddress: \"{mac}\"\n    dhcp4: true\n"
    )
}

/// Pull the IP for `mac` out of `virsh net-dhcp-leases` output.
fn parse_lease_ip(output: &str, mac: &str) -> Option<String> {
    let mac = mac.to_lowercase();
    let ip_re = Regex::new(r"(\d{1,3}(?:\.\d{1,3}){3})(?:/\d+)?").ok()?;
    for line in output.lines() {
        if line.to_lowercase().contains(&mac) {
            if let Some(caps) = ip_re.captures(line) {
                return Some(caps[1].to_string());
            }
        }
    }
    None
}

/// First IPv4 in `virsh domifaddr` output, skipping loopback.
fn parse_first_ipv4(output: &str) -> Option<String> {
    let ip_re = Regex::new(r"(\d{1,3}(?:\.\d{1,3}){3})(?:/\d+)?").ok()?;
    for line in output.lines() {
        if let Some(caps) = ip_re.captures(line) {
            let ip = caps[1].to_string();
            if !ip.starts_with("127.") {
                return Some(ip);
            }
        }
    }
    None
}

/// Parse the `virsh list --all` table into (name, state) pairs.
fn parse_domain_table(output: &str) -> Vec<(String, SourceVmState)> {
    let mut result = Vec::new();
    for line in output.lines().skip(2) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 3 {
            continue;
        }
        let name = tokens[1].to_string();
        let state = match tokens[2..].join(" ").as_str() {
            "running" => SourceVmState::Running,
            "shut off" => SourceVmState::Stopped,
            _ => SourceVmState::Unknown,
        };
        result.push((name, state));
    }
    result
}

/// Drop every entry for `mac` from a dnsmasq status file (a JSON array).
fn filter_leases(raw: &str, mac: &str) -> Result<String> {
    let mac = mac.to_lowercase();
    let entries: Vec<serde_json::Value> = serde_json::from_str(raw.trim())
        .map_err(|e| Error::provider(format!("unparseable lease file: {e}")))?;
    let kept: Vec<serde_json::Value> = entries
        .into_iter()
        .filter(|entry| {
            entry
                .get("mac-address")
                .and_then(|m| m.as_str())
                .map(|m| m.to_lowercase() != mac)
                .unwrap_or(true)
        })
        .collect();
    serde_json::to_string_pretty(&kept).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_XML: &str = r#"<domain type='kvm'>
  <name>ubuntu-base</name>
  <uuid>aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee</uuid>
  <memory unit='KiB'>2097152</memory>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/var/lib/libvirt/images/ubuntu-base.qcow2'/>
      <target dev='vda' bus='virtio'/>
      <address type='pci' domain='0x0000' bus='0x04' slot='0x00' function='0x0'/>
    </disk>
    <interface type='network'>
      <mac address='52:54:00:11:22:33'/>
      <source network='default'/>
      <model type='virtio'/>
      <address type='pci' domain='0x0000' bus='0x01' slot='0x00' function='0x0'/>
    </interface>
  </devices>
</domain>"#;

    #[test]
    fn extracts_primary_disk() {
        assert_eq!(
            primary_disk_path(SAMPLE_XML).unwrap(),
            "/var/lib/libvirt/images/ubuntu-base.qcow2"
        );
    }

    #[test]
    fn extracts_first_mac() {
        assert_eq!(first_mac(SAMPLE_XML).unwrap(), "52:54:00:11:22:33");
    }

    #[test]
    fn mac_generation_uses_qemu_prefix() {
        let mac = generate_mac().unwrap();
        assert!(mac.starts_with("52:54:00:"));
        assert_eq!(mac.len(), 17);
        assert_ne!(generate_mac().unwrap(), mac);
    }

    #[test]
    fn rewrite_replaces_identity_and_disk() {
        let out = rewrite_domain_xml(
            SAMPLE_XML,
            "sbx-clone",
            "/work/sbx-clone/disk-overlay.img",
            "52:54:00:aa:bb:cc",
            Some("/work/sbx-clone/cloud-init.iso"),
        )
        .unwrap();

        assert!(out.contains("<name>sbx-clone</name>"));
        assert!(!out.contains("<uuid>"));
        assert!(out.contains("<source file='/work/sbx-clone/disk-overlay.img'"));
        assert!(out.contains("<mac address='52:54:00:aa:bb:cc'/>"));
        assert!(out.contains("cloud-init.iso"));
        assert!(out.contains("device='cdrom'"));
    }

    #[test]
    fn rewrite_strips_pci_address_from_nic_but_not_disk() {
        let out = rewrite_domain_xml(SAMPLE_XML, "sbx-x", "/o.img", "52:54:00:00:00:01", None)
            .unwrap();
        // The NIC's PCI pin is gone; the disk's remains.
        let iface_block = out
            .split("<interface")
            .nth(1)
            .unwrap()
            .split("</interface>")
            .next()
            .unwrap();
        assert!(!iface_block.contains("type='pci'"));
        let disk_block = out.split("<disk").nth(1).unwrap().split("</disk>").next().unwrap();
        assert!(disk_block.contains("type='pci'"));
    }

    #[test]
    fn rewrite_without_iso_leaves_devices_untouched() {
        let out = rewrite_domain_xml(SAMPLE_XML, "sbx-y", "/o.img", "52:54:00:00:00:02", None)
            .unwrap();
        assert!(!out.contains("cdrom"));
    }

    #[test]
    fn meta_data_has_fresh_instance_id() {
        let a = meta_data_doc("sbx-a");
        let b = meta_data_doc("sbx-a");
        assert!(a.starts_with("instance-id: sbx-a-"));
        assert!(a.contains("local-hostname: sbx-a"));
        // Every seed gets a new instance-id even for the same name.
        assert_ne!(a, b);
    }

    #[test]
    fn user_data_injects_key_only_when_given() {
        let plain = user_data_doc("sbx-a", None);
        assert!(!plain.contains("ssh_authorized_keys"));
        let keyed = user_data_doc("sbx-a", Some("ssh-ed25519 AAAA key"));
        assert!(keyed.contains("ssh_authorized_keys:\n  - ssh-ed25519 AAAA key"));
    }

    #[test]
    fn network_config_matches_by_mac() {
        let doc = network_config_doc("52:54:00:aa:bb:cc");
        assert!(doc.contains("macaddress: \"52:54:00:aa:bb:cc\""));
        assert!(doc.contains("dhcp4: true"));
    }

    #[test]
    fn lease_parsing_finds_ip_for_mac() {
        let output = "\
 Expiry Time           MAC address         Protocol   IP address          Hostname   Client ID
-----------------------------------------------------------------------------------------------
 2031-01-01 10:00:00   52:54:00:aa:bb:cc   ipv4       192.168.122.57/24   sbx-a      -
 2031-01-01 10:05:00   52:54:00:dd:ee:ff   ipv4       192.168.122.58/24   sbx-b      -";
        assert_eq!(
            parse_lease_ip(output, "52:54:00:AA:BB:CC"),
            Some("192.168.122.57".to_string())
        );
        assert_eq!(parse_lease_ip(output, "52:54:00:00:00:00"), None);
    }

    #[test]
    fn domifaddr_parsing_skips_loopback() {
        let output = "\
 Name       MAC address          Protocol     Address
-------------------------------------------------------------------------------
 lo         00:00:00:00:00:00    ipv4         127.0.0.1/8
 vnet0      52:54:00:11:22:33    ipv4         192.168.122.10/24";
        assert_eq!(parse_first_ipv4(output), Some("192.168.122.10".to_string()));
    }

    #[test]
    fn domain_table_parsing() {
        let output = "\
 Id   Name          State
-----------------------------
 1    ubuntu-base   running
 -    debian-gold   shut off
 2    sbx-aabbcc    running";
        let domains = parse_domain_table(output);
        assert_eq!(domains.len(), 3);
        assert_eq!(domains[0], ("ubuntu-base".into(), SourceVmState::Running));
        assert_eq!(domains[1], ("debian-gold".into(), SourceVmState::Stopped));
    }

    #[test]
    fn lease_filter_drops_only_the_target_mac() {
        let raw = r#"[
  {"ip-address": "192.168.122.57", "mac-address": "52:54:00:aa:bb:cc", "hostname": "sbx-a"},
  {"ip-address": "192.168.122.58", "mac-address": "52:54:00:dd:ee:ff", "hostname": "sbx-b"}
]"#;
        let filtered = filter_leases(raw, "52:54:00:AA:BB:CC").unwrap();
        assert!(!filtered.contains("52:54:00:aa:bb:cc"));
        assert!(filtered.contains("52:54:00:dd:ee:ff"));

        let parsed: Vec<serde_json::Value> = serde_json::from_str(&filtered).unwrap();
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn workspace_rejects_traversal_names() {
        let cfg = LibvirtConfig {
            uri: "qemu:///system".into(),
            network: "default".into(),
            work_dir: "/var/lib/fluid".into(),
            lease_file: None,
            key_injection: KeyInjection::CloudInit,
            remote_host: None,
            source_admin_user: "root".into(),
        };
        let ca = Arc::new(
            crate::ca::CertificateAuthority::load_or_generate(
                &tempfile::tempdir().unwrap().path().join("ca"),
                crate::ca::DEFAULT_TTL,
                crate::ca::MAX_TTL,
            )
            .unwrap(),
        );
        let creds = Arc::new(CredentialManager::new(
            ca,
            crate::creds::CredentialConfig {
                key_dir: "/tmp/keys".into(),
                ttl: crate::ca::DEFAULT_TTL,
                refresh_margin: crate::creds::DEFAULT_REFRESH_MARGIN,
                default_principal: "sandbox".into(),
            },
        ));
        let backend = LibvirtBackend::new(cfg, creds);
        assert!(backend.workspace("sbx-ok").is_ok());
        assert!(backend.workspace("../escape").is_err());
        assert!(backend.workspace("a/b").is_err());
        assert!(backend.workspace("").is_err());
    }
}
