//! Configuration: a single YAML document plus explicit environment
//! overrides, resolved against XDG-style directories.
//!
//! Environment always wins over the file, and the override mapping is a
//! fixed list, no blanket pattern substitution. A config file that holds
//! secrets but is group/world readable produces a startup warning rather
//! than a hard failure.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::host::SshTarget;
use crate::provider::control_plane::ControlPlaneConfig;
use crate::provider::libvirt::{KeyInjection, LibvirtConfig};
use crate::provider::proxmox::{DEFAULT_VMID_RANGE, ProxmoxConfig};
use crate::service::ServiceConfig;

/// Sentinel written after a successful legacy migration.
const MIGRATION_SENTINEL: &str = ".migrated";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// One of `libvirt`, `proxmox-lxc`, `control-plane`.
    pub provider: String,
    pub libvirt: LibvirtSection,
    pub proxmox: ProxmoxSection,
    pub control_plane: ControlPlaneSection,
    pub defaults: DefaultsSection,
    pub ssh: SshSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: "libvirt".into(),
            libvirt: LibvirtSection::default(),
            proxmox: ProxmoxSection::default(),
            control_plane: ControlPlaneSection::default(),
            defaults: DefaultsSection::default(),
            ssh: SshSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LibvirtSection {
    pub uri: String,
    pub network: String,
    pub base_image_dir: PathBuf,
    pub work_dir: PathBuf,
    pub lease_file: Option<PathBuf>,
    /// `cloud-init` or `virt-customize`.
    pub key_injection: String,
    /// `user@host[:port]` when the hypervisor is reached over SSH.
    pub remote_host: Option<String>,
    pub source_admin_user: String,
}

impl Default for LibvirtSection {
    fn default() -> Self {
        Self {
            uri: "qemu:///system".into(),
            network: "default".into(),
            base_image_dir: "/var/lib/libvirt/images".into(),
            work_dir: "/var/lib/fluid/workspaces".into(),
            lease_file: None,
            key_injection: "cloud-init".into(),
            remote_host: None,
            source_admin_user: "root".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxmoxSection {
    pub host_url: String,
    pub token_id: String,
    pub token_secret: String,
    pub node: String,
    pub storage: Option<String>,
    pub bridge: String,
    /// Inclusive `[low, high]` VMID range reserved for sandboxes.
    pub vmid_range: [u32; 2],
    pub verify_tls: bool,
    pub request_timeout_secs: u64,
}

impl Default for ProxmoxSection {
    fn default() -> Self {
        Self {
            host_url: String::new(),
            token_id: String::new(),
            token_secret: String::new(),
            node: String::new(),
            storage: None,
            bridge: "vmbr0".into(),
            vmid_range: [DEFAULT_VMID_RANGE.0, DEFAULT_VMID_RANGE.1],
            verify_tls: true,
            request_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlPlaneSection {
    pub url: String,
    pub api_token: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for ControlPlaneSection {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_token: None,
            request_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DefaultsSection {
    pub vcpus: u32,
    pub memory_mib: u32,
    pub command_timeout_secs: u64,
    pub ip_discovery_timeout_secs: u64,
    pub max_source_file_mib: u64,
}

impl Default for DefaultsSection {
    fn default() -> Self {
        Self {
            vcpus: 2,
            memory_mib: 2048,
            command_timeout_secs: 120,
            ip_discovery_timeout_secs: 120,
            max_source_file_mib: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshSection {
    pub ca_key_path: Option<PathBuf>,
    pub key_dir: Option<PathBuf>,
    pub default_ttl_secs: u64,
    pub max_ttl_secs: u64,
    pub default_principal: String,
}

impl Default for SshSection {
    fn default() -> Self {
        Self {
            ca_key_path: None,
            key_dir: None,
            default_ttl_secs: 30 * 60,
            max_ttl_secs: 60 * 60,
            default_principal: "sandbox".into(),
        }
    }
}

// ── Directories ─────────────────────────────────────────────────────

/// `$XDG_CONFIG_HOME/fluid`, falling back to the platform config dir.
pub fn config_dir() -> PathBuf {
    if let Ok(base) = std::env::var("XDG_CONFIG_HOME") {
        if !base.is_empty() {
            return PathBuf::from(base).join("fluid");
        }
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fluid")
}

/// `$XDG_DATA_HOME/fluid`, falling back to the platform data dir.
pub fn data_dir() -> PathBuf {
    if let Ok(base) = std::env::var("XDG_DATA_HOME") {
        if !base.is_empty() {
            return PathBuf::from(base).join("fluid");
        }
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fluid")
}

impl Config {
    /// Load from `path` (or the default location), apply env overrides,
    /// and collect startup warnings. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<(Self, Vec<String>)> {
        let default_path = config_dir().join("config.yaml");
        let path = path.unwrap_or(&default_path);
        let mut warnings = Vec::new();

        let mut config = if path.exists() {
            let raw = fs::read_to_string(path)
                .map_err(|e| Error::internal(format!("read {}: {e}", path.display())))?;
            let config: Config = serde_yaml::from_str(&raw)
                .map_err(|e| Error::invalid_input(format!("parse {}: {e}", path.display())))?;
            if let Some(warning) = permission_warning(path, &config) {
                warnings.push(warning);
            }
            config
        } else {
            Config::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok((config, warnings))
    }

    /// The documented env→key mapping; env takes precedence over the file.
    pub fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_from(|key| std::env::var(key).ok().filter(|v| !v.is_empty()));
    }

    fn apply_env_overrides_from(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("FLUID_PROVIDER") {
            self.provider = v;
        }
        if let Some(v) = get("FLUID_LIBVIRT_URI") {
            self.libvirt.uri = v;
        }
        if let Some(v) = get("FLUID_LIBVIRT_NETWORK") {
            self.libvirt.network = v;
        }
        if let Some(v) = get("FLUID_PROXMOX_HOST") {
            self.proxmox.host_url = v;
        }
        if let Some(v) = get("FLUID_PROXMOX_TOKEN_ID") {
            self.proxmox.token_id = v;
        }
        if let Some(v) = get("FLUID_PROXMOX_TOKEN_SECRET") {
            self.proxmox.token_secret = v;
        }
        if let Some(v) = get("FLUID_PROXMOX_NODE") {
            self.proxmox.node = v;
        }
        if let Some(v) = get("FLUID_SSH_KEY_DIR") {
            self.ssh.key_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("FLUID_CONTROL_PLANE_URL") {
            self.control_plane.url = v;
        }
    }

    fn validate(&self) -> Result<()> {
        match self.provider.as_str() {
            "libvirt" => Ok(()),
            "proxmox-lxc" => {
                if self.proxmox.host_url.is_empty() {
                    return Err(Error::invalid_input("proxmox.host_url is required"));
                }
                if self.proxmox.token_id.is_empty() || self.proxmox.token_secret.is_empty() {
                    return Err(Error::invalid_input(
                        "proxmox.token_id and proxmox.token_secret are required",
                    ));
                }
                if self.proxmox.node.is_empty() {
                    return Err(Error::invalid_input("proxmox.node is required"));
                }
                if self.proxmox.vmid_range[0] > self.proxmox.vmid_range[1] {
                    return Err(Error::invalid_input("proxmox.vmid_range is inverted"));
                }
                Ok(())
            }
            "control-plane" => {
                if self.control_plane.url.is_empty() {
                    return Err(Error::invalid_input("control_plane.url is required"));
                }
                Ok(())
            }
            other => Err(Error::invalid_input(format!("unknown provider: {other}"))),
        }
    }

    pub fn has_secrets(&self) -> bool {
        !self.proxmox.token_secret.is_empty() || self.control_plane.api_token.is_some()
    }

    // ── Derived paths ───────────────────────────────────────────────

    pub fn ca_key_path(&self) -> PathBuf {
        self.ssh
            .ca_key_path
            .clone()
            .unwrap_or_else(|| config_dir().join("ssh-ca").join("ca"))
    }

    pub fn key_dir(&self) -> PathBuf {
        self.ssh
            .key_dir
            .clone()
            .unwrap_or_else(|| config_dir().join("sandbox-keys"))
    }

    pub fn state_db_path(&self) -> PathBuf {
        data_dir().join("state.db")
    }

    pub fn history_path(&self) -> PathBuf {
        data_dir().join("history")
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            default_vcpus: self.defaults.vcpus,
            default_memory_mib: self.defaults.memory_mib,
            command_timeout: Duration::from_secs(self.defaults.command_timeout_secs),
            ip_discovery_timeout: Duration::from_secs(self.defaults.ip_discovery_timeout_secs),
            max_source_file_bytes: self.defaults.max_source_file_mib * 1024 * 1024,
            history_path: Some(self.history_path()),
        }
    }
}

/// Warn when a secret-bearing config file is readable beyond its owner.
fn permission_warning(path: &Path, config: &Config) -> Option<String> {
    if !config.has_secrets() {
        return None;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(path).ok()?.permissions().mode() & 0o777;
        if mode != 0o600 {
            return Some(format!(
                "config file {} contains secrets but has mode {mode:o}; expected 0600",
                path.display()
            ));
        }
    }
    None
}

/// Parse `user@host[:port]` into an SSH target.
pub fn parse_ssh_host(spec: &str) -> Result<SshTarget> {
    let (user, rest) = spec
        .split_once('@')
        .ok_or_else(|| Error::invalid_input(format!("expected user@host[:port], got '{spec}'")))?;
    if user.is_empty() || rest.is_empty() {
        return Err(Error::invalid_input(format!(
            "expected user@host[:port], got '{spec}'"
        )));
    }
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| Error::invalid_input(format!("bad port in '{spec}'")))?;
            (host.to_string(), port)
        }
        None => (rest.to_string(), 22),
    };
    Ok(SshTarget::new(user, host).with_port(port))
}

// ── Provider config projection ──────────────────────────────────────

impl From<&LibvirtSection> for LibvirtConfig {
    fn from(section: &LibvirtSection) -> Self {
        let remote_host = section
            .remote_host
            .as_deref()
            .and_then(|spec| parse_ssh_host(spec).ok());
        LibvirtConfig {
            uri: section.uri.clone(),
            network: section.network.clone(),
            work_dir: section.work_dir.clone(),
            lease_file: section.lease_file.clone(),
            key_injection: match section.key_injection.as_str() {
                "virt-customize" => KeyInjection::VirtCustomize,
                _ => KeyInjection::CloudInit,
            },
            remote_host,
            source_admin_user: section.source_admin_user.clone(),
        }
    }
}

impl From<&ProxmoxSection> for ProxmoxConfig {
    fn from(section: &ProxmoxSection) -> Self {
        ProxmoxConfig {
            host_url: section.host_url.clone(),
            token_id: section.token_id.clone(),
            token_secret: section.token_secret.clone(),
            node: section.node.clone(),
            storage: section.storage.clone(),
            bridge: section.bridge.clone(),
            vmid_range: (section.vmid_range[0], section.vmid_range[1]),
            verify_tls: section.verify_tls,
            request_timeout: Duration::from_secs(section.request_timeout_secs),
        }
    }
}

impl From<&ControlPlaneSection> for ControlPlaneConfig {
    fn from(section: &ControlPlaneSection) -> Self {
        ControlPlaneConfig {
            url: section.url.clone(),
            api_token: section.api_token.clone(),
            request_timeout: Duration::from_secs(section.request_timeout_secs),
        }
    }
}

// ── Legacy migration ────────────────────────────────────────────────

/// Copy (never move) files from a legacy flat directory into the config
/// dir. The sentinel is written only when every copy succeeded, so a
/// partial run is restartable; each failed copy yields a warning.
pub fn migrate_legacy(legacy_dir: &Path, target_dir: &Path) -> Result<Vec<String>> {
    let sentinel = target_dir.join(MIGRATION_SENTINEL);
    if !legacy_dir.is_dir() || sentinel.exists() {
        return Ok(Vec::new());
    }

    fs::create_dir_all(target_dir)
        .map_err(|e| Error::internal(format!("create {}: {e}", target_dir.display())))?;

    let mut warnings = Vec::new();
    let mut copied = 0usize;
    let entries = fs::read_dir(legacy_dir)
        .map_err(|e| Error::internal(format!("read {}: {e}", legacy_dir.display())))?;

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warnings.push(format!("skipping unreadable legacy entry: {e}"));
                continue;
            }
        };
        let src = entry.path();
        if !src.is_file() {
            continue;
        }
        let dst = target_dir.join(entry.file_name());
        match fs::copy(&src, &dst) {
            Ok(_) => copied += 1,
            Err(e) => warnings.push(format!("failed to copy {}: {e}", src.display())),
        }
    }

    if warnings.is_empty() {
        fs::write(&sentinel, "")
            .map_err(|e| Error::internal(format!("write migration sentinel: {e}")))?;
        tracing::info!(
            from = %legacy_dir.display(),
            to = %target_dir.display(),
            copied,
            "migrated legacy state"
        );
    } else {
        tracing::warn!(
            from = %legacy_dir.display(),
            failures = warnings.len(),
            "legacy migration incomplete; sentinel withheld"
        );
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn parse(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn minimal_document_fills_defaults() {
        let config = parse("provider: libvirt\n");
        assert_eq!(config.provider, "libvirt");
        assert_eq!(config.libvirt.uri, "qemu:///system");
        assert_eq!(config.libvirt.network, "default");
        assert_eq!(config.defaults.vcpus, 2);
        assert_eq!(config.proxmox.vmid_range, [9000, 9999]);
        assert!(config.proxmox.verify_tls);
        assert_eq!(config.ssh.default_ttl_secs, 1800);
    }

    #[test]
    fn full_proxmox_document() {
        let config = parse(
            r#"
provider: proxmox-lxc
proxmox:
  host_url: https://pve.example:8006
  token_id: fluid@pam!svc
  token_secret: abc123
  node: pve1
  bridge: vmbr1
  vmid_range: [9100, 9199]
  verify_tls: false
  request_timeout_secs: 60
"#,
        );
        assert!(config.validate().is_ok());
        assert_eq!(config.proxmox.bridge, "vmbr1");
        assert!(!config.proxmox.verify_tls);
        assert!(config.has_secrets());

        let provider_cfg = ProxmoxConfig::from(&config.proxmox);
        assert_eq!(provider_cfg.vmid_range, (9100, 9199));
        assert_eq!(provider_cfg.request_timeout, Duration::from_secs(60));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: std::result::Result<Config, _> = serde_yaml::from_str("providr: libvirt\n");
        assert!(result.is_err());
    }

    #[test]
    fn validation_requires_proxmox_credentials() {
        let mut config = Config::default();
        config.provider = "proxmox-lxc".into();
        assert!(config.validate().is_err());

        config.proxmox.host_url = "https://pve:8006".into();
        config.proxmox.token_id = "t".into();
        config.proxmox.token_secret = "s".into();
        config.proxmox.node = "pve1".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_unknown_provider() {
        let mut config = Config::default();
        config.provider = "hyperv".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown provider"));
    }

    #[test]
    fn env_overrides_take_precedence() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("FLUID_PROVIDER", "proxmox-lxc"),
            ("FLUID_PROXMOX_HOST", "https://env-pve:8006"),
            ("FLUID_PROXMOX_TOKEN_SECRET", "env-secret"),
            ("FLUID_SSH_KEY_DIR", "/custom/keys"),
        ]);
        let mut config = parse("provider: libvirt\n");
        config.apply_env_overrides_from(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.provider, "proxmox-lxc");
        assert_eq!(config.proxmox.host_url, "https://env-pve:8006");
        assert_eq!(config.proxmox.token_secret, "env-secret");
        assert_eq!(config.ssh.key_dir.as_deref(), Some(Path::new("/custom/keys")));
    }

    #[test]
    fn ssh_host_parsing() {
        let target = parse_ssh_host("ops@hv1.example").unwrap();
        assert_eq!(target.user, "ops");
        assert_eq!(target.host, "hv1.example");
        assert_eq!(target.port, 22);

        let target = parse_ssh_host("root@10.0.0.9:2222").unwrap();
        assert_eq!(target.port, 2222);

        assert!(parse_ssh_host("no-user-here").is_err());
        assert!(parse_ssh_host("a@b:notaport").is_err());
    }

    #[test]
    fn libvirt_projection_parses_remote_host_and_injection() {
        let mut section = LibvirtSection::default();
        section.remote_host = Some("virt@hv.example:2200".into());
        section.key_injection = "virt-customize".into();
        let cfg = LibvirtConfig::from(&section);
        assert_eq!(cfg.key_injection, KeyInjection::VirtCustomize);
        let remote = cfg.remote_host.unwrap();
        assert_eq!(remote.user, "virt");
        assert_eq!(remote.port, 2200);
    }

    #[cfg(unix)]
    #[test]
    fn permission_warning_for_world_readable_secrets() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "provider: proxmox-lxc\nproxmox:\n  token_secret: shh\n",
        )
        .unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let config = parse("provider: proxmox-lxc\nproxmox:\n  token_secret: shh\n");
        let warning = permission_warning(&path, &config).unwrap();
        assert!(warning.contains("0600"));

        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
        assert!(permission_warning(&path, &config).is_none());
    }

    #[test]
    fn no_permission_warning_without_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "provider: libvirt\n").unwrap();
        let config = parse("provider: libvirt\n");
        assert!(permission_warning(&path, &config).is_none());
    }

    #[test]
    fn migration_copies_and_writes_sentinel() {
        let legacy = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        fs::write(legacy.path().join("ca"), "key material").unwrap();
        fs::write(legacy.path().join("config.yaml"), "provider: libvirt\n").unwrap();

        let warnings = migrate_legacy(legacy.path(), target.path()).unwrap();
        assert!(warnings.is_empty());
        assert!(target.path().join("ca").exists());
        assert!(target.path().join("config.yaml").exists());
        assert!(target.path().join(MIGRATION_SENTINEL).exists());
        // Copy, not move: the legacy files are untouched.
        assert!(legacy.path().join("ca").exists());
    }

    #[test]
    fn migration_is_a_noop_once_sentinel_exists() {
        let legacy = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        fs::write(legacy.path().join("ca"), "v1").unwrap();

        migrate_legacy(legacy.path(), target.path()).unwrap();
        // Mutate the legacy file; a second run must not overwrite.
        fs::write(legacy.path().join("ca"), "v2").unwrap();
        migrate_legacy(legacy.path(), target.path()).unwrap();
        assert_eq!(fs::read_to_string(target.path().join("ca")).unwrap(), "v1");
    }

    #[test]
    fn migration_without_legacy_dir_is_empty() {
        let target = tempfile::tempdir().unwrap();
        let warnings =
            migrate_legacy(Path::new("/nonexistent/.fluid"), target.path()).unwrap();
        assert!(warnings.is_empty());
        assert!(!target.path().join(MIGRATION_SENTINEL).exists());
    }
}
