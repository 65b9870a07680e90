//! Per-sandbox ephemeral credential lifecycle.
//!
//! Each sandbox gets a fresh Ed25519 keypair signed by the CA. Material is
//! cached in memory keyed by `(scope, principal)` and refreshed when the
//! certificate is within the refresh margin of expiry. Key directories are
//! sanitized so no caller-supplied name can escape the key dir, and cleanup
//! removes both the directory and the cache entry.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand_core::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey, PublicKey};
use tokio::sync::{Mutex, RwLock};

use crate::ca::{self, CertificateAuthority, build_identity};
use crate::error::{Error, Result};
use crate::model::short_token;

/// Fixed principal for read-only access to golden images.
pub const SOURCE_VM_PRINCIPAL: &str = "fluid-readonly";

/// Certificates closer than this to expiry are reissued.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(30);

/// Clock seam so expiry logic is testable without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// On-disk locations and validity facts for one issued credential.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub principal: String,
    pub key_path: PathBuf,
    pub public_key_path: PathBuf,
    pub cert_path: PathBuf,
    pub serial: u64,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CredentialConfig {
    /// Root under which per-sandbox key directories are created.
    pub key_dir: PathBuf,
    /// Requested certificate ttl (the CA clamps it).
    pub ttl: Duration,
    pub refresh_margin: Duration,
    /// In-guest principal for sandbox certificates.
    pub default_principal: String,
}

pub struct CredentialManager {
    ca: Arc<CertificateAuthority>,
    cfg: CredentialConfig,
    cache: RwLock<HashMap<String, Credentials>>,
    /// Map of per-cache-key mutexes. Each is held across
    /// check → miss → generate → insert so concurrent callers for the
    /// same key never issue duplicates, while unrelated keys proceed
    /// independently.
    issue_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    clock: Arc<dyn Clock>,
}

impl CredentialManager {
    pub fn new(ca: Arc<CertificateAuthority>, cfg: CredentialConfig) -> Self {
        Self::with_clock(ca, cfg, Arc::new(SystemClock))
    }

    pub fn with_clock(
        ca: Arc<CertificateAuthority>,
        cfg: CredentialConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ca,
            cfg,
            cache: RwLock::new(HashMap::new()),
            issue_locks: StdMutex::new(HashMap::new()),
            clock,
        }
    }

    /// The serialization point for one cache key. Callers get an `Arc` so
    /// a waiter is never left holding a dangling lock after eviction.
    fn lock_for(&self, cache_key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.issue_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(cache_key.to_string()).or_default().clone()
    }

    /// Credentials for a sandbox, minting fresh material when the cached
    /// certificate is absent or inside the refresh margin.
    pub async fn get_credentials(
        &self,
        sandbox_id: &str,
        agent: &str,
        vm: &str,
        principal: &str,
    ) -> Result<Credentials> {
        if sandbox_id.is_empty() {
            return Err(Error::invalid_input("sandbox id is required"));
        }
        let cache_key = format!("{sandbox_id}:{principal}");
        let leaf = sanitize(sandbox_id);
        self.get_or_issue(&cache_key, &leaf, agent, vm, sandbox_id, principal)
            .await
    }

    /// Credentials for talking to a golden image as `fluid-readonly`.
    /// Uses a distinct cache namespace so a sandbox named like a source
    /// cannot collide.
    pub async fn get_source_vm_credentials(&self, source_name: &str) -> Result<Credentials> {
        if source_name.is_empty() {
            return Err(Error::invalid_input("source name is required"));
        }
        let cache_key = format!("sourcevm:{source_name}");
        let leaf = format!("sourcevm-{}", sanitize(source_name));
        self.get_or_issue(
            &cache_key,
            &leaf,
            "operator",
            source_name,
            source_name,
            SOURCE_VM_PRINCIPAL,
        )
        .await
    }

    async fn get_or_issue(
        &self,
        cache_key: &str,
        leaf: &str,
        agent: &str,
        vm: &str,
        scope_id: &str,
        principal: &str,
    ) -> Result<Credentials> {
        // Serialize per key only; issuance for a different sandbox runs
        // concurrently.
        let lock = self.lock_for(cache_key);
        let _guard = lock.lock().await;
        let now = self.clock.now();

        if let Some(cached) = self.cache.read().await.get(cache_key) {
            let margin = chrono::Duration::seconds(self.cfg.refresh_margin.as_secs() as i64);
            if cached.expires_at - now > margin && cached.key_path.exists() {
                return Ok(cached.clone());
            }
        }

        let creds = self.issue(leaf, agent, vm, scope_id, principal, now).await?;
        self.cache
            .write()
            .await
            .insert(cache_key.to_string(), creds.clone());
        Ok(creds)
    }

    async fn issue(
        &self,
        leaf: &str,
        agent: &str,
        vm: &str,
        scope_id: &str,
        principal: &str,
        now: DateTime<Utc>,
    ) -> Result<Credentials> {
        let keypair = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .map_err(|e| Error::internal(format!("generate sandbox key: {e}")))?;
        let public = PublicKey::from(&keypair);

        let cert_id = short_token();
        let identity = build_identity(agent, vm, scope_id, &cert_id);
        let issued = self
            .ca
            .issue(&public, &[principal.to_string()], self.cfg.ttl, &identity, false, now)
            .await?;

        let dir = self.cfg.key_dir.join(leaf);
        fs::create_dir_all(&dir)
            .map_err(|e| Error::internal(format!("create key dir {}: {e}", dir.display())))?;
        ca::set_mode(&dir, 0o700)?;

        let key_path = dir.join("key");
        let public_key_path = dir.join("key.pub");
        let cert_path = dir.join("key-cert.pub");

        let pem = keypair
            .to_openssh(LineEnding::LF)
            .map_err(|e| Error::internal(format!("encode sandbox key: {e}")))?;
        fs::write(&key_path, pem.as_bytes())
            .map_err(|e| Error::internal(format!("write sandbox key: {e}")))?;
        ca::set_mode(&key_path, 0o600)?;

        let public_openssh = public
            .to_openssh()
            .map_err(|e| Error::internal(format!("encode public key: {e}")))?;
        fs::write(&public_key_path, format!("{public_openssh}\n"))
            .map_err(|e| Error::internal(format!("write public key: {e}")))?;
        fs::write(&cert_path, format!("{}\n", issued.openssh))
            .map_err(|e| Error::internal(format!("write certificate: {e}")))?;

        tracing::debug!(
            scope = scope_id,
            principal,
            serial = issued.serial,
            dir = %dir.display(),
            "issued sandbox credentials"
        );

        Ok(Credentials {
            principal: principal.to_string(),
            key_path,
            public_key_path,
            cert_path,
            serial: issued.serial,
            issued_at: issued.issued_at,
            expires_at: issued.expires_at,
        })
    }

    /// Principal used for sandbox SSH sessions.
    pub fn default_principal(&self) -> &str {
        &self.cfg.default_principal
    }

    /// Remove the sandbox's key directory and evict its cache entries and
    /// per-key locks. Succeeds when nothing exists; cleanup must be
    /// idempotent.
    pub async fn cleanup_sandbox(&self, sandbox_id: &str) -> Result<()> {
        let prefix = format!("{sandbox_id}:");
        self.cache.write().await.retain(|k, _| !k.starts_with(&prefix));
        {
            let mut locks = self.issue_locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|k, _| !k.starts_with(&prefix));
        }

        let dir = self.cfg.key_dir.join(sanitize(sandbox_id));
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::debug!(sandbox_id, dir = %dir.display(), "scrubbed credentials");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::internal(format!(
                "remove key dir {}: {e}",
                dir.display()
            ))),
        }
    }
}

/// Replace every character outside `[A-Za-z0-9._-]` with `_`.
///
/// The result is always a single path component: no separators, and a
/// leading-dot input cannot become `..` traversal because `/` and `\` are
/// substituted before joining.
pub fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        // "." and ".." would resolve to a directory, not a leaf.
        return format!("_{}", cleaned.len());
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::{DEFAULT_TTL, MAX_TTL};
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    struct FakeClock {
        now: StdMutex<DateTime<Utc>>,
    }

    impl FakeClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                now: StdMutex::new(Utc::now()),
            })
        }

        fn advance(&self, d: Duration) {
            let mut now = self.now.lock().unwrap();
            *now += chrono::Duration::seconds(d.as_secs() as i64);
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }

    fn manager(dir: &Path, clock: Arc<dyn Clock>) -> CredentialManager {
        let ca = Arc::new(
            CertificateAuthority::load_or_generate(&dir.join("ssh-ca/ca"), DEFAULT_TTL, MAX_TTL)
                .unwrap(),
        );
        CredentialManager::with_clock(
            ca,
            CredentialConfig {
                key_dir: dir.join("sandbox-keys"),
                ttl: DEFAULT_TTL,
                refresh_margin: DEFAULT_REFRESH_MARGIN,
                default_principal: "sandbox".into(),
            },
            clock,
        )
    }

    #[tokio::test]
    async fn issues_and_caches_until_refresh_margin() {
        let dir = tempdir().unwrap();
        let clock = FakeClock::new();
        let mgr = manager(dir.path(), clock.clone());

        let a = mgr
            .get_credentials("sbx-1", "agent", "ubuntu-base", "sandbox")
            .await
            .unwrap();
        assert!(a.key_path.exists());
        assert!(a.cert_path.exists());

        // 15 seconds later: same material.
        clock.advance(Duration::from_secs(15));
        let b = mgr
            .get_credentials("sbx-1", "agent", "ubuntu-base", "sandbox")
            .await
            .unwrap();
        assert_eq!(a.key_path, b.key_path);
        assert_eq!(a.serial, b.serial);

        // Past expiry minus margin: reissued with a greater serial.
        clock.advance(DEFAULT_TTL);
        let c = mgr
            .get_credentials("sbx-1", "agent", "ubuntu-base", "sandbox")
            .await
            .unwrap();
        assert!(c.serial > b.serial);
    }

    #[tokio::test]
    async fn freshness_always_exceeds_margin() {
        let dir = tempdir().unwrap();
        let clock = FakeClock::new();
        let mgr = manager(dir.path(), clock.clone());

        for _ in 0..4 {
            let creds = mgr
                .get_credentials("sbx-fresh", "agent", "vm", "sandbox")
                .await
                .unwrap();
            let remaining = creds.expires_at - clock.now();
            assert!(remaining >= chrono::Duration::seconds(30));
            clock.advance(Duration::from_secs(600));
        }
    }

    #[tokio::test]
    async fn concurrent_gets_return_identical_paths() {
        let dir = tempdir().unwrap();
        let mgr = Arc::new(manager(dir.path(), FakeClock::new()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let mgr = mgr.clone();
            handles.push(tokio::spawn(async move {
                mgr.get_credentials("sbx-par", "agent", "vm", "sandbox")
                    .await
                    .unwrap()
            }));
        }
        let mut serials = Vec::new();
        let mut paths = Vec::new();
        for h in handles {
            let c = h.await.unwrap();
            serials.push(c.serial);
            paths.push(c.key_path);
        }
        serials.dedup();
        paths.dedup();
        assert_eq!(serials.len(), 1, "thundering herd issued duplicates");
        assert_eq!(paths.len(), 1);
    }

    #[tokio::test]
    async fn issuance_for_distinct_keys_is_independent() {
        let dir = tempdir().unwrap();
        let mgr = Arc::new(manager(dir.path(), FakeClock::new()));

        // Hold sandbox A's per-key lock to model a slow in-flight
        // issuance for that key.
        let lock_a = mgr.lock_for("sbx-slow:sandbox");
        let guard = lock_a.lock().await;

        let mgr_a = mgr.clone();
        let blocked = tokio::spawn(async move {
            mgr_a
                .get_credentials("sbx-slow", "agent", "vm", "sandbox")
                .await
                .unwrap()
        });

        // An unrelated key must complete while A is still blocked.
        let b = tokio::time::timeout(
            Duration::from_secs(5),
            mgr.get_credentials("sbx-fast", "agent", "vm", "sandbox"),
        )
        .await
        .expect("distinct-key issuance serialized behind an unrelated lock")
        .unwrap();
        assert!(b.key_path.exists());
        assert!(!blocked.is_finished());

        drop(guard);
        let a = blocked.await.unwrap();
        assert!(a.key_path.exists());
        assert_ne!(a.key_path, b.key_path);
    }

    #[tokio::test]
    async fn source_vm_credentials_use_readonly_principal_and_namespace() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path(), FakeClock::new());

        let creds = mgr.get_source_vm_credentials("ubuntu-base").await.unwrap();
        assert_eq!(creds.principal, SOURCE_VM_PRINCIPAL);
        assert!(
            creds
                .key_path
                .to_string_lossy()
                .contains("sourcevm-ubuntu-base")
        );

        // A sandbox with the same literal name lands in a different dir.
        let sbx = mgr
            .get_credentials("ubuntu-base", "agent", "vm", "sandbox")
            .await
            .unwrap();
        assert_ne!(sbx.key_path, creds.key_path);
    }

    #[tokio::test]
    async fn cleanup_removes_dir_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path(), FakeClock::new());

        let creds = mgr
            .get_credentials("sbx-gone", "agent", "vm", "sandbox")
            .await
            .unwrap();
        assert!(creds.key_path.exists());

        mgr.cleanup_sandbox("sbx-gone").await.unwrap();
        assert!(!creds.key_path.exists());

        // Second cleanup of the same sandbox is success, not error.
        mgr.cleanup_sandbox("sbx-gone").await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn key_material_modes() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path(), FakeClock::new());
        let creds = mgr
            .get_credentials("sbx-mode", "agent", "vm", "sandbox")
            .await
            .unwrap();

        let key_mode =
            fs::metadata(&creds.key_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(key_mode, 0o600);
        let dir_mode = fs::metadata(creds.key_path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize("sbx-123"), "sbx-123");
        assert_eq!(sanitize("a/b/c"), "a_b_c");
        assert_eq!(sanitize("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize("name with spaces"), "name_with_spaces");
        assert_eq!(sanitize("semi;colon`tick`"), "semi_colon_tick_");
    }

    #[test]
    fn sanitized_leaf_is_always_a_direct_child() {
        let base = Path::new("/keys");
        for hostile in [
            "../escape",
            "..",
            ".",
            "a/../../b",
            "/absolute",
            "\\windows\\style",
            "",
            "nul\0byte",
        ] {
            let leaf = sanitize(hostile);
            assert!(!leaf.contains('/'), "{hostile:?} -> {leaf:?}");
            assert!(!leaf.contains('\\'), "{hostile:?} -> {leaf:?}");
            assert_ne!(leaf, "..");
            assert_ne!(leaf, ".");
            assert!(!leaf.is_empty());
            let joined = base.join(&leaf);
            assert_eq!(joined.parent(), Some(base), "{hostile:?} escaped");
        }
    }
}
