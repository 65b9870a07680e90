//! SSH certificate authority.
//!
//! Holds an Ed25519 signing keypair on disk and issues short-lived OpenSSH
//! user certificates. The private key file must be `0600` or `0400`; the
//! CA refuses to initialize otherwise. Serial numbers are strictly
//! monotonic, persisted to a serial file beside the key, and flushed before
//! a certificate is handed back so a crash cannot reuse one.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand_core::OsRng;
use ssh_key::certificate::{Builder as CertificateBuilder, CertType};
use ssh_key::{Algorithm, LineEnding, PrivateKey, PublicKey};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Default certificate lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);
/// Hard ceiling on certificate lifetime.
pub const MAX_TTL: Duration = Duration::from_secs(60 * 60);

/// Structured identity embedded in every certificate, carrying the full
/// causal chain for audit.
pub fn build_identity(agent: &str, vm: &str, sandbox: &str, cert_id: &str) -> String {
    format!("user:{agent}-vm:{vm}-sbx:{sandbox}-cert:{cert_id}")
}

/// A signed certificate plus the facts the caller persists.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    /// OpenSSH-encoded certificate, ready to write to `key-cert.pub`.
    pub openssh: String,
    pub serial: u64,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct CertificateAuthority {
    signing_key: PrivateKey,
    public_openssh: String,
    serial_path: PathBuf,
    serial_lock: Mutex<()>,
    default_ttl: Duration,
    max_ttl: Duration,
}

impl CertificateAuthority {
    /// Load the CA key from `key_path`, or generate a fresh Ed25519 pair
    /// (key `0600`, `ca.pub` written beside it) on first run.
    pub fn load_or_generate(
        key_path: &Path,
        default_ttl: Duration,
        max_ttl: Duration,
    ) -> Result<Self> {
        if default_ttl > max_ttl {
            return Err(Error::invalid_input(format!(
                "default ttl ({}s) exceeds max ttl ({}s)",
                default_ttl.as_secs(),
                max_ttl.as_secs()
            )));
        }
        let signing_key = if key_path.exists() {
            check_key_permissions(key_path)?;
            let pem = fs::read_to_string(key_path)
                .map_err(|e| Error::internal(format!("read CA key {}: {e}", key_path.display())))?;
            PrivateKey::from_openssh(&pem)
                .map_err(|e| Error::internal(format!("parse CA key: {e}")))?
        } else {
            generate_ca_key(key_path)?
        };

        let public_openssh = PublicKey::from(&signing_key)
            .to_openssh()
            .map_err(|e| Error::internal(format!("encode CA public key: {e}")))?;

        let serial_path = key_path.with_file_name("serial");

        Ok(Self {
            signing_key,
            public_openssh,
            serial_path,
            serial_lock: Mutex::new(()),
            default_ttl,
            max_ttl,
        })
    }

    /// The CA public key in OpenSSH format, distributed to golden images
    /// during prepare so their sshd trusts certificates we sign.
    pub fn public_key_openssh(&self) -> &str {
        &self.public_openssh
    }

    /// Sign `user_pub` as an OpenSSH user certificate.
    ///
    /// The requested ttl is clamped to `[default_ttl, max_ttl]`. No
    /// forwarding extensions are granted, and `permit-pty` only when asked.
    pub async fn issue(
        &self,
        user_pub: &PublicKey,
        principals: &[String],
        ttl: Duration,
        identity: &str,
        permit_pty: bool,
        now: DateTime<Utc>,
    ) -> Result<IssuedCertificate> {
        if principals.is_empty() {
            return Err(Error::invalid_input("certificate needs at least one principal"));
        }
        let ttl = ttl.clamp(self.default_ttl, self.max_ttl);
        let serial = self.next_serial().await?;

        let valid_after = now.timestamp() as u64;
        let valid_before = valid_after + ttl.as_secs();

        let mut builder = CertificateBuilder::new_with_random_nonce(
            &mut OsRng,
            user_pub.key_data().clone(),
            valid_after,
            valid_before,
        )
        .map_err(cert_err)?;
        builder.serial(serial).map_err(cert_err)?;
        builder.cert_type(CertType::User).map_err(cert_err)?;
        builder.key_id(identity).map_err(cert_err)?;
        for principal in principals {
            builder.valid_principal(principal.clone()).map_err(cert_err)?;
        }
        if permit_pty {
            builder.extension("permit-pty", "").map_err(cert_err)?;
        }

        let certificate = builder.sign(&self.signing_key).map_err(cert_err)?;
        let openssh = certificate
            .to_openssh()
            .map_err(|e| Error::internal(format!("encode certificate: {e}")))?;

        tracing::debug!(serial, identity, ttl_secs = ttl.as_secs(), "issued certificate");

        Ok(IssuedCertificate {
            openssh,
            serial,
            issued_at: now,
            expires_at: now + chrono::Duration::seconds(ttl.as_secs() as i64),
        })
    }

    /// Advance the serial file and flush it to disk before returning.
    async fn next_serial(&self) -> Result<u64> {
        let _guard = self.serial_lock.lock().await;
        let current = match fs::read_to_string(&self.serial_path) {
            Ok(s) => s
                .trim()
                .parse::<u64>()
                .map_err(|_| Error::internal(format!("corrupt serial file {}", self.serial_path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(Error::internal(format!("read serial file: {e}"))),
        };
        let next = current + 1;

        use std::io::Write as _;
        let mut f = fs::File::create(&self.serial_path)
            .map_err(|e| Error::internal(format!("write serial file: {e}")))?;
        write!(f, "{next}").map_err(|e| Error::internal(format!("write serial file: {e}")))?;
        f.sync_all()
            .map_err(|e| Error::internal(format!("flush serial file: {e}")))?;
        Ok(next)
    }
}

fn cert_err(e: ssh_key::Error) -> Error {
    Error::internal(format!("certificate build: {e}"))
}

fn generate_ca_key(key_path: &Path) -> Result<PrivateKey> {
    if let Some(parent) = key_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::internal(format!("create CA dir {}: {e}", parent.display())))?;
    }
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| Error::internal(format!("generate CA key: {e}")))?;
    let pem = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| Error::internal(format!("encode CA key: {e}")))?;
    fs::write(key_path, pem.as_bytes())
        .map_err(|e| Error::internal(format!("write CA key: {e}")))?;
    set_mode(key_path, 0o600)?;

    let pub_path = key_path.with_extension("pub");
    let public = PublicKey::from(&key)
        .to_openssh()
        .map_err(|e| Error::internal(format!("encode CA public key: {e}")))?;
    fs::write(&pub_path, format!("{public}\n"))
        .map_err(|e| Error::internal(format!("write CA public key: {e}")))?;

    tracing::info!(path = %key_path.display(), "generated new CA keypair");
    Ok(key)
}

/// Refuse keys readable by anyone but the owner.
fn check_key_permissions(key_path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(key_path)
            .map_err(|e| Error::internal(format!("stat CA key: {e}")))?
            .permissions()
            .mode()
            & 0o777;
        if mode != 0o600 && mode != 0o400 {
            return Err(Error::invalid_input(format!(
                "CA private key {} has mode {mode:o}; must be 0600 or 0400",
                key_path.display()
            )));
        }
    }
    Ok(())
}

pub(crate) fn set_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|e| Error::internal(format!("chmod {}: {e}", path.display())))?;
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}
