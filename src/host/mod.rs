//! Host executor: run a shell command against a host context.
//!
//! Three contexts exist: `Local` (spawn a shell child process), `Ssh`
//! (direct SSH session), and `SshJump` (SSH through a proxy jump host).
//! Every SSH invocation uses strict option defaults: accept-new host keys,
//! 15-second connect timeout, batch mode, no agent/port/X11 forwarding.
//!
//! Transport failures (spawn error, timeout, SSH exit 255) come back as
//! `Error::Transient`; a non-zero exit from the remote program is not an
//! error here; it is data in the returned [`CommandOutput`].

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::{Error, Result};

/// SSH connect timeout baked into every invocation.
pub const SSH_CONNECT_TIMEOUT_SECS: u32 = 15;

// ── Targets ─────────────────────────────────────────────────────────

/// An SSH endpoint plus optional identity material.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub user: String,
    pub host: String,
    pub port: u16,
    /// Private key to present; when unset the default keys / agent apply.
    pub key_path: Option<PathBuf>,
    /// OpenSSH certificate presented alongside the key.
    pub cert_path: Option<PathBuf>,
}

impl SshTarget {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port: 22,
            key_path: None,
            cert_path: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_identity(mut self, key: PathBuf, cert: Option<PathBuf>) -> Self {
        self.key_path = Some(key);
        self.cert_path = cert;
        self
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Where a command runs.
#[derive(Debug, Clone)]
pub enum HostContext {
    /// Spawn a shell child process on this machine.
    Local,
    /// Open an SSH session to `user@host:port`.
    Ssh(SshTarget),
    /// Same, but through a proxy jump host.
    SshJump { target: SshTarget, jump: SshTarget },
}

impl HostContext {
    fn is_ssh(&self) -> bool {
        !matches!(self, HostContext::Local)
    }
}

// ── Output ──────────────────────────────────────────────────────────

/// Captured result of one command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Promote a non-zero exit into a provider error.
    pub fn check(&self) -> Result<()> {
        if self.success() {
            Ok(())
        } else {
            Err(Error::provider(format!(
                "command failed: code={:?}, stderr={}",
                self.exit_code,
                self.stderr_string()
            )))
        }
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

// ── Executor ────────────────────────────────────────────────────────

/// Run `cmd` through the login shell of the given context, capturing output.
///
/// The command string reaches the remote side intact (it is passed as a
/// single argument, never re-tokenized locally).
pub async fn run(ctx: &HostContext, cmd: &str, timeout: Duration) -> Result<CommandOutput> {
    let (program, args) = build_invocation(ctx, cmd);

    let mut command = tokio::process::Command::new(&program);
    command
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => return Err(Error::transient(format!("failed to spawn {program}: {e}"))),
        Err(_) => {
            return Err(Error::transient(format!(
                "command timed out after {}s",
                timeout.as_secs()
            )));
        }
    };

    let result = CommandOutput {
        exit_code: output.status.code(),
        stdout: output.stdout,
        stderr: output.stderr,
    };

    // Exit 255 is the OpenSSH client's own failure code (refused, DNS,
    // auth, host unreachable): a transport error, not the program's.
    if ctx.is_ssh() && result.exit_code == Some(255) {
        return Err(Error::transient(format!(
            "ssh transport failure: {}",
            result.stderr_string()
        )));
    }

    Ok(result)
}

/// Run `cmd` as root on the remote side.
///
/// The command is base64-encoded locally and piped through
/// `base64 -d | sudo bash` so quoting survives any number of shell layers;
/// heredocs, embedded quotes, and newlines all arrive intact.
pub async fn run_sudo(ctx: &HostContext, cmd: &str, timeout: Duration) -> Result<CommandOutput> {
    run(ctx, &sudo_wrap(cmd), timeout).await
}

/// The base64-sudo wrapper used for every privileged remote step.
pub fn sudo_wrap(cmd: &str) -> String {
    format!("echo {} | base64 -d | sudo bash", BASE64.encode(cmd))
}

fn build_invocation(ctx: &HostContext, cmd: &str) -> (String, Vec<String>) {
    match ctx {
        HostContext::Local => ("bash".into(), vec!["-c".into(), cmd.to_string()]),
        HostContext::Ssh(target) => {
            let mut args = ssh_base_args(target);
            args.push(target.destination());
            args.push(cmd.to_string());
            ("ssh".into(), args)
        }
        HostContext::SshJump { target, jump } => {
            let mut args = ssh_base_args(target);
            args.push("-J".into());
            args.push(format!("{}@{}:{}", jump.user, jump.host, jump.port));
            args.push(target.destination());
            args.push(cmd.to_string());
            ("ssh".into(), args)
        }
    }
}

fn ssh_base_args(target: &SshTarget) -> Vec<String> {
    let mut args = vec![
        "-o".into(),
        "StrictHostKeyChecking=accept-new".into(),
        "-o".into(),
        format!("ConnectTimeout={SSH_CONNECT_TIMEOUT_SECS}"),
        "-o".into(),
        "BatchMode=yes".into(),
        "-o".into(),
        "ForwardAgent=no".into(),
        "-o".into(),
        "ForwardX11=no".into(),
        "-o".into(),
        "ClearAllForwardings=yes".into(),
        "-p".into(),
        target.port.to_string(),
    ];
    if let Some(ref key) = target.key_path {
        args.push("-i".into());
        args.push(key.to_string_lossy().to_string());
        args.push("-o".into());
        args.push("IdentitiesOnly=yes".into());
        if let Some(ref cert) = target.cert_path {
            args.push("-o".into());
            args.push(format!("CertificateFile={}", cert.display()));
        }
    }
    args
}

/// Shell quoting via the single-quote-with-replacement idiom.
///
/// Embedded single quotes become `'\''`; everything else is literal inside
/// single quotes, so `$`, backtick, `"` and `\` cannot expand or escape.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/' | b':' | b'@'))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_run_captures_stdout_and_exit() {
        let out = run(&HostContext::Local, "echo hello", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout_string(), "hello");
    }

    #[tokio::test]
    async fn local_run_nonzero_exit_is_data_not_error() {
        let out = run(&HostContext::Local, "exit 3", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert!(out.check().is_err());
    }

    #[tokio::test]
    async fn local_run_times_out() {
        let err = run(&HostContext::Local, "sleep 10", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn local_run_captures_stderr() {
        let out = run(
            &HostContext::Local,
            "echo oops 1>&2; exit 1",
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(out.exit_code, Some(1));
        assert_eq!(out.stderr_string(), "oops");
    }

    #[test]
    fn sudo_wrap_round_trips_through_base64() {
        let wrapped = sudo_wrap("echo 'it'\\''s' > /etc/motd");
        assert!(wrapped.starts_with("echo "));
        assert!(wrapped.ends_with(" | base64 -d | sudo bash"));
        let b64 = wrapped
            .trim_start_matches("echo ")
            .trim_end_matches(" | base64 -d | sudo bash");
        let decoded = BASE64.decode(b64).unwrap();
        assert_eq!(
            String::from_utf8(decoded).unwrap(),
            "echo 'it'\\''s' > /etc/motd"
        );
    }

    #[test]
    fn ssh_args_carry_strict_defaults() {
        let target = SshTarget::new("sandbox", "10.0.0.5").with_port(2222);
        let (program, args) = build_invocation(&HostContext::Ssh(target), "whoami");
        assert_eq!(program, "ssh");
        let joined = args.join(" ");
        assert!(joined.contains("StrictHostKeyChecking=accept-new"));
        assert!(joined.contains("BatchMode=yes"));
        assert!(joined.contains("ClearAllForwardings=yes"));
        assert!(joined.contains("ForwardAgent=no"));
        assert!(joined.contains("-p 2222"));
        assert_eq!(args.last().unwrap(), "whoami");
    }

    #[test]
    fn ssh_args_include_identity_and_certificate() {
        let target = SshTarget::new("sandbox", "10.0.0.5").with_identity(
            PathBuf::from("/keys/sbx-1/key"),
            Some(PathBuf::from("/keys/sbx-1/key-cert.pub")),
        );
        let (_, args) = build_invocation(&HostContext::Ssh(target), "true");
        let joined = args.join(" ");
        assert!(joined.contains("-i /keys/sbx-1/key"));
        assert!(joined.contains("IdentitiesOnly=yes"));
        assert!(joined.contains("CertificateFile=/keys/sbx-1/key-cert.pub"));
    }

    #[test]
    fn jump_context_adds_proxy_flag() {
        let target = SshTarget::new("sandbox", "10.0.0.5");
        let jump = SshTarget::new("ops", "bastion.example").with_port(2200);
        let (_, args) = build_invocation(&HostContext::SshJump { target, jump }, "true");
        let joined = args.join(" ");
        assert!(joined.contains("-J ops@bastion.example:2200"));
    }

    #[test]
    fn shell_quote_passes_safe_strings_through() {
        assert_eq!(shell_quote("hello"), "hello");
        assert_eq!(shell_quote("/var/lib/libvirt"), "/var/lib/libvirt");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn shell_quote_neutralizes_expansion() {
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
        assert_eq!(shell_quote("`whoami`"), "'`whoami`'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}
