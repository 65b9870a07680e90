//! Golden-image preparation: install the restricted shell, the read-only
//! user, and CA trust on a source VM.
//!
//! Every step is transported as a base64-wrapped sudo command (see
//! [`crate::host::run_sudo`]) so heredocs with arbitrary script content
//! survive the SSH → shell → sudo layering intact. Steps report through an
//! optional progress callback so a UI can render progress without coupling
//! to the step list.

use std::sync::Arc;
use std::time::Duration;

use crate::creds::SOURCE_VM_PRINCIPAL;
use crate::error::Result;
use crate::gate::shell::{
    CA_TRUST_PATH, PRINCIPALS_DIR, READONLY_USER, RESTRICTED_SHELL_PATH, RESTRICTED_SHELL_SCRIPT,
};
use crate::host::{self, HostContext};

/// One progress tick per completed step.
#[derive(Debug, Clone)]
pub struct PrepareProgress {
    /// 1-based index of the step that just finished.
    pub step: usize,
    pub total_steps: usize,
    /// Human description of the finished step.
    pub done: String,
}

pub type ProgressFn = Arc<dyn Fn(PrepareProgress) + Send + Sync>;

/// What prepare managed to do. `failed_step`/`error` are set when the run
/// halted early; completed steps are accurate either way so the operator
/// can resume.
#[derive(Debug, Clone, Default)]
pub struct PrepareOutcome {
    pub completed_steps: Vec<String>,
    pub failed_step: Option<String>,
    pub error: Option<String>,
}

impl PrepareOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed_step.is_none()
    }
}

struct PrepareStep {
    name: &'static str,
    script: String,
    /// A failure here is logged and skipped rather than halting the run.
    fatal: bool,
}

fn build_steps(ca_pub_key: &str) -> Vec<PrepareStep> {
    let ca_pub_key = ca_pub_key.trim();
    vec![
        PrepareStep {
            name: "install restricted shell",
            script: format!(
                "cat > {RESTRICTED_SHELL_PATH} <<'FLUID_SHELL_EOF'\n{RESTRICTED_SHELL_SCRIPT}\nFLUID_SHELL_EOF\nchmod 0755 {RESTRICTED_SHELL_PATH}"
            ),
            fatal: true,
        },
        PrepareStep {
            name: "create read-only user",
            script: format!(
                "id -u {READONLY_USER} >/dev/null 2>&1 || useradd --create-home --shell {RESTRICTED_SHELL_PATH} {READONLY_USER}"
            ),
            fatal: true,
        },
        PrepareStep {
            name: "bind login shell",
            script: format!("usermod --shell {RESTRICTED_SHELL_PATH} {READONLY_USER}"),
            // Some images ship without usermod; the useradd default covers them.
            fatal: false,
        },
        PrepareStep {
            name: "install CA public key",
            script: format!(
                "cat > {CA_TRUST_PATH} <<'FLUID_CA_EOF'\n{ca_pub_key}\nFLUID_CA_EOF\nchmod 0644 {CA_TRUST_PATH}"
            ),
            fatal: true,
        },
        PrepareStep {
            name: "trust CA in sshd",
            script: format!(
                "grep -q '^TrustedUserCAKeys {CA_TRUST_PATH}' /etc/ssh/sshd_config || echo 'TrustedUserCAKeys {CA_TRUST_PATH}' >> /etc/ssh/sshd_config\n\
                 grep -q '^AuthorizedPrincipalsFile {PRINCIPALS_DIR}/%u' /etc/ssh/sshd_config || echo 'AuthorizedPrincipalsFile {PRINCIPALS_DIR}/%u' >> /etc/ssh/sshd_config"
            ),
            fatal: true,
        },
        PrepareStep {
            name: "write principals file",
            script: format!(
                "mkdir -p {PRINCIPALS_DIR}\nprintf 'sandbox\\n{SOURCE_VM_PRINCIPAL}\\n' > {PRINCIPALS_DIR}/{READONLY_USER}\nchmod 0644 {PRINCIPALS_DIR}/{READONLY_USER}"
            ),
            fatal: true,
        },
        PrepareStep {
            name: "restart sshd",
            script: "systemctl restart sshd 2>/dev/null || systemctl restart ssh 2>/dev/null || service ssh restart".into(),
            fatal: true,
        },
    ]
}

/// Run the full prepare sequence against `ctx` (the source VM itself).
pub async fn prepare_source(
    ctx: &HostContext,
    ca_pub_key: &str,
    progress: Option<&ProgressFn>,
    step_timeout: Duration,
) -> Result<PrepareOutcome> {
    let ctx = ctx.clone();
    run_prepare(ca_pub_key, progress, move |script: String| {
        let ctx = ctx.clone();
        async move { host::run_sudo(&ctx, &script, step_timeout).await }
    })
    .await
}

/// Generic step driver. Backends that cannot reach the image over SSH
/// (e.g. `pct exec` on a container host) supply their own transport; the
/// transport is expected to apply the base64 wrapping itself.
pub async fn run_prepare<F, Fut>(
    ca_pub_key: &str,
    progress: Option<&ProgressFn>,
    exec: F,
) -> Result<PrepareOutcome>
where
    F: Fn(String) -> Fut,
    Fut: std::future::Future<Output = Result<crate::host::CommandOutput>>,
{
    let steps = build_steps(ca_pub_key);
    let total = steps.len();
    let mut outcome = PrepareOutcome::default();

    for (idx, step) in steps.into_iter().enumerate() {
        tracing::debug!(step = step.name, "running prepare step");
        let result = exec(step.script.clone()).await;

        let failure = match result {
            Ok(out) if out.success() => None,
            Ok(out) => Some(format!(
                "exit {:?}: {}",
                out.exit_code,
                out.stderr_string()
            )),
            Err(e) => Some(e.to_string()),
        };

        match failure {
            None => {
                outcome.completed_steps.push(step.name.to_string());
                if let Some(cb) = progress {
                    cb(PrepareProgress {
                        step: idx + 1,
                        total_steps: total,
                        done: step.name.to_string(),
                    });
                }
            }
            Some(reason) if !step.fatal => {
                tracing::warn!(step = step.name, reason, "non-fatal prepare step failed");
                if let Some(cb) = progress {
                    cb(PrepareProgress {
                        step: idx + 1,
                        total_steps: total,
                        done: format!("{} (skipped)", step.name),
                    });
                }
            }
            Some(reason) => {
                tracing::error!(step = step.name, reason, "prepare halted");
                outcome.failed_step = Some(step.name.to_string());
                outcome.error = Some(reason);
                return Ok(outcome);
            }
        }
    }

    Ok(outcome)
}
