use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use tracing_subscriber::EnvFilter;

use fluid::ca::CertificateAuthority;
use fluid::config::{Config, config_dir, migrate_legacy};
use fluid::creds::{CredentialConfig, CredentialManager, DEFAULT_REFRESH_MARGIN};
use fluid::gate::prepare::{PrepareProgress, ProgressFn};
use fluid::provider::build_backend;
use fluid::service::{CleanupEvent, CleanupFn, CreateSandboxRequest, SandboxService};
use fluid::store::{DEFAULT_OUTPUT_CAP, SandboxFilter, Store};

#[derive(Parser)]
#[command(name = "fluid", about = "Agent sandbox lifecycle engine", version)]
struct Cli {
    /// Path to the config file (default: $XDG_CONFIG_HOME/fluid/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Clone a sandbox from a golden image and wait for SSH
    Create {
        #[arg(long)]
        source: String,
        #[arg(long, default_value = "cli")]
        agent: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        vcpus: Option<u32>,
        #[arg(long)]
        memory_mib: Option<u32>,
    },
    /// Run a command inside a running sandbox
    Run {
        id: String,
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Destroy a sandbox and every trace of it
    Destroy { id: String },
    /// List sandboxes
    List {
        /// Include soft-deleted rows
        #[arg(long)]
        all: bool,
    },
    /// Stop a running sandbox
    Stop {
        id: String,
        #[arg(long)]
        force: bool,
    },
    /// Start a stopped sandbox
    Start { id: String },
    /// Snapshot a sandbox
    Snapshot { id: String, name: String },
    /// List a sandbox's snapshots
    Snapshots { id: String },
    /// Show a sandbox's command history
    History {
        id: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// List golden images on the configured provider
    Sources,
    /// Install the read-only plane on a golden image (explicit opt-in)
    Prepare { source: String },
    /// Run a read-only command on a golden image
    SourceRun {
        source: String,
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Read a file from a golden image
    SourceRead { source: String, path: String },
    /// Reconcile the store against the provider after a restart
    Recover,
    /// Destroy a batch of sandboxes with progress
    Cleanup {
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fluid=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    // One-time move of pre-XDG state into the config dir.
    if let Some(home) = dirs::home_dir() {
        for warning in migrate_legacy(&home.join(".fluid"), &config_dir())
            .context("legacy state migration failed")?
        {
            tracing::warn!("{warning}");
        }
    }

    let (config, warnings) =
        Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    for warning in warnings {
        tracing::warn!("{warning}");
    }

    let (service, ca) = build_service(&config)?;

    match cli.command {
        Command::Create {
            source,
            agent,
            name,
            vcpus,
            memory_mib,
        } => {
            let sandbox = service
                .create_sandbox(CreateSandboxRequest {
                    source,
                    agent,
                    name,
                    vcpus,
                    memory_mib,
                })
                .await?;
            println!(
                "{}  {}  {}  {}",
                sandbox.id,
                sandbox.name,
                sandbox.state,
                sandbox.ip.as_deref().unwrap_or("-")
            );
        }
        Command::Run { id, command } => {
            let out = service.run_command(&id, &command.join(" ")).await?;
            print!("{}", String::from_utf8_lossy(&out.stdout));
            eprint!("{}", String::from_utf8_lossy(&out.stderr));
            std::process::exit(out.exit_code.unwrap_or(1));
        }
        Command::Destroy { id } => {
            service.destroy_sandbox(&id).await?;
            println!("destroyed {id}");
        }
        Command::List { all } => {
            let filter = SandboxFilter {
                include_deleted: all,
                ..Default::default()
            };
            for s in service.list_sandboxes(&filter).await? {
                println!(
                    "{}  {}  {}  {}  {}",
                    s.id,
                    s.name,
                    s.state,
                    s.ip.as_deref().unwrap_or("-"),
                    s.source
                );
            }
        }
        Command::Stop { id, force } => {
            let s = service.stop_sandbox(&id, force).await?;
            println!("{}  {}", s.id, s.state);
        }
        Command::Start { id } => {
            let s = service.start_sandbox(&id).await?;
            println!("{}  {}  {}", s.id, s.state, s.ip.as_deref().unwrap_or("-"));
        }
        Command::Snapshot { id, name } => {
            let snap = service.snapshot_sandbox(&id, &name).await?;
            println!("{}  {}  {}", snap.id, snap.name, snap.kind.as_str());
        }
        Command::Snapshots { id } => {
            for snap in service.list_snapshots(&id).await? {
                println!("{}  {}  {}  {}", snap.id, snap.name, snap.kind.as_str(), snap.created_at);
            }
        }
        Command::History { id, limit } => {
            for rec in service.list_commands(&id, limit).await? {
                println!(
                    "{}  exit={}  {}",
                    rec.started_at,
                    rec.exit_code.map_or("-".into(), |c| c.to_string()),
                    rec.command
                );
            }
        }
        Command::Sources => {
            for source in service.list_sources().await? {
                println!(
                    "{}  {:?}  prepared={}  {}",
                    source.name,
                    source.state,
                    source.prepared,
                    source.ip.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Prepare { source } => {
            let progress: ProgressFn = Arc::new(|p: PrepareProgress| {
                println!("[{}/{}] {}", p.step, p.total_steps, p.done);
            });
            let outcome = service
                .prepare_source(&source, ca.public_key_openssh(), Some(progress))
                .await?;
            if outcome.is_complete() {
                println!("prepared {source}");
            } else {
                anyhow::bail!(
                    "prepare halted at '{}': {}",
                    outcome.failed_step.unwrap_or_default(),
                    outcome.error.unwrap_or_default()
                );
            }
        }
        Command::SourceRun { source, command } => {
            let out = service
                .run_source_command(&source, &command.join(" "))
                .await?;
            print!("{}", String::from_utf8_lossy(&out.stdout));
            eprint!("{}", String::from_utf8_lossy(&out.stderr));
            std::process::exit(out.exit_code.unwrap_or(1));
        }
        Command::SourceRead { source, path } => {
            let bytes = service.read_source_file(&source, &path).await?;
            use std::io::Write as _;
            std::io::stdout().write_all(&bytes)?;
        }
        Command::Recover => {
            let report = service.recover_state().await?;
            println!(
                "errored: {}  orphans: {}",
                report.errored.len(),
                report.orphans.len()
            );
            for id in report.errored {
                println!("errored {id}");
            }
            for name in report.orphans {
                println!("orphan {name}");
            }
        }
        Command::Cleanup { ids } => {
            let cb: CleanupFn = Arc::new(|event: CleanupEvent| match event {
                CleanupEvent::Item {
                    sandbox_id,
                    status,
                    detail,
                } => println!(
                    "{sandbox_id}: {status:?}{}",
                    detail.map(|d| format!(" ({d})")).unwrap_or_default()
                ),
                CleanupEvent::Summary(s) => println!(
                    "destroyed={} failed={} skipped={}",
                    s.destroyed, s.failed, s.skipped
                ),
            });
            let summary = service.cleanup_with_progress(&ids, Some(cb)).await;
            if summary.failed > 0 {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn build_service(config: &Config) -> Result<(Arc<SandboxService>, Arc<CertificateAuthority>)> {
    let ca = Arc::new(
        CertificateAuthority::load_or_generate(
            &config.ca_key_path(),
            Duration::from_secs(config.ssh.default_ttl_secs),
            Duration::from_secs(config.ssh.max_ttl_secs),
        )
        .context("failed to initialize the certificate authority")?,
    );
    let creds = Arc::new(CredentialManager::new(
        ca.clone(),
        CredentialConfig {
            key_dir: config.key_dir(),
            ttl: Duration::from_secs(config.ssh.default_ttl_secs),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            default_principal: config.ssh.default_principal.clone(),
        },
    ));
    let store = Arc::new(
        Store::open(&config.state_db_path(), DEFAULT_OUTPUT_CAP)
            .context("failed to open the state store")?,
    );
    let backend = build_backend(config, creds.clone())?;
    let service = Arc::new(SandboxService::new(
        backend,
        store,
        creds,
        config.service_config(),
    ));
    Ok((service, ca))
}
