use clap::{Parser, Subcommand};
use fleetrun::errors::FleetError;
use fleetrun::managers::channel::{SecureChannelBuilder, ServiceAction};
use fleetrun::constants::metadata;
use fleetrun::managers::credentials::CredentialReconciler;
use fleetrun::managers::dispatcher::{CancelToken, FleetDispatcher};
use fleetrun::managers::keys;
use fleetrun::model::{AgentRequest, Credential, ExecutionUnit, MetadataScope, Target};
use fleetrun::services::config::{FleetConfig, TransportKind};
use fleetrun::services::directory::{InventoryDirectory, TargetDirectory};
use fleetrun::services::logger::{LogLevel, Logger};
use fleetrun::services::retry::RetryPolicy;
use fleetrun::services::trust_store::TrustStore;
use fleetrun::stores::file_metadata_store::FileMetadataStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "fleetrun")]
#[command(about = "Run commands across a fleet of hosts", long_about = None)]
struct Cli {
    /// Config file (defaults to $FLEETRUN_CONFIG or <state dir>/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Target filter expression, e.g. 'labels.role == "web"'
    #[arg(long, short, global = true, default_value = "")]
    filter: String,

    /// Maximum targets worked on at once
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Per-target budget for building the channel, in milliseconds
    #[arg(long = "timeout-ms", global = true)]
    timeout_ms: Option<u64>,

    /// Budget for each command or agent request once connected, in milliseconds
    #[arg(long = "exec-timeout-ms", global = true)]
    exec_timeout_ms: Option<u64>,

    /// Skip host key verification for this run
    #[arg(long, global = true)]
    insecure: bool,

    /// tunneled or direct-tls
    #[arg(long, global = true)]
    transport: Option<String>,

    /// Dial private addresses instead of public ones
    #[arg(long = "private-ip", global = true)]
    private_ip: bool,

    /// Leave successful targets out of the report
    #[arg(long = "only-failures", global = true)]
    only_failures: bool,

    /// Log at debug level
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init {
        /// Print the default config instead of writing it
        #[arg(long)]
        print: bool,
    },

    /// Manage the fleet SSH key in project metadata
    Key {
        #[command(subcommand)]
        command: KeyCommand,
    },

    /// Run a shell command on every target
    Run {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Control a service through the agent
    Service {
        #[command(subcommand)]
        command: ServiceCommand,
    },

    /// Read, copy or chmod files through the agent
    File {
        #[command(subcommand)]
        command: FileCommand,
    },

    /// Reboot or shut down targets
    System {
        #[command(subcommand)]
        command: SystemCommand,
    },
}

#[derive(Subcommand)]
enum KeyCommand {
    /// Generate a new ed25519 key pair at the configured paths
    New {
        #[arg(long)]
        comment: Option<String>,
        /// Replace an existing key pair
        #[arg(long)]
        force: bool,
    },
    /// Add or refresh the key entry
    Push {
        /// Comment identifying this key (defaults to the one in the key file)
        #[arg(long)]
        comment: Option<String>,
    },
    /// Remove the key entry if present
    Remove {
        #[arg(long)]
        comment: Option<String>,
    },
}

#[derive(Subcommand)]
enum ServiceCommand {
    Restart { name: String },
    Start { name: String },
    Stop { name: String },
    Status { name: String },
}

#[derive(Subcommand)]
enum FileCommand {
    /// Print a remote file
    Read { path: String },
    /// Copy a file; prefix a path with ':' to mean the remote side
    Cp { src: String, dst: String },
    /// Change remote file mode (octal)
    Chmod { path: String, mode: String },
}

#[derive(Subcommand)]
enum SystemCommand {
    Reboot,
    Shutdown,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let mut logger = Logger::new("fleetrun");
    if cli.verbose {
        logger = logger.with_level(LogLevel::Debug);
    }
    let outcome = run(cli, &logger).await;
    logger.debug("run stats", Some(&logger.stats()));
    match outcome {
        Ok(output) => print!("{}", output),
        Err(err) => {
            eprintln!("fleetrun: {}", err);
            if let Some(hint) = err.hint.as_deref() {
                eprintln!("hint: {}", hint);
            }
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli, logger: &Logger) -> Result<String, FleetError> {
    // init must work even when the existing config does not parse.
    let config = match cli.command {
        Commands::Init { .. } => FleetConfig::default(),
        _ => load_config(&cli)?,
    };
    match cli.command {
        Commands::Init { print } => init_config(cli.config.as_deref(), print),
        Commands::Key {
            command: KeyCommand::New { comment, force },
        } => {
            let comment = comment.as_deref().unwrap_or(metadata::DEFAULT_KEY_COMMENT);
            let key = keys::generate(comment)?;
            keys::write_keypair(&key, &config.private_key_path, &config.public_key_path, force)?;
            logger.info(
                "generated key pair",
                Some(&serde_json::json!({
                    "private_key_path": config.private_key_path.display().to_string(),
                    "public_key_path": config.public_key_path.display().to_string(),
                })),
            );
            Ok(key.public_line)
        }
        Commands::Key {
            command: KeyCommand::Push { comment },
        } => reconcile_key(&config, logger, comment.as_deref(), true).await,
        Commands::Key {
            command: KeyCommand::Remove { comment },
        } => reconcile_key(&config, logger, comment.as_deref(), false).await,
        Commands::Run { command } => {
            dispatch(&cli.filter, cli.only_failures, &config, logger, ExecutionUnit::shell(command.join(" "))).await
        }
        Commands::Service { command } => {
            let (action, name) = match command {
                ServiceCommand::Restart { name } => (ServiceAction::Restart, name),
                ServiceCommand::Start { name } => (ServiceAction::Start, name),
                ServiceCommand::Stop { name } => (ServiceAction::Stop, name),
                ServiceCommand::Status { name } => (ServiceAction::Status, name),
            };
            let unit = ExecutionUnit::Agent(action.request(&name));
            dispatch(&cli.filter, cli.only_failures, &config, logger, unit).await
        }
        Commands::File { command } => {
            let request = match command {
                FileCommand::Read { path } => AgentRequest::FileRead { path },
                FileCommand::Cp { src, dst } => copy_request(&src, &dst)?,
                FileCommand::Chmod { path, mode } => AgentRequest::FileChmod {
                    path,
                    mode: parse_mode(&mode)?,
                },
            };
            dispatch(&cli.filter, cli.only_failures, &config, logger, ExecutionUnit::Agent(request)).await
        }
        Commands::System { command } => {
            let request = match command {
                SystemCommand::Reboot => AgentRequest::SystemReboot,
                SystemCommand::Shutdown => AgentRequest::SystemShutdown,
            };
            dispatch(&cli.filter, cli.only_failures, &config, logger, ExecutionUnit::Agent(request)).await
        }
    }
}

fn init_config(path: Option<&Path>, print: bool) -> Result<String, FleetError> {
    if print {
        return FleetConfig::default().to_pretty_json();
    }
    let (path, created) = FleetConfig::write_default(path)?;
    Ok(if created {
        format!("wrote default config to {}\n", path.display())
    } else {
        format!("{} already exists, no changes applied\n", path.display())
    })
}

async fn reconcile_key(
    config: &FleetConfig,
    logger: &Logger,
    comment: Option<&str>,
    push: bool,
) -> Result<String, FleetError> {
    let credential = load_credential(config, comment)?;
    let reconciler = build_reconciler(config, logger)?;
    let scope = MetadataScope::project(&config.project);
    let result = if push {
        reconciler.upsert(&scope, &credential).await?
    } else {
        reconciler.remove(&scope, &credential).await?
    };
    Ok(format!("{}: ssh key {}\n", scope, result.label()))
}

fn load_config(cli: &Cli) -> Result<FleetConfig, FleetError> {
    let mut config = FleetConfig::load(cli.config.as_deref())?;
    if let Some(concurrency) = cli.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.connect_timeout_ms = timeout_ms;
    }
    if let Some(exec_timeout_ms) = cli.exec_timeout_ms {
        config.exec_timeout_ms = exec_timeout_ms;
    }
    if cli.insecure {
        config.verify_host_keys = false;
    }
    if let Some(transport) = cli.transport.as_deref() {
        config.transport = TransportKind::parse(transport)?;
    }
    if cli.private_ip {
        config.use_private_address = true;
    }
    config.validate()?;
    Ok(config)
}

fn load_credential(config: &FleetConfig, comment: Option<&str>) -> Result<Credential, FleetError> {
    let line = std::fs::read_to_string(&config.public_key_path).map_err(|err| {
        FleetError::invalid_params(format!(
            "Failed to read public key {}: {}",
            config.public_key_path.display(),
            err
        ))
        .with_hint("Generate one with `fleetrun key new` or set public_key_path.")
    })?;
    Credential::from_authorized_key(config.ssh_user(), &line, comment)
}

fn build_reconciler(config: &FleetConfig, logger: &Logger) -> Result<CredentialReconciler, FleetError> {
    let store = FileMetadataStore::open(&config.metadata_path)?;
    let reconciler = CredentialReconciler::new(logger.clone(), Arc::new(store));
    Ok(if config.retry_conflicts {
        reconciler.with_conflict_retry(RetryPolicy::concurrency_conflict())
    } else {
        reconciler
    })
}

async fn dispatch(
    filter: &str,
    only_failures: bool,
    config: &FleetConfig,
    logger: &Logger,
    unit: ExecutionUnit,
) -> Result<String, FleetError> {
    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let targets = tokio::select! {
        prepared = prepare_targets(filter, config, logger) => prepared?,
        _ = cancel.cancelled() => {
            return Err(FleetError::cancelled("interrupted before any target was contacted"));
        }
    };

    let trust = TrustStore::open(&config.known_hosts_path, logger.clone())?;
    let builder = SecureChannelBuilder::from_config(config, trust, logger.clone())?;
    let dispatcher = FleetDispatcher::new(Arc::new(builder), logger.clone());

    // Only the channel build is bounded here; commands run under exec_timeout_ms.
    let report = dispatcher
        .dispatch(
            targets,
            unit,
            config.concurrency,
            Duration::from_millis(config.connect_timeout_ms),
            &cancel,
        )
        .await?;
    Ok(report.render(only_failures))
}

async fn prepare_targets(
    filter: &str,
    config: &FleetConfig,
    logger: &Logger,
) -> Result<Vec<Target>, FleetError> {
    let directory = InventoryDirectory::load(&config.inventory_path)?;
    let targets = directory.list(filter).await?;

    if config.transport == TransportKind::Tunneled {
        // Targets only accept the key once it is in project metadata.
        let credential = load_credential(config, None)?;
        build_reconciler(config, logger)?
            .upsert(&MetadataScope::project(&config.project), &credential)
            .await?;
    }
    Ok(targets)
}

/// A leading ':' marks the remote side.
fn copy_request(src: &str, dst: &str) -> Result<AgentRequest, FleetError> {
    let (src_remote, src_path) = split_remote(src);
    let (dst_remote, dst_path) = split_remote(dst);
    match (src_remote, dst_remote) {
        (false, false) => Err(FleetError::invalid_params(
            "file cp needs at least one remote path",
        )
        .with_hint("Prefix the remote path with ':', e.g. fleetrun file cp ./motd :/etc/motd")),
        (false, true) => {
            let content = std::fs::read(src_path).map_err(|err| {
                FleetError::invalid_params(format!("Failed to read {}: {}", src_path, err))
            })?;
            Ok(AgentRequest::file_copy(src_path, dst_path, Some(&content), false, true))
        }
        (true, remote_dst) => Ok(AgentRequest::file_copy(
            src_path, dst_path, None, true, remote_dst,
        )),
    }
}

fn split_remote(path: &str) -> (bool, &str) {
    match path.strip_prefix(':') {
        Some(rest) => (true, rest),
        None => (false, path),
    }
}

fn parse_mode(raw: &str) -> Result<u32, FleetError> {
    u32::from_str_radix(raw.trim_start_matches("0o"), 8)
        .ok()
        .filter(|mode| *mode <= 0o7777)
        .ok_or_else(|| FleetError::invalid_params(format!("invalid octal mode: {}", raw)))
}
