//! hostguard - Inspect, sign and load plugin modules through the security gate.
//!
//! Usage:
//!   hostguard scan [DIR]                 Validate every module in a directory
//!   hostguard verify MODULE              Check a module's signature block
//!   hostguard check-access PATH          Evaluate file access policies
//!   hostguard load MODULE...             Load modules and run a few update ticks
//!   hostguard sign MODULE --subject S    Write a signature block
//!   hostguard policy init                Write a default policy file
//!   hostguard --help                     Show help
//!
//! Set `HOSTGUARD_LOG` (e.g. `HOSTGUARD_LOG=plugin_registry=debug`) to control
//! logging.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Context, Result, bail, eyre};
use tracing_subscriber::EnvFilter;

use hostguard_plugin::{NativeModuleLoader, PluginRegistry};
use hostguard_security::{
    FileAccessType, PolicyDocument, SecurityConfiguration, SecurityGate, SigningRequest,
    default_policy_path, sign_module,
};

#[derive(Parser)]
#[command(
    name = "hostguard",
    version,
    about = "Plugin host with a module trust pipeline",
    long_about = "hostguard vets native plugin modules before they are loaded: \
                  signature blocks, load paths, hijacking heuristics and file \
                  access policies.\n\n\
                  The security policy is read from --policy, or from the default \
                  policy file when it exists."
)]
struct Cli {
    /// Security policy file
    #[arg(short, long, global = true)]
    policy: Option<PathBuf>,

    /// Enable secure mode (unsigned modules refused, audits deny)
    #[arg(long, global = true)]
    secure: bool,

    /// Log at debug level unless HOSTGUARD_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate every module in a directory without loading it
    Scan {
        /// Directory to scan (defaults to the plugin directory)
        dir: Option<PathBuf>,

        /// Also report suspicious modules already mapped into this process
        #[arg(long)]
        preloaded: bool,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Verify a module's signature block
    Verify {
        /// Module to verify
        module: PathBuf,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Ask whether an access to a path would be allowed
    CheckAccess {
        /// Path being accessed
        path: String,

        /// Access type (read, write, execute, delete, create, modify, ...)
        #[arg(short, long, default_value = "read")]
        access: String,

        /// Requesting plugin
        #[arg(short, long)]
        requester: Option<String>,
    },

    /// Load modules, tick them, then unload
    Load {
        /// Modules to load, in order
        #[arg(required = true)]
        modules: Vec<PathBuf>,

        /// Registry configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of update ticks to run
        #[arg(short, long, default_value = "1")]
        ticks: u32,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Write a signature block next to a module
    Sign {
        /// Module to sign
        module: PathBuf,

        /// Publisher name
        #[arg(short, long)]
        subject: String,

        /// Issuer name (defaults to the subject)
        #[arg(short, long)]
        issuer: Option<String>,

        /// Validity in days
        #[arg(short, long, default_value = "365")]
        days: i64,

        /// Leave the signing time out of the block
        #[arg(long)]
        no_timestamp: bool,
    },

    /// Manage the security policy file
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Write a default policy file
    Init {
        /// Output file (defaults to the standard policy location)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective policy
    Show,
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

fn main() -> Result<ExitCode> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Scan {
            dir,
            preloaded,
            format,
        } => {
            let gate = open_gate(cli.policy.as_deref(), cli.secure)?;
            run_scan(gate, dir, preloaded, format)
        }
        Command::Verify { module, format } => {
            let gate = open_gate(cli.policy.as_deref(), cli.secure)?;
            run_verify(&gate, &module, format)
        }
        Command::CheckAccess {
            path,
            access,
            requester,
        } => {
            let gate = open_gate(cli.policy.as_deref(), cli.secure)?;
            run_check_access(&gate, &path, &access, requester.as_deref())
        }
        Command::Load {
            modules,
            config,
            ticks,
            format,
        } => {
            let gate = open_gate(cli.policy.as_deref(), cli.secure)?;
            run_load(gate, &modules, config.as_deref(), ticks, format)
        }
        Command::Sign {
            module,
            subject,
            issuer,
            days,
            no_timestamp,
        } => run_sign(&module, subject, issuer, days, !no_timestamp),
        Command::Policy { action } => match action {
            PolicyAction::Init { output, force } => run_policy_init(output, force),
            PolicyAction::Show => {
                let gate = open_gate(cli.policy.as_deref(), cli.secure)?;
                run_policy_show(&gate)
            }
        },
    }
}

fn init_tracing(verbose: bool) {
    let env_filter = EnvFilter::try_from_env("HOSTGUARD_LOG")
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .init();
}

/// Build and start the gate from the given or default policy file.
fn open_gate(policy: Option<&Path>, secure: bool) -> Result<Arc<SecurityGate>> {
    let gate = SecurityGate::new(SecurityConfiguration::default())
        .context("Failed to create security gate")?;

    let path = match policy {
        Some(path) => Some(path.to_path_buf()),
        None => Some(default_policy_path()).filter(|path| path.is_file()),
    };
    if let Some(path) = path {
        gate.load_policy(&path)
            .with_context(|| format!("Failed to load policy {}", path.display()))?;
    }

    gate.set_secure_mode(secure);
    gate.initialize().context("Failed to start security gate")?;
    Ok(Arc::new(gate))
}

fn native_registry(gate: Arc<SecurityGate>) -> PluginRegistry {
    PluginRegistry::new(Arc::new(NativeModuleLoader::new()), gate)
}

/// Validate every module in a directory.
fn run_scan(
    gate: Arc<SecurityGate>,
    dir: Option<PathBuf>,
    preloaded: bool,
    format: OutputFormat,
) -> Result<ExitCode> {
    let registry = native_registry(Arc::clone(&gate));
    let dir = dir.unwrap_or_else(|| registry.plugin_directory());
    let modules = registry
        .scan_for_plugins(&dir)
        .with_context(|| format!("Failed to scan {}", dir.display()))?;

    let mut rejected = 0;
    let mut rows = Vec::with_capacity(modules.len());
    for module in &modules {
        let result = registry.validate_plugin(module);
        if result.is_err() {
            rejected += 1;
        }
        rows.push((module, result));
    }
    let suspicious = if preloaded {
        gate.detect_preloaded_modules()
    } else {
        Vec::new()
    };

    match format {
        OutputFormat::Text => {
            eprintln!("Scanned {}", dir.display());
            println!();
            println!("{}", "─".repeat(70));
            println!(" {} module(s), {} rejected", modules.len(), rejected);
            println!("{}", "─".repeat(70));
            for (module, result) in &rows {
                match result {
                    Ok(info) => println!(
                        " ok      {:<24} {:<10} {}",
                        info.name,
                        info.version,
                        module.display()
                    ),
                    Err(err) => println!(" denied  {}\n         {}", module.display(), err),
                }
            }
            if preloaded {
                println!();
                if suspicious.is_empty() {
                    println!(" No suspicious preloaded modules.");
                }
                for path in &suspicious {
                    println!(" suspicious preloaded module: {}", path.display());
                }
            }
        }
        OutputFormat::Json => {
            let modules: Vec<_> = rows
                .iter()
                .map(|(module, result)| match result {
                    Ok(info) => serde_json::json!({
                        "path": module,
                        "accepted": true,
                        "info": info,
                    }),
                    Err(err) => serde_json::json!({
                        "path": module,
                        "accepted": false,
                        "error": err.to_string(),
                        "kind": err.kind(),
                    }),
                })
                .collect();
            let report = serde_json::json!({
                "directory": dir,
                "modules": modules,
                "suspicious_preloaded": suspicious,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(if rejected == 0 && suspicious.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Print the signature verification result for one module.
fn run_verify(gate: &SecurityGate, module: &Path, format: OutputFormat) -> Result<ExitCode> {
    if !module.is_file() {
        bail!("{} is not a file", module.display());
    }
    let verification = gate.verify_signature(module);

    match format {
        OutputFormat::Text => {
            println!("{}: {}", module.display(), verification.status);
            println!("  {}", verification.message);
            if let Some(info) = &verification.info {
                println!("  subject:    {}", info.subject);
                println!("  issuer:     {}", info.issuer);
                println!("  thumbprint: {}", info.thumbprint);
                println!("  valid:      {} .. {}", info.valid_from, info.valid_to);
                if let Some(timestamp) = info.timestamp {
                    println!("  signed at:  {timestamp}");
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&verification)?);
        }
    }

    Ok(if verification.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn run_check_access(
    gate: &SecurityGate,
    path: &str,
    access: &str,
    requester: Option<&str>,
) -> Result<ExitCode> {
    let access: FileAccessType = access
        .parse()
        .map_err(|_| eyre!("Unknown access type: {access}"))?;

    let allowed = match requester {
        Some(requester) => gate.check_file_access_as(path, access, requester),
        None => gate.check_file_access(path, access),
    };
    println!("{access} {path}: {}", if allowed { "allowed" } else { "denied" });
    if !allowed && let Some(reason) = gate.last_error() {
        println!("  {reason}");
    }

    Ok(if allowed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Load modules into a native registry, tick them, and report.
fn run_load(
    gate: Arc<SecurityGate>,
    modules: &[PathBuf],
    config: Option<&Path>,
    ticks: u32,
    format: OutputFormat,
) -> Result<ExitCode> {
    let registry = native_registry(gate);

    let plugin_dir = modules
        .first()
        .and_then(|module| module.parent())
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| registry.plugin_directory());
    registry
        .initialize(&plugin_dir)
        .context("Failed to initialize plugin registry")?;
    if let Some(config) = config {
        registry
            .load_configuration(config)
            .with_context(|| format!("Failed to read {}", config.display()))?;
    }

    let mut failed = 0;
    for module in modules {
        let name = hostguard_plugin::module_name(module).unwrap_or_default();
        let plugin_config = registry.plugin_config(&name).unwrap_or_default();
        if let Err(err) = registry.load(module, plugin_config) {
            failed += 1;
            eprintln!("Failed to load {}: {err}", module.display());
        }
    }

    for _ in 0..ticks {
        registry.update(1.0 / 60.0);
        registry.render();
    }

    let diagnostics = registry.diagnostics();
    match format {
        OutputFormat::Text => print!("{diagnostics}"),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&diagnostics)?),
    }
    let healthy = failed == 0 && !diagnostics.has_errors();
    registry.shutdown();

    Ok(if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn run_sign(
    module: &Path,
    subject: String,
    issuer: Option<String>,
    days: i64,
    timestamp: bool,
) -> Result<ExitCode> {
    let mut request = SigningRequest::new(subject)
        .valid_for(signing_validity(days)?)
        .timestamp(timestamp);
    if let Some(issuer) = issuer {
        request = request.issuer(issuer);
    }

    let info = sign_module(module, &request)
        .with_context(|| format!("Failed to sign {}", module.display()))?;
    println!("Signed {}", module.display());
    println!("  thumbprint: {}", info.thumbprint);
    println!("  digest:     {}", info.digest);
    println!("  valid to:   {}", info.valid_to);
    Ok(ExitCode::SUCCESS)
}

/// Validity of a new certificate, starting now.
fn signing_validity(days: i64) -> Result<chrono::Duration> {
    if days <= 0 {
        bail!("Validity must be at least one day");
    }
    let validity = chrono::Duration::try_days(days)
        .filter(|validity| chrono::Utc::now().checked_add_signed(*validity).is_some())
        .ok_or_else(|| eyre!("Validity of {days} days is out of range"))?;
    Ok(validity)
}

fn run_policy_init(output: Option<PathBuf>, force: bool) -> Result<ExitCode> {
    let path = output.unwrap_or_else(default_policy_path);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    PolicyDocument::default()
        .save(&path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(ExitCode::SUCCESS)
}

fn run_policy_show(gate: &SecurityGate) -> Result<ExitCode> {
    let document = PolicyDocument {
        security: gate.configuration(),
        policies: gate.active_policies(),
    };
    let text = toml::to_string_pretty(&document).context("Failed to render policy")?;
    print!("{text}");
    Ok(ExitCode::SUCCESS)
}
