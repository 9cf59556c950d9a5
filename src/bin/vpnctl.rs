//! vpnctl - VPN Gateway Control CLI
//!
//! Operator entry point for key generation, panel provisioning, port
//! changes and backups of a VLESS-Reality / Hysteria2 deployment.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use libvpnctl::*;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::process;
use tracing::{debug, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "vpnctl")]
#[command(version)]
#[command(about = "VPN gateway control tool - keys, panel inbounds, ports, backups", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Generate a fresh reality key pair, client id and passwords
    #[arg(long)]
    generate_keys: bool,

    /// (Re)create the reality inbound and egress route on the panel
    #[arg(long)]
    setup_inbound: bool,

    /// Download fresh geoip/geosite databases into the panel
    #[arg(long)]
    update_geodata: bool,

    /// Print client connection links
    #[arg(long)]
    show_clients: bool,

    /// Tool configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Deployment directory (overrides paths.project_dir)
    #[arg(long)]
    project_dir: Option<PathBuf>,

    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "text")]
    output: OutputFormat,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Rotate all credentials and push them to the panel and Hysteria2
    Rotate,
    /// Restart every container of the deployment
    Restart,
    /// Move a listener to a new port
    #[command(subcommand)]
    Port(PortCommands),
    /// Write a backup archive
    Backup,
    /// Restore a backup archive
    Restore { archive: PathBuf },
}

#[derive(Subcommand, Debug)]
enum PortCommands {
    /// Hysteria2 UDP listener
    Hysteria { port: String },
    /// 3x-ui panel TCP port
    Panel { port: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

impl Cli {
    fn has_action(&self) -> bool {
        self.command.is_some()
            || self.generate_keys
            || self.setup_inbound
            || self.update_geodata
            || self.show_clients
    }

    fn read_only(&self) -> bool {
        self.command.is_none() && !self.generate_keys && !self.setup_inbound && !self.update_geodata
    }
}

/// Collects results for JSON output, prints text output as it goes
struct Output {
    format: OutputFormat,
    json: Map<String, Value>,
}

impl Output {
    fn new(format: OutputFormat) -> Self {
        Self {
            format,
            json: Map::new(),
        }
    }

    fn record<T: Serialize>(&mut self, key: &str, value: &T, text: impl FnOnce(&T)) -> Result<()> {
        match self.format {
            OutputFormat::Text => text(value),
            OutputFormat::Json => {
                self.json.insert(key.to_string(), serde_json::to_value(value)?);
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<()> {
        if self.format == OutputFormat::Json {
            println!("{}", serde_json::to_string_pretty(&Value::Object(self.json))?);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    if !cli.has_action() {
        bail!("Nothing to do: pass an action flag or subcommand (see --help)");
    }

    let mut config = VpnctlConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(dir) = &cli.project_dir {
        config.paths.project_dir = dir.clone();
    }
    debug!("Project directory {:?}", config.paths.project_dir);

    #[cfg(target_os = "linux")]
    {
        let uid = unsafe { libc::getuid() };
        if uid != 0 && !cli.read_only() {
            warn!("Not running as root - firewall and docker operations may fail");
        }
    }

    let mut manager = LifecycleManager::new(config)?;
    let mut out = Output::new(cli.output);

    if let Some(command) = &cli.command {
        run_command(&mut manager, command, &mut out).await?;
    }

    if cli.generate_keys {
        let record = manager.generate_keys().await?;
        let summary = json!({
            "public_key": record.public_key,
            "secret_store": manager.store().path(),
        });
        out.record("generate_keys", &summary, |_| {
            println!("Keys generated and saved to {}", manager.store().path().display());
            println!("Public key: {}", record.public_key);
        })?;
    }

    if cli.setup_inbound {
        let report = manager.setup_inbound().await?;
        out.record("setup_inbound", &report, print_setup)?;
    }

    if cli.update_geodata {
        manager.update_geodata().await?;
        out.record("update_geodata", &"ok", |_| println!("Geodata updated"))?;
    }

    if cli.show_clients {
        let links = manager.client_links()?;
        out.record("clients", &links, |links| print_links(links))?;
    }

    out.finish()
}

async fn run_command(manager: &mut LifecycleManager, command: &Commands, out: &mut Output) -> Result<()> {
    match command {
        Commands::Rotate => {
            let report = manager.rotate_keys().await?;
            out.record("rotate", &report, |report| {
                print_setup(&report.setup);
                print_links(&report.links);
            })?;
        }
        Commands::Restart => {
            manager.restart_stack().await?;
            out.record("restart", &"ok", |_| println!("Stack restarted"))?;
        }
        Commands::Port(PortCommands::Hysteria { port }) => {
            let report = manager.change_hysteria_port(port).await?;
            out.record("port", &report, print_migration)?;
        }
        Commands::Port(PortCommands::Panel { port }) => {
            let report = manager.change_panel_port(port).await?;
            out.record("port", &report, print_migration)?;
        }
        Commands::Backup => {
            let archive = manager.create_backup().await?;
            out.record("backup", &archive, |archive| {
                println!("Backup written to {}", archive.display());
            })?;
        }
        Commands::Restore { archive } => {
            let report = manager.restore_backup(archive).await?;
            out.record("restore", &report, |report| {
                println!("Restored {}", report.archive.display());
                for step in &report.restored {
                    println!("  restored: {}", step);
                }
                for skipped in &report.skipped {
                    println!("  skipped:  {}", skipped);
                }
                if report.archive_removed {
                    println!("  uploaded archive removed");
                }
            })?;
        }
    }
    Ok(())
}

fn print_setup(report: &SetupReport) {
    println!("Panel login: {:?}", report.login);
    if !report.removed_inbounds.is_empty() {
        println!("Replaced inbounds: {:?}", report.removed_inbounds);
    }
    if report.routing_changed {
        println!("Egress route added, panel restarted");
    }
    println!("Inbound configured");
}

fn print_links(links: &[ClientLink]) {
    for link in links {
        println!("{}:", link.label);
        println!("  {}", link.link);
    }
}

fn print_migration(report: &MigrationReport) {
    println!(
        "{:?} port: {} -> {}",
        report.target, report.old_port, report.new_port
    );
    for warning in &report.warnings {
        println!("  warning: {}", warning);
    }
}

/// Initialize logging based on command-line arguments
fn init_logging(cli: &Cli) {
    let log_level = if cli.verbose {
        "debug"
    } else {
        &cli.log_level
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            EnvFilter::new(format!("vpnctl={},libvpnctl={}", log_level, log_level))
        });

    // stdout carries command output
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
}
