//! Shellpilot CLI entry point

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use shellpilot::checkout::{CheckoutRequest, Vcs};
use shellpilot::config::{Config, Reservation, TargetConfig, TransportKind};
use shellpilot::core::{CommandExecutor, CommandInvocation};
use shellpilot::jobs::{run_job, JobEvent, JobFile};
use shellpilot::password::{password_source_from_env, SharedPassword};
use std::io::Write;
use std::path::PathBuf;

/// Drive a shell on a local or reserved remote machine.
#[derive(Parser)]
#[command(name = "shellpilot", version)]
#[command(about = "Run commands in a local or remote shell and verify they succeed", long_about = None)]
struct Cli {
    /// Config file (default: ~/.shellpilot/config.yml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use a local shell regardless of the configured target
    #[arg(long, global = true)]
    local: bool,

    /// Reserved machine to connect to
    #[arg(long, global = true)]
    host: Option<String>,

    #[arg(long, global = true)]
    user: Option<String>,

    #[arg(long, global = true)]
    port: Option<u16>,

    /// Transport for --host (auto, local, multiplexed-remote, bare-remote)
    #[arg(long, global = true, value_parser = parse_transport)]
    transport: Option<TransportKind>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one command and fail unless it returns 0
    Run {
        /// Run through sudo
        #[arg(long)]
        sudo: bool,

        /// Don't log the command's output
        #[arg(short, long)]
        quiet: bool,

        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Fetch or update a source checkout
    Checkout {
        #[arg(long, default_value = "git", value_parser = parse_vcs)]
        vcs: Vcs,

        url: String,

        #[arg(short, long)]
        branch: Option<String>,

        /// Manifest file (repo)
        #[arg(short, long)]
        manifest: Option<String>,

        /// Shallow clone depth (git)
        #[arg(long)]
        depth: Option<u32>,

        /// Directory to check out in, created if missing
        #[arg(short, long)]
        dir: Option<String>,
    },

    /// Run a YAML job file
    Job { file: PathBuf },

    /// Print the effective configuration
    Config,
}

fn parse_transport(s: &str) -> std::result::Result<TransportKind, String> {
    serde_yaml::from_str(s).map_err(|_| format!("unknown transport: {}", s))
}

fn parse_vcs(s: &str) -> std::result::Result<Vcs, String> {
    serde_yaml::from_str(s).map_err(|_| format!("unknown vcs: {}", s))
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::load_default()?,
    };

    if cli.local {
        let local = Config::local();
        config.target = local.target;
    } else if let Some(host) = &cli.host {
        config.target = TargetConfig {
            transport: cli.transport.unwrap_or_default(),
            reserved: Some(Reservation {
                hostname: host.clone(),
                username: cli.user.clone(),
                port: cli.port,
            }),
        };
    }
    Ok(config)
}

fn connect(config: &Config) -> Result<CommandExecutor> {
    let exec = CommandExecutor::connect(config).context("connecting to target")?;
    Ok(exec.with_password_source(password_source_from_env()))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Run {
            sudo,
            quiet,
            command,
        } => {
            let mut exec = connect(&config)?;
            let mut invocation = CommandInvocation::new(command.join(" ")).sudo(sudo);
            if quiet {
                invocation = invocation.quiet();
            }
            let result = exec.run_invocation(&invocation)?;
            let mut stdout = std::io::stdout();
            for line in result.lines {
                writeln!(stdout, "{}", line)?;
            }
        }

        Commands::Checkout {
            vcs,
            url,
            branch,
            manifest,
            depth,
            dir,
        } => {
            let mut exec = connect(&config)?;
            if let Some(dir) = dir {
                exec.in_directory(&dir, false)?;
            }
            let request = CheckoutRequest {
                vcs,
                url,
                branch,
                manifest,
                depth,
                name: None,
            };
            let handle = exec.checkout(&request)?;
            println!("{}", serde_json::to_string_pretty(&handle)?);
        }

        Commands::Job { file } => {
            let job = JobFile::from_file(&file)?;
            log::info!(
                "Running job {} ({} steps)",
                job.name.as_deref().unwrap_or("unnamed"),
                job.steps.len()
            );

            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            let printer = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if let JobEvent::StepDone { target, index } = event {
                        log::debug!("[{}] step {} done", target, index + 1);
                    }
                }
            });

            let outcomes = run_job(&job, &config, SharedPassword::from_env(), Some(tx)).await;
            let _ = printer.await;

            let failed: Vec<_> = outcomes.iter().filter(|o| o.result.is_err()).collect();
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(checkouts) => println!("{}: ok ({} checkouts)", outcome.target, checkouts.len()),
                    Err(e) => println!("{}: FAILED: {:#}", outcome.target, e),
                }
            }
            if !failed.is_empty() {
                bail!("{} of {} targets failed", failed.len(), outcomes.len());
            }
        }

        Commands::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
        }
    }

    Ok(())
}
