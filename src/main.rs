use berth::cli;
use berth::config::{Config, DEFAULT_CONFIG_FILE};
use berth::errors::Result;
use berth::signals;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "berth")]
#[command(
    about = "Conflict-free ports and disposable container environments for end-to-end tests",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// Config file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the detected container runtime
    Runtime,
    /// Start containers and wait until they are healthy
    Start {
        /// Move to another port block if the preferred one is taken
        #[arg(long)]
        relocate: bool,
    },
    /// Stop and remove the test environment
    Stop,
    /// Start, run the test suite, and clean up
    Test {
        /// Move to another port block if the preferred one is taken
        #[arg(long)]
        relocate: bool,
    },
    /// Port checks and the assignment registry
    Ports {
        #[command(subcommand)]
        command: PortsCommands,
    },
}

#[derive(Subcommand)]
enum PortsCommands {
    /// Check that an exact block of ports is free
    Check {
        base: u16,
        #[arg(allow_negative_numbers = true)]
        count: i32,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Find the first free block at or above a base port
    Find {
        base: u16,
        #[arg(allow_negative_numbers = true)]
        count: i32,
        #[arg(long)]
        host: Option<String>,
    },
    /// Assign a port to a service, or show its existing one
    Assign {
        service: String,
        #[arg(long, default_value = "")]
        purpose: String,
    },
    /// Print a service's assigned port
    Get { service: String },
    /// Release a service's port
    Release { service: String },
    /// List all assignments
    List {
        #[arg(long)]
        json: bool,
    },
    /// Drop all assignments
    Reset,
    /// Print assignments as environment variables
    Env,
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("berth={}", level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Runtime => cli::containers::runtime(&config)?,
        Commands::Start { relocate } => {
            let shutdown = signals::install_handler()?;
            cli::containers::start(config, relocate, &shutdown)?
        }
        Commands::Stop => {
            let shutdown = signals::install_handler()?;
            cli::containers::stop(config, &shutdown)?
        }
        Commands::Test { relocate } => {
            let shutdown = signals::install_handler()?;
            let outcome = cli::containers::test(config, relocate, &shutdown)?;
            if !outcome.passed {
                let code = outcome.exit_code.unwrap_or(1).clamp(1, 255);
                return Ok(ExitCode::from(code as u8));
            }
        }
        Commands::Ports { command } => match command {
            PortsCommands::Check {
                base,
                count,
                host,
                json,
            } => cli::ports::check(&config, base, count, host, json)?,
            PortsCommands::Find { base, count, host } => {
                cli::ports::find(&config, base, count, host)?
            }
            PortsCommands::Assign { service, purpose } => {
                cli::ports::assign(&config, &service, &purpose)?
            }
            PortsCommands::Get { service } => cli::ports::get(&config, &service)?,
            PortsCommands::Release { service } => cli::ports::release(&config, &service)?,
            PortsCommands::List { json } => cli::ports::list(&config, json)?,
            PortsCommands::Reset => cli::ports::reset(&config)?,
            PortsCommands::Env => cli::ports::env(&config)?,
        },
    }

    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::from(e.exit_code().clamp(1, 255) as u8)
        }
    }
}
