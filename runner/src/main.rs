mod appconf;
mod commands;
mod config;
mod ledger;
mod partition;
mod scheduler;

use clap::{ArgAction, Parser, Subcommand};
use commands::{CommandError, PartitionArgs, DEFAULT_CONF_NAME};
use config::{ConfigErrors, RunnerConfig};
use std::{error::Error, path::PathBuf, process::exit};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Split a monitoring configuration into independent batch jobs and track them on Slurm
#[derive(Parser, Debug)]
#[command(name = "rsn", version)]
struct Cli {
    /// YAML runner configuration, built-in defaults if omitted
    #[arg(long, global = true, value_name = "YAML")]
    config: Option<PathBuf>,

    /// Raise the log level, repeat for more detail
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Decompose the base configuration into one configuration per unit of work
    Partition {
        /// Base configuration
        #[arg(short = 'c', long, default_value = DEFAULT_CONF_NAME)]
        conf: PathBuf,
        /// Result directory, a timestamped one if omitted
        #[arg(short = 'd', long)]
        result_dir: Option<PathBuf>,
        /// Years per time window
        #[arg(
            short = 'y',
            long,
            default_value_t = 10,
            value_parser = clap::value_parser!(u32).range(1..)
        )]
        years_per_chunk: u32,
        /// Remove the previous batch from the result directory first
        #[arg(short = 'C', long)]
        clear: bool,
    },
    /// Submit every unit that is not in the ledger yet
    Submit {
        #[arg(short = 'd', long)]
        result_dir: PathBuf,
        /// Application launcher
        #[arg(short = 'a', long)]
        app_exec: Option<PathBuf>,
        /// Application name passed to the launcher
        #[arg(short = 'M', long)]
        app_name: Option<String>,
        /// Wall time limit per job
        #[arg(short = 't', long)]
        time: Option<String>,
        /// Memory limit per job
        #[arg(short = 'm', long)]
        mem: Option<String>,
    },
    /// Record completed jobs in the ledger
    Check {
        #[arg(short = 'd', long)]
        result_dir: PathBuf,
    },
    /// Cancel every queued or allocated job
    Cancel {
        #[arg(short = 'd', long)]
        result_dir: PathBuf,
    },
}

fn init_logging(verbose: u8) {
    // RUST_LOG takes precedence over -v
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbose {
            0 => "warn,rsn=info",
            1 => "warn,rsn=debug",
            2 => "warn,rsn=trace",
            _ => "trace",
        })
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// log an error with all of its causes
fn log_error(error: &dyn Error) {
    let mut message = error.to_string();
    let mut source = error.source();

    while let Some(cause) = source {
        message.push_str(&format!(": {cause}"));
        source = cause.source();
    }

    error!("{message}");
}

fn run(cli: Cli) -> Result<String, CommandError> {
    let mut config = RunnerConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Partition {
            conf,
            result_dir,
            years_per_chunk,
            clear,
        } => {
            let args = PartitionArgs {
                conf,
                result_dir: result_dir.unwrap_or_else(commands::timestamped_result_dir),
                years_per_chunk,
                clear,
            };

            commands::partition_pass(&config, &args).map(|report| report.to_string())
        }
        Commands::Submit {
            result_dir,
            app_exec,
            app_name,
            time,
            mem,
        } => {
            // flags override the configuration file
            if let Some(exec) = app_exec {
                config.app.exec = exec;
            }
            if let Some(name) = app_name {
                config.app.name = name;
            }
            if let Some(time) = time {
                config.resources.time = time;
            }
            if let Some(mem) = mem {
                config.resources.mem = mem;
            }

            if config.preflight_checks() {
                return Err(ConfigErrors::Preflight.into());
            }

            let scheduler = scheduler::load(&config)?;
            commands::submit_pass(&config, scheduler.as_ref(), &result_dir)
                .map(|report| report.to_string())
        }
        Commands::Check { result_dir } => {
            let scheduler = scheduler::load(&config)?;
            commands::check_pass(&config, scheduler.as_ref(), &result_dir)
                .map(|report| report.to_string())
        }
        Commands::Cancel { result_dir } => {
            let scheduler = scheduler::load(&config)?;
            commands::cancel_pass(&config, scheduler.as_ref(), &result_dir)
                .map(|report| report.to_string())
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(summary) => print!("{summary}"),
        Err(e) => {
            log_error(&e);
            exit(1)
        }
    }
}
