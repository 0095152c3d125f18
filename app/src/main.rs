use std::path::PathBuf;

use clap::{Parser, Subcommand};
use eyre::Result;
use tracing::error;
use tracing_subscriber::{
    EnvFilter,
    fmt::{layer, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

mod bench;
mod setup;

/// Library crates whose logs follow the binary's level unless `--log` says otherwise.
const MODULES: &[&str] = &["common", "cmd", "scaling_plots"];

#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Setup file describing commands and experiments
    #[arg(short, long, default_value = "setup.yaml", global = true)]
    config_file: PathBuf,
    #[arg(long, default_value_t = false)]
    no_progress: bool,
    #[arg(short, long)]
    log: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run experiments, reusing cached results
    Run {
        /// Do not render presentations
        #[arg(long, default_value_t = false)]
        skip_plot: bool,
        /// Only run the named experiments
        #[arg(long)]
        only: Vec<String>,
    },
    /// List experiments and their cached results
    Ls,
    /// Delete cached results
    Clean {
        /// Experiments to clean, all when empty
        names: Vec<String>,
    },
    /// Print resolved command lines without running them
    Print {
        #[arg(long)]
        only: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_level = std::env::var("RUST_LOG").unwrap_or("warn".to_owned());
    let args = Cli::parse();
    let file_appender = tracing_appender::rolling::never(".", "log.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let mut env_filter = EnvFilter::new(format!("sweep_bench={log_level}"));

    for log in &args.log {
        env_filter = env_filter.add_directive(log.parse()?);
    }

    for module in MODULES {
        if !args.log.iter().any(|x| x.starts_with(module)) {
            env_filter = env_filter.add_directive(format!("{module}={log_level}").parse()?);
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            layer()
                .with_timer(ChronoLocal::new("%v %k:%M:%S %z".to_owned()))
                .compact(),
        )
        .with(layer().with_writer(non_blocking))
        .init();

    let result = match args.command {
        Commands::Run { skip_plot, only } => {
            bench::run_experiments(&args.config_file, args.no_progress, skip_plot, only).await
        }
        Commands::Ls => bench::list_results(&args.config_file).await,
        Commands::Clean { names } => bench::clean(&args.config_file, names).await,
        Commands::Print { only } => bench::print_commands(&args.config_file, only).await,
    };

    if let Err(err) = result {
        error!("{err:#?}");
        return Err(err);
    }
    Ok(())
}
