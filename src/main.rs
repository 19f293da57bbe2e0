use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use proctree::config::{self, ConfigError, load_config, load_config_from_path};
use proctree::driver::RefreshDriver;
use proctree::logging;
use proctree::report::{self, OutputFormat, ReportScope};
use proctree::system::SnapshotEngine;

#[derive(Parser)]
#[command(
    name = "proctree",
    about = "Live process tree with per-process CPU and I/O rates"
)]
struct Cli {
    /// Path to config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Refresh rate in milliseconds (clamped to 1000..=10000)
    #[arg(long)]
    refresh_rate: Option<u64>,

    /// Number of cycles to print; 0 runs until interrupted.
    /// Rates read zero on the first cycle.
    #[arg(long, default_value_t = 2)]
    iterations: u64,

    /// Output format; defaults to `general.output` from the config
    #[arg(long, value_enum)]
    format: Option<OutputFormat>,

    /// Print only the top CPU consumers instead of the whole tree
    #[arg(long, default_value_t = false)]
    top: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let (config, config_error) = load_config_for_cli(&cli);
    logging::init_tracing(&config.logging)?;
    if let Some(err) = config_error {
        tracing::warn!(error = %err, "using default config");
    }

    let format = cli
        .format
        .unwrap_or_else(|| OutputFormat::from_config(&config.general.output));
    let scope = if cli.top {
        ReportScope::TopCpu
    } else {
        ReportScope::Tree
    };

    let engine = Arc::new(SnapshotEngine::new(&config));
    let mut driver = RefreshDriver::spawn_with(
        engine,
        Some(config.general.refresh_interval()),
        move |tree, snapshot| report::render(format, scope, tree, snapshot),
    );

    let mut printed = 0u64;
    while let Some(result) = driver.next().await {
        // Failed cycles are logged by the driver; the next tick retries.
        let Ok(rendered) = result else {
            continue;
        };
        println!("{}", rendered?);

        printed += 1;
        if cli.iterations != 0 && printed >= cli.iterations {
            return Ok(());
        }
    }

    Err(eyre!("refresh worker stopped unexpectedly"))
}

fn load_config_for_cli(cli: &Cli) -> (config::Config, Option<ConfigError>) {
    let loaded = match &cli.config {
        Some(path) => load_config_from_path(path),
        None => load_config(),
    };
    let (mut config, error) = match loaded {
        Ok(config) => (config, None),
        Err(err) => (config::Config::default(), Some(err)),
    };

    if let Some(rate) = cli.refresh_rate {
        config.general.refresh_rate_ms = rate;
    }

    (config, error)
}
