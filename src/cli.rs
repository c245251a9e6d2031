use clap::ValueHint;

use std::path::PathBuf;

use crate::config::Duration;

#[derive(clap::Parser, Debug, Clone)]
#[command(version, about)]
pub struct Args {
    /// Path to the config file.
    ///
    /// By default, feedagg looks for a file named `feedagg.toml` in the following directories
    /// (in order):
    ///
    /// - `./` (the current directory)
    /// - `/etc`
    #[arg(
        short,
        env = "FEEDAGG_CONFIG",
        value_hint(ValueHint::FilePath)
    )]
    pub config_path: Option<PathBuf>,

    /// HTTP API address to bind to.
    #[arg(long, env = "FEEDAGG_BIND_ADDR")]
    pub bind_addr: Option<String>,

    /// Path to the database file.
    #[arg(long, env = "FEEDAGG_DB", value_hint(ValueHint::FilePath))]
    pub db_path: Option<PathBuf>,

    /// Number of feeds fetched per scheduler tick.
    #[arg(long, env = "FEEDAGG_BATCH_SIZE")]
    pub batch_size: Option<u32>,

    /// Time between scheduler ticks (e.g. `60`, `45s`, `1h 30m`).
    #[arg(long, env = "FEEDAGG_FETCH_INTERVAL")]
    pub fetch_interval: Option<Duration>,
}

impl Args {
    pub fn parse() -> Self {
        clap::Parser::parse()
    }
}
