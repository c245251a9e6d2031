mod types;

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, ensure, Context, Result};
use serde::Deserialize;
use take_mut::take;
use tracing::{debug, info};

pub use self::types::*;

fn default_bind_addr() -> String {
    Config::default().bind_addr
}

fn default_db_path() -> PathBuf {
    Config::default().db_path
}

fn default_batch_size() -> u32 {
    Config::default().batch_size
}

fn default_fetch_interval() -> Duration {
    Config::default().fetch_interval
}

fn default_request_timeout() -> Duration {
    Config::default().request_timeout
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// How many feeds are fetched per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Time between two ticks of the fetch scheduler.
    #[serde(default = "default_fetch_interval")]
    pub fetch_interval: Duration,

    /// Upper bound on a single feed request, including reading the body.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: Duration,
}

impl Config {
    pub fn update(&mut self, args: crate::cli::Args) {
        fn set_if_some<T>(dst: &mut T, v: Option<T>) {
            if let Some(v) = v {
                *dst = v;
            }
        }

        set_if_some(&mut self.bind_addr, args.bind_addr);
        set_if_some(&mut self.db_path, args.db_path);
        set_if_some(&mut self.batch_size, args.batch_size);
        set_if_some(&mut self.fetch_interval, args.fetch_interval);
    }

    pub fn resolve_relative_paths(&mut self, config_dir: impl AsRef<Path>) {
        let config_dir = config_dir.as_ref();

        // rebuild the whole struct so that new path fields can't be forgotten here.
        take(self, |this| Self {
            bind_addr: this.bind_addr,
            db_path: config_dir.join(&this.db_path),
            batch_size: this.batch_size,
            fetch_interval: this.fetch_interval,
            request_timeout: this.request_timeout,
        })
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.batch_size > 0, "`batch-size` must be positive");
        ensure!(
            !self.fetch_interval.is_zero(),
            "`fetch-interval` must not be zero"
        );
        ensure!(
            !self.request_timeout.is_zero(),
            "`request-timeout` must not be zero"
        );

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: "127.0.0.1:8080".into(),
            db_path: "./feedagg.sqlite3".into(),
            batch_size: 10,
            fetch_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub fn load(search_paths: &[PathBuf]) -> Result<Config> {
    for path in search_paths {
        debug!("Trying to load {}", path.display());
        let mut contents = String::new();

        {
            let mut f = match File::open(path) {
                Ok(f) => f,

                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(file = %path.display(), "File not found, skipping");
                    continue;
                }

                Err(e) => {
                    return Err(e)
                        .context(anyhow!("could not load a config file `{}`", path.display()));
                }
            };

            f.read_to_string(&mut contents).with_context(|| {
                anyhow!(
                    "could not read the contents of a config file `{}`",
                    path.display()
                )
            })?;
        }

        let mut cfg: Config = toml::from_str(&contents)
            .with_context(|| anyhow!("could not load the config file `{}`", path.display()))?;

        if let Some(parent) = path.parent() {
            cfg.resolve_relative_paths(parent);
        }

        info!("Loaded a config file `{}`", path.display());

        return Ok(cfg);
    }

    info!("Using the default config");

    Ok(Default::default())
}
