use std::process::ExitCode;

use anyhow::Result;
use feedagg::cli::Args;
use feedagg::config;
use feedagg::fetch::reader::FeedReader;
use feedagg::fetch::Scheduler;
use feedagg::server::Server;
use feedagg::state::State;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::Level;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

fn set_up_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_regex(false)
                .with_default_directive(Level::INFO.into())
                .with_env_var("FEEDAGG_LOG")
                .from_env_lossy(),
        )
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    set_up_logging();

    let cancel = CancellationToken::new();

    tokio::spawn({
        let cancel = cancel.clone();

        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("could not listen for the shutdown signal: {e}");
            }

            cancel.cancel();
        }
    });

    let mut tasks = match start(cancel.clone()).await {
        Ok(tasks) => tasks,

        Err(e) => {
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    let mut exit_code = ExitCode::SUCCESS;

    while let Some(task_result) = tasks.join_next().await {
        cancel.cancel();

        match task_result {
            Ok(Ok(())) => {}

            Ok(Err(e)) => {
                error!("{e:#}");
                exit_code = ExitCode::FAILURE;
            }

            Err(e) => {
                error!("{e:#}");
                exit_code = ExitCode::FAILURE;
            }
        }
    }

    exit_code
}

async fn start(cancel: CancellationToken) -> Result<JoinSet<Result<()>>> {
    let mut args = Args::parse();
    let config_paths = args
        .config_path
        .take()
        .into_iter()
        .chain(["./feedagg.toml".into(), "/etc/feedagg.toml".into()])
        .collect::<Vec<_>>();
    let mut config = config::load(&config_paths)?;
    config.update(args);
    config.validate()?;
    let state = State::new(config).await?;

    let reader = FeedReader::new(state.cfg.request_timeout.into())?;
    let scheduler = Scheduler::new(
        state.storage.clone(),
        reader,
        state.cfg.batch_size,
        state.cfg.fetch_interval.into(),
    );
    let server = Server::new(state).await?;

    let mut tasks = JoinSet::new();
    tasks.spawn(scheduler.run(cancel.clone()));
    tasks.spawn(server.serve(cancel.clone()));

    Ok(tasks)
}
