use std::future::Future;
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meshrun::config::{Command, RunOptions};
use meshrun::{
    aggregate, Config, Engine, ExecutionDescriptor, MeshError, Renderer, ResourceDirectory,
    ResourceStore, ShellDispatcher,
};

/// Logs go to stderr so stdout carries only the report.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("meshrun=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// The first ctrl-c cancels the run so finished results still get reported. Returns `true`
/// when a second one asks to exit right away.
async fn watch_interrupts<F, Fut>(mut interrupted: F, cancel: CancellationToken) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = interrupted().await {
        tracing::warn!(error = %e, "cannot listen for ctrl-c");
        return false;
    }
    tracing::warn!("ctrl-c detected, cancelling; press again to exit immediately");
    cancel.cancel();
    match interrupted().await {
        Ok(()) => {
            tracing::warn!("second ctrl-c, exiting");
            true
        }
        Err(_) => false,
    }
}

async fn run_scripts(
    cli: &Config,
    directory: ResourceDirectory,
    options: &RunOptions,
    descriptors: Vec<ExecutionDescriptor>,
    fan_out: bool,
) -> Result<ExitCode, MeshError> {
    let dispatcher = Arc::new(ShellDispatcher::new(options.ssh()));
    let engine = Engine::new(Arc::new(directory), dispatcher)
        .with_max_concurrency(options.max_concurrency);

    let cancel = engine.cancel_token();
    let interrupt = tokio::spawn(async move {
        if watch_interrupts(tokio::signal::ctrl_c, cancel).await {
            std::process::exit(130);
        }
    });

    let results = if fan_out {
        engine.fan_out(&descriptors).await
    } else {
        engine.execute(&descriptors).await
    };
    // Once the run is over a pending second ctrl-c has nothing left to interrupt.
    interrupt.abort();

    let report = aggregate(&results);
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    Renderer::new(!cli.no_color).render(&report, &mut out)?;
    out.flush()?;
    Ok(report.exit_code())
}

async fn run(cli: Config) -> Result<ExitCode, MeshError> {
    let store = ResourceStore::new(&cli.resources);

    match &cli.command {
        Command::Add(args) => {
            let (name, spec) = args.clone().into_spec();
            store
                .update(|directory| directory.put(name.clone(), spec))
                .await?;
            tracing::info!(resource = %name, path = %store.path().display(), "resource saved");
            Ok(ExitCode::SUCCESS)
        }
        Command::List => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for resource in store.load().await? {
                writeln!(out, "{}", resource)?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Remove { name } => {
            store.update(|directory| directory.remove(name)).await?;
            tracing::info!(resource = %name, path = %store.path().display(), "resource removed");
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            selector,
            script,
            options,
        } => {
            let directory = ResourceDirectory::from_resources(store.load().await?);
            let descriptors = vec![options.descriptor(selector.clone(), script)];
            run_scripts(&cli, directory, options, descriptors, false).await
        }
        Command::Fanout {
            script,
            selectors,
            options,
        } => {
            let descriptors = selectors
                .iter()
                .map(|selector| options.descriptor(selector.clone(), script))
                .collect();
            let directory = ResourceDirectory::from_resources(store.load().await?);
            run_scripts(&cli, directory, options, descriptors, true).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Config::parse();
    init_tracing();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
