use std::process;
use std::sync::Arc;

use anyhow::Context;
use hilrig::{Bench, JsonLinesSink, ServerHandle, ServerLoop};
use hilrig_server::error::CliError;
use hilrig_server::{BenchFile, Options, USAGE, init_tracing, parse_args};

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let options = match parse_args(&args, |key| std::env::var(key).ok()) {
        Ok(options) => options,
        Err(CliError::Help) => {
            println!("{USAGE}");
            return;
        }
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!();
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(options) {
        tracing::error!(error = %format!("{e:#}"), "hilrig-server failed");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn run(options: Options) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("hilrig-server")
        .build()
        .context("failed to start tokio runtime")?;
    runtime.block_on(serve(options))
}

async fn serve(options: Options) -> anyhow::Result<()> {
    let bench_file = match &options.layout {
        Some(path) => BenchFile::load(path)?,
        None => BenchFile::default(),
    };

    let mut builder = Bench::builder(bench_file.name.as_str())
        .with_layout(bench_file.layout)
        .with_holding_capacity(options.config.holding_capacity);
    if let Some(path) = &options.results {
        let sink = JsonLinesSink::append_to(path)
            .with_context(|| format!("cannot open results file {}", path.display()))?;
        builder = builder.with_sink(Arc::new(sink));
    }
    let bench = builder.build().context("failed to build bench")?;

    let server = ServerLoop::new(options.config, bench);
    tokio::spawn(shutdown_signal(server.handle()));
    server.serve(None).await?;
    Ok(())
}

/// Turn SIGINT/SIGTERM into a graceful shutdown of the server loop.
async fn shutdown_signal(handle: ServerHandle) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
    handle.shutdown();
}
