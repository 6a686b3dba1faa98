mod cli;
mod error;
mod input;
mod output;

use std::io::IsTerminal;
use std::process;
use std::sync::Arc;

use clap::Parser;
use segdl_engine::{
    DownloadEvent, DownloadRequest, EngineConfig, ProxyConfig, SessionRegistry, SessionStatus,
};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, debug, error, info, warn};
use tracing_indicatif::IndicatifLayer;
use tracing_indicatif::filter::{IndicatifFilter, hide_indicatif_span_fields};
use tracing_subscriber::{filter::EnvFilter, fmt, fmt::format::DefaultFields, prelude::*};

use crate::{
    cli::Args,
    error::{AppError, Result},
    input::Command,
    output::Output,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    match run(args).await {
        Ok(SessionStatus::Completed) => {}
        Ok(status) => {
            debug!(%status, "Download did not complete");
            process::exit(1);
        }
        Err(e) => {
            error!("Application error: {e}");
            process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<SessionStatus> {
    let config = engine_config(&args)?;
    let request = download_request(&args);
    let interactive = !args.json && std::io::stdin().is_terminal() && std::io::stderr().is_terminal();

    let registry = Arc::new(SessionRegistry::new(config)?);
    let mut events = registry.subscribe();
    let id = registry.add_download(request).await?;

    let snapshot = registry
        .get(&id)
        .ok_or_else(|| AppError::InvalidInput(format!("session {id} vanished")))?;
    info!(
        url = %snapshot.url,
        path = %snapshot.target_path.display(),
        size = snapshot.size,
        connections = snapshot.connections,
        "Downloading"
    );

    let output = if args.json {
        Output::Json
    } else if interactive && !args.quiet {
        Output::bar(&snapshot)
    } else {
        Output::Plain
    };

    let (command_tx, mut command_rx) = mpsc::channel(8);
    let input_token = CancellationToken::new();
    let input_task = interactive.then(|| {
        let token = input_token.clone();
        tokio::task::spawn_blocking(move || input::key_loop(command_tx, token))
    });

    let status = async {
        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) if event.session_id() == &id => {
                        output.event(&event);
                        match event {
                            DownloadEvent::Completed { .. } => break SessionStatus::Completed,
                            DownloadEvent::Error { .. } => break SessionStatus::Error,
                            DownloadEvent::Cancelled { .. } => break SessionStatus::Cancelled,
                            _ => {}
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Event consumer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break registry
                            .get(&id)
                            .map(|s| s.status)
                            .unwrap_or(SessionStatus::Cancelled);
                    }
                },
                Some(command) = command_rx.recv() => match command {
                    Command::TogglePause => {
                        if !registry.pause(&id).await && !registry.resume(&id).await {
                            warn!("Download can no longer be paused");
                        }
                    }
                    Command::Cancel => {
                        info!("Cancellation requested. Shutting down gracefully...");
                        registry.cancel(&id).await;
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, cancelling");
                    registry.shutdown().await;
                }
            }
        }
    }
    .instrument(output.span())
    .await;

    input_token.cancel();
    if let Some(task) = input_task
        && let Err(e) = task.await
    {
        warn!(error = %e, "Input handler ended abnormally");
    }

    output.finish(registry.get(&id).as_ref());
    Ok(status)
}

fn engine_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    if let Some(retries) = args.retries {
        config.retry = config.retry.with_max_retries(retries);
    }
    if let Some(url) = &args.proxy {
        let mut proxy = ProxyConfig::from_url(url);
        if let Some(proxy_type) = args.proxy_type {
            proxy.proxy_type = proxy_type;
        }
        if let (Some(username), Some(password)) = (&args.proxy_username, &args.proxy_password) {
            proxy = proxy.with_auth(username, password);
        }
        config.http.proxy = Some(proxy);
    }
    config.http.headers.extend(args.headers.iter().cloned());
    config.validate()?;
    Ok(config)
}

fn download_request(args: &Args) -> DownloadRequest {
    let request = match (&args.output, &args.dir) {
        (Some(path), _) => DownloadRequest::new(&args.url, path),
        (None, Some(dir)) => DownloadRequest::into_directory(&args.url, dir, None),
        (None, None) => DownloadRequest::into_directory(&args.url, ".", None),
    };
    match args.connections {
        Some(connections) => request.with_connections(connections),
        None => request,
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    // Log lines go through the indicatif writer so they do not tear the bar.
    let indicatif_layer =
        IndicatifLayer::new().with_span_field_formatter(hide_indicatif_span_fields(DefaultFields::new()));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(indicatif_layer.get_stderr_writer()),
        )
        .with(indicatif_layer.with_filter(IndicatifFilter::new(false)))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn args(argv: &[&str]) -> Args {
        Args::parse_from(std::iter::once("segdl").chain(argv.iter().copied()))
    }

    #[test]
    fn output_path_wins() {
        let request = download_request(&args(&["http://h/a.bin", "-o", "/tmp/x.bin", "-c", "3"]));
        assert_eq!(request.target, Path::new("/tmp/x.bin"));
        assert_eq!(request.connections, Some(3));
    }

    #[test]
    fn directory_uses_url_file_name() {
        let request = download_request(&args(&["http://h/dir/a.bin", "-d", "/tmp/out"]));
        assert_eq!(request.target, Path::new("/tmp/out/a.bin"));
        assert_eq!(request.connections, None);
    }

    #[test]
    fn flags_shape_the_engine_config() {
        let config = engine_config(&args(&[
            "http://h/a.bin",
            "--retries",
            "3",
            "--proxy",
            "socks5://127.0.0.1:1080",
            "-H",
            "Referer: http://h/",
        ]))
        .unwrap();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(
            config.http.proxy.map(|p| p.proxy_type),
            Some(segdl_engine::ProxyType::Socks5)
        );
        assert_eq!(
            config.http.headers,
            vec![("Referer".to_owned(), "http://h/".to_owned())]
        );
    }
}
