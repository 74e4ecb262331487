use std::{process, sync::Arc};

use cleanup_app::cli::{Cli, Commands, ServeArgs};
use cleanup_app::config::{self, AppConfig};
use cleanup_app::error::AppError;
use cleanup_app::paths::AppPaths;
use cleanup_app::server;
use cleanup_app::services::{
    BlobStore, CleanupService, DurableWrite, FsBlobStore, HttpPlatform, JobContext, MarkerStore,
    Platform,
};
use tracing_subscriber::{filter::LevelFilter, fmt};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_level = determine_log_level(&cli);
    init_tracing(log_level);

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).with_target(false).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

fn determine_log_level(cli: &Cli) -> LevelFilter {
    match (cli.command.as_ref(), cli.verbose) {
        (None, _) => LevelFilter::WARN,
        (Some(Commands::Serve(_)), 0) => LevelFilter::INFO,
        (Some(Commands::Serve(_)), 1) => LevelFilter::DEBUG,
        (Some(Commands::Serve(_)), _) => LevelFilter::TRACE,
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Some(Commands::Serve(args)) => run_serve(args).await,
        None => {
            Cli::print_help();
            Ok(())
        }
    }
}

async fn run_serve(args: ServeArgs) -> Result<(), AppError> {
    let mut config = config::load()?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    let service = Arc::new(build_service(&config)?);
    server::serve(&config.server, service).await?;
    Ok(())
}

fn build_service(config: &AppConfig) -> Result<CleanupService, AppError> {
    let paths = AppPaths::new(&config.storage.path)?;
    let blobs: Arc<dyn BlobStore> = Arc::new(
        FsBlobStore::builder()
            .paths(paths)
            .durability(DurableWrite::FileAndDir)
            .build(),
    );
    tracing::debug!(path = ?config.storage.path, "initialized FsBlobStore");

    let platform: Arc<dyn Platform> = Arc::new(HttpPlatform::new(
        &config.platform.base_url,
        config.platform.token.clone(),
        config.platform.request_timeout(),
    )?);
    tracing::debug!(base_url = %config.platform.base_url, "initialized platform client");

    let ctx = JobContext::builder()
        .platform(platform)
        .markers(MarkerStore::new(blobs))
        .export_policy(config.polling.export_policy())
        .execution_policy(config.polling.execution_policy())
        .build();

    Ok(CleanupService::new(ctx, config.clustering.max_neighbors)
        .with_max_indexed_items(config.clustering.max_indexed_items))
}
