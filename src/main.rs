use anyhow::Context;
use outcome_ledger::orchestration::refresh_mappings;
use outcome_ledger::{
    api, config::Config, db::init_db, Compiler, FeedSource, FileFeedSource, Ingestor,
    Orchestrator, Repository,
};
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let port = config.port;

    // Initialize database and dependencies
    let pool = match init_db(&config.database_path).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    let repo = Arc::new(Repository::new(pool));
    let compiler = match Compiler::new(config.fold_workers) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to start fold workers: {}", e);
            std::process::exit(1);
        }
    };
    let orchestrator = Arc::new(Orchestrator::new(repo.clone(), compiler, config.clone()));

    // Import the local feed, derive mappings and fold every wallet
    if let Some(dir) = config.feed_dir.as_deref() {
        let feed: Arc<dyn FeedSource> = Arc::new(FileFeedSource::new(dir));
        let ingestor = Ingestor::new(feed, repo.clone());
        let startup = async {
            let ingested = ingestor
                .ingest()
                .await
                .with_context(|| format!("importing feed from {}", dir))?;
            tracing::info!(?ingested, "Feed imported");
            let refresh = refresh_mappings(&repo)
                .await
                .context("deriving token mappings")?;
            tracing::info!(
                version = refresh.version,
                ambiguous = refresh.ambiguous.len(),
                "Mappings refreshed"
            );
            let reports = orchestrator
                .compile_all()
                .await
                .context("compiling wallets")?;
            Ok::<usize, anyhow::Error>(reports.len())
        };
        match startup.await {
            Ok(wallets) => tracing::info!(wallets, "Startup import complete"),
            Err(e) => {
                eprintln!("Startup import failed: {:#}", e);
                std::process::exit(1);
            }
        }
    }

    // Create router
    let app = api::create_router(api::AppState::new(repo, config, orchestrator));

    // Bind to address
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("Server listening on {}", addr);

    // Run server
    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }
}
