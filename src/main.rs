use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zai_gateway::config::config_search_paths;
use zai_gateway::{
    build_router, AccountPool, AppState, CallLog, GatewayConfig, LocalAccountStore,
    SelectionStrategy, UpstreamClient,
};

#[derive(Parser)]
#[command(
    name = "zai-gateway",
    about = "OpenAI- and Anthropic-compatible gateway over a pool of upstream accounts",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Account selection strategy: round_robin, random or least_used (overrides config)
    #[arg(long)]
    strategy: Option<SelectionStrategy>,

    /// Call log file (JSON lines)
    #[arg(long, default_value = "data/calls.jsonl")]
    log_file: PathBuf,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "zai_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = GatewayConfig::find_and_load(cli.config.as_deref())?;

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(strategy) = cli.strategy {
        config.pool.strategy = strategy;
    }

    if let Some(parent) = cli.log_file.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let call_log = CallLog::open(&cli.log_file)?;

    let store = LocalAccountStore::open(
        &config.pool.accounts_file,
        config.pool.token_valid_hours,
    )?;
    let pool = Arc::new(AccountPool::new(Arc::new(store), config.pool.strategy));
    let stats = pool.store().stats().await?;
    let upstream = Arc::new(UpstreamClient::new(&config.upstream)?);

    info!("zai-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("  Upstream:  {}", upstream.base_url());
    info!("  Model:     {} (default)", config.upstream.default_model);
    info!(
        "  Accounts:  {} active / {} total",
        stats.active_accounts, stats.total_accounts
    );
    info!("  Strategy:  {}", config.pool.strategy);
    let auth = if config.effective_api_key().is_some() {
        "master key"
    } else {
        "disabled"
    };
    info!("  Auth:      {}", auth);
    let rate_limit = if config.rate_limit.enabled {
        "enabled"
    } else {
        "disabled"
    };
    info!("  Rate limit: {}", rate_limit);
    info!("  Call log:  {}", cli.log_file.display());

    if stats.active_accounts == 0 {
        tracing::warn!(
            accounts_file = %config.pool.accounts_file.display(),
            "No active accounts; add one through POST /api/accounts"
        );
    }

    let port = config.port;
    let state = Arc::new(AppState::new(config, pool, upstream, call_log));

    let app = build_router(state);
    let bind_addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);
    info!("  OpenAI:    http://localhost:{}/v1/chat/completions", port);
    info!("  Anthropic: ANTHROPIC_BASE_URL=http://localhost:{}", port);

    axum::serve(listener, app).await?;

    Ok(())
}
