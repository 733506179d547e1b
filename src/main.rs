use ai_bridge_engine::{
    config::Config,
    handler::{build_router, AppState},
};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ai-bridge-engine", version, about = "Anthropic Messages <-> OpenAI chat-completion bridge")]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// 覆盖监听端口
    #[arg(short, long)]
    port: Option<u16>,

    /// 打开 debug 日志（转换前后的完整请求/响应）
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // 加载配置
    let mut config = Config::load(&args.config).unwrap_or_else(|e| {
        eprintln!("Failed to load {}: {}, using default config", args.config, e);
        Config::default()
    });
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.debug |= args.debug;

    // 初始化日志，支持通过环境变量配置，默认info级别
    let default_level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!("Starting AI Bridge Engine...");

    if config.backend.api_token.is_empty() {
        warn!("Backend API token is empty, set BRIDGE__BACKEND__API_TOKEN");
    }

    let mut state = AppState::new(config.clone())?;
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => state = state.with_metrics(handle),
        Err(e) => warn!("Failed to install metrics recorder: {}", e),
    }

    let app = build_router(state);

    // 启动服务器
    let addr = config.listen_addr();
    info!("Server listening on {}", addr);
    info!("Backend: {}", config.backend.api_url);
    info!("Model: {}", config.backend.model);
    info!("Debug mode: {}", if config.debug { "ON" } else { "OFF" });
    info!(
        "Translation: fan_out_tool_results={}, block_lifecycle_events={}",
        config.translation.fan_out_tool_results, config.translation.block_lifecycle_events
    );
    info!("Endpoints:");
    info!("  POST /v1/messages, POST /messages");
    info!("  GET  /, /health, /v1/models, /metrics");
    info!("Client environment:");
    info!("  export ANTHROPIC_BASE_URL=http://localhost:{}", config.server.port);
    info!("  export ANTHROPIC_AUTH_TOKEN=any-value");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
