use clap::Parser;
use dsync::config::{self, Config, HandlerAction, HandlerConfig};
use dsync::error::AppError;
use dsync::network::server::EventServer;
use dsync::shutdown::ShutdownManager;
use dsync::{HandlerOptions, SyncNode};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser, Debug)]
#[command(name = "dsyncd")]
#[command(about = "dsync event gossip daemon", long_about = None)]
struct Args {
    /// Config file (default: ~/.dsync/dsync.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    listen_addr: Option<String>,

    /// Extra peer URL, may be repeated
    #[arg(long = "peer")]
    peers: Vec<String>,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config::get_data_dir().join("dsync.toml"));

    if args.generate_config {
        match Config::default().save_to_file(&config_path) {
            Ok(_) => {
                println!("✅ Generated default config at: {}", config_path.display());
                return;
            }
            Err(e) => {
                eprintln!("❌ Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let mut config = match Config::load_or_create(&config_path) {
        Ok(cfg) => {
            println!("✓ Loaded configuration from {}", config_path.display());
            cfg
        }
        Err(e) => {
            eprintln!("❌ Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(listen_addr) = args.listen_addr {
        config.network.listen_address = listen_addr;
    }
    config.network.bootstrap_peers.extend(args.peers);

    let _log_guard = setup_logging(&config.logging, args.verbose);

    let version = env!("CARGO_PKG_VERSION");
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    let build_date = option_env!("BUILD_DATE").unwrap_or("unknown");

    println!("\n🚀 dsync daemon v{} ({})", version, git_hash);
    println!("  └─ Build: {}", build_date);
    println!("═══════════════════════════════════════════════════════");
    println!("📡 Node: {}", config.node.name);
    println!("  └─ Endpoint: /{}", config.node.prefix);
    println!("  └─ Listen: {}", config.network.full_listen_address());
    println!();

    if let Err(e) = run(config).await {
        tracing::error!("❌ {}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), AppError> {
    let node = Arc::new(SyncNode::with_http(
        &config.node.prefix,
        config.node_options(),
        Some(config.request_timeout()),
    )?);

    register_builtin_handlers(&node, &config.handlers);

    for peer in &config.network.bootstrap_peers {
        node.add_peer(peer);
    }
    tracing::info!(
        "✓ {} peer(s), {} handler(s), gossip delay {:?}, ledger window {:?}",
        node.peers().len(),
        node.registry().handler_count(),
        node.gossip_delay(),
        node.ledger().window()
    );

    let mut shutdown_manager = ShutdownManager::new();
    let shutdown_token = shutdown_manager.token();

    let listen_addr = config.network.full_listen_address();
    let server = EventServer::bind(&listen_addr, node.clone())
        .await
        .map_err(|e| AppError::Network(format!("Failed to bind {}: {}", listen_addr, e)))?;

    let server_token = shutdown_token.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run(server_token.clone()).await {
            tracing::error!("❌ Event server stopped: {}", e);
            server_token.cancel();
        }
    });
    shutdown_manager.register_task("event-server", server_handle);

    shutdown_manager.wait_for_shutdown().await;
    Ok(())
}

/// `ping` always answers; the rest come from the `[[handlers]]` config.
fn register_builtin_handlers(node: &Arc<SyncNode>, handlers: &[HandlerConfig]) {
    let name = node.name().to_string();
    node.on_sync("ping", HandlerOptions::new(), move |input| {
        json!({ "pong": true, "node": name, "eventId": input.event_id })
    });

    for handler in handlers {
        let node_name = node.name().to_string();
        match handler.action {
            HandlerAction::Echo => {
                node.on_sync(&handler.event, handler.options(), |input| input.to_value());
            }
            HandlerAction::Ack => {
                node.on_sync(&handler.event, handler.options(), move |input| {
                    // Only reached while limited when handle_rate_limit is set
                    if input.is_rate_limited() {
                        return json!({ "ok": false, "node": node_name, "limited": input.to_value() });
                    }
                    tracing::info!("📬 {} ({}) from {}", input.event, input.event_id, input.source);
                    json!({ "ok": true, "node": node_name, "eventId": input.event_id })
                });
            }
        }
        tracing::info!("  └─ {:?} handler on '{}'", handler.action, handler.event);
    }
}

/// Returns the appender guard when logging to a file; keep it alive for the
/// lifetime of the process or buffered lines are lost.
fn setup_logging(config: &config::LoggingConfig, verbose: bool) -> Option<WorkerGuard> {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "debug" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if config.output == "file" {
        let path = PathBuf::from(&config.file_path);
        let dir = path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "dsyncd.log".to_string());

        if let Err(e) = std::fs::create_dir_all(&dir) {
            eprintln!("⚠️  Cannot create log directory {}: {}", dir.display(), e);
        }
        let appender = tracing_appender::rolling::daily(dir, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);

        let builder = fmt().with_env_filter(filter).with_writer(writer).with_ansi(false);
        if config.format == "json" {
            builder.json().init();
        } else {
            builder.with_target(false).init();
        }
        return Some(guard);
    }

    // Detect if running under systemd/journald
    let is_systemd =
        std::env::var("JOURNAL_STREAM").is_ok() || std::env::var("INVOCATION_ID").is_ok();

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

    match config.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_thread_ids(false)
                .init();
        }
        _ => {
            if is_systemd {
                // journald already adds timestamp and hostname
                fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .without_time()
                    .compact()
                    .init();
            } else {
                fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_timer(CustomTimer {
                        hostname: short_hostname,
                    })
                    .compact()
                    .init();
            }
        }
    }
    None
}

// UTC time plus short hostname, e.g. "2025-12-10 18:09:43.150 [node1]"
struct CustomTimer {
    hostname: String,
}

impl tracing_subscriber::fmt::time::FormatTime for CustomTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}
