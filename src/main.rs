//! Bridge Gateway - CLI Application
//!
//! An authenticating reverse-proxy gateway:
//! - Route classification and allow-list enforcement
//! - Service token acquisition and injection
//! - Request forwarding with correlation id propagation

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bridge_gateway::config::GatewayConfig;
use bridge_gateway::gateway::{self, Gateway};
use bridge_gateway::metrics::GatewayMetrics;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Bridge Gateway - an authenticating reverse-proxy gateway
#[derive(Parser)]
#[command(name = "bridge-gateway")]
#[command(version, about = "An authenticating reverse-proxy gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Start {
        /// Configuration file path
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Validate the configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Generate a sample configuration file
    Init {
        /// Output file path
        #[arg(short, long, default_value = "config.toml")]
        output: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => start_server(&config).await?,
        Commands::Validate { config } => validate_config(&config)?,
        Commands::Init { output } => generate_sample_config(&output)?,
    }

    Ok(())
}

/// Start the gateway server
async fn start_server(config_path: &str) -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = GatewayConfig::from_file(config_path)?;
    info!("Loaded configuration from {}", config_path);

    let metrics = Arc::new(GatewayMetrics::new());
    let gateway = Arc::new(Gateway::new(&config, metrics.clone())?);

    let mut app = gateway::router(gateway);
    if config.metrics.enabled {
        let metrics_router = Router::new()
            .route(&config.metrics.path, get(metrics_handler))
            .with_state(metrics);
        app = app.merge(metrics_router);
        info!("Metrics endpoint enabled at {}", config.metrics.path);
    }
    let app = app.layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.server_addr().parse()?;
    info!("Starting gateway server on {}", addr);
    info!("Backends configured: {}", config.backends.len());
    info!(
        "Allow-list patterns configured: {}",
        config.allow_list.patterns.len()
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

/// Validate configuration file
fn validate_config(config_path: &str) -> anyhow::Result<()> {
    match GatewayConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid!");
            println!();
            println!("Server: {}:{}", config.server.host, config.server.port);
            println!("Router name: {}", config.router_name);
            println!("Token issuer: {}", config.token_issuer.base_address);
            println!();
            println!("Backends:");
            for (app, base) in &config.backends {
                println!("  {} → {}", app, base);
            }
            println!();
            println!("Allow-list patterns:");
            for pattern in &config.allow_list.patterns {
                println!("  {}", pattern);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration is invalid:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}

/// Generate sample configuration file
fn generate_sample_config(output_path: &str) -> anyhow::Result<()> {
    let sample_config = r#"# Bridge Gateway Configuration

api_key = "change-me"
router_name = "bridge-gateway"

[server]
host = "0.0.0.0"
port = 8080
timeout = 30

[token_issuer]
base_address = "http://localhost:5000"
cache_enabled = false

# Backend base addresses keyed by application name
[backends]
users = "http://localhost:5001"
auth = "http://localhost:5002"

# Target of the Anonymous/Authenticate alias route
[anonymous]
application = "auth"
login_route = "api/Users/authenticate"

# Permitted resource shapes on secure routes (lower-case anchored regexes)
[allow_list]
patterns = [
    "^users/\\d+$",
    "^users/create$",
    "^api/passwords/users/otp$",
    "^api/passwords/user/\\+\\d{1,15}/otp/\\d{4}/verify$",
    "^api/passwords/changepassword$",
]

[metrics]
enabled = false
path = "/metrics"
"#;

    std::fs::write(output_path, sample_config)?;
    println!("Sample configuration written to {}", output_path);
    Ok(())
}

/// Metrics handler
async fn metrics_handler(State(metrics): State<Arc<GatewayMetrics>>) -> impl IntoResponse {
    (StatusCode::OK, metrics.prometheus_output())
}
