mod config;
mod dns;
mod fsm;
mod metrics;
mod probe;
mod reply;
mod router;
mod server;
mod web;
mod zones;

use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::fsm::HandlerContext;
use crate::metrics::Metrics;
use crate::router::Router;
use crate::web::server::WebServer;
use crate::zones::ZoneCache;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fanout_dns=info".into()),
        )
        .init();

    info!("fanout-dns v{} starting", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "fanout-dns.toml".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => {
            info!("Config loaded from {}", config_path);
            config
        }
        Err(e) => {
            warn!("{}; running with built-in defaults", e);
            Config::default()
        }
    };
    let config = Arc::new(config);

    let metrics = Arc::new(Metrics::new());

    let zone_servers = match config.forward.zone_servers_file.as_deref() {
        Some(path) => match zones::load_zone_servers(path) {
            Ok(servers) => {
                info!("{} authoritative-zone servers from {}", servers.len(), path);
                servers
            }
            Err(e) => {
                warn!("{}; authoritative-zone pool is empty", e);
                Vec::new()
            }
        },
        None => Vec::new(),
    };
    for apex in &config.zones.authoritative {
        info!("authoritative zone: {}", apex);
    }

    let zone_cache = ZoneCache::new(&config.zones.authoritative);
    let router = Router::new(&config, zone_servers, zone_cache, metrics.clone());
    let ctx = Arc::new(HandlerContext {
        router,
        metrics: metrics.clone(),
    });

    let web = WebServer::new(metrics, config.clone());
    tokio::spawn(async move {
        if let Err(e) = web.run().await {
            error!("stats endpoint error: {}", e);
        }
    });

    let bind_addr = format!("{}:{}", config.listen.address, config.listen.port);
    let udp_socket = Arc::new(UdpSocket::bind(&bind_addr).await?);
    info!("fanout-dns listening on {} (UDP)", bind_addr);

    let tcp_listener = TcpListener::bind(&bind_addr).await?;
    info!("fanout-dns listening on {} (TCP)", bind_addr);

    let tcp_ctx = ctx.clone();
    tokio::spawn(server::run_tcp(tcp_listener, tcp_ctx));

    server::run_udp(udp_socket, ctx).await;
    Ok(())
}
