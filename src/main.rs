use ringgate::admin::{AdminServer, AdminState, PKG_NAME, VERSION};
use ringgate::allowlist::AllowlistStore;
use ringgate::config::Config;
use ringgate::dedup::{self, DedupCache};
use ringgate::fanout::FanoutEngine;
use ringgate::gateway::GatewayClient;
use ringgate::ingress::IngressServer;
use ringgate::netutil;
use ringgate::reconciler::{self, Reconciler};
use ringgate::registry::{self, SubscriberRegistry};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info};

/// How long to wait for the gateway to come up before giving up
const GATEWAY_HEALTH_WINDOW: Duration = Duration::from_secs(10);
const GATEWAY_HEALTH_INTERVAL: Duration = Duration::from_secs(1);

/// Grace period for in-flight requests at shutdown
const LISTENER_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ringgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(
        name = PKG_NAME,
        version = VERSION,
        path = %config_path.display(),
        admin_port = config.port,
        private_ip = %config.private_ip,
        "Starting proxy"
    );

    let password = config.resolve_password()?;

    // Reservation test: the admin port must be bindable before we commit
    netutil::probe_port(config.port)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Shared state
    let allowlist = Arc::new(AllowlistStore::open(&config.allowlist_db)?);
    let subscriber_registry = Arc::new(SubscriberRegistry::new(config.registry.ttl()));
    let dedup_cache = Arc::new(DedupCache::new());

    let engine = Arc::new(FanoutEngine::new(
        Arc::clone(&subscriber_registry),
        Arc::clone(&allowlist),
        Arc::clone(&dedup_cache),
        &config.forward,
    )?);

    // Bind the loopback ingress listener first so the reconciler knows
    // which port to register with the gateway
    let ingress = IngressServer::bind(Arc::clone(&engine), shutdown_rx.clone()).await?;
    let ingress_port = ingress.port()?;
    info!(port = ingress_port, "Ingress port acquired");

    // The gateway is reached via a non-loopback local address unless
    // configured otherwise
    let gateway_host = match config.gateway.host.clone() {
        Some(host) => host,
        None => netutil::discover_local_ipv4()?.to_string(),
    };
    let gateway_url = format!("http://{}:{}", gateway_host, config.gateway.port);
    info!(url = %gateway_url, "Gateway address resolved");

    let gateway = Arc::new(GatewayClient::new(
        gateway_url,
        config.gateway.username.clone(),
        password,
    )?);

    wait_for_gateway(&gateway).await?;

    // Install webhooks; failure here is fatal
    let webhook_reconciler = Arc::new(Reconciler::new(Arc::clone(&gateway), ingress_port));
    webhook_reconciler.install().await?;

    // Background tasks
    let pruner_handle = tokio::spawn(registry::run_pruner(
        Arc::clone(&subscriber_registry),
        config.registry.prune_interval(),
        shutdown_rx.clone(),
    ));
    let sweeper_handle = tokio::spawn(dedup::run_sweeper(
        Arc::clone(&dedup_cache),
        config.dedup.sweep_interval(),
        config.dedup.ttl(),
        shutdown_rx.clone(),
    ));
    let reconciler_handle = tokio::spawn(reconciler::run_reconciler(
        Arc::clone(&webhook_reconciler),
        config.reconcile.interval(),
        shutdown_rx.clone(),
    ));

    // Listeners
    let admin_addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    let admin = AdminServer::bind(
        admin_addr,
        config.private_ip(),
        AdminState {
            registry: Arc::clone(&subscriber_registry),
            allowlist: Arc::clone(&allowlist),
            gateway: Arc::clone(&gateway),
        },
        shutdown_rx.clone(),
    )
    .await?;

    let ingress_handle = tokio::spawn(async move {
        if let Err(e) = ingress.run().await {
            error!(error = %e, "Ingress listener error");
        }
    });
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    wait_for_signal().await;

    // Ordered shutdown: tickers first, then listeners, then gateway cleanup
    let _ = shutdown_tx.send(true);
    let _ = reconciler_handle.await;
    let _ = pruner_handle.await;
    let _ = sweeper_handle.await;

    let _ = tokio::time::timeout(LISTENER_SHUTDOWN_DEADLINE, async {
        let _ = ingress_handle.await;
        let _ = admin_handle.await;
    })
    .await;

    // Best-effort: leave the gateway without registrations pointing at us
    webhook_reconciler.cleanup().await;

    info!("Shutdown complete");
    Ok(())
}

/// Poll the gateway's health endpoint until it answers or the window closes
async fn wait_for_gateway(gateway: &GatewayClient) -> anyhow::Result<()> {
    let start = Instant::now();
    loop {
        match gateway.health().await {
            Ok(()) => {
                info!("Gateway is healthy");
                return Ok(());
            }
            Err(e) => {
                if start.elapsed() >= GATEWAY_HEALTH_WINDOW {
                    anyhow::bail!(
                        "gateway not available after {}s: {}",
                        GATEWAY_HEALTH_WINDOW.as_secs(),
                        e
                    );
                }
                info!(error = %e, "Gateway not ready, retrying");
                tokio::time::sleep(GATEWAY_HEALTH_INTERVAL).await;
            }
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}
