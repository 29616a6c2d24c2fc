use clap::Parser;
use distro_cluster::config::ServerConfig;
use distro_cluster::distro::service::DistroProtocol;
use distro_cluster::distro::transport::HttpSyncTransport;
use distro_cluster::membership::service::MembershipService;
use distro_cluster::naming::mapper::ResponsibilityMapper;
use distro_cluster::naming::service::NamingService;
use distro_cluster::naming::sessions::SessionRegistry;
use distro_cluster::naming::store::EphemeralStore;
use distro_cluster::server::build_router;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.log_level))
        .init();

    config.distro.validate()?;
    let http_addr = config.http_addr()?;

    tracing::info!("Starting node on {}", config.bind);
    if !config.seeds.is_empty() {
        tracing::info!("Seed nodes: {:?}", config.seeds);
    } else {
        tracing::info!("Starting as seed node (founder)");
    }

    // 1. Membership (UDP gossip):
    let membership = MembershipService::new(config.bind, http_addr, config.seeds.clone()).await?;
    tracing::info!("Node ID: {:?}", membership.local_id());

    let service_clone = membership.clone();
    tokio::spawn(async move {
        service_clone.start().await;
    });

    // 2. Replication layer:
    let mapper = ResponsibilityMapper::new(membership.clone());
    let store = EphemeralStore::new();
    let transport = Arc::new(HttpSyncTransport::new(config.distro.sync_timeout()));
    let distro = DistroProtocol::new(
        membership.clone(),
        mapper,
        store.clone(),
        transport,
        &config.distro,
    );
    distro.start();

    // 3. Naming layer:
    let sessions = SessionRegistry::new();
    let naming = NamingService::new(membership.clone(), distro.clone(), sessions.clone(), &config.distro);
    naming.start();

    // 4. Spawn stats reporter:
    let stats_membership = membership.clone();
    let stats_distro = distro.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;
            let alive = stats_membership.get_alive_members();
            tracing::info!(
                "Cluster stats: {} alive nodes, {} services, {} instances, {} sessions, {} pending syncs",
                alive.len(),
                store.keys().len(),
                store.instance_count(),
                sessions.len(),
                stats_distro.engine().pending_len() + stats_distro.engine().retry_len()
            );
            for node in alive {
                tracing::debug!(
                    "  - {:?} gossip={} http={} (inc={})",
                    node.id,
                    node.gossip_addr,
                    node.http_addr,
                    node.incarnation
                );
            }
        }
    });

    // 5. Start HTTP server:
    let app = build_router(distro.clone(), naming.clone());

    tracing::info!("HTTP server listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    tracing::info!("Shutting down");
    naming.stop();
    distro.stop();

    Ok(())
}
