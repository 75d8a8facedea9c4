pub mod access;
pub mod config;
pub mod disk;
pub mod domain;
pub mod health;
pub mod hypervisor;
pub mod id;
pub mod network;
pub mod ports;
pub mod proxy;
pub mod quota;
pub mod reconcile;
pub mod service;
pub mod store;
pub mod tasks;
pub mod vm;

pub mod proto {
    tonic::include_proto!("labvm.node.v1");
}

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::reconcile::Reconciler;
use crate::service::NodeService;
use crate::store::MemoryStore;
use crate::vm::VmManager;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let node_config = NodeConfig::from_env();
    let addr: SocketAddr = format!("0.0.0.0:{}", node_config.grpc_port).parse()?;
    let node_id = node_config.node_id.clone();
    let reconcile_interval = node_config.reconcile_interval;

    let store = Arc::new(MemoryStore::open(node_config.state_path()).await?);
    let hypervisor = hypervisor::connect(&node_config.hypervisor_uri, &node_config.data_dir)?;
    if !hypervisor.is_alive().await {
        warn!(uri = %node_config.hypervisor_uri, "hypervisor not reachable at startup");
    }

    info!(
        node_id = %node_id,
        grpc_port = node_config.grpc_port,
        data_dir = %node_config.data_dir,
        hypervisor = %node_config.hypervisor_uri,
        "starting lab vm node"
    );

    let manager = Arc::new(VmManager::new(node_config, store.clone(), hypervisor.clone()));
    manager.restore().await?;

    let reconciler = Arc::new(Reconciler::new(store, hypervisor));
    tokio::spawn(Arc::clone(&reconciler).run(reconcile_interval));

    let node_service = NodeService::new(Arc::clone(&manager), reconciler);

    info!(node_id = %node_id, %addr, "lab vm node ready");

    tonic::transport::Server::builder()
        .add_service(proto::node_server::NodeServer::new(node_service))
        .serve_with_shutdown(addr, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;

    info!("shutting down display proxies");
    manager.proxies().stop_all().await;

    Ok(())
}
