use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use edge_gateway::api::{create_api_routes, SharedAppState};
use edge_gateway::cloud::CloudManager;
use edge_gateway::config::settings::Settings;
use edge_gateway::drivers::modbus::ModbusTcpHandler;
use edge_gateway::drivers::opcua::OpcUaHandler;
use edge_gateway::gateway::{Gateway, GatewayConfig};
use edge_gateway::governor::{ResourceGovernor, SysinfoSampler};
use edge_gateway::logging;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging(None);

    let config_path = Path::new("config.toml");
    let settings = match Settings::load(config_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("FATAL: failed to load configuration from {:?}: {}", config_path, e);
            std::process::exit(1);
        }
    };
    tracing::info!(devices = settings.devices.len(), tags = settings.tags.len(), "configuration loaded");

    let buffer = settings.build_egress_buffer().await?;
    let cloud = CloudManager::new(settings.manager_config(), buffer);
    cloud.set_routing_rules(settings.routing_rules());
    for (name, connector) in settings.connectors() {
        if let Err(e) = cloud.register_connector(connector).await {
            tracing::warn!(connector = %name, error = %e, "failed to register cloud connector");
        }
    }

    let governor = ResourceGovernor::new(settings.governor_config(), Box::new(SysinfoSampler::new()));

    let gateway = Gateway::new(
        GatewayConfig {
            breaker: settings.breaker_config(),
            ..GatewayConfig::default()
        },
        cloud,
        governor,
    );

    gateway.register_handler("modbus-tcp", Arc::new(ModbusTcpHandler::new()));
    gateway.register_handler("opc-ua", Arc::new(OpcUaHandler::new()));

    for device in settings.device_models() {
        gateway.register_device(device);
    }
    for tag in settings.tag_models() {
        gateway.register_tag(tag);
    }

    gateway.connect_all().await;
    gateway.start();

    let app_state = SharedAppState {
        gateway: gateway.clone(),
        start_time: tokio::time::Instant::now(),
    };
    let app = create_api_routes().with_state(app_state);

    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    tracing::info!(%addr, "api server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "api server exited");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    gateway.stop().await;
    Ok(())
}
