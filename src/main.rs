use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use dbha::config::{self, Config};
use dbha::context::HaContext;
use dbha::coordinator::{AgentRegistration, HttpCoordinator};
use dbha::detect::{MonitorAgent, MysqlProbeFactory};
use dbha::gm::TcpGmConnector;
use dbha::switch::MysqlControlConnector;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = load_or_default_config();
    config.validate()?;

    let coordinator = Arc::new(HttpCoordinator::new(&config.coordinator)?);
    let switch_config = &config.switch;
    let control = Arc::new(MysqlControlConnector::new(
        switch_config.control_user.clone(),
        switch_config.control_password.clone(),
        switch_config.control_connect_timeout(),
    ));

    let ctx = Arc::new(HaContext {
        coordinator: coordinator.clone(),
        audit: coordinator.clone(),
        probes: Arc::new(MysqlProbeFactory::new(config.probe.clone())),
        gm_connector: Arc::new(TcpGmConnector::new()),
        // name-service providers are deployment specific and plugged in by the embedding service
        name_services: Vec::new(),
        control,
        config,
    });

    let agent = &ctx.config.agent;
    let registration = AgentRegistration {
        ip: agent.ip.clone(),
        port: agent.port,
        zone: agent.zone.clone(),
        cloud: agent.cloud.clone(),
        db_types: agent.db_types.clone(),
    };
    if let Err(e) = ctx.coordinator.register_agent(&registration).await {
        error!(error = %e, "Agent registration failed");
        return Err(e.into());
    }
    info!(
        ip = %registration.ip,
        zone = %registration.zone,
        cloud = %registration.cloud,
        "Agent registered"
    );

    let mut agents = JoinSet::new();
    for db_type in &ctx.config.agent.db_types {
        let agent = Arc::new(MonitorAgent::new(ctx.clone(), db_type.clone()));
        agents.spawn(agent.run());
    }

    while let Some(result) = agents.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Detection agent task exited");
        }
    }
    Ok(())
}

fn load_or_default_config() -> Config {
    let config_paths = ["config/dbha.toml", "dbha.toml"];

    for path in config_paths {
        match config::load_config(path) {
            Ok(config) => {
                info!(path = path, "Loaded configuration");
                return config;
            }
            Err(e) => {
                warn!(path = path, error = %e, "Failed to load config");
            }
        }
    }

    info!("Using default configuration");
    Config::default()
}
