use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing::{info, warn};

use crate::backend::{BackendGateway, HttpBackend};
use crate::config::Config;
use crate::server::BrokerServer;

pub struct BrokerRuntime {
    config: Config,
    backend: Arc<dyn BackendGateway>,
}

impl BrokerRuntime {
    pub fn new(config: Config) -> Result<Self> {
        let backend: Arc<dyn BackendGateway> = Arc::new(HttpBackend::new(
            config.backend.timeout_ms,
            &config.backend.user_agent,
        )?);
        Ok(Self { config, backend })
    }

    pub async fn run(self) -> Result<()> {
        info!(
            "starting webchat broker (bind={}, ws_path={}, http_timeout_ms={}, ping_interval_s={}, route_timeout_ms={}, backend_timeout_ms={})",
            self.config.server.bind,
            self.config.server.ws_path,
            self.config.server.http_timeout_ms,
            self.config.server.ping_interval_secs,
            self.config.server.route_timeout_ms,
            self.config.backend.timeout_ms
        );
        let server = BrokerServer::new(self.config.server.clone(), self.backend.clone());
        server.run_until(wait_for_ctrl_c()).await?;
        info!("webchat broker stopped");
        Ok(())
    }
}

async fn wait_for_ctrl_c() {
    match signal::ctrl_c().await {
        Ok(()) => info!("received ctrl-c, shutting down"),
        Err(err) => {
            warn!("ctrl-c handler unavailable, running until killed: {err}");
            std::future::pending::<()>().await;
        }
    }
}
