use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use relaykit_core::ServerConfig;
use relaykit_pubsub::PubSubServer;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::health::create_health_router;
use crate::router::create_router;

/// HTTP front of the service: the main listener plus an optional dedicated
/// health listener
pub struct ApiServer {
    config: ServerConfig,
    pubsub: Arc<dyn PubSubServer>,
    routes: Option<Router>,
}

impl ApiServer {
    pub fn new(config: ServerConfig, pubsub: Arc<dyn PubSubServer>) -> Self {
        Self {
            config,
            pubsub,
            routes: None,
        }
    }

    /// Merge application routes into the main router
    #[must_use]
    pub fn with_routes(mut self, routes: Router) -> Self {
        self.routes = Some(routes);
        self
    }

    pub fn router(&self) -> Router {
        create_router(&self.config, Arc::clone(&self.pubsub), self.routes.clone())
    }

    /// Serve until `shutdown` completes, then drain in-flight requests
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // both listeners are bound before either starts serving
        let listener = bind("HTTP", &self.config.listen_address).await?;
        let health_listener = match &self.config.health_listen_address {
            Some(address) => Some(bind("health", address).await?),
            None => None,
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = vec![spawn_server("HTTP", listener, self.router(), shutdown_rx.clone())];

        if let Some(listener) = health_listener {
            let router = create_health_router(&self.config.health_endpoint, Arc::clone(&self.pubsub));
            handles.push(spawn_server("health", listener, router, shutdown_rx));
        }

        shutdown.await;
        info!("Shutting down HTTP listeners");
        let _ = shutdown_tx.send(true);

        for handle in handles {
            handle.await.context("HTTP server task panicked")?;
        }

        Ok(())
    }
}

async fn bind(name: &str, address: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("Failed to bind {name} address {address}"))?;

    if let Ok(local) = listener.local_addr() {
        info!("{} server listening on {}", name, local);
    }
    Ok(listener)
}

fn spawn_server(
    name: &'static str,
    listener: TcpListener,
    router: Router,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let graceful = async move {
            let _ = shutdown_rx.changed().await;
        };

        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(graceful)
            .await
        {
            error!("{} server error: {}", name, e);
        }

        info!("{} server shut down gracefully", name);
    })
}
