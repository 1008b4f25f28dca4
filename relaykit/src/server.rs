use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use relaykit_api::ApiServer;
use relaykit_core::{Config, PubSubConfig};
use relaykit_pubsub::{
    new_pubsub_server, AccessPolicy, ConnectionState, LocalPubSub, PubSubServer, PushServerConfig,
};

/// Pause between connection rounds once a round has given up
const RECONNECT_PAUSE: Duration = Duration::from_secs(5);

/// Broker-backed server when addresses are configured, single-node otherwise
pub fn build_pubsub(settings: &PubSubConfig) -> Result<Arc<dyn PubSubServer>> {
    if settings.addresses.is_empty() {
        warn!("No broker addresses configured, pub/sub runs in single-node mode");
        return Ok(Arc::new(LocalPubSub::new(
            settings.default_topic.clone(),
            AccessPolicy::default(),
        )));
    }

    let config = PushServerConfig::from_settings(settings).context("Invalid pub/sub configuration")?;
    info!("Pub/sub config: {}", config);
    Ok(new_pubsub_server(config))
}

pub struct RelayService {
    config: Config,
    pubsub: Arc<dyn PubSubServer>,
}

impl RelayService {
    pub fn new(config: Config, pubsub: Arc<dyn PubSubServer>) -> Self {
        Self { config, pubsub }
    }

    pub async fn run(self) -> Result<()> {
        let cancel = CancellationToken::new();
        let supervisor = self.spawn_connect_supervisor(cancel.clone());

        let api = ApiServer::new(self.config.server.clone(), Arc::clone(&self.pubsub));
        let result = api.serve(shutdown_signal()).await;
        if let Err(e) = &result {
            error!("HTTP server failed: {:#}", e);
        }

        // stop reconnecting before tearing the session down
        cancel.cancel();
        if let Err(e) = supervisor.await {
            error!("Pub/sub connect supervisor failed: {}", e);
        }
        self.pubsub.disconnect().await;

        info!("relaykit stopped");
        result
    }

    /// Keep the pub/sub server connected. A round that does not connect
    /// within `connect_wait` is aborted and retried; the HTTP surface keeps
    /// serving meanwhile and reports the degraded state.
    fn spawn_connect_supervisor(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let pubsub = Arc::clone(&self.pubsub);
        let connect_wait = self.config.pubsub.connect_wait();

        tokio::spawn(async move {
            loop {
                if pubsub.state() == ConnectionState::Disconnected {
                    let waiter = pubsub.connect();
                    let connected = tokio::select! {
                        () = cancel.cancelled() => return,
                        connected = waiter.wait(connect_wait) => connected,
                    };

                    if connected {
                        info!(default_topic = %pubsub.default_topic(), "Pub/sub connected");
                    } else {
                        warn!(
                            wait_secs = connect_wait.as_secs(),
                            "Pub/sub not connected, serving in degraded mode"
                        );
                    }
                }

                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(RECONNECT_PAUSE) => {}
                }
            }
        })
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("Shutdown signal received, starting graceful shutdown...");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_pubsub_without_addresses_is_local() {
        let settings = PubSubConfig::default();
        let pubsub = build_pubsub(&settings).unwrap();

        assert_eq!(pubsub.default_topic(), "events");
        assert!(pubsub.connect().wait(Duration::from_secs(1)).await);
        assert_eq!(pubsub.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_build_pubsub_with_addresses() {
        let settings = PubSubConfig {
            addresses: vec![":1234".to_string()],
            default_topic: "audit".to_string(),
            ..PubSubConfig::default()
        };
        let pubsub = build_pubsub(&settings).unwrap();

        assert_eq!(pubsub.default_topic(), "audit");
        assert_eq!(pubsub.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_build_pubsub_rejects_empty_topic() {
        let settings = PubSubConfig {
            addresses: vec![":1234".to_string()],
            default_topic: String::new(),
            ..PubSubConfig::default()
        };
        assert!(build_pubsub(&settings).is_err());
    }

    #[tokio::test]
    async fn test_supervisor_connects_and_stops() {
        let config = Config::default();
        let pubsub = build_pubsub(&config.pubsub).unwrap();
        let service = RelayService::new(config, Arc::clone(&pubsub));

        let cancel = CancellationToken::new();
        let supervisor = service.spawn_connect_supervisor(cancel.clone());

        let mut connected = false;
        for _ in 0..50 {
            if pubsub.state() == ConnectionState::Connected {
                connected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(connected);

        cancel.cancel();
        supervisor.await.unwrap();
    }
}
