// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use flow_server::{
    auth::AuthenticationBackend,
    config::FlowServerConfig,
    server::FlowServer,
    storage::{FlowStorage, MemoryStorage},
    subscriber::{BroadcastSubscriberEndpoint, SendFlows},
};

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

#[tokio::main]
pub async fn main() {
    let config = FlowServerConfig::from_env();

    let log_level = config
        .as_ref()
        .map(|c| c.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());
    let env_filter = format!("tungstenite=off,tokio_tungstenite=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid flow server configuration: {}", e);
            return;
        }
    };

    if config.storage.backend != "memory" {
        error!(
            "Unsupported storage backend {}, only memory is available",
            config.storage.backend
        );
        return;
    }

    let storage = Arc::new(MemoryStorage::new());
    let endpoint = BroadcastSubscriberEndpoint::new(SUBSCRIBER_CHANNEL_CAPACITY);
    spawn_flow_logger(&endpoint);

    let auth = AuthenticationBackend::from_token(config.auth_token.as_deref());

    let server = match FlowServer::new(
        &config,
        Some(storage.clone() as Arc<dyn FlowStorage>),
        Some(Arc::new(endpoint) as Arc<dyn SendFlows>),
        auth,
    )
    .await
    {
        Ok(server) => server,
        Err(e) => {
            error!("Unable to create flow server: {}", e);
            return;
        }
    };

    server.start();

    shutdown_signal().await;

    server.stop().await;
    info!("{} flows kept in memory at shutdown", storage.len());
}

/// Logs every stored batch as JSON, at debug level.
fn spawn_flow_logger(endpoint: &BroadcastSubscriberEndpoint) {
    let mut rx = endpoint.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(flows) => match serde_json::to_string(flows.as_ref()) {
                    Ok(json) => debug!("Stored flows: {}", json),
                    Err(e) => error!("Unable to serialize flows: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Flow logger lagging, {} batches skipped", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Unable to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received ctrl-c, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
