// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::AuthenticationBackend;
use crate::batcher::FlowBatcher;
use crate::codec::{FlowCodec, ProtobufCodec};
use crate::config::{FlowServerConfig, Protocol};
use crate::errors::Creation;
use crate::intake::{self, IntakeQueue};
use crate::storage::FlowStorage;
use crate::subscriber::SendFlows;
use crate::transport::Transport;

/// Lifecycle of a flow server. Every transition happens once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    /// Built, transport bound, nothing running yet.
    Idle = 0,
    Running = 1,
    /// Stop requested, pending flows are being flushed.
    Stopping = 2,
    Stopped = 3,
}

impl From<u8> for ServerState {
    fn from(value: u8) -> Self {
        match value {
            0 => ServerState::Idle,
            1 => ServerState::Running,
            2 => ServerState::Stopping,
            _ => ServerState::Stopped,
        }
    }
}

struct Tasks {
    transport: JoinHandle<()>,
    batcher: JoinHandle<()>,
}

/// Receives flows from agents and writes them in bulk to storage.
///
/// The transport task pushes decoded messages onto the intake queue and the batcher task
/// drains it. [`FlowServer::stop`] stops the transport first, then lets the batcher flush
/// everything still queued, and only returns once both tasks are done.
pub struct FlowServer {
    state: Arc<AtomicU8>,
    protocol: Protocol,
    local_addr: SocketAddr,
    queue: IntakeQueue,
    transport: Mutex<Option<Transport>>,
    batcher: Mutex<Option<FlowBatcher>>,
    tasks: Mutex<Option<Tasks>>,
    transport_cancel: CancellationToken,
    batcher_cancel: CancellationToken,
}

impl FlowServer {
    /// Validates `config` and binds the configured transport. Nothing is spawned before
    /// [`FlowServer::start`].
    pub async fn new(
        config: &FlowServerConfig,
        storage: Option<Arc<dyn FlowStorage>>,
        subscriber: Option<Arc<dyn SendFlows>>,
        auth: AuthenticationBackend,
    ) -> Result<Self, Creation> {
        Self::with_codec(config, Arc::new(ProtobufCodec), storage, subscriber, auth).await
    }

    pub async fn with_codec(
        config: &FlowServerConfig,
        codec: Arc<dyn FlowCodec>,
        storage: Option<Arc<dyn FlowStorage>>,
        subscriber: Option<Arc<dyn SendFlows>>,
        auth: AuthenticationBackend,
    ) -> Result<Self, Creation> {
        config.validate()?;
        let settings = config.bulk_settings()?;

        let transport = Transport::from_config(config, codec, Arc::new(auth)).await?;
        let local_addr = transport
            .local_addr()
            .map_err(|source| Creation::Bind {
                addr: config.bind_address(),
                source,
            })?;

        let (queue, rx) = intake::channel(config.max_buffer_size, settings.bulk_insert);
        let batcher_cancel = CancellationToken::new();
        let batcher = FlowBatcher::new(rx, settings, storage, subscriber, batcher_cancel.clone());

        Ok(Self {
            state: Arc::new(AtomicU8::new(ServerState::Idle as u8)),
            protocol: transport.protocol(),
            local_addr,
            queue,
            transport: Mutex::new(Some(transport)),
            batcher: Mutex::new(Some(batcher)),
            tasks: Mutex::new(None),
            transport_cancel: CancellationToken::new(),
            batcher_cancel,
        })
    }

    /// Spawns the transport and batcher tasks. Only the first call on an idle server has
    /// an effect.
    pub fn start(&self) {
        if self
            .state
            .compare_exchange(
                ServerState::Idle as u8,
                ServerState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            warn!("Flow server already started");
            return;
        }

        #[allow(clippy::expect_used)]
        let transport = self.transport.lock().expect("lock poisoned").take();
        #[allow(clippy::expect_used)]
        let batcher = self.batcher.lock().expect("lock poisoned").take();

        if let (Some(transport), Some(batcher)) = (transport, batcher) {
            let tasks = Tasks {
                batcher: tokio::spawn(batcher.run()),
                transport: transport.serve(self.queue.clone(), self.transport_cancel.clone()),
            };
            #[allow(clippy::expect_used)]
            let mut slot = self.tasks.lock().expect("lock poisoned");
            *slot = Some(tasks);
        }

        info!(
            "Flow server started, receiving {} flows on {}",
            self.protocol, self.local_addr
        );
    }

    /// Stops receiving flows and flushes the pending ones.
    ///
    /// Safe to call from several tasks at once: only the first caller drives the shutdown
    /// and waits for it, later callers return immediately. The shutdown runs on its own
    /// task, so it still completes when the returned future is dropped.
    pub async fn stop(&self) {
        if self
            .state
            .compare_exchange(
                ServerState::Running as u8,
                ServerState::Stopping as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            debug!("Flow server is not running, nothing to stop");
            return;
        }
        info!("Stopping flow server");

        #[allow(clippy::expect_used)]
        let tasks = self.tasks.lock().expect("lock poisoned").take();
        let state = Arc::clone(&self.state);
        let transport_cancel = self.transport_cancel.clone();
        let batcher_cancel = self.batcher_cancel.clone();

        let shutdown = tokio::spawn(async move {
            transport_cancel.cancel();
            if let Some(Tasks { transport, batcher }) = tasks {
                if let Err(e) = transport.await {
                    error!("Flow transport task failed: {}", e);
                }
                batcher_cancel.cancel();
                if let Err(e) = batcher.await {
                    error!("Flow batcher task failed: {}", e);
                }
            } else {
                batcher_cancel.cancel();
            }

            state.store(ServerState::Stopped as u8, Ordering::SeqCst);
            info!("Flow server stopped");
        });

        if let Err(e) = shutdown.await {
            error!("Flow server shutdown task failed: {}", e);
        }
    }

    pub fn state(&self) -> ServerState {
        ServerState::from(self.state.load(Ordering::SeqCst))
    }

    /// Address the transport is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Producer side of the intake queue.
    pub fn queue(&self) -> &IntakeQueue {
        &self.queue
    }
}
