// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::trace;

use crate::flow::Flow;

/// Receives every batch of flows successfully written to storage.
pub trait SendFlows: Send + Sync {
    fn send_flows(&self, flows: &[Flow]);
}

/// Fans stored flows out to live viewers over a broadcast channel. Slow viewers lag and
/// miss batches; the batcher never waits on them.
#[derive(Debug, Clone)]
pub struct BroadcastSubscriberEndpoint {
    tx: broadcast::Sender<Arc<Vec<Flow>>>,
}

impl BroadcastSubscriberEndpoint {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<Flow>>> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl SendFlows for BroadcastSubscriberEndpoint {
    fn send_flows(&self, flows: &[Flow]) {
        if self.tx.send(Arc::new(flows.to_vec())).is_err() {
            trace!("No subscriber for {} flows", flows.len());
        }
    }
}
