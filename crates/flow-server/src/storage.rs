// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Storage backends receiving the bulk inserts of the batcher.

use std::sync::Mutex;

use async_trait::async_trait;
use hashbrown::HashMap;
use tracing::debug;

use crate::errors::StorageError;
use crate::flow::{Flow, FlowUpdate};
use crate::update::update_flow;

/// Persistent store of flows. Both calls receive one whole batch.
#[async_trait]
pub trait FlowStorage: Send + Sync {
    async fn store_flows(&self, flows: &[Flow]) -> Result<(), StorageError>;

    async fn update_flows(&self, updates: &[FlowUpdate]) -> Result<(), StorageError>;
}

/// Keeps the latest state of every flow in memory, keyed by uuid.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    flows: Mutex<HashMap<String, Flow>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flow(&self, uuid: &str) -> Option<Flow> {
        #[allow(clippy::expect_used)]
        let flows = self.flows.lock().expect("lock poisoned");
        flows.get(uuid).cloned()
    }

    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        let flows = self.flows.lock().expect("lock poisoned");
        flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FlowStorage for MemoryStorage {
    async fn store_flows(&self, flows: &[Flow]) -> Result<(), StorageError> {
        #[allow(clippy::expect_used)]
        let mut resident = self.flows.lock().expect("lock poisoned");
        for flow in flows {
            resident.insert(flow.uuid.clone(), flow.clone());
        }
        Ok(())
    }

    async fn update_flows(&self, updates: &[FlowUpdate]) -> Result<(), StorageError> {
        let mut unknown = 0;

        #[allow(clippy::expect_used)]
        let mut resident = self.flows.lock().expect("lock poisoned");
        for update in updates {
            match resident.get_mut(&update.uuid) {
                Some(flow) => {
                    update_flow(flow, update);
                }
                None => unknown += 1,
            }
        }

        if unknown > 0 {
            debug!("{} flow updates refer to unknown flows", unknown);
        }
        Ok(())
    }
}
