// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded intake queue shared by the transports and drained by the batcher.
//!
//! Transports never wait on a full queue. When the queue holds `max_buffer_size` messages
//! or more, newly decoded messages are dropped whole and the loss is reported through a
//! rate-limited log line.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tracing::{debug, error};

use crate::flow::FlowMessage;

/// Minimum delay between two overload log lines of the same counter.
pub const OVERLOAD_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of pushing a message onto the intake queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    Dropped,
}

#[derive(Debug, Default)]
struct OverloadState {
    last_log: Option<Instant>,
    lost_flows: usize,
}

/// Counts flows lost to overload and logs them at most once per interval.
///
/// A transport owns one counter. The websocket transport shares its counter between all
/// agent connections, so the reported figure is an aggregate over every peer.
#[derive(Debug)]
pub struct OverloadCounter {
    min_interval: Duration,
    state: Mutex<OverloadState>,
}

impl OverloadCounter {
    pub fn new() -> Self {
        Self {
            min_interval: OVERLOAD_LOG_INTERVAL,
            state: Mutex::new(OverloadState::default()),
        }
    }

    /// Records `flow_units` lost flows. Returns true when a log line was emitted, in which
    /// case the pending count is reset.
    pub fn record_loss(&self, flow_units: usize) -> bool {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock poisoned");
        state.lost_flows += flow_units;

        let now = Instant::now();
        let should_log = match state.last_log {
            None => true,
            Some(last) => now.duration_since(last) >= self.min_interval,
        };
        if should_log {
            error!(
                "Buffer overflow - too many flow updates, removing and not storing flows: {}",
                state.lost_flows
            );
            state.last_log = Some(now);
            state.lost_flows = 0;
        }
        should_log
    }

    /// Flows lost since the last log line.
    pub fn pending_loss(&self) -> usize {
        #[allow(clippy::expect_used)]
        let state = self.state.lock().expect("lock poisoned");
        state.lost_flows
    }
}

impl Default for OverloadCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer side of the intake queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct IntakeQueue {
    tx: mpsc::Sender<FlowMessage>,
    max_buffer_size: usize,
}

/// Creates the intake queue.
///
/// The channel holds `max(max_buffer_size, 2 * bulk_insert)` messages; admission is decided
/// against `max_buffer_size`.
pub fn channel(
    max_buffer_size: usize,
    bulk_insert: usize,
) -> (IntakeQueue, mpsc::Receiver<FlowMessage>) {
    let capacity = max_buffer_size.max(bulk_insert.saturating_mul(2)).max(1);
    let (tx, rx) = mpsc::channel(capacity);
    (
        IntakeQueue {
            tx,
            max_buffer_size,
        },
        rx,
    )
}

impl IntakeQueue {
    /// Number of messages waiting for the batcher.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queues `msg` unless the queue is saturated, in which case the whole message is
    /// dropped and accounted on `overload`.
    pub fn push(&self, msg: FlowMessage, overload: &OverloadCounter) -> Admission {
        if self.len() >= self.max_buffer_size {
            overload.record_loss(msg.flow_units());
            return Admission::Dropped;
        }

        match self.tx.try_send(msg) {
            Ok(()) => Admission::Queued,
            Err(TrySendError::Full(msg)) => {
                overload.record_loss(msg.flow_units());
                Admission::Dropped
            }
            Err(TrySendError::Closed(msg)) => {
                debug!(
                    "Intake queue closed, discarding {} flows",
                    msg.flow_units()
                );
                Admission::Dropped
            }
        }
    }
}
