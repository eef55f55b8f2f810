// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batching loop between the intake queue and the storage backend.
//!
//! Queued flow messages are buffered and written in bulk, either once `bulk_insert`
//! messages are pending or when the deadline ticker fires, whichever comes first. On
//! cancellation every message still queued is drained and flushed before the loop returns.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::BulkSettings;
use crate::flow::FlowMessage;
use crate::storage::FlowStorage;
use crate::subscriber::SendFlows;

pub struct FlowBatcher {
    rx: mpsc::Receiver<FlowMessage>,
    storage: Option<Arc<dyn FlowStorage>>,
    subscriber: Option<Arc<dyn SendFlows>>,
    bulk_insert: usize,
    deadline: Duration,
    cancel_token: CancellationToken,
}

impl FlowBatcher {
    pub fn new(
        rx: mpsc::Receiver<FlowMessage>,
        settings: BulkSettings,
        storage: Option<Arc<dyn FlowStorage>>,
        subscriber: Option<Arc<dyn SendFlows>>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            rx,
            storage,
            subscriber,
            bulk_insert: settings.bulk_insert.max(1),
            deadline: settings.deadline,
            cancel_token,
        }
    }

    pub async fn run(mut self) {
        debug!(
            "Flow batcher started, bulk insert of {} messages every {:?} at most",
            self.bulk_insert, self.deadline
        );

        let mut ticker = interval_at(Instant::now() + self.deadline, self.deadline);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut pending: Vec<FlowMessage> = Vec::with_capacity(self.bulk_insert);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    self.store_flows(std::mem::take(&mut pending)).await;
                }
                msg = self.rx.recv() => match msg {
                    Some(msg) => {
                        pending.push(msg);
                        if pending.len() >= self.bulk_insert {
                            self.store_flows(std::mem::take(&mut pending)).await;
                        }
                    }
                    None => break,
                },
            }
        }

        // transports are stopped first, whatever they queued is still delivered
        self.rx.close();
        while let Ok(msg) = self.rx.try_recv() {
            pending.push(msg);
            if pending.len() >= self.bulk_insert {
                self.store_flows(std::mem::take(&mut pending)).await;
            }
        }
        self.store_flows(pending).await;

        debug!("Flow batcher stopped");
    }

    /// Writes one batch: flows are stored then sent to subscribers, updates are applied
    /// afterwards. Failures are logged and the batch is discarded.
    async fn store_flows(&self, msgs: Vec<FlowMessage>) {
        if msgs.is_empty() {
            return;
        }
        let Some(storage) = &self.storage else {
            return;
        };

        let mut flows = Vec::new();
        let mut updates = Vec::new();
        for msg in msgs {
            flows.extend(msg.flows);
            updates.extend(msg.updates);
        }

        if !flows.is_empty() {
            match storage.store_flows(&flows).await {
                Ok(()) => {
                    debug!("{} flows stored", flows.len());
                    if let Some(subscriber) = &self.subscriber {
                        subscriber.send_flows(&flows);
                    }
                }
                Err(e) => error!("Error while storing {} flows: {}", flows.len(), e),
            }
        }

        if !updates.is_empty() {
            match storage.update_flows(&updates).await {
                Ok(()) => debug!("{} flows updated", updates.len()),
                Err(e) => error!("Error while updating {} flows: {}", updates.len(), e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StorageError;
    use crate::flow::{Flow, FlowUpdate};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tracing_test::traced_test;

    #[derive(Debug, PartialEq)]
    enum Call {
        Store(Vec<String>),
        Update(Vec<String>),
    }

    struct RecordingStorage {
        calls: mpsc::UnboundedSender<Call>,
        failures: AtomicUsize,
    }

    impl RecordingStorage {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Call>) {
            let (calls, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    calls,
                    failures: AtomicUsize::new(0),
                }),
                rx,
            )
        }
    }

    #[async_trait]
    impl FlowStorage for RecordingStorage {
        async fn store_flows(&self, flows: &[Flow]) -> Result<(), StorageError> {
            let _ = self
                .calls
                .send(Call::Store(flows.iter().map(|f| f.uuid.clone()).collect()));
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StorageError::Unavailable);
            }
            Ok(())
        }

        async fn update_flows(&self, updates: &[FlowUpdate]) -> Result<(), StorageError> {
            let _ = self
                .calls
                .send(Call::Update(updates.iter().map(|u| u.uuid.clone()).collect()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSubscriber {
        batches: Mutex<Vec<usize>>,
    }

    impl SendFlows for RecordingSubscriber {
        fn send_flows(&self, flows: &[Flow]) {
            self.batches.lock().unwrap().push(flows.len());
        }
    }

    fn message(uuid: &str) -> FlowMessage {
        FlowMessage {
            flows: vec![Flow {
                uuid: uuid.to_string(),
                ..Default::default()
            }],
            updates: vec![],
        }
    }

    fn batcher(
        rx: mpsc::Receiver<FlowMessage>,
        bulk_insert: usize,
        deadline: Duration,
        storage: Arc<RecordingStorage>,
        subscriber: Option<Arc<RecordingSubscriber>>,
        cancel_token: CancellationToken,
    ) -> FlowBatcher {
        FlowBatcher::new(
            rx,
            BulkSettings {
                bulk_insert,
                deadline,
            },
            Some(storage as Arc<dyn FlowStorage>),
            subscriber.map(|s| s as Arc<dyn SendFlows>),
            cancel_token,
        )
    }

    fn store(uuids: &[&str]) -> Call {
        Call::Store(uuids.iter().map(|u| u.to_string()).collect())
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_bulk_count() {
        let (tx, rx) = mpsc::channel(10);
        let (storage, mut calls) = RecordingStorage::new();
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(
            batcher(rx, 3, Duration::from_secs(60), storage, None, cancel_token.clone()).run(),
        );

        for uuid in ["a", "b", "c"] {
            tx.send(message(uuid)).await.unwrap();
        }

        assert_eq!(calls.recv().await, Some(store(&["a", "b", "c"])));
        assert!(calls.try_recv().is_err());

        // one more message stays pending until the stop drain
        tx.send(message("d")).await.unwrap();
        tokio::task::yield_now().await;
        assert!(calls.try_recv().is_err());

        cancel_token.cancel();
        handle.await.unwrap();
        assert_eq!(calls.recv().await, Some(store(&["d"])));
        assert!(calls.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_deadline() {
        let (tx, rx) = mpsc::channel(10);
        let (storage, mut calls) = RecordingStorage::new();
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(
            batcher(rx, 100, Duration::from_secs(1), storage, None, cancel_token.clone()).run(),
        );

        tx.send(message("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert_eq!(calls.try_recv().ok(), Some(store(&["a"])));
        assert!(calls.try_recv().is_err());

        cancel_token.cancel();
        handle.await.unwrap();
        assert!(calls.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_tick_does_not_touch_storage() {
        let (_tx, rx) = mpsc::channel::<FlowMessage>(10);
        let (storage, mut calls) = RecordingStorage::new();
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(
            batcher(rx, 10, Duration::from_secs(1), storage, None, cancel_token.clone()).run(),
        );

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        cancel_token.cancel();
        handle.await.unwrap();

        assert!(calls.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_drains_queued_messages() {
        let (tx, rx) = mpsc::channel(10);
        let (storage, mut calls) = RecordingStorage::new();
        let cancel_token = CancellationToken::new();

        tx.send(message("a")).await.unwrap();
        tx.send(message("b")).await.unwrap();
        cancel_token.cancel();

        batcher(rx, 10, Duration::from_secs(5), storage, None, cancel_token)
            .run()
            .await;

        assert_eq!(calls.recv().await, Some(store(&["a", "b"])));
        assert!(calls.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drain_respects_bulk_size() {
        let (tx, rx) = mpsc::channel(10);
        let (storage, mut calls) = RecordingStorage::new();
        let cancel_token = CancellationToken::new();

        for uuid in ["a", "b", "c"] {
            tx.send(message(uuid)).await.unwrap();
        }
        cancel_token.cancel();

        batcher(rx, 2, Duration::from_secs(5), storage, None, cancel_token)
            .run()
            .await;

        assert_eq!(calls.recv().await, Some(store(&["a", "b"])));
        assert_eq!(calls.recv().await, Some(store(&["c"])));
        assert!(calls.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_queue_stops_the_loop() {
        let (tx, rx) = mpsc::channel(10);
        let (storage, mut calls) = RecordingStorage::new();

        tx.send(message("a")).await.unwrap();
        drop(tx);

        batcher(rx, 10, Duration::from_secs(5), storage, None, CancellationToken::new())
            .run()
            .await;

        assert_eq!(calls.recv().await, Some(store(&["a"])));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_store_failure_skips_subscribers_and_keeps_flushing() {
        let (tx, rx) = mpsc::channel(10);
        let (storage, mut calls) = RecordingStorage::new();
        storage.failures.store(1, Ordering::SeqCst);
        let subscriber = Arc::new(RecordingSubscriber::default());
        let cancel_token = CancellationToken::new();

        tx.send(message("a")).await.unwrap();
        tx.send(message("b")).await.unwrap();
        cancel_token.cancel();

        batcher(
            rx,
            1,
            Duration::from_secs(60),
            storage,
            Some(subscriber.clone()),
            cancel_token,
        )
        .run()
        .await;

        assert_eq!(calls.recv().await, Some(store(&["a"])));
        assert_eq!(calls.recv().await, Some(store(&["b"])));
        assert_eq!(*subscriber.batches.lock().unwrap(), vec![1]);
        assert!(logs_contain("Error while storing 1 flows"));
        assert!(logs_contain("1 flows stored"));
    }

    #[tokio::test]
    async fn test_flows_and_updates_are_split() {
        let (tx, rx) = mpsc::channel(10);
        let (storage, mut calls) = RecordingStorage::new();
        let subscriber = Arc::new(RecordingSubscriber::default());
        let cancel_token = CancellationToken::new();

        tx.send(FlowMessage {
            flows: vec![Flow {
                uuid: "a".to_string(),
                ..Default::default()
            }],
            updates: vec![FlowUpdate {
                uuid: "x".to_string(),
                ..Default::default()
            }],
        })
        .await
        .unwrap();
        tx.send(FlowMessage {
            flows: vec![],
            updates: vec![FlowUpdate {
                uuid: "y".to_string(),
                ..Default::default()
            }],
        })
        .await
        .unwrap();
        cancel_token.cancel();

        batcher(
            rx,
            10,
            Duration::from_secs(5),
            storage,
            Some(subscriber.clone()),
            cancel_token,
        )
        .run()
        .await;

        assert_eq!(calls.recv().await, Some(store(&["a"])));
        assert_eq!(
            calls.recv().await,
            Some(Call::Update(vec!["x".to_string(), "y".to_string()]))
        );
        assert_eq!(*subscriber.batches.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_without_storage_messages_are_discarded() {
        let (tx, rx) = mpsc::channel(10);
        let cancel_token = CancellationToken::new();
        tx.send(message("a")).await.unwrap();
        cancel_token.cancel();

        let batcher = FlowBatcher::new(
            rx,
            BulkSettings {
                bulk_insert: 10,
                deadline: Duration::from_secs(5),
            },
            None,
            None,
            cancel_token,
        );
        batcher.run().await;
    }
}
