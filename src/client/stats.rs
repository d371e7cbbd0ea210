use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::broker::events::QueueStats;
use crate::client::BrokerClient;
use crate::utils::error::BrokerResult;

/// Rolling history of queue stats collected from every broker partition.
///
/// Each queue keeps at most `capacity` samples; the oldest is evicted first.
#[derive(Debug)]
pub struct StatsAggregator {
    capacity: usize,
    history: Mutex<BTreeMap<String, VecDeque<QueueStats>>>,
}

impl StatsAggregator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            history: Mutex::new(BTreeMap::new()),
        }
    }

    /// Fetch stats from all partitions; returns how many samples were added.
    pub async fn poll(&self, client: &BrokerClient) -> BrokerResult<usize> {
        let mut added = 0;
        for (_, stats) in client.get_broker_stats().await? {
            added += stats.stats.len();
            self.record(stats.stats);
        }
        Ok(added)
    }

    pub fn record(&self, samples: impl IntoIterator<Item = QueueStats>) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        for sample in samples {
            let queue = history.entry(sample.queue_name.clone()).or_default();
            if queue.len() == self.capacity {
                queue.pop_front();
            }
            queue.push_back(sample);
        }
    }

    /// Samples of `queue_name`, oldest first.
    pub fn history(&self, queue_name: &str) -> Vec<QueueStats> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue_name)
            .map(|samples| samples.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Most recent sample of every queue.
    pub fn latest(&self) -> Vec<QueueStats> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter_map(|samples| samples.back().cloned())
            .collect()
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Poll every `interval` until `cancel` fires. Failed polls are logged.
    pub fn spawn_polling(
        self: &Arc<Self>,
        client: Arc<BrokerClient>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let aggregator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(err) = aggregator.poll(&client).await {
                    warn!("stats poll failed: {err}");
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        })
    }
}
