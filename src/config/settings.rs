use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Groups the broker engine, storage retry, storage, subscriber bootstrap and
/// logging sections.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub retry: RetrySettings,
    pub storage: StorageSettings,
    pub subscriber: SubscriberSettings,
    pub logging: LoggingSettings,
}

/// Configuration settings for a broker partition and its delivery loop.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    /// Well-known name the broker registers under and clients look up.
    pub broker_name: String,
    pub due_time_ms: u64,
    pub period_ms: u64,
    pub max_processing_period_ms: u64,
    pub max_dequeues_in_one_iteration: usize,
    /// Passes skipped for a subscriber after a failed delivery.
    pub throttle_factor: u32,
    /// Treat every subscription as unordered regardless of what was requested.
    pub force_unordered: bool,
}

impl BrokerSettings {
    pub fn due_time(&self) -> Duration {
        Duration::from_millis(self.due_time_ms)
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn max_processing_period(&self) -> Duration {
        Duration::from_millis(self.max_processing_period_ms)
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            broker_name: "partsub-broker".to_string(),
            due_time_ms: 5_000,
            period_ms: 500,
            max_processing_period_ms: 5_000,
            max_dequeues_in_one_iteration: 100,
            throttle_factor: 10,
            force_unordered: false,
        }
    }
}

/// Retry policy for transient storage failures.
#[derive(Debug, Deserialize, Clone)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
}

impl RetrySettings {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 200,
        }
    }
}

/// Where broker state lives. Without a `path` state is kept in memory only.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    pub path: Option<String>,
    pub lock_timeout_ms: u64,
}

impl StorageSettings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            path: None,
            lock_timeout_ms: 4_000,
        }
    }
}

/// Subscriber-side bootstrap and stats collection.
#[derive(Debug, Deserialize, Clone)]
pub struct SubscriberSettings {
    pub broker_lookup_attempts: u32,
    pub broker_lookup_delay_ms: u64,
    pub stats_history_capacity: usize,
}

impl SubscriberSettings {
    pub fn broker_lookup_delay(&self) -> Duration {
        Duration::from_millis(self.broker_lookup_delay_ms)
    }
}

impl Default for SubscriberSettings {
    fn default() -> Self {
        Self {
            broker_lookup_attempts: 10,
            broker_lookup_delay_ms: 5_000,
            stats_history_capacity: 100,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Any field may be missing; `merge_with_defaults` fills the gaps.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub retry: Option<PartialRetrySettings>,
    pub storage: Option<PartialStorageSettings>,
    pub subscriber: Option<PartialSubscriberSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub broker_name: Option<String>,
    pub due_time_ms: Option<u64>,
    pub period_ms: Option<u64>,
    pub max_processing_period_ms: Option<u64>,
    pub max_dequeues_in_one_iteration: Option<usize>,
    pub throttle_factor: Option<u32>,
    pub force_unordered: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialRetrySettings {
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialStorageSettings {
    pub path: Option<String>,
    pub lock_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialSubscriberSettings {
    pub broker_lookup_attempts: Option<u32>,
    pub broker_lookup_delay_ms: Option<u64>,
    pub stats_history_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    /// Fill every value the sources left out from `Settings::default()`.
    pub fn merge_with_defaults(self) -> Settings {
        let default = Settings::default();
        let broker = self.broker.unwrap_or_default();
        let retry = self.retry.unwrap_or_default();
        let storage = self.storage.unwrap_or_default();
        let subscriber = self.subscriber.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();

        Settings {
            broker: BrokerSettings {
                broker_name: broker.broker_name.unwrap_or(default.broker.broker_name),
                due_time_ms: broker.due_time_ms.unwrap_or(default.broker.due_time_ms),
                period_ms: broker.period_ms.unwrap_or(default.broker.period_ms),
                max_processing_period_ms: broker
                    .max_processing_period_ms
                    .unwrap_or(default.broker.max_processing_period_ms),
                max_dequeues_in_one_iteration: broker
                    .max_dequeues_in_one_iteration
                    .unwrap_or(default.broker.max_dequeues_in_one_iteration),
                throttle_factor: broker
                    .throttle_factor
                    .unwrap_or(default.broker.throttle_factor),
                force_unordered: broker
                    .force_unordered
                    .unwrap_or(default.broker.force_unordered),
            },
            retry: RetrySettings {
                max_attempts: retry.max_attempts.unwrap_or(default.retry.max_attempts),
                initial_delay_ms: retry
                    .initial_delay_ms
                    .unwrap_or(default.retry.initial_delay_ms),
            },
            storage: StorageSettings {
                path: storage.path.or(default.storage.path),
                lock_timeout_ms: storage
                    .lock_timeout_ms
                    .unwrap_or(default.storage.lock_timeout_ms),
            },
            subscriber: SubscriberSettings {
                broker_lookup_attempts: subscriber
                    .broker_lookup_attempts
                    .unwrap_or(default.subscriber.broker_lookup_attempts),
                broker_lookup_delay_ms: subscriber
                    .broker_lookup_delay_ms
                    .unwrap_or(default.subscriber.broker_lookup_delay_ms),
                stats_history_capacity: subscriber
                    .stats_history_capacity
                    .unwrap_or(default.subscriber.stats_history_capacity),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(default.logging.level),
            },
        }
    }
}
