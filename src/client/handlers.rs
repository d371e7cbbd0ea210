//! Message handler registration and subscriber bootstrap.
//!
//! A `HandlerRegistry` is the subscriber endpoint: the broker hands it every
//! message and it dispatches on the message type.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::broker::message::MessageWrapper;
use crate::broker::reference::{ReferenceWrapper, RoutingKey};
use crate::client::BrokerClient;
use crate::config::SubscriberSettings;
use crate::transport::Subscriber;
use crate::utils::error::{BrokerResult, DeliveryError};

type Handler =
    Arc<dyn Fn(MessageWrapper) -> BoxFuture<'static, Result<(), DeliveryError>> + Send + Sync>;

/// How a handler's message type is subscribed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub is_ordered: bool,
    pub routing_key: Option<RoutingKey>,
}

impl SubscriptionOptions {
    pub fn ordered() -> Self {
        Self {
            is_ordered: true,
            routing_key: None,
        }
    }

    pub fn unordered() -> Self {
        Self::default()
    }

    pub fn with_routing_key(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.routing_key = Some(RoutingKey::new(name, value));
        self
    }
}

struct Registration {
    options: SubscriptionOptions,
    handler: Handler,
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Registration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle messages of `message_type` as raw `MessageWrapper`s. A later
    /// registration for the same type replaces the earlier one.
    pub fn register_raw<F, Fut>(
        &mut self,
        message_type: impl Into<String>,
        options: SubscriptionOptions,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(MessageWrapper) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DeliveryError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |message: MessageWrapper| handler(message).boxed());
        self.handlers
            .insert(message_type.into(), Registration { options, handler });
        self
    }

    /// Handle messages of `message_type` with their JSON payload decoded as `T`.
    pub fn register<T, F, Fut>(
        &mut self,
        message_type: impl Into<String>,
        options: SubscriptionOptions,
        handler: F,
    ) -> &mut Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DeliveryError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register_raw(message_type, options, move |message: MessageWrapper| {
            let handler = Arc::clone(&handler);
            async move {
                let payload: T = serde_json::from_str(message.payload()).map_err(|err| {
                    DeliveryError::InvalidPayload {
                        message_type: message.message_type().to_string(),
                        reason: err.to_string(),
                    }
                })?;
                (*handler)(payload).await
            }
        })
    }

    pub fn message_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn options(&self, message_type: &str) -> Option<&SubscriptionOptions> {
        self.handlers
            .get(message_type)
            .map(|registration| &registration.options)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[async_trait]
impl Subscriber for HandlerRegistry {
    async fn receive_message(&self, message: MessageWrapper) -> Result<(), DeliveryError> {
        let Some(registration) = self.handlers.get(message.message_type()) else {
            return Err(DeliveryError::NoHandler {
                message_type: message.message_type().to_string(),
            });
        };
        let handler = Arc::clone(&registration.handler);
        (*handler)(message).await
    }
}

/// Subscribe `reference` to every message type in `registry`, each with its
/// own options. While the broker cannot be found the lookup is retried with a
/// fixed delay, up to `settings.broker_lookup_attempts` times.
pub async fn subscribe_handlers(
    client: &BrokerClient,
    registry: &HandlerRegistry,
    reference: &ReferenceWrapper,
    settings: &SubscriberSettings,
) -> BrokerResult<()> {
    for (message_type, registration) in &registry.handlers {
        let target = match &registration.options.routing_key {
            Some(key) => reference.clone().with_routing_key(key.name(), key.value()),
            None => reference.clone(),
        };
        subscribe_with_lookup_retry(
            client,
            target,
            message_type,
            registration.options.is_ordered,
            settings,
        )
        .await?;
    }
    info!(
        subscriber = %reference,
        handlers = registry.len(),
        "handlers subscribed"
    );
    Ok(())
}

async fn subscribe_with_lookup_retry(
    client: &BrokerClient,
    reference: ReferenceWrapper,
    message_type: &str,
    is_ordered: bool,
    settings: &SubscriberSettings,
) -> BrokerResult<()> {
    let attempts = settings.broker_lookup_attempts.max(1);
    let mut attempt = 1;
    loop {
        match client
            .subscribe(reference.clone(), message_type, is_ordered)
            .await
        {
            Ok(()) => {
                debug!(subscriber = %reference, message_type, "subscribed handler");
                return Ok(());
            }
            Err(err) if err.is_broker_not_found() && attempt < attempts => {
                warn!(
                    attempt,
                    attempts,
                    message_type,
                    "broker not found, retrying in {:?}",
                    settings.broker_lookup_delay()
                );
                tokio::time::sleep(settings.broker_lookup_delay()).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
