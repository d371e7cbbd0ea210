//! Addressable handles to subscribers.
//!
//! A `ReferenceWrapper` names either a service partition or an actor instance.
//! Equality and hashing only ever look at that identity, so a reference read
//! back from storage compares equal to the one that was written, whatever its
//! routing key or throttling state.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::broker::message::MessageWrapper;
use crate::transport::{EndpointResolver, PartitionKey};
use crate::utils::error::DeliveryError;

/// A partition of a partitioned service, optionally a specific listener on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceReference {
    pub service_uri: String,
    pub partition: PartitionKey,
    #[serde(default)]
    pub listener_name: Option<String>,
}

// The listener is a transport detail, not part of the identity.
impl PartialEq for ServiceReference {
    fn eq(&self, other: &Self) -> bool {
        self.service_uri == other.service_uri && self.partition == other.partition
    }
}

impl Eq for ServiceReference {}

impl Hash for ServiceReference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.service_uri.hash(state);
        self.partition.hash(state);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActorId {
    Long(i64),
    Guid(Uuid),
    Str(String),
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorId::Long(id) => write!(f, "{id}"),
            ActorId::Guid(id) => write!(f, "{id}"),
            ActorId::Str(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorReference {
    pub service_uri: String,
    pub actor_id: ActorId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriberRef {
    Service(ServiceReference),
    Actor(ActorReference),
}

impl SubscriberRef {
    /// Human readable name, for logs and stats.
    pub fn name(&self) -> String {
        match self {
            SubscriberRef::Service(service) => match &service.listener_name {
                Some(listener) => {
                    format!("{}/{} ({listener})", service.service_uri, service.partition)
                }
                None => format!("{}/{}", service.service_uri, service.partition),
            },
            SubscriberRef::Actor(actor) => format!("{}/{}", actor.service_uri, actor.actor_id),
        }
    }

    /// Canonical text form of the identity. Stable across processes and
    /// restarts, used to derive queue names.
    pub fn identity_key(&self) -> String {
        match self {
            SubscriberRef::Service(service) => {
                let partition = match &service.partition {
                    PartitionKey::Singleton => "singleton".to_string(),
                    PartitionKey::Int64(key) => format!("int64:{key}"),
                    PartitionKey::Named(name) => format!("named:{name}"),
                };
                format!("service|{}|{partition}", service.service_uri)
            }
            SubscriberRef::Actor(actor) => {
                let id = match &actor.actor_id {
                    ActorId::Long(id) => format!("long:{id}"),
                    ActorId::Guid(id) => format!("guid:{id}"),
                    ActorId::Str(id) => format!("str:{id}"),
                };
                format!("actor|{}|{id}", actor.service_uri)
            }
        }
    }
}

/// Content filter: deliver only when the value at JSON path `name` matches
/// the wildcard pattern `value`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingKey {
    name: String,
    value: String,
    /// `value` compiled on first use; `None` if it does not compile.
    #[serde(skip)]
    pattern: OnceLock<Option<Regex>>,
}

impl RoutingKey {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            pattern: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Whole-string match where `*` stands for any run of characters.
    pub fn matches(&self, text: &str) -> bool {
        self.pattern
            .get_or_init(|| wildcard_regex(&self.value))
            .as_ref()
            .is_some_and(|regex| regex.is_match(text))
    }
}

impl PartialEq for RoutingKey {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.value == other.value
    }
}

impl Eq for RoutingKey {}

#[derive(Debug, Default)]
struct SkipCount(AtomicU32);

impl Clone for SkipCount {
    fn clone(&self) -> Self {
        Self(AtomicU32::new(self.0.load(Ordering::Relaxed)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceWrapper {
    target: SubscriberRef,
    #[serde(default)]
    routing_key: Option<RoutingKey>,
    #[serde(skip)]
    skip_count: SkipCount,
}

impl ReferenceWrapper {
    pub fn new(target: SubscriberRef) -> Self {
        Self {
            target,
            routing_key: None,
            skip_count: SkipCount::default(),
        }
    }

    pub fn service(service_uri: impl Into<String>, partition: PartitionKey) -> Self {
        Self::new(SubscriberRef::Service(ServiceReference {
            service_uri: service_uri.into(),
            partition,
            listener_name: None,
        }))
    }

    pub fn actor(service_uri: impl Into<String>, actor_id: ActorId) -> Self {
        Self::new(SubscriberRef::Actor(ActorReference {
            service_uri: service_uri.into(),
            actor_id,
        }))
    }

    /// Name the listener on a service reference; ignored for actors.
    pub fn with_listener(mut self, listener_name: impl Into<String>) -> Self {
        if let SubscriberRef::Service(service) = &mut self.target {
            service.listener_name = Some(listener_name.into());
        }
        self
    }

    pub fn with_routing_key(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.routing_key = Some(RoutingKey::new(name, value));
        self
    }

    pub fn target(&self) -> &SubscriberRef {
        &self.target
    }

    pub fn routing_key(&self) -> Option<&RoutingKey> {
        self.routing_key.as_ref()
    }

    pub fn name(&self) -> String {
        self.target.name()
    }

    pub fn identity_key(&self) -> String {
        self.target.identity_key()
    }

    pub fn skip_count(&self) -> u32 {
        self.skip_count.0.load(Ordering::SeqCst)
    }

    pub fn set_skip_count(&self, count: u32) {
        self.skip_count.0.store(count, Ordering::SeqCst);
    }

    /// Whether the routing key (if any) accepts `message`.
    pub fn should_deliver_message(&self, message: &MessageWrapper) -> bool {
        let Some(routing_key) = &self.routing_key else {
            return true;
        };

        let Ok(document) = serde_json::from_str::<Value>(message.payload()) else {
            trace!(subscriber = %self, "payload is not JSON, routing key cannot match");
            return false;
        };
        let Some(value) = select_path(&document, &routing_key.name) else {
            return false;
        };
        let text = match value {
            Value::String(text) => text.clone(),
            Value::Number(number) => number.to_string(),
            Value::Bool(flag) => flag.to_string(),
            _ => return false,
        };
        routing_key.matches(&text)
    }

    /// False while the subscriber is being throttled, consuming one skip.
    pub fn should_process_messages(&self) -> bool {
        self.skip_count
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1))
            .is_err()
    }

    /// Deliver `message` to the subscriber endpoint unless the routing key
    /// filters it out, in which case this is a successful no-op.
    pub async fn publish(
        &self,
        message: &MessageWrapper,
        resolver: &dyn EndpointResolver,
    ) -> Result<(), DeliveryError> {
        if !self.should_deliver_message(message) {
            debug!(
                subscriber = %self,
                message_type = message.message_type(),
                "message filtered out by routing key"
            );
            return Ok(());
        }
        let endpoint = resolver.resolve(&self.target).await?;
        endpoint.receive_message(message.clone()).await
    }
}

impl PartialEq for ReferenceWrapper {
    fn eq(&self, other: &Self) -> bool {
        self.target == other.target
    }
}

impl Eq for ReferenceWrapper {}

impl Hash for ReferenceWrapper {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.target.hash(state);
    }
}

impl fmt::Display for ReferenceWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Walk a dotted path (`Customer.Name`, optionally `$.Customer.Name`).
/// Numeric segments index into arrays.
fn select_path<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.strip_prefix("$.").unwrap_or(path);
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(document, |current, segment| match current {
            Value::Object(fields) => fields.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

fn wildcard_regex(pattern: &str) -> Option<Regex> {
    let expression = format!(
        "^{}$",
        pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*")
    );
    Regex::new(&expression).ok()
}

