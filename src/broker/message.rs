use serde::{Deserialize, Serialize};

/// Represents a published message in the broker.
///
/// A message carries the fully-qualified name of its type, a reference to the
/// schema the payload follows, the serialized payload itself, and whether it
/// was relayed from another broker.
///
/// The broker never looks inside `payload` except to evaluate routing keys;
/// `message_type` is the routing and lookup key.
///
/// # Example
///
/// ```rust
/// use partsub::broker::message::MessageWrapper;
///
/// let msg = MessageWrapper::new("Contoso.Orders.OrderPlaced", r#"{"id":42}"#);
/// assert_eq!(msg.message_type(), "Contoso.Orders.OrderPlaced");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageWrapper {
    message_type: String,
    #[serde(default)]
    schema_ref: String,
    payload: String,
    #[serde(default)]
    is_relayed: bool,
}

impl MessageWrapper {
    pub fn new(message_type: impl Into<String>, payload: impl Into<String>) -> Self {
        let message_type = message_type.into();
        Self {
            schema_ref: message_type.clone(),
            message_type,
            payload: payload.into(),
            is_relayed: false,
        }
    }

    /// Serialize `payload` as JSON and wrap it.
    pub fn from_payload<T: Serialize>(
        message_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(message_type, serde_json::to_string(payload)?))
    }

    pub fn with_schema_ref(mut self, schema_ref: impl Into<String>) -> Self {
        self.schema_ref = schema_ref.into();
        self
    }

    /// Copy of this message marked as relayed.
    pub fn relayed(&self) -> Self {
        Self {
            is_relayed: true,
            ..self.clone()
        }
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn schema_ref(&self) -> &str {
        &self.schema_ref
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn is_relayed(&self) -> bool {
        self.is_relayed
    }
}
