use super::AgentContext;
use crate::message::PayloadShape;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use uuid::Uuid;

/// Error type returned by agent handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Unique identity of a registered agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(Uuid);

impl AgentId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Async handler invoked once per matching record
#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn handle(&self, payload: Arc<Value>, ctx: AgentContext) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> AgentHandler for F
where
    F: Fn(Arc<Value>, AgentContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, payload: Arc<Value>, ctx: AgentContext) -> Result<(), HandlerError> {
        (self)(payload, ctx).await
    }
}

/// Handler that validates and deserializes the payload before calling `f`
struct TypedHandler<T, F> {
    shape: PayloadShape,
    f: F,
    _payload: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, F, Fut> AgentHandler for TypedHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T, AgentContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, payload: Arc<Value>, ctx: AgentContext) -> Result<(), HandlerError> {
        let decoded: T = self.shape.decode(&payload)?;
        (self.f)(decoded, ctx).await
    }
}

/// A topic-bound processing unit
///
/// Identity is the allocation: registering the same `Arc<Agent>` twice runs
/// it twice per matching record.
pub struct Agent {
    id: AgentId,
    name: Option<String>,
    topic: String,
    shape: PayloadShape,
    handler: Arc<dyn AgentHandler>,
}

impl Agent {
    pub fn new<T, H>(topic: T, shape: PayloadShape, handler: H) -> Self
    where
        T: Into<String>,
        H: AgentHandler + 'static,
    {
        Self {
            id: AgentId::new(),
            name: None,
            topic: topic.into(),
            shape,
            handler: Arc::new(handler),
        }
    }

    /// Agent backed by an async closure
    pub fn from_fn<T, F, Fut>(topic: T, shape: PayloadShape, f: F) -> Self
    where
        T: Into<String>,
        F: Fn(Arc<Value>, AgentContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self::new(topic, shape, f)
    }

    /// Agent whose handler receives a validated, deserialized `P`
    pub fn typed<P, T, F, Fut>(topic: T, f: F) -> Self
    where
        P: DeserializeOwned + JsonSchema + Send + 'static,
        T: Into<String>,
        F: Fn(P, AgentContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let shape = PayloadShape::of::<P>();
        let handler = TypedHandler {
            shape: shape.clone(),
            f,
            _payload: PhantomData,
        };
        Self::new(topic, shape, handler)
    }

    /// Set a display name used in diagnostics
    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Display name, falling back to the id
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.id.to_string(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn shape(&self) -> &PayloadShape {
        &self.shape
    }

    /// Run the handler for one decoded payload
    pub async fn execute(&self, payload: Arc<Value>, ctx: AgentContext) -> Result<(), HandlerError> {
        self.handler.handle(payload, ctx).await
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("topic", &self.topic)
            .field("shape", &self.shape.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageEnvelope;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn ctx() -> AgentContext {
        AgentContext::from_envelope(&MessageEnvelope::new("orders", 0, 0, None, "{}"), None)
    }

    #[derive(Debug, Deserialize, JsonSchema)]
    struct Order {
        orderid: u64,
    }

    #[tokio::test]
    async fn test_closure_agent_executes() {
        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = seen.clone();
        let agent = Agent::from_fn("orders", PayloadShape::any(), move |payload: Arc<Value>, _ctx| {
            let seen = seen_clone.clone();
            async move {
                seen.store(payload["orderid"].as_u64().unwrap_or(0), Ordering::SeqCst);
                Ok(())
            }
        });

        agent.execute(Arc::new(json!({"orderid": 18})), ctx()).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 18);
        assert_eq!(agent.topic(), "orders");
        assert_eq!(agent.shape().name(), "any");
    }

    #[tokio::test]
    async fn test_typed_agent_decodes_payload() {
        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = seen.clone();
        let agent = Agent::typed("orders", move |order: Order, _ctx| {
            let seen = seen_clone.clone();
            async move {
                seen.store(order.orderid, Ordering::SeqCst);
                Ok(())
            }
        });

        agent.execute(Arc::new(json!({"orderid": 7})), ctx()).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        assert_eq!(agent.shape().name(), "Order");
    }

    #[tokio::test]
    async fn test_typed_agent_rejects_wrong_shape() {
        let agent = Agent::typed("orders", |_order: Order, _ctx| async { Ok(()) });

        let result = agent.execute(Arc::new(json!({"orderid": "x"})), ctx()).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_agents_have_distinct_ids() {
        let a = Agent::from_fn("t", PayloadShape::any(), |_p: Arc<Value>, _c| async { Ok(()) });
        let b = Agent::from_fn("t", PayloadShape::any(), |_p: Arc<Value>, _c| async { Ok(()) });
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_label_prefers_name() {
        let agent = Agent::from_fn("t", PayloadShape::any(), |_p: Arc<Value>, _c| async { Ok(()) })
            .with_name("order-writer");
        assert_eq!(agent.label(), "order-writer");
        assert_eq!(agent.name(), Some("order-writer"));

        let unnamed = Agent::from_fn("t", PayloadShape::any(), |_p: Arc<Value>, _c| async { Ok(()) });
        assert_eq!(unnamed.label(), unnamed.id().to_string());
    }
}
