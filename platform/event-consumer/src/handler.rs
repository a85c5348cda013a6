//! User handler registry and debug-handler routing (§4.2.5).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use event_bus::Envelope;

/// Outcome of a handler invocation. `Err` carries the cause used for the
/// `event_processed_duration{status="failed"}` tag and the DLX
/// `x-error-message` header.
pub type HandlerResult = Result<(), String>;

/// A user callable: `fn(envelope) -> void` per §4.2.5, modeled as an
/// async trait object so handlers may await I/O.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> HandlerResult;
}

/// Adapts a plain async closure into a [`Handler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(&Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(&Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, envelope: &Envelope) -> HandlerResult {
        (self.f)(envelope).await
    }
}

type BoxedHandler = Arc<dyn Handler>;
type BoxedFuture<'a> = Pin<Box<dyn Future<Output = HandlerResult> + Send + 'a>>;

/// Per-event-name handler registry, plus one optional debug handler routed
/// to instead when an envelope carries `is_debug=true` (§4.2.5).
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, BoxedHandler>,
    debug_handler: Option<BoxedHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, event_name: impl Into<String>, handler: impl Handler + 'static) {
        self.handlers.insert(event_name.into(), Arc::new(handler));
    }

    pub fn register_debug(&mut self, handler: impl Handler + 'static) {
        self.debug_handler = Some(Arc::new(handler));
    }

    /// Route the envelope to the debug handler if it is debug-flagged and
    /// one is registered, else to the handler registered for its event
    /// name. Returns `None` if no handler applies (caller's decision what
    /// to do — SPEC_FULL.md leaves unmatched-event delivery to the
    /// consumer's own policy, not the registry's).
    pub fn resolve(&self, envelope: &Envelope) -> Option<BoxedHandler> {
        if envelope.system.is_debug {
            if let Some(debug) = &self.debug_handler {
                return Some(debug.clone());
            }
        }
        self.handlers.get(&envelope.event).cloned()
    }
}

/// Invoke `handler` against `envelope`, returning the handler's future.
/// Split out so `consumer.rs` can wrap this call in a `tokio::time::timeout`
/// without needing to know the handler's concrete type.
pub fn invoke<'a>(handler: &'a dyn Handler, envelope: &'a Envelope) -> BoxedFuture<'a> {
    Box::pin(handler.handle(envelope))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_by_event_name() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "order.created",
            FnHandler::new(|_env: &Envelope| async { Ok(()) }),
        );

        let envelope = Envelope::new("order.created").unwrap();
        assert!(registry.resolve(&envelope).is_some());

        let other = Envelope::new("order.cancelled").unwrap();
        assert!(registry.resolve(&other).is_none());
    }

    #[tokio::test]
    async fn debug_envelope_routes_to_debug_handler() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "order.created",
            FnHandler::new(|_env: &Envelope| async { Ok(()) }),
        );
        registry.register_debug(FnHandler::new(|_env: &Envelope| async {
            Err("debug path".to_string())
        }));

        let mut envelope = Envelope::new("order.created").unwrap();
        envelope.set_debug(true);

        let handler = registry.resolve(&envelope).expect("handler resolved");
        let result = invoke(handler.as_ref(), &envelope).await;
        assert_eq!(result, Err("debug path".to_string()));
    }
}
