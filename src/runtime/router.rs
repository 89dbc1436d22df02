//! Per-context message inbox.
//!
//! A router lives inside the context core and therefore only ever on the
//! context's own thread. Other threads reach it exclusively by enqueueing a
//! delivery through [`ExecutionContext::send_message`], which performs the
//! lookup once the delivery reaches the front of the queue.
//!
//! [`ExecutionContext::send_message`]: crate::runtime::handle::ExecutionContext::send_message

use crate::runtime::error::{ContextError, ContextId};
use crate::runtime::runner::ContextCore;
use crate::runtime::worker::WorkerId;
use std::collections::HashMap;
use std::fmt;

/// Addressing key a handler is registered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteKey {
    /// The fixed key a worker's own inbox is registered under.
    SelfKey,
    /// Messages coming back from a worker spawned by this context.
    Worker(WorkerId),
    /// Application-defined key.
    Named(String),
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteKey::SelfKey => f.write_str("self"),
            RouteKey::Worker(id) => write!(f, "{}", id),
            RouteKey::Named(name) => write!(f, "named:{}", name),
        }
    }
}

/// Handler invoked on the owning thread with the message payload.
pub type MessageHandler = Box<dyn FnMut(&mut ContextCore, String) -> Result<(), ContextError>>;

/// Handler registry of one context.
pub struct MessageRouter {
    context: ContextId,
    handlers: HashMap<RouteKey, MessageHandler>,
    // Keys whose handler is currently lent out to a running delivery.
    in_flight: Vec<RouteKey>,
}

impl MessageRouter {
    pub fn new(context: ContextId) -> Self {
        Self {
            context,
            handlers: HashMap::new(),
            in_flight: Vec::new(),
        }
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Register `handler` under `key`, replacing any previous handler.
    ///
    /// Returns true if a handler was replaced.
    pub fn register(&mut self, key: RouteKey, handler: MessageHandler) -> bool {
        self.in_flight.retain(|k| k != &key);
        self.handlers.insert(key, handler).is_some()
    }

    /// Remove the handler under `key`. Returns true if one was registered.
    pub fn unregister(&mut self, key: &RouteKey) -> bool {
        let lent = self.in_flight.iter().position(|k| k == key);
        if let Some(index) = lent {
            self.in_flight.swap_remove(index);
        }
        self.handlers.remove(key).is_some() || lent.is_some()
    }

    pub fn contains(&self, key: &RouteKey) -> bool {
        self.handlers.contains_key(key) || self.in_flight.contains(key)
    }

    pub fn len(&self) -> usize {
        self.handlers.len() + self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lend out the handler for `key` for the duration of one delivery.
    ///
    /// The router stays unborrowed while the handler runs, so the handler may
    /// register or unregister routes, including its own.
    pub(crate) fn take(&mut self, key: &RouteKey) -> Option<MessageHandler> {
        let handler = self.handlers.remove(key)?;
        self.in_flight.push(key.clone());
        Some(handler)
    }

    /// Give back a handler lent by [`take`](Self::take).
    ///
    /// The handler is dropped if its key was re-registered or unregistered
    /// while it was running.
    pub(crate) fn restore(&mut self, key: RouteKey, handler: MessageHandler) {
        if let Some(index) = self.in_flight.iter().position(|k| k == &key) {
            self.in_flight.swap_remove(index);
            self.handlers.insert(key, handler);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> MessageHandler {
        Box::new(|_, _| Ok(()))
    }

    #[test]
    fn test_register_and_unregister() {
        let mut router = MessageRouter::new(ContextId::next());
        assert!(router.is_empty());

        assert!(!router.register(RouteKey::SelfKey, noop()));
        assert!(router.register(RouteKey::SelfKey, noop()));
        assert!(router.contains(&RouteKey::SelfKey));
        assert_eq!(router.len(), 1);

        assert!(router.unregister(&RouteKey::SelfKey));
        assert!(!router.unregister(&RouteKey::SelfKey));
        assert!(!router.contains(&RouteKey::SelfKey));
    }

    #[test]
    fn test_take_and_restore() {
        let mut router = MessageRouter::new(ContextId::next());
        let key = RouteKey::Named("inbox".to_string());
        router.register(key.clone(), noop());

        let handler = router.take(&key).unwrap();
        assert!(router.contains(&key));
        assert!(router.take(&key).is_none());

        router.restore(key.clone(), handler);
        assert!(router.take(&key).is_some());
    }

    #[test]
    fn test_unregister_while_lent_drops_handler() {
        let mut router = MessageRouter::new(ContextId::next());
        let key = RouteKey::Named("inbox".to_string());
        router.register(key.clone(), noop());

        let handler = router.take(&key).unwrap();
        assert!(router.unregister(&key));
        router.restore(key.clone(), handler);
        assert!(!router.contains(&key));
    }

    #[test]
    fn test_reregister_while_lent_keeps_new_handler() {
        let mut router = MessageRouter::new(ContextId::next());
        let key = RouteKey::SelfKey;
        router.register(key.clone(), noop());

        let old = router.take(&key).unwrap();
        router.register(key.clone(), noop());
        router.restore(key.clone(), old);

        assert_eq!(router.len(), 1);
        assert!(router.contains(&key));
    }

    #[test]
    fn test_missing_key() {
        let mut router = MessageRouter::new(ContextId::next());
        assert!(router.take(&RouteKey::SelfKey).is_none());
    }

    #[test]
    fn test_route_key_display() {
        assert_eq!(RouteKey::SelfKey.to_string(), "self");
        assert_eq!(RouteKey::Named("a".into()).to_string(), "named:a");
    }
}
