//! Routing of decoded messages.
//!
//! Replies and error replies land in the pending-result table; calls are
//! handed to the callback registered for their method.

use crate::client::BridgeClient;
use crate::pending::{PendingResults, ReplyOutcome};
use crate::protocol::{Call, Message, Params, RemoteError, RequestId};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;
use thiserror::Error;

/// Failure raised by a local callback; sent to the peer as an error reply
/// when the call asked for a return value.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CallbackError {
    pub message: String,
}

impl CallbackError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub type CallbackResult = Result<Option<Value>, CallbackError>;

/// Handler for an inbound method.
///
/// It receives the client so it can issue calls of its own while the peer
/// waits.
pub type Callback = Rc<dyn Fn(&BridgeClient, &Params) -> CallbackResult>;

#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: HashMap<String, Callback>,
}

impl CallbackRegistry {
    pub fn register(&mut self, method: impl Into<String>, callback: Callback) -> Option<Callback> {
        self.callbacks.insert(method.into(), callback)
    }

    pub fn unregister(&mut self, method: &str) -> Option<Callback> {
        self.callbacks.remove(method)
    }

    pub fn get(&self, method: &str) -> Option<Callback> {
        self.callbacks.get(method).cloned()
    }

    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.callbacks.keys().cloned().collect();
        methods.sort();
        methods
    }
}

pub struct Dispatcher {
    callbacks: RefCell<CallbackRegistry>,
    pending: RefCell<PendingResults>,
}

impl Dispatcher {
    pub fn new(result_ttl: Duration) -> Self {
        Self {
            callbacks: RefCell::new(CallbackRegistry::default()),
            pending: RefCell::new(PendingResults::new(result_ttl)),
        }
    }

    pub fn register(&self, method: impl Into<String>, callback: Callback) {
        let method = method.into();
        if self
            .callbacks
            .borrow_mut()
            .register(method.clone(), callback)
            .is_some()
        {
            tracing::debug!(%method, "replaced callback");
        }
    }

    pub fn unregister(&self, method: &str) -> bool {
        self.callbacks.borrow_mut().unregister(method).is_some()
    }

    pub fn methods(&self) -> Vec<String> {
        self.callbacks.borrow().methods()
    }

    pub fn take_result(&self, id: &RequestId) -> Option<ReplyOutcome> {
        self.pending.borrow_mut().take(id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Route one message. Returns the reply to send back, if any.
    ///
    /// No borrow is held while a callback runs, so callbacks may re-enter
    /// the client (and therefore this dispatcher).
    pub fn dispatch(&self, client: &BridgeClient, message: Message) -> Option<Message> {
        match message {
            Message::Reply(reply) => {
                tracing::debug!(id = %reply.id, "received reply");
                self.pending.borrow_mut().insert(reply.id, Ok(reply.result));
                None
            }
            Message::Error(error) => {
                let remote = RemoteError(error.error);
                tracing::error!(
                    id = %error.id,
                    error = %remote,
                    "error occurred when requesting command"
                );
                self.pending.borrow_mut().insert(error.id, Err(remote));
                None
            }
            Message::Call(call) => self.invoke(client, call),
        }
    }

    fn invoke(&self, client: &BridgeClient, call: Call) -> Option<Message> {
        let callback = self.callbacks.borrow().get(&call.method);
        let Some(callback) = callback else {
            tracing::warn!(method = %call.method, "command not recognized, skipping");
            return None;
        };

        tracing::debug!(method = %call.method, id = %call.id, "invoking callback");
        match callback(client, &call.params) {
            Ok(Some(value)) if call.request_return && is_truthy(&value) => {
                Some(Message::reply(call.id, value))
            }
            Ok(_) => {
                if call.request_return {
                    tracing::debug!(
                        method = %call.method,
                        id = %call.id,
                        "callback returned no value, no reply sent"
                    );
                }
                None
            }
            Err(e) => {
                tracing::error!(method = %call.method, error = %e, "callback failed");
                call.request_return.then(|| Message::error(call.id, e.message))
            }
        }
    }
}

/// Whether a callback result is worth replying with: `null`, `false`, zero
/// and empty strings or collections are not.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
