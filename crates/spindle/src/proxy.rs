//! Thin call facade over a [`Client`].
//!
//! A proxy pins the handler name so call sites read
//! `proxy.call("method", args)` instead of spelling out
//! `"handler.method"` everywhere. There is no dynamic forwarding: the one
//! explicit `call` escape hatch is the surface, and applications build
//! typed wrappers on top of it. Response translators post-process
//! successful results only — errors pass through untouched.

use std::sync::Arc;

use spindle_core::{RpcError, Value};

use crate::client::Client;

type Translator = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// A handler-scoped view of a client.
#[derive(Clone)]
pub struct Proxy {
    client: Arc<Client>,
    handler: String,
    translators: Vec<Translator>,
}

impl Proxy {
    pub fn new(client: Arc<Client>, handler: impl Into<String>) -> Self {
        Self {
            client,
            handler: handler.into(),
            translators: Vec::new(),
        }
    }

    /// Add a translator applied (in registration order) to every successful
    /// result before it reaches the caller.
    pub fn with_translator<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.translators.push(Arc::new(f));
        self
    }

    pub fn handler(&self) -> &str {
        &self.handler
    }

    fn translate(translators: &[Translator], value: Value) -> Value {
        translators
            .iter()
            .fold(value, |value, translator| translator(value))
    }

    /// Synchronous call to `"<handler>.<method>"`.
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.client
            .call(&format!("{}.{method}", self.handler), args)
            .map(|value| Self::translate(&self.translators, value))
    }

    /// Asynchronous call to `"<handler>.<method>"`.
    pub fn call_with<F>(&self, method: &str, args: Vec<Value>, callback: F)
    where
        F: FnOnce(Result<Value, RpcError>) + Send + 'static,
    {
        let translators = self.translators.clone();
        self.client
            .call_with(&format!("{}.{method}", self.handler), args, move |result| {
                callback(result.map(|value| Self::translate(&translators, value)))
            });
    }
}
