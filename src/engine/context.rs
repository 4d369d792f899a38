use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use super::Handler;
use crate::network::Connection;

/// Cursor value after [`Context::abort`]; larger than any chain can be.
const ABORTED: usize = usize::MAX / 2;

/// Per-message state handed to every handler of the chain.
///
/// Contexts are pooled by the [`Engine`](super::Engine); a released context
/// loses its connection, its body and every stored value.
pub struct Context {
    conn: Option<Arc<Connection>>,
    body: Bytes,
    index: usize,
    shard: usize,
    handlers: Arc<[Handler]>,
    values: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Context {
    pub(crate) fn new(handlers: Arc<[Handler]>) -> Self {
        Context {
            conn: None,
            body: Bytes::new(),
            index: 0,
            shard: 0,
            handlers,
            values: HashMap::new(),
        }
    }

    pub(crate) fn prepare(
        &mut self,
        handlers: Arc<[Handler]>,
        conn: Arc<Connection>,
        body: Bytes,
        shard: usize,
    ) {
        self.handlers = handlers;
        self.conn = Some(conn);
        self.body = body;
        self.shard = shard;
        self.index = 0;
    }

    pub(crate) fn reset(&mut self) {
        self.conn = None;
        self.body = Bytes::new();
        self.index = 0;
        self.values.clear();
    }

    pub(crate) fn shard(&self) -> usize {
        self.shard
    }

    /// Runs the chain from its first handler.
    pub fn run(&mut self) {
        self.index = 0;
        self.drive();
    }

    /// Runs the handlers after the current one, then returns to the caller.
    pub fn next(&mut self) {
        self.index += 1;
        self.drive();
    }

    fn drive(&mut self) {
        while self.index < self.handlers.len() {
            let handler = Arc::clone(&self.handlers[self.index]);
            handler(self);
            self.index += 1;
        }
    }

    /// Stops the chain; no handler after the current one runs.
    pub fn abort(&mut self) {
        self.index = ABORTED;
    }

    pub fn is_aborted(&self) -> bool {
        self.index >= ABORTED
    }

    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.conn.as_ref()
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Queues a response on the connection. `false` when it was dropped.
    pub fn output(&self, msg: impl Into<Bytes>) -> bool {
        match &self.conn {
            Some(conn) => conn.push(msg),
            None => false,
        }
    }

    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Box::new(value));
    }

    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        let value = self.values.get(key)?;
        value
            .downcast_ref::<String>()
            .map(String::as_str)
            .or_else(|| value.downcast_ref::<&'static str>().copied())
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        let value = self.values.get(key)?;
        if let Some(v) = value.downcast_ref::<i64>() {
            return Some(*v);
        }
        if let Some(v) = value.downcast_ref::<i32>() {
            return Some(i64::from(*v));
        }
        if let Some(v) = value.downcast_ref::<u32>() {
            return Some(i64::from(*v));
        }
        if let Some(v) = value.downcast_ref::<usize>() {
            return i64::try_from(*v).ok();
        }
        value.downcast_ref::<u64>().and_then(|v| i64::try_from(*v).ok())
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("conn", &self.conn.as_ref().map(|c| c.id()))
            .field("body_len", &self.body.len())
            .field("index", &self.index)
            .field("shard", &self.shard)
            .field("handlers", &self.handlers.len())
            .field("values", &self.values.len())
            .finish()
    }
}
