//! Request pipeline.
//!
//! An [`Engine`] owns the ordered handler chain and the pools of reusable
//! [`Context`]s. Contexts are pooled per shard; a connection always draws
//! from the shard picked by its [`Connection::shard_key`], so two
//! connections only contend on a pool lock when they share a shard.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

pub use callback::{Callbacks, ConnHook, Handler};
pub use context::Context;

use crate::network::Connection;
use crate::service::EngineConfig;
use crate::{AppError, AppResult};

mod callback;
mod context;

pub struct Engine {
    handlers: Arc<[Handler]>,
    shards: Vec<Mutex<Vec<Context>>>,
    mask: usize,
    pool_capacity: usize,
}

impl Engine {
    pub fn new(config: &EngineConfig) -> AppResult<Engine> {
        let shards = config.context_pool_shards;
        if shards == 0 || !shards.is_power_of_two() {
            return Err(AppError::InvalidValue(format!(
                "context pool shards must be a power of two, got {}",
                shards
            )));
        }
        Ok(Engine {
            handlers: Arc::from(Vec::new()),
            shards: (0..shards).map(|_| Mutex::new(Vec::new())).collect(),
            mask: shards - 1,
            pool_capacity: config.context_pool_capacity,
        })
    }

    /// Appends `handler` to the chain. Only possible before the engine is
    /// shared.
    pub fn use_handler(&mut self, handler: Handler) {
        let mut handlers = self.handlers.to_vec();
        handlers.push(handler);
        self.handlers = handlers.into();
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_of(&self, conn: &Connection) -> usize {
        conn.shard_key() & self.mask
    }

    /// Takes a context from the connection's shard, or builds one when the
    /// shard has none idle.
    pub fn acquire(&self, conn: Arc<Connection>, body: Bytes) -> Context {
        let shard = self.shard_of(&conn);
        let pooled = self.shards[shard].lock().pop();
        let mut ctx = pooled.unwrap_or_else(|| {
            trace!("context pool {} empty, allocating", shard);
            Context::new(self.handlers.clone())
        });
        ctx.prepare(self.handlers.clone(), conn, body, shard);
        ctx
    }

    /// Clears `ctx` and returns it to its shard. Dropped when the shard is
    /// already holding its full share of idle contexts.
    pub fn release(&self, mut ctx: Context) {
        ctx.reset();
        let mut idle = self.shards[ctx.shard()].lock();
        if idle.len() < self.pool_capacity {
            idle.push(ctx);
        }
    }

    #[cfg(test)]
    fn idle(&self, shard: usize) -> usize {
        self.shards[shard].lock().len()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("handlers", &self.handlers.len())
            .field("shards", &self.shards.len())
            .field("pool_capacity", &self.pool_capacity)
            .finish()
    }
}
