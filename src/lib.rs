//! shardlink: a sharded reactor network server core.
//!
//! One poll thread watches every stream socket through epoll and hands
//! ready descriptors to a fixed set of sub reactors. Each sub reactor reads
//! and frames its connections' bytes, and runs the request chain of the
//! [`Engine`](engine::Engine) for every message on a bounded
//! [`WorkerPool`](utils::WorkerPool). Datagram listeners feed the same
//! engine from their own receive loop.
//!
//! ```no_run
//! use shardlink::{MainReactor, ServerConfig};
//!
//! # async fn serve() -> shardlink::AppResult<()> {
//! let reactor = MainReactor::builder(ServerConfig::default())
//!     .on_request(|ctx| {
//!         let body = ctx.body().clone();
//!         ctx.output(body);
//!     })
//!     .build()?;
//! reactor.start().await?;
//! # Ok(())
//! # }
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("shardlink drives its sockets through epoll and only builds on linux");

pub mod engine;
pub mod network;
pub mod reactor;
pub mod service;
pub mod utils;

pub use engine::{Context, Engine};
pub use network::Connection;
pub use reactor::MainReactor;
pub use service::{setup_local_tracing, AppError, AppResult, ServerConfig};
