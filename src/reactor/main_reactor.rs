use std::net::{SocketAddr, TcpStream};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::SubReactor;
use crate::engine::{Callbacks, Context, Engine, Handler};
use crate::network::{
    Acceptor, Connection, DatagramAcceptor, Dispatch, Epoll, Poller, SocketOptions,
};
use crate::service::{Protocol, ServerConfig};
use crate::utils::WorkerPool;
use crate::{AppError, AppResult};

/// Collects the request chain and lifecycle callbacks before the reactor
/// is built. Nothing can be added once [`ReactorBuilder::build`] ran.
pub struct ReactorBuilder {
    config: ServerConfig,
    handlers: Vec<Handler>,
    on_request: Option<Handler>,
    callbacks: Callbacks,
}

impl ReactorBuilder {
    /// Appends a middleware handler.
    pub fn use_handler(mut self, handler: impl Fn(&mut Context) + Send + Sync + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Sets the final handler, run after every middleware.
    pub fn on_request(mut self, handler: impl Fn(&mut Context) + Send + Sync + 'static) -> Self {
        self.on_request = Some(Arc::new(handler));
        self
    }

    pub fn on_connect(mut self, hook: impl Fn(&Connection) + Send + Sync + 'static) -> Self {
        self.callbacks.on_connect(hook);
        self
    }

    pub fn on_disconnect(mut self, hook: impl Fn(&Connection) + Send + Sync + 'static) -> Self {
        self.callbacks.on_disconnect(hook);
        self
    }

    pub fn build(self) -> AppResult<Arc<MainReactor>> {
        MainReactor::new(self)
    }
}

/// Owns the poller, the shards and the listeners, and runs the poll loop.
pub struct MainReactor {
    config: ServerConfig,
    poller: Arc<dyn Poller>,
    sub_reactors: Vec<Arc<SubReactor>>,
    engine: Arc<Engine>,
    pool: WorkerPool,
    callbacks: Callbacks,
    notify_shutdown: broadcast::Sender<()>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl MainReactor {
    pub fn builder(config: ServerConfig) -> ReactorBuilder {
        ReactorBuilder {
            config,
            handlers: Vec::new(),
            on_request: None,
            callbacks: Callbacks::default(),
        }
    }

    fn new(builder: ReactorBuilder) -> AppResult<Arc<MainReactor>> {
        let ReactorBuilder {
            config,
            handlers,
            on_request,
            callbacks,
        } = builder;
        config.validate()?;

        let mut engine = Engine::new(&config.engine)?;
        for handler in handlers.into_iter().chain(on_request) {
            engine.use_handler(handler);
        }

        let poller: Arc<dyn Poller> = Arc::new(
            Epoll::new(config.poll_timeout(), config.reactor.max_events)
                .map_err(AppError::Poller)?,
        );
        let sub_reactors = (0..config.reactor.sub_reactors)
            .map(|id| {
                Arc::new(SubReactor::new(
                    id,
                    Arc::clone(&poller),
                    config.reactor.notify_channel_capacity,
                    config.reactor.notify_policy,
                    config.framing(),
                    callbacks.clone(),
                ))
            })
            .collect();
        let pool = WorkerPool::new(config.worker_pool.size)?;
        let (notify_shutdown, _) = broadcast::channel(1);

        Ok(Arc::new(MainReactor {
            config,
            poller,
            sub_reactors,
            engine: Arc::new(engine),
            pool,
            callbacks,
            notify_shutdown,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Live stream connections across every shard.
    pub fn connection_count(&self) -> usize {
        self.sub_reactors.iter().map(|sub| sub.len()).sum()
    }

    fn sub_reactor_of(&self, fd: RawFd) -> &Arc<SubReactor> {
        &self.sub_reactors[fd as usize % self.sub_reactors.len()]
    }

    /// Binds every listener, then starts the shard loops, the accept and
    /// receive loops and the poll thread.
    ///
    /// Returns the bound addresses in listener order. Any bind failure is
    /// returned before anything was started.
    pub async fn start(self: &Arc<Self>) -> AppResult<Vec<SocketAddr>> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(AppError::IllegalStateError(
                "reactor already started".into(),
            ));
        }

        let options = SocketOptions::from(&self.config.network);
        let mut streams = Vec::new();
        let mut datagrams = Vec::new();
        let mut addrs = Vec::with_capacity(self.config.network.listeners.len());
        for listener in &self.config.network.listeners {
            match listener.protocol {
                Protocol::Tcp => {
                    let acceptor = Acceptor::bind(
                        &listener.bind,
                        options,
                        self.config.accept_concurrency(),
                    )
                    .await?;
                    addrs.push(acceptor.local_addr()?);
                    streams.push(acceptor);
                }
                Protocol::Udp => {
                    let acceptor = DatagramAcceptor::bind(
                        &listener.bind,
                        options,
                        self.config.datagram.clone(),
                        self.config.connection.outbound_queue_capacity,
                        self.callbacks.clone(),
                    )
                    .await?;
                    addrs.push(acceptor.local_addr()?);
                    datagrams.push(acceptor);
                }
            }
        }

        for sub in &self.sub_reactors {
            tokio::spawn(Arc::clone(sub).polling(Arc::clone(&self.engine), self.pool.clone()));
        }

        let reactor = Arc::clone(self);
        thread::Builder::new()
            .name("main-reactor".into())
            .spawn(move || reactor.poll_loop())?;

        let reactor = Arc::clone(self);
        let dispatch: Dispatch = Arc::new(move |stream: TcpStream| reactor.dispatch(stream));
        for acceptor in streams {
            acceptor.start(Arc::clone(&dispatch), &self.notify_shutdown);
        }
        for acceptor in datagrams {
            acceptor.start(Arc::clone(&self.engine), self.pool.clone(), &self.notify_shutdown);
        }

        info!(
            "reactor started: {} sub reactors, worker pool {}, listeners {:?}",
            self.sub_reactors.len(),
            self.pool.capacity(),
            addrs
        );
        Ok(addrs)
    }

    /// Turns an accepted stream into a tracked connection.
    pub fn dispatch(&self, stream: TcpStream) {
        let conn = match Connection::stream(
            stream,
            self.config.connection.outbound_queue_capacity,
            self.config.connection.read_buffer_size,
        ) {
            Ok(conn) => conn,
            Err(e) => {
                warn!("dropping accepted stream: {}", e);
                return;
            }
        };

        let sub = self.sub_reactor_of(conn.fd());
        match sub.register(&conn) {
            Ok(()) => conn.spawn_writer(),
            Err(e) => {
                warn!("registering {} failed: {}", conn.peer_addr(), e);
                conn.close();
            }
        }
    }

    fn poll_loop(&self) {
        info!("poll loop running");
        while !self.stopped.load(Ordering::Acquire) {
            let readiness = match self.poller.wait() {
                Ok(readiness) => readiness,
                Err(e) => {
                    error!("poller wait failed, poll loop exits: {}", e);
                    break;
                }
            };
            // turned away last cycle; reported again by the next wait
            for sub in &self.sub_reactors {
                sub.rearm_deferred();
            }
            for fd in readiness.closed {
                if let Some(conn) = self.sub_reactor_of(fd).connection(fd) {
                    conn.close();
                }
            }
            for fd in readiness.readable {
                self.sub_reactor_of(fd).offer(fd);
            }
        }
        debug!("poll loop stopped");
    }

    /// Stops accepting, closes every connection and ends all loops.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("reactor shutting down");
        let _ = self.notify_shutdown.send(());
        for sub in &self.sub_reactors {
            sub.stop();
        }
        self.pool.close();
    }
}

impl std::fmt::Debug for MainReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainReactor")
            .field("sub_reactors", &self.sub_reactors.len())
            .field("engine", &self.engine)
            .field("pool", &self.pool)
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ListenerConfig;

    fn config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.network.listeners = vec![ListenerConfig::tcp("127.0.0.1:0")];
        config.reactor.sub_reactors = 2;
        config.worker_pool.size = 4;
        config
    }

    #[test]
    fn build_rejects_invalid_config() {
        let mut config = config();
        config.engine.context_pool_shards = 6;
        assert!(MainReactor::builder(config).build().is_err());
    }

    #[test]
    fn on_request_runs_after_middleware() {
        let reactor = MainReactor::builder(config())
            .on_request(|ctx| ctx.set("last", "request"))
            .use_handler(|ctx| ctx.set("last", "middleware"))
            .build()
            .unwrap();
        assert_eq!(reactor.engine().handler_count(), 2);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let conn = Connection::stream(server, 4, 64).unwrap();

        let mut ctx = reactor
            .engine()
            .acquire(conn, bytes::Bytes::from_static(b"x"));
        ctx.run();
        assert_eq!(ctx.get_string("last"), Some("request"));
        reactor.engine().release(ctx);
    }

    #[tokio::test]
    async fn start_twice_is_refused() {
        let reactor = MainReactor::builder(config()).build().unwrap();
        let addrs = reactor.start().await.unwrap();
        assert_eq!(addrs.len(), 1);
        assert!(matches!(
            reactor.start().await,
            Err(AppError::IllegalStateError(_))
        ));
        reactor.shutdown();
    }

    #[tokio::test]
    async fn bind_failure_is_fatal() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = config();
        config.network.listeners = vec![ListenerConfig::tcp(
            taken.local_addr().unwrap().to_string(),
        )];
        let reactor = MainReactor::builder(config).build().unwrap();
        assert!(matches!(reactor.start().await, Err(AppError::Bind { .. })));
    }
}
