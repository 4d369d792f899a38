use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use socket2::SockRef;
use tokio::net::{lookup_host, TcpListener, UdpSocket};
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::service::NetworkConfig;
use crate::{AppError, AppResult};

/// Receives every accepted, configured stream.
pub type Dispatch = Arc<dyn Fn(TcpStream) + Send + Sync>;

const MAX_ACCEPT_BACKOFF_MS: u64 = 1024;

/// Options applied to every socket a listener produces. Zero sizes keep
/// the kernel defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    pub keep_alive: bool,
    pub send_buffer_size: usize,
    pub recv_buffer_size: usize,
}

impl SocketOptions {
    fn apply_buffers(&self, socket: &SockRef<'_>) -> io::Result<()> {
        if self.send_buffer_size > 0 {
            socket.set_send_buffer_size(self.send_buffer_size)?;
        }
        if self.recv_buffer_size > 0 {
            socket.set_recv_buffer_size(self.recv_buffer_size)?;
        }
        Ok(())
    }

    /// Prepares an accepted stream for the reactor: options plus
    /// non-blocking mode.
    pub fn configure_stream(&self, stream: &TcpStream) -> io::Result<()> {
        let socket = SockRef::from(stream);
        socket.set_keepalive(self.keep_alive)?;
        self.apply_buffers(&socket)?;
        stream.set_nonblocking(true)
    }

    pub fn configure_datagram(&self, socket: &UdpSocket) -> io::Result<()> {
        self.apply_buffers(&SockRef::from(socket))
    }
}

impl From<&NetworkConfig> for SocketOptions {
    fn from(config: &NetworkConfig) -> Self {
        SocketOptions {
            keep_alive: config.keep_alive,
            send_buffer_size: config.send_buffer_size,
            recv_buffer_size: config.recv_buffer_size,
        }
    }
}

/// Resolves `bind` and returns the first address it names.
pub(crate) async fn resolve(bind: &str) -> AppResult<SocketAddr> {
    lookup_host(bind)
        .await
        .map_err(|e| AppError::Resolve(format!("{}: {}", bind, e)))?
        .next()
        .ok_or_else(|| AppError::Resolve(format!("{}: no address", bind)))
}

/// A bound stream listener plus the loops that accept from it.
#[derive(Debug)]
pub struct Acceptor {
    listener: Arc<TcpListener>,
    options: SocketOptions,
    concurrency: usize,
}

impl Acceptor {
    /// Binds once. Failure here is fatal to the caller.
    pub async fn bind(bind: &str, options: SocketOptions, concurrency: usize) -> AppResult<Self> {
        let addr = resolve(bind).await?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| AppError::Bind { addr, source })?;
        info!("listening for streams on {}", listener.local_addr()?);

        Ok(Acceptor {
            listener: Arc::new(listener),
            options,
            concurrency: concurrency.max(1),
        })
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Spawns the accept loops; they run until `notify_shutdown` fires.
    pub fn start(self, dispatch: Dispatch, notify_shutdown: &broadcast::Sender<()>) {
        for worker in 0..self.concurrency {
            let listener = Arc::clone(&self.listener);
            let dispatch = Arc::clone(&dispatch);
            let shutdown = notify_shutdown.subscribe();
            tokio::spawn(accept_loop(worker, listener, self.options, dispatch, shutdown));
        }
    }
}

async fn accept_loop(
    worker: usize,
    listener: Arc<TcpListener>,
    options: SocketOptions,
    dispatch: Dispatch,
    mut shutdown: broadcast::Receiver<()>,
) {
    debug!("accept loop {} started", worker);
    loop {
        // a sent signal and a dropped sender both stop the loop
        let stream = tokio::select! {
            stream = accept(&listener) => stream,
            _ = shutdown.recv() => break,
        };

        let stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(e) => {
                warn!("detaching accepted stream failed: {}", e);
                continue;
            }
        };
        if let Err(e) = options.configure_stream(&stream) {
            warn!("configuring stream from {:?} failed: {}", stream.peer_addr(), e);
            continue;
        }
        dispatch(stream);
    }
    debug!("accept loop {} stopped", worker);
}

/// Accepts one stream, retrying failures with a capped backoff.
async fn accept(listener: &TcpListener) -> tokio::net::TcpStream {
    let mut backoff = 1;
    loop {
        match listener.accept().await {
            Ok((stream, _)) => return stream,
            Err(e) => {
                error!("accept failed, retrying in {}ms: {}", backoff, e);
                time::sleep(Duration::from_millis(backoff)).await;
                backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF_MS);
            }
        }
    }
}
