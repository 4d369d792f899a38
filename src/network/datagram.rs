use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, info, trace, warn};

use super::acceptor::{resolve, SocketOptions};
use super::{Connection, ConnectionOwner};
use crate::engine::{Callbacks, Engine};
use crate::service::DatagramConfig;
use crate::utils::WorkerPool;
use crate::{AppError, AppResult};

/// Peers seen on one datagram socket, keyed by their address.
struct PeerTable {
    peers: DashMap<SocketAddr, Arc<Connection>>,
    callbacks: Callbacks,
}

impl PeerTable {
    /// Returns the connection for `peer`, opening one on first contact.
    fn get_or_open(
        self: &Arc<Self>,
        socket: &Arc<UdpSocket>,
        peer: SocketAddr,
        queue_capacity: usize,
    ) -> Arc<Connection> {
        if let Some(conn) = self.peers.get(&peer) {
            return Arc::clone(conn.value());
        }

        let mut opened = false;
        let conn = self
            .peers
            .entry(peer)
            .or_insert_with(|| {
                opened = true;
                Connection::datagram(Arc::clone(socket), peer, queue_capacity)
            })
            .clone();
        if opened {
            let owner = Arc::downgrade(self) as Weak<dyn ConnectionOwner>;
            conn.attach(owner);
            debug!("new datagram peer {} as {}", peer, conn.id());
            self.callbacks.connected(&conn);
            conn.spawn_writer();
        }
        conn
    }

    fn evict_idle(&self, idle_timeout: Duration) {
        let idle: Vec<_> = self
            .peers
            .iter()
            .filter(|entry| entry.value().idle_for() >= idle_timeout)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for conn in idle {
            debug!("datagram peer {} idle, closing", conn.peer_addr());
            conn.close();
        }
    }

    fn close_all(&self) {
        let peers: Vec<_> = self.peers.iter().map(|e| Arc::clone(e.value())).collect();
        for conn in peers {
            conn.close();
        }
    }
}

impl ConnectionOwner for PeerTable {
    fn release(&self, conn: &Connection) {
        self.callbacks.disconnected(conn);
        self.peers
            .remove_if(&conn.peer_addr(), |_, current| current.id() == conn.id());
    }
}

/// A bound datagram socket and its receive loop. Each datagram is one
/// message from the peer that sent it.
pub struct DatagramAcceptor {
    socket: Arc<UdpSocket>,
    table: Arc<PeerTable>,
    config: DatagramConfig,
    queue_capacity: usize,
}

impl DatagramAcceptor {
    /// Binds once. Failure here is fatal to the caller.
    pub async fn bind(
        bind: &str,
        options: SocketOptions,
        config: DatagramConfig,
        queue_capacity: usize,
        callbacks: Callbacks,
    ) -> AppResult<Self> {
        let addr = resolve(bind).await?;
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| AppError::Bind { addr, source })?;
        options.configure_datagram(&socket)?;
        info!("listening for datagrams on {}", socket.local_addr()?);

        Ok(DatagramAcceptor {
            socket: Arc::new(socket),
            table: Arc::new(PeerTable {
                peers: DashMap::new(),
                callbacks,
            }),
            config,
            queue_capacity,
        })
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn peer_count(&self) -> usize {
        self.table.peers.len()
    }

    /// Spawns the receive loop; it runs until `notify_shutdown` fires and
    /// closes every peer on the way out.
    pub fn start(
        self,
        engine: Arc<Engine>,
        pool: WorkerPool,
        notify_shutdown: &broadcast::Sender<()>,
    ) {
        let shutdown = notify_shutdown.subscribe();
        tokio::spawn(self.receive_loop(engine, pool, shutdown));
    }

    async fn receive_loop(
        self,
        engine: Arc<Engine>,
        pool: WorkerPool,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut buf = vec![0u8; self.config.max_datagram_size.max(1)];
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_secs);
        let evicting = !idle_timeout.is_zero();
        let mut sweep = time::interval(idle_timeout.max(Duration::from_secs(1)));

        loop {
            let received = tokio::select! {
                received = self.socket.recv_from(&mut buf) => received,
                _ = sweep.tick(), if evicting => {
                    self.table.evict_idle(idle_timeout);
                    continue;
                }
                _ = shutdown.recv() => break,
            };
            let (n, peer) = match received {
                Ok(received) => received,
                Err(e) => {
                    // ICMP errors from earlier sends surface here
                    trace!("datagram receive failed: {}", e);
                    continue;
                }
            };

            let conn = self.table.get_or_open(&self.socket, peer, self.queue_capacity);
            conn.touch();
            let ctx = engine.acquire(conn, Bytes::copy_from_slice(&buf[..n]));
            let engine = Arc::clone(&engine);
            let submitted = pool
                .submit(async move {
                    let mut ctx = ctx;
                    ctx.run();
                    engine.release(ctx);
                })
                .await;
            if let Err(e) = submitted {
                warn!("datagram receive loop stopping: {}", e);
                break;
            }
        }
        self.table.close_all();
        debug!("datagram receive loop stopped");
    }
}

impl std::fmt::Debug for DatagramAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramAcceptor")
            .field("socket", &self.socket)
            .field("peers", &self.table.peers.len())
            .field("config", &self.config)
            .finish()
    }
}
