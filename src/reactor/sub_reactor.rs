use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Arc;

use async_channel::TrySendError;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::engine::{Callbacks, Engine};
use crate::network::{Connection, ConnectionOwner, Framing, Poller};
use crate::service::NotifyPolicy;
use crate::utils::WorkerPool;
use crate::{AppError, AppResult};

/// One shard of the live stream connections.
///
/// The poll loop hands it ready descriptors through [`SubReactor::offer`];
/// its own task reads them, frames the bytes and feeds the worker pool.
pub struct SubReactor {
    id: usize,
    poller: Arc<dyn Poller>,
    conns: RwLock<HashMap<RawFd, Arc<Connection>>>,
    ready_tx: async_channel::Sender<RawFd>,
    ready_rx: async_channel::Receiver<RawFd>,
    deferred: Mutex<Vec<RawFd>>,
    policy: NotifyPolicy,
    framing: Framing,
    callbacks: Callbacks,
}

impl SubReactor {
    pub fn new(
        id: usize,
        poller: Arc<dyn Poller>,
        channel_capacity: usize,
        policy: NotifyPolicy,
        framing: Framing,
        callbacks: Callbacks,
    ) -> Self {
        let (ready_tx, ready_rx) = async_channel::bounded(channel_capacity);
        SubReactor {
            id,
            poller,
            conns: RwLock::new(HashMap::new()),
            ready_tx,
            ready_rx,
            deferred: Mutex::new(Vec::new()),
            policy,
            framing,
            callbacks,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn len(&self) -> usize {
        self.conns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.read().is_empty()
    }

    pub fn connection(&self, fd: RawFd) -> Option<Arc<Connection>> {
        self.conns.read().get(&fd).cloned()
    }

    /// Starts watching `conn`. On error nothing is tracked and the caller
    /// still owns the connection.
    ///
    /// The connect callback runs under the shard write lock, so the shard
    /// loop cannot look the connection up before it returned. It must not
    /// query this shard.
    pub fn register(self: &Arc<Self>, conn: &Arc<Connection>) -> AppResult<()> {
        let mut conns = self.conns.write();
        self.poller.add(conn.fd()).map_err(AppError::Poller)?;
        conns.insert(conn.fd(), Arc::clone(conn));
        let owner = Arc::downgrade(self) as std::sync::Weak<dyn ConnectionOwner>;
        conn.attach(owner);
        debug!(
            "sub reactor {} registered {} (fd {}) from {}",
            self.id,
            conn.id(),
            conn.fd(),
            conn.peer_addr()
        );
        self.callbacks.connected(conn);
        Ok(())
    }

    /// Hands a ready descriptor to this shard's loop.
    pub fn offer(&self, fd: RawFd) {
        match self.policy {
            NotifyPolicy::Drop => match self.ready_tx.try_send(fd) {
                Ok(()) => {}
                Err(TrySendError::Full(fd)) => {
                    trace!("sub reactor {} is saturated, fd {} deferred", self.id, fd);
                    self.deferred.lock().push(fd);
                }
                Err(TrySendError::Closed(_)) => {}
            },
            NotifyPolicy::Block => {
                if self.ready_tx.send_blocking(fd).is_err() {
                    trace!("sub reactor {} is stopped, fd {} dropped", self.id, fd);
                }
            }
        }
    }

    /// Rearms the descriptors a full channel turned away, so the poll cycle
    /// after this one reports them again.
    ///
    /// Called once per poll cycle, before that cycle's offers.
    pub fn rearm_deferred(&self) {
        let deferred = std::mem::take(&mut *self.deferred.lock());
        for fd in deferred {
            if let Err(e) = self.poller.rearm(fd) {
                trace!("rearm of deferred fd {} failed: {}", fd, e);
            }
        }
    }

    /// Shard loop. Ends when [`SubReactor::stop`] closes the channel or the
    /// worker pool is closed.
    pub async fn polling(self: Arc<Self>, engine: Arc<Engine>, pool: WorkerPool) {
        debug!("sub reactor {} polling", self.id);
        while let Ok(fd) = self.ready_rx.recv().await {
            let Some(conn) = self.connection(fd) else {
                trace!("fd {} is no longer tracked", fd);
                continue;
            };

            let frames = match conn.read_frames(&self.framing) {
                Ok((frames, false)) => frames,
                Ok((frames, true)) => {
                    debug!("peer {} closed {}", conn.peer_addr(), conn.id());
                    if frames.is_empty() {
                        conn.close();
                    } else if let Err(e) = self.finish(&conn, frames, &engine, &pool).await {
                        debug!("sub reactor {} stopping: {}", self.id, e);
                        conn.close();
                        return;
                    }
                    continue;
                }
                Err(e) => {
                    warn!("read from {} failed: {}", conn.id(), e);
                    conn.close();
                    continue;
                }
            };
            if let Err(e) = self.poller.rearm(fd) {
                debug!("rearm of {} failed: {}", conn.id(), e);
                conn.close();
                continue;
            }

            for body in frames {
                let ctx = engine.acquire(Arc::clone(&conn), body);
                let engine = Arc::clone(&engine);
                let submitted = pool
                    .submit(async move {
                        let mut ctx = ctx;
                        ctx.run();
                        engine.release(ctx);
                    })
                    .await;
                if let Err(e) = submitted {
                    debug!("sub reactor {} stopping: {}", self.id, e);
                    return;
                }
            }
        }
        debug!("sub reactor {} stopped", self.id);
    }

    /// Runs the frames left at end of stream in order, then closes `conn`
    /// once their replies are written.
    async fn finish(
        &self,
        conn: &Arc<Connection>,
        frames: Vec<Bytes>,
        engine: &Arc<Engine>,
        pool: &WorkerPool,
    ) -> AppResult<()> {
        let contexts: Vec<_> = frames
            .into_iter()
            .map(|body| engine.acquire(Arc::clone(conn), body))
            .collect();
        let engine = Arc::clone(engine);
        let conn = Arc::clone(conn);
        pool.submit(async move {
            for mut ctx in contexts {
                ctx.run();
                engine.release(ctx);
            }
            conn.close_after_drain();
        })
        .await
    }

    /// Closes every tracked connection and ends the shard loop.
    pub fn stop(&self) {
        self.ready_tx.close();
        let conns: Vec<_> = self.conns.read().values().cloned().collect();
        for conn in conns {
            conn.close();
        }
    }
}

impl ConnectionOwner for SubReactor {
    fn release(&self, conn: &Connection) {
        self.callbacks.disconnected(conn);

        let mut conns = self.conns.write();
        if let Err(e) = self.poller.remove(conn.fd()) {
            warn!("deregister of fd {} failed: {}", conn.fd(), e);
        }
        if conns.get(&conn.fd()).is_some_and(|c| c.id() == conn.id()) {
            conns.remove(&conn.fd());
        }
        debug!("sub reactor {} released {}", self.id, conn.id());
    }
}

impl std::fmt::Debug for SubReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubReactor")
            .field("id", &self.id)
            .field("connections", &self.len())
            .field("pending", &self.ready_rx.len())
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Readiness;
    use crate::service::EngineConfig;
    use parking_lot::Mutex;
    use std::io::{self, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Records calls instead of talking to the kernel.
    #[derive(Default)]
    struct RecordingPoller {
        added: Mutex<Vec<RawFd>>,
        removed: Mutex<Vec<RawFd>>,
        rearmed: Mutex<Vec<RawFd>>,
        fail_add: bool,
        fail_remove: bool,
    }

    impl Poller for RecordingPoller {
        fn add(&self, fd: RawFd) -> io::Result<()> {
            if self.fail_add {
                return Err(io::Error::from_raw_os_error(libc::ENOMEM));
            }
            self.added.lock().push(fd);
            Ok(())
        }

        fn remove(&self, fd: RawFd) -> io::Result<()> {
            if self.fail_remove {
                return Err(io::Error::from_raw_os_error(libc::ENOENT));
            }
            self.removed.lock().push(fd);
            Ok(())
        }

        fn rearm(&self, fd: RawFd) -> io::Result<()> {
            self.rearmed.lock().push(fd);
            Ok(())
        }

        fn wait(&self) -> io::Result<Readiness> {
            Ok(Readiness::default())
        }
    }

    fn accepted() -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (Connection::stream(server, 8, 64).unwrap(), client)
    }

    fn shard(poller: Arc<RecordingPoller>, capacity: usize, callbacks: Callbacks) -> Arc<SubReactor> {
        shard_with(poller, capacity, NotifyPolicy::Drop, callbacks)
    }

    fn shard_with(
        poller: Arc<RecordingPoller>,
        capacity: usize,
        policy: NotifyPolicy,
        callbacks: Callbacks,
    ) -> Arc<SubReactor> {
        Arc::new(SubReactor::new(
            0,
            poller,
            capacity,
            policy,
            Framing::new(0, 0),
            callbacks,
        ))
    }

    /// Offers `fd` the way the poll thread would: once, then again only
    /// after the shard rearmed it, until `done` holds.
    async fn drive(sub: &SubReactor, poller: &RecordingPoller, fd: RawFd, done: impl Fn() -> bool) {
        for _ in 0..100 {
            let rearms = poller.rearmed.lock().len();
            sub.offer(fd);
            for _ in 0..200 {
                if done() {
                    return;
                }
                if poller.rearmed.lock().len() > rearms {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    fn echo_engine(seen: Arc<Mutex<Vec<Bytes>>>) -> Arc<Engine> {
        let mut engine = Engine::new(&EngineConfig::default()).unwrap();
        engine.use_handler(Arc::new(move |ctx: &mut crate::engine::Context| {
            seen.lock().push(ctx.body().clone());
            let mut reply = ctx.body().to_vec();
            reply.push(b'\n');
            ctx.output(reply);
        }));
        Arc::new(engine)
    }

    fn counting_callbacks() -> (Callbacks, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let connects = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));
        let mut callbacks = Callbacks::default();
        let c = connects.clone();
        callbacks.on_connect(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let d = disconnects.clone();
        callbacks.on_disconnect(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });
        (callbacks, connects, disconnects)
    }

    #[test]
    fn register_then_close_releases_once() {
        let poller = Arc::new(RecordingPoller::default());
        let (callbacks, connects, disconnects) = counting_callbacks();
        let sub = shard(poller.clone(), 4, callbacks);
        let (conn, _client) = accepted();

        sub.register(&conn).unwrap();
        assert_eq!(*poller.added.lock(), vec![conn.fd()]);
        assert_eq!(sub.len(), 1);
        assert!(sub.connection(conn.fd()).is_some());
        assert_eq!(connects.load(Ordering::SeqCst), 1);

        std::thread::scope(|s| {
            s.spawn(|| conn.close());
            s.spawn(|| conn.close());
        });
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(sub.is_empty());
        assert_eq!(*poller.removed.lock(), vec![conn.fd()]);
    }

    #[test]
    fn failed_registration_tracks_nothing() {
        let poller = Arc::new(RecordingPoller {
            fail_add: true,
            ..Default::default()
        });
        let (callbacks, connects, disconnects) = counting_callbacks();
        let sub = shard(poller, 4, callbacks);
        let (conn, _client) = accepted();

        assert!(matches!(sub.register(&conn), Err(AppError::Poller(_))));
        assert!(sub.is_empty());
        conn.close();
        assert_eq!(connects.load(Ordering::SeqCst), 0);
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn deregister_failure_still_forgets_connection() {
        let poller = Arc::new(RecordingPoller {
            fail_remove: true,
            ..Default::default()
        });
        let sub = shard(poller, 4, Callbacks::default());
        let (conn, _client) = accepted();
        sub.register(&conn).unwrap();
        conn.close();
        assert!(sub.is_empty());
    }

    #[test]
    fn full_channel_defers_until_next_cycle() {
        let poller = Arc::new(RecordingPoller::default());
        let sub = shard(poller.clone(), 1, Callbacks::default());
        sub.offer(10);
        sub.offer(11);
        assert!(poller.rearmed.lock().is_empty());
        assert_eq!(sub.ready_rx.len(), 1);

        sub.rearm_deferred();
        assert_eq!(*poller.rearmed.lock(), vec![11]);
        sub.rearm_deferred();
        assert_eq!(*poller.rearmed.lock(), vec![11]);
    }

    #[test]
    fn block_policy_waits_for_room() {
        let poller = Arc::new(RecordingPoller::default());
        let sub = shard_with(poller.clone(), 1, NotifyPolicy::Block, Callbacks::default());
        sub.offer(10);

        let offering = {
            let sub = sub.clone();
            std::thread::spawn(move || sub.offer(11))
        };
        std::thread::sleep(Duration::from_millis(100));
        assert!(!offering.is_finished());

        assert_eq!(sub.ready_rx.recv_blocking().unwrap(), 10);
        offering.join().unwrap();
        assert_eq!(sub.ready_rx.try_recv().unwrap(), 11);
        assert!(poller.rearmed.lock().is_empty());

        sub.stop();
        sub.offer(12);
        assert!(sub.ready_rx.is_empty());
    }

    #[test]
    fn connect_callback_finishes_before_the_shard_sees_the_connection() {
        let poller = Arc::new(RecordingPoller::default());
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut callbacks = Callbacks::default();
        let seen = order.clone();
        callbacks.on_connect(move |_| {
            std::thread::sleep(Duration::from_millis(300));
            seen.lock().push("connect");
        });
        let seen = order.clone();
        callbacks.on_disconnect(move |_| seen.lock().push("disconnect"));
        let sub = shard(poller, 4, callbacks);
        let (conn, client) = accepted();
        client.shutdown(std::net::Shutdown::Write).unwrap();

        std::thread::scope(|s| {
            s.spawn(|| sub.register(&conn).unwrap());
            std::thread::sleep(Duration::from_millis(50));
            // what the shard loop does on a ready descriptor
            if let Some(found) = sub.connection(conn.fd()) {
                found.close();
            }
        });
        assert_eq!(*order.lock(), vec!["connect", "disconnect"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn polling_runs_chain_per_frame_and_closes_on_eof() {
        let poller = Arc::new(RecordingPoller::default());
        let (callbacks, _, disconnects) = counting_callbacks();
        let sub = shard(poller.clone(), 8, callbacks);
        let (conn, mut client) = accepted();
        sub.register(&conn).unwrap();
        conn.spawn_writer();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let pool = WorkerPool::new(4).unwrap();
        tokio::spawn(sub.clone().polling(echo_engine(seen.clone()), pool));

        client.write_all(b"ping\n").unwrap();
        for _ in 0..200 {
            sub.offer(conn.fd());
            tokio::time::sleep(Duration::from_millis(5)).await;
            if !poller.rearmed.lock().is_empty() {
                break;
            }
        }

        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping\n");

        client.shutdown(std::net::Shutdown::Write).unwrap();
        for _ in 0..200 {
            if sub.is_empty() {
                break;
            }
            sub.offer(conn.fd());
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(sub.is_empty());
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock(), vec![Bytes::from("ping")]);
        sub.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unterminated_last_line_is_answered_before_close() {
        let poller = Arc::new(RecordingPoller::default());
        let (callbacks, _, disconnects) = counting_callbacks();
        let sub = shard(poller.clone(), 8, callbacks);
        let (conn, mut client) = accepted();
        sub.register(&conn).unwrap();
        conn.spawn_writer();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let pool = WorkerPool::new(4).unwrap();
        tokio::spawn(sub.clone().polling(echo_engine(seen.clone()), pool));

        client.write_all(b"last-no-newline").unwrap();
        client.shutdown(std::net::Shutdown::Write).unwrap();
        drive(&sub, &poller, conn.fd(), || !seen.lock().is_empty()).await;
        for _ in 0..200 {
            if sub.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(sub.is_empty());
        assert_eq!(*seen.lock(), vec![Bytes::from("last-no-newline")]);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);

        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, b"last-no-newline\n");
        sub.stop();
    }
}
