use std::io::{self, ErrorKind, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_channel::TrySendError;
use bytes::Bytes;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::net::UdpSocket;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::network::Framing;
use crate::utils::RingBuffer;
use crate::{AppError, AppResult};

const OPEN: u8 = 0;
const CLOSED: u8 = 1;

/// Whoever tracks a connection and must forget it when the connection closes.
pub trait ConnectionOwner: Send + Sync {
    /// Called exactly once, by the first [`Connection::close`].
    fn release(&self, conn: &Connection);
}

#[derive(Debug)]
pub enum Transport {
    /// Accepted byte stream, non-blocking. Reads are driven by the poller.
    Stream(TcpStream),
    /// One peer of a shared datagram socket.
    Datagram {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    },
}

/// Per-peer state shared by the reactor, the shard loop, the drain loop and
/// request handlers.
#[derive(Debug)]
pub struct Connection {
    id: Uuid,
    fd: RawFd,
    peer_addr: SocketAddr,
    transport: Transport,
    outbound_tx: async_channel::Sender<Bytes>,
    outbound_rx: async_channel::Receiver<Bytes>,
    state: AtomicU8,
    writer_started: AtomicBool,
    owner: OnceCell<Weak<dyn ConnectionOwner>>,
    inbound: Mutex<RingBuffer>,
    created_at: Instant,
    last_active_ms: AtomicU64,
}

impl Connection {
    /// Wraps an accepted stream; its descriptor is captured here once.
    pub fn stream(
        stream: TcpStream,
        queue_capacity: usize,
        read_buffer_size: usize,
    ) -> io::Result<Arc<Connection>> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nonblocking(true)?;
        let fd = stream.as_raw_fd();
        Ok(Self::build(
            fd,
            peer_addr,
            Transport::Stream(stream),
            queue_capacity,
            read_buffer_size,
        ))
    }

    pub fn datagram(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        queue_capacity: usize,
    ) -> Arc<Connection> {
        let fd = socket.as_raw_fd();
        Self::build(fd, peer, Transport::Datagram { socket, peer }, queue_capacity, 0)
    }

    fn build(
        fd: RawFd,
        peer_addr: SocketAddr,
        transport: Transport,
        queue_capacity: usize,
        read_buffer_size: usize,
    ) -> Arc<Connection> {
        let (outbound_tx, outbound_rx) = async_channel::bounded(queue_capacity);
        Arc::new(Connection {
            id: Uuid::new_v4(),
            fd,
            peer_addr,
            transport,
            outbound_tx,
            outbound_rx,
            state: AtomicU8::new(OPEN),
            writer_started: AtomicBool::new(false),
            owner: OnceCell::new(),
            inbound: Mutex::new(RingBuffer::with_capacity(read_buffer_size)),
            created_at: Instant::now(),
            last_active_ms: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn ip(&self) -> IpAddr {
        self.peer_addr.ip()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLOSED
    }

    /// Key used to pick this connection's context pool.
    ///
    /// Streams use their descriptor. Datagram peers share one descriptor,
    /// so they are spread by identity instead.
    pub fn shard_key(&self) -> usize {
        match self.transport {
            Transport::Stream(_) => self.fd as usize,
            Transport::Datagram { .. } => self.id.as_u128() as usize,
        }
    }

    /// Sets the owner released on close. Only the first call takes effect.
    pub fn attach(&self, owner: Weak<dyn ConnectionOwner>) -> bool {
        self.owner.set(owner).is_ok()
    }

    /// Queues `msg` for the drain loop.
    ///
    /// A full queue drops the message; `false` tells the caller it was not
    /// queued.
    pub fn push(&self, msg: impl Into<Bytes>) -> bool {
        match self.outbound_tx.try_send(msg.into()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!("outbound queue of {} is full, frame dropped", self.id);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Tears the connection down. Only the first call has any effect.
    pub fn close(&self) {
        if self
            .state
            .compare_exchange(OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        debug!("closing connection {} from {}", self.id, self.peer_addr);

        self.outbound_tx.close();
        if let Some(owner) = self.owner.get().and_then(Weak::upgrade) {
            owner.release(self);
        }
        if let Transport::Stream(stream) = &self.transport {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                if e.kind() != ErrorKind::NotConnected {
                    debug!("shutdown of {} failed: {}", self.id, e);
                }
            }
        }
    }

    /// Performs one socket read and returns every frame now complete, in
    /// arrival order, plus whether the peer has stopped sending.
    ///
    /// An empty vector without end of stream means nothing was ready. At end
    /// of stream whatever framing still accepts from the leftover bytes is
    /// returned as the last frame.
    pub fn read_frames(&self, framing: &Framing) -> AppResult<(Vec<Bytes>, bool)> {
        if !matches!(self.transport, Transport::Stream(_)) {
            return Err(AppError::IllegalStateError(
                "datagram peers are fed by their acceptor".into(),
            ));
        }
        let mut inbound = self.inbound.lock();
        let eof = match inbound.copy_from_socket(self.fd) {
            Ok(0) => true,
            Ok(_) => {
                self.touch();
                false
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                return Ok((Vec::new(), false));
            }
            Err(e) => return Err(e.into()),
        };

        let mut frames = Vec::new();
        while let Some(frame) = framing.parse(&mut inbound)? {
            frames.push(frame);
        }
        if eof {
            if !inbound.is_empty() {
                trace!("{} bytes left on {} at end of stream", inbound.buffered(), self.id);
            }
            frames.extend(framing.parse_at_eof(&mut inbound)?);
        }
        Ok((frames, eof))
    }

    pub(crate) fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_active_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Time since the last inbound traffic.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_active_ms.load(Ordering::Relaxed));
        self.created_at.elapsed().saturating_sub(last)
    }

    /// Stops taking outbound frames and closes once the queued ones are
    /// written. Without a drain loop it closes at once.
    pub fn close_after_drain(&self) {
        self.outbound_tx.close();
        if !self.writer_started.load(Ordering::Acquire) {
            self.close();
        }
    }

    /// Starts the drain loop. It ends when the queue is closed or a write
    /// fails, and closes the connection either way.
    pub fn spawn_writer(self: &Arc<Self>) {
        self.writer_started.store(true, Ordering::Release);
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = conn.drain().await {
                debug!("writer of {} stopped: {}", conn.id, e);
            }
            conn.close();
        });
    }

    async fn drain(&self) -> io::Result<()> {
        match &self.transport {
            Transport::Stream(stream) => {
                let writable = AsyncFd::with_interest(self.fd, Interest::WRITABLE)?;
                while let Ok(frame) = self.outbound_rx.recv().await {
                    write_all(&writable, stream, &frame).await?;
                }
            }
            Transport::Datagram { socket, peer } => {
                while let Ok(frame) = self.outbound_rx.recv().await {
                    socket.send_to(&frame, *peer).await?;
                }
            }
        }
        Ok(())
    }
}

async fn write_all(writable: &AsyncFd<RawFd>, stream: &TcpStream, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let mut guard = writable.writable().await?;
        let mut writer = stream;
        match guard.try_io(|_| writer.write(buf)) {
            Ok(Ok(0)) => return Err(ErrorKind::WriteZero.into()),
            Ok(Ok(n)) => buf = &buf[n..],
            Ok(Err(e)) => return Err(e),
            Err(_would_block) => continue,
        }
    }
    Ok(())
}
