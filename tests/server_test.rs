use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rstest::rstest;
use shardlink::network::Framing;
use shardlink::service::ListenerConfig;
use shardlink::{MainReactor, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

fn config(listeners: Vec<ListenerConfig>, prefix_width: u8) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.network.listeners = listeners;
    config.network.accept_concurrency = 2;
    config.reactor.sub_reactors = 4;
    config.engine.context_pool_shards = 8;
    config.worker_pool.size = 16;
    config.connection.length_prefix_width = prefix_width;
    config
}

/// Starts an echo server and returns its reactor and bound addresses.
async fn echo_listeners(config: ServerConfig) -> (Arc<MainReactor>, Vec<SocketAddr>) {
    let framing = config.framing();
    let reactor = MainReactor::builder(config)
        .on_request(move |ctx| {
            if let Ok(frame) = framing.encode(ctx.body()) {
                ctx.output(frame);
            }
        })
        .build()
        .unwrap();
    let addrs = reactor.start().await.unwrap();
    (reactor, addrs)
}

async fn echo_server(config: ServerConfig) -> (Arc<MainReactor>, SocketAddr) {
    let (reactor, addrs) = echo_listeners(config).await;
    (reactor, addrs[0])
}

async fn read_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("reply timed out")
        .unwrap();
    buf
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    cond()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tcp_echo_with_line_framing() {
    let (reactor, addr) = echo_server(config(vec![ListenerConfig::tcp("127.0.0.1:0")], 0)).await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    client.write_all(b"hello\r\n").await.unwrap();
    assert_eq!(read_n(&mut client, 6).await, b"hello\n");

    // a line split over two writes is only answered once complete
    client.write_all(b"wor").await.unwrap();
    sleep(Duration::from_millis(50)).await;
    client.write_all(b"ld\n").await.unwrap();
    assert_eq!(read_n(&mut client, 6).await, b"world\n");

    reactor.shutdown();
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(4)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tcp_echo_with_length_prefix(#[case] width: u8) {
    let (reactor, addr) =
        echo_server(config(vec![ListenerConfig::tcp("127.0.0.1:0")], width)).await;
    let framing = Framing::new(width, 0);
    let mut client = TcpStream::connect(addr).await.unwrap();

    let frame = framing.encode(b"world").unwrap();
    let (prefix, body) = frame.split_at(width as usize + 2);
    client.write_all(prefix).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    client.write_all(body).await.unwrap();
    assert_eq!(read_n(&mut client, frame.len()).await, frame.as_ref());

    reactor.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn frames_in_one_read_are_all_answered() {
    let (reactor, addr) = echo_server(config(vec![ListenerConfig::tcp("127.0.0.1:0")], 0)).await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    client.write_all(b"aa\nbb\ncc\n").await.unwrap();
    let mut replies: Vec<Vec<u8>> = read_n(&mut client, 9)
        .await
        .chunks(3)
        .map(<[u8]>::to_vec)
        .collect();
    replies.sort();
    assert_eq!(replies, vec![b"aa\n".to_vec(), b"bb\n".to_vec(), b"cc\n".to_vec()]);

    reactor.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn middleware_can_abort_the_chain() {
    let reactor = MainReactor::builder(config(vec![ListenerConfig::tcp("127.0.0.1:0")], 0))
        .use_handler(|ctx| {
            if ctx.body().as_ref() == b"deny" {
                ctx.output(&b"denied\n"[..]);
                ctx.abort();
            } else {
                ctx.set("checked", true);
            }
        })
        .on_request(|ctx| {
            let checked = ctx.get::<bool>("checked").copied().unwrap_or(false);
            let reply = if checked { "ok\n" } else { "unchecked\n" };
            ctx.output(reply.as_bytes().to_vec());
        })
        .build()
        .unwrap();
    let addr = reactor.start().await.unwrap()[0];
    let mut client = TcpStream::connect(addr).await.unwrap();

    client.write_all(b"deny\n").await.unwrap();
    assert_eq!(read_n(&mut client, 7).await, b"denied\n");
    client.write_all(b"allow\n").await.unwrap();
    assert_eq!(read_n(&mut client, 3).await, b"ok\n");

    reactor.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lifecycle_callbacks_fire_once_per_connection() {
    let connects = Arc::new(AtomicUsize::new(0));
    let disconnects = Arc::new(AtomicUsize::new(0));
    let (c, d) = (connects.clone(), disconnects.clone());
    let reactor = MainReactor::builder(config(vec![ListenerConfig::tcp("127.0.0.1:0")], 0))
        .on_connect(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .on_disconnect(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();
    let addr = reactor.start().await.unwrap()[0];

    let clients: Vec<_> = connect_many(addr, 3).await;
    assert!(wait_until(|| connects.load(Ordering::SeqCst) == 3).await);
    assert!(wait_until(|| reactor.connection_count() == 3).await);

    drop(clients);
    assert!(wait_until(|| disconnects.load(Ordering::SeqCst) == 3).await);
    assert!(wait_until(|| reactor.connection_count() == 0).await);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(disconnects.load(Ordering::SeqCst), 3);

    reactor.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn last_line_without_newline_is_answered_at_eof() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let order = Arc::new(Mutex::new(Vec::new()));
    let (bodies, connected, disconnected) = (seen.clone(), order.clone(), order.clone());
    let reactor = MainReactor::builder(config(vec![ListenerConfig::tcp("127.0.0.1:0")], 0))
        .on_connect(move |_| {
            std::thread::sleep(Duration::from_millis(200));
            connected.lock().push("connect");
        })
        .on_disconnect(move |_| disconnected.lock().push("disconnect"))
        .on_request(move |ctx| {
            bodies.lock().push(String::from_utf8_lossy(ctx.body()).into_owned());
            let mut reply = ctx.body().to_vec();
            reply.push(b'\n');
            ctx.output(reply);
        })
        .build()
        .unwrap();
    let addr = reactor.start().await.unwrap()[0];

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"first\nlast-no-newline").await.unwrap();
    client.shutdown().await.unwrap();

    let mut replies = Vec::new();
    timeout(WAIT, client.read_to_end(&mut replies))
        .await
        .expect("connection never closed")
        .unwrap();
    assert!(replies
        .windows(16)
        .any(|w| w == b"last-no-newline\n"));

    assert!(wait_until(|| seen.lock().len() == 2).await);
    let mut bodies = seen.lock().clone();
    bodies.sort();
    assert_eq!(bodies, vec!["first", "last-no-newline"]);
    assert!(wait_until(|| order.lock().len() == 2).await);
    assert_eq!(*order.lock(), vec!["connect", "disconnect"]);

    reactor.shutdown();
}

async fn connect_many(addr: SocketAddr, n: usize) -> Vec<TcpStream> {
    let mut clients = Vec::with_capacity(n);
    for _ in 0..n {
        clients.push(TcpStream::connect(addr).await.unwrap());
    }
    clients
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversized_frame_closes_connection() {
    let mut config = config(vec![ListenerConfig::tcp("127.0.0.1:0")], 2);
    config.connection.max_frame_size = 8;
    let (reactor, addr) = echo_server(config).await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    client.write_all(&[0, 100]).await.unwrap();
    let mut buf = [0u8; 1];
    let read = timeout(WAIT, client.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    reactor.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_clients_echo_concurrently() {
    let (reactor, addr) = echo_server(config(vec![ListenerConfig::tcp("127.0.0.1:0")], 0)).await;

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            tokio::spawn(async move {
                let mut client = TcpStream::connect(addr).await.unwrap();
                for round in 0..5 {
                    let line = format!("client-{:02}-round-{}\n", i, round);
                    client.write_all(line.as_bytes()).await.unwrap();
                    assert_eq!(read_n(&mut client, line.len()).await, line.as_bytes());
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    reactor.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn udp_and_tcp_listeners_share_one_reactor() {
    let (reactor, addrs) = echo_listeners(config(
        vec![
            ListenerConfig::tcp("127.0.0.1:0"),
            ListenerConfig::udp("127.0.0.1:0"),
        ],
        0,
    ))
    .await;
    assert_eq!(addrs.len(), 2);
    assert!(reactor.start().await.is_err());

    let mut tcp = TcpStream::connect(addrs[0]).await.unwrap();
    tcp.write_all(b"over tcp\n").await.unwrap();
    assert_eq!(read_n(&mut tcp, 9).await, b"over tcp\n");

    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    udp.send_to(b"over udp", addrs[1]).await.unwrap();
    let mut buf = [0u8; 64];
    let (n, _) = timeout(WAIT, udp.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"over udp\n");

    reactor.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn udp_echo_through_datagram_listener() {
    let reactor = MainReactor::builder(config(vec![ListenerConfig::udp("127.0.0.1:0")], 0))
        .on_request(|ctx| {
            let body = ctx.body().clone();
            ctx.output(body);
        })
        .build()
        .unwrap();
    let addr = reactor.start().await.unwrap()[0];

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for msg in [&b"first"[..], &b"second"[..]] {
        client.send_to(msg, addr).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = timeout(WAIT, client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], msg);
        assert_eq!(from, addr);
    }

    reactor.shutdown();
}
