//! End-to-end tests through a real listener

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use common::{spawn_silent_upstream, spawn_upstream};
use turnstile::proxy::{FrontDoor, HttpBackend, Registry};
use turnstile::server::listener::serve;

async fn start_proxy(backends: Vec<HttpBackend>) -> (SocketAddr, Arc<Registry<HttpBackend>>) {
    let registry = Arc::new(Registry::new(backends).unwrap());
    let front_door = Arc::new(FrontDoor::new(Arc::clone(&registry)));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, front_door));

    (addr, registry)
}

fn http_backend(addr: SocketAddr, request_timeout: Duration) -> HttpBackend {
    HttpBackend::parse(&format!("http://{}", addr), Duration::from_secs(1), request_timeout).unwrap()
}

async fn roundtrip(proxy: SocketAddr, raw: &[u8]) -> String {
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(raw).await.unwrap();

    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    String::from_utf8_lossy(&out).to_string()
}

#[tokio::test]
async fn test_proxy_passes_response_through() {
    let (upstream, mut seen) =
        spawn_upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nX-Upstream: yes\r\n\r\nOK").await;
    let (proxy, _) = start_proxy(vec![http_backend(upstream, Duration::from_secs(5))]).await;

    let reply = roundtrip(
        proxy,
        b"GET /hello HTTP/1.1\r\nHost: proxy.local\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{}", reply);
    assert!(reply.contains("X-Upstream: yes\r\n"));
    assert!(reply.contains("Connection: close\r\n"));
    assert!(reply.ends_with("\r\n\r\nOK"));

    let head = seen.recv().await.unwrap();
    assert!(head.starts_with("GET /hello HTTP/1.1\r\n"));
    assert!(head.contains("X-Forwarded-For: 127.0.0.1\r\n"));
    assert!(head.contains("X-Forwarded-Host: proxy.local\r\n"));
}

#[tokio::test]
async fn test_proxy_rotates_across_upstreams() {
    let (a, _) = spawn_upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nA").await;
    let (b, _) = spawn_upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nB").await;
    let (proxy, _) = start_proxy(vec![
        http_backend(a, Duration::from_secs(5)),
        http_backend(b, Duration::from_secs(5)),
    ])
    .await;

    let mut bodies = String::new();
    for _ in 0..4 {
        let reply = roundtrip(proxy, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        bodies.push_str(reply.rsplit("\r\n\r\n").next().unwrap());
    }

    assert_eq!(bodies, "ABAB");
}

#[tokio::test]
async fn test_proxy_keeps_connection_alive() {
    let (upstream, _) = spawn_upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK").await;
    let (proxy, _) = start_proxy(vec![http_backend(upstream, Duration::from_secs(5))]).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"GET /1 HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    let reply = String::from_utf8_lossy(&out);

    assert_eq!(reply.matches("HTTP/1.1 200 OK\r\n").count(), 2);
}

#[tokio::test]
async fn test_proxy_answers_503_when_all_dead() {
    let (upstream, _) = spawn_upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK").await;
    let (proxy, registry) = start_proxy(vec![http_backend(upstream, Duration::from_secs(5))]).await;

    registry.backends()[0].set_alive(false);
    let reply = roundtrip(proxy, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(reply.starts_with("HTTP/1.1 503 Service Unavailable\r\n"), "{}", reply);

    registry.backends()[0].set_alive(true);
    let reply = roundtrip(proxy, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{}", reply);
}

#[tokio::test]
async fn test_proxy_answers_504_on_slow_upstream() {
    let upstream = spawn_silent_upstream().await;
    let (proxy, _) = start_proxy(vec![http_backend(upstream, Duration::from_millis(100))]).await;

    let reply = roundtrip(proxy, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await;

    assert!(reply.starts_with("HTTP/1.1 504 Gateway Timeout\r\n"), "{}", reply);
}

#[tokio::test]
async fn test_proxy_rejects_malformed_request() {
    let (upstream, _) = spawn_upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK").await;
    let (proxy, _) = start_proxy(vec![http_backend(upstream, Duration::from_secs(5))]).await;

    let reply = roundtrip(proxy, b"BREW /pot HTTP/1.1\r\n\r\n").await;

    assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", reply);
}

#[tokio::test]
async fn test_client_disconnect_aborts_forward() {
    // Upstream that never answers and reports when the proxy hangs up on it
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let stuck = listener.local_addr().unwrap();
    let (hung_up_tx, hung_up_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        while let Ok(n) = socket.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
        let _ = hung_up_tx.send(());
    });

    let (healthy, _) = spawn_upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK").await;
    let (proxy, _) = start_proxy(vec![
        http_backend(stuck, Duration::from_secs(30)),
        http_backend(healthy, Duration::from_secs(5)),
    ])
    .await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    // Let the proxy pick the stuck backend before going away
    tokio::time::sleep(Duration::from_millis(100)).await;
    // Zero linger turns the close into a reset
    #[allow(deprecated)]
    client.set_linger(Some(Duration::ZERO)).unwrap();
    drop(client);

    tokio::time::timeout(Duration::from_secs(5), hung_up_rx)
        .await
        .expect("upstream connection was not released")
        .unwrap();

    let reply = roundtrip(proxy, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{}", reply);
}

#[tokio::test]
async fn test_half_closed_client_still_gets_response() {
    let (upstream, _) =
        spawn_upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK").await;
    let (proxy, _) = start_proxy(vec![http_backend(upstream, Duration::from_secs(5))]).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    client.shutdown().await.unwrap();

    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    let reply = String::from_utf8_lossy(&out);

    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{}", reply);
    assert!(reply.ends_with("\r\n\r\nOK"));
}
