#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use turnstile::error::ForwardError;
use turnstile::http::request::{Method, Request, RequestBuilder};
use turnstile::http::response::{Response, ResponseBuilder, StatusCode};
use turnstile::proxy::{Backend, FrontDoor, Registry, Selection};

/// What a `FakeBackend` does when asked to forward.
#[derive(Debug, Clone, Copy)]
pub enum Reply {
    /// 200 with its own address as the body.
    Echo,
    /// 200 with a fixed body.
    Body(&'static str),
    /// Connection refused.
    Refused,
    /// Upstream timed out.
    TimedOut,
}

#[derive(Debug)]
pub struct FakeBackend {
    address: String,
    alive: AtomicBool,
    reply: Reply,
    pub checks: AtomicUsize,
    pub hits: AtomicUsize,
}

impl FakeBackend {
    pub fn new(address: &str, alive: bool, reply: Reply) -> Self {
        Self {
            address: address.to_string(),
            alive: AtomicBool::new(alive),
            reply,
            checks: AtomicUsize::new(0),
            hits: AtomicUsize::new(0),
        }
    }

    pub fn live(address: &str) -> Self {
        Self::new(address, true, Reply::Echo)
    }

    pub fn dead(address: &str) -> Self {
        Self::new(address, false, Reply::Echo)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Relaxed);
    }
}

impl Backend for FakeBackend {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_alive(&self) -> bool {
        self.checks.fetch_add(1, Ordering::Relaxed);
        self.alive.load(Ordering::Relaxed)
    }

    async fn forward(&self, _request: &Request) -> Result<Response, ForwardError> {
        self.hits.fetch_add(1, Ordering::Relaxed);
        match self.reply {
            Reply::Echo => Ok(ok_response(self.address.clone())),
            Reply::Body(body) => Ok(ok_response(body)),
            Reply::Refused => Err(ForwardError::Connect {
                addr: self.address.clone(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            }),
            Reply::TimedOut => Err(ForwardError::Timeout(Duration::from_secs(30))),
        }
    }
}

pub fn registry(backends: Vec<FakeBackend>) -> Registry<FakeBackend> {
    Registry::new(backends).unwrap()
}

pub fn front_door(backends: Vec<FakeBackend>) -> FrontDoor<FakeBackend> {
    FrontDoor::new(std::sync::Arc::new(registry(backends)))
}

pub fn get(path: &str) -> Request {
    RequestBuilder::new()
        .method(Method::GET)
        .path(path)
        .build()
        .unwrap()
}

pub fn picked<B: Backend>(registry: &Registry<B>) -> Option<String> {
    match registry.next() {
        Selection::Found(backend) => Some(backend.address().to_string()),
        Selection::Unavailable => None,
    }
}

/// A 200 response carrying `body`.
pub fn ok_response(body: impl Into<Vec<u8>>) -> Response {
    ResponseBuilder::new(StatusCode::OK).body(body.into()).build()
}

/// Starts a canned HTTP upstream on an ephemeral port.
///
/// Each connection's request head is sent on the returned channel, then
/// `response` is written verbatim and the connection closed.
pub async fn spawn_upstream(
    response: &'static [u8],
) -> (std::net::SocketAddr, tokio::sync::mpsc::UnboundedReceiver<String>) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = tx.send(String::from_utf8_lossy(&head).to_string());
                let _ = socket.write_all(response).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (addr, rx)
}

/// Starts an upstream that accepts connections and never answers.
pub async fn spawn_silent_upstream() -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    addr
}

/// An address nothing is listening on.
pub async fn closed_port() -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
