use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::http::parser::{parse_http_request, ParseError};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::http::writer::ResponseWriter;
use crate::proxy::{Backend, FrontDoor};

pub struct Connection<B> {
    stream: TcpStream,
    peer: SocketAddr,
    buffer: Vec<u8>,
    state: ConnectionState,
    front_door: Arc<FrontDoor<B>>,
}

pub enum ConnectionState {
    Reading,
    Processing(Request),
    Writing(ResponseWriter, bool), // bool = keep_alive?
    Closed,
}

impl<B: Backend> Connection<B> {
    pub fn new(stream: TcpStream, peer: SocketAddr, front_door: Arc<FrontDoor<B>>) -> Self {
        Self {
            stream,
            peer,
            buffer: Vec::with_capacity(4096),
            state: ConnectionState::Reading,
            front_door,
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            match std::mem::replace(&mut self.state, ConnectionState::Closed) {
                ConnectionState::Reading => {
                    self.state = match self.read_request().await {
                        Ok(Some(req)) => ConnectionState::Processing(req),
                        Ok(None) => ConnectionState::Closed,
                        Err(e) => {
                            tracing::debug!(peer = %self.peer, error = ?e, "Rejecting malformed request");
                            ConnectionState::Writing(
                                ResponseWriter::new(&Response::bad_request(), false),
                                false,
                            )
                        }
                    };
                }

                ConnectionState::Processing(mut req) => {
                    let keep_alive = req.keep_alive();
                    self.tag_forwarded(&mut req);

                    // Losing the race drops the dispatch future, aborting the upstream exchange
                    let outcome = tokio::select! {
                        response = self.front_door.handle(&req) => Some(response),
                        _ = client_disconnected(&self.stream) => None,
                    };

                    let Some(response) = outcome else {
                        tracing::debug!(peer = %self.peer, path = %req.path, "Client went away mid-request");
                        continue;
                    };

                    let writer = ResponseWriter::new(&response, keep_alive);
                    self.state = ConnectionState::Writing(writer, keep_alive);
                }

                ConnectionState::Writing(mut writer, keep_alive) => {
                    writer.write_to_stream(&mut self.stream).await?;

                    if keep_alive {
                        self.state = ConnectionState::Reading; // go back for next request
                    }
                }

                ConnectionState::Closed => {
                    break;
                }
            }
        }

        Ok(())
    }

    pub async fn read_request(&mut self) -> Result<Option<Request>, ParseError> {
        loop {
            // Try parsing whatever we already have
            match parse_http_request(&self.buffer) {
                Ok((request, consumed)) => {
                    // Remove consumed bytes
                    self.buffer.drain(..consumed);
                    return Ok(Some(request));
                }

                Err(ParseError::Incomplete) => {
                    // Need more data → fall through to read
                }

                Err(e) => return Err(e),
            }

            // Read more data
            let mut temp = [0u8; 4096];
            let n = match self.stream.read(&mut temp).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(peer = %self.peer, error = %e, "Read from client failed");
                    return Ok(None);
                }
            };

            if n == 0 {
                // Client closed connection
                return Ok(None);
            }

            self.buffer.extend_from_slice(&temp[..n]);
        }
    }

    /// Records the client and the host it asked for before the request leaves.
    fn tag_forwarded(&self, req: &mut Request) {
        req.append_forwarded_for(&self.peer.ip().to_string());
        if let Some(host) = req.header("Host").map(str::to_string) {
            req.set_header("X-Forwarded-Host", host);
        }
    }
}

/// Resolves once the client connection has failed, typically a reset.
///
/// A half-close (EOF on read) is not a disconnect: the client may still be
/// waiting for the response. Pipelined bytes leave this pending as well.
async fn client_disconnected(stream: &TcpStream) {
    let mut peeked = [0u8; 1];
    if stream.peek(&mut peeked).await.is_ok() {
        std::future::pending::<()>().await;
    }
}
