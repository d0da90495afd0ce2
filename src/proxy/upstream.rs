//! Upstream connection and request forwarding
//!
//! This module handles connecting to backend servers and forwarding
//! HTTP requests/responses. Every exchange uses a fresh connection with
//! `Connection: close`, so the end of the upstream stream also marks the
//! end of the response. `https` upstreams are wrapped in TLS, verified
//! against the bundled web PKI roots.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use url::{Host, Url};

use crate::error::ForwardError;
use crate::http::parser::find_headers_end;
use crate::http::request::{Method, Request};
use crate::http::response::{Response, ResponseBuilder, StatusCode};

/// Default buffer size for streaming
const BUFFER_SIZE: usize = 8192;

/// Largest upstream response head accepted.
const MAX_RESPONSE_HEAD: usize = 64 * 1024;

/// Headers that only describe a single connection and must not be relayed.
const HOP_BY_HOP: &[&str] = &[
    "Connection",
    "Keep-Alive",
    "Proxy-Connection",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "TE",
    "Trailer",
    "Transfer-Encoding",
    "Upgrade",
];

/// A single upstream origin reached over HTTP/1.1.
#[derive(Debug, Clone)]
pub struct Upstream {
    url: Url,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl Upstream {
    pub fn new(url: Url, connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            url,
            connect_timeout,
            request_timeout,
        }
    }

    /// Forwards `request` and returns the upstream's full response.
    pub async fn send(&self, request: &Request) -> Result<Response, ForwardError> {
        let addr = self.authority_addr();

        let stream = timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ForwardError::Timeout(self.connect_timeout))?
            .map_err(|source| ForwardError::Connect {
                addr: addr.clone(),
                source,
            })?;

        tracing::trace!(upstream = %addr, "Connected to upstream");

        if self.url.scheme() == "https" {
            let stream = timeout(self.connect_timeout, self.tls_handshake(&addr, stream))
                .await
                .map_err(|_| ForwardError::Timeout(self.connect_timeout))??;

            tracing::trace!(upstream = %addr, "TLS session established");

            timeout(self.request_timeout, self.exchange(stream, request))
                .await
                .map_err(|_| ForwardError::Timeout(self.request_timeout))?
        } else {
            timeout(self.request_timeout, self.exchange(stream, request))
                .await
                .map_err(|_| ForwardError::Timeout(self.request_timeout))?
        }
    }

    async fn tls_handshake(
        &self,
        addr: &str,
        stream: TcpStream,
    ) -> Result<TlsStream<TcpStream>, ForwardError> {
        let tls_error = |source| ForwardError::Tls {
            addr: addr.to_string(),
            source,
        };

        let server_name = self.server_name().map_err(tls_error)?;
        tls_connector()
            .connect(server_name, stream)
            .await
            .map_err(tls_error)
    }

    /// Name presented in SNI and checked against the upstream certificate.
    fn server_name(&self) -> std::io::Result<ServerName<'static>> {
        match self.url.host() {
            Some(Host::Domain(domain)) => ServerName::try_from(domain.to_string())
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e)),
            Some(Host::Ipv4(ip)) => Ok(ServerName::from(IpAddr::V4(ip))),
            Some(Host::Ipv6(ip)) => Ok(ServerName::from(IpAddr::V6(ip))),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "upstream URL has no host",
            )),
        }
    }

    async fn exchange<S>(&self, mut stream: S, request: &Request) -> Result<Response, ForwardError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request_bytes = self.build_http_request(request);
        stream.write_all(&request_bytes).await?;
        stream.flush().await?;

        tracing::trace!("Request sent to upstream");

        read_http_response(&mut stream, request.method).await
    }

    /// `host:port` to dial, defaulting the port from the scheme.
    fn authority_addr(&self) -> String {
        let host = self.url.host_str().unwrap_or("localhost");
        let port = self.url.port_or_known_default().unwrap_or(80);
        format!("{}:{}", host, port)
    }

    /// Value for the outbound `Host` header.
    fn host_header(&self) -> String {
        let host = self.url.host_str().unwrap_or("localhost");
        match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// Build HTTP request bytes to send to the upstream.
    ///
    /// Public so the rewrite rules can be checked without a socket.
    pub fn build_http_request(&self, request: &Request) -> Vec<u8> {
        let mut outbound = request.clone();

        // Headers named in Connection are hop-by-hop too
        if let Some(listed) = request.header("Connection") {
            for name in listed.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                outbound.remove_header(name);
            }
        }
        for name in HOP_BY_HOP {
            outbound.remove_header(name);
        }
        // The body is already buffered; never invite an interim 100 Continue
        outbound.remove_header("Expect");

        outbound.set_header("Host", self.host_header());
        outbound.set_header("Connection", "close");
        if !outbound.body.is_empty() {
            outbound.set_header("Content-Length", outbound.body.len().to_string());
        }

        let target = upstream_target(&self.url, &request.path);

        let mut buffer = Vec::with_capacity(512 + outbound.body.len());
        buffer.extend_from_slice(
            format!("{} {} HTTP/1.1\r\n", request.method.as_str(), target).as_bytes(),
        );

        for (key, value) in &outbound.headers {
            buffer.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
        }

        // End of headers
        buffer.extend_from_slice(b"\r\n");
        buffer.extend_from_slice(&outbound.body);

        buffer
    }
}

/// Shared TLS client configuration, built on first use.
fn tls_connector() -> &'static TlsConnector {
    static CONNECTOR: OnceLock<TlsConnector> = OnceLock::new();

    CONNECTOR.get_or_init(|| {
        // Another component may already have installed a provider
        let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    })
}

/// Joins the client's request target onto the upstream base URL's path and
/// query, so `http://b/api` plus `/users?x=1` becomes `/api/users?x=1`.
pub fn upstream_target(base: &Url, target: &str) -> String {
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    };
    let path = if path.is_empty() { "/" } else { path };

    let base_path = base.path();
    let joined = match (base_path.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base_path, &path[1..]),
        (false, false) => format!("{}/{}", base_path, path),
        _ => format!("{}{}", base_path, path),
    };

    match (base.query().filter(|q| !q.is_empty()), query) {
        (Some(b), Some(q)) => format!("{}?{}&{}", joined, b, q),
        (Some(b), None) => format!("{}?{}", joined, b),
        (None, Some(q)) => format!("{}?{}", joined, q),
        (None, None) => joined,
    }
}

/// Reads and frames one HTTP response from `stream`.
pub async fn read_http_response<S>(stream: &mut S, method: Method) -> Result<Response, ForwardError>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

    let head_end = loop {
        if let Some(end) = find_headers_end(&buffer) {
            break end;
        }

        if buffer.len() > MAX_RESPONSE_HEAD {
            return Err(ForwardError::InvalidResponse("response headers too large".into()));
        }

        if stream.read_buf(&mut buffer).await? == 0 {
            return Err(ForwardError::InvalidResponse(
                "connection closed before complete response received".into(),
            ));
        }
    };

    let head = buffer.split_to(head_end + 4);
    let (status, mut headers) = parse_response_head(&head)?;

    // No body follows, whatever the framing headers claim
    if method == Method::HEAD || status.is_bodyless() {
        strip_hop_by_hop(&mut headers);
        return Ok(Response {
            status,
            headers,
            body: Vec::new(),
        });
    }

    let chunked = header_value(&headers, "Transfer-Encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));
    let content_length = header_value(&headers, "Content-Length")
        .map(|v| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| ForwardError::InvalidResponse(format!("bad Content-Length '{}'", v)))
        })
        .transpose()?;

    let body = if chunked {
        let raw = read_to_end(stream, buffer).await?;
        decode_chunked(&raw)?
    } else if let Some(length) = content_length {
        read_exact_body(stream, buffer, length).await?
    } else {
        read_to_end(stream, buffer).await?
    };

    strip_hop_by_hop(&mut headers);

    Ok(ResponseBuilder::new(status)
        .headers(headers)
        .body(body)
        .build())
}

/// Parses the status line and headers of a response head.
///
/// Repeated header names are folded into one comma-separated value.
pub fn parse_response_head(
    head: &[u8],
) -> Result<(StatusCode, HashMap<String, String>), ForwardError> {
    let head = std::str::from_utf8(head)
        .map_err(|_| ForwardError::InvalidResponse("invalid UTF-8 in response headers".into()))?;

    let mut lines = head.split("\r\n");

    let status_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| ForwardError::InvalidResponse("empty response".into()))?;
    let mut parts = status_line.splitn(3, ' ');

    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(ForwardError::InvalidResponse(format!(
            "invalid status line: {}",
            status_line
        )));
    }

    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(StatusCode::from_u16)
        .ok_or_else(|| ForwardError::InvalidResponse(format!("invalid status line: {}", status_line)))?;

    let mut headers: HashMap<String, String> = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }

        let Some((key, value)) = line.split_once(':') else {
            return Err(ForwardError::InvalidResponse(format!("malformed header: {}", line)));
        };
        let (key, value) = (key.trim(), value.trim());

        match headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
            Some((_, existing)) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => {
                headers.insert(key.to_string(), value.to_string());
            }
        }
    }

    Ok((status, headers))
}

/// Decodes a complete `Transfer-Encoding: chunked` body.
///
/// Chunk extensions and trailers are discarded.
pub fn decode_chunked(mut raw: &[u8]) -> Result<Vec<u8>, ForwardError> {
    let truncated = || ForwardError::InvalidResponse("truncated chunked body".into());
    let mut body = Vec::with_capacity(raw.len());

    loop {
        let line_end = raw
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or_else(truncated)?;
        let size_line = std::str::from_utf8(&raw[..line_end])
            .map_err(|_| ForwardError::InvalidResponse("invalid chunk size".into()))?;
        let size_hex = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_hex, 16)
            .map_err(|_| ForwardError::InvalidResponse(format!("invalid chunk size '{}'", size_hex)))?;
        raw = &raw[line_end + 2..];

        if size == 0 {
            return Ok(body);
        }

        if raw.len() < size + 2 {
            return Err(truncated());
        }
        body.extend_from_slice(&raw[..size]);
        if &raw[size..size + 2] != b"\r\n" {
            return Err(ForwardError::InvalidResponse("missing chunk terminator".into()));
        }
        raw = &raw[size + 2..];
    }
}

async fn read_exact_body<S>(
    stream: &mut S,
    mut buffer: BytesMut,
    length: usize,
) -> Result<Vec<u8>, ForwardError>
where
    S: AsyncRead + Unpin,
{
    let mut body = Vec::with_capacity(length);

    // Use existing buffer data first
    let from_buffer = buffer.len().min(length);
    body.extend_from_slice(&buffer[..from_buffer]);
    buffer.advance(from_buffer);

    let mut chunk = [0u8; BUFFER_SIZE];
    while body.len() < length {
        let to_read = (length - body.len()).min(BUFFER_SIZE);
        let n = stream.read(&mut chunk[..to_read]).await?;

        if n == 0 {
            return Err(ForwardError::InvalidResponse(
                "connection closed before complete body received".into(),
            ));
        }

        body.extend_from_slice(&chunk[..n]);
    }

    Ok(body)
}

async fn read_to_end<S>(stream: &mut S, buffer: BytesMut) -> Result<Vec<u8>, ForwardError>
where
    S: AsyncRead + Unpin,
{
    let mut body = buffer.to_vec();
    match stream.read_to_end(&mut body).await {
        Ok(_) => Ok(body),
        // TLS peers often close without close_notify
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(body),
        Err(e) => Err(e.into()),
    }
}

fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn strip_hop_by_hop(headers: &mut HashMap<String, String>) {
    headers.retain(|k, _| !HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(k)));
}
