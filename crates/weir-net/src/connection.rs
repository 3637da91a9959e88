// One keep-alive HTTP/1.1 client over a single socket, plain or TLS. The
// first request resolves and connects; later requests reuse the socket. Any
// I/O failure poisons the transport and the owner is expected to discard the
// connection.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{self, TcpStream};
use tokio::time;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::{error, trace};

use crate::error::{NetError, NetResult};
use crate::url::{Scheme, host_name_of};

/// Deadline applied to every network operation, from the DNS lookup to the
/// last body byte.
const IO_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

const MAX_HEADER_BYTES: usize = 64 * 1024;

trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// A fully buffered HTTP response.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// A keep-alive HTTP/1.1 connection bound to one origin.
pub struct Connection {
    id: u64,
    scheme: Scheme,
    authority: String,
    tls: Arc<ClientConfig>,
    transport: Option<Box<dyn Transport>>,
    buf: BytesMut,
}

impl Connection {
    /// `authority` must carry an explicit port (`host:port`).
    pub fn new(id: u64, scheme: Scheme, authority: String, tls: Arc<ClientConfig>) -> Self {
        Self {
            id,
            scheme,
            authority,
            tls,
            transport: None,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Issue a `GET` for `path` and read the full response. Exactly one of
    /// `Ok`/`Err` comes back per call; on `Err` the socket has been closed
    /// and the connection must not be reused.
    pub async fn get(&mut self, path: &str) -> NetResult<Response> {
        if self.transport.is_none() {
            if let Err(err) = self.connect().await {
                error!(host = %self.authority, error = %err, "failed to connect");
                return Err(err);
            }
        }
        match self.exchange(path).await {
            Ok(response) => Ok(response),
            Err(err) => {
                self.transport = None;
                Err(err)
            }
        }
    }

    async fn connect(&mut self) -> NetResult<()> {
        trace!(id = self.id, host = %self.authority, "establishing connection");

        let addrs: Vec<SocketAddr> =
            io_deadline("DNS lookup", &self.authority, net::lookup_host(&self.authority))
                .await?
                .collect();

        let mut tcp = None;
        let mut last_error = None;
        for addr in addrs {
            match io_deadline("connect", &self.authority, TcpStream::connect(addr)).await {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(err) => last_error = Some(err),
            }
        }
        let Some(tcp) = tcp else {
            return Err(last_error.unwrap_or_else(|| NetError::Io {
                operation: "DNS lookup",
                host: self.authority.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"),
            }));
        };

        self.transport = Some(match self.scheme {
            Scheme::Http => Box::new(tcp) as Box<dyn Transport>,
            Scheme::Https => {
                // SNI takes the bare host, not the authority.
                let host_name = host_name_of(&self.authority).to_string();
                let server_name = ServerName::try_from(host_name)
                    .map_err(|_| NetError::InvalidServerName {
                        host: self.authority.clone(),
                    })?;
                let connector = TlsConnector::from(self.tls.clone());
                let stream = io_deadline(
                    "TLS handshake",
                    &self.authority,
                    connector.connect(server_name, tcp),
                )
                .await?;
                Box::new(stream)
            }
        });
        self.buf.clear();
        Ok(())
    }

    async fn exchange(&mut self, path: &str) -> NetResult<Response> {
        let request = format!(
            "GET {path} HTTP/1.1\r\nHost: {host}\r\nUser-Agent: {USER_AGENT}\r\n\r\n",
            host = self.authority,
        );
        let (response, keep_alive) = {
            let Some(stream) = self.transport.as_mut() else {
                return Err(NetError::Io {
                    operation: "request write",
                    host: self.authority.clone(),
                    source: io::ErrorKind::NotConnected.into(),
                });
            };
            io_deadline(
                "request write",
                &self.authority,
                stream.write_all(request.as_bytes()),
            )
            .await?;
            read_response(stream, &mut self.buf, &self.authority).await?
        };
        if !keep_alive {
            self.transport = None;
            self.buf.clear();
        }
        Ok(response)
    }
}

async fn io_deadline<T, F>(operation: &'static str, host: &str, fut: F) -> NetResult<T>
where
    F: Future<Output = io::Result<T>>,
{
    match time::timeout(IO_TIMEOUT, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(NetError::Io {
            operation,
            host: host.to_string(),
            source,
        }),
        Err(_) => Err(NetError::Timeout {
            operation,
            host: host.to_string(),
        }),
    }
}

struct ResponseHead {
    status: u16,
    content_type: Option<String>,
    content_length: Option<usize>,
    chunked: bool,
    keep_alive: bool,
    has_body: bool,
}

/// Read one response off the wire. Returns the response and whether the
/// connection may serve another request afterwards.
async fn read_response<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    host: &str,
) -> NetResult<(Response, bool)>
where
    S: AsyncRead + Unpin,
{
    let head_len = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(malformed(host, "header section too large"));
        }
        if fill(stream, buf, host).await? == 0 {
            return Err(unexpected_eof(host));
        }
    };
    let head_bytes = buf.split_to(head_len + 4);
    let head_text = std::str::from_utf8(&head_bytes[..head_len])
        .map_err(|_| malformed(host, "non-UTF-8 header section"))?;
    let head = parse_head(head_text, host)?;

    let body = if !head.has_body {
        Bytes::new()
    } else if head.chunked {
        read_chunked_body(stream, buf, host).await?
    } else if let Some(length) = head.content_length {
        while buf.len() < length {
            if fill(stream, buf, host).await? == 0 {
                return Err(unexpected_eof(host));
            }
        }
        buf.split_to(length).freeze()
    } else {
        // No framing: the body runs until the server closes the connection.
        while fill(stream, buf, host).await? != 0 {}
        buf.split_to(buf.len()).freeze()
    };

    let framed = head.chunked || head.content_length.is_some() || !head.has_body;
    let response = Response {
        status: head.status,
        content_type: head.content_type,
        body,
    };
    Ok((response, head.keep_alive && framed))
}

fn parse_head(head: &str, host: &str) -> NetResult<ResponseHead> {
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let keep_alive_default = match parts.next().unwrap_or_default() {
        "HTTP/1.1" => true,
        "HTTP/1.0" => false,
        _ => return Err(malformed(host, "unsupported HTTP version")),
    };
    let status: u16 = parts
        .next()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| malformed(host, "unparseable status code"))?;

    let mut content_type = None;
    let mut content_length = None;
    let mut chunked = false;
    let mut keep_alive = keep_alive_default;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-type") {
            content_type = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("content-length") {
            content_length = Some(
                value
                    .parse()
                    .map_err(|_| malformed(host, "unparseable Content-Length"))?,
            );
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = value.to_ascii_lowercase().contains("chunked");
        } else if name.eq_ignore_ascii_case("connection") {
            let value = value.to_ascii_lowercase();
            if value.contains("close") {
                keep_alive = false;
            } else if value.contains("keep-alive") {
                keep_alive = true;
            }
        }
    }

    let has_body = !(status / 100 == 1 || status == 204 || status == 304);
    Ok(ResponseHead {
        status,
        content_type,
        content_length,
        chunked,
        keep_alive,
        has_body,
    })
}

async fn read_chunked_body<S>(stream: &mut S, buf: &mut BytesMut, host: &str) -> NetResult<Bytes>
where
    S: AsyncRead + Unpin,
{
    let mut body = BytesMut::new();
    loop {
        let line = read_line(stream, buf, host).await?;
        let size_text = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| malformed(host, "unparseable chunk size"))?;
        if size == 0 {
            // Trailer section: lines up to the final blank one.
            while !read_line(stream, buf, host).await?.is_empty() {}
            return Ok(body.freeze());
        }
        while buf.len() < size + 2 {
            if fill(stream, buf, host).await? == 0 {
                return Err(unexpected_eof(host));
            }
        }
        body.extend_from_slice(&buf[..size]);
        buf.advance(size + 2);
    }
}

async fn read_line<S>(stream: &mut S, buf: &mut BytesMut, host: &str) -> NetResult<String>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = buf.split_to(pos + 2);
            return std::str::from_utf8(&line[..pos])
                .map(str::to_string)
                .map_err(|_| malformed(host, "non-UTF-8 chunk framing"));
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(malformed(host, "chunk framing line too long"));
        }
        if fill(stream, buf, host).await? == 0 {
            return Err(unexpected_eof(host));
        }
    }
}

async fn fill<S>(stream: &mut S, buf: &mut BytesMut, host: &str) -> NetResult<usize>
where
    S: AsyncRead + Unpin,
{
    io_deadline("response read", host, stream.read_buf(buf)).await
}

fn malformed(host: &str, reason: &str) -> NetError {
    NetError::MalformedResponse {
        host: host.to_string(),
        reason: reason.to_string(),
    }
}

fn unexpected_eof(host: &str) -> NetError {
    NetError::Io {
        operation: "response read",
        host: host.to_string(),
        source: io::ErrorKind::UnexpectedEof.into(),
    }
}
