//! Fixture HTTP/1.1 server for recorder and writer tests: canned responses
//! per path (served in order, last repeats), per-path hit counters, and an
//! optional per-response delay.

// Each test binary uses a different slice of this module.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const HLS_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
pub const TS_CONTENT_TYPE: &str = "video/mp2t";

#[derive(Clone)]
pub struct Route {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
    pub delay: Option<Duration>,
}

impl Route {
    pub fn ok(content_type: &'static str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            content_type,
            body: body.into(),
            delay: None,
        }
    }

    pub fn playlist(body: impl Into<Vec<u8>>) -> Self {
        Self::ok(HLS_CONTENT_TYPE, body)
    }

    pub fn segment(body: impl Into<Vec<u8>>) -> Self {
        Self::ok(TS_CONTENT_TYPE, body)
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: Vec::new(),
            delay: None,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Default)]
pub struct ServerConfig {
    routes: HashMap<String, Vec<Route>>,
}

impl ServerConfig {
    pub fn route(mut self, path: &str, route: Route) -> Self {
        self.routes.entry(path.to_string()).or_default().push(route);
        self
    }
}

pub struct Server {
    pub addr: SocketAddr,
    hits: Arc<Mutex<HashMap<String, usize>>>,
}

impl Server {
    pub fn host(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.host(), path)
    }

    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

pub async fn spawn(config: ServerConfig) -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(Mutex::new(HashMap::new()));
    let served = Arc::new(Mutex::new(HashMap::<String, usize>::new()));
    let routes = Arc::new(config.routes);

    {
        let hits = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let routes = routes.clone();
                let hits = hits.clone();
                let served = served.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, routes, hits, served).await;
                });
            }
        });
    }

    Server { addr, hits }
}

async fn serve(
    mut stream: TcpStream,
    routes: Arc<HashMap<String, Vec<Route>>>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    served: Arc<Mutex<HashMap<String, usize>>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    loop {
        let head_end = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            buf.extend_from_slice(&chunk[..n]);
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
        buf.drain(..head_end);
        let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();

        let route = routes.get(&path).map(|responses| {
            let mut served = served.lock().unwrap();
            let index = served.entry(path.clone()).or_insert(0);
            let route = responses[(*index).min(responses.len() - 1)].clone();
            *index += 1;
            route
        });
        *hits.lock().unwrap().entry(path).or_insert(0) += 1;

        let route = route.unwrap_or_else(|| Route::status(404));
        if let Some(delay) = route.delay {
            tokio::time::sleep(delay).await;
        }
        let reason = match route.status {
            200 => "OK",
            404 => "Not Found",
            _ => "Error",
        };
        let head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
            route.status,
            reason,
            route.content_type,
            route.body.len(),
        );
        stream.write_all(head.as_bytes()).await?;
        stream.write_all(&route.body).await?;
    }
}
