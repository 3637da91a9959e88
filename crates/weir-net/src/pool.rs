// Per-host connection pool. At most four live connections per origin; idle
// connections are reused most-recent-first, overflow requests wait in FIFO
// order, and a request that fails on a reused idle socket is retried once on
// a different connection before the error surfaces.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tracing::{error, trace, warn};

use crate::connection::{Connection, Response};
use crate::error::{NetError, NetResult};
use crate::url::{self, Scheme, parse_url};

/// Hard cap on live connections per origin.
const MAX_CONNECTIONS: usize = 4;

/// Handle to the pool task. Cloning is cheap; the task drains and exits once
/// every handle is gone and the last in-flight request has completed.
#[derive(Clone)]
pub struct Pool {
    requests: mpsc::UnboundedSender<Request>,
}

impl Pool {
    pub fn new() -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        tokio::spawn(PoolTask::new(requests_rx).run());
        Self {
            requests: requests_tx,
        }
    }

    /// `GET` a resource from already-split URL parts. The port is filled in
    /// from the scheme when `host` does not carry one.
    pub async fn get(&self, scheme: Scheme, host: &str, path: &str) -> NetResult<Response> {
        let (reply, response) = oneshot::channel();
        let request = Request {
            scheme,
            authority: url::authority_of(scheme, host),
            path: path.to_string(),
            reply,
            retries: 0,
        };
        if self.requests.send(request).is_err() {
            return Err(NetError::PoolClosed);
        }
        response.await.map_err(|_| NetError::PoolClosed)?
    }

    /// `GET` an absolute URL. A malformed URL fails here without consuming
    /// any pool resources.
    pub async fn get_url(&self, url: &str) -> NetResult<Response> {
        let parsed = parse_url(url).inspect_err(|_| error!(url, "invalid URL"))?;
        self.get(parsed.scheme, &parsed.host, &parsed.resource).await
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

struct Request {
    scheme: Scheme,
    authority: String,
    path: String,
    reply: oneshot::Sender<NetResult<Response>>,
    /// Extra attempts left. Zero for fresh dials; popping an idle connection
    /// grants one more, which masks stale keep-alive sockets.
    retries: usize,
}

enum Event {
    Delivered {
        authority: String,
        connection: Connection,
    },
    Failed {
        authority: String,
        request: Request,
        error: NetError,
    },
}

#[derive(Default)]
struct HostEntry {
    idle: Vec<Connection>,
    live: usize,
    waiters: VecDeque<Request>,
}

struct PoolTask {
    hosts: HashMap<String, HostEntry>,
    requests: mpsc::UnboundedReceiver<Request>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    tls: Arc<ClientConfig>,
    next_id: u64,
    in_flight: usize,
}

impl PoolTask {
    fn new(requests: mpsc::UnboundedReceiver<Request>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            hosts: HashMap::new(),
            requests,
            events_tx,
            events_rx,
            tls: tls_config(),
            next_id: 0,
            in_flight: 0,
        }
    }

    async fn run(mut self) {
        let mut closed = false;
        loop {
            tokio::select! {
                request = self.requests.recv(), if !closed => match request {
                    Some(request) => self.dispatch(request),
                    None => closed = true,
                },
                event = self.events_rx.recv() => match event {
                    Some(event) => self.complete(event),
                    None => break,
                },
            }
            if closed && self.in_flight == 0 {
                break;
            }
        }
    }

    fn dispatch(&mut self, mut request: Request) {
        let entry = self.hosts.entry(request.authority.clone()).or_default();
        let connection = if let Some(connection) = entry.idle.pop() {
            // The server may have closed this socket while it sat idle;
            // grant the request one transparent retry.
            request.retries += 1;
            connection
        } else if entry.live < MAX_CONNECTIONS {
            entry.live += 1;
            let id = self.next_id;
            self.next_id += 1;
            Connection::new(id, request.scheme, request.authority.clone(), self.tls.clone())
        } else {
            entry.waiters.push_back(request);
            return;
        };
        self.in_flight += 1;
        let events = self.events_tx.clone();
        tokio::spawn(perform(connection, request, events));
    }

    fn complete(&mut self, event: Event) {
        self.in_flight -= 1;
        match event {
            Event::Delivered {
                authority,
                connection,
            } => {
                let entry = self.hosts.entry(authority.clone()).or_default();
                entry.idle.push(connection);
                self.pump(&authority);
            }
            Event::Failed {
                authority,
                request,
                error,
            } => {
                let entry = self.hosts.entry(authority.clone()).or_default();
                entry.live -= 1;
                if request.retries > 0 {
                    trace!(host = %authority, error = %error, "retrying after failed reuse");
                    let request = Request {
                        retries: request.retries - 1,
                        ..request
                    };
                    self.dispatch(request);
                } else {
                    let url = format!("{}://{}{}", request.scheme, authority, request.path);
                    error!(url = %url, error = %error, "failed to get resource");
                    let _ = request.reply.send(Err(error));
                }
                self.pump(&authority);
            }
        }
    }

    fn pump(&mut self, authority: &str) {
        let Some(entry) = self.hosts.get_mut(authority) else {
            return;
        };
        debug_assert!(entry.live <= MAX_CONNECTIONS);
        if let Some(request) = entry.waiters.pop_front() {
            self.dispatch(request);
        }
    }
}

async fn perform(mut connection: Connection, request: Request, events: mpsc::UnboundedSender<Event>) {
    let authority = connection.authority().to_string();
    match connection.get(&request.path).await {
        Ok(response) => {
            let _ = request.reply.send(Ok(response));
            let _ = events.send(Event::Delivered {
                authority,
                connection,
            });
        }
        Err(error) => {
            let _ = events.send(Event::Failed {
                authority,
                request,
                error,
            });
        }
    }
}

/// One TLS client context shared by every HTTPS connection: TLS 1.2+, peer
/// verification against the platform trust store. A partially or wholly
/// unreadable store is logged and tolerated; verification then fails per
/// connection instead.
fn tls_config() -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();
    for err in &loaded.errors {
        warn!(error = %err, "failed to load part of the platform trust store");
    }
    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    if added == 0 {
        error!("no platform trust roots available; TLS peer verification will fail");
    } else {
        trace!(added, ignored, "loaded platform trust roots");
    }
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}
