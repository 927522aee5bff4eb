//! HTTP/1.1 transport over metered TCP connections.
//!
//! A [`Connector`] opens TCP connections, wraps each one in a
//! [`MeteredStream`] and performs the HTTP/1.1 handshake. A [`Session`]
//! holds a worker's idle connections, one per authority, and decides
//! whether one can be reused for the next request.

pub mod metered;

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::config::Timeouts;
use crate::template::Target;

pub use metered::{MeteredStream, ThroughputCounters, ThroughputSnapshot};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Per-request transport failures. These never end a run; workers count
/// them as network failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("connect to {addr} timed out after {after:?}")]
    ConnectTimeout { addr: String, after: Duration },

    #[error("HTTP handshake failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("request failed: {0}")]
    Http(#[from] hyper::Error),

    #[error("no response within {after:?}")]
    ResponseTimeout { after: Duration },

    #[error("reading body of {status} response failed: {source}")]
    Body {
        status: StatusCode,
        #[source]
        source: hyper::Error,
    },

    #[error("body of {status} response not received within {after:?}")]
    BodyTimeout { status: StatusCode, after: Duration },

    #[error("failed to build request: {0}")]
    Request(#[from] http::Error),
}

impl TransportError {
    /// Status code of the response head, when one arrived before the failure.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Body { status, .. } | Self::BodyTimeout { status, .. } => Some(*status),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

/// A fully received response.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

// ---------------------------------------------------------------------------
// Connector / Connection
// ---------------------------------------------------------------------------

/// Opens metered HTTP/1.1 connections.
#[derive(Debug, Clone)]
pub struct Connector {
    counters: Arc<ThroughputCounters>,
    timeouts: Timeouts,
}

impl Connector {
    pub fn new(counters: Arc<ThroughputCounters>, timeouts: Timeouts) -> Self {
        Self { counters, timeouts }
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Connect to `target` and complete the HTTP/1.1 handshake.
    ///
    /// The whole step is bounded by the write timeout.
    pub async fn connect(&self, target: &Target) -> Result<Connection, TransportError> {
        let addr = format!("{}:{}", target.host(), target.port());
        let after = self.timeouts.write;

        let stream = match tokio::time::timeout(
            after,
            TcpStream::connect((target.host(), target.port())),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(TransportError::Connect { addr, source }),
            Err(_) => return Err(TransportError::ConnectTimeout { addr, after }),
        };
        let _ = stream.set_nodelay(true);

        let io = TokioIo::new(MeteredStream::new(stream, self.counters.clone()));
        let mut builder = http1::Builder::new();
        builder.title_case_headers(true);
        let handshake = builder.handshake(io);
        let (sender, conn) = match tokio::time::timeout(after, handshake).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(TransportError::Handshake(e)),
            Err(_) => return Err(TransportError::ConnectTimeout { addr, after }),
        };

        let conn_addr = addr.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                trace!(addr = %conn_addr, error = %e, "connection closed with error");
            }
        });

        debug!(%addr, "connection established");
        Ok(Connection { sender })
    }
}

/// One open HTTP/1.1 connection.
pub struct Connection {
    sender: SendRequest<Full<Bytes>>,
}

impl Connection {
    /// Wait until the connection can take another request. `false` means
    /// the peer closed it.
    pub async fn ready(&mut self) -> bool {
        !self.sender.is_closed() && self.sender.ready().await.is_ok()
    }

    /// Send `req` and read the complete response.
    ///
    /// The response head and the body are each bounded by `read_timeout`.
    pub async fn send(
        &mut self,
        req: Request<Full<Bytes>>,
        read_timeout: Duration,
    ) -> Result<Exchange, TransportError> {
        let response = match tokio::time::timeout(read_timeout, self.sender.send_request(req)).await {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::ResponseTimeout { after: read_timeout }),
        };

        let status = response.status();
        let content_type = response.headers().get(CONTENT_TYPE).cloned();

        let body = match tokio::time::timeout(read_timeout, response.into_body().collect()).await {
            Ok(Ok(collected)) => collected.to_bytes(),
            Ok(Err(source)) => return Err(TransportError::Body { status, source }),
            Err(_) => {
                return Err(TransportError::BodyTimeout {
                    status,
                    after: read_timeout,
                })
            }
        };

        Ok(Exchange {
            status,
            content_type,
            body,
        })
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A worker's view of the transport: at most one idle connection per
/// authority, reused across requests when keep-alive is on.
pub struct Session {
    connector: Connector,
    keep_alive: bool,
    idle: HashMap<String, Connection>,
}

impl Session {
    pub fn new(connector: Connector, keep_alive: bool) -> Self {
        Self {
            connector,
            keep_alive,
            idle: HashMap::new(),
        }
    }

    /// Send one request to `target`.
    ///
    /// A kept connection that the peer has since closed is replaced before
    /// sending. That is a reconnect, not a retry: the request has not been
    /// written yet. After a failure or with keep-alive off the connection
    /// is dropped.
    pub async fn execute(
        &mut self,
        target: &Target,
        req: Request<Full<Bytes>>,
    ) -> Result<Exchange, TransportError> {
        let authority = target.authority();
        let reused = match self.idle.remove(&authority) {
            Some(mut conn) => {
                if conn.ready().await {
                    Some(conn)
                } else {
                    debug!(%authority, "kept connection closed by peer, reconnecting");
                    None
                }
            }
            None => None,
        };

        let mut conn = match reused {
            Some(conn) => conn,
            None => self.connector.connect(target).await?,
        };

        let result = conn.send(req, self.connector.timeouts().read).await;
        if self.keep_alive && result.is_ok() {
            self.idle.insert(authority, conn);
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::SocketAddr;
    use std::sync::Mutex;

    use axum::extract::{ConnectInfo, State};
    use axum::routing::get;
    use axum::Router;
    use tokio::net::TcpListener;

    use crate::template::RequestTemplate;

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    fn template(url: &str, keep_alive: bool) -> RequestTemplate {
        RequestTemplate::builder()
            .target(url)
            .keep_alive(keep_alive)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_execute_reads_full_body() {
        let url = serve(Router::new().route("/", get(|| async { "x".repeat(1000) }))).await;
        let template = template(&url, true);
        let target = &template.targets()[0];

        let counters = Arc::new(ThroughputCounters::new());
        let mut session = Session::new(Connector::new(counters.clone(), Timeouts::default()), true);

        let exchange = session
            .execute(target, template.request_for(target).unwrap())
            .await
            .unwrap();
        assert_eq!(exchange.status, StatusCode::OK);
        assert_eq!(exchange.body.len(), 1000);

        let snap = counters.snapshot();
        assert!(snap.bytes_read >= 1000, "read {} bytes", snap.bytes_read);
        assert!(snap.bytes_written > 0);
    }

    type Peers = Arc<Mutex<HashSet<SocketAddr>>>;

    /// Serve "ok" and record the client address of every request, so the
    /// number of distinct peers equals the number of TCP connections used.
    async fn serve_tracking_peers() -> (String, Peers) {
        async fn handler(
            State(peers): State<Peers>,
            ConnectInfo(addr): ConnectInfo<SocketAddr>,
        ) -> &'static str {
            peers.lock().unwrap().insert(addr);
            "ok"
        }

        let peers: Peers = Arc::new(Mutex::new(HashSet::new()));
        let app = Router::new()
            .route("/", get(handler))
            .with_state(peers.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        (format!("http://{}/", addr), peers)
    }

    #[tokio::test]
    async fn test_keep_alive_reuses_connection() {
        let (url, peers) = serve_tracking_peers().await;
        let template = template(&url, true);
        let target = &template.targets()[0];

        let counters = Arc::new(ThroughputCounters::new());
        let mut session = Session::new(Connector::new(counters, Timeouts::default()), true);

        for _ in 0..5 {
            let exchange = session
                .execute(target, template.request_for(target).unwrap())
                .await
                .unwrap();
            assert_eq!(exchange.body.as_ref(), b"ok");
        }
        assert_eq!(session.idle.len(), 1);
        assert_eq!(peers.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_keep_alive_per_authority_with_alternating_targets() {
        let (url_a, peers_a) = serve_tracking_peers().await;
        let (url_b, peers_b) = serve_tracking_peers().await;
        let template = RequestTemplate::builder()
            .targets(vec![url_a, url_b])
            .keep_alive(true)
            .build()
            .unwrap();

        let counters = Arc::new(ThroughputCounters::new());
        let mut session = Session::new(Connector::new(counters, Timeouts::default()), true);

        for i in 0..20 {
            let target = &template.targets()[i % 2];
            let exchange = session
                .execute(target, template.request_for(target).unwrap())
                .await
                .unwrap();
            assert_eq!(exchange.status, StatusCode::OK);
        }
        assert_eq!(session.idle.len(), 2);
        assert_eq!(peers_a.lock().unwrap().len(), 1);
        assert_eq!(peers_b.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_header_names_sent_title_case() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed before sending a full head");
                head.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8(head).unwrap()
        });

        let template = RequestTemplate::builder()
            .target(format!("http://{}/", addr))
            .headers(crate::template::HeaderOverrides {
                api_user_name: Some("tester".into()),
                geolocation: Some("abc".into()),
                ..Default::default()
            })
            .build()
            .unwrap();
        let target = &template.targets()[0];
        let mut session = Session::new(
            Connector::new(Arc::new(ThroughputCounters::new()), Timeouts::default()),
            true,
        );
        session
            .execute(target, template.request_for(target).unwrap())
            .await
            .unwrap();

        let head = server.await.unwrap();
        assert!(head.contains("\r\nApiusername: tester\r\n"), "{}", head);
        assert!(head.contains("\r\nGeolocation: abc\r\n"), "{}", head);
        assert!(head.contains("\r\nConnection: keep-alive\r\n"), "{}", head);
        assert!(head.contains("\r\nHost: "), "{}", head);
    }

    #[tokio::test]
    async fn test_close_uses_fresh_connections() {
        let (url, peers) = serve_tracking_peers().await;
        let template = template(&url, false);
        let target = &template.targets()[0];

        let counters = Arc::new(ThroughputCounters::new());
        let mut session = Session::new(Connector::new(counters, Timeouts::default()), false);

        for _ in 0..3 {
            let exchange = session
                .execute(target, template.request_for(target).unwrap())
                .await
                .unwrap();
            assert_eq!(exchange.status, StatusCode::OK);
            assert!(session.idle.is_empty());
        }
        assert_eq!(peers.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // Bind then drop to get a port with nothing listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let template = template(&format!("http://{}/", addr), true);
        let target = &template.targets()[0];

        let counters = Arc::new(ThroughputCounters::new());
        let mut session = Session::new(Connector::new(counters.clone(), Timeouts::default()), true);

        let err = session
            .execute(target, template.request_for(target).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
        assert!(err.status().is_none());
        assert_eq!(counters.snapshot(), ThroughputSnapshot::default());
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let app = Router::new().route(
            "/",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let url = serve(app).await;
        let template = template(&url, true);
        let target = &template.targets()[0];

        let timeouts = Timeouts {
            read: Duration::from_millis(100),
            write: Duration::from_millis(1000),
        };
        let mut session = Session::new(
            Connector::new(Arc::new(ThroughputCounters::new()), timeouts),
            true,
        );

        let err = session
            .execute(target, template.request_for(target).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ResponseTimeout { .. }));
        assert!(session.idle.is_empty());
    }
}
